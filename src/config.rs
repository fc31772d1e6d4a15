//! Client configuration
//!
//! Settings are collected by a [`ClientConfigBuilder`], frozen into a
//! [`ClientConfig`] and consumed by [`Lwm2mClient::start`](crate::client::Lwm2mClient::start).
//! A running client only hands out `&ClientConfig`, so there is no way to
//! change the bootstrap URI, endpoint name or listen address after start.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coap_types::CoapUri;
use crate::error::{Lwm2mError, Result};
use crate::transport::TransportConfig;

pub const MAX_ENDPOINT_NAME_LEN: usize = 128;
pub const MAX_URI_LEN: usize = 255;
pub const MAX_ADDRESS_LEN: usize = 64;

const DEFAULT_MAX_RETRANSMIT: u32 = 4;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 2000;

/// Immutable client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", try_from = "RawClientConfig")]
pub struct ClientConfig {
    bootstrap_uri: String,
    endpoint_name: String,
    listen_address: String,
    port: u16,
    max_retransmit: u32,
    ack_timeout_ms: u64,
}

/// Wire shape of a config file, validated through the builder
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawClientConfig {
    bootstrap_uri: Option<String>,
    endpoint_name: Option<String>,
    listen_address: Option<String>,
    #[serde(default)]
    port: u16,
    max_retransmit: Option<u32>,
    ack_timeout_ms: Option<u64>,
}

impl TryFrom<RawClientConfig> for ClientConfig {
    type Error = Lwm2mError;

    fn try_from(raw: RawClientConfig) -> Result<Self> {
        let mut builder = ClientConfigBuilder::new();
        if let Some(uri) = &raw.bootstrap_uri {
            builder.bootstrap_uri(uri)?;
        }
        if let Some(name) = &raw.endpoint_name {
            builder.endpoint_name(name)?;
        }
        if let Some(address) = &raw.listen_address {
            builder.listen_address(address, raw.port)?;
        }
        if let Some(count) = raw.max_retransmit {
            builder.max_retransmit(count);
        }
        if let Some(ms) = raw.ack_timeout_ms {
            builder.ack_timeout(Duration::from_millis(ms));
        }
        builder.build()
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Parse a JSON configuration. Syntax errors are protocol errors; a
    /// value the builder rejects keeps the builder's error kind.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: RawClientConfig = serde_json::from_str(content)?;
        Self::try_from(raw)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn bootstrap_uri(&self) -> &str {
        &self.bootstrap_uri
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    pub fn listen_address(&self) -> &str {
        &self.listen_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_retransmit(&self) -> u32 {
        self.max_retransmit
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Transport settings for the CoAP listen socket
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let ip: IpAddr = self.listen_address.parse().map_err(|_| {
            Lwm2mError::OperationInvalid(format!(
                "'{}' is not an IP address",
                self.listen_address
            ))
        })?;
        Ok(TransportConfig::new(SocketAddr::new(ip, self.port))
            .with_max_retransmit(self.max_retransmit)
            .with_ack_timeout(self.ack_timeout()))
    }
}

/// Collects client settings before start
///
/// Each setter validates its input; a rejected value leaves the previous
/// setting in place.
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    bootstrap_uri: Option<String>,
    endpoint_name: Option<String>,
    listen: Option<(String, u16)>,
    max_retransmit: u32,
    ack_timeout: Duration,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            bootstrap_uri: None,
            endpoint_name: None,
            listen: None,
            max_retransmit: DEFAULT_MAX_RETRANSMIT,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
        }
    }
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bootstrap server URI (`coap://host[:port]/`)
    pub fn bootstrap_uri(&mut self, uri: &str) -> Result<&mut Self> {
        check_len("bootstrap server URI", uri, MAX_URI_LEN)?;
        uri.parse::<CoapUri>()?;
        self.bootstrap_uri = Some(uri.to_string());
        Ok(self)
    }

    pub fn endpoint_name(&mut self, name: &str) -> Result<&mut Self> {
        check_len("endpoint name", name, MAX_ENDPOINT_NAME_LEN)?;
        if name.is_empty() {
            return Err(Lwm2mError::OperationInvalid(
                "endpoint name is empty".to_string(),
            ));
        }
        self.endpoint_name = Some(name.to_string());
        Ok(self)
    }

    /// Set the local CoAP address and port. Port 0 picks an ephemeral port.
    pub fn listen_address(&mut self, address: &str, port: u16) -> Result<&mut Self> {
        check_len("listen address", address, MAX_ADDRESS_LEN)?;
        self.listen = Some((address.to_string(), port));
        Ok(self)
    }

    pub fn max_retransmit(&mut self, count: u32) -> &mut Self {
        self.max_retransmit = count;
        self
    }

    pub fn ack_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.ack_timeout = timeout;
        self
    }

    /// Freeze the configuration. Bootstrap URI, endpoint name and listen
    /// address are required.
    pub fn build(&self) -> Result<ClientConfig> {
        let missing = |what: &str| Lwm2mError::NotConfigured(what.to_string());
        let bootstrap_uri = self
            .bootstrap_uri
            .clone()
            .ok_or_else(|| missing("bootstrap server URI"))?;
        let endpoint_name = self
            .endpoint_name
            .clone()
            .ok_or_else(|| missing("endpoint name"))?;
        let (listen_address, port) = self
            .listen
            .clone()
            .ok_or_else(|| missing("CoAP listen address"))?;

        Ok(ClientConfig {
            bootstrap_uri,
            endpoint_name,
            listen_address,
            port,
            max_retransmit: self.max_retransmit,
            ack_timeout_ms: u64::try_from(self.ack_timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

fn check_len(what: &str, value: &str, capacity: usize) -> Result<()> {
    if value.len() > capacity {
        return Err(Lwm2mError::capacity(what, capacity));
    }
    Ok(())
}
