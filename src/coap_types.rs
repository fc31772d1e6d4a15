//! LWM2M-specific CoAP types and constants
//!
//! These types are transport-agnostic: the request handler works on them
//! directly and the UDP transport converts them to and from CoAP PDUs.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::{Lwm2mError, Result};

/// Default CoAP port
pub const COAP_DEFAULT_PORT: u16 = 5683;

/// CoAP Content-Format identifiers used by LWM2M
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ContentFormat {
    /// text/plain
    TextPlain = 0,
    /// application/link-format
    LinkFormat = 40,
    /// application/octet-stream
    OctetStream = 42,
    /// application/json
    Json = 50,
    /// application/senml+cbor
    SenmlCbor = 112,
    /// application/vnd.oma.lwm2m+text (pre-registration code)
    Lwm2mText = 1541,
    /// application/vnd.oma.lwm2m+tlv (pre-registration code)
    Lwm2mTlv = 1542,
    /// application/vnd.oma.lwm2m+json (pre-registration code)
    Lwm2mJson = 1543,
    /// application/vnd.oma.lwm2m+tlv
    OmaTlv = 11542,
    /// application/vnd.oma.lwm2m+json
    OmaJson = 11543,
}

impl ContentFormat {
    /// Convert from raw content-format ID
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::TextPlain),
            40 => Some(Self::LinkFormat),
            42 => Some(Self::OctetStream),
            50 => Some(Self::Json),
            112 => Some(Self::SenmlCbor),
            1541 => Some(Self::Lwm2mText),
            1542 => Some(Self::Lwm2mTlv),
            1543 => Some(Self::Lwm2mJson),
            11542 => Some(Self::OmaTlv),
            11543 => Some(Self::OmaJson),
            _ => None,
        }
    }

    /// Get the raw content-format ID
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// CoAP request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Put => f.write_str("PUT"),
            Method::Delete => f.write_str("DELETE"),
        }
    }
}

/// CoAP response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    // Success codes
    /// 2.01 Created
    Created,
    /// 2.02 Deleted
    Deleted,
    /// 2.03 Valid
    Valid,
    /// 2.04 Changed
    Changed,
    /// 2.05 Content
    Content,

    // Client error codes
    /// 4.00 Bad Request
    BadRequest,
    /// 4.01 Unauthorized
    Unauthorized,
    /// 4.02 Bad Option
    BadOption,
    /// 4.03 Forbidden
    Forbidden,
    /// 4.04 Not Found
    NotFound,
    /// 4.05 Method Not Allowed
    MethodNotAllowed,
    /// 4.06 Not Acceptable
    NotAcceptable,
    /// 4.12 Precondition Failed
    PreconditionFailed,
    /// 4.13 Request Entity Too Large
    RequestEntityTooLarge,
    /// 4.15 Unsupported Content-Format
    UnsupportedContentFormat,

    // Server error codes
    /// 5.00 Internal Server Error
    InternalServerError,
    /// 5.01 Not Implemented
    NotImplemented,
    /// 5.02 Bad Gateway
    BadGateway,
    /// 5.03 Service Unavailable
    ServiceUnavailable,
    /// 5.04 Gateway Timeout; also reported locally when retransmission is exhausted
    GatewayTimeout,
    /// 5.05 Proxying Not Supported
    ProxyingNotSupported,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, detail) = self.to_code_pair();
        write!(f, "{}.{:02}", class, detail)
    }
}

const RESPONSE_CODES: [ResponseCode; 21] = [
    ResponseCode::Created,
    ResponseCode::Deleted,
    ResponseCode::Valid,
    ResponseCode::Changed,
    ResponseCode::Content,
    ResponseCode::BadRequest,
    ResponseCode::Unauthorized,
    ResponseCode::BadOption,
    ResponseCode::Forbidden,
    ResponseCode::NotFound,
    ResponseCode::MethodNotAllowed,
    ResponseCode::NotAcceptable,
    ResponseCode::PreconditionFailed,
    ResponseCode::RequestEntityTooLarge,
    ResponseCode::UnsupportedContentFormat,
    ResponseCode::InternalServerError,
    ResponseCode::NotImplemented,
    ResponseCode::BadGateway,
    ResponseCode::ServiceUnavailable,
    ResponseCode::GatewayTimeout,
    ResponseCode::ProxyingNotSupported,
];

impl ResponseCode {
    /// Convert to CoAP response code format (class.detail)
    pub fn to_code_pair(self) -> (u8, u8) {
        match self {
            Self::Created => (2, 1),
            Self::Deleted => (2, 2),
            Self::Valid => (2, 3),
            Self::Changed => (2, 4),
            Self::Content => (2, 5),
            Self::BadRequest => (4, 0),
            Self::Unauthorized => (4, 1),
            Self::BadOption => (4, 2),
            Self::Forbidden => (4, 3),
            Self::NotFound => (4, 4),
            Self::MethodNotAllowed => (4, 5),
            Self::NotAcceptable => (4, 6),
            Self::PreconditionFailed => (4, 12),
            Self::RequestEntityTooLarge => (4, 13),
            Self::UnsupportedContentFormat => (4, 15),
            Self::InternalServerError => (5, 0),
            Self::NotImplemented => (5, 1),
            Self::BadGateway => (5, 2),
            Self::ServiceUnavailable => (5, 3),
            Self::GatewayTimeout => (5, 4),
            Self::ProxyingNotSupported => (5, 5),
        }
    }

    /// Look up a response code by class and detail
    pub fn from_code_pair(class: u8, detail: u8) -> Option<Self> {
        RESPONSE_CODES
            .into_iter()
            .find(|code| code.to_code_pair() == (class, detail))
    }

    /// Single-byte wire form: class in the top three bits, detail below
    pub fn as_u8(self) -> u8 {
        let (class, detail) = self.to_code_pair();
        (class << 5) | detail
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        Self::from_code_pair(code >> 5, code & 0x1f)
    }

    /// Check if this is a success code
    pub fn is_success(self) -> bool {
        self.to_code_pair().0 == 2
    }
}

/// URI query options of a request, in the order they were sent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    params: Vec<(String, Option<String>)>,
}

impl QueryParams {
    /// Parse query parameters from a query string (with or without `?`)
    pub fn parse(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        Self::from_segments(query.split('&'))
    }

    /// Build from individual URI-Query option values
    pub fn from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> Self {
        let params = segments
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|part| match part.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(value.to_string())),
                None => (part.to_string(), None),
            })
            .collect();
        Self { params }
    }

    /// Value of the first parameter named `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.iter().any(|(k, _)| k == key)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Individual option values, e.g. `ep=node1`
    pub fn segments(&self) -> Vec<String> {
        self.params
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{}={}", k, v),
                None => k.clone(),
            })
            .collect()
    }
}

impl fmt::Display for QueryParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_query(&self.segments()))
    }
}

/// Join URI-Path segments into a `/`-prefixed path
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut path = String::new();
    for segment in segments {
        path.push('/');
        path.push_str(segment.as_ref());
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Join URI-Query segments into `?a&b`, or an empty string when there are none
pub fn join_query<S: AsRef<str>>(segments: &[S]) -> String {
    if segments.is_empty() {
        return String::new();
    }
    let joined: Vec<&str> = segments.iter().map(AsRef::as_ref).collect();
    format!("?{}", joined.join("&"))
}

/// Split a path into its non-empty segments
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A parsed `coap://host[:port]/path?query` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUri {
    pub host: String,
    pub port: u16,
    pub path: Vec<String>,
    pub query: Vec<String>,
}

impl CoapUri {
    /// The `/`-prefixed path
    pub fn path_string(&self) -> String {
        join_path(&self.path)
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for CoapUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "coap://{}{}{}",
            self.authority(),
            self.path_string(),
            join_query(&self.query)
        )
    }
}

impl FromStr for CoapUri {
    type Err = Lwm2mError;

    fn from_str(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| Lwm2mError::Protocol(format!("invalid URI '{}': {}", uri, reason));

        let rest = uri
            .strip_prefix("coap://")
            .ok_or_else(|| invalid("scheme must be coap"))?;
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, query),
            None => (rest, ""),
        };
        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            (host, after.strip_prefix(':'))
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| invalid("bad port"))?,
            None => COAP_DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            path: split_path(path),
            query: query
                .split('&')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

/// An LWM2M request (transport-agnostic)
#[derive(Debug, Clone)]
pub struct Request {
    /// The request method
    pub method: Method,
    /// `/`-joined URI path
    pub path: String,
    /// Parsed query parameters
    pub query: QueryParams,
    /// Request payload
    pub payload: Vec<u8>,
    /// Raw Content-Format of the payload
    pub content_format: Option<u16>,
    /// Raw Accept option
    pub accept: Option<u16>,
    /// Sender address, when received from the network
    pub peer: Option<SocketAddr>,
}

impl Request {
    /// Create a new request
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: QueryParams::default(),
            payload: Vec::new(),
            content_format: None,
            accept: None,
            peer: None,
        }
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Vec<u8>, format: ContentFormat) -> Self {
        self.payload = payload;
        self.content_format = Some(format.as_u16());
        self
    }

    /// Set query parameters
    pub fn with_query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    /// Ask for a response in the given format
    pub fn with_accept(mut self, format: ContentFormat) -> Self {
        self.accept = Some(format.as_u16());
        self
    }
}

/// An LWM2M response (transport-agnostic)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response code
    pub code: ResponseCode,
    /// Response payload
    pub payload: Vec<u8>,
    /// Content format of the payload
    pub content_format: Option<ContentFormat>,
    /// Location-Path of a created instance
    pub location: Option<String>,
}

impl Response {
    fn with_code(code: ResponseCode) -> Self {
        Self {
            code,
            payload: Vec::new(),
            content_format: None,
            location: None,
        }
    }

    /// Create a success response with content
    pub fn content(payload: Vec<u8>, format: ContentFormat) -> Self {
        Self {
            payload,
            content_format: Some(format),
            ..Self::with_code(ResponseCode::Content)
        }
    }

    /// Create a created response pointing at the new instance
    pub fn created(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::with_code(ResponseCode::Created)
        }
    }

    pub fn changed() -> Self {
        Self::with_code(ResponseCode::Changed)
    }

    pub fn deleted() -> Self {
        Self::with_code(ResponseCode::Deleted)
    }

    /// Create an error response
    pub fn error(code: ResponseCode, message: &str) -> Self {
        Self {
            payload: message.as_bytes().to_vec(),
            ..Self::with_code(code)
        }
    }

    /// Create a not found error
    pub fn not_found(path: &str) -> Self {
        Self::error(
            ResponseCode::NotFound,
            &format!("Resource not found: {}", path),
        )
    }

    /// Create a method not allowed error
    pub fn method_not_allowed(method: Method) -> Self {
        Self::error(
            ResponseCode::MethodNotAllowed,
            &format!("Method {} not allowed", method),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_format_conversion() {
        assert_eq!(ContentFormat::from_u16(1543), Some(ContentFormat::Lwm2mJson));
        assert_eq!(ContentFormat::OmaTlv.as_u16(), 11542);
        assert_eq!(ContentFormat::from_u16(9999), None);
    }

    #[test]
    fn test_response_code() {
        assert_eq!(ResponseCode::Content.to_code_pair(), (2, 5));
        assert_eq!(ResponseCode::Content.as_u8(), 0x45);
        assert_eq!(ResponseCode::from_u8(0x84), Some(ResponseCode::NotFound));
        assert_eq!(ResponseCode::GatewayTimeout.to_string(), "5.04");
        assert!(ResponseCode::Changed.is_success());
        assert!(!ResponseCode::NotFound.is_success());
    }

    #[test]
    fn test_query_params_parse() {
        let params = QueryParams::parse("?ep=node1&lt=300&b");
        assert_eq!(params.get("ep"), Some("node1"));
        assert_eq!(params.get("lt"), Some("300"));
        assert!(params.contains("b"));
        assert_eq!(params.to_string(), "?ep=node1&lt=300&b");
        assert_eq!(QueryParams::default().to_string(), "");
    }

    #[test]
    fn test_join_path_and_query() {
        assert_eq!(join_path(&["3", "0", "1"]), "/3/0/1");
        assert_eq!(join_path::<&str>(&[]), "/");
        assert_eq!(join_query(&["a=1", "b"]), "?a=1&b");
    }

    #[test]
    fn test_coap_uri_parse() {
        let uri: CoapUri = "coap://127.0.0.1:15685/bs?ep=dev".parse().unwrap();
        assert_eq!(uri.host, "127.0.0.1");
        assert_eq!(uri.port, 15685);
        assert_eq!(uri.path_string(), "/bs");
        assert_eq!(uri.query, vec!["ep=dev"]);

        let uri: CoapUri = "coap://localhost".parse().unwrap();
        assert_eq!(uri.port, COAP_DEFAULT_PORT);
        assert_eq!(uri.path_string(), "/");

        let uri: CoapUri = "coap://[::1]:5684/rd".parse().unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.authority(), "[::1]:5684");
        assert_eq!(uri.to_string(), "coap://[::1]:5684/rd");
    }

    #[test]
    fn test_coap_uri_rejects_bad_input() {
        assert!("http://host".parse::<CoapUri>().is_err());
        assert!("coap://:5683".parse::<CoapUri>().is_err());
        assert!("coap://host:notaport".parse::<CoapUri>().is_err());
    }
}
