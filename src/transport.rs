//! CoAP transport over UDP
//!
//! Server side: incoming requests are dispatched to the [`Endpoint`]
//! registered for the longest matching path prefix. Client side: requests
//! are queued with a callback that fires once a response arrives or the
//! retransmission budget is spent. Everything is driven by
//! [`CoapTransport::process`]; the transport never spawns threads.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};
use tracing::{debug, trace, warn};

use crate::coap_types::{
    CoapUri, ContentFormat, Method, QueryParams, Request, Response, ResponseCode, join_path,
    split_path,
};
use crate::error::{Lwm2mError, Result};

const MAX_DATAGRAM: usize = 1500;
const RECENT_RESPONSES: usize = 32;

/// A request handler bound to a path
pub trait Endpoint {
    fn handle(&mut self, request: &Request) -> Response;
}

impl<F> Endpoint for F
where
    F: FnMut(&Request) -> Response,
{
    fn handle(&mut self, request: &Request) -> Response {
        self(request)
    }
}

pub type SharedEndpoint = Rc<RefCell<dyn Endpoint>>;

/// Path-keyed endpoint registrations
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: BTreeMap<String, SharedEndpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` at `path`. One registration per path.
    pub fn register(&mut self, path: &str, endpoint: SharedEndpoint) -> Result<()> {
        let path = join_path(&split_path(path));
        if self.endpoints.contains_key(&path) {
            return Err(Lwm2mError::AlreadyExists(format!("endpoint {}", path)));
        }
        debug!(%path, "endpoint registered");
        self.endpoints.insert(path, endpoint);
        Ok(())
    }

    pub fn unregister(&mut self, path: &str) -> Result<()> {
        let path = join_path(&split_path(path));
        match self.endpoints.remove(&path) {
            Some(_) => {
                debug!(%path, "endpoint unregistered");
                Ok(())
            }
            None => Err(Lwm2mError::NotFound(format!("endpoint {}", path))),
        }
    }

    /// The endpoint with the longest registered path that is a prefix of
    /// `path` on segment boundaries
    pub fn lookup(&self, path: &str) -> Option<SharedEndpoint> {
        let segments = split_path(path);
        (0..=segments.len())
            .rev()
            .find_map(|len| self.endpoints.get(&join_path(&segments[..len])))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.endpoints.keys()).finish()
    }
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen: SocketAddr,
    /// Retransmissions of an unanswered confirmable request (0 = none)
    pub max_retransmit: u32,
    /// Initial retransmission timeout, doubled after every retry
    pub ack_timeout: Duration,
    /// The first timeout is drawn between `ack_timeout` and
    /// `ack_timeout * ack_random_factor`
    pub ack_random_factor: f64,
    /// How long to wait for a separate response after an empty ACK
    pub separate_response_timeout: Duration,
}

impl TransportConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            max_retransmit: 4,
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            separate_response_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_retransmit(mut self, max_retransmit: u32) -> Self {
        self.max_retransmit = max_retransmit;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_ack_random_factor(mut self, factor: f64) -> Self {
        self.ack_random_factor = factor;
        self
    }

    pub fn with_separate_response_timeout(mut self, timeout: Duration) -> Self {
        self.separate_response_timeout = timeout;
        self
    }
}

/// A response delivered to a client request callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    pub peer: SocketAddr,
    /// Path of the request this answers
    pub path: String,
    pub code: ResponseCode,
    pub content_format: Option<u16>,
    pub location: Option<String>,
    pub payload: Vec<u8>,
}

pub type ResponseCallback = Box<dyn FnMut(&ClientResponse)>;

struct PendingRequest {
    peer: SocketAddr,
    path: String,
    token: Vec<u8>,
    message_id: u16,
    bytes: Vec<u8>,
    retransmits: u32,
    timeout: Duration,
    deadline: Instant,
    acknowledged: bool,
    callback: ResponseCallback,
}

impl PendingRequest {
    fn fail(mut self, code: ResponseCode) {
        let response = ClientResponse {
            peer: self.peer,
            path: self.path.clone(),
            code,
            content_format: None,
            location: None,
            payload: Vec::new(),
        };
        (self.callback)(&response);
    }
}

struct CachedResponse {
    peer: SocketAddr,
    message_id: u16,
    bytes: Vec<u8>,
}

/// CoAP client and server on one UDP socket
pub struct CoapTransport {
    socket: UdpSocket,
    config: TransportConfig,
    endpoints: EndpointRegistry,
    pending: Vec<PendingRequest>,
    recent: VecDeque<CachedResponse>,
    next_message_id: u16,
    next_token: u32,
    rng: u32,
}

impl CoapTransport {
    /// Bind the listen address
    pub fn bind(config: TransportConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen)?;
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        debug!(addr = %socket.local_addr()?, "transport bound");
        Ok(Self {
            socket,
            config,
            endpoints: EndpointRegistry::new(),
            pending: Vec::new(),
            recent: VecDeque::with_capacity(RECENT_RESPONSES),
            next_message_id: seed as u16,
            next_token: seed,
            rng: seed | 1,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn register_endpoint(&mut self, path: &str, endpoint: SharedEndpoint) -> Result<()> {
        self.endpoints.register(path, endpoint)
    }

    pub fn unregister_endpoint(&mut self, path: &str) -> Result<()> {
        self.endpoints.unregister(path)
    }

    /// Number of client requests still waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Send a confirmable request to `peer`. Returns immediately; `callback`
    /// runs from a later [`process`](Self::process) call.
    pub fn send_request(
        &mut self,
        peer: SocketAddr,
        request: &Request,
        callback: impl FnMut(&ClientResponse) + 'static,
    ) -> Result<()> {
        let message_id = self.message_id();
        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token.to_be_bytes().to_vec();

        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(request_type(request.method));
        packet.header.message_id = message_id;
        packet.set_token(token.clone());
        for segment in split_path(&request.path) {
            packet.add_option(CoapOption::UriPath, segment.into_bytes());
        }
        for segment in request.query.segments() {
            packet.add_option(CoapOption::UriQuery, segment.into_bytes());
        }
        if let Some(format) = request.content_format {
            packet.add_option(CoapOption::ContentFormat, encode_uint(format));
        }
        if let Some(format) = request.accept {
            packet.add_option(CoapOption::Accept, encode_uint(format));
        }
        packet.payload = request.payload.clone();

        let bytes = encode(&packet)?;
        self.socket.send_to(&bytes, peer)?;
        trace!(%peer, method = %request.method, path = %request.path, message_id, "request sent");

        let timeout = self.initial_timeout();

        self.pending.push(PendingRequest {
            peer,
            path: join_path(&split_path(&request.path)),
            token,
            message_id,
            bytes,
            retransmits: 0,
            timeout,
            deadline: Instant::now() + timeout,
            acknowledged: false,
            callback: Box::new(callback),
        });
        Ok(())
    }

    /// GET `uri`
    pub fn get_request(
        &mut self,
        uri: &str,
        callback: impl FnMut(&ClientResponse) + 'static,
    ) -> Result<()> {
        self.request_uri(Method::Get, uri, None, callback)
    }

    /// POST `payload` to `uri`
    pub fn post_request(
        &mut self,
        uri: &str,
        payload: Vec<u8>,
        format: ContentFormat,
        callback: impl FnMut(&ClientResponse) + 'static,
    ) -> Result<()> {
        self.request_uri(Method::Post, uri, Some((payload, format)), callback)
    }

    /// PUT `payload` to `uri`
    pub fn put_request(
        &mut self,
        uri: &str,
        payload: Vec<u8>,
        format: ContentFormat,
        callback: impl FnMut(&ClientResponse) + 'static,
    ) -> Result<()> {
        self.request_uri(Method::Put, uri, Some((payload, format)), callback)
    }

    /// DELETE `uri`
    pub fn delete_request(
        &mut self,
        uri: &str,
        callback: impl FnMut(&ClientResponse) + 'static,
    ) -> Result<()> {
        self.request_uri(Method::Delete, uri, None, callback)
    }

    fn request_uri(
        &mut self,
        method: Method,
        uri: &str,
        payload: Option<(Vec<u8>, ContentFormat)>,
        callback: impl FnMut(&ClientResponse) + 'static,
    ) -> Result<()> {
        let uri: CoapUri = uri.parse()?;
        let peer = (uri.host.as_str(), uri.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Lwm2mError::Transport(format!("cannot resolve {}", uri.host)))?;

        let mut request = Request::new(method, uri.path_string())
            .with_query(QueryParams::from_segments(uri.query.iter().map(String::as_str)));
        if let Some((payload, format)) = payload {
            request = request.with_payload(payload, format);
        }
        self.send_request(peer, &request, callback)
    }

    /// Wait up to `timeout` for one datagram and handle it, servicing
    /// retransmission timers on the way. A zero timeout still picks up a
    /// datagram that is already queued. Returns the number of datagrams
    /// handled (0 or 1).
    pub fn process(&mut self, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            self.service_timers();
            let now = Instant::now();
            let expired = now >= deadline;

            let received = if expired {
                self.socket.set_nonblocking(true)?;
                let received = self.socket.recv_from(&mut buf);
                self.socket.set_nonblocking(false)?;
                received
            } else {
                let wake = self
                    .pending
                    .iter()
                    .map(|p| p.deadline)
                    .min()
                    .map_or(deadline, |t| t.min(deadline));
                let wait = wake
                    .saturating_duration_since(now)
                    .max(Duration::from_millis(1));
                self.socket.set_read_timeout(Some(wait))?;
                self.socket.recv_from(&mut buf)
            };

            match received {
                Ok((len, peer)) => {
                    trace!(%peer, len, "datagram received");
                    self.handle_datagram(&buf[..len], peer)?;
                    return Ok(1);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                            | std::io::ErrorKind::ConnectionRefused
                            | std::io::ErrorKind::ConnectionReset
                    ) =>
                {
                    if expired {
                        return Ok(0);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Retransmit or expire pending requests whose deadline has passed.
    /// A retransmission that cannot be sent completes the request with
    /// 5.03.
    fn service_timers(&mut self) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.pending.len() {
            let pending = &mut self.pending[index];
            if pending.deadline > now {
                index += 1;
                continue;
            }
            if !pending.acknowledged && pending.retransmits < self.config.max_retransmit {
                pending.retransmits += 1;
                pending.timeout *= 2;
                pending.deadline = now + pending.timeout;
                trace!(
                    peer = %pending.peer,
                    message_id = pending.message_id,
                    attempt = pending.retransmits,
                    "retransmitting"
                );
                let sent = self.socket.send_to(&pending.bytes, pending.peer);
                if let Err(e) = sent {
                    let pending = self.pending.remove(index);
                    warn!(
                        peer = %pending.peer,
                        path = %pending.path,
                        error = %e,
                        "retransmission failed"
                    );
                    pending.fail(ResponseCode::ServiceUnavailable);
                    continue;
                }
                index += 1;
                continue;
            }

            let pending = self.pending.remove(index);
            warn!(
                peer = %pending.peer,
                path = %pending.path,
                retransmits = pending.retransmits,
                "request timed out"
            );
            pending.fail(ResponseCode::GatewayTimeout);
        }
    }

    fn initial_timeout(&mut self) -> Duration {
        // xorshift32
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 17;
        self.rng ^= self.rng << 5;
        let spread = (self.config.ack_random_factor - 1.0).max(0.0);
        let fraction = f64::from(self.rng) / f64::from(u32::MAX);
        self.config.ack_timeout.mul_f64(1.0 + spread * fraction)
    }

    fn handle_datagram(&mut self, bytes: &[u8], peer: SocketAddr) -> Result<()> {
        let packet = match Packet::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed datagram");
                return Ok(());
            }
        };

        match packet.header.code {
            MessageClass::Empty => self.handle_empty(&packet, peer),
            MessageClass::Request(_) => self.handle_request(&packet, peer),
            MessageClass::Response(_) => self.handle_response(&packet, peer),
            MessageClass::Reserved(code) => {
                warn!(%peer, code, "dropping message with reserved code");
                Ok(())
            }
        }
    }

    fn handle_empty(&mut self, packet: &Packet, peer: SocketAddr) -> Result<()> {
        let message_id = packet.header.message_id;
        match packet.header.get_type() {
            MessageType::Acknowledgement => {
                let wait = self.config.separate_response_timeout;
                if let Some(pending) = self.find_pending_by_id(peer, message_id) {
                    trace!(%peer, message_id, "empty ACK, awaiting separate response");
                    pending.acknowledged = true;
                    pending.deadline = Instant::now() + wait;
                }
            }
            MessageType::Reset => {
                if let Some(index) = self
                    .pending
                    .iter()
                    .position(|p| p.peer == peer && p.message_id == message_id)
                {
                    let pending = self.pending.remove(index);
                    debug!(%peer, path = %pending.path, "request reset by peer");
                    pending.fail(ResponseCode::ServiceUnavailable);
                }
            }
            MessageType::Confirmable => {
                // CoAP ping
                self.send_empty(MessageType::Reset, message_id, peer)?;
            }
            MessageType::NonConfirmable => {}
        }
        Ok(())
    }

    fn handle_request(&mut self, packet: &Packet, peer: SocketAddr) -> Result<()> {
        let message_id = packet.header.message_id;
        let confirmable = packet.header.get_type() == MessageType::Confirmable;

        if confirmable
            && let Some(cached) = self
                .recent
                .iter()
                .find(|c| c.peer == peer && c.message_id == message_id)
        {
            trace!(%peer, message_id, "duplicate request, replaying response");
            self.socket.send_to(&cached.bytes, peer)?;
            return Ok(());
        }

        let response = match parse_request(packet, peer) {
            Some(request) => match self.endpoints.lookup(&request.path) {
                Some(endpoint) => {
                    let response = endpoint.borrow_mut().handle(&request);
                    debug!(%peer, method = %request.method, path = %request.path, code = %response.code, "request handled");
                    response
                }
                None => Response::not_found(&request.path),
            },
            None => Response::error(ResponseCode::MethodNotAllowed, "unsupported method"),
        };

        let mut reply = Packet::new();
        if confirmable {
            reply.header.set_type(MessageType::Acknowledgement);
            reply.header.message_id = message_id;
        } else {
            reply.header.set_type(MessageType::NonConfirmable);
            reply.header.message_id = self.message_id();
        }
        reply.header.code = MessageClass::from(response.code.as_u8());
        reply.set_token(packet.get_token().to_vec());
        if let Some(format) = response.content_format {
            reply.add_option(CoapOption::ContentFormat, encode_uint(format.as_u16()));
        }
        if let Some(location) = &response.location {
            for segment in split_path(location) {
                reply.add_option(CoapOption::LocationPath, segment.into_bytes());
            }
        }
        reply.payload = response.payload;

        let bytes = encode(&reply)?;
        self.socket.send_to(&bytes, peer)?;

        if confirmable {
            if self.recent.len() == RECENT_RESPONSES {
                self.recent.pop_front();
            }
            self.recent.push_back(CachedResponse {
                peer,
                message_id,
                bytes,
            });
        }
        Ok(())
    }

    fn handle_response(&mut self, packet: &Packet, peer: SocketAddr) -> Result<()> {
        let message_id = packet.header.message_id;
        let message_type = packet.header.get_type();
        if message_type == MessageType::Confirmable {
            self.send_empty(MessageType::Acknowledgement, message_id, peer)?;
        }

        let token = packet.get_token();
        let Some(index) = self
            .pending
            .iter()
            .position(|p| p.peer == peer && p.token == token)
        else {
            trace!(%peer, message_id, "response matches no request");
            if message_type == MessageType::NonConfirmable {
                self.send_empty(MessageType::Reset, message_id, peer)?;
            }
            return Ok(());
        };

        let mut pending = self.pending.remove(index);
        let code_byte = u8::from(packet.header.code);
        let code = ResponseCode::from_u8(code_byte).unwrap_or_else(|| {
            warn!(%peer, code = code_byte, "unknown response code");
            ResponseCode::InternalServerError
        });
        let location = packet
            .get_option(CoapOption::LocationPath)
            .map(|segments| {
                let segments: Vec<String> = segments
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect();
                join_path(&segments)
            });
        let response = ClientResponse {
            peer,
            path: pending.path.clone(),
            code,
            content_format: option_uint(packet, CoapOption::ContentFormat),
            location,
            payload: packet.payload.clone(),
        };
        trace!(%peer, path = %pending.path, %code, "response delivered");
        (pending.callback)(&response);
        Ok(())
    }

    fn find_pending_by_id(&mut self, peer: SocketAddr, message_id: u16) -> Option<&mut PendingRequest> {
        self.pending
            .iter_mut()
            .find(|p| p.peer == peer && p.message_id == message_id)
    }

    fn send_empty(&mut self, message_type: MessageType, message_id: u16, peer: SocketAddr) -> Result<()> {
        let mut packet = Packet::new();
        packet.header.set_type(message_type);
        packet.header.code = MessageClass::Empty;
        packet.header.message_id = message_id;
        self.socket.send_to(&encode(&packet)?, peer)?;
        Ok(())
    }

    fn message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.next_message_id
    }
}

impl std::fmt::Debug for CoapTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoapTransport")
            .field("socket", &self.socket)
            .field("config", &self.config)
            .field("endpoints", &self.endpoints)
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn request_type(method: Method) -> RequestType {
    match method {
        Method::Get => RequestType::Get,
        Method::Post => RequestType::Post,
        Method::Put => RequestType::Put,
        Method::Delete => RequestType::Delete,
    }
}

/// Build a [`Request`] from a request PDU; `None` for unsupported methods
fn parse_request(packet: &Packet, peer: SocketAddr) -> Option<Request> {
    let method = match packet.header.code {
        MessageClass::Request(RequestType::Get) => Method::Get,
        MessageClass::Request(RequestType::Post) => Method::Post,
        MessageClass::Request(RequestType::Put) => Method::Put,
        MessageClass::Request(RequestType::Delete) => Method::Delete,
        _ => return None,
    };

    let path: Vec<String> = option_strings(packet, CoapOption::UriPath);
    let query = option_strings(packet, CoapOption::UriQuery);

    let mut request = Request::new(method, join_path(&path))
        .with_query(QueryParams::from_segments(query.iter().map(String::as_str)));
    request.payload = packet.payload.clone();
    request.content_format = option_uint(packet, CoapOption::ContentFormat);
    request.accept = option_uint(packet, CoapOption::Accept);
    request.peer = Some(peer);
    Some(request)
}

fn option_strings(packet: &Packet, option: CoapOption) -> Vec<String> {
    packet
        .get_option(option)
        .map(|values| {
            values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn option_uint(packet: &Packet, option: CoapOption) -> Option<u16> {
    let value = packet.get_option(option)?.front()?;
    decode_uint(value)
}

/// CoAP uint option: big-endian with leading zero bytes dropped
fn encode_uint(value: u16) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn decode_uint(bytes: &[u8]) -> Option<u16> {
    if bytes.len() > 2 {
        return None;
    }
    Some(bytes.iter().fold(0u16, |acc, b| (acc << 8) | u16::from(*b)))
}

fn encode(packet: &Packet) -> Result<Vec<u8>> {
    packet
        .to_bytes()
        .map_err(|e| Lwm2mError::Transport(format!("cannot encode CoAP message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> TransportConfig {
        TransportConfig::new("127.0.0.1:0".parse().unwrap())
            .with_ack_timeout(Duration::from_millis(50))
    }

    fn echo_path() -> SharedEndpoint {
        Rc::new(RefCell::new(|request: &Request| {
            Response::content(request.path.as_bytes().to_vec(), ContentFormat::TextPlain)
        }))
    }

    #[test]
    fn test_uint_options() {
        assert_eq!(encode_uint(0), Vec::<u8>::new());
        assert_eq!(encode_uint(42), vec![42]);
        assert_eq!(encode_uint(11543), vec![0x2d, 0x17]);
        assert_eq!(decode_uint(&[0x06, 0x07]), Some(1543));
        assert_eq!(decode_uint(&[]), Some(0));
        assert_eq!(decode_uint(&[1, 2, 3]), None);
    }

    #[test]
    fn test_registry_duplicate_and_missing() {
        let mut registry = EndpointRegistry::new();
        registry.register("/3", echo_path()).unwrap();
        assert!(matches!(
            registry.register("3", echo_path()),
            Err(Lwm2mError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.unregister("/4"),
            Err(Lwm2mError::NotFound(_))
        ));
        registry.unregister("/3/").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_longest_prefix() {
        let mut registry = EndpointRegistry::new();
        let object: SharedEndpoint = Rc::new(RefCell::new(|_: &Request| Response::changed()));
        let resource: SharedEndpoint = Rc::new(RefCell::new(|_: &Request| Response::deleted()));
        registry.register("/3", object).unwrap();
        registry.register("/3/0/1", resource).unwrap();

        let call = |path: &str| {
            let endpoint = registry.lookup(path)?;
            let response = endpoint.borrow_mut().handle(&Request::new(Method::Get, path));
            Some(response.code)
        };
        assert_eq!(call("/3/0"), Some(ResponseCode::Changed));
        assert_eq!(call("/3/0/1/2"), Some(ResponseCode::Deleted));
        assert_eq!(call("/3/0/10"), Some(ResponseCode::Changed));
        assert_eq!(call("/30"), None);
    }

    #[test]
    fn test_request_response_loopback() {
        let mut server = CoapTransport::bind(loopback()).unwrap();
        server.register_endpoint("/3", echo_path()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut client = CoapTransport::bind(loopback()).unwrap();
        let received = Rc::new(RefCell::new(None));
        let sink = received.clone();
        let request = Request::new(Method::Get, "/3/0")
            .with_query(QueryParams::parse("?ep=device"));
        client
            .send_request(server_addr, &request, move |response| {
                *sink.borrow_mut() = Some(response.clone());
            })
            .unwrap();

        assert_eq!(server.process(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(client.process(Duration::from_secs(1)).unwrap(), 1);

        let response = received.borrow_mut().take().unwrap();
        assert_eq!(response.code, ResponseCode::Content);
        assert_eq!(response.path, "/3/0");
        assert_eq!(response.payload, b"/3/0");
        assert_eq!(response.content_format, Some(0));
        assert_eq!(client.pending_requests(), 0);
    }

    #[test]
    fn test_zero_timeout_handles_queued_datagram() {
        let mut server = CoapTransport::bind(loopback()).unwrap();
        server.register_endpoint("/3", echo_path()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut client =
            CoapTransport::bind(loopback().with_ack_timeout(Duration::from_secs(2))).unwrap();

        let received = Rc::new(RefCell::new(None));
        let sink = received.clone();
        client
            .send_request(server_addr, &Request::new(Method::Get, "/3/0"), move |r| {
                *sink.borrow_mut() = Some(r.code);
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(server.process(Duration::ZERO).unwrap(), 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(client.process(Duration::ZERO).unwrap(), 1);
        assert_eq!(*received.borrow(), Some(ResponseCode::Content));

        // nothing queued
        assert_eq!(server.process(Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_initial_timeout_randomized_within_factor() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = silent.local_addr().unwrap();
        let mut client = CoapTransport::bind(
            loopback()
                .with_ack_timeout(Duration::from_secs(2))
                .with_ack_random_factor(1.5),
        )
        .unwrap();
        for _ in 0..16 {
            client
                .send_request(peer, &Request::new(Method::Get, "/3"), |_| {})
                .unwrap();
        }

        let timeouts: Vec<Duration> = client.pending.iter().map(|p| p.timeout).collect();
        assert!(timeouts.iter().all(|t| {
            *t >= Duration::from_secs(2) && *t <= Duration::from_secs(3)
        }));
        assert!(timeouts.iter().any(|t| *t != timeouts[0]));

        let mut fixed = CoapTransport::bind(loopback().with_ack_random_factor(1.0)).unwrap();
        fixed
            .send_request(peer, &Request::new(Method::Get, "/3"), |_| {})
            .unwrap();
        assert_eq!(fixed.pending[0].timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_failed_retransmission_completes_request() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = silent.local_addr().unwrap();
        let mut client = CoapTransport::bind(loopback().with_max_retransmit(2)).unwrap();

        let code = Rc::new(RefCell::new(None));
        let sink = code.clone();
        client
            .send_request(peer, &Request::new(Method::Get, "/3/0"), move |r| {
                *sink.borrow_mut() = Some(r.code);
            })
            .unwrap();
        // UDP refuses to send to port 0
        client.pending[0].peer = "127.0.0.1:0".parse().unwrap();

        assert_eq!(client.process(Duration::from_millis(200)).unwrap(), 0);
        assert_eq!(*code.borrow(), Some(ResponseCode::ServiceUnavailable));
        assert_eq!(client.pending_requests(), 0);
    }

    #[test]
    fn test_unregistered_path_not_found() {
        let mut server = CoapTransport::bind(loopback()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut client = CoapTransport::bind(loopback()).unwrap();

        let code = Rc::new(RefCell::new(None));
        let sink = code.clone();
        client
            .send_request(server_addr, &Request::new(Method::Delete, "/9/0"), move |r| {
                *sink.borrow_mut() = Some(r.code);
            })
            .unwrap();
        server.process(Duration::from_secs(1)).unwrap();
        client.process(Duration::from_secs(1)).unwrap();

        assert_eq!(*code.borrow(), Some(ResponseCode::NotFound));
    }

    #[test]
    fn test_timeout_without_retransmit() {
        // nothing listens on the peer socket
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = silent.local_addr().unwrap();

        let mut client = CoapTransport::bind(loopback().with_max_retransmit(0)).unwrap();
        let code = Rc::new(RefCell::new(None));
        let sink = code.clone();
        client
            .send_request(peer, &Request::new(Method::Get, "/3"), move |r| {
                *sink.borrow_mut() = Some(r.code);
            })
            .unwrap();

        client.process(Duration::from_millis(200)).unwrap();
        assert_eq!(*code.borrow(), Some(ResponseCode::GatewayTimeout));
        assert_eq!(client.pending_requests(), 0);
    }

    #[test]
    fn test_retransmission_reaches_peer() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        silent
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let peer = silent.local_addr().unwrap();

        let mut client = CoapTransport::bind(loopback().with_max_retransmit(1)).unwrap();
        client
            .send_request(peer, &Request::new(Method::Get, "/3"), |_| {})
            .unwrap();
        // initial send plus one retry, then expiry after the doubled timeout
        client.process(Duration::from_millis(400)).unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (first, _) = silent.recv_from(&mut buf).unwrap();
        let first = buf[..first].to_vec();
        let (second, _) = silent.recv_from(&mut buf).unwrap();
        assert_eq!(first, &buf[..second]);
        assert_eq!(client.pending_requests(), 0);
    }

    #[test]
    fn test_duplicate_request_replayed() {
        let calls = Rc::new(RefCell::new(0));
        let counter = calls.clone();
        let mut server = CoapTransport::bind(loopback()).unwrap();
        server
            .register_endpoint(
                "/1",
                Rc::new(RefCell::new(move |_: &Request| {
                    *counter.borrow_mut() += 1;
                    Response::changed()
                })),
            )
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(RequestType::Post);
        packet.header.message_id = 0x1234;
        packet.set_token(vec![7]);
        packet.add_option(CoapOption::UriPath, b"1".to_vec());
        let bytes = packet.to_bytes().unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut replies = Vec::new();
        for _ in 0..2 {
            raw.send_to(&bytes, server_addr).unwrap();
            server.process(Duration::from_secs(1)).unwrap();
            let (len, _) = raw.recv_from(&mut buf).unwrap();
            replies.push(buf[..len].to_vec());
        }

        assert_eq!(*calls.borrow(), 1);
        assert_eq!(replies[0], replies[1]);
        let reply = Packet::from_bytes(&replies[0]).unwrap();
        assert_eq!(reply.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(reply.header.message_id, 0x1234);
        assert_eq!(reply.get_token(), &[7]);
    }

    #[test]
    fn test_separate_response() {
        let mut client = CoapTransport::bind(loopback().with_max_retransmit(0)).unwrap();
        let client_addr = client.local_addr().unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let peer = raw.local_addr().unwrap();

        let code = Rc::new(RefCell::new(None));
        let sink = code.clone();
        client
            .send_request(peer, &Request::new(Method::Get, "/3/0/0"), move |r| {
                *sink.borrow_mut() = Some(r.code);
            })
            .unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = raw.recv_from(&mut buf).unwrap();
        let request = Packet::from_bytes(&buf[..len]).unwrap();

        let mut ack = Packet::new();
        ack.header.set_type(MessageType::Acknowledgement);
        ack.header.code = MessageClass::Empty;
        ack.header.message_id = request.header.message_id;
        raw.send_to(&ack.to_bytes().unwrap(), client_addr).unwrap();
        client.process(Duration::from_secs(1)).unwrap();

        // past the ACK timeout the request is still waiting
        std::thread::sleep(Duration::from_millis(80));
        client.process(Duration::from_millis(10)).unwrap();
        assert_eq!(client.pending_requests(), 1);

        let mut separate = Packet::new();
        separate.header.set_type(MessageType::Confirmable);
        separate.header.code = MessageClass::from(ResponseCode::Content.as_u8());
        separate.header.message_id = 0x4321;
        separate.set_token(request.get_token().to_vec());
        separate.payload = b"Open Mobile Alliance".to_vec();
        raw.send_to(&separate.to_bytes().unwrap(), client_addr).unwrap();
        client.process(Duration::from_secs(1)).unwrap();

        assert_eq!(*code.borrow(), Some(ResponseCode::Content));
        let (len, _) = raw.recv_from(&mut buf).unwrap();
        let ack = Packet::from_bytes(&buf[..len]).unwrap();
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.message_id, 0x4321);
    }
}
