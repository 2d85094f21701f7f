//! Protocol handlers for intercepted connections.
//!
//! The TCP handler picks an instance, dials it and relays bytes until either
//! side closes. The HTTP handler serves a keep-alive connection one request
//! at a time: each request is parsed so routing and hash keys can see it,
//! routed and balanced on its own, and its response forwarded back framed.
//! A protocol upgrade hands the rest of the connection to the raw relay.

use crate::error::{ProxyError, Result};
use crate::loadbalancer::{LoadBalancer, RequestContext};
use crate::registry::ServiceRegistry;
use crate::router::{RouteStore, RouteTarget};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

const MAX_HEADERS: usize = 64;
/// Upper bound on a buffered request head plus body.
const MAX_REQUEST_BYTES: usize = 1 << 20;

const RESPONSE_503: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Shared collaborators and tunables for both handler variants.
pub struct HandlerContext {
    pub registry: Arc<ServiceRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub routes: Arc<RouteStore>,
    pub dial_timeout: Duration,
    pub dial_attempts: u32,
    pub idle_timeout: Duration,
    pub buffer_size: usize,
}

/// Parsed head of one HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequestHead {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
    /// Bytes consumed by the head, including the blank line.
    pub head_len: usize,
    /// Declared body length; zero when absent.
    pub content_length: usize,
}

impl HttpRequestHead {
    /// Parses a request head from buffered bytes. Returns `Ok(None)` while
    /// the head is still incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let head_len = match request.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
        };
        let method = request
            .method
            .ok_or_else(|| ProxyError::MalformedRequest("missing method".into()))?
            .to_string();
        let path = request
            .path
            .ok_or_else(|| ProxyError::MalformedRequest("missing uri".into()))?
            .to_string();
        let headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).to_string(),
                )
            })
            .collect();
        let head = Self {
            method,
            path,
            headers,
            head_len,
            content_length: 0,
        };
        let content_length = match head.header("content-length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| ProxyError::MalformedRequest("invalid content-length".into()))?,
            None => 0,
        };
        Ok(Some(Self {
            content_length,
            ..head
        }))
    }

    /// Looks up a header value by name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Total byte length of the serialized request, head plus body.
    pub fn total_len(&self) -> usize {
        self.head_len + self.content_length
    }

    /// Whether the request asks to switch protocols. After an upgrade the
    /// stream stops being request-framed.
    pub fn wants_upgrade(&self) -> bool {
        self.header("upgrade").is_some()
            || self
                .header("connection")
                .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
    }

    pub fn connection_close(&self) -> bool {
        self.header("connection")
            .is_some_and(|v| v.to_ascii_lowercase().contains("close"))
    }
}

/// Parsed head of one HTTP response, just enough to frame it.
struct HttpResponseHead {
    head_len: usize,
    content_length: Option<usize>,
    chunked: bool,
    close: bool,
}

impl HttpResponseHead {
    fn parse(buf: &[u8]) -> Result<Option<Self>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let head_len = match response.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProxyError::MalformedRequest(format!("response: {e}"))),
        };
        let mut content_length = None;
        let mut chunked = false;
        // HTTP/1.0 closes by default.
        let mut close = response.version == Some(0);
        for h in response.headers.iter() {
            let value = String::from_utf8_lossy(h.value).to_ascii_lowercase();
            if h.name.eq_ignore_ascii_case("content-length") {
                content_length = Some(value.trim().parse::<usize>().map_err(|_| {
                    ProxyError::MalformedRequest("invalid response content-length".into())
                })?);
            } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.contains("chunked");
            } else if h.name.eq_ignore_ascii_case("connection") {
                if value.contains("close") {
                    close = true;
                } else if value.contains("keep-alive") {
                    close = false;
                }
            }
        }
        Ok(Some(Self {
            head_len,
            content_length,
            chunked,
            close,
        }))
    }
}

/// Reads one full request from the stream into `buf`, which may already hold
/// bytes from a previous read. On return `buf` holds at least the whole
/// request; `Ok(None)` means the peer closed before sending anything.
async fn read_http_request(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
) -> Result<Option<HttpRequestHead>> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(head) = HttpRequestHead::parse(buf)? {
            if buf.len() >= head.total_len() {
                return Ok(Some(head));
            }
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(ProxyError::MalformedRequest("request too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::MalformedRequest(
                "connection closed mid-request".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn read_some(stream: &mut TcpStream, chunk: &mut [u8], idle: Duration) -> Result<usize> {
    match timeout(idle, stream.read(chunk)).await {
        Ok(read) => Ok(read?),
        Err(_) => Err(ProxyError::Timeout {
            duration_ms: idle.as_millis() as u64,
        }),
    }
}

/// Forwards one backend response to the client. Returns whether the exchange
/// ends the client connection.
async fn forward_response(
    backend: &mut TcpStream,
    client: &mut TcpStream,
    ctx: &HandlerContext,
) -> Result<bool> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; ctx.buffer_size];
    let head = loop {
        if let Some(head) = HttpResponseHead::parse(&buf)? {
            break head;
        }
        let n = read_some(backend, &mut chunk, ctx.idle_timeout).await?;
        if n == 0 {
            return Err(ProxyError::MalformedRequest(
                "backend closed before sending a response".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    match (head.content_length, head.chunked) {
        (Some(length), false) => {
            let total = head.head_len + length;
            while buf.len() < total {
                let n = read_some(backend, &mut chunk, ctx.idle_timeout).await?;
                if n == 0 {
                    return Err(ProxyError::MalformedRequest(
                        "backend closed mid-response".into(),
                    ));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            client.write_all(&buf[..total]).await?;
            Ok(head.close)
        }
        _ => {
            // Chunked or close-framed: stream until the backend closes and
            // end the client connection with it.
            client.write_all(&buf).await?;
            loop {
                let n = read_some(backend, &mut chunk, ctx.idle_timeout).await?;
                if n == 0 {
                    break;
                }
                client.write_all(&chunk[..n]).await?;
            }
            Ok(true)
        }
    }
}

async fn write_unavailable(stream: &mut TcpStream) {
    // The connection is being torn down anyway; a failed write here only
    // means the peer left first.
    let _ = stream.write_all(RESPONSE_503).await;
    let _ = stream.shutdown().await;
}

/// Dials a backend with per-attempt timeout.
async fn dial(ctx: &HandlerContext, instance_ip: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{instance_ip}:{port}");
    let mut last_err = None;
    for attempt in 1..=ctx.dial_attempts {
        match timeout(ctx.dial_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                warn!(addr = %addr, attempt, error = %e, "backend dial failed");
                last_err = Some(ProxyError::BackendConnect {
                    addr: addr.clone(),
                    source: e,
                });
            }
            Err(_) => {
                warn!(addr = %addr, attempt, "backend dial timed out");
                last_err = Some(ProxyError::DialTimeout {
                    addr: addr.clone(),
                    duration_ms: ctx.dial_timeout.as_millis() as u64,
                });
            }
        }
    }
    Err(last_err.unwrap_or(ProxyError::DialTimeout {
        addr,
        duration_ms: ctx.dial_timeout.as_millis() as u64,
    }))
}

async fn copy_half(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    idle: Duration,
    buffer_size: usize,
) -> Result<()> {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                return Err(ProxyError::Timeout {
                    duration_ms: idle.as_millis() as u64,
                })
            }
        };
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
    }
}

/// Relays bytes in both directions until either side closes or errors. Both
/// sockets are dropped, and therefore closed, on return.
async fn relay(client: TcpStream, backend: TcpStream, ctx: &HandlerContext) -> Result<()> {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();
    tokio::select! {
        res = copy_half(client_read, backend_write, ctx.idle_timeout, ctx.buffer_size) => res,
        res = copy_half(backend_read, client_write, ctx.idle_timeout, ctx.buffer_size) => res,
    }
}

/// Raw byte relay toward one service's instances.
pub struct TcpHandler {
    ctx: Arc<HandlerContext>,
    namespace: String,
    name: String,
    target_port: u16,
}

impl TcpHandler {
    pub fn new(
        ctx: Arc<HandlerContext>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            name: name.into(),
            target_port,
        }
    }

    /// Picks an instance, dials it, forwards any pre-read bytes and relays.
    pub async fn process(&self, client: TcpStream, preread: Vec<u8>) -> Result<()> {
        let context = RequestContext::Tcp { preread: &preread };
        let instance_ip =
            self.ctx
                .balancer
                .pick(&self.namespace, &self.name, "tcp", &context)?;
        let mut backend = dial(&self.ctx, &instance_ip, self.target_port).await?;
        if !preread.is_empty() {
            backend.write_all(&preread).await?;
        }
        debug!(
            service = %format!("{}.{}", self.namespace, self.name),
            instance = %instance_ip,
            port = self.target_port,
            "relaying connection"
        );
        relay(client, backend, &self.ctx).await
    }
}

/// Protocol-aware front end that hands the byte relay to the TCP path.
pub struct HttpHandler {
    ctx: Arc<HandlerContext>,
    namespace: String,
    name: String,
    target_port: u16,
}

impl HttpHandler {
    pub fn new(
        ctx: Arc<HandlerContext>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            ctx,
            namespace: namespace.into(),
            name: name.into(),
            target_port,
        }
    }

    /// Serves requests one at a time: each is read, routed and balanced on
    /// its own, then its response is forwarded back framed. A protocol
    /// upgrade degrades the rest of the connection to the raw relay. A
    /// routing or selection failure synthesizes a 503 and closes.
    pub async fn process(&self, mut client: TcpStream) -> Result<()> {
        let mut buf = Vec::new();
        loop {
            let head = match read_http_request(&mut client, &mut buf).await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e) => {
                    write_unavailable(&mut client).await;
                    return Err(e);
                }
            };
            // Leave any pipelined bytes behind the request for the next turn.
            let request: Vec<u8> = buf.drain(..head.total_len()).collect();

            let (namespace, name, target_port) = match self.destination(&head) {
                Ok(destination) => destination,
                Err(e) => {
                    write_unavailable(&mut client).await;
                    return Err(e);
                }
            };

            let instance_ip = match self.ctx.balancer.pick(
                &namespace,
                &name,
                "http",
                &RequestContext::Http(&head),
            ) {
                Ok(instance_ip) => instance_ip,
                Err(e) => {
                    write_unavailable(&mut client).await;
                    return Err(e);
                }
            };

            let mut backend = match dial(&self.ctx, &instance_ip, target_port).await {
                Ok(backend) => backend,
                Err(e) => {
                    write_unavailable(&mut client).await;
                    return Err(e);
                }
            };

            backend.write_all(&request).await?;
            debug!(
                service = %format!("{namespace}.{name}"),
                instance = %instance_ip,
                port = target_port,
                uri = %head.path,
                "forwarding http request"
            );

            if head.wants_upgrade() {
                if !buf.is_empty() {
                    backend.write_all(&buf).await?;
                }
                return relay(client, backend, &self.ctx).await;
            }

            let close = forward_response(&mut backend, &mut client, &self.ctx).await?;
            if close || head.connection_close() {
                let _ = client.shutdown().await;
                return Ok(());
            }
        }
    }

    /// Resolves where the request should go: through the namespace's route
    /// table when one is bound, otherwise the intercepted service itself.
    fn destination(&self, head: &HttpRequestHead) -> Result<(String, String, u16)> {
        let Some(table) = self.ctx.routes.get(&self.namespace) else {
            return Ok((
                self.namespace.clone(),
                self.name.clone(),
                self.target_port,
            ));
        };
        let target = table.route(&head.path).ok_or_else(|| ProxyError::RouteNotFound {
            uri: head.path.clone(),
        })?;
        self.resolve_target(&target)
    }

    fn resolve_target(&self, target: &RouteTarget) -> Result<(String, String, u16)> {
        let not_found = || ProxyError::RouteNotFound {
            uri: target.service.clone(),
        };
        let (namespace, name) = target.service.split_once('.').ok_or_else(not_found)?;
        let address = self
            .ctx
            .registry
            .lookup_address(&target.service)
            .ok_or_else(not_found)?;
        let descriptor = self
            .ctx
            .registry
            .lookup_by_address(&address)
            .ok_or_else(not_found)?;
        let row = match target.port {
            Some(port) => descriptor.ports.iter().find(|r| r.port == port),
            None => descriptor
                .ports
                .iter()
                .find(|r| r.protocol == "http")
                .or_else(|| descriptor.ports.first()),
        }
        .ok_or_else(not_found)?;
        Ok((namespace.to_string(), name.to_string(), row.target_port))
    }
}

/// Dispatch target built by the interceptor from the resolved protocol.
pub enum ProtocolHandler {
    Tcp(TcpHandler),
    Http(HttpHandler),
}

impl ProtocolHandler {
    pub fn for_protocol(
        protocol: &str,
        ctx: Arc<HandlerContext>,
        namespace: &str,
        name: &str,
        target_port: u16,
    ) -> Result<Self> {
        match protocol {
            "tcp" => Ok(Self::Tcp(TcpHandler::new(ctx, namespace, name, target_port))),
            "http" => Ok(Self::Http(HttpHandler::new(ctx, namespace, name, target_port))),
            other => Err(ProxyError::UnsupportedProtocol(other.to_string())),
        }
    }

    pub async fn process(&self, client: TcpStream) -> Result<()> {
        match self {
            Self::Tcp(handler) => handler.process(client, Vec::new()).await,
            Self::Http(handler) => handler.process(client).await,
        }
    }

    pub fn protocol_name(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Http(_) => "http",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_request_head() {
        let raw = b"GET /v1/users HTTP/1.1\r\nHost: web\r\nX-User: alice\r\n\r\n";
        let head = HttpRequestHead::parse(raw).unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/v1/users");
        assert_eq!(head.host(), Some("web"));
        assert_eq!(head.header("x-user"), Some("alice"));
        assert_eq!(head.content_length, 0);
        assert_eq!(head.total_len(), raw.len());
    }

    #[test]
    fn test_parse_partial_head_is_not_an_error() {
        let raw = b"GET /v1/users HTTP/1.1\r\nHost: we";
        assert!(HttpRequestHead::parse(raw).unwrap().is_none());
    }

    #[test]
    fn test_parse_body_length() {
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let head = HttpRequestHead::parse(raw).unwrap().unwrap();
        assert_eq!(head.content_length, 5);
        assert_eq!(head.total_len(), raw.len());
    }

    #[test]
    fn test_parse_garbage_is_malformed() {
        let err = HttpRequestHead::parse(b"\x00\x01\x02garbage\r\n\r\n").unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[test]
    fn test_parse_invalid_content_length_is_malformed() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: many\r\n\r\n";
        let err = HttpRequestHead::parse(raw).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest(_)));
    }

    #[test]
    fn test_request_upgrade_and_close_detection() {
        let upgrade =
            b"GET /ws HTTP/1.1\r\nHost: web\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let head = HttpRequestHead::parse(upgrade).unwrap().unwrap();
        assert!(head.wants_upgrade());
        assert!(!head.connection_close());

        let close = b"GET / HTTP/1.1\r\nHost: web\r\nConnection: close\r\n\r\n";
        let head = HttpRequestHead::parse(close).unwrap().unwrap();
        assert!(!head.wants_upgrade());
        assert!(head.connection_close());
    }

    #[test]
    fn test_response_head_framing() {
        let framed = b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nFROM-A";
        let head = HttpResponseHead::parse(framed).unwrap().unwrap();
        assert_eq!(head.content_length, Some(6));
        assert!(!head.chunked);
        assert!(!head.close);
        assert_eq!(head.head_len + 6, framed.len());

        let closing = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
        let head = HttpResponseHead::parse(closing).unwrap().unwrap();
        assert!(head.close);

        let chunked = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let head = HttpResponseHead::parse(chunked).unwrap().unwrap();
        assert!(head.chunked);
        assert_eq!(head.content_length, None);

        let legacy = b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        let head = HttpResponseHead::parse(legacy).unwrap().unwrap();
        assert!(head.close);

        let partial = b"HTTP/1.1 200 OK\r\nContent-Le";
        assert!(HttpResponseHead::parse(partial).unwrap().is_none());
    }
}
