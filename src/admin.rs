//! Admin HTTP endpoint: health, metrics, a registry dump and control-plane
//! event ingestion.

use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use crate::registry::ServiceRegistry;
use crate::sync::{ControlPlaneEvent, EventSenders};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, info, instrument, warn};

/// Serves:
/// - `GET /health` - liveness check returning 200 OK
/// - `GET /metrics` - Prometheus metrics in text format
/// - `GET /services` - JSON dump of the registered services
/// - `POST /events` - control-plane event ingestion
#[derive(Clone)]
pub struct AdminService {
    registry: Arc<ServiceRegistry>,
    senders: EventSenders,
}

impl AdminService {
    pub fn new(registry: Arc<ServiceRegistry>, senders: EventSenders) -> Self {
        Self { registry, senders }
    }

    async fn handle_request(
        self,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/health") => {
                debug!("health check requested");
                Ok(Self::text_response(StatusCode::OK, "healthy"))
            }
            (&Method::GET, "/metrics") => {
                debug!("metrics requested");
                match Metrics::encode() {
                    Ok(metrics) => Ok(Self::metrics_response(metrics)),
                    Err(e) => {
                        warn!("failed to encode metrics: {}", e);
                        Ok(Self::text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Failed to encode metrics",
                        ))
                    }
                }
            }
            (&Method::GET, "/services") => {
                debug!("service dump requested");
                Ok(self.services_response())
            }
            (&Method::POST, "/events") => Ok(self.ingest_event(req).await),
            _ => Ok(Self::text_response(StatusCode::NOT_FOUND, "Not Found")),
        }
    }

    /// Parses one event envelope from the request body and queues it for the
    /// drain tasks.
    async fn ingest_event(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("failed to read event body: {}", e);
                return Self::text_response(StatusCode::BAD_REQUEST, "Unreadable body");
            }
        };
        let event: ControlPlaneEvent = match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(e) => {
                warn!("rejected malformed event: {}", e);
                return Self::text_response(StatusCode::BAD_REQUEST, "Malformed event");
            }
        };
        if self.senders.deliver(event).await {
            Self::text_response(StatusCode::ACCEPTED, "Accepted")
        } else {
            warn!("event queue is closed, dropping event");
            Self::text_response(StatusCode::SERVICE_UNAVAILABLE, "Event queue closed")
        }
    }

    fn services_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let descriptors = self.registry.dump();
        match serde_json::to_string(&descriptors) {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(
                    Full::new(Bytes::from(body))
                        .map_err(|never| match never {})
                        .boxed(),
                )
                .unwrap_or_else(|_| Self::empty_response()),
            Err(e) => {
                warn!("failed to serialize registry: {}", e);
                Self::text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to serialize")
            }
        }
    }

    /// Creates a metrics response in Prometheus text format.
    fn metrics_response(metrics: String) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(
                Full::new(Bytes::from(metrics))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap_or_else(|_| Self::empty_response())
    }

    fn text_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(status)
            .body(
                Full::new(Bytes::from(message.to_string()))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap_or_else(|_| Self::empty_response())
    }

    fn empty_response() -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::new(
            Full::new(Bytes::new())
                .map_err(|never| match never {})
                .boxed(),
        )
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        Box::pin(self.clone().handle_request(req))
    }
}

/// Admin HTTP listener, served on its own port.
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin_service: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin endpoint.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(registry, senders))]
    pub async fn bind(
        addr: &str,
        registry: Arc<ServiceRegistry>,
        senders: EventSenders,
    ) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("admin endpoint bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            admin_service: AdminService::new(registry, senders),
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves admin endpoints until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving admin endpoints");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("admin connection from {}", peer_addr);
                            let service = self.admin_service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    warn!("admin connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept admin connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping admin listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a single admin TCP connection.
    #[instrument(level = "debug", skip(stream, service))]
    async fn handle_connection(stream: tokio::net::TcpStream, service: AdminService) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut service = service.clone();
            async move { service.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(ProxyError::Http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::event_channels;

    #[test]
    fn test_metrics_response() {
        let response = AdminService::metrics_response("test_metric 1.0".to_string());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[test]
    fn test_text_response_status() {
        let response = AdminService::text_response(StatusCode::NOT_FOUND, "Not Found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind() {
        let registry = Arc::new(ServiceRegistry::new());
        let (senders, _receivers) = event_channels(4);
        let listener = AdminListener::bind("127.0.0.1:0", registry, senders).await;
        assert!(listener.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind_invalid_address() {
        let registry = Arc::new(ServiceRegistry::new());
        let (senders, _receivers) = event_channels(4);
        let listener = AdminListener::bind("999.999.999.999:0", registry, senders).await;
        assert!(listener.is_err());
    }
}
