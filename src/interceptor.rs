//! Accept loop for transparently redirected connections.
//!
//! Recovering a connection's pre-NAT destination is platform-specific, so it
//! sits behind the [`OriginalDst`] capability; production wires in the Linux
//! socket-option implementation and tests inject a fixed answer.

use crate::error::{ProxyError, Result};
use crate::handler::{HandlerContext, ProtocolHandler};
use crate::metrics::Metrics;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Recovers the original destination of a redirected connection.
pub trait OriginalDst: Send + Sync {
    fn resolve(&self, stream: &TcpStream) -> Result<SocketAddr>;
}

/// Reads the pre-NAT destination via `SO_ORIGINAL_DST`.
#[cfg(target_os = "linux")]
pub struct LinuxOriginalDst;

#[cfg(target_os = "linux")]
impl OriginalDst for LinuxOriginalDst {
    fn resolve(&self, stream: &TcpStream) -> Result<SocketAddr> {
        let sock = socket2::SockRef::from(stream);
        let addr = sock.original_dst().map_err(ProxyError::OriginalDst)?;
        addr.as_socket().ok_or_else(|| {
            ProxyError::OriginalDst(io::Error::other("original destination is not an inet address"))
        })
    }
}

/// Always reports the same destination. Test wiring.
pub struct FixedOriginalDst {
    pub addr: SocketAddr,
}

impl OriginalDst for FixedOriginalDst {
    fn resolve(&self, _stream: &TcpStream) -> Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Listens for redirected connections and dispatches each to a protocol
/// handler on its own task.
pub struct Interceptor {
    listen_addr: String,
    original_dst: Arc<dyn OriginalDst>,
    ctx: Arc<HandlerContext>,
}

impl Interceptor {
    pub fn new(
        listen_addr: impl Into<String>,
        original_dst: Arc<dyn OriginalDst>,
        ctx: Arc<HandlerContext>,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            original_dst,
            ctx,
        }
    }

    /// Binds the intercept listener. Separate from [`serve`](Self::serve) so
    /// callers can learn the bound address before accepting.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ProxyError::ListenerBind {
                addr: self.listen_addr.clone(),
                source,
            })?;
        info!(addr = %self.listen_addr, "intercept listener bound");
        Ok(listener)
    }

    /// Runs the accept loop until the shutdown signal fires or the listener
    /// fails fatally.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("intercept listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) if is_fatal_accept_error(&e) => {
                        return Err(ProxyError::AcceptConnection(e));
                    }
                    Err(e) => {
                        // Errors like EMFILE resolve on their own; the pause
                        // keeps the loop from spinning until they do.
                        warn!(error = %e, "transient accept error");
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                },
            }
        }
    }

    /// Resolves one accepted connection and hands it to a handler task. Any
    /// failure closes the connection by dropping it; there is no retry.
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let destination = match self.original_dst.resolve(&stream) {
            Ok(destination) => destination,
            Err(e) => {
                warn!(peer = %peer, error = %e, "cannot recover original destination");
                Metrics::record_drop("original-dst");
                return;
            }
        };
        let address = destination.ip().to_string();
        let Some(resolved) = self.ctx.registry.resolve(&address, destination.port()) else {
            debug!(peer = %peer, dst = %destination, "no service registered for destination");
            Metrics::record_drop("service-not-found");
            return;
        };
        let handler = match ProtocolHandler::for_protocol(
            &resolved.protocol,
            self.ctx.clone(),
            &resolved.namespace,
            &resolved.name,
            resolved.target_port,
        ) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(peer = %peer, dst = %destination, error = %e, "unsupported protocol");
                Metrics::record_drop("unsupported-protocol");
                return;
            }
        };

        Metrics::record_connection(handler.protocol_name());
        let service = format!("{}.{}", resolved.namespace, resolved.name);
        tokio::spawn(async move {
            if let Err(e) = handler.process(stream).await {
                if e.is_benign() {
                    debug!(peer = %peer, service = %service, error = %e, "connection ended");
                } else {
                    warn!(peer = %peer, service = %service, error = %e, "connection failed");
                    Metrics::record_drop(drop_reason(&e));
                }
            }
        });
    }
}

/// Only errors meaning the listening socket itself is gone end the accept
/// loop; anything else (aborted handshakes, fd exhaustion) is survivable.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK)
    )
}

fn drop_reason(e: &ProxyError) -> &'static str {
    match e {
        ProxyError::NoInstance { .. } => "no-instance",
        ProxyError::RouteNotFound { .. } => "route-not-found",
        ProxyError::UnsupportedHashKey(_) => "unsupported-hash-key",
        ProxyError::BackendConnect { .. } | ProxyError::DialTimeout { .. } => "backend-dial",
        ProxyError::MalformedRequest(_) => "malformed-request",
        _ => "relay",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_original_dst_ignores_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();

        let fixed = FixedOriginalDst {
            addr: "10.0.0.5:80".parse().unwrap(),
        };
        let resolved = fixed.resolve(&client).unwrap();
        assert_eq!(resolved, "10.0.0.5:80".parse().unwrap());
    }

    #[test]
    fn test_accept_error_classification() {
        // fd exhaustion and aborted handshakes keep the loop alive
        assert!(!is_fatal_accept_error(&io::Error::from_raw_os_error(
            libc::EMFILE
        )));
        assert!(!is_fatal_accept_error(&io::Error::from_raw_os_error(
            libc::ENFILE
        )));
        assert!(!is_fatal_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        // a dead listening socket ends it
        assert!(is_fatal_accept_error(&io::Error::from_raw_os_error(
            libc::EBADF
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_survives_accepted_connection_churn() {
        use crate::handler::HandlerContext;
        use crate::loadbalancer::LoadBalancer;
        use crate::registry::ServiceRegistry;
        use crate::ringcache::RingCache;
        use crate::router::RouteStore;
        use std::sync::Arc;

        let registry = Arc::new(ServiceRegistry::new());
        let rings = Arc::new(RingCache::new());
        let ctx = Arc::new(HandlerContext {
            registry: registry.clone(),
            balancer: Arc::new(LoadBalancer::new("ROUND_ROBIN", rings)),
            routes: Arc::new(RouteStore::new()),
            dial_timeout: Duration::from_secs(1),
            dial_attempts: 1,
            idle_timeout: Duration::from_secs(1),
            buffer_size: 1024,
        });
        let interceptor = Interceptor::new(
            "127.0.0.1:0",
            Arc::new(FixedOriginalDst {
                addr: "10.9.9.9:80".parse().unwrap(),
            }),
            ctx,
        );
        let listener = interceptor.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let serve = tokio::spawn(async move { interceptor.serve(listener, shutdown_rx).await });

        // Unresolvable connections are dropped but the loop keeps accepting.
        for _ in 0..5 {
            let _ = TcpStream::connect(addr).await.unwrap();
        }
        let extra = TcpStream::connect(addr).await;
        assert!(extra.is_ok());

        shutdown_tx.send(()).unwrap();
        serve.await.unwrap().unwrap();
    }
}
