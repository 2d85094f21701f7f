use edgeproxy::admin::AdminListener;
use edgeproxy::config::ProxyConfig;
use edgeproxy::handler::HandlerContext;
use edgeproxy::interceptor::{Interceptor, LinuxOriginalDst};
use edgeproxy::loadbalancer::LoadBalancer;
use edgeproxy::registry::ServiceRegistry;
use edgeproxy::ringcache::RingCache;
use edgeproxy::router::RouteStore;
use edgeproxy::sync::{event_channels, ControlPlaneSync};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting edge proxy");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ProxyConfig::from_env_validated()?;
    info!(
        "config: intercept={}, admin={}, default strategy={}, dial timeout={}ms",
        config.listen_addr,
        config.admin_addr,
        config.default_strategy,
        config.dial_timeout.as_millis()
    );

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let registry = Arc::new(ServiceRegistry::new());
    let rings = Arc::new(RingCache::new());
    let balancer = Arc::new(LoadBalancer::new(&config.default_strategy, rings.clone()));
    let routes = Arc::new(RouteStore::new());

    let sync = Arc::new(ControlPlaneSync::new(
        registry.clone(),
        balancer.clone(),
        rings.clone(),
        routes.clone(),
        config.ring,
    ));
    // The sender half backs the admin `/events` ingestion endpoint.
    let (event_senders, event_receivers) = event_channels(config.event_queue_capacity);
    let sync_tasks = sync.spawn(event_receivers, &shutdown_tx);

    let ctx = Arc::new(HandlerContext {
        registry: registry.clone(),
        balancer,
        routes,
        dial_timeout: config.dial_timeout,
        dial_attempts: config.dial_attempts,
        idle_timeout: config.idle_timeout,
        buffer_size: config.buffer_size,
    });

    let interceptor = Interceptor::new(&config.listen_addr, Arc::new(LinuxOriginalDst), ctx);
    let listener = interceptor.bind().await?;
    info!("intercepting on {}", listener.local_addr()?);

    let admin_listener = AdminListener::bind(&config.admin_addr, registry, event_senders).await?;
    info!(
        "admin endpoints on {} (/health, /metrics, /services, /events)",
        admin_listener.local_addr()
    );

    let mut proxy_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = interceptor.serve(listener, shutdown_rx).await {
                error!("intercept listener error: {}", e);
            }
        }
    });

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    let mut proxy_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut proxy_task => {
            proxy_finished = true;
            match res {
                Ok(()) => info!("proxy task completed"),
                Err(err) => error!("proxy task join error: {}", err),
            }
        }
        res = &mut admin_task => {
            admin_finished = true;
            match res {
                Ok(()) => info!("admin task completed"),
                Err(err) => error!("admin task join error: {}", err),
            }
        }
    }

    let _ = shutdown_tx.send(());

    if !proxy_finished {
        match proxy_task.await {
            Ok(()) => info!("proxy task completed"),
            Err(err) => error!("proxy task join error: {}", err),
        }
    }

    if !admin_finished {
        match admin_task.await {
            Ok(()) => info!("admin task completed"),
            Err(err) => error!("admin task join error: {}", err),
        }
    }

    for task in sync_tasks {
        if let Err(err) = task.await {
            error!("sync task join error: {}", err);
        }
    }

    info!("shutdown complete");
    Ok(())
}
