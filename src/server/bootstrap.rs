use crate::config::GatewayConfig;
use crate::events::bus::{EventPublisher, EventSubscriber, EventTransport, RedisTransport};
use crate::events::RefreshKind;
use crate::metrics::Metrics;
use crate::server::{self, GatewayState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → initial sync → loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    let metrics_handle = Metrics::install();

    // Phase 1: config and shared state.
    let config = GatewayConfig::load(&args.config_path)?;
    let shutdown = CancellationToken::new();

    let transport = build_transport(&config).await?;
    let publisher = EventPublisher::start(
        transport.clone(),
        config.events.clone(),
        shutdown.clone(),
    );

    let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
    let state = GatewayState::new(config, publisher, refresh_tx).await?;

    // Phase 2: synchronous initial sync — snapshots must be serving
    // before traffic arrives. Failures here leave empty snapshots and
    // the poll loop retries.
    state.refresh_all().await;
    tracing::info!(
        "bootstrap: initial sync completed, routes={}, rate_limit_rules={}, access_clients={}",
        state.routes.load().route_count(),
        state.limit_index.load().rule_count(),
        state.access_cache.client_count()
    );

    // Phase 3: loop owners.
    tokio::spawn(server::run_refresh_coordinator(
        state.clone(),
        refresh_rx,
        shutdown.clone(),
    ));
    start_event_subscriber(&state, &transport, &shutdown);
    start_registry_poll_loop(&state, &shutdown);
    start_health_loop(&state, &shutdown);
    start_admin_server(&state, &args, metrics_handle);

    tracing::info!("server: starting gateway, listen={}", args.listen);

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    // Phase 4: block until signal, then clean up.
    wait_for_shutdown().await;
    shutdown.cancel();

    // Wait for proxy to finish draining.
    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy error: {}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn build_transport(config: &GatewayConfig) -> Result<Arc<EventTransport>> {
    if config.redis.url.is_empty() {
        tracing::info!("events: no redis configured, using in-process event channel");
        Ok(Arc::new(EventTransport::Memory(Default::default())))
    } else {
        let transport = RedisTransport::connect(&config.redis.url).await?;
        Ok(Arc::new(EventTransport::Redis(transport)))
    }
}

/// Sleep for `duration`, but return `true` immediately on shutdown.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.cancelled() => true,
    }
}

fn start_event_subscriber(
    state: &Arc<GatewayState>,
    transport: &Arc<EventTransport>,
    shutdown: &CancellationToken,
) {
    let subscriber = EventSubscriber::new(&state.config.events.channel, state.refresh_tx.clone());
    let shutdown = shutdown.clone();

    match &**transport {
        EventTransport::Redis(_) => {
            let redis_url = state.config.redis.url.clone();
            tokio::spawn(subscriber.run_redis(redis_url, shutdown));
        }
        EventTransport::Memory(t) => {
            let rx = t.subscribe();
            tokio::spawn(subscriber.run_memory(rx, shutdown));
        }
    }
}

/// Periodic full re-sync. Events make refreshes prompt; this loop makes
/// them inevitable even when the event channel is down.
fn start_registry_poll_loop(state: &Arc<GatewayState>, shutdown: &CancellationToken) {
    let state = state.clone();
    let shutdown = shutdown.clone();
    let interval = std::time::Duration::from_secs(state.config.registry.poll_interval_secs);

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            for kind in [
                RefreshKind::Routes,
                RefreshKind::RateLimits,
                RefreshKind::AccessControl,
            ] {
                let _ = state.refresh_tx.send(kind);
            }
        }
    });
}

fn start_health_loop(state: &Arc<GatewayState>, shutdown: &CancellationToken) {
    if !state.config.health.enabled {
        tracing::info!("health: monitor disabled");
        return;
    }

    let state = state.clone();
    let shutdown = shutdown.clone();
    let interval = std::time::Duration::from_secs(state.config.health.interval_secs);

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            let targets = state.health_targets();
            if targets.is_empty() {
                continue;
            }
            state.health.run_round(&targets).await;
        }
    });
}

fn start_admin_server(state: &Arc<GatewayState>, args: &BootstrapArgs, metrics_handle: Metrics) {
    let state = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, state, metrics_handle).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
