use rand::{rngs::StdRng, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use v16_tracker::background::{BackgroundScheduler, Poller, Sweeper};
use v16_tracker::ingest::{Decoder, FeedSource, Normalizer, UpstreamClient};
use v16_tracker::services::{ElasticStore, EventStore, Reconciler};
use v16_tracker::{router, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    init_tracing();
    info!("Starting V16 tracker...");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };
    info!("Configuration loaded");

    let store = EventStore::new();
    let reconciler = connect_durable_store(&config).await;
    let restored = reconciler.restore_into(&store).await;
    info!("Restored {} event(s) into the cache", restored);

    let upstream = UpstreamClient::new(config.upstream.clone())?;
    let source: Arc<str> = Arc::from(upstream.describe());

    let poller = Poller::new(
        Arc::new(upstream),
        Decoder::new(&config.upstream.xor_key),
        Normalizer::new(&config.normalizer),
        store.clone(),
        reconciler.clone(),
        config.poller.clone(),
        StdRng::from_entropy(),
    );
    let poller_status = poller.status();
    let sweeper = Sweeper::new(store.clone(), reconciler.clone(), config.store.clone());
    let scheduler = BackgroundScheduler::start(poller, sweeper);

    let app_state = AppState {
        store,
        poller: poller_status,
        source,
        persistence: reconciler.backend(),
        config: config.clone(),
    };
    let app = router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!("Server error: {}", e);
    }

    info!("Shutting down gracefully...");
    scheduler.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "v16_tracker=info,tower_http=info".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn connect_durable_store(config: &Config) -> Reconciler {
    let Some(elastic) = &config.elasticsearch else {
        info!("No durable store configured; state lives in memory only");
        return Reconciler::disabled();
    };
    match ElasticStore::connect(elastic, config.store.stale_after).await {
        Ok(store) => Reconciler::new(Arc::new(store)),
        Err(e) => {
            warn!("Elasticsearch unavailable, continuing without it: {}", e);
            Reconciler::disabled()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
