use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use innkeep::background;
use innkeep::clock::{Clock, SystemClock};
use innkeep::config::Config;
use innkeep::engine::Engine;
use innkeep::handler::Handler;
use innkeep::limits::MAX_STATEMENT_LEN;
use innkeep::throttle::StatusThrottle;
use innkeep::upcoming::UpcomingCache;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries results; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    innkeep::observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(Engine::new(config.wal_path())?);
    info!("innkeep ready");
    info!("  wal: {}", config.wal_path().display());
    info!(
        "  loaded: {} guests, {} rooms, {} reservations",
        engine.guest_count(),
        engine.room_count(),
        engine.reservation_count()
    );
    info!(
        "  status throttle: {} per {}s",
        config.status_limit,
        config.status_window.as_secs()
    );
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let throttle = Arc::new(StatusThrottle::new(config.status_limit, config.status_window));
    let cache = UpcomingCache::spawn(engine.clone(), clock.clone(), config.upcoming_horizon_days);
    tokio::spawn(background::run_reconciler(
        cache.clone(),
        clock.clone(),
        config.reconcile_interval,
    ));
    tokio::spawn(background::run_throttle_purge(
        throttle.clone(),
        clock.clone(),
        config.status_window,
    ));
    tokio::spawn(background::run_compactor(
        engine.clone(),
        config.compact_threshold,
        COMPACT_CHECK_INTERVAL,
    ));
    let handler = Handler::new(engine, throttle, cache, clock);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut lines = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_STATEMENT_LEN),
    );
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = lines.next() => {
                let out = match line {
                    None => {
                        info!("input closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("unreadable input line: {e}");
                        serde_json::json!({ "error": e.to_string(), "code": "22000" })
                    }
                    Some(Ok(line)) => {
                        let statement = line.trim();
                        if statement.is_empty() || statement.starts_with("--") {
                            continue;
                        }
                        match handler.execute(statement).await {
                            Ok(response) => response.to_json(),
                            Err(e) => e.to_json(),
                        }
                    }
                };
                stdout.write_all(format!("{out}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("innkeep stopped");
    Ok(())
}
