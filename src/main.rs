use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use roomswap::site::SiteManager;
use roomswap::wire;

struct Config {
    bind: String,
    port: u16,
    data_dir: PathBuf,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    metrics_port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: env_or("ROOMSWAP_BIND", "0.0.0.0"),
            port: env_parsed("ROOMSWAP_PORT").unwrap_or(5433),
            data_dir: PathBuf::from(env_or("ROOMSWAP_DATA_DIR", "./data")),
            password: env_or("ROOMSWAP_PASSWORD", "roomswap"),
            max_connections: env_parsed("ROOMSWAP_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: env_parsed("ROOMSWAP_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: env_parsed("ROOMSWAP_METRICS_PORT"),
            tls_cert: std::env::var("ROOMSWAP_TLS_CERT").ok(),
            tls_key: std::env::var("ROOMSWAP_TLS_KEY").ok(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Resolves on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Wait for in-flight connections to return their permits, up to 10s.
async fn drain(permits: &Semaphore, total: usize) {
    info!("draining connections...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    loop {
        if permits.available_permits() == total {
            info!("all connections drained");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            let open = total - permits.available_permits();
            warn!("drain timeout, {open} connections still open");
            return;
        }
        tick.tick().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    roomswap::observability::init(config.metrics_port);

    let tls_acceptor =
        roomswap::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    std::fs::create_dir_all(&config.data_dir)?;
    let sites = Arc::new(SiteManager::new(config.data_dir.clone(), config.compact_threshold));
    let permits = Arc::new(Semaphore::new(config.max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        %addr,
        data_dir = %config.data_dir.display(),
        max_connections = config.max_connections,
        tls = tls_acceptor.is_some(),
        "roomswap listening"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(roomswap::observability::CONNECTIONS_REJECTED_TOTAL)
                        .increment(1);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(roomswap::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(roomswap::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let sm = sites.clone();
                let pw = config.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until the connection closes
                    if let Err(e) = wire::process_connection(socket, sm, pw, tls).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(roomswap::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drain(&permits, config.max_connections).await;
    info!("roomswap stopped");
    Ok(())
}
