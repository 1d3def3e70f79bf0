// Crate-level lint configuration
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::similar_names)]

//! JA3Gate - TLS-fingerprint-aware HTTPS reverse proxy
//!
//! A reverse proxy that:
//! - Computes a JA3 fingerprint from the raw ClientHello of every connection
//! - Forwards all traffic to the origin with authenticated trust headers
//! - Keeps an append-only request log with paging and aggregation
//! - Runs as a fleet controller collecting reports from many proxy nodes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ja3gate::acme::{AcmeService, TlsMaterial};
use ja3gate::admin::{self, AdminState};
use ja3gate::config::{GuardConfig, Mode, Settings};
use ja3gate::listener::Ja3Table;
use ja3gate::nodes::NodeRegistry;
use ja3gate::proxy::{self, ProxyState};
use ja3gate::reporter::Reporter;
use ja3gate::server;
use ja3gate::store::Store;
use ja3gate::{NAME, VERSION};

/// Retention of the request log, in days.
const LOG_RETENTION_DAYS: i64 = 30;

/// Budget for tasks to wind down after the shutdown signal.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// JA3Gate - TLS-fingerprint-aware reverse proxy
#[derive(Parser, Debug)]
#[command(name = "ja3gate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/data/config.json", env = "JA3GATE_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "JA3GATE_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "JA3GATE_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start servers)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls CryptoProvider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("starting {} v{}", NAME, VERSION);
    info!("configuration file: {:?}", args.config);

    let config = GuardConfig::load(&args.config)?;
    if args.validate {
        info!("configuration validation successful, exiting");
        return Ok(());
    }
    let config = Arc::new(config);

    info!(
        "mode: {:?}, data dir: {}",
        config.mode,
        config.data_dir.display()
    );

    let store = Arc::new(Store::open(&config.data_dir)?);
    let settings = Settings::new(config.log_enabled);
    let registry = match config.mode {
        Mode::Master => Some(Arc::new(NodeRegistry::open(&config.data_dir)?)),
        Mode::Node => None,
    };

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)> = Vec::new();

    // Daily log cleanup
    {
        let store = store.clone();
        let token = shutdown.clone();
        tasks.push((
            "log-cleanup",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(24 * 3600));
                ticker.tick().await; // first cleanup after a full day
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            match store.prune(LOG_RETENTION_DAYS) {
                                Ok(removed) => {
                                    info!("log cleanup removed {} events older than {} days",
                                        removed, LOG_RETENTION_DAYS);
                                }
                                Err(e) => warn!("log cleanup failed: {}", e),
                            }
                        }
                    }
                }
            }),
        ));
    }

    // Admin / controller API
    {
        let app = admin::router(AdminState {
            config: config.clone(),
            store: store.clone(),
            registry: registry.clone(),
            settings: settings.clone(),
        });
        let addr = config.admin_addr()?;
        let token = shutdown.clone();
        tasks.push((
            "admin",
            tokio::spawn(async move {
                if let Err(e) = server::run_admin_server(addr, app, token).await {
                    error!("admin server error: {}", e);
                }
            }),
        ));
    }

    // Controller-side liveness sweeper
    if let Some(registry) = registry.clone() {
        let token = shutdown.clone();
        tasks.push((
            "offline-sweeper",
            tokio::spawn(registry.run_sweeper(token)),
        ));
    }

    // HTTPS data plane (any mode with a domain and an upstream)
    if config.proxy_enabled() {
        let acme = Arc::new(AcmeService::new(
            &config.domain,
            &config.acme_email,
            &config.data_dir,
        )?);

        // HTTP-01 answers must be reachable before ordering a certificate
        {
            let acme = acme.clone();
            let token = shutdown.clone();
            tasks.push((
                "http-redirect",
                tokio::spawn(async move {
                    if let Err(e) = server::run_http_redirect_server(80, Some(acme), token).await {
                        error!("HTTP redirect server error: {}", e);
                    }
                }),
            ));
        }

        if let Err(e) = acme.ensure_certificate().await {
            if acme.load_server_config().is_ok() {
                warn!("certificate renewal failed, serving cached material: {}", e);
            } else {
                shutdown.cancel();
                return Err(e.context(format!("no usable certificate for {}", config.domain)));
            }
        }
        let tls = Arc::new(TlsMaterial::new(acme.load_server_config()?));

        {
            let acme = acme.clone();
            let tls = tls.clone();
            let token = shutdown.clone();
            tasks.push(("acme-renewal", tokio::spawn(acme.run_renewal(tls, token))));
        }

        let table = Arc::new(Ja3Table::new());
        tasks.push((
            "ja3-sweeper",
            tokio::spawn(table.clone().run_sweeper(shutdown.clone())),
        ));

        let proxy_state = ProxyState::new(
            &config.upstream,
            &config.guard_secret,
            store.clone(),
            settings.clone(),
        );
        let app = proxy::router(proxy_state);
        let addr = config.https_addr()?;
        let token = shutdown.clone();
        info!(
            "🛡️  proxying {} → {} (guard secret set: {})",
            config.domain,
            config.upstream,
            !config.guard_secret.is_empty()
        );
        tasks.push((
            "https-proxy",
            tokio::spawn(async move {
                if let Err(e) = server::run_https_listener(addr, tls, app, table, token).await {
                    error!("HTTPS listener error: {}", e);
                }
            }),
        ));
    }

    // Node-side reporting
    if config.mode == Mode::Node {
        let reporter = Reporter::new(config.clone(), store.clone())?;
        tasks.push(("reporter", tokio::spawn(reporter.run(shutdown.clone()))));
    }

    info!("{} ready", NAME);

    tokio::select! {
        _ = signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
        _ = shutdown_signal() => info!("received shutdown signal, shutting down"),
    }

    shutdown.cancel();

    let deadline = Instant::now() + SHUTDOWN_BUDGET;
    for (name, handle) in tasks {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("task {} panicked during shutdown: {}", name, e),
            Err(_) => warn!("task {} did not stop within the budget", name),
        }
    }

    info!("{} shutdown complete", NAME);
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigquit.recv() => info!("received SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}
