//! Swift Drive Autopilot
//!
//! Process wiring: CLI parsing, logging, configuration, the collector and
//! converger tasks, and the Prometheus metrics server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use swift_drive_autopilot::collectors::{self, EVENT_QUEUE_CAPACITY};
use swift_drive_autopilot::error::fatal;
use swift_drive_autopilot::os::OsFacade;
use swift_drive_autopilot::{converger, metrics, util, Config, Linux};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Swift Drive Autopilot - storage drive supervisor for Swift nodes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    config: PathBuf,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging();

    let config = match Config::load(&args.config) {
        Ok(config) => Arc::new(config),
        Err(err) => fatal(&format!("read configuration file: {err}")),
    };

    info!(
        "starting swift-drive-autopilot {}",
        swift_drive_autopilot::VERSION
    );

    // set the working directory to the chroot directory; this simplifies
    // file system operations because relative paths refer to locations
    // inside the chroot
    let working_dir = config.chroot.clone().unwrap_or_else(|| "/".to_string());
    if let Err(err) = std::env::set_current_dir(&working_dir) {
        fatal(&format!("chdir to {working_dir}: {err}"));
    }

    let os: Arc<dyn OsFacade> = match Linux::new(config.chroot.is_some()) {
        Ok(os) => Arc::new(os),
        Err(err) => fatal(&err.to_string()),
    };
    if let Err(err) = os.prepare_state_dirs().await {
        fatal(&format!("cannot create state directories: {err}"));
    }

    metrics::register_event_types();
    if let Some(listen_address) = config.metrics_listen_address.clone() {
        tokio::spawn(async move {
            if let Err(err) = run_metrics_server(&listen_address).await {
                error!("metrics server error: {err}");
            }
        });
    }

    if util::in_test_mode() {
        util::setup_test_mode();
    }

    let (queue_tx, queue_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    collectors::spawn_all(os.clone(), config.clone(), queue_tx);

    // the converger owns all drive state; this only returns at shutdown
    converger::run(queue_rx, os, config).await;
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging() {
    // DEBUG=1 raises the default level; RUST_LOG still wins when set
    let default_level = if util::in_debug_mode() { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> swift_drive_autopilot::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                        error!("cannot encode metrics: {err}");
                    }

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    // allow ":9102" as shorthand for "0.0.0.0:9102"
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    let addr: SocketAddr = addr.parse().map_err(|err| {
        swift_drive_autopilot::Error::Configuration(format!(
            "invalid metrics listen address: {err}"
        ))
    })?;

    info!("metrics server listening on {addr}");
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|err| swift_drive_autopilot::Error::Configuration(err.to_string()))?;

    Ok(())
}
