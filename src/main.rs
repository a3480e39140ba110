use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};

use loghealer::config::Config;
use loghealer::engine::parser;

const DEFAULT_CONFIG_PATH: &str = "loghealer.toml";

#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Initialize Sentry before anything else so panics during startup are captured.
    // Returns a no-op guard when SENTRY_DSN is absent.
    let _sentry_guard = sentry::init(sentry_options());

    let config_path = std::env::var("LOGHEALER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("loghealer: {}", e);
            return std::process::ExitCode::from(2);
        }
    };
    loghealer::logging::init(&config.logging);

    tracing::info!("Starting loghealer v{}", env!("CARGO_PKG_VERSION"));

    let state = match loghealer::build(&config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    };
    state.orchestrator.start();

    let default_service =
        std::env::var("LOGHEALER_DEFAULT_SERVICE").unwrap_or_else(|_| "unknown".to_string());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ingested: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(entry) = parser::parse_line(&line, &default_service) {
                        if state.engine.process_log_entry(entry).await.is_some() {
                            ingested += 1;
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!("Input closed");
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    if !state.orchestrator.shutdown().await {
        tracing::warn!("Exiting with healing attempts still in flight");
    }
    let report = state.report();
    tracing::info!(
        ingested,
        fingerprints = report.healing.total_fingerprints,
        resolved = report.healing.resolved,
        critical = report.healing.by_severity.critical,
        sweeps = report.scheduler.sweeps,
        events = report.bus.published,
        handler_failures = report.bus.handler_failures,
        success_rate = report.success_rate.unwrap_or_default(),
        "Shutting down",
    );
    match serde_json::to_string(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!("Could not serialize report: {}", e),
    }
    std::process::ExitCode::SUCCESS
}

fn sentry_options() -> sentry::ClientOptions {
    sentry::ClientOptions {
        dsn: std::env::var("SENTRY_DSN").ok().and_then(|s| s.parse().ok()),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        traces_sample_rate: 0.0,
        send_default_pii: false,
        before_send: Some(std::sync::Arc::new(|mut event| {
            if let Some(ref mut user) = event.user {
                user.email = None;
                user.ip_address = None;
                user.username = None;
            }
            Some(event)
        })),
        ..Default::default()
    }
}
