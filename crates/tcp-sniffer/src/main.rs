mod cli;
mod config;
mod testserver;

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use frame_capture::{
    default_frame_sinks, FrameSink, RecordSink, RecordWriter, SuppressHttpHeaders, Toggle,
    ToggleHandle, Transform,
};
use tcp_relay::{Dispatcher, FrameSinks, TcpDialer};

use crate::cli::Cli;
use crate::config::{CaptureConfig, CaptureFormat, LoggingConfig};

/// How long shutdown waits for the JSON writer to drain.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let loaded = config::load(&cli.config)?;
    let missing = loaded.is_none();
    let mut cfg = loaded.unwrap_or_default();
    cli.apply(&mut cfg);

    // 3. Logging goes to stderr; stdout belongs to the capture.
    init_tracing(&cfg.logging);
    if missing {
        config::warn_missing(&cli.config);
    }

    let mut listener = TcpListener::bind(&cfg.network.listen_addr)
        .await
        .with_context(|| format!("failed to listen on {}", cfg.network.listen_addr))?;

    if cli.test_server {
        tokio::select! {
            r = testserver::serve(listener) => r.context("test server failed")?,
            r = shutdown_signal() => r.context("failed to wait for shutdown signal")?,
        }
        return Ok(());
    }

    info!(
        config_file = %cli.config.display(),
        listen = %cfg.network.listen_addr,
        upstream = %cfg.network.upstream_addr,
        format = ?cfg.capture.format,
        suppress_headers = cfg.capture.suppress_headers,
        "tcp-sniffer starting"
    );

    // 4. Build the capture chain. One toggle serves both directions.
    let suppress = Toggle::new(SuppressHttpHeaders, cfg.capture.suppress_headers);
    spawn_header_toggle(suppress.handle())?;
    let (sinks, writer) = build_sinks(&cfg.capture, suppress).await?;

    // 5. Relay until the listener fails or we are told to stop.
    let mut dispatcher = Dispatcher::new(cfg.network.upstream_addr.clone(), TcpDialer, sinks)
        .with_dial_failure_policy(cfg.dispatch.on_dial_error);

    let result = tokio::select! {
        r = dispatcher.run(&mut listener) => r.map_err(anyhow::Error::from),
        r = shutdown_signal() => r.context("failed to wait for shutdown signal"),
    };

    info!(sessions = dispatcher.next_id(), "tcp-sniffer shutting down");
    drop(dispatcher);

    // Live relays still hold the record sink, so the drain is best effort.
    if let Some(writer) = writer {
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            warn!("capture writer did not drain before shutdown");
        }
    }

    result
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if logging.json {
        builder.json().with_thread_ids(true).init();
    } else {
        builder.init();
    }
}

/// Wrap the configured output in the header-suppression toggle, once per
/// direction. JSON output also returns the writer task to drain on exit.
async fn build_sinks(
    capture: &CaptureConfig,
    suppress: Toggle<SuppressHttpHeaders>,
) -> Result<(FrameSinks, Option<JoinHandle<()>>)> {
    match capture.format {
        CaptureFormat::Raw => {
            let (from_client, from_server) = if capture.to_stdout() {
                default_frame_sinks(std::io::stdout())
            } else {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&capture.output)
                    .with_context(|| {
                        format!("failed to open capture file {}", capture.output.display())
                    })?;
                default_frame_sinks(file)
            };
            let sinks = FrameSinks::new(
                suppress.clone().wrap(from_client),
                suppress.wrap(from_server),
            );
            Ok((sinks, None))
        }
        CaptureFormat::Json => {
            let (sink, handle) = if capture.to_stdout() {
                RecordSink::spawn_writer(RecordWriter::new(tokio::io::stdout()))
            } else {
                let writer = RecordWriter::open(&capture.output).await.with_context(|| {
                    format!("failed to open capture file {}", capture.output.display())
                })?;
                RecordSink::spawn_writer(writer)
            };
            let sink: Arc<dyn FrameSink> = Arc::new(sink);
            let sinks = FrameSinks::new(
                suppress.clone().wrap(Arc::clone(&sink)),
                suppress.wrap(sink),
            );
            Ok((sinks, Some(handle)))
        }
    }
}

/// Flip header suppression whenever `h` is entered on stdin.
///
/// Runs on a plain thread: a blocked stdin read cannot be cancelled and would
/// otherwise hold up runtime shutdown.
fn spawn_header_toggle(handle: ToggleHandle) -> Result<()> {
    std::thread::Builder::new()
        .name("header-toggle".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim() == "h" {
                    let enabled = handle.toggle();
                    info!(enabled, "header suppression toggled");
                }
            }
        })
        .context("failed to spawn stdin reader")?;
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r?;
                info!("received SIGINT (ctrl-c)");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received SIGINT (ctrl-c)");
    }

    Ok(())
}
