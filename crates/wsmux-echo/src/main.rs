//! wsmux echo relay
//!
//! Small harness around the `wsmux` library.
//!
//! - `serve` accepts WebSocket connections and echoes every stream the peer
//!   opens, byte for byte, until the peer half-closes it
//! - `load` dials a relay, pushes payloads through many concurrent streams
//!   and checks that each one comes back intact

mod load;
mod serve;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use wsmux::Config;

/// Stream multiplexer echo relay and load checker.
#[derive(Parser, Debug)]
#[command(name = "wsmux-echo", about = "wsmux echo relay and load checker")]
struct Cli {
    /// TOML file with session settings (window sizes, backlog).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo every stream.
    Serve {
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:9400")]
        listen: SocketAddr,
    },
    /// Open streams against a relay and verify the echo.
    Load {
        /// Relay WebSocket URL.
        #[arg(long, default_value = "ws://127.0.0.1:9400")]
        url: String,

        /// Concurrent streams to open.
        #[arg(long, default_value_t = 50)]
        streams: usize,

        /// Payload size per stream in bytes.
        #[arg(long, default_value_t = 64 * 1024)]
        size: usize,

        /// Per-stream read deadline in seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Config::from_toml_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(
        initial_window = config.initial_window,
        max_frame_payload = config.max_frame_payload,
        "session settings loaded"
    );

    match cli.command {
        Command::Serve { listen } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let listener = TcpListener::bind(listen)
                .await
                .with_context(|| format!("binding {listen}"))?;
            tracing::info!(addr = %listen, "wsmux-echo serving");

            let server = tokio::spawn(serve::run(listener, config, shutdown_rx));

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    let _ = shutdown_tx.send(true);
                }
                result = server => {
                    match result {
                        Ok(Err(e)) => tracing::error!("relay failed: {e:#}"),
                        Err(e) => tracing::error!("relay task failed: {e}"),
                        Ok(Ok(())) => {}
                    }
                }
            }
        }
        Command::Load {
            url,
            streams,
            size,
            timeout,
        } => {
            let stats = load::run(
                &url,
                load::LoadParams {
                    streams,
                    size,
                    read_timeout: Duration::from_secs(timeout),
                },
                config,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    tracing::info!("wsmux-echo stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_defaults() {
        let cli = Cli::try_parse_from(["wsmux-echo", "load"]).unwrap();
        match cli.command {
            Command::Load { url, streams, size, timeout } => {
                assert_eq!(url, "ws://127.0.0.1:9400");
                assert_eq!(streams, 50);
                assert_eq!(size, 64 * 1024);
                assert_eq!(timeout, 30);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["wsmux-echo", "serve", "--config", "mux.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("mux.toml")));
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = load_config(Some(Path::new("/nonexistent/wsmux.toml"))).unwrap_err();
        assert!(err.to_string().contains("reading"));
    }

    #[test]
    fn no_config_file_means_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.initial_window, wsmux::config::DEFAULT_INITIAL_WINDOW);
    }
}
