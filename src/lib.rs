//! # GCodeLink
//!
//! A remote-controllable G-code streaming engine for Grbl-class CNC
//! controllers.
//!
//! ## Architecture
//!
//! GCodeLink is organized as a workspace:
//!
//! 1. **gcodelink-core** - Events, mailboxes, programs, configuration, errors
//! 2. **gcodelink-communication** - Serial channels, the Grbl protocol, the program executor
//! 3. **gcodelink-remote** - Framed event transport, the broadcast server and the remote client
//! 4. **gcodelink** - Binary that loads a configuration and runs a transport server

use std::path::{Path, PathBuf};

use anyhow::Context;

pub use gcodelink_core::{AppConfig, CommandSurface, Error, Event, EventKind, Payload, Result};
pub use gcodelink_remote::{RemoteClient, RunningServer, TransportServer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Configuration file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "gcodelink.toml";

/// Initialize logging with the default configuration
///
/// Console output with targets, thread names and line numbers. The level
/// defaults to INFO and `RUST_LOG` overrides it.
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .context("logging already initialized")?;

    Ok(())
}

/// Load the configuration named by `path`, or the default file if present
///
/// Without a path and without `gcodelink.toml` in the working directory,
/// built-in defaults are used.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let path: PathBuf = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.exists() {
                tracing::info!("No configuration file, using defaults");
                return Ok(AppConfig::default());
            }
            default
        }
    };

    AppConfig::load_from_file(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Run a transport server until ctrl-c
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.remote.host, config.remote.port);
    let server = TransportServer::new(config)
        .bind()
        .await
        .with_context(|| format!("failed to start transport server on {}", addr))?;
    tracing::info!(
        "GCodeLink {} (built {}) serving on {}",
        VERSION,
        BUILD_DATE,
        server.local_addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");
    server.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_config_file_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[remote]\nport = 7000\n").expect("write");

        let config = load_config(Some(&path)).expect("load");
        assert_eq!(config.remote.port, 7000);
        assert_eq!(config.remote.header_width, 10);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = load_config(Some(&dir.path().join("absent.toml"))).expect_err("missing");
        assert!(error.to_string().contains("absent.toml"));
    }
}
