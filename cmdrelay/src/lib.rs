//! # cmdrelay
//!
//! An HTTP server that runs a fixed whitelist of commands and streams their
//! output back to the caller as it is produced.
//!
//! Each configured command is bound to one URL path. A request to that path
//! spawns the command with its configured environment and working directory,
//! and the combined stdout and stderr are relayed line by line into a chunked
//! `text/plain` response. A command that exits non-zero gets one trailing
//! `Exit with error: <code>` line, since the status code was already sent.
//!
//! ## Guarantees
//!
//! *   **Bounded concurrency**: at most `max_concurrency` commands run at once;
//!     extra requests get `429 Too Many Requests` and spawn nothing.
//! *   **No orphans**: a client that disconnects mid-stream has its subprocess
//!     killed.
//! *   **Whole lines**: stdout and stderr lines interleave but are never split.
//! *   **Setup errors are 500s**: an unreadable env file, a missing cwd or a
//!     failed spawn is reported before any output is streamed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cmdrelay::{ServerConfig, start_server};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let addr = "127.0.0.1:8080".parse()?;
//!     let config = ServerConfig::from_file(Path::new("cmdrelay.yaml"), addr)?;
//!     start_server(config).await?;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod logging;
pub mod process;
pub mod relay;
pub mod server;
pub mod workdir;

pub use config::{CommandConfig, CommandDescriptor, ConfigFile, ServerConfig};
pub use coordinator::{CancellationCause, Coordinator, RequestPhase};
pub use error::{CommandError, Result, ServerError};
pub use server::{AppState, CommandServer, build_router, start_server};
