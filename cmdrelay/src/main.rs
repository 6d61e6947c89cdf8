use clap::Parser;
use cmdrelay::{ServerConfig, config::ConfigFile, logging::init_logging, start_server};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};
use tracing::info;

/// Runs whitelisted commands over HTTP and streams their output line by line.
#[derive(Parser, Debug)]
#[command(name = "cmdrelay")]
#[command(version, about)]
struct Args {
    /// Command config file (.json, .yaml, .yml or .toml).
    config: PathBuf,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    /// Maximum number of commands running at once. Overrides the config file.
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Seconds to wait for output to drain after a command ends. Overrides the config file.
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to a daily rolling file in the user cache directory instead of stderr.
    #[arg(long)]
    log_to_file: bool,
}

impl Args {
    fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut file = ConfigFile::load(&self.config)?;
        if let Some(max) = self.max_concurrency {
            file.max_concurrency = Some(max);
        }
        if let Some(secs) = self.drain_timeout_secs {
            file.drain_timeout_secs = Some(secs);
        }
        Ok(ServerConfig::from_config_file(&file, self.bind_addr())?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_to_file)?;

    let config = args.server_config()?;
    info!(
        config = %args.config.display(),
        commands = config.commands.len(),
        max_concurrency = config.max_concurrency,
        drain_timeout = ?config.drain_timeout,
        "loaded config"
    );
    start_server(config).await?;
    Ok(())
}
