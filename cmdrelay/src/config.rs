//! # Command Configuration
//!
//! The set of whitelisted commands is read once at startup from a config file
//! and never changes while the server runs. The file format is chosen by
//! extension: `.json`, `.yaml`/`.yml` or `.toml`.
//!
//! ```yaml
//! max_concurrency: 4
//! cmds:
//!   - path: /echo
//!     cmd: [echo, hi]
//!   - path: /status/{service}
//!     cmd: [systemctl, status, --no-pager]
//!     cwd: /srv/app
//!     envs:
//!       GREETING: hello
//!     env_file: /srv/app/.env
//! ```
//!
//! `ConfigFile` is the raw, deserialized form. Validation turns each entry into
//! an immutable [`CommandDescriptor`] that every request for that route shares.
//!
//! Route placeholders (`{name}`) must occupy a whole path segment and only
//! affect which requests match the route. The command always runs with the
//! argv written in the config; nothing from the request path reaches it.

use crate::error::{Result, ServerError};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::warn;

/// Ceiling applied when the config file does not set `max_concurrency`.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// How long a finished request waits for its relay loops to drain.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 10;

/// Contents of a config file, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Maximum number of subprocesses running at once, across all routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_secs: Option<u64>,
    #[serde(default)]
    pub cmds: Vec<CommandConfig>,
}

/// One whitelisted command as written in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub path: String,
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub envs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<PathBuf>,
}

impl ConfigFile {
    /// Reads and decodes a config file, picking the decoder from its extension.
    pub fn load(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let content = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        match ext.as_str() {
            "json" => Ok(serde_json::from_str(&content)?),
            "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
            "toml" => Ok(toml::from_str(&content)?),
            _ => Err(ServerError::UnsupportedFormat(ext)),
        }
    }

    /// Validates every command entry and returns their descriptors in file order.
    pub fn validate(&self) -> Result<Vec<CommandDescriptor>> {
        if self.max_concurrency == Some(0) {
            return Err(ServerError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        let mut seen_routes = HashSet::new();
        let mut descriptors = Vec::with_capacity(self.cmds.len());

        for (i, cmd) in self.cmds.iter().enumerate() {
            let descriptor = CommandDescriptor::try_from(cmd.clone())
                .map_err(|e| ServerError::Invalid(format!("cmds[{i}]: {e}")))?;

            if !seen_routes.insert(descriptor.pattern.route_shape()) {
                return Err(ServerError::Invalid(format!(
                    "cmds[{i}].path conflicts with an earlier command: {}",
                    descriptor.path
                )));
            }

            if let Some(cwd) = &descriptor.cwd
                && !cwd.is_dir()
            {
                // Checked again on every request; the directory may appear later.
                warn!(
                    path = %descriptor.path,
                    cwd = %cwd.display(),
                    "configured cwd is not a directory"
                );
            }

            descriptors.push(descriptor);
        }

        Ok(descriptors)
    }
}

/// The parsed placeholders of a route path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

impl RoutePattern {
    /// Parses a route path such as `/jobs/{id}/logs`.
    pub fn parse(path: &str) -> std::result::Result<Self, String> {
        if !path.starts_with('/') {
            return Err(format!("path must start with /: {path}"));
        }

        let mut names = HashSet::new();
        let mut segments = Vec::new();
        for raw in path[1..].split('/') {
            if raw.starts_with(':') || raw.starts_with('*') {
                return Err(format!(
                    "path segment {raw:?} is not supported, use {{name}} placeholders"
                ));
            }
            if !raw.contains(['{', '}']) {
                segments.push(Segment::Literal(raw.to_string()));
                continue;
            }

            let name = raw
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .filter(|n| !n.is_empty())
                .filter(|n| n.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
                .ok_or_else(|| format!("malformed placeholder segment {raw:?} in {path}"))?;

            if !names.insert(name.to_string()) {
                return Err(format!("duplicate placeholder {{{name}}} in {path}"));
            }
            segments.push(Segment::Placeholder(name.to_string()));
        }

        Ok(Self { segments })
    }

    /// Placeholder names in path order.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// The route with placeholder names erased, so `/a/{x}` and `/a/{y}`
    /// compare equal. Two such routes would shadow each other.
    fn route_shape(&self) -> String {
        let mut shape = String::new();
        for segment in &self.segments {
            shape.push('/');
            match segment {
                Segment::Literal(lit) => shape.push_str(lit),
                Segment::Placeholder(_) => shape.push_str("{}"),
            }
        }
        shape
    }
}

/// A validated, immutable command route.
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    pub path: String,
    /// Program followed by its arguments. Never empty.
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: BTreeMap<String, String>,
    pub env_file: Option<PathBuf>,
    pub pattern: RoutePattern,
}

impl CommandDescriptor {
    pub fn program(&self) -> &str {
        &self.argv[0]
    }
}

impl TryFrom<CommandConfig> for CommandDescriptor {
    type Error = String;

    fn try_from(cmd: CommandConfig) -> std::result::Result<Self, Self::Error> {
        let pattern = RoutePattern::parse(&cmd.path)?;
        if cmd.path == "/" {
            return Err("path / is reserved for the command listing".to_string());
        }
        if cmd.cmd.is_empty() {
            return Err("cmd must not be empty".to_string());
        }
        if let Some(j) = cmd.cmd.iter().position(|arg| arg.is_empty()) {
            return Err(format!("cmd[{j}] must not be empty"));
        }

        Ok(Self {
            path: cmd.path,
            argv: cmd.cmd,
            // An empty string means "not configured".
            cwd: cmd.cwd.filter(|p| !p.as_os_str().is_empty()),
            envs: cmd.envs,
            env_file: cmd.env_file.filter(|p| !p.as_os_str().is_empty()),
            pattern,
        })
    }
}

/// Runtime configuration for [`crate::server::CommandServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    pub max_concurrency: usize,
    /// Upper bound on waiting for output to drain once a request is finishing.
    pub drain_timeout: Duration,
    pub commands: Vec<Arc<CommandDescriptor>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            commands: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Loads and validates a config file.
    pub fn from_file(path: &Path, bind_addr: SocketAddr) -> Result<Self> {
        let file = ConfigFile::load(path)?;
        Self::from_config_file(&file, bind_addr)
    }

    pub fn from_config_file(file: &ConfigFile, bind_addr: SocketAddr) -> Result<Self> {
        let commands = file.validate()?.into_iter().map(Arc::new).collect();
        Ok(Self {
            bind_addr,
            max_concurrency: file.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
            drain_timeout: Duration::from_secs(
                file.drain_timeout_secs.unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS),
            ),
            commands,
        })
    }
}
