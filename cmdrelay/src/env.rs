//! Environment builder for command subprocesses.
//!
//! The final environment is layered, lowest precedence first:
//!
//! 1. the environment inherited by the server process,
//! 2. the command's env file, if configured,
//! 3. the command's static `envs` overrides.
//!
//! A later layer replaces any earlier value for the same key.

use crate::config::CommandDescriptor;
use crate::error::CommandError;
use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    path::Path,
};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};
use tracing::debug;

/// The variable set handed to one subprocess. Built fresh per request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnvironment {
    vars: BTreeMap<OsString, OsString>,
}

impl ResolvedEnvironment {
    /// Starts from an inherited variable set, usually `std::env::vars_os()`.
    pub fn inherit<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(OsString::as_os_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// Overlays `KEY=VALUE` lines from an env file.
    ///
    /// Lines without `=` are ignored, as are lines with an empty key. The first
    /// read error, including invalid UTF-8, ends the file as if it were EOF.
    /// Only a failure to open the file is reported.
    pub async fn apply_env_file(&mut self, path: &Path) -> Result<usize, CommandError> {
        let file = File::open(path)
            .await
            .map_err(|source| CommandError::EnvFile {
                path: path.to_path_buf(),
                source,
            })?;

        let mut lines = BufReader::new(file).lines();
        let mut applied = 0;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(path = %path.display(), "env file truncated at read error: {}", e);
                    break;
                }
            };

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            self.set(key, value);
            applied += 1;
        }

        Ok(applied)
    }

    pub fn apply_overrides<'a>(
        &mut self,
        overrides: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) {
        for (key, value) in overrides {
            self.set(key, value);
        }
    }
}

/// Builds the environment for `descriptor` on top of `inherited`.
pub async fn build_environment<I, K, V>(
    descriptor: &CommandDescriptor,
    inherited: I,
) -> Result<ResolvedEnvironment, CommandError>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<OsString>,
    V: Into<OsString>,
{
    let mut env = ResolvedEnvironment::inherit(inherited);

    if let Some(env_file) = &descriptor.env_file {
        let applied = env.apply_env_file(env_file).await?;
        debug!(env_file = %env_file.display(), applied, "loaded env file");
    }

    env.apply_overrides(&descriptor.envs);
    debug!(vars = env.len(), "built environment");
    Ok(env)
}
