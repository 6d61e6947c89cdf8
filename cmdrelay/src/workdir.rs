//! Working-directory resolution for command subprocesses.

use crate::config::CommandDescriptor;
use crate::error::CommandError;
use std::{io::ErrorKind, path::PathBuf};

/// Returns the directory the subprocess should start in.
///
/// Without a configured cwd this is the server's own working directory. A
/// configured cwd is checked on every request, since it may have been removed
/// or replaced after startup.
pub async fn resolve_working_dir(descriptor: &CommandDescriptor) -> Result<PathBuf, CommandError> {
    let Some(cwd) = &descriptor.cwd else {
        return std::env::current_dir().map_err(CommandError::CurrentDir);
    };

    match tokio::fs::metadata(cwd).await {
        Ok(meta) if meta.is_dir() => Ok(cwd.clone()),
        Ok(_) => Err(CommandError::CwdNotDirectory(cwd.clone())),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(CommandError::CwdNotFound(cwd.clone())),
        Err(source) => Err(CommandError::CwdUnavailable {
            path: cwd.clone(),
            source,
        }),
    }
}
