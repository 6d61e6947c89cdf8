//! Error types for the command relay

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::path::PathBuf;
use thiserror::Error;

/// Failures scoped to a single request.
///
/// None of these are fatal to the server. They are reported to the caller
/// before the response status is committed, so each one maps to an HTTP status.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("cannot open env file {}: {source}", path.display())]
    EnvFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cwd not found: {}", .0.display())]
    CwdNotFound(PathBuf),

    #[error("cwd is not directory: {}", .0.display())]
    CwdNotDirectory(PathBuf),

    #[error("cannot stat cwd {}: {source}", path.display())]
    CwdUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot determine server working directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("subprocess {0} pipe was not captured")]
    MissingOutput(&'static str),

    #[error("too many processes: {in_flight} running, ceiling is {ceiling}")]
    AdmissionRejected { in_flight: usize, ceiling: usize },
}

impl CommandError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::TOO_MANY_REQUESTS {
            // Rejected requests carry no body.
            return status.into_response();
        }
        (status, format!("failed to start command: {self}\n")).into_response()
    }
}

/// Failures that abort server startup.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to decode yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to decode toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unrecognized config extension: {0:?}")]
    UnsupportedFormat(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Serve(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
