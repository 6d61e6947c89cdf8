//! HTTP front end: one route per whitelisted command plus the command listing.

use crate::{
    config::{CommandDescriptor, ServerConfig},
    coordinator::Coordinator,
    error::{Result, ServerError},
};
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::any,
};
use std::{
    future::{Future, IntoFuture},
    net::SocketAddr,
    sync::Arc,
};
use tokio::{net::TcpListener, signal, sync::Notify};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// State shared by every route.
#[derive(Debug)]
pub struct AppState {
    pub coordinator: Coordinator,
    commands: Vec<Arc<CommandDescriptor>>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            coordinator: Coordinator::new(config.max_concurrency, config.drain_timeout),
            commands: config.commands.clone(),
        }
    }

    pub fn commands(&self) -> &[Arc<CommandDescriptor>] {
        &self.commands
    }
}

/// Builds the router: every configured command on its own path, and the
/// listing on everything else.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new();

    for descriptor in state.commands() {
        let descriptor = Arc::clone(descriptor);
        let route = descriptor.path.clone();
        // Placeholder segments only widen what matches; the argv is fixed.
        router = router.route(
            &route,
            any(move |State(state): State<Arc<AppState>>| {
                let descriptor = Arc::clone(&descriptor);
                async move { state.coordinator.execute(descriptor).await }
            }),
        );
    }

    router
        .fallback(list_commands)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Lists the configured command paths, one per line, in config order.
async fn list_commands(State(state): State<Arc<AppState>>) -> Response {
    let body: String = state
        .commands()
        .iter()
        .map(|descriptor| format!("{}\n", descriptor.path))
        .collect();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

/// A bound, not yet serving, command server.
pub struct CommandServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<AppState>,
}

impl CommandServer {
    /// Binds the listener. Port 0 picks a free port; see [`Self::local_addr`].
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(AppState::new(&config));
        Ok(Self {
            listener,
            local_addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Serves until `shutdown` resolves.
    ///
    /// After shutdown, in-flight commands get one drain timeout to finish
    /// before the server stops waiting for them.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let grace = self.state.coordinator.drain_timeout();
        let stopping = Arc::new(Notify::new());
        let notify = Arc::clone(&stopping);

        let app = build_router(Arc::clone(&self.state));
        let serving = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                notify.notify_one();
            })
            .into_future();

        tokio::select! {
            result = serving => result.map_err(|e| ServerError::Serve(e.to_string())),
            _ = async {
                stopping.notified().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(
                    in_flight = self.state.coordinator.in_flight(),
                    "commands still running after shutdown grace period, stopping anyway"
                );
                Ok(())
            }
        }
    }
}

/// Binds and serves `config` until SIGINT or SIGTERM.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    info!("Starting command server on {}", config.bind_addr);

    if !config.bind_addr.ip().is_loopback() {
        warn!(
            "Command server bound to non-loopback address {}. \
             There is no authentication; restrict access via firewall or reverse proxy.",
            config.bind_addr
        );
    }

    let server = CommandServer::bind(config).await?;
    let state = server.state();
    info!(
        commands = state.commands().len(),
        max_concurrency = state.coordinator.max_concurrency(),
        "Command server listening on http://{}",
        server.local_addr()
    );
    for descriptor in state.commands() {
        info!(
            path = %descriptor.path,
            program = %descriptor.program(),
            placeholders = ?descriptor.pattern.placeholders().collect::<Vec<_>>(),
            "registered command"
        );
    }

    server.serve(shutdown_signal()).await?;
    info!("Command server stopped");
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CommandConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn command(path: &str, argv: &[&str]) -> CommandConfig {
        CommandConfig {
            path: path.to_string(),
            cmd: argv.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn state_for(commands: Vec<CommandConfig>, max_concurrency: usize) -> Arc<AppState> {
        let config = ServerConfig {
            max_concurrency,
            drain_timeout: Duration::from_secs(5),
            commands: commands
                .into_iter()
                .map(|c| Arc::new(CommandDescriptor::try_from(c).unwrap()))
                .collect(),
            ..Default::default()
        };
        Arc::new(AppState::new(&config))
    }

    async fn get(state: &Arc<AppState>, uri: &str) -> (StatusCode, String) {
        let response = build_router(Arc::clone(state))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn echo_route_streams_output() {
        let state = state_for(vec![command("/echo", &["echo", "hi"])], 1);
        assert_eq!(get(&state, "/echo").await, (StatusCode::OK, "hi\n".to_string()));
        assert_eq!(state.coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn root_and_unknown_paths_list_commands_in_order() {
        let state = state_for(
            vec![
                command("/zeta", &["true"]),
                command("/alpha", &["true"]),
                command("/logs/{unit}", &["echo", "{unit}"]),
            ],
            1,
        );
        let listing = "/zeta\n/alpha\n/logs/{unit}\n".to_string();
        assert_eq!(get(&state, "/").await, (StatusCode::OK, listing.clone()));
        assert_eq!(get(&state, "/nope").await, (StatusCode::OK, listing));
        assert_eq!(state.coordinator.spawn_count(), 0);
    }

    #[tokio::test]
    async fn placeholder_route_runs_the_configured_argv() {
        let state = state_for(
            vec![command(
                "/logs/{unit}",
                &["sh", "-c", "echo \"$0\" \"$1\"", "{unit}", "$(id)"],
            )],
            1,
        );
        for uri in ["/logs/nginx", "/logs/%3Bid", "/logs/%24(id)"] {
            assert_eq!(
                get(&state, uri).await,
                (StatusCode::OK, "{unit} $(id)\n".to_string()),
                "{uri}"
            );
        }
        assert_eq!(state.coordinator.spawn_count(), 3);
    }

    #[tokio::test]
    async fn exit_code_is_reported_in_band() {
        let state = state_for(vec![command("/fail", &["sh", "-c", "echo partial; exit 3"])], 1);
        assert_eq!(
            get(&state, "/fail").await,
            (StatusCode::OK, "partial\nExit with error: 3\n".to_string())
        );
    }

    #[tokio::test]
    async fn missing_cwd_returns_500() {
        let dir = TempDir::new().unwrap();
        let state = state_for(
            vec![CommandConfig {
                cwd: Some(dir.path().join("does-not-exist")),
                ..command("/pwd", &["pwd"])
            }],
            1,
        );
        let (status, body) = get(&state, "/pwd").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("cwd not found"), "body was {body:?}");
        assert_eq!(state.coordinator.spawn_count(), 0);
        assert_eq!(state.coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn env_file_and_overrides_layer_in_order() {
        let dir = TempDir::new().unwrap();
        let env_file = dir.path().join("app.env");
        std::fs::write(&env_file, "A=2\nB=5\n").unwrap();

        let state = state_for(
            vec![CommandConfig {
                envs: [("A".to_string(), "3".to_string())].into_iter().collect(),
                env_file: Some(env_file),
                ..command("/env", &["sh", "-c", "echo $A $B"])
            }],
            1,
        );
        assert_eq!(get(&state, "/env").await, (StatusCode::OK, "3 5\n".to_string()));
    }

    #[tokio::test]
    async fn missing_env_file_returns_500() {
        let dir = TempDir::new().unwrap();
        let state = state_for(
            vec![CommandConfig {
                env_file: Some(dir.path().join("missing.env")),
                ..command("/env", &["env"])
            }],
            1,
        );
        let (status, body) = get(&state, "/env").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("failed to start command:"));
    }

    #[tokio::test]
    async fn second_request_over_ceiling_gets_429() {
        let state = state_for(
            vec![
                command("/slow", &["sleep", "30"]),
                command("/echo", &["echo", "hi"]),
            ],
            1,
        );

        let slow = build_router(Arc::clone(&state))
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(slow.status(), StatusCode::OK);

        assert_eq!(
            get(&state, "/echo").await,
            (StatusCode::TOO_MANY_REQUESTS, String::new())
        );
        assert_eq!(state.coordinator.spawn_count(), 1);

        drop(slow);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while state.coordinator.in_flight() != 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(get(&state, "/echo").await, (StatusCode::OK, "hi\n".to_string()));
    }

    #[tokio::test]
    async fn bind_reports_actual_port() {
        let server = CommandServer::bind(ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }
}
