//! # Request Coordinator
//!
//! Runs one whitelisted command for one HTTP request and streams its output
//! back. Each request moves through a fixed sequence of phases:
//!
//! ```text
//! Admitted → EnvBuilding → Spawning → Streaming → Finalizing → Done
//! ```
//!
//! Any phase before `Streaming` can jump straight to `Done` with an error
//! status (429 or 500). Once the subprocess is running the response status is
//! committed to 200, and everything after that is reported in the body.
//!
//! ## Streaming
//!
//! The response body is fed by two relay loops (stdout and stderr). Alongside
//! them the coordinator waits on a single cancellation point: the first of
//! process exit and client disconnect (the body being dropped by hyper) decides
//! the [`CancellationCause`].
//!
//! ## Finalizing
//!
//! Whatever the cause, the subprocess is terminated if still alive and both
//! relay loops are drained, so output racing the exit notification is not
//! lost. Draining is bounded by the configured drain timeout; a grandchild that
//! inherited the pipes and keeps them open cannot pin the request forever.
//! Only then is the trailing `Exit with error: <code>` line written, for
//! non-zero exits.
//!
//! The admission permit and the process handle are owned by the request, so
//! the in-flight slot is released and the subprocess killed on every exit
//! path, including panics and aborted futures.

use crate::{
    admission::{AdmissionGate, AdmissionPermit},
    config::CommandDescriptor,
    env::build_environment,
    error::CommandError,
    process::{self, ProcessHandle, exit_code},
    relay::{OUTPUT_CHANNEL_CAPACITY, OutputSink, StreamKind, output_channel, relay_lines},
    workdir::resolve_working_dir,
};
use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::{
    fmt,
    process::ExitStatus,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    process::{ChildStderr, ChildStdout},
    task::JoinSet,
};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Lifecycle phase of a command request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Admitted,
    EnvBuilding,
    Spawning,
    Streaming,
    Finalizing,
    Done,
}

/// Why a streaming request stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationCause {
    /// The subprocess exited with status 0.
    Exited,
    /// The subprocess exited with a non-zero status or was killed by a signal.
    ExitedWithError { code: i32 },
    /// The response was dropped before the subprocess exited.
    ClientDisconnected,
}

impl CancellationCause {
    pub fn from_exit_status(status: &ExitStatus) -> Self {
        if status.success() {
            Self::Exited
        } else {
            Self::ExitedWithError {
                code: exit_code(status),
            }
        }
    }

    /// The in-band status line appended to the body, if any.
    pub fn trailer(&self) -> Option<String> {
        match self {
            Self::ExitedWithError { code } => Some(format!("Exit with error: {code}")),
            Self::Exited | Self::ClientDisconnected => None,
        }
    }
}

impl fmt::Display for CancellationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited => f.write_str("exited"),
            Self::ExitedWithError { code } => write!(f, "exited with error {code}"),
            Self::ClientDisconnected => f.write_str("client disconnected"),
        }
    }
}

/// Per-request state carried through the phases.
#[derive(Debug)]
pub struct RequestContext {
    pub seq: u64,
    pub path: String,
    phase: RequestPhase,
}

impl RequestContext {
    pub fn new(seq: u64, path: impl Into<String>) -> Self {
        Self {
            seq,
            path: path.into(),
            phase: RequestPhase::Admitted,
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    fn advance(&mut self, next: RequestPhase) {
        debug!(seq = self.seq, path = %self.path, from = ?self.phase, to = ?next, "request phase");
        self.phase = next;
    }
}

/// A spawned command whose pipes have not been handed to the relay yet.
struct Launched {
    process: ProcessHandle,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

/// Shared, process-wide coordinator for all command routes.
#[derive(Debug)]
pub struct Coordinator {
    gate: Arc<AdmissionGate>,
    sequence: AtomicU64,
    spawned: AtomicU64,
    drain_timeout: Duration,
}

impl Coordinator {
    pub fn new(max_concurrency: usize, drain_timeout: Duration) -> Self {
        Self {
            gate: Arc::new(AdmissionGate::new(max_concurrency)),
            sequence: AtomicU64::new(0),
            spawned: AtomicU64::new(0),
            drain_timeout,
        }
    }

    /// Requests currently holding an admission slot.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub fn max_concurrency(&self) -> usize {
        self.gate.ceiling()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Total subprocesses started since the server came up.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Total command requests received, admitted or not.
    pub fn request_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Runs `descriptor` for one request.
    ///
    /// The returned response is either an error status or a 200 whose body
    /// streams the command's output from a background task.
    pub async fn execute(&self, descriptor: Arc<CommandDescriptor>) -> Response {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let span = info_span!("request", seq, path = %descriptor.path);
        self.admit_and_start(seq, descriptor).instrument(span).await
    }

    async fn admit_and_start(&self, seq: u64, descriptor: Arc<CommandDescriptor>) -> Response {
        info!("request received");
        let mut ctx = RequestContext::new(seq, descriptor.path.as_str());

        let permit = match self.gate.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                warn!("{}", e);
                ctx.advance(RequestPhase::Done);
                return e.into_response();
            }
        };

        let launched = match self.launch(&mut ctx, &descriptor).await {
            Ok(launched) => launched,
            Err(e) => {
                error!(phase = ?ctx.phase(), "failed to start command: {}", e);
                ctx.advance(RequestPhase::Done);
                return e.into_response();
            }
        };

        ctx.advance(RequestPhase::Streaming);
        let (sink, receiver) = output_channel(OUTPUT_CHANNEL_CAPACITY);
        tokio::spawn(
            stream_until_done(ctx, launched, sink, permit, self.drain_timeout).in_current_span(),
        );

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
            .body(receiver.into_body())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    async fn launch(
        &self,
        ctx: &mut RequestContext,
        descriptor: &CommandDescriptor,
    ) -> Result<Launched, CommandError> {
        ctx.advance(RequestPhase::EnvBuilding);
        // Collected up front: `VarsOs` is not `Send` and must not live across an await.
        let inherited: Vec<_> = std::env::vars_os().collect();
        let env = build_environment(descriptor, inherited).await?;
        let cwd = resolve_working_dir(descriptor).await?;

        ctx.advance(RequestPhase::Spawning);
        let mut process = process::spawn(&descriptor.argv, &env, &cwd)?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        info!(program = %process.program(), pid = ?process.pid(), "command started");

        let (stdout, stderr) = process.take_output()?;
        Ok(Launched {
            process,
            stdout,
            stderr,
        })
    }
}

/// Streams a launched command to completion and finalizes the response.
async fn stream_until_done(
    mut ctx: RequestContext,
    launched: Launched,
    sink: OutputSink,
    permit: AdmissionPermit,
    drain_timeout: Duration,
) -> CancellationCause {
    let Launched {
        mut process,
        stdout,
        stderr,
    } = launched;

    let mut relays = JoinSet::new();
    relays.spawn(relay_lines(stdout, StreamKind::Stdout, sink.clone()).in_current_span());
    relays.spawn(relay_lines(stderr, StreamKind::Stderr, sink.clone()).in_current_span());

    let cause = tokio::select! {
        status = process.wait() => match status {
            Ok(status) => {
                debug!(?status, "subprocess exited");
                CancellationCause::from_exit_status(&status)
            }
            Err(e) => {
                error!("failed to wait for subprocess: {}", e);
                CancellationCause::ExitedWithError { code: -1 }
            }
        },
        _ = sink.closed() => CancellationCause::ClientDisconnected,
    };

    ctx.advance(RequestPhase::Finalizing);
    match process.terminate().await {
        Ok(true) => info!(pid = ?process.pid(), "subprocess killed"),
        Ok(false) => {}
        Err(e) => warn!(pid = ?process.pid(), "failed to kill subprocess: {}", e),
    }

    let mut lines = 0;
    let mut bytes = 0;
    let drained = tokio::time::timeout(drain_timeout, async {
        while let Some(joined) = relays.join_next().await {
            match joined {
                Ok(stats) => {
                    lines += stats.lines;
                    bytes += stats.bytes;
                }
                Err(e) => warn!("relay task failed: {}", e),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            timeout_ms = drain_timeout.as_millis() as u64,
            "output did not drain in time, dropping the rest"
        );
        relays.shutdown().await;
    }

    if let Some(trailer) = cause.trailer() {
        info!(pid = ?process.pid(), "{}", trailer);
        sink.write_line(trailer.as_bytes()).await;
    }

    ctx.advance(RequestPhase::Done);
    match cause {
        CancellationCause::Exited => info!(lines, bytes, "request completed"),
        CancellationCause::ExitedWithError { .. } => {
            info!(lines, bytes, outcome = %cause, "request completed")
        }
        CancellationCause::ClientDisconnected => info!(lines, bytes, "connection canceled"),
    }

    // Release the slot before the body ends, so a client that sees the end
    // of the response can immediately be admitted again.
    drop(permit);
    drop(sink);
    cause
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CommandConfig;
    use tempfile::TempDir;

    fn descriptor(path: &str, argv: &[&str]) -> Arc<CommandDescriptor> {
        Arc::new(
            CommandDescriptor::try_from(CommandConfig {
                path: path.to_string(),
                cmd: argv.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn sh(script: &str) -> Arc<CommandDescriptor> {
        descriptor("/sh", &["sh", "-c", script])
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn coordinator(ceiling: usize) -> Coordinator {
        Coordinator::new(ceiling, Duration::from_secs(5))
    }

    #[test]
    fn trailer_only_for_error_exits() {
        assert_eq!(CancellationCause::Exited.trailer(), None);
        assert_eq!(CancellationCause::ClientDisconnected.trailer(), None);
        assert_eq!(
            CancellationCause::ExitedWithError { code: 7 }.trailer().as_deref(),
            Some("Exit with error: 7")
        );
    }

    #[tokio::test]
    async fn echo_streams_output_without_trailer() {
        let coordinator = coordinator(1);
        let response = coordinator.execute(descriptor("/echo", &["echo", "hi"])).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hi\n");
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(coordinator.spawn_count(), 1);
    }

    #[tokio::test]
    async fn non_zero_exit_appends_single_trailer() {
        let coordinator = coordinator(1);
        let response = coordinator.execute(sh("echo out; echo err >&2; exit 42")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[..2].contains(&"out"));
        assert!(lines[..2].contains(&"err"));
        assert_eq!(lines[2], "Exit with error: 42");
        assert_eq!(body.matches("Exit with error").count(), 1);
    }

    #[tokio::test]
    async fn output_written_just_before_exit_is_not_lost() {
        let coordinator = coordinator(1);
        let script = "i=0; while [ $i -lt 500 ]; do echo out-$i; echo err-$i >&2; i=$((i+1)); done";
        let body = body_text(coordinator.execute(sh(script)).await).await;

        assert_eq!(body.lines().count(), 1000);
        for i in 0..500 {
            assert!(body.contains(&format!("out-{i}\n")));
            assert!(body.contains(&format!("err-{i}\n")));
        }
    }

    #[tokio::test]
    async fn missing_cwd_is_500_and_releases_slot() {
        let dir = TempDir::new().unwrap();
        let descriptor = Arc::new(
            CommandDescriptor::try_from(CommandConfig {
                path: "/pwd".to_string(),
                cmd: vec!["pwd".to_string()],
                cwd: Some(dir.path().join("missing")),
                ..Default::default()
            })
            .unwrap(),
        );

        let coordinator = coordinator(1);
        let response = coordinator.execute(descriptor).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("cwd not found"));
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(coordinator.spawn_count(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_is_500_and_releases_slot() {
        let coordinator = coordinator(1);
        let response = coordinator.execute(descriptor("/nope", &["/no/such/binary"])).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("/no/such/binary"));
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn ceiling_rejects_without_spawning() {
        let coordinator = coordinator(1);
        let first = coordinator.execute(sh("sleep 30")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(coordinator.in_flight(), 1);

        let second = coordinator.execute(descriptor("/echo", &["echo", "hi"])).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(body_text(second).await.is_empty());
        assert_eq!(coordinator.spawn_count(), 1);
        assert_eq!(coordinator.request_count(), 2);

        // Dropping the first body is a client disconnect.
        drop(first);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while coordinator.in_flight() != 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn placeholder_routes_run_their_argv_unchanged() {
        let coordinator = coordinator(1);
        let response = coordinator
            .execute(descriptor("/greet/{name}", &["echo", "hello {name}"]))
            .await;
        assert_eq!(body_text(response).await, "hello {name}\n");
    }

    #[test]
    fn execute_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let coordinator = coordinator(1);
        let future = coordinator.execute(descriptor("/echo", &["echo", "hi"]));
        assert_send(&future);
    }

    #[tokio::test]
    async fn drain_timeout_bounds_a_grandchild_holding_the_pipe() {
        let coordinator = Coordinator::new(1, Duration::from_millis(300));
        // The background sleep inherits stdout and outlives its parent shell.
        let response = coordinator.execute(sh("echo started; sleep 30 & exit 0")).await;

        let body = tokio::time::timeout(Duration::from_secs(10), body_text(response))
            .await
            .expect("request should finish after the drain timeout");
        assert_eq!(body, "started\n");
        assert_eq!(coordinator.in_flight(), 0);
    }
}
