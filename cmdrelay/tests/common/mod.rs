#![allow(dead_code)]

use cmdrelay::{AppState, CommandConfig, CommandDescriptor, CommandServer, ServerConfig};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle};

pub fn command(path: &str, argv: &[&str]) -> CommandConfig {
    CommandConfig {
        path: path.to_string(),
        cmd: argv.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn sh(path: &str, script: &str) -> CommandConfig {
    command(path, &["sh", "-c", script])
}

/// A server on a random local port, stopped when dropped.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(commands: Vec<CommandConfig>, max_concurrency: usize) -> Self {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_concurrency,
            drain_timeout: Duration::from_secs(5),
            commands: commands
                .into_iter()
                .map(|c| Arc::new(CommandDescriptor::try_from(c).unwrap()))
                .collect(),
        };
        let server = CommandServer::bind(config).await.unwrap();
        let addr = server.local_addr();
        let state = server.state();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            server
                .serve(async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            state,
            stop: Some(stop),
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Polls until no request holds an admission slot.
    pub async fn wait_idle(&self) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while self.state.coordinator.in_flight() != 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "in-flight count stuck at {}",
                self.state.coordinator.in_flight()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.abort();
    }
}

/// True while `/proc/<pid>` exists and is not a zombie.
#[cfg(target_os = "linux")]
pub fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}
