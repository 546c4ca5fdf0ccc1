//! Nerve daemon: binds the Unix socket, TCP, and HTTP transports over
//! `nerve`'s command plane, owns the bookkeeping files, and drives graceful
//! shutdown (spec.md §4.6, §6).

pub mod bookkeeping;
pub mod envelope;
pub mod http;
pub mod tcp;
pub mod unix;

use std::sync::Arc;

use nerve::command::SessionManager;

/// Which additional transports to bind alongside the always-on Unix socket
/// (spec.md §6 "Three interchangeable transports").
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub tcp_addr: Option<String>,
    pub http_addr: Option<String>,
}

/// A running daemon instance: owns the session manager and every bound
/// transport task, and removes its bookkeeping files on `shutdown`.
pub struct Daemon {
    name: String,
    manager: Arc<SessionManager>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Daemon {
    /// Binds every configured transport and writes bookkeeping files
    /// (spec.md §6 "Daemon bookkeeping files"). Fails if a daemon of the same
    /// name is already running.
    pub async fn start(name: impl Into<String>, config: DaemonConfig) -> std::io::Result<Self> {
        let name = name.into();
        if bookkeeping::is_running(&name) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("daemon '{name}' is already running"),
            ));
        }

        let manager = Arc::new(SessionManager::new(name.clone()));
        manager.create_session("default");
        bookkeeping::write_pid_file(&name)?;

        let mut tasks = Vec::new();

        let socket_path = bookkeeping::socket_path(&name);
        let unix_manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = unix::serve(unix_manager, socket_path).await {
                tracing::error!("unix transport stopped: {e}");
            }
        }));

        if let Some(addr) = &config.tcp_addr {
            let listener = tcp::bind(addr).await?;
            let bound = listener.local_addr()?;
            bookkeeping::write_tcp_sidecar(&name, &bound.to_string())?;
            let tcp_manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = tcp::serve(tcp_manager, listener).await {
                    tracing::error!("tcp transport stopped: {e}");
                }
            }));
        }

        if let Some(addr) = &config.http_addr {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            let bound = listener.local_addr()?;
            bookkeeping::write_http_sidecar(&name, &bound.to_string())?;
            let router = http::router(manager.clone());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    tracing::error!("http transport stopped: {e}");
                }
            }));
        }

        tracing::info!(daemon = %name, "nerve daemon started");
        Ok(Self { name, manager, tasks })
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        self.manager.clone()
    }

    /// Sets the shutting-down flag, drains via the manager's own shutdown
    /// (stops every session's runs and nodes), aborts transport tasks, and
    /// removes bookkeeping files (spec.md §4.6 "Graceful shutdown").
    pub async fn shutdown(mut self) {
        self.manager.shutdown().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        bookkeeping::cleanup(&self.name);
        tracing::info!(daemon = %self.name, "nerve daemon stopped");
    }

    /// Blocks until Ctrl-C or a `STOP` command flips the manager's
    /// shutting-down flag, then runs `shutdown`.
    pub async fn wait_for_shutdown(self) {
        loop {
            if self.manager.is_shutting_down() {
                break;
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
            }
        }
        self.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn daemon_serves_ping_over_unix_socket() {
        let name = format!("test-{}", uuid::Uuid::new_v4());
        let daemon = Daemon::start(&name, DaemonConfig::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let socket_path = bookkeeping::socket_path(&name);
        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        stream.write_all(b"{\"id\":\"1\",\"type\":\"PING\",\"params\":{}}\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(&mut stream).read_line(&mut line).await.unwrap();
        let response: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["success"], serde_json::json!(true));

        daemon.shutdown().await;
        assert!(!bookkeeping::pid_path(&name).exists());
    }

    #[test]
    fn second_start_is_rejected_while_pid_file_present() {
        let name = format!("test-dup-{}", uuid::Uuid::new_v4());
        bookkeeping::write_pid_file(&name).unwrap();
        assert!(bookkeeping::is_running(&name));
        bookkeeping::cleanup(&name);
    }
}
