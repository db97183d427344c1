pub mod docker;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors from the container exec adapter
#[derive(Debug, Error)]
pub enum ExecError {
    /// The sandbox container is absent or not in the running state. The
    /// bridge never creates containers; that is external tooling's job.
    #[error("container not ready: {0}")]
    NotReady(String),

    #[error("exec failed: {0}")]
    Exec(String),
}

/// Handle to a running sandbox container
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
}

/// A live TTY exec: its id and the attached byte stream
pub struct ExecHandle {
    pub exec_id: String,
    pub stream: ExecStream,
}

/// Bidirectional byte stream to a PTY exec, split into halves so the
/// dispatch loop and the reader task can own them independently.
pub struct ExecStream {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub output: Box<dyn AsyncRead + Send + Unpin>,
}

/// Container status as reported to the health endpoints
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerStatus {
    pub status: String,
    pub running: bool,
    pub container_id: Option<String>,
}

/// Contract over the container runtime. The core only ever asks for a
/// running container handle and execs inside it.
#[async_trait]
pub trait ContainerExec: Send + Sync {
    /// Return a handle to the running sandbox container, or `NotReady`.
    async fn ensure_running(&self) -> Result<ContainerHandle, ExecError>;

    /// Create and start a TTY exec with stdin/stdout/stderr attached.
    async fn create_exec(
        &self,
        container: &ContainerHandle,
        argv: &[String],
        user: &str,
        env: &[(String, String)],
    ) -> Result<ExecHandle, ExecError>;

    /// Resize an exec's TTY. Best-effort; callers log failures.
    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), ExecError>;

    /// Current container state for health reporting.
    async fn status(&self) -> ContainerStatus;
}

/// Environment every session exec gets
pub fn default_exec_env() -> Vec<(String, String)> {
    vec![
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
        ("LC_ALL".to_string(), "en_US.UTF-8".to_string()),
    ]
}
