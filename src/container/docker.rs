use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use tokio_util::io::StreamReader;

use crate::config::ContainerConfig;

use super::{ContainerExec, ContainerHandle, ContainerStatus, ExecError, ExecHandle, ExecStream};

/// Bound on container API calls that could otherwise hang
const INSPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Docker-backed exec adapter. Talks to the engine API for one named
/// sandbox container; never creates or starts it.
pub struct DockerExec {
    docker: Docker,
    container_name: String,
}

impl DockerExec {
    pub fn connect(cfg: &ContainerConfig) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            container_name: cfg.name.clone(),
        })
    }

    async fn inspect(&self) -> Result<(Option<String>, String, bool), ExecError> {
        let inspect = tokio::time::timeout(
            INSPECT_TIMEOUT,
            self.docker.inspect_container(
                &self.container_name,
                None::<bollard::query_parameters::InspectContainerOptions>,
            ),
        )
        .await
        .map_err(|_| ExecError::NotReady("container inspect timed out".to_string()))?;

        match inspect {
            Ok(info) => {
                let state = info.state.as_ref();
                let running = state.and_then(|s| s.running).unwrap_or(false);
                let status = state
                    .and_then(|s| s.status.clone())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Ok((info.id, status, running))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(ExecError::NotReady(format!(
                "container '{}' not found",
                self.container_name
            ))),
            Err(e) => Err(ExecError::NotReady(e.to_string())),
        }
    }
}

#[async_trait]
impl ContainerExec for DockerExec {
    async fn ensure_running(&self) -> Result<ContainerHandle, ExecError> {
        let (id, status, running) = self.inspect().await?;
        if !running {
            return Err(ExecError::NotReady(format!(
                "container '{}' is {}",
                self.container_name, status
            )));
        }
        let id = id.ok_or_else(|| ExecError::NotReady("container has no id".to_string()))?;
        Ok(ContainerHandle { id })
    }

    async fn create_exec(
        &self,
        container: &ContainerHandle,
        argv: &[String],
        user: &str,
        env: &[(String, String)],
    ) -> Result<ExecHandle, ExecError> {
        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            cmd: Some(argv.to_vec()),
            user: Some(user.to_string()),
            env: Some(env),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(&container.id, options)
            .await
            .map_err(|e| ExecError::Exec(format!("create exec: {}", e)))?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ExecError::Exec(format!("start exec: {}", e)))?;

        let StartExecResults::Attached { input, output } = started else {
            return Err(ExecError::Exec("exec started detached".to_string()));
        };

        // Adapt the engine's multiplexed output stream to a plain byte reader
        let reader = StreamReader::new(output.map(|item| {
            item.map(LogOutput::into_bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        }));

        tracing::info!(
            container = %container.id,
            exec = %created.id,
            "Created TTY exec"
        );

        Ok(ExecHandle {
            exec_id: created.id,
            stream: ExecStream {
                input: Box::new(input),
                output: Box::new(reader),
            },
        })
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), ExecError> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| ExecError::Exec(format!("resize exec: {}", e)))
    }

    async fn status(&self) -> ContainerStatus {
        match self.inspect().await {
            Ok((id, status, running)) => ContainerStatus {
                status,
                running,
                container_id: id,
            },
            Err(ExecError::NotReady(reason)) => {
                tracing::debug!(reason = %reason, "Container status probe failed");
                ContainerStatus {
                    status: "not_found".to_string(),
                    running: false,
                    container_id: None,
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Container status probe failed");
                ContainerStatus {
                    status: "error".to_string(),
                    running: false,
                    container_id: None,
                }
            }
        }
    }
}
