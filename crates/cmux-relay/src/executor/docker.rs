use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{ExecTarget, ProbeOutcome, ProbeRunner, RemoteExecutor, INPUT_BUFFER_SIZE, TERM_ENV};
use crate::error::{
    classify_message, ErrorKind, ExecError, EXIT_COMMAND_NOT_FOUND, EXIT_PERMISSION_DENIED,
};
use crate::resize::TerminalSize;
use crate::session::{ReadOutcome, TerminalIo};

const EXIT_POLL_ATTEMPTS: usize = 10;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Output kept from the start of an exec to explain a failed start.
const OUTPUT_HEAD_LIMIT: usize = 1024;

type ExecOutput = Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>;

/// Runs terminal commands through `docker exec`.
pub struct DockerExecutor {
    docker: Docker,
}

impl DockerExecutor {
    pub async fn connect() -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to docker daemon")?;
        docker
            .ping()
            .await
            .context("docker daemon did not answer ping")?;
        info!("[docker] connected to daemon");
        Ok(Self { docker })
    }

    async fn resize(&self, exec_id: &str, size: TerminalSize) {
        let size = size.normalized();
        let options = ResizeExecOptions {
            height: size.height,
            width: size.width,
        };
        match self.docker.resize_exec(exec_id, options).await {
            Ok(()) => debug!("[docker] exec {} resized to {}", exec_id, size),
            Err(e) => warn!("[docker] failed to resize exec {}: {}", exec_id, e),
        }
    }

    async fn forward_resizes(&self, exec_id: &str, io: &dyn TerminalIo) {
        while let Some(size) = io.size_changed().await {
            self.resize(exec_id, size).await;
        }
    }
}

#[async_trait]
impl RemoteExecutor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn stream(
        &self,
        target: &ExecTarget,
        command: &[String],
        io: Arc<dyn TerminalIo>,
    ) -> Result<(), ExecError> {
        let options = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            env: Some(
                TERM_ENV
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect(),
            ),
            cmd: Some(command.to_vec()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&target.name, options)
            .await
            .map_err(exec_error)?;
        debug!("[docker:{}] exec {} created for {:?}", target, exec.id, command);

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(exec_error)?;
        let (output, mut input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(ExecError::Other("exec started detached".to_string()))
            }
        };

        if let Some(size) = io.next_size() {
            self.resize(&exec.id, size).await;
        }

        // Input and resize pumps run until the output stream ends, which is
        // when the remote process exits.
        let pumps = async {
            tokio::join!(
                forward_input(io.as_ref(), &mut input),
                self.forward_resizes(&exec.id, io.as_ref())
            );
            std::future::pending::<()>().await
        };
        let head = tokio::select! {
            head = forward_output(output, io.as_ref()) => head?,
            _ = pumps => Vec::new(),
        };

        match exit_code(&self.docker, &exec.id).await? {
            Some(0) | None => Ok(()),
            Some(code) => Err(ExecError::Exited {
                code: start_failure_code(code, &head),
            }),
        }
    }

    fn prober(&self, target: &ExecTarget) -> Option<Arc<dyn ProbeRunner>> {
        Some(Arc::new(DockerProbe {
            docker: self.docker.clone(),
            container: target.name.clone(),
        }))
    }
}

/// Runs detection probes as non-interactive execs in one container.
pub struct DockerProbe {
    docker: Docker,
    container: String,
}

impl DockerProbe {
    async fn run(&self, argv: &[String]) -> Result<Option<i64>, ExecError> {
        let mut head = Vec::new();
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(argv.to_vec()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&self.container, options)
            .await
            .map_err(exec_error)?;

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(exec_error)?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(exec_error)? {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => keep_head(&mut head, &message),
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        Ok(exit_code(&self.docker, &exec.id)
            .await?
            .map(|code| start_failure_code(code, &head)))
    }
}

#[async_trait]
impl ProbeRunner for DockerProbe {
    async fn run_probe(&self, argv: &[String], timeout: Duration) -> ProbeOutcome {
        match tokio::time::timeout(timeout, self.run(argv)).await {
            Ok(Ok(Some(code))) => ProbeOutcome::Exited(code),
            Ok(Ok(None)) => ProbeOutcome::Failed("exit code unavailable".to_string()),
            Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
            Err(_) => ProbeOutcome::TimedOut,
        }
    }
}

/// Relay exec output to the terminal. Returns the first bytes of output.
async fn forward_output(mut output: ExecOutput, io: &dyn TerminalIo) -> Result<Vec<u8>, ExecError> {
    let mut head = Vec::new();
    while let Some(chunk) = output.next().await {
        match chunk.map_err(exec_error)? {
            LogOutput::StdOut { message }
            | LogOutput::StdErr { message }
            | LogOutput::Console { message } => {
                keep_head(&mut head, &message);
                io.write(&message).await?;
            }
            LogOutput::StdIn { .. } => {}
        }
    }
    Ok(head)
}

fn keep_head(head: &mut Vec<u8>, data: &[u8]) {
    let room = OUTPUT_HEAD_LIMIT.saturating_sub(head.len());
    head.extend_from_slice(&data[..data.len().min(room)]);
}

/// The daemon reports 126 both for a binary it could not run and for one
/// that does not exist; the runtime's message tells them apart.
fn start_failure_code(code: i64, output: &[u8]) -> i64 {
    if code == EXIT_PERMISSION_DENIED
        && classify_message(&String::from_utf8_lossy(output)) == ErrorKind::CommandNotFound
    {
        EXIT_COMMAND_NOT_FOUND
    } else {
        code
    }
}

async fn forward_input<W>(io: &dyn TerminalIo, input: &mut W)
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0u8; INPUT_BUFFER_SIZE];
    loop {
        let data = match io.read(&mut buf).await {
            Ok(ReadOutcome::Data(n)) => &buf[..n],
            Ok(ReadOutcome::Resized) => continue,
            Ok(ReadOutcome::Eof(n)) => {
                let _ = input.write_all(&buf[..n]).await;
                let _ = input.flush().await;
                break;
            }
            Err(_) => break,
        };
        if let Err(e) = input.write_all(data).await {
            warn!("[docker] failed to write exec stdin: {}", e);
            break;
        }
        if let Err(e) = input.flush().await {
            warn!("[docker] failed to flush exec stdin: {}", e);
            break;
        }
    }
}

/// The exit code can lag the end of the output stream slightly.
async fn exit_code(docker: &Docker, exec_id: &str) -> Result<Option<i64>, ExecError> {
    for _ in 0..EXIT_POLL_ATTEMPTS {
        let inspect = docker.inspect_exec(exec_id).await.map_err(exec_error)?;
        if inspect.running != Some(true) {
            return Ok(inspect.exit_code);
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    Ok(None)
}

fn exec_error(err: bollard::errors::Error) -> ExecError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 409,
            message,
        } => ExecError::TargetUnavailable(message),
        bollard::errors::Error::DockerResponseServerError { message, .. } => {
            ExecError::Other(message)
        }
        other => ExecError::Other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_reported_as_not_found() {
        let output = b"OCI runtime exec failed: exec failed: unable to start container process: \
exec: \"bash\": executable file not found in $PATH: unknown\r\n";
        assert_eq!(start_failure_code(126, output), EXIT_COMMAND_NOT_FOUND);
        assert_eq!(
            ExecError::Exited {
                code: start_failure_code(126, output)
            }
            .kind(),
            ErrorKind::CommandNotFound
        );

        let denied = b"exec: \"/bin/sh\": permission denied\r\n";
        assert_eq!(start_failure_code(126, denied), EXIT_PERMISSION_DENIED);
        assert_eq!(start_failure_code(126, b""), EXIT_PERMISSION_DENIED);
        assert_eq!(start_failure_code(2, output), 2);
    }

    #[test]
    fn test_output_head_is_bounded() {
        let mut head = Vec::new();
        keep_head(&mut head, &[b'a'; 1000]);
        keep_head(&mut head, &[b'b'; 1000]);
        assert_eq!(head.len(), OUTPUT_HEAD_LIMIT);
        assert_eq!(head[999], b'a');
        assert_eq!(head[1000], b'b');
    }

    #[test]
    fn test_missing_container_is_unavailable() {
        let err = exec_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: web-1".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::TargetUnavailable);

        let err = exec_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "Container web-1 is paused".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::TargetUnavailable);
    }

    #[test]
    fn test_server_errors_keep_message() {
        let err = exec_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "OCI runtime exec failed: exec: \"zsh\": executable file not found in $PATH"
                .to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::CommandNotFound);
    }
}
