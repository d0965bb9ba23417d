use std::io::{Read, Write as IoWrite};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ExecTarget, ProbeOutcome, ProbeRunner, RemoteExecutor, INPUT_BUFFER_SIZE, TERM_ENV};
use crate::error::{ExecError, EXIT_COMMAND_NOT_FOUND, EXIT_PERMISSION_DENIED};
use crate::resize::TerminalSize;
use crate::session::{ReadOutcome, TerminalIo};

const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_INPUT_CHANNEL_SIZE: usize = 1024;

/// Runs commands on this host inside a fresh PTY. Intended for development;
/// the target name is ignored.
#[derive(Debug, Default)]
pub struct LocalPtyExecutor;

impl LocalPtyExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// Kills the child if the stream future is dropped before it exits.
struct KillOnDrop(Option<Box<dyn ChildKiller + Send + Sync>>);

impl KillOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if let Some(mut killer) = self.0.take() {
            let _ = killer.kill();
        }
    }
}

#[async_trait]
impl RemoteExecutor for LocalPtyExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn stream(
        &self,
        _target: &ExecTarget,
        command: &[String],
        io: Arc<dyn TerminalIo>,
    ) -> Result<(), ExecError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ExecError::Other("empty command".to_string()))?;
        let size = io.next_size().unwrap_or_default().normalized();

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(pty_error)?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        for (key, value) in TERM_ENV {
            cmd.env(key, value);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(pty_error)?;
        drop(pair.slave);
        let mut killer = KillOnDrop(Some(child.clone_killer()));
        // Spawn reports a missing or non-executable program synchronously.
        io.command_started();
        info!(
            "[local] spawned {:?} (pid {})",
            command,
            child.process_id().unwrap_or(0)
        );

        let reader = pair.master.try_clone_reader().map_err(pty_error)?;
        let writer = pair.master.take_writer().map_err(pty_error)?;
        let master = Mutex::new(pair.master);

        let (input_tx, input_rx) = mpsc::channel(PTY_INPUT_CHANNEL_SIZE);
        spawn_writer_thread(writer, input_rx);

        let pumps = async {
            tokio::join!(
                forward_input(io.as_ref(), input_tx),
                forward_resizes(&master, io.as_ref())
            );
            std::future::pending::<()>().await
        };
        tokio::select! {
            result = forward_output(reader, io.as_ref()) => result?,
            _ = pumps => {}
        }

        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .map_err(|e| ExecError::Other(e.to_string()))??;
        killer.disarm();

        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Exited {
                code: i64::from(status.exit_code()),
            })
        }
    }

    fn prober(&self, _target: &ExecTarget) -> Option<Arc<dyn ProbeRunner>> {
        Some(Arc::new(LocalProbe))
    }
}

/// Runs probes as plain host processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProbe;

#[async_trait]
impl ProbeRunner for LocalProbe {
    async fn run_probe(&self, argv: &[String], timeout: Duration) -> ProbeOutcome {
        let Some((program, args)) = argv.split_first() else {
            return ProbeOutcome::Failed("empty probe command".to_string());
        };

        let mut child = match tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            // Report spawn failures the way a shell would.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ProbeOutcome::Exited(EXIT_COMMAND_NOT_FOUND)
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return ProbeOutcome::Exited(EXIT_PERMISSION_DENIED)
            }
            Err(e) => return ProbeOutcome::Failed(e.to_string()),
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => match status.code() {
                Some(code) => ProbeOutcome::Exited(i64::from(code)),
                None => ProbeOutcome::Failed("terminated by signal".to_string()),
            },
            Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
            Err(_) => ProbeOutcome::TimedOut,
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows(),
        cols: size.cols(),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pty_error(err: anyhow::Error) -> ExecError {
    ExecError::Other(format!("{:#}", err))
}

/// Dedicated thread for PTY writes so a slow terminal never blocks the runtime.
fn spawn_writer_thread(mut writer: Box<dyn IoWrite + Send>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut total_bytes_written: usize = 0;
        while let Some(data) = input_rx.blocking_recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk).and_then(|()| writer.flush()) {
                    error!(
                        "[local] pty write error: {} (errno: {:?})",
                        e,
                        e.raw_os_error()
                    );
                    return;
                }
                std::thread::yield_now();
            }
            total_bytes_written += data.len();
        }
        debug!(
            "[local] writer finished after {} bytes",
            total_bytes_written
        );
    });
}

async fn forward_output(
    mut reader: Box<dyn Read + Send>,
    io: &dyn TerminalIo,
) -> Result<(), ExecError> {
    let mut buf = [0u8; PTY_READ_BUFFER_SIZE];
    loop {
        let (returned_reader, returned_buf, result) = tokio::task::spawn_blocking(move || {
            let result = reader.read(&mut buf);
            (reader, buf, result)
        })
        .await
        .map_err(|e| ExecError::Other(format!("pty reader panicked: {}", e)))?;
        reader = returned_reader;
        buf = returned_buf;

        match result {
            Ok(0) => return Ok(()),
            Ok(n) => {
                io.write(&buf[..n]).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the child side is gone.
            Err(e) => {
                debug!("[local] pty read ended: {}", e);
                return Ok(());
            }
        }
    }
}

async fn forward_input(io: &dyn TerminalIo, input: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; INPUT_BUFFER_SIZE];
    loop {
        match io.read(&mut buf).await {
            Ok(ReadOutcome::Data(n)) => {
                if input.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Ok(ReadOutcome::Resized) => continue,
            Ok(ReadOutcome::Eof(n)) => {
                let _ = input.send(buf[..n].to_vec()).await;
                break;
            }
            Err(_) => break,
        }
    }
}

async fn forward_resizes(master: &Mutex<Box<dyn MasterPty + Send>>, io: &dyn TerminalIo) {
    while let Some(size) = io.size_changed().await {
        let size = size.normalized();
        if let Err(e) = master.lock().resize(pty_size(size)) {
            warn!("[local] failed to resize pty to {}: {}", size, e);
        }
    }
}
