use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use offload_proto::{ControlMessage, FrameDecoder, Framed, SpawnOptions, WorkerEvent};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::HostError;

/// Environment variable through which the spawn-options blob reaches the
/// host program.
pub const SPAWN_OPTIONS_ENV: &str = "OFFLOAD_SPAWN_OPTIONS";

/// Everything the child host needs to launch one worker.
#[derive(Clone, Debug)]
pub struct WorkerSpawnSpec {
    /// Completed bundle artifact to execute.
    pub artifact: PathBuf,
    /// Opaque spawn options forwarded from the caller.
    pub options: SpawnOptions,
}

/// The two ends of a launched worker: its event feed and its control inlet.
pub struct SpawnedWorker {
    pub events: mpsc::Receiver<WorkerEvent>,
    pub control: mpsc::UnboundedSender<ControlMessage>,
}

/// Boundary to the external child host that actually executes entrypoints.
///
/// The node core never touches a child process directly; it hands a spawn
/// spec to the host and multiplexes whatever events come back.
#[async_trait]
pub trait WorkerHost: Send + Sync + 'static {
    async fn spawn(&self, spec: WorkerSpawnSpec) -> Result<SpawnedWorker, HostError>;
}

/// Default host: runs a configured host program per worker and speaks the
/// wire framing over its stdio. Events arrive on the program's stdout;
/// control records are written to its stdin. The program receives the
/// artifact path as its final argument and the spawn options JSON in
/// [`SPAWN_OPTIONS_ENV`].
#[derive(Clone, Debug)]
pub struct ProcessHost {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessHost {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument placed before the artifact path.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[async_trait]
impl WorkerHost for ProcessHost {
    async fn spawn(&self, spec: WorkerSpawnSpec) -> Result<SpawnedWorker, HostError> {
        let options = serde_json::to_string(&spec.options)
            .map_err(|source| HostError::EncodeOptions { source })?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&spec.artifact)
            .env(SPAWN_OPTIONS_ENV, options)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = spawn_with_retry(&mut command, &self.program)?;
        let stdin = child.stdin.take().ok_or(HostError::StdinUnavailable)?;
        let stdout = child.stdout.take().ok_or(HostError::StdoutUnavailable)?;
        let stderr = child.stderr.take().ok_or(HostError::StderrUnavailable)?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(forward_control(control_rx, stdin));
        tokio::spawn(log_host_stderr(stderr));
        tokio::spawn(supervise(child, stdout, events_tx));

        Ok(SpawnedWorker {
            events: events_rx,
            control: control_tx,
        })
    }
}

fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, HostError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(HostError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn_with_retry should return before exhausting retries")
}

/// Reads framed events from the host's stdout until EOF, then reaps the
/// process. If the program died without writing a terminal record, one is
/// synthesized from its exit status so the worker still resolves.
async fn supervise(mut child: Child, mut stdout: ChildStdout, events: mpsc::Sender<WorkerEvent>) {
    let mut decoder = FrameDecoder::<WorkerEvent>::new();
    let mut chunk = [0u8; 4096];
    let mut terminal_seen = false;

    'read: loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) => {
                warn!(?error, "failed to read host stdout");
                break;
            }
        };
        match decoder.feed(&chunk[..n]) {
            Ok(records) => {
                for event in records {
                    if matches!(event, WorkerEvent::Exit(_) | WorkerEvent::Fault(_)) {
                        terminal_seen = true;
                    }
                    if events.send(event).await.is_err() {
                        // Receiver gone; kill_on_drop reaps the child.
                        return;
                    }
                }
            }
            Err(error) => {
                warn!(?error, "malformed frame from host program");
                break 'read;
            }
        }
    }

    let status = match child.wait().await {
        Ok(status) => status,
        Err(error) => {
            warn!(?error, "failed to wait for host program");
            return;
        }
    };
    if !terminal_seen {
        let code = status.code().unwrap_or(-1);
        let _ = events.send(WorkerEvent::Exit(code)).await;
    }
}

async fn forward_control(
    mut control: mpsc::UnboundedReceiver<ControlMessage>,
    mut stdin: ChildStdin,
) {
    while let Some(message) = control.recv().await {
        let terminate = matches!(message, ControlMessage::Terminate);
        if let Err(source) = stdin.write_all(message.encode().as_bytes()).await {
            if source.kind() != std::io::ErrorKind::BrokenPipe {
                warn!(?source, "failed to write control record to host stdin");
            }
            return;
        }
        if terminate {
            // Closing stdin is the shutdown signal for hosts that do not
            // act on the terminate record itself.
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn log_host_stderr(mut stderr: ChildStderr) {
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                debug!(output = %text.trim_end(), "host stderr");
            }
        }
    }
}
