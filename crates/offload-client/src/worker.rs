use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use offload_proto::{
    ControlMessage, CreateWorkerRequest, FrameDecoder, Framed, WorkerEvent, WORKER_ID_HEADER,
};
use reqwest::{Method, StatusCode};
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, error, warn};

use crate::{node::NodeClient, SpawnError, WorkerError};

/// Pause before reopening a control stream whose connection dropped while
/// the worker was still alive.
const RECONNECT_DELAY: Duration = Duration::from_millis(50);

/// Lifecycle notifications delivered through [`RemoteWorker::events`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteWorkerEvent {
    /// The child has begun executing. Emitted once.
    Online,
    /// An inter-process message from the child.
    Message(Vec<u8>),
    /// Normal termination with the child's exit code. Terminal.
    Exit(i32),
    /// The worker faulted or the event stream died. Terminal.
    Error(WorkerError),
}

#[derive(Clone, Debug)]
enum WorkerOutcome {
    Exited(i32),
    Failed(WorkerError),
}

#[derive(Debug)]
struct HandleShared {
    id: String,
    stdin_enabled: bool,
    stdin_warned: AtomicBool,
    events_subscribed: AtomicBool,
    control: mpsc::UnboundedSender<ControlMessage>,
    completion: watch::Sender<Option<WorkerOutcome>>,
    abandon: Notify,
}

impl HandleShared {
    fn exited(&self) -> bool {
        self.completion.borrow().is_some()
    }
}

/// Handle to one worker running on a remote node.
///
/// The handle surfaces lifecycle notifications through [`events`], the
/// child's standard streams through [`stdout`]/[`stderr`], and accepts
/// messages, stdin bytes, and termination. Once the worker has exited
/// every mutating call fails with [`WorkerError::AfterExit`].
///
/// Dropping the handle of a live worker closes both streams; a worker
/// spawned with `exit_on_request_end` is then terminated by the node once
/// its grace window passes with no reader.
///
/// [`events`]: RemoteWorker::events
/// [`stdout`]: RemoteWorker::stdout
/// [`stderr`]: RemoteWorker::stderr
#[derive(Debug)]
pub struct RemoteWorker {
    shared: Arc<HandleShared>,
    node_url: String,
    events: Option<mpsc::UnboundedReceiver<RemoteWorkerEvent>>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
}

impl RemoteWorker {
    /// The node-assigned worker identifier.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Credential-free base URL of the node running this worker.
    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    /// Takes the lifecycle event receiver. `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<RemoteWorkerEvent>> {
        let taken = self.events.take();
        if taken.is_some() {
            self.shared.events_subscribed.store(true, Ordering::SeqCst);
        }
        taken
    }

    /// Takes the child's stdout byte stream. `None` after the first call.
    pub fn stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    /// Takes the child's stderr byte stream. `None` after the first call.
    pub fn stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }

    /// Sends an inter-process message to the child.
    pub fn post_message(&self, bytes: impl Into<Vec<u8>>) -> Result<(), WorkerError> {
        if self.shared.exited() {
            return Err(WorkerError::AfterExit);
        }
        self.shared
            .control
            .send(ControlMessage::WorkerMessage(bytes.into()))
            .map_err(|_| WorkerError::AfterExit)
    }

    /// Writes bytes to the child's standard input.
    ///
    /// When the worker was spawned without `stdin: true` this warns once
    /// and drops the bytes; the node would discard them anyway.
    pub fn write_stdin(&self, bytes: impl Into<Vec<u8>>) -> Result<(), WorkerError> {
        if self.shared.exited() {
            return Err(WorkerError::AfterExit);
        }
        if !self.shared.stdin_enabled {
            if !self.shared.stdin_warned.swap(true, Ordering::SeqCst) {
                warn!(
                    worker = %self.shared.id,
                    "stdin was not enabled at spawn; dropping written bytes"
                );
            }
            return Ok(());
        }
        self.shared
            .control
            .send(ControlMessage::Stdin(bytes.into()))
            .map_err(|_| WorkerError::AfterExit)
    }

    /// Requests graceful termination and resolves with the exit code once
    /// the terminal event is observed.
    pub async fn terminate(&self) -> Result<i32, WorkerError> {
        if self.shared.exited() {
            return Err(WorkerError::AfterExit);
        }
        self.shared
            .control
            .send(ControlMessage::Terminate)
            .map_err(|_| WorkerError::AfterExit)?;
        self.wait().await
    }

    /// Resolves when the worker reaches a terminal state: the exit code on
    /// normal exit, the terminal error otherwise.
    pub async fn wait(&self) -> Result<i32, WorkerError> {
        let mut completion = self.shared.completion.subscribe();
        loop {
            let outcome = completion.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return match outcome {
                    WorkerOutcome::Exited(code) => Ok(code),
                    WorkerOutcome::Failed(error) => Err(error),
                };
            }
            if completion.changed().await.is_err() {
                return Err(WorkerError::Disconnected);
            }
        }
    }
}

impl Drop for RemoteWorker {
    fn drop(&mut self) {
        if !self.shared.exited() {
            self.shared.abandon.notify_one();
        }
    }
}

/// One of the child's output byte streams. Chunk boundaries are transport
/// artifacts; byte order within the stream is preserved end-to-end.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
}

impl OutputStream {
    /// Adapts the stream into an [`AsyncRead`](tokio::io::AsyncRead).
    pub fn into_reader(self) -> impl tokio::io::AsyncRead {
        StreamReader::new(self)
    }
}

impl Stream for OutputStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Opens the worker-create request on `node` and wires up the handle.
pub(crate) async fn launch(
    node: Arc<NodeClient>,
    request: CreateWorkerRequest,
) -> Result<RemoteWorker, SpawnError> {
    let stdin_enabled = request.extra_data.stdin;
    let response = node
        .request(Method::POST, "worker")?
        .json(&request)
        .send()
        .await
        .map_err(|source| node.unreachable(source))?;

    if response.status() == StatusCode::BAD_REQUEST {
        let reason = response.text().await.unwrap_or_default();
        return Err(SpawnError::BundleRejected {
            node: node.display().to_string(),
            reason,
        });
    }
    if !response.status().is_success() {
        return Err(node.unexpected(format!("worker create returned {}", response.status())));
    }

    let id = response
        .headers()
        .get(WORKER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| node.unexpected("worker create response missing x-worker-id"))?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
    let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (completion_tx, completion_rx) = watch::channel(None);

    let shared = Arc::new(HandleShared {
        id: id.clone(),
        stdin_enabled,
        stdin_warned: AtomicBool::new(false),
        events_subscribed: AtomicBool::new(false),
        control: control_tx,
        completion: completion_tx,
        abandon: Notify::new(),
    });

    let node_url = node.display().to_string();
    node.worker_started();
    tokio::spawn(demux(
        response,
        node.clone(),
        shared.clone(),
        events_tx,
        stdout_tx,
        stderr_tx,
    ));
    tokio::spawn(control_loop(node, id, control_rx, completion_rx));

    Ok(RemoteWorker {
        shared,
        node_url,
        events: Some(events_rx),
        stdout: Some(OutputStream { rx: stdout_rx }),
        stderr: Some(OutputStream { rx: stderr_rx }),
    })
}

/// Reads the event stream and dispatches each record: `online` once, byte
/// chunks into the output streams, `message` to the event channel, and the
/// terminal record into the completion slot. A premature close surfaces
/// [`WorkerError::Disconnected`]; the event stream is never reconnected.
async fn demux(
    response: reqwest::Response,
    node: Arc<NodeClient>,
    shared: Arc<HandleShared>,
    events: mpsc::UnboundedSender<RemoteWorkerEvent>,
    stdout: mpsc::UnboundedSender<io::Result<Bytes>>,
    stderr: mpsc::UnboundedSender<io::Result<Bytes>>,
) {
    let mut body = Box::pin(response.bytes_stream());
    let mut decoder = FrameDecoder::<WorkerEvent>::new();
    let mut online_emitted = false;

    // `None` means the handle was dropped and the worker abandoned; the
    // connection close is the node's cue to apply exit-on-disconnect.
    let outcome = 'stream: loop {
        let chunk = tokio::select! {
            _ = shared.abandon.notified() => {
                debug!(worker = %shared.id, "handle dropped, abandoning event stream");
                break None;
            }
            chunk = body.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(transport)) => {
                debug!(worker = %shared.id, error = %transport, "event stream transport failed");
                break Some(WorkerOutcome::Failed(WorkerError::Disconnected));
            }
            None => break Some(WorkerOutcome::Failed(WorkerError::Disconnected)),
        };
        let records = match decoder.feed(&chunk) {
            Ok(records) => records,
            Err(frame) => {
                break Some(WorkerOutcome::Failed(WorkerError::Protocol {
                    detail: frame.to_string(),
                }))
            }
        };
        for record in records {
            match record {
                WorkerEvent::Online(true) if !online_emitted => {
                    online_emitted = true;
                    let _ = events.send(RemoteWorkerEvent::Online);
                }
                WorkerEvent::Online(_) => {}
                WorkerEvent::Stdout(bytes) => {
                    let _ = stdout.send(Ok(Bytes::from(bytes)));
                }
                WorkerEvent::Stderr(bytes) => {
                    let _ = stderr.send(Ok(Bytes::from(bytes)));
                }
                WorkerEvent::Message(bytes) => {
                    let _ = events.send(RemoteWorkerEvent::Message(bytes));
                }
                WorkerEvent::Exit(code) => break 'stream Some(WorkerOutcome::Exited(code)),
                WorkerEvent::Fault(fault) => {
                    break 'stream Some(WorkerOutcome::Failed(WorkerError::Fault(fault)))
                }
            }
        }
    };

    if let Some(outcome) = outcome {
        match &outcome {
            WorkerOutcome::Exited(code) => {
                let _ = events.send(RemoteWorkerEvent::Exit(*code));
            }
            WorkerOutcome::Failed(failure) => {
                // Fail-fast for callers that never subscribed: the failure
                // is still logged and resolves `wait()`.
                if !shared.events_subscribed.load(Ordering::SeqCst) {
                    error!(worker = %shared.id, error = %failure, "worker failed with no event subscriber");
                }
                let _ = events.send(RemoteWorkerEvent::Error(failure.clone()));
            }
        }
        shared.completion.send_replace(Some(outcome));
    }
    node.worker_finished();
}

/// Keeps the control stream open for the worker's lifetime. The node's
/// read end is stateless, so a dropped connection is simply reopened to
/// the same worker id while the worker is alive.
async fn control_loop(
    node: Arc<NodeClient>,
    id: String,
    mut control: mpsc::UnboundedReceiver<ControlMessage>,
    completion: watch::Receiver<Option<WorkerOutcome>>,
) {
    loop {
        if completion.borrow().is_some() {
            return;
        }

        let (bytes_tx, bytes_rx) = mpsc::unbounded_channel::<io::Result<Bytes>>();
        let body = reqwest::Body::wrap_stream(UnboundedReceiverStream::new(bytes_rx));
        let request = match node.request(Method::POST, &format!("worker/{id}/streams-pipe")) {
            Ok(builder) => builder.body(body).send(),
            Err(error) => {
                warn!(worker = %id, %error, "control stream request could not be built");
                return;
            }
        };
        tokio::pin!(request);

        loop {
            tokio::select! {
                result = &mut request => {
                    match result {
                        Ok(response) => {
                            debug!(worker = %id, status = %response.status(), "control stream connection ended");
                        }
                        Err(transport) => {
                            debug!(worker = %id, error = %transport, "control stream connection failed");
                        }
                    }
                    break;
                }
                message = control.recv() => match message {
                    Some(message) => {
                        if bytes_tx.send(Ok(Bytes::from(message.encode()))).is_err() {
                            break;
                        }
                    }
                    None => {
                        // Handle dropped: end the request body and let the
                        // node observe the close.
                        drop(bytes_tx);
                        let _ = request.await;
                        return;
                    }
                },
            }
        }

        if completion.borrow().is_some() {
            return;
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
