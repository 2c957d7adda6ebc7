//! Scripted worker hosts for suites that exercise the node without real
//! child processes.

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use offload_proto::{ControlMessage, WorkerEvent};
use tokio::sync::mpsc;

use crate::{
    host::{SpawnedWorker, WorkerHost, WorkerSpawnSpec},
    HostError,
};

type ScriptFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ScriptFn = dyn Fn(WorkerSpawnSpec, mpsc::UnboundedReceiver<ControlMessage>, mpsc::Sender<WorkerEvent>) -> ScriptFuture
    + Send
    + Sync;

/// A [`WorkerHost`] whose workers are driven by an in-process script
/// instead of a spawned program.
pub struct ScriptedHost {
    script: Arc<ScriptFn>,
}

impl ScriptedHost {
    pub fn new<F, Fut>(script: F) -> Self
    where
        F: Fn(WorkerSpawnSpec, mpsc::UnboundedReceiver<ControlMessage>, mpsc::Sender<WorkerEvent>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            script: Arc::new(move |spec, control, events| Box::pin(script(spec, control, events))),
        }
    }

    /// Workers that come online, echo `worker_message` back as `message`,
    /// mirror stdin to stdout when stdin was enabled, and exit 0 on
    /// terminate (or when the control feed closes).
    pub fn echo() -> Self {
        Self::new(|spec, mut control, events| async move {
            let stdin_enabled = spec.options.stdin;
            let _ = events.send(WorkerEvent::Online(true)).await;
            while let Some(message) = control.recv().await {
                match message {
                    ControlMessage::WorkerMessage(bytes) => {
                        let _ = events.send(WorkerEvent::Message(bytes)).await;
                    }
                    ControlMessage::Stdin(bytes) => {
                        if stdin_enabled {
                            let _ = events.send(WorkerEvent::Stdout(bytes)).await;
                        }
                    }
                    ControlMessage::Terminate => break,
                }
            }
            let _ = events.send(WorkerEvent::Exit(0)).await;
        })
    }

    /// Workers that play a fixed event sequence and then end their feed.
    pub fn sequence(script: Vec<WorkerEvent>) -> Self {
        Self::new(move |_spec, _control, events| {
            let script = script.clone();
            async move {
                for event in script {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    /// Workers that come online and then wait forever; they only leave via
    /// a transport-level disconnect on the caller side.
    pub fn hang_after_online() -> Self {
        Self::new(|_spec, mut control, events| async move {
            let _ = events.send(WorkerEvent::Online(true)).await;
            while let Some(message) = control.recv().await {
                if matches!(message, ControlMessage::Terminate) {
                    let _ = events.send(WorkerEvent::Exit(0)).await;
                    return;
                }
            }
        })
    }
}

#[async_trait]
impl WorkerHost for ScriptedHost {
    async fn spawn(&self, spec: WorkerSpawnSpec) -> Result<SpawnedWorker, HostError> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn((self.script)(spec, control_rx, events_tx));
        Ok(SpawnedWorker {
            events: events_rx,
            control: control_tx,
        })
    }
}
