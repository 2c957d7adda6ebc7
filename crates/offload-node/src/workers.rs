use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use offload_proto::{ControlMessage, SpawnOptions, WorkerEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    host::{WorkerHost, WorkerSpawnSpec},
    NodeError,
};

/// Grace window between the last reader detaching and termination of a
/// worker whose creating request asked for exit-on-disconnect.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of one worker. `Exited` is terminal; nothing is emitted after
/// it and exactly one terminal event reaches each reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Online,
    Exited,
}

/// Live workers of one node. Identifiers are v4 UUIDs and stay unique for
/// the node's lifetime; exited workers are removed after their terminal
/// event has been fanned out.
pub struct WorkerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    workers: Mutex<HashMap<String, Arc<WorkerEntry>>>,
    grace: Duration,
}

pub struct WorkerEntry {
    id: String,
    bundle_hash: String,
    grace: Duration,
    control: mpsc::UnboundedSender<ControlMessage>,
    shared: Mutex<EntryShared>,
}

struct EntryShared {
    lifecycle: Lifecycle,
    readers: Vec<mpsc::UnboundedSender<WorkerEvent>>,
    reader_count: usize,
}

/// One attached event stream: the receiver plus the guard that keeps the
/// connected-read-stream count accurate.
pub struct EventReader {
    pub rx: mpsc::UnboundedReceiver<WorkerEvent>,
    pub guard: ReaderGuard,
}

impl WorkerRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                workers: Mutex::new(HashMap::new()),
                grace,
            }),
        }
    }

    /// Spawns a worker through the host and starts its event pump.
    ///
    /// The creating request's event stream is attached before the pump
    /// starts, so it observes every event the worker ever emits;
    /// `exit_on_request_end` arms that stream's disconnect handling.
    pub async fn create(
        &self,
        host: &dyn WorkerHost,
        artifact: PathBuf,
        options: SpawnOptions,
        bundle_hash: String,
        exit_on_request_end: bool,
    ) -> Result<(Arc<WorkerEntry>, EventReader), NodeError> {
        let spawned = host
            .spawn(WorkerSpawnSpec { artifact, options })
            .await?;

        let id = Uuid::new_v4().to_string();
        let entry = Arc::new(WorkerEntry {
            id: id.clone(),
            bundle_hash,
            grace: self.inner.grace,
            control: spawned.control,
            shared: Mutex::new(EntryShared {
                lifecycle: Lifecycle::Pending,
                readers: Vec::new(),
                reader_count: 0,
            }),
        });

        let Some(reader) = entry.attach(exit_on_request_end) else {
            unreachable!("a freshly created worker cannot have exited")
        };
        lock(&self.inner.workers).insert(id, entry.clone());
        tokio::spawn(pump(self.inner.clone(), entry.clone(), spawned.events));
        Ok((entry, reader))
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkerEntry>> {
        lock(&self.inner.workers).get(id).cloned()
    }

    pub fn live_ids(&self) -> Vec<String> {
        lock(&self.inner.workers).keys().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        lock(&self.inner.workers).len()
    }

    /// Closes every attached event stream without touching the workers
    /// themselves. Part of abrupt server shutdown: readers observe the
    /// stream end the same way they would a crashed node.
    pub fn sever_readers(&self) {
        for entry in lock(&self.inner.workers).values() {
            lock_entry(&entry.shared).readers.clear();
        }
    }
}

impl WorkerEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bundle_hash(&self) -> &str {
        &self.bundle_hash
    }

    pub fn lifecycle(&self) -> Lifecycle {
        lock_entry(&self.shared).lifecycle
    }

    /// Attaches an event stream. The first record is always an `online`
    /// snapshot so a late reader learns current state; a pending worker's
    /// transition is then delivered through the subscription. Returns
    /// `None` once the worker has exited.
    ///
    /// `exit_on_request_end` arms the grace-window termination check for
    /// this particular stream's closure.
    pub fn attach(self: &Arc<Self>, exit_on_request_end: bool) -> Option<EventReader> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = lock_entry(&self.shared);
        if shared.lifecycle == Lifecycle::Exited {
            return None;
        }
        let _ = tx.send(WorkerEvent::Online(shared.lifecycle == Lifecycle::Online));
        shared.readers.push(tx);
        shared.reader_count += 1;
        Some(EventReader {
            rx,
            guard: ReaderGuard {
                entry: self.clone(),
                exit_on_request_end,
            },
        })
    }

    /// Forwards one control record to the child host.
    pub fn send_control(&self, message: ControlMessage) -> Result<(), NodeError> {
        self.control
            .send(message)
            .map_err(|_| NodeError::ControlClosed)
    }

    fn reader_detached(self: &Arc<Self>, exit_on_request_end: bool) {
        let mut shared = lock_entry(&self.shared);
        shared.reader_count = shared.reader_count.saturating_sub(1);
        let schedule = exit_on_request_end
            && shared.reader_count == 0
            && shared.lifecycle != Lifecycle::Exited;
        drop(shared);

        if schedule {
            let entry = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(entry.grace).await;
                let fire = {
                    let shared = lock_entry(&entry.shared);
                    shared.reader_count == 0 && shared.lifecycle != Lifecycle::Exited
                };
                if fire {
                    debug!(worker = %entry.id, "no reader reattached within grace window, terminating");
                    let _ = entry.send_control(ControlMessage::Terminate);
                }
            });
        }
    }
}

/// Decrements the connected-read-stream count on drop and, for streams
/// armed with exit-on-disconnect, schedules the grace-window check.
pub struct ReaderGuard {
    entry: Arc<WorkerEntry>,
    exit_on_request_end: bool,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.entry.reader_detached(self.exit_on_request_end);
    }
}

/// Sequences one worker's events: lifecycle bookkeeping, fan-out to every
/// attached reader, stream closure after the terminal event, and removal
/// from the registry.
async fn pump(
    inner: Arc<RegistryInner>,
    entry: Arc<WorkerEntry>,
    mut events: mpsc::Receiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let terminal = matches!(event, WorkerEvent::Exit(_) | WorkerEvent::Fault(_));
        let mut shared = lock_entry(&entry.shared);
        if shared.lifecycle == Lifecycle::Exited {
            break;
        }
        match &event {
            WorkerEvent::Online(true) if shared.lifecycle == Lifecycle::Pending => {
                shared.lifecycle = Lifecycle::Online;
                fan_out(&mut shared.readers, &event);
            }
            // `online` fires exactly once; anything else from the host is
            // a duplicate and stays internal.
            WorkerEvent::Online(_) => {}
            _ => fan_out(&mut shared.readers, &event),
        }
        if terminal {
            shared.lifecycle = Lifecycle::Exited;
            shared.readers.clear();
            break;
        }
    }

    // Either the terminal event went out above, or the host feed died
    // silently; in both cases every reader channel is closed now.
    {
        let mut shared = lock_entry(&entry.shared);
        if shared.lifecycle != Lifecycle::Exited {
            warn!(worker = %entry.id, "host event feed ended without a terminal event");
            shared.lifecycle = Lifecycle::Exited;
            shared.readers.clear();
        }
    }

    lock(&inner.workers).remove(&entry.id);
    debug!(worker = %entry.id, "worker removed from registry");
}

fn fan_out(readers: &mut Vec<mpsc::UnboundedSender<WorkerEvent>>, event: &WorkerEvent) {
    readers.retain(|reader| reader.send(event.clone()).is_ok());
}

fn lock<'a>(
    mutex: &'a Mutex<HashMap<String, Arc<WorkerEntry>>>,
) -> MutexGuard<'a, HashMap<String, Arc<WorkerEntry>>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_entry<'a>(mutex: &'a Mutex<EntryShared>) -> MutexGuard<'a, EntryShared> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
