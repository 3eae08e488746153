//! Progress reporting for pipeline runs.
//!
//! The orchestrator emits [`ProgressEvent`]s through a flume channel; a
//! background listener broadcasts each event to every registered
//! [`ProgressSink`]. Distinct from the application-facing
//! [`MessageBus`](crate::bus::MessageBus): progress events are engine
//! telemetry, not pipeline messages.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::io::{self, Result as IoResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tracing::{info, warn};

use crate::stage::StageId;

/// One telemetry event from a pipeline run: what happened, how far the run
/// has progressed, and when.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    /// Share of pipeline stages settled when this was emitted, 0-100.
    pub percent: u8,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    #[must_use]
    pub fn new(kind: ProgressKind, percent: u8) -> Self {
        Self {
            kind,
            percent,
            at: Utc::now(),
        }
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ProgressKind::Diagnostic {
                scope: scope.into(),
                message: message.into(),
            },
            0,
        )
    }
}

/// What a [`ProgressEvent`] reports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProgressKind {
    StageStarted {
        stage: StageId,
        attempt: u32,
    },
    StageRetrying {
        stage: StageId,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    StageCompleted {
        stage: StageId,
        attempts: u32,
        from_cache: bool,
    },
    StageFailed {
        stage: StageId,
        attempts: u32,
        reason: String,
    },
    RevisionRequested {
        from: StageId,
        to: StageId,
        reason: String,
    },
    CheckpointSaved {
        version: u64,
    },
    PipelineFinished {
        status: String,
    },
    Diagnostic {
        scope: String,
        message: String,
    },
}

/// Emitter that stamps every event with the run's completion percentage.
///
/// Shared between the run loop and the stage executors; settled-stage counts
/// flow in through [`set_settled`](Self::set_settled).
#[derive(Clone)]
pub struct ProgressTracker {
    tx: flume::Sender<ProgressEvent>,
    settled: Arc<AtomicUsize>,
    total: usize,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(tx: flume::Sender<ProgressEvent>, total_stages: usize) -> Self {
        Self {
            tx,
            settled: Arc::new(AtomicUsize::new(0)),
            total: total_stages.max(1),
        }
    }

    /// Record how many stages have settled so far.
    pub fn set_settled(&self, settled: usize) {
        self.settled.store(settled.min(self.total), Ordering::SeqCst);
    }

    #[must_use]
    pub fn percent(&self) -> u8 {
        (self.settled.load(Ordering::SeqCst) * 100 / self.total) as u8
    }

    /// Emit one event; send failures are ignored, telemetry never aborts a
    /// run.
    pub fn send(&self, kind: ProgressKind) {
        let _ = self.tx.send(ProgressEvent::new(kind, self.percent()));
    }
}

/// Output target that consumes progress events.
pub trait ProgressSink: Send + Sync {
    fn handle(&mut self, event: &ProgressEvent) -> IoResult<()>;
}

/// Default sink: forwards events to the `tracing` subscriber at info level.
#[derive(Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn handle(&mut self, event: &ProgressEvent) -> IoResult<()> {
        info!(?event, "progress");
        Ok(())
    }
}

/// In-memory sink for testing and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured events, in emission order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.clear();
        }
    }
}

impl ProgressSink for MemorySink {
    fn handle(&mut self, event: &ProgressEvent) -> IoResult<()> {
        match self.entries.lock() {
            Ok(mut guard) => {
                guard.push(event.clone());
                Ok(())
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "sink lock poisoned")),
        }
    }
}

/// Channel sink for streaming progress to async consumers.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn handle(&mut self, event: &ProgressEvent) -> IoResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }
}

/// Receives progress events and broadcasts them to the registered sinks.
pub struct ProgressBus {
    sinks: Arc<Mutex<Vec<Box<dyn ProgressSink>>>>,
    channel: (flume::Sender<ProgressEvent>, flume::Receiver<ProgressEvent>),
    listener: Mutex<Option<ListenerState>>,
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::with_sink(TracingSink)
    }
}

impl ProgressBus {
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: ProgressSink + 'static,
    {
        Self {
            sinks: Arc::new(Mutex::new(vec![Box::new(sink)])),
            channel: flume::unbounded(),
            listener: Mutex::new(None),
        }
    }

    /// Register an additional sink; future events reach it too.
    pub fn add_sink<T: ProgressSink + 'static>(&self, sink: T) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.push(Box::new(sink));
        }
    }

    /// Clone of the sender side; the orchestrator emits through this.
    #[must_use]
    pub fn sender(&self) -> flume::Sender<ProgressEvent> {
        self.channel.0.clone()
    }

    /// Spawn the background broadcast task. Idempotent.
    pub fn listen(&self) {
        let mut guard = match self.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return;
        }

        let receiver = self.channel.1.clone();
        let sinks = Arc::clone(&self.sinks);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = receiver.recv_async() => match recv {
                        Err(_) => break,
                        Ok(event) => {
                            let Ok(mut sinks) = sinks.lock() else { break };
                            for sink in sinks.iter_mut() {
                                if let Err(error) = sink.handle(&event) {
                                    warn!(%error, "progress sink error");
                                }
                            }
                        }
                    }
                }
            }
        });

        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Async stream of future events, backed by a dedicated channel sink.
    ///
    /// Events emitted before this call are not replayed. Requires
    /// [`listen`](Self::listen) (the orchestrator calls it when a run
    /// starts).
    pub fn event_stream(&self) -> impl Stream<Item = ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_sink(ChannelSink::new(tx));
        stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }

    /// Stop the broadcast task, draining nothing further.
    pub async fn stop(&self) {
        let state = {
            let mut guard = match self.listener.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

impl Drop for ProgressBus {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(state) = guard.take() {
                let _ = state.shutdown_tx.send(());
                state.handle.abort();
            }
        }
    }
}
