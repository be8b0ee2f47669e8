//! # Execution-context hosts
//!
//! The seam between a session and whatever actually runs the worker. A
//! host opens a context for an entry location and hands back a typed
//! duplex channel plus a raw event stream; the in-process [`TaskHost`]
//! backs each context with a dedicated task running the worker serve loop.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::HostMsg;
use crate::message::InitPayload;
use crate::message::WorkerMsg;
use crate::registry::Runtime;
use crate::worker;

/// Raw context lifecycle notification, as delivered to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The context's task is up.
    Online,
    /// The context constructed its unit and is serving.
    Ready,
    Error(String),
    Exit(i32),
    /// A message was malformed or unroutable.
    MessageError(String),
}

/// Observers receive every raw lifecycle notification, whether or not any
/// call is outstanding. A failing observer is logged and never affects
/// other observers or the session.
pub trait LifecycleObserver: Send + Sync {
    fn notify(&self, event: &LifecycleEvent) -> Result<(), String>;
}

pub(crate) fn notify_observers(observers: &[Arc<dyn LifecycleObserver>], event: &LifecycleEvent) {
    for observer in observers {
        if let Err(detail) = observer.notify(event) {
            tracing::warn!(?event, detail, "lifecycle observer failed");
        }
    }
}

/// Raw event from the context supervisor.
#[derive(Debug)]
pub enum ContextEvent {
    Online,
    Exit(i32),
    Error(String),
}

/// Best-effort forced termination of one context. Firing twice is a no-op.
pub struct TerminateHandle {
    inner: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TerminateHandle {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Some(Box::new(f))),
        }
    }

    pub fn noop() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn fire(&self) {
        if let Some(f) = self.inner.lock().take() {
            f();
        }
    }
}

/// One end of an open context: the typed duplex channel, the raw event
/// stream, and the kill switch.
pub struct ContextChannel {
    pub tx: mpsc::UnboundedSender<HostMsg>,
    pub rx: mpsc::UnboundedReceiver<WorkerMsg>,
    pub events: mpsc::UnboundedReceiver<ContextEvent>,
    pub terminate: TerminateHandle,
}

#[derive(Debug)]
pub enum HostError {
    Open(String),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(detail) => write!(f, "failed to open context: {}", detail),
        }
    }
}

impl std::error::Error for HostError {}

/// Opens isolated execution contexts.
#[async_trait]
pub trait ContextHost: Send + Sync {
    async fn open(&self, entry: &str, init: InitPayload) -> Result<ContextChannel, HostError>;
}

/// In-process host: each context is a dedicated task driving the worker
/// serve loop, supervised so exits and panics surface as raw events.
pub struct TaskHost {
    runtime: Arc<Runtime>,
}

impl TaskHost {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ContextHost for TaskHost {
    async fn open(&self, entry: &str, init: InitPayload) -> Result<ContextChannel, HostError> {
        let (host_tx, worker_rx) = mpsc::unbounded_channel::<HostMsg>();
        let (worker_tx, host_rx) = mpsc::unbounded_channel::<WorkerMsg>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ContextEvent>();

        tracing::debug!(entry, unit = %init.unit, "opening in-process context");
        let served = tokio::spawn(worker::serve(self.runtime.clone(), init, worker_tx, worker_rx));
        let abort = served.abort_handle();
        tokio::spawn(supervise(served, event_tx));

        Ok(ContextChannel {
            tx: host_tx,
            rx: host_rx,
            events: event_rx,
            terminate: TerminateHandle::new(move || abort.abort()),
        })
    }
}

async fn supervise(served: JoinHandle<i32>, events: mpsc::UnboundedSender<ContextEvent>) {
    let _ = events.send(ContextEvent::Online);
    match served.await {
        Ok(code) => {
            let _ = events.send(ContextEvent::Exit(code));
        }
        // Forced termination counts as a nonzero exit, not a failure.
        Err(e) if e.is_cancelled() => {
            let _ = events.send(ContextEvent::Exit(1));
        }
        Err(e) => {
            let _ = events.send(ContextEvent::Error(format!("context task failed: {}", e)));
        }
    }
}
