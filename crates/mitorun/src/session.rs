//! # RPC session
//!
//! Host side of one open context: the state machine, the pending-call
//! table, and the pump that routes replies and reverse calls. Forward
//! calls are correlated by id, never by order — replies may complete out
//! of order under concurrent calls.
//!
//! ## Invariants
//! - `Ready` is the only state that admits new forward calls, and it is
//!   never re-entered once left.
//! - Finalize rejects every pending call immediately; it does not wait for
//!   the context's acknowledgment.
//! - A failed encode never sends a partial message.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use mitopack::ByteBuf;
use mitopack::Codec;
use mitopack::Descriptor;
use mitopack::EncodedBuffer;
use mitopack::EncodedValue;
use mitopack::SharedRegion;
use mitopack::TypeId;
use mitopack::Value;
use mitopack::codec;

use crate::host::ContextChannel;
use crate::host::ContextEvent;
use crate::host::ContextHost;
use crate::host::HostError;
use crate::host::LifecycleEvent;
use crate::host::LifecycleObserver;
use crate::host::TaskHost;
use crate::host::TerminateHandle;
use crate::host::notify_observers;
use crate::message::Fault;
use crate::message::HostMsg;
use crate::message::InitPayload;
use crate::message::WorkerMsg;
use crate::registry;
use crate::registry::Runtime;
use crate::registry::TypeRecord;
use crate::unit::Unit;
use crate::unit::UnitCx;
use crate::unit::UnitInit;

/// Lifecycle of one session. `Ready` is never re-entered once left.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    Initializing,
    Ready,
    WorkerError(String),
    Exited(i32),
    Finalized,
    InitError(Fault),
}

#[derive(Debug)]
pub enum CallError {
    MethodNotRemote(String),
    /// The session was finalized; rejected synchronously, nothing sent.
    Finalized,
    /// The context exited or failed; carries the details.
    Terminated(String),
    Codec(codec::Error),
    /// The context reported the call as failed.
    Remote(Fault),
    ChannelClosed,
    Timeout,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MethodNotRemote(method) => {
                write!(f, "method '{}' is not registered as remotely callable", method)
            }
            Self::Finalized => write!(f, "session finalized"),
            Self::Terminated(detail) => write!(f, "session terminated: {}", detail),
            Self::Codec(e) => write!(f, "codec failure: {}", e),
            Self::Remote(fault) => write!(f, "remote failure: {}", fault),
            Self::ChannelClosed => write!(f, "session channel closed"),
            Self::Timeout => write!(f, "call timed out"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<codec::Error> for CallError {
    fn from(e: codec::Error) -> Self {
        Self::Codec(e)
    }
}

#[derive(Debug)]
pub enum ConnectError {
    Registry(registry::Error),
    NotAUnit(String),
    Host(HostError),
    Codec(codec::Error),
    Shm(mitoshm::Error),
    /// The context reported a construction failure.
    Init(Fault),
    /// Constructing the host-side mirror failed.
    Construct(String),
    /// The context went away before announcing readiness.
    ContextGone(String),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry(e) => write!(f, "registry error: {}", e),
            Self::NotAUnit(name) => write!(f, "'{}' is not a constructible unit", name),
            Self::Host(e) => write!(f, "{}", e),
            Self::Codec(e) => write!(f, "codec failure: {}", e),
            Self::Shm(e) => write!(f, "shared-memory failure: {}", e),
            Self::Init(fault) => write!(f, "context init failed: {}", fault),
            Self::Construct(detail) => write!(f, "mirror construction failed: {}", detail),
            Self::ContextGone(detail) => write!(f, "{}", detail),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<registry::Error> for ConnectError {
    fn from(e: registry::Error) -> Self {
        Self::Registry(e)
    }
}

impl From<HostError> for ConnectError {
    fn from(e: HostError) -> Self {
        Self::Host(e)
    }
}

impl From<codec::Error> for ConnectError {
    fn from(e: codec::Error) -> Self {
        Self::Codec(e)
    }
}

impl From<mitoshm::Error> for ConnectError {
    fn from(e: mitoshm::Error) -> Self {
        Self::Shm(e)
    }
}

struct PendingCall {
    /// Recorded so the reply decodes under this method's return
    /// descriptor, whatever order replies arrive in.
    method: String,
    settle: oneshot::Sender<Result<Value, CallError>>,
}

struct SessionShared {
    unit: Arc<TypeRecord>,
    codec: Codec,
    state: Mutex<SessionState>,
    pending: DashMap<u64, PendingCall>,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<HostMsg>,
    mirror: Arc<tokio::sync::Mutex<Box<dyn Unit>>>,
    terminate: TerminateHandle,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    call_timeout: Option<Duration>,
}

impl SessionShared {
    fn ready_error(&self) -> Option<CallError> {
        match &*self.state.lock() {
            SessionState::Ready => None,
            SessionState::Finalized => Some(CallError::Finalized),
            SessionState::Exited(code) => Some(CallError::Terminated(format!(
                "context exited with code {}",
                code
            ))),
            SessionState::WorkerError(detail) => Some(CallError::Terminated(detail.clone())),
            SessionState::Initializing => {
                Some(CallError::Terminated("session is still initializing".into()))
            }
            SessionState::InitError(fault) => Some(CallError::Terminated(fault.to_string())),
        }
    }

    fn fail_all_pending(&self, error: &dyn Fn() -> CallError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.settle.send(Err(error()));
            }
        }
    }

    fn handle_worker_msg(self: &Arc<Self>, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Reply { id, outcome } => self.handle_reply(id, outcome),
            WorkerMsg::CallbackInvoke { id, method, args } => {
                let shared = self.clone();
                tokio::spawn(async move {
                    let outcome = shared.run_callback(&method, args).await;
                    let _ = shared.tx.send(HostMsg::CallbackReply { id, outcome });
                });
            }
            WorkerMsg::Finalized => tracing::debug!("context acknowledged finalize"),
            WorkerMsg::Ready => tracing::debug!("duplicate ready ignored"),
            WorkerMsg::InitError(fault) => tracing::warn!(%fault, "late init error ignored"),
        }
    }

    fn handle_reply(&self, id: u64, outcome: Result<EncodedValue, Fault>) {
        let Some((_, call)) = self.pending.remove(&id) else {
            tracing::warn!(id, "reply with no pending call");
            notify_observers(
                &self.observers,
                &LifecycleEvent::MessageError(format!("reply for unknown call {}", id)),
            );
            return;
        };
        let settled = match outcome {
            Ok(encoded) => {
                let ret = self
                    .unit
                    .remote
                    .get(&call.method)
                    .map(|sig| sig.ret.clone())
                    .unwrap_or(Descriptor::None);
                self.codec.decode(encoded, &ret).map_err(CallError::Codec)
            }
            Err(fault) => Err(CallError::Remote(fault)),
        };
        let _ = call.settle.send(settled);
    }

    /// Runs a reverse call on the mirrored instance — no hop back out.
    /// Handler errors settle the reply as failed, never escape.
    async fn run_callback(&self, method: &str, args: Vec<EncodedValue>) -> Result<EncodedValue, Fault> {
        let Some(sig) = self.unit.callback.get(method) else {
            return Err(Fault::method_not_callback(method));
        };
        let mut vals = Vec::with_capacity(args.len());
        for (index, encoded) in args.into_iter().enumerate() {
            let desc = sig.params.get(index).cloned().unwrap_or(Descriptor::None);
            vals.push(self.codec.decode(encoded, &desc).map_err(|e| Fault::codec(e))?);
        }
        let out = {
            let cx = UnitCx::host();
            let mut mirror = self.mirror.lock().await;
            mirror.invoke(method, vals, &cx).await?
        };
        self.codec.encode(&out, &sig.ret).map_err(|e| Fault::codec(e))
    }

    /// Applies an unrequested termination: classify, then reject everything
    /// still pending.
    fn on_context_end(&self, exit: Option<i32>, failure: Option<String>) {
        let state_now = {
            let mut state = self.state.lock();
            let terminal = matches!(
                &*state,
                SessionState::Finalized | SessionState::Exited(_) | SessionState::WorkerError(_)
            );
            if !terminal {
                *state = match (&failure, exit) {
                    (Some(detail), _) => SessionState::WorkerError(detail.clone()),
                    (None, Some(code)) => SessionState::Exited(code),
                    (None, None) => SessionState::Exited(0),
                };
            }
            state.clone()
        };
        match state_now {
            SessionState::Finalized => self.fail_all_pending(&|| CallError::Finalized),
            SessionState::WorkerError(detail) => {
                self.fail_all_pending(&|| CallError::Terminated(detail.clone()))
            }
            SessionState::Exited(code) => self.fail_all_pending(&|| {
                CallError::Terminated(format!("context exited with code {}", code))
            }),
            _ => self.fail_all_pending(&|| CallError::ChannelClosed),
        }
    }
}

/// Handle to one open context. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.shared.state.lock())
            .finish()
    }
}

impl Session {
    pub fn builder(runtime: Arc<Runtime>, unit: TypeId) -> SessionBuilder {
        SessionBuilder::new(runtime, unit)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.lock().clone()
    }

    /// Issues a forward call and suspends until the matching reply.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        if let Some(error) = self.shared.ready_error() {
            return Err(error);
        }
        let Some(sig) = self.shared.unit.remote.get(method) else {
            return Err(CallError::MethodNotRemote(method.to_string()));
        };

        // Encode first: a failure here must leave no trace on the wire.
        let mut encoded = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let desc = sig.params.get(index).cloned().unwrap_or(Descriptor::None);
            encoded.push(self.shared.codec.encode(arg, &desc)?);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (settle, settled) = oneshot::channel();
        self.shared.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                settle,
            },
        );
        let sent = self.shared.tx.send(HostMsg::Invoke {
            id,
            method: method.to_string(),
            args: encoded,
        });
        if sent.is_err() {
            self.shared.pending.remove(&id);
            return Err(CallError::ChannelClosed);
        }
        // The session may have left Ready between the check and the send;
        // a slot registered after the bulk reject would never settle.
        if let Some(error) = self.shared.ready_error() {
            if self.shared.pending.remove(&id).is_some() {
                return Err(error);
            }
        }

        match self.shared.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, settled).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(CallError::ChannelClosed),
                Err(_) => {
                    self.shared.pending.remove(&id);
                    Err(CallError::Timeout)
                }
            },
            None => match settled.await {
                Ok(result) => result,
                Err(_) => Err(CallError::ChannelClosed),
            },
        }
    }

    /// Invokes a method directly on the locally mirrored instance, without
    /// touching the context.
    pub async fn call_local(&self, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        let cx = UnitCx::host();
        let mut mirror = self.shared.mirror.lock().await;
        mirror.invoke(method, args, &cx).await
    }

    /// Ends the session: every pending forward call rejects immediately
    /// with the finalized error, the context is told to finalize, and its
    /// termination is requested. Does not wait for acknowledgment.
    pub fn finalize(&self) {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, SessionState::Finalized) {
                return;
            }
            *state = SessionState::Finalized;
        }
        self.shared.fail_all_pending(&|| CallError::Finalized);
        let _ = self.shared.tx.send(HostMsg::Finalize);
        self.shared.terminate.fire();
    }
}

/// Configures and opens a session.
pub struct SessionBuilder {
    runtime: Arc<Runtime>,
    unit: TypeId,
    args: Vec<Value>,
    host: Option<Arc<dyn ContextHost>>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    call_timeout: Option<Duration>,
}

impl SessionBuilder {
    pub fn new(runtime: Arc<Runtime>, unit: TypeId) -> Self {
        Self {
            runtime,
            unit,
            args: Vec::new(),
            host: None,
            observers: Vec::new(),
            call_timeout: None,
        }
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn args(mut self, values: Vec<Value>) -> Self {
        self.args = values;
        self
    }

    pub fn host(mut self, host: Arc<dyn ContextHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Optional per-call deadline. Off by default: finalize is the only
    /// built-in cancellation primitive.
    pub fn call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = Some(limit);
        self
    }

    /// Opens the context, constructs both instances, and returns the
    /// session once the context announces readiness.
    pub async fn connect(self) -> Result<Session, ConnectError> {
        let record = self.runtime.record(self.unit)?;
        let registration = record
            .unit
            .clone()
            .ok_or_else(|| ConnectError::NotAUnit(record.name.clone()))?;
        let factory = record
            .factory
            .clone()
            .ok_or_else(|| ConnectError::NotAUnit(record.name.clone()))?;

        // The registry is read-only from the first session on.
        self.runtime.seal();
        let codec = self.runtime.codec();

        // A struct-typed unit gets one region of its fixed size up front,
        // so both instances alias the same bytes from the first access.
        let buffer = record.layout.as_ref().map(|layout| {
            let region = SharedRegion::allocate(layout.size);
            tracing::debug!(
                region = %region.id(),
                size = layout.size,
                unit = %record.name,
                "allocated unit region"
            );
            ByteBuf::whole_region(region)
        });

        // Designated-shared constructor arguments: size, then materialize.
        let mut args = self.args;
        for (index, param) in record.ctor.iter().enumerate() {
            if !param.shared {
                continue;
            }
            let Some(arg) = args.get(index).cloned() else { continue };
            let extra = mitoshm::compute_extra_size(&*self.runtime, &*self.runtime, &arg)?;
            tracing::debug!(index, extra, "materializing shared constructor argument");
            args[index] = mitoshm::materialize_shared(&*self.runtime, &*self.runtime, &arg)?;
        }

        // Encode after materialization so shared stores cross by reference.
        let mut ctor_args = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let desc = record
                .ctor
                .get(index)
                .map(|p| p.desc.clone())
                .unwrap_or(Descriptor::None);
            ctor_args.push(codec.encode(arg, &desc)?);
        }
        let init = InitPayload {
            unit: record.id,
            ctor_args,
            buffer: buffer.as_ref().map(EncodedBuffer::capture),
        };

        let host = self
            .host
            .unwrap_or_else(|| Arc::new(TaskHost::new(self.runtime.clone())));
        let mut channel = host.open(&registration.entry_location, init).await?;

        // Initializing: wait for the context to announce itself.
        let mut events_open = true;
        loop {
            tokio::select! {
                msg = channel.rx.recv() => match msg {
                    Some(WorkerMsg::Ready) => break,
                    Some(WorkerMsg::InitError(fault)) => {
                        notify_observers(&self.observers, &LifecycleEvent::Error(fault.to_string()));
                        return Err(ConnectError::Init(fault));
                    }
                    Some(other) => {
                        notify_observers(
                            &self.observers,
                            &LifecycleEvent::MessageError(format!(
                                "unexpected message before ready: {:?}",
                                other
                            )),
                        );
                    }
                    None => return Err(ConnectError::ContextGone("context closed before ready".into())),
                },
                event = channel.events.recv(), if events_open => match event {
                    Some(ContextEvent::Online) => {
                        notify_observers(&self.observers, &LifecycleEvent::Online);
                    }
                    Some(ContextEvent::Exit(code)) => {
                        notify_observers(&self.observers, &LifecycleEvent::Exit(code));
                        return Err(ConnectError::ContextGone(format!(
                            "context exited with code {} before ready",
                            code
                        )));
                    }
                    Some(ContextEvent::Error(detail)) => {
                        notify_observers(&self.observers, &LifecycleEvent::Error(detail.clone()));
                        return Err(ConnectError::ContextGone(detail));
                    }
                    None => events_open = false,
                },
            }
        }

        // The mirror: same factory, same (materialized) arguments, same
        // unit buffer.
        let mirror = match factory(UnitInit { args, buffer }) {
            Ok(mirror) => mirror,
            Err(detail) => {
                channel.terminate.fire();
                return Err(ConnectError::Construct(detail));
            }
        };

        notify_observers(&self.observers, &LifecycleEvent::Ready);

        let ContextChannel { tx, rx, events, terminate } = channel;
        let shared = Arc::new(SessionShared {
            unit: record,
            codec,
            state: Mutex::new(SessionState::Ready),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            tx,
            mirror: Arc::new(tokio::sync::Mutex::new(mirror)),
            terminate,
            observers: self.observers,
            call_timeout: self.call_timeout,
        });
        tokio::spawn(pump(rx, events, shared.clone()));
        Ok(Session { shared })
    }
}

/// Routes context → host traffic for the session's lifetime, then applies
/// the termination outcome.
async fn pump(
    mut rx: mpsc::UnboundedReceiver<WorkerMsg>,
    mut events: mpsc::UnboundedReceiver<ContextEvent>,
    shared: Arc<SessionShared>,
) {
    let mut exit: Option<i32> = None;
    let mut failure: Option<String> = None;
    let mut events_open = true;
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => shared.handle_worker_msg(msg),
                None => break,
            },
            event = events.recv(), if events_open => match event {
                Some(event) => record_event(&shared, event, &mut exit, &mut failure),
                None => events_open = false,
            },
        }
    }
    // Message stream closed: learn why from the raw context events before
    // classifying the termination.
    while exit.is_none() && failure.is_none() {
        match events.recv().await {
            Some(event) => record_event(&shared, event, &mut exit, &mut failure),
            None => break,
        }
    }
    shared.on_context_end(exit, failure);
}

fn record_event(
    shared: &SessionShared,
    event: ContextEvent,
    exit: &mut Option<i32>,
    failure: &mut Option<String>,
) {
    match event {
        ContextEvent::Online => notify_observers(&shared.observers, &LifecycleEvent::Online),
        ContextEvent::Exit(code) => {
            notify_observers(&shared.observers, &LifecycleEvent::Exit(code));
            *exit = Some(code);
        }
        ContextEvent::Error(detail) => {
            notify_observers(&shared.observers, &LifecycleEvent::Error(detail.clone()));
            *failure = Some(detail);
        }
    }
}
