//! # Unit behavior
//!
//! A unit is the object whose methods run inside an isolated context. Its
//! behavior is a trait object produced by the factory installed at
//! registration; the same factory builds both the context-side instance and
//! the host-side mirror, so the two stay behaviorally identical.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use mitopack::ByteBuf;
use mitopack::Codec;
use mitopack::Descriptor;
use mitopack::EncodedValue;
use mitopack::Value;

use crate::message::Fault;
use crate::message::WorkerMsg;
use crate::registry::TypeRecord;

/// Decoded constructor input handed to a unit factory.
pub struct UnitInit {
    pub args: Vec<Value>,
    /// Backing buffer for struct-typed units.
    pub buffer: Option<ByteBuf>,
}

/// Builds a unit instance from decoded constructor input. Runs on both
/// sides of the boundary.
pub type UnitFactory = Arc<dyn Fn(UnitInit) -> Result<Box<dyn Unit>, String> + Send + Sync>;

/// The behavior of a unit instance. One `invoke` runs to completion at a
/// time on any given instance.
#[async_trait]
pub trait Unit: Send {
    async fn invoke(&mut self, method: &str, args: Vec<Value>, cx: &UnitCx)
    -> Result<Value, Fault>;
}

enum CxInner {
    /// Host-side mirror: callback methods run locally, so there is no
    /// channel to hop over.
    Host,
    /// Context side: reverse calls cross the channel and suspend until the
    /// matching reply.
    Worker {
        tx: UnboundedSender<WorkerMsg>,
        pending: Arc<DashMap<u64, oneshot::Sender<Result<EncodedValue, Fault>>>>,
        next_id: AtomicU64,
        unit: Arc<TypeRecord>,
        codec: Codec,
    },
}

/// Execution context handed to every `invoke`.
pub struct UnitCx {
    inner: CxInner,
}

impl UnitCx {
    pub(crate) fn host() -> Self {
        Self { inner: CxInner::Host }
    }

    pub(crate) fn worker(
        tx: UnboundedSender<WorkerMsg>,
        pending: Arc<DashMap<u64, oneshot::Sender<Result<EncodedValue, Fault>>>>,
        unit: Arc<TypeRecord>,
        codec: Codec,
    ) -> Self {
        Self {
            inner: CxInner::Worker {
                tx,
                pending,
                next_id: AtomicU64::new(1),
                unit,
                codec,
            },
        }
    }

    /// Issues a reverse call: the named callback method runs on the host's
    /// mirrored instance, not here. Suspends until the host replies.
    pub async fn callback(&self, method: &str, args: Vec<Value>) -> Result<Value, Fault> {
        let CxInner::Worker { tx, pending, next_id, unit, codec } = &self.inner else {
            return Err(Fault::detached(
                "reverse calls are only available inside a worker context",
            ));
        };

        let Some(sig) = unit.callback.get(method) else {
            return Err(Fault::method_not_callback(method));
        };

        let mut encoded = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let desc = sig.params.get(index).cloned().unwrap_or(Descriptor::None);
            encoded.push(codec.encode(arg, &desc).map_err(|e| Fault::codec(e))?);
        }

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let (settle, settled) = oneshot::channel();
        pending.insert(id, settle);

        let sent = tx.send(WorkerMsg::CallbackInvoke {
            id,
            method: method.to_string(),
            args: encoded,
        });
        if sent.is_err() {
            pending.remove(&id);
            return Err(Fault::detached("host channel closed"));
        }

        let outcome = settled
            .await
            .map_err(|_| Fault::detached("host channel closed"))?;
        let encoded = outcome?;
        codec.decode(encoded, &sig.ret).map_err(|e| Fault::codec(e))
    }
}
