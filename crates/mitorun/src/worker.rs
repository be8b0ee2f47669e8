//! # Context-side serve loop
//!
//! Runs inside the execution context: constructs the unit instance from the
//! init payload, announces readiness, then serves invokes one at a time to
//! completion. A routing pump keeps reverse-call replies flowing while a
//! method body is suspended on them; further invokes queue behind the one
//! in flight.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use mitopack::ByteBuf;
use mitopack::Codec;
use mitopack::Descriptor;
use mitopack::EncodedBuffer;
use mitopack::EncodedValue;

use crate::message::Fault;
use crate::message::HostMsg;
use crate::message::InitPayload;
use crate::message::WorkerMsg;
use crate::registry::Runtime;
use crate::registry::TypeRecord;
use crate::unit::Unit;
use crate::unit::UnitCx;
use crate::unit::UnitInit;

enum Work {
    Invoke {
        id: u64,
        method: String,
        args: Vec<EncodedValue>,
    },
    Shutdown,
}

/// Serves one context until finalize or host disconnect. The return value
/// is the context's exit code.
pub(crate) async fn serve(
    runtime: Arc<Runtime>,
    init: InitPayload,
    tx: mpsc::UnboundedSender<WorkerMsg>,
    rx: mpsc::UnboundedReceiver<HostMsg>,
) -> i32 {
    let codec = runtime.codec();
    let record = match runtime.record(init.unit) {
        Ok(record) => record,
        Err(e) => {
            let _ = tx.send(WorkerMsg::InitError(Fault::construct(e)));
            return 1;
        }
    };
    let mut servant = match construct(&codec, &record, init) {
        Ok(servant) => servant,
        Err(fault) => {
            let _ = tx.send(WorkerMsg::InitError(fault));
            return 1;
        }
    };
    if tx.send(WorkerMsg::Ready).is_err() {
        return 0;
    }
    tracing::debug!(unit = %record.name, "context ready");

    let pending: Arc<DashMap<u64, oneshot::Sender<Result<EncodedValue, Fault>>>> =
        Arc::new(DashMap::new());
    let (work_tx, mut work_rx) = mpsc::unbounded_channel::<Work>();
    let router = tokio::spawn(route(rx, work_tx, pending.clone()));
    let cx = UnitCx::worker(tx.clone(), pending, record.clone(), codec.clone());

    while let Some(work) = work_rx.recv().await {
        match work {
            Work::Invoke { id, method, args } => {
                let outcome = handle_invoke(&codec, &record, servant.as_mut(), &cx, &method, args).await;
                if tx.send(WorkerMsg::Reply { id, outcome }).is_err() {
                    break;
                }
            }
            Work::Shutdown => {
                let _ = tx.send(WorkerMsg::Finalized);
                break;
            }
        }
    }
    router.abort();
    0
}

/// Demultiplexes host messages: invokes queue serially, reverse-call
/// replies settle their pending slot immediately.
async fn route(
    mut rx: mpsc::UnboundedReceiver<HostMsg>,
    work_tx: mpsc::UnboundedSender<Work>,
    pending: Arc<DashMap<u64, oneshot::Sender<Result<EncodedValue, Fault>>>>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            HostMsg::Invoke { id, method, args } => {
                if work_tx.send(Work::Invoke { id, method, args }).is_err() {
                    break;
                }
            }
            HostMsg::CallbackReply { id, outcome } => match pending.remove(&id) {
                Some((_, settle)) => {
                    let _ = settle.send(outcome);
                }
                None => tracing::warn!(id, "callback reply with no pending reverse call"),
            },
            HostMsg::Finalize => break,
        }
    }
    // Finalizing or host gone: nothing will answer reverse calls anymore.
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, settle)) = pending.remove(&id) {
            let _ = settle.send(Err(Fault::detached("host channel closed")));
        }
    }
    let _ = work_tx.send(Work::Shutdown);
}

fn construct(
    codec: &Codec,
    record: &Arc<TypeRecord>,
    init: InitPayload,
) -> Result<Box<dyn Unit>, Fault> {
    let factory = record
        .factory
        .clone()
        .ok_or_else(|| Fault::construct(format!("'{}' is not a constructible unit", record.name)))?;

    let mut args = Vec::with_capacity(init.ctor_args.len());
    for (index, encoded) in init.ctor_args.into_iter().enumerate() {
        let desc = record
            .ctor
            .get(index)
            .map(|p| p.desc.clone())
            .unwrap_or(Descriptor::None);
        args.push(codec.decode(encoded, &desc).map_err(|e| Fault::codec(e))?);
    }

    let buffer = match init.buffer {
        Some(EncodedBuffer::Shared { region, offset, len }) => Some(
            ByteBuf::region_view(region, offset, len).map_err(|e| Fault::construct(e))?,
        ),
        Some(EncodedBuffer::Owned(bytes)) => Some(ByteBuf::owned(bytes)),
        None => None,
    };

    factory(UnitInit { args, buffer }).map_err(Fault::construct)
}

async fn handle_invoke(
    codec: &Codec,
    record: &Arc<TypeRecord>,
    servant: &mut dyn Unit,
    cx: &UnitCx,
    method: &str,
    args: Vec<EncodedValue>,
) -> Result<EncodedValue, Fault> {
    let Some(sig) = record.remote.get(method) else {
        return Err(Fault::method_not_remote(method));
    };

    let mut vals = Vec::with_capacity(args.len());
    for (index, encoded) in args.into_iter().enumerate() {
        let desc = sig.params.get(index).cloned().unwrap_or(Descriptor::None);
        vals.push(codec.decode(encoded, &desc).map_err(|e| Fault::codec(e))?);
    }

    let out = servant.invoke(method, vals, cx).await?;
    codec.encode(&out, &sig.ret).map_err(|e| Fault::codec(e))
}
