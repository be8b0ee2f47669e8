//! Protocol and registration tests against scripted context hosts.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use mitopack::Descriptor;
use mitopack::EncodedBuffer;
use mitopack::EncodedValue;
use mitopack::StructRef;
use mitopack::TypeId;
use mitopack::Value;

use crate::host::ContextChannel;
use crate::host::ContextEvent;
use crate::host::ContextHost;
use crate::host::HostError;
use crate::host::LifecycleEvent;
use crate::host::LifecycleObserver;
use crate::host::TerminateHandle;
use crate::message::Fault;
use crate::message::HostMsg;
use crate::message::InitPayload;
use crate::message::WorkerMsg;
use crate::registry::ClassSpec;
use crate::registry::Error as RegistryError;
use crate::registry::Runtime;
use crate::registry::StructLayout;
use crate::registry::UnitSpec;
use crate::session::CallError;
use crate::session::ConnectError;
use crate::session::Session;
use crate::session::SessionState;
use crate::unit::Unit;
use crate::unit::UnitCx;

/// The far end of a scripted context: the test plays the worker.
struct PipeRemote {
    rx: mpsc::UnboundedReceiver<HostMsg>,
    tx: mpsc::UnboundedSender<WorkerMsg>,
    events: mpsc::UnboundedSender<ContextEvent>,
}

/// Hands out one pre-built channel instead of spawning anything.
struct PipeHost {
    slot: Mutex<Option<ContextChannel>>,
}

fn pipe() -> (Arc<PipeHost>, PipeRemote) {
    let (host_tx, worker_rx) = mpsc::unbounded_channel();
    let (worker_tx, host_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let channel = ContextChannel {
        tx: host_tx,
        rx: host_rx,
        events: event_rx,
        terminate: TerminateHandle::noop(),
    };
    (
        Arc::new(PipeHost {
            slot: Mutex::new(Some(channel)),
        }),
        PipeRemote {
            rx: worker_rx,
            tx: worker_tx,
            events: event_tx,
        },
    )
}

#[async_trait]
impl ContextHost for PipeHost {
    async fn open(&self, _entry: &str, _init: InitPayload) -> Result<ContextChannel, HostError> {
        self.slot
            .lock()
            .take()
            .ok_or_else(|| HostError::Open("pipe channel already taken".into()))
    }
}

struct Echo;

#[async_trait]
impl Unit for Echo {
    async fn invoke(&mut self, method: &str, args: Vec<Value>, _cx: &UnitCx) -> Result<Value, Fault> {
        match method {
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            _ => Err(Fault::method_not_remote(method)),
        }
    }
}

fn echo_runtime() -> (Arc<Runtime>, TypeId) {
    let runtime = Runtime::new();
    let unit = runtime
        .register_unit(
            UnitSpec::new("Echo", "units/echo")
                .remote_method("echo", vec![Descriptor::None], Descriptor::None)
                .factory(|_| Ok(Box::new(Echo))),
        )
        .expect("register echo unit");
    (runtime, unit)
}

/// Connects a session against a scripted context that is already `ready`.
async fn pipe_session(runtime: Arc<Runtime>, unit: TypeId) -> (Session, PipeRemote) {
    let (host, remote) = pipe();
    remote.tx.send(WorkerMsg::Ready).unwrap();
    let session = Session::builder(runtime, unit)
        .host(host)
        .connect()
        .await
        .expect("connect");
    (session, remote)
}

#[tokio::test]
async fn replies_match_by_id_not_by_order() {
    let (runtime, unit) = echo_runtime();
    let (session, mut remote) = pipe_session(runtime, unit).await;

    let spawn_call = |n: i64| {
        let session = session.clone();
        tokio::spawn(async move { session.call("echo", vec![Value::Int(n)]).await })
    };
    let c1 = spawn_call(1);
    let c2 = spawn_call(2);
    let c3 = spawn_call(3);

    let mut invokes = Vec::new();
    for _ in 0..3 {
        match remote.rx.recv().await.unwrap() {
            HostMsg::Invoke { id, args, .. } => invokes.push((id, args)),
            other => panic!("expected invoke, got {:?}", other),
        }
    }

    // Reply second, first, third — each with its own argument.
    for index in [1, 0, 2] {
        let (id, args) = &invokes[index];
        remote
            .tx
            .send(WorkerMsg::Reply {
                id: *id,
                outcome: Ok(args[0].clone()),
            })
            .unwrap();
    }

    assert_eq!(c1.await.unwrap().unwrap(), Value::Int(1));
    assert_eq!(c2.await.unwrap().unwrap(), Value::Int(2));
    assert_eq!(c3.await.unwrap().unwrap(), Value::Int(3));
}

#[tokio::test]
async fn finalize_rejects_outstanding_and_later_calls() {
    let (runtime, unit) = echo_runtime();
    let (session, mut remote) = pipe_session(runtime, unit).await;

    let spawn_call = |n: i64| {
        let session = session.clone();
        tokio::spawn(async move { session.call("echo", vec![Value::Int(n)]).await })
    };
    let c1 = spawn_call(1);
    let c2 = spawn_call(2);

    // Both calls are on the wire and pending.
    for _ in 0..2 {
        assert!(matches!(
            remote.rx.recv().await.unwrap(),
            HostMsg::Invoke { .. }
        ));
    }

    session.finalize();
    assert_eq!(session.state(), SessionState::Finalized);

    // Rejected immediately, without any round trip.
    assert!(matches!(c1.await.unwrap(), Err(CallError::Finalized)));
    assert!(matches!(c2.await.unwrap(), Err(CallError::Finalized)));

    // A later call rejects synchronously and sends nothing.
    let err = session.call("echo", vec![Value::Int(3)]).await.unwrap_err();
    assert!(matches!(err, CallError::Finalized));

    assert!(matches!(remote.rx.recv().await, Some(HostMsg::Finalize)));
    assert!(remote.rx.try_recv().is_err());
}

#[tokio::test]
async fn context_failure_bulk_rejects_pending_calls() {
    let (runtime, unit) = echo_runtime();
    let (session, mut remote) = pipe_session(runtime, unit).await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.call("echo", vec![Value::Int(1)]).await })
    };
    assert!(matches!(
        remote.rx.recv().await.unwrap(),
        HostMsg::Invoke { .. }
    ));

    remote
        .events
        .send(ContextEvent::Error("boom".into()))
        .unwrap();
    drop(remote);

    match pending.await.unwrap() {
        Err(CallError::Terminated(detail)) => assert_eq!(detail, "boom"),
        other => panic!("expected Terminated, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::WorkerError("boom".into()));

    let err = session.call("echo", vec![Value::Int(2)]).await.unwrap_err();
    assert!(matches!(err, CallError::Terminated(_)));
}

#[tokio::test]
async fn context_exit_carries_the_code() {
    let (runtime, unit) = echo_runtime();
    let (session, remote) = pipe_session(runtime, unit).await;

    remote.events.send(ContextEvent::Exit(3)).unwrap();
    drop(remote);

    // Wait for the pump to classify the termination.
    for _ in 0..100 {
        if session.state() != SessionState::Ready {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    assert_eq!(session.state(), SessionState::Exited(3));
}

#[tokio::test]
async fn unknown_method_fails_without_touching_the_channel() {
    let (runtime, unit) = echo_runtime();
    let (session, mut remote) = pipe_session(runtime, unit).await;

    let err = session.call("nope", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::MethodNotRemote(_)));
    assert!(remote.rx.try_recv().is_err());
}

#[tokio::test]
async fn encode_failure_sends_no_partial_message() {
    let runtime = Runtime::new();
    let node = runtime
        .register_class(ClassSpec::new("Node"))
        .expect("register node");
    let unit = runtime
        .register_unit(
            UnitSpec::new("Echo", "units/echo")
                .remote_method("echo", vec![Descriptor::typed(node)], Descriptor::None)
                .factory(|_| Ok(Box::new(Echo))),
        )
        .expect("register unit");
    let (session, mut remote) = pipe_session(runtime, unit).await;

    let a = mitopack::ObjRef::typed(node);
    let b = mitopack::ObjRef::typed(node);
    a.set("next", Value::Instance(b.clone()));
    b.set("next", Value::Instance(a.clone()));

    let err = session.call("echo", vec![Value::Instance(a)]).await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Codec(mitopack::codec::Error::CircularReference)
    ));
    assert!(remote.rx.try_recv().is_err());
}

#[tokio::test]
async fn init_error_fails_the_connect() {
    let (runtime, unit) = echo_runtime();
    let (host, remote) = pipe();
    remote
        .tx
        .send(WorkerMsg::InitError(Fault::construct("bad seed")))
        .unwrap();

    let err = Session::builder(runtime, unit)
        .host(host)
        .connect()
        .await
        .unwrap_err();
    match err {
        ConnectError::Init(fault) => assert!(fault.detail.contains("bad seed")),
        other => panic!("expected Init, got {:?}", other),
    }
}

/// Records every notification it receives; fails on purpose to prove
/// observer errors never propagate.
struct RecordingObserver {
    seen: Mutex<Vec<LifecycleEvent>>,
}

impl LifecycleObserver for RecordingObserver {
    fn notify(&self, event: &LifecycleEvent) -> Result<(), String> {
        self.seen.lock().push(event.clone());
        Err("observer always fails".into())
    }
}

#[tokio::test]
async fn observers_see_lifecycle_events_and_may_fail() {
    let (runtime, unit) = echo_runtime();
    let (host, remote) = pipe();
    remote.events.send(ContextEvent::Online).unwrap();
    remote.tx.send(WorkerMsg::Ready).unwrap();

    let observer = Arc::new(RecordingObserver {
        seen: Mutex::new(Vec::new()),
    });
    let session = Session::builder(runtime, unit)
        .host(host)
        .observer(observer.clone())
        .connect()
        .await
        .expect("connect despite failing observer");

    remote.events.send(ContextEvent::Exit(0)).unwrap();
    drop(remote);

    for _ in 0..100 {
        if observer.seen.lock().contains(&LifecycleEvent::Exit(0)) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    let seen = observer.seen.lock();
    assert!(seen.contains(&LifecycleEvent::Ready));
    assert!(seen.contains(&LifecycleEvent::Exit(0)));
    drop(seen);
    let _ = session;
}

#[test]
fn shareable_parameter_must_pass_the_scan() {
    let runtime = Runtime::new();
    let plain = runtime
        .register_class(ClassSpec::new("Plain").prop("label", Descriptor::None))
        .expect("register plain");

    let err = runtime
        .register_unit(
            UnitSpec::new("Bad", "units/bad")
                .shared_ctor_param(Descriptor::typed(plain))
                .factory(|_| Ok(Box::new(Echo))),
        )
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnshareableType { index: 0, .. }));

    // An undescribed parameter cannot prove shareability either.
    let err = runtime
        .register_unit(
            UnitSpec::new("Bad", "units/bad")
                .shared_ctor_param(Descriptor::None)
                .factory(|_| Ok(Box::new(Echo))),
        )
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnshareableType { .. }));

    // The failed registration left the name free.
    runtime
        .register_unit(
            UnitSpec::new("Bad", "units/bad")
                .shared_ctor_param(Descriptor::typed(runtime.bytes_type()))
                .factory(|_| Ok(Box::new(Echo))),
        )
        .expect("bytes-typed parameter is shareable");
}

#[test]
fn type_cycle_fails_registration() {
    let runtime = Runtime::new();
    let a = runtime.declare("A").unwrap();
    let b = runtime.declare("B").unwrap();
    runtime
        .define_class(a, ClassSpec::new("A").prop("b", Descriptor::typed(b)))
        .unwrap();
    runtime
        .define_class(b, ClassSpec::new("B").prop("a", Descriptor::typed(a)))
        .unwrap();

    let err = runtime
        .register_unit(
            UnitSpec::new("Cyclic", "units/cyclic")
                .shared_ctor_param(Descriptor::typed(a))
                .factory(|_| Ok(Box::new(Echo))),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Scan(mitoshm::Error::CircularTypeReference(_))
    ));
}

#[test]
fn struct_factory_override_runs_on_bind() {
    let runtime = Runtime::new();
    let cell = runtime.declare("Cell").unwrap();
    runtime
        .define_class(
            cell,
            ClassSpec::new("Cell").layout(StructLayout::new(2).factory(move |buf| {
                // Non-standard construction path installed at registration.
                let instance = StructRef::new(cell, buf);
                instance.set_extra("origin", Value::text("override"));
                Ok(instance)
            })),
        )
        .unwrap();

    let codec = runtime.codec();
    let encoded = EncodedValue::Struct {
        type_id: cell,
        buf: EncodedBuffer::Owned(vec![7, 7]),
        extra: Vec::new(),
    };
    let out = codec.decode(encoded, &Descriptor::None).unwrap();
    let out = out.as_struct().unwrap();
    assert_eq!(out.get_extra("origin"), Some(Value::text("override")));
    assert_eq!(out.buffer().snapshot(), vec![7, 7]);
}

#[test]
fn duplicate_names_are_rejected() {
    let runtime = Runtime::new();
    runtime.register_class(ClassSpec::new("Point")).unwrap();
    let err = runtime.register_class(ClassSpec::new("Point")).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateName(_)));
}

#[tokio::test]
async fn registry_seals_when_the_first_session_opens() {
    let (runtime, unit) = echo_runtime();
    let (_session, _remote) = pipe_session(runtime.clone(), unit).await;

    let err = runtime.register_class(ClassSpec::new("Late")).unwrap_err();
    assert!(matches!(err, RegistryError::Sealed));
}
