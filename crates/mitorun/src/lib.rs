//! # mitorun
//!
//! Run a unit's methods inside an isolated execution context while keeping
//! a mirrored, locally usable instance on the caller's side. Values cross
//! the boundary through the `mitopack` codec; backing bytes cross by
//! reference through `mitoshm` shared regions whenever the registration
//! designates them shareable.

pub mod host;
pub mod message;
pub mod registry;
pub mod session;
pub mod unit;
mod worker;

pub use host::ContextChannel;
pub use host::ContextEvent;
pub use host::ContextHost;
pub use host::HostError;
pub use host::LifecycleEvent;
pub use host::LifecycleObserver;
pub use host::TaskHost;
pub use host::TerminateHandle;
pub use message::Fault;
pub use message::FaultKind;
pub use message::HostMsg;
pub use message::InitPayload;
pub use message::WorkerMsg;
pub use registry::ClassSpec;
pub use registry::Runtime;
pub use registry::StructLayout;
pub use registry::UnitSpec;
pub use session::CallError;
pub use session::ConnectError;
pub use session::Session;
pub use session::SessionBuilder;
pub use session::SessionState;
pub use unit::Unit;
pub use unit::UnitCx;
pub use unit::UnitFactory;
pub use unit::UnitInit;

#[cfg(test)]
mod tests;
