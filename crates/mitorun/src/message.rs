//! # Protocol messages
//!
//! The typed envelopes exchanged between a host and one execution context.
//! These shapes are internal to a single host/context pair and carry the
//! codec's wire trees directly; there is no cross-version compatibility
//! concern.

use mitopack::EncodedBuffer;
use mitopack::EncodedValue;
use mitopack::TypeId;

/// Why a remote operation failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// The invoked name is not registered as remotely callable.
    MethodNotRemote,
    /// The invoked name is not registered as callback-callable.
    MethodNotCallback,
    /// Encoding or decoding a payload failed.
    Codec,
    /// The method body itself failed.
    Body,
    /// Constructing the unit instance failed.
    Construct,
    /// The other side of the channel is gone.
    Detached,
}

/// Wire shape of an error: a kind plus human-readable detail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub detail: String,
}

impl Fault {
    pub fn method_not_remote(method: &str) -> Self {
        Self {
            kind: FaultKind::MethodNotRemote,
            detail: format!("method '{}' is not registered as remotely callable", method),
        }
    }

    pub fn method_not_callback(method: &str) -> Self {
        Self {
            kind: FaultKind::MethodNotCallback,
            detail: format!("method '{}' is not registered as callback-callable", method),
        }
    }

    pub fn codec(detail: impl std::fmt::Display) -> Self {
        Self {
            kind: FaultKind::Codec,
            detail: detail.to_string(),
        }
    }

    pub fn body(detail: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Body,
            detail: detail.into(),
        }
    }

    pub fn construct(detail: impl std::fmt::Display) -> Self {
        Self {
            kind: FaultKind::Construct,
            detail: detail.to_string(),
        }
    }

    pub fn detached(detail: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Detached,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FaultKind::MethodNotRemote => "not remotely callable",
            FaultKind::MethodNotCallback => "not callback-callable",
            FaultKind::Codec => "codec failure",
            FaultKind::Body => "method failed",
            FaultKind::Construct => "construction failed",
            FaultKind::Detached => "channel detached",
        };
        write!(f, "{}: {}", kind, self.detail)
    }
}

impl std::error::Error for Fault {}

/// Everything a context needs to construct its unit instance.
#[derive(Debug)]
pub struct InitPayload {
    pub unit: TypeId,
    pub ctor_args: Vec<EncodedValue>,
    /// Backing buffer for struct-typed units, pre-allocated host-side so
    /// both contexts alias the same bytes from the start.
    pub buffer: Option<EncodedBuffer>,
}

/// host → context.
#[derive(Debug)]
pub enum HostMsg {
    Invoke {
        id: u64,
        method: String,
        args: Vec<EncodedValue>,
    },
    CallbackReply {
        id: u64,
        outcome: Result<EncodedValue, Fault>,
    },
    Finalize,
}

/// context → host.
#[derive(Debug)]
pub enum WorkerMsg {
    Ready,
    InitError(Fault),
    Reply {
        id: u64,
        outcome: Result<EncodedValue, Fault>,
    },
    CallbackInvoke {
        id: u64,
        method: String,
        args: Vec<EncodedValue>,
    },
    Finalized,
}
