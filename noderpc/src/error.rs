//! Error type shared by every component of the dispatch engine.
//!
//! Modeled directly on `essrpc::RPCError`/`RPCErrorKind`: a kind tag
//! plus a message, with an optional serializable cause chain so an
//! error raised on one node survives being carried back to the caller
//! on another.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RpcError>;

/// A serializable snapshot of an arbitrary `std::error::Error`, used to
/// carry a cause chain across a process boundary without requiring the
/// original error type to be known on the far side.
#[derive(Debug, Deserialize, Serialize)]
pub struct GenericCause {
    description: String,
    cause: Option<Box<GenericCause>>,
}

impl GenericCause {
    pub fn new(e: &(dyn std::error::Error + 'static)) -> Self {
        let cause = e.source().map(|c| Box::new(GenericCause::new(c)));
        GenericCause {
            description: e.to_string(),
            cause,
        }
    }
}

impl fmt::Display for GenericCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(c) => write!(f, "{} caused by:\n {}", self.description, c),
            None => write!(f, "{}", self.description),
        }
    }
}

impl std::error::Error for GenericCause {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// The seven error kinds named in the dispatch engine's error handling
/// design: registration failures are fatal at init time, everything
/// else is a runtime condition a caller can match on.
#[derive(Debug, Deserialize, PartialEq, Eq, Serialize, Clone, Copy)]
pub enum RpcErrorKind {
    /// Bad method signature or parameter types, discovered at registration.
    RegistrationError,
    /// No client list, multiple clients for a non-broadcast call, or a
    /// malformed `Service.Method` string.
    RouteError,
    /// Request queue full, or no handler registered for a resolved service.
    DispatchError,
    /// Unmarshal of inbound request bytes failed.
    MarshalError,
    /// The RPC method itself returned an error.
    MethodError,
    /// Caller expected a reply but the method has no output parameter,
    /// or an async callback was given the wrong shape.
    ContractError,
    /// A method or callback panicked; recovered at the executor boundary.
    PanicError,
}

/// Error type returned by every fallible operation in this crate.
#[derive(Debug, Deserialize, Serialize)]
pub struct RpcError {
    pub kind: RpcErrorKind,
    msg: String,
    cause: Option<Box<GenericCause>>,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, msg: impl Into<String>) -> Self {
        RpcError {
            kind,
            msg: msg.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        kind: RpcErrorKind,
        msg: impl Into<String>,
        cause: &(dyn std::error::Error + 'static),
    ) -> Self {
        RpcError {
            kind,
            msg: msg.into(),
            cause: Some(Box::new(GenericCause::new(cause))),
        }
    }

    pub fn kind(&self) -> RpcErrorKind {
        self.kind
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(c) => write!(f, "{} caused by:\n {}", self.msg, c),
            None => write!(f, "{}", self.msg),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Synthesized error delivered to a caller when a method or callback
/// panics. The text is fixed to match the source system's message
/// verbatim so downstream log scraping keeps working.
pub fn panic_error() -> RpcError {
    RpcError::new(RpcErrorKind::PanicError, "call error : core dumps")
}

/// `RpcHandler %s cannot find %s` equivalent.
pub fn method_not_found(handler: &str, service_method: &str) -> RpcError {
    RpcError::new(
        RpcErrorKind::DispatchError,
        format!("RpcHandler {} cannot find {}", handler, service_method),
    )
}
