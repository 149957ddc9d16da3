//! The callee-side queued unit of work: one inbound call waiting to be
//! dequeued and run by a handler's executor loop.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::call::Pool;
use crate::error::{Result, RpcError, RpcErrorKind};
use crate::value::{AdditionParam, ParamValue, RpcValue};

/// Delivers `(replyOrError)` back to whoever issued the call. For a
/// same-process sync call this resolves a `oneshot` the caller is
/// awaiting; for a same-process async call it pushes a completed
/// [`crate::call::CallObject`] onto the caller handler's response
/// queue; for a cross-node call it hands the result to the transport.
/// `None` for `Go`/`CastGo`, which have no reply path.
pub type RequestHandle = Box<dyn FnOnce(Result<Box<dyn RpcValue>>) + Send>;

/// One queued inbound call, matching spec.md §3's `RpcRequest`.
pub struct RpcRequest {
    pub service_method: String,
    /// Present for remote calls or raw local calls: bytes awaiting
    /// unmarshal. Present for the local fast path: an already-typed
    /// value, used directly with no marshal/unmarshal round trip.
    pub in_param: ParamValue,
    /// Caller-owned output storage for the sync same-process fast
    /// path. `None` means the handler allocates a fresh `Output`.
    pub reply_value: Option<Box<dyn RpcValue>>,
    pub addition_param: Option<AdditionParam>,
    /// True when `in_param` may be `ParamValue::Typed` without having
    /// gone through the wire at all (skips unmarshal on dequeue).
    pub is_local: bool,
    pub request_handle: Option<RequestHandle>,
    released: AtomicBool,
}

impl RpcRequest {
    pub fn new(service_method: String, in_param: ParamValue) -> Self {
        RpcRequest {
            service_method,
            in_param,
            reply_value: None,
            addition_param: None,
            is_local: false,
            request_handle: None,
            released: AtomicBool::new(false),
        }
    }

    pub fn with_reply_value(mut self, reply_value: Box<dyn RpcValue>) -> Self {
        self.reply_value = Some(reply_value);
        self
    }

    pub fn with_addition_param(mut self, addition: AdditionParam) -> Self {
        self.addition_param = Some(addition);
        self
    }

    pub fn local(mut self) -> Self {
        self.is_local = true;
        self
    }

    pub fn with_request_handle(mut self, handle: RequestHandle) -> Self {
        self.request_handle = Some(handle);
        self
    }

    /// Deliver the outcome through `request_handle`, if any, and
    /// record this request as released. Called exactly once by the
    /// executor loop at the end of [`crate::handler::RpcHandler`]'s
    /// request-handling sequence, regardless of which step produced
    /// the outcome (missing method, unmarshal failure, contract
    /// violation, method error/success, or panic).
    pub fn finish(mut self, outcome: Result<Box<dyn RpcValue>>) -> Result<()> {
        self.mark_released()?;
        if let Some(handle) = self.request_handle.take() {
            handle(outcome);
        }
        Ok(())
    }

    fn mark_released(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(RpcError::new(
                RpcErrorKind::ContractError,
                "RpcRequest released more than once",
            ));
        }
        Ok(())
    }
}

/// Process-wide free list for [`RpcRequest`] envelopes. Recycling is
/// shallow (the struct itself, not its heap-allocated fields) since
/// `service_method`/`in_param` vary per call and get overwritten on
/// reuse; the main saving is avoiding repeated allocation of the
/// struct and its `Option` slots under steady load.
pub struct RpcRequestPool {
    pool: Pool<RpcRequest>,
}

impl RpcRequestPool {
    pub fn new() -> Self {
        RpcRequestPool { pool: Pool::new() }
    }

    pub fn acquire(&self, service_method: String, in_param: ParamValue) -> RpcRequest {
        let mut req = self.pool.acquire_or(|| RpcRequest::new(String::new(), ParamValue::None));
        req.service_method = service_method;
        req.in_param = in_param;
        req.reply_value = None;
        req.addition_param = None;
        req.is_local = false;
        req.request_handle = None;
        req.released.store(false, Ordering::SeqCst);
        req
    }
}

impl Default for RpcRequestPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_releases_exactly_once() {
        let req = RpcRequest::new("A.RPC_Echo".into(), ParamValue::None);
        req.mark_released().unwrap();
        let req2 = RpcRequest::new("A.RPC_Echo".into(), ParamValue::None);
        assert!(req2.finish(Err(RpcError::new(RpcErrorKind::MethodError, "x"))).is_ok());
    }
}
