//! The per-service executor: a single logical consumer draining a
//! request queue and a response queue, per spec.md §4.2.
//!
//! The source system runs each `RpcHandler` on its own goroutine over
//! two buffered channels. This crate keeps that shape almost literally:
//! one `tokio::task` owns the service instance exclusively and drains
//! a request [`mpsc`] channel (inbound calls to invoke) and a response
//! channel (completed [`CallObject`]s from calls *this* handler issued
//! asynchronously), chosen fairly via `tokio::select!`'s default
//! unbiased polling. Because the service is only ever touched from
//! that one task, `H` does not need to be `Sync` -- a service built
//! around a `RefCell` for its mutable state is as legitimate here as
//! one with no interior mutability at all.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::call::CallObject;
use crate::codec::Codec;
use crate::dispatcher::{Client, Dispatcher, Directory, LocalHandle};
use crate::error::{method_not_found, panic_error, Result, RpcError, RpcErrorKind};
use crate::method_table::{MethodTable, MethodTableBuilder, RpcService};
use crate::request::RpcRequest;
use crate::value::{AdditionParam, ParamValue, RpcValue};

/// Cap on the stack snapshot attached to a recovered panic's log line,
/// matching the source system's `buf := make([]byte, 4096)` passed to
/// `runtime.Stack`.
const PANIC_STACK_CAP: usize = 4096;

thread_local! {
    /// Stashed by the panic hook installed in [`ensure_panic_hook_installed`]
    /// so the `catch_unwind` call sites in this module can attach a stack
    /// snapshot to the panic they just recovered, the same information
    /// the source system gets for free from `runtime.Stack` inside its
    /// `defer recover()` block.
    static LAST_PANIC_STACK: RefCell<String> = RefCell::new(String::new());
}

static PANIC_HOOK_INIT: Once = Once::new();

/// Installs a process-wide panic hook, once, that captures a backtrace
/// for the panicking thread into [`LAST_PANIC_STACK`] instead of
/// printing it -- this module's `catch_unwind` sites are themselves the
/// recovery point, so nothing should reach the default stderr printer.
fn ensure_panic_hook_installed() {
    PANIC_HOOK_INIT.call_once(|| {
        panic::set_hook(Box::new(|_info| {
            let backtrace = std::backtrace::Backtrace::force_capture();
            LAST_PANIC_STACK.with(|cell| {
                *cell.borrow_mut() = backtrace.to_string();
            });
        }));
    });
}

/// Recover a human-readable message from a `catch_unwind` payload, the
/// way the source system's `recover()` gets back whatever value was
/// passed to `panic(...)`.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The stack snapshot captured by the most recent panic on this thread,
/// truncated to [`PANIC_STACK_CAP`] bytes at a `char` boundary.
fn take_panic_stack() -> String {
    LAST_PANIC_STACK.with(|cell| {
        let stack = cell.borrow();
        if stack.len() <= PANIC_STACK_CAP {
            stack.clone()
        } else {
            let mut end = PANIC_STACK_CAP;
            while end > 0 && !stack.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated)", &stack[..end])
        }
    })
}

/// Bound on each handler's two queues. Past this, [`RpcHandler::push_request`]
/// (and every dispatch shape built on it) fails fast with
/// `RpcErrorKind::DispatchError` rather than applying backpressure by
/// blocking -- spec.md's "non-recoverable channel-full error".
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000_000;

/// A cheap, cloneable handle onto a running handler: its identity, its
/// request queue, and the shared [`Dispatcher`] used to reach other
/// handlers. This is what calling code holds -- it does not name the
/// service type `H`, since a caller only ever needs to know the
/// `Req`/`Resp` shape of the method it's calling, not the callee's
/// concrete implementation.
#[derive(Clone)]
pub struct RpcHandler<C = crate::codec::BincodeCodec> {
    name: String,
    request_tx: mpsc::Sender<RpcRequest>,
    response_tx: mpsc::Sender<CallObject>,
    dispatcher: Arc<Dispatcher<C>>,
}

impl<C: Codec> RpcHandler<C> {
    /// Build and spawn the executor for `service`, returning the
    /// handle callers use to reach it and the `JoinHandle` for the
    /// background task. The handle is also what `service`'s own
    /// `Directory` implementation should hand back for calls addressed
    /// to this handler's name.
    pub fn spawn<H>(
        service: H,
        codec: C,
        directory: Arc<dyn Directory>,
    ) -> (RpcHandler<C>, JoinHandle<()>)
    where
        H: RpcService,
    {
        Self::spawn_with_capacity(service, codec, directory, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity<H>(
        service: H,
        codec: C,
        directory: Arc<dyn Directory>,
        queue_capacity: usize,
    ) -> (RpcHandler<C>, JoinHandle<()>)
    where
        H: RpcService,
    {
        let name = service.service_name().to_string();
        let (request_tx, request_rx) = mpsc::channel(queue_capacity);
        let (response_tx, response_rx) = mpsc::channel(queue_capacity);

        let codec = Arc::new(codec);
        let dispatcher = Arc::new(Dispatcher::new(directory, codec.clone()));

        let mut builder: MethodTableBuilder<H, C> = MethodTableBuilder::new(name.clone());
        H::register_methods(&mut builder);
        let table = builder.build();

        let handle = RpcHandler {
            name: name.clone(),
            request_tx,
            response_tx,
            dispatcher: dispatcher.clone(),
        };

        let executor = Executor {
            name,
            service,
            table,
            codec,
            request_rx,
            response_rx,
            dispatcher,
        };
        let join = tokio::spawn(executor.run());
        (handle, join)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This handler's own request queue -- what a [`Directory`]
    /// implementation should wrap in a [`LocalHandle`] when resolving
    /// calls addressed to `self.name()`.
    pub fn local_handle(&self) -> LocalHandle {
        LocalHandle {
            service_name: self.name.clone(),
            request_tx: self.request_tx.clone(),
        }
    }

    fn push_request(&self, req: RpcRequest) -> Result<()> {
        self.request_tx.try_send(req).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                RpcError::new(RpcErrorKind::DispatchError, "RpcHandler Rpc Channel is full.")
            }
            mpsc::error::TrySendError::Closed(_) => RpcError::new(
                RpcErrorKind::DispatchError,
                "RpcHandler Rpc Channel is closed.",
            ),
        })
    }

    /// Deliver `input` straight to this handler's own queue without
    /// consulting the `Directory` -- the same shortcut the source
    /// system's `myselfRpcHandlerGo` takes, just expressed as "skip
    /// resolution", not "skip the queue" (see dispatcher.rs).
    pub fn push_raw(&self, req: RpcRequest) -> Result<()> {
        self.push_request(req)
    }

    /// `Call`: sync, single destination, blocks the caller's task
    /// (never the handler's own) until the reply arrives.
    pub async fn call<Req, Resp>(&self, service_method: &str, input: Req) -> Result<Resp>
    where
        Req: RpcValue + serde::Serialize + 'static,
        Resp: RpcValue + Default + 'static,
    {
        self.dispatcher.call(0, service_method, input).await
    }

    /// `CallNode`: sync, pinned to a specific node.
    pub async fn call_node<Req, Resp>(
        &self,
        node_id: u64,
        service_method: &str,
        input: Req,
    ) -> Result<Resp>
    where
        Req: RpcValue + serde::Serialize + 'static,
        Resp: RpcValue + Default + 'static,
    {
        self.dispatcher.call(node_id, service_method, input).await
    }

    /// `AsyncCall`: returns immediately; `callback` fires on this
    /// handler's own executor once the call completes, so it runs with
    /// the same single-consumer guarantee as every registered method.
    pub fn async_call<Req, Resp, F>(&self, service_method: &str, input: Req, callback: F)
    where
        Req: RpcValue + serde::Serialize + 'static,
        Resp: RpcValue + Default + 'static,
        F: FnOnce(Box<Resp>, Option<RpcError>) + Send + 'static,
    {
        self.dispatcher
            .async_call(self.response_tx.clone(), 0, service_method, input, callback)
    }

    /// `AsyncCallNode`.
    pub fn async_call_node<Req, Resp, F>(
        &self,
        node_id: u64,
        service_method: &str,
        input: Req,
        callback: F,
    ) where
        Req: RpcValue + serde::Serialize + 'static,
        Resp: RpcValue + Default + 'static,
        F: FnOnce(Box<Resp>, Option<RpcError>) + Send + 'static,
    {
        self.dispatcher.async_call(
            self.response_tx.clone(),
            node_id,
            service_method,
            input,
            callback,
        )
    }

    /// `Go`: fire-and-forget, single destination.
    pub fn go<Req>(&self, service_method: &str, input: Req) -> Result<()>
    where
        Req: RpcValue + serde::Serialize + 'static,
    {
        self.dispatcher.go(0, service_method, input)
    }

    /// `GoNode`.
    pub fn go_node<Req>(&self, node_id: u64, service_method: &str, input: Req) -> Result<()>
    where
        Req: RpcValue + serde::Serialize + 'static,
    {
        self.dispatcher.go(node_id, service_method, input)
    }

    /// `CastGo`: fire-and-forget, every resolved destination.
    pub fn cast_go<Req>(&self, service_method: &str, input: Req)
    where
        Req: RpcValue + serde::Serialize + 'static,
    {
        self.dispatcher.cast_go(service_method, input)
    }

    /// `RawGoNode`: payload is already serialized -- for a client that
    /// marshalled once and wants to forward the identical bytes.
    pub fn raw_go_node(
        &self,
        node_id: u64,
        service_method: &str,
        bytes: Vec<u8>,
        addition: Option<AdditionParam>,
    ) -> Result<()> {
        self.dispatcher.raw_go_node(node_id, service_method, bytes, addition)
    }

    /// `RawCastGo`: payload already serialized, broadcast. Per
    /// spec.md's REDESIGN FLAG this always routes through the raw
    /// path, unlike the source system's implementation.
    pub fn raw_cast_go(&self, service_method: &str, bytes: Vec<u8>, addition: Option<AdditionParam>) {
        self.dispatcher.raw_cast_go(service_method, bytes, addition)
    }
}

/// Owns the service instance and the method table; runs as a single
/// `tokio::task` for the lifetime of the handler.
struct Executor<H, C> {
    name: String,
    service: H,
    table: MethodTable<H, C>,
    codec: Arc<C>,
    request_rx: mpsc::Receiver<RpcRequest>,
    response_rx: mpsc::Receiver<CallObject>,
    dispatcher: Arc<Dispatcher<C>>,
}

impl<H: RpcService, C: Codec> Executor<H, C> {
    async fn run(mut self) {
        ensure_panic_hook_installed();
        loop {
            tokio::select! {
                Some(req) = self.request_rx.recv() => self.handle_request(req),
                Some(call) = self.response_rx.recv() => self.handle_response(call),
                else => break,
            }
        }
    }

    fn handle_request(&self, mut req: RpcRequest) {
        let outcome = self.invoke(&mut req);
        if let Err(e) = req.finish(outcome) {
            log::error!("{} delivering reply for {}: {}", self.name, req_method_hint(&e), e);
        }
    }

    /// The eight-step request-handling sequence from spec.md §4.2:
    /// look the method up, unmarshal or reuse the input, allocate or
    /// reuse the output, invoke under panic recovery, and hand the
    /// outcome back.
    fn invoke(&self, req: &mut RpcRequest) -> Result<Box<dyn RpcValue>> {
        let descriptor = self
            .table
            .get(&req.service_method)
            .ok_or_else(|| method_not_found(&self.name, &req.service_method))?;

        let input: Box<dyn RpcValue> = match std::mem::replace(&mut req.in_param, ParamValue::None) {
            ParamValue::Typed(v) => v,
            ParamValue::Bytes(bytes) => descriptor.unmarshal_input(&self.codec, &bytes)?,
            ParamValue::None => {
                return Err(RpcError::new(
                    RpcErrorKind::MarshalError,
                    "missing input parameter",
                ))
            }
        };

        // Step 5: a method with no output parameter cannot satisfy a
        // caller who expects a reply.
        if !descriptor.has_output && req.request_handle.is_some() {
            return Err(RpcError::new(
                RpcErrorKind::ContractError,
                format!("Call Rpc {} without return parameter!", req.service_method),
            ));
        }

        let mut output = req.reply_value.take().or_else(|| descriptor.alloc_output());
        let addition = req.addition_param.as_ref();
        let service = &self.service;

        let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| {
            descriptor.invoke(service, addition, input.as_ref(), output.as_deref_mut())
        }));

        match invoked {
            Ok(Ok(())) => Ok(output.unwrap_or_else(|| Box::new(()) as Box<dyn RpcValue>)),
            Ok(Err(e)) => Err(e),
            Err(panic) => {
                log::error!(
                    "{} panicked handling {}: {}\n{}",
                    self.name,
                    req.service_method,
                    panic_message(&*panic),
                    take_panic_stack(),
                );
                Err(panic_error())
            }
        }
    }

    fn handle_response(&self, mut call: CallObject) {
        let callback = call.callback.take();
        let reply = call.reply.take();
        let err = call.err.take();
        if let Err(e) = self.dispatcher.call_pool().release(call) {
            log::error!("{}: {}", self.name, e);
        }
        if let Some(cb) = callback {
            let reply = reply.unwrap_or_else(|| Box::new(()) as Box<dyn RpcValue>);
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| cb(reply, err)));
            if let Err(panic) = outcome {
                log::error!(
                    "{} panicked in an async call callback: {}\n{}",
                    self.name,
                    panic_message(&*panic),
                    take_panic_stack(),
                );
            }
        }
    }
}

/// Error messages already name the failing `service.method`; this just
/// keeps `handle_request`'s log line from repeating it twice.
fn req_method_hint(_e: &RpcError) -> &'static str {
    "request"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use crate::error::RpcErrorKind;
    use crate::method_table::MethodTableBuilder;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default, Serialize, Deserialize)]
    struct EchoReq {
        text: String,
    }
    #[derive(Default, Serialize, Deserialize)]
    struct EchoResp {
        text: String,
    }

    struct Echo;
    impl Echo {
        fn rpc_echo(&self, input: &EchoReq, output: &mut EchoResp) -> Result<()> {
            output.text = input.text.clone();
            Ok(())
        }
        fn rpc_boom(&self, _input: &EchoReq, _output: &mut EchoResp) -> Result<()> {
            panic!("boom");
        }
        fn rpc_fail(&self, _input: &EchoReq, _output: &mut EchoResp) -> Result<()> {
            Err(RpcError::new(RpcErrorKind::MethodError, "deliberate failure"))
        }
        fn rpc_no_output(&self, _add: &NoAddition, _input: &EchoReq) -> Result<()> {
            Ok(())
        }
    }
    impl RpcService for Echo {
        fn service_name(&self) -> &str {
            "Echo"
        }
        fn register_methods<C: Codec>(builder: &mut MethodTableBuilder<Self, C>) {
            builder.method("RPC_Echo", Echo::rpc_echo);
            builder.method("RPC_Boom", Echo::rpc_boom);
            builder.method("RPC_Fail", Echo::rpc_fail);
            builder.method_fire("RPC_NoOutput", Echo::rpc_no_output);
        }
    }

    #[derive(Default)]
    struct NoAddition;

    /// Resolves every `Service.Method` to whichever single local
    /// handler was registered for that service name.
    struct StaticDirectory {
        handlers: StdMutex<HashMap<String, LocalHandle>>,
    }
    impl StaticDirectory {
        fn new() -> Arc<Self> {
            Arc::new(StaticDirectory {
                handlers: StdMutex::new(HashMap::new()),
            })
        }
        fn register(&self, handle: &RpcHandler<BincodeCodec>) {
            self.handlers
                .lock()
                .unwrap()
                .insert(handle.name().to_string(), handle.local_handle());
        }
    }
    impl Directory for StaticDirectory {
        fn resolve(&self, _node_id: u64, service_method: &str) -> Result<Vec<Client>> {
            let service = service_method.split('.').next().unwrap_or_default();
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(service) {
                Some(local) => Ok(vec![Client::SelfNode(local.clone())]),
                None => Ok(vec![]),
            }
        }
    }

    #[tokio::test]
    async fn local_sync_call_round_trips() {
        let directory = StaticDirectory::new();
        let (handle, _join) = RpcHandler::spawn(Echo, BincodeCodec, directory.clone());
        directory.register(&handle);

        let resp: EchoResp = handle
            .call(
                "Echo.RPC_Echo",
                EchoReq {
                    text: "hello".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.text, "hello");
    }

    #[tokio::test]
    async fn missing_method_is_a_dispatch_error() {
        let directory = StaticDirectory::new();
        let (handle, _join) = RpcHandler::spawn(Echo, BincodeCodec, directory.clone());
        directory.register(&handle);

        let err = handle
            .call::<EchoReq, EchoResp>("Echo.RPC_Nope", EchoReq::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RpcErrorKind::DispatchError);
    }

    #[tokio::test]
    async fn panicking_method_becomes_panic_error() {
        let directory = StaticDirectory::new();
        let (handle, _join) = RpcHandler::spawn(Echo, BincodeCodec, directory.clone());
        directory.register(&handle);

        let err = handle
            .call::<EchoReq, EchoResp>("Echo.RPC_Boom", EchoReq::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RpcErrorKind::PanicError);
    }

    #[tokio::test]
    async fn method_error_propagates_to_the_caller() {
        let directory = StaticDirectory::new();
        let (handle, _join) = RpcHandler::spawn(Echo, BincodeCodec, directory.clone());
        directory.register(&handle);

        let err = handle
            .call::<EchoReq, EchoResp>("Echo.RPC_Fail", EchoReq::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RpcErrorKind::MethodError);
    }

    #[tokio::test]
    async fn async_call_delivers_through_the_callers_own_executor() {
        let directory = StaticDirectory::new();
        let (handle, _join) = RpcHandler::spawn(Echo, BincodeCodec, directory.clone());
        directory.register(&handle);

        let (tx, rx) = tokio::sync::oneshot::channel();
        handle.async_call::<EchoReq, EchoResp, _>(
            "Echo.RPC_Echo",
            EchoReq {
                text: "async".into(),
            },
            move |resp, err| {
                let _ = tx.send((resp.text, err));
            },
        );
        let (text, err) = rx.await.unwrap();
        assert!(err.is_none());
        assert_eq!(text, "async");
    }

    #[tokio::test]
    async fn sync_call_to_a_method_without_output_is_a_contract_error() {
        let directory = StaticDirectory::new();
        let (handle, _join) = RpcHandler::spawn(Echo, BincodeCodec, directory.clone());
        directory.register(&handle);

        let err = handle
            .call::<EchoReq, EchoResp>("Echo.RPC_NoOutput", EchoReq::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), RpcErrorKind::ContractError);
    }

    #[test]
    fn panic_message_recovers_string_and_str_payloads() {
        let str_payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*str_payload), "boom");

        let string_payload: Box<dyn Any + Send> = Box::new(String::from("also boom"));
        assert_eq!(panic_message(&*string_payload), "also boom");

        let other_payload: Box<dyn Any + Send> = Box::new(42i32);
        assert_eq!(panic_message(&*other_payload), "non-string panic payload");
    }
}
