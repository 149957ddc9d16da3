//! End-to-end scenarios from the dispatch engine's testable-properties
//! list: cross-handler async calls and broadcast casts across more
//! than one resolved destination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use noderpc::{BincodeCodec, Client, Directory, LocalHandle, Result, RpcError, RpcHandler, RpcService};
use serde::{Deserialize, Serialize};

#[derive(Default, Serialize, Deserialize)]
struct AddReq {
    l: i64,
    r: i64,
}
#[derive(Default, Serialize, Deserialize)]
struct AddResp {
    sum: i64,
}

struct Adder;
impl Adder {
    fn rpc_add(&self, input: &AddReq, output: &mut AddResp) -> Result<()> {
        output.sum = input.l + input.r;
        Ok(())
    }
}
impl RpcService for Adder {
    fn service_name(&self) -> &str {
        "B"
    }
    fn register_methods<C: noderpc::Codec>(builder: &mut noderpc::MethodTableBuilder<Self, C>) {
        builder.method("RPC_Add", Adder::rpc_add);
    }
}

#[derive(Default, Serialize, Deserialize)]
struct NotifyReq {
    seq: u32,
}
#[derive(Default, Serialize, Deserialize)]
struct NotifyResp;

struct Notifiable {
    hits: Arc<Mutex<Vec<u32>>>,
}
impl Notifiable {
    fn rpc_notify(&self, input: &NotifyReq, _output: &mut NotifyResp) -> Result<()> {
        self.hits.lock().unwrap().push(input.seq);
        Ok(())
    }
}
impl RpcService for Notifiable {
    fn service_name(&self) -> &str {
        "S"
    }
    fn register_methods<C: noderpc::Codec>(builder: &mut noderpc::MethodTableBuilder<Self, C>) {
        builder.method("RPC_Notify", Notifiable::rpc_notify);
    }
}

/// Resolves every registered service name to its local queue, and
/// supports registering the *same* service name more than once so
/// `CastGo` has more than one destination to broadcast to.
#[derive(Default)]
struct FakeDirectory {
    by_name: Mutex<HashMap<String, Vec<LocalHandle>>>,
}
impl FakeDirectory {
    fn new() -> Arc<Self> {
        Arc::new(FakeDirectory::default())
    }
    fn register(&self, handle: &RpcHandler<BincodeCodec>) {
        self.by_name
            .lock()
            .unwrap()
            .entry(handle.name().to_string())
            .or_default()
            .push(handle.local_handle());
    }
}
impl Directory for FakeDirectory {
    fn resolve(&self, _node_id: u64, service_method: &str) -> Result<Vec<Client>> {
        let service = service_method.split('.').next().unwrap_or_default();
        let by_name = self.by_name.lock().unwrap();
        Ok(by_name
            .get(service)
            .map(|locals| locals.iter().cloned().map(Client::SelfNode).collect())
            .unwrap_or_default())
    }
}

#[tokio::test]
async fn cross_handler_async_call_delivers_on_the_callers_own_executor() {
    let directory = FakeDirectory::new();
    let (a, _a_join) = RpcHandler::spawn(NoopService, BincodeCodec, directory.clone());
    let (b, _b_join) = RpcHandler::spawn(Adder, BincodeCodec, directory.clone());
    directory.register(&a);
    directory.register(&b);

    let (tx, rx) = tokio::sync::oneshot::channel();
    a.async_call::<AddReq, AddResp, _>("B.RPC_Add", AddReq { l: 2, r: 3 }, move |resp, err| {
        let _ = tx.send((resp.sum, err));
    });

    let (sum, err) = rx.await.unwrap();
    assert!(err.is_none());
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn broadcast_cast_reaches_every_destination_with_no_reply() {
    let directory = FakeDirectory::new();
    let hits_1 = Arc::new(Mutex::new(Vec::new()));
    let hits_2 = Arc::new(Mutex::new(Vec::new()));

    let (s1, _j1) = RpcHandler::spawn(
        Notifiable {
            hits: hits_1.clone(),
        },
        BincodeCodec,
        directory.clone(),
    );
    let (s2, _j2) = RpcHandler::spawn(
        Notifiable {
            hits: hits_2.clone(),
        },
        BincodeCodec,
        directory.clone(),
    );
    directory.register(&s1);
    directory.register(&s2);

    s1.cast_go("S.RPC_Notify", NotifyReq { seq: 11 });

    // Give both executors a chance to drain their queues.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(*hits_1.lock().unwrap(), vec![11]);
    assert_eq!(*hits_2.lock().unwrap(), vec![11]);
}

#[tokio::test]
async fn queue_at_capacity_rejects_the_push_instead_of_blocking() {
    let directory = FakeDirectory::new();
    let (handle, _join) =
        RpcHandler::spawn_with_capacity(SlowService, BincodeCodec, directory.clone(), 1);
    directory.register(&handle);

    // Under the current-thread test runtime, a freshly spawned task
    // doesn't run until we yield, so the executor hasn't drained
    // anything yet -- the queue still holds exactly what we push here.
    let first = handle.go("Slow.RPC_Block", BlockReq);
    let second = handle.go("Slow.RPC_Block", BlockReq);
    assert!(first.is_ok());
    let err = second.expect_err("a full queue must reject, not silently drop");
    assert_eq!(err.kind(), noderpc::RpcErrorKind::DispatchError);
}

#[derive(Default, Serialize, Deserialize)]
struct BlockReq;

struct SlowService;
impl SlowService {
    fn rpc_block(&self, _input: &BlockReq, _output: &mut NotifyResp) -> Result<()> {
        Ok(())
    }
}
impl RpcService for SlowService {
    fn service_name(&self) -> &str {
        "Slow"
    }
    fn register_methods<C: noderpc::Codec>(builder: &mut noderpc::MethodTableBuilder<Self, C>) {
        builder.method("RPC_Block", SlowService::rpc_block);
    }
}

struct NoopService;
impl RpcService for NoopService {
    fn service_name(&self) -> &str {
        "A"
    }
    fn register_methods<C: noderpc::Codec>(_builder: &mut noderpc::MethodTableBuilder<Self, C>) {}
}

// Silence "unused" for the error type re-export used only in match arms above.
#[allow(dead_code)]
fn _assert_error_type(_e: RpcError) {}
