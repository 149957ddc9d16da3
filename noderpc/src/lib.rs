//! Per-service, single-threaded RPC dispatch engine for a multi-node
//! application server.
//!
//! A service implements [`RpcService`] and registers its methods
//! through a [`MethodTableBuilder`]; [`RpcHandler::spawn`] then owns
//! that service exclusively on its own `tokio::task` and hands back a
//! cheap, cloneable [`RpcHandler`] other code uses to reach it via
//! `Call`/`AsyncCall`/`Go`/`CastGo` and their node-pinned and raw-bytes
//! variants. Cross-node delivery and node-discovery are external
//! collaborators, injected as a [`RemoteClient`](dispatcher::RemoteClient)
//! and a [`Directory`](dispatcher::Directory) respectively -- this
//! crate owns dispatch, not topology or transport.
//!
//! External client traffic (as opposed to inter-handler calls) goes
//! through [`framing::FrameProcessor`], a small length-prefixed codec
//! layer independent of the handler/dispatcher machinery.

pub mod call;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod handler;
pub mod method_table;
pub mod request;
pub mod value;

pub use call::{CallObject, CallObjectPool};
pub use codec::{BincodeCodec, Codec};
#[cfg(feature = "json_codec")]
pub use codec::JsonCodec;
pub use dispatcher::{Client, Directory, Dispatcher, LocalHandle, RemoteClient};
pub use error::{Result, RpcError, RpcErrorKind};
pub use framing::{Endian, FrameProcessor, MsgRoute};
pub use handler::RpcHandler;
pub use method_table::{MethodDescriptor, MethodTable, MethodTableBuilder, RpcService};
pub use request::{RpcRequest, RpcRequestPool};
pub use value::{downcast, AdditionParam, ParamValue, RpcValue};
