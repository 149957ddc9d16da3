//! Wire codec.
//!
//! Corresponds to the source system's `processor.Marshal`/`Unmarshal`
//! interface: a `(bytes) <-> value` conversion the core depends on but
//! does not own the concrete format of. Modeled on the teacher crate's
//! `ClientTransport`/`ServerTransport` split between a `BincodeTransport`
//! and a `JSONTransport` sharing one trait pair -- here a single
//! `Codec` trait with two concrete implementations.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RpcError, RpcErrorKind};
use crate::value::RpcValue;

/// Marshal/unmarshal a known message schema to/from bytes. Not required
/// to be object-safe (the teacher's own transport traits aren't either):
/// callers depend on a concrete `Codec` implementation through a
/// generic parameter, e.g. `RpcHandler<H, BincodeCodec>`.
pub trait Codec: Send + Sync + 'static {
    /// Serialize a same-process value for a cross-node destination.
    fn marshal(&self, value: &dyn RpcValue) -> Result<Vec<u8>>;

    /// Serialize a borrowed, concrete value directly -- for callers
    /// (such as the framing processor) that already know `T` and have
    /// no need to go through the `RpcValue`/`Any` machinery, which
    /// requires `'static` and so can't accept an arbitrary borrow.
    fn marshal_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes into a concrete, freshly allocated value.
    fn unmarshal<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: DeserializeOwned;
}

/// Default codec, backed by `bincode` -- the same serialization the
/// teacher crate uses for its `bincode_transport` feature.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn marshal(&self, value: &dyn RpcValue) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            use bincode::Options;
            let mut serializer =
                bincode::Serializer::new(&mut buf, bincode::DefaultOptions::new());
            let mut erased = <dyn erased_serde::Serializer>::erase(&mut serializer);
            value.erased_serialize(&mut erased).map_err(|e| {
                RpcError::with_cause(RpcErrorKind::MarshalError, "bincode serialization failure", &e)
            })?;
        }
        Ok(buf)
    }

    fn marshal_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        use bincode::Options;
        bincode::DefaultOptions::new().serialize(value).map_err(|e| {
            RpcError::with_cause(RpcErrorKind::MarshalError, "bincode serialization failure", &e)
        })
    }

    fn unmarshal<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        bincode::deserialize(bytes).map_err(|e| {
            RpcError::with_cause(RpcErrorKind::MarshalError, "bincode deserialization failure", &e)
        })
    }
}

/// JSON alternative, mirroring the teacher crate's `json_transport`
/// feature. Useful when a deployment wants human-readable wire traffic
/// (e.g. while debugging a node pair over a text console).
#[cfg(feature = "json_codec")]
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

#[cfg(feature = "json_codec")]
impl Codec for JsonCodec {
    fn marshal(&self, value: &dyn RpcValue) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let mut serializer = serde_json::Serializer::new(&mut buf);
            let mut erased = <dyn erased_serde::Serializer>::erase(&mut serializer);
            value.erased_serialize(&mut erased).map_err(|e| {
                RpcError::with_cause(RpcErrorKind::MarshalError, "json serialization failure", &e)
            })?;
        }
        Ok(buf)
    }

    fn marshal_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| {
            RpcError::with_cause(RpcErrorKind::MarshalError, "json serialization failure", &e)
        })
    }

    fn unmarshal<T>(&self, bytes: &[u8]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(bytes).map_err(|e| {
            RpcError::with_cause(RpcErrorKind::MarshalError, "json deserialization failure", &e)
        })
    }
}
