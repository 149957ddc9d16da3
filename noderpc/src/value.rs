//! Type-erased parameter/reply slots.
//!
//! The source system passes `interface{}` around and recovers concrete
//! types through `reflect`. Rust has no runtime reflection, so the
//! slot is instead a small tagged variant (`ParamValue`) carrying
//! either a same-process typed value or raw wire bytes, exactly as
//! described in the design notes ("`interface{}` parameters → tagged
//! variants").

use std::any::Any;

use erased_serde::Serialize as ErasedSerialize;
use serde::Serialize;

use crate::error::{Result, RpcError, RpcErrorKind};

/// Anything that can sit in a `ParamValue::Typed` slot: nameable at
/// runtime via `Any` (so the owning method adapter can downcast back
/// to its concrete `Input`/`Output` type) and serializable without the
/// holder knowing the concrete type (so the dispatcher can marshal it
/// for a cross-node destination without depending on every message
/// type it might ever carry).
pub trait RpcValue: Any + ErasedSerialize + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any + Serialize + Send> RpcValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

erased_serde::serialize_trait_object!(RpcValue);

/// Downcast a boxed `RpcValue` back into its concrete type, consuming
/// the box. Fails with `RpcErrorKind::ContractError` if the concrete
/// type does not match -- this can only happen if a method adapter
/// was registered against the wrong template, a programmer error
/// caught the first time the mismatched call path is exercised.
pub fn downcast<T: 'static>(value: Box<dyn RpcValue>) -> Result<Box<T>> {
    value.into_any().downcast::<T>().map_err(|_| {
        RpcError::new(
            RpcErrorKind::ContractError,
            "rpc value did not match the registered concrete type",
        )
    })
}

/// An out-of-band typed context optionally carried alongside the
/// normal input parameter. The source identifies this parameter by
/// the exact type name `rpc.IRawAdditionParam`; here it is simply a
/// boxed `RpcValue`, with `AdditionParam::none()` standing in for the
/// source's `rawAdditionParamValueNull` sentinel.
pub enum AdditionParam {
    Value(Box<dyn RpcValue>),
    None,
}

impl AdditionParam {
    pub fn none() -> Self {
        AdditionParam::None
    }

    pub fn value(v: impl RpcValue + 'static) -> Self {
        AdditionParam::Value(Box::new(v))
    }

    pub fn as_typed<T: 'static>(&self) -> Option<&T> {
        match self {
            AdditionParam::Value(v) => v.as_any().downcast_ref::<T>(),
            AdditionParam::None => None,
        }
    }
}

/// A parameter or reply slot: either a same-process typed value (no
/// marshal/unmarshal required), raw wire bytes awaiting unmarshal, or
/// absent entirely (methods with no output parameter).
pub enum ParamValue {
    Typed(Box<dyn RpcValue>),
    Bytes(Vec<u8>),
    None,
}

impl ParamValue {
    pub fn typed(v: impl RpcValue + 'static) -> Self {
        ParamValue::Typed(Box::new(v))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ParamValue::None)
    }
}
