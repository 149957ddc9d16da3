//! Method discovery and the per-method marshaling adapters.
//!
//! The source system scans a handler's method set with `reflect` at
//! registration time, accepting any method whose name begins with
//! `RPC_` and whose signature matches a fixed shape. Rust has no
//! runtime reflection, so per the design notes ("Reflection-heavy
//! registration -> typed dispatch tables") this is replaced by an
//! explicit registration call: a service implements [`RpcService`] and
//! lists its exposed methods through a [`MethodTableBuilder`], which
//! performs the same `RPC_`-prefix and exported-name validation the
//! source does, and wraps each method in a small adapter closure that
//! owns the unmarshal, concrete-type allocation, and invocation -- the
//! "adapter closure" recommended by the design notes.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::error::Result;
use crate::value::{AdditionParam, RpcValue};

/// Implemented by the user-defined struct backing an [`crate::handler::RpcHandler`].
/// `service_name` supplies the `Service` half of `Service.Method`;
/// `register_methods` is the static equivalent of the source's
/// reflective method scan.
pub trait RpcService: Send + 'static {
    fn service_name(&self) -> &str;

    fn register_methods<C: Codec>(builder: &mut MethodTableBuilder<Self, C>)
    where
        Self: Sized;
}

/// One exposed method, immutable after registration.
pub struct MethodDescriptor<H: ?Sized, C> {
    pub name: &'static str,
    pub index: usize,
    pub has_addition_param: bool,
    pub has_output: bool,
    unmarshal_input: fn(&C, &[u8]) -> Result<Box<dyn RpcValue>>,
    alloc_output: Option<fn() -> Box<dyn RpcValue>>,
    invoke: Box<
        dyn Fn(&H, Option<&AdditionParam>, &dyn RpcValue, Option<&mut dyn RpcValue>) -> Result<()>
            + Send
            + Sync,
    >,
}

impl<H: ?Sized, C> MethodDescriptor<H, C> {
    /// Deserialize wire bytes into a freshly allocated `Input`. Step 2
    /// of request handling when the request did not arrive with a
    /// same-process typed value already attached.
    pub fn unmarshal_input(&self, codec: &C, bytes: &[u8]) -> Result<Box<dyn RpcValue>> {
        (self.unmarshal_input)(codec, bytes)
    }

    /// Freshly allocate an `Output` when the caller did not supply its
    /// own storage. `None` if the method has no output parameter.
    pub fn alloc_output(&self) -> Option<Box<dyn RpcValue>> {
        self.alloc_output.map(|f| f())
    }

    pub fn invoke(
        &self,
        receiver: &H,
        addition: Option<&AdditionParam>,
        input: &dyn RpcValue,
        output: Option<&mut dyn RpcValue>,
    ) -> Result<()> {
        (self.invoke)(receiver, addition, input, output)
    }
}

/// `ServiceMethodName -> MethodDescriptor` map, built once at
/// registration and read-only afterwards (safe to share across
/// threads without locking, per the concurrency model's "Shared-resource
/// policy").
pub struct MethodTable<H: ?Sized, C> {
    methods: HashMap<String, MethodDescriptor<H, C>>,
}

impl<H: ?Sized, C> MethodTable<H, C> {
    pub fn get(&self, service_method: &str) -> Option<&MethodDescriptor<H, C>> {
        self.methods.get(service_method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Builds a [`MethodTable`] for a service named `service_name`,
/// enforcing the `RPC_`-prefix / exported-name / arity rules at
/// registration time, panicking on violation exactly as the source's
/// offline `RegisterRpc` does ("a misshaped RPC is a programmer error,
/// not a runtime condition").
pub struct MethodTableBuilder<H: ?Sized, C> {
    service_name: String,
    next_index: usize,
    methods: HashMap<String, MethodDescriptor<H, C>>,
}

impl<H: RpcService, C: Codec> MethodTableBuilder<H, C> {
    pub fn new(service_name: impl Into<String>) -> Self {
        MethodTableBuilder {
            service_name: service_name.into(),
            next_index: 0,
            methods: HashMap::new(),
        }
    }

    pub fn build(self) -> MethodTable<H, C> {
        MethodTable {
            methods: self.methods,
        }
    }

    fn validate_name(name: &'static str) {
        if !name.starts_with("RPC_") {
            panic!(
                "rpc method {:?} does not begin with the required RPC_ prefix",
                name
            );
        }
        if !name.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false) {
            panic!("rpc method {:?} is not an exported (uppercase-leading) name", name);
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}.{}", self.service_name, name)
    }

    fn insert(&mut self, name: &'static str, descriptor: MethodDescriptor<H, C>) {
        let key = self.key(name);
        if self.methods.contains_key(&key) {
            panic!("rpc method {:?} registered twice for service {:?}", name, self.service_name);
        }
        self.methods.insert(key, descriptor);
    }

    /// Register a method of shape `(receiver, *Input, *Output) -> Result<()>`
    /// -- 3 total parameters, no addition parameter.
    pub fn method<Req, Resp, F>(&mut self, name: &'static str, f: F)
    where
        Req: RpcValue + DeserializeOwned + Default + Serialize + 'static,
        Resp: RpcValue + Default + 'static,
        F: Fn(&H, &Req, &mut Resp) -> Result<()> + Send + Sync + 'static,
    {
        Self::validate_name(name);
        let index = self.next_index;
        self.next_index += 1;
        let descriptor = MethodDescriptor {
            name,
            index,
            has_addition_param: false,
            has_output: true,
            unmarshal_input: |codec, bytes| {
                codec
                    .unmarshal::<Req>(bytes)
                    .map(|v| Box::new(v) as Box<dyn RpcValue>)
            },
            alloc_output: Some(|| Box::new(Resp::default()) as Box<dyn RpcValue>),
            invoke: Box::new(move |h, _addition, input, output| {
                let input = input
                    .as_any()
                    .downcast_ref::<Req>()
                    .expect("input type matches this method's registration");
                let output = output.expect("method declares an output parameter");
                let output = output
                    .as_any_mut()
                    .downcast_mut::<Resp>()
                    .expect("output type matches this method's registration");
                f(h, input, output)
            }),
        };
        self.insert(name, descriptor);
    }

    /// Register a method of shape
    /// `(receiver, additionParam, *Input, *Output) -> Result<()>` -- 4
    /// total parameters. `Add::default()` stands in for the source's
    /// `rawAdditionParamValueNull` sentinel when no addition parameter
    /// was supplied by the caller.
    pub fn method_with_addition<Add, Req, Resp, F>(&mut self, name: &'static str, f: F)
    where
        Add: Default + Send + Sync + 'static,
        Req: RpcValue + DeserializeOwned + Default + Serialize + 'static,
        Resp: RpcValue + Default + 'static,
        F: Fn(&H, &Add, &Req, &mut Resp) -> Result<()> + Send + Sync + 'static,
    {
        Self::validate_name(name);
        let index = self.next_index;
        self.next_index += 1;
        let descriptor = MethodDescriptor {
            name,
            index,
            has_addition_param: true,
            has_output: true,
            unmarshal_input: |codec, bytes| {
                codec
                    .unmarshal::<Req>(bytes)
                    .map(|v| Box::new(v) as Box<dyn RpcValue>)
            },
            alloc_output: Some(|| Box::new(Resp::default()) as Box<dyn RpcValue>),
            invoke: Box::new(move |h, addition, input, output| {
                let input = input
                    .as_any()
                    .downcast_ref::<Req>()
                    .expect("input type matches this method's registration");
                let output = output.expect("method declares an output parameter");
                let output = output
                    .as_any_mut()
                    .downcast_mut::<Resp>()
                    .expect("output type matches this method's registration");
                let default_add = Add::default();
                let add_ref = match addition {
                    Some(AdditionParam::Value(v)) => v
                        .as_any()
                        .downcast_ref::<Add>()
                        .unwrap_or(&default_add),
                    _ => &default_add,
                };
                f(h, add_ref, input, output)
            }),
        };
        self.insert(name, descriptor);
    }

    /// Register a method of shape
    /// `(receiver, additionParam, *Input) -> Result<()>` -- 3 total
    /// parameters, no output. Intended for services that are only ever
    /// driven through `Go`/`CastGo` but still want out-of-band context.
    pub fn method_fire<Add, Req, F>(&mut self, name: &'static str, f: F)
    where
        Add: Default + Send + Sync + 'static,
        Req: RpcValue + DeserializeOwned + Default + Serialize + 'static,
        F: Fn(&H, &Add, &Req) -> Result<()> + Send + Sync + 'static,
    {
        Self::validate_name(name);
        let index = self.next_index;
        self.next_index += 1;
        let descriptor = MethodDescriptor {
            name,
            index,
            has_addition_param: true,
            has_output: false,
            unmarshal_input: |codec, bytes| {
                codec
                    .unmarshal::<Req>(bytes)
                    .map(|v| Box::new(v) as Box<dyn RpcValue>)
            },
            alloc_output: None,
            invoke: Box::new(move |h, addition, input, _output| {
                let input = input
                    .as_any()
                    .downcast_ref::<Req>()
                    .expect("input type matches this method's registration");
                let default_add = Add::default();
                let add_ref = match addition {
                    Some(AdditionParam::Value(v)) => v
                        .as_any()
                        .downcast_ref::<Add>()
                        .unwrap_or(&default_add),
                    _ => &default_add,
                };
                f(h, add_ref, input)
            }),
        };
        self.insert(name, descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use serde::{Deserialize, Serialize};

    struct Echo;
    impl RpcService for Echo {
        fn service_name(&self) -> &str {
            "Echo"
        }
        fn register_methods<C: Codec>(builder: &mut MethodTableBuilder<Self, C>) {
            builder.method("RPC_Echo", Echo::rpc_echo);
        }
    }
    #[derive(Default, Serialize, Deserialize)]
    struct Req {
        x: String,
    }
    #[derive(Default, Serialize, Deserialize)]
    struct Resp {
        x: String,
    }
    impl Echo {
        fn rpc_echo(&self, input: &Req, output: &mut Resp) -> Result<()> {
            output.x = input.x.clone();
            Ok(())
        }
    }

    #[test]
    #[should_panic(expected = "does not begin with the required RPC_ prefix")]
    fn rejects_non_prefixed_name() {
        let mut b: MethodTableBuilder<Echo, BincodeCodec> = MethodTableBuilder::new("Echo");
        b.method("Echo", Echo::rpc_echo);
    }

    #[test]
    fn registers_and_looks_up() {
        let mut b: MethodTableBuilder<Echo, BincodeCodec> = MethodTableBuilder::new("Echo");
        Echo::register_methods(&mut b);
        let table = b.build();
        assert!(table.get("Echo.RPC_Echo").is_some());
        assert!(table.get("Echo.RPC_Missing").is_none());
    }
}
