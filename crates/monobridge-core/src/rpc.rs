//! RPC call surface
//!
//! Named methods are registered on an [`RpcServerConfig`], which an
//! [`RpcServer`] consumes at start. Engine workers deliver invocations
//! through the shared task queue; the handler runs on the consumer
//! thread with an [`RpcCall`] context giving positional, typed access to
//! the parameters and a single-shot `end` that fires the result back.
//!
//! Dropping a call without ending it fires an error result — the RPC
//! analogue of the 500 abandonment net.

use monobridge_common::{BridgeError, Result, RpcValue};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::bridge::{consumer_loop, BridgeGateway, BridgeShared, DispatchContext};
use crate::endpoint::EndpointTable;
use crate::engine::{RpcCallId, RpcEngine};
use crate::registry::{Handle, ResourceKind};
use crate::server::ServerToken;

pub(crate) type RpcHandler = Box<dyn Fn(RpcCall) + Send>;

/// Method name → handler map. Built at configuration time, then moved
/// into the consumer thread.
pub(crate) struct RpcMethodTable {
    methods: HashMap<String, RpcHandler>,
}

impl RpcMethodTable {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, handler: RpcHandler) {
        if self.methods.insert(name.to_owned(), handler).is_some() {
            tracing::debug!(method = name, "RPC method re-registered; replacing handler");
        }
    }

    pub fn get(&self, name: &str) -> Option<&RpcHandler> {
        self.methods.get(name)
    }
}

/// Registration-time configuration for an RPC server.
pub struct RpcServerConfig {
    methods: RpcMethodTable,
}

impl RpcServerConfig {
    pub fn new() -> Self {
        Self {
            methods: RpcMethodTable::new(),
        }
    }

    /// Register a named method. Handlers run on the consumer thread.
    pub fn add_method(&mut self, name: &str, handler: impl Fn(RpcCall) + Send + 'static) {
        self.methods.register(name, Box::new(handler));
    }
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// RPC front end: owns the bridge state and the consumer thread.
pub struct RpcServer {
    engine: Arc<dyn RpcEngine>,
    shared: Arc<BridgeShared>,
    config: Handle,
    server: Option<Handle>,
    consumer: Option<JoinHandle<()>>,
}

impl RpcServer {
    /// Create a server from a configuration. The configuration is
    /// wrapped into the registry and consumed by the first `start`.
    pub fn new(engine: Arc<dyn RpcEngine>, config: RpcServerConfig) -> Self {
        let shared = BridgeShared::for_rpc(engine.clone());
        let config = shared.registry.wrap(ResourceKind::ServerConfig, config);
        Self {
            engine,
            shared,
            config,
            server: None,
            consumer: None,
        }
    }

    /// Spawn the consumer thread and start the engine. Calling `start`
    /// twice fails because the configuration was already consumed.
    pub fn start(&mut self, addr: &str) -> Result<()> {
        let config = self
            .shared
            .registry
            .take::<RpcServerConfig>(self.config, ResourceKind::ServerConfig)
            .map_err(|_| BridgeError::AlreadyListening)?;

        let ctx = DispatchContext::new(self.shared.clone(), EndpointTable::new(), config.methods);
        let consumer = std::thread::Builder::new()
            .name("monobridge-consumer".into())
            .spawn(move || consumer_loop(ctx))
            .map_err(|e| BridgeError::Engine(format!("failed to spawn consumer thread: {e}")))?;
        self.consumer = Some(consumer);

        self.engine.install_gateway(BridgeGateway::new(self.shared.clone()));
        self.engine.start(addr);
        self.server = Some(self.shared.registry.wrap(ResourceKind::Server, ServerToken));
        tracing::info!(addr, "RPC server started");
        Ok(())
    }

    /// Stop the consumer thread. Tasks already queued still run before
    /// the stop task is reached.
    pub fn shutdown(&mut self) {
        if let Some(server) = self.server.take() {
            let _ = self.shared.registry.invalidate(server);
        }
        if let Some(consumer) = self.consumer.take() {
            self.shared.queue.enqueue(|ctx: &mut DispatchContext| ctx.running = false);
            if consumer.join().is_err() {
                tracing::error!("consumer thread panicked");
            }
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) struct CallState {
    pub call: RpcCallId,
    pub params: Vec<RpcValue>,
}

/// Context of one in-flight RPC invocation. Confined to the consumer
/// thread.
pub struct RpcCall {
    shared: Arc<BridgeShared>,
    handle: Handle,
    ended: bool,
    _consumer_thread: PhantomData<*mut ()>,
}

impl RpcCall {
    pub(crate) fn attach(shared: &Arc<BridgeShared>, call: RpcCallId, params: Vec<RpcValue>) -> Self {
        let handle = shared
            .registry
            .wrap(ResourceKind::CallInfo, CallState { call, params });
        Self {
            shared: shared.clone(),
            handle,
            ended: false,
            _consumer_thread: PhantomData,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut CallState) -> R) -> Result<R> {
        self.shared
            .registry
            .with(self.handle, ResourceKind::CallInfo, f)
    }

    pub fn param_count(&self) -> Result<usize> {
        self.with_state(|s| s.params.len())
    }

    /// Fetch one positional parameter as a registry-backed param handle.
    pub fn param(&self, pos: usize) -> Result<RpcParam> {
        let value = self
            .with_state(|s| s.params.get(pos).cloned())?
            .ok_or(BridgeError::ParamOutOfRange(pos))?;
        Ok(self.make_param(value))
    }

    /// Wrap a value for use as a result (or intermediate) param.
    pub fn make_param(&self, value: RpcValue) -> RpcParam {
        let handle = self.shared.registry.wrap(ResourceKind::RpcParam, value);
        RpcParam {
            shared: self.shared.clone(),
            handle,
            _consumer_thread: PhantomData,
        }
    }

    /// Fire the result back through the engine. Legal exactly once; the
    /// result param is consumed.
    pub fn end(&mut self, result: RpcParam) -> Result<()> {
        if self.ended {
            return Err(BridgeError::CallAlreadyEnded);
        }
        let value = *self
            .shared
            .registry
            .take::<RpcValue>(result.handle, ResourceKind::RpcParam)?;
        let state = self
            .shared
            .registry
            .take::<CallState>(self.handle, ResourceKind::CallInfo)?;
        self.ended = true;
        self.shared.rpc_engine().end_call(state.call, value);
        Ok(())
    }
}

impl Drop for RpcCall {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        let Ok(state) = self
            .shared
            .registry
            .take::<CallState>(self.handle, ResourceKind::CallInfo)
        else {
            return;
        };
        tracing::warn!(call = state.call.0, "RPC call dropped without a result; sending error");
        let result = RpcValue::Error(Box::new(RpcValue::Str(
            "call dropped without a result".into(),
        )));
        self.shared.rpc_engine().end_call(state.call, result);
    }
}

/// Single-use, registry-backed view of one RPC parameter.
pub struct RpcParam {
    shared: Arc<BridgeShared>,
    handle: Handle,
    _consumer_thread: PhantomData<*mut ()>,
}

impl RpcParam {
    fn value_ref<R>(&self, f: impl FnOnce(&RpcValue) -> R) -> Result<R> {
        self.shared
            .registry
            .with(self.handle, ResourceKind::RpcParam, |v: &mut RpcValue| f(v))
    }

    pub fn value(&self) -> Result<RpcValue> {
        self.value_ref(|v| v.clone())
    }

    pub fn as_i32(&self) -> Result<i32> {
        self.value_ref(|v| v.as_i32())?
    }

    pub fn as_f64(&self) -> Result<f64> {
        self.value_ref(|v| v.as_f64())?
    }

    pub fn as_string(&self) -> Result<String> {
        self.value_ref(|v| v.as_str().map(str::to_owned))?
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.value_ref(|v| v.as_bool())?
    }

    pub fn is_null(&self) -> Result<bool> {
        self.value_ref(|v| v.is_null())
    }

    /// The wrapped value if this param is an error, `None` otherwise.
    pub fn error_value(&self) -> Result<Option<RpcValue>> {
        self.value_ref(|v| v.error_value().cloned())
    }

    /// Explicitly consume the param.
    pub fn destroy(self) -> Result<()> {
        self.shared.registry.invalidate(self.handle)
    }
}

impl Drop for RpcParam {
    fn drop(&mut self) {
        // Already consumed by `end` or `destroy` is the common case.
        let _ = self.shared.registry.invalidate(self.handle);
    }
}

impl DispatchContext {
    /// Execute one drained RPC task.
    pub(crate) fn run_rpc(&mut self, method: &str, call: RpcCallId, params: Vec<RpcValue>) {
        match self.rpc_methods.get(method) {
            Some(handler) => {
                tracing::debug!(method, call = call.0, "dispatching RPC call");
                let rpc_call = RpcCall::attach(&self.shared, call, params);
                // A panicking handler unwinds through the call's drop
                // net, which fires the error result.
                if catch_unwind(AssertUnwindSafe(|| handler(rpc_call))).is_err() {
                    tracing::error!(method, "RPC handler panicked");
                }
            }
            None => {
                tracing::warn!(method, call = call.0, "unknown RPC method");
                let result = RpcValue::Error(Box::new(RpcValue::Str(format!(
                    "unknown method: {method}"
                ))));
                self.shared.rpc_engine().end_call(call, result);
            }
        }
    }
}
