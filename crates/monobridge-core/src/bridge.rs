//! Internal bridge state shared between the worker-facing gateway and
//! the consumer thread.
//!
//! One `BridgeShared` exists per server. Worker threads reach it through
//! the gateway (enqueue paths only); the consumer thread owns the
//! `DispatchContext` holding the endpoint and RPC method tables, and is
//! the only thread that runs handlers or touches lifecycle state.

use monobridge_common::RpcValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::endpoint::EndpointTable;
use crate::engine::{
    BodyControl, CallId, EndpointId, Engine, RpcCallId, RpcEngine, RpcGateway, WorkerGateway,
};
use crate::registry::{Handle, HandleRegistry, ResourceKind};
use crate::request::Request;
use crate::rpc::RpcMethodTable;
use crate::task_queue::TaskQueue;

pub(crate) type BodyChunkHandler = Box<dyn FnMut(&[u8]) -> BodyControl + Send>;
pub(crate) type BodyEndHandler = Box<dyn FnOnce(Request) + Send>;

/// Consumer-side state of one incremental body read. The request view is
/// parked here (as its registry handle) while chunks flow; the end
/// handler gets it back once the read stops or the body runs out.
pub(crate) struct BodyRead {
    pub on_chunk: BodyChunkHandler,
    pub on_end: BodyEndHandler,
    pub request: Handle,
}

pub(crate) struct BridgeShared {
    pub registry: HandleRegistry,
    pub queue: TaskQueue<DispatchContext>,
    http: Option<Arc<dyn Engine>>,
    rpc: Option<Arc<dyn RpcEngine>>,
    log_requests: AtomicBool,
    /// Per-call stop flags for incremental body reads. Written by the
    /// consumer thread, read synchronously by engine workers on each
    /// chunk.
    body_stops: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    /// Consumer-side body-read state, keyed by call. Only ever touched
    /// from the consumer thread; the mutex is there because the map
    /// lives in cross-thread shared state.
    body_reads: Mutex<HashMap<u64, BodyRead>>,
}

impl BridgeShared {
    pub fn for_http(engine: Arc<dyn Engine>) -> Arc<Self> {
        Arc::new(Self {
            registry: HandleRegistry::new(),
            queue: TaskQueue::new(),
            http: Some(engine),
            rpc: None,
            log_requests: AtomicBool::new(true),
            body_stops: Mutex::new(HashMap::new()),
            body_reads: Mutex::new(HashMap::new()),
        })
    }

    pub fn for_rpc(engine: Arc<dyn RpcEngine>) -> Arc<Self> {
        Arc::new(Self {
            registry: HandleRegistry::new(),
            queue: TaskQueue::new(),
            http: None,
            rpc: Some(engine),
            log_requests: AtomicBool::new(false),
            body_stops: Mutex::new(HashMap::new()),
            body_reads: Mutex::new(HashMap::new()),
        })
    }

    /// The HTTP engine behind this bridge. Reaching this on an RPC-only
    /// bridge is an integration bug, on par with a handle kind mismatch.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        self.http.as_ref().expect("bridge has no HTTP engine")
    }

    pub fn rpc_engine(&self) -> &Arc<dyn RpcEngine> {
        self.rpc.as_ref().expect("bridge has no RPC engine")
    }

    pub fn set_request_logging(&self, enabled: bool) {
        self.log_requests.store(enabled, Ordering::Relaxed);
    }

    pub fn request_logging(&self) -> bool {
        self.log_requests.load(Ordering::Relaxed)
    }

    /// Arm a body read for a call: install the stop flag the engine
    /// workers will check, and park the read state. Consumer thread only.
    pub fn begin_body_read(&self, call: CallId, read: BodyRead) {
        self.body_stops
            .lock()
            .unwrap()
            .insert(call.0, Arc::new(AtomicBool::new(false)));
        self.body_reads.lock().unwrap().insert(call.0, read);
    }

    /// The stop flag for a call's body read, if one is armed.
    pub fn body_stop(&self, call: CallId) -> Option<Arc<AtomicBool>> {
        self.body_stops.lock().unwrap().get(&call.0).cloned()
    }

    /// Flip the stop flag so the next worker-side chunk delivery is
    /// refused.
    pub fn stop_body(&self, call: CallId) {
        if let Some(stop) = self.body_stop(call) {
            stop.store(true, Ordering::Release);
        }
    }

    pub fn take_body_read(&self, call: CallId) -> Option<BodyRead> {
        self.body_reads.lock().unwrap().remove(&call.0)
    }

    pub fn restore_body_read(&self, call: CallId, read: BodyRead) {
        self.body_reads.lock().unwrap().insert(call.0, read);
    }

    /// Drop all body-read state for a finished call.
    pub fn clear_body(&self, call: CallId) {
        self.body_stops.lock().unwrap().remove(&call.0);
        self.body_reads.lock().unwrap().remove(&call.0);
    }
}

/// Consumer-side dispatch state. Owned by the consumer thread; every
/// queued task receives it mutably.
pub(crate) struct DispatchContext {
    pub shared: Arc<BridgeShared>,
    pub endpoints: EndpointTable,
    pub rpc_methods: RpcMethodTable,
    pub running: bool,
}

impl DispatchContext {
    pub fn new(shared: Arc<BridgeShared>, endpoints: EndpointTable, rpc_methods: RpcMethodTable) -> Self {
        Self {
            shared,
            endpoints,
            rpc_methods,
            running: true,
        }
    }
}

/// The consumer thread's main loop: drain, then sleep on the wakeup
/// signal, until a shutdown task clears the running flag.
pub(crate) fn consumer_loop(mut ctx: DispatchContext) {
    let shared = ctx.shared.clone();
    tracing::debug!("consumer loop started");
    loop {
        shared.queue.drain_and_run(&mut ctx);
        if !ctx.running {
            break;
        }
        shared.queue.wait();
    }
    tracing::debug!("consumer loop stopped");
}

/// Worker-facing entry points. The engine holds this through an `Arc`
/// and may call it from any of its threads.
pub(crate) struct BridgeGateway {
    shared: Arc<BridgeShared>,
}

impl BridgeGateway {
    pub fn new(shared: Arc<BridgeShared>) -> Arc<Self> {
        Arc::new(Self { shared })
    }
}

impl WorkerGateway for BridgeGateway {
    fn dispatch_endpoint(&self, endpoint: EndpointId, call: CallId) {
        // The call token is wrapped here, on the worker thread, and
        // consumed exactly once by the drained task.
        let handle = self.shared.registry.wrap(ResourceKind::CallInfo, call);
        self.shared
            .queue
            .enqueue(move |ctx: &mut DispatchContext| ctx.run_endpoint(endpoint, handle));
    }

    fn body_chunk(&self, call: CallId, chunk: Vec<u8>) -> bool {
        // No armed read means the host never asked for the body, or the
        // read already finished.
        let Some(stop) = self.shared.body_stop(call) else {
            return false;
        };
        if stop.load(Ordering::Acquire) {
            return false;
        }
        self.shared
            .queue
            .enqueue(move |ctx: &mut DispatchContext| ctx.run_body_chunk(call, chunk));
        true
    }

    fn body_end(&self, call: CallId) {
        self.shared
            .queue
            .enqueue(move |ctx: &mut DispatchContext| ctx.run_body_end(call));
    }
}

impl RpcGateway for BridgeGateway {
    fn dispatch_call(&self, method: &str, call: RpcCallId, params: Vec<RpcValue>) {
        let method = method.to_owned();
        self.shared
            .queue
            .enqueue(move |ctx: &mut DispatchContext| ctx.run_rpc(&method, call, params));
    }
}

impl DispatchContext {
    /// Run one consumer-side body chunk delivery.
    pub(crate) fn run_body_chunk(&mut self, call: CallId, chunk: Vec<u8>) {
        let Some(mut read) = self.shared.take_body_read(call) else {
            tracing::debug!(call = call.0, "body chunk arrived after the read finished");
            return;
        };

        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (read.on_chunk)(&chunk)));
        match outcome {
            Ok(BodyControl::Continue) => self.shared.restore_body_read(call, read),
            Ok(BodyControl::Stop) => {
                self.shared.stop_body(call);
                self.finish_body_read(call, read);
            }
            Err(_) => {
                tracing::error!(call = call.0, "body chunk handler panicked; stopping read");
                self.shared.stop_body(call);
                self.finish_body_read(call, read);
            }
        }
    }

    /// Run the consumer-side end-of-body delivery.
    pub(crate) fn run_body_end(&mut self, call: CallId) {
        let Some(read) = self.shared.take_body_read(call) else {
            tracing::debug!(call = call.0, "body end arrived after the read finished");
            return;
        };
        self.finish_body_read(call, read);
    }

    /// Hand the parked request view back to the end handler. The view's
    /// own abandonment net takes over from here: an end handler that
    /// never responds still produces a 500.
    fn finish_body_read(&mut self, call: CallId, read: BodyRead) {
        self.shared.clear_body(call);
        let request = Request::from_handle(&self.shared, read.request);
        let on_end = read.on_end;
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_end(request))).is_err() {
            tracing::error!(call = call.0, "body end handler panicked");
        }
    }
}
