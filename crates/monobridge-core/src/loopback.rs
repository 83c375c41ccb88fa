//! Loopback engine
//!
//! An in-process [`Engine`]/[`RpcEngine`] implementation used by the test
//! suite and examples. Callers play the role of engine worker threads:
//! [`LoopbackEngine::inject`] routes a synthetic request and dispatches it
//! through the installed gateway from the calling thread; responses,
//! stream chunks and session writes are recorded and can be awaited.
//!
//! Routing is deliberately primitive (exact path match, query string
//! stripped, unmatched paths to the fallback endpoint) — real routing
//! belongs to a real engine.

use monobridge_common::RpcValue;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::engine::{
    CallId, EndpointId, Engine, RequestData, ResponsePayload, RpcCallId, RpcEngine, RpcGateway,
    StreamId, WorkerGateway,
};
use crate::server::ServerConfig;

/// Recorded output of a streamed response.
#[derive(Clone, Debug)]
pub struct StreamRecord {
    pub head: ResponsePayload,
    pub chunks: Vec<Vec<u8>>,
    pub closed: bool,
}

struct LoopbackCall {
    data: Arc<RequestData>,
    session: HashMap<String, String>,
    response: Option<ResponsePayload>,
    stream: Option<u64>,
    completed: bool,
    body_read_requested: bool,
}

struct HttpState {
    gateway: Option<Arc<dyn WorkerGateway>>,
    config: Option<ServerConfig>,
    listening: Option<String>,
    routes: HashMap<String, EndpointId>,
    flags: HashMap<i32, Vec<String>>,
    next_endpoint: i32,
    calls: HashMap<u64, LoopbackCall>,
    next_call: u64,
    streams: HashMap<u64, StreamRecord>,
    next_stream: u64,
}

/// In-process HTTP engine double.
pub struct LoopbackEngine {
    state: Mutex<HttpState>,
    completed: Condvar,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HttpState {
                gateway: None,
                config: None,
                listening: None,
                routes: HashMap::new(),
                flags: HashMap::new(),
                next_endpoint: 1,
                calls: HashMap::new(),
                next_call: 1,
                streams: HashMap::new(),
                next_stream: 1,
            }),
            completed: Condvar::new(),
        }
    }

    /// Accept a synthetic request: route it, record the call, and
    /// dispatch through the gateway from the calling thread (which
    /// thereby acts as an engine worker).
    pub fn inject(&self, data: RequestData) -> CallId {
        let (gateway, endpoint, call) = {
            let mut state = self.state.lock().unwrap();
            let path = data.uri.split('?').next().unwrap_or("").to_owned();
            let endpoint = state.routes.get(&path).copied().unwrap_or(EndpointId::FALLBACK);
            let call = CallId(state.next_call);
            state.next_call += 1;
            state.calls.insert(
                call.0,
                LoopbackCall {
                    data: Arc::new(data),
                    session: HashMap::new(),
                    response: None,
                    stream: None,
                    completed: false,
                    body_read_requested: false,
                },
            );
            (state.gateway.clone(), endpoint, call)
        };

        match gateway {
            Some(gateway) => gateway.dispatch_endpoint(endpoint, call),
            None => tracing::error!("request injected before a gateway was installed"),
        }
        call
    }

    /// Deliver one body chunk for a call, as an engine worker would.
    /// Returns the gateway's continue/stop answer.
    pub fn push_body_chunk(&self, call: CallId, chunk: Vec<u8>) -> bool {
        let gateway = self.state.lock().unwrap().gateway.clone();
        match gateway {
            Some(gateway) => gateway.body_chunk(call, chunk),
            None => false,
        }
    }

    /// Signal end-of-body for a call, as an engine worker would.
    pub fn push_body_end(&self, call: CallId) {
        let gateway = self.state.lock().unwrap().gateway.clone();
        if let Some(gateway) = gateway {
            gateway.body_end(call);
        }
    }

    /// Whether the host asked for an incremental body read on this call.
    pub fn body_read_requested(&self, call: CallId) -> bool {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&call.0)
            .is_some_and(|c| c.body_read_requested)
    }

    /// Block until a whole response has been fired for the call.
    pub fn wait_response(&self, call: CallId, timeout: Duration) -> Option<ResponsePayload> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(response) = state.calls.get(&call.0).and_then(|c| c.response.clone()) {
                return Some(response);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.completed.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    /// The response fired for a call, if any, without blocking.
    pub fn response(&self, call: CallId) -> Option<ResponsePayload> {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&call.0)
            .and_then(|c| c.response.clone())
    }

    /// Block until the call's stream has been closed.
    pub fn wait_stream_closed(&self, call: CallId, timeout: Duration) -> Option<StreamRecord> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            let record = state
                .calls
                .get(&call.0)
                .and_then(|c| c.stream)
                .and_then(|s| state.streams.get(&s))
                .filter(|r| r.closed)
                .cloned();
            if let Some(record) = record {
                return Some(record);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.completed.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    /// The stream record for a call, if streaming was begun.
    pub fn stream_record(&self, call: CallId) -> Option<StreamRecord> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .get(&call.0)
            .and_then(|c| c.stream)
            .and_then(|s| state.streams.get(&s))
            .cloned()
    }

    /// Snapshot of the engine-held session store for a call.
    pub fn session_snapshot(&self, call: CallId) -> HashMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&call.0)
            .map(|c| c.session.clone())
            .unwrap_or_default()
    }

    pub fn applied_config(&self) -> Option<ServerConfig> {
        self.state.lock().unwrap().config.clone()
    }

    pub fn listening_addr(&self) -> Option<String> {
        self.state.lock().unwrap().listening.clone()
    }

    pub fn endpoint_flags(&self, endpoint: EndpointId) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .flags
            .get(&endpoint.0)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for LoopbackEngine {
    fn apply_config(&self, config: &ServerConfig) {
        self.state.lock().unwrap().config = Some(config.clone());
    }

    fn add_endpoint(&self, path: &str) -> EndpointId {
        let mut state = self.state.lock().unwrap();
        let endpoint = if path.is_empty() {
            EndpointId::FALLBACK
        } else {
            let id = EndpointId(state.next_endpoint);
            state.next_endpoint += 1;
            id
        };
        state.routes.insert(path.to_owned(), endpoint);
        endpoint
    }

    fn set_endpoint_flag(&self, endpoint: EndpointId, flag: &str, value: bool) {
        let mut state = self.state.lock().unwrap();
        let flags = state.flags.entry(endpoint.0).or_default();
        if value {
            if !flags.iter().any(|f| f == flag) {
                flags.push(flag.to_owned());
            }
        } else {
            flags.retain(|f| f != flag);
        }
    }

    fn install_gateway(&self, gateway: Arc<dyn WorkerGateway>) {
        self.state.lock().unwrap().gateway = Some(gateway);
    }

    fn listen(&self, addr: &str) {
        self.state.lock().unwrap().listening = Some(addr.to_owned());
    }

    fn borrow_request(&self, call: CallId) -> Option<Arc<RequestData>> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .get(&call.0)
            .filter(|c| !c.completed)
            .map(|c| c.data.clone())
    }

    fn session_item(&self, call: CallId, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&call.0)
            .and_then(|c| c.session.get(key).cloned())
    }

    fn set_session_item(&self, call: CallId, key: &str, value: &str) {
        if let Some(c) = self.state.lock().unwrap().calls.get_mut(&call.0) {
            c.session.insert(key.to_owned(), value.to_owned());
        }
    }

    fn read_body(&self, call: CallId) {
        if let Some(c) = self.state.lock().unwrap().calls.get_mut(&call.0) {
            c.body_read_requested = true;
        }
    }

    fn fire_response(&self, call: CallId, response: ResponsePayload) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(c) = state.calls.get_mut(&call.0) else {
            return false;
        };
        if c.completed {
            // Exactly-once: the first terminal response wins.
            return false;
        }
        c.response = Some(response);
        c.completed = true;
        self.completed.notify_all();
        true
    }

    fn begin_stream(&self, call: CallId, head: ResponsePayload) -> StreamId {
        let mut state = self.state.lock().unwrap();
        let stream = state.next_stream;
        state.next_stream += 1;
        state.streams.insert(
            stream,
            StreamRecord {
                head,
                chunks: Vec::new(),
                closed: false,
            },
        );
        if let Some(c) = state.calls.get_mut(&call.0) {
            c.stream = Some(stream);
            // The head is committed; connection state may be recycled.
            c.completed = true;
        }
        StreamId(stream)
    }

    fn send_chunk(&self, stream: StreamId, data: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.streams.get_mut(&stream.0) {
            Some(record) if !record.closed => {
                record.chunks.push(data.to_vec());
                self.completed.notify_all();
                true
            }
            _ => false,
        }
    }

    fn close_stream(&self, stream: StreamId) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.streams.get_mut(&stream.0) {
            record.closed = true;
            self.completed.notify_all();
        }
    }
}

struct RpcState {
    gateway: Option<Arc<dyn RpcGateway>>,
    started: Option<String>,
    results: HashMap<u64, RpcValue>,
    next_call: u64,
}

/// In-process RPC engine double.
pub struct LoopbackRpcEngine {
    state: Mutex<RpcState>,
    ended: Condvar,
}

impl LoopbackRpcEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RpcState {
                gateway: None,
                started: None,
                results: HashMap::new(),
                next_call: 1,
            }),
            ended: Condvar::new(),
        }
    }

    /// Deliver a synthetic invocation from the calling thread.
    pub fn inject_call(&self, method: &str, params: Vec<RpcValue>) -> RpcCallId {
        let (gateway, call) = {
            let mut state = self.state.lock().unwrap();
            let call = RpcCallId(state.next_call);
            state.next_call += 1;
            (state.gateway.clone(), call)
        };
        match gateway {
            Some(gateway) => gateway.dispatch_call(method, call, params),
            None => tracing::error!("RPC call injected before a gateway was installed"),
        }
        call
    }

    /// Block until the call's result arrives.
    pub fn wait_result(&self, call: RpcCallId, timeout: Duration) -> Option<RpcValue> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(result) = state.results.get(&call.0) {
                return Some(result.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.ended.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    pub fn started_addr(&self) -> Option<String> {
        self.state.lock().unwrap().started.clone()
    }
}

impl Default for LoopbackRpcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcEngine for LoopbackRpcEngine {
    fn install_gateway(&self, gateway: Arc<dyn RpcGateway>) {
        self.state.lock().unwrap().gateway = Some(gateway);
    }

    fn start(&self, addr: &str) {
        self.state.lock().unwrap().started = Some(addr.to_owned());
    }

    fn end_call(&self, call: RpcCallId, result: RpcValue) {
        let mut state = self.state.lock().unwrap();
        if state.results.contains_key(&call.0) {
            tracing::warn!(call = call.0, "duplicate result for RPC call discarded");
            return;
        }
        state.results.insert(call.0, result);
        self.ended.notify_all();
    }
}
