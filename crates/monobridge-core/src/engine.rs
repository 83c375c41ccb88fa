//! Engine-facing interface
//!
//! The serving engine (connection handling, HTTP parsing, routing, TLS,
//! session persistence, file serving) lives outside this crate, behind the
//! [`Engine`] and [`RpcEngine`] traits. The bridge consumes those traits;
//! in return it hands the engine a [`WorkerGateway`] / [`RpcGateway`]
//! through which the engine's worker threads deliver completed work.
//!
//! All identifiers crossing this boundary are opaque integer tokens
//! (`CallId`, `StreamId`, `EndpointId`, `RpcCallId`); the engine is free
//! to derive them from whatever internal state it keeps. The bridge never
//! interprets them, only routes them.

use monobridge_common::RpcValue;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::server::ServerConfig;

/// Token correlating one accepted request with its eventual response.
///
/// Exists from the moment the engine accepts a request until a response is
/// fired back through [`Engine::fire_response`] or the stream opened for it
/// is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId(pub u64);

/// Token for one in-flight RPC invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RpcCallId(pub u64);

/// Token for an open streaming response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Identifier assigned by the engine's router to a registered endpoint.
///
/// `FALLBACK` designates the default endpoint the engine dispatches
/// unmatched requests to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId(pub i32);

impl EndpointId {
    pub const FALLBACK: EndpointId = EndpointId(-1);
}

/// View over the engine-held data of one request.
///
/// The engine owns the backing storage and hands the bridge a shared view
/// for the duration of the call; once the response has been fired the
/// bridge drops every reference to it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestData {
    pub remote_addr: String,
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    /// Whole request body, present when the endpoint carries the
    /// `read_body` flag and the engine collected it up front. Incremental
    /// delivery goes through [`WorkerGateway::body_chunk`] instead.
    pub body: Option<Vec<u8>>,
}

impl RequestData {
    /// Header lookup by key, case-insensitive.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookie(&self, key: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Body of a finished response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseBody {
    Empty,
    Bytes(Vec<u8>),
    /// Delegate serving the named file to the engine.
    File(PathBuf),
}

/// The write-only product of the response builder, handed to the engine
/// exactly once per call — either whole via [`Engine::fire_response`] or
/// as the head of a stream via [`Engine::begin_stream`].
#[derive(Clone, Debug)]
pub struct ResponsePayload {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl Default for ResponsePayload {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: ResponseBody::Empty,
        }
    }
}

impl ResponsePayload {
    /// Body bytes, if the body is inline.
    pub fn body_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            ResponseBody::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Decision returned by a consumer-side body-chunk handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyControl {
    Continue,
    Stop,
}

/// The HTTP serving engine, as seen by the bridge.
///
/// Configuration calls (`apply_config`, `add_endpoint`,
/// `set_endpoint_flag`, `install_gateway`, `listen`) happen once, before
/// any dispatch. The per-call group (`borrow_request`, session access,
/// `fire_response`, streaming) may be invoked from the consumer thread at
/// any time while the call is live; `fire_response` and `close_stream`
/// are terminal and the engine may recycle the call's state as soon as
/// they return.
pub trait Engine: Send + Sync + 'static {
    fn apply_config(&self, config: &ServerConfig);

    /// Register a route path with the engine's router and return its
    /// endpoint id. The empty path registers the fallback endpoint and
    /// yields [`EndpointId::FALLBACK`].
    fn add_endpoint(&self, path: &str) -> EndpointId;

    fn set_endpoint_flag(&self, endpoint: EndpointId, flag: &str, value: bool);

    /// Hand the engine the worker-thread entry points into the bridge.
    fn install_gateway(&self, gateway: Arc<dyn WorkerGateway>);

    fn listen(&self, addr: &str);

    /// Borrow the request belonging to a live call. Returns `None` once
    /// the call has completed.
    fn borrow_request(&self, call: CallId) -> Option<Arc<RequestData>>;

    fn session_item(&self, call: CallId, key: &str) -> Option<String>;

    fn set_session_item(&self, call: CallId, key: &str, value: &str);

    /// Start incremental delivery of the call's body. The engine feeds
    /// chunks through [`WorkerGateway::body_chunk`] and signals the end
    /// of the body through [`WorkerGateway::body_end`]. Chunks must not
    /// be delivered before this is called.
    fn read_body(&self, call: CallId);

    /// Deliver the finished response for a call. Returns `false` if the
    /// call was unknown or already completed.
    fn fire_response(&self, call: CallId, response: ResponsePayload) -> bool;

    /// Commit the response head and switch the call to chunked delivery.
    fn begin_stream(&self, call: CallId, head: ResponsePayload) -> StreamId;

    /// Append one chunk to an open stream. Returns `false` if the peer is
    /// gone and further writes are pointless.
    fn send_chunk(&self, stream: StreamId, data: &[u8]) -> bool;

    /// Finalize the stream's connection.
    fn close_stream(&self, stream: StreamId);
}

/// The RPC serving engine, as seen by the bridge.
pub trait RpcEngine: Send + Sync + 'static {
    fn install_gateway(&self, gateway: Arc<dyn RpcGateway>);

    fn start(&self, addr: &str);

    /// Deliver the result of a call. Terminal; invoked exactly once per
    /// dispatched call.
    fn end_call(&self, call: RpcCallId, result: RpcValue);
}

/// Worker-thread entry points into the bridge for HTTP traffic.
///
/// The engine may invoke these from any thread; they enqueue work for the
/// consumer thread and return without blocking beyond a mutex hold.
pub trait WorkerGateway: Send + Sync + 'static {
    /// A request matched (or fell through to) an endpoint.
    fn dispatch_endpoint(&self, endpoint: EndpointId, call: CallId);

    /// One body chunk arrived for a call. The return value is the
    /// continue/stop decision accumulated from handler runs so far:
    /// `false` tells the engine to stop reading. The decision for *this*
    /// chunk is reflected no earlier than the next invocation, because
    /// the handler runs asynchronously on the consumer thread.
    fn body_chunk(&self, call: CallId, chunk: Vec<u8>) -> bool;

    /// The call's body is complete; no further chunks will arrive.
    fn body_end(&self, call: CallId);
}

/// Worker-thread entry point into the bridge for RPC traffic.
pub trait RpcGateway: Send + Sync + 'static {
    fn dispatch_call(&self, method: &str, call: RpcCallId, params: Vec<RpcValue>);
}
