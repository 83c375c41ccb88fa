//! MonoBridge Core
//!
//! The boundary layer between a single-threaded scripting host and a
//! multi-threaded serving engine. Engine worker threads hand completed
//! work (requests, body chunks, RPC invocations) to a single consumer
//! thread through a cross-thread task queue; everything crossing the
//! boundary travels as a type-tagged, single-use handle; a per-request
//! lifecycle state machine guarantees every accepted request is answered
//! exactly once.
//!
//! The engine itself — connection handling, HTTP parsing, routing, TLS,
//! session persistence — lives behind the [`Engine`] and [`RpcEngine`]
//! traits. [`loopback`] provides in-process implementations for tests
//! and examples.

pub mod engine;
pub mod loopback;
pub mod registry;
pub mod request;
pub mod response;
pub mod rpc;
pub mod server;
pub mod stream;
pub mod task_queue;

mod bridge;
mod endpoint;

pub use engine::{
    BodyControl, CallId, EndpointId, Engine, RequestData, ResponseBody, ResponsePayload,
    RpcCallId, RpcEngine, RpcGateway, StreamId, WorkerGateway,
};
pub use registry::{Handle, HandleRegistry, ResourceKind};
pub use request::Request;
pub use response::Response;
pub use rpc::{RpcCall, RpcParam, RpcServer, RpcServerConfig};
pub use server::{Server, ServerConfig};
pub use stream::ResponseStream;
pub use task_queue::{TaskQueue, WakeupSignal};
