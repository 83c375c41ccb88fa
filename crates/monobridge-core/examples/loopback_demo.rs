//! Drives the host-facing surface against the loopback engine: a couple
//! of HTTP routes (one streamed), the 404/500 safety nets, and an RPC
//! method. Run with `RUST_LOG=debug` to watch the dispatch steps.

use anyhow::Result;
use monobridge_core::engine::RequestData;
use monobridge_core::loopback::{LoopbackEngine, LoopbackRpcEngine};
use monobridge_core::rpc::{RpcServer, RpcServerConfig};
use monobridge_core::server::{Server, ServerConfig};
use monobridge_common::RpcValue;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    let engine = Arc::new(LoopbackEngine::new());
    let mut server = Server::new(engine.clone(), ServerConfig::default());

    server.route("/hello", &[], |req| {
        let who = req.header("x-name").unwrap().unwrap_or_else(|| "world".into());
        let mut resp = req.create_response().unwrap();
        resp.set_status(200).unwrap();
        resp.set_body(format!("hello, {who}")).unwrap();
        resp.send().unwrap();
    })?;

    server.route("/feed", &[], |req| {
        let mut resp = req.create_response().unwrap();
        resp.set_header("content-type", "text/event-stream").unwrap();
        let mut stream = resp.open_stream().unwrap();
        for i in 0..3 {
            stream.write(format!("event {i}\n")).unwrap();
        }
        stream.close().unwrap();
    })?;

    server.route("/buggy", &[], |_req| {
        // Never responds; the abandonment net answers for it.
    })?;

    server.listen("127.0.0.1:8080")?;

    let call = engine.inject(RequestData {
        method: "GET".into(),
        uri: "/hello".into(),
        headers: vec![("x-name".into(), "bridge".into())],
        ..RequestData::default()
    });
    let resp = engine.wait_response(call, WAIT).expect("no response");
    println!(
        "GET /hello -> {} {:?}",
        resp.status,
        String::from_utf8_lossy(resp.body_bytes().unwrap_or_default())
    );

    let call = engine.inject(RequestData {
        method: "GET".into(),
        uri: "/feed".into(),
        ..RequestData::default()
    });
    let record = engine.wait_stream_closed(call, WAIT).expect("stream not closed");
    println!("GET /feed -> {} ({} chunks)", record.head.status, record.chunks.len());

    for uri in ["/buggy", "/no/such/route"] {
        let call = engine.inject(RequestData {
            method: "GET".into(),
            uri: uri.into(),
            ..RequestData::default()
        });
        let resp = engine.wait_response(call, WAIT).expect("no response");
        println!("GET {uri} -> {}", resp.status);
    }

    let rpc_engine = Arc::new(LoopbackRpcEngine::new());
    let mut config = RpcServerConfig::new();
    config.add_method("multiply", |mut call| {
        let a = call.param(0).unwrap().as_i32().unwrap();
        let b = call.param(1).unwrap().as_i32().unwrap();
        let result = call.make_param(RpcValue::I32(a * b));
        call.end(result).unwrap();
    });
    let mut rpc_server = RpcServer::new(rpc_engine.clone(), config);
    rpc_server.start("127.0.0.1:8081")?;

    let call = rpc_engine.inject_call("multiply", vec![RpcValue::I32(6), RpcValue::I32(7)]);
    println!("multiply(6, 7) -> {:?}", rpc_engine.wait_result(call, WAIT));

    server.shutdown();
    rpc_server.shutdown();
    Ok(())
}
