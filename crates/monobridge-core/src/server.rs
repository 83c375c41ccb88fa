//! Host-facing server surface
//!
//! A [`Server`] collects routes at configuration time, then `listen`
//! consumes the configuration, hands the engine its gateway, and spawns
//! the consumer thread that runs every handler. The engine does the
//! actual serving; the server owns the bridge plumbing around it.

use monobridge_common::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::bridge::{consumer_loop, BridgeGateway, BridgeShared, DispatchContext};
use crate::endpoint::EndpointTable;
use crate::engine::{EndpointId, Engine};
use crate::registry::{Handle, ResourceKind};
use crate::request::Request;
use crate::rpc::RpcMethodTable;

/// Server configuration. Engine-owned knobs are forwarded through
/// [`Engine::apply_config`] at listen time; the bridge itself consumes
/// only the request-logging flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub session_cookie_name: String,
    pub session_timeout_ms: u64,
    pub max_request_body_size: Option<u32>,
    pub endpoint_timeout_ms: Option<u64>,
    pub disable_request_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_cookie_name: "MONO_SESSION_ID".into(),
            session_timeout_ms: 600_000,
            max_request_body_size: None,
            endpoint_timeout_ms: None,
            disable_request_logging: false,
        }
    }
}

/// Marker stored under the `Server` kind while the server is live.
pub(crate) struct ServerToken;

/// Registration record for one route, kept for the server's lifetime.
pub(crate) struct RouteState {
    #[allow(dead_code)]
    pub endpoint: EndpointId,
    #[allow(dead_code)]
    pub path: String,
}

/// HTTP front end: owns the bridge state and the consumer thread.
pub struct Server {
    engine: Arc<dyn Engine>,
    shared: Arc<BridgeShared>,
    config: Handle,
    endpoints: Option<EndpointTable>,
    routes: Vec<Handle>,
    server: Option<Handle>,
    consumer: Option<JoinHandle<()>>,
}

impl Server {
    /// Create a server from a configuration. The configuration is
    /// wrapped into the registry and consumed by the first `listen`.
    pub fn new(engine: Arc<dyn Engine>, config: ServerConfig) -> Self {
        let shared = BridgeShared::for_http(engine.clone());
        let config = shared.registry.wrap(ResourceKind::ServerConfig, config);
        Self {
            engine,
            shared,
            config,
            endpoints: Some(EndpointTable::new()),
            routes: Vec::new(),
            server: None,
            consumer: None,
        }
    }

    /// Register a route. The engine's router assigns the endpoint id;
    /// `flags` (e.g. `"read_body"`) are applied to the underlying route.
    /// Registering the same path twice replaces the handler.
    pub fn route(
        &mut self,
        path: &str,
        flags: &[&str],
        handler: impl Fn(Request) + Send + 'static,
    ) -> Result<EndpointId> {
        let table = self.endpoints.as_mut().ok_or(BridgeError::AlreadyListening)?;

        let endpoint = self.engine.add_endpoint(path);
        for flag in flags {
            self.engine.set_endpoint_flag(endpoint, flag, true);
        }
        table.register(endpoint, path, Box::new(handler));

        let route = self.shared.registry.wrap(
            ResourceKind::RouteInfo,
            RouteState {
                endpoint,
                path: path.to_owned(),
            },
        );
        self.routes.push(route);
        tracing::debug!(path, endpoint = endpoint.0, "route registered");
        Ok(endpoint)
    }

    /// Register the default endpoint, dispatched for unmatched paths.
    pub fn fallback(&mut self, handler: impl Fn(Request) + Send + 'static) -> Result<EndpointId> {
        self.route("", &[], handler)
    }

    /// Number of registered routes.
    pub fn route_count(&self) -> usize {
        self.endpoints.as_ref().map(EndpointTable::len).unwrap_or(0)
    }

    /// Consume the configuration, spawn the consumer thread, and start
    /// the engine. Calling `listen` twice fails with `AlreadyListening`.
    pub fn listen(&mut self, addr: &str) -> Result<()> {
        let config = self
            .shared
            .registry
            .take::<ServerConfig>(self.config, ResourceKind::ServerConfig)
            .map_err(|_| BridgeError::AlreadyListening)?;
        let table = self
            .endpoints
            .take()
            .expect("endpoint table present until listen");

        self.engine.apply_config(&config);
        self.shared.set_request_logging(!config.disable_request_logging);

        let ctx = DispatchContext::new(self.shared.clone(), table, RpcMethodTable::new());
        let consumer = std::thread::Builder::new()
            .name("monobridge-consumer".into())
            .spawn(move || consumer_loop(ctx))
            .map_err(|e| BridgeError::Engine(format!("failed to spawn consumer thread: {e}")))?;
        self.consumer = Some(consumer);

        self.engine.install_gateway(BridgeGateway::new(self.shared.clone()));
        self.engine.listen(addr);
        self.server = Some(self.shared.registry.wrap(ResourceKind::Server, ServerToken));
        tracing::info!(addr, "server listening");
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

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.session_cookie_name, "MONO_SESSION_ID");
        assert_eq!(config.session_timeout_ms, 600_000);
        assert!(config.max_request_body_size.is_none());
        assert!(!config.disable_request_logging);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"session_timeout_ms": 1000}"#).unwrap();
        assert_eq!(config.session_timeout_ms, 1000);
        assert_eq!(config.session_cookie_name, "MONO_SESSION_ID");
    }
}
