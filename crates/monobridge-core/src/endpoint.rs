//! Endpoint table and consumer-side dispatch
//!
//! Maps engine-assigned endpoint ids to registered handlers. Lookup and
//! handler invocation happen on the consumer thread, inside a drained
//! task — never on an engine worker — because handlers are host callback
//! code. A missing id is answered with a hard 404 so no request is ever
//! left hanging by a routing gap.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::bridge::DispatchContext;
use crate::engine::EndpointId;
use crate::registry::{Handle, ResourceKind};
use crate::request::Request;

pub(crate) type EndpointHandler = Box<dyn Fn(Request) + Send>;

pub(crate) struct EndpointEntry {
    pub path: String,
    pub handler: EndpointHandler,
}

/// Endpoint id → handler map. Built at configuration time, then moved
/// into the consumer thread; never mutated concurrently with dispatch.
pub(crate) struct EndpointTable {
    handlers: HashMap<i32, EndpointEntry>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Store a handler for an endpoint id. Re-registering overwrites:
    /// last write wins.
    pub fn register(&mut self, endpoint: EndpointId, path: &str, handler: EndpointHandler) {
        let entry = EndpointEntry {
            path: path.to_owned(),
            handler,
        };
        if self.handlers.insert(endpoint.0, entry).is_some() {
            tracing::debug!(endpoint = endpoint.0, path, "endpoint re-registered; replacing handler");
        }
    }

    pub fn get(&self, endpoint: EndpointId) -> Option<&EndpointEntry> {
        self.handlers.get(&endpoint.0)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl DispatchContext {
    /// Execute one drained endpoint task: consume the call token, bind a
    /// request view, and run the handler — or the 404 fallback.
    pub(crate) fn run_endpoint(&mut self, endpoint: EndpointId, call_handle: Handle) {
        let call = match self
            .shared
            .registry
            .take::<crate::engine::CallId>(call_handle, ResourceKind::CallInfo)
        {
            Ok(call) => *call,
            Err(err) => {
                tracing::error!(%err, "call token unusable; dropping dispatch");
                return;
            }
        };

        let engine = self.shared.engine().clone();
        let Some(data) = engine.borrow_request(call) else {
            tracing::warn!(call = call.0, "call completed before dispatch; dropping");
            return;
        };

        let request = Request::attach(&self.shared, call, data);

        match self.endpoints.get(endpoint) {
            Some(entry) => {
                tracing::debug!(endpoint = endpoint.0, path = %entry.path, "dispatching endpoint");
                // A panicking handler unwinds through the request's drop
                // net, which fires the 500 for us.
                if catch_unwind(AssertUnwindSafe(|| (entry.handler)(request))).is_err() {
                    tracing::error!(endpoint = endpoint.0, "endpoint handler panicked");
                }
            }
            None => {
                tracing::warn!(endpoint = endpoint.0, "no handler for endpoint; sending 404");
                respond_not_found(request);
            }
        }
    }
}

/// Hard fallback for a routing gap: answer 404 through the normal
/// lifecycle machinery.
fn respond_not_found(request: Request) {
    let outcome = (|| {
        let mut response = request.create_response()?;
        response.set_status(404)?.set_body(b"No handler for endpoint")?;
        response.send()
    })();
    if let Err(err) = outcome {
        tracing::error!(%err, "failed to send 404 fallback");
    }
}
