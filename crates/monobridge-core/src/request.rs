//! Host-facing request view
//!
//! A [`Request`] is handed to an endpoint handler on the consumer thread.
//! It borrows engine-held request data through the handle registry; once
//! the paired response has been sent (or streaming has begun) the handle
//! is invalidated and every accessor fails with `UseAfterConsume`, because
//! the engine may recycle the underlying connection state at that point.
//!
//! Dropping a request whose handler never created a response fires a 500
//! through the still-valid call so the client is never left hanging.

use monobridge_common::{BridgeError, Result};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::bridge::{BodyRead, BridgeShared};
use crate::engine::{BodyControl, CallId, RequestData, ResponseBody, ResponsePayload};
use crate::registry::{Handle, ResourceKind};
use crate::response::{Response, ResponseState};

/// Per-call context consumed when a response delegates completion to a
/// stream.
pub(crate) struct EndpointContextState {
    pub call: CallId,
}

pub(crate) struct RequestState {
    pub call: CallId,
    pub data: Arc<RequestData>,
    pub response_created: bool,
    pub context: Handle,
    pub custom: HashMap<String, String>,
}

/// View over one in-flight request. Confined to the consumer thread.
pub struct Request {
    shared: Arc<BridgeShared>,
    handle: Handle,
    /// Set while the view is parked in an incremental body read; the
    /// drop net stands down because the read's end handler will get the
    /// view back.
    detached: bool,
    _consumer_thread: PhantomData<*mut ()>,
}

impl Request {
    /// Bind a request view to a live call. Called by the dispatcher on
    /// the consumer thread.
    pub(crate) fn attach(shared: &Arc<BridgeShared>, call: CallId, data: Arc<RequestData>) -> Self {
        let context = shared
            .registry
            .wrap(ResourceKind::EndpointContext, EndpointContextState { call });
        let handle = shared.registry.wrap(
            ResourceKind::Request,
            RequestState {
                call,
                data,
                response_created: false,
                context,
                custom: HashMap::new(),
            },
        );
        Self::from_handle(shared, handle)
    }

    /// Rebind a view around an existing request entry, e.g. when a body
    /// read hands the parked request back to its end handler.
    pub(crate) fn from_handle(shared: &Arc<BridgeShared>, handle: Handle) -> Self {
        Self {
            shared: shared.clone(),
            handle,
            detached: false,
            _consumer_thread: PhantomData,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RequestState) -> R) -> Result<R> {
        self.shared
            .registry
            .with(self.handle, ResourceKind::Request, f)
    }

    pub fn remote_addr(&self) -> Result<String> {
        self.with_state(|s| s.data.remote_addr.clone())
    }

    pub fn method(&self) -> Result<String> {
        self.with_state(|s| s.data.method.clone())
    }

    pub fn uri(&self) -> Result<String> {
        self.with_state(|s| s.data.uri.clone())
    }

    pub fn header(&self, key: &str) -> Result<Option<String>> {
        self.with_state(|s| s.data.header(key).map(str::to_owned))
    }

    pub fn headers(&self) -> Result<Vec<(String, String)>> {
        self.with_state(|s| s.data.headers.clone())
    }

    pub fn cookie(&self, key: &str) -> Result<Option<String>> {
        self.with_state(|s| s.data.cookie(key).map(str::to_owned))
    }

    pub fn cookies(&self) -> Result<Vec<(String, String)>> {
        self.with_state(|s| s.data.cookies.clone())
    }

    /// Whole request body, if the engine collected one up front.
    pub fn body(&self) -> Result<Option<Vec<u8>>> {
        self.with_state(|s| s.data.body.clone())
    }

    /// Session item lookup; session storage lives in the engine.
    pub fn session_item(&self, key: &str) -> Result<Option<String>> {
        let call = self.with_state(|s| s.call)?;
        Ok(self.shared.engine().session_item(call, key))
    }

    pub fn set_session_item(&self, key: &str, value: &str) -> Result<()> {
        let call = self.with_state(|s| s.call)?;
        self.shared.engine().set_session_item(call, key, value);
        Ok(())
    }

    /// Host-side key/value stash scoped to this request.
    pub fn custom_property(&self, key: &str) -> Result<Option<String>> {
        self.with_state(|s| s.custom.get(key).cloned())
    }

    pub fn set_custom_property(&self, key: &str, value: &str) -> Result<()> {
        self.with_state(|s| {
            s.custom.insert(key.to_owned(), value.to_owned());
        })
    }

    /// Start an incremental read of the request body.
    ///
    /// The view is parked for the duration of the read. Each
    /// engine-delivered chunk is marshaled through the task queue and
    /// handed to `on_chunk` on the consumer thread; returning
    /// [`BodyControl::Stop`] flips the shared stop flag the engine
    /// worker checks on its next chunk delivery. When the read finishes
    /// (end of body, or `on_chunk` said stop) `on_end` receives the view
    /// back and completes the request as usual, including the 500 net if
    /// it never responds.
    pub fn read_body(
        mut self,
        on_chunk: impl FnMut(&[u8]) -> BodyControl + Send + 'static,
        on_end: impl FnOnce(Request) + Send + 'static,
    ) -> Result<()> {
        let call = self.with_state(|s| s.call)?;
        // The stop flag must be armed before the engine can deliver the
        // first chunk.
        self.shared.begin_body_read(
            call,
            BodyRead {
                on_chunk: Box::new(on_chunk),
                on_end: Box::new(on_end),
                request: self.handle,
            },
        );
        self.detached = true;
        self.shared.engine().read_body(call);
        Ok(())
    }

    /// Create the response for this request. Legal exactly once.
    pub fn create_response(&self) -> Result<Response> {
        let (call, context, method, uri) = self.with_state(|s| {
            if s.response_created {
                return Err(BridgeError::ResponseAlreadyCreated);
            }
            s.response_created = true;
            Ok((s.call, s.context, s.data.method.clone(), s.data.uri.clone()))
        })??;

        let handle = self.shared.registry.wrap(
            ResourceKind::Response,
            ResponseState {
                call,
                request: self.handle,
                context,
                payload: ResponsePayload::default(),
                method,
                uri,
            },
        );
        Ok(Response::from_parts(self.shared.clone(), handle))
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        // Parked in a body read: the end handler owns completion now.
        if self.detached {
            return;
        }
        // Handle already invalidated means the lifecycle completed
        // (response sent or streaming begun).
        let Ok((call, context, response_created)) =
            self.with_state(|s| (s.call, s.context, s.response_created))
        else {
            return;
        };

        if response_created {
            // A live Response owns completion from here on.
            return;
        }

        // Abandonment: the handler returned without ever asking for a
        // response. Convert the leak into a visible error response.
        tracing::warn!(
            call = call.0,
            "request dropped without creating a response; sending 500"
        );
        let _ = self.shared.registry.invalidate(self.handle);
        let _ = self.shared.registry.invalidate(context);

        let payload = ResponsePayload {
            status: 500,
            body: ResponseBody::Bytes(b"Request dropped without creating a response".to_vec()),
            ..ResponsePayload::default()
        };
        if !self.shared.engine().fire_response(call, payload) {
            tracing::warn!(call = call.0, "engine rejected abandonment response");
        }
        self.shared.clear_body(call);
    }
}
