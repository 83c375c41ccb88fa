//! Response builder and lifecycle state machine
//!
//! A [`Response`] is created empty from a request, mutated by host code,
//! and sent exactly once. Sending fires the payload through the call's
//! token and invalidates both the response and the request handles. A
//! response may instead delegate completion to a streaming channel via
//! [`Response::open_stream`], after which `send` is illegal and the
//! stream's `close` becomes the terminal step.
//!
//! Dropping a response that was created but never sent fires a 500
//! diagnostic through the still-valid call.

use monobridge_common::{BridgeError, Result};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::BridgeShared;
use crate::engine::{CallId, ResponseBody, ResponsePayload};
use crate::registry::{Handle, ResourceKind};
use crate::request::EndpointContextState;
use crate::stream::{ResponseStream, StreamState};

pub(crate) struct ResponseState {
    pub call: CallId,
    pub request: Handle,
    pub context: Handle,
    pub payload: ResponsePayload,
    // Kept for the completion log line; the request handle may be gone
    // by the time the response fires.
    pub method: String,
    pub uri: String,
}

/// Write-only response builder. Confined to the consumer thread.
pub struct Response {
    shared: Arc<BridgeShared>,
    handle: Handle,
    finished: bool,
    streamed: bool,
    _consumer_thread: PhantomData<*mut ()>,
}

impl Response {
    pub(crate) fn from_parts(shared: Arc<BridgeShared>, handle: Handle) -> Self {
        Self {
            shared,
            handle,
            finished: false,
            streamed: false,
            _consumer_thread: PhantomData,
        }
    }

    fn mutate(&mut self, f: impl FnOnce(&mut ResponsePayload)) -> Result<&mut Self> {
        if self.finished {
            return Err(BridgeError::ResponseAlreadySent);
        }
        self.shared
            .registry
            .with(self.handle, ResourceKind::Response, |s: &mut ResponseState| {
                f(&mut s.payload)
            })?;
        Ok(self)
    }

    pub fn set_status(&mut self, status: u16) -> Result<&mut Self> {
        self.mutate(|p| p.status = status)
    }

    pub fn set_header(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        let (key, value) = (key.to_owned(), value.to_owned());
        self.mutate(|p| p.headers.push((key, value)))
    }

    pub fn set_cookie(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        let (key, value) = (key.to_owned(), value.to_owned());
        self.mutate(|p| p.cookies.push((key, value)))
    }

    pub fn set_body(&mut self, body: impl AsRef<[u8]>) -> Result<&mut Self> {
        let bytes = body.as_ref().to_vec();
        self.mutate(|p| p.body = ResponseBody::Bytes(bytes))
    }

    /// Delegate serving a file to the engine.
    pub fn set_file(&mut self, path: impl Into<PathBuf>) -> Result<&mut Self> {
        let path = path.into();
        self.mutate(|p| p.body = ResponseBody::File(path))
    }

    /// Fire the response through the call and end this builder's life.
    ///
    /// The second call fails with `ResponseAlreadySent` and the engine
    /// sees nothing. The paired request handle is invalidated here: the
    /// engine may recycle connection state as soon as this returns.
    pub fn send(&mut self) -> Result<()> {
        if self.finished {
            return Err(BridgeError::ResponseAlreadySent);
        }
        let state = self
            .shared
            .registry
            .take::<ResponseState>(self.handle, ResourceKind::Response)?;
        self.finished = true;

        let _ = self.shared.registry.invalidate(state.request);
        let _ = self.shared.registry.invalidate(state.context);

        let status = state.payload.status;
        if !self.shared.engine().fire_response(state.call, state.payload) {
            tracing::warn!(call = state.call.0, "engine rejected response");
        }
        if self.shared.request_logging() {
            tracing::info!(method = %state.method, uri = %state.uri, status, "request completed");
        }
        self.shared.clear_body(state.call);
        Ok(())
    }

    /// Switch this response to incremental delivery.
    ///
    /// Legal once, and only before `send`: the head (status, headers,
    /// cookies) is committed to the engine immediately, the paired
    /// request becomes invalid, and the returned stream's `close` is the
    /// terminal step for the call.
    pub fn open_stream(&mut self) -> Result<ResponseStream> {
        if self.streamed {
            return Err(BridgeError::StreamAlreadyCreated);
        }
        if self.finished {
            return Err(BridgeError::ResponseAlreadySent);
        }
        let state = self
            .shared
            .registry
            .take::<ResponseState>(self.handle, ResourceKind::Response)?;
        self.streamed = true;
        self.finished = true;

        // The endpoint context is consumed by exactly one stream.
        let _ = self
            .shared
            .registry
            .take::<EndpointContextState>(state.context, ResourceKind::EndpointContext);
        let _ = self.shared.registry.invalidate(state.request);

        let status = state.payload.status;
        let stream = self.shared.engine().begin_stream(state.call, state.payload);
        if self.shared.request_logging() {
            tracing::info!(method = %state.method, uri = %state.uri, status, "request streaming");
        }
        self.shared.clear_body(state.call);

        let handle = self.shared.registry.wrap(
            ResourceKind::StreamProvider,
            StreamState {
                stream,
                call: state.call,
            },
        );
        Ok(ResponseStream::from_parts(self.shared.clone(), handle))
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Abandonment: created but never sent. Discard whatever was
        // built and fire a diagnostic 500 so the connection terminates.
        let Ok(state) = self
            .shared
            .registry
            .take::<ResponseState>(self.handle, ResourceKind::Response)
        else {
            return;
        };

        tracing::warn!(
            call = state.call.0,
            method = %state.method,
            uri = %state.uri,
            "response dropped without sending; sending 500"
        );
        let _ = self.shared.registry.invalidate(state.request);
        let _ = self.shared.registry.invalidate(state.context);

        let payload = ResponsePayload {
            status: 500,
            body: ResponseBody::Bytes(b"Response dropped without sending".to_vec()),
            ..ResponsePayload::default()
        };
        if !self.shared.engine().fire_response(state.call, payload) {
            tracing::warn!(call = state.call.0, "engine rejected abandonment response");
        }
        self.shared.clear_body(state.call);
    }
}
