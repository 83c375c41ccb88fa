//! Streaming response channel
//!
//! The secondary completion path: once a response has delegated to a
//! stream, chunks are written incrementally and [`ResponseStream::close`]
//! finalizes the connection — the streaming equivalent of `send`.
//! Dropping an open stream closes it automatically rather than leaking
//! the connection.

use monobridge_common::{BridgeError, Result};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::bridge::BridgeShared;
use crate::engine::{CallId, StreamId};
use crate::registry::{Handle, ResourceKind};

pub(crate) struct StreamState {
    pub stream: StreamId,
    pub call: CallId,
}

/// An open streaming response body. Confined to the consumer thread.
pub struct ResponseStream {
    shared: Arc<BridgeShared>,
    handle: Handle,
    closed: bool,
    _consumer_thread: PhantomData<*mut ()>,
}

impl ResponseStream {
    pub(crate) fn from_parts(shared: Arc<BridgeShared>, handle: Handle) -> Self {
        Self {
            shared,
            handle,
            closed: false,
            _consumer_thread: PhantomData,
        }
    }

    /// Append a chunk to the open connection.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> Result<()> {
        if self.closed {
            return Err(BridgeError::StreamClosed);
        }
        let stream = self
            .shared
            .registry
            .with(self.handle, ResourceKind::StreamProvider, |s: &mut StreamState| s.stream)
            .map_err(|_| BridgeError::StreamClosed)?;

        if !self.shared.engine().send_chunk(stream, data.as_ref()) {
            tracing::debug!(stream = stream.0, "stream receiver gone; chunk discarded");
        }
        Ok(())
    }

    /// Finalize the connection and invalidate the stream handle.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(BridgeError::StreamClosed);
        }
        let state = self
            .shared
            .registry
            .take::<StreamState>(self.handle, ResourceKind::StreamProvider)?;
        self.closed = true;
        self.shared.engine().close_stream(state.stream);
        Ok(())
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(state) = self
            .shared
            .registry
            .take::<StreamState>(self.handle, ResourceKind::StreamProvider)
        else {
            return;
        };
        tracing::warn!(
            call = state.call.0,
            stream = state.stream.0,
            "stream dropped without close; closing"
        );
        self.shared.engine().close_stream(state.stream);
    }
}
