//! Inbound request handling.

use crate::error::ClientError;
use bytes::Bytes;
use iris_protocol::{ErrorCode, Message, ReplyError, RequestId};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a request handler. Travels back to the requester as
/// an error reply.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Callbacks for traffic addressed to this connection's cluster.
///
/// Each inbound request is handled on its own blocking task, so
/// implementations may block and are invoked concurrently.
pub trait Handler: Send + Sync + 'static {
    /// Serves one request, returning the reply payload.
    fn handle_request(&self, request: Bytes) -> Result<Bytes, HandlerError>;

    /// Called once if the relay connection is lost without a local `close`.
    fn handle_drop(&self, reason: &ClientError) {
        tracing::debug!("connection dropped: {}", reason);
    }
}

impl<F> Handler for F
where
    F: Fn(Bytes) -> Result<Bytes, HandlerError> + Send + Sync + 'static,
{
    fn handle_request(&self, request: Bytes) -> Result<Bytes, HandlerError> {
        self(request)
    }
}

/// Runs the handler for one inbound request and builds the reply to send back.
///
/// Always yields exactly one message carrying `id`: the handler's payload, or
/// an error reply if it failed or panicked.
pub(crate) async fn invoke(handler: Arc<dyn Handler>, id: RequestId, request: Bytes) -> Message {
    let result = tokio::task::spawn_blocking(move || handler.handle_request(request)).await;
    match result {
        Ok(Ok(reply)) => Message::reply(id, reply),
        Ok(Err(err)) => {
            tracing::debug!("handler failed for request id={}: {}", id, err);
            Message::error_reply(id, ReplyError::new(ErrorCode::HandlerFailed, err.to_string()))
        }
        Err(join_err) => {
            let message = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                "handler task cancelled".to_string()
            };
            tracing::warn!("handler panicked for request id={}: {}", id, message);
            Message::error_reply(id, ReplyError::new(ErrorCode::HandlerPanicked, message))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
