//! Request/response correlation
//!
//! Every outbound CALL gets a fresh uuid message id and a one-shot slot.
//! The inbound loop resolves slots when a CALLRESULT or CALLERROR with the
//! same id arrives; a call that times out removes its own slot, so a late
//! reply finds nothing and is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::ocpp::{Call, CallError, CallResult, OcppMessage, Request};

/// Outbound call awaiting its response
#[derive(Debug)]
pub struct PendingCall {
    pub action: String,
    pub created_at: Instant,
    result_tx: oneshot::Sender<Result<Value, CommandError>>,
}

/// Discards its call from the table when dropped
struct PendingEntry<'a> {
    calls: &'a PendingCalls,
    message_id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        // no-op once the call was completed
        self.calls.discard(self.message_id);
    }
}

#[derive(Debug, Default)]
struct Inner {
    calls: HashMap<String, PendingCall>,
    closed: bool,
}

/// Table of outstanding outbound calls for one connection
#[derive(Debug, Clone, Default)]
pub struct PendingCalls {
    inner: Arc<Mutex<Inner>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a call; fails once the table has been closed
    pub fn register(
        &self,
        message_id: &str,
        action: &str,
    ) -> Result<oneshot::Receiver<Result<Value, CommandError>>, CommandError> {
        let (result_tx, result_rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CommandError::ConnectionClosed);
        }
        inner.calls.insert(
            message_id.to_string(),
            PendingCall {
                action: action.to_string(),
                created_at: Instant::now(),
                result_tx,
            },
        );
        Ok(result_rx)
    }

    /// Fulfil a pending call. Returns false if nothing was waiting on the id.
    pub fn complete(&self, message_id: &str, result: Result<Value, CommandError>) -> bool {
        let pending = self.inner.lock().calls.remove(message_id);
        match pending {
            Some(call) => {
                debug!(
                    "Response for {} ({}) after {:?}",
                    call.action,
                    message_id,
                    call.created_at.elapsed()
                );
                // the caller may have given up already
                let _ = call.result_tx.send(result);
                true
            }
            None => {
                warn!("Discarding response for unknown message id {}", message_id);
                false
            }
        }
    }

    pub fn resolve_result(&self, result: CallResult) -> bool {
        self.complete(&result.message_id, Ok(result.payload))
    }

    pub fn resolve_error(&self, error: CallError) -> bool {
        self.complete(
            &error.message_id,
            Err(CommandError::Rejected {
                code: error.error_code,
                description: error.error_description,
            }),
        )
    }

    /// Drop a pending call without resolving it
    pub fn discard(&self, message_id: &str) -> Option<PendingCall> {
        self.inner.lock().calls.remove(message_id)
    }

    /// Fail every outstanding call with `ConnectionClosed` and refuse new ones
    pub fn close(&self) -> usize {
        let drained: Vec<(String, PendingCall)> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.calls.drain().collect()
        };

        let count = drained.len();
        for (message_id, call) in drained {
            debug!("Failing {} ({}): connection closed", call.action, message_id);
            let _ = call.result_tx.send(Err(CommandError::ConnectionClosed));
        }
        count
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.inner.lock().calls.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `call` on `outbound` and wait up to `timeout` for its response.
    ///
    /// The deadline covers queueing the frame as well as the reply. The
    /// pending entry is removed when the call returns or its future is
    /// dropped.
    pub async fn call_raw(
        &self,
        outbound: &mpsc::Sender<OcppMessage>,
        call: Call,
        timeout: Duration,
    ) -> Result<Value, CommandError> {
        let message_id = call.message_id.clone();
        let response_rx = self.register(&message_id, &call.action)?;
        let _entry = PendingEntry {
            calls: self,
            message_id: &message_id,
        };

        let exchange = async {
            outbound
                .send(OcppMessage::Call(call))
                .await
                .map_err(|_| CommandError::ConnectionClosed)?;
            response_rx
                .await
                .map_err(|_| CommandError::ConnectionClosed)?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Timeout),
        }
    }

    /// Typed variant of [`PendingCalls::call_raw`]
    pub async fn call<R: Request>(
        &self,
        outbound: &mpsc::Sender<OcppMessage>,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response, CommandError> {
        let call = Call::from_request(request)?;
        let payload = self.call_raw(outbound, call, timeout).await?;
        serde_json::from_value(payload).map_err(|e| CommandError::Codec(e.into()))
    }
}
