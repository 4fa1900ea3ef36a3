//! Pending-request table.
//!
//! Every outbound request owns a [`Slot`] registered under its id. The slot is
//! resolved exactly once: by the reader when the reply arrives, by the waiting
//! caller when its deadline passes, or by connection teardown. Whoever removes
//! the entry from the table owns the resolution; every later attempt is a no-op.

use crate::error::ClientError;
use bytes::Bytes;
use iris_protocol::{ReplyError, RequestId};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Terminal state of a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The remote handler replied with this payload.
    Reply(Bytes),
    /// The remote side answered with an error reply.
    Rejected(ReplyError),
    /// No reply within the caller's timeout.
    TimedOut,
    /// The connection went away.
    Closed,
}

impl Outcome {
    /// Maps the outcome onto what `request` returns to the caller.
    pub fn into_result(self) -> Result<Bytes, ClientError> {
        match self {
            Outcome::Reply(payload) => Ok(payload),
            Outcome::Rejected(error) => Err(ClientError::Application {
                code: error.code,
                message: error.message,
            }),
            Outcome::TimedOut => Err(ClientError::Timeout),
            Outcome::Closed => Err(ClientError::ConnectionClosed),
        }
    }
}

#[derive(Default)]
struct PendingState {
    slots: HashMap<RequestId, oneshot::Sender<Outcome>>,
    closed: bool,
}

/// Concurrency-safe map from request id to the waiter of its reply.
///
/// The lock only guards map mutation; outcomes are delivered after it is
/// released, and no caller ever waits while holding it.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<PendingState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh, unresolved slot for `id`.
    pub fn register(&self, id: RequestId) -> Result<Slot<'_>, ClientError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        if state.closed {
            return Err(ClientError::ConnectionClosed);
        }
        match state.slots.entry(id) {
            Entry::Occupied(_) => Err(ClientError::DuplicateRequest(id)),
            Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(Slot {
                    id,
                    table: self,
                    rx,
                })
            }
        }
    }

    /// Resolves the slot for `id` with `outcome` and removes it.
    ///
    /// Returns false if there was no such slot (already resolved, timed out or
    /// never registered) or its waiter has gone away.
    pub fn resolve(&self, id: RequestId, outcome: Outcome) -> bool {
        let tx = self.inner.lock().slots.remove(&id);
        match tx {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Closes the table and resolves every pending slot with `outcome`.
    ///
    /// Later registrations fail with [`ClientError::ConnectionClosed`].
    /// Returns the number of slots resolved.
    pub fn cancel_all(&self, outcome: Outcome) -> usize {
        let drained: Vec<_> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.slots.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(outcome.clone());
        }
        count
    }

    /// Number of requests currently awaiting an outcome.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn forget(&self, id: RequestId) {
        self.inner.lock().slots.remove(&id);
    }
}

/// The caller's end of a pending request.
///
/// Dropping the slot removes its table entry, so a caller that gives up early
/// (or whose future is dropped) never leaks one.
pub struct Slot<'a> {
    id: RequestId,
    table: &'a PendingTable,
    rx: oneshot::Receiver<Outcome>,
}

impl Slot<'_> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the slot to be resolved.
    pub async fn wait(&mut self) -> Outcome {
        (&mut self.rx).await.unwrap_or(Outcome::Closed)
    }

    /// Waits for the slot to be resolved, resolving it as timed out once
    /// `deadline` has passed.
    ///
    /// The deadline races the reader through [`PendingTable::resolve`]: if a
    /// reply removed the entry first, the reply is returned even though the
    /// deadline has passed.
    pub async fn wait_until(&mut self, deadline: Instant) -> Outcome {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(outcome) => outcome.unwrap_or(Outcome::Closed),
            Err(_) => {
                if !self.table.resolve(self.id, Outcome::TimedOut) {
                    tracing::debug!("request id={} resolved while timing out", self.id);
                }
                // Whoever won the removal has sent (or is about to send) the outcome.
                self.wait().await
            }
        }
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.table.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_protocol::ErrorCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[tokio::test]
    async fn test_register_and_resolve() {
        let table = PendingTable::new();
        let mut slot = table.register(RequestId(1)).unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.resolve(RequestId(1), Outcome::Reply(Bytes::from_static(b"hi"))));
        assert!(table.is_empty());
        assert_eq!(slot.wait().await, Outcome::Reply(Bytes::from_static(b"hi")));
    }

    #[test]
    fn test_waiter_is_woken_on_resolve() {
        let table = PendingTable::new();
        let mut slot = table.register(RequestId(7)).unwrap();

        let mut wait = task::spawn(slot.wait());
        assert_pending!(wait.poll());

        assert!(table.resolve(RequestId(7), Outcome::Reply(Bytes::from_static(b"x"))));
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), Outcome::Reply(Bytes::from_static(b"x")));
    }

    #[test]
    fn test_duplicate_register_fails() {
        let table = PendingTable::new();
        let _slot = table.register(RequestId(3)).unwrap();
        assert!(matches!(
            table.register(RequestId(3)),
            Err(ClientError::DuplicateRequest(RequestId(3)))
        ));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let table = PendingTable::new();
        let mut slot = table.register(RequestId(1)).unwrap();

        assert!(table.resolve(RequestId(1), Outcome::TimedOut));
        assert!(!table.resolve(RequestId(1), Outcome::Reply(Bytes::from_static(b"late"))));
        assert!(!table.resolve(RequestId(99), Outcome::TimedOut));

        assert_eq!(slot.wait().await, Outcome::TimedOut);
    }

    #[test]
    fn test_drop_removes_entry() {
        let table = PendingTable::new();
        let slot = table.register(RequestId(5)).unwrap();
        drop(slot);
        assert!(table.is_empty());
        assert!(!table.resolve(RequestId(5), Outcome::TimedOut));
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_everything_and_closes() {
        let table = PendingTable::new();
        let mut a = table.register(RequestId(1)).unwrap();
        let mut b = table.register(RequestId(2)).unwrap();

        assert_eq!(table.cancel_all(Outcome::Closed), 2);
        assert!(table.is_empty());
        assert!(table.is_closed());
        assert_eq!(a.wait().await, Outcome::Closed);
        assert_eq!(b.wait().await, Outcome::Closed);

        assert!(matches!(
            table.register(RequestId(3)),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_resolving_one_id_leaves_others_usable() {
        let table = PendingTable::new();
        {
            let mut x = table.register(RequestId(10)).unwrap();
            table.resolve(RequestId(10), Outcome::Reply(Bytes::from_static(b"x")));
            assert_eq!(x.wait().await, Outcome::Reply(Bytes::from_static(b"x")));
        }

        let mut y = table.register(RequestId(11)).unwrap();
        table.resolve(
            RequestId(11),
            Outcome::Rejected(ReplyError::new(ErrorCode::HandlerFailed, "bad")),
        );
        assert!(matches!(
            y.wait().await.into_result(),
            Err(ClientError::Application {
                code: ErrorCode::HandlerFailed,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let table = PendingTable::new();
        let mut slot = table.register(RequestId(1)).unwrap();

        let outcome = slot
            .wait_until(Instant::now() + Duration::from_millis(250))
            .await;
        assert_eq!(outcome, Outcome::TimedOut);
        assert!(table.is_empty());

        // A reply arriving after the deadline finds nothing to resolve.
        assert!(!table.resolve(RequestId(1), Outcome::Reply(Bytes::new())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_before_deadline_wins() {
        let table = Arc::new(PendingTable::new());
        let resolver = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.resolve(RequestId(4), Outcome::Reply(Bytes::from_static(b"ok")));
        });

        let mut slot = table.register(RequestId(4)).unwrap();
        let outcome = slot
            .wait_until(Instant::now() + Duration::from_millis(250))
            .await;
        assert_eq!(outcome, Outcome::Reply(Bytes::from_static(b"ok")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_times_out_immediately() {
        let table = PendingTable::new();
        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(10)).await;

        let mut slot = table.register(RequestId(8)).unwrap();
        assert_eq!(slot.wait_until(deadline).await, Outcome::TimedOut);
        assert!(table.is_empty());
    }

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(
            Outcome::Reply(Bytes::from_static(b"p")).into_result().unwrap(),
            Bytes::from_static(b"p")
        );
        assert!(matches!(
            Outcome::TimedOut.into_result(),
            Err(ClientError::Timeout)
        ));
        assert!(matches!(
            Outcome::Closed.into_result(),
            Err(ClientError::ConnectionClosed)
        ));
    }
}
