//! Bookkeeping for outstanding calls
//!
//! Each call registers a single-assignment result slot keyed by its
//! correlation identifier. The slot is resolved exactly once, by whichever
//! of {matching reply, local deadline, shutdown} is applied first: removing
//! the sender from the table under the lock is the atomic resolution step,
//! every later attempt finds the entry gone and becomes a no-op.

use crate::envelope::CorrelationId;
use crate::error::RemoteFault;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Result of a resolved call as seen by the waiting caller
pub(crate) type CallOutcome = Result<Vec<u8>, RemoteFault>;

/// Table of outstanding calls, shared between the caller and the reply loop
#[derive(Default)]
pub(crate) struct PendingCalls {
    slots: Mutex<HashMap<CorrelationId, oneshot::Sender<CallOutcome>>>,
}

impl PendingCalls {
    /// Registers a new pending call under a fresh correlation id
    pub fn register(&self) -> (CorrelationId, oneshot::Receiver<CallOutcome>) {
        let mut slots = self.slots.lock().unwrap();

        // Collisions are vanishingly unlikely but the invariant is cheap to enforce
        loop {
            let id = CorrelationId::random();
            if !slots.contains_key(&id) {
                let (tx, rx) = oneshot::channel();
                slots.insert(id.clone(), tx);
                return (id, rx);
            }
        }
    }

    /// Resolves a pending call with the given outcome
    ///
    /// Returns `false` if no call is outstanding under this id (already
    /// resolved, timed out, or never known), in which case the outcome is
    /// dropped.
    pub fn resolve(&self, id: &CorrelationId, outcome: CallOutcome) -> bool {
        let slot = self.slots.lock().unwrap().remove(id);

        match slot {
            Some(tx) => {
                // The caller only disappears between removal and send when it
                // is being torn down, in which case the outcome is moot.
                tx.send(outcome).ok();
                true
            }
            None => false,
        }
    }

    /// Withdraws a pending call after its deadline fired
    ///
    /// Returns `true` if the entry was still present (the timeout won the
    /// race) and `false` if a reply got there first.
    pub fn abandon(&self, id: &CorrelationId) -> bool {
        self.slots.lock().unwrap().remove(id).is_some()
    }

    /// Fails every outstanding call by dropping its result slot
    ///
    /// Waiting callers observe a closed channel and surface a connection
    /// error instead of hanging past service teardown.
    pub fn fail_all(&self) {
        self.slots.lock().unwrap().clear();
    }

    /// Number of calls currently awaiting resolution
    pub fn outstanding(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn resolve_a_registered_call() {
        let calls = PendingCalls::default();
        let (id, rx) = calls.register();

        assert!(calls.resolve(&id, Ok(b"result".to_vec())));
        assert_eq!(rx.await.unwrap().unwrap(), b"result".to_vec());
        assert_eq!(calls.outstanding(), 0);
    }

    #[tokio::test]
    async fn drop_outcomes_for_unknown_ids() {
        let calls = PendingCalls::default();
        let martian = CorrelationId::random();

        assert!(!calls.resolve(&martian, Ok(Vec::new())));
    }

    #[tokio::test]
    async fn hand_out_distinct_correlation_ids() {
        let calls = PendingCalls::default();
        let (a, _rx_a) = calls.register();
        let (b, _rx_b) = calls.register();

        assert_ne!(a, b);
        assert_eq!(calls.outstanding(), 2);
    }

    #[tokio::test]
    async fn apply_at_most_one_resolution() {
        // Race a reply against an expiring deadline many times over, exactly
        // one of the two transitions may ever take effect.
        for _ in 0..256 {
            let calls = Arc::new(PendingCalls::default());
            let (id, _rx) = calls.register();

            let reply = {
                let calls = calls.clone();
                let id = id.clone();
                tokio::spawn(async move { calls.resolve(&id, Ok(Vec::new())) })
            };
            let deadline = {
                let calls = calls.clone();
                let id = id.clone();
                tokio::spawn(async move { calls.abandon(&id) })
            };

            let (replied, expired) = (reply.await.unwrap(), deadline.await.unwrap());
            assert!(replied ^ expired, "both or neither transition applied");
            assert_eq!(calls.outstanding(), 0);
        }
    }

    #[tokio::test]
    async fn wake_all_waiters_on_teardown() {
        let calls = PendingCalls::default();
        let (_id_a, rx_a) = calls.register();
        let (_id_b, rx_b) = calls.register();

        calls.fail_all();

        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
        assert_eq!(calls.outstanding(), 0);
    }
}
