//! Invocation correlation
//!
//! Every outbound invocation that expects a reply gets a fresh id and a
//! oneshot slot. The reader task completes the slot when the matching
//! `_result` or `_error` arrives; teardown faults every slot at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::amf::AmfValue;
use crate::error::{Error, Result};

/// Receiving half of a pending invocation
pub type ReplyReceiver = oneshot::Receiver<Result<AmfValue>>;

#[derive(Default)]
struct Pending {
    slots: HashMap<u32, oneshot::Sender<Result<AmfValue>>>,
    /// Set once by `set_error_for_all`; later registrations fail with it
    closed: Option<Error>,
}

/// Pending invocations keyed by invoke id
#[derive(Default)]
pub struct CallbackManager {
    next_id: AtomicU32,
    inner: Mutex<Pending>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strictly increasing, starting at 1
    pub fn next_invoke_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a slot; must happen before the request is queued
    pub fn create(&self, id: u32) -> ReplyReceiver {
        let (tx, rx) = oneshot::channel();
        match self.inner.lock() {
            Ok(mut inner) => match &inner.closed {
                Some(fault) => {
                    let _ = tx.send(Err(fault.clone()));
                }
                None => {
                    inner.slots.insert(id, tx);
                }
            },
            Err(_) => {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
        rx
    }

    pub fn set_result(&self, id: u32, value: AmfValue) -> bool {
        self.complete(id, Ok(value))
    }

    pub fn set_error(&self, id: u32, error: Error) -> bool {
        self.complete(id, Err(error))
    }

    /// Drop a slot without completing it (the request never left)
    pub fn remove(&self, id: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.slots.remove(&id);
        }
    }

    /// Fault every pending slot and refuse new ones
    pub fn set_error_for_all(&self, fault: Error) {
        let slots = match self.inner.lock() {
            Ok(mut inner) => {
                if inner.closed.is_none() {
                    inner.closed = Some(fault.clone());
                }
                std::mem::take(&mut inner.slots)
            }
            Err(_) => return,
        };
        for (_, tx) in slots {
            let _ = tx.send(Err(fault.clone()));
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().map(|i| i.slots.len()).unwrap_or(0)
    }

    fn complete(&self, id: u32, outcome: Result<AmfValue>) -> bool {
        let slot = self.inner.lock().ok().and_then(|mut i| i.slots.remove(&id));
        match slot {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => {
                tracing::debug!(invoke_id = id, "Reply for unknown invocation");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Disconnect, InvocationError};
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_start_at_one() {
        let callbacks = CallbackManager::new();
        assert_eq!(callbacks.next_invoke_id(), 1);
        assert_eq!(callbacks.next_invoke_id(), 2);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let callbacks = Arc::new(CallbackManager::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let callbacks = callbacks.clone();
                std::thread::spawn(move || {
                    (0..500).map(|_| callbacks.next_invoke_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[tokio::test]
    async fn test_single_completion() {
        let callbacks = CallbackManager::new();
        let rx = callbacks.create(5);

        assert!(callbacks.set_result(5, AmfValue::Number(1.0)));
        // Later transitions are ignored
        assert!(!callbacks.set_error(5, InvocationError::message("late").into()));
        assert!(!callbacks.set_result(99, AmfValue::Null));

        assert_eq!(rx.await.unwrap().unwrap(), AmfValue::Number(1.0));
        assert_eq!(callbacks.pending(), 0);
    }

    #[tokio::test]
    async fn test_error_for_all_closes() {
        let callbacks = CallbackManager::new();
        let a = callbacks.create(1);
        let b = callbacks.create(2);

        let cause = Arc::new(Disconnect::new("gone", None));
        callbacks.set_error_for_all(Error::Disconnected(cause.clone()));

        for rx in [a, b] {
            match rx.await.unwrap() {
                Err(Error::Disconnected(d)) => assert!(Arc::ptr_eq(&d, &cause)),
                other => panic!("unexpected {:?}", other),
            }
        }

        // Registration after teardown fails immediately
        match callbacks.create(3).await.unwrap() {
            Err(Error::Disconnected(d)) => assert!(Arc::ptr_eq(&d, &cause)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(callbacks.pending(), 0);
    }
}
