//! Stream negotiation serializer
//!
//! The server answers `play` with a StreamBegin user control event that
//! names the stream id but not which request it belongs to. Negotiations
//! therefore run one at a time: a FIFO turn lock admits one negotiation,
//! which installs a slot, sends its request and waits for StreamBegin. The
//! reader resolves the slot and runs its registration inline, so the
//! channels are routable before the next inbound message is dispatched.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Runs on the reader task with the server stream id from StreamBegin
pub type Registration = Box<dyn FnOnce(u32) -> Result<()> + Send>;

struct Slot {
    ticket: u64,
    register: Registration,
    done: oneshot::Sender<Result<u32>>,
}

#[derive(Default)]
struct State {
    pending: Option<Slot>,
    closed: Option<Error>,
}

/// One-at-a-time stream negotiation
#[derive(Default)]
pub struct Negotiator {
    turn: tokio::sync::Mutex<()>,
    state: Mutex<State>,
    tickets: AtomicU64,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the turn, send the request and wait for StreamBegin
    ///
    /// Returns the server stream id once `register` has succeeded. A send
    /// failure, a failed registration or teardown release the turn.
    pub async fn negotiate<F>(&self, register: Registration, send: F) -> Result<u32>
    where
        F: Future<Output = Result<()>>,
    {
        let _turn = self.turn.lock().await;

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if let Some(fault) = &state.closed {
                return Err(fault.clone());
            }
            state.pending = Some(Slot {
                ticket,
                register,
                done: tx,
            });
        }
        let _cleanup = SlotGuard {
            negotiator: self,
            ticket,
        };

        send.await?;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self
                .lock()
                .closed
                .clone()
                .unwrap_or(Error::ConnectionClosed)),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Resolve the pending negotiation, if any
    pub fn resolve_stream_begin(&self, server_stream_id: u32) -> bool {
        let slot = self.lock().pending.take();
        match slot {
            Some(slot) => {
                let outcome = (slot.register)(server_stream_id).map(|_| server_stream_id);
                if let Err(e) = &outcome {
                    tracing::warn!(stream_id = server_stream_id, error = %e, "Stream registration failed");
                }
                let _ = slot.done.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fault the pending negotiation and every later one
    pub fn fail(&self, fault: Error) {
        let slot = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(fault.clone());
            }
            state.pending.take()
        };
        if let Some(slot) = slot {
            let _ = slot.done.send(Err(fault));
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clears the slot when a negotiation ends without being resolved
struct SlotGuard<'a> {
    negotiator: &'a Negotiator,
    ticket: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.negotiator.lock();
        if state.pending.as_ref().map(|s| s.ticket) == Some(self.ticket) {
            state.pending = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Disconnect;
    use std::sync::Arc;
    use std::time::Duration;

    fn recorder(log: &Arc<Mutex<Vec<u32>>>) -> Registration {
        let log = log.clone();
        Box::new(move |id| {
            log.lock().unwrap().push(id);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_resolves_with_stream_begin() {
        let negotiator = Arc::new(Negotiator::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let n = negotiator.clone();
        let reg = recorder(&log);
        let task = tokio::spawn(async move { n.negotiate(reg, async { Ok(()) }).await });

        while !negotiator.is_pending() {
            tokio::task::yield_now().await;
        }
        assert!(negotiator.resolve_stream_begin(5));
        assert_eq!(task.await.unwrap().unwrap(), 5);
        assert_eq!(*log.lock().unwrap(), vec![5]);

        // Nothing pending any more
        assert!(!negotiator.resolve_stream_begin(6));
    }

    #[tokio::test]
    async fn test_negotiations_are_serialized() {
        let negotiator = Arc::new(Negotiator::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..3u32 {
            let n = negotiator.clone();
            let reg = recorder(&log);
            let sent = sent.clone();
            tasks.push(tokio::spawn(async move {
                n.negotiate(reg, async move {
                    sent.lock().unwrap().push(i);
                    Ok(())
                })
                .await
            }));
            // Queue in spawn order on the FIFO lock
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for id in [10u32, 20, 30] {
            while !negotiator.is_pending() {
                tokio::task::yield_now().await;
            }
            // Only one request is in flight per turn
            assert_eq!(sent.lock().unwrap().len(), log.lock().unwrap().len() + 1);
            assert!(negotiator.resolve_stream_begin(id));
        }

        let results: Vec<u32> = join_all(tasks).await;
        assert_eq!(results, vec![10, 20, 30]);
        assert_eq!(*sent.lock().unwrap(), vec![0, 1, 2]);
    }

    async fn join_all(tasks: Vec<tokio::task::JoinHandle<Result<u32>>>) -> Vec<u32> {
        let mut out = Vec::new();
        for t in tasks {
            out.push(t.await.unwrap().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_send_failure_releases_turn() {
        let negotiator = Negotiator::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let err = negotiator
            .negotiate(recorder(&log), async { Err(Error::ConnectionClosed) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(!negotiator.is_pending());

        // Next negotiation gets the turn
        let next = negotiator.negotiate(recorder(&log), async { Ok(()) });
        tokio::pin!(next);
        tokio::select! {
            _ = &mut next => panic!("should wait for stream begin"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        assert!(negotiator.is_pending());
    }

    #[tokio::test]
    async fn test_registration_failure_is_reported() {
        let negotiator = Arc::new(Negotiator::new());
        let n = negotiator.clone();
        let task = tokio::spawn(async move {
            n.negotiate(Box::new(|_| Err(Error::ConnectionClosed)), async { Ok(()) })
                .await
        });
        while !negotiator.is_pending() {
            tokio::task::yield_now().await;
        }
        negotiator.resolve_stream_begin(3);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_fail_wakes_waiter_and_closes() {
        let negotiator = Arc::new(Negotiator::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let n = negotiator.clone();
        let reg = recorder(&log);
        let task = tokio::spawn(async move { n.negotiate(reg, async { Ok(()) }).await });
        while !negotiator.is_pending() {
            tokio::task::yield_now().await;
        }

        let cause = Arc::new(Disconnect::new("gone", None));
        negotiator.fail(Error::Disconnected(cause.clone()));
        match task.await.unwrap() {
            Err(Error::Disconnected(d)) => assert!(Arc::ptr_eq(&d, &cause)),
            other => panic!("unexpected {:?}", other),
        }

        let later = negotiator.negotiate(recorder(&log), async { Ok(()) }).await;
        assert!(matches!(later, Err(Error::Disconnected(_))));
        assert!(log.lock().unwrap().is_empty());
    }
}
