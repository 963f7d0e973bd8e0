//! Session events and media observers

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::amf::AmfValue;
use crate::error::Disconnect;

/// Events broadcast by a session
///
/// Delivered through `tokio::sync::broadcast`; a receiver that falls more
/// than the channel capacity behind skips the oldest events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Out-of-band value pushed by a `receive` call
    SubscriptionValue {
        client_id: Option<String>,
        subtopic: Option<String>,
        body: AmfValue,
    },

    /// `onStatus` that arrived outside any NetStream
    Status(AmfValue),

    /// A delegate or observer callback failed
    CallbackError(String),

    /// The session ended
    Disconnected(Arc<Disconnect>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// One audio or video message of a NetStream
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub timestamp: u32,
    pub data: Bytes,
}

/// Fan-out list of unbounded observers
///
/// Publishing never blocks and never drops; an observer unsubscribes by
/// dropping its receiver.
#[derive(Debug)]
pub struct ObserverList<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        rx
    }

    /// Deliver to every live observer, pruning the closed ones
    pub fn publish(&self, value: T) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.retain(|tx| tx.send(value.clone()).is_ok());
        }
    }

    /// Drop every sender so receivers see the end of the stream
    pub fn close(&self) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_in_order() {
        let list = ObserverList::new();
        let mut a = list.subscribe();
        let mut b = list.subscribe();

        for ts in 0..3u32 {
            list.publish(MediaPacket {
                kind: MediaKind::Video,
                timestamp: ts,
                data: Bytes::from_static(b"x"),
            });
        }

        for rx in [&mut a, &mut b] {
            for ts in 0..3u32 {
                assert_eq!(rx.try_recv().unwrap().timestamp, ts);
            }
        }
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let list = ObserverList::new();
        let rx = list.subscribe();
        let mut keep = list.subscribe();
        drop(rx);

        list.publish(1u32);
        assert_eq!(list.len(), 1);
        assert_eq!(keep.try_recv().unwrap(), 1);
    }

    #[test]
    fn test_close_ends_streams() {
        let list = ObserverList::<u32>::new();
        let mut rx = list.subscribe();
        list.close();
        assert!(list.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
