//! Remote shared objects
//!
//! A shared object keeps two things apart: the log of changes we asked for
//! and the mirror of what the server says the object holds. `set`,
//! `remove` and `send_message` only append to the log; `flush` sends the
//! log as one message. The mirror changes only when the server's own
//! events arrive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::{broadcast, mpsc, watch};

use crate::amf::{AmfValue, ObjectEncoding};
use crate::error::{Error, Result};
use crate::protocol::constants::CSID_COMMAND;
use crate::protocol::message::RtmpMessage;
use crate::protocol::shared_object::{SharedObjectEvent, SharedObjectMessage};

use super::delegate::{call_delegate, ClientDelegate};
use super::events::{ObserverList, SessionEvent};
use super::session::SessionInner;

/// Change applied to the mirror by the server
#[derive(Debug, Clone, PartialEq)]
pub enum SharedObjectChange {
    Updated { name: String, value: AmfValue },
    Deleted { name: String },
    Cleared,
    /// End of one server message
    Synced,
}

#[derive(Debug, Clone)]
enum InitState {
    Pending,
    Ready,
    Failed(Error),
}

pub(crate) struct SharedObjectState {
    name: String,
    /// Pending outbound events, with the version and flags they go out with
    log: Mutex<SharedObjectMessage>,
    mirror: Mutex<HashMap<String, AmfValue>>,
    initialized: watch::Sender<InitState>,
    delegate: RwLock<Option<Arc<dyn ClientDelegate>>>,
    changes: ObserverList<SharedObjectChange>,
    events: broadcast::Sender<SessionEvent>,
}

impl SharedObjectState {
    fn new(
        name: &str,
        persistent: bool,
        encoding: ObjectEncoding,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (initialized, _) = watch::channel(InitState::Pending);
        Self {
            name: name.to_string(),
            log: Mutex::new(SharedObjectMessage::new(name, 0, persistent, encoding)),
            mirror: Mutex::new(HashMap::new()),
            initialized,
            delegate: RwLock::new(None),
            changes: ObserverList::new(),
            events,
        }
    }

    fn log(&self) -> MutexGuard<'_, SharedObjectMessage> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mirror(&self) -> MutexGuard<'_, HashMap<String, AmfValue>> {
        self.mirror.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(&self, event: SharedObjectEvent) {
        self.log().events.push(event);
    }

    /// Apply one server message; runs on the reader task
    fn apply(&self, message: SharedObjectMessage) {
        {
            let mut log = self.log();
            log.version = message.version;
            log.persistent = message.persistent;
        }

        for event in message.events {
            match event {
                SharedObjectEvent::ConnectSuccess => {
                    tracing::debug!(name = %self.name, "Shared object connected");
                    self.initialized.send_if_modified(|state| match state {
                        InitState::Pending => {
                            *state = InitState::Ready;
                            true
                        }
                        _ => false,
                    });
                }
                SharedObjectEvent::UpdateData { name, value } => {
                    self.mirror().insert(name.clone(), value.clone());
                    self.changes.publish(SharedObjectChange::Updated { name, value });
                }
                SharedObjectEvent::DeleteData { name } => {
                    self.mirror().remove(&name);
                    self.changes.publish(SharedObjectChange::Deleted { name });
                }
                SharedObjectEvent::ClearData => {
                    self.mirror().clear();
                    self.changes.publish(SharedObjectChange::Cleared);
                }
                SharedObjectEvent::SendMessage { method, args } => self.call_delegate(&method, &args),
                SharedObjectEvent::Status { code, level } => {
                    tracing::debug!(name = %self.name, code = %code, level = %level, "Shared object status");
                }
                other => {
                    tracing::debug!(name = %self.name, event_type = other.event_type(), "Ignored shared object event");
                }
            }
        }

        self.changes.publish(SharedObjectChange::Synced);
    }

    fn call_delegate(&self, method: &str, args: &[AmfValue]) {
        let delegate = self.delegate.read().ok().and_then(|d| d.clone());
        let Some(delegate) = delegate else {
            tracing::debug!(name = %self.name, method = method, "No shared object delegate");
            return;
        };
        if let Err(e) = call_delegate(delegate.as_ref(), method, args) {
            tracing::warn!(name = %self.name, method = method, error = %e, "Shared object delegate failed");
            let _ = self.events.send(SessionEvent::CallbackError(e.0));
        }
    }

    fn fail(&self, fault: &Error) {
        self.initialized.send_if_modified(|state| match state {
            InitState::Pending => {
                *state = InitState::Failed(fault.clone());
                true
            }
            _ => false,
        });
        self.changes.close();
    }
}

/// Shared objects of one session, by name
#[derive(Default)]
pub(crate) struct SharedObjectRegistry {
    objects: Mutex<HashMap<String, Arc<SharedObjectState>>>,
}

impl SharedObjectRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SharedObjectState>>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route a server message to its object; false if no such object
    pub(crate) fn dispatch(&self, message: SharedObjectMessage) -> bool {
        let state = self.lock().get(&message.name).cloned();
        match state {
            Some(state) => {
                state.apply(message);
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail_all(&self, fault: Error) {
        let states: Vec<_> = self.lock().values().cloned().collect();
        for state in states {
            state.fail(&fault);
        }
    }
}

/// Handle to a remote shared object; clones refer to the same object
#[derive(Clone)]
pub struct SharedObject {
    session: Arc<SessionInner>,
    state: Arc<SharedObjectState>,
}

impl SharedObject {
    /// Look the object up, creating and connecting it on first use
    pub(crate) fn get_or_connect(session: &Arc<SessionInner>, name: &str, persistent: bool) -> Result<Self> {
        session.ensure_open()?;

        let (state, created) = {
            let mut objects = session.shared_objects.lock();
            match objects.get(name) {
                Some(state) => (state.clone(), false),
                None => {
                    let state = Arc::new(SharedObjectState::new(
                        name,
                        persistent,
                        session.config.object_encoding,
                        session.event_sender(),
                    ));
                    objects.insert(name.to_string(), state.clone());
                    (state, true)
                }
            }
        };

        let shared = SharedObject {
            session: session.clone(),
            state,
        };
        if created {
            tracing::debug!(name = name, persistent = persistent, "Connecting shared object");
            shared.state.append(SharedObjectEvent::Connect);
            shared.flush()?;
        }
        Ok(shared)
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Version the next flush goes out with
    pub fn version(&self) -> u32 {
        self.state.log().version
    }

    pub fn is_persistent(&self) -> bool {
        self.state.log().persistent
    }

    /// Number of events waiting for `flush`
    pub fn pending_events(&self) -> usize {
        self.state.log().events.len()
    }

    /// Wait until the server accepted the connect
    pub async fn initialized(&self) -> Result<()> {
        let mut rx = self.state.initialized.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                InitState::Ready => return Ok(()),
                InitState::Failed(e) => return Err(e.clone()),
                InitState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.session.fault());
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.state.initialized.borrow(), InitState::Ready)
    }

    /// Mirror value of `key`
    pub fn get(&self, key: &str) -> Option<AmfValue> {
        self.state.mirror().get(key).cloned()
    }

    /// Copy of the whole mirror
    pub fn data(&self) -> HashMap<String, AmfValue> {
        self.state.mirror().clone()
    }

    /// Ask the server to set `key`; the mirror is untouched until it answers
    pub fn set(&self, key: impl Into<String>, value: impl Into<AmfValue>) {
        self.state.append(SharedObjectEvent::SetAttribute {
            name: key.into(),
            value: value.into(),
        });
    }

    /// Ask the server to remove `key`
    pub fn remove(&self, key: impl Into<String>) {
        self.state
            .append(SharedObjectEvent::DeleteAttribute { name: key.into() });
    }

    /// Broadcast a call to every client of the object
    pub fn send_message(&self, method: impl Into<String>, args: Vec<AmfValue>) {
        self.state.append(SharedObjectEvent::SendMessage {
            method: method.into(),
            args,
        });
    }

    /// Send the pending log as one message and start a new one
    pub fn flush(&self) -> Result<()> {
        let mut log = self.state.log();
        if log.events.is_empty() {
            return Ok(());
        }

        let next = SharedObjectMessage::new(log.name.clone(), log.version.wrapping_add(1), log.persistent, log.encoding);
        let message = std::mem::replace(&mut *log, next);
        let events = message.events.len();
        let version = message.version;

        // Queued under the log lock so flushes keep their order
        self.session
            .enqueue(RtmpMessage::SharedObject(message).to_chunk(CSID_COMMAND, 0))?;
        tracing::trace!(name = %self.state.name, version = version, events = events, "Shared object flushed");
        Ok(())
    }

    /// Mirror changes as the server applies them
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SharedObjectChange> {
        self.state.changes.subscribe()
    }

    /// Receiver of `send` calls broadcast through this object
    pub fn set_delegate(&self, delegate: Option<Arc<dyn ClientDelegate>>) {
        if let Ok(mut current) = self.state.delegate.write() {
            *current = delegate;
        }
    }
}

impl std::fmt::Debug for SharedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedObject")
            .field("name", &self.state.name)
            .field("version", &self.version())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SharedObjectState {
        let (events, _) = broadcast::channel(8);
        SharedObjectState::new("room", false, ObjectEncoding::Amf0, events)
    }

    fn server_message(version: u32, events: Vec<SharedObjectEvent>) -> SharedObjectMessage {
        let mut message = SharedObjectMessage::new("room", version, true, ObjectEncoding::Amf0);
        message.events = events;
        message
    }

    #[test]
    fn test_apply_updates_mirror() {
        let state = state();
        let mut changes = state.changes.subscribe();

        state.apply(server_message(
            3,
            vec![
                SharedObjectEvent::ConnectSuccess,
                SharedObjectEvent::UpdateData {
                    name: "topic".into(),
                    value: "rust".into(),
                },
                SharedObjectEvent::UpdateData {
                    name: "count".into(),
                    value: 2.0.into(),
                },
                SharedObjectEvent::DeleteData {
                    name: "count".into(),
                },
            ],
        ));

        assert!(matches!(*state.initialized.borrow(), InitState::Ready));
        assert_eq!(state.mirror().get("topic"), Some(&AmfValue::from("rust")));
        assert!(state.mirror().get("count").is_none());
        // Version and flags follow the server
        assert_eq!(state.log().version, 3);
        assert!(state.log().persistent);

        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push(change);
        }
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2], SharedObjectChange::Deleted { name: "count".into() });
        assert_eq!(seen[3], SharedObjectChange::Synced);
    }

    #[test]
    fn test_clear_empties_mirror() {
        let state = state();
        state.apply(server_message(
            1,
            vec![SharedObjectEvent::UpdateData {
                name: "a".into(),
                value: 1.0.into(),
            }],
        ));
        state.apply(server_message(2, vec![SharedObjectEvent::ClearData]));
        assert!(state.mirror().is_empty());
    }

    #[test]
    fn test_fail_only_while_pending() {
        let state = state();
        state.apply(server_message(1, vec![SharedObjectEvent::ConnectSuccess]));
        state.fail(&Error::ConnectionClosed);
        assert!(matches!(*state.initialized.borrow(), InitState::Ready));

        let pending = self::state();
        pending.fail(&Error::ConnectionClosed);
        assert!(matches!(*pending.initialized.borrow(), InitState::Failed(_)));
    }

    #[test]
    fn test_registry_routes_by_name() {
        let registry = SharedObjectRegistry::new();
        registry
            .lock()
            .insert("room".into(), Arc::new(state()));

        assert!(registry.dispatch(server_message(1, vec![SharedObjectEvent::ClearData])));
        let mut other = server_message(1, vec![]);
        other.name = "lobby".into();
        assert!(!registry.dispatch(other));
    }
}
