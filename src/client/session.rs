//! Session controller
//!
//! [`RtmpClient`] owns one connection: the reader and writer tasks, the
//! invocation table, the chunk stream registry, the shared objects and the
//! stream negotiator. It is a cheap handle; clones share the session.
//!
//! ```text
//! Connecting ──connect _result──► Connected ──close()──► Disconnecting
//!      │                              │                        │
//!      └────── any fatal error ───────┴────────────────────────┴──► Disconnected
//! ```
//!
//! Entering `Disconnected` records the cause once and fails every waiter
//! with that same cause.

use std::sync::{Arc, Mutex, OnceLock, RwLock};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::amf::{AmfValue, ObjectEncoding};
use crate::error::{Disconnect, Error, ProtocolError, Result};
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;
use crate::protocol::handshake::{Handshaker, SimpleHandshake};
use crate::protocol::message::{Command, DataMessage, RtmpMessage};

use super::callbacks::CallbackManager;
use super::channel::ChannelRegistry;
use super::config::ClientConfig;
use super::delegate::ClientDelegate;
use super::events::SessionEvent;
use super::io::{self, Outbound};
use super::negotiation::Negotiator;
use super::net_stream::NetStream;
use super::shared_object::{SharedObject, SharedObjectRegistry};
use super::transport::{self, RtmpIo};

/// Session events kept for slow subscribers
const EVENT_CAPACITY: usize = 256;

/// Reason recorded by [`RtmpClient::close`] when none is given
pub const CLOSE_REQUESTED_BY_USER: &str = "close-requested-by-user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// State shared by the client handle, its NetStreams, its shared objects and
/// the reader/writer tasks
pub(crate) struct SessionInner {
    pub(crate) config: ClientConfig,
    state: Mutex<SessionState>,
    cause: OnceLock<Arc<Disconnect>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    pub(crate) callbacks: CallbackManager,
    pub(crate) channels: ChannelRegistry,
    pub(crate) negotiator: Negotiator,
    pub(crate) shared_objects: SharedObjectRegistry,
    events: broadcast::Sender<SessionEvent>,
    delegate: RwLock<Option<Arc<dyn ClientDelegate>>>,
    client_id: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    fn new(config: ClientConfig, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let delegate = config.delegate.clone();
        Self {
            config,
            state: Mutex::new(SessionState::Connecting),
            cause: OnceLock::new(),
            outbound,
            callbacks: CallbackManager::new(),
            channels: ChannelRegistry::new(),
            negotiator: Negotiator::new(),
            shared_objects: SharedObjectRegistry::new(),
            events,
            delegate: RwLock::new(delegate),
            client_id: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != SessionState::Disconnected {
            *state = next;
        }
    }

    /// The error every operation fails with after teardown
    pub(crate) fn fault(&self) -> Error {
        match self.cause.get() {
            Some(cause) => Error::Disconnected(cause.clone()),
            None => Error::ConnectionClosed,
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.cause.get() {
            Some(cause) => Err(Error::Disconnected(cause.clone())),
            None => Ok(()),
        }
    }

    /// Queue a message without waiting for it to be written
    pub(crate) fn enqueue(&self, chunk: RtmpChunk) -> Result<()> {
        self.ensure_open()?;
        self.outbound
            .send(Outbound { chunk, done: None })
            .map_err(|_| self.fault())
    }

    /// Queue a message and wait until the writer flushed it
    pub(crate) async fn send(&self, chunk: RtmpChunk) -> Result<()> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                chunk,
                done: Some(tx),
            })
            .map_err(|_| self.fault())?;
        rx.await.unwrap_or_else(|_| Err(self.fault()))
    }

    /// Send an invocation and wait for its reply
    pub(crate) async fn call(&self, csid: u32, command: Command) -> Result<AmfValue> {
        let id = command.transaction_id as u32;
        let stream_id = command.stream_id;
        let reply = self.callbacks.create(id);

        let chunk = RtmpMessage::Invoke(command).to_chunk(csid, stream_id);
        if let Err(e) = self.enqueue(chunk) {
            self.callbacks.remove(id);
            return Err(e);
        }

        reply.await.unwrap_or_else(|_| Err(self.fault()))
    }

    /// Build an invocation with a fresh id in the session's encoding
    pub(crate) fn command(&self, name: &str, arguments: Vec<AmfValue>) -> Command {
        let id = self.callbacks.next_invoke_id();
        Command::invoke(name, id as f64, arguments, self.config.object_encoding)
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    pub(crate) fn delegate(&self) -> Option<Arc<dyn ClientDelegate>> {
        self.delegate.read().ok().and_then(|d| d.clone())
    }

    pub(crate) fn client_id(&self) -> Option<String> {
        self.client_id.lock().ok().and_then(|id| id.clone())
    }

    /// Tear the session down; the first caller's reason wins
    ///
    /// Returns the recorded cause, which may be an earlier one.
    pub(crate) fn close_with(&self, reason: impl Into<String>, cause: Option<Error>) -> Arc<Disconnect> {
        let disconnect = Arc::new(Disconnect::new(reason, cause));
        if self.cause.set(disconnect.clone()).is_err() {
            return self.cause.get().cloned().unwrap_or(disconnect);
        }

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SessionState::Disconnected;
        self.shutdown.send_replace(true);

        let fault = Error::Disconnected(disconnect.clone());
        self.callbacks.set_error_for_all(fault.clone());
        self.negotiator.fail(fault.clone());
        self.shared_objects.fail_all(fault);
        self.channels.clear();

        match &disconnect.cause {
            Some(cause) => tracing::info!(reason = %disconnect.reason, cause = %cause, "Session closed"),
            None => tracing::info!(reason = %disconnect.reason, "Session closed"),
        }
        self.publish(SessionEvent::Disconnected(disconnect.clone()));
        disconnect
    }
}

/// A multiplexed RTMP client session
#[derive(Clone)]
pub struct RtmpClient {
    pub(crate) inner: Arc<SessionInner>,
}

impl RtmpClient {
    /// Dial `config.url`, handshake and run `connect`
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let stream = transport::open(&config).await?;
        Self::connect_with(stream, config, &SimpleHandshake).await
    }

    /// Run a session over an already open transport
    ///
    /// `config.url` still supplies the app name and tcUrl.
    pub async fn connect_with<T>(mut stream: T, config: ClientConfig, handshaker: &dyn Handshaker) -> Result<Self>
    where
        T: RtmpIo + 'static,
    {
        let parsed = config
            .parse_url()
            .ok_or_else(|| Error::Config(format!("Invalid RTMP URL: {}", config.url)))?;
        let app = config.effective_app(&parsed);
        let connect_timeout = config.connect_timeout;

        timeout(connect_timeout, handshaker.handshake(&mut stream))
            .await
            .map_err(|_| Error::Timeout)??;

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::unbounded_channel();
        let chunk_size = config.chunk_size;
        let inner = Arc::new(SessionInner::new(config, outbound));

        let reader = tokio::spawn(io::run_reader(
            Arc::downgrade(&inner),
            read_half,
            inner.shutdown.subscribe(),
        ));
        let writer = tokio::spawn(io::run_writer(
            Arc::downgrade(&inner),
            write_half,
            queue,
            inner.shutdown.subscribe(),
            chunk_size,
        ));
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(reader);
            tasks.push(writer);
        }

        let client = RtmpClient { inner };
        match timeout(connect_timeout, client.rtmp_connect(&app)).await {
            Ok(Ok(client_id)) => {
                if let Ok(mut id) = client.inner.client_id.lock() {
                    *id = client_id.clone();
                }
                client.inner.set_state(SessionState::Connected);
                tracing::info!(
                    url = %client.inner.config.url,
                    client_id = client_id.as_deref().unwrap_or("-"),
                    "Connected"
                );
                Ok(client)
            }
            Ok(Err(e)) => {
                client.inner.close_with("connect failed", Some(e.clone()));
                Err(e)
            }
            Err(_) => {
                client.inner.close_with("connect timed out", Some(Error::Timeout));
                Err(Error::Timeout)
            }
        }
    }

    /// The `connect` invocation; returns the client id the server assigned
    async fn rtmp_connect(&self, app: &str) -> Result<Option<String>> {
        let config = &self.inner.config;
        let headers = AmfValue::object([
            ("app", AmfValue::from(app)),
            ("audioCodecs", AmfValue::Number(AUDIO_CODECS)),
            ("capabilities", AmfValue::Number(CAPABILITIES)),
            ("flashVer", AmfValue::from(config.flash_ver.as_str())),
            ("fpad", AmfValue::Boolean(false)),
            ("objectEncoding", AmfValue::Number(config.object_encoding.as_number())),
            ("pageUrl", AmfValue::from(config.page_url.clone())),
            ("swfUrl", AmfValue::from(config.swf_url.clone())),
            ("tcUrl", AmfValue::from(config.url.as_str())),
            ("videoCodecs", AmfValue::Number(VIDEO_CODECS)),
            ("videoFunction", AmfValue::Number(VIDEO_FUNCTION)),
        ]);

        // connect itself is always AMF0
        let id = self.inner.callbacks.next_invoke_id();
        let mut command = Command::invoke(CMD_CONNECT, id as f64, config.arguments.clone(), ObjectEncoding::Amf0);
        command.command_object = headers;

        let reply = self.inner.call(CSID_COMMAND, command).await?;
        let client_id = reply
            .get_string("clientId")
            .or_else(|| reply.get_string("id"))
            .map(str::to_string);
        Ok(client_id)
    }

    /// Call `method` on the server over the command chunk stream
    pub async fn invoke(&self, method: &str, arguments: Vec<AmfValue>) -> Result<AmfValue> {
        self.invoke_on(CSID_COMMAND, method, arguments).await
    }

    /// Call `method` over a specific chunk stream
    pub async fn invoke_on(&self, csid: u32, method: &str, arguments: Vec<AmfValue>) -> Result<AmfValue> {
        if !(CSID_COMMAND..=MAX_CSID).contains(&csid) {
            return Err(ProtocolError::InvalidChunkStreamId(csid).into());
        }
        let command = self.inner.command(method, arguments);
        self.inner.call(csid, command).await
    }

    /// Send a call that expects no reply
    pub async fn notify(&self, method: &str, values: Vec<AmfValue>) -> Result<()> {
        let data = DataMessage {
            name: method.to_string(),
            values,
            stream_id: 0,
            encoding: self.inner.config.object_encoding,
        };
        self.inner
            .send(RtmpMessage::Notify(data).to_chunk(CSID_COMMAND, 0))
            .await
    }

    /// Ask the server for a new message stream
    pub async fn create_stream(&self) -> Result<NetStream> {
        let command = self.inner.command(CMD_CREATE_STREAM, Vec::new());
        let reply = self.inner.call(CSID_COMMAND, command).await?;
        let stream_id = reply
            .as_number()
            .filter(|id| *id >= 1.0 && *id <= u32::MAX as f64)
            .ok_or_else(|| {
                ProtocolError::UnexpectedMessage(format!("createStream returned {:?}", reply))
            })? as u32;

        tracing::debug!(stream_id = stream_id, "Stream created");
        NetStream::new(self.inner.clone(), stream_id)
    }

    /// Get the shared object `name`, connecting it on first use
    pub fn get_shared_object(&self, name: &str, persistent: bool) -> Result<SharedObject> {
        SharedObject::get_or_connect(&self.inner, name, persistent)
    }

    /// Like [`get_shared_object`](Self::get_shared_object), then wait for
    /// the server to confirm the connect
    pub async fn get_shared_object_initialized(&self, name: &str, persistent: bool) -> Result<SharedObject> {
        let shared = self.get_shared_object(name, persistent)?;
        shared.initialized().await?;
        Ok(shared)
    }

    /// Close the session and wait for its tasks
    pub async fn close(&self) {
        self.close_with_reason(CLOSE_REQUESTED_BY_USER).await
    }

    pub async fn close_with_reason(&self, reason: &str) {
        self.inner.set_state(SessionState::Disconnecting);
        self.inner.close_with(reason, None);

        let tasks: Vec<_> = match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "Session task failed");
            }
        }
    }

    /// Session events; see [`SessionEvent`]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Replace the receiver of channel-less server calls
    pub fn set_delegate(&self, delegate: Option<Arc<dyn ClientDelegate>>) {
        if let Ok(mut current) = self.inner.delegate.write() {
            *current = delegate;
        }
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Why the session ended, once it has
    pub fn disconnect_cause(&self) -> Option<Arc<Disconnect>> {
        self.inner.cause.get().cloned()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for RtmpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmpClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("client_id", &self.client_id())
            .finish()
    }
}
