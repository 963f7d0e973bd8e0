//! NetStream lifecycle
//!
//! A NetStream is one message stream created with `createStream`. It owns
//! three chunk streams, laid out from its id the way Flash Player does:
//!
//! | channel | chunk stream id |
//! |---------|-----------------|
//! | data    | id * 5 - 1      |
//! | video   | id * 5          |
//! | audio   | id * 5 + 1      |
//!
//! For playback the server picks the stream id it delivers on and announces
//! it with StreamBegin, so `play` goes through the session's negotiator and
//! registers the triplet computed from that id.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::amf::AmfValue;
use crate::error::{Error, MisuseError, ProtocolError, Result};
use crate::protocol::constants::*;
use crate::protocol::message::{Command, DataMessage, RtmpMessage, UserControlEvent};

use super::channel::{ChunkStream, MessageSink};
use super::delegate::{call_delegate, ClientDelegate};
use super::events::{MediaKind, MediaPacket, ObserverList, SessionEvent};
use super::negotiation::Registration;
use super::session::SessionInner;

/// Chunk stream ids (data, video, audio) for a message stream id
pub fn chunk_stream_ids(stream_id: u32) -> Result<[u32; 3]> {
    let base = stream_id
        .checked_mul(5)
        .filter(|base| *base >= 5 && *base < MAX_CSID)
        .ok_or(ProtocolError::InvalidChunkStreamId(stream_id))?;
    Ok([base - 1, base, base + 1])
}

/// Receiving side of a NetStream, registered as the sink of its channels
struct StreamShared {
    stream_id: u32,
    /// Stream id the server delivers on, 0 until known
    server_stream_id: AtomicU32,
    delegate: RwLock<Option<Arc<dyn ClientDelegate>>>,
    audio: ObserverList<MediaPacket>,
    video: ObserverList<MediaPacket>,
    media: ObserverList<MediaPacket>,
    events: broadcast::Sender<SessionEvent>,
}

impl StreamShared {
    fn call_delegate(&self, method: &str, args: &[AmfValue]) {
        let delegate = self.delegate.read().ok().and_then(|d| d.clone());
        let Some(delegate) = delegate else {
            tracing::trace!(stream_id = self.stream_id, method = method, "No stream delegate");
            return;
        };
        if let Err(e) = call_delegate(delegate.as_ref(), method, args) {
            tracing::warn!(stream_id = self.stream_id, method = method, error = %e, "Stream delegate failed");
            let _ = self.events.send(SessionEvent::CallbackError(e.0));
        }
    }

    fn publish(&self, packet: MediaPacket) {
        match packet.kind {
            MediaKind::Audio => self.audio.publish(packet.clone()),
            MediaKind::Video => self.video.publish(packet.clone()),
        }
        self.media.publish(packet);
    }
}

impl MessageSink for StreamShared {
    fn deliver(&self, csid: u32, message: RtmpMessage) {
        match message {
            RtmpMessage::Invoke(cmd) => self.call_delegate(&cmd.name, &cmd.arguments),
            RtmpMessage::Notify(data) => self.call_delegate(&data.name, &data.values),
            RtmpMessage::Audio { timestamp, data } => self.publish(MediaPacket {
                kind: MediaKind::Audio,
                timestamp,
                data,
            }),
            RtmpMessage::Video { timestamp, data } => self.publish(MediaPacket {
                kind: MediaKind::Video,
                timestamp,
                data,
            }),
            other => {
                tracing::trace!(stream_id = self.stream_id, csid = csid, message = ?other, "Ignored stream message")
            }
        }
    }

    fn close(&self) {
        self.audio.close();
        self.video.close();
        self.media.close();
    }
}

/// A message stream on an [`RtmpClient`](super::RtmpClient) session
pub struct NetStream {
    session: Arc<SessionInner>,
    shared: Arc<StreamShared>,
    data: Arc<ChunkStream>,
    video: Arc<ChunkStream>,
    audio: Arc<ChunkStream>,
    disposed: AtomicBool,
}

impl NetStream {
    pub(crate) fn new(session: Arc<SessionInner>, stream_id: u32) -> Result<Self> {
        let [data_id, video_id, audio_id] = chunk_stream_ids(stream_id)?;
        let shared = Arc::new(StreamShared {
            stream_id,
            server_stream_id: AtomicU32::new(0),
            delegate: RwLock::new(None),
            audio: ObserverList::new(),
            video: ObserverList::new(),
            media: ObserverList::new(),
            events: session.event_sender(),
        });
        let sink: Arc<dyn MessageSink> = shared.clone();

        Ok(Self {
            session,
            data: Arc::new(ChunkStream::new(data_id, sink.clone())),
            video: Arc::new(ChunkStream::new(video_id, sink.clone())),
            audio: Arc::new(ChunkStream::new(audio_id, sink)),
            shared,
            disposed: AtomicBool::new(false),
        })
    }

    /// Id returned by createStream
    pub fn stream_id(&self) -> u32 {
        self.shared.stream_id
    }

    /// Id the server delivers on, once negotiated
    pub fn server_stream_id(&self) -> Option<u32> {
        match self.shared.server_stream_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Local (data, video, audio) chunk stream ids
    pub fn chunk_stream_ids(&self) -> (u32, u32, u32) {
        (self.data.local_id(), self.video.local_id(), self.audio.local_id())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Receiver of `onStatus`, `onMetaData` and other calls on this stream
    pub fn set_delegate(&self, delegate: Option<Arc<dyn ClientDelegate>>) {
        if let Ok(mut current) = self.shared.delegate.write() {
            *current = delegate;
        }
    }

    pub fn subscribe_audio(&self) -> mpsc::UnboundedReceiver<MediaPacket> {
        self.shared.audio.subscribe()
    }

    pub fn subscribe_video(&self) -> mpsc::UnboundedReceiver<MediaPacket> {
        self.shared.video.subscribe()
    }

    /// Audio and video interleaved in arrival order
    pub fn subscribe_media(&self) -> mpsc::UnboundedReceiver<MediaPacket> {
        self.shared.media.subscribe()
    }

    /// Start playback of `name`
    ///
    /// Waits for the server's StreamBegin and returns the stream id it
    /// announced. Concurrent `play` calls on one session run one at a time.
    pub async fn play(&self, name: &str) -> Result<u32> {
        self.ensure_live()?;

        let stream_id = self.stream_id();
        let register = self.registration();
        let send = async {
            let buffer = RtmpMessage::UserControl(UserControlEvent::SetBufferLength {
                stream_id,
                buffer_ms: self.session.config.buffer_length,
            });
            self.session
                .send(buffer.to_chunk(CSID_PROTOCOL_CONTROL, 0))
                .await?;

            let play = self.stream_command(
                CMD_PLAY,
                vec![
                    AmfValue::from(name),
                    // Live or recorded, until the end, reset playlist
                    AmfValue::Number(-2.0),
                    AmfValue::Number(-1.0),
                    AmfValue::Boolean(true),
                ],
            );
            self.send_on_data(RtmpMessage::Invoke(play)).await
        };

        let server_id = self.session.negotiator.negotiate(register, send).await?;
        tracing::debug!(stream_id = stream_id, server_stream_id = server_id, name = name, "Playing");
        Ok(server_id)
    }

    pub async fn pause(&self, paused: bool, position_ms: f64) -> Result<()> {
        self.ensure_live()?;
        let pause = self.stream_command(
            CMD_PAUSE,
            vec![AmfValue::Boolean(paused), AmfValue::Number(position_ms)],
        );
        self.send_on_data(RtmpMessage::Invoke(pause)).await
    }

    /// Start publishing under `name`; `kind` is "live", "record" or "append"
    pub async fn publish(&self, name: &str, kind: &str) -> Result<()> {
        self.ensure_live()?;

        // Status replies come back on our own triplet
        if self.server_stream_id().is_none() {
            (self.registration())(self.stream_id())?;
        }

        let publish = self.stream_command(CMD_PUBLISH, vec![name.into(), kind.into()]);
        self.send_on_data(RtmpMessage::Invoke(publish)).await
    }

    pub async fn send_audio(&self, timestamp: u32, data: Bytes) -> Result<()> {
        self.ensure_live()?;
        let chunk = RtmpMessage::Audio { timestamp, data }.to_chunk(self.audio.local_id(), self.stream_id());
        self.session.send(chunk).await
    }

    pub async fn send_video(&self, timestamp: u32, data: Bytes) -> Result<()> {
        self.ensure_live()?;
        let chunk = RtmpMessage::Video { timestamp, data }.to_chunk(self.video.local_id(), self.stream_id());
        self.session.send(chunk).await
    }

    /// Data message such as `@setDataFrame`
    pub async fn send_data(&self, name: &str, values: Vec<AmfValue>) -> Result<()> {
        self.ensure_live()?;
        let data = DataMessage {
            name: name.to_string(),
            values,
            stream_id: self.stream_id(),
            encoding: self.session.config.object_encoding,
        };
        self.send_on_data(RtmpMessage::Notify(data)).await
    }

    /// Unregister the stream and ask the server to delete it
    ///
    /// The stream is unusable afterwards, even if the request fails.
    pub async fn delete(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(MisuseError::StreamDisposed.into());
        }

        if let Some(server_id) = self.server_stream_id() {
            self.unregister(server_id);
        }
        MessageSink::close(self.shared.as_ref());

        let mut delete = Command::invoke(
            CMD_DELETE_STREAM,
            0.0,
            vec![AmfValue::from(self.stream_id())],
            self.session.config.object_encoding,
        );
        delete.stream_id = 0;
        self.session
            .send(RtmpMessage::Invoke(delete).to_chunk(CSID_COMMAND, 0))
            .await
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(MisuseError::StreamDisposed.into());
        }
        Ok(())
    }

    /// Command on this message stream; these never get a reply
    fn stream_command(&self, name: &str, arguments: Vec<AmfValue>) -> Command {
        let mut command = Command::invoke(name, 0.0, arguments, self.session.config.object_encoding);
        command.stream_id = self.stream_id();
        command
    }

    async fn send_on_data(&self, message: RtmpMessage) -> Result<()> {
        let chunk = message.to_chunk(self.data.local_id(), self.stream_id());
        self.session.send(chunk).await
    }

    /// Registers the triplet for a server stream id, replacing an earlier one
    fn registration(&self) -> Registration {
        let session = Arc::downgrade(&self.session);
        let shared = self.shared.clone();
        let streams = [self.data.clone(), self.video.clone(), self.audio.clone()];

        Box::new(move |server_id| {
            let session = session.upgrade().ok_or(Error::ConnectionClosed)?;
            let ids = chunk_stream_ids(server_id)?;

            let previous = shared.server_stream_id.load(Ordering::Acquire);
            if previous != 0 {
                if let Ok(old) = chunk_stream_ids(previous) {
                    for (id, stream) in old.iter().zip(&streams) {
                        session.channels.unregister(*id, stream);
                    }
                }
            }

            let entries: Vec<_> = ids.iter().copied().zip(streams.iter().cloned()).collect();
            session.channels.register_all(&entries)?;
            shared.server_stream_id.store(server_id, Ordering::Release);
            Ok(())
        })
    }

    fn unregister(&self, server_id: u32) {
        if let Ok(ids) = chunk_stream_ids(server_id) {
            for (id, stream) in ids.iter().zip([&self.data, &self.video, &self.audio]) {
                self.session.channels.unregister(*id, stream);
            }
        }
        self.shared.server_stream_id.store(0, Ordering::Release);
    }
}

/// Forgets the stream locally; the server only hears about it from `delete`
impl Drop for NetStream {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(server_id) = self.server_stream_id() {
            self.unregister(server_id);
        }
        MessageSink::close(self.shared.as_ref());
    }
}

impl std::fmt::Debug for NetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStream")
            .field("stream_id", &self.stream_id())
            .field("server_stream_id", &self.server_stream_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::delegate::{CallbackError, HandlerMap};

    #[test]
    fn test_chunk_stream_layout() {
        assert_eq!(chunk_stream_ids(1).unwrap(), [4, 5, 6]);
        assert_eq!(chunk_stream_ids(5).unwrap(), [24, 25, 26]);
        assert!(chunk_stream_ids(0).is_err());
        assert!(chunk_stream_ids(u32::MAX).is_err());
        assert_eq!(chunk_stream_ids(MAX_CSID / 5).unwrap()[2], MAX_CSID - 3);
        assert!(chunk_stream_ids(MAX_CSID / 5 + 1).is_err());
    }

    fn shared() -> (StreamShared, broadcast::Receiver<SessionEvent>) {
        let (events, rx) = broadcast::channel(8);
        let shared = StreamShared {
            stream_id: 1,
            server_stream_id: AtomicU32::new(0),
            delegate: RwLock::new(None),
            audio: ObserverList::new(),
            video: ObserverList::new(),
            media: ObserverList::new(),
            events,
        };
        (shared, rx)
    }

    #[test]
    fn test_sink_fans_out_media() {
        let (shared, _events) = shared();
        let mut audio = shared.audio.subscribe();
        let mut video = shared.video.subscribe();
        let mut media = shared.media.subscribe();

        shared.deliver(
            6,
            RtmpMessage::Audio {
                timestamp: 10,
                data: Bytes::from_static(&[0xAF]),
            },
        );
        shared.deliver(
            5,
            RtmpMessage::Video {
                timestamp: 20,
                data: Bytes::from_static(&[0x17]),
            },
        );

        assert_eq!(audio.try_recv().unwrap().timestamp, 10);
        assert!(audio.try_recv().is_err());
        assert_eq!(video.try_recv().unwrap().kind, MediaKind::Video);
        assert_eq!(media.try_recv().unwrap().kind, MediaKind::Audio);
        assert_eq!(media.try_recv().unwrap().kind, MediaKind::Video);
    }

    #[test]
    fn test_sink_reports_delegate_failure() {
        let (shared, mut events) = shared();
        let delegate = HandlerMap::new().on("onStatus", |_| Err(CallbackError::new("bad status")));
        *shared.delegate.write().unwrap() = Some(Arc::new(delegate));

        let status = Command::on_status(1, "status", "NetStream.Play.Start", "started");
        shared.deliver(4, RtmpMessage::Invoke(status));

        match events.try_recv().unwrap() {
            SessionEvent::CallbackError(msg) => assert_eq!(msg, "bad status"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
