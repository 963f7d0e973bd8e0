//! Reader and writer tasks
//!
//! Each session owns exactly one of each. The writer is the only code that
//! touches the write half: callers hand it whole messages through an
//! unbounded queue, so chunks of different messages never interleave
//! mid-chunk. The reader decodes chunks, handles flow control itself and
//! passes every other message to the dispatcher.
//!
//! Both tasks hold a `Weak` session and end when the session is dropped or
//! shut down.

use std::sync::Weak;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Error, Result};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::{CSID_PROTOCOL_CONTROL, MAX_CHUNK_SIZE};
use crate::protocol::message::RtmpMessage;

use super::dispatch;
use super::session::SessionInner;

/// Bytes buffered before the writer stops batching and writes
const WRITE_BATCH_BYTES: usize = 64 * 1024;

/// One message queued for the writer
pub(crate) struct Outbound {
    pub chunk: RtmpChunk,
    /// Completed once the bytes reached the transport
    pub done: Option<oneshot::Sender<Result<()>>>,
}

/// Acknowledgement window bookkeeping
#[derive(Debug, Default)]
struct AckWindow {
    /// Window announced by the server, 0 until known
    window: u32,
    received: u32,
    last_ack: u32,
    /// Last WindowAckSize we sent
    announced: Option<u32>,
}

impl AckWindow {
    /// Returns the sequence number to acknowledge, if the window filled up
    fn on_bytes(&mut self, n: usize) -> Option<u32> {
        self.received = self.received.wrapping_add(n as u32);
        if self.window > 0 && self.received.wrapping_sub(self.last_ack) >= self.window {
            self.last_ack = self.received;
            return Some(self.received);
        }
        None
    }
}

pub(crate) async fn run_reader<R>(
    session: Weak<SessionInner>,
    mut reader: R,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = ChunkDecoder::new();
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut window = AckWindow::default();

    loop {
        loop {
            let chunk = match decoder.decode(&mut buf) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    close(&session, "protocol error", e);
                    return;
                }
            };
            let Some(s) = session.upgrade() else { return };
            if let Err(e) = on_message(&s, &mut decoder, &mut window, chunk) {
                s.close_with("protocol error", Some(e));
                return;
            }
        }

        let read = tokio::select! {
            _ = shutdown.changed() => return,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                close(&session, "connection closed by peer", Error::ConnectionClosed);
                return;
            }
            Ok(n) => {
                tracing::trace!(bytes = n, "Read");
                if let Some(sequence) = window.on_bytes(n) {
                    if let Some(s) = session.upgrade() {
                        let ack = RtmpMessage::Acknowledgement { sequence };
                        let _ = s.enqueue(ack.to_chunk(CSID_PROTOCOL_CONTROL, 0));
                    }
                }
            }
            Err(e) => {
                close(&session, "transport read failed", e.into());
                return;
            }
        }
    }
}

/// Flow control stays here; everything else goes to the dispatcher
fn on_message(
    session: &SessionInner,
    decoder: &mut ChunkDecoder,
    window: &mut AckWindow,
    chunk: RtmpChunk,
) -> Result<()> {
    let message = RtmpMessage::from_chunk(&chunk)?;

    match message {
        RtmpMessage::SetChunkSize(size) => {
            tracing::debug!(size = size, "Peer set chunk size");
            decoder.set_chunk_size(size);
        }
        RtmpMessage::Abort { csid } => {
            tracing::debug!(csid = csid, "Peer aborted message");
            decoder.abort(csid);
        }
        RtmpMessage::WindowAckSize(size) => {
            tracing::debug!(size = size, "Peer set window ack size");
            window.window = size;
        }
        RtmpMessage::SetPeerBandwidth { size, limit_type } => {
            tracing::debug!(size = size, limit_type = limit_type, "Peer set bandwidth");
            if window.announced != Some(size) {
                window.announced = Some(size);
                let reply = RtmpMessage::WindowAckSize(size);
                session.enqueue(reply.to_chunk(CSID_PROTOCOL_CONTROL, 0))?;
            }
        }
        RtmpMessage::Acknowledgement { sequence } => {
            tracing::trace!(sequence = sequence, "Peer acknowledged");
        }
        other => dispatch::dispatch(session, chunk.csid, chunk.stream_id, other),
    }
    Ok(())
}

pub(crate) async fn run_writer<W>(
    session: Weak<SessionInner>,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
    chunk_size: u32,
) where
    W: AsyncWrite + Unpin,
{
    let mut encoder = ChunkEncoder::new();
    let mut buf = BytesMut::with_capacity(WRITE_BATCH_BYTES);

    // Our chunk size goes out before anything else. The announcement itself
    // is framed at the default size, and must name the size we really use.
    let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
    let announce = RtmpMessage::SetChunkSize(chunk_size).to_chunk(CSID_PROTOCOL_CONTROL, 0);
    encoder.encode(&announce, &mut buf);
    encoder.set_chunk_size(chunk_size);
    if let Err(e) = write_out(&mut writer, &mut buf).await {
        close(&session, "transport write failed", e);
        return;
    }

    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let mut acks = Vec::new();
        let mut next = Some(first);
        while let Some(item) = next.take() {
            encoder.encode(&item.chunk, &mut buf);
            acks.extend(item.done);
            if buf.len() < WRITE_BATCH_BYTES {
                next = queue.try_recv().ok();
            }
        }

        match write_out(&mut writer, &mut buf).await {
            Ok(()) => {
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                let fault = close(&session, "transport write failed", e);
                for ack in acks {
                    let _ = ack.send(Err(fault.clone()));
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_out<W: AsyncWrite + Unpin>(writer: &mut W, buf: &mut BytesMut) -> Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await?;
    buf.clear();
    Ok(())
}

/// Close the session if it is still alive and return the resulting fault
fn close(session: &Weak<SessionInner>, reason: &str, cause: Error) -> Error {
    match session.upgrade() {
        Some(s) => Error::Disconnected(s.close_with(reason, Some(cause))),
        None => cause,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::protocol::constants::{CSID_COMMAND, MSG_COMMAND_AMF0};

    #[tokio::test]
    async fn test_writer_announces_the_size_it_frames_with() {
        let (client, mut peer) = tokio::io::duplex(4096);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        queue_tx
            .send(Outbound {
                chunk: RtmpChunk {
                    csid: CSID_COMMAND,
                    timestamp: 0,
                    message_type: MSG_COMMAND_AMF0,
                    stream_id: 0,
                    payload: Bytes::from_static(&[1, 2, 3]),
                },
                done: None,
            })
            .unwrap();
        drop(queue_tx);

        // Out of range; the writer clamps it to 1
        run_writer(Weak::new(), client, queue_rx, shutdown_rx, 0).await;

        let mut raw = Vec::new();
        peer.read_to_end(&mut raw).await.unwrap();
        let mut buf = BytesMut::from(&raw[..]);

        let mut decoder = ChunkDecoder::new();
        let announce = decoder.decode(&mut buf).unwrap().unwrap();
        let size = match RtmpMessage::from_chunk(&announce).unwrap() {
            RtmpMessage::SetChunkSize(size) => size,
            other => panic!("Expected SetChunkSize, got {:?}", other),
        };
        assert_eq!(size, 1);

        // fmt 0 with one byte, then two fmt 3 continuations of one byte
        assert_eq!(buf.len(), (1 + 11 + 1) + 2 * (1 + 1));
        decoder.set_chunk_size(size);
        let chunk = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&chunk.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn test_ack_window() {
        let mut window = AckWindow::default();
        // No window yet, no acknowledgements
        assert_eq!(window.on_bytes(5000), None);

        window.window = 2500;
        assert_eq!(window.on_bytes(100), Some(5100));
        assert_eq!(window.on_bytes(2000), None);
        assert_eq!(window.on_bytes(500), Some(7600));
    }

    #[test]
    fn test_ack_window_wraps() {
        let mut window = AckWindow {
            window: 1000,
            received: u32::MAX - 100,
            last_ack: u32::MAX - 100,
            announced: None,
        };
        assert_eq!(window.on_bytes(999), None);
        assert_eq!(window.on_bytes(1), Some(899));
    }
}
