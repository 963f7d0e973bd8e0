//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a header
//! that identifies the chunk stream and message being sent.
//!
//! ```text
//! Chunk Format:
//! +-------------+-----------------+-------------------+
//! | Basic Header| Message Header  | Chunk Data        |
//! | (1-3 bytes) | (0,3,7,11 bytes)| (variable)        |
//! +-------------+-----------------+-------------------+
//!
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)        for csid 2-63
//! - 2 bytes: fmt(2) + 0 + csid(8)    for csid 64-319
//! - 3 bytes: fmt(2) + 1 + csid(16)   for csid 64-65599
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4, LE)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  (use previous chunk's values)
//!
//! Extended timestamp (4 bytes) follows the message header when the 24-bit
//! field is 0xFFFFFF, and is repeated on every type 3 chunk of that message.
//! ```
//!
//! The decoder works in two layers. [`ChunkDecoder::read_chunk`] pulls one
//! chunk (header + fragment) off the byte buffer; [`ChunkDecoder::decode`]
//! stitches fragments back into whole messages per chunk stream. Chunks of
//! different chunk streams may interleave freely on the wire.
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// A complete RTMP message (reassembled from chunks)
#[derive(Debug, Clone, PartialEq)]
pub struct RtmpChunk {
    /// Chunk stream ID (for multiplexing)
    pub csid: u32,
    /// Message timestamp (milliseconds)
    pub timestamp: u32,
    /// Message type ID
    pub message_type: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Message payload
    pub payload: Bytes,
}

/// Resolved header of the first chunk of a message
///
/// Fields omitted by a compressed header are filled in from the previous
/// header of the same chunk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Header format the chunk arrived with (0-3)
    pub fmt: u8,
    /// Absolute message timestamp
    pub timestamp: u32,
    pub message_length: u32,
    pub message_type: u8,
    pub stream_id: u32,
}

/// One chunk pulled off the wire
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub csid: u32,
    /// Present on the first chunk of a message, absent on continuations
    pub header: Option<ChunkHeader>,
    pub fragment: Bytes,
}

/// Last header seen (or sent) on one chunk stream
#[derive(Debug, Clone, Copy, Default)]
struct HeaderState {
    timestamp: u32,
    /// Value of the last timestamp field (absolute for fmt 0, delta otherwise)
    delta: u32,
    message_length: u32,
    message_type: u8,
    stream_id: u32,
    /// Whether the last header carried an extended timestamp
    extended: bool,
}

/// Per-chunk-stream reassembly state
#[derive(Debug, Default)]
struct ChunkStreamState {
    header: Option<HeaderState>,
    /// Bytes still expected for the message in progress (0 = none)
    pending: u32,
    partial: BytesMut,
}

/// Chunk stream decoder
///
/// Handles chunk demultiplexing and message reassembly.
pub struct ChunkDecoder {
    /// Maximum incoming chunk size
    chunk_size: u32,
    /// Per-chunk-stream state
    streams: HashMap<u32, ChunkStreamState>,
    /// Maximum message size (sanity limit)
    max_message_size: u32,
}

impl ChunkDecoder {
    /// Create a new decoder with default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Set the chunk size (called when receiving SetChunkSize message)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Get current chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Try to decode a complete message from the buffer
    ///
    /// Consumes as many whole chunks as are available. Returns `Ok(None)`
    /// once the buffer holds no further complete chunk and no message has
    /// been completed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpChunk>> {
        while let Some(raw) = self.read_chunk(buf)? {
            let state = self.streams.entry(raw.csid).or_default();
            state.partial.put_slice(&raw.fragment);

            if state.pending > 0 {
                continue;
            }

            // pending == 0 means read_chunk just finished a message, which
            // also implies a header has been recorded
            let Some(header) = state.header else {
                return Err(ProtocolError::UnknownChunkStream(raw.csid).into());
            };
            let payload = state.partial.split().freeze();
            return Ok(Some(RtmpChunk {
                csid: raw.csid,
                timestamp: header.timestamp,
                message_type: header.message_type,
                stream_id: header.stream_id,
                payload,
            }));
        }
        Ok(None)
    }

    /// Read one chunk off the buffer
    ///
    /// Returns `Ok(None)` without consuming anything when the buffer does not
    /// yet hold the whole chunk.
    pub fn read_chunk(&mut self, buf: &mut BytesMut) -> Result<Option<RawChunk>> {
        let Some((fmt, csid, basic_len)) = parse_basic_header(buf) else {
            return Ok(None);
        };

        let chunk_size = self.chunk_size;
        let max_message_size = self.max_message_size;
        let state = self.streams.entry(csid).or_default();

        if fmt != CHUNK_FMT_0 && state.header.is_none() {
            return Err(ProtocolError::UnknownChunkStream(csid).into());
        }

        let mut cursor = &buf[basic_len..];
        let header_len = match fmt {
            CHUNK_FMT_0 => 11,
            CHUNK_FMT_1 => 7,
            CHUNK_FMT_2 => 3,
            _ => 0,
        };
        if cursor.len() < header_len {
            return Ok(None);
        }

        let prev = state.header.unwrap_or_default();
        let (field, message_length, message_type, stream_id) = match fmt {
            CHUNK_FMT_0 => {
                let ts = cursor.get_uint(3) as u32;
                let len = cursor.get_uint(3) as u32;
                let typ = cursor.get_u8();
                let sid = cursor.get_u32_le();
                (ts, len, typ, sid)
            }
            CHUNK_FMT_1 => {
                let ts = cursor.get_uint(3) as u32;
                let len = cursor.get_uint(3) as u32;
                let typ = cursor.get_u8();
                (ts, len, typ, prev.stream_id)
            }
            CHUNK_FMT_2 => {
                let ts = cursor.get_uint(3) as u32;
                (ts, prev.message_length, prev.message_type, prev.stream_id)
            }
            _ => (prev.delta, prev.message_length, prev.message_type, prev.stream_id),
        };

        let extended = if fmt == CHUNK_FMT_3 {
            prev.extended
        } else {
            field >= EXTENDED_TIMESTAMP_THRESHOLD
        };
        let value = if extended {
            if cursor.len() < 4 {
                return Ok(None);
            }
            cursor.get_u32()
        } else {
            field
        };

        let starts_message = fmt != CHUNK_FMT_3 || state.pending == 0;
        let remaining = if starts_message {
            message_length
        } else {
            state.pending
        };
        let data_len = remaining.min(chunk_size) as usize;
        if cursor.len() < data_len {
            return Ok(None);
        }

        // The whole chunk is buffered; commit.
        let consumed = buf.len() - cursor.len();
        buf.advance(consumed);
        let fragment = buf.split_to(data_len).freeze();

        let header = if starts_message {
            if message_length > max_message_size {
                return Err(ProtocolError::MessageTooLarge {
                    size: message_length,
                    max: max_message_size,
                }
                .into());
            }
            if state.pending > 0 {
                tracing::debug!(csid, dropped = state.partial.len(), "New message header interrupts partial message");
                state.partial.clear();
            }

            let timestamp = match fmt {
                CHUNK_FMT_0 => value,
                _ => prev.timestamp.wrapping_add(value),
            };
            state.header = Some(HeaderState {
                timestamp,
                delta: value,
                message_length,
                message_type,
                stream_id,
                extended,
            });
            state.partial.reserve(message_length as usize);
            Some(ChunkHeader {
                fmt,
                timestamp,
                message_length,
                message_type,
                stream_id,
            })
        } else {
            None
        };

        state.pending = remaining - data_len as u32;
        tracing::trace!(csid, fmt, len = data_len, pending = state.pending, "chunk");

        Ok(Some(RawChunk {
            csid,
            header,
            fragment,
        }))
    }

    /// Abort a message on a chunk stream (when receiving Abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial.clear();
            state.pending = 0;
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse basic header and return (fmt, csid, header_length)
fn parse_basic_header(buf: &[u8]) -> Option<(u8, u32, usize)> {
    let first = *buf.first()?;
    let fmt = (first >> 6) & 0x03;
    match first & 0x3F {
        0 => {
            let second = *buf.get(1)?;
            Some((fmt, 64 + second as u32, 2))
        }
        1 => {
            if buf.len() < 3 {
                return None;
            }
            let csid = 64 + buf[1] as u32 + (buf[2] as u32) * 256;
            Some((fmt, csid, 3))
        }
        low => Some((fmt, low as u32, 1)),
    }
}

/// Chunk stream encoder
///
/// Encodes messages into chunks for transmission, compressing headers
/// against the previous message sent on the same chunk stream.
pub struct ChunkEncoder {
    /// Outgoing chunk size
    chunk_size: u32,
    /// Last header written per chunk stream
    streams: HashMap<u32, HeaderState>,
}

impl ChunkEncoder {
    /// Create a new encoder with default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Set the chunk size (call after sending SetChunkSize)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Get current chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Encode a message into contiguous chunks
    pub fn encode(&mut self, chunk: &RtmpChunk, buf: &mut BytesMut) {
        self.write_chunks(chunk, buf, None);
    }

    /// Encode a message and return each chunk separately
    ///
    /// Lets a caller interleave chunks of different chunk streams.
    pub fn encode_chunks(&mut self, chunk: &RtmpChunk) -> Vec<Bytes> {
        let mut buf = BytesMut::new();
        let mut ends = Vec::new();
        self.write_chunks(chunk, &mut buf, Some(&mut ends));

        let mut chunks = Vec::with_capacity(ends.len());
        let mut start = 0;
        for end in ends {
            chunks.push(buf.split_to(end - start).freeze());
            start = end;
        }
        chunks
    }

    fn write_chunks(
        &mut self,
        chunk: &RtmpChunk,
        buf: &mut BytesMut,
        mut ends: Option<&mut Vec<usize>>,
    ) {
        let csid = chunk.csid;
        let prev = self.streams.get(&csid).copied();
        let fmt = select_format(chunk, prev.as_ref());
        let payload_len = chunk.payload.len() as u32;

        let (value, extended) = match (fmt, prev) {
            (CHUNK_FMT_0, _) | (_, None) => {
                (chunk.timestamp, chunk.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD)
            }
            (CHUNK_FMT_3, Some(prev)) => (prev.delta, prev.extended),
            (_, Some(prev)) => {
                let delta = chunk.timestamp.wrapping_sub(prev.timestamp);
                (delta, delta >= EXTENDED_TIMESTAMP_THRESHOLD)
            }
        };
        let field = if extended {
            EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            value
        };

        self.streams.insert(
            csid,
            HeaderState {
                timestamp: chunk.timestamp,
                delta: value,
                message_length: payload_len,
                message_type: chunk.message_type,
                stream_id: chunk.stream_id,
                extended,
            },
        );

        let base = buf.len();
        let mut offset = 0;
        let mut first = true;
        loop {
            let data_len = (chunk.payload.len() - offset).min(self.chunk_size as usize);

            if first {
                write_basic_header(csid, fmt, buf);
                match fmt {
                    CHUNK_FMT_0 => {
                        write_u24(field, buf);
                        write_u24(payload_len, buf);
                        buf.put_u8(chunk.message_type);
                        buf.put_u32_le(chunk.stream_id);
                    }
                    CHUNK_FMT_1 => {
                        write_u24(field, buf);
                        write_u24(payload_len, buf);
                        buf.put_u8(chunk.message_type);
                    }
                    CHUNK_FMT_2 => write_u24(field, buf),
                    _ => {}
                }
            } else {
                write_basic_header(csid, CHUNK_FMT_3, buf);
            }
            if extended {
                buf.put_u32(value);
            }

            buf.put_slice(&chunk.payload[offset..offset + data_len]);
            offset += data_len;
            first = false;
            if let Some(ends) = ends.as_deref_mut() {
                ends.push(buf.len() - base);
            }

            if offset >= chunk.payload.len() {
                break;
            }
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Select the most compact header format for this message
fn select_format(chunk: &RtmpChunk, prev: Option<&HeaderState>) -> u8 {
    let Some(prev) = prev else {
        return CHUNK_FMT_0;
    };

    // Deltas are unsigned; a stream switch or a backwards step needs a full header
    if chunk.stream_id != prev.stream_id || chunk.timestamp < prev.timestamp {
        return CHUNK_FMT_0;
    }

    if chunk.message_type != prev.message_type
        || chunk.payload.len() as u32 != prev.message_length
    {
        return CHUNK_FMT_1;
    }

    if chunk.timestamp.wrapping_sub(prev.timestamp) == prev.delta {
        return CHUNK_FMT_3;
    }

    CHUNK_FMT_2
}

/// Write basic header
fn write_basic_header(csid: u32, fmt: u8, buf: &mut BytesMut) {
    if csid >= 64 + 256 {
        buf.put_u8((fmt << 6) | 1);
        let offset = csid - 64;
        buf.put_u8((offset & 0xFF) as u8);
        buf.put_u8(((offset >> 8) & 0xFF) as u8);
    } else if csid >= 64 {
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        buf.put_u8((fmt << 6) | (csid as u8));
    }
}

/// Write 24-bit big-endian value
fn write_u24(value: u32, buf: &mut BytesMut) {
    buf.put_u8(((value >> 16) & 0xFF) as u8);
    buf.put_u8(((value >> 8) & 0xFF) as u8);
    buf.put_u8((value & 0xFF) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn message(csid: u32, timestamp: u32, message_type: u8, stream_id: u32, len: usize) -> RtmpChunk {
        RtmpChunk {
            csid,
            timestamp,
            message_type,
            stream_id,
            payload: Bytes::from((0..len).map(|i| (i % 251) as u8 ^ csid as u8).collect::<Vec<_>>()),
        }
    }

    #[test]
    fn test_basic_header_parsing() {
        assert_eq!(parse_basic_header(&[0x03]), Some((0, 3, 1)));
        assert_eq!(parse_basic_header(&[0xC3]), Some((3, 3, 1)));
        assert_eq!(parse_basic_header(&[0x00, 0x00]), Some((0, 64, 2)));
        assert_eq!(parse_basic_header(&[0x01, 0x00, 0x01]), Some((0, 320, 3)));
        assert_eq!(parse_basic_header(&[0x01, 0x00]), None);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let original = message(CSID_COMMAND, 1000, MSG_COMMAND_AMF0, 0, 17);

        let mut encoder = ChunkEncoder::new();
        let mut decoder = ChunkDecoder::new();
        let mut encoded = BytesMut::new();
        encoder.encode(&original, &mut encoded);

        assert_eq!(decoder.decode(&mut encoded).unwrap(), Some(original));
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_large_message_spans_chunks() {
        let original = message(6, 0, MSG_VIDEO, 1, 500);

        let mut encoder = ChunkEncoder::new();
        let chunks = encoder.encode_chunks(&original);
        // 128 + 128 + 128 + 116
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[1][0], 0xC6);

        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::new();
        for c in &chunks {
            buf.extend_from_slice(c);
        }
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(original));
    }

    #[test]
    fn test_partial_chunk_consumes_nothing() {
        let mut encoder = ChunkEncoder::new();
        let mut encoded = BytesMut::new();
        encoder.encode(&message(3, 5, MSG_COMMAND_AMF0, 0, 40), &mut encoded);

        let mut decoder = ChunkDecoder::new();
        let mut partial = BytesMut::from(&encoded[..20]);
        assert!(decoder.read_chunk(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 20);
    }

    #[test]
    fn test_header_compression() {
        let mut encoder = ChunkEncoder::new();
        let first = encoder.encode_chunks(&message(4, 0, MSG_AUDIO, 1, 10));
        let second = encoder.encode_chunks(&message(4, 20, MSG_AUDIO, 1, 10));
        let third = encoder.encode_chunks(&message(4, 40, MSG_AUDIO, 1, 10));
        let fourth = encoder.encode_chunks(&message(4, 60, MSG_AUDIO, 1, 12));

        assert_eq!(first[0][0] >> 6, CHUNK_FMT_0);
        assert_eq!(second[0][0] >> 6, CHUNK_FMT_2);
        assert_eq!(third[0][0] >> 6, CHUNK_FMT_3);
        assert_eq!(fourth[0][0] >> 6, CHUNK_FMT_1);

        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::new();
        for c in first.iter().chain(&second).chain(&third).chain(&fourth) {
            buf.extend_from_slice(c);
        }
        let timestamps: Vec<u32> = std::iter::from_fn(|| decoder.decode(&mut buf).unwrap())
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(timestamps, vec![0, 20, 40, 60]);
    }

    #[test]
    fn test_continuation_does_not_advance_timestamp() {
        let mut encoder = ChunkEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(&message(5, 100, MSG_VIDEO, 1, 10), &mut buf);
        encoder.encode(&message(5, 130, MSG_VIDEO, 1, 300), &mut buf);

        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().timestamp, 100);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().timestamp, 130);
    }

    #[test]
    fn test_extended_timestamp_on_continuations() {
        let original = message(3, 0x0100_0000, MSG_COMMAND_AMF0, 0, 300);
        let mut encoder = ChunkEncoder::new();
        let chunks = encoder.encode_chunks(&original);
        assert_eq!(chunks.len(), 3);
        // fmt 3 basic header followed by the repeated extended timestamp
        assert_eq!(&chunks[1][..5], &[0xC3, 0x01, 0x00, 0x00, 0x00]);

        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::new();
        for c in &chunks {
            buf.extend_from_slice(c);
        }
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(original));
    }

    #[test]
    fn test_compressed_header_without_prior_is_fatal() {
        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::from(&[0x43u8, 0, 0, 0, 0, 0, 1, 20, 0][..]);
        let err = decoder.read_chunk(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Protocol(ProtocolError::UnknownChunkStream(3))
        ));
    }

    #[test]
    fn test_abort_discards_partial() {
        let mut encoder = ChunkEncoder::new();
        let chunks = encoder.encode_chunks(&message(8, 0, MSG_DATA_AMF0, 1, 200));

        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::from(&chunks[0][..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        decoder.abort(8);

        let next = message(8, 10, MSG_DATA_AMF0, 1, 50);
        let mut buf = BytesMut::new();
        encoder.encode(&next, &mut buf);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(next));
    }

    #[test]
    fn test_interleaved_streams_reassemble() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let csids = [3u32, 4, 24, 25, 26, 400];

        for _ in 0..20 {
            let mut encoder = ChunkEncoder::new();
            encoder.set_chunk_size(rng.random_range(16..200));
            let mut decoder = ChunkDecoder::new();
            decoder.set_chunk_size(encoder.chunk_size());

            // Per-csid queues of encoded chunks plus the expected messages
            let mut queues: Vec<Vec<Bytes>> = Vec::new();
            let mut expected: HashMap<u32, Vec<RtmpChunk>> = HashMap::new();
            for &csid in &csids {
                let mut queue = Vec::new();
                let mut ts = rng.random_range(0..1000u32);
                for _ in 0..rng.random_range(1..6) {
                    ts += rng.random_range(0..100u32);
                    let len = rng.random_range(0..700);
                    let msg = message(csid, ts, MSG_AUDIO, csid / 5, len);
                    queue.extend(encoder.encode_chunks(&msg));
                    expected.entry(csid).or_default().push(msg);
                }
                queue.reverse();
                queues.push(queue);
            }

            // Interleave at chunk boundaries, keeping per-csid order
            let mut wire = BytesMut::new();
            while queues.iter().any(|q| !q.is_empty()) {
                let i = rng.random_range(0..queues.len());
                if let Some(chunk) = queues[i].pop() {
                    wire.extend_from_slice(&chunk);
                }
            }

            // Feed in random slices
            let mut inbox = BytesMut::new();
            let mut got: HashMap<u32, Vec<RtmpChunk>> = HashMap::new();
            while !wire.is_empty() {
                let n = rng.random_range(1..64).min(wire.len());
                inbox.extend_from_slice(&wire.split_to(n));
                while let Some(msg) = decoder.decode(&mut inbox).unwrap() {
                    got.entry(msg.csid).or_default().push(msg);
                }
            }

            assert_eq!(got, expected);
        }
    }
}
