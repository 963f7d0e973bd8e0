//! FLV tags and a muxer for NetStream media
//!
//! RTMP audio/video payloads are FLV tag bodies without the tag header, so
//! writing a playable `.flv` only needs the framing around them:
//!
//! ```text
//! header(9) | prev(4)=0 | tag | prev(4) | tag | prev(4) ...
//!
//! tag: Type(1) | DataSize(3) | TS(3) + TSExt(1) | StreamID(3)=0 | Data(N)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::client::{MediaKind, MediaPacket};
use crate::error::Result;

const TAG_HEADER_SIZE: usize = 11;
const FLV_HEADER_SIZE: u32 = 9;
const FLAG_AUDIO: u8 = 0x04;
const FLAG_VIDEO: u8 = 0x01;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio = 8,
    Video = 9,
    Script = 18,
}

#[derive(Debug, Clone)]
pub struct FlvTag {
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Tag body, codec headers included
    pub data: Bytes,
}

impl FlvTag {
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            data,
        }
    }

    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Audio,
            timestamp,
            data,
        }
    }

    /// Video frame type 1 (key) or 4 (generated key)
    pub fn is_keyframe(&self) -> bool {
        self.tag_type == FlvTagType::Video
            && self
                .data
                .first()
                .map(|b| matches!(b >> 4, 1 | 4))
                .unwrap_or(false)
    }

    /// AVC or AAC sequence header (packet type 0)
    pub fn is_sequence_header(&self) -> bool {
        if self.data.len() < 2 || self.data[1] != 0 {
            return false;
        }
        match self.tag_type {
            FlvTagType::Video => self.data[0] & 0x0F == 7,
            FlvTagType::Audio => self.data[0] >> 4 == 10,
            FlvTagType::Script => false,
        }
    }

    /// Tag header plus body
    pub fn size(&self) -> u32 {
        (TAG_HEADER_SIZE + self.data.len()) as u32
    }

    fn write_header(&self, buf: &mut BytesMut) {
        let len = self.data.len() as u32;
        buf.put_u8(self.tag_type as u8);
        buf.put_uint(u64::from(len & 0x00FF_FFFF), 3);
        buf.put_uint(u64::from(self.timestamp & 0x00FF_FFFF), 3);
        buf.put_u8((self.timestamp >> 24) as u8);
        buf.put_uint(0, 3);
    }
}

impl From<MediaPacket> for FlvTag {
    fn from(packet: MediaPacket) -> Self {
        match packet.kind {
            MediaKind::Audio => FlvTag::audio(packet.timestamp, packet.data),
            MediaKind::Video => FlvTag::video(packet.timestamp, packet.data),
        }
    }
}

/// Writes NetStream media as an FLV file
///
/// Tags whose timestamp goes backwards are dropped.
pub struct FlvMuxer<W> {
    writer: W,
    has_audio: bool,
    has_video: bool,
    header_written: bool,
    last_timestamp: u32,
    last_tag_size: u32,
    dropped: u64,
}

impl<W: AsyncWrite + Unpin> FlvMuxer<W> {
    pub fn new(writer: W, has_audio: bool, has_video: bool) -> Self {
        Self {
            writer,
            has_audio,
            has_video,
            header_written: false,
            last_timestamp: 0,
            last_tag_size: 0,
            dropped: 0,
        }
    }

    /// Write the file header; called by the first `write_tag` otherwise
    pub async fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        let mut flags = 0;
        if self.has_audio {
            flags |= FLAG_AUDIO;
        }
        if self.has_video {
            flags |= FLAG_VIDEO;
        }

        let mut buf = BytesMut::with_capacity(FLV_HEADER_SIZE as usize);
        buf.put_slice(b"FLV");
        buf.put_u8(1);
        buf.put_u8(flags);
        buf.put_u32(FLV_HEADER_SIZE);
        self.writer.write_all(&buf).await?;
        self.header_written = true;
        Ok(())
    }

    /// Returns false if the tag was dropped
    pub async fn write_tag(&mut self, tag: &FlvTag) -> Result<bool> {
        self.write_header().await?;
        if tag.timestamp < self.last_timestamp {
            self.dropped += 1;
            tracing::trace!(
                timestamp = tag.timestamp,
                last = self.last_timestamp,
                "Dropping out-of-order tag"
            );
            return Ok(false);
        }

        let mut buf = BytesMut::with_capacity(4 + TAG_HEADER_SIZE);
        buf.put_u32(self.last_tag_size);
        tag.write_header(&mut buf);
        self.writer.write_all(&buf).await?;
        self.writer.write_all(&tag.data).await?;

        self.last_timestamp = tag.timestamp;
        self.last_tag_size = tag.size();
        Ok(true)
    }

    pub async fn write_packet(&mut self, packet: MediaPacket) -> Result<bool> {
        self.write_tag(&FlvTag::from(packet)).await
    }

    /// Write packets until the stream closes, then flush
    pub async fn run(&mut self, mut packets: mpsc::UnboundedReceiver<MediaPacket>) -> Result<()> {
        self.write_header().await?;
        while let Some(packet) = packets.recv().await {
            self.write_packet(packet).await?;
        }
        self.flush().await
    }

    /// Trailing PreviousTagSize, then flush
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.write_all(&self.last_tag_size.to_be_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Tags dropped for going back in time
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_classification() {
        let avc_header = FlvTag::video(0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00]));
        assert!(avc_header.is_sequence_header());
        assert!(avc_header.is_keyframe());

        let inter = FlvTag::video(0, Bytes::from_static(&[0x27, 0x01]));
        assert!(!inter.is_sequence_header());
        assert!(!inter.is_keyframe());

        let aac_header = FlvTag::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(aac_header.is_sequence_header());
        assert!(!aac_header.is_keyframe());
    }

    #[tokio::test]
    async fn test_muxer_layout() {
        let mut muxer = FlvMuxer::new(Vec::new(), true, false);
        let tag = FlvTag::audio(0x0102_0304, Bytes::from_static(&[0xAF, 0x01, 0x21]));
        assert!(muxer.write_tag(&tag).await.unwrap());
        muxer.flush().await.unwrap();
        let out = muxer.into_inner();

        assert_eq!(&out[..9], &[b'F', b'L', b'V', 1, FLAG_AUDIO, 0, 0, 0, 9]);
        assert_eq!(&out[9..13], &[0, 0, 0, 0]);
        assert_eq!(
            &out[13..24],
            &[8, 0, 0, 3, 0x02, 0x03, 0x04, 0x01, 0, 0, 0]
        );
        assert_eq!(&out[24..27], &[0xAF, 0x01, 0x21]);
        // Trailing size covers header and body
        assert_eq!(&out[27..], &14u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_muxer_drops_backwards_timestamps() {
        let mut muxer = FlvMuxer::new(Vec::new(), true, true);
        let (tx, rx) = mpsc::unbounded_channel();
        for (kind, timestamp) in [
            (MediaKind::Video, 40),
            (MediaKind::Audio, 20),
            (MediaKind::Audio, 40),
            (MediaKind::Video, 80),
        ] {
            tx.send(MediaPacket {
                kind,
                timestamp,
                data: Bytes::from_static(&[0u8; 4]),
            })
            .unwrap();
        }
        drop(tx);

        muxer.run(rx).await.unwrap();
        assert_eq!(muxer.dropped(), 1);
        let out = muxer.into_inner();
        // header + first prev size + 3 tags of 15 bytes with sizes + trailer
        assert_eq!(out.len(), 9 + 3 * (4 + 15) + 4);
    }
}
