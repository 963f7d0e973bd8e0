//! RTMP handshake implementation
//!
//! The RTMP handshake consists of three phases:
//!
//! ```text
//! Client                                   Server
//!   |                                        |
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |                                        |
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |                                        |
//!   |------- C2 (1536 bytes: echo S1) ----->|
//!   |                                        |
//!   |          [Handshake Complete]          |
//! ```
//!
//! [`ClientHandshake`] is the byte-level state machine. [`Handshaker`] is the
//! pluggable async step the session runs over a fresh transport;
//! [`SimpleHandshake`] drives the state machine and is the default. Servers
//! that insist on the digest handshake need their own [`Handshaker`].
//!
//! Reference: RTMP Specification Section 5.2

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::client::transport::RtmpIo;
use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Performs the opening handshake on a freshly connected transport
#[async_trait]
pub trait Handshaker: Send + Sync {
    async fn handshake(&self, io: &mut dyn RtmpIo) -> Result<()>;
}

/// Plain C0C1 / S0S1S2 / C2 exchange without digests
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleHandshake;

#[async_trait]
impl Handshaker for SimpleHandshake {
    async fn handshake(&self, io: &mut dyn RtmpIo) -> Result<()> {
        let mut handshake = ClientHandshake::new();

        let c0c1 = handshake.generate_initial()?;
        io.write_all(&c0c1).await?;
        io.flush().await?;

        let mut s0s1s2 = vec![0u8; handshake.bytes_needed()];
        io.read_exact(&mut s0s1s2).await?;
        let c2 = handshake.process(&mut Bytes::from(s0s1s2))?;
        io.write_all(&c2).await?;
        io.flush().await?;

        tracing::debug!("Handshake complete");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Need to send C0C1
    Initial,
    /// Waiting for S0S1S2
    WaitingForServer,
    Done,
}

/// Client side handshake state machine
#[derive(Debug)]
pub struct ClientHandshake {
    state: HandshakeState,
    /// Our C1 packet, echoed back in S2
    c1: Option<[u8; HANDSHAKE_SIZE]>,
}

impl ClientHandshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Initial,
            c1: None,
        }
    }

    /// Check if handshake is complete
    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes the server must send before the next step
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            HandshakeState::WaitingForServer => 1 + HANDSHAKE_SIZE * 2,
            _ => 0,
        }
    }

    /// Generate C0+C1 (1 + 1536 bytes)
    pub fn generate_initial(&mut self) -> Result<Bytes> {
        if self.state != HandshakeState::Initial {
            return Err(HandshakeError::InvalidState.into());
        }

        let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        buf.put_u8(RTMP_VERSION);
        let c1 = generate_packet();
        self.c1 = Some(c1);
        buf.put_slice(&c1);

        self.state = HandshakeState::WaitingForServer;
        Ok(buf.freeze())
    }

    /// Consume S0+S1+S2 and return C2
    pub fn process(&mut self, data: &mut Bytes) -> Result<Bytes> {
        if self.state != HandshakeState::WaitingForServer || data.remaining() < self.bytes_needed() {
            return Err(HandshakeError::InvalidState.into());
        }

        let version = data.get_u8();
        if version < RTMP_VERSION {
            return Err(HandshakeError::InvalidVersion(version).into());
        }

        let mut s1 = [0u8; HANDSHAKE_SIZE];
        data.copy_to_slice(&mut s1);

        let mut s2 = [0u8; HANDSHAKE_SIZE];
        data.copy_to_slice(&mut s2);
        if self.c1.map(|c1| c1[8..] != s2[8..]).unwrap_or(false) {
            // Plenty of servers echo garbage here
            tracing::debug!("S2 does not echo C1");
        }

        self.state = HandshakeState::Done;
        Ok(Bytes::copy_from_slice(&generate_echo(&s1)))
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Generate C1
///
/// Format (1536 bytes):
/// - Bytes 0-3: Timestamp (32-bit, big-endian)
/// - Bytes 4-7: Zero
/// - Bytes 8-1535: Random data
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    packet[0..4].copy_from_slice(&now_millis().to_be_bytes());
    rand::rng().fill(&mut packet[8..]);
    packet
}

/// Generate C2
///
/// Format:
/// - Bytes 0-3: Peer's timestamp (from S1)
/// - Bytes 4-7: Our timestamp
/// - Bytes 8-1535: Copy of peer's random data
fn generate_echo(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;
    echo[4..8].copy_from_slice(&now_millis().to_be_bytes());
    echo
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_reply(c1: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(RTMP_VERSION);
        let s1: Vec<u8> = (0..HANDSHAKE_SIZE).map(|i| (i % 255) as u8).collect();
        buf.put_slice(&s1);
        buf.put_slice(c1);
        buf.freeze()
    }

    #[test]
    fn test_client_state_machine() {
        let mut client = ClientHandshake::new();
        let c0c1 = client.generate_initial().unwrap();
        assert_eq!(c0c1.len(), 1 + HANDSHAKE_SIZE);
        assert_eq!(c0c1[0], RTMP_VERSION);
        assert_eq!(&c0c1[5..9], &[0, 0, 0, 0]);
        assert_eq!(client.bytes_needed(), 1 + HANDSHAKE_SIZE * 2);

        let mut reply = server_reply(&c0c1[1..]);
        let c2 = client.process(&mut reply).unwrap();
        assert_eq!(c2.len(), HANDSHAKE_SIZE);
        // C2 echoes S1's random part
        assert_eq!(c2[8], 8);
        assert!(client.is_done());
    }

    #[test]
    fn test_rejects_old_version() {
        let mut client = ClientHandshake::new();
        let c0c1 = client.generate_initial().unwrap();
        let mut reply = BytesMut::from(&server_reply(&c0c1[1..])[..]);
        reply[0] = 2;
        let err = client.process(&mut reply.freeze()).unwrap_err();
        assert!(err.to_string().contains("Invalid RTMP version"));
    }

    #[test]
    fn test_initial_twice_is_invalid() {
        let mut client = ClientHandshake::new();
        client.generate_initial().unwrap();
        assert!(client.generate_initial().is_err());
    }

    #[tokio::test]
    async fn test_simple_handshake_over_duplex() {
        let (mut client_io, mut server_io) = tokio::io::duplex(8192);

        let server = tokio::spawn(async move {
            let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
            server_io.read_exact(&mut c0c1).await.unwrap();
            server_io.write_all(&server_reply(&c0c1[1..])).await.unwrap();
            let mut c2 = vec![0u8; HANDSHAKE_SIZE];
            server_io.read_exact(&mut c2).await.unwrap();
            c2
        });

        SimpleHandshake.handshake(&mut client_io).await.unwrap();
        let c2 = server.await.unwrap();
        assert_eq!(c2[100], 100);
    }
}
