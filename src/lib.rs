//! rtmp-client: multiplexed RTMP client sessions
//!
//! One connection carries everything a Flash-era client does:
//! - remote invocations correlated by transaction id (`_result` / `_error`)
//! - NetStreams for playback and publishing, one chunk stream triplet each
//! - remote shared objects with a server-authoritative local mirror
//! - Flex remoting and messaging over AMF3
//!
//! # Example
//!
//! ```no_run
//! use rtmp_client::{ClientConfig, RtmpClient, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> rtmp_client::Result<()> {
//!     let client = RtmpClient::connect(ClientConfig::new("rtmp://localhost/live")).await?;
//!     let mut events = client.subscribe();
//!
//!     let total = client.invoke("add", vec![1.0.into(), 2.0.into()]).await?;
//!     println!("add returned {:?}", total);
//!
//!     let stream = client.create_stream().await?;
//!     let mut video = stream.subscribe_video();
//!     stream.play("camera").await?;
//!
//!     while let Some(packet) = video.recv().await {
//!         println!("video frame at {} ms", packet.timestamp);
//!     }
//!
//!     if let Ok(SessionEvent::Disconnected(cause)) = events.recv().await {
//!         println!("session closed: {}", cause);
//!     }
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod client;
pub mod error;
pub mod media;
pub mod protocol;

pub use amf::{AmfValue, ObjectEncoding};
pub use client::{ClientConfig, ClientDelegate, NetStream, RtmpClient, SessionEvent, SharedObject};
pub use error::{Error, Result};
