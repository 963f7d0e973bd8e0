//! RTMP client sessions
//!
//! One [`RtmpClient`] multiplexes over a single connection:
//! - request/response invocations correlated by transaction id
//! - any number of [`NetStream`]s, each on its own chunk stream triplet
//! - remote [`SharedObject`]s with a locally mirrored copy
//! - Flex remoting and messaging subscriptions
//!
//! ```no_run
//! use rtmp_client::client::{ClientConfig, RtmpClient};
//!
//! # async fn run() -> rtmp_client::Result<()> {
//! let client = RtmpClient::connect(ClientConfig::new("rtmp://localhost/live")).await?;
//! let stream = client.create_stream().await?;
//! stream.play("camera").await?;
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod channel;
pub mod config;
pub mod delegate;
mod dispatch;
pub mod events;
pub mod flex;
mod io;
pub mod negotiation;
pub mod net_stream;
pub mod session;
pub mod shared_object;
pub mod transport;


pub use config::{ClientConfig, ParsedUrl};
pub use delegate::{CallbackError, ClientDelegate, HandlerMap};
pub use events::{MediaKind, MediaPacket, SessionEvent};
pub use flex::CommandOperation;
pub use net_stream::NetStream;
pub use session::{RtmpClient, SessionState, CLOSE_REQUESTED_BY_USER};
pub use shared_object::{SharedObject, SharedObjectChange};
pub use transport::{AcceptAnyCertificate, CertificateValidator, RtmpIo};
