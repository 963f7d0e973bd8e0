//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)
//! Reference: Adobe Shared Object message format (RTMP spec section 7.1.3)

/// RTMP version number (always 3 for standard RTMP)
pub const RTMP_VERSION: u8 = 3;

/// Default RTMP port
pub const RTMP_PORT: u16 = 1935;

/// Default RTMPS port
pub const RTMPS_PORT: u16 = 443;

/// Handshake packet sizes
pub const HANDSHAKE_SIZE: usize = 1536;

/// Chunk size every peer starts with
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Outbound chunk size announced right after the handshake
pub const CLIENT_CHUNK_SIZE: u32 = 4192;

/// Largest chunk size a SetChunkSize may carry (31 bits)
pub const MAX_CHUNK_SIZE: u32 = 0x7FFF_FFFF;

/// Maximum message size (sanity limit)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Timestamps >= this value require the extended timestamp field
pub const EXTENDED_TIMESTAMP_THRESHOLD: u32 = 0xFFFFFF;

// ============================================================================
// Chunk Stream IDs (CSID)
// ============================================================================

/// Protocol control messages (Set Chunk Size, Abort, etc.)
pub const CSID_PROTOCOL_CONTROL: u32 = 2;

/// Command messages (connect, createStream, shared objects)
pub const CSID_COMMAND: u32 = 3;

/// Largest chunk stream id expressible by a 3-byte basic header
pub const MAX_CSID: u32 = 65599;

// ============================================================================
// Message Type IDs
// ============================================================================

pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_SHARED_OBJECT_AMF3: u8 = 16;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_SHARED_OBJECT_AMF0: u8 = 19;
pub const MSG_COMMAND_AMF0: u8 = 20;
pub const MSG_AGGREGATE: u8 = 22;

// ============================================================================
// User Control Event Types
// ============================================================================

/// Stream Begin - server sends when stream becomes functional
pub const UC_STREAM_BEGIN: u16 = 0;

/// Stream EOF - server sends when playback ends
pub const UC_STREAM_EOF: u16 = 1;

/// Stream Dry - no more data available
pub const UC_STREAM_DRY: u16 = 2;

/// Set Buffer Length - client tells server buffer size
pub const UC_SET_BUFFER_LENGTH: u16 = 3;

/// Stream Is Recorded
pub const UC_STREAM_IS_RECORDED: u16 = 4;

/// Ping Request - server pings client
pub const UC_PING_REQUEST: u16 = 6;

/// Ping Response - client responds to ping
pub const UC_PING_RESPONSE: u16 = 7;

// ============================================================================
// Shared Object Event Types
// ============================================================================

pub const SO_CONNECT: u8 = 1;
pub const SO_DISCONNECT: u8 = 2;
pub const SO_SET_ATTRIBUTE: u8 = 3;
pub const SO_UPDATE_DATA: u8 = 4;
pub const SO_UPDATE_ATTRIBUTE: u8 = 5;
pub const SO_SEND_MESSAGE: u8 = 6;
pub const SO_STATUS: u8 = 7;
pub const SO_CLEAR_DATA: u8 = 8;
pub const SO_DELETE_DATA: u8 = 9;
pub const SO_DELETE_ATTRIBUTE: u8 = 10;
pub const SO_INITIAL_DATA: u8 = 11;

/// Shared object flag bit marking a persistent object
pub const SO_FLAG_PERSISTENT: u32 = 2;

// ============================================================================
// Command Names
// ============================================================================

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_PLAY: &str = "play";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_PAUSE: &str = "pause";
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_ON_STATUS: &str = "onStatus";
pub const CMD_RECEIVE: &str = "receive";

// ============================================================================
// Status Codes
// ============================================================================

pub const NC_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
pub const NC_CONNECT_REJECTED: &str = "NetConnection.Connect.Rejected";

// ============================================================================
// Connect defaults
// ============================================================================

pub const DEFAULT_FLASH_VERSION: &str = "WIN 21,0,0,174";
pub const AUDIO_CODECS: f64 = 4.0;
pub const VIDEO_CODECS: f64 = 252.0;
pub const VIDEO_FUNCTION: f64 = 1.0;
pub const CAPABILITIES: f64 = 239.0;


// ============================================================================
// Chunk Header Format Types (fmt field)
// ============================================================================

/// Type 0: Full header (11 bytes) - timestamp, length, type, stream ID
pub const CHUNK_FMT_0: u8 = 0;

/// Type 1: No stream ID (7 bytes) - timestamp delta, length, type
pub const CHUNK_FMT_1: u8 = 1;

/// Type 2: Timestamp delta only (3 bytes)
pub const CHUNK_FMT_2: u8 = 2;

/// Type 3: No header - use previous chunk's values
pub const CHUNK_FMT_3: u8 = 3;
