//! Protocol constants.
//!
//! Framing is provisional until checked byte-for-byte against hardware.

// ============================================================================
// Text commands (host -> device), CRLF terminated
// ============================================================================

pub const LINE_TERMINATOR: &[u8] = b"\r\n";

pub const CMD_QUERY_MODEL: &str = "MODEL?";
pub const CMD_READ_SERIAL: &str = "SN?";
/// Followed directly by the 12-character serial.
pub const CMD_WRITE_SERIAL_PREFIX: &str = "SN=";

// ============================================================================
// Text replies (device -> host)
// ============================================================================

pub const REPLY_MODEL: &str = "MODEL";
pub const REPLY_SERIAL: &str = "SN";
pub const REPLY_OK: &str = "OK";
pub const REPLY_ERR: &str = "ERR";

/// Longest accepted reply line before it is treated as garbage.
pub const MAX_LINE_LEN: usize = 256;

// ============================================================================
// Binary frames (host -> device): tag + u32 LE body length + body
// ============================================================================

pub const FRAME_HEADER_SIZE: usize = 8;

pub const TAG_EXPLOIT: [u8; 4] = *b"XPLT";
pub const TAG_XFER_BEGIN: [u8; 4] = *b"XFRB";
pub const TAG_XFER_CHUNK: [u8; 4] = *b"XFRC";
pub const TAG_XFER_END: [u8; 4] = *b"XFRE";

// ============================================================================
// Ack frames (device -> host): fixed 8 bytes, tag + u32 LE value
// ============================================================================

pub const ACK_FRAME_SIZE: usize = 8;

pub const ACK_TAG_OK: [u8; 4] = *b"ACK ";
pub const ACK_TAG_WAIT: [u8; 4] = *b"WAIT";
pub const ACK_TAG_NAK: [u8; 4] = *b"NAK ";

/// Ack value used for frames that are not indexed chunks.
pub const ACK_VALUE_CONTROL: u32 = 0xFFFF_FFFF;

// ============================================================================
// Sizes
// ============================================================================

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;
