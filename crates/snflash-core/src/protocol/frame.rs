//! Host command encoding and binary ack decoding.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;

use super::ProtocolError;
use super::constants::*;
use crate::serial_number::SerialNumber;

/// Which image a chunked transfer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageKind {
    Boot = 1,
    Diagnostics = 2,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Boot => write!(f, "boot image"),
            ImageKind::Diagnostics => write!(f, "diagnostics image"),
        }
    }
}

/// A command sent from host to device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    QueryModel,
    ReadSerial,
    WriteSerial(SerialNumber),
    Exploit(Vec<u8>),
    TransferBegin {
        kind: ImageKind,
        total_len: u32,
        chunk_count: u32,
    },
    TransferChunk {
        index: u32,
        data: Vec<u8>,
    },
    TransferEnd,
}

impl Command {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::QueryModel => "MODEL?",
            Command::ReadSerial => "SN?",
            Command::WriteSerial(_) => "SN=",
            Command::Exploit(_) => "XPLT",
            Command::TransferBegin { .. } => "XFRB",
            Command::TransferChunk { .. } => "XFRC",
            Command::TransferEnd => "XFRE",
        }
    }

    /// Whether the device answers this command with a text line (as opposed
    /// to a fixed-size ack frame).
    pub fn expects_line(&self) -> bool {
        matches!(
            self,
            Command::QueryModel | Command::ReadSerial | Command::WriteSerial(_)
        )
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::QueryModel => text_line(CMD_QUERY_MODEL),
            Command::ReadSerial => text_line(CMD_READ_SERIAL),
            Command::WriteSerial(sn) => {
                text_line(&format!("{}{}", CMD_WRITE_SERIAL_PREFIX, sn.as_str()))
            }
            Command::Exploit(payload) => binary_frame(TAG_EXPLOIT, payload),
            Command::TransferBegin {
                kind,
                total_len,
                chunk_count,
            } => {
                let mut body = Vec::with_capacity(9);
                let _ = body.write_u32::<LittleEndian>(*total_len);
                let _ = body.write_u32::<LittleEndian>(*chunk_count);
                body.push(*kind as u8);
                binary_frame(TAG_XFER_BEGIN, &body)
            }
            Command::TransferChunk { index, data } => {
                let mut body = Vec::with_capacity(4 + data.len());
                let _ = body.write_u32::<LittleEndian>(*index);
                body.extend_from_slice(data);
                binary_frame(TAG_XFER_CHUNK, &body)
            }
            Command::TransferEnd => binary_frame(TAG_XFER_END, &[]),
        }
    }
}

fn text_line(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + LINE_TERMINATOR.len());
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(LINE_TERMINATOR);
    out
}

fn binary_frame(tag: [u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.extend_from_slice(&tag);
    // Writing into a Vec cannot fail.
    let _ = out.write_u32::<LittleEndian>(body.len() as u32);
    out.extend_from_slice(body);
    out
}

/// Fixed-size acknowledgment frame from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFrame {
    /// Frame accepted. Carries the chunk index or [`ACK_VALUE_CONTROL`].
    Ok(u32),
    /// Device buffer full; keep waiting for the real ack.
    Wait,
    /// Device refused the frame with an error code.
    Nak(u32),
}

impl AckFrame {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != ACK_FRAME_SIZE {
            return Err(ProtocolError::UnexpectedFrame(format!(
                "ack frame must be {} bytes, got {}",
                ACK_FRAME_SIZE,
                bytes.len()
            )));
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&bytes[..4]);
        let value = Cursor::new(&bytes[4..])
            .read_u32::<LittleEndian>()
            .map_err(|e| ProtocolError::UnexpectedFrame(e.to_string()))?;

        match tag {
            ACK_TAG_OK => Ok(AckFrame::Ok(value)),
            ACK_TAG_WAIT => Ok(AckFrame::Wait),
            ACK_TAG_NAK => Ok(AckFrame::Nak(value)),
            other => Err(ProtocolError::UnexpectedFrame(format!(
                "unknown ack tag {:?}",
                String::from_utf8_lossy(&other)
            ))),
        }
    }

    pub fn to_bytes(&self) -> [u8; ACK_FRAME_SIZE] {
        let (tag, value) = match self {
            AckFrame::Ok(v) => (ACK_TAG_OK, *v),
            AckFrame::Wait => (ACK_TAG_WAIT, 0),
            AckFrame::Nak(code) => (ACK_TAG_NAK, *code),
        };
        let mut out = [0u8; ACK_FRAME_SIZE];
        out[..4].copy_from_slice(&tag);
        out[4..].copy_from_slice(&value.to_le_bytes());
        out
    }
}

/// Split a host binary frame into `(tag, body)`. Used by the simulated device.
pub fn decode_binary_frame(bytes: &[u8]) -> Option<([u8; 4], &[u8])> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&bytes[..4]);
    let len = Cursor::new(&bytes[4..8]).read_u32::<LittleEndian>().ok()? as usize;
    let body = bytes.get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len)?;
    Some((tag, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial_number::parse;

    #[test]
    fn test_text_commands() {
        assert_eq!(Command::QueryModel.encode(), b"MODEL?\r\n");
        assert_eq!(Command::ReadSerial.encode(), b"SN?\r\n");
        let sn = parse("C02123ABCQ6L").unwrap();
        assert_eq!(Command::WriteSerial(sn).encode(), b"SN=C02123ABCQ6L\r\n");
    }

    #[test]
    fn test_transfer_begin_layout() {
        let bytes = Command::TransferBegin {
            kind: ImageKind::Diagnostics,
            total_len: 0x0102_0304,
            chunk_count: 3,
        }
        .encode();
        assert_eq!(
            bytes,
            vec![
                b'X', b'F', b'R', b'B', 9, 0, 0, 0, // header
                0x04, 0x03, 0x02, 0x01, // total
                3, 0, 0, 0, // chunks
                2, // kind
            ]
        );
    }

    #[test]
    fn test_chunk_layout() {
        let bytes = Command::TransferChunk {
            index: 5,
            data: vec![0xAA, 0xBB],
        }
        .encode();
        assert_eq!(
            bytes,
            vec![b'X', b'F', b'R', b'C', 6, 0, 0, 0, 5, 0, 0, 0, 0xAA, 0xBB]
        );
        let (tag, body) = decode_binary_frame(&bytes).unwrap();
        assert_eq!(tag, TAG_XFER_CHUNK);
        assert_eq!(body, &[5, 0, 0, 0, 0xAA, 0xBB]);
    }

    #[test]
    fn test_transfer_end_is_header_only() {
        assert_eq!(Command::TransferEnd.encode(), b"XFRE\0\0\0\0");
    }

    #[test]
    fn test_ack_parsing() {
        assert_eq!(
            AckFrame::from_bytes(b"ACK \x07\x00\x00\x00").unwrap(),
            AckFrame::Ok(7)
        );
        assert_eq!(
            AckFrame::from_bytes(b"WAIT\x00\x00\x00\x00").unwrap(),
            AckFrame::Wait
        );
        assert_eq!(
            AckFrame::from_bytes(b"NAK \x10\x00\x00\x00").unwrap(),
            AckFrame::Nak(16)
        );
        assert!(AckFrame::from_bytes(b"HUH?\x00\x00\x00\x00").is_err());
        assert!(AckFrame::from_bytes(b"ACK ").is_err());
    }

    #[test]
    fn test_ack_to_bytes() {
        assert_eq!(&AckFrame::Ok(1).to_bytes(), b"ACK \x01\x00\x00\x00");
        assert_eq!(
            AckFrame::from_bytes(&AckFrame::Nak(3).to_bytes()).unwrap(),
            AckFrame::Nak(3)
        );
    }

    #[test]
    fn test_line_classification() {
        assert!(Command::ReadSerial.expects_line());
        assert!(!Command::TransferEnd.expects_line());
        assert!(!Command::Exploit(vec![1]).expects_line());
    }
}
