//! Simulated controller for testing session logic without hardware.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{LittleEndian, ReadBytesExt};

use super::traits::{PortDescriptor, RxEvent, SerialTransport, TransportError};
use crate::protocol::constants::*;
use crate::protocol::frame::{AckFrame, decode_binary_frame};

/// Behavior knobs for the simulated device.
#[derive(Debug, Clone)]
pub struct MockDeviceConfig {
    /// Model reported to `MODEL?`. `None` keeps the device silent.
    pub model: Option<String>,
    /// Serial stored on the device at start.
    pub serial: String,
    /// Reply to `MODEL?` with line noise instead of a model.
    pub garbled_model: bool,
    /// Answer the exploit frame with a NAK.
    pub reject_exploit: bool,
    /// Drop the connection when this many chunks have been acked.
    pub disconnect_after_chunks: Option<u32>,
    /// WAIT frames emitted ahead of every chunk ack.
    pub waits_per_chunk: u32,
    /// Never acknowledge this chunk index.
    pub stall_on_chunk: Option<u32>,
    /// After a write, report this instead of the written value.
    pub echo_override: Option<String>,
    /// Refuse `SN=` with this error message.
    pub reject_write: Option<String>,
    /// Drop the connection on `SN=` before answering.
    pub disconnect_on_write: bool,
    /// Answer `SN=` with OK, then drop the connection.
    pub disconnect_after_write: bool,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        Self {
            model: Some("J680AP".into()),
            serial: "C02123ABCQ6L".into(),
            garbled_model: false,
            reject_exploit: false,
            disconnect_after_chunks: None,
            waits_per_chunk: 0,
            stall_on_chunk: None,
            echo_override: None,
            reject_write: None,
            disconnect_on_write: false,
            disconnect_after_write: false,
        }
    }
}

#[derive(Debug, Default)]
struct Transfer {
    kind: u8,
    expected_len: usize,
    data: Vec<u8>,
}

#[derive(Debug)]
struct DeviceState {
    config: MockDeviceConfig,
    serial: String,
    connected: bool,
    exploited: bool,
    diags_loaded: bool,
    chunks_acked: u32,
    transfer: Option<Transfer>,
    images: Vec<(u8, Vec<u8>)>,
    writes: Vec<Vec<u8>>,
    serial_writes: Vec<String>,
    open_count: u32,
    tx: Option<Sender<RxEvent>>,
}

impl DeviceState {
    fn reply_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.extend_from_slice(LINE_TERMINATOR);
        self.reply(bytes);
    }

    fn reply_ack(&self, ack: AckFrame) {
        self.reply(ack.to_bytes().to_vec());
    }

    fn reply(&self, bytes: Vec<u8>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(RxEvent::Data(bytes));
        }
    }

    fn drop_connection(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(RxEvent::Closed);
        }
        self.connected = false;
    }

    fn handle(&mut self, data: &[u8]) {
        let known = [TAG_EXPLOIT, TAG_XFER_BEGIN, TAG_XFER_CHUNK, TAG_XFER_END];
        let frame = decode_binary_frame(data).filter(|(tag, _)| known.contains(tag));
        if let Some((tag, body)) = frame {
            self.handle_binary(tag, body);
            return;
        }
        let text = String::from_utf8_lossy(data);
        let line = text.trim_end_matches(['\r', '\n']);
        self.handle_text(line);
    }

    fn handle_text(&mut self, line: &str) {
        if line == CMD_QUERY_MODEL {
            if self.config.garbled_model {
                self.reply(b"\x00\xfe#MO?\xff\r\n".to_vec());
            } else if let Some(model) = &self.config.model {
                self.reply_line(&format!("{} {}", REPLY_MODEL, model));
            }
        } else if !self.diags_loaded {
            self.reply_line(&format!("{} diagnostics not loaded", REPLY_ERR));
        } else if line == CMD_READ_SERIAL {
            let reported = match (&self.config.echo_override, self.serial_writes.is_empty()) {
                (Some(echo), false) => echo.clone(),
                _ => self.serial.clone(),
            };
            self.reply_line(&format!("{} {}", REPLY_SERIAL, reported));
        } else if let Some(value) = line.strip_prefix(CMD_WRITE_SERIAL_PREFIX) {
            self.handle_write_serial(value);
        } else {
            self.reply_line(&format!("{} unknown command", REPLY_ERR));
        }
    }

    fn handle_write_serial(&mut self, value: &str) {
        if let Some(msg) = &self.config.reject_write {
            self.reply_line(&format!("{} {}", REPLY_ERR, msg));
            return;
        }
        if self.config.disconnect_on_write {
            self.drop_connection();
            return;
        }
        self.serial = value.to_string();
        self.serial_writes.push(value.to_string());
        self.reply_line(REPLY_OK);
        if self.config.disconnect_after_write {
            self.drop_connection();
        }
    }

    fn handle_binary(&mut self, tag: [u8; 4], body: &[u8]) {
        match tag {
            TAG_EXPLOIT => {
                if self.config.reject_exploit {
                    self.reply_ack(AckFrame::Nak(1));
                } else {
                    self.exploited = true;
                    self.reply_ack(AckFrame::Ok(ACK_VALUE_CONTROL));
                }
            }
            TAG_XFER_BEGIN if self.exploited && body.len() == 9 => {
                let mut cursor = std::io::Cursor::new(body);
                let total = cursor.read_u32::<LittleEndian>().unwrap_or(0) as usize;
                self.transfer = Some(Transfer {
                    kind: body[8],
                    expected_len: total,
                    data: Vec::with_capacity(total),
                });
                self.reply_ack(AckFrame::Ok(ACK_VALUE_CONTROL));
            }
            TAG_XFER_CHUNK if self.transfer.is_some() && body.len() >= 4 => {
                let index = std::io::Cursor::new(&body[..4])
                    .read_u32::<LittleEndian>()
                    .unwrap_or(u32::MAX);
                if self.config.disconnect_after_chunks == Some(self.chunks_acked) {
                    self.drop_connection();
                    return;
                }
                if self.config.stall_on_chunk == Some(index) {
                    return;
                }
                if let Some(t) = self.transfer.as_mut() {
                    t.data.extend_from_slice(&body[4..]);
                }
                for _ in 0..self.config.waits_per_chunk {
                    self.reply_ack(AckFrame::Wait);
                }
                self.chunks_acked += 1;
                self.reply_ack(AckFrame::Ok(index));
            }
            TAG_XFER_END => match self.transfer.take() {
                Some(t) if t.data.len() == t.expected_len => {
                    if t.kind == 2 {
                        self.diags_loaded = true;
                    }
                    self.images.push((t.kind, t.data));
                    self.reply_ack(AckFrame::Ok(ACK_VALUE_CONTROL));
                }
                _ => self.reply_ack(AckFrame::Nak(2)),
            },
            _ => self.reply_ack(AckFrame::Nak(0xFF)),
        }
    }
}

/// Test-side handle onto the simulated device.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread may poison the lock; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every raw write the host made, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Serial currently stored on the device.
    pub fn serial(&self) -> String {
        self.lock().serial.clone()
    }

    /// Values received through `SN=`.
    pub fn serial_writes(&self) -> Vec<String> {
        self.lock().serial_writes.clone()
    }

    /// Completed image transfers as `(kind, bytes)`.
    pub fn images(&self) -> Vec<(u8, Vec<u8>)> {
        self.lock().images.clone()
    }

    pub fn exploited(&self) -> bool {
        self.lock().exploited
    }

    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    /// Pull the cable.
    pub fn disconnect(&self) {
        self.lock().drop_connection();
    }
}

/// Mock transport wired to a [`MockDevice`].
pub struct MockTransport {
    device: MockDevice,
}

impl MockTransport {
    pub fn new(config: MockDeviceConfig) -> Self {
        let serial = config.serial.clone();
        Self {
            device: MockDevice {
                state: Arc::new(Mutex::new(DeviceState {
                    config,
                    serial,
                    connected: false,
                    exploited: false,
                    diags_loaded: false,
                    chunks_acked: 0,
                    transfer: None,
                    images: Vec::new(),
                    writes: Vec::new(),
                    serial_writes: Vec::new(),
                    open_count: 0,
                    tx: None,
                })),
            },
        }
    }

    pub fn device(&self) -> MockDevice {
        self.device.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(MockDeviceConfig::default())
    }
}

impl SerialTransport for MockTransport {
    fn open(&mut self, _port: &PortDescriptor) -> Result<Receiver<RxEvent>, TransportError> {
        let mut state = self.device.lock();
        if state.tx.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let (tx, rx) = mpsc::channel();
        state.tx = Some(tx);
        state.connected = true;
        state.open_count += 1;
        Ok(rx)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.device.lock();
        if !state.connected {
            return Err(TransportError::ConnectionLost);
        }
        state.writes.push(data.to_vec());
        state.handle(data);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.device.lock();
        state.tx = None;
        state.connected = false;
    }

    fn is_open(&self) -> bool {
        self.device.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Command, ImageKind};
    use crate::transport::link::{CancelToken, Link};
    use std::time::Duration;

    const T: Duration = Duration::from_millis(100);

    fn open(t: &mut MockTransport) -> Link {
        let rx = t.open(&PortDescriptor::new("mock")).unwrap();
        Link::new(rx, CancelToken::new())
    }

    #[test]
    fn test_model_query() {
        let mut t = MockTransport::default();
        let mut link = open(&mut t);
        t.send(&Command::QueryModel.encode()).unwrap();
        assert_eq!(link.read_line(T).unwrap(), "MODEL J680AP");
    }

    #[test]
    fn test_second_open_rejected() {
        let mut t = MockTransport::default();
        let _link = open(&mut t);
        assert_eq!(
            t.open(&PortDescriptor::new("mock")).unwrap_err(),
            TransportError::AlreadyConnected
        );
        t.close();
        assert!(t.open(&PortDescriptor::new("mock")).is_ok());
        assert_eq!(t.device().open_count(), 2);
    }

    #[test]
    fn test_serial_requires_diagnostics() {
        let mut t = MockTransport::default();
        let mut link = open(&mut t);
        t.send(&Command::ReadSerial.encode()).unwrap();
        assert!(link.read_line(T).unwrap().starts_with("ERR"));
    }

    #[test]
    fn test_transfer_flow() {
        let mut t = MockTransport::new(MockDeviceConfig {
            waits_per_chunk: 1,
            ..Default::default()
        });
        let mut link = open(&mut t);
        t.send(&Command::Exploit(vec![0xEE]).encode()).unwrap();
        assert_eq!(
            AckFrame::from_bytes(&link.read_exact(8, T).unwrap()).unwrap(),
            AckFrame::Ok(ACK_VALUE_CONTROL)
        );
        t.send(
            &Command::TransferBegin {
                kind: ImageKind::Diagnostics,
                total_len: 3,
                chunk_count: 1,
            }
            .encode(),
        )
        .unwrap();
        link.read_exact(8, T).unwrap();
        t.send(
            &Command::TransferChunk {
                index: 0,
                data: vec![1, 2, 3],
            }
            .encode(),
        )
        .unwrap();
        assert_eq!(
            AckFrame::from_bytes(&link.read_exact(8, T).unwrap()).unwrap(),
            AckFrame::Wait
        );
        assert_eq!(
            AckFrame::from_bytes(&link.read_exact(8, T).unwrap()).unwrap(),
            AckFrame::Ok(0)
        );
        t.send(&Command::TransferEnd.encode()).unwrap();
        link.read_exact(8, T).unwrap();
        assert_eq!(t.device().images(), vec![(2, vec![1, 2, 3])]);
    }

    #[test]
    fn test_disconnect() {
        let mut t = MockTransport::default();
        let mut link = open(&mut t);
        t.device().disconnect();
        assert!(!t.is_open());
        assert_eq!(t.send(b"SN?\r\n"), Err(TransportError::ConnectionLost));
        assert!(link.poll().is_err());
    }
}
