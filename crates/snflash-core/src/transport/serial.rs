//! serialport-based transport implementation.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serialport::{SerialPort, SerialPortType};
use tracing::{debug, info, instrument, warn};

use super::traits::{PortDescriptor, PortKind, RxEvent, SerialTransport, TransportError};
use crate::config::DEFAULT_ACK_TIMEOUT_MS;

/// How long a single blocking read may sit before re-checking the stop flag.
const READ_POLL: Duration = Duration::from_millis(50);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS);
const RX_BUFFER_SIZE: usize = 1024;

/// List serial ports visible to the OS.
pub fn available_ports() -> Result<Vec<PortDescriptor>, TransportError> {
    let ports = serialport::available_ports()
        .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

    Ok(ports
        .into_iter()
        .map(|info| {
            let (kind, product) = match info.port_type {
                SerialPortType::UsbPort(usb) => (
                    PortKind::Usb {
                        vid: usb.vid,
                        pid: usb.pid,
                    },
                    usb.product,
                ),
                SerialPortType::PciPort => (PortKind::Pci, None),
                SerialPortType::BluetoothPort => (PortKind::Bluetooth, None),
                SerialPortType::Unknown => (PortKind::Unknown, None),
            };
            PortDescriptor {
                name: info.port_name,
                kind,
                product,
            }
        })
        .collect())
}

/// Pick the configured port by name, or else the first USB serial port.
pub fn select_port<'a>(
    ports: &'a [PortDescriptor],
    preferred: Option<&str>,
) -> Option<&'a PortDescriptor> {
    match preferred {
        Some(name) => ports.iter().find(|p| p.name == name),
        None => ports.iter().find(|p| p.is_usb()),
    }
}

/// Serial transport backed by the `serialport` crate.
///
/// A background thread owns a cloned handle for reading and forwards every
/// chunk into the receive channel.
pub struct SerialPortTransport {
    baud_rate: u32,
    write_timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl SerialPortTransport {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            port: None,
            reader: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bound on a single blocking write. Reads keep their own short poll.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }
}

fn write_error(e: io::Error, write_timeout: Duration) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut => TransportError::Timeout {
            timeout_ms: write_timeout.as_millis() as u64,
        },
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionAborted => TransportError::ConnectionLost,
        _ => TransportError::WriteFailed(e.to_string()),
    }
}

impl SerialTransport for SerialPortTransport {
    #[instrument(
        skip(self),
        fields(
            port = %port.name,
            baud = self.baud_rate,
            write_timeout_ms = self.write_timeout.as_millis() as u64,
        )
    )]
    fn open(&mut self, port: &PortDescriptor) -> Result<Receiver<RxEvent>, TransportError> {
        if self.port.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let open_failed = |e: serialport::Error| {
            TransportError::OpenFailed(format!("{}: {}", port.name, e))
        };
        let handle = serialport::new(&port.name, self.baud_rate)
            .timeout(self.write_timeout)
            .open()
            .map_err(open_failed)?;
        let mut rx_handle = handle.try_clone().map_err(open_failed)?;
        rx_handle.set_timeout(READ_POLL).map_err(open_failed)?;

        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let reader = thread::Builder::new()
            .name("snflash-rx".into())
            .spawn(move || {
                let mut buf = [0u8; RX_BUFFER_SIZE];
                while !flag.load(Ordering::Relaxed) {
                    match rx_handle.read(&mut buf) {
                        Ok(0) => {
                            let _ = tx.send(RxEvent::Closed);
                            break;
                        }
                        Ok(n) => {
                            if tx.send(RxEvent::Data(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                            ) => {}
                        Err(e) => {
                            warn!(error = %e, "Serial read failed, closing stream");
                            let _ = tx.send(RxEvent::Closed);
                            break;
                        }
                    }
                }
                debug!("Reader thread exiting");
            })
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!("Port opened");
        self.port = Some(handle);
        self.reader = Some(reader);
        self.stop = stop;
        Ok(rx)
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let write_timeout = self.write_timeout;
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| write_error(e, write_timeout))?;
        debug!(bytes_written = data.len(), "Write complete");
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.port.take().is_some() {
            info!("Port closed");
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialPortTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str) -> PortDescriptor {
        PortDescriptor {
            name: name.into(),
            kind: PortKind::Usb {
                vid: 0x05AC,
                pid: 0x1881,
            },
            product: Some("Debug UART".into()),
        }
    }

    #[test]
    fn test_select_first_usb() {
        let ports = vec![PortDescriptor::new("/dev/ttyS0"), usb("/dev/ttyUSB0")];
        assert_eq!(select_port(&ports, None).unwrap().name, "/dev/ttyUSB0");
    }

    #[test]
    fn test_select_by_name() {
        let ports = vec![usb("/dev/ttyUSB0"), PortDescriptor::new("/dev/ttyS0")];
        assert_eq!(
            select_port(&ports, Some("/dev/ttyS0")).unwrap().name,
            "/dev/ttyS0"
        );
        assert!(select_port(&ports, Some("/dev/missing")).is_none());
    }

    #[test]
    fn test_send_without_open() {
        let mut t = SerialPortTransport::new(115_200);
        assert!(!t.is_open());
        assert_eq!(t.send(b"x"), Err(TransportError::NotConnected));
        t.close();
    }

    #[test]
    fn test_write_timeout_separate_from_read_poll() {
        let t = SerialPortTransport::new(115_200);
        assert_eq!(t.write_timeout(), Duration::from_secs(5));
        assert!(t.write_timeout() > READ_POLL);

        let t = t.with_write_timeout(Duration::from_millis(1_500));
        assert_eq!(t.write_timeout(), Duration::from_millis(1_500));
    }

    #[test]
    fn test_write_error_mapping() {
        let timeout = Duration::from_millis(1_500);
        assert_eq!(
            write_error(io::Error::from(io::ErrorKind::TimedOut), timeout),
            TransportError::Timeout { timeout_ms: 1_500 }
        );
        assert_eq!(
            write_error(io::Error::from(io::ErrorKind::BrokenPipe), timeout),
            TransportError::ConnectionLost
        );
        assert!(matches!(
            write_error(io::Error::other("framing"), timeout),
            TransportError::WriteFailed(_)
        ));
    }

    #[test]
    fn test_descriptor_display() {
        assert_eq!(
            usb("/dev/ttyUSB0").to_string(),
            "/dev/ttyUSB0 [USB 05AC:1881 Debug UART]"
        );
        assert_eq!(PortDescriptor::new("COM3").to_string(), "COM3");
    }
}
