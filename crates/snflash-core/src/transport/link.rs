//! Receive-side buffering and reply framing over an [`RxEvent`] stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::traits::{RxEvent, TransportError};
use crate::protocol::constants::MAX_LINE_LEN;

/// Longest single blocking wait, so cancellation is noticed promptly.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Cancelled")]
    Cancelled,
}

/// Buffered view of the receive stream of one open connection.
pub struct Link {
    rx: Receiver<RxEvent>,
    buf: Vec<u8>,
    closed: bool,
    cancel: CancelToken,
}

impl Link {
    pub fn new(rx: Receiver<RxEvent>, cancel: CancelToken) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            closed: false,
            cancel,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes received but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pull whatever already arrived without blocking. Reports a closed
    /// stream as [`TransportError::ConnectionLost`].
    pub fn poll(&mut self) -> Result<(), LinkError> {
        if self.cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        loop {
            match self.rx.try_recv() {
                Ok(RxEvent::Data(data)) => self.buf.extend_from_slice(&data),
                Ok(RxEvent::Closed) | Err(TryRecvError::Disconnected) => {
                    return Err(self.mark_closed());
                }
                Err(TryRecvError::Empty) => return Ok(()),
            }
        }
    }

    /// Drop stale bytes left over from earlier exchanges.
    pub fn discard_pending(&mut self) -> Result<usize, LinkError> {
        self.poll()?;
        let n = self.buf.len();
        self.buf.clear();
        Ok(n)
    }

    /// Wait for the next line. The terminator (`\n`, optionally preceded by
    /// `\r`) is stripped. A run of more than [`MAX_LINE_LEN`] bytes without
    /// a terminator is returned as-is so the caller can reject it.
    pub fn read_line(&mut self, timeout: Duration) -> Result<String, LinkError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = &raw[..raw.len() - 1];
                let text = text.strip_suffix(b"\r").unwrap_or(text);
                return Ok(String::from_utf8_lossy(text).into_owned());
            }
            if self.buf.len() > MAX_LINE_LEN {
                let raw: Vec<u8> = self.buf.drain(..).collect();
                return Ok(String::from_utf8_lossy(&raw).into_owned());
            }
            self.fill(deadline, timeout)?;
        }
    }

    /// Wait for exactly `len` bytes.
    pub fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        while self.buf.len() < len {
            self.fill(deadline, timeout)?;
        }
        Ok(self.buf.drain(..len).collect())
    }

    /// A closed stream is terminal: nothing buffered before the close is served.
    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.closed {
            return Err(TransportError::ConnectionLost.into());
        }
        Ok(())
    }

    fn mark_closed(&mut self) -> LinkError {
        self.closed = true;
        self.buf.clear();
        TransportError::ConnectionLost.into()
    }

    fn fill(&mut self, deadline: Instant, timeout: Duration) -> Result<(), LinkError> {
        self.ensure_open()?;
        loop {
            if self.cancel.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }
            match self.rx.recv_timeout((deadline - now).min(POLL_SLICE)) {
                Ok(RxEvent::Data(data)) => {
                    self.buf.extend_from_slice(&data);
                    return Ok(());
                }
                Ok(RxEvent::Closed) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.mark_closed());
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const T: Duration = Duration::from_millis(200);

    #[test]
    fn test_line_split_across_chunks() {
        let (tx, rx) = mpsc::channel();
        let mut link = Link::new(rx, CancelToken::new());
        tx.send(RxEvent::Data(b"MOD".to_vec())).unwrap();
        tx.send(RxEvent::Data(b"EL J680\r\nSN ".to_vec())).unwrap();
        assert_eq!(link.read_line(T).unwrap(), "MODEL J680");
        assert_eq!(link.pending(), 3);
    }

    #[test]
    fn test_bare_newline() {
        let (tx, rx) = mpsc::channel();
        let mut link = Link::new(rx, CancelToken::new());
        tx.send(RxEvent::Data(b"OK\n".to_vec())).unwrap();
        assert_eq!(link.read_line(T).unwrap(), "OK");
    }

    #[test]
    fn test_read_exact() {
        let (tx, rx) = mpsc::channel();
        let mut link = Link::new(rx, CancelToken::new());
        tx.send(RxEvent::Data(b"ACK \x01".to_vec())).unwrap();
        tx.send(RxEvent::Data(b"\x00\x00\x00WAIT".to_vec())).unwrap();
        assert_eq!(link.read_exact(8, T).unwrap(), b"ACK \x01\x00\x00\x00");
        assert_eq!(link.pending(), 4);
    }

    #[test]
    fn test_timeout() {
        let (_tx, rx) = mpsc::channel();
        let mut link = Link::new(rx, CancelToken::new());
        assert_eq!(
            link.read_line(Duration::from_millis(30)),
            Err(LinkError::Transport(TransportError::Timeout { timeout_ms: 30 }))
        );
    }

    #[test]
    fn test_closed_event_is_connection_lost() {
        let (tx, rx) = mpsc::channel();
        let mut link = Link::new(rx, CancelToken::new());
        tx.send(RxEvent::Data(b"partial".to_vec())).unwrap();
        tx.send(RxEvent::Closed).unwrap();
        assert_eq!(
            link.read_line(T),
            Err(LinkError::Transport(TransportError::ConnectionLost))
        );
        assert!(link.is_closed());
        // Terminal: later reads fail the same way.
        assert_eq!(
            link.read_exact(1, T),
            Err(LinkError::Transport(TransportError::ConnectionLost))
        );
    }

    #[test]
    fn test_buffered_line_not_served_after_close() {
        let (tx, rx) = mpsc::channel();
        let mut link = Link::new(rx, CancelToken::new());
        tx.send(RxEvent::Data(b"SN C02123ABCQ6L\r\n".to_vec())).unwrap();
        tx.send(RxEvent::Closed).unwrap();
        assert_eq!(
            link.poll(),
            Err(LinkError::Transport(TransportError::ConnectionLost))
        );
        assert_eq!(link.pending(), 0);
        assert_eq!(
            link.read_line(T),
            Err(LinkError::Transport(TransportError::ConnectionLost))
        );
        assert_eq!(
            link.read_exact(0, T),
            Err(LinkError::Transport(TransportError::ConnectionLost))
        );
    }

    #[test]
    fn test_dropped_sender_is_connection_lost() {
        let (tx, rx) = mpsc::channel::<RxEvent>();
        drop(tx);
        let mut link = Link::new(rx, CancelToken::new());
        assert_eq!(
            link.poll(),
            Err(LinkError::Transport(TransportError::ConnectionLost))
        );
    }

    #[test]
    fn test_cancel() {
        let (_tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let mut link = Link::new(rx, cancel.clone());
        cancel.cancel();
        assert_eq!(link.read_line(T), Err(LinkError::Cancelled));
    }

    #[test]
    fn test_overlong_line_returned() {
        let (tx, rx) = mpsc::channel();
        let mut link = Link::new(rx, CancelToken::new());
        tx.send(RxEvent::Data(vec![b'x'; MAX_LINE_LEN + 1])).unwrap();
        assert_eq!(link.read_line(T).unwrap().len(), MAX_LINE_LEN + 1);
    }

    #[test]
    fn test_discard_pending() {
        let (tx, rx) = mpsc::channel();
        let mut link = Link::new(rx, CancelToken::new());
        tx.send(RxEvent::Data(b"noise".to_vec())).unwrap();
        assert_eq!(link.discard_pending().unwrap(), 5);
        assert_eq!(link.pending(), 0);
    }
}
