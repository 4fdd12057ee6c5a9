//! Concrete transports (C1): owns the raw byte stream, reassembles complete
//! application messages, and forwards them to the single-threaded
//! dispatcher loop over a bounded channel — the host's realization of the
//! source's dedicated I/O thread plus cross-thread signal.
//!
//! Platform-specific USB/HID device enumeration is out of scope; the HID
//! variant here frames over any `AsyncRead + AsyncWrite` byte stream (in
//! production that would be a HID report stream, in tests an in-memory
//! duplex pipe), which is the packet read/write primitive this crate needs
//! to own regardless of what sits underneath it.

use shared::transport::{
    HidFrame, HidReassembler, StreamReassembler, HID_FRAME_SIZE, STREAM_FRAME_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// One reassembled application message, or a fatal transport loss.
///
/// `flip` is `Some` for HID-mode messages, carrying the flip bit decoded off
/// the wire so the dispatcher can discard stale replies. Stream-mode
/// messages (local socket / BLE) carry no flip bit on the wire at all, so
/// `flip` is `None` there and the dispatcher accepts them on command match
/// alone.
#[derive(Debug)]
pub enum TransportEvent {
    Message {
        command: u8,
        payload: Vec<u8>,
        flip: Option<bool>,
    },
    Lost,
}

/// The only two operations a transport exposes to the rest of the driver.
pub trait TransportWriter: Send {
    /// Writes one already-framed wire frame (see [`shared::protocol::MessageProtocol::create_packets`]).
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

pub struct StreamWriter<W> {
    write_half: W,
}

impl<W: AsyncWrite + Unpin + Send> TransportWriter for StreamWriter<W> {
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.write_half.write_all(frame).await
    }
}

/// Splits a byte stream into a [`StreamWriter`] and an event channel fed by
/// a background task reassembling HID-mode frames.
pub fn spawn_hid_transport<S>(stream: S) -> (StreamWriter<impl AsyncWrite + Unpin + Send>, mpsc::Receiver<TransportEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut read_half = read_half;
        let mut reassembler = HidReassembler::new();
        let mut buf = [0u8; HID_FRAME_SIZE];
        loop {
            match read_half.read_exact(&mut buf).await {
                Ok(_) => {
                    let frame = match HidFrame::decode(&buf) {
                        Ok(f) => f,
                        Err(_) => {
                            let _ = tx.send(TransportEvent::Lost).await;
                            return;
                        }
                    };
                    if let Some((command, flip, payload)) = reassembler.push(frame) {
                        if tx
                            .send(TransportEvent::Message { command, payload, flip: Some(flip) })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(_) => {
                    let _ = tx.send(TransportEvent::Lost).await;
                    return;
                }
            }
        }
    });
    (StreamWriter { write_half }, rx)
}

/// Splits a byte stream into a [`StreamWriter`] and an event channel fed by
/// a background task reassembling stream-mode (local socket / BLE) frames.
pub fn spawn_stream_transport<S>(stream: S) -> (StreamWriter<impl AsyncWrite + Unpin + Send>, mpsc::Receiver<TransportEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut read_half = read_half;
        let mut reassembler = StreamReassembler::new();
        let mut buf = [0u8; STREAM_FRAME_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = tx.send(TransportEvent::Lost).await;
                    return;
                }
                Ok(n) => {
                    for message in reassembler.push(&buf[..n]) {
                        let Some((command, payload)) =
                            shared::protocol::decode_stream_message(&message)
                        else {
                            continue;
                        };
                        if tx
                            .send(TransportEvent::Message { command, payload, flip: None })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(_) => {
                    let _ = tx.send(TransportEvent::Lost).await;
                    return;
                }
            }
        }
    });
    (StreamWriter { write_half }, rx)
}
