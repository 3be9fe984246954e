//! Raw Classical CAN access
//!
//! Thin wrapper over the kernel socketcan stack: blocking receive with a
//! timeout, non-blocking send, error frames surfaced through a flag so
//! callers can filter them from the stream. The bus must run at 500 kbit/s;
//! bitrate is interface configuration, not tool configuration.

use std::time::Duration;

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Id, Socket, StandardId};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A Classical CAN frame with an 11-bit id and up to 8 data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub data: Vec<u8>,
    pub is_error: bool,
}

impl Frame {
    pub fn new(id: u16, data: &[u8]) -> Self {
        Self { id, data: data.to_vec(), is_error: false }
    }

    /// First data byte, the status/opcode position of every reply.
    pub fn first_byte(&self) -> Option<u8> {
        self.data.first().copied()
    }
}

/// Blocking send/receive on a single CAN channel.
pub trait CanBus {
    fn send(&mut self, frame: &Frame) -> Result<()>;
    /// Wait up to `timeout` for one frame; `None` when the window elapses.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>>;
}

/// SocketCAN-backed bus.
pub struct SocketCanBus {
    socket: CanSocket,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface)
            .map_err(|e| Error::Io(std::io::Error::other(format!("open {interface}: {e}"))))?;
        debug!(interface, "opened CAN socket");
        Ok(Self { socket })
    }
}

impl CanBus for SocketCanBus {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        let id = StandardId::new(frame.id).ok_or(Error::UnexpectedId(frame.id))?;
        let can_frame =
            CanFrame::new(id, &frame.data).ok_or(Error::ShortFrame(frame.data.len()))?;
        self.socket.write_frame(&can_frame)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        match self.socket.read_frame_timeout(timeout) {
            Ok(can_frame) => Ok(Some(convert(can_frame))),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn convert(can_frame: CanFrame) -> Frame {
    let is_error = matches!(can_frame, CanFrame::Error(_));
    if is_error {
        warn!("error frame on the bus");
    }
    let id = match can_frame.id() {
        Id::Standard(id) => id.as_raw(),
        // 29-bit traffic is never ours; keep the low bits for logging.
        Id::Extended(id) => (id.as_raw() & 0x7FF) as u16,
    };
    Frame { id, data: can_frame.data().to_vec(), is_error }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_first_byte() {
        assert_eq!(Frame::new(0xC0, &[0x55, 0x00]).first_byte(), Some(0x55));
        assert_eq!(Frame::new(0xC0, &[]).first_byte(), None);
    }
}
