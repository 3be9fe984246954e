//! ISO-TP (ISO 15765-2) segmentation for the SBOOT dialogue
//!
//! The supplier bootloader speaks ISO-TP on 0x7E0/0x7E8 with 0x55 TX
//! padding. Only the classic addressing scheme and 8-byte frames are
//! needed; payloads stay well under the 4095-byte ceiling.

use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::link::can::{CanBus, Frame};

/// SBOOT request id.
pub const SBOOT_TX_ID: u16 = 0x7E0;
/// SBOOT response id.
pub const SBOOT_RX_ID: u16 = 0x7E8;
/// Fill byte for short TX frames.
pub const TX_PADDING: u8 = 0x55;

const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

const FLOW_CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// ISO-TP endpoint bound to a raw CAN bus for the duration of a dialogue.
pub struct IsoTpLink<'b> {
    bus: &'b mut dyn CanBus,
    tx_id: u16,
    rx_id: u16,
}

impl<'b> IsoTpLink<'b> {
    pub fn new(bus: &'b mut dyn CanBus) -> Self {
        Self { bus, tx_id: SBOOT_TX_ID, rx_id: SBOOT_RX_ID }
    }

    /// Send one ISO-TP PDU, segmenting as needed.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        trace!(len = payload.len(), "isotp tx");
        if payload.len() <= 7 {
            let mut data = [TX_PADDING; 8];
            data[0] = PCI_SINGLE | payload.len() as u8;
            data[1..1 + payload.len()].copy_from_slice(payload);
            return self.bus.send(&Frame::new(self.tx_id, &data));
        }

        let mut data = [TX_PADDING; 8];
        data[0] = PCI_FIRST | ((payload.len() >> 8) & 0x0F) as u8;
        data[1] = (payload.len() & 0xFF) as u8;
        data[2..8].copy_from_slice(&payload[..6]);
        self.bus.send(&Frame::new(self.tx_id, &data))?;

        let st_min = self.wait_flow_control()?;
        let mut sequence: u8 = 1;
        for chunk in payload[6..].chunks(7) {
            let mut data = [TX_PADDING; 8];
            data[0] = PCI_CONSECUTIVE | (sequence & 0x0F);
            data[1..1 + chunk.len()].copy_from_slice(chunk);
            self.bus.send(&Frame::new(self.tx_id, &data))?;
            sequence = sequence.wrapping_add(1);
            if !st_min.is_zero() {
                thread::sleep(st_min);
            }
        }
        Ok(())
    }

    /// Wait for one reassembled ISO-TP PDU from the peer.
    pub fn wait_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let first = match self.recv_from_peer(timeout)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        if first.data.is_empty() {
            return Err(Error::ShortFrame(0));
        }
        match first.data[0] & 0xF0 {
            PCI_SINGLE => {
                let len = (first.data[0] & 0x0F) as usize;
                if first.data.len() < 1 + len {
                    return Err(Error::ShortFrame(first.data.len()));
                }
                Ok(Some(first.data[1..1 + len].to_vec()))
            }
            PCI_FIRST => {
                if first.data.len() < 2 {
                    return Err(Error::ShortFrame(first.data.len()));
                }
                let len =
                    (((first.data[0] & 0x0F) as usize) << 8) | first.data[1] as usize;
                let mut payload = Vec::with_capacity(len);
                payload.extend_from_slice(&first.data[2..]);

                // Clear to send, no block limit, no minimum separation.
                let mut fc = [TX_PADDING; 8];
                fc[0] = PCI_FLOW_CONTROL;
                fc[1] = 0x00;
                fc[2] = 0x00;
                self.bus.send(&Frame::new(self.tx_id, &fc))?;

                let mut expected: u8 = 1;
                while payload.len() < len {
                    let frame = self
                        .recv_from_peer(timeout)?
                        .ok_or(Error::HandshakeTimeout("ISO-TP consecutive frame"))?;
                    if frame.data.is_empty() {
                        return Err(Error::ShortFrame(0));
                    }
                    let got = frame.data[0] & 0x0F;
                    if frame.data[0] & 0xF0 != PCI_CONSECUTIVE || got != expected & 0x0F {
                        return Err(Error::SequenceMismatch { expected: expected & 0x0F, got });
                    }
                    payload.extend_from_slice(&frame.data[1..]);
                    expected = expected.wrapping_add(1);
                }
                payload.truncate(len);
                debug!(len, "isotp rx");
                Ok(Some(payload))
            }
            other => Err(Error::UnknownStatus(other)),
        }
    }

    fn wait_flow_control(&mut self) -> Result<Duration> {
        let frame = self
            .recv_from_peer(FLOW_CONTROL_TIMEOUT)?
            .ok_or(Error::HandshakeTimeout("ISO-TP flow control"))?;
        if frame.data.is_empty() || frame.data[0] & 0xF0 != PCI_FLOW_CONTROL {
            return Err(Error::UnknownStatus(*frame.data.first().unwrap_or(&0)));
        }
        let st_min = frame.data.get(2).copied().unwrap_or(0);
        // 0x00..0x7F are milliseconds; the 100-us encodings are treated as 1 ms.
        let st_min = if st_min <= 0x7F {
            Duration::from_millis(st_min as u64)
        } else {
            Duration::from_millis(1)
        };
        Ok(st_min)
    }

    /// Next frame from the peer id, skipping error frames and other traffic.
    fn recv_from_peer(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        loop {
            match self.bus.recv(timeout)? {
                Some(frame) if frame.is_error => continue,
                Some(frame) if frame.id == self.rx_id => return Ok(Some(frame)),
                Some(frame) => {
                    trace!(id = frame.id, "ignoring frame from foreign id");
                    continue;
                }
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Loopback bus: records sent frames, serves queued replies.
    struct LoopBus {
        sent: Vec<Frame>,
        replies: VecDeque<Frame>,
    }

    impl LoopBus {
        fn new() -> Self {
            Self { sent: Vec::new(), replies: VecDeque::new() }
        }

        fn queue(&mut self, id: u16, data: &[u8]) {
            self.replies.push_back(Frame::new(id, data));
        }
    }

    impl CanBus for LoopBus {
        fn send(&mut self, frame: &Frame) -> Result<()> {
            self.sent.push(frame.clone());
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Option<Frame>> {
            Ok(self.replies.pop_front())
        }
    }

    #[test]
    fn test_single_frame_send_is_padded() {
        let mut bus = LoopBus::new();
        let mut link = IsoTpLink::new(&mut bus);
        link.send(&[0x54]).unwrap();
        assert_eq!(bus.sent.len(), 1);
        assert_eq!(bus.sent[0].id, SBOOT_TX_ID);
        assert_eq!(bus.sent[0].data, vec![0x01, 0x54, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55]);
    }

    #[test]
    fn test_multi_frame_send_waits_for_flow_control() {
        let mut bus = LoopBus::new();
        bus.queue(SBOOT_RX_ID, &[0x30, 0x00, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]);
        let payload: Vec<u8> = (0..13).collect();
        let mut link = IsoTpLink::new(&mut bus);
        link.send(&payload).unwrap();
        assert_eq!(bus.sent.len(), 2);
        assert_eq!(bus.sent[0].data[0], 0x10);
        assert_eq!(bus.sent[0].data[1], 13);
        assert_eq!(bus.sent[0].data[2..8], payload[..6]);
        assert_eq!(bus.sent[1].data[0], 0x21);
        assert_eq!(bus.sent[1].data[1..8], payload[6..13]);
    }

    #[test]
    fn test_wait_frame_reassembles_first_and_consecutive() {
        let mut bus = LoopBus::new();
        let payload: Vec<u8> = (0..17).collect();
        let mut ff = vec![0x10, 17];
        ff.extend_from_slice(&payload[..6]);
        bus.queue(SBOOT_RX_ID, &ff);
        let mut cf1 = vec![0x21];
        cf1.extend_from_slice(&payload[6..13]);
        bus.queue(SBOOT_RX_ID, &cf1);
        let mut cf2 = vec![0x22];
        cf2.extend_from_slice(&payload[13..17]);
        cf2.extend_from_slice(&[0xAA, 0xAA, 0xAA]);
        bus.queue(SBOOT_RX_ID, &cf2);

        let mut link = IsoTpLink::new(&mut bus);
        let got = link.wait_frame(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(got, payload);
        // A flow-control frame went out between FF and CF1.
        assert_eq!(bus.sent.len(), 1);
        assert_eq!(bus.sent[0].data[0], 0x30);
    }

    #[test]
    fn test_wait_frame_rejects_sequence_gap() {
        let mut bus = LoopBus::new();
        bus.queue(SBOOT_RX_ID, &[0x10, 0x10, 0, 1, 2, 3, 4, 5]);
        bus.queue(SBOOT_RX_ID, &[0x23, 6, 7, 8, 9, 10, 11, 12]);
        let mut link = IsoTpLink::new(&mut bus);
        match link.wait_frame(Duration::from_millis(10)) {
            Err(Error::SequenceMismatch { expected: 1, got: 3 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_foreign_ids_are_skipped() {
        let mut bus = LoopBus::new();
        bus.queue(0x0A7, &[0xFF]);
        bus.queue(SBOOT_RX_ID, &[0x01, 0xA0]);
        let mut link = IsoTpLink::new(&mut bus);
        let got = link.wait_frame(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(got, vec![0xA0]);
    }
}
