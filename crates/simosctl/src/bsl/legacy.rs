//! Single-frame BSL transport of the Simos 18 generation
//!
//! The older loader listens on id 0x300 and echoes the opcode in the first
//! byte of every reply. No frame pairing, no XOR checksum; integrity rests
//! on CAN's own CRC. Compressed reads share the sequence/ack discipline of
//! the framed protocol.

use std::io::Write;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::bsl::frame::{LEGACY_DATA_ID, LZ4_BLOCK_HINT};
use crate::error::{Error, Result};
use crate::link::{CanBus, Frame};

mod op {
    pub const DEVICE_ID: u8 = 0x01;
    pub const READ32: u8 = 0x02;
    pub const WRITE32: u8 = 0x03;
    pub const PASSWORDS: u8 = 0x04;
    pub const ERASE: u8 = 0x05;
    pub const READ_COMPRESSED: u8 = 0x07;
}

/// Read flag for password submission on this transport.
const PASSWORD_READ_FLAG: u8 = 0x08;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

fn send(bus: &mut dyn CanBus, data: &[u8; 8]) -> Result<()> {
    trace!(?data, "legacy command");
    bus.send(&Frame::new(LEGACY_DATA_ID, data))
}

fn recv(bus: &mut dyn CanBus, what: &'static str) -> Result<Frame> {
    loop {
        match bus.recv(REPLY_TIMEOUT)? {
            Some(frame) if frame.is_error => continue,
            Some(frame) if frame.data.len() < 8 => return Err(Error::ShortFrame(frame.data.len())),
            Some(frame) => return Ok(frame),
            None => return Err(Error::HandshakeTimeout(what)),
        }
    }
}

fn addr_command(op: u8, addr: u32) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0] = op;
    data[1..5].copy_from_slice(&addr.to_be_bytes());
    data
}

/// Read the 12-byte Tricore device identifier.
pub fn device_id(bus: &mut dyn CanBus) -> Result<Vec<u8>> {
    send(bus, &[op::DEVICE_ID, 0, 0, 0, 0, 0, 0, 0])?;
    let mut id = Vec::with_capacity(12);
    let first = recv(bus, "device id")?;
    if first.data[0] == op::DEVICE_ID {
        id.extend_from_slice(&first.data[2..8]);
    }
    let second = recv(bus, "device id")?;
    if second.data[0] == op::DEVICE_ID && second.data[1] == 0x01 {
        id.extend_from_slice(&second.data[2..8]);
    }
    Ok(id)
}

/// Read 32 bits from an arbitrary address.
pub fn read32(bus: &mut dyn CanBus, addr: u32) -> Result<u32> {
    send(bus, &addr_command(op::READ32, addr))?;
    let reply = recv(bus, "read reply")?;
    if reply.data[0] != op::READ32 {
        return Err(Error::UnknownStatus(reply.data[0]));
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&reply.data[1..5]);
    Ok(u32::from_le_bytes(word))
}

/// Write 32 bits to an arbitrary address: address frame, then value frame,
/// each acknowledged with an opcode echo.
pub fn write32(bus: &mut dyn CanBus, addr: u32, value: u32) -> Result<()> {
    send(bus, &addr_command(op::WRITE32, addr))?;
    let ack = recv(bus, "write address ack")?;
    if ack.data[0] != op::WRITE32 {
        return Err(Error::UnknownStatus(ack.data[0]));
    }
    let mut data = [0u8; 8];
    data[0] = op::WRITE32;
    data[1..5].copy_from_slice(&value.to_be_bytes());
    send(bus, &data)?;
    let ack = recv(bus, "write value ack")?;
    if ack.data[0] != op::WRITE32 {
        return Err(Error::UnknownStatus(ack.data[0]));
    }
    Ok(())
}

/// Submit the read password pair: each word goes out twice, the second
/// round carrying the confirm flag.
pub fn send_read_passwords(bus: &mut dyn CanBus, pw1: u32, pw2: u32) -> Result<()> {
    info!("submitting read passwords");
    for confirm in [0x00, 0x01] {
        let mut data = [0u8; 8];
        data[0] = op::PASSWORDS;
        data[1..5].copy_from_slice(&pw1.to_le_bytes());
        data[5] = PASSWORD_READ_FLAG;
        data[6] = 0x00; // UCB selector
        data[7] = confirm;
        send(bus, &data)?;
        let ack = recv(bus, "password ack")?;
        debug!(?ack, "password frame ack");

        let mut data = [0u8; 8];
        data[0] = op::PASSWORDS;
        data[1..5].copy_from_slice(&pw2.to_le_bytes());
        send(bus, &data)?;
        let ack = recv(bus, "password ack")?;
        debug!(?ack, "password frame ack");
    }
    Ok(())
}

/// Erase the sector starting at `addr`. The sector length is implied by
/// the on-chip sector map on this transport.
pub fn erase_sector(bus: &mut dyn CanBus, addr: u32) -> Result<()> {
    info!(addr = format_args!("{addr:#010x}"), "erasing sector");
    send(bus, &addr_command(op::ERASE, addr))?;
    let ack = recv(bus, "erase ack")?;
    debug!(?ack, "erase ack");
    Ok(())
}

/// LZ4-compressed read of `size` bytes at `addr`; `size` must fit the
/// 3-byte length field.
pub fn read_compressed(
    bus: &mut dyn CanBus,
    addr: u32,
    size: u32,
    out: &mut dyn Write,
    progress: &mut dyn FnMut(usize),
) -> Result<()> {
    if size > 0x00FF_FFFF {
        return Err(Error::Unsupported("legacy reads are limited to 3-byte lengths"));
    }
    let mut data = [0u8; 8];
    data[0] = op::READ_COMPRESSED;
    data[1..5].copy_from_slice(&addr.to_be_bytes());
    data[5..8].copy_from_slice(&size.to_be_bytes()[1..]);
    send(bus, &data)?;

    let mut remaining = size as usize;
    while remaining > 0 {
        let descriptor = recv(bus, "chunk descriptor")?;
        if descriptor.data[0] != op::READ_COMPRESSED {
            return Err(Error::from_status(descriptor.data[0])
                .unwrap_or(Error::UnknownStatus(descriptor.data[0])));
        }
        let compressed_len = u32::from_be_bytes([
            0,
            descriptor.data[5],
            descriptor.data[6],
            descriptor.data[7],
        ]) as usize;
        let mut payload = Vec::with_capacity(compressed_len + 6);
        let mut sequence: u8 = 1;
        while payload.len() < compressed_len {
            let frame = recv(bus, "chunk data")?;
            if frame.data[1] != sequence {
                return Err(Error::SequenceMismatch { expected: sequence, got: frame.data[1] });
            }
            sequence = sequence.wrapping_add(1);
            payload.extend_from_slice(&frame.data[2..8]);
        }
        payload.truncate(compressed_len);
        let chunk = lz4_flex::block::decompress(&payload, LZ4_BLOCK_HINT)?;
        out.write_all(&chunk)?;
        progress(chunk.len());
        remaining = remaining.saturating_sub(chunk.len());
        bus.send(&Frame::new(LEGACY_DATA_ID, &[op::READ_COMPRESSED, 0xAC]))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct LoopBus {
        sent: Vec<Frame>,
        replies: VecDeque<Frame>,
    }

    impl LoopBus {
        fn new() -> Self {
            Self { sent: Vec::new(), replies: VecDeque::new() }
        }

        fn queue(&mut self, data: &[u8]) {
            self.replies.push_back(Frame::new(LEGACY_DATA_ID, data));
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
    fn test_read32_parses_little_endian_word() {
        let mut bus = LoopBus::new();
        bus.queue(&[0x02, 0x70, 0x07, 0x01, 0xD0, 0x00, 0x00, 0x00]);
        let value = read32(&mut bus, 0xD001_0770).unwrap();
        assert_eq!(value, 0xD001_0770);
        assert_eq!(bus.sent[0].data, vec![0x02, 0xD0, 0x01, 0x07, 0x70, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_write32_needs_both_acks() {
        let mut bus = LoopBus::new();
        bus.queue(&[0x03, 0, 0, 0, 0, 0, 0, 0]);
        bus.queue(&[0x03, 0, 0, 0, 0, 0, 0, 0]);
        write32(&mut bus, 0xD000_0010, 0x1234_5678).unwrap();
        assert_eq!(bus.sent.len(), 2);
        assert_eq!(bus.sent[1].data[1..5], 0x1234_5678u32.to_be_bytes());
    }

    #[test]
    fn test_write32_rejects_bad_ack() {
        let mut bus = LoopBus::new();
        bus.queue(&[0xFF, 0, 0, 0, 0, 0, 0, 0]);
        match write32(&mut bus, 0xD000_0010, 0) {
            Err(Error::UnknownStatus(0xFF)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_device_id_concatenates_two_frames() {
        let mut bus = LoopBus::new();
        bus.queue(&[0x01, 0x00, 1, 2, 3, 4, 5, 6]);
        bus.queue(&[0x01, 0x01, 7, 8, 9, 10, 11, 12]);
        let id = device_id(&mut bus).unwrap();
        assert_eq!(id, (1..=12).collect::<Vec<u8>>());
    }

    #[test]
    fn test_password_frames_carry_confirm_flag() {
        let mut bus = LoopBus::new();
        for _ in 0..4 {
            bus.queue(&[0x04, 0, 0, 0, 0, 0, 0, 0]);
        }
        send_read_passwords(&mut bus, 0x53B6_495B, 0x8E1F_FEB1).unwrap();
        assert_eq!(bus.sent.len(), 4);
        assert_eq!(bus.sent[0].data[5..8], [PASSWORD_READ_FLAG, 0x00, 0x00]);
        assert_eq!(bus.sent[2].data[5..8], [PASSWORD_READ_FLAG, 0x00, 0x01]);
        assert_eq!(bus.sent[0].data[1..5], 0x53B6_495Bu32.to_le_bytes());
    }

    #[test]
    fn test_compressed_read_single_chunk() {
        let mut bus = LoopBus::new();
        let plain = vec![0xFF; 64];
        let packed = lz4_flex::block::compress(&plain);
        let len = packed.len();
        bus.queue(&[0x07, 0xA0, 0x04, 0x00, 0x00, 0x00, 0x00, len as u8]);
        let mut sequence = 1u8;
        for chunk in packed.chunks(6) {
            let mut data = vec![0x07, sequence];
            data.extend_from_slice(chunk);
            data.resize(8, 0x00);
            bus.queue(&data);
            sequence = sequence.wrapping_add(1);
        }
        let mut out = Vec::new();
        read_compressed(&mut bus, 0xA004_0000, 64, &mut out, &mut |_| {}).unwrap();
        assert_eq!(out, plain);
        // Request plus the closing ack.
        assert_eq!(bus.sent.last().unwrap().data, vec![0x07, 0xAC]);
    }
}
