//! Framed BSL transport state machines
//!
//! Command/status exchange, the page programming sequence and the two
//! paged read flavors. Every non-0x55 status aborts the operation at hand;
//! the validator reboot semantics make device-side retries unsafe, so none
//! are attempted.

use std::io::Write;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::bsl::frame::{
    self, CommandPair, PasswordScope, BSL_CMD_ID, LZ4_BLOCK_HINT, READ_CHUNK_ACK,
    READ_PAYLOAD_PER_FRAME, SELF_TEST_REPLY,
};
use crate::error::{Error, Result, BSL_SUCCESS};
use crate::flash::PFLASH_PAGE_SIZE;
use crate::link::{CanBus, Frame};

/// Status after program header and end-of-transmission.
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);
/// Program-ack and verification-ack after each page.
const PAGE_ACK_TIMEOUT: Duration = Duration::from_millis(500);
/// Single-word reads and paged read traffic; erase and verify can take a
/// while on a tired flash.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Client half of the framed BSL protocol.
pub struct BslClient<'b> {
    bus: &'b mut dyn CanBus,
}

impl<'b> BslClient<'b> {
    pub fn new(bus: &'b mut dyn CanBus) -> Self {
        Self { bus }
    }

    fn send_pair(&mut self, pair: &CommandPair) -> Result<()> {
        trace!(first = ?pair.first, second = ?pair.second, "bsl command");
        self.bus.send(&Frame::new(BSL_CMD_ID, &pair.first))?;
        self.bus.send(&Frame::new(BSL_CMD_ID, &pair.second))?;
        Ok(())
    }

    /// Next non-error frame, or a timeout error naming `what`.
    fn recv_data(&mut self, timeout: Duration, what: &'static str) -> Result<Frame> {
        loop {
            match self.bus.recv(timeout)? {
                Some(frame) if frame.is_error => continue,
                Some(frame) => return Ok(frame),
                None => return Err(Error::HandshakeTimeout(what)),
            }
        }
    }

    /// Receive one status frame and map its first byte.
    fn expect_status(&mut self, timeout: Duration, what: &'static str) -> Result<()> {
        let frame = self.recv_data(timeout, what)?;
        let status = frame.first_byte().ok_or(Error::ShortFrame(0))?;
        debug!(status = format_args!("{status:#04x}"), what, "bsl status");
        match Error::from_status(status) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Read 32 bits from an arbitrary address.
    pub fn read32(&mut self, addr: u32) -> Result<u32> {
        self.send_pair(&frame::read32(addr))?;
        let reply = self.recv_data(READ_TIMEOUT, "read reply")?;
        if reply.data.len() < 4 {
            return Err(Error::ShortFrame(reply.data.len()));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&reply.data[..4]);
        Ok(u32::from_le_bytes(word))
    }

    /// Liveness check; a healthy stage-two loader answers with a fixed
    /// marker pattern.
    pub fn self_test(&mut self) -> Result<[u8; 8]> {
        self.send_pair(&frame::self_test())?;
        let reply = self.recv_data(READ_TIMEOUT, "self test reply")?;
        if reply.data.len() < 8 {
            return Err(Error::ShortFrame(reply.data.len()));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&reply.data[..8]);
        if bytes != SELF_TEST_REPLY {
            debug!(reply = ?bytes, "unexpected self test pattern");
        }
        Ok(bytes)
    }

    /// Submit a password pair for the given protection scope.
    pub fn send_passwords(&mut self, pw1: u32, pw2: u32, scope: PasswordScope) -> Result<()> {
        info!(?scope, "submitting flash passwords");
        self.send_pair(&frame::passwords(pw1, pw2, scope))?;
        self.expect_status(READ_TIMEOUT, "password ack")
    }

    /// Erase `size` bytes of flash starting at the sector at `addr`.
    pub fn erase(&mut self, addr: u32, size: u32) -> Result<()> {
        info!(addr = format_args!("{addr:#010x}"), size = format_args!("{size:#x}"), "erasing");
        self.send_pair(&frame::erase(addr, size))?;
        self.expect_status(READ_TIMEOUT, "erase ack")
    }

    /// Open a page programming stream at `addr`.
    pub fn program_header(&mut self, addr: u32) -> Result<()> {
        self.send_pair(&frame::program_header(addr))?;
        self.expect_status(STATUS_TIMEOUT, "program header ack")
    }

    /// Push one page and wait for both the program ack and the
    /// verification ack. Any non-success on either surfaces as a
    /// programming failure for this page.
    pub fn write_page(&mut self, page: &[u8; PFLASH_PAGE_SIZE]) -> Result<()> {
        for data in frame::page_frames(page) {
            self.bus.send(&Frame::new(BSL_CMD_ID, &data))?;
        }
        let program_ack = self.recv_data(PAGE_ACK_TIMEOUT, "program ack")?;
        let verify_ack = self.recv_data(PAGE_ACK_TIMEOUT, "verification ack")?;
        let ok = program_ack.first_byte() == Some(BSL_SUCCESS)
            && verify_ack.first_byte() == Some(BSL_SUCCESS);
        if !ok {
            debug!(?program_ack, ?verify_ack, "page rejected");
            return Err(Error::Program);
        }
        Ok(())
    }

    /// Close a page programming stream.
    pub fn end_of_transmission(&mut self) -> Result<()> {
        self.send_pair(&frame::end_of_transmission())?;
        self.expect_status(STATUS_TIMEOUT, "end of transmission ack")
    }

    /// LZ4-compressed read of `size` bytes at `addr` into `out`.
    /// `progress` is fed decompressed byte counts as chunks are verified.
    pub fn read_compressed(
        &mut self,
        addr: u32,
        size: u32,
        out: &mut dyn Write,
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        self.send_pair(&frame::read_compressed(addr, size))?;
        let mut remaining = size as usize;
        while remaining > 0 {
            let compressed_len = self.read_chunk_descriptor(frame::opcode::READ_COMPRESSED)?;
            let chunk = self.read_chunk_payload(compressed_len)?;
            let data = lz4_flex::block::decompress(&chunk, LZ4_BLOCK_HINT)?;
            out.write_all(&data)?;
            progress(data.len());
            remaining = remaining.saturating_sub(data.len());
            self.bus.send(&Frame::new(BSL_CMD_ID, &READ_CHUNK_ACK))?;
        }
        Ok(())
    }

    /// Uncompressed read; chunks arrive in fixed 256-byte units padded
    /// with 0xAA filler that is discarded here.
    pub fn read_uncompressed(
        &mut self,
        addr: u32,
        size: u32,
        out: &mut dyn Write,
        progress: &mut dyn FnMut(usize),
    ) -> Result<()> {
        self.send_pair(&frame::read_uncompressed(addr, size))?;
        let mut remaining = size as usize;
        while remaining > 0 {
            let chunk_len = self.read_chunk_descriptor(frame::opcode::READ_UNCOMPRESSED)?;
            let chunk = self.read_chunk_payload(chunk_len)?;
            out.write_all(&chunk)?;
            progress(chunk.len());
            remaining = remaining.saturating_sub(chunk.len());
            self.bus.send(&Frame::new(BSL_CMD_ID, &READ_CHUNK_ACK))?;
        }
        Ok(())
    }

    /// Chunk descriptor: opcode echo, big-endian source address, 3-byte
    /// big-endian chunk length. A status byte in the opcode position means
    /// the device aborted the read.
    fn read_chunk_descriptor(&mut self, op: u8) -> Result<usize> {
        let frame = self.recv_data(READ_TIMEOUT, "chunk descriptor")?;
        if frame.data.len() < 8 {
            return Err(Error::ShortFrame(frame.data.len()));
        }
        if frame.data[0] != op {
            return Err(Error::from_status(frame.data[0]).unwrap_or(Error::UnknownStatus(op)));
        }
        let src = u32::from_be_bytes([frame.data[1], frame.data[2], frame.data[3], frame.data[4]]);
        let len = u32::from_be_bytes([0, frame.data[5], frame.data[6], frame.data[7]]) as usize;
        debug!(src = format_args!("{src:#010x}"), len, "chunk descriptor");
        Ok(len)
    }

    /// Collect `len` payload bytes from sequence-numbered frames, dropping
    /// whatever filler rides in the tail of the final frame. The counter
    /// starts at 1 and wraps modulo 256; any gap is fatal for the transfer,
    /// nothing before the gap is trusted.
    fn read_chunk_payload(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(len + READ_PAYLOAD_PER_FRAME);
        let mut sequence: u8 = 1;
        while payload.len() < len {
            let frame = self.recv_data(READ_TIMEOUT, "chunk data")?;
            if frame.data.len() < 8 {
                return Err(Error::ShortFrame(frame.data.len()));
            }
            if frame.data[1] != sequence {
                return Err(Error::SequenceMismatch { expected: sequence, got: frame.data[1] });
            }
            trace!(sequence, "chunk frame");
            sequence = sequence.wrapping_add(1);
            payload.extend_from_slice(&frame.data[2..8]);
        }
        payload.truncate(len);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::TargetVariant;
    use crate::sim::SimEcu;

    fn ready_sim() -> SimEcu {
        let sim = SimEcu::new(TargetVariant::Simos8);
        sim.force_bsl_ready();
        sim
    }

    #[test]
    fn test_read32_round_trip() {
        let mut sim = ready_sim();
        sim.poke_word(0xC03F_D488, 0x8001_430C);
        assert_eq!(BslClient::new(&mut sim).read32(0xC03F_D488).unwrap(), 0x8001_430C);
    }

    #[test]
    fn test_self_test_pattern() {
        let mut sim = ready_sim();
        assert_eq!(BslClient::new(&mut sim).self_test().unwrap(), SELF_TEST_REPLY);
    }

    #[test]
    fn test_erase_maps_status() {
        let mut sim = ready_sim();
        sim.set_status_override(0xFB);
        match BslClient::new(&mut sim).erase(0xA004_0000, 0x4_0000) {
            Err(Error::Erase) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_compressed_read_matches_memory() {
        let mut sim = ready_sim();
        sim.fill(0xA004_0000, &[0xFF; 0x100]);
        let mut out = Vec::new();
        BslClient::new(&mut sim)
            .read_compressed(0xA004_0000, 0x100, &mut out, &mut |_| {})
            .unwrap();
        assert_eq!(out, vec![0xFF; 0x100]);
    }

    #[test]
    fn test_compressed_read_emits_single_ack_per_chunk() {
        // One 256-byte request = one chunk = exactly one 07 AC ack.
        let mut sim = ready_sim();
        sim.fill(0xA004_0000, &[0xFF; 0x100]);
        let mut out = Vec::new();
        BslClient::new(&mut sim)
            .read_compressed(0xA004_0000, 0x100, &mut out, &mut |_| {})
            .unwrap();
        assert_eq!(sim.read_acks(), 1);
    }

    #[test]
    fn test_compressed_read_spanning_chunks() {
        let mut sim = ready_sim();
        sim.set_read_chunk_size(0x100);
        let pattern: Vec<u8> = (0..0x180u32).map(|i| (i * 7) as u8).collect();
        sim.fill(0xA008_0000, &pattern);
        let mut out = Vec::new();
        BslClient::new(&mut sim)
            .read_compressed(0xA008_0000, 0x180, &mut out, &mut |_| {})
            .unwrap();
        assert_eq!(out, pattern);
        assert_eq!(sim.read_acks(), 2);
    }

    #[test]
    fn test_sequence_gap_aborts_at_chunk_boundary() {
        let mut sim = ready_sim();
        let pattern: Vec<u8> = (0..0x200u32).map(|i| i as u8).collect();
        sim.fill(0xA004_0000, &pattern);
        sim.set_drop_seq_frame_in_chunk(1); // second chunk loses a frame
        let mut out = Vec::new();
        let result = BslClient::new(&mut sim).read_uncompressed(
            0xA004_0000,
            0x200,
            &mut out,
            &mut |_| {},
        );
        match result {
            Err(Error::SequenceMismatch { expected: 2, got: 3 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        // Output holds exactly the verified first chunk.
        assert_eq!(out, pattern[..0x100]);
    }

    #[test]
    fn test_page_write_failure_is_program_error() {
        let mut sim = ready_sim();
        sim.set_page_status_override(0, 0xFA);
        let mut client = BslClient::new(&mut sim);
        client.program_header(0xA004_0000).unwrap();
        match client.write_page(&[0u8; PFLASH_PAGE_SIZE]) {
            Err(Error::Program) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
