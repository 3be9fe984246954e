//! In-memory ECU simulator for the test suite
//!
//! Plays both roles the bench hardware would: the supplier bootloader
//! (timed handshake, ISO-TP service shell, CRC validator scratch area) and
//! the CAN-resident stage-two loader (framed command protocol backed by a
//! sparse byte memory). Fault injection knobs cover the failure paths the
//! drivers must survive.
//!
//! The simulator is a cheap cloneable handle over shared state so tests
//! can keep inspecting it after moving a clone into a [`Device`].

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::bsl::frame::{
    opcode, xor_checksum, BSL_CMD_ID, BSL_INIT_ACK_ID, BSL_INIT_ID, LEGACY_DATA_ID,
    SELF_TEST_REPLY,
};
use crate::config::Config;
use crate::device::Device;
use crate::error::{Result, BSL_SUCCESS};
use crate::flash::TargetVariant;
use crate::hw::{LineDriver, Operator};
use crate::link::isotp::{SBOOT_RX_ID, SBOOT_TX_ID};
use crate::link::{CanBus, Frame};
use crate::oracle::ProbeResult;
use crate::solver::{BootPasswords, KeySolver, PreimageSolver};

const ERASED: u8 = 0xFF;
/// Filler the device pads the tail of uncompressed chunk frames with.
const UNCOMPRESSED_FILLER: u8 = 0xAA;

#[derive(Debug, Default)]
struct SbootState {
    /// ISO-TP reassembly of the current request.
    rx_buf: Vec<u8>,
    rx_expected: usize,
    /// Consecutive frames still owed to the driver.
    tx_pending: VecDeque<Frame>,
    /// Validator scratch area writes, keyed by offset.
    cfg_writes: BTreeMap<u8, Vec<u8>>,
}

#[derive(Debug, PartialEq)]
enum BslState {
    /// Mask ROM waiting for the init frame.
    NotReady,
    /// Consuming the raw image stream.
    Uploading { frames_left: usize },
    /// Stage-two loader accepting framed commands.
    Ready,
    /// First frame of a command pair stashed.
    HalfCommand { first: [u8; 8] },
    /// Consuming page data after a program header.
    PageStream { addr: u32, buf: Vec<[u8; 8]> },
    /// Chunked read underway, waiting for the per-chunk ack.
    AwaitingReadAck { op: u8, addr: u32, remaining: u32 },
}

struct SimState {
    variant: TargetVariant,
    memory: BTreeMap<u32, u8>,
    outbox: VecDeque<Frame>,
    sboot: SbootState,
    bsl: BslState,
    uploaded_image: Vec<u8>,

    // Scripted behavior.
    seed: Vec<u8>,
    silent_handshake: bool,
    status_override: Option<u8>,
    page_status_override: Option<(usize, u8)>,
    read_chunk_size: usize,
    drop_seq_frame_in_chunk: Option<usize>,
    chunk_index: usize,
    probe_results: BTreeMap<u32, (u32, u32)>,

    // Counters and records.
    handshake_recv_calls: usize,
    in_handshake: bool,
    inductions: usize,
    upload_inits: usize,
    read_acks: usize,
    pages_written: usize,
    erases: Vec<(u32, u32)>,
    passwords: Vec<[u8; 16]>,
    sboot_pdus: Vec<Vec<u8>>,
}

impl SimState {
    fn new(variant: TargetVariant) -> Self {
        Self {
            variant,
            memory: BTreeMap::new(),
            outbox: VecDeque::new(),
            sboot: SbootState::default(),
            bsl: BslState::NotReady,
            uploaded_image: Vec::new(),
            seed: vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x11, 0x22, 0x33],
            silent_handshake: false,
            status_override: None,
            page_status_override: None,
            read_chunk_size: 0x1000,
            drop_seq_frame_in_chunk: None,
            chunk_index: 0,
            probe_results: BTreeMap::new(),
            handshake_recv_calls: 0,
            in_handshake: false,
            inductions: 0,
            upload_inits: 0,
            read_acks: 0,
            pages_written: 0,
            erases: Vec::new(),
            passwords: Vec::new(),
            sboot_pdus: Vec::new(),
        }
    }

    fn reply(&mut self, id: u16, data: &[u8]) {
        self.outbox.push_back(Frame::new(id, data));
    }

    fn read_byte(&self, addr: u32) -> u8 {
        *self.memory.get(&addr).unwrap_or(&ERASED)
    }

    fn read_word(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.read_byte(addr),
            self.read_byte(addr + 1),
            self.read_byte(addr + 2),
            self.read_byte(addr + 3),
        ])
    }

    fn write_word(&mut self, addr: u32, value: u32) {
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.memory.insert(addr + i as u32, *b);
        }
    }

    fn status_byte(&mut self) -> u8 {
        self.status_override.take().unwrap_or(BSL_SUCCESS)
    }

    // --- frame dispatch -------------------------------------------------

    fn handle(&mut self, f: &Frame) {
        match f.id {
            SBOOT_TX_ID => self.handle_sboot(f),
            BSL_INIT_ID => self.handle_init(f),
            BSL_CMD_ID => self.handle_bsl(f),
            LEGACY_DATA_ID => self.handle_legacy(f),
            _ => {}
        }
    }

    // --- SBOOT side -----------------------------------------------------

    fn handle_sboot(&mut self, f: &Frame) {
        // Raw handshake traffic before the ISO-TP shell opens.
        if f.data == [0x59, 0x45] {
            self.inductions += 1;
            self.in_handshake = true;
            if !self.silent_handshake {
                self.reply(SBOOT_RX_ID, &[0xA0]);
            }
            return;
        }
        if f.data == [0x6B] {
            if !self.silent_handshake {
                self.reply(SBOOT_RX_ID, &[0xA0]);
            }
            return;
        }

        self.in_handshake = false;
        if f.data.is_empty() {
            return;
        }
        match f.data[0] & 0xF0 {
            0x00 => {
                let len = (f.data[0] & 0x0F) as usize;
                let pdu = f.data[1..1 + len.min(f.data.len() - 1)].to_vec();
                self.handle_sboot_pdu(pdu);
            }
            0x10 => {
                self.sboot.rx_expected =
                    (((f.data[0] & 0x0F) as usize) << 8) | f.data[1] as usize;
                self.sboot.rx_buf = f.data[2..].to_vec();
                // Clear to send.
                self.reply(SBOOT_RX_ID, &[0x30, 0x00, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]);
            }
            0x20 => {
                self.sboot.rx_buf.extend_from_slice(&f.data[1..]);
                if self.sboot.rx_buf.len() >= self.sboot.rx_expected {
                    let mut pdu = std::mem::take(&mut self.sboot.rx_buf);
                    pdu.truncate(self.sboot.rx_expected);
                    self.handle_sboot_pdu(pdu);
                }
            }
            0x30 => {
                // Driver flow control: flush the rest of a pending response.
                while let Some(frame) = self.sboot.tx_pending.pop_front() {
                    self.outbox.push_back(frame);
                }
            }
            _ => {}
        }
    }

    fn send_sboot_pdu(&mut self, payload: &[u8]) {
        if payload.len() <= 7 {
            let mut data = vec![payload.len() as u8];
            data.extend_from_slice(payload);
            self.reply(SBOOT_RX_ID, &data);
            return;
        }
        let mut data = vec![0x10 | ((payload.len() >> 8) & 0x0F) as u8, payload.len() as u8];
        data.extend_from_slice(&payload[..6]);
        self.reply(SBOOT_RX_ID, &data);
        let mut sequence = 1u8;
        for chunk in payload[6..].chunks(7) {
            let mut cf = vec![0x20 | (sequence & 0x0F)];
            cf.extend_from_slice(chunk);
            self.sboot.tx_pending.push_back(Frame::new(SBOOT_RX_ID, &cf));
            sequence = sequence.wrapping_add(1);
        }
    }

    fn handle_sboot_pdu(&mut self, pdu: Vec<u8>) {
        self.sboot_pdus.push(pdu.clone());
        match pdu.first().copied() {
            Some(0x30) => self.send_sboot_pdu(&[0xA0]),
            Some(0x54) => {
                // Nine header bytes, then the seed material.
                let mut payload = vec![0xA0];
                payload.extend_from_slice(&[0x00; 8]);
                let seed = self.seed.clone();
                payload.extend_from_slice(&seed);
                self.send_sboot_pdu(&payload);
            }
            Some(0x65) => self.send_sboot_pdu(&[0xA0]),
            Some(0x78) => {
                if pdu.len() >= 5 {
                    self.sboot.cfg_writes.insert(pdu[4], pdu[5..].to_vec());
                }
                self.send_sboot_pdu(&[0xA0]);
            }
            Some(0x79) => {
                // Validator trigger: arm the oracle result words for the
                // probed address and reboot out of the shell.
                if let Some(start) = self.cfg_write_word(0x0C) {
                    if let Some(&(end, crc)) = self.probe_results.get(&start) {
                        let (end_addr_loc, crc_loc) = self.variant.oracle_result_addrs();
                        self.write_word(end_addr_loc, end);
                        self.write_word(crc_loc, crc);
                    }
                }
                self.bsl = BslState::NotReady;
            }
            _ => {}
        }
    }

    fn cfg_write_word(&self, offset: u8) -> Option<u32> {
        let bytes = self.sboot.cfg_writes.get(&offset)?;
        if bytes.len() < 4 {
            return None;
        }
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    // --- BSL side -------------------------------------------------------

    fn handle_init(&mut self, f: &Frame) {
        if f.data.len() >= 8 && f.data[0] == 0x55 && f.data[1] == 0x55 {
            self.upload_inits += 1;
            self.uploaded_image.clear();
            let frames = u16::from_le_bytes([f.data[4], f.data[5]]) as usize;
            self.bsl = BslState::Uploading { frames_left: frames };
            self.reply(BSL_INIT_ACK_ID, &[0x01]);
        }
    }

    fn handle_bsl(&mut self, f: &Frame) {
        match std::mem::replace(&mut self.bsl, BslState::Ready) {
            BslState::NotReady => {
                self.bsl = BslState::NotReady;
            }
            BslState::Uploading { frames_left } => {
                self.uploaded_image.extend_from_slice(&f.data);
                if frames_left <= 1 {
                    self.bsl = BslState::Ready;
                } else {
                    self.bsl = BslState::Uploading { frames_left: frames_left - 1 };
                }
            }
            BslState::Ready => {
                self.bsl = BslState::HalfCommand { first: to_array(&f.data) };
            }
            BslState::HalfCommand { first } => {
                self.run_command(first, to_array(&f.data));
            }
            BslState::PageStream { addr, mut buf } => {
                if buf.is_empty() && f.data.first() == Some(&opcode::END_OF_TRANSMISSION) {
                    // Group opens with an EOT pair instead of page data.
                    self.bsl = BslState::HalfCommand { first: to_array(&f.data) };
                    return;
                }
                buf.push(to_array(&f.data));
                if buf.len() == 33 {
                    self.finish_page(addr, &buf);
                } else {
                    self.bsl = BslState::PageStream { addr, buf };
                }
            }
            BslState::AwaitingReadAck { op, addr, remaining } => {
                if f.data.len() >= 2 && f.data[0] == opcode::READ_COMPRESSED && f.data[1] == 0xAC {
                    self.read_acks += 1;
                    self.serve_chunk(op, addr, remaining);
                } else {
                    self.bsl = BslState::AwaitingReadAck { op, addr, remaining };
                }
            }
        }
    }

    fn run_command(&mut self, first: [u8; 8], second: [u8; 8]) {
        let mut record = [0u8; 16];
        record[..8].copy_from_slice(&first);
        record[8..].copy_from_slice(&second);
        if xor_checksum(&record[1..15]) != record[15] {
            self.reply(BSL_CMD_ID, &[0xFD]);
            return;
        }
        // End-of-transmission carries its marker in byte 0.
        if record[0] == opcode::END_OF_TRANSMISSION {
            let status = self.status_byte();
            self.reply(BSL_CMD_ID, &[status]);
            return;
        }
        let addr = u32::from_be_bytes([record[2], record[3], record[4], record[5]]);
        match record[1] {
            opcode::READ32 => {
                let value = self.read_word(addr);
                let mut data = value.to_le_bytes().to_vec();
                data.resize(8, 0x00);
                self.reply(BSL_CMD_ID, &data);
            }
            opcode::SELF_TEST => self.reply(BSL_CMD_ID, &SELF_TEST_REPLY),
            opcode::ERASE => {
                let size =
                    u32::from_le_bytes([record[6], record[7], record[8], record[9]]);
                self.erases.push((addr, size));
                let status = self.status_byte();
                if status == BSL_SUCCESS {
                    let mut a = addr;
                    while a < addr.saturating_add(size) {
                        self.memory.remove(&a);
                        a += 1;
                    }
                }
                self.reply(BSL_CMD_ID, &[status]);
            }
            opcode::PASSWORDS => {
                self.passwords.push(record);
                let status = self.status_byte();
                self.reply(BSL_CMD_ID, &[status, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]);
            }
            opcode::PROGRAM_HEADER => {
                let status = self.status_byte();
                self.reply(BSL_CMD_ID, &[status]);
                if status == BSL_SUCCESS {
                    self.bsl = BslState::PageStream { addr, buf: Vec::new() };
                }
            }
            opcode::READ_COMPRESSED | opcode::READ_UNCOMPRESSED => {
                let size =
                    u32::from_le_bytes([record[6], record[7], record[8], record[9]]);
                self.chunk_index = 0;
                self.serve_chunk(record[1], addr, size);
            }
            _ => self.reply(BSL_CMD_ID, &[0xFF]),
        }
    }

    fn finish_page(&mut self, addr: u32, frames: &[[u8; 8]]) {
        // Reassemble the 256 data bytes and check the trailing XOR.
        let mut page = Vec::with_capacity(256);
        page.extend_from_slice(&frames[0][2..8]);
        for frame in &frames[1..32] {
            page.extend_from_slice(frame);
        }
        page.extend_from_slice(&frames[32][..2]);

        let mut checksum = xor_checksum(&frames[0][1..]);
        for frame in &frames[1..32] {
            checksum ^= xor_checksum(frame);
        }
        checksum ^= xor_checksum(&frames[32][..7]);

        let page_index = self.pages_written;
        let mut program_status = if checksum == frames[32][7] { BSL_SUCCESS } else { 0xFD };
        let mut verify_status = BSL_SUCCESS;
        if let Some((index, status)) = self.page_status_override {
            if index == page_index {
                program_status = status;
                verify_status = status;
            }
        }

        if program_status == BSL_SUCCESS {
            for (i, b) in page.iter().enumerate() {
                self.memory.insert(addr + i as u32, *b);
            }
            self.pages_written += 1;
            self.bsl = BslState::PageStream {
                addr: addr + page.len() as u32,
                buf: Vec::new(),
            };
        } else {
            self.bsl = BslState::Ready;
        }
        self.reply(BSL_CMD_ID, &[program_status]);
        self.reply(BSL_CMD_ID, &[verify_status]);
    }

    /// Emit one chunk (descriptor plus sequenced payload frames) and wait
    /// for the driver's ack before the next.
    fn serve_chunk(&mut self, op: u8, addr: u32, remaining: u32) {
        if remaining == 0 {
            self.bsl = BslState::Ready;
            return;
        }
        let plain_len = match op {
            opcode::READ_UNCOMPRESSED => remaining.min(0x100),
            _ => remaining.min(self.read_chunk_size as u32),
        };
        let plain: Vec<u8> = (0..plain_len).map(|i| self.read_byte(addr + i)).collect();
        let (wire, filler): (Vec<u8>, u8) = match op {
            opcode::READ_COMPRESSED => (lz4_flex::block::compress(&plain), 0x00),
            _ => (plain.clone(), UNCOMPRESSED_FILLER),
        };

        let len_be = (wire.len() as u32).to_be_bytes();
        let mut descriptor = vec![op];
        descriptor.extend_from_slice(&addr.to_be_bytes());
        descriptor.extend_from_slice(&len_be[1..]);
        self.reply(BSL_CMD_ID, &descriptor);

        let dropped = self.drop_seq_frame_in_chunk == Some(self.chunk_index);
        let mut sequence = 1u8;
        for chunk in wire.chunks(6) {
            let mut data = vec![op, sequence];
            data.extend_from_slice(chunk);
            data.resize(8, filler);
            // Losing one frame desyncs the counter for the rest.
            if !(dropped && sequence == 2) {
                self.reply(BSL_CMD_ID, &data);
            }
            sequence = sequence.wrapping_add(1);
        }

        self.chunk_index += 1;
        self.bsl = BslState::AwaitingReadAck {
            op,
            addr: addr + plain_len,
            remaining: remaining - plain_len,
        };
    }

    // --- legacy side ----------------------------------------------------

    fn handle_legacy(&mut self, f: &Frame) {
        if f.data.is_empty() {
            return;
        }
        match f.data[0] {
            0x01 => {
                self.reply(LEGACY_DATA_ID, &[0x01, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
                self.reply(LEGACY_DATA_ID, &[0x01, 0x01, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC]);
            }
            0x02 => {
                let addr = u32::from_be_bytes([f.data[1], f.data[2], f.data[3], f.data[4]]);
                let mut data = vec![0x02];
                data.extend_from_slice(&self.read_word(addr).to_le_bytes());
                data.resize(8, 0x00);
                self.reply(LEGACY_DATA_ID, &data);
            }
            0x03 => self.reply(LEGACY_DATA_ID, &[0x03, 0, 0, 0, 0, 0, 0, 0]),
            0x04 => self.reply(LEGACY_DATA_ID, &[0x04, 0, 0, 0, 0, 0, 0, 0]),
            0x05 => self.reply(LEGACY_DATA_ID, &[0x05, 0, 0, 0, 0, 0, 0, 0]),
            _ => {}
        }
    }
}

fn to_array(data: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);
    out
}

/// Cloneable handle over the simulated ECU.
#[derive(Clone)]
pub(crate) struct SimEcu {
    state: Rc<RefCell<SimState>>,
}

impl SimEcu {
    pub fn new(variant: TargetVariant) -> Self {
        Self { state: Rc::new(RefCell::new(SimState::new(variant))) }
    }

    /// Skip induction and upload; the framed protocol answers immediately.
    pub fn force_bsl_ready(&self) {
        self.state.borrow_mut().bsl = BslState::Ready;
    }

    pub fn poke_word(&self, addr: u32, value: u32) {
        self.state.borrow_mut().write_word(addr, value);
    }

    pub fn fill(&self, addr: u32, bytes: &[u8]) {
        let mut state = self.state.borrow_mut();
        for (i, b) in bytes.iter().enumerate() {
            state.memory.insert(addr + i as u32, *b);
        }
    }

    pub fn memory_at(&self, addr: u32, len: usize) -> Vec<u8> {
        let state = self.state.borrow();
        (0..len as u32).map(|i| state.read_byte(addr + i)).collect()
    }

    pub fn set_status_override(&self, status: u8) {
        self.state.borrow_mut().status_override = Some(status);
    }

    pub fn set_page_status_override(&self, page: usize, status: u8) {
        self.state.borrow_mut().page_status_override = Some((page, status));
    }

    pub fn set_read_chunk_size(&self, size: usize) {
        self.state.borrow_mut().read_chunk_size = size;
    }

    pub fn set_drop_seq_frame_in_chunk(&self, chunk: usize) {
        self.state.borrow_mut().drop_seq_frame_in_chunk = Some(chunk);
    }

    pub fn set_silent_handshake(&self, silent: bool) {
        self.state.borrow_mut().silent_handshake = silent;
    }

    pub fn set_seed(&self, seed: &[u8]) {
        self.state.borrow_mut().seed = seed.to_vec();
    }

    pub fn set_probe_result(&self, start: u32, end: u32, crc: u32) {
        self.state.borrow_mut().probe_results.insert(start, (end, crc));
    }

    /// Inject an arbitrary frame into the outgoing queue.
    pub fn push_frame(&self, id: u16, data: &[u8]) {
        self.state.borrow_mut().outbox.push_back(Frame::new(id, data));
    }

    pub fn read_acks(&self) -> usize {
        self.state.borrow().read_acks
    }

    pub fn upload_inits(&self) -> usize {
        self.state.borrow().upload_inits
    }

    pub fn uploaded_image(&self) -> Vec<u8> {
        self.state.borrow().uploaded_image.clone()
    }

    pub fn inductions(&self) -> usize {
        self.state.borrow().inductions
    }

    pub fn handshake_recv_calls(&self) -> usize {
        self.state.borrow().handshake_recv_calls
    }

    pub fn pages_written(&self) -> usize {
        self.state.borrow().pages_written
    }

    pub fn erases(&self) -> Vec<(u32, u32)> {
        self.state.borrow().erases.clone()
    }

    pub fn sboot_pdus(&self) -> Vec<Vec<u8>> {
        self.state.borrow().sboot_pdus.clone()
    }

    pub fn cfg_write(&self, offset: u8) -> Option<Vec<u8>> {
        self.state.borrow().sboot.cfg_writes.get(&offset).cloned()
    }

    pub fn password_records(&self) -> Vec<[u8; 16]> {
        self.state.borrow().passwords.clone()
    }
}

impl CanBus for SimEcu {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        self.state.borrow_mut().handle(frame);
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> Result<Option<Frame>> {
        let mut state = self.state.borrow_mut();
        if state.in_handshake {
            state.handshake_recv_calls += 1;
        }
        Ok(state.outbox.pop_front())
    }
}

/// Line driver whose pulses and waveforms go nowhere.
#[derive(Default)]
pub(crate) struct NullLines;

impl LineDriver for NullLines {
    fn reset_pulse(&mut self) -> Result<()> {
        Ok(())
    }

    fn pwm_start(&mut self) -> Result<()> {
        Ok(())
    }

    fn pwm_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Operator that always confirms.
pub(crate) struct NullOperator;

impl Operator for NullOperator {
    fn acknowledge(&mut self, _prompt: &str) -> Result<()> {
        Ok(())
    }
}

/// Key solver returning a fixed key.
pub(crate) struct FixedKeySolver(pub [u8; 4]);

impl KeySolver for FixedKeySolver {
    fn key_for_seed(&self, _seed: &[u8]) -> Result<[u8; 4]> {
        Ok(self.0)
    }
}

/// Preimage solver recording its input and returning fixed passwords.
pub(crate) struct FixedPreimageSolver {
    pub passwords: [u32; 4],
    pub seen: Rc<RefCell<Vec<ProbeResult>>>,
}

impl PreimageSolver for FixedPreimageSolver {
    fn solve(&self, probes: &[ProbeResult]) -> Result<BootPasswords> {
        self.seen.borrow_mut().extend(probes.iter().cloned());
        Ok(BootPasswords(self.passwords))
    }
}

/// Assemble a [`Device`] whose bus is a clone of `sim` and whose other
/// collaborators are inert test doubles.
pub(crate) fn sim_device(sim: &SimEcu) -> Device {
    let mut config = Config::default();
    // Keep validator waits out of the test clock.
    config.crc_delay = Duration::from_micros(1);
    Device {
        bus: Box::new(sim.clone()),
        lines: Box::new(NullLines::default()),
        operator: Box::new(NullOperator),
        key_solver: Box::new(FixedKeySolver([0x11, 0x22, 0x33, 0x44])),
        crc_solver: Box::new(FixedPreimageSolver {
            passwords: [0, 0, 0, 0],
            seen: Rc::new(RefCell::new(Vec::new())),
        }),
        config,
        variant: sim.state.borrow().variant,
    }
}
