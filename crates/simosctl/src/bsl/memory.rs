//! High-level memory operations over the BSL transports
//!
//! Dispatches on the target variant: Simos 8 speaks the framed protocol on
//! id 0xC0, Simos 18 the single-frame transport on id 0x300. File-backed
//! dumps and programming live here, together with whole-region erasure.
//! Read passwords must be submitted before reads of protected flash, write
//! passwords before any erase or program sequence.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use indicatif::ProgressBar;
use tracing::{info, warn};

use crate::bsl::frame::PasswordScope;
use crate::bsl::legacy;
use crate::bsl::protocol::BslClient;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::flash::{FlashRegion, TargetVariant, PFLASH_PAGE_SIZE, SIMOS8_ASW, SIMOS8_CAL, SIMOS8_CBOOT};

/// Read 32 bits from an arbitrary address.
pub fn read32(dev: &mut Device, addr: u32) -> Result<u32> {
    match dev.variant {
        TargetVariant::Simos8 => BslClient::new(dev.bus.as_mut()).read32(addr),
        TargetVariant::Simos18 => legacy::read32(dev.bus.as_mut(), addr),
    }
}

/// Write 32 bits to an arbitrary address.
pub fn write32(dev: &mut Device, addr: u32, value: u32) -> Result<()> {
    match dev.variant {
        TargetVariant::Simos8 => {
            Err(Error::Unsupported("32-bit writes are only available on the Simos 18 transport"))
        }
        TargetVariant::Simos18 => legacy::write32(dev.bus.as_mut(), addr, value),
    }
}

/// Run the BSL self test; only the framed transport answers it.
pub fn self_test(dev: &mut Device) -> Result<[u8; 8]> {
    match dev.variant {
        TargetVariant::Simos8 => BslClient::new(dev.bus.as_mut()).self_test(),
        TargetVariant::Simos18 => {
            Err(Error::Unsupported("the self test opcode needs the framed transport"))
        }
    }
}

/// Read the device identifier (Simos 18 transport only).
pub fn device_id(dev: &mut Device) -> Result<Vec<u8>> {
    match dev.variant {
        TargetVariant::Simos8 => {
            Err(Error::Unsupported("device id readout needs the Simos 18 transport"))
        }
        TargetVariant::Simos18 => legacy::device_id(dev.bus.as_mut()),
    }
}

/// Submit a password pair for the given scope.
pub fn send_passwords(dev: &mut Device, pw1: u32, pw2: u32, scope: PasswordScope) -> Result<()> {
    match dev.variant {
        TargetVariant::Simos8 => BslClient::new(dev.bus.as_mut()).send_passwords(pw1, pw2, scope),
        TargetVariant::Simos18 => match scope {
            PasswordScope::Read => legacy::send_read_passwords(dev.bus.as_mut(), pw1, pw2),
            PasswordScope::Write => Err(Error::Unsupported(
                "write-password submission is only wired up on the framed transport",
            )),
        },
    }
}

/// Dump `size` bytes starting at `base` to `path`, one 32-bit read at a
/// time. Slow but works against any readable address space.
pub fn dump_memory(dev: &mut Device, base: u32, size: u32, path: &Path) -> Result<()> {
    let mut out = File::create(path)?;
    info!(base = format_args!("{base:#010x}"), size = format_args!("{size:#x}"), "dumping memory");
    let bar = ProgressBar::new(size as u64);
    let mut addr = base;
    while addr < base.saturating_add(size) {
        let word = read32(dev, addr)?;
        out.write_all(&word.to_le_bytes())?;
        bar.inc(4);
        addr += 4;
    }
    bar.finish();
    Ok(())
}

/// LZ4-compressed dump. Output is opened in append mode so an interrupted
/// dump can be resumed at the last verified chunk.
pub fn read_compressed(dev: &mut Device, addr: u32, size: u32, path: &Path) -> Result<()> {
    let mut out = OpenOptions::new().create(true).append(true).open(path)?;
    let bar = ProgressBar::new(size as u64);
    let result = {
        let mut progress = |n: usize| bar.inc(n as u64);
        match dev.variant {
            TargetVariant::Simos8 => BslClient::new(dev.bus.as_mut())
                .read_compressed(addr, size, &mut out, &mut progress),
            TargetVariant::Simos18 => {
                legacy::read_compressed(dev.bus.as_mut(), addr, size, &mut out, &mut progress)
            }
        }
    };
    finish_or_abandon(bar, result)
}

/// Uncompressed dump in fixed 256-byte chunks; framed transport only.
pub fn read_uncompressed(dev: &mut Device, addr: u32, size: u32, path: &Path) -> Result<()> {
    if dev.variant != TargetVariant::Simos8 {
        return Err(Error::Unsupported("uncompressed reads need the framed transport"));
    }
    let mut out = OpenOptions::new().create(true).append(true).open(path)?;
    let bar = ProgressBar::new(size as u64);
    let result = {
        let mut progress = |n: usize| bar.inc(n as u64);
        BslClient::new(dev.bus.as_mut()).read_uncompressed(addr, size, &mut out, &mut progress)
    };
    finish_or_abandon(bar, result)
}

/// Erase one flash sector described by address and length.
pub fn erase_sector(dev: &mut Device, addr: u32, size: u32) -> Result<()> {
    match dev.variant {
        TargetVariant::Simos8 => BslClient::new(dev.bus.as_mut()).erase(addr, size),
        TargetVariant::Simos18 => {
            // Sector length is implied by the on-chip map on this transport.
            legacy::erase_sector(dev.bus.as_mut(), addr)
        }
    }
}

fn erase_regions(dev: &mut Device, name: &str, regions: &[FlashRegion]) -> Result<()> {
    if dev.variant != TargetVariant::Simos8 {
        return Err(Error::Unsupported("region erase maps are defined for Simos 8 only"));
    }
    for region in regions {
        if let Err(e) = BslClient::new(dev.bus.as_mut()).erase(region.base, region.size) {
            warn!(
                name,
                base = format_args!("{:#010x}", region.base),
                "region erase failed: {e}"
            );
            println!("Error erasing {name} sector at {:#010x}!", region.base);
            return Err(e);
        }
    }
    info!(name, "region erased");
    println!("Successfully erased {name}!");
    Ok(())
}

/// Erase the three application software sectors.
pub fn erase_asw(dev: &mut Device) -> Result<()> {
    erase_regions(dev, "ASW", &SIMOS8_ASW)
}

/// Erase the calibration area.
pub fn erase_cal(dev: &mut Device) -> Result<()> {
    erase_regions(dev, "CAL", &[SIMOS8_CAL])
}

/// Erase the customer bootloader.
pub fn erase_cboot(dev: &mut Device) -> Result<()> {
    erase_regions(dev, "CBOOT", &[SIMOS8_CBOOT])
}

/// Program `size` bytes from `path` (starting at `offset` in the file) to
/// flash at `addr`. The final partial page is zero-padded. Any rejected
/// page aborts the stream with the device still mid-transfer; recover by
/// erasing and reprogramming.
pub fn program_file(
    dev: &mut Device,
    addr: u32,
    size: u32,
    path: &Path,
    offset: u64,
) -> Result<()> {
    if dev.variant != TargetVariant::Simos8 {
        return Err(Error::Unsupported("file programming needs the framed transport"));
    }
    let mut input = File::open(path)?;
    input.seek(SeekFrom::Start(offset))?;
    info!(
        addr = format_args!("{addr:#010x}"),
        size = format_args!("{size:#x}"),
        path = %path.display(),
        offset,
        "programming file"
    );

    let mut client = BslClient::new(dev.bus.as_mut());
    client.program_header(addr)?;

    let bar = ProgressBar::new(size as u64);
    let mut remaining = size as usize;
    let result = loop {
        if remaining == 0 {
            break Ok(());
        }
        let want = remaining.min(PFLASH_PAGE_SIZE);
        let mut page = [0u8; PFLASH_PAGE_SIZE];
        let got = read_fully(&mut input, &mut page[..want])?;
        if got == 0 {
            break Ok(());
        }
        if got < PFLASH_PAGE_SIZE {
            info!("padding final partial page with 0x00");
            println!("Got partially filled page, padding it with 0x00 in the end");
        }
        if let Err(e) = client.write_page(&page) {
            break Err(e);
        }
        bar.inc(got as u64);
        remaining -= got;
        if got < want {
            break Ok(());
        }
    };
    if let Err(e) = result {
        bar.abandon();
        println!("Error sending pflash page data!");
        return Err(e);
    }

    client.end_of_transmission()?;
    bar.finish();
    info!("programming success");
    println!("Programming success!");
    Ok(())
}

/// Data-flash programming never left the bench notes; the 128-byte page
/// flow is not implemented on any transport.
pub fn program_dflash(_dev: &mut Device, _addr: u32, _data: &[u8]) -> Result<()> {
    Err(Error::Unsupported("data-flash programming is not implemented"))
}

/// Read as much of `buf` as the source can fill, stopping at EOF.
fn read_fully(input: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn finish_or_abandon(bar: ProgressBar, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            bar.finish();
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{sim_device, SimEcu};
    use std::fs;

    fn simos8() -> (SimEcu, Device) {
        let sim = SimEcu::new(TargetVariant::Simos8);
        sim.force_bsl_ready();
        let dev = sim_device(&sim);
        (sim, dev)
    }

    #[test]
    fn test_erase_cal_issues_single_region_erase() {
        let (sim, mut dev) = simos8();
        erase_cal(&mut dev).unwrap();
        assert_eq!(sim.erases(), vec![(0xA004_0000, 0x0004_0000)]);
    }

    #[test]
    fn test_erase_asw_covers_all_three_sectors() {
        let (sim, mut dev) = simos8();
        erase_asw(&mut dev).unwrap();
        assert_eq!(
            sim.erases(),
            vec![
                (0xA008_0000, 0x8_0000),
                (0xA010_0000, 0x8_0000),
                (0xA018_0000, 0x8_0000)
            ]
        );
    }

    #[test]
    fn test_program_file_pads_and_reads_back() {
        let (sim, mut dev) = simos8();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("cal.bin");
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        fs::write(&src, &payload).unwrap();

        program_file(&mut dev, 0xA004_0000, 300, &src, 0).unwrap();
        assert_eq!(sim.pages_written(), 2);

        // Reading the same range back yields the payload plus 0x00 padding
        // to the page boundary.
        let out = dir.path().join("readback.bin");
        read_uncompressed(&mut dev, 0xA004_0000, 0x200, &out).unwrap();
        let mut expected = payload.clone();
        expected.resize(0x200, 0x00);
        assert_eq!(fs::read(&out).unwrap(), expected);
    }

    #[test]
    fn test_compressed_read_to_file() {
        let (sim, mut dev) = simos8();
        sim.fill(0xA004_0000, &[0xFF; 0x100]);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("cal.bin");
        read_compressed(&mut dev, 0xA004_0000, 0x100, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), vec![0xFF; 0x100]);
    }

    #[test]
    fn test_program_file_honors_offset() {
        let (sim, mut dev) = simos8();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("blob.bin");
        let mut payload = vec![0u8; 0x110];
        payload[0x10..].copy_from_slice(&[0x5A; 0x100]);
        fs::write(&src, &payload).unwrap();

        program_file(&mut dev, 0xA004_0000, 0x100, &src, 0x10).unwrap();
        assert_eq!(sim.memory_at(0xA004_0000, 0x100), vec![0x5A; 0x100]);
    }

    #[test]
    fn test_program_file_aborts_on_bad_page_status() {
        let (sim, mut dev) = simos8();
        sim.set_page_status_override(1, 0xFA);
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("blob.bin");
        fs::write(&src, vec![0x11u8; 0x300]).unwrap();

        match program_file(&mut dev, 0xA004_0000, 0x300, &src, 0) {
            Err(Error::Program) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        // Only the acknowledged first page landed.
        assert_eq!(sim.pages_written(), 1);
    }

    #[test]
    fn test_dump_memory_writes_raw_words(){
        let (sim, mut dev) = simos8();
        sim.fill(0xAFFF_C000, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("rom.bin");
        dump_memory(&mut dev, 0xAFFF_C000, 8, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    }

    #[test]
    fn test_password_record_reaches_device() {
        let (sim, mut dev) = simos8();
        send_passwords(&mut dev, 0x53B6_495B, 0x8E1F_FEB1, PasswordScope::Read).unwrap();
        send_passwords(&mut dev, 0xCE9C_2B1E, 0xA584_FB46, PasswordScope::Write).unwrap();
        let records = sim.password_records();
        assert_eq!(records.len(), 2);
        // Words land little-endian; the write pair flips flag and UCB.
        assert_eq!(&records[0][2..6], &0x53B6_495Bu32.to_le_bytes());
        assert_eq!(&records[0][10..13], &[0x00, 0x00, 0x00]);
        assert_eq!(&records[1][10..13], &[0x00, 0x01, 0x01]);
    }

    #[test]
    fn test_write32_is_rejected_on_framed_transport() {
        let (_sim, mut dev) = simos8();
        match write32(&mut dev, 0xD000_0000, 1) {
            Err(Error::Unsupported(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_dflash_programming_is_unsupported() {
        let (_sim, mut dev) = simos8();
        match program_dflash(&mut dev, 0xAFE0_0000, &[0u8; 0x80]) {
            Err(Error::Unsupported(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
