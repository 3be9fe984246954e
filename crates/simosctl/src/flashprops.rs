//! Flash protection status report
//!
//! Decodes the FSR/FCON/PROCON registers of both program-memory units and
//! prints which protections are installed, plus the per-sector spans still
//! covered by read/write/OTP protection. Purely informational; the word
//! reads go through whatever transport the variant uses.

use crate::device::Device;
use crate::bsl::memory;
use crate::error::Result;
use crate::flash::SECTOR_MAP_TC1791;

/// Program-memory unit register bases.
const PMU_BASES: [u32; 2] = [0xF800_1000, 0xF800_3000];

const FSR: u32 = 0x1010;
const FCON: u32 = 0x1014;
const PROCON0: u32 = 0x1020;
const PROCON1: u32 = 0x1024;
const PROCON2: u32 = 0x1028;

/// LSB-first bit view of one register byte.
fn bits(byte: u8) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, bit) in out.iter_mut().enumerate() {
        *bit = (byte >> i) & 1;
    }
    out
}

fn print_enabled_disabled(label: &str, value: u8) {
    let state = if value > 0 { "ENABLED" } else { "DISABLED" };
    println!("{label} {state}");
}

/// Sixteen sectors of protection bits; the 512K physical sectors above
/// sector 9 share a bit per pair.
fn print_sector_status(label: &str, sector_status: &[u8; 16], sector_map: &[u32]) {
    let mut current_address: u32 = 0;
    for (sector, len) in sector_map.iter().enumerate() {
        let index = if sector > 9 { 10 + (sector - 10) / 2 } else { sector };
        if sector_status[index] > 0 {
            println!(
                "{label}Sector {sector} {current_address:#x}:{:#x} : ENABLED",
                current_address + len
            );
        }
        current_address += len;
    }
}

/// Dump protection status for one flash unit.
fn report_unit(dev: &mut Device, unit: usize, base: u32) -> Result<()> {
    let fsr = memory::read32(dev, base + FSR)?.to_le_bytes();
    let fcon = memory::read32(dev, base + FCON)?.to_le_bytes();
    let procon0 = memory::read32(dev, base + PROCON0)?.to_le_bytes();
    let procon1 = memory::read32(dev, base + PROCON1)?.to_le_bytes();
    let procon2 = memory::read32(dev, base + PROCON2)?.to_le_bytes();
    let name = format!("PMEM{unit}");

    let status = bits(fsr[2]);
    print_enabled_disabled(&format!("{name} Protection Installation:"), status[0]);
    print_enabled_disabled(&format!("{name} Read Protection Installation:"), status[2]);
    print_enabled_disabled(&format!("{name} Read Protection Inhibit:"), status[3]);
    print_enabled_disabled(&format!("{name} Write Protection User 0:"), status[5]);
    print_enabled_disabled(&format!("{name} Write Protection User 1:"), status[6]);
    print_enabled_disabled(&format!("{name} OTP Installation:"), status[7]);

    let status_write = bits(fsr[3]);
    print_enabled_disabled(&format!("{name} Write Protection User 0 Inhibit:"), status_write[1]);
    print_enabled_disabled(&format!("{name} Write Protection User 1 Inhibit:"), status_write[2]);

    let protection = bits(fcon[2]);
    print_enabled_disabled(&format!("{name} Read Protection:"), protection[0]);
    print_enabled_disabled(&format!("{name} Disable Code Fetch from Flash Memory:"), protection[1]);
    print_enabled_disabled(&format!("{name} Disable Any Data Fetch from Flash:"), protection[2]);
    print_enabled_disabled(
        &format!("{name} Disable Data Fetch from DMA Controller:"),
        protection[4],
    );
    print_enabled_disabled(
        &format!("{name} Disable Data Fetch from PCP Controller:"),
        protection[5],
    );
    print_enabled_disabled(
        &format!("{name} Disable Data Fetch from SHE Controller:"),
        protection[6],
    );

    // The span report walks the tc1791 sector table for every variant.
    let sector_map = &SECTOR_MAP_TC1791[..];
    let mut sector_status = [0u8; 16];
    sector_status[..8].copy_from_slice(&bits(procon0[0]));
    sector_status[8..].copy_from_slice(&bits(procon0[1]));
    print_sector_status(&format!("{name} USR0 Read Protection "), &sector_status, sector_map);
    sector_status[..8].copy_from_slice(&bits(procon1[0]));
    sector_status[8..].copy_from_slice(&bits(procon1[1]));
    print_sector_status(&format!("{name} USR1 Write Protection "), &sector_status, sector_map);
    sector_status[..8].copy_from_slice(&bits(procon2[0]));
    sector_status[8..].copy_from_slice(&bits(procon2[1]));
    print_sector_status(&format!("{name} USR2 OTP Protection "), &sector_status, sector_map);
    Ok(())
}

/// Report both program-memory units.
pub fn report(dev: &mut Device) -> Result<()> {
    for (unit, base) in PMU_BASES.iter().enumerate() {
        report_unit(dev, unit, *base)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_is_lsb_first() {
        assert_eq!(bits(0b1000_0001), [1, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(bits(0x00), [0; 8]);
    }

    #[test]
    fn test_paired_sector_index_above_nine() {
        // Sectors 10..16 fold onto bits 10..13 in pairs.
        let folded: Vec<usize> =
            (10..16).map(|s| 10 + (s - 10) / 2).collect();
        assert_eq!(folded, vec![10, 10, 11, 11, 12, 12]);
    }
}
