//! Interactive command shell
//!
//! A plain line loop with a verb -> handler dispatch table. Arguments are
//! hex strings throughout, matching how addresses and passwords circulate
//! in ECU documentation. Handler failures print and return to the prompt;
//! only `bye` (or EOF) leaves the loop.

use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tracing::error;

use crate::bsl::frame::PasswordScope;
use crate::bsl::{memory, upload_bsl};
use crate::device::Device;
use crate::error::Error;
use crate::flashprops;
use crate::hexstr;
use crate::oracle;
use crate::sboot::{self, InductionMode};

const INTRO: &str =
    "Welcome to the Tricore BSL shell. Type help or ? to list commands; you are likely looking for upload to start.";
const PROMPT: &str = "(BSL) ";

/// (verb, usage, description) for the help listing.
const COMMANDS: &[(&str, &str, &str)] = &[
    ("upload", "upload", "Upload the stage-two BSL image to the device"),
    ("sboot", "sboot", "Reset into the SBOOT shell and run the seed/key exchange"),
    ("sboot_strict", "sboot_strict", "Same as sboot but demand every handshake ack (diagnostic)"),
    ("sboot_sendkey", "sboot_sendkey <key>", "Send a precomputed key to the SBOOT shell"),
    (
        "sboot_crc_reset",
        "sboot_crc_reset <addr>",
        "Program a CRC probe at <addr>, trigger the validator and read the result words",
    ),
    ("extract_boot_passwords", "extract_boot_passwords", "Run the full four-probe password recovery"),
    ("readaddr", "readaddr <addr>", "Read 32 bits from an arbitrary address"),
    ("writeaddr", "writeaddr <addr> <data>", "Write 32 bits to an arbitrary address"),
    ("dumpmem", "dumpmem <addr> <size> <filename>", "Dump memory word by word to a file"),
    (
        "compressed_read",
        "compressed_read <addr> <size> <filename>",
        "Read memory using LZ4 compression (fast)",
    ),
    (
        "uncompressed_read",
        "uncompressed_read <addr> <size> <filename>",
        "Read memory without compression",
    ),
    (
        "send_read_passwords",
        "send_read_passwords <pw1> <pw2>",
        "Unlock flash reads with the read password pair",
    ),
    (
        "send_write_passwords",
        "send_write_passwords <pw1> <pw2>",
        "Unlock erase/program with the write password pair",
    ),
    ("erase_sector", "erase_sector <addr> <size>", "Erase the flash sector at <addr>"),
    ("erase_asw", "erase_asw", "Erase the application software sectors"),
    ("erase_cal", "erase_cal", "Erase the calibration area"),
    ("erase_cboot", "erase_cboot", "Erase the customer bootloader"),
    (
        "write_file",
        "write_file <addr> <size> <filename> [offset]",
        "Program file contents into flash at <addr>",
    ),
    (
        "write_dflash",
        "write_dflash <addr> <filename>",
        "Program data-flash pages (not implemented on any transport)",
    ),
    ("deviceid", "deviceid", "Read the Tricore device identifier"),
    ("flashinfo", "flashinfo", "Report flash protection status for both PMUs"),
    ("selftest", "selftest", "Ping the stage-two BSL"),
    ("reset", "reset", "Pulse the ECU reset line"),
    ("bye", "bye", "Exit"),
];

/// Run the shell until `bye` or EOF. Clean exits return `Ok`.
pub fn run(dev: &mut Device) -> Result<()> {
    println!("{INTRO}");
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("{PROMPT}");
        std::io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else { continue };
        let args: Vec<&str> = parts.collect();
        match verb {
            "bye" => return Ok(()),
            "help" | "?" => print_help(),
            _ => {
                if let Err(e) = dispatch(dev, verb, &args) {
                    error!(verb, "command failed: {e:#}");
                    println!("{e:#}");
                }
            }
        }
    }
}

fn print_help() {
    for (_, usage, description) in COMMANDS {
        println!("{usage:<48} {description}");
    }
}

fn dispatch(dev: &mut Device, verb: &str, args: &[&str]) -> Result<()> {
    match verb {
        "upload" => Ok(upload_bsl(dev, false)?),
        "sboot" => Ok(sboot::login(dev, InductionMode::Tolerant)?),
        "sboot_strict" => Ok(sboot::login(dev, InductionMode::Strict)?),
        "sboot_sendkey" => {
            let key = hex_bytes(args, 0, "key")?;
            Ok(sboot::send_key(dev, &key)?)
        }
        "sboot_crc_reset" => {
            let addr = hex_u32(args, 0, "addr")?;
            let probe = oracle::run_probe(dev, addr)?;
            println!(
                "{:08x} - {:#x} - {:#x} -> {:#x}",
                probe.start_addr,
                probe.end_addr,
                probe.range_len(),
                probe.crc
            );
            Ok(())
        }
        "extract_boot_passwords" => {
            oracle::extract_boot_passwords(dev)?;
            Ok(())
        }
        "readaddr" => {
            let addr = hex_u32(args, 0, "addr")?;
            match memory::read32(dev, addr) {
                Ok(value) => {
                    println!("{}", hexstr::encode(&value.to_le_bytes()));
                    Ok(())
                }
                Err(Error::HandshakeTimeout(_)) => {
                    println!("Empty data");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
        "writeaddr" => {
            let addr = hex_u32(args, 0, "addr")?;
            let value = hex_u32(args, 1, "data")?;
            match memory::write32(dev, addr, value) {
                Ok(()) => {
                    println!("Wrote {value:08x} to {addr:08x}");
                    Ok(())
                }
                Err(e) => {
                    println!("Failed to write value.");
                    Err(e.into())
                }
            }
        }
        "dumpmem" => {
            let addr = hex_u32(args, 0, "addr")?;
            let size = hex_u32(args, 1, "size")?;
            let path = arg(args, 2, "filename")?;
            Ok(memory::dump_memory(dev, addr, size, Path::new(path))?)
        }
        "compressed_read" => {
            let addr = hex_u32(args, 0, "addr")?;
            let size = hex_u32(args, 1, "size")?;
            let path = arg(args, 2, "filename")?;
            Ok(memory::read_compressed(dev, addr, size, Path::new(path))?)
        }
        "uncompressed_read" => {
            let addr = hex_u32(args, 0, "addr")?;
            let size = hex_u32(args, 1, "size")?;
            let path = arg(args, 2, "filename")?;
            Ok(memory::read_uncompressed(dev, addr, size, Path::new(path))?)
        }
        "send_read_passwords" => send_passwords(dev, args, PasswordScope::Read),
        "send_write_passwords" => send_passwords(dev, args, PasswordScope::Write),
        "erase_sector" => {
            let addr = hex_u32(args, 0, "addr")?;
            let size = hex_u32(args, 1, "size")?;
            Ok(memory::erase_sector(dev, addr, size)?)
        }
        "erase_asw" => Ok(memory::erase_asw(dev)?),
        "erase_cal" => Ok(memory::erase_cal(dev)?),
        "erase_cboot" => Ok(memory::erase_cboot(dev)?),
        "write_file" => {
            let addr = hex_u32(args, 0, "addr")?;
            let size = hex_u32(args, 1, "size")?;
            let path = arg(args, 2, "filename")?;
            let offset = match args.get(3) {
                Some(s) => hexstr::parse_u32(s)
                    .ok_or_else(|| anyhow!("offset is not a hex value: {s}"))?
                    as u64,
                None => 0,
            };
            println!(
                "Writing {size:#x} bytes from {path} at offset {offset:#x} to address {addr:08x}"
            );
            Ok(memory::program_file(dev, addr, size, Path::new(path), offset)?)
        }
        "write_dflash" => {
            let addr = hex_u32(args, 0, "addr")?;
            let path = arg(args, 1, "filename")?;
            let data = fs::read(path).with_context(|| format!("reading {path}"))?;
            Ok(memory::program_dflash(dev, addr, &data)?)
        }
        "deviceid" => {
            let id = memory::device_id(dev)?;
            if id.len() > 1 {
                println!("{}", hexstr::encode(&id));
            } else {
                println!("Failed to retrieve Device ID");
            }
            Ok(())
        }
        "flashinfo" => Ok(flashprops::report(dev)?),
        "selftest" => {
            let reply = memory::self_test(dev)?;
            println!("{}", hexstr::encode(&reply));
            Ok(())
        }
        "reset" => Ok(dev.lines.reset_pulse()?),
        _ => {
            bail!("unknown command {verb:?}; try help");
        }
    }
}

fn send_passwords(dev: &mut Device, args: &[&str], scope: PasswordScope) -> Result<()> {
    let pw1 = hex_u32(args, 0, "pw1")?;
    let pw2 = hex_u32(args, 1, "pw2")?;
    memory::send_passwords(dev, pw1, pw2, scope).context("password submission failed")?;
    println!("Success");
    Ok(())
}

fn arg<'a>(args: &[&'a str], index: usize, name: &str) -> Result<&'a str> {
    args.get(index).copied().ok_or_else(|| anyhow!("missing argument <{name}>"))
}

fn hex_u32(args: &[&str], index: usize, name: &str) -> Result<u32> {
    let raw = arg(args, index, name)?;
    hexstr::parse_u32(raw).ok_or_else(|| anyhow!("<{name}> is not a hex value: {raw}"))
}

fn hex_bytes(args: &[&str], index: usize, name: &str) -> Result<Vec<u8>> {
    let raw = arg(args, index, name)?;
    hexstr::decode(raw).ok_or_else(|| anyhow!("<{name}> is not a hex string: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::TargetVariant;
    use crate::sim::{sim_device, SimEcu};

    #[test]
    fn test_unknown_verb_is_reported() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        let mut dev = sim_device(&sim);
        let err = dispatch(&mut dev, "frobnicate", &[]).unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn test_missing_argument_is_reported() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        let mut dev = sim_device(&sim);
        let err = dispatch(&mut dev, "readaddr", &[]).unwrap_err();
        assert!(err.to_string().contains("missing argument"));
    }

    #[test]
    fn test_readaddr_prints_raw_byte_order() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        sim.force_bsl_ready();
        sim.poke_word(0xD400_0C00, 0x1234_5678);
        let mut dev = sim_device(&sim);
        // Dispatch succeeds; output formatting is checked in hexstr tests.
        dispatch(&mut dev, "readaddr", &["d4000c00"]).unwrap();
    }

    #[test]
    fn test_erase_sector_takes_addr_and_size() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        sim.force_bsl_ready();
        let mut dev = sim_device(&sim);
        dispatch(&mut dev, "erase_sector", &["a0020000", "20000"]).unwrap();
        assert_eq!(sim.erases(), vec![(0xA002_0000, 0x2_0000)]);
    }

    #[test]
    fn test_write_dflash_surfaces_unsupported() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        let mut dev = sim_device(&sim);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dflash.bin");
        fs::write(&path, [0u8; 0x80]).unwrap();
        let path = path.to_str().unwrap();
        let err = dispatch(&mut dev, "write_dflash", &["afe00000", path]).unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }

    #[test]
    fn test_argument_verbs_fail_on_parsing_not_dispatch() {
        // Every verb that takes arguments must be wired up: with no
        // arguments it fails on parsing, never as an unknown command.
        let sim = SimEcu::new(TargetVariant::Simos8);
        let mut dev = sim_device(&sim);
        for (verb, usage, _) in COMMANDS {
            if !usage.contains('<') {
                continue;
            }
            let err = dispatch(&mut dev, verb, &[]).unwrap_err();
            assert!(
                err.to_string().contains("missing argument"),
                "verb {verb} did not parse arguments first: {err:#}"
            );
        }
    }
}
