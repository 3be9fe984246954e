//! Supplier bootloader shell driver
//!
//! Getting into the SBOOT service shell takes a physical-layer nudge: both
//! induction waveforms running while the ECU comes out of reset, then a
//! raw-CAN handshake (`59 45`, `6B`, each answered by an `A0` from 0x7E8).
//! Once inside, the dialogue switches to ISO-TP for seed/key and for
//! programming the validator's CRC record. Triggering the validator
//! reboots the device into BSL mode, which is the whole point.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bsl::frame::SBOOT_FAILURE_ID;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::hexstr;
use crate::link::isotp::{SBOOT_RX_ID, SBOOT_TX_ID};
use crate::link::{Frame, IsoTpLink};

/// Receive window per handshake poll.
const HANDSHAKE_WINDOW: Duration = Duration::from_millis(50);
/// Window cap for the strict diagnostic path, which has no empty-window
/// fallback of its own.
const STRICT_WINDOW_LIMIT: u32 = 1200;
/// Reply timeout for shell requests once ISO-TP is up.
const SHELL_TIMEOUT: Duration = Duration::from_secs(5);

/// Offsets into the validator scratch record, written in this order.
const CFG_INITIAL_CRC: u8 = 0x00;
const CFG_EXPECTED_CRC: u8 = 0x04;
const CFG_RANGE_COUNT: u8 = 0x08;
const CFG_START_ADDR: u8 = 0x0C;
const CFG_END_ADDR: u8 = 0x10;
const CFG_PART_NUMBER: u8 = 0x14;

/// Handshake discipline for [`enter_shell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InductionMode {
    /// Proceed to the shell after enough empty receive windows even if the
    /// second `A0` never showed up. What the bench actually needs.
    Tolerant,
    /// Demand both acknowledgements; diagnostic use.
    Strict,
}

/// Print the outcome of a shell request the way the operator expects it:
/// `A0` is success, anything else is rendered in hex.
pub fn print_outcome(data: Option<&[u8]>) {
    match data {
        Some(data) if data.first() == Some(&0xA0) => println!("Success"),
        Some(data) => println!("Failure! {}", hexstr::encode(data)),
        None => println!("Empty data"),
    }
}

/// Drive the ECU into the SBOOT shell and return the seed material.
pub fn enter_shell(dev: &mut Device, mode: InductionMode) -> Result<Vec<u8>> {
    println!("Setting up PWM waveforms...");
    dev.lines.pwm_start()?;
    thread::sleep(Duration::from_secs(1));

    println!("Resetting ECU into Supplier Bootloader...");
    dev.operator.acknowledge("Please turn on ECU power")?;
    dev.lines.reset_pulse()?;

    let result = handshake(dev, mode);
    dev.lines.pwm_stop()?;
    match result {
        Ok(()) => {
            println!("Switching to ISO-TP socket...");
            info!("handshake done, entering ISO-TP shell");
            get_seed(dev)
        }
        Err(e) => Err(e),
    }
}

fn handshake(dev: &mut Device, mode: InductionMode) -> Result<()> {
    println!("Sending 59 45...");
    info!("sending 59 45");
    dev.bus.send(&Frame::new(SBOOT_TX_ID, &[0x59, 0x45]))?;
    let _ = dev.bus.recv(HANDSHAKE_WINDOW)?;

    println!("Sending 6B...");
    info!("sending 6B");
    dev.bus.send(&Frame::new(SBOOT_TX_ID, &[0x6B]))?;

    let mut acknowledged_once = false;
    let mut empty_windows: u32 = 0;
    let mut total_windows: u32 = 0;
    loop {
        if acknowledged_once {
            dev.bus.send(&Frame::new(SBOOT_TX_ID, &[0x6B]))?;
            debug!("re-sending 6B");
        }
        match dev.bus.recv(HANDSHAKE_WINDOW)? {
            None => {
                empty_windows += 1;
                if mode == InductionMode::Tolerant
                    && empty_windows >= dev.config.none_msg_threshold
                {
                    println!("Haven't gotten a CAN message in a while, just proceeding...");
                    warn!(empty_windows, "no acknowledgement, proceeding to the shell anyway");
                    return Ok(());
                }
            }
            Some(frame) => {
                empty_windows = 0;
                debug!(id = frame.id, data = %hexstr::encode(&frame.data), "handshake frame");
                if frame.is_error {
                    continue;
                }
                if frame.id == SBOOT_RX_ID && frame.first_byte() == Some(0xA0) {
                    println!("Got A0 message");
                    if acknowledged_once {
                        return Ok(());
                    }
                    acknowledged_once = true;
                } else if frame.id == SBOOT_FAILURE_ID {
                    println!("FAILURE");
                    return Err(Error::InductionFailure);
                }
            }
        }
        total_windows += 1;
        if mode == InductionMode::Strict && total_windows >= STRICT_WINDOW_LIMIT {
            return Err(Error::HandshakeTimeout("SBOOT acknowledgement"));
        }
    }
}

/// Elevate the shell and pull the seed. The response carries nine header
/// bytes before the seed material.
fn get_seed(dev: &mut Device) -> Result<Vec<u8>> {
    let mut shell = IsoTpLink::new(dev.bus.as_mut());

    println!("Sending 0x30 to elevate SBOOT shell status...");
    let mut elevate = [0u8; 13];
    elevate[0] = 0x30;
    shell.send(&elevate)?;
    let reply = shell.wait_frame(SHELL_TIMEOUT)?;
    print_outcome(reply.as_deref());
    thread::sleep(Duration::from_secs(1));

    println!("Sending 0x54 Generate Seed...");
    shell.send(&[0x54])?;
    let reply = shell.wait_frame(SHELL_TIMEOUT)?;
    print_outcome(reply.as_deref());
    let data = reply.ok_or(Error::HandshakeTimeout("seed response"))?;
    if data.len() <= 9 {
        return Err(Error::ShortFrame(data.len()));
    }
    info!(header = %hexstr::encode(&data[..9]), "seed response header");
    Ok(data[9..].to_vec())
}

/// Submit a seed/key answer.
pub fn send_key(dev: &mut Device, key: &[u8]) -> Result<()> {
    let mut shell = IsoTpLink::new(dev.bus.as_mut());
    println!("Sending 0x65 Security Access with Key...");
    let mut request = vec![0x65];
    request.extend_from_slice(key);
    shell.send(&request)?;
    let reply = shell.wait_frame(SHELL_TIMEOUT)?;
    print_outcome(reply.as_deref());
    Ok(())
}

/// Full login: induction, seed retrieval, key computation, key submission.
pub fn login(dev: &mut Device, mode: InductionMode) -> Result<()> {
    let seed = enter_shell(dev, mode)?;
    println!("Calculating key for seed:");
    println!("{}", hexstr::encode(&seed));
    if seed.len() < 4 {
        return Err(Error::ShortFrame(seed.len()));
    }
    let key = dev.key_solver.key_for_seed(&seed[..4])?;
    println!("Key calculated:");
    println!("{}", hexstr::encode(&key));
    send_key(dev, &key)
}

/// Program the validator's CRC record for a probe starting at
/// `start_addr` and trigger it. The six writes must land in this order;
/// the validator reads the record exactly once, right after the trigger.
pub fn program_crc_probe(dev: &mut Device, start_addr: u32) -> Result<()> {
    println!("Resetting ECU into HWCFG BSL mode...");
    dev.operator
        .acknowledge("Please flip the switches to ground/power the ECU HWCFG pins")?;

    let end_addr = dev.variant.crc_end_address();
    let part_number = *dev.variant.part_number();
    let crc_delay = dev.config.crc_delay;
    let mut shell = IsoTpLink::new(dev.bus.as_mut());

    println!("Setting initial CRC to 0x0...");
    cfg_write(&mut shell, CFG_INITIAL_CRC, &0u32.to_le_bytes())?;
    println!("Setting expected CRC to 0x0...");
    cfg_write(&mut shell, CFG_EXPECTED_CRC, &0u32.to_le_bytes())?;
    println!("Setting CRC range count to 1...");
    cfg_write(&mut shell, CFG_RANGE_COUNT, &1u32.to_le_bytes())?;
    println!("Setting CRC start address to boot passwords at {start_addr:08x}...");
    cfg_write(&mut shell, CFG_START_ADDR, &start_addr.to_le_bytes())?;
    println!("Setting CRC end address to a valid area at {end_addr:08x}...");
    cfg_write(&mut shell, CFG_END_ADDR, &end_addr.to_le_bytes())?;
    println!("Uploading valid part number for part correlation validator...");
    cfg_write(&mut shell, CFG_PART_NUMBER, &part_number)?;

    println!("Starting Validator and rebooting into BSL...");
    info!(start_addr = format_args!("{start_addr:#010x}"), "triggering validator");
    shell.send(&[0x79])?;
    thread::sleep(crc_delay);
    Ok(())
}

fn cfg_write(shell: &mut IsoTpLink, offset: u8, value: &[u8]) -> Result<()> {
    let mut request = vec![0x78, 0x00, 0x00, 0x00, offset];
    request.extend_from_slice(value);
    shell.send(&request)?;
    let reply = shell.wait_frame(SHELL_TIMEOUT)?;
    print_outcome(reply.as_deref());
    if reply.as_deref().and_then(|d| d.first().copied()) != Some(0xA0) {
        warn!(offset, "validator scratch write not acknowledged");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::TargetVariant;
    use crate::sim::{sim_device, SimEcu};

    #[test]
    fn test_login_retrieves_seed_and_submits_key() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        sim.set_seed(&[0xCA, 0xFE, 0xF0, 0x0D, 0x01, 0x02, 0x03, 0x04]);
        let mut dev = sim_device(&sim);
        login(&mut dev, InductionMode::Tolerant).unwrap();

        let pdus = sim.sboot_pdus();
        // Elevation, seed request, key submission.
        assert_eq!(pdus[0], {
            let mut elevate = vec![0u8; 13];
            elevate[0] = 0x30;
            elevate
        });
        assert_eq!(pdus[1], vec![0x54]);
        assert_eq!(pdus[2], vec![0x65, 0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_probe_config_writes_are_verbatim_and_ordered() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        let mut dev = sim_device(&sim);
        login(&mut dev, InductionMode::Tolerant).unwrap();
        program_crc_probe(&mut dev, 0x8001_420C).unwrap();

        let pdus = sim.sboot_pdus();
        let cfg: Vec<&Vec<u8>> = pdus.iter().filter(|p| p.first() == Some(&0x78)).collect();
        assert_eq!(cfg.len(), 6);
        // Initial CRC zero goes out byte for byte.
        assert_eq!(cfg[0], &vec![0x78, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(cfg[1][4], 0x04);
        assert_eq!(cfg[2], &vec![0x78, 0x00, 0x00, 0x00, 0x08, 0x01, 0x00, 0x00, 0x00]);
        // Start address is little-endian on the wire.
        assert_eq!(cfg[3], &vec![0x78, 0x00, 0x00, 0x00, 0x0C, 0x0C, 0x42, 0x01, 0x80]);
        // End address for this variant is 0xD40000B0.
        assert_eq!(cfg[4], &vec![0x78, 0x00, 0x00, 0x00, 0x10, 0xB0, 0x00, 0x00, 0xD4]);
        // The trigger followed.
        assert_eq!(pdus.last().unwrap(), &vec![0x79]);
    }

    #[test]
    fn test_part_number_upload_matches_literal() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        let mut dev = sim_device(&sim);
        login(&mut dev, InductionMode::Tolerant).unwrap();
        program_crc_probe(&mut dev, 0x8001_420C).unwrap();

        let expected: Vec<u8> = vec![
            0x4E, 0x42, 0x30, 0x65, 0x00, 0x00, 0x53, 0x38, 0x35, 0x32, 0x31, 0x2D, 0x36, 0x35,
            0x30, 0x53, 0x38, 0x35, 0x35, 0x32, 0x30, 0x35, 0x2D, 0x2D, 0x2D, 0x2D, 0x2D, 0x2D,
        ];
        assert_eq!(sim.cfg_write(0x14).unwrap(), expected);
    }

    #[test]
    fn test_tolerant_fallback_after_sixty_empty_windows() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        sim.set_silent_handshake(true);
        let mut dev = sim_device(&sim);
        // The shell still answers once ISO-TP starts, so login completes.
        login(&mut dev, InductionMode::Tolerant).unwrap();

        // One discarded receive after 59 45, then exactly the configured
        // number of empty windows after 6B.
        assert_eq!(sim.handshake_recv_calls(), 1 + 60);
        // The elevation request proves the driver moved on to the shell.
        assert_eq!(sim.sboot_pdus()[0][0], 0x30);
    }

    #[test]
    fn test_failure_id_aborts_induction() {
        let sim = SimEcu::new(TargetVariant::Simos8);
        sim.set_silent_handshake(true);
        // One frame eaten by the post-59-45 receive, then the failure report.
        sim.push_frame(0x123, &[0x00]);
        sim.push_frame(SBOOT_FAILURE_ID, &[0x00]);
        let mut dev = sim_device(&sim);
        match enter_shell(&mut dev, InductionMode::Tolerant) {
            Err(Error::InductionFailure) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
