//! Stage-two BSL upload
//!
//! The mask ROM loader accepts a single init frame on id 0x100 naming the
//! ack and data ids plus the transfer length in 8-byte units, answers on
//! id 0x40, then swallows the raw image stream. After the last frame the
//! device jumps into the uploaded loader; the receive queue is drained so
//! stale frames cannot confuse the first real command.

use std::fs;
use std::thread;
use std::time::Duration;

use indicatif::ProgressBar;
use tracing::{debug, info};

use crate::bsl::frame::{BSL_CMD_ID, BSL_INIT_ACK_ID, BSL_INIT_ID};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::link::{CanBus, Frame};

/// Pause between stream frames; the ROM loader has no flow control.
const INTER_FRAME_DELAY: Duration = Duration::from_millis(1);
/// Window per ack receive attempt.
const INIT_ACK_WINDOW: Duration = Duration::from_millis(500);
/// Attempts before giving up on the init ack.
const INIT_ACK_ATTEMPTS: u32 = 20;
/// Drain window after the final frame.
const DRAIN_WINDOW: Duration = Duration::from_millis(10);

/// Upload the configured stage-two image. `skip_prepare` is set when the
/// HWCFG pins were already strapped earlier in the flow.
pub fn upload_bsl(dev: &mut Device, skip_prepare: bool) -> Result<()> {
    if !skip_prepare {
        println!("Resetting ECU into HWCFG BSL mode...");
        dev.operator
            .acknowledge("Please flip the switches to ground/power the ECU HWCFG pins")?;
    }
    dev.lines.reset_pulse()?;
    thread::sleep(Duration::from_millis(100));

    let image = fs::read(&dev.config.bsl_image)?;
    info!(path = %dev.config.bsl_image.display(), len = image.len(), "sending BSL image");
    println!("Sending BSL initialization message...");
    send_init(dev.bus.as_mut(), &image)?;
    stream_image(dev.bus.as_mut(), &image)?;
    Ok(())
}

fn send_init(bus: &mut dyn CanBus, image: &[u8]) -> Result<()> {
    let frame_count = image.len().div_ceil(8) as u16;
    let len = frame_count.to_le_bytes();
    // 55 55 bit sync, ack id 0x100 (low 2 bits discarded on-chip -> 0x40),
    // frame count, data id 0x300 (-> 0xC0 after the same shift).
    let init = [0x55, 0x55, 0x00, 0x01, len[0], len[1], 0x00, 0x03];
    bus.send(&Frame::new(BSL_INIT_ID, &init))?;

    for _ in 0..INIT_ACK_ATTEMPTS {
        match bus.recv(INIT_ACK_WINDOW)? {
            Some(frame) if frame.is_error => continue,
            Some(frame) if frame.id == BSL_INIT_ACK_ID => {
                debug!(?frame, "BSL init acknowledged");
                return Ok(());
            }
            Some(frame) => {
                debug!(?frame, "ignoring frame while waiting for init ack");
            }
            None => {}
        }
    }
    Err(Error::HandshakeTimeout("BSL init acknowledgement"))
}

fn stream_image(bus: &mut dyn CanBus, image: &[u8]) -> Result<()> {
    println!("Sending BSL data...");
    let bar = ProgressBar::new(image.len() as u64);
    for chunk in image.chunks(8) {
        bus.send(&Frame::new(BSL_CMD_ID, chunk))?;
        thread::sleep(INTER_FRAME_DELAY);
        bar.inc(chunk.len() as u64);
    }
    bar.finish();
    println!("Device jumping into BSL... Draining receive queue...");
    while bus.recv(DRAIN_WINDOW)?.is_some() {}
    Ok(())
}
