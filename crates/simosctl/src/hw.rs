//! Reset line and induction waveforms
//!
//! The service-mode induction needs two phase-locked square waves on the
//! HWCFG-adjacent pins while the ECU comes out of reset. Software-timed
//! bit-banging jitters too much to pass the window check, so both waveforms
//! come from the Pi's hardware PWM peripheral.

use std::io::{BufRead, Write};
use std::thread;
use std::time::Duration;

use rppal::gpio::{Gpio, OutputPin};
use rppal::pwm::{Channel, Polarity, Pwm};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// BCM pin of the ECU reset line (active low, held high through a pull-up).
pub const RESET_PIN: u8 = 23;
/// Reset must stay low at least this long to be honored.
pub const RESET_PULSE: Duration = Duration::from_millis(10);

/// Reset pulse and induction waveform control.
pub trait LineDriver {
    /// Pull the reset line low for [`RESET_PULSE`], then release it.
    fn reset_pulse(&mut self) -> Result<()>;
    /// Start both induction waveforms.
    fn pwm_start(&mut self) -> Result<()>;
    /// Release both waveform outputs.
    fn pwm_stop(&mut self) -> Result<()>;
}

/// Raspberry Pi implementation: GPIO 23 reset, PWM0 (GPIO 12) and
/// PWM1 (GPIO 13) waveforms.
pub struct PiLineDriver {
    reset: OutputPin,
    frequency: f64,
    // Held while the waveforms run; dropping releases the channels.
    channel_a: Option<Pwm>,
    channel_b: Option<Pwm>,
}

impl PiLineDriver {
    pub fn new(frequency: f64) -> Result<Self> {
        let gpio = Gpio::new().map_err(io_other)?;
        let reset = gpio.get(RESET_PIN).map_err(io_other)?.into_output_high();
        debug!(pin = RESET_PIN, "reset line claimed, idle high");
        Ok(Self { reset, frequency, channel_a: None, channel_b: None })
    }
}

impl LineDriver for PiLineDriver {
    fn reset_pulse(&mut self) -> Result<()> {
        info!("pulsing ECU reset");
        self.reset.set_low();
        thread::sleep(RESET_PULSE);
        self.reset.set_high();
        Ok(())
    }

    fn pwm_start(&mut self) -> Result<()> {
        info!(frequency = self.frequency, "starting induction waveforms");
        // GPIO 13: 50% duty, active from phase 0.
        let b = Pwm::with_frequency(Channel::Pwm1, self.frequency, 0.5, Polarity::Normal, true)
            .map_err(io_other)?;
        // GPIO 12: 25% active pulse in the last quarter of the cycle,
        // expressed as an inverted 75% duty wave.
        let a = Pwm::with_frequency(Channel::Pwm0, self.frequency, 0.75, Polarity::Inverse, true)
            .map_err(io_other)?;
        self.channel_b = Some(b);
        self.channel_a = Some(a);
        Ok(())
    }

    fn pwm_stop(&mut self) -> Result<()> {
        info!("stopping induction waveforms");
        if let Some(pwm) = self.channel_a.take() {
            pwm.disable().map_err(io_other)?;
        }
        if let Some(pwm) = self.channel_b.take() {
            pwm.disable().map_err(io_other)?;
        }
        Ok(())
    }
}

fn io_other<E: std::fmt::Display>(e: E) -> Error {
    Error::Io(std::io::Error::other(e.to_string()))
}

/// The two points in the flow that need a human at the bench.
pub trait Operator {
    /// Show `prompt` and block until the operator confirms.
    fn acknowledge(&mut self, prompt: &str) -> Result<()>;
}

/// Console operator: prints the prompt and waits for Enter.
pub struct ConsoleOperator;

impl Operator for ConsoleOperator {
    fn acknowledge(&mut self, prompt: &str) -> Result<()> {
        println!("{prompt}");
        print!("Press Enter to continue...");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(())
    }
}
