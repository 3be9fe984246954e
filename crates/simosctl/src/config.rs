//! Tool configuration
//!
//! Everything host-dependent is overridable through `SIMOSCTL_*` environment
//! variables; the defaults match the reference bench setup (Raspberry Pi 4,
//! `can1`, solvers checked out next to the tool).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Number of empty receive windows after the `6B` request before the
/// induction gives up on a positive acknowledgement and switches to the
/// ISO-TP shell anyway.
pub const DEFAULT_NONE_MSG_THRESHOLD: u32 = 60;

/// One iteration of the validator CRC loop. Host dependent: ~50 us on a
/// Pi 3B+, ~80 us on a Pi 4, up to 10 ms on slower boards. Adjust until the
/// boot password read probes a 0x100 byte range.
pub const DEFAULT_CRC_DELAY: Duration = Duration::from_micros(80);

/// Induction waveform frequency in Hz.
pub const DEFAULT_PWM_FREQUENCY: f64 = 3210.0;

#[derive(Debug, Clone)]
pub struct Config {
    /// SocketCAN interface name. The Pi sometimes only brings up `can1`.
    pub can_interface: String,
    /// Delay between the validator trigger and the BSL upload.
    pub crc_delay: Duration,
    /// Starting value for the expected timer range of the seed/key search.
    pub seed_start: String,
    /// Path to the `twister` seed/key solver binary.
    pub twister_path: PathBuf,
    /// Path to the CRC preimage solver binary.
    pub crc_solver_path: PathBuf,
    /// Stage-two BSL image streamed into SRAM.
    pub bsl_image: PathBuf,
    /// Induction waveform frequency.
    pub pwm_frequency: f64,
    /// Empty-window count before the tolerant induction proceeds.
    pub none_msg_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            can_interface: "can1".to_string(),
            crc_delay: DEFAULT_CRC_DELAY,
            seed_start: "1800000".to_string(),
            twister_path: PathBuf::from("Simos8_SBOOT/twister"),
            crc_solver_path: PathBuf::from("crchack/crc_bruteforce"),
            bsl_image: PathBuf::from("bootloader.bin"),
            pwm_frequency: DEFAULT_PWM_FREQUENCY,
            none_msg_threshold: DEFAULT_NONE_MSG_THRESHOLD,
        }
    }
}

impl Config {
    /// Build a configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(iface) = env::var("SIMOSCTL_CAN_IFACE") {
            config.can_interface = iface;
        }
        if let Some(us) = parse_var::<u64>("SIMOSCTL_CRC_DELAY_US") {
            config.crc_delay = Duration::from_micros(us);
        }
        if let Ok(start) = env::var("SIMOSCTL_SEED_START") {
            config.seed_start = start;
        }
        if let Ok(path) = env::var("SIMOSCTL_TWISTER") {
            config.twister_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var("SIMOSCTL_CRC_SOLVER") {
            config.crc_solver_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var("SIMOSCTL_BSL_IMAGE") {
            config.bsl_image = PathBuf::from(path);
        }
        if let Some(hz) = parse_var::<f64>("SIMOSCTL_PWM_HZ") {
            config.pwm_frequency = hz;
        }
        if let Some(count) = parse_var::<u32>("SIMOSCTL_NONE_THRESHOLD") {
            config.none_msg_threshold = count;
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.can_interface, "can1");
        assert_eq!(config.crc_delay, Duration::from_micros(80));
        assert_eq!(config.none_msg_threshold, 60);
        assert_eq!(config.seed_start, "1800000");
    }
}
