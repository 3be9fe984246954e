//! Out-of-process solver collaborators
//!
//! The seed/key search and the CRC preimage inversion stay external
//! binaries with narrow hex-in/hex-out contracts. Their stderr passes
//! through to the console so solver diagnostics reach the operator.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hexstr;
use crate::oracle::ProbeResult;

/// The recovered boot passwords, in password-word order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPasswords(pub [u32; 4]);

impl BootPasswords {
    /// Concatenated little-endian words, the layout they occupy in flash.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, word) in self.0.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

/// Seed to key, normally the `twister` binary.
pub trait KeySolver {
    fn key_for_seed(&self, seed: &[u8]) -> Result<[u8; 4]>;
}

/// CRC pairs to boot passwords.
pub trait PreimageSolver {
    fn solve(&self, probes: &[ProbeResult]) -> Result<BootPasswords>;
}

/// `twister <seed_start> <seed_hex> 1` prints the key as hex on stdout.
pub struct TwisterKeySolver {
    path: PathBuf,
    seed_start: String,
}

impl TwisterKeySolver {
    pub fn new(path: PathBuf, seed_start: String) -> Self {
        Self { path, seed_start }
    }
}

impl KeySolver for TwisterKeySolver {
    fn key_for_seed(&self, seed: &[u8]) -> Result<[u8; 4]> {
        let seed_hex = hexstr::encode(seed);
        info!(seed = %seed_hex, start = %self.seed_start, "running key solver");
        let output = Command::new(&self.path)
            .arg(&self.seed_start)
            .arg(&seed_hex)
            .arg("1")
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| Error::Subprocess(format!("{}: {e}", self.path.display())))?;
        if !output.status.success() {
            return Err(Error::Subprocess(format!(
                "{} exited with {}",
                self.path.display(),
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let key = hexstr::decode(stdout.trim())
            .ok_or_else(|| Error::Subprocess(format!("malformed key output: {stdout:?}")))?;
        debug!(key = %hexstr::encode(&key), "key solver done");
        key.try_into()
            .map_err(|_| Error::Subprocess("key solver did not return 4 bytes".to_string()))
    }
}

/// CRC preimage subprocess: one invocation per extraction, fed the four
/// `crc_hex:range_len_hex` pairs in probe-address order, expected to print
/// the four password words as 32 hex digits.
pub struct CrcPreimageSolver {
    path: PathBuf,
}

impl CrcPreimageSolver {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl PreimageSolver for CrcPreimageSolver {
    fn solve(&self, probes: &[ProbeResult]) -> Result<BootPasswords> {
        let mut command = Command::new(&self.path);
        for probe in probes {
            command.arg(format!("{:08x}:{:x}", probe.crc, probe.range_len()));
        }
        info!(path = %self.path.display(), "running CRC preimage solver");
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| Error::Subprocess(format!("{}: {e}", self.path.display())))?;
        if !output.status.success() {
            return Err(Error::Subprocess(format!(
                "{} exited with {}",
                self.path.display(),
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let bytes = hexstr::decode(stdout.trim())
            .filter(|b| b.len() == 16)
            .ok_or_else(|| Error::Subprocess(format!("malformed password output: {stdout:?}")))?;
        let mut words = [0u32; 4];
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            words[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(BootPasswords(words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_passwords_byte_layout() {
        let passwords = BootPasswords([0x5B49_B653, 0xB1FE_1F8E, 0xCE9C_2B1E, 0xA584_FB46]);
        let bytes = passwords.to_bytes();
        assert_eq!(&bytes[..4], &[0x53, 0xB6, 0x49, 0x5B]);
        assert_eq!(&bytes[4..8], &[0x8E, 0x1F, 0xFE, 0xB1]);
    }
}
