//! Error kinds for the BSL transport and the SBOOT exploitation flow
//!
//! Device-reported errors mirror the single status byte the bootstrap
//! loader returns after every command; host-detected errors cover protocol
//! violations noticed on this side of the bus.

use thiserror::Error;

/// Status byte the BSL sends when a command succeeded.
pub const BSL_SUCCESS: u8 = 0x55;

#[derive(Debug, Error)]
pub enum Error {
    // Device-reported BSL status bytes (0xFF..0xF7).
    #[error("BSL rejected the block type")]
    BlockType,
    #[error("BSL is in the wrong mode for this command")]
    Mode,
    #[error("BSL checksum mismatch")]
    Checksum,
    #[error("BSL rejected the address")]
    Address,
    #[error("flash erase failed")]
    Erase,
    #[error("flash programming failed")]
    Program,
    #[error("flash page verification failed")]
    Verification,
    #[error("flash protection is still installed")]
    Protection,
    #[error("BSL reported a timeout")]
    Timeout,
    #[error("BSL returned unknown status byte {0:#04x}")]
    UnknownStatus(u8),

    // Host-detected protocol failures.
    #[error("sequence mismatch: expected {expected:#04x}, got {got:#04x}")]
    SequenceMismatch { expected: u8, got: u8 },
    #[error("SBOOT induction failed (failure report on id 0x0A7)")]
    InductionFailure,
    #[error("timed out waiting for {0}")]
    HandshakeTimeout(&'static str),
    #[error("frame from unexpected CAN id {0:#05x}")]
    UnexpectedId(u16),
    #[error("short frame: {0} bytes")]
    ShortFrame(usize),
    #[error("{0}")]
    Unsupported(&'static str),

    // Wrapped host-side failures.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("LZ4 block decode failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
    #[error("solver subprocess failed: {0}")]
    Subprocess(String),
}

impl Error {
    /// Map a BSL status byte to an error; `None` means success.
    pub fn from_status(status: u8) -> Option<Error> {
        match status {
            BSL_SUCCESS => None,
            0xFF => Some(Error::BlockType),
            0xFE => Some(Error::Mode),
            0xFD => Some(Error::Checksum),
            0xFC => Some(Error::Address),
            0xFB => Some(Error::Erase),
            0xFA => Some(Error::Program),
            0xF9 => Some(Error::Verification),
            0xF8 => Some(Error::Protection),
            0xF7 => Some(Error::Timeout),
            other => Some(Error::UnknownStatus(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_maps_to_none() {
        assert!(Error::from_status(BSL_SUCCESS).is_none());
    }

    #[test]
    fn test_status_bytes_map_to_named_kinds() {
        let cases: [(u8, fn(&Error) -> bool); 9] = [
            (0xFF, |e| matches!(e, Error::BlockType)),
            (0xFE, |e| matches!(e, Error::Mode)),
            (0xFD, |e| matches!(e, Error::Checksum)),
            (0xFC, |e| matches!(e, Error::Address)),
            (0xFB, |e| matches!(e, Error::Erase)),
            (0xFA, |e| matches!(e, Error::Program)),
            (0xF9, |e| matches!(e, Error::Verification)),
            (0xF8, |e| matches!(e, Error::Protection)),
            (0xF7, |e| matches!(e, Error::Timeout)),
        ];
        for (byte, check) in cases {
            let err = Error::from_status(byte).expect("status byte must map to an error");
            assert!(check(&err), "wrong mapping for {byte:#04x}: {err:?}");
        }
    }

    #[test]
    fn test_unknown_status_is_preserved() {
        match Error::from_status(0x13) {
            Some(Error::UnknownStatus(0x13)) => {}
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
