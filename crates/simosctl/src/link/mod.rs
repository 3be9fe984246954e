//! Bus transports: raw Classical CAN and the ISO-TP layer above it

pub mod can;
pub mod isotp;

pub use can::{CanBus, Frame, SocketCanBus};
pub use isotp::IsoTpLink;
