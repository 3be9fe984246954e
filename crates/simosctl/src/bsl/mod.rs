//! Bootstrap loader transports and operations
//!
//! Frame encoding, the framed (Simos 8) and single-frame (Simos 18)
//! protocol clients, the SRAM uploader and the file-level memory
//! operations built on top.

pub mod frame;
pub mod legacy;
pub mod memory;
pub mod protocol;
pub mod upload;

pub use protocol::BslClient;
pub use upload::upload_bsl;
