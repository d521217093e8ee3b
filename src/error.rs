use thiserror::Error;

/// Failures the core can report to its driver. Once a machine is running,
/// the only error that can surface from stepping is `InvalidInstruction`;
/// every other in-step anomaly resolves locally (reads 0xff, writes
/// dropped).
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("invalid opcode 0x{opcode:02x} at 0x{pc:04x}")]
    InvalidInstruction { pc: u16, opcode: u8 },
    #[error("unsupported cartridge type 0x{0:02x}")]
    UnsupportedCartridge(u8),
    #[error("cartridge image is missing the information area at 0100-014f")]
    BadCartridge,
    #[error("boot image must be exactly 256 bytes")]
    BadBoot,
    #[error("snapshot is truncated or from an incompatible version")]
    BadSnapshot,
}

pub type Result<T> = std::result::Result<T, Error>;
