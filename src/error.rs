//! Crate-wide error type.
//!
//! `rayhunter` gives each subsystem (`diag_device`, `hdlc`, ...) its own
//! `thiserror` enum; this crate is one cohesive pipeline (parse a patch,
//! talk to a device, apply it) so all error kinds from the design live in
//! a single enum instead.

use thiserror::Error;

/// A VKP parse failure, carrying the line number and offending fragment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line {line}: {kind} (in {fragment:?})")]
pub struct ParseError {
    pub line: usize,
    pub fragment: String,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("unrecognized pragma {0:?}")]
    UnknownPragma(String),
    #[error("malformed #pragma line")]
    PragmaSyntax,
    #[error("no address/data separator ':' found")]
    MissingAddrSeparator,
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("invalid address offset {0:?}")]
    InvalidAddrOffset(String),
    #[error("expected 2 data fields (old, new), got {0}")]
    ExpectedTwoDataFields(usize),
    #[error("expected 1 data field (new, old_equal_ff enabled), got {0}")]
    ExpectedOneDataField(usize),
    #[error("invalid data field {0:?}: {1}")]
    InvalidDataField(String, String),
    #[error("decimal literal {0:?} needs {1} bits but only {2} are available")]
    NumberTooWide(String, u32, u32),
    #[error("old data length ({0}) smaller than new data length ({1})")]
    DataLengthMismatch(usize, usize),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("address 0x{addr:X} is out of the flash range [0x{base:X}, 0x{end:X})")]
    OutOfRange { addr: u64, base: u64, end: u64 },

    #[error("write request [0x{addr:X}, 0x{end:X}) is not aligned to an erase block")]
    Misalignment { addr: u64, end: u64 },

    #[error("timed out waiting for the device to respond")]
    LinkTimeout,

    #[error("the device link closed unexpectedly: {0}")]
    LinkClosed(String),

    #[error("device rejected the loader upload")]
    BootRejected,

    #[error("unrecognized bootstrap ack byte 0x{0:02X}")]
    UnknownAck(u8),

    #[error("unrecognized phone family handshake byte 0x{0:02X}")]
    UnknownFamily(u8),

    #[error("protocol violation: {0}")]
    ProtocolError(String),

    #[error("checksum mismatch: expected 0x{expected:02X}, computed 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("pre-image mismatch at address 0x{addr:X}: expected 0x{expected:02X}, found 0x{actual:02X}")]
    PreImageMismatch {
        addr: u64,
        expected: u8,
        actual: u8,
    },

    #[error("failed to read flash after retrying: {0}")]
    ReadFailed(String),

    #[error("failed to write flash: {0}")]
    WriteFailed(String),

    #[error("unsupported baud rate {0}")]
    UnsupportedSpeed(u32),

    #[error("device reports {0} flash regions, which exceeds the supported maximum of 6")]
    UnsupportedFlash(usize),

    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
