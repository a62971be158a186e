//! Error types for the stream chain.
//!
//! Every layer forwards the first failure it sees without retrying, so the
//! variants here describe both device failures and violations of the bounds
//! a filter enforces.

use std::io;
use thiserror;

/// Represents errors that can occur while accessing a chain of streams.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    /// Wraps an I/O error of the underlying device.
    #[error("I/O error: {0}")]
    Io(io::Error),
    /// An access reached outside of the range a filter exposes.
    #[error("Access at byte {offset} is out of range (limit: {limit})")]
    Range { offset: u64, limit: u64 },
    /// The boot record does not carry the 0x55AA marker.
    /// Contains the invalid signature value that was found.
    #[error("Invalid signature: 0x{0:04X}")]
    BadSignature(u16),
    /// The requested partition number is outside of 1..=4.
    #[error("Invalid partition {0} (must be between 1 and 4)")]
    InvalidPartition(u8),
    /// The selected partition table entry is empty.
    #[error("Partition {0} does not exist")]
    NoSuchPartition(u8),
    /// The offset of an offset filter lies beyond the end of the image.
    #[error("Offset {offset} is bigger than the base image ({size} bytes)")]
    OffsetTooLarge { offset: u64, size: u64 },
    /// A remap descriptor could not be parsed.
    #[error("Bad remap descriptor near `{0}`")]
    InvalidDescriptor(String),
    /// A buffer window is empty or not a whole number of sectors.
    #[error("Invalid buffer window of {0} bytes (must be a non-zero multiple of 512)")]
    InvalidWindow(usize),
    /// A sector-sized transfer stopped early.
    #[error("Short transfer at byte {offset}: {done} of {expected} bytes")]
    ShortTransfer {
        offset: u64,
        expected: usize,
        done: usize,
    },
}

/// Converts standard I/O errors into StreamError.
impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::Io(err)
    }
}
