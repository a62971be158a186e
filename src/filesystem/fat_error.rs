//! Error types of the FAT engine.
//!
//! Boot sector validation errors keep the fields they report, the others
//! describe allocation, chain and directory failures. Failures of the
//! stream chain are wrapped unchanged.

use std::io;
use thiserror::Error;

use crate::stream::StreamError;

/// Errors that can occur while mounting, formatting or accessing a FAT volume.
#[derive(Error, Debug)]
pub enum FATError {
    /// The first three bytes of a FAT volume must contain a valid x86 jump instruction.
    #[error("Invalid jump instruction `{0}`")]
    InvalidJmp(String),

    /// Bytes per sector must be 512, 1024, 2048 or 4096.
    #[error("Invalid count of bytes per sector: `{0}`. Legal values: 512, 1024, 2048 or 4096")]
    InvalidBytesPerSec(u16),

    /// Sectors per cluster must be a power of 2: 1, 2, 4, 8, 16, 32, 64, or 128.
    #[error(
        "Invalid number of sector per cluster: `{0}`. Legal values: 1, 2, 4, 8, 16, 32, 64, 128"
    )]
    InvalidSecPerClus(u8),

    /// Total cluster size (bytes per sector × sectors per cluster) must not exceed 32 KiB.
    #[error("Invalid cluster size: `{0}`. Any value greater than 32K is invalid.")]
    InvalidClusSz(u32),

    /// The count of reserved sectors must be greater than 0.
    #[error("Invalid count of reserved sectors: `{0}`. Any value greater than 0 is valid.")]
    InvalidRsvdSecCnt(u16),

    /// The number of File Allocation Tables must be at least 1.
    #[error("Invalid number of FATs on this volume: `{0}`.")]
    InvalidNumFat(u8),

    /// The root directory entry count does not suit the FAT type.
    #[error("Invalid count of directory entries in the root directory: `{0}`.")]
    InvalidRootEntCnt(u16),

    /// The total sector count must be valid for the volume size.
    #[error("Invalid total count of sectors on the volume: `{0}`")]
    InvalidTotSec(String),

    /// The FAT size in sectors must be valid and consistent with the volume layout.
    #[error("Invalid FAT size:`{0}`")]
    InvalidFatSz(String),

    /// The root directory's first cluster number must be at least 2.
    #[error(
        "Invalid cluster number of the first cluster of the root directory: `{0}`. This value should be at least 2."
    )]
    InvalidRootClus(u32),

    /// The boot sector signature must be 0x55AA.
    #[error("Invalid BPB signature: `{0}`. Expected signature: 0x55AA")]
    InvalidSignature(String),

    /// The active FAT selected by the FAT32 extension flags does not exist.
    #[error("Active FAT {active} does not exist ({num_fat} FATs)")]
    InvalidActiveFat { active: u8, num_fat: u8 },

    /// Not enough free clusters are left for the request.
    #[error("No space left on volume: {needed} clusters needed, {free} available")]
    OutOfSpace { needed: u32, free: u32 },

    /// A cluster chain contains a free or reserved entry before its end.
    #[error("Corrupt cluster chain: cluster {cluster} links to {value:#X}")]
    CorruptChain { cluster: u32, value: u32 },

    /// A cluster number lies outside of the FAT.
    #[error("Cluster {0} is out of range")]
    ClusterOutOfRange(u32),

    /// An access reached outside of a fixed region.
    #[error("Access at byte {offset} is out of range (limit: {limit})")]
    Range { offset: u64, limit: u64 },

    /// No layout satisfies the format request.
    #[error("Cannot format: {0}")]
    FormatInfeasible(String),

    /// The operation was interrupted by a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,

    /// The file was not found
    #[error("File not found: `{0}`")]
    NotFound(String),

    /// A directory already holds an entry of that name.
    #[error("`{0}` already exists")]
    AlreadyExists(String),

    /// The name cannot be stored as a short 8.3 name.
    #[error("Invalid name: `{0}`")]
    InvalidName(String),

    /// A directory operation was attempted on a file.
    #[error("`{0}` is not a directory")]
    NotADirectory(String),

    /// A directory still holds entries.
    #[error("Directory `{0}` is not empty")]
    DirectoryNotEmpty(String),

    /// The file is still open.
    #[error("`{0}` is in use")]
    Busy(String),

    /// Errors of the stream chain.
    #[error("Stream error: {0}")]
    Stream(StreamError),

    /// Parsing error occured during structure initialization
    #[error("BinRead Error: `{0}`")]
    BinReadError(binread::Error),
}

/// Converts stream errors into FATError.
impl From<StreamError> for FATError {
    fn from(err: StreamError) -> Self {
        FATError::Stream(err)
    }
}

/// Converts standard I/O errors into FATError.
impl From<io::Error> for FATError {
    fn from(err: io::Error) -> Self {
        FATError::Stream(StreamError::Io(err))
    }
}

/// Converts BinRead errors into FATError.
impl From<binread::Error> for FATError {
    fn from(err: binread::Error) -> Self {
        FATError::BinReadError(err)
    }
}
