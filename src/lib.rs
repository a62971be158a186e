//!
//! fatkit: A library and CLI to format and access FAT12/16/32 volumes.
//!
//! This crate provides tools for:
//! - Stacking byte-range streams over an image: partitions, offsets, byte
//!   swapping, remapping and write-back buffering
//! - Planning and writing the layout of new FAT volumes
//! - Mounting volumes, walking and extending cluster chains
//! - Reading, writing, creating and removing files and directories
//! - Handling user commands of the interactive tool
//!
//! # Re-exports
//! - [`FileSystem`]: A mounted FAT volume
//! - [`FATVol`]: The FAT engine of a volume
//! - [`Stream`]: A layer of a stream chain

pub mod cancel;
pub mod codepage;
pub mod commands;
pub mod constants;
pub mod filesystem;
pub mod stream;
pub mod traits;
pub mod utils;

/// FAT engine (see [`filesystem::fat::FATVol`]).
pub use crate::filesystem::fat::FATVol;
/// A mounted FAT volume (see [`filesystem::FileSystem`]).
pub use crate::filesystem::FileSystem;
/// A layer of a stream chain (see [`stream::Stream`]).
pub use crate::stream::Stream;
