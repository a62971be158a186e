//! Layered byte-range I/O.
//!
//! A volume is never accessed directly: every access goes through a chain of
//! [`Stream`] objects. Each filter owns the next stream of the chain and
//! translates, restricts or transforms the requests it forwards. The chain
//! always ends in a [`DeviceStream`], which owns nothing but the image itself.
//!
//! `preallocate` and `discard` default to a no-op; every other operation is
//! implemented by each filter.

pub mod buffer;
pub mod device;
pub mod offset;
pub mod partition;
pub mod remap;
pub mod stream_error;
pub mod swap;

use std::time::SystemTime;

use getset::{CopyGetters, Setters};

use crate::codepage::Codepage;

pub use buffer::BufferStream;
pub use device::DeviceStream;
pub use offset::OffsetStream;
pub use partition::PartitionStream;
pub use remap::RemapStream;
pub use stream_error::StreamError;
pub use swap::SwapStream;

/// Physical description of a device, filled in by the streams of a chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct Geometry {
    /// Total count of sectors, 0 when unknown.
    tot_sectors: u64,
    /// The size of a sector in bytes.
    sector_size: u16,
    /// Number of heads.
    heads: u16,
    /// Sectors per track.
    sectors: u16,
    /// Sectors preceding the volume on its device.
    hidden: u32,
}

/// Metadata reported by a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamMeta {
    /// Size in bytes, when the stream knows it.
    pub size: Option<u64>,
    /// Last modification time, when the stream knows it.
    pub modified: Option<SystemTime>,
}

/// A byte-addressable object in a chain of streams.
pub trait Stream {
    /// Reads up to `buf.len()` bytes at `offset`. Returns 0 at the end of the stream.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError>;

    /// Writes up to `buf.len()` bytes at `offset` and returns the count written.
    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StreamError>;

    /// Pushes pending data down the chain.
    fn flush(&mut self) -> Result<(), StreamError>;

    /// Flushes and releases the resources held by the chain.
    fn release(&mut self) -> Result<(), StreamError>;

    /// Lets the stream adjust the device geometry.
    fn set_geometry(&mut self, geometry: &mut Geometry) -> Result<(), StreamError>;

    /// Returns what the stream knows about itself.
    fn metadata(&mut self) -> Result<StreamMeta, StreamError>;

    /// Returns the character set used for names on this stream, if any.
    fn charset(&self) -> Option<&dyn Codepage>;

    /// Announces that the stream is about to grow to `size` bytes.
    fn preallocate(&mut self, _size: u64) -> Result<(), StreamError> {
        Ok(())
    }

    /// Drops cached data without writing it.
    fn discard(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    /// Reads until `buf` is full or the end of the stream is reached.
    fn force_read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Writes until all of `buf` is written or the stream refuses more data.
    fn force_write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StreamError> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.write(&buf[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }
}
