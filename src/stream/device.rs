//! The terminal stream of every chain.
//!
//! A [`DeviceStream`] wraps anything that is `Read + Write + Seek`: an image
//! file, a raw device node opened by the caller, or an in-memory buffer.
//! Opening, locking and ioctls on real devices belong to the caller.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use super::{Geometry, Stream, StreamError, StreamMeta};
use crate::codepage::Codepage;

/// Byte-addressable access to a fixed-size image.
#[derive(Debug)]
pub struct DeviceStream<T: Read + Write + Seek> {
    inner: T,
    size: u64,
    read_only: bool,
}

impl DeviceStream<File> {
    /// Opens an image file.
    ///
    /// # Parameters
    /// - `path`: Path to the image file
    /// - `writable`: Whether the image is opened for writing
    ///
    /// # Errors
    /// Returns `StreamError::Io` if the file cannot be opened.
    pub fn open(path: &Path, writable: bool) -> Result<Self, StreamError> {
        let file = File::options().read(true).write(writable).open(path)?;
        debug!("Opened {} (writable: {writable})", path.display());
        let mut dev = Self::new(file)?;
        dev.read_only = !writable;
        Ok(dev)
    }

    /// Creates (or truncates) an image file of `size` bytes.
    pub fn create(path: &Path, size: u64) -> Result<Self, StreamError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Self::new(file)
    }
}

impl DeviceStream<Cursor<Vec<u8>>> {
    /// Creates a zero-filled in-memory image of `size` bytes.
    pub fn memory(size: usize) -> Self {
        Self {
            inner: Cursor::new(vec![0; size]),
            size: size as u64,
            read_only: false,
        }
    }

    /// Returns the bytes of an in-memory image.
    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_inner()
    }
}

impl<T: Read + Write + Seek> DeviceStream<T> {
    /// Wraps an already opened device.
    pub fn new(mut inner: T) -> Result<Self, StreamError> {
        let size = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner,
            size,
            read_only: false,
        })
    }

    /// Returns the size of the device in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl<T: Read + Write + Seek> Stream for DeviceStream<T> {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = buf.len().min((self.size - offset) as usize);
        self.inner.seek(SeekFrom::Start(offset))?;
        loop {
            match self.inner.read(&mut buf[..len]) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StreamError> {
        if self.read_only {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "device is read-only").into());
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        let n = self.inner.write(buf)?;
        self.size = self.size.max(offset + n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.inner.flush()?;
        Ok(())
    }

    fn release(&mut self) -> Result<(), StreamError> {
        self.flush()
    }

    fn set_geometry(&mut self, geometry: &mut Geometry) -> Result<(), StreamError> {
        if geometry.tot_sectors() == 0 && geometry.sector_size() != 0 {
            geometry.set_tot_sectors(self.size / geometry.sector_size() as u64);
        }
        Ok(())
    }

    fn metadata(&mut self) -> Result<StreamMeta, StreamError> {
        Ok(StreamMeta {
            size: Some(self.size),
            modified: None,
        })
    }

    fn charset(&self) -> Option<&dyn Codepage> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_reads_back_writes() {
        let mut dev = DeviceStream::memory(1024);
        assert_eq!(dev.write(b"abcd", 510).unwrap(), 4);
        let mut buf = [0u8; 4];
        assert_eq!(dev.force_read(&mut buf, 510).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(&dev.into_bytes()[510..514], b"abcd");
    }

    #[test]
    fn reads_stop_at_device_end() {
        let mut dev = DeviceStream::memory(16);
        let mut buf = [0xFFu8; 32];
        assert_eq!(dev.force_read(&mut buf, 8).unwrap(), 8);
        assert_eq!(dev.read(&mut buf, 16).unwrap(), 0);
    }

    #[test]
    fn geometry_gets_total_sectors() {
        let mut dev = DeviceStream::memory(2880 * 512);
        let mut geom = Geometry::default();
        geom.set_sector_size(512);
        dev.set_geometry(&mut geom).unwrap();
        assert_eq!(geom.tot_sectors(), 2880);
    }
}
