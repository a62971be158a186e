//! Write-back buffering filter.
//!
//! Keeps one aligned window of the next stream in memory. Accesses inside the
//! window never reach the device; a dirty window is written back when another
//! window is needed, on flush and on release.

use log::trace;

use super::{Geometry, Stream, StreamError, StreamMeta};
use crate::codepage::Codepage;
use crate::constants::SECTOR_SIZE;

/// Caches one aligned window of the next stream.
pub struct BufferStream {
    next: Box<dyn Stream>,
    window_size: usize,
    /// Start of the cached window, if any.
    start: Option<u64>,
    data: Vec<u8>,
    /// Count of bytes of the window that exist on the next stream or were written.
    valid: usize,
    /// Dirty byte range, relative to the window start.
    dirty: Option<(usize, usize)>,
}

impl BufferStream {
    /// Wraps `next` with a window of `window_size` bytes.
    ///
    /// # Errors
    /// Returns `StreamError::InvalidWindow` unless `window_size` is a non-zero
    /// multiple of the sector size.
    pub fn new(next: Box<dyn Stream>, window_size: usize) -> Result<Self, StreamError> {
        if window_size == 0 || window_size % SECTOR_SIZE != 0 {
            return Err(StreamError::InvalidWindow(window_size));
        }
        Ok(Self {
            next,
            window_size,
            start: None,
            data: vec![0; window_size],
            valid: 0,
            dirty: None,
        })
    }

    fn write_back(&mut self) -> Result<(), StreamError> {
        if let (Some(start), Some((lo, hi))) = (self.start, self.dirty) {
            trace!("Writing back bytes {}..{}", start + lo as u64, start + hi as u64);
            let written = self.next.force_write(&self.data[lo..hi], start + lo as u64)?;
            if written != hi - lo {
                return Err(StreamError::ShortTransfer {
                    offset: start + lo as u64,
                    expected: hi - lo,
                    done: written,
                });
            }
            self.dirty = None;
        }
        Ok(())
    }

    /// Makes the window holding `offset` current and returns its start.
    fn load(&mut self, offset: u64) -> Result<u64, StreamError> {
        let start = offset - offset % self.window_size as u64;
        if self.start == Some(start) {
            return Ok(start);
        }

        self.write_back()?;
        self.start = None;
        self.valid = self.next.force_read(&mut self.data, start)?;
        self.data[self.valid..].fill(0);
        self.start = Some(start);
        Ok(start)
    }
}

impl Stream for BufferStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        let start = self.load(offset)?;
        let pos = (offset - start) as usize;
        if pos >= self.valid {
            return Ok(0);
        }
        let len = buf.len().min(self.valid - pos);
        buf[..len].copy_from_slice(&self.data[pos..pos + len]);
        Ok(len)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StreamError> {
        let start = self.load(offset)?;
        let pos = (offset - start) as usize;
        let len = buf.len().min(self.window_size - pos);
        self.data[pos..pos + len].copy_from_slice(&buf[..len]);

        // Bytes between the end of the data and a write beyond it are zeros.
        self.dirty = Some(match self.dirty {
            Some((lo, hi)) => (lo.min(pos.min(self.valid)), hi.max(pos + len)),
            None => (pos.min(self.valid), pos + len),
        });
        self.valid = self.valid.max(pos + len);
        Ok(len)
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.write_back()?;
        self.next.flush()
    }

    fn release(&mut self) -> Result<(), StreamError> {
        self.write_back()?;
        self.start = None;
        self.next.release()
    }

    fn set_geometry(&mut self, geometry: &mut Geometry) -> Result<(), StreamError> {
        self.next.set_geometry(geometry)
    }

    fn metadata(&mut self) -> Result<StreamMeta, StreamError> {
        self.next.metadata()
    }

    fn charset(&self) -> Option<&dyn Codepage> {
        self.next.charset()
    }

    fn discard(&mut self) -> Result<(), StreamError> {
        self.start = None;
        self.dirty = None;
        self.valid = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DeviceStream;

    #[test]
    fn writes_stay_in_memory_until_flush() {
        let mut buffered = BufferStream::new(Box::new(DeviceStream::memory(8192)), 4096).unwrap();
        assert_eq!(buffered.write(b"hello", 100).unwrap(), 5);

        let mut buf = [0u8; 5];
        buffered.force_read(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");

        // Switching window writes the dirty one back
        buffered.force_read(&mut buf, 4096).unwrap();
        buffered.force_read(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn writes_are_clamped_to_the_window() {
        let mut buffered = BufferStream::new(Box::new(DeviceStream::memory(8192)), 4096).unwrap();
        let data = vec![7u8; 200];
        assert_eq!(buffered.write(&data, 4000).unwrap(), 96);
        assert_eq!(buffered.force_write(&data, 4000).unwrap(), 200);
        buffered.flush().unwrap();

        let mut buf = vec![0u8; 200];
        buffered.discard().unwrap();
        buffered.force_read(&mut buf, 4000).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn discard_drops_pending_data() {
        let mut buffered = BufferStream::new(Box::new(DeviceStream::memory(4096)), 1024).unwrap();
        buffered.write(b"lost", 0).unwrap();
        buffered.discard().unwrap();

        let mut buf = [0xFFu8; 4];
        buffered.force_read(&mut buf, 0).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn bad_windows_are_rejected() {
        for window in [0, 100, 1000] {
            assert!(matches!(
                BufferStream::new(Box::new(DeviceStream::memory(4096)), window),
                Err(StreamError::InvalidWindow(w)) if w == window
            ));
        }
    }
}
