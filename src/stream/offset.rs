//! Filter for filesystems stored at an offset into their image.

use super::{Geometry, Stream, StreamError, StreamMeta};
use crate::codepage::Codepage;

/// Shifts every access by a constant number of bytes.
pub struct OffsetStream {
    next: Box<dyn Stream>,
    offset: u64,
}

impl OffsetStream {
    /// Wraps `next` so that byte 0 of the new stream is byte `offset` of `next`.
    ///
    /// # Errors
    /// Returns `StreamError::OffsetTooLarge` if `next` knows its size and
    /// `offset` lies beyond it.
    pub fn open(mut next: Box<dyn Stream>, offset: u64) -> Result<Self, StreamError> {
        if let Some(size) = next.metadata()?.size {
            if offset > size {
                return Err(StreamError::OffsetTooLarge { offset, size });
            }
        }
        Ok(Self { next, offset })
    }
}

impl Stream for OffsetStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        self.next.read(buf, offset + self.offset)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StreamError> {
        self.next.write(buf, offset + self.offset)
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.next.flush()
    }

    fn release(&mut self) -> Result<(), StreamError> {
        self.next.release()
    }

    fn set_geometry(&mut self, geometry: &mut Geometry) -> Result<(), StreamError> {
        self.next.set_geometry(geometry)?;
        if geometry.tot_sectors() != 0 {
            let sector_size = match geometry.sector_size() {
                0 => 512,
                n => n as u64,
            };
            let skipped = self.offset / sector_size;
            geometry.set_tot_sectors(geometry.tot_sectors().saturating_sub(skipped));
        }
        Ok(())
    }

    fn metadata(&mut self) -> Result<StreamMeta, StreamError> {
        let meta = self.next.metadata()?;
        Ok(StreamMeta {
            size: meta.size.map(|s| s.saturating_sub(self.offset)),
            ..meta
        })
    }

    fn charset(&self) -> Option<&dyn Codepage> {
        self.next.charset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DeviceStream;

    #[test]
    fn accesses_are_shifted() {
        let mut dev = DeviceStream::memory(4096);
        dev.write(b"payload", 1024).unwrap();

        let mut off = OffsetStream::open(Box::new(dev), 1024).unwrap();
        let mut buf = [0u8; 7];
        off.force_read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"payload");
        assert_eq!(off.metadata().unwrap().size, Some(3072));

        let mut geom = Geometry::default();
        geom.set_sector_size(512);
        off.set_geometry(&mut geom).unwrap();
        assert_eq!(geom.tot_sectors(), 6);
    }

    #[test]
    fn offset_beyond_image_is_rejected() {
        let dev = DeviceStream::memory(512);
        assert!(matches!(
            OffsetStream::open(Box::new(dev), 1024),
            Err(StreamError::OffsetTooLarge { .. })
        ));
    }
}
