//! Remapping filter.
//!
//! A remap descriptor is a comma-separated list of items, each an optional
//! keyword followed by a size (`512`, `4K`, `2M`, `1G`, `8s`):
//!
//! - `N`: the next N logical bytes come from the current physical position
//! - `zeroN`: the next N logical bytes read as zeros and consume nothing
//! - `skipN`: N physical bytes are skipped, without producing logical bytes
//! - `posN`: the physical position is set to N
//!
//! Everything after the last item maps to the physical bytes that follow.
//! For instance `skip512,zero1024,4096` exposes 1024 zero bytes followed by
//! the image from physical byte 512 on.

use log::debug;

use super::{Geometry, Stream, StreamError, StreamMeta};
use crate::codepage::Codepage;
use crate::utils;

/// How a run of logical bytes is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Bytes are forwarded to the next stream.
    Data,
    /// Bytes read as zero and cannot be written.
    Zero,
}

/// One run of the remap table, starting at logical offset `remapped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Physical offset matching the first byte of the run.
    pub orig: u64,
    /// Logical offset of the first byte of the run.
    pub remapped: u64,
    pub kind: SegmentKind,
}

/// Parses a descriptor into a table sorted by logical offset.
pub fn parse_descriptor(descriptor: &str) -> Result<Vec<Segment>, StreamError> {
    let mut segments = vec![];
    let mut orig = 0u64;
    let mut remapped = 0u64;
    let mut rest = descriptor;

    loop {
        if rest.is_empty() {
            // implicit trailing data run
            segments.push(Segment {
                orig,
                remapped,
                kind: SegmentKind::Data,
            });
            break;
        }

        let (keyword, body) = ["skip", "zero", "pos"]
            .iter()
            .find_map(|k| rest.strip_prefix(k).map(|body| (*k, body)))
            .unwrap_or(("", rest));

        let (len, after) =
            utils::parse_size(body).ok_or_else(|| StreamError::InvalidDescriptor(rest.to_string()))?;
        rest = match after.strip_prefix(',') {
            Some(tail) if !tail.is_empty() => tail,
            Some(_) => return Err(StreamError::InvalidDescriptor(after.to_string())),
            None if after.is_empty() => after,
            None => return Err(StreamError::InvalidDescriptor(after.to_string())),
        };

        match keyword {
            "pos" => orig = len,
            "skip" => orig += len,
            "zero" => {
                segments.push(Segment {
                    orig,
                    remapped,
                    kind: SegmentKind::Zero,
                });
                remapped += len;
            }
            _ => {
                segments.push(Segment {
                    orig,
                    remapped,
                    kind: SegmentKind::Data,
                });
                remapped += len;
                orig += len;
            }
        }
    }

    Ok(segments)
}

/// Exposes a stream through a remap table.
pub struct RemapStream {
    next: Box<dyn Stream>,
    segments: Vec<Segment>,
}

impl RemapStream {
    /// Builds the table for `descriptor` and wraps `next` with it.
    pub fn open(next: Box<dyn Stream>, descriptor: &str) -> Result<Self, StreamError> {
        let segments = parse_descriptor(descriptor)?;
        debug!("Remap table for {descriptor:?}: {segments:?}");
        Ok(Self { next, segments })
    }

    /// Translates a logical access into the segment serving it.
    ///
    /// Returns the segment kind, the physical offset and the length clamped
    /// to the end of the segment.
    fn translate(&self, offset: u64, len: usize) -> (SegmentKind, u64, usize, u64) {
        let idx = self
            .segments
            .partition_point(|s| s.remapped <= offset)
            .saturating_sub(1);
        let seg = self.segments[idx];

        let (len, end) = match self.segments.get(idx + 1) {
            Some(next) => (len.min((next.remapped - offset) as usize), next.remapped),
            None => (len, u64::MAX),
        };

        (seg.kind, offset - seg.remapped + seg.orig, len, end)
    }
}

impl Stream for RemapStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        let (kind, phys, len, _) = self.translate(offset, buf.len());
        match kind {
            SegmentKind::Data => self.next.read(&mut buf[..len], phys),
            SegmentKind::Zero => {
                buf[..len].fill(0);
                Ok(len)
            }
        }
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StreamError> {
        let (kind, phys, len, end) = self.translate(offset, buf.len());
        match kind {
            SegmentKind::Data => self.next.write(&buf[..len], phys),
            SegmentKind::Zero => Err(StreamError::Range { offset, limit: end }),
        }
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.next.flush()
    }

    fn release(&mut self) -> Result<(), StreamError> {
        self.segments.clear();
        self.next.release()
    }

    fn set_geometry(&mut self, geometry: &mut Geometry) -> Result<(), StreamError> {
        self.next.set_geometry(geometry)
    }

    fn metadata(&mut self) -> Result<StreamMeta, StreamError> {
        Ok(StreamMeta::default())
    }

    fn charset(&self) -> Option<&dyn Codepage> {
        self.next.charset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DeviceStream;

    fn patterned_device() -> DeviceStream<std::io::Cursor<Vec<u8>>> {
        let mut dev = DeviceStream::memory(8192);
        let pattern: Vec<u8> = (0..8192u32).map(|i| (i / 256) as u8 + 1).collect();
        dev.write(&pattern, 0).unwrap();
        dev
    }

    #[test]
    fn descriptor_table() {
        let table = parse_descriptor("skip512,zero1024,4096").unwrap();
        assert_eq!(
            table,
            vec![
                Segment { orig: 512, remapped: 0, kind: SegmentKind::Zero },
                Segment { orig: 512, remapped: 1024, kind: SegmentKind::Data },
                Segment { orig: 4608, remapped: 5120, kind: SegmentKind::Data },
            ]
        );
    }

    #[test]
    fn reads_follow_the_table() {
        let mut remap = RemapStream::open(Box::new(patterned_device()), "skip512,zero1024,4096").unwrap();

        // A read straddling the zero run stops at its end
        let mut buf = vec![0xFFu8; 2048];
        assert_eq!(remap.read(&mut buf, 0).unwrap(), 1024);
        assert!(buf[..1024].iter().all(|&b| b == 0));

        // Data comes from physical byte 512 on
        let mut buf = [0u8; 4];
        remap.force_read(&mut buf, 1024).unwrap();
        assert_eq!(buf, [3, 3, 3, 3]);

        // The trailing run continues where the explicit one stopped
        remap.force_read(&mut buf, 5120).unwrap();
        assert_eq!(buf, [19, 19, 19, 19]);
    }

    #[test]
    fn writes_into_zero_runs_fail() {
        let mut remap = RemapStream::open(Box::new(patterned_device()), "skip512,zero1024,4096").unwrap();
        assert!(matches!(
            remap.write(b"x", 100),
            Err(StreamError::Range { offset: 100, limit: 1024 })
        ));
        assert_eq!(remap.write(b"xy", 1024).unwrap(), 2);
    }

    #[test]
    fn skip_hides_bytes_instead_of_shifting_them() {
        // `skip512` drops the first 512 physical bytes: nothing is exposed for
        // them, so logical byte 0 is the start of the zero run
        let mut remap = RemapStream::open(Box::new(patterned_device()), "skip512,zero1024,4096").unwrap();
        let mut buf = [0xFFu8; 4];
        remap.force_read(&mut buf, 0).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
        remap.force_read(&mut buf, 1536).unwrap();
        assert_eq!(buf, [5, 5, 5, 5]);

        // The layout of 512 shifted bytes, a zero hole and an unshifted tail
        // is spelled with explicit positions
        let mut remap =
            RemapStream::open(Box::new(patterned_device()), "pos512,512,zero1024,pos1536,4096").unwrap();
        remap.force_read(&mut buf, 0).unwrap();
        assert_eq!(buf, [3, 3, 3, 3]);
        remap.force_read(&mut buf, 512).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
        remap.force_read(&mut buf, 1536).unwrap();
        assert_eq!(buf, [7, 7, 7, 7]);
        remap.force_read(&mut buf, 5628).unwrap();
        assert_eq!(buf, [22, 22, 22, 22]);
        assert!(matches!(
            remap.write(b"x", 600),
            Err(StreamError::Range { offset: 600, limit: 1536 })
        ));
    }

    #[test]
    fn pos_and_suffixes() {
        let table = parse_descriptor("pos1K,2s").unwrap();
        assert_eq!(table[0], Segment { orig: 1024, remapped: 0, kind: SegmentKind::Data });
        assert_eq!(table[1], Segment { orig: 2048, remapped: 1024, kind: SegmentKind::Data });
    }

    #[test]
    fn malformed_descriptors() {
        assert!(matches!(parse_descriptor("zerox"), Err(StreamError::InvalidDescriptor(_))));
        assert!(matches!(parse_descriptor("512;"), Err(StreamError::InvalidDescriptor(_))));
        assert!(matches!(parse_descriptor("512,"), Err(StreamError::InvalidDescriptor(_))));
    }
}
