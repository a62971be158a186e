//! Filter for byte-swapped filesystems.
//!
//! Accesses are widened to whole 16-bit words, so that odd offsets and
//! lengths see the same bytes as aligned ones.

use super::{Geometry, Stream, StreamError, StreamMeta};
use crate::codepage::Codepage;

/// Exchanges the bytes of every 16-bit word on the way in and out.
pub struct SwapStream {
    next: Box<dyn Stream>,
}

impl SwapStream {
    pub fn new(next: Box<dyn Stream>) -> Self {
        Self { next }
    }
}

fn swap_pairs(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Returns the even offset a word access starts at, and the count of bytes before `offset`.
fn word_start(offset: u64) -> (u64, usize) {
    let start = offset & !1;
    (start, (offset - start) as usize)
}

impl Stream for SwapStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        let (start, lead) = word_start(offset);
        let mut words = vec![0u8; (lead + buf.len() + 1) & !1];
        // A trailing byte without its pair cannot be swapped
        let n = self.next.read(&mut words, start)? & !1;
        if n <= lead {
            return Ok(0);
        }

        swap_pairs(&mut words[..n]);
        let len = (n - lead).min(buf.len());
        buf[..len].copy_from_slice(&words[lead..lead + len]);
        Ok(len)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (start, lead) = word_start(offset);
        let mut words = vec![0u8; (lead + buf.len() + 1) & !1];
        if words.len() != buf.len() {
            // Partial words keep their other byte
            self.next.force_read(&mut words, start)?;
            swap_pairs(&mut words);
        }

        words[lead..lead + buf.len()].copy_from_slice(buf);
        swap_pairs(&mut words);
        let written = self.next.force_write(&words, start)?;
        Ok(written.saturating_sub(lead).min(buf.len()))
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.next.flush()
    }

    fn release(&mut self) -> Result<(), StreamError> {
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
}
