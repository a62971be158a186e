//! Partition filter.
//!
//! This module parses the Master Boot Record found in the first sector of a
//! device and restricts a stream to one of its four primary partitions.
//! It defines structures to interpret partition table entries, check the
//! consistency of the table and display its layout.

use getset::Getters;
use log::{debug, warn};
use std::fmt::Write;
use std::fmt::{self, Display};

use super::{Geometry, Stream, StreamError, StreamMeta};
use crate::codepage::Codepage;
use crate::constants::{PART_CNT, SECTOR_SIZE};
use crate::traits::LayoutDisplay;
use crate::utils;

/// Offset of the first partition table entry in the boot record.
const PT_OFFSET: usize = 446;

/// Represents the type of a partition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PTType {
    /// Unused entry.
    Empty,
    /// FAT12 partition.
    Fat12,
    /// FAT16 partition (CHS or LBA addressed).
    Fat16,
    /// FAT32 partition, CHS addressed.
    Fat32,
    /// FAT32 partition, LBA addressed.
    LBAFat32,
    /// Unsupported partition type, encapsulating the raw type byte.
    Unsupported(u8),
}

impl Display for PTType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PTType::Empty => write!(f, "Empty"),
            PTType::Fat12 => write!(f, "FAT12"),
            PTType::Fat16 => write!(f, "FAT16"),
            PTType::Fat32 => write!(f, "FAT32"),
            PTType::LBAFat32 => write!(f, "LBA FAT32"),
            PTType::Unsupported(b) => write!(f, "Other: 0x{b:02X}"),
        }
    }
}

impl PTType {
    /// Creates a `PTType` instance from a raw byte.
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => PTType::Empty,
            0x01 => PTType::Fat12,
            0x04 | 0x06 | 0x0E => PTType::Fat16,
            0x0B => PTType::Fat32,
            0x0C => PTType::LBAFat32,
            _ => PTType::Unsupported(byte),
        }
    }
}

/// Represents a single partition table entry.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct PTEntry {
    /// The boot indicator (0x80 for the active partition).
    boot_ind: u8,
    /// The type of the partition.
    pt_type: PTType,
    /// The starting Logical Block Address (LBA) of the partition.
    lba_start: u32,
    /// The number of sectors in the partition.
    sector_cnt: u32,
}

/// Represents the boot signature of a Master Boot Record (MBR).
#[derive(Debug, Clone, Copy)]
enum BootSignature {
    /// Standard MBR boot signature (0x55AA).
    Mbr(u16),
    /// Unsupported boot signature, encapsulating the raw value.
    Unsupported(u16),
}

impl BootSignature {
    /// Creates a `BootSignature` from the little-endian word found at offset 510.
    fn from_u16(sig: u16) -> BootSignature {
        match sig {
            // The signature 0x55AA is stored on disk in little-endian byte order.
            0xAA55 => BootSignature::Mbr(0xAA55),
            other => BootSignature::Unsupported(other),
        }
    }
}

impl fmt::Display for BootSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootSignature::Mbr(sig) => write!(f, "0x{sig:04X}"),
            BootSignature::Unsupported(sig) => write!(f, "0x{sig:04X}"),
        }
    }
}

/// Represents a Master Boot Record (MBR), including partition table entries
/// and the boot signature.
#[derive(Debug)]
pub struct Mbr {
    /// The partition table entries in the MBR.
    pt_entries: [PTEntry; PART_CNT],
    /// The boot signature of the MBR.
    boot_signature: BootSignature,
    /// Size of the device in sectors, when known.
    sector_cnt: u64,
}

impl Mbr {
    /// Reads and parses an MBR from the first sector of a stream.
    ///
    /// # Returns
    /// - `Ok(Mbr)` if the boot record carries the 0x55AA signature.
    /// - `Err(StreamError::BadSignature)` if it does not.
    /// - `Err(StreamError)` if the sector cannot be read.
    pub fn from_stream(stream: &mut dyn Stream) -> Result<Mbr, StreamError> {
        let mut buffer = vec![0; SECTOR_SIZE];
        utils::read_sector(stream, 0, SECTOR_SIZE, &mut buffer)?;

        let sector_cnt = stream.metadata()?.size.unwrap_or(0) / SECTOR_SIZE as u64;
        Self::from_bytes(&buffer, sector_cnt)
    }

    /// Parses an MBR from the bytes of the first sector.
    pub fn from_bytes(buffer: &[u8], sector_cnt: u64) -> Result<Mbr, StreamError> {
        let pt_entries: [PTEntry; PART_CNT] = core::array::from_fn(|i| {
            let offset = PT_OFFSET + i * 16;
            PTEntry {
                boot_ind: buffer[offset],
                pt_type: PTType::from_byte(buffer[offset + 0x04]),
                lba_start: utils::u32_at(buffer, offset + 0x08),
                sector_cnt: utils::u32_at(buffer, offset + 0x0C),
            }
        });

        let mbr = Mbr {
            pt_entries,
            boot_signature: BootSignature::from_u16(utils::u16_at(buffer, 510)),
            sector_cnt,
        };

        mbr.check_signature()
    }

    /// Returns the entry at `index` (1-based), whether empty or not.
    pub fn entry(&self, index: u8) -> Option<&PTEntry> {
        match index {
            1..=4 => Some(&self.pt_entries[index as usize - 1]),
            _ => None,
        }
    }

    /// Returns a vector of references to non-empty partition table entries.
    pub fn pt_entries(&self) -> Vec<&PTEntry> {
        self.pt_entries
            .iter()
            .filter(|entry| entry.sector_cnt != 0)
            .collect()
    }

    /// Checks if the boot signature is valid.
    fn check_signature(self) -> Result<Self, StreamError> {
        match self.boot_signature {
            BootSignature::Unsupported(sig) => Err(StreamError::BadSignature(sig)),
            _ => Ok(self),
        }
    }

    /// Lists the inconsistencies of the partition table.
    ///
    /// An inconsistent table is still usable, so callers only report them.
    pub fn inconsistencies(&self) -> Vec<&'static str> {
        let entries = self.pt_entries();
        let mut problems = vec![];

        if !entries
            .windows(2)
            .all(|pair| pair[0].lba_start <= pair[1].lba_start)
        {
            problems.push("partition table is not sorted");
        }
        if entries.windows(2).any(|pair| {
            pair[0].lba_start as u64 + pair[0].sector_cnt as u64 > pair[1].lba_start as u64
        }) {
            problems.push("some partitions are overlapping");
        }
        if entries.iter().filter(|e| e.boot_ind == 0x80).count() > 1 {
            problems.push("more than one partition is active");
        }
        if self.sector_cnt != 0
            && entries
                .iter()
                .any(|e| e.lba_start as u64 + e.sector_cnt as u64 > self.sector_cnt)
        {
            problems.push("a partition extends beyond the end of the device");
        }

        problems
    }
}

/// Prints the layout of the disk described by the Master Boot Record.
impl LayoutDisplay for Mbr {
    fn display_layout(&self, indent: u8) -> Result<String, fmt::Error> {
        let mut out = String::from("");
        let indent = " ".repeat(indent.into());

        let mut last_end = 0;
        let disk_end = self.sector_cnt;

        writeln!(out, "{}┌{:─^55}┐", indent, " Master Boot Record Layout ")?;
        writeln!(out, "{}├{:<45}{:>10}┤", indent, "Disk Size", disk_end)?;
        writeln!(
            out,
            "{}├{:<45}{:>10}┤",
            indent,
            "Boot Signature",
            format!("{}", self.boot_signature)
        )?;
        writeln!(out, "{}├{:─^55}┤", indent, "")?;
        writeln!(
            out,
            "{}├{:^12}┬{:^12}┬{:^12}┬{:^16}┤",
            indent, "Region", "Start", "End", "Description"
        )?;
        writeln!(
            out,
            "{}├{:─<12}┼{:─<12}┼{:─<12}┼{:─<16}┤",
            indent, "", "", "", ""
        )?;

        for (i, entry) in self.pt_entries().iter().enumerate() {
            let start = u64::from(entry.lba_start);
            let end = start + u64::from(entry.sector_cnt);

            if start > last_end {
                writeln!(
                    out,
                    "{}│{:^12}│{:>12}│{:>12}│{:^16}│",
                    indent, "", last_end, start, "Unallocated"
                )?;
            }

            writeln!(
                out,
                "{}│{:^12}│{:>12}│{:>12}│{:^16}│",
                indent,
                format!("Part #{}", i + 1),
                start,
                end,
                format!("{}", entry.pt_type)
            )?;

            last_end = end;
        }

        if last_end < disk_end {
            writeln!(
                out,
                "{}│{:^12}│{:>12}│{:>12}│{:^16}│",
                indent, "", last_end, disk_end, "Unallocated"
            )?;
        }

        writeln!(
            out,
            "{}└{:─<12}┴{:─<12}┴{:─<12}┴{:─<16}┘",
            indent, "", "", "", ""
        )?;

        Ok(out)
    }
}

/// Restricts a stream to one primary partition.
pub struct PartitionStream {
    next: Box<dyn Stream>,
    /// Offset of the partition, in bytes.
    offset: u64,
    /// Size of the partition, in bytes.
    size: u64,
    /// Size of the partition, in sectors.
    sectors: u32,
}

impl PartitionStream {
    /// Opens partition `index` (1 to 4) of the device behind `next`.
    ///
    /// # Errors
    /// - `StreamError::InvalidPartition` if `index` is not between 1 and 4
    /// - `StreamError::BadSignature` if the device has no partition table
    /// - `StreamError::NoSuchPartition` if the selected entry is empty
    pub fn open(mut next: Box<dyn Stream>, index: u8) -> Result<Self, StreamError> {
        if !(1..=4).contains(&index) {
            return Err(StreamError::InvalidPartition(index));
        }

        let mbr = Mbr::from_stream(next.as_mut())?;
        let entry = match mbr.entry(index) {
            Some(entry) if entry.pt_type != PTType::Empty => entry,
            _ => return Err(StreamError::NoSuchPartition(index)),
        };

        for problem in mbr.inconsistencies() {
            warn!("Inconsistent partition table: {problem}. Possibly unpartitioned device");
        }

        debug!(
            "Partition {index}: {} sectors from sector {}",
            entry.sector_cnt, entry.lba_start
        );

        Ok(Self {
            offset: entry.lba_start as u64 * SECTOR_SIZE as u64,
            size: entry.sector_cnt as u64 * SECTOR_SIZE as u64,
            sectors: entry.sector_cnt,
            next,
        })
    }
}

impl Stream for PartitionStream {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, StreamError> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = buf.len().min((self.size - offset) as usize);
        self.next.read(&mut buf[..len], offset + self.offset)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize, StreamError> {
        if offset >= self.size {
            return Err(StreamError::Range {
                offset,
                limit: self.size,
            });
        }
        let len = buf.len().min((self.size - offset) as usize);
        self.next.write(&buf[..len], offset + self.offset)
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.next.flush()
    }

    fn release(&mut self) -> Result<(), StreamError> {
        self.next.release()
    }

    fn set_geometry(&mut self, geometry: &mut Geometry) -> Result<(), StreamError> {
        if geometry.tot_sectors() == 0 {
            geometry.set_tot_sectors(self.sectors as u64);
        }
        Ok(())
    }

    fn metadata(&mut self) -> Result<StreamMeta, StreamError> {
        let meta = self.next.metadata()?;
        Ok(StreamMeta {
            size: Some(self.size),
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

    fn partitioned_image() -> DeviceStream<std::io::Cursor<Vec<u8>>> {
        let mut dev = DeviceStream::memory(64 * SECTOR_SIZE);
        let mut mbr = vec![0u8; SECTOR_SIZE];
        // Partition 1: FAT16, sectors 8..40
        mbr[PT_OFFSET + 4] = 0x06;
        utils::set_u32_at(&mut mbr, PT_OFFSET + 8, 8);
        utils::set_u32_at(&mut mbr, PT_OFFSET + 12, 32);
        utils::set_u16_at(&mut mbr, 510, 0xAA55);
        dev.write(&mbr, 0).unwrap();
        dev.write(b"inside", 8 * SECTOR_SIZE as u64).unwrap();
        dev
    }

    #[test]
    fn partition_offsets_and_clamps() {
        let mut part = PartitionStream::open(Box::new(partitioned_image()), 1).unwrap();
        let mut buf = [0u8; 6];
        part.force_read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"inside");

        let end = 32 * SECTOR_SIZE as u64;
        let mut big = vec![0u8; 1024];
        assert_eq!(part.read(&mut big, end - 100).unwrap(), 100);
        assert_eq!(part.read(&mut big, end).unwrap(), 0);
        assert!(matches!(
            part.write(&big, end),
            Err(StreamError::Range { .. })
        ));
        assert_eq!(part.write(&big, end - 10).unwrap(), 10);
        assert_eq!(part.metadata().unwrap().size, Some(end));
    }

    #[test]
    fn missing_signature_is_rejected() {
        let dev = DeviceStream::memory(4 * SECTOR_SIZE);
        assert!(matches!(
            PartitionStream::open(Box::new(dev), 1),
            Err(StreamError::BadSignature(0))
        ));
    }

    #[test]
    fn empty_entry_is_rejected() {
        assert!(matches!(
            PartitionStream::open(Box::new(partitioned_image()), 2),
            Err(StreamError::NoSuchPartition(2))
        ));
        assert!(matches!(
            PartitionStream::open(Box::new(partitioned_image()), 5),
            Err(StreamError::InvalidPartition(5))
        ));
    }

    #[test]
    fn layout_lists_partitions() {
        let mut dev = partitioned_image();
        let mbr = Mbr::from_stream(&mut dev).unwrap();
        assert!(mbr.inconsistencies().is_empty());
        let layout = mbr.display_layout(0).unwrap();
        assert!(layout.contains("Part #1"));
        assert!(layout.contains("FAT16"));
    }
}
