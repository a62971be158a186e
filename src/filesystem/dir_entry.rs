//! FAT directory entry structure and parsing.
//!
//! This module implements the FAT directory entry structure which contains metadata
//! about files and directories stored in the filesystem. Each directory entry is 32 bytes
//! and contains information such as filename, attributes, timestamps, and cluster allocation.
//! VFAT long names are stored in auxiliary slots preceding the entry they name.

use binread::{BinRead, BinReaderExt};
use getset::Getters;
use std::fmt;
use std::io;
use std::time::SystemTime;

use crate::codepage::Codepage;
use crate::constants::DIR_ENTRY_SIZE;
use crate::filesystem::fat_error::FATError;
use crate::utils::{self, set_u16_at, set_u32_at};

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
/// Attribute combination marking a long name slot.
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// First name byte of a deleted entry.
pub const DELETED_MARK: u8 = 0xE5;

/// FAT directory entry structure.
///
/// Each directory entry is exactly 32 bytes and contains metadata about a file or directory.
/// The structure follows Microsoft's FAT specification for directory entries.
///
/// # Notes
/// - The name field uses the legacy 8.3 format with space padding
/// - A first name byte of 0x05 stands for 0xE5, which otherwise marks a deleted entry
#[derive(BinRead, Debug, Clone, PartialEq, Eq, Getters)]
#[br(little)]
pub struct DirEntry {
    /// Filename in 8.3 format (8 characters name + 3 characters extension)
    #[get = "pub"]
    name: [u8; 11],
    /// File attributes byte
    #[get = "pub"]
    attr: u8,
    /// NT reserved (case flags)
    nt_res: u8,
    /// Creation time in 10ms units
    crt_time_tenth: u8,
    /// Creation time
    crt_time: u16,
    /// Creation date
    crt_date: u16,
    /// Last access date
    lst_acc_date: u16,
    /// High 16 bits of first cluster number
    fst_clus_hi: u16,
    /// Last write time
    #[get = "pub"]
    wrt_time: u16,
    /// Last write date
    #[get = "pub"]
    wrt_date: u16,
    /// Low 16 bits of first cluster number
    fst_clus_lo: u16,
    /// File size in bytes (0 for directories)
    #[get = "pub"]
    file_size: u32,
}

impl DirEntry {
    /// Creates a new entry, stamped with the current time.
    ///
    /// # Parameters
    /// - `name`: The 8.3 name, as returned by [`DirEntry::to_8_3_name`]
    /// - `attr`: The attribute byte
    /// - `cluster`: The first cluster, 0 when nothing is allocated yet
    pub fn new(name: [u8; 11], attr: u8, cluster: u32) -> Self {
        let (date, time) = utils::dos_timestamp(SystemTime::now());
        let mut entry = Self {
            name,
            attr,
            nt_res: 0,
            crt_time_tenth: 0,
            crt_time: time,
            crt_date: date,
            lst_acc_date: date,
            fst_clus_hi: 0,
            wrt_time: time,
            wrt_date: date,
            fst_clus_lo: 0,
            file_size: 0,
        };
        entry.set_cluster_number(cluster);
        entry
    }

    /// Creates a directory entry from a byte slice.
    ///
    /// # Parameters
    /// - `buf`: A byte slice containing at least 32 bytes of directory entry data
    ///
    /// # Returns
    /// - `DirEntry`: The parsed directory entry structure
    ///
    /// # Errors
    /// - `FATError::BinReadError` if the slice is too short
    pub fn from_slice(buf: &[u8]) -> Result<Self, FATError> {
        let mut reader = io::Cursor::new(buf);
        reader.read_le().map_err(FATError::from)
    }

    /// Serializes the entry into its 32 on-disk bytes.
    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        buf[0..11].copy_from_slice(&self.name);
        buf[11] = self.attr;
        buf[12] = self.nt_res;
        buf[13] = self.crt_time_tenth;
        set_u16_at(&mut buf, 14, self.crt_time);
        set_u16_at(&mut buf, 16, self.crt_date);
        set_u16_at(&mut buf, 18, self.lst_acc_date);
        set_u16_at(&mut buf, 20, self.fst_clus_hi);
        set_u16_at(&mut buf, 22, self.wrt_time);
        set_u16_at(&mut buf, 24, self.wrt_date);
        set_u16_at(&mut buf, 26, self.fst_clus_lo);
        set_u32_at(&mut buf, 28, self.file_size);
        buf
    }

    /// Checks if a given filename matches this directory entry's short name.
    ///
    /// # Parameters
    /// - `name`: The filename to compare (can include extension)
    /// - `cp`: The codepage of the volume
    ///
    /// # Returns
    /// - `true`: If the filename matches this directory entry
    /// - `false`: If the filename doesn't match or is invalid
    pub fn same_short_name(&self, name: &str, cp: &dyn Codepage) -> bool {
        match Self::to_8_3_name(name, cp) {
            Ok(short_name) => short_name == self.name,
            Err(_) => false,
        }
    }

    /// Converts a name into its padded 8.3 form.
    ///
    /// # Errors
    /// - `FATError::InvalidName` if the name does not fit in 8.3 characters,
    ///   has more than one dot or holds a character a short name cannot hold
    pub fn to_8_3_name(name: &str, cp: &dyn Codepage) -> Result<[u8; 11], FATError> {
        let invalid = || FATError::InvalidName(name.to_string());

        if name == "." || name == ".." {
            let mut short = [b' '; 11];
            short[..name.len()].copy_from_slice(name.as_bytes());
            return Ok(short);
        }

        let (base, ext) = match name.split_once('.') {
            Some((base, ext)) => (base, ext),
            None => (name, ""),
        };
        let base = cp.to_dos(base).ok_or_else(invalid)?;
        let ext = cp.to_dos(ext).ok_or_else(invalid)?;

        if base.is_empty() || base.len() > 8 || ext.len() > 3 {
            return Err(invalid());
        }
        if !base.iter().chain(ext.iter()).all(|&c| is_short_name_char(c)) {
            return Err(invalid());
        }

        let mut short = [b' '; 11];
        short[..base.len()].copy_from_slice(&base);
        short[8..8 + ext.len()].copy_from_slice(&ext);
        if short[0] == DELETED_MARK {
            short[0] = 0x05;
        }
        Ok(short)
    }

    /// Returns the short name as `NAME.EXT`.
    pub fn short_name(&self, cp: &dyn Codepage) -> String {
        let mut raw = self.name;
        if raw[0] == 0x05 {
            raw[0] = DELETED_MARK;
        }

        let name = cp.to_unicode(&raw[0..8]);
        let ext = cp.to_unicode(&raw[8..11]);
        let (name, ext) = (name.trim_end(), ext.trim_end());

        if ext.is_empty() {
            name.to_string()
        } else {
            format!("{name}.{ext}")
        }
    }

    /// Returns the complete first cluster number for this entry.
    ///
    /// # Returns
    /// - `u32`: The 32-bit cluster number combining high and low 16-bit values
    pub fn cluster_number(&self) -> u32 {
        ((self.fst_clus_hi as u32) << 16) + self.fst_clus_lo as u32
    }

    /// Stores the first cluster in the high and low words.
    pub fn set_cluster_number(&mut self, cluster: u32) {
        self.fst_clus_hi = (cluster >> 16) as u16;
        self.fst_clus_lo = cluster as u16;
    }

    pub fn set_file_size(&mut self, size: u32) {
        self.file_size = size;
    }

    /// Updates the last write date and time.
    pub fn touch(&mut self, when: SystemTime) {
        let (date, time) = utils::dos_timestamp(when);
        self.wrt_date = date;
        self.wrt_time = time;
        self.lst_acc_date = date;
    }

    /// Marks the entry as deleted.
    pub fn mark_deleted(&mut self) {
        self.name[0] = DELETED_MARK;
    }

    /// Checks if this directory entry represents a directory.
    ///
    /// # Returns
    /// - `true`: If the entry represents a directory
    /// - `false`: If the entry represents a file
    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    /// Checks if this directory entry is a directory other than `.` and `..`.
    pub fn is_regular_dir(&self) -> bool {
        self.is_dir() && self.name[0] != b'.'
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr & ATTR_VOLUME_ID != 0 && !self.is_long_name()
    }

    pub fn is_long_name(&self) -> bool {
        self.attr & ATTR_LONG_NAME == ATTR_LONG_NAME
    }

    /// A deleted entry, whose slot can be reused.
    pub fn is_free(&self) -> bool {
        self.name[0] == DELETED_MARK
    }

    /// The end marker: neither this slot nor any following one is in use.
    pub fn is_end(&self) -> bool {
        self.name[0] == 0
    }

    /// Checksum of the short name, repeated in each of its long name slots.
    pub fn lfn_checksum(&self) -> u8 {
        self.name
            .iter()
            .fold(0u8, |sum, &c| sum.rotate_right(1).wrapping_add(c))
    }
}

/// Characters accepted in a short name besides letters and digits.
fn is_short_name_char(c: u8) -> bool {
    c.is_ascii_uppercase()
        || c.is_ascii_digit()
        || c >= 0x80
        || b"!#$%&'()-@^_`{}~".contains(&c)
}

impl fmt::Display for DirEntry {
    /// Formats the directory entry for display.
    ///
    /// # Returns
    /// - A string representation showing the filename, first cluster and file size
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.short_name(&crate::codepage::Ascii);
        if self.is_dir() {
            write!(f, "\"{}\" <DIR> @{}", name, self.cluster_number())
        } else {
            write!(f, "\"{}\" {}B @{}", name, self.file_size, self.cluster_number())
        }
    }
}

/// A VFAT long name slot.
///
/// Slots are stored in reverse order before the short entry; the first
/// physical slot carries the 0x40 flag in its ordinal.
#[derive(BinRead, Debug, Clone, Getters)]
#[br(little)]
pub struct LfnSlot {
    /// Sequence number, 0x40 set on the last slot of the name
    ord: u8,
    name1: [u16; 5],
    _attr: u8,
    _kind: u8,
    /// Checksum of the short name
    #[get = "pub"]
    checksum: u8,
    name2: [u16; 6],
    _fst_clus_lo: u16,
    name3: [u16; 2],
}

impl LfnSlot {
    pub fn from_slice(buf: &[u8]) -> Result<Self, FATError> {
        let mut reader = io::Cursor::new(buf);
        reader.read_le().map_err(FATError::from)
    }

    /// Position of the slot in the name, starting at 1.
    pub fn sequence(&self) -> u8 {
        self.ord & 0x1F
    }

    /// Whether this slot holds the end of the name.
    pub fn is_last(&self) -> bool {
        self.ord & 0x40 != 0
    }

    /// The UTF-16 units of this slot, up to the terminator.
    pub fn chars(&self) -> Vec<u16> {
        self.name1
            .iter()
            .chain(self.name2.iter())
            .chain(self.name3.iter())
            .copied()
            .take_while(|&c| c != 0x0000 && c != 0xFFFF)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codepage::Ascii;

    #[test]
    fn short_name_conversion() {
        assert_eq!(&DirEntry::to_8_3_name("readme.txt", &Ascii).unwrap(), b"README  TXT");
        assert_eq!(&DirEntry::to_8_3_name("KERNEL", &Ascii).unwrap(), b"KERNEL     ");
        assert_eq!(&DirEntry::to_8_3_name("..", &Ascii).unwrap(), b"..         ");

        for bad in ["", "toolongname", "a.long", "a.b.c", "sp ace", "star*"] {
            assert!(
                matches!(DirEntry::to_8_3_name(bad, &Ascii), Err(FATError::InvalidName(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn entry_bytes_round_trip() {
        let mut entry = DirEntry::new(*b"HELLO   TXT", ATTR_ARCHIVE, 0x0012_0034);
        entry.set_file_size(1234);
        let bytes = entry.to_bytes();

        assert_eq!(&bytes[20..22], &[0x12, 0x00]);
        assert_eq!(&bytes[26..28], &[0x34, 0x00]);

        let parsed = DirEntry::from_slice(&bytes).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.cluster_number(), 0x0012_0034);
        assert_eq!(parsed.short_name(&Ascii), "HELLO.TXT");
        assert!(!parsed.is_dir());
        assert!(parsed.same_short_name("hello.txt", &Ascii));
    }

    #[test]
    fn deleted_and_end_markers() {
        let mut entry = DirEntry::new(*b"FILE       ", 0, 0);
        assert!(!entry.is_free());
        entry.mark_deleted();
        assert!(entry.is_free());
        assert!(DirEntry::from_slice(&[0u8; 32]).unwrap().is_end());
    }

    #[test]
    fn long_name_slot() {
        // Slot of "readme.markdown" holding its first 13 characters
        let name: Vec<u16> = "readme.markdo".encode_utf16().collect();
        let mut raw = [0u8; 32];
        raw[0] = 0x01;
        for (i, c) in name[..5].iter().enumerate() {
            raw[1 + 2 * i..3 + 2 * i].copy_from_slice(&c.to_le_bytes());
        }
        raw[11] = ATTR_LONG_NAME;
        raw[13] = 0xAB;
        for (i, c) in name[5..11].iter().enumerate() {
            raw[14 + 2 * i..16 + 2 * i].copy_from_slice(&c.to_le_bytes());
        }
        for (i, c) in name[11..].iter().enumerate() {
            raw[28 + 2 * i..30 + 2 * i].copy_from_slice(&c.to_le_bytes());
        }

        let slot = LfnSlot::from_slice(&raw).unwrap();
        assert_eq!(slot.sequence(), 1);
        assert!(!slot.is_last());
        assert_eq!(*slot.checksum(), 0xAB);
        assert_eq!(String::from_utf16_lossy(&slot.chars()), "readme.markdo");
        assert!(DirEntry::from_slice(&raw).unwrap().is_long_name());
    }

    #[test]
    fn checksum_of_short_name() {
        let entry = DirEntry::new(*b"README  TXT", 0, 0);
        let expected = b"README  TXT"
            .iter()
            .fold(0u8, |s, &c| (((s & 1) << 7) | (s >> 1)).wrapping_add(c));
        assert_eq!(entry.lfn_checksum(), expected);
    }
}
