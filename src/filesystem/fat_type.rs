//! Enum for the different FAT types (FAT12, FAT16, FAT32).
//!
//! This module defines the FATType enum, which is used to distinguish between FAT12, FAT16, and FAT32
//! filesystems, along with the entry width and the special values of each.

use std::fmt;

use crate::constants::{FAT12_MAX_CLUSTERS, FAT16_MAX_CLUSTERS, FAT32_MAX_CLUSTERS};

/// Represents the different types of FAT filesystems.
///
/// # Values
/// - `FAT12`: 12-bit File Allocation Table entries
/// - `FAT16`: 16-bit File Allocation Table entries
/// - `FAT32`: 32-bit File Allocation Table entries (28 significant bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FATType {
    FAT12,
    FAT16,
    FAT32,
}

impl FATType {
    /// Returns the width of a FAT entry in bits.
    pub fn bits(self) -> u32 {
        match self {
            FATType::FAT12 => 12,
            FATType::FAT16 => 16,
            FATType::FAT32 => 32,
        }
    }

    /// Returns the FAT type for an entry width, if it is one of 12, 16 or 32.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            12 => Some(FATType::FAT12),
            16 => Some(FATType::FAT16),
            32 => Some(FATType::FAT32),
            _ => None,
        }
    }

    /// Returns the width of a FAT entry in nybbles.
    pub fn nybbles(self) -> u32 {
        self.bits() / 4
    }

    /// Mask of the significant bits of an entry.
    pub fn mask(self) -> u32 {
        match self {
            FATType::FAT12 => 0x0FFF,
            FATType::FAT16 => 0xFFFF,
            FATType::FAT32 => 0x0FFF_FFFF,
        }
    }

    /// The value written to terminate a chain.
    pub fn end_of_chain(self) -> u32 {
        self.mask()
    }

    /// The smallest value recognised as end of chain.
    pub fn end_of_chain_min(self) -> u32 {
        self.mask() - 7
    }

    /// The value marking a bad cluster.
    pub fn bad_cluster(self) -> u32 {
        self.mask() - 8
    }

    /// Count of clusters a FAT of this type cannot reach.
    pub fn max_clusters(self) -> u32 {
        match self {
            FATType::FAT12 => FAT12_MAX_CLUSTERS,
            FATType::FAT16 => FAT16_MAX_CLUSTERS,
            FATType::FAT32 => FAT32_MAX_CLUSTERS + 1,
        }
    }

    /// The file system type label of the boot sector.
    pub fn label(self) -> &'static [u8; 8] {
        match self {
            FATType::FAT12 => b"FAT12   ",
            FATType::FAT16 => b"FAT16   ",
            FATType::FAT32 => b"FAT32   ",
        }
    }
}

impl fmt::Display for FATType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FATType::FAT12 => "FAT12",
            FATType::FAT16 => "FAT16",
            FATType::FAT32 => "FAT32",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_values() {
        assert_eq!(FATType::FAT12.end_of_chain(), 0xFFF);
        assert_eq!(FATType::FAT12.end_of_chain_min(), 0xFF8);
        assert_eq!(FATType::FAT16.bad_cluster(), 0xFFF7);
        assert_eq!(FATType::FAT32.end_of_chain(), 0x0FFF_FFFF);
        assert_eq!(FATType::FAT32.bad_cluster(), 0x0FFF_FFF7);
        assert_eq!(FATType::from_bits(16), Some(FATType::FAT16));
        assert_eq!(FATType::from_bits(8), None);
    }
}
