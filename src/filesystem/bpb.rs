//! FAT Bpb structure.
//!
//! This module implements:
//! - BIOS Parameter Block (Bpb) parsing and validation for FAT12, FAT16 and FAT32
//! - FAT type detection
//! - Emission of the boot sector of a freshly formatted volume
//! - The FAT32 FSInfo sector

use binread::{BinRead, BinReaderExt};
use getset::Getters;
use std::fmt;
use std::io::{self, SeekFrom};

use super::fat_error::FATError;
use super::fat_type::FATType;
use super::layout::Layout;
use crate::constants::{FAT12_MAX_CLUSTERS, FAT12_NT_CLUSTERS, SECTOR_SIZE};
use crate::stream::{Stream, StreamError};
use crate::utils::{set_u16_at, set_u32_at};

/// OEM name written by the format driver.
const OEM_NAME: &[u8; 8] = b"MTOO4043";

/// Default volume label.
pub const NO_NAME: &[u8; 11] = b"NO NAME    ";

/// Minimal boot program: loads the first sector of the hard disk and jumps to it.
const BOOT_PROGRAM: [u8; 47] = [
    0xfa, 0x31, 0xc0, 0x8e, 0xd8, 0x8e, 0xc0, 0xfc, 0xb9, 0x00, 0x01, 0xbe, 0x00, 0x7c, 0xbf,
    0x00, 0x80, 0xf3, 0xa5, 0xea, 0x00, 0x00, 0x00, 0x08, 0xb8, 0x01, 0x02, 0xbb, 0x00, 0x7c,
    0xba, 0x80, 0x00, 0xb9, 0x01, 0x00, 0xcd, 0x13, 0x72, 0x05, 0xea, 0x00, 0x7c, 0x00, 0x00,
    0xcd, 0x19,
];

/// FAT32 extension of the Bpb, present when `fat_sz_16` is 0.
#[derive(BinRead, Debug, Clone, Default, Getters)]
#[br(little)]
#[get = "pub"]
pub struct Fat32Ext {
    /// Sectors per FAT
    fat_sz_32: u32,
    /// FAT flags (mirroring, active FAT)
    ext_flags: u16,
    /// Filesystem version (should be 0:0)
    fs_ver: u16,
    /// First cluster of root directory (typically 2)
    root_clus: u32,
    /// Sector number of FSINFO structure
    fs_info: u16,
    /// Sector number of backup boot sector
    bk_boot_sec: u16,
    /// Reserved for future expansion
    reserved: [u8; 12],
}

/// Extended boot record, following the Bpb (or its FAT32 extension).
#[derive(BinRead, Debug, Clone, Getters)]
#[br(little)]
#[get = "pub"]
pub struct LabelBlock {
    /// Drive number (0x80 for hard disk)
    drv_num: u8,
    /// Reserved (used by Windows NT)
    reserved_1: u8,
    /// Extended boot signature (0x29)
    boot_sig: u8,
    /// Volume serial number
    vol_id: u32,
    /// Volume label (11 bytes)
    vol_lab: [u8; 11],
    /// Filesystem type label ("FAT12   ", "FAT16   " or "FAT32   ")
    fil_sys_type: [u8; 8],
}

/// BIOS Parameter Block structure for FAT filesystems.
///
/// The Bpb contains essential information about the filesystem layout and properties.
/// This implementation follows Microsoft's FAT specification.
#[derive(BinRead, Debug, Clone, Getters)]
#[br(little)]
#[get = "pub"]
pub struct Bpb {
    /// Jump instruction to boot code (must be 0xEB ?? 0x90 or 0xE9 ?? ??)
    jmp: [u8; 3],
    /// OEM identifier (e.g., "MSWIN4.1")
    oem_name: [u8; 8],
    /// Number of bytes per sector (512, 1024, 2048, or 4096)
    bytes_per_sec: u16,
    /// Number of sectors per cluster (power of 2: 1, 2, 4, 8, 16, 32, 64, or 128)
    sec_per_clus: u8,
    /// Number of reserved sectors from start of volume
    rsvd_sec_cnt: u16,
    /// Number of FAT copies (typically 2 for redundancy)
    num_fat: u8,
    /// Maximum number of root directory entries (0 for FAT32)
    root_ent_cnt: u16,
    /// Total sectors for volumes < 32MB (0 for FAT32)
    tot_sec_16: u16,
    /// Media descriptor (0xF8 for fixed disk)
    media: u8,
    /// Sectors per FAT for FAT12/FAT16 (0 for FAT32)
    fat_sz_16: u16,
    /// Sectors per track
    sec_per_trk: u16,
    /// Number of heads
    num_heads: u16,
    /// Number of hidden sectors preceding the partition
    hidd_sec: u32,
    /// Total sectors for volumes >= 32MB
    tot_sec_32: u32,
    /// FAT32-specific fields
    #[br(if(fat_sz_16 == 0))]
    fat32: Option<Fat32Ext>,
    /// Extended boot record
    label: LabelBlock,
    /// Boot sector signature (0x55 0xAA)
    #[br(seek_before = SeekFrom::Start(510))]
    sig: [u8; 2],
}

impl Bpb {
    /// Reads and optionally validates the Bpb of the volume a stream exposes.
    ///
    /// # Parameters
    /// - `stream`: The stream exposing the volume
    /// - `validate`: Whether to perform validation checks on the Bpb
    ///
    /// # Returns
    /// - `Ok(Bpb)`: The parsed and optionally validated Bpb structure
    /// - `Err(FATError)`: If reading fails or validation fails
    ///
    /// # Errors
    /// - Returns `FATError::Stream` if reading from the stream fails
    /// - Returns various `FATError` variants if validation fails and `validate` is true
    pub fn from_stream(stream: &mut dyn Stream, validate: bool) -> Result<Bpb, FATError> {
        let mut buf = vec![0; SECTOR_SIZE];
        let read = stream.force_read(&mut buf, 0)?;
        if read != SECTOR_SIZE {
            return Err(StreamError::ShortTransfer {
                offset: 0,
                expected: SECTOR_SIZE,
                done: read,
            }
            .into());
        }

        let bpb = Self::from_bytes(&buf)?;
        if validate { bpb.validate() } else { Ok(bpb) }
    }

    /// Parses a Bpb from the first 512 bytes of a boot sector.
    pub fn from_bytes(buf: &[u8]) -> Result<Bpb, FATError> {
        let mut reader = io::Cursor::new(buf);
        reader.read_le().map_err(FATError::from)
    }

    /// Builds the Bpb of a volume about to be formatted with `layout`.
    pub fn from_layout(layout: &Layout, serial: u32, label: [u8; 11]) -> Bpb {
        let fat32 = layout.fat_type == FATType::FAT32;
        let (tot_sec_16, tot_sec_32) = match u16::try_from(layout.tot_sectors) {
            Ok(tot) if !fat32 => (tot, 0),
            _ => (0, layout.tot_sectors),
        };

        // The boot program follows the label block
        let boot_offset: u8 = if fat32 { 0x5A } else { 0x3E };

        Bpb {
            jmp: [0xEB, boot_offset - 2, 0x90],
            oem_name: *OEM_NAME,
            bytes_per_sec: layout.sector_size,
            sec_per_clus: layout.cluster_size,
            rsvd_sec_cnt: layout.fat_start,
            num_fat: layout.num_fats,
            root_ent_cnt: layout.root_entries(),
            tot_sec_16,
            media: layout.media,
            fat_sz_16: if fat32 { 0 } else { layout.fat_len as u16 },
            sec_per_trk: layout.sectors,
            num_heads: layout.heads,
            hidd_sec: layout.hidden,
            tot_sec_32,
            fat32: fat32.then(|| Fat32Ext {
                fat_sz_32: layout.fat_len,
                ext_flags: 0,
                fs_ver: 0,
                root_clus: 2,
                fs_info: 1,
                bk_boot_sec: layout.backup_boot,
                reserved: [0; 12],
            }),
            label: LabelBlock {
                drv_num: 0,
                reserved_1: 0,
                boot_sig: 0x29,
                vol_id: serial,
                vol_lab: label,
                fil_sys_type: *layout.fat_type.label(),
            },
            sig: [0x55, 0xAA],
        }
    }

    /// Serializes the boot sector: Bpb, label block, boot program and signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.bytes_per_sec.max(SECTOR_SIZE as u16) as usize];

        buf[0..3].copy_from_slice(&self.jmp);
        buf[3..11].copy_from_slice(&self.oem_name);
        set_u16_at(&mut buf, 11, self.bytes_per_sec);
        buf[13] = self.sec_per_clus;
        set_u16_at(&mut buf, 14, self.rsvd_sec_cnt);
        buf[16] = self.num_fat;
        set_u16_at(&mut buf, 17, self.root_ent_cnt);
        set_u16_at(&mut buf, 19, self.tot_sec_16);
        buf[21] = self.media;
        set_u16_at(&mut buf, 22, self.fat_sz_16);
        set_u16_at(&mut buf, 24, self.sec_per_trk);
        set_u16_at(&mut buf, 26, self.num_heads);
        set_u32_at(&mut buf, 28, self.hidd_sec);
        set_u32_at(&mut buf, 32, self.tot_sec_32);

        let mut off = 36;
        if let Some(ext) = &self.fat32 {
            set_u32_at(&mut buf, 36, ext.fat_sz_32);
            set_u16_at(&mut buf, 40, ext.ext_flags);
            set_u16_at(&mut buf, 42, ext.fs_ver);
            set_u32_at(&mut buf, 44, ext.root_clus);
            set_u16_at(&mut buf, 48, ext.fs_info);
            set_u16_at(&mut buf, 50, ext.bk_boot_sec);
            buf[52..64].copy_from_slice(&ext.reserved);
            off = 64;
        }

        buf[off] = self.label.drv_num;
        buf[off + 1] = self.label.reserved_1;
        buf[off + 2] = self.label.boot_sig;
        set_u32_at(&mut buf, off + 3, self.label.vol_id);
        buf[off + 7..off + 18].copy_from_slice(&self.label.vol_lab);
        buf[off + 18..off + 26].copy_from_slice(&self.label.fil_sys_type);

        if self.jmp[0] == 0xEB {
            let boot = self.jmp[1] as usize + 2;
            if boot >= off + 26 && boot + BOOT_PROGRAM.len() <= 510 {
                buf[boot..boot + BOOT_PROGRAM.len()].copy_from_slice(&BOOT_PROGRAM);
                set_u16_at(&mut buf, boot + 20, (boot + 24) as u16);
            }
        }

        buf[510..512].copy_from_slice(&self.sig);
        buf
    }

    /// Returns the total count of sectors.
    pub fn tot_sec(&self) -> u32 {
        if self.tot_sec_16 == 0 {
            self.tot_sec_32
        } else {
            self.tot_sec_16.into()
        }
    }

    /// Returns the count of sectors per FAT.
    pub fn fat_sz(&self) -> u32 {
        match &self.fat32 {
            Some(ext) if self.fat_sz_16 == 0 => ext.fat_sz_32,
            _ => self.fat_sz_16.into(),
        }
    }

    /// Returns the count of sectors of the FAT12/16 root directory region.
    pub fn root_dir_sectors(&self) -> u32 {
        (self.root_ent_cnt as u32 * 32).div_ceil(self.bytes_per_sec.max(1) as u32)
    }

    /// Returns the first sector of cluster 2.
    pub fn data_start(&self) -> u32 {
        self.rsvd_sec_cnt as u32 + self.num_fat as u32 * self.fat_sz() + self.root_dir_sectors()
    }

    /// Determines the number of clusters in the data section.
    ///
    /// # Returns
    /// - The number of data clusters, 0 if the data region is empty.
    pub fn cluster_count(&self) -> u32 {
        self.tot_sec().saturating_sub(self.data_start()) / (self.sec_per_clus.max(1) as u32)
    }

    /// Determines the FAT type.
    ///
    /// # Returns
    /// - `FAT32` when the 16 bit FAT size is 0
    /// - `FAT12` if cluster count < 4085, or < 4087 with a FAT too short for 16 bit entries
    /// - `FAT16` otherwise
    pub fn fat_type(&self) -> FATType {
        if self.fat_sz_16 == 0 {
            return FATType::FAT32;
        }

        let clus_cnt = self.cluster_count();
        let fat_nybbles = self.fat_sz() as u64 * self.bytes_per_sec as u64 * 2;
        if clus_cnt < FAT12_MAX_CLUSTERS
            || (clus_cnt < FAT12_NT_CLUSTERS && fat_nybbles < (clus_cnt as u64 + 2) * 4)
        {
            FATType::FAT12
        } else {
            FATType::FAT16
        }
    }

    /// Whether every FAT copy is kept up to date.
    pub fn mirrored(&self) -> bool {
        self.fat32.as_ref().is_none_or(|ext| ext.ext_flags & 0x80 == 0)
    }

    /// The FAT read when mirroring is disabled.
    pub fn active_fat(&self) -> u8 {
        match &self.fat32 {
            Some(ext) if !self.mirrored() => (ext.ext_flags & 0x0F) as u8,
            _ => 0,
        }
    }

    /// Validates the Bpb structure according to the FAT specification requirements.
    ///
    /// # Returns
    /// - `Ok(Self)`: If all validation checks pass
    /// - `Err(FATError)`: If any validation check fails
    ///
    /// # Errors
    /// - `FATError::InvalidJmp`: If the jump instruction is invalid
    /// - `FATError::InvalidBytesPerSec`: If bytes per sector is not a valid value
    /// - `FATError::InvalidSecPerClus`: If sectors per cluster is not a valid value
    /// - `FATError::InvalidClusSz`: If cluster size exceeds 32 KiB
    /// - `FATError::InvalidSignature`: If boot sector signature is not 0x55AA
    /// - `FATError::InvalidRsvdSecCnt` / `FATError::InvalidNumFat`: If either count is 0
    /// - Type specific errors of `validate_fat12_16` and `validate_fat32`
    pub fn validate(self) -> Result<Self, FATError> {
        // General verification
        if !((self.jmp[0] == 0xEB && self.jmp[2] == 0x90) || self.jmp[0] == 0xE9) {
            return Err(FATError::InvalidJmp(format!(
                "0x{:02X}{:02X}{:02X}",
                self.jmp[0], self.jmp[1], self.jmp[2],
            )));
        }

        const VALID_BYTES_PER_SEC: [u16; 4] = [512, 1024, 2048, 4096];
        if !VALID_BYTES_PER_SEC.contains(&self.bytes_per_sec) {
            return Err(FATError::InvalidBytesPerSec(self.bytes_per_sec));
        }

        const VALID_SEC_PER_CLUS: [u8; 8] = [1, 2, 4, 8, 16, 32, 64, 128];
        if !VALID_SEC_PER_CLUS.contains(&self.sec_per_clus) {
            return Err(FATError::InvalidSecPerClus(self.sec_per_clus));
        }

        if self.bytes_per_sec as u32 * self.sec_per_clus as u32 > 32 * 1024 {
            return Err(FATError::InvalidClusSz(
                self.bytes_per_sec as u32 * self.sec_per_clus as u32,
            ));
        }

        const SIG: [u8; 2] = [0x55, 0xAA];
        if !self.sig.eq(&SIG) {
            return Err(FATError::InvalidSignature(format!(
                "0x{:02X}{:02X}",
                self.sig[0], self.sig[1]
            )));
        }

        if self.rsvd_sec_cnt == 0 {
            return Err(FATError::InvalidRsvdSecCnt(self.rsvd_sec_cnt));
        }

        if self.num_fat == 0 {
            return Err(FATError::InvalidNumFat(self.num_fat));
        }

        if self.tot_sec() <= self.data_start() {
            return Err(FATError::InvalidTotSec(format!(
                "{} sectors leave no room for a data region starting at sector {}",
                self.tot_sec(),
                self.data_start()
            )));
        }

        // Specific verification depending on the type of FAT
        match self.fat_type() {
            FATType::FAT32 => self.validate_fat32(),
            _ => self.validate_fat12_16(),
        }
    }

    /// Performs FAT12/FAT16-specific validation checks.
    ///
    /// # Errors
    /// - `FATError::InvalidRootEntCnt`: If the root directory has no entry
    fn validate_fat12_16(self) -> Result<Self, FATError> {
        if self.root_ent_cnt == 0 {
            return Err(FATError::InvalidRootEntCnt(self.root_ent_cnt));
        }

        Ok(self)
    }

    /// Performs FAT32-specific validation checks.
    ///
    /// # Returns
    /// - `Ok(Self)`: If all FAT32-specific validation checks pass
    /// - `Err(FATError)`: If any validation check fails
    ///
    /// # Errors
    /// - `FATError::InvalidRootEntCnt`: If root directory entries is not 0
    /// - `FATError::InvalidTotSec`: If total sector fields are invalid for FAT32
    /// - `FATError::InvalidFatSz`: If FAT size fields are invalid for FAT32
    /// - `FATError::InvalidRootClus`: If root directory cluster is less than 2
    /// - `FATError::InvalidActiveFat`: If the active FAT does not exist
    fn validate_fat32(self) -> Result<Self, FATError> {
        let Some(ext) = &self.fat32 else {
            return Err(FATError::InvalidFatSz(String::from(
                "A FAT32 volume needs its extended BPB.",
            )));
        };

        if self.root_ent_cnt != 0 {
            return Err(FATError::InvalidRootEntCnt(self.root_ent_cnt));
        }

        // Check for the count of sectors
        if self.tot_sec_16 != 0 {
            return Err(FATError::InvalidTotSec(String::from(
                "BPB_TotSec16 should be 0 for a FAT32 volume.",
            )));
        }

        if ext.fat_sz_32 == 0 {
            return Err(FATError::InvalidFatSz(String::from(
                "BPB_FATSz32 should be greater than 0 for a FAT32 volume.",
            )));
        }

        if ext.root_clus < 2 || ext.root_clus >= self.cluster_count() + 2 {
            return Err(FATError::InvalidRootClus(ext.root_clus));
        }

        if self.active_fat() >= self.num_fat {
            return Err(FATError::InvalidActiveFat {
                active: self.active_fat(),
                num_fat: self.num_fat,
            });
        }

        Ok(self)
    }
}

/// Implements the Display trait for Bpb
impl fmt::Display for Bpb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut offset = 0;

        macro_rules! field {
            ($name:expr, $val:expr, $size:expr) => {{
                writeln!(f, "  {:<20} 0x{:>04X}: {}", $name, offset, $val)?;
                offset += $size;
            }};
        }

        writeln!(f, "BIOS Parameter Block (Bpb):")?;

        field!("jmp", format!("{:02X?}", self.jmp), 3);
        field!("oem_name", String::from_utf8_lossy(&self.oem_name), 8);
        field!("bytes_per_sec", self.bytes_per_sec, 2);
        field!("sec_per_clus", self.sec_per_clus, 1);
        field!("rsvd_sec_cnt", self.rsvd_sec_cnt, 2);
        field!("num_fat", self.num_fat, 1);
        field!("root_ent_cnt", self.root_ent_cnt, 2);
        field!("tot_sec_16", self.tot_sec_16, 2);
        field!("media", format!("0x{:X}", self.media), 1);
        field!("fat_sz_16", self.fat_sz_16, 2);
        field!("sec_per_trk", self.sec_per_trk, 2);
        field!("num_heads", self.num_heads, 2);
        field!("hidd_sec", self.hidd_sec, 4);
        field!("tot_sec_32", self.tot_sec_32, 4);
        if let Some(ext) = &self.fat32 {
            field!("fat_sz_32", ext.fat_sz_32, 4);
            field!("ext_flags", format!("0x{:04X}", ext.ext_flags), 2);
            field!("fs_ver", ext.fs_ver, 2);
            field!("root_clus", ext.root_clus, 4);
            field!("fs_info", ext.fs_info, 2);
            field!("bk_boot_sec", ext.bk_boot_sec, 2);
            field!("reserved", format!("{:02X?}", &ext.reserved[..]), 12);
        }
        field!("drv_num", format!("0x{:X}", self.label.drv_num), 1);
        field!("reserved_1", self.label.reserved_1, 1);
        field!("boot_sig", format!("0x{:X}", self.label.boot_sig), 1);
        field!("vol_id", format!("0x{:08X}", self.label.vol_id), 4);
        field!("vol_lab", String::from_utf8_lossy(&self.label.vol_lab), 11);
        field!(
            "fil_sys_type",
            String::from_utf8_lossy(&self.label.fil_sys_type),
            8
        );

        let _ = offset;
        writeln!(f, "\nSignature 0x01FE: {:02X?}", self.sig)?;
        writeln!(f, "\nFAT type: {} ({} clusters)", self.fat_type(), self.cluster_count())
    }
}

/// Signatures of the FSInfo sector.
const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
const FSINFO_STRUC_SIG: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIG: u32 = 0xAA55_0000;

/// FAT32 FSInfo sector: a hint of the free cluster count and of the next free cluster.
#[derive(BinRead, Debug, Clone, PartialEq, Eq, Getters)]
#[br(little)]
#[get = "pub"]
pub struct FsInfo {
    lead_sig: u32,
    #[br(pad_before = 480)]
    struc_sig: u32,
    /// Last known free cluster count, 0xFFFFFFFF when unknown
    free_count: u32,
    /// Cluster where the search for a free cluster should start
    nxt_free: u32,
    #[br(pad_before = 12)]
    trail_sig: u32,
}

impl FsInfo {
    pub fn new(free_count: Option<u32>, nxt_free: u32) -> Self {
        Self {
            lead_sig: FSINFO_LEAD_SIG,
            struc_sig: FSINFO_STRUC_SIG,
            free_count: free_count.unwrap_or(u32::MAX),
            nxt_free,
            trail_sig: FSINFO_TRAIL_SIG,
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FATError> {
        let mut reader = io::Cursor::new(buf);
        reader.read_le().map_err(FATError::from)
    }

    /// Whether the three signatures are present.
    pub fn is_valid(&self) -> bool {
        self.lead_sig == FSINFO_LEAD_SIG
            && self.struc_sig == FSINFO_STRUC_SIG
            && self.trail_sig == FSINFO_TRAIL_SIG
    }

    pub fn to_bytes(&self, sector_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; sector_size.max(SECTOR_SIZE)];
        set_u32_at(&mut buf, 0, self.lead_sig);
        set_u32_at(&mut buf, 484, self.struc_sig);
        set_u32_at(&mut buf, 488, self.free_count);
        set_u32_at(&mut buf, 492, self.nxt_free);
        set_u32_at(&mut buf, 508, self.trail_sig);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::layout::{self, LayoutRequest};

    fn floppy_layout() -> Layout {
        let req = LayoutRequest {
            tracks: 80,
            heads: 2,
            sectors: 18,
            ..LayoutRequest::new(2880, 512)
        };
        layout::plan(&req).unwrap()
    }

    #[test]
    fn emitted_floppy_boot_sector() {
        let bpb = Bpb::from_layout(&floppy_layout(), 0x1234_5678, *NO_NAME);
        let bytes = bpb.to_bytes();

        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[0..3], &[0xEB, 0x3C, 0x90]);
        assert_eq!(&bytes[3..11], b"MTOO4043");
        assert_eq!(&bytes[11..13], &[0x00, 0x02]);
        assert_eq!(bytes[13], 1);
        assert_eq!(&bytes[14..16], &[1, 0]);
        assert_eq!(bytes[16], 2);
        assert_eq!(&bytes[17..19], &224u16.to_le_bytes());
        assert_eq!(&bytes[19..21], &2880u16.to_le_bytes());
        assert_eq!(bytes[21], 0xF0);
        assert_eq!(&bytes[22..24], &9u16.to_le_bytes());
        assert_eq!(&bytes[24..26], &18u16.to_le_bytes());
        assert_eq!(&bytes[26..28], &2u16.to_le_bytes());
        assert_eq!(bytes[38], 0x29);
        assert_eq!(&bytes[39..43], &0x1234_5678u32.to_le_bytes());
        assert_eq!(&bytes[43..54], b"NO NAME    ");
        assert_eq!(&bytes[54..62], b"FAT12   ");
        assert_eq!(bytes[62], 0xFA);
        assert_eq!(&bytes[510..512], &[0x55, 0xAA]);
    }

    #[test]
    fn emitted_sector_parses_back() {
        let bpb = Bpb::from_layout(&floppy_layout(), 42, *NO_NAME);
        let parsed = Bpb::from_bytes(&bpb.to_bytes()).unwrap().validate().unwrap();

        assert_eq!(parsed.fat_type(), FATType::FAT12);
        assert_eq!(parsed.cluster_count(), 2847);
        assert_eq!(parsed.data_start(), 33);
        assert_eq!(*parsed.label().vol_id(), 42);
        assert!(parsed.fat32().is_none());
    }

    #[test]
    fn fat32_extension() {
        let layout = layout::plan(&LayoutRequest::new(1024 * 1024, 512)).unwrap();
        let bytes = Bpb::from_layout(&layout, 7, *NO_NAME).to_bytes();

        assert_eq!(&bytes[0..3], &[0xEB, 0x58, 0x90]);
        assert_eq!(&bytes[22..24], &[0, 0]);
        assert_eq!(&bytes[36..40], &layout.fat_len.to_le_bytes());
        assert_eq!(&bytes[44..48], &2u32.to_le_bytes());
        assert_eq!(&bytes[48..50], &1u16.to_le_bytes());
        assert_eq!(&bytes[50..52], &6u16.to_le_bytes());
        assert_eq!(bytes[66], 0x29);
        assert_eq!(&bytes[82..90], b"FAT32   ");

        let parsed = Bpb::from_bytes(&bytes).unwrap().validate().unwrap();
        assert_eq!(parsed.fat_type(), FATType::FAT32);
        assert_eq!(parsed.fat_sz(), layout.fat_len);
        assert_eq!(parsed.cluster_count(), layout.num_clus);
        assert!(parsed.mirrored());
        assert_eq!(parsed.active_fat(), 0);
    }

    #[test]
    fn validation_failures() {
        let mut bytes = Bpb::from_layout(&floppy_layout(), 0, *NO_NAME).to_bytes();
        bytes[510] = 0;
        assert!(matches!(
            Bpb::from_bytes(&bytes).unwrap().validate(),
            Err(FATError::InvalidSignature(_))
        ));

        let mut bytes = Bpb::from_layout(&floppy_layout(), 0, *NO_NAME).to_bytes();
        bytes[13] = 3;
        assert!(matches!(
            Bpb::from_bytes(&bytes).unwrap().validate(),
            Err(FATError::InvalidSecPerClus(3))
        ));

        let mut bytes = Bpb::from_layout(&floppy_layout(), 0, *NO_NAME).to_bytes();
        bytes[0] = 0;
        assert!(matches!(
            Bpb::from_bytes(&bytes).unwrap().validate(),
            Err(FATError::InvalidJmp(_))
        ));
    }

    #[test]
    fn nt_fat12_margin() {
        // 4086 clusters with a FAT too short for 16 bit entries is FAT12
        let mut bytes = Bpb::from_layout(&floppy_layout(), 0, *NO_NAME).to_bytes();
        let fat_len = 12u16;
        let tot = 1 + 2 * fat_len as u32 + 14 + 4086;
        bytes[19..21].copy_from_slice(&(tot as u16).to_le_bytes());
        bytes[22..24].copy_from_slice(&fat_len.to_le_bytes());
        let bpb = Bpb::from_bytes(&bytes).unwrap();
        assert_eq!(bpb.cluster_count(), 4086);
        assert_eq!(bpb.fat_type(), FATType::FAT12);

        // The same count with a FAT long enough for 16 bit entries is FAT16
        let fat_len = 17u16;
        let tot = 1 + 2 * fat_len as u32 + 14 + 4086;
        bytes[19..21].copy_from_slice(&(tot as u16).to_le_bytes());
        bytes[22..24].copy_from_slice(&fat_len.to_le_bytes());
        let bpb = Bpb::from_bytes(&bytes).unwrap();
        assert_eq!(bpb.fat_type(), FATType::FAT16);
    }

    #[test]
    fn fsinfo_round_trip() {
        let info = FsInfo::new(Some(1000), 17);
        let parsed = FsInfo::from_bytes(&info.to_bytes(512)).unwrap();
        assert!(parsed.is_valid());
        assert_eq!(parsed, info);
        assert!(!FsInfo::from_bytes(&[0u8; 512]).unwrap().is_valid());
    }
}
