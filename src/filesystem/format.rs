//! Formatting a stream as a FAT volume.
//!
//! The layout is planned first; the stream is only written once a layout was
//! found. Writing zeroes the reserved sectors, the FATs and the root
//! directory, emits the boot sector, the media entries and, on FAT32, the
//! FSInfo sector and the backup boot sector.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};

use super::bpb::{Bpb, FsInfo, NO_NAME};
use super::fat_error::FATError;
use super::fat_type::FATType;
use super::layout::{self, FLOPPY_FORMATS, Layout, LayoutRequest};
use crate::codepage::{Ascii, Codepage};
use crate::constants::SECTOR_SIZE;
use crate::stream::Stream;
use crate::utils::{set_u16_at, set_u32_at, write_sector};

/// Parameters of a format. `None` fields are chosen from the size of the device.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub tot_sectors: Option<u32>,
    pub sector_size: u16,
    pub fat_type: Option<FATType>,
    /// Sectors per cluster
    pub cluster_size: Option<u8>,
    /// Root directory sectors
    pub dir_len: Option<u16>,
    pub num_fats: u8,
    pub reserved: Option<u16>,
    pub media: Option<u8>,
    pub label: Option<String>,
    pub serial: Option<u32>,
    /// Tracks, heads and sectors per track
    pub geometry: Option<(u16, u16, u16)>,
    pub hidden: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            tot_sectors: None,
            sector_size: SECTOR_SIZE as u16,
            fat_type: None,
            cluster_size: None,
            dir_len: None,
            num_fats: 2,
            reserved: None,
            media: None,
            label: None,
            serial: None,
            geometry: None,
            hidden: 0,
        }
    }
}

impl FormatOptions {
    pub fn tot_sectors(mut self, tot_sectors: u32) -> Self {
        self.tot_sectors = Some(tot_sectors);
        self
    }

    pub fn sector_size(mut self, sector_size: u16) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn fat_type(mut self, fat_type: FATType) -> Self {
        self.fat_type = Some(fat_type);
        self
    }

    pub fn cluster_size(mut self, cluster_size: u8) -> Self {
        self.cluster_size = Some(cluster_size);
        self
    }

    pub fn dir_len(mut self, dir_len: u16) -> Self {
        self.dir_len = Some(dir_len);
        self
    }

    pub fn num_fats(mut self, num_fats: u8) -> Self {
        self.num_fats = num_fats;
        self
    }

    pub fn reserved(mut self, reserved: u16) -> Self {
        self.reserved = Some(reserved);
        self
    }

    pub fn media(mut self, media: u8) -> Self {
        self.media = Some(media);
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = Some(serial);
        self
    }

    pub fn geometry(mut self, tracks: u16, heads: u16, sectors: u16) -> Self {
        self.geometry = Some((tracks, heads, sectors));
        self
    }

    pub fn hidden(mut self, hidden: u32) -> Self {
        self.hidden = hidden;
        self
    }

    /// Builds the planner request for a device of `tot_sectors` sectors.
    ///
    /// Without an explicit geometry, sizes of standard floppies get theirs.
    fn request(&self, tot_sectors: u32) -> LayoutRequest {
        let (tracks, heads, sectors) = self.geometry.unwrap_or_else(|| {
            FLOPPY_FORMATS
                .iter()
                .find(|f| f.tracks as u32 * f.heads as u32 * f.sectors as u32 == tot_sectors)
                .map_or((0, 255, 63), |f| (f.tracks, f.heads, f.sectors))
        });

        LayoutRequest {
            fat_type: self.fat_type,
            cluster_size: self.cluster_size,
            dir_len: self.dir_len,
            num_fats: self.num_fats,
            reserved: self.reserved,
            media: self.media,
            tracks,
            heads,
            sectors,
            hidden: self.hidden,
            ..LayoutRequest::new(tot_sectors, self.sector_size)
        }
    }
}

/// Converts a label into the 11 bytes of the boot sector and the label record.
pub(super) fn label_bytes(label: Option<&str>) -> Result<[u8; 11], FATError> {
    let Some(label) = label else {
        return Ok(*NO_NAME);
    };

    let raw = Ascii
        .to_dos(label)
        .filter(|raw| !raw.is_empty() && raw.len() <= 11)
        .ok_or_else(|| FATError::InvalidName(label.to_string()))?;
    let mut bytes = [b' '; 11];
    bytes[..raw.len()].copy_from_slice(&raw);
    Ok(bytes)
}

/// A serial number derived from the current time.
fn make_serial() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() as u32) ^ d.subsec_nanos().rotate_left(16))
        .unwrap_or(0)
}

/// Returns the first sector of a FAT, holding the media entries.
fn first_fat_sector(layout: &Layout) -> Vec<u8> {
    let mut sector = vec![0u8; layout.sector_size as usize];
    let media = layout.media;

    match layout.fat_type {
        FATType::FAT12 => sector[..3].copy_from_slice(&[media, 0xFF, 0xFF]),
        FATType::FAT16 => {
            set_u16_at(&mut sector, 0, 0xFF00 | media as u16);
            set_u16_at(&mut sector, 2, 0xFFFF);
        }
        FATType::FAT32 => {
            let eoc = FATType::FAT32.end_of_chain();
            set_u32_at(&mut sector, 0, 0x0FFF_FF00 | media as u32);
            set_u32_at(&mut sector, 4, eoc);
            // The root directory cluster
            set_u32_at(&mut sector, 8, eoc);
        }
    }
    sector
}

/// Writes an empty FAT volume on `dev`.
///
/// # Returns
/// - The stream, ready to be mounted
///
/// # Errors
/// - `FATError::FormatInfeasible` if no layout fits the device
/// - `FATError::InvalidName` if the label cannot be stored
/// - `FATError::Stream` if writing fails
pub fn format_stream(mut dev: Box<dyn Stream>, opts: &FormatOptions) -> Result<Box<dyn Stream>, FATError> {
    let tot_sectors = match opts.tot_sectors {
        Some(tot) => tot,
        None => {
            let size = dev
                .metadata()?
                .size
                .ok_or_else(|| FATError::FormatInfeasible("number of sectors not known".to_string()))?;
            u32::try_from(size / opts.sector_size as u64)
                .map_err(|_| FATError::FormatInfeasible("device too big".to_string()))?
        }
    };

    let layout = layout::plan(&opts.request(tot_sectors))?;
    let label = label_bytes(opts.label.as_deref())?;
    let serial = opts.serial.unwrap_or_else(make_serial);
    let bpb = Bpb::from_layout(&layout, serial, label);

    let ss = layout.sector_size as usize;
    let zero = vec![0u8; ss];

    // Everything up to the data region: reserved sectors, FATs and root directory
    for sector in 0..layout.clus_start() {
        write_sector(dev.as_mut(), sector as u64, ss, &zero)?;
    }
    write_sector(dev.as_mut(), 0, ss, &bpb.to_bytes())?;

    let first = first_fat_sector(&layout);
    for copy in 0..layout.num_fats as u32 {
        let sector = layout.fat_start as u32 + copy * layout.fat_len;
        write_sector(dev.as_mut(), sector as u64, ss, &first)?;
    }

    if layout.fat_type == FATType::FAT32 {
        for sector in 0..layout.cluster_size as u32 {
            write_sector(dev.as_mut(), (layout.clus_start() + sector) as u64, ss, &zero)?;
        }

        let info = FsInfo::new(Some(layout.num_clus - 1), 2);
        write_sector(dev.as_mut(), 1, ss, &info.to_bytes(ss))?;
        write_sector(dev.as_mut(), layout.backup_boot as u64, ss, &bpb.to_bytes())?;
        debug!("Backup boot sector written at {}", layout.backup_boot);
    }

    dev.flush()?;
    info!(
        "Formatted {} volume: {} clusters of {} sectors",
        layout.fat_type, layout.num_clus, layout.cluster_size
    );
    Ok(dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::FileSystem;
    use crate::stream::DeviceStream;
    use crate::utils::u32_at;

    fn image(tot_sectors: u32, opts: &FormatOptions) -> Vec<u8> {
        let dev = DeviceStream::memory(tot_sectors as usize * 512);
        let fs = FileSystem::format(Box::new(dev), opts).unwrap();
        let mut dev = fs.unmount().unwrap();

        let mut bytes = vec![0u8; tot_sectors as usize * 512];
        dev.force_read(&mut bytes, 0).unwrap();
        bytes
    }

    #[test]
    fn floppy_image_bytes() {
        let bytes = image(2880, &FormatOptions::default().serial(0x1234_5678));

        assert_eq!(&bytes[0..3], &[0xEB, 0x3C, 0x90]);
        assert_eq!(&bytes[3..11], b"MTOO4043");
        assert_eq!(bytes[13], 1);
        assert_eq!(bytes[21], 0xF0);
        assert_eq!(bytes[38], 0x29);
        assert_eq!(u32_at(&bytes, 39), 0x1234_5678);
        assert_eq!(&bytes[43..54], b"NO NAME    ");
        assert_eq!(&bytes[54..62], b"FAT12   ");
        assert_eq!(&bytes[510..512], &[0x55, 0xAA]);

        // Both FATs start with the media entries
        assert_eq!(&bytes[512..515], &[0xF0, 0xFF, 0xFF]);
        assert_eq!(&bytes[10 * 512..10 * 512 + 3], &[0xF0, 0xFF, 0xFF]);
        assert!(bytes[19 * 512..33 * 512].iter().all(|&b| b == 0));
    }

    #[test]
    fn size_from_the_device() {
        let dev = DeviceStream::memory(2880 * 512);
        let fs = FileSystem::format(Box::new(dev), &FormatOptions::default()).unwrap();
        assert_eq!(*fs.bpb().root_ent_cnt(), 224);
        assert_eq!(fs.free_clusters().unwrap(), 2847);
    }

    #[test]
    fn fat16_media_entries() {
        let bytes = image(20480, &FormatOptions::default());
        assert_eq!(&bytes[54..62], b"FAT16   ");
        assert_eq!(&bytes[512..516], &[0xF8, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn fat32_image_bytes() {
        let opts = FormatOptions::default().fat_type(FATType::FAT32).cluster_size(1);
        let bytes = image(70_000, &opts);

        assert_eq!(&bytes[0..3], &[0xEB, 0x58, 0x90]);
        assert_eq!(&bytes[82..90], b"FAT32   ");
        assert_eq!(u32_at(&bytes, 44), 2);

        // FSInfo and backup boot sector
        assert_eq!(u32_at(&bytes, 512), 0x4161_5252);
        assert_eq!(u32_at(&bytes, 512 + 484), 0x6141_7272);
        assert_eq!(u32_at(&bytes, 512 + 508), 0xAA55_0000);
        assert_eq!(&bytes[6 * 512..7 * 512], &bytes[..512]);

        // Root directory cluster terminated in the FAT
        let fat = 32 * 512;
        assert_eq!(u32_at(&bytes, fat + 8), 0x0FFF_FFFF);
    }

    #[test]
    fn fat32_free_count_is_kept() {
        let dev = DeviceStream::memory(70_000 * 512);
        let opts = FormatOptions::default().fat_type(FATType::FAT32).cluster_size(1);
        let fs = FileSystem::format(Box::new(dev), &opts).unwrap();

        let num_clus = *fs.volume().borrow().num_clus();
        assert_eq!(fs.free_clusters().unwrap(), num_clus - 1);
        fs.create("A.TXT").unwrap().write_all(b"x", 0).unwrap();

        let dev = fs.unmount().unwrap();
        let fs = FileSystem::mount(dev, &Default::default()).unwrap();
        assert_eq!(fs.free_clusters().unwrap(), num_clus - 2);
    }

    #[test]
    fn infeasible_requests() {
        let dev = DeviceStream::memory(2880 * 512);
        let opts = FormatOptions::default().fat_type(FATType::FAT32);
        assert!(matches!(
            FileSystem::format(Box::new(dev), &opts),
            Err(FATError::FormatInfeasible(_))
        ));

        assert!(matches!(label_bytes(Some("far too long a label")), Err(FATError::InvalidName(_))));
    }
}
