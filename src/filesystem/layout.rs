//! Format-time layout planner.
//!
//! Given the size of a device and the constraints of a format request, this
//! module decides the FAT width, cluster size, root directory length and FAT
//! length. It is pure: nothing here touches a stream, so the same request
//! always yields the same [`Layout`].
//!
//! The FAT length comes from a closed form derived from
//! `rem = nfat * fat_len + clusters * cluster_size` with
//! `fat_len * sector_size * 2 >= (clusters + 2) * nybbles`. Once the cluster
//! count is clamped to the ceiling of the FAT width, the FAT is grown until
//! less than one cluster of the data area is left unused.

use log::{debug, warn};

use super::fat_error::FATError;
use super::fat_type::FATType;
use crate::constants::{FAT12_MAX_CLUSTERS, FAT16_MAX_CLUSTERS, FAT32_MAX_CLUSTERS, MAX_BYTES_PER_CLUSTER};

/// A classic floppy format: geometry, root directory, cluster size, FAT length and media byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloppyFormat {
    pub tracks: u16,
    pub sectors: u16,
    pub heads: u16,
    pub dir_len: u16,
    pub cluster_size: u8,
    pub fat_len: u32,
    pub media: u8,
}

/// The standard DOS floppy formats, from 160K to 2.88M.
pub const FLOPPY_FORMATS: [FloppyFormat; 8] = [
    FloppyFormat { tracks: 40, sectors: 9, heads: 1, dir_len: 4, cluster_size: 1, fat_len: 2, media: 0xFC },
    FloppyFormat { tracks: 40, sectors: 9, heads: 2, dir_len: 7, cluster_size: 2, fat_len: 2, media: 0xFD },
    FloppyFormat { tracks: 40, sectors: 8, heads: 1, dir_len: 4, cluster_size: 1, fat_len: 1, media: 0xFE },
    FloppyFormat { tracks: 40, sectors: 8, heads: 2, dir_len: 7, cluster_size: 2, fat_len: 1, media: 0xFF },
    FloppyFormat { tracks: 80, sectors: 9, heads: 2, dir_len: 7, cluster_size: 2, fat_len: 3, media: 0xF9 },
    FloppyFormat { tracks: 80, sectors: 15, heads: 2, dir_len: 14, cluster_size: 1, fat_len: 7, media: 0xF9 },
    FloppyFormat { tracks: 80, sectors: 18, heads: 2, dir_len: 14, cluster_size: 1, fat_len: 9, media: 0xF0 },
    FloppyFormat { tracks: 80, sectors: 36, heads: 2, dir_len: 15, cluster_size: 2, fat_len: 9, media: 0xF0 },
];

/// What the caller asks for. `None` fields are chosen by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRequest {
    pub tot_sectors: u32,
    pub sector_size: u16,
    pub fat_type: Option<FATType>,
    /// Sectors per cluster.
    pub cluster_size: Option<u8>,
    /// Root directory length in sectors (FAT12/16 only).
    pub dir_len: Option<u16>,
    pub num_fats: u8,
    pub reserved: Option<u16>,
    pub media: Option<u8>,
    /// Geometry used for the floppy table and the media byte, 0 when unknown.
    pub tracks: u16,
    pub heads: u16,
    pub sectors: u16,
    pub hidden: u32,
}

impl LayoutRequest {
    /// A request for `tot_sectors` sectors of `sector_size` bytes, everything else automatic.
    pub fn new(tot_sectors: u32, sector_size: u16) -> Self {
        Self {
            tot_sectors,
            sector_size,
            fat_type: None,
            cluster_size: None,
            dir_len: None,
            num_fats: 2,
            reserved: None,
            media: None,
            tracks: 0,
            heads: 0,
            sectors: 0,
            hidden: 0,
        }
    }
}

/// The complete geometry of a volume to format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub fat_type: FATType,
    pub sector_size: u16,
    /// Sectors per cluster.
    pub cluster_size: u8,
    /// Reserved sectors, i.e. the first sector of the first FAT.
    pub fat_start: u16,
    pub num_fats: u8,
    /// Sectors per FAT.
    pub fat_len: u32,
    /// Root directory sectors, 0 on FAT32.
    pub dir_len: u16,
    pub num_clus: u32,
    pub tot_sectors: u32,
    pub media: u8,
    /// Sector of the FAT32 backup boot sector.
    pub backup_boot: u16,
    pub heads: u16,
    pub sectors: u16,
    pub hidden: u32,
}

impl Layout {
    /// First sector of the root directory region.
    pub fn dir_start(&self) -> u32 {
        self.fat_start as u32 + self.num_fats as u32 * self.fat_len
    }

    /// First sector of cluster 2.
    pub fn clus_start(&self) -> u32 {
        self.dir_start() + self.dir_len as u32
    }

    /// Count of root directory entries stored in the boot sector.
    pub fn root_entries(&self) -> u16 {
        (self.dir_len as u32 * self.sector_size as u32 / 32) as u16
    }
}

/// Sectors taken by a FAT describing `clusters` clusters.
fn fat_size(bits: u64, sector_size: u64, clusters: u64) -> u64 {
    ((clusters + 2) * (bits / 4) - 1) / 2 / sector_size + 1
}

/// Sectors taken by the FATs and `clusters` clusters.
fn disk_size(bits: u64, sector_size: u64, clusters: u64, num_fats: u64, cluster_size: u64) -> u64 {
    num_fats * fat_size(bits, sector_size, clusters) + clusters * cluster_size
}

fn infeasible(msg: impl Into<String>) -> FATError {
    FATError::FormatInfeasible(msg.into())
}

/// Plans the layout for `req`.
///
/// # Errors
/// - `FATError::FormatInfeasible` if no layout satisfies the request
pub fn plan(req: &LayoutRequest) -> Result<Layout, FATError> {
    if !req.sector_size.is_power_of_two() || !(512..=4096).contains(&req.sector_size) {
        return Err(infeasible(format!("unsupported sector size {}", req.sector_size)));
    }
    if req.num_fats == 0 {
        return Err(infeasible("at least one FAT is needed"));
    }
    if let Some(cs) = req.cluster_size {
        if !cs.is_power_of_two() {
            return Err(infeasible(format!("cluster size {cs} is not a power of two")));
        }
    }
    if req.tot_sectors == 0 {
        return Err(infeasible("number of sectors not known"));
    }

    let fat_type = comp_fat_type(req)?;
    let layout = match fat_type {
        Some(FATType::FAT32) => plan_fat32(req)?,
        other => plan_fat12_16(req, other)?,
    };

    debug!("Planned layout: {layout:?}");
    Ok(layout)
}

/// Decides the FAT width from the device size alone.
///
/// Returns `None` when the choice between 12 and 16 bits depends on the
/// cluster size.
fn comp_fat_type(req: &LayoutRequest) -> Result<Option<FATType>, FATError> {
    let ss = req.sector_size as u64;
    let nfat = req.num_fats as u64;
    let tot = req.tot_sectors as u64;
    let max_cs = (MAX_BYTES_PER_CLUSTER as u64) / ss;
    let max_disk_size = |bits: u64, clusters: u32| disk_size(bits, ss, clusters as u64, nfat, max_cs) + 2;

    let mut needed = FATType::FAT12;
    if tot > max_disk_size(12, FAT12_MAX_CLUSTERS - 1) {
        needed = FATType::FAT16;
    }
    if req.fat_type == Some(FATType::FAT32) || tot > max_disk_size(16, FAT16_MAX_CLUSTERS - 1) {
        needed = FATType::FAT32;
    }

    match req.fat_type {
        Some(forced) if forced.bits() < needed.bits() => Err(infeasible(format!(
            "device too big for a {} bit FAT",
            forced.bits()
        ))),
        Some(forced) => Ok(Some(forced)),
        None if needed != FATType::FAT12 => Ok(Some(needed)),
        None => {
            let min_fat16 = disk_size(16, ss, FAT12_MAX_CLUSTERS as u64, nfat, 1);
            if tot < min_fat16 {
                Ok(Some(FATType::FAT12))
            } else if req.cluster_size.is_none() && tot >= 2 * min_fat16 {
                Ok(Some(FATType::FAT16))
            } else {
                Ok(None)
            }
        }
    }
}

fn lookup_floppy(req: &LayoutRequest) -> Option<&'static FloppyFormat> {
    FLOPPY_FORMATS.iter().find(|f| {
        f.tracks == req.tracks
            && f.heads == req.heads
            && f.sectors == req.sectors
            && req.dir_len.is_none_or(|d| d == f.dir_len)
            && req.cluster_size.is_none_or(|c| c == f.cluster_size)
    })
}

fn plan_fat12_16(req: &LayoutRequest, fat_type: Option<FATType>) -> Result<Layout, FATError> {
    let fat_start = req.reserved.unwrap_or(1).max(1);
    let tot = req.tot_sectors as u64;

    let base = Layout {
        fat_type: FATType::FAT12,
        sector_size: req.sector_size,
        cluster_size: 1,
        fat_start,
        num_fats: req.num_fats,
        fat_len: 0,
        dir_len: 0,
        num_clus: 0,
        tot_sectors: req.tot_sectors,
        media: 0xF8,
        backup_boot: 0,
        heads: req.heads,
        sectors: req.sectors,
        hidden: req.hidden,
    };

    if fat_type != Some(FATType::FAT16) && req.sector_size == 512 {
        if let Some(floppy) = lookup_floppy(req) {
            debug!("Using the standard floppy format {floppy:?}");
            let mut layout = Layout {
                cluster_size: floppy.cluster_size,
                dir_len: floppy.dir_len,
                fat_len: floppy.fat_len,
                media: req.media.unwrap_or(floppy.media),
                ..base
            };
            let data = tot
                .checked_sub(layout.clus_start() as u64)
                .ok_or_else(|| infeasible("device smaller than its floppy format"))?;
            layout.num_clus = (data / floppy.cluster_size as u64) as u32;
            return Ok(layout);
        }
    }

    let cylinder = req.heads as u64 * req.sectors as u64;
    let media = if req.hidden != 0 || cylinder == 0 || tot % cylinder != 0 {
        0xF8
    } else {
        0xF0
    };

    let may_change_cluster_size = req.cluster_size.is_none();
    let may_change_root_size = req.dir_len.is_none();

    let cluster_size = req.cluster_size.map(u64::from).unwrap_or(match (req.heads, tot > 2000) {
        (1, _) => 1,
        (_, true) => 1,
        (_, false) => 2,
    });
    let dir_len = req.dir_len.map(u64::from).unwrap_or(match (req.heads, tot > 2000) {
        (1, _) => 4,
        (_, true) => 32,
        (_, false) => 7,
    });

    let mut params = Params {
        sector_size: req.sector_size as u64,
        num_fats: req.num_fats as u64,
        fat_start: fat_start as u64,
        cluster_size,
        dir_len,
    };

    calc_cluster_size(&mut params, tot, fat_type)?;
    let fat_type = calc_fat_type(&mut params, tot, fat_type, may_change_cluster_size, may_change_root_size);
    let (fat_len, num_clus) = calc_fat_size(&params, tot, fat_type)?;

    let dir_len = u16::try_from(params.dir_len)
        .ok()
        .filter(|&d| d as u64 * params.sector_size / 32 <= u16::MAX as u64)
        .ok_or_else(|| infeasible(format!("root directory of {} sectors is too long", params.dir_len)))?;
    let cluster_size = u8::try_from(params.cluster_size)
        .map_err(|_| infeasible(format!("cluster size {} is too big", params.cluster_size)))?;

    Ok(Layout {
        fat_type,
        cluster_size,
        fat_len,
        dir_len,
        num_clus,
        media: req.media.unwrap_or(media),
        ..base
    })
}

fn plan_fat32(req: &LayoutRequest) -> Result<Layout, FATError> {
    let tot = req.tot_sectors as u64;

    let mut fat_start = req.reserved.unwrap_or(32);
    if fat_start < 3 {
        warn!("FAT32 needs at least 3 reserved sectors, using 32");
        fat_start = 32;
    }
    let backup_boot = if fat_start <= 6 { fat_start - 1 } else { 6 };

    let cluster_size = match req.cluster_size {
        Some(cs) => cs as u64,
        None => fat32_cluster_size(tot),
    };
    if tot / cluster_size > FAT32_MAX_CLUSTERS as u64 {
        return Err(infeasible("too many clusters"));
    }

    let params = Params {
        sector_size: req.sector_size as u64,
        num_fats: req.num_fats as u64,
        fat_start: fat_start as u64,
        cluster_size,
        dir_len: 0,
    };
    let (fat_len, num_clus) = calc_fat_size(&params, tot, FATType::FAT32)?;

    Ok(Layout {
        fat_type: FATType::FAT32,
        sector_size: req.sector_size,
        cluster_size: cluster_size as u8,
        fat_start,
        num_fats: req.num_fats,
        fat_len,
        dir_len: 0,
        num_clus,
        tot_sectors: req.tot_sectors,
        media: req.media.unwrap_or(if req.hidden != 0 { 0xF8 } else { 0xF0 }),
        backup_boot,
        heads: req.heads,
        sectors: req.sectors,
        hidden: req.hidden,
    })
}

/// FAT32 cluster sizes by volume size.
fn fat32_cluster_size(tot: u64) -> u64 {
    const MI: u64 = 1024 * 1024;
    if tot > 64 * MI {
        64
    } else if tot > 32 * MI {
        32
    } else if tot > 16 * MI {
        16
    } else if tot > 260 * 1024 * 2 {
        8
    } else {
        1
    }
}

/// The parameters the planning steps adjust.
#[derive(Debug, Clone, Copy)]
struct Params {
    sector_size: u64,
    num_fats: u64,
    fat_start: u64,
    cluster_size: u64,
    dir_len: u64,
}

/// Doubles the cluster size until the largest FAT of the width fills the disk.
fn calc_cluster_size(p: &mut Params, tot: u64, fat_type: Option<FATType>) -> Result<(), FATError> {
    let (bits, max_clusters) = match fat_type {
        Some(FATType::FAT12) => (12, (FAT12_MAX_CLUSTERS - 1) as u64),
        _ => (16, (FAT16_MAX_CLUSTERS - 1) as u64),
    };
    let max_fat_size = p.num_fats * fat_size(bits, p.sector_size, max_clusters);

    if tot <= p.fat_start + p.num_fats + p.dir_len {
        return Err(infeasible("not enough sectors"));
    }

    let rem = tot - p.dir_len - p.fat_start;
    while p.cluster_size * max_clusters + max_fat_size < rem {
        if p.cluster_size > 64 {
            return Err(infeasible("no cluster size fits"));
        }
        p.cluster_size <<= 1;
    }
    Ok(())
}

/// Settles an undecided FAT width.
///
/// Disks too big for FAT12 but too small for a safe FAT16 get a bigger
/// cluster, or failing that a longer root directory, and become FAT12.
fn calc_fat_type(
    p: &mut Params,
    tot: u64,
    fat_type: Option<FATType>,
    may_change_cluster_size: bool,
    may_change_root_size: bool,
) -> FATType {
    if let Some(fat_type) = fat_type {
        return fat_type;
    }

    let rem = tot - p.dir_len - p.fat_start;
    let fat16_min = disk_size(16, p.sector_size, (FAT12_MAX_CLUSTERS + 2) as u64, p.num_fats, p.cluster_size);
    let fat12_max = disk_size(12, p.sector_size, (FAT12_MAX_CLUSTERS - 1) as u64, p.num_fats, p.cluster_size);

    if rem >= fat16_min {
        FATType::FAT16
    } else if rem <= fat12_max {
        FATType::FAT12
    } else {
        if may_change_cluster_size && p.cluster_size * p.sector_size * 2 <= MAX_BYTES_PER_CLUSTER as u64 {
            p.cluster_size <<= 1;
        } else if may_change_root_size {
            p.dir_len += rem - fat12_max;
        }
        FATType::FAT12
    }
}

/// Computes the FAT length and the cluster count.
fn calc_fat_size(p: &Params, tot: u64, fat_type: FATType) -> Result<(u32, u32), FATError> {
    let real_rem = tot
        .checked_sub(p.dir_len + p.fat_start)
        .ok_or_else(|| infeasible("not enough sectors"))?;

    // Odd remainders cannot be split evenly by an even FAT count and cluster size.
    let mut rem = real_rem;
    if rem % 2 == 1 && p.num_fats % 2 == 0 && p.cluster_size % 2 == 0 {
        rem -= 1;
    }

    let nybbles = fat_type.nybbles() as u64;
    let mut numerator = rem + 2 * p.cluster_size;
    let mut denominator = p.cluster_size * p.sector_size * 2 + p.num_fats * nybbles;
    if nybbles == 3 {
        numerator *= nybbles;
    } else {
        denominator /= nybbles;
    }

    let mut fat_len = (numerator - 1) / denominator + 1;
    let clusters_left = |fat_len: u64| -> Result<u64, FATError> {
        rem.checked_sub(fat_len * p.num_fats)
            .map(|data| data / p.cluster_size)
            .ok_or_else(|| infeasible("FATs do not fit on the device"))
    };
    let mut num_clus = clusters_left(fat_len)?;

    match fat_type {
        FATType::FAT16 if num_clus >= FAT16_MAX_CLUSTERS as u64 => num_clus = (FAT16_MAX_CLUSTERS - 1) as u64,
        FATType::FAT12 if num_clus >= FAT12_MAX_CLUSTERS as u64 => num_clus = (FAT12_MAX_CLUSTERS - 1) as u64,
        _ => {}
    }

    let capacity = (fat_len * p.sector_size * 2 / nybbles).saturating_sub(2);
    if num_clus > capacity {
        warn!("FAT size miscalculation, shrinking cluster count from {num_clus} to {capacity}");
        num_clus = capacity;
    }

    if fat_type == FATType::FAT32 && num_clus < FAT16_MAX_CLUSTERS as u64 {
        return Err(infeasible("too few clusters for FAT32, choose a 16 bit FAT"));
    }

    // Clusters dropped by the clamp above would otherwise be unreachable.
    loop {
        let slack = rem - num_clus * p.cluster_size - fat_len * p.num_fats;
        if slack < p.cluster_size {
            break;
        }
        debug!("Growing FAT from {fat_len} sectors to absorb {slack} sectors of slack");
        fat_len += (slack - p.cluster_size) / p.num_fats + 1;
        num_clus = clusters_left(fat_len)?;
    }

    let fat_len = u32::try_from(fat_len).map_err(|_| infeasible("FAT too long"))?;
    Ok((fat_len, num_clus as u32))
}
