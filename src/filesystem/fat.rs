//! FAT volume structure and operations.
//!
//! This module implements the core functions to interact with a FAT volume, including:
//! - Reading and validating the BPB when mounting
//! - Decoding and encoding FAT entries through a single cached FAT sector
//! - Allocating, linking and freeing clusters
//! - Reserving clusters ahead of writes
//! - Writing the FAT and the FSInfo sector back on flush
//! - Displaying the volume layout

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::rc::Rc;

use getset::Getters;
use log::{debug, info, trace, warn};

use super::bpb::{Bpb, FsInfo};
use super::fat_error::FATError;
use super::fat_type::FATType;
use super::file::{FatFile, FileKey};
use crate::cancel::CancelToken;
use crate::codepage::{Ascii, Codepage};
use crate::constants::MAX_SECTOR_SIZE;
use crate::stream::{BufferStream, Geometry, Stream, StreamError};
use crate::traits::LayoutDisplay;
use crate::utils::{read_sector, set_u16_at, set_u32_at, u16_at, u32_at, write_sector};

/// Options applied when mounting a volume.
#[derive(Clone)]
pub struct MountOptions {
    /// Whether to reject boot sectors violating the FAT specification.
    pub validate: bool,
    /// Size of the write-back window inserted in front of the device, if any.
    pub buffer_window: Option<usize>,
    /// Round writes reaching the end of a file up to a whole cluster.
    pub batch: bool,
    /// Codepage used for names. Defaults to the chain's, then to ASCII.
    pub codepage: Option<Rc<dyn Codepage>>,
    /// Token polled by long-running operations.
    pub cancel: CancelToken,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            validate: true,
            buffer_window: None,
            batch: false,
            codepage: None,
            cancel: CancelToken::new(),
        }
    }
}

impl MountOptions {
    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn buffer_window(mut self, window: Option<usize>) -> Self {
        self.buffer_window = window;
        self
    }

    pub fn batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    pub fn codepage(mut self, codepage: Rc<dyn Codepage>) -> Self {
        self.codepage = Some(codepage);
        self
    }

    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// How the cached FAT sector was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Read,
    Write,
}

/// The one FAT sector kept in memory.
struct FatSectorCache {
    /// Sector number relative to the start of a FAT.
    sector: Option<u32>,
    data: Vec<u8>,
    dirty: bool,
    mode: AccessMode,
}

/// Structure for a mounted FAT volume.
///
/// Owns the stream chain, the FAT state and the registry of open files.
#[derive(Getters)]
pub struct FATVol {
    dev: Box<dyn Stream>,
    #[get = "pub"]
    bpb: Bpb,
    #[get = "pub"]
    fat_type: FATType,
    /// Bytes per sector
    #[get = "pub"]
    sector_size: u32,
    /// Sectors per cluster
    #[get = "pub"]
    cluster_size: u32,
    fat_start: u32,
    #[get = "pub"]
    fat_len: u32,
    num_fat: u32,
    dir_start: u32,
    dir_len: u32,
    clus_start: u32,
    /// Count of data clusters, numbered 2 to `num_clus + 1`
    #[get = "pub"]
    num_clus: u32,
    #[get = "pub"]
    root_cluster: u32,
    tot_sectors: u32,
    active_fat: u32,
    mirrored: bool,
    fs_info_sector: Option<u32>,
    /// Free clusters, `None` until counted
    free_space: Option<u32>,
    /// Clusters promised to files but not yet allocated
    #[get = "pub"]
    preallocated: u32,
    /// Last allocated cluster, where the search for a free one resumes
    last: u32,
    cache: FatSectorCache,
    pub(super) files: HashMap<FileKey, Rc<RefCell<FatFile>>>,
    codepage: Option<Rc<dyn Codepage>>,
    #[get = "pub"]
    cancel: CancelToken,
    #[get = "pub"]
    batch: bool,
}

impl FATVol {
    /// Reads the Bpb of the volume exposed by `dev` and derives its layout.
    ///
    /// # Parameters
    /// - `dev`: The stream chain exposing the volume
    /// - `opts`: Mount options
    ///
    /// # Returns
    /// - `Ok(FATVol)`: The mounted FAT volume
    /// - `Err(FATError)`: If reading fails or validation fails
    ///
    /// # Errors
    /// - Returns `FATError::Stream` if reading from the stream fails
    /// - Returns various `FATError` variants if validation fails
    pub fn mount(dev: Box<dyn Stream>, opts: &MountOptions) -> Result<FATVol, FATError> {
        let mut dev = match opts.buffer_window {
            Some(window) => Box::new(BufferStream::new(dev, window)?) as Box<dyn Stream>,
            None => dev,
        };

        let bpb = Bpb::from_stream(dev.as_mut(), opts.validate)?;

        // Sanity checks the engine relies on, even without validation
        let sector_size = *bpb.bytes_per_sec() as u32;
        if !sector_size.is_power_of_two() || !(512..=MAX_SECTOR_SIZE as u32).contains(&sector_size) {
            return Err(FATError::InvalidBytesPerSec(*bpb.bytes_per_sec()));
        }
        if *bpb.sec_per_clus() == 0 {
            return Err(FATError::InvalidSecPerClus(0));
        }
        if *bpb.num_fat() == 0 {
            return Err(FATError::InvalidNumFat(0));
        }

        let mut geometry = Geometry::default();
        geometry.set_sector_size(sector_size as u16);
        geometry.set_heads(*bpb.num_heads());
        geometry.set_sectors(*bpb.sec_per_trk());
        geometry.set_hidden(*bpb.hidd_sec());
        dev.set_geometry(&mut geometry)?;
        if geometry.tot_sectors() != 0 && geometry.tot_sectors() < bpb.tot_sec() as u64 {
            warn!(
                "Volume claims {} sectors but the device only holds {}",
                bpb.tot_sec(),
                geometry.tot_sectors()
            );
        }

        let fat_type = bpb.fat_type();
        let fat_start = *bpb.rsvd_sec_cnt() as u32;
        let fat_len = bpb.fat_sz();
        let num_fat = *bpb.num_fat() as u32;
        let dir_start = fat_start + num_fat * fat_len;
        let dir_len = bpb.root_dir_sectors();
        let clus_start = dir_start + dir_len;
        let mut num_clus = bpb.cluster_count();

        let capacity = (fat_len as u64 * sector_size as u64 * 8 / fat_type.bits() as u64).saturating_sub(2);
        if num_clus as u64 > capacity {
            warn!("FAT too short for {num_clus} clusters, only using {capacity}");
            num_clus = capacity as u32;
        }
        // Cluster numbers must stay below the reserved values of the entry width
        let ceiling = fat_type.max_clusters() - 1;
        if num_clus > ceiling {
            warn!("{num_clus} clusters exceed what {fat_type} entries address, only using {ceiling}");
            num_clus = ceiling;
        }

        let (root_cluster, fs_info_sector) = match bpb.fat32() {
            Some(ext) if fat_type == FATType::FAT32 => {
                let info = *ext.fs_info() as u32;
                let fs_info = (info != 0 && info < fat_start).then_some(info);
                (*ext.root_clus(), fs_info)
            }
            _ => (0, None),
        };

        let mirrored = bpb.mirrored();
        let active_fat = bpb.active_fat() as u32;
        if active_fat >= num_fat {
            return Err(FATError::InvalidActiveFat {
                active: active_fat as u8,
                num_fat: num_fat as u8,
            });
        }

        info!(
            "Mounted {fat_type} volume: {num_clus} clusters of {} bytes",
            sector_size * *bpb.sec_per_clus() as u32
        );

        let mut vol = FATVol {
            dev,
            tot_sectors: bpb.tot_sec(),
            cluster_size: *bpb.sec_per_clus() as u32,
            bpb,
            fat_type,
            sector_size,
            fat_start,
            fat_len,
            num_fat,
            dir_start,
            dir_len,
            clus_start,
            num_clus,
            root_cluster,
            active_fat,
            mirrored,
            fs_info_sector,
            free_space: None,
            preallocated: 0,
            last: 1,
            cache: FatSectorCache {
                sector: None,
                data: vec![0; sector_size as usize],
                dirty: false,
                mode: AccessMode::Read,
            },
            files: HashMap::new(),
            codepage: opts.codepage.clone(),
            cancel: opts.cancel.clone(),
            batch: opts.batch,
        };

        vol.read_fs_info()?;
        Ok(vol)
    }

    /// Picks up the free cluster count and the allocation hint of the FSInfo sector.
    fn read_fs_info(&mut self) -> Result<(), FATError> {
        let Some(sector) = self.fs_info_sector else {
            return Ok(());
        };

        let mut buf = vec![];
        read_sector(self.dev.as_mut(), sector as u64, self.sector_size as usize, &mut buf)?;
        let info = FsInfo::from_bytes(&buf)?;
        if !info.is_valid() {
            warn!("FSInfo sector {sector} carries no valid signature, ignoring it");
            self.fs_info_sector = None;
            return Ok(());
        }

        if *info.free_count() <= self.num_clus {
            self.free_space = Some(*info.free_count());
        }
        if (2..=self.last_cluster()).contains(info.nxt_free()) {
            self.last = *info.nxt_free();
        }
        debug!("FSInfo: free={:?} next={}", self.free_space, self.last);
        Ok(())
    }

    /// Rounds writes reaching the end of a file up to a whole cluster.
    pub fn set_batch(&mut self, batch: bool) {
        self.batch = batch;
    }

    /// Returns the highest valid cluster number.
    pub fn last_cluster(&self) -> u32 {
        self.num_clus + 1
    }

    /// Returns the size of a cluster in bytes.
    pub fn cluster_bytes(&self) -> u32 {
        self.cluster_size * self.sector_size
    }

    /// Returns the byte offset of a data cluster on the stream.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        ((cluster as u64 - 2) * self.cluster_size as u64 + self.clus_start as u64) * self.sector_size as u64
    }

    /// Returns the byte offset and length of the FAT12/16 root directory region.
    pub fn root_region(&self) -> (u64, u64) {
        (
            self.dir_start as u64 * self.sector_size as u64,
            self.dir_len as u64 * self.sector_size as u64,
        )
    }

    /// Whether `value`, read from the FAT, terminates a chain.
    pub fn is_end_of_chain(&self, value: u32) -> bool {
        value > self.last_cluster()
    }

    /// Returns the codepage used for names.
    pub fn codepage(&self) -> &dyn Codepage {
        match &self.codepage {
            Some(cp) => cp.as_ref(),
            None => self.dev.charset().unwrap_or(&Ascii),
        }
    }

    /// Fails with `FATError::Cancelled` once cancellation was requested.
    pub fn check_cancel(&self) -> Result<(), FATError> {
        if self.cancel.is_cancelled() {
            Err(FATError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(super) fn dev_read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, FATError> {
        Ok(self.dev.read(buf, offset)?)
    }

    pub(super) fn dev_write(&mut self, buf: &[u8], offset: u64) -> Result<usize, FATError> {
        Ok(self.dev.write(buf, offset)?)
    }

    /// Writes all of `buf` at `offset`.
    pub(super) fn dev_write_all(&mut self, buf: &[u8], offset: u64) -> Result<(), FATError> {
        let written = self.dev.force_write(buf, offset)?;
        if written != buf.len() {
            return Err(StreamError::ShortTransfer {
                offset,
                expected: buf.len(),
                done: written,
            }
            .into());
        }
        Ok(())
    }

    fn check_cluster(&self, cluster: u32) -> Result<(), FATError> {
        if cluster > self.last_cluster() {
            return Err(FATError::ClusterOutOfRange(cluster));
        }
        Ok(())
    }

    /// Makes `sector` of the FAT the cached one, writing back the previous one if dirty.
    fn load_fat_sector(&mut self, sector: u32, mode: AccessMode) -> Result<(), FATError> {
        if self.cache.sector == Some(sector) {
            if mode == AccessMode::Write {
                self.cache.mode = AccessMode::Write;
            }
            return Ok(());
        }

        self.flush_fat_cache()?;
        let abs = self.fat_start + self.active_fat * self.fat_len + sector;
        trace!("Loading FAT sector {sector} (device sector {abs})");
        self.cache.sector = None;
        read_sector(self.dev.as_mut(), abs as u64, self.sector_size as usize, &mut self.cache.data)?;
        self.cache.sector = Some(sector);
        self.cache.mode = mode;
        self.cache.dirty = false;
        Ok(())
    }

    /// Writes the cached FAT sector to every FAT copy, or only to the active one.
    fn flush_fat_cache(&mut self) -> Result<(), FATError> {
        let Some(sector) = self.cache.sector else {
            return Ok(());
        };
        if self.cache.mode == AccessMode::Read || !self.cache.dirty {
            return Ok(());
        }

        let copies: Vec<u32> = if self.mirrored {
            (0..self.num_fat).collect()
        } else {
            vec![self.active_fat]
        };
        for copy in copies {
            let abs = self.fat_start + copy * self.fat_len + sector;
            write_sector(self.dev.as_mut(), abs as u64, self.sector_size as usize, &self.cache.data)?;
        }
        self.cache.dirty = false;
        self.cache.mode = AccessMode::Read;
        Ok(())
    }

    /// Reads a byte of the FAT.
    fn fat_byte(&mut self, offset: u32) -> Result<u8, FATError> {
        self.load_fat_sector(offset / self.sector_size, AccessMode::Read)?;
        Ok(self.cache.data[(offset % self.sector_size) as usize])
    }

    /// Writes a byte of the FAT.
    fn set_fat_byte(&mut self, offset: u32, value: u8) -> Result<(), FATError> {
        self.load_fat_sector(offset / self.sector_size, AccessMode::Write)?;
        self.cache.data[(offset % self.sector_size) as usize] = value;
        self.cache.dirty = true;
        Ok(())
    }

    /// Reads the FAT entry of `cluster`.
    ///
    /// # Errors
    /// - `FATError::ClusterOutOfRange` if the cluster lies beyond the FAT
    pub fn decode(&mut self, cluster: u32) -> Result<u32, FATError> {
        self.check_cluster(cluster)?;

        match self.fat_type {
            FATType::FAT12 => {
                // Entries are 1.5 bytes long and may straddle two sectors
                let offset = cluster + cluster / 2;
                let lo = self.fat_byte(offset)?;
                let hi = self.fat_byte(offset + 1)?;
                let word = u16::from_le_bytes([lo, hi]) as u32;
                Ok(if cluster & 1 == 1 { word >> 4 } else { word & 0x0FFF })
            }
            FATType::FAT16 => {
                let offset = cluster * 2;
                self.load_fat_sector(offset / self.sector_size, AccessMode::Read)?;
                Ok(u16_at(&self.cache.data, (offset % self.sector_size) as usize) as u32)
            }
            FATType::FAT32 => {
                let offset = cluster * 4;
                self.load_fat_sector(offset / self.sector_size, AccessMode::Read)?;
                Ok(u32_at(&self.cache.data, (offset % self.sector_size) as usize) & 0x0FFF_FFFF)
            }
        }
    }

    /// Writes the FAT entry of `cluster` and keeps the free cluster count up to date.
    ///
    /// FAT32 entries keep their 4 reserved high bits.
    pub fn encode(&mut self, cluster: u32, value: u32) -> Result<(), FATError> {
        let old = self.decode(cluster)?;
        let value = value & self.fat_type.mask();

        match self.fat_type {
            FATType::FAT12 => {
                let offset = cluster + cluster / 2;
                if cluster & 1 == 1 {
                    let lo = self.fat_byte(offset)?;
                    self.set_fat_byte(offset, (lo & 0x0F) | ((value << 4) as u8 & 0xF0))?;
                    self.set_fat_byte(offset + 1, (value >> 4) as u8)?;
                } else {
                    let hi = self.fat_byte(offset + 1)?;
                    self.set_fat_byte(offset, value as u8)?;
                    self.set_fat_byte(offset + 1, (hi & 0xF0) | ((value >> 8) as u8 & 0x0F))?;
                }
            }
            FATType::FAT16 => {
                let offset = cluster * 2;
                self.load_fat_sector(offset / self.sector_size, AccessMode::Write)?;
                set_u16_at(&mut self.cache.data, (offset % self.sector_size) as usize, value as u16);
                self.cache.dirty = true;
            }
            FATType::FAT32 => {
                let offset = cluster * 4;
                self.load_fat_sector(offset / self.sector_size, AccessMode::Write)?;
                let pos = (offset % self.sector_size) as usize;
                let reserved = u32_at(&self.cache.data, pos) & 0xF000_0000;
                set_u32_at(&mut self.cache.data, pos, reserved | value);
                self.cache.dirty = true;
            }
        }

        // Entries 0 and 1 hold the media byte, not clusters
        if cluster >= 2 {
            if let Some(free) = self.free_space.as_mut() {
                if old == 0 && value != 0 {
                    *free = free.saturating_sub(1);
                } else if old != 0 && value == 0 {
                    *free += 1;
                }
            }
        }
        Ok(())
    }

    /// Finds a free cluster, scanning from the one after `hint` and wrapping around.
    ///
    /// # Returns
    /// - `Ok(Some(cluster))`: A free cluster, not yet marked as allocated
    /// - `Ok(None)`: The volume is full
    pub fn allocate_next_free(&mut self, hint: u32) -> Result<Option<u32>, FATError> {
        if self.free_space == Some(0) {
            return Ok(None);
        }

        let last = self.last_cluster();
        let start = if (2..=last).contains(&hint) { hint } else { 1 };

        for cluster in (start + 1..=last).chain(2..=start) {
            if self.decode(cluster)? == 0 {
                self.last = cluster;
                return Ok(Some(cluster));
            }
        }

        if self.free_space.is_some_and(|free| free != 0) {
            warn!("Free cluster count was {:?} on a full volume", self.free_space);
        }
        self.free_space = Some(0);
        Ok(None)
    }

    /// Finds a free cluster starting after the last allocation.
    pub fn next_free(&mut self) -> Result<Option<u32>, FATError> {
        self.allocate_next_free(self.last)
    }

    /// Sets the entry of `cluster` to `value`.
    pub fn allocate(&mut self, cluster: u32, value: u32) -> Result<(), FATError> {
        self.encode(cluster, value)
    }

    /// Links `new` after `tail` and terminates the chain with it.
    pub fn append(&mut self, tail: u32, new: u32) -> Result<(), FATError> {
        self.encode(new, self.fat_type.end_of_chain())?;
        self.encode(tail, new)
    }

    /// Marks `cluster` free.
    pub fn deallocate(&mut self, cluster: u32) -> Result<(), FATError> {
        self.encode(cluster, 0)
    }

    /// Frees every cluster of the chain starting at `first`.
    ///
    /// # Returns
    /// - The count of freed clusters
    pub fn free_chain(&mut self, first: u32) -> Result<u32, FATError> {
        let mut cluster = first;
        let mut freed = 0;

        while cluster >= 2 && !self.is_end_of_chain(cluster) {
            self.check_cancel()?;
            let next = self.decode(cluster)?;
            if next < 2 {
                return Err(FATError::CorruptChain { cluster, value: next });
            }
            self.deallocate(cluster)?;
            freed += 1;
            if freed > self.num_clus {
                return Err(FATError::CorruptChain { cluster, value: next });
            }
            cluster = next;
        }

        debug!("Freed {freed} clusters from {first}");
        Ok(freed)
    }

    /// Lists the clusters of the chain starting at `first`.
    ///
    /// # Errors
    /// - `FATError::CorruptChain` if the chain holds a free entry or a loop
    /// - `FATError::Cancelled` if cancellation was requested
    pub fn chain(&mut self, first: u32) -> Result<Vec<u32>, FATError> {
        let mut clusters = vec![];
        let mut cluster = first;

        while cluster >= 2 && !self.is_end_of_chain(cluster) {
            self.check_cancel()?;
            clusters.push(cluster);
            let next = self.decode(cluster)?;
            if next < 2 || clusters.len() > self.num_clus as usize {
                return Err(FATError::CorruptChain { cluster, value: next });
            }
            cluster = next;
        }

        Ok(clusters)
    }

    /// Returns the count of clusters in the chain starting at `first`.
    pub fn chain_length(&mut self, first: u32) -> Result<u32, FATError> {
        Ok(self.chain(first)?.len() as u32)
    }

    /// Returns the bytes allocated to the chain starting at `first`.
    pub fn count_bytes(&mut self, first: u32) -> Result<u64, FATError> {
        Ok(self.chain_length(first)? as u64 * self.cluster_bytes() as u64)
    }

    /// Returns the count of free clusters, scanning the FAT if it is not known yet.
    pub fn free_clusters(&mut self) -> Result<u32, FATError> {
        if let Some(free) = self.free_space {
            return Ok(free);
        }

        let mut free = 0;
        for cluster in 2..=self.last_cluster() {
            if cluster % 4096 == 0 {
                self.check_cancel()?;
            }
            if self.decode(cluster)? == 0 {
                free += 1;
            }
        }
        debug!("Counted {free} free clusters");
        self.free_space = Some(free);
        Ok(free)
    }

    /// Returns the count of free clusters not promised to any file.
    pub fn available_clusters(&mut self) -> Result<u32, FATError> {
        Ok(self.free_clusters()?.saturating_sub(self.preallocated))
    }

    /// Promises `count` clusters to a file.
    ///
    /// # Errors
    /// - `FATError::OutOfSpace` if fewer clusters are free and unpromised
    pub fn reserve(&mut self, count: u32) -> Result<(), FATError> {
        let available = self.available_clusters()?;
        if count > available {
            return Err(FATError::OutOfSpace {
                needed: count,
                free: available,
            });
        }
        self.preallocated += count;
        Ok(())
    }

    /// Returns `count` promised clusters.
    pub fn release(&mut self, count: u32) {
        if count > self.preallocated {
            warn!(
                "Releasing {count} clusters but only {} are reserved",
                self.preallocated
            );
        }
        self.preallocated = self.preallocated.saturating_sub(count);
    }

    /// Writes the FAT cache and the FSInfo sector, then flushes the chain.
    pub fn flush(&mut self) -> Result<(), FATError> {
        self.flush_fat_cache()?;

        if let Some(sector) = self.fs_info_sector {
            let info = FsInfo::new(self.free_space, self.last);
            let buf = info.to_bytes(self.sector_size as usize);
            write_sector(self.dev.as_mut(), sector as u64, self.sector_size as usize, &buf)?;
        }

        self.dev.flush()?;
        Ok(())
    }

    /// Flushes the volume and returns its stream chain.
    pub fn into_stream(mut self) -> Result<Box<dyn Stream>, FATError> {
        self.flush()?;
        Ok(self.dev)
    }

    /// Returns the starting sector of the first FAT.
    fn fat_start(&self) -> u32 {
        self.fat_start
    }

    /// Returns the starting sector of the root directory.
    fn root_start(&self) -> u32 {
        self.dir_start
    }

    /// Returns the starting sector of the data region.
    pub fn data_start(&self) -> u32 {
        self.clus_start
    }

    /// Returns the ending sector of the data region.
    fn data_end(&self) -> u32 {
        self.data_start() + self.num_clus * self.cluster_size
    }
}

/// Implements the LayoutDisplay trait for FATVol
impl LayoutDisplay for FATVol {
    fn display_layout(&self, indent: u8) -> Result<String, std::fmt::Error> {
        let mut out = String::from("");
        let indent = " ".repeat(indent.into());
        let title = format!(" {} Volume Layout ", self.fat_type);

        writeln!(out, "{}┌{:─^55}┐", indent, title)?;
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

        writeln!(
            out,
            "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
            indent,
            "Reserved",
            0,
            self.fat_start(),
            "Boot + Reserved"
        )?;
        for i in 0..self.num_fat {
            let fat_i_start = self.fat_start() + i * self.fat_len;
            let fat_i_end = fat_i_start + self.fat_len;
            let description = if !self.mirrored && i == self.active_fat {
                "Active FAT"
            } else {
                "FAT Tables"
            };
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent,
                format!("FAT #{}", i),
                fat_i_start,
                fat_i_end,
                description
            )?;
        }
        if self.fat_type != FATType::FAT32 {
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent,
                "Root Dir",
                self.root_start(),
                self.data_start(),
                "Root Directory"
            )?;
        }
        writeln!(
            out,
            "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
            indent,
            "Data",
            self.data_start(),
            self.data_end(),
            "Cluster Data"
        )?;
        if self.data_end() < self.tot_sectors {
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent,
                "",
                self.data_end(),
                self.tot_sectors,
                "Volume Slack"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FAT16_MAX_CLUSTERS;
    use crate::filesystem::format::{self, FormatOptions};
    use crate::stream::DeviceStream;

    fn mounted(tot_sectors: u32, options: FormatOptions) -> FATVol {
        let dev = DeviceStream::memory(tot_sectors as usize * 512);
        let dev = format::format_stream(Box::new(dev), &options.tot_sectors(tot_sectors)).unwrap();
        FATVol::mount(dev, &MountOptions::default()).unwrap()
    }

    fn fat12() -> FATVol {
        mounted(2880, FormatOptions::default().geometry(80, 2, 18))
    }

    fn fat16() -> FATVol {
        mounted(20480, FormatOptions::default())
    }

    fn fat32() -> FATVol {
        mounted(70_000, FormatOptions::default().fat_type(FATType::FAT32).cluster_size(1))
    }

    #[test]
    fn mount_derives_layout() {
        let vol = fat12();
        assert_eq!(*vol.fat_type(), FATType::FAT12);
        assert_eq!(*vol.num_clus(), 2847);
        assert_eq!(vol.data_start(), 33);
        assert_eq!(vol.root_region(), (19 * 512, 14 * 512));

        let vol = fat32();
        assert_eq!(*vol.fat_type(), FATType::FAT32);
        assert_eq!(*vol.root_cluster(), 2);
    }

    #[test]
    fn encode_decode_boundaries() {
        for mut vol in [fat12(), fat16(), fat32()] {
            let last = vol.last_cluster();
            let eoc = vol.fat_type().end_of_chain();
            let max = vol.fat_type().mask();

            let values = [
                (2, 3),
                (3, eoc),
                (4, 0),
                (5, 1),
                (6, last),
                (7, last + 1),
                (last, 2),
                (last - 1, max - 8),
            ];
            for (cluster, value) in values {
                vol.encode(cluster, value).unwrap();
                assert_eq!(vol.decode(cluster).unwrap(), value, "{} {cluster}", vol.fat_type());
            }

            assert!(!vol.is_end_of_chain(last), "{}", vol.fat_type());
            assert!(vol.is_end_of_chain(last + 1), "{}", vol.fat_type());
            assert!(vol.is_end_of_chain(eoc), "{}", vol.fat_type());
            assert!(vol.is_end_of_chain(vol.fat_type().end_of_chain_min()));
            assert!(last < vol.fat_type().bad_cluster());

            // Neighbours are untouched by packed FAT12 writes
            vol.encode(10, 0xABC & max).unwrap();
            vol.encode(11, 0x123).unwrap();
            vol.encode(12, 0x456).unwrap();
            assert_eq!(vol.decode(10).unwrap(), 0xABC & max);
            assert_eq!(vol.decode(11).unwrap(), 0x123);
            assert_eq!(vol.decode(12).unwrap(), 0x456);

            assert!(matches!(vol.decode(last + 1), Err(FATError::ClusterOutOfRange(_))));
        }
    }

    /// A FAT16 volume whose boot sector claims more clusters than 16 bit entries address.
    fn oversized_fat16() -> FATVol {
        let dev = DeviceStream::memory(20480 * 512);
        let mut dev = format::format_stream(Box::new(dev), &FormatOptions::default().tot_sectors(20480)).unwrap();

        let mut boot = vec![0u8; 512];
        dev.force_read(&mut boot, 0).unwrap();
        let reserved = u16_at(&boot, 14) as u32;
        let root = u16_at(&boot, 17) as u32 * 32 / 512;
        boot[13] = 1;
        boot[16] = 2;
        set_u16_at(&mut boot, 19, 0);
        set_u16_at(&mut boot, 22, 256);
        set_u32_at(&mut boot, 32, reserved + 2 * 256 + root + 70_000);
        dev.force_write(&boot, 0).unwrap();

        FATVol::mount(dev, &MountOptions::default().validate(false)).unwrap()
    }

    #[test]
    fn cluster_count_is_capped_by_the_entry_width() {
        let mut vol = oversized_fat16();
        assert_eq!(*vol.fat_type(), FATType::FAT16);
        assert_eq!(*vol.num_clus(), FAT16_MAX_CLUSTERS - 1);
        assert!(vol.is_end_of_chain(0xFFFF));
        assert!(vol.is_end_of_chain(0xFFF8));

        vol.encode(2, 0xFFFF).unwrap();
        assert_eq!(vol.chain(2).unwrap(), vec![2]);
    }

    #[test]
    fn empty_buffer_window_is_refused() {
        let dev = DeviceStream::memory(2880 * 512);
        let dev = format::format_stream(Box::new(dev), &FormatOptions::default().tot_sectors(2880)).unwrap();
        assert!(matches!(
            FATVol::mount(dev, &MountOptions::default().buffer_window(Some(0))),
            Err(FATError::Stream(StreamError::InvalidWindow(0)))
        ));
    }

    #[test]
    fn fat12_entries_straddling_sectors() {
        let mut vol = fat12();
        // Cluster 341 spans bytes 511 and 512 of the FAT
        vol.encode(341, 0xFED).unwrap();
        vol.encode(340, 0x001).unwrap();
        vol.encode(342, 0x002).unwrap();
        vol.flush().unwrap();
        assert_eq!(vol.decode(341).unwrap(), 0xFED);
        assert_eq!(vol.decode(340).unwrap(), 0x001);
        assert_eq!(vol.decode(342).unwrap(), 0x002);
    }

    #[test]
    fn fat32_keeps_reserved_bits() {
        let mut vol = fat32();
        let offset = vol.fat_start as u64 * 512 + 4 * 5;
        vol.dev.write(&0xF000_0000u32.to_le_bytes(), offset).unwrap();

        vol.encode(5, 0x0123_4567).unwrap();
        vol.flush().unwrap();
        assert_eq!(vol.decode(5).unwrap(), 0x0123_4567);

        let mut raw = [0u8; 4];
        vol.dev.read(&mut raw, offset).unwrap();
        assert_eq!(u32::from_le_bytes(raw), 0xF123_4567);
    }

    #[test]
    fn mirrored_fats_are_written_on_flush() {
        let mut vol = fat16();
        vol.encode(100, 101).unwrap();
        vol.flush().unwrap();

        let fat_len = vol.fat_len as u64;
        let mut first = [0u8; 2];
        let mut second = [0u8; 2];
        vol.dev.read(&mut first, 512 + 200).unwrap();
        vol.dev.read(&mut second, (1 + fat_len) * 512 + 200).unwrap();
        assert_eq!(u16::from_le_bytes(first), 101);
        assert_eq!(first, second);
    }

    #[test]
    fn append_builds_a_walkable_chain() {
        let mut vol = fat16();
        let first = vol.next_free().unwrap().unwrap();
        vol.allocate(first, vol.fat_type().end_of_chain()).unwrap();

        let mut tail = first;
        for _ in 0..4 {
            let new = vol.allocate_next_free(tail).unwrap().unwrap();
            vol.append(tail, new).unwrap();
            tail = new;
        }

        let chain = vol.chain(first).unwrap();
        assert_eq!(chain.len(), 5);
        assert_eq!(chain[0], first);
        assert_eq!(*chain.last().unwrap(), tail);
        assert_eq!(vol.count_bytes(first).unwrap(), 5 * 512);

        let free = vol.free_clusters().unwrap();
        assert_eq!(vol.free_chain(first).unwrap(), 5);
        assert_eq!(vol.free_clusters().unwrap(), free + 5);
    }

    #[test]
    fn corrupt_chain_is_reported() {
        let mut vol = fat16();
        vol.encode(50, 51).unwrap();
        vol.encode(51, 0).unwrap();
        assert!(matches!(
            vol.chain(50),
            Err(FATError::CorruptChain { cluster: 51, value: 0 })
        ));
    }

    #[test]
    fn allocation_wraps_around() {
        let mut vol = fat12();
        let last = vol.last_cluster();
        vol.encode(last, 0xFFF).unwrap();
        // Scanning from the last cluster wraps to the start of the data area
        let found = vol.allocate_next_free(last).unwrap().unwrap();
        assert!(found >= 2 && found < last);
    }

    #[test]
    fn reserve_release_accounting() {
        let mut vol = fat12();
        let free = vol.free_clusters().unwrap();

        vol.reserve(10).unwrap();
        assert_eq!(*vol.preallocated(), 10);
        assert_eq!(vol.available_clusters().unwrap(), free - 10);

        assert!(matches!(
            vol.reserve(free),
            Err(FATError::OutOfSpace { .. })
        ));
        assert_eq!(*vol.preallocated(), 10);

        vol.release(4);
        vol.release(6);
        assert_eq!(*vol.preallocated(), 0);
        vol.release(1);
        assert_eq!(*vol.preallocated(), 0);
    }

    #[test]
    fn cancelled_chain_walk() {
        let mut vol = fat16();
        vol.encode(20, 21).unwrap();
        vol.encode(21, 0xFFFF).unwrap();
        vol.cancel().cancel();
        assert!(matches!(vol.chain(20), Err(FATError::Cancelled)));
    }

    #[test]
    fn layout_table_lists_regions() {
        let vol = fat12();
        let table = vol.display_layout(0).unwrap();
        assert!(table.contains("FAT12 Volume Layout"));
        assert!(table.contains("Root Dir"));
        assert!(table.contains("FAT #1"));
    }
}
