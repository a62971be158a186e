//! Directory scanning and editing.
//!
//! A directory is a file of 32 byte slots. Scanning it fills the directory
//! cache of the open file: used entries with their assembled long names,
//! free slots and the end marker. Any write to the directory drops the cache
//! and the next lookup scans again.

use std::cell::RefCell;
use std::rc::Rc;

use getset::Getters;
use log::{debug, warn};

use super::dir_cache::DirCache;
use super::dir_entry::{ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_VOLUME_ID, DELETED_MARK, DirEntry, LfnSlot};
use super::fat::FATVol;
use super::fat_error::FATError;
use super::file::{FatFile, FileKey, file_read, file_write, open_entry, release_file};
use crate::constants::DIR_ENTRY_SIZE;
use crate::stream::StreamError;

const SLOT: u64 = DIR_ENTRY_SIZE as u64;

/// An entry of a directory, as returned by a scan.
#[derive(Debug, Clone, Getters)]
#[get = "pub"]
pub struct DirRecord {
    /// Slot of the short entry
    index: u32,
    /// First slot of the entry, its first long name slot if it has one
    first_slot: u32,
    short_name: String,
    long_name: Option<String>,
    entry: DirEntry,
}

impl DirRecord {
    /// Returns the long name if there is one, else the short name.
    pub fn name(&self) -> &str {
        self.long_name.as_deref().unwrap_or(&self.short_name)
    }

    fn matches(&self, name: &str) -> bool {
        let name = name.to_uppercase();
        self.short_name.to_uppercase() == name
            || self.long_name.as_ref().is_some_and(|long| long.to_uppercase() == name)
    }
}

/// Long name slots seen so far, waiting for their short entry.
struct PendingLfn {
    first_slot: u32,
    /// Sequence number of the last slot read, the name is complete at 1
    sequence: u8,
    checksum: u8,
    /// Name parts in slot order, i.e. end of the name first
    parts: Vec<Vec<u16>>,
}

impl PendingLfn {
    fn into_name(self) -> String {
        let units: Vec<u16> = self.parts.into_iter().rev().flatten().collect();
        String::from_utf16_lossy(&units)
    }
}

/// Scans `dir` into its cache, unless a complete scan is cached already.
pub(super) fn scan(fs: &mut FATVol, dir: &Rc<RefCell<FatFile>>) -> Result<(), FATError> {
    {
        let dir = dir.borrow();
        if !dir.is_dir() {
            return Err(FATError::NotADirectory(String::new()));
        }
        if dir.dir_cache.as_ref().is_some_and(DirCache::is_complete) {
            return Ok(());
        }
    }

    let mut cache = DirCache::new();
    let mut pending: Option<PendingLfn> = None;
    let mut buf = [0u8; DIR_ENTRY_SIZE];
    let mut slot = 0u32;

    loop {
        if slot % 256 == 0 {
            fs.check_cancel()?;
        }
        if file_read(fs, dir, &mut buf, slot as u64 * SLOT)? < DIR_ENTRY_SIZE {
            // Full directory without an end marker
            cache.add_end(slot);
            break;
        }

        let entry = DirEntry::from_slice(&buf)?;
        if entry.is_end() {
            cache.add_end(slot);
            break;
        }

        if entry.is_free() {
            cache.add_free(slot);
            pending = None;
        } else if entry.is_long_name() {
            let lfn = LfnSlot::from_slice(&buf)?;
            pending = match pending.take() {
                _ if lfn.is_last() => Some(PendingLfn {
                    first_slot: slot,
                    sequence: lfn.sequence(),
                    checksum: *lfn.checksum(),
                    parts: vec![lfn.chars()],
                }),
                Some(mut lfns)
                    if lfn.sequence() + 1 == lfns.sequence && *lfn.checksum() == lfns.checksum =>
                {
                    lfns.sequence = lfn.sequence();
                    lfns.parts.push(lfn.chars());
                    Some(lfns)
                }
                _ => {
                    debug!("Orphan long name slot {slot}");
                    None
                }
            };
        } else {
            let long = pending
                .take()
                .filter(|lfns| lfns.sequence == 1 && lfns.checksum == entry.lfn_checksum());
            let (first_slot, long_name) = match long {
                Some(lfns) => (lfns.first_slot, Some(lfns.into_name())),
                None => (slot, None),
            };
            let short_name = entry.short_name(fs.codepage());
            cache.add_used(first_slot, slot, short_name, long_name, entry);
        }
        slot += 1;
    }

    dir.borrow_mut().dir_cache = Some(cache);
    Ok(())
}

/// Lists the files and directories of `dir`, without `.`, `..` and the volume label.
pub(super) fn entries(fs: &mut FATVol, dir: &Rc<RefCell<FatFile>>) -> Result<Vec<DirRecord>, FATError> {
    scan(fs, dir)?;

    let dir = dir.borrow();
    let Some(cache) = dir.dir_cache.as_ref() else {
        return Ok(vec![]);
    };
    Ok(cache
        .used()
        .filter_map(|slot| {
            let entry = slot.entry.as_ref()?;
            if entry.is_volume_label() || (entry.is_dir() && !entry.is_regular_dir()) {
                return None;
            }
            Some(DirRecord {
                index: slot.end,
                first_slot: slot.begin,
                short_name: slot.short_name.clone().unwrap_or_default(),
                long_name: slot.long_name.clone(),
                entry: entry.clone(),
            })
        })
        .collect())
}

/// Finds `name`, short or long, ignoring case.
pub(super) fn lookup(
    fs: &mut FATVol,
    dir: &Rc<RefCell<FatFile>>,
    name: &str,
) -> Result<Option<DirRecord>, FATError> {
    if cached_contains(dir, name) == Some(false) {
        return Ok(None);
    }
    Ok(entries(fs, dir)?.into_iter().find(|record| record.matches(name)))
}

fn cached_contains(dir: &Rc<RefCell<FatFile>>, name: &str) -> Option<bool> {
    dir.borrow()
        .dir_cache
        .as_ref()
        .and_then(|cache| cache.contains_name(name))
}

/// Whether `name` is taken in `dir`.
pub(super) fn exists(fs: &mut FATVol, dir: &Rc<RefCell<FatFile>>, name: &str) -> Result<bool, FATError> {
    if let Some(found) = cached_contains(dir, name) {
        return Ok(found);
    }
    scan(fs, dir)?;
    Ok(cached_contains(dir, name).unwrap_or(false))
}

/// Returns the volume label record of a root directory, if any.
pub(super) fn volume_label(fs: &mut FATVol, root: &Rc<RefCell<FatFile>>) -> Result<Option<String>, FATError> {
    scan(fs, root)?;

    let root = root.borrow();
    Ok(root.dir_cache.as_ref().and_then(|cache| {
        cache
            .used()
            .filter_map(|slot| slot.entry.as_ref())
            .find(|entry| entry.is_volume_label())
            .map(|entry| String::from_utf8_lossy(entry.name()).trim_end().to_string())
    }))
}

/// Count of slots `dir` holds without growing.
fn capacity(fs: &mut FATVol, dir: &Rc<RefCell<FatFile>>) -> Result<u32, FATError> {
    let (fixed, first) = {
        let dir = dir.borrow();
        (dir.is_fixed(), dir.first_cluster())
    };

    let bytes = if fixed {
        fs.root_region().1
    } else if first == 0 {
        0
    } else {
        fs.count_bytes(first)?
    };
    Ok((bytes / SLOT) as u32)
}

/// Finds `count` consecutive free slots, growing the directory if needed.
///
/// # Errors
/// - `FATError::Range` if a FAT12/16 root directory is full
/// - `FATError::OutOfSpace` if the directory cannot grow
pub(super) fn find_free_slots(
    fs: &mut FATVol,
    dir: &Rc<RefCell<FatFile>>,
    count: u32,
) -> Result<u32, FATError> {
    scan(fs, dir)?;

    let (run, end) = {
        let dir = dir.borrow();
        let cache = dir.dir_cache.as_ref();
        (
            cache.and_then(|c| c.find_free_run(count)),
            cache.and_then(DirCache::end).unwrap_or(0),
        )
    };
    if let Some(start) = run {
        return Ok(start);
    }

    let capacity = capacity(fs, dir)?;
    if end + count <= capacity {
        return Ok(end);
    }
    if dir.borrow().is_fixed() {
        warn!("Root directory full");
        return Err(FATError::Range {
            offset: (end + count) as u64 * SLOT,
            limit: capacity as u64 * SLOT,
        });
    }

    // New clusters are zeroed so that they read as end markers
    let cluster_bytes = fs.cluster_bytes() as u64;
    let from = capacity as u64 * SLOT;
    let to = ((end + count) as u64 * SLOT).div_ceil(cluster_bytes) * cluster_bytes;
    let zeros = vec![0u8; cluster_bytes as usize];
    let mut offset = from;
    while offset < to {
        let n = file_write(fs, dir, &zeros[..(to - offset).min(cluster_bytes) as usize], offset)?;
        if n == 0 {
            return Err(FATError::OutOfSpace { needed: 1, free: 0 });
        }
        offset += n as u64;
    }
    debug!("Directory grown to {} slots", to / SLOT);
    Ok(end)
}

/// Writes a 32 byte record at `slot`.
pub(super) fn write_slot(
    fs: &mut FATVol,
    dir: &Rc<RefCell<FatFile>>,
    slot: u32,
    bytes: &[u8],
) -> Result<(), FATError> {
    let offset = slot as u64 * SLOT;
    let written = file_write(fs, dir, bytes, offset)?;
    if written != bytes.len() {
        return Err(StreamError::ShortTransfer {
            offset,
            expected: bytes.len(),
            done: written,
        }
        .into());
    }
    Ok(())
}

/// Allocates and initializes the first cluster of a new directory.
fn new_dir_cluster(fs: &mut FATVol, parent: &Rc<RefCell<FatFile>>) -> Result<u32, FATError> {
    if fs.available_clusters()? == 0 {
        return Err(FATError::OutOfSpace { needed: 1, free: 0 });
    }
    let cluster = fs
        .next_free()?
        .ok_or(FATError::OutOfSpace { needed: 1, free: 0 })?;
    fs.allocate(cluster, fs.fat_type().end_of_chain())?;

    // ".." of a directory in the root points at cluster 0
    let parent_cluster = {
        let parent = parent.borrow();
        if parent.is_root() { 0 } else { parent.first_cluster() }
    };

    let mut data = vec![0u8; fs.cluster_bytes() as usize];
    data[..DIR_ENTRY_SIZE].copy_from_slice(&DirEntry::new(*b".          ", ATTR_DIRECTORY, cluster).to_bytes());
    data[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]
        .copy_from_slice(&DirEntry::new(*b"..         ", ATTR_DIRECTORY, parent_cluster).to_bytes());
    let position = fs.cluster_offset(cluster);
    fs.dev_write_all(&data, position)?;
    Ok(cluster)
}

/// Creates a file or a directory named `name` in `dir` and opens it.
///
/// # Errors
/// - `FATError::InvalidName` if `name` is not a valid 8.3 name
/// - `FATError::AlreadyExists` if `name` is taken
/// - `FATError::Range` if a FAT12/16 root directory is full
pub(super) fn create(
    fs: &mut FATVol,
    dir: &Rc<RefCell<FatFile>>,
    name: &str,
    is_dir: bool,
) -> Result<Rc<RefCell<FatFile>>, FATError> {
    if name == "." || name == ".." {
        return Err(FATError::InvalidName(name.to_string()));
    }
    let short = DirEntry::to_8_3_name(name, fs.codepage())?;
    if exists(fs, dir, name)? {
        return Err(FATError::AlreadyExists(name.to_string()));
    }

    let index = find_free_slots(fs, dir, 1)?;
    let entry = if is_dir {
        let cluster = new_dir_cluster(fs, dir)?;
        DirEntry::new(short, ATTR_DIRECTORY, cluster)
    } else {
        DirEntry::new(short, ATTR_ARCHIVE, 0)
    };
    if let Err(err) = write_slot(fs, dir, index, &entry.to_bytes()) {
        let cluster = entry.cluster_number();
        if cluster != 0 {
            fs.free_chain(cluster)?;
        }
        return Err(err);
    }

    debug!("Created {name} at slot {index}");
    Ok(open_entry(fs, dir, index, entry))
}

/// Writes a volume label record into a root directory.
pub(super) fn add_label(fs: &mut FATVol, root: &Rc<RefCell<FatFile>>, label: [u8; 11]) -> Result<(), FATError> {
    let index = find_free_slots(fs, root, 1)?;
    write_slot(fs, root, index, &DirEntry::new(label, ATTR_VOLUME_ID, 0).to_bytes())
}

/// Deletes `name` from `dir` and frees its clusters.
///
/// # Errors
/// - `FATError::NotFound` if there is no such entry
/// - `FATError::Busy` if the file is open
/// - `FATError::DirectoryNotEmpty` if a directory still holds entries
pub(super) fn remove(fs: &mut FATVol, dir: &Rc<RefCell<FatFile>>, name: &str) -> Result<(), FATError> {
    let record = lookup(fs, dir, name)?.ok_or_else(|| FATError::NotFound(name.to_string()))?;
    let cluster = record.entry.cluster_number();
    if cluster != 0 && fs.files.contains_key(&FileKey::Cluster(cluster)) {
        return Err(FATError::Busy(name.to_string()));
    }

    if record.entry.is_dir() {
        let sub = open_entry(fs, dir, record.index, record.entry.clone());
        let listed = entries(fs, &sub);
        release_file(fs, &sub)?;
        if !listed?.is_empty() {
            return Err(FATError::DirectoryNotEmpty(name.to_string()));
        }
    }

    for slot in record.first_slot..=record.index {
        write_slot(fs, dir, slot, &[DELETED_MARK])?;
    }
    if cluster != 0 {
        fs.free_chain(cluster)?;
    }
    debug!("Removed {name}");
    Ok(())
}
