//! Files of a FAT volume.
//!
//! A [`FatFile`] maps byte offsets of a file to byte offsets on the volume.
//! Cluster chained files, FAT32 root directory included, walk the FAT from a
//! cached checkpoint. The FAT12/16 root directory is a fixed region which
//! cannot grow.
//!
//! Each open file is registered once per volume, keyed by its first cluster,
//! so that every [`FileHandle`] on it shares the same state. A file keeps a
//! reference on the directory holding its entry, and writes its first
//! cluster and size back into that entry when flushed.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::SystemTime;

use getset::{CopyGetters, Getters};
use log::{debug, error, trace};

use super::dir_cache::DirCache;
use super::dir_entry::DirEntry;
use super::fat::FATVol;
use super::fat_error::FATError;
use super::fat_type::FATType;
use crate::cancel::CancelToken;
use crate::constants::DIR_ENTRY_SIZE;
use crate::stream::StreamError;

/// Key of an open file in the registry of its volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKey {
    /// The root directory, whatever the FAT type.
    Root,
    /// Any other file, by first cluster.
    Cluster(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    /// A chain of clusters.
    Normal,
    /// The fixed root directory region of FAT12/16 volumes.
    Root,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapMode {
    Read,
    Write,
}

/// The directory entry of a file, and where it lives.
struct DirentRef {
    parent: Rc<RefCell<FatFile>>,
    /// Slot of the short entry in the parent
    index: u32,
    entry: DirEntry,
    dirty: bool,
}

/// State shared by every handle on a file.
pub struct FatFile {
    kind: FileKind,
    first_cluster: u32,
    /// Last mapped cluster, as (index in the chain, cluster number)
    checkpoint: Option<(u32, u32)>,
    size: u64,
    is_dir: bool,
    /// Size announced through `preallocate`
    prealloc_size: u64,
    /// Clusters reserved on the volume for this file
    prealloc_clusters: u32,
    dirent: Option<DirentRef>,
    refs: u32,
    pub(super) dir_cache: Option<DirCache>,
    key: Option<FileKey>,
}

impl FatFile {
    fn new(kind: FileKind, first_cluster: u32, size: u64, is_dir: bool) -> Self {
        FatFile {
            kind,
            first_cluster,
            checkpoint: None,
            size,
            is_dir,
            prealloc_size: 0,
            prealloc_clusters: 0,
            dirent: None,
            refs: 1,
            dir_cache: None,
            key: None,
        }
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Whether this is the root directory.
    pub fn is_root(&self) -> bool {
        self.key == Some(FileKey::Root)
    }

    /// Returns the directory entry of the file, `None` for the root.
    pub fn entry(&self) -> Option<&DirEntry> {
        self.dirent.as_ref().map(|d| &d.entry)
    }

    /// Whether the file is the fixed root region of a FAT12/16 volume.
    pub(super) fn is_fixed(&self) -> bool {
        self.kind == FileKind::Root
    }
}

/// Opens the root directory of `fs`.
pub(super) fn open_root(fs: &mut FATVol) -> Rc<RefCell<FatFile>> {
    if let Some(root) = fs.files.get(&FileKey::Root) {
        root.borrow_mut().refs += 1;
        return Rc::clone(root);
    }

    let mut root = if *fs.fat_type() == FATType::FAT32 {
        FatFile::new(FileKind::Normal, *fs.root_cluster(), 0, true)
    } else {
        FatFile::new(FileKind::Root, 0, fs.root_region().1, true)
    };
    root.key = Some(FileKey::Root);

    let root = Rc::new(RefCell::new(root));
    fs.files.insert(FileKey::Root, Rc::clone(&root));
    root
}

/// Opens the file described by the entry at slot `index` of `parent`.
///
/// A file already open under the same first cluster is shared.
pub(super) fn open_entry(
    fs: &mut FATVol,
    parent: &Rc<RefCell<FatFile>>,
    index: u32,
    entry: DirEntry,
) -> Rc<RefCell<FatFile>> {
    let cluster = entry.cluster_number();
    if cluster != 0 {
        if let Some(file) = fs.files.get(&FileKey::Cluster(cluster)) {
            file.borrow_mut().refs += 1;
            return Rc::clone(file);
        }
    }

    let mut file = FatFile::new(
        FileKind::Normal,
        cluster,
        *entry.file_size() as u64,
        entry.is_dir(),
    );
    parent.borrow_mut().refs += 1;
    file.dirent = Some(DirentRef {
        parent: Rc::clone(parent),
        index,
        entry,
        dirty: false,
    });

    let file = Rc::new(RefCell::new(file));
    if cluster != 0 {
        let key = FileKey::Cluster(cluster);
        file.borrow_mut().key = Some(key);
        fs.files.insert(key, Rc::clone(&file));
    }
    file
}

/// Maps `len` bytes at `offset` of a cluster chained file.
///
/// # Returns
/// - `Ok(Some((position, len)))`: The volume offset of the first byte and the
///   count of bytes contiguous on the volume, at most `len`
/// - `Ok(None)`: Reading past the end of the chain
fn normal_map(
    fs: &mut FATVol,
    file: &mut FatFile,
    offset: u64,
    len: usize,
    mode: MapMode,
) -> Result<Option<(u64, usize)>, FATError> {
    if file.first_cluster == 0 {
        return Ok(None);
    }

    let cluster_bytes = fs.cluster_bytes() as u64;
    let target = (offset / cluster_bytes) as u32;
    let in_cluster = offset % cluster_bytes;

    let (mut rel, mut abs) = match file.checkpoint {
        Some((rel, abs)) if rel <= target => (rel, abs),
        _ => (0, file.first_cluster),
    };

    while rel < target {
        if rel % 1024 == 0 {
            fs.check_cancel()?;
        }
        let mut next = fs.decode(abs)?;
        if next < 2 {
            return Err(FATError::CorruptChain { cluster: abs, value: next });
        }
        if fs.is_end_of_chain(next) {
            if mode == MapMode::Read {
                return Ok(None);
            }
            next = grow_chain(fs, file, abs)?;
        }
        abs = next;
        rel += 1;
    }
    file.checkpoint = Some((rel, abs));

    // Extend the run over physically contiguous clusters
    let mut run = cluster_bytes - in_cluster;
    let mut cur = abs;
    while run < len as u64 {
        let next = fs.decode(cur)?;
        if next != cur + 1 {
            break;
        }
        cur = next;
        run += cluster_bytes;
    }

    let position = fs.cluster_offset(abs) + in_cluster;
    Ok(Some((position, run.min(len as u64) as usize)))
}

/// Maps `len` bytes at `offset` of the FAT12/16 root directory.
fn root_map(
    fs: &FATVol,
    offset: u64,
    len: usize,
    mode: MapMode,
) -> Result<Option<(u64, usize)>, FATError> {
    let (start, region) = fs.root_region();
    if offset > region || (offset == region && mode == MapMode::Write) {
        return Err(FATError::Range {
            offset,
            limit: region,
        });
    }
    if offset == region {
        return Ok(None);
    }

    let len = (len as u64).min(region - offset) as usize;
    Ok(Some((start + offset, len)))
}

fn map(
    fs: &mut FATVol,
    file: &mut FatFile,
    offset: u64,
    len: usize,
    mode: MapMode,
) -> Result<Option<(u64, usize)>, FATError> {
    match file.kind {
        FileKind::Normal => normal_map(fs, file, offset, len, mode),
        FileKind::Root => root_map(fs, offset, len, mode),
    }
}

/// Links a new cluster after `tail`, consuming a reserved cluster if the file has one.
fn grow_chain(fs: &mut FATVol, file: &mut FatFile, tail: u32) -> Result<u32, FATError> {
    let new = take_free_cluster(fs, file, Some(tail))?;
    fs.append(tail, new)?;
    trace!("Extended chain of {} with {new}", file.first_cluster);
    Ok(new)
}

fn take_free_cluster(fs: &mut FATVol, file: &mut FatFile, hint: Option<u32>) -> Result<u32, FATError> {
    if file.prealloc_clusters == 0 && fs.available_clusters()? == 0 {
        return Err(FATError::OutOfSpace { needed: 1, free: 0 });
    }

    let found = match hint {
        Some(hint) => fs.allocate_next_free(hint)?,
        None => fs.next_free()?,
    };
    let cluster = found.ok_or(FATError::OutOfSpace { needed: 1, free: 0 })?;

    if file.prealloc_clusters > 0 {
        file.prealloc_clusters -= 1;
        fs.release(1);
    }
    Ok(cluster)
}

/// Gives an empty file its first cluster and registers it under it.
fn allocate_first(
    fs: &mut FATVol,
    file_rc: &Rc<RefCell<FatFile>>,
    file: &mut FatFile,
) -> Result<(), FATError> {
    let cluster = take_free_cluster(fs, file, None)?;
    fs.allocate(cluster, fs.fat_type().end_of_chain())?;
    file.first_cluster = cluster;
    file.checkpoint = None;

    if let Some(old) = file.key.take() {
        fs.files.remove(&old);
    }
    let key = FileKey::Cluster(cluster);
    file.key = Some(key);
    fs.files.insert(key, Rc::clone(file_rc));

    if let Some(dirent) = file.dirent.as_mut() {
        dirent.entry.set_cluster_number(cluster);
        dirent.dirty = true;
    }
    debug!("Allocated first cluster {cluster}");
    Ok(())
}

/// Reads up to `buf.len()` bytes at `offset`. Returns 0 at the end of the file.
pub(super) fn file_read(
    fs: &mut FATVol,
    file_rc: &Rc<RefCell<FatFile>>,
    buf: &mut [u8],
    offset: u64,
) -> Result<usize, FATError> {
    let mut file = file_rc.borrow_mut();

    let mut len = buf.len();
    if !file.is_dir {
        if offset >= file.size {
            return Ok(0);
        }
        len = len.min((file.size - offset) as usize);
    }
    if len == 0 {
        return Ok(0);
    }

    match map(fs, &mut file, offset, len, MapMode::Read)? {
        Some((position, len)) => fs.dev_read(&mut buf[..len], position),
        None => Ok(0),
    }
}

/// Writes up to `buf.len()` bytes at `offset`, growing the file as needed.
pub(super) fn file_write(
    fs: &mut FATVol,
    file_rc: &Rc<RefCell<FatFile>>,
    buf: &[u8],
    offset: u64,
) -> Result<usize, FATError> {
    let mut file = file_rc.borrow_mut();
    if buf.is_empty() {
        return Ok(0);
    }

    let mut len = buf.len();
    if !file.is_dir {
        let limit = u32::MAX as u64;
        if offset >= limit {
            return Err(FATError::Range { offset, limit });
        }
        len = len.min((limit - offset) as usize);
    }

    if file.kind == FileKind::Normal && file.first_cluster == 0 {
        allocate_first(fs, file_rc, &mut file)?;
    }

    let Some((position, len)) = map(fs, &mut file, offset, len, MapMode::Write)? else {
        return Ok(0);
    };
    let written = fs.dev_write(&buf[..len], position)?;
    let end = offset + written as u64;

    // Batched writes reaching the end of the file are padded to the cluster end
    if *fs.batch() && file.kind == FileKind::Normal && end >= file.size {
        let cluster_bytes = fs.cluster_bytes() as u64;
        let pad = (cluster_bytes - end % cluster_bytes) % cluster_bytes;
        if pad > 0 {
            fs.dev_write_all(&vec![0; pad as usize], position + written as u64)?;
        }
    }

    if file.is_dir {
        if let Some(cache) = file.dir_cache.as_mut() {
            cache.invalidate();
        }
    } else {
        file.size = file.size.max(end);
        if let Some(dirent) = file.dirent.as_mut() {
            dirent.dirty = true;
        }
    }

    recalc_prealloc(fs, &mut file);
    Ok(written)
}

/// Returns reserved clusters the file no longer needs.
fn recalc_prealloc(fs: &mut FATVol, file: &mut FatFile) {
    if file.prealloc_clusters > 0 && file.size >= file.prealloc_size {
        fs.release(file.prealloc_clusters);
        file.prealloc_clusters = 0;
    }
}

/// Reserves enough clusters for the file to reach `size` bytes.
fn preallocate(fs: &mut FATVol, file: &mut FatFile, size: u64) -> Result<(), FATError> {
    let cluster_bytes = fs.cluster_bytes() as u64;
    let allocated = if file.kind == FileKind::Root {
        return Ok(());
    } else if file.first_cluster == 0 {
        0
    } else {
        fs.chain_length(file.first_cluster)?
    };

    let wanted = size.div_ceil(cluster_bytes);
    let needed = wanted.saturating_sub(allocated as u64);
    let needed = u32::try_from(needed).map_err(|_| FATError::OutOfSpace {
        needed: u32::MAX,
        free: 0,
    })?;

    if needed > file.prealloc_clusters {
        fs.reserve(needed - file.prealloc_clusters)?;
    } else {
        fs.release(file.prealloc_clusters - needed);
    }
    file.prealloc_clusters = needed;
    file.prealloc_size = size;
    debug!("Reserved {needed} clusters for {size} bytes");
    Ok(())
}

/// Writes the first cluster and size of the file back into its directory entry.
fn flush_file(fs: &mut FATVol, file: &mut FatFile) -> Result<(), FATError> {
    let is_dir = file.is_dir;
    let size = file.size;
    let Some(dirent) = file.dirent.as_mut() else {
        return Ok(());
    };
    if !dirent.dirty {
        return Ok(());
    }

    if !is_dir {
        dirent.entry.set_file_size(size as u32);
    }
    dirent.entry.touch(SystemTime::now());

    let bytes = dirent.entry.to_bytes();
    let offset = dirent.index as u64 * DIR_ENTRY_SIZE as u64;
    let written = file_write(fs, &dirent.parent, &bytes, offset)?;
    if written != bytes.len() {
        return Err(StreamError::ShortTransfer {
            offset,
            expected: bytes.len(),
            done: written,
        }
        .into());
    }

    dirent.dirty = false;
    Ok(())
}

/// Drops a reference on the file, closing it with its last one.
///
/// Closing a file flushes it, returns its reserved clusters and drops the
/// reference it holds on its parent directory.
pub(super) fn release_file(fs: &mut FATVol, file_rc: &Rc<RefCell<FatFile>>) -> Result<(), FATError> {
    let parent = {
        let mut file = file_rc.borrow_mut();
        file.refs = file.refs.saturating_sub(1);
        flush_file(fs, &mut file)?;
        if file.refs > 0 {
            return Ok(());
        }

        fs.release(file.prealloc_clusters);
        file.prealloc_clusters = 0;
        file.dir_cache = None;
        if let Some(key) = file.key.take() {
            fs.files.remove(&key);
        }
        file.dirent.take().map(|dirent| dirent.parent)
    };

    match parent {
        Some(parent) => release_file(fs, &parent),
        None => Ok(()),
    }
}

/// What is known about an open file.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct FileMetadata {
    #[getset(get_copy = "pub")]
    size: u64,
    #[getset(get_copy = "pub")]
    is_dir: bool,
    #[getset(get_copy = "pub")]
    first_cluster: u32,
    /// Attribute byte, 0x10 for the root directory
    #[getset(get_copy = "pub")]
    attr: u8,
    /// DOS date and time of the last write, `None` for the root directory
    #[getset(get_copy = "pub")]
    modified: Option<(u16, u16)>,
    #[getset(get = "pub")]
    name: Option<String>,
}

/// A handle on an open file.
///
/// The file is closed when the last handle on it is closed or dropped.
pub struct FileHandle {
    fs: Rc<RefCell<FATVol>>,
    file: Option<Rc<RefCell<FatFile>>>,
}

impl FileHandle {
    pub(super) fn new(fs: Rc<RefCell<FATVol>>, file: Rc<RefCell<FatFile>>) -> Self {
        Self {
            fs,
            file: Some(file),
        }
    }

    fn file(&self) -> Result<&Rc<RefCell<FatFile>>, FATError> {
        self.file
            .as_ref()
            .ok_or_else(|| FATError::NotFound("closed file".to_string()))
    }

    /// Reads up to `buf.len()` bytes at `offset`.
    ///
    /// # Returns
    /// - The count of bytes read, 0 at the end of the file
    ///
    /// # Errors
    /// - `FATError::CorruptChain` if the chain holds a free cluster
    /// - `FATError::Stream` if the device fails
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, FATError> {
        let file = self.file()?;
        let mut fs = self.fs.borrow_mut();
        file_read(&mut fs, file, buf, offset)
    }

    /// Writes up to `buf.len()` bytes at `offset`. The count written may be
    /// shorter when the bytes are not contiguous on the volume.
    ///
    /// # Errors
    /// - `FATError::OutOfSpace` if the chain cannot be extended
    /// - `FATError::Range` if the write runs past a fixed root directory
    pub fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize, FATError> {
        let file = self.file()?;
        let mut fs = self.fs.borrow_mut();
        file_write(&mut fs, file, buf, offset)
    }

    /// Writes all of `buf` at `offset`.
    pub fn write_all(&mut self, buf: &[u8], offset: u64) -> Result<(), FATError> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.write(&buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(StreamError::ShortTransfer {
                    offset,
                    expected: buf.len(),
                    done,
                }
                .into());
            }
            done += n;
        }
        Ok(())
    }

    /// Reads the whole file.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, FATError> {
        let mut data = vec![];
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let n = self.read(&mut chunk, data.len() as u64)?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reserves clusters for the file to grow to `size` bytes without running out of space.
    ///
    /// # Errors
    /// - `FATError::OutOfSpace` if not enough free clusters are left
    pub fn preallocate(&mut self, size: u64) -> Result<(), FATError> {
        let file = self.file()?;
        let mut fs = self.fs.borrow_mut();
        let mut file = file.borrow_mut();
        preallocate(&mut fs, &mut file, size)
    }

    pub fn size(&self) -> Result<u64, FATError> {
        Ok(self.file()?.borrow().size)
    }

    pub fn metadata(&self) -> Result<FileMetadata, FATError> {
        let file = self.file()?.borrow();
        let fs = self.fs.borrow();
        let entry = file.entry();

        Ok(FileMetadata {
            size: file.size,
            is_dir: file.is_dir,
            first_cluster: file.first_cluster,
            attr: entry.map_or(super::dir_entry::ATTR_DIRECTORY, |e| *e.attr()),
            modified: entry.map(|e| (*e.wrt_date(), *e.wrt_time())),
            name: entry.map(|e| e.short_name(fs.codepage())),
        })
    }

    /// Lists the clusters allocated to the file.
    pub fn chain(&self) -> Result<Vec<u32>, FATError> {
        let first = {
            let file = self.file()?.borrow();
            if file.kind == FileKind::Root {
                return Ok(vec![]);
            }
            file.first_cluster
        };
        self.fs.borrow_mut().chain(first)
    }

    /// Writes the file's entry back into its directory.
    pub fn flush(&mut self) -> Result<(), FATError> {
        let file = self.file()?;
        let mut fs = self.fs.borrow_mut();
        let mut file = file.borrow_mut();
        flush_file(&mut fs, &mut file)
    }

    /// Closes the handle.
    pub fn close(mut self) -> Result<(), FATError> {
        match self.file.take() {
            Some(file) => release_file(&mut self.fs.borrow_mut(), &file),
            None => Ok(()),
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            match self.fs.try_borrow_mut() {
                Ok(mut fs) => {
                    if let Err(err) = release_file(&mut fs, &file) {
                        error!("Failed to close file: {err}");
                    }
                }
                Err(_) => error!("Volume busy, file not closed"),
            }
        }
    }
}

/// Copies `src` into `dst` from their start.
///
/// # Returns
/// - The count of bytes copied
///
/// # Errors
/// - `FATError::Cancelled` if `cancel` was triggered
pub fn copy(src: &mut FileHandle, dst: &mut FileHandle, cancel: &CancelToken) -> Result<u64, FATError> {
    if let Ok(size) = src.size() {
        dst.preallocate(size)?;
    }

    let mut buf = vec![0u8; 32 * 1024];
    let mut offset = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(FATError::Cancelled);
        }
        let n = src.read(&mut buf, offset)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n], offset)?;
        offset += n as u64;
    }

    dst.flush()?;
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{FileSystem, FormatOptions};
    use crate::stream::DeviceStream;

    fn floppy() -> FileSystem {
        let dev = DeviceStream::memory(2880 * 512);
        FileSystem::format(Box::new(dev), &FormatOptions::default().tot_sectors(2880)).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn empty_file_reads_nothing() {
        let fs = floppy();
        let mut file = fs.create("EMPTY.TXT").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(file.read(&mut buf, 0).unwrap(), 0);
        assert_eq!(file.metadata().unwrap().first_cluster(), 0);
        assert!(file.chain().unwrap().is_empty());
    }

    #[test]
    fn first_write_allocates_and_rekeys() {
        let fs = floppy();
        let mut file = fs.create("DATA.BIN").unwrap();
        file.write_all(b"hello", 0).unwrap();

        let first = file.metadata().unwrap().first_cluster();
        assert!(first >= 2);
        {
            let vol = fs.volume();
            let vol = vol.borrow();
            assert!(vol.files.contains_key(&FileKey::Cluster(first)));
        }

        // A second open shares the same file
        file.flush().unwrap();
        let mut other = fs.open("DATA.BIN").unwrap();
        assert_eq!(other.read_to_end().unwrap(), b"hello");
        file.write_all(b"!", 5).unwrap();
        assert_eq!(other.size().unwrap(), 6);
    }

    #[test]
    fn writes_extend_the_chain() {
        let fs = floppy();
        let mut file = fs.create("BIG.BIN").unwrap();
        let data = pattern(5000);
        file.write_all(&data, 0).unwrap();

        assert_eq!(file.size().unwrap(), 5000);
        assert_eq!(file.chain().unwrap().len(), 10);
        assert_eq!(file.read_to_end().unwrap(), data);
    }

    #[test]
    fn read_past_end_of_chain_is_empty() {
        let fs = floppy();
        let mut file = fs.create("A.BIN").unwrap();
        file.write_all(&pattern(100), 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf, 100).unwrap(), 0);
        assert_eq!(file.read(&mut buf, 10_000).unwrap(), 0);
    }

    #[test]
    fn checkpoint_is_transparent() {
        let fs = floppy();
        let mut file = fs.create("SEEK.BIN").unwrap();
        let data = pattern(20 * 512);
        file.write_all(&data, 0).unwrap();

        // Backwards and forwards reads see the same bytes as a sequential one
        for offset in [9000u64, 100, 5000, 4999, 0, 10_000] {
            let mut buf = [0u8; 300];
            let n = file.read(&mut buf, offset).unwrap();
            assert!(n > 0);
            assert_eq!(&buf[..n], &data[offset as usize..offset as usize + n]);
        }
    }

    #[test]
    fn map_stops_at_contiguity_breaks() {
        let fs = floppy();
        let mut a = fs.create("A.BIN").unwrap();
        let mut b = fs.create("B.BIN").unwrap();
        // Interleave allocations so that A is fragmented
        a.write_all(&[1u8; 512], 0).unwrap();
        b.write_all(&[2u8; 512], 0).unwrap();
        a.write_all(&[3u8; 512], 512).unwrap();

        let chain = a.chain().unwrap();
        assert_eq!(chain.len(), 2);
        assert_ne!(chain[1], chain[0] + 1);

        let mut buf = [0u8; 1024];
        assert_eq!(a.read(&mut buf, 0).unwrap(), 512);
        assert_eq!(a.read(&mut buf, 512).unwrap(), 512);
        assert!(buf[..512].iter().all(|&x| x == 3));
    }

    #[test]
    fn contiguous_runs_are_read_at_once() {
        let fs = floppy();
        let mut file = fs.create("RUN.BIN").unwrap();
        file.write_all(&pattern(4096), 0).unwrap();
        let mut buf = vec![0u8; 4096];
        assert_eq!(file.read(&mut buf, 0).unwrap(), 4096);
    }

    #[test]
    fn size_is_written_back_on_close() {
        let fs = floppy();
        let mut file = fs.create("SIZE.TXT").unwrap();
        file.write_all(&pattern(777), 0).unwrap();
        file.close().unwrap();

        let record = fs
            .read_dir("/")
            .unwrap()
            .into_iter()
            .find(|r| r.short_name() == "SIZE.TXT")
            .unwrap();
        assert_eq!(*record.entry().file_size(), 777);
        assert!(record.entry().cluster_number() >= 2);
    }

    #[test]
    fn preallocation_reserves_and_releases() {
        let fs = floppy();
        let free = fs.free_clusters().unwrap();
        let mut file = fs.create("PRE.BIN").unwrap();

        file.preallocate(10 * 512).unwrap();
        assert_eq!(*fs.volume().borrow().preallocated(), 10);

        file.write_all(&pattern(3 * 512), 0).unwrap();
        assert_eq!(*fs.volume().borrow().preallocated(), 7);

        file.close().unwrap();
        assert_eq!(*fs.volume().borrow().preallocated(), 0);
        assert_eq!(fs.free_clusters().unwrap(), free - 3);
    }

    #[test]
    fn preallocation_beyond_free_space_fails() {
        let fs = floppy();
        let mut file = fs.create("HUGE.BIN").unwrap();
        assert!(matches!(
            file.preallocate(4 * 1024 * 1024),
            Err(FATError::OutOfSpace { .. })
        ));
    }

    #[test]
    fn full_volume_reports_out_of_space() {
        let fs = floppy();
        let mut file = fs.create("FILL.BIN").unwrap();
        let data = vec![0xAAu8; 2848 * 512];
        let err = file.write_all(&data, 0).unwrap_err();
        assert!(matches!(err, FATError::OutOfSpace { .. }));
        assert_eq!(fs.free_clusters().unwrap(), 0);
    }

    #[test]
    fn batch_mode_pads_the_last_cluster() {
        let dev = DeviceStream::memory(2880 * 512);
        let options = FormatOptions::default().tot_sectors(2880).cluster_size(2);
        let fs = FileSystem::format(Box::new(dev), &options).unwrap();
        fs.volume().borrow_mut().set_batch(true);

        let mut file = fs.create("PAD.BIN").unwrap();
        // Leave garbage in the cluster first
        file.write_all(&[0xFFu8; 1024], 0).unwrap();
        file.write_all(b"abc", 0).unwrap();
        assert_eq!(file.size().unwrap(), 1024);

        let cluster = file.chain().unwrap()[0];
        let position = fs.volume().borrow().cluster_offset(cluster);
        let mut raw = [0u8; 1024];
        fs.volume().borrow_mut().dev_read(&mut raw, position).unwrap();
        // Writes not reaching the end are left alone
        assert_eq!(&raw[..3], b"abc");
        assert_eq!(raw[3], 0xFF);

        file.write_all(b"xyz", 1024).unwrap();
        let second = file.chain().unwrap()[1];
        let position = fs.volume().borrow().cluster_offset(second);
        fs.volume().borrow_mut().dev_read(&mut raw, position).unwrap();
        assert_eq!(&raw[..3], b"xyz");
        assert!(raw[3..].iter().all(|&x| x == 0));
        assert_eq!(file.size().unwrap(), 1027);
    }

    #[test]
    fn copy_between_files() {
        let fs = floppy();
        let data = pattern(3000);
        let mut src = fs.create("SRC.BIN").unwrap();
        src.write_all(&data, 0).unwrap();
        let mut dst = fs.create("DST.BIN").unwrap();

        assert_eq!(copy(&mut src, &mut dst, &CancelToken::new()).unwrap(), 3000);
        assert_eq!(dst.read_to_end().unwrap(), data);

        let cancel = CancelToken::new();
        cancel.cancel();
        let mut other = fs.create("OTHER.BIN").unwrap();
        assert!(matches!(copy(&mut src, &mut other, &cancel), Err(FATError::Cancelled)));
    }

    #[test]
    fn fixed_root_cannot_grow() {
        let fs = floppy();
        let mut root = fs.root().unwrap();
        let region = 14 * 512;
        let mut buf = [0u8; 32];
        assert_eq!(root.read(&mut buf, region).unwrap(), 0);
        assert!(matches!(root.write(&buf, region), Err(FATError::Range { .. })));
        assert!(matches!(root.read(&mut buf, region + 1), Err(FATError::Range { .. })));
    }
}
