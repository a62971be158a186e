//! FAT12/16/32 volumes.
//!
//! [`FileSystem`] is the entry point: it mounts or formats a volume on a
//! stream chain and resolves paths to [`FileHandle`]s. The engine itself,
//! i.e. FAT access, allocation and the open file registry, lives in
//! [`fat::FATVol`].

pub mod bpb;
pub mod dir_cache;
pub mod dir_entry;
pub mod directory;
pub mod fat;
pub mod fat_error;
pub mod fat_type;
pub mod file;
pub mod format;
pub mod layout;

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

pub use bpb::Bpb;
pub use directory::DirRecord;
pub use fat::{FATVol, MountOptions};
pub use fat_error::FATError;
pub use fat_type::FATType;
pub use file::{FileHandle, FileMetadata, copy};
pub use format::FormatOptions;

use crate::stream::Stream;
use crate::traits::LayoutDisplay;
use file::{FatFile, open_entry, open_root, release_file};

/// Splits a path into its components. Both `/` and `\` separate components.
fn components(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .collect()
}

/// Splits a path into its parent directory and its last component.
fn split_parent(path: &str) -> Result<(Vec<&str>, &str), FATError> {
    let mut parts = components(path);
    let leaf = parts
        .pop()
        .ok_or_else(|| FATError::InvalidName(path.to_string()))?;
    Ok((parts, leaf))
}

/// Opens the file at the end of `parts`, starting from the root directory.
fn resolve(vol: &mut FATVol, parts: &[&str]) -> Result<Rc<RefCell<FatFile>>, FATError> {
    let mut current = open_root(vol);

    for part in parts {
        let found = if current.borrow().is_dir() {
            directory::lookup(vol, &current, part)
                .and_then(|record| record.ok_or_else(|| FATError::NotFound(part.to_string())))
        } else {
            Err(FATError::NotADirectory(part.to_string()))
        };

        let record = match found {
            Ok(record) => record,
            Err(err) => {
                release_file(vol, &current)?;
                return Err(err);
            }
        };

        let next = open_entry(vol, &current, *record.index(), record.entry().clone());
        release_file(vol, &current)?;
        current = next;
    }

    Ok(current)
}

/// Runs `f` on the opened directory `parts`, closing it afterwards.
fn in_directory<T>(
    vol: &mut FATVol,
    parts: &[&str],
    f: impl FnOnce(&mut FATVol, &Rc<RefCell<FatFile>>) -> Result<T, FATError>,
) -> Result<T, FATError> {
    let dir = resolve(vol, parts)?;
    let result = if dir.borrow().is_dir() {
        f(vol, &dir)
    } else {
        Err(FATError::NotADirectory(parts.join("/")))
    };
    release_file(vol, &dir)?;
    result
}

/// A mounted FAT volume.
pub struct FileSystem {
    vol: Rc<RefCell<FATVol>>,
}

impl FileSystem {
    /// Mounts the volume exposed by `dev`.
    ///
    /// # Errors
    /// - Boot sector validation errors, see [`Bpb::validate`]
    /// - `FATError::Stream` if the device fails
    pub fn mount(dev: Box<dyn Stream>, opts: &MountOptions) -> Result<FileSystem, FATError> {
        let vol = FATVol::mount(dev, opts)?;
        Ok(FileSystem {
            vol: Rc::new(RefCell::new(vol)),
        })
    }

    /// Formats `dev` and mounts the new volume.
    pub fn format(dev: Box<dyn Stream>, opts: &FormatOptions) -> Result<FileSystem, FATError> {
        let dev = format::format_stream(dev, opts)?;
        let fs = FileSystem::mount(dev, &MountOptions::default())?;

        if opts.label.is_some() {
            let label = format::label_bytes(opts.label.as_deref())?;
            in_directory(&mut fs.vol.borrow_mut(), &[], |vol, root| {
                directory::add_label(vol, root, label)
            })?;
        }
        fs.flush()?;
        Ok(fs)
    }

    /// Returns the engine of the volume.
    pub fn volume(&self) -> &Rc<RefCell<FATVol>> {
        &self.vol
    }

    pub fn bpb(&self) -> Bpb {
        self.vol.borrow().bpb().clone()
    }

    pub fn fat_type(&self) -> FATType {
        *self.vol.borrow().fat_type()
    }

    fn handle(&self, file: Rc<RefCell<FatFile>>) -> FileHandle {
        FileHandle::new(Rc::clone(&self.vol), file)
    }

    /// Opens the root directory.
    pub fn root(&self) -> Result<FileHandle, FATError> {
        let root = open_root(&mut self.vol.borrow_mut());
        Ok(self.handle(root))
    }

    /// Opens the file or directory at `path`.
    ///
    /// Components are matched against short and long names, ignoring case.
    ///
    /// # Errors
    /// - `FATError::NotFound` if a component does not exist
    /// - `FATError::NotADirectory` if a component other than the last is a file
    pub fn open(&self, path: &str) -> Result<FileHandle, FATError> {
        let file = resolve(&mut self.vol.borrow_mut(), &components(path))?;
        Ok(self.handle(file))
    }

    /// Creates an empty file at `path` and opens it.
    ///
    /// # Errors
    /// - `FATError::InvalidName` if the name is not a valid 8.3 name
    /// - `FATError::AlreadyExists` if the name is taken
    pub fn create(&self, path: &str) -> Result<FileHandle, FATError> {
        let (parent, name) = split_parent(path)?;
        let file = in_directory(&mut self.vol.borrow_mut(), &parent, |vol, dir| {
            directory::create(vol, dir, name, false)
        })?;
        Ok(self.handle(file))
    }

    /// Creates a directory at `path`.
    pub fn mkdir(&self, path: &str) -> Result<(), FATError> {
        let (parent, name) = split_parent(path)?;
        let mut vol = self.vol.borrow_mut();
        let dir = in_directory(&mut vol, &parent, |vol, dir| directory::create(vol, dir, name, true))?;
        release_file(&mut vol, &dir)
    }

    /// Deletes the file or empty directory at `path`.
    pub fn remove(&self, path: &str) -> Result<(), FATError> {
        let (parent, name) = split_parent(path)?;
        in_directory(&mut self.vol.borrow_mut(), &parent, |vol, dir| {
            directory::remove(vol, dir, name)
        })
    }

    /// Lists the directory at `path`.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirRecord>, FATError> {
        in_directory(&mut self.vol.borrow_mut(), &components(path), directory::entries)
    }

    /// Whether `path` exists.
    pub fn exists(&self, path: &str) -> Result<bool, FATError> {
        let (parent, name) = split_parent(path)?;
        in_directory(&mut self.vol.borrow_mut(), &parent, |vol, dir| {
            directory::exists(vol, dir, name)
        })
    }

    /// Returns the label stored in the root directory, if any.
    pub fn label(&self) -> Result<Option<String>, FATError> {
        in_directory(&mut self.vol.borrow_mut(), &[], directory::volume_label)
    }

    pub fn free_clusters(&self) -> Result<u32, FATError> {
        self.vol.borrow_mut().free_clusters()
    }

    /// Returns the free space in bytes.
    pub fn free_space(&self) -> Result<u64, FATError> {
        let mut vol = self.vol.borrow_mut();
        Ok(vol.free_clusters()? as u64 * vol.cluster_bytes() as u64)
    }

    pub fn flush(&self) -> Result<(), FATError> {
        self.vol.borrow_mut().flush()
    }

    /// Flushes the volume and returns its stream chain.
    ///
    /// # Errors
    /// - `FATError::Busy` while files are open
    pub fn unmount(self) -> Result<Box<dyn Stream>, FATError> {
        let vol = Rc::try_unwrap(self.vol)
            .map_err(|_| FATError::Busy("volume".to_string()))?
            .into_inner();
        if !vol.files.is_empty() {
            return Err(FATError::Busy(format!("{} open files", vol.files.len())));
        }

        debug!("Unmounting {} volume", vol.fat_type());
        vol.into_stream()
    }
}

impl LayoutDisplay for FileSystem {
    fn display_layout(&self, indent: u8) -> Result<String, std::fmt::Error> {
        self.vol.borrow().display_layout(indent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::DeviceStream;

    fn floppy() -> FileSystem {
        let dev = DeviceStream::memory(2880 * 512);
        FileSystem::format(Box::new(dev), &FormatOptions::default()).unwrap()
    }

    #[test]
    fn path_components() {
        assert_eq!(components("/A/./B\\C/"), vec!["A", "B", "C"]);
        assert!(components("/").is_empty());
        assert!(matches!(split_parent("/"), Err(FATError::InvalidName(_))));
        assert_eq!(split_parent("A/B.TXT").unwrap(), (vec!["A"], "B.TXT"));
    }

    #[test]
    fn unmount_with_open_files_is_refused() {
        let fs = floppy();
        let file = fs.create("OPEN.TXT").unwrap();
        assert_eq!(fs.volume().borrow().files.len(), 1);
        drop(file);
        assert!(fs.volume().borrow().files.is_empty());

        let _root = fs.root().unwrap();
        assert!(matches!(fs.unmount(), Err(FATError::Busy(_))));
    }

    #[test]
    fn free_space_in_bytes() {
        let fs = floppy();
        assert_eq!(fs.free_space().unwrap(), 2847 * 512);
    }

    #[test]
    fn layout_of_the_volume() {
        let fs = floppy();
        let table = fs.display_layout(2).unwrap();
        assert!(table.starts_with("  ┌"));
        assert!(table.contains("Data"));
    }
}
