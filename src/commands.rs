//! This module defines the `Command` enum and its associated methods for parsing
//! and handling user commands of the interactive FAT tool.
//!
//! Commands are a keyword followed by positional arguments and `key=value`
//! options. `open` describes the stream chain the volume is read through,
//! `format` the layout of a new image.

use std::path::Path;

use crate::constants::SECTOR_SIZE;
use crate::filesystem::{FATType, FormatOptions};
use crate::stream::{DeviceStream, OffsetStream, PartitionStream, RemapStream, Stream, StreamError, SwapStream};
use crate::utils::parse_size;

/// The stream chain to open an image through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenArgs {
    pub path: String,
    /// MBR partition holding the volume, from 1 to 4
    pub partition: Option<u8>,
    /// Byte offset of the volume in the image
    pub offset: Option<u64>,
    pub remap: Option<String>,
    /// Swap the bytes of each 16 bit word
    pub swap: bool,
    /// Size of the write-back buffer in bytes
    pub buffer: Option<usize>,
    /// Open the image read-only
    pub read_only: bool,
}

impl OpenArgs {
    /// Opens the image and stacks the filters: swap, offset, partition, then remap.
    ///
    /// # Errors
    /// - `StreamError::Io` if the image cannot be opened
    /// - Errors of the filters, e.g. `StreamError::NoSuchPartition`
    pub fn build(&self) -> Result<Box<dyn Stream>, StreamError> {
        let mut stream: Box<dyn Stream> = Box::new(DeviceStream::open(Path::new(&self.path), !self.read_only)?);

        if self.swap {
            stream = Box::new(SwapStream::new(stream));
        }
        if let Some(offset) = self.offset {
            stream = Box::new(OffsetStream::open(stream, offset)?);
        }
        if let Some(partition) = self.partition {
            stream = Box::new(PartitionStream::open(stream, partition)?);
        }
        if let Some(remap) = &self.remap {
            stream = Box::new(RemapStream::open(stream, remap)?);
        }
        Ok(stream)
    }
}

/// A new image to create and format.
#[derive(Debug, Clone)]
pub struct FormatArgs {
    pub path: String,
    /// Size of the image in bytes
    pub size: u64,
    pub options: FormatOptions,
}

/// Represents a user command of the interactive FAT tool.
#[derive(Debug)]
pub enum Command {
    /// Command to quit the program.
    Quit,
    /// Command to open an image and mount the volume it holds.
    Open(OpenArgs),
    /// Command to create an image and format it.
    Format(FormatArgs),
    /// Command to print the layout of the volume.
    Print,
    /// Command to print the boot sector.
    Bpb,
    /// Command to print the free space.
    Free,
    /// List a directory.
    Ls(String),
    /// Print a file.
    Cat(String),
    /// Skip the Bpb validation on the next `open`.
    Skip,
    /// Command for an unknown input, encapsulating the raw input as a `String`.
    Unknown(String),
    /// Command for invalid input, encapsulating an error message as a `String`.
    Invalid(String),
    /// Command for an empty input.
    Empty,
}

fn parse_bytes(key: &str, value: &str) -> Result<u64, String> {
    match parse_size(value) {
        Some((size, "")) => Ok(size),
        _ => Err(format!("Arg parsing error: '{key}' expects a size such as 512, 64K or 8s.")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("Arg parsing error: '{key}' expects an unsigned integer."))
}

fn parse_window(value: &str) -> Result<usize, String> {
    match parse_bytes("buffer", value)? {
        size if size != 0 && size % SECTOR_SIZE as u64 == 0 => Ok(size as usize),
        _ => Err(String::from(
            "Arg parsing error: 'buffer' expects a non-zero multiple of 512 bytes.",
        )),
    }
}

fn parse_open<'a>(mut parts: impl Iterator<Item = &'a str>) -> Result<OpenArgs, String> {
    let path = parts
        .next()
        .ok_or("Missing arg: 'open' expects the path to an image file.")?;
    let mut args = OpenArgs {
        path: path.to_string(),
        ..OpenArgs::default()
    };

    for part in parts {
        match part.split_once('=') {
            Some(("part", value)) => args.partition = Some(parse_number("part", value)?),
            Some(("offset", value)) => args.offset = Some(parse_bytes("offset", value)?),
            Some(("remap", value)) => args.remap = Some(value.to_string()),
            Some(("buffer", value)) => args.buffer = Some(parse_window(value)?),
            None if part == "swap" => args.swap = true,
            None if part == "ro" => args.read_only = true,
            _ => return Err(format!("Unknown option for 'open': {part:?}")),
        }
    }
    Ok(args)
}

fn parse_format<'a>(mut parts: impl Iterator<Item = &'a str>) -> Result<FormatArgs, String> {
    let path = parts
        .next()
        .ok_or("Missing arg: 'format' expects the path of the image to create.")?;
    let size = parts
        .next()
        .ok_or("Missing arg: 'format' expects the size of the image.")
        .and_then(|size| parse_bytes("size", size).map_err(|_| "Arg parsing error: bad image size."))?;

    let mut options = FormatOptions::default();
    for part in parts {
        options = match part.split_once('=') {
            Some(("fat", "12")) => options.fat_type(FATType::FAT12),
            Some(("fat", "16")) => options.fat_type(FATType::FAT16),
            Some(("fat", "32")) => options.fat_type(FATType::FAT32),
            Some(("fat", _)) => return Err(String::from("Arg parsing error: 'fat' expects 12, 16 or 32.")),
            Some(("cluster", value)) => options.cluster_size(parse_number("cluster", value)?),
            Some(("root", value)) => options.dir_len(parse_number("root", value)?),
            Some(("fats", value)) => options.num_fats(parse_number("fats", value)?),
            Some(("label", value)) => options.label(value),
            _ => return Err(format!("Unknown option for 'format': {part:?}")),
        };
    }

    Ok(FormatArgs {
        path: path.to_string(),
        size,
        options,
    })
}

impl Command {
    /// Parses a string into a `Command` instance.
    ///
    /// # Parameters
    /// - `s`: A string slice representing the user input.
    ///
    /// # Returns
    /// - `Command::Quit` if the input is "quit".
    /// - `Command::Open` with the image and its stream options if the input starts with "open".
    /// - `Command::Format` with the image, its size and the format options if the input starts with "format".
    /// - `Command::Print`, `Command::Bpb`, `Command::Free` and `Command::Skip` for their keyword.
    /// - `Command::Ls` and `Command::Cat` with their path, the root directory by default for "ls".
    /// - `Command::Unknown` if the input does not match any known command.
    /// - `Command::Invalid` if the arguments of a known command cannot be parsed.
    /// - `Command::Empty` if the input is empty or contains only whitespace.
    pub fn from_string(s: &str) -> Self {
        let mut parts = s.split_whitespace();
        match parts.next() {
            Some("quit") => Command::Quit,
            Some("open") => parse_open(parts).map_or_else(Command::Invalid, Command::Open),
            Some("format") => parse_format(parts).map_or_else(Command::Invalid, Command::Format),
            Some("print") => Command::Print,
            Some("bpb") => Command::Bpb,
            Some("free") => Command::Free,
            Some("ls") => Command::Ls(parts.next().unwrap_or("/").to_string()),
            Some("cat") => match parts.next() {
                Some(path) => Command::Cat(path.to_string()),
                None => Command::Invalid(String::from("Missing arg: 'cat' expects the path of a file.")),
            },
            Some("skip") => Command::Skip,
            Some(other) => Command::Unknown(other.to_string()),
            None => Command::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_with_a_stream_chain() {
        let Command::Open(args) = Command::from_string("open disk.img part=2 offset=1s remap=skip1K,4K swap")
        else {
            panic!("not an open command");
        };
        assert_eq!(args.path, "disk.img");
        assert_eq!(args.partition, Some(2));
        assert_eq!(args.offset, Some(512));
        assert_eq!(args.remap.as_deref(), Some("skip1K,4K"));
        assert!(args.swap);
        assert!(!args.read_only);

        let Command::Open(args) = Command::from_string("open disk.img buffer=8K ro") else {
            panic!("not an open command");
        };
        assert_eq!(args.buffer, Some(8192));
        assert!(args.read_only);
    }

    #[test]
    fn format_options() {
        let Command::Format(args) = Command::from_string("format new.img 1440K fat=12 label=BOOT") else {
            panic!("not a format command");
        };
        assert_eq!(args.path, "new.img");
        assert_eq!(args.size, 1440 * 1024);
        assert_eq!(args.options.fat_type, Some(FATType::FAT12));
        assert_eq!(args.options.label.as_deref(), Some("BOOT"));
    }

    #[test]
    fn invalid_and_unknown_input() {
        assert!(matches!(Command::from_string("open"), Command::Invalid(_)));
        assert!(matches!(Command::from_string("open a.img part=x"), Command::Invalid(_)));
        assert!(matches!(Command::from_string("format a.img"), Command::Invalid(_)));
        assert!(matches!(Command::from_string("format a.img 1M fat=13"), Command::Invalid(_)));
        assert!(matches!(Command::from_string("cat"), Command::Invalid(_)));
        assert!(matches!(Command::from_string("open a.img buffer=0"), Command::Invalid(_)));
        assert!(matches!(Command::from_string("open a.img buffer=700"), Command::Invalid(_)));
        assert!(matches!(Command::from_string("mdir"), Command::Unknown(_)));
        assert!(matches!(Command::from_string("   "), Command::Empty));
        assert!(matches!(Command::from_string("ls"), Command::Ls(path) if path == "/"));
    }
}
