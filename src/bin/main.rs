//! This is the main entry point for the interactive FAT tool.
//!
//! The program reads commands from standard input: users can format new
//! images, open existing ones through a chain of streams, print their layout
//! and boot sector, list directories and print files.

use fatkit::commands::{Command, FormatArgs, OpenArgs};
use fatkit::filesystem::{FATError, FileSystem, MountOptions};
use fatkit::stream::DeviceStream;
use fatkit::traits::LayoutDisplay;
use log::{error, info, warn};
use std::io::{self, Write};
use std::path::Path;

/// Represents the runtime state of the program.
///
/// This struct keeps track of the mounted volume and of the options of the next mount.
struct RunState {
    /// The currently mounted volume.
    fs: Option<FileSystem>,
    /// Enable the validation of the bpb
    bpb_validation: bool,
}

impl RunState {
    /// Flushes and releases the mounted volume, if any.
    fn close(&mut self) {
        if let Some(fs) = self.fs.take() {
            match fs.unmount() {
                Ok(mut dev) => {
                    if let Err(err) = dev.release() {
                        error!("Failed to release the image: {err}");
                    }
                }
                Err(err) => error!("Failed to unmount: {err}"),
            }
        }
    }

    fn open(&mut self, args: &OpenArgs) {
        self.close();

        let options = MountOptions::default()
            .validate(self.bpb_validation)
            .buffer_window(args.buffer);
        let fs = args
            .build()
            .map_err(FATError::from)
            .and_then(|dev| FileSystem::mount(dev, &options));
        match fs {
            Ok(fs) => {
                info!("Mounted {} volume from {}", fs.fat_type(), args.path);
                self.fs = Some(fs);
            }
            Err(err) => error!("{err}"),
        }
    }

    fn format(&mut self, args: &FormatArgs) {
        self.close();

        let fs = DeviceStream::create(Path::new(&args.path), args.size)
            .map_err(FATError::from)
            .and_then(|dev| FileSystem::format(Box::new(dev), &args.options));
        match fs {
            Ok(fs) => {
                println!("Formatted {} as {}", args.path, fs.fat_type());
                self.fs = Some(fs);
            }
            Err(err) => error!("Format failed: {err}"),
        }
    }

    fn mounted(&self) -> Option<&FileSystem> {
        if self.fs.is_none() {
            warn!("Open or format an image first");
        }
        self.fs.as_ref()
    }
}

fn list(fs: &FileSystem, path: &str) -> Result<(), FATError> {
    for record in fs.read_dir(path)? {
        let entry = record.entry();
        if entry.is_dir() {
            println!("{:<13} {:>10}  {}", record.short_name(), "<DIR>", record.name());
        } else {
            println!("{:<13} {:>10}  {}", record.short_name(), entry.file_size(), record.name());
        }
    }

    let free = fs.free_space()?;
    println!("{free} bytes free");
    Ok(())
}

fn cat(fs: &FileSystem, path: &str) -> Result<(), FATError> {
    let mut file = fs.open(path)?;
    let data = file.read_to_end()?;
    io::stdout().write_all(&data)?;
    file.close()
}

fn main() {
    let logger = stderrlog::new()
        .module(module_path!())
        .module("fatkit")
        .verbosity(2usize)
        .init();
    if let Err(err) = logger {
        eprintln!("Logger initialisation failed: {err}");
    }

    let mut run_state = RunState {
        fs: None,
        bpb_validation: true,
    };

    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            break;
        }

        let mut s = String::new();
        match io::stdin().read_line(&mut s) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                error!("Failed to read command: {err}");
                break;
            }
        }
        let cmd = Command::from_string(&s);

        match cmd {
            Command::Open(args) => run_state.open(&args),
            Command::Format(args) => run_state.format(&args),
            Command::Quit => break,
            Command::Print => {
                if let Some(fs) = run_state.mounted() {
                    match fs.display_layout(3) {
                        Ok(layout) => print!("{layout}"),
                        Err(e) => error!("Print layout error: {e}"),
                    }
                }
            }
            Command::Bpb => {
                if let Some(fs) = run_state.mounted() {
                    println!("{}", fs.bpb());
                }
            }
            Command::Free => {
                if let Some(fs) = run_state.mounted() {
                    match (fs.free_clusters(), fs.free_space()) {
                        (Ok(clusters), Ok(bytes)) => println!("{clusters} free clusters ({bytes} bytes)"),
                        (Err(err), _) | (_, Err(err)) => error!("{err}"),
                    }
                }
            }
            Command::Ls(path) => {
                if let Some(fs) = run_state.mounted() {
                    if let Err(err) = list(fs, &path) {
                        error!("ls {path}: {err}");
                    }
                }
            }
            Command::Cat(path) => {
                if let Some(fs) = run_state.mounted() {
                    if let Err(err) = cat(fs, &path) {
                        error!("cat {path}: {err}");
                    }
                }
            }
            Command::Skip => run_state.bpb_validation = false,
            Command::Unknown(s) => error!("Unknown command: {s:?}"),
            Command::Invalid(s) => error!("{s}"),
            Command::Empty => {}
        }
    }

    run_state.close();
}
