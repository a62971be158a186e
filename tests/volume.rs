use fatkit::filesystem::{FATError, FATType, FileSystem, FormatOptions, MountOptions};
use fatkit::stream::{DeviceStream, OffsetStream, PartitionStream, Stream};
use fatkit::utils::{set_u16_at, set_u32_at};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn populate(fs: &FileSystem) {
    fs.mkdir("DOCS").unwrap();
    fs.mkdir("DOCS/OLD").unwrap();

    let mut file = fs.create("DOCS/REPORT.TXT").unwrap();
    file.write_all(&pattern(70_000), 0).unwrap();
    file.close().unwrap();

    let mut file = fs.create("README").unwrap();
    file.write_all(b"fatkit", 0).unwrap();
    file.close().unwrap();
}

fn check(fs: &FileSystem) {
    let names: Vec<String> = fs
        .read_dir("/")
        .unwrap()
        .iter()
        .map(|r| r.short_name().clone())
        .collect();
    assert!(names.contains(&"DOCS".to_string()));
    assert!(names.contains(&"README".to_string()));

    assert_eq!(fs.open("readme").unwrap().read_to_end().unwrap(), b"fatkit");
    assert_eq!(
        fs.open("/DOCS/REPORT.TXT").unwrap().read_to_end().unwrap(),
        pattern(70_000)
    );
    assert!(fs.open("DOCS/OLD").unwrap().metadata().unwrap().is_dir());
    assert!(matches!(fs.open("DOCS/NONE"), Err(FATError::NotFound(_))));
}

fn round_trip(dev: Box<dyn Stream>, options: &FormatOptions, fat_type: FATType) {
    let fs = FileSystem::format(dev, options).unwrap();
    assert_eq!(fs.fat_type(), fat_type);
    let free = fs.free_clusters().unwrap();

    populate(&fs);
    check(&fs);
    let used = free - fs.free_clusters().unwrap();
    assert!(used > 0);

    let dev = fs.unmount().unwrap();
    let fs = FileSystem::mount(dev, &MountOptions::default()).unwrap();
    assert_eq!(fs.fat_type(), fat_type);
    check(&fs);
    assert_eq!(free - fs.free_clusters().unwrap(), used);

    fs.remove("DOCS/REPORT.TXT").unwrap();
    fs.remove("DOCS/OLD").unwrap();
    fs.remove("DOCS").unwrap();
    fs.remove("README").unwrap();
    assert_eq!(fs.free_clusters().unwrap(), free);
    fs.unmount().unwrap();
}

#[test]
fn fat12_floppy_round_trip() {
    let dev = DeviceStream::memory(2880 * 512);
    round_trip(Box::new(dev), &FormatOptions::default(), FATType::FAT12);
}

#[test]
fn fat16_round_trip() {
    let dev = DeviceStream::memory(20480 * 512);
    round_trip(Box::new(dev), &FormatOptions::default(), FATType::FAT16);
}

#[test]
fn fat32_round_trip() {
    let dev = DeviceStream::memory(70_000 * 512);
    let options = FormatOptions::default()
        .fat_type(FATType::FAT32)
        .cluster_size(1);
    round_trip(Box::new(dev), &options, FATType::FAT32);
}

#[test]
fn volume_behind_an_offset() {
    let dev = DeviceStream::memory(4096 * 512);
    let dev = OffsetStream::open(Box::new(dev), 64 * 512).unwrap();
    round_trip(Box::new(dev), &FormatOptions::default(), FATType::FAT12);
}

#[test]
fn volume_in_a_partition() {
    let mut dev = DeviceStream::memory(8192 * 512);
    let mut mbr = vec![0u8; 512];
    mbr[446 + 4] = 0x06;
    set_u32_at(&mut mbr, 446 + 8, 63);
    set_u32_at(&mut mbr, 446 + 12, 3000);
    set_u16_at(&mut mbr, 510, 0xAA55);
    dev.write(&mbr, 0).unwrap();

    let part = PartitionStream::open(Box::new(dev), 1).unwrap();
    let options = FormatOptions::default().hidden(63);
    round_trip(Box::new(part), &options, FATType::FAT12);
}

#[test]
fn label_survives_remount() {
    let dev = DeviceStream::memory(2880 * 512);
    let fs = FileSystem::format(Box::new(dev), &FormatOptions::default().label("backup")).unwrap();
    assert_eq!(fs.label().unwrap().as_deref(), Some("BACKUP"));

    let fs = FileSystem::mount(fs.unmount().unwrap(), &MountOptions::default()).unwrap();
    assert_eq!(fs.label().unwrap().as_deref(), Some("BACKUP"));
    assert_eq!(fs.bpb().label().vol_lab(), b"BACKUP     ");
}
