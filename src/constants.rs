/// The number of partitions supported by an MBR partition table.
pub const PART_CNT: usize = 4;

/// The default size of a sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// The largest sector size accepted when mounting.
pub const MAX_SECTOR_SIZE: usize = 4096;

/// The size of an on-disk directory record.
pub const DIR_ENTRY_SIZE: usize = 32;

/// The largest cluster size, in bytes, any FAT implementation is expected to handle.
pub const MAX_BYTES_PER_CLUSTER: u32 = 32 * 1024;

/// Maximum count of clusters described by a 12 bit FAT.
pub const FAT12_MAX_CLUSTERS: u32 = 4085;

/// Maximum count of clusters described by a 16 bit FAT.
pub const FAT16_MAX_CLUSTERS: u32 = 65525;

/// Maximum count of clusters described by a 32 bit FAT.
pub const FAT32_MAX_CLUSTERS: u32 = 0x0FFF_FFF6;

/// Some Windows NT releases only consider a volume FAT16 from 4087 clusters on.
pub const FAT12_NT_CLUSTERS: u32 = FAT12_MAX_CLUSTERS + 2;
