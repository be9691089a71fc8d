// see: https://btrfs.readthedocs.io/en/latest/dev/On-disk-format.html
#![allow(dead_code)]

use num_enum::TryFromPrimitive;
use zerocopy::{AsBytes, FromBytes};

/* "_BHRfS_M" */
pub const SUPERBLOCK_MAGIC: u64 = 0x4D5F53665248425F;

/// Physical locations of the superblock and its mirrors on every device.
pub const SUPERBLOCK_ADDRS: [u64; 4] = [0x10000, 0x4000000, 0x4000000000, 0x4000000000000];
pub const SUPERBLOCK_SIZE: u64 = 0x1000;

/// First byte on a device handed to the allocator; everything below is
/// reserved for the boot area and primary superblock.
pub const DEVICE_RESERVED: u64 = 0x100000;

/// Logical address the first chunk may be placed at.
pub const FIRST_CHUNK_ADDRESS: u64 = 0xC00000;

pub const STRIPE_LENGTH: u64 = 0x10000; // BTRFS_STRIPE_LEN
pub const MAX_EXTENT_SIZE: u64 = 0x8000000; // 128 MB
pub const COMPRESSED_EXTENT_SIZE: u64 = 0x20000; // 128 KB

pub const DEFAULT_SECTOR_SIZE: u32 = 0x1000;
pub const DEFAULT_NODE_SIZE: u32 = 0x4000;
pub const DEFAULT_MAX_INLINE: u64 = 2048;

/*
 * Block-group / chunk type flags
 */
pub const BLOCK_FLAG_DATA: u64 = 0x001;
pub const BLOCK_FLAG_SYSTEM: u64 = 0x002;
pub const BLOCK_FLAG_METADATA: u64 = 0x004;
pub const BLOCK_FLAG_RAID0: u64 = 0x008;
pub const BLOCK_FLAG_RAID1: u64 = 0x010;
pub const BLOCK_FLAG_DUPLICATE: u64 = 0x020;
pub const BLOCK_FLAG_RAID10: u64 = 0x040;
pub const BLOCK_FLAG_RAID5: u64 = 0x080;
pub const BLOCK_FLAG_RAID6: u64 = 0x100;

pub const BLOCK_FLAG_PROFILE_MASK: u64 = BLOCK_FLAG_RAID0
    | BLOCK_FLAG_RAID1
    | BLOCK_FLAG_DUPLICATE
    | BLOCK_FLAG_RAID10
    | BLOCK_FLAG_RAID5
    | BLOCK_FLAG_RAID6;

/*
 * Inode flags
 */
pub const INODE_FLAG_NODATASUM: u64 = 0x001;
pub const INODE_FLAG_NODATACOW: u64 = 0x002;
pub const INODE_FLAG_READONLY: u64 = 0x004;
pub const INODE_FLAG_NOCOMPRESS: u64 = 0x008;
pub const INODE_FLAG_PREALLOC: u64 = 0x010;
pub const INODE_FLAG_COMPRESS: u64 = 0x800;

pub const INCOMPAT_FLAGS_RAID56: u64 = 0x080;
pub const INCOMPAT_FLAGS_COMPRESS_LZO: u64 = 0x008;

/*
 * Item key types consumed by the write path
 */
pub const TYPE_INODE_ITEM: u8 = 0x01;
pub const TYPE_EXTENT_DATA: u8 = 0x6C;
pub const TYPE_EXTENT_CSUM: u8 = 0x80;
pub const TYPE_EXTENT_ITEM: u8 = 0xA8;
pub const TYPE_CHUNK_ITEM: u8 = 0xE4;

pub const EXTENT_CSUM_TREE_KEY_ID: u64 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Zlib = 1,
    Lzo = 2,
}

impl Default for CompressionType {
    fn default() -> Self {
        CompressionType::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ExtentType {
    Inline = 0,
    Regular = 1,
    Prealloc = 2,
}

pub const ENCRYPTION_NONE: u8 = 0;
pub const ENCODING_NONE: u16 = 0;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct DiskKey {
    pub obj_id: u64,
    pub offset: u64,
    pub obj_type: u8,
}

/// CHUNK_ITEM fields consumed by the write path.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ChunkItem {
    pub size: u64,
    pub owner: u64,
    pub stripe_length: u64,
    pub chunk_type: u64,
    pub opt_io_alignment: u32,
    pub opt_io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ChunkItemStripe {
    pub dev_id: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// EXTENT_DATA2: the on-disk location half of a regular/prealloc extent item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ExtentData2 {
    /// Start of the on-disk extent (logical chunk address).
    pub address: u64,
    /// Size of the whole on-disk extent (compressed size when compressed).
    pub size: u64,
    /// Offset of this file extent into the decoded on-disk extent.
    pub offset: u64,
    /// Bytes of the file covered by this extent.
    pub num_bytes: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TimeSpec {
    pub seconds: i64,
    pub nanoseconds: u32,
}

/// INODE_ITEM. Only held in memory by the write path; the flush thread owns
/// committing it.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub st_size: u64,
    pub st_blocks: u64,
    pub block_group: u64,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_mode: u32,
    pub st_rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    pub st_atime: TimeSpec,
    pub st_ctime: TimeSpec,
    pub st_mtime: TimeSpec,
    pub st_otime: TimeSpec,
}

/// DEV_ITEM, padding-free layout for direct serialization.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct DevItem {
    pub dev_id: u64,
    pub num_bytes: u64,
    pub bytes_used: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub optimal_io_align: u32,
    pub optimal_io_width: u32,
    pub minimal_io_size: u32,
    pub device_uuid: [u8; 16],
    pub fs_uuid: [u8; 16],
}

/// On-disk superblock, restricted to the fields the write path consumes.
/// Written at `SUPERBLOCK_ADDRS[0]` of every device by format.
#[derive(Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct DiskSuperblock {
    pub csum: [u8; 32],
    pub fs_uuid: [u8; 16],
    pub phys_addr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    pub chunk_root_generation: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub num_devices: u64,
    pub incompat_flags: u64,
    pub sector_size: u32,
    pub node_size: u32,
    pub stripe_size: u32,
    pub checksum_type: u32,
    pub dev_item: DevItem,
}

impl DiskSuperblock {
    pub fn magic_matched(&self) -> bool {
        self.magic == SUPERBLOCK_MAGIC
    }
}

impl Default for DiskSuperblock {
    fn default() -> Self {
        DiskSuperblock::new_zeroed()
    }
}

pub fn profile_name(flags: u64) -> &'static str {
    if flags & BLOCK_FLAG_RAID0 != 0 {
        "raid0"
    } else if flags & BLOCK_FLAG_RAID1 != 0 {
        "raid1"
    } else if flags & BLOCK_FLAG_DUPLICATE != 0 {
        "dup"
    } else if flags & BLOCK_FLAG_RAID10 != 0 {
        "raid10"
    } else if flags & BLOCK_FLAG_RAID5 != 0 {
        "raid5"
    } else if flags & BLOCK_FLAG_RAID6 != 0 {
        "raid6"
    } else {
        "single"
    }
}

pub fn parse_profile(name: &str) -> Option<u64> {
    match name {
        "single" => Some(0),
        "dup" => Some(BLOCK_FLAG_DUPLICATE),
        "raid0" => Some(BLOCK_FLAG_RAID0),
        "raid1" => Some(BLOCK_FLAG_RAID1),
        "raid10" => Some(BLOCK_FLAG_RAID10),
        "raid5" => Some(BLOCK_FLAG_RAID5),
        "raid6" => Some(BLOCK_FLAG_RAID6),
        _ => None,
    }
}
