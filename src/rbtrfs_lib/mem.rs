/// Manage filesystem structure in memory
use macro_tools::ApplyMem;

use crate::rbtrfs_lib::desc::DiskSuperblock;

#[derive(ApplyMem, Default, Clone, Copy, Debug)]
#[ApplyMemTo(DiskSuperblock)]
pub struct SuperblockMem {
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
}

impl SuperblockMem {
    pub fn to_string(&self) -> String {
        format!(
            "btrfs gen {} devices {} total {} KiB used {} KiB, sector {} B",
            self.generation,
            self.num_devices,
            self.total_bytes / 0x400,
            self.bytes_used / 0x400,
            self.sector_size
        )
    }
}
