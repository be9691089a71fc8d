/// Write-path core of a btrfs-compatible volume
use lazy_static::lazy_static;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

pub mod chunk;
pub mod compress;
pub mod csum;
pub mod desc;
pub mod extent;
pub mod file;
pub mod fs;
pub mod mem;
pub mod raid;
pub mod rollback;
pub mod space;
pub mod utils;
pub mod write;

pub use chunk::{Chunk, Device};
pub use desc::*;
pub use extent::{Extent, ExtentContent, Fcb};
pub use fs::WriteFlags;
pub use mem::SuperblockMem;
pub use rollback::{Rollback, RollbackItem};

/// Error kinds surfaced by the write path.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("disk full")]
    OutOfSpace,
    #[error("device error: {0}")]
    DeviceError(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("conflicting byte-range lock")]
    Conflict,
    #[error("operation pending")]
    Pending,
    #[error("filesystem corrupted: {0}")]
    Corrupted(&'static str),
}

pub type FsResult<T> = Result<T, FsError>;

/// Process-wide facts detected once at startup.
pub struct Runtime {
    /// XOR in machine words instead of bytes.
    pub wide_xor: bool,
    /// Sector count above which checksumming is fanned out to workers.
    pub csum_offload_sectors: usize,
}

impl Runtime {
    fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        let wide_xor = is_x86_feature_detected!("sse2");
        #[cfg(not(target_arch = "x86_64"))]
        let wide_xor = true;

        Self { wide_xor, csum_offload_sectors: 40 }
    }
}

lazy_static! {
    pub static ref RUNTIME: Runtime = Runtime::detect();
}

/// Mount-time tunables consumed by the write path.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub max_inline: u64,
    pub compress: bool,
    pub compress_force: bool,
    pub compress_type: CompressionType,
    pub zlib_level: u32,
    pub readonly: bool,
    pub no_barrier: bool,
    pub no_trim: bool,
    /// Block-group profile bits for data / metadata / system chunks
    /// (`BLOCK_FLAG_RAID*`, without the kind bit).
    pub data_profile: u64,
    pub metadata_profile: u64,
    pub system_profile: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            max_inline: DEFAULT_MAX_INLINE,
            compress: false,
            compress_force: false,
            compress_type: CompressionType::None,
            zlib_level: 3,
            readonly: false,
            no_barrier: false,
            no_trim: false,
            data_profile: 0,
            metadata_profile: 0,
            system_profile: 0,
        }
    }
}

/// The mounted volume: devices, chunks, superblock and the locks tying them
/// together.
pub struct Vcb {
    pub options: MountOptions,
    /// Generation and accounting; taken after `tree_lock` where both apply.
    pub superblock: RwLock<SuperblockMem>,
    pub devices: Vec<Arc<Device>>,
    /// Shared for lookup, exclusive for allocation.
    pub chunks: RwLock<Vec<Arc<Chunk>>>,
    /// Shared by writes, exclusive during commit.
    pub tree_lock: RwLock<()>,
    pub(crate) volume_readonly: AtomicBool,
    /// (subvol, inode) pairs awaiting the flush thread.
    pub dirty_fcbs: Mutex<Vec<(u64, u64)>>,
    pub data_flags: u64,
    pub metadata_flags: u64,
    pub system_flags: u64,
}

impl Vcb {
    pub fn sector_size(self: &Self) -> u64 {
        self.superblock.read().unwrap().sector_size as u64
    }

    pub fn stripe_length(self: &Self) -> u64 {
        STRIPE_LENGTH
    }

    pub fn max_inline(self: &Self) -> u64 {
        self.options.max_inline
    }

    pub fn generation(self: &Self) -> u64 {
        self.superblock.read().unwrap().generation
    }

    pub fn is_readonly(&self) -> bool {
        self.options.readonly || self.volume_readonly.load(Ordering::Relaxed)
    }

    /// Corruption downgrades the volume to readonly on first occurrence.
    pub fn mark_volume_readonly(&self) {
        if !self.volume_readonly.swap(true, Ordering::SeqCst) {
            error!("marking volume readonly after corruption");
        }
    }

    pub fn mark_fcb_dirty(&self, fcb: &mut Fcb) {
        fcb.dirty = true;
        let mut dirty = self.dirty_fcbs.lock().unwrap();
        if !dirty.contains(&(fcb.subvol, fcb.inode)) {
            dirty.push((fcb.subvol, fcb.inode));
        }
    }

    pub fn write_fcb_compressed(&self, fcb: &Fcb) -> bool {
        if self.options.compress_force {
            return true;
        }
        if fcb.inode_item.flags & INODE_FLAG_NOCOMPRESS != 0 {
            return false;
        }
        fcb.inode_item.flags & INODE_FLAG_COMPRESS != 0
            || (self.options.compress && self.options.compress_type != CompressionType::None)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use anyhow::Result;
    use disk_driver::memory::MemoryDiskDriver;
    use disk_driver::{DiskDriver, SeekType};
    use std::sync::atomic::AtomicBool;

    pub fn make_vcb(num_devices: usize, dev_size: u64) -> Vcb {
        make_vcb_with_options(num_devices, dev_size, MountOptions::default())
    }

    pub fn make_vcb_with_options(num_devices: usize, dev_size: u64, options: MountOptions) -> Vcb {
        let drivers: Vec<Box<dyn DiskDriver>> = (0..num_devices)
            .map(|_| Box::new(MemoryDiskDriver::with_size(dev_size as usize)) as Box<dyn DiskDriver>)
            .collect();
        Vcb::format(drivers, options).unwrap()
    }

    pub fn make_fcb() -> Fcb {
        Fcb::new(5, 0x100, 0)
    }

    /// Memory driver whose writes start failing once the flag is raised.
    struct FailingDiskDriver {
        inner: MemoryDiskDriver,
        fail: Arc<AtomicBool>,
    }

    impl DiskDriver for FailingDiskDriver {
        fn ddriver_open(&mut self, path: &str) -> Result<()> {
            self.inner.ddriver_open(path)
        }
        fn ddriver_close(&mut self) -> Result<()> {
            self.inner.ddriver_close()
        }
        fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
            self.inner.ddriver_seek(offset, whence)
        }
        fn ddriver_write(&mut self, buf: &[u8], size: usize) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("injected write failure");
            }
            self.inner.ddriver_write(buf, size)
        }
        fn ddriver_read(&mut self, buf: &mut [u8], size: usize) -> Result<usize> {
            self.inner.ddriver_read(buf, size)
        }
        fn ddriver_ioctl(&mut self, cmd: u32, arg: &mut [u8]) -> Result<()> {
            self.inner.ddriver_ioctl(cmd, arg)
        }
        fn ddriver_reset(&mut self) -> Result<()> {
            self.inner.ddriver_reset()
        }
    }

    /// A volume whose device `failing_index` can be switched to fail writes.
    pub fn failing_device_vcb(
        num_devices: usize,
        dev_size: u64,
        failing_index: usize,
    ) -> (Vcb, Arc<AtomicBool>) {
        let fail = Arc::new(AtomicBool::new(false));
        let drivers: Vec<Box<dyn DiskDriver>> = (0..num_devices)
            .map(|i| {
                if i == failing_index {
                    Box::new(FailingDiskDriver {
                        inner: MemoryDiskDriver::with_size(dev_size as usize),
                        fail: fail.clone(),
                    }) as Box<dyn DiskDriver>
                } else {
                    Box::new(MemoryDiskDriver::with_size(dev_size as usize)) as Box<dyn DiskDriver>
                }
            })
            .collect();
        let vcb = Vcb::format(drivers, MountOptions::default()).unwrap();
        (vcb, fail)
    }
}
