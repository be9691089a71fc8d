/// Volume bring-up and the write-path entry points.
use anyhow::{anyhow, Result};
use log::*;
use rand::Rng;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};

use disk_driver::{DiskDriver, SeekType, IOC_REQ_DEVICE_SIZE};

use crate::rbtrfs_lib::chunk::Device;
use crate::rbtrfs_lib::desc::*;
use crate::rbtrfs_lib::extent::Fcb;
use crate::rbtrfs_lib::mem::SuperblockMem;
use crate::rbtrfs_lib::rollback::{clear_rollback, Rollback};
use crate::rbtrfs_lib::utils::{deserialize_row, serialize_row};
use crate::rbtrfs_lib::{FsError, FsResult, MountOptions, Vcb};

/// Flags of one write request.
#[derive(Debug, Clone, Copy)]
pub struct WriteFlags {
    pub paging_io: bool,
    pub no_cache: bool,
    pub wait: bool,
    pub deferred: bool,
}

impl Default for WriteFlags {
    fn default() -> Self {
        Self { paging_io: false, no_cache: true, wait: true, deferred: false }
    }
}

fn query_size(driver: &mut dyn DiskDriver) -> Result<u64> {
    let mut buf = [0 as u8; 8];
    driver.ddriver_ioctl(IOC_REQ_DEVICE_SIZE, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn check_options(options: &MountOptions) -> Result<()> {
    if options.compress_type == CompressionType::Lzo {
        // no LZO codec is wired in; zlib is the supported compressor
        return Err(anyhow!("lzo compression is not supported"));
    }
    Ok(())
}

impl Vcb {
    fn assemble(
        drivers: Vec<(Box<dyn DiskDriver>, DevItem)>,
        sb: SuperblockMem,
        options: MountOptions,
    ) -> Vcb {
        let devices: Vec<Arc<Device>> = drivers
            .into_iter()
            .enumerate()
            .map(|(i, (driver, item))| Arc::new(Device::new(driver, item, i)))
            .collect();
        let data_flags = BLOCK_FLAG_DATA | options.data_profile;
        let metadata_flags = BLOCK_FLAG_METADATA | options.metadata_profile;
        let system_flags = BLOCK_FLAG_SYSTEM | options.system_profile;
        Vcb {
            options,
            superblock: RwLock::new(sb),
            devices,
            chunks: RwLock::new(vec![]),
            tree_lock: RwLock::new(()),
            volume_readonly: AtomicBool::new(false),
            dirty_fcbs: Mutex::new(vec![]),
            data_flags,
            metadata_flags,
            system_flags,
        }
    }

    /// Create a fresh volume on the given (already opened) devices: write a
    /// superblock to each and start with empty chunk state.
    pub fn format(mut drivers: Vec<Box<dyn DiskDriver>>, options: MountOptions) -> Result<Vcb> {
        check_options(&options)?;
        if drivers.is_empty() {
            return Err(anyhow!("no devices"));
        }

        let mut rng = rand::thread_rng();
        let fs_uuid: [u8; 16] = rng.gen();

        let mut total_bytes = 0;
        let mut items = vec![];
        for (i, driver) in drivers.iter_mut().enumerate() {
            let num_bytes = query_size(driver.as_mut())?;
            if num_bytes < 2 * DEVICE_RESERVED {
                return Err(anyhow!("device {} too small ({} bytes)", i, num_bytes));
            }
            total_bytes += num_bytes;
            items.push(DevItem {
                dev_id: i as u64 + 1,
                num_bytes,
                bytes_used: 0,
                generation: 1,
                start_offset: 0,
                dev_group: 0,
                optimal_io_align: STRIPE_LENGTH as u32,
                optimal_io_width: STRIPE_LENGTH as u32,
                minimal_io_size: DEFAULT_SECTOR_SIZE,
                device_uuid: rng.gen(),
                fs_uuid,
            });
        }

        let mut sbmem = SuperblockMem::default();
        sbmem.magic = SUPERBLOCK_MAGIC;
        sbmem.generation = 1;
        sbmem.chunk_root_generation = 1;
        sbmem.total_bytes = total_bytes;
        sbmem.num_devices = drivers.len() as u64;
        sbmem.sector_size = DEFAULT_SECTOR_SIZE;
        sbmem.node_size = DEFAULT_NODE_SIZE;
        sbmem.stripe_size = STRIPE_LENGTH as u32;

        for (driver, item) in drivers.iter_mut().zip(items.iter()) {
            let mut sb = DiskSuperblock::default();
            sbmem.apply_to(&mut sb);
            sb.fs_uuid = fs_uuid;
            sb.phys_addr = SUPERBLOCK_ADDRS[0];
            sb.dev_item = *item;

            let mut block = vec![0 as u8; SUPERBLOCK_SIZE as usize];
            let raw = unsafe { serialize_row(&sb) };
            block[..raw.len()].copy_from_slice(raw);
            driver.ddriver_seek(SUPERBLOCK_ADDRS[0] as i64, SeekType::Set)?;
            driver.ddriver_write(&block, block.len())?;
        }
        info!("formatted {} devices, {} bytes total", items.len(), total_bytes);

        let paired = drivers.into_iter().zip(items.into_iter()).collect();
        Ok(Self::assemble(paired, sbmem, options))
    }

    /// Mount existing devices: validate each superblock and rebuild
    /// in-memory state. Chunk-tree replay belongs to the metadata store, so
    /// a reopened volume starts with a clean allocator.
    pub fn open(mut drivers: Vec<Box<dyn DiskDriver>>, options: MountOptions) -> Result<Vcb> {
        check_options(&options)?;
        if drivers.is_empty() {
            return Err(anyhow!("no devices"));
        }

        let mut sbmem = SuperblockMem::default();
        let mut items = vec![];
        for (i, driver) in drivers.iter_mut().enumerate() {
            let mut block = vec![0 as u8; SUPERBLOCK_SIZE as usize];
            driver.ddriver_seek(SUPERBLOCK_ADDRS[0] as i64, SeekType::Set)?;
            let block_len = block.len();
            driver.ddriver_read(&mut block, block_len)?;
            let sb: DiskSuperblock = unsafe { deserialize_row(&block) };
            if !sb.magic_matched() {
                return Err(anyhow!("device {}: superblock magic not found", i));
            }
            if i == 0 {
                sbmem.apply_from(&sb);
            }
            items.push(sb.dev_item);
        }
        if sbmem.num_devices != drivers.len() as u64 {
            return Err(anyhow!(
                "volume wants {} devices, {} given",
                sbmem.num_devices,
                drivers.len()
            ));
        }
        info!("mounted: {}", sbmem.to_string());

        let paired = drivers.into_iter().zip(items.into_iter()).collect();
        Ok(Self::assemble(paired, sbmem, options))
    }

    pub fn create_fcb(&self, subvol: u64, inode: u64, flags: u64) -> Fcb {
        let mut fcb = Fcb::new(subvol, inode, flags);
        fcb.inode_item.generation = self.generation();
        fcb
    }

    pub fn flush_devices(&self) -> FsResult<()> {
        for dev in self.devices.iter() {
            dev.flush()?;
        }
        Ok(())
    }

    fn finish<T>(
        &self,
        fcb: &mut Fcb,
        rollback: &mut Rollback,
        result: FsResult<T>,
    ) -> FsResult<T> {
        match result {
            Ok(v) => {
                clear_rollback(rollback);
                Ok(v)
            }
            Err(e) => {
                warn!("write path failed, rolling back: {}", e);
                self.do_rollback(fcb, rollback);
                if matches!(e, FsError::Corrupted(_)) {
                    self.mark_volume_readonly();
                }
                Err(e)
            }
        }
    }

    /// Write `buf` at `offset`. Paging writes never extend the file;
    /// non-paging writes past EOF extend it first.
    pub fn write(&self, fcb: &mut Fcb, offset: u64, buf: &[u8], flags: WriteFlags) -> FsResult<usize> {
        if buf.is_empty() {
            warn!("returning success for zero-length write");
            return Ok(0);
        }
        if self.is_readonly() {
            return Err(FsError::InvalidArgument("volume is readonly"));
        }
        let fmt = fcb.inode_item.st_mode & 0o170000;
        if fmt != 0o100000 && fmt != 0o120000 {
            warn!("tried to write to something other than a file or symlink");
            return Err(FsError::InvalidArgument("not a regular file"));
        }
        if flags.no_cache && !flags.wait {
            return Err(FsError::Pending);
        }

        let _tree = self.tree_lock.read().unwrap();
        let mut rollback = Rollback::new();
        let result = self.write_file2(fcb, offset, buf, &flags, &mut rollback);
        self.finish(fcb, &mut rollback, result)
    }

    pub fn truncate(&self, fcb: &mut Fcb, new_end: u64) -> FsResult<()> {
        if self.is_readonly() {
            return Err(FsError::InvalidArgument("volume is readonly"));
        }
        if new_end > fcb.inode_item.st_size {
            return Err(FsError::InvalidArgument("truncate cannot grow a file"));
        }
        let _tree = self.tree_lock.read().unwrap();
        let mut rollback = Rollback::new();
        let result = self.truncate_file(fcb, new_end, &mut rollback);
        self.finish(fcb, &mut rollback, result)
    }

    pub fn extend(&self, fcb: &mut Fcb, new_end: u64, preallocate: bool) -> FsResult<()> {
        if self.is_readonly() {
            return Err(FsError::InvalidArgument("volume is readonly"));
        }
        if new_end < fcb.inode_item.st_size {
            return Err(FsError::InvalidArgument("extend cannot shrink a file"));
        }
        let _tree = self.tree_lock.read().unwrap();
        let mut rollback = Rollback::new();
        let result = self.extend_file(fcb, new_end, preallocate, &mut rollback);
        self.finish(fcb, &mut rollback, result)
    }

    /// Hole punch over `[start, end)`.
    pub fn punch_hole(&self, fcb: &mut Fcb, start: u64, end: u64) -> FsResult<()> {
        if self.is_readonly() {
            return Err(FsError::InvalidArgument("volume is readonly"));
        }
        let _tree = self.tree_lock.read().unwrap();
        let mut rollback = Rollback::new();
        let result = self.excise(fcb, start, end, &mut rollback);
        self.finish(fcb, &mut rollback, result)
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the byte count
    /// actually available before EOF.
    pub fn read(&self, fcb: &Fcb, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let size = fcb.inode_item.st_size;
        if offset >= size {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, size - offset) as usize;
        self.read_file(fcb, offset, &mut buf[..len])?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbtrfs_lib::test_support::*;
    use crate::rbtrfs_lib::ExtentType;
    use disk_driver::file::FileDiskDriver;
    use rand::{RngCore, SeedableRng};
    use std::sync::atomic::Ordering;

    fn assert_space_invariants(vcb: &Vcb) {
        for c in vcb.chunks.read().unwrap().iter() {
            let inner = c.lock_inner();
            assert_eq!(
                inner.used + inner.space.total(),
                c.chunk_item.size,
                "chunk {:x} used/free mismatch",
                c.offset
            );
        }
    }

    fn raid_options(profile: u64) -> MountOptions {
        MountOptions { data_profile: profile, ..Default::default() }
    }

    #[test]
    fn small_write_becomes_inline() {
        // scenario 1: 8 bytes at offset 0 of an empty file
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let n = vcb.write(&mut fcb, 0, b"rbtrfs!!", WriteFlags::default()).unwrap();
        assert_eq!(n, 8);

        let live: Vec<_> = fcb.live_extents().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].extent_type(), ExtentType::Inline);
        assert_eq!(live[0].decoded_size, 8);
        assert_eq!(fcb.inode_item.st_blocks, 8);
        assert_eq!(fcb.inode_item.st_size, 8);
        // no chunk was allocated for an inline write
        assert!(vcb.chunks.read().unwrap().is_empty());

        let mut buf = [0 as u8; 8];
        assert_eq!(vcb.read(&fcb, 0, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"rbtrfs!!");
    }

    #[test]
    fn raid0_write_stripes_across_devices() {
        // scenario 2: 128 KiB at offset 0 on RAID0, N=2, L=64 KiB
        let vcb = make_vcb_with_options(2, 0x2000000, raid_options(BLOCK_FLAG_RAID0));
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let data: Vec<u8> = (0..0x20000).map(|i| (i % 251) as u8).collect();
        vcb.write(&mut fcb, 0, &data, WriteFlags::default()).unwrap();

        let live: Vec<_> = fcb.live_extents().collect();
        assert_eq!(live.len(), 1);
        assert_eq!((live[0].offset, live[0].len()), (0, 0x20000));
        let de = live[0].disk_extent().unwrap();
        let c = vcb.get_chunk_from_address(de.address).unwrap();
        assert!(c.chunk_type() & BLOCK_FLAG_RAID0 != 0);

        // stripe 0 received the first unit, stripe 1 the second
        let off = de.address - c.offset;
        assert_eq!(off % STRIPE_LENGTH, 0);
        let mut s0 = vec![0 as u8; 0x10000];
        let mut s1 = vec![0 as u8; 0x10000];
        let (devoff, stripe) =
            crate::rbtrfs_lib::chunk::get_raid0_offset(off, STRIPE_LENGTH, 2);
        assert_eq!(stripe, 0);
        c.devices[0].read_phys(c.cis[0].offset + devoff, &mut s0).unwrap();
        c.devices[1].read_phys(c.cis[1].offset + devoff, &mut s1).unwrap();
        assert_eq!(s0, &data[..0x10000]);
        assert_eq!(s1, &data[0x10000..]);

        let mut back = vec![0 as u8; data.len()];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert_eq!(back, data);
        assert_space_invariants(&vcb);
    }

    #[test]
    fn raid5_small_write_round_trips_and_reconstructs() {
        // scenario 3, via the full write path (sector-padded)
        let mut options = raid_options(BLOCK_FLAG_RAID5);
        options.max_inline = 0;
        let vcb = make_vcb_with_options(3, 0x2000000, options);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let payload: Vec<u8> = (0..0x400).map(|i| (i * 31 % 256) as u8).collect();
        vcb.write(&mut fcb, 0, &payload, WriteFlags::default()).unwrap();

        let mut back = vec![0 as u8; 0x400];
        assert_eq!(vcb.read(&fcb, 0, &mut back).unwrap(), 0x400);
        assert_eq!(back, payload);

        // simulate losing the first data stripe: rebuild from parity
        let de = fcb.live_extents().next().unwrap().disk_extent().unwrap().clone();
        let c = vcb.get_chunk_from_address(de.address).unwrap();
        let span = 0x1000;
        let off = de.address - c.offset;
        assert_eq!(off, 0);
        let mut d1 = vec![0 as u8; span];
        let mut p = vec![0 as u8; span];
        c.devices[1].read_phys(c.cis[1].offset, &mut d1).unwrap();
        c.devices[2].read_phys(c.cis[2].offset, &mut p).unwrap();
        let rebuilt: Vec<u8> = (0..span).map(|i| p[i] ^ d1[i]).collect();
        assert_eq!(&rebuilt[..0x400], &payload[..]);
    }

    #[test]
    fn cow_overwrite_splits_extent_and_bumps_ref() {
        // scenario 4: 4 KiB write into the middle of a 1 MiB extent
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let mut base = vec![0 as u8; 0x100000];
        for (i, b) in base.iter_mut().enumerate() {
            *b = (i % 241) as u8;
        }
        vcb.write(&mut fcb, 0, &base, WriteFlags::default()).unwrap();
        let orig = fcb.live_extents().next().unwrap().disk_extent().unwrap().clone();

        let patch = vec![0xcd as u8; 0x1000];
        vcb.write(&mut fcb, 0x80000, &patch, WriteFlags::default()).unwrap();

        let live: Vec<_> = fcb.live_extents().collect();
        assert_eq!(live.len(), 3);
        assert_eq!((live[0].offset, live[0].len()), (0, 0x80000));
        assert_eq!((live[1].offset, live[1].len()), (0x80000, 0x1000));
        assert_eq!((live[2].offset, live[2].len()), (0x81000, 0x7f000));
        // outer pieces still reference the original on-disk extent
        assert_eq!(live[0].disk_extent().unwrap().address, orig.address);
        assert_eq!(live[2].disk_extent().unwrap().address, orig.address);
        assert_eq!(live[2].disk_extent().unwrap().offset, 0x81000);
        // the patch went elsewhere
        assert!(live[1].disk_extent().unwrap().address >= orig.address + orig.size);
        // one ref for the original write, one more for the split
        let c = vcb.get_chunk_from_address(orig.address).unwrap();
        assert_eq!(c.changed_extent_count(orig.address), Some(2));

        let mut expect = base;
        expect[0x80000..0x81000].copy_from_slice(&patch);
        let mut back = vec![0 as u8; expect.len()];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert_eq!(back, expect);
        assert_eq!(fcb.inode_item.st_blocks, 0x100000);
        assert_space_invariants(&vcb);
    }

    #[test]
    fn prealloc_overwrite_converts_head_in_place() {
        // scenario 5: 64 KiB write at the start of a 1 MiB prealloc extent
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        vcb.extend(&mut fcb, 0x100000, true).unwrap();

        let orig = fcb.live_extents().next().unwrap().disk_extent().unwrap().clone();
        let chunks_before = vcb.chunks.read().unwrap().len();

        let data = vec![0x42 as u8; 0x10000];
        vcb.write(&mut fcb, 0, &data, WriteFlags::default()).unwrap();

        let live: Vec<_> = fcb.live_extents().collect();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].extent_type(), ExtentType::Regular);
        assert_eq!((live[0].offset, live[0].len()), (0, 0x10000));
        assert_eq!(live[0].disk_extent().unwrap().address, orig.address);
        assert_eq!(live[0].disk_extent().unwrap().offset, 0);
        assert_eq!(live[1].extent_type(), ExtentType::Prealloc);
        assert_eq!((live[1].offset, live[1].len()), (0x10000, 0xf0000));
        assert_eq!(live[1].disk_extent().unwrap().address, orig.address);
        assert_eq!(live[1].disk_extent().unwrap().offset, 0x10000);
        // no new chunk was needed: the data landed in the reserved space
        assert_eq!(vcb.chunks.read().unwrap().len(), chunks_before);
        assert_eq!(fcb.inode_item.st_blocks, 0x100000);

        let mut back = vec![0 as u8; 0x20000];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert_eq!(&back[..0x10000], &data[..]);
        assert!(back[0x10000..].iter().all(|b| *b == 0));
    }

    #[test]
    fn incompressible_first_block_sets_nocompress() {
        // scenario 6
        let mut options = MountOptions::default();
        options.compress = true;
        options.compress_type = CompressionType::Zlib;
        let vcb = make_vcb_with_options(1, 0x2000000, options);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut data = vec![0 as u8; 0x40000];
        rng.fill_bytes(&mut data);
        vcb.write(&mut fcb, 0, &data, WriteFlags::default()).unwrap();

        assert!(fcb.inode_item.flags & INODE_FLAG_NOCOMPRESS != 0);
        for e in fcb.live_extents() {
            assert_eq!(e.compression, CompressionType::None);
        }

        // later writes must not attempt compression either
        let mut more = vec![0 as u8; 0x20000];
        rng.fill_bytes(&mut more);
        vcb.write(&mut fcb, 0x40000, &more, WriteFlags::default()).unwrap();
        for e in fcb.live_extents() {
            assert_eq!(e.compression, CompressionType::None);
        }

        let mut back = vec![0 as u8; 0x60000];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert_eq!(&back[..0x40000], &data[..]);
        assert_eq!(&back[0x40000..], &more[..]);
    }

    #[test]
    fn compressible_write_round_trips() {
        let mut options = MountOptions::default();
        options.compress = true;
        options.compress_type = CompressionType::Zlib;
        let vcb = make_vcb_with_options(1, 0x2000000, options);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);

        let data: Vec<u8> = (0..0x40000).map(|i| (i / 0x1000) as u8).collect();
        vcb.write(&mut fcb, 0, &data, WriteFlags::default()).unwrap();

        let live: Vec<_> = fcb.live_extents().collect();
        assert!(!live.is_empty());
        for e in live.iter() {
            assert_eq!(e.compression, CompressionType::Zlib);
            let de = e.disk_extent().unwrap();
            assert!(de.size < de.num_bytes);
            // csums cover the compressed bytes
            assert_eq!(e.csum.as_ref().unwrap().len() as u64, de.size / 0x1000);
        }

        let mut back = vec![0 as u8; data.len()];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert_eq!(back, data);
        assert_space_invariants(&vcb);
    }

    #[test]
    fn zero_length_write_is_a_noop() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        assert_eq!(vcb.write(&mut fcb, 0, &[], WriteFlags::default()).unwrap(), 0);
        assert_eq!(fcb.inode_item.st_size, 0);
        assert!(fcb.extents.is_empty());
        assert!(!fcb.dirty);
    }

    #[test]
    fn paging_write_clamps_at_eof() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        vcb.write(&mut fcb, 0, &vec![1 as u8; 0x2000], WriteFlags::default()).unwrap();

        let paging = WriteFlags { paging_io: true, ..Default::default() };
        // fully past EOF: silently succeeds without writing
        assert_eq!(vcb.write(&mut fcb, 0x4000, &[2; 0x1000], paging).unwrap(), 0);
        assert_eq!(fcb.inode_item.st_size, 0x2000);
        // crossing EOF: clamped
        assert_eq!(vcb.write(&mut fcb, 0x1000, &[3; 0x2000], paging).unwrap(), 0x1000);
        assert_eq!(fcb.inode_item.st_size, 0x2000);
    }

    #[test]
    fn nonpaging_write_past_eof_extends() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        vcb.write(&mut fcb, 0x8000, &vec![7 as u8; 0x1000], WriteFlags::default()).unwrap();
        assert_eq!(fcb.inode_item.st_size, 0x9000);

        // the hole reads back as zeros
        let mut buf = vec![0xff as u8; 0x9000];
        vcb.read(&fcb, 0, &mut buf).unwrap();
        assert!(buf[..0x8000].iter().all(|b| *b == 0));
        assert!(buf[0x8000..].iter().all(|b| *b == 7));
    }

    #[test]
    fn inline_promotion_happens_exactly_past_max_inline() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let max_inline = vcb.max_inline();

        vcb.write(&mut fcb, 0, &vec![1 as u8; max_inline as usize], WriteFlags::default())
            .unwrap();
        assert_eq!(fcb.live_extents().next().unwrap().extent_type(), ExtentType::Inline);

        // one byte past the limit promotes to a regular extent
        vcb.write(&mut fcb, max_inline, &[2 as u8], WriteFlags::default()).unwrap();
        let live: Vec<_> = fcb.live_extents().collect();
        assert!(live.iter().all(|e| e.extent_type() == ExtentType::Regular));

        let mut back = vec![0 as u8; max_inline as usize + 1];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert!(back[..max_inline as usize].iter().all(|b| *b == 1));
        assert_eq!(back[max_inline as usize], 2);
    }

    #[test]
    fn failed_write_rolls_back_state() {
        let (vcb, fail) = failing_device_vcb(1, 0x2000000, 0);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);

        fail.store(true, Ordering::SeqCst);
        let err = vcb.write(&mut fcb, 0, &vec![9 as u8; 0x10000], WriteFlags::default());
        assert!(matches!(err, Err(FsError::DeviceError(_))));

        assert_eq!(fcb.live_extents().count(), 0);
        assert_eq!(fcb.inode_item.st_blocks, 0);
        assert_space_invariants(&vcb);

        // the same write succeeds once the device recovers
        fail.store(false, Ordering::SeqCst);
        let data = vec![9 as u8; 0x10000];
        vcb.write(&mut fcb, 0, &data, WriteFlags::default()).unwrap();
        let mut back = vec![0 as u8; data.len()];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert_eq!(back, data);
        assert_space_invariants(&vcb);
    }

    #[test]
    fn nowait_direct_write_returns_pending() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let flags = WriteFlags { wait: false, ..Default::default() };
        assert!(matches!(
            vcb.write(&mut fcb, 0, &[1], flags),
            Err(FsError::Pending)
        ));
    }

    #[test]
    fn readonly_volume_rejects_writes() {
        let options = MountOptions { readonly: true, ..Default::default() };
        let vcb = make_vcb_with_options(1, 0x2000000, options);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        assert!(matches!(
            vcb.write(&mut fcb, 0, &[1], WriteFlags::default()),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn truncate_drops_tail_extents() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let data: Vec<u8> = (0..0x4000).map(|i| (i % 199) as u8).collect();
        vcb.write(&mut fcb, 0, &data, WriteFlags::default()).unwrap();

        vcb.truncate(&mut fcb, 0x1000).unwrap();
        assert_eq!(fcb.inode_item.st_size, 0x1000);
        assert_eq!(fcb.inode_item.st_blocks, 0x1000);
        let live: Vec<_> = fcb.live_extents().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].len(), 0x1000);

        let mut back = vec![0 as u8; 0x1000];
        assert_eq!(vcb.read(&fcb, 0, &mut back).unwrap(), 0x1000);
        assert_eq!(&back, &data[..0x1000]);
    }

    #[test]
    fn punch_hole_is_idempotent() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        vcb.write(&mut fcb, 0, &vec![5 as u8; 0x4000], WriteFlags::default()).unwrap();

        vcb.punch_hole(&mut fcb, 0x1000, 0x2000).unwrap();
        let blocks = fcb.inode_item.st_blocks;
        let shape: Vec<(u64, u64)> = fcb.live_extents().map(|e| (e.offset, e.len())).collect();

        vcb.punch_hole(&mut fcb, 0x1000, 0x2000).unwrap();
        assert_eq!(fcb.inode_item.st_blocks, blocks);
        let shape2: Vec<(u64, u64)> = fcb.live_extents().map(|e| (e.offset, e.len())).collect();
        assert_eq!(shape, shape2);

        let mut back = vec![0xff as u8; 0x4000];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert!(back[..0x1000].iter().all(|b| *b == 5));
        assert!(back[0x1000..0x2000].iter().all(|b| *b == 0));
        assert!(back[0x2000..].iter().all(|b| *b == 5));
    }

    #[test]
    fn blocks_match_live_extents_after_writes() {
        let vcb = make_vcb(2, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for i in 0..6 {
            let mut data = vec![0 as u8; 0x3000];
            rng.fill_bytes(&mut data);
            vcb.write(&mut fcb, i * 0x2000, &data, WriteFlags::default()).unwrap();
        }
        let total: u64 = fcb
            .live_extents()
            .filter(|e| e.extent_type() != ExtentType::Inline)
            .map(|e| e.len())
            .sum();
        assert_eq!(total, fcb.inode_item.st_blocks);
        fcb.check_extent_invariants();
        assert_space_invariants(&vcb);
    }

    #[test]
    fn raid6_write_round_trips() {
        let mut options = raid_options(BLOCK_FLAG_RAID6);
        options.max_inline = 0;
        let vcb = make_vcb_with_options(4, 0x2000000, options);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let data: Vec<u8> = (0..0x30000).map(|i| (i * 11 % 256) as u8).collect();
        vcb.write(&mut fcb, 0, &data, WriteFlags::default()).unwrap();

        let mut back = vec![0 as u8; data.len()];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert_eq!(back, data);
        assert_space_invariants(&vcb);
    }

    #[test]
    fn format_and_reopen_preserves_superblock() {
        let path = std::env::temp_dir().join(format!("rbtrfs-open-{}.img", std::process::id()));
        let path_str = path.to_str().unwrap();
        {
            let mut driver = FileDiskDriver::new(0x2000000);
            driver.ddriver_open(path_str).unwrap();
            let vcb = Vcb::format(vec![Box::new(driver)], MountOptions::default()).unwrap();
            assert_eq!(vcb.superblock.read().unwrap().num_devices, 1);
        }
        {
            let mut driver = FileDiskDriver::new(0x2000000);
            driver.ddriver_open(path_str).unwrap();
            let vcb = Vcb::open(vec![Box::new(driver)], MountOptions::default()).unwrap();
            let sb = vcb.superblock.read().unwrap();
            assert_eq!(sb.generation, 1);
            assert_eq!(sb.num_devices, 1);
            assert_eq!(sb.sector_size, DEFAULT_SECTOR_SIZE);
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn open_rejects_blank_device() {
        let driver = disk_driver::memory::MemoryDiskDriver::with_size(0x2000000);
        assert!(Vcb::open(vec![Box::new(driver)], MountOptions::default()).is_err());
    }

    #[test]
    fn lzo_mount_option_is_rejected() {
        let mut options = MountOptions::default();
        options.compress = true;
        options.compress_type = CompressionType::Lzo;
        let driver = disk_driver::memory::MemoryDiskDriver::with_size(0x2000000);
        assert!(Vcb::format(vec![Box::new(driver)], options).is_err());
    }

    #[test]
    fn sequential_appends_share_a_chunk() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, 0);
        let a = vec![1 as u8; 0x20000];
        let b = vec![2 as u8; 0x20000];
        vcb.write(&mut fcb, 0, &a, WriteFlags::default()).unwrap();
        vcb.write(&mut fcb, 0x20000, &b, WriteFlags::default()).unwrap();

        let addrs: Vec<u64> = fcb
            .live_extents()
            .map(|e| e.disk_extent().unwrap().address)
            .collect();
        let c0 = vcb.get_chunk_from_address(addrs[0]).unwrap();
        for a in addrs.iter() {
            assert!(std::sync::Arc::ptr_eq(&vcb.get_chunk_from_address(*a).unwrap(), &c0));
        }

        let mut back = vec![0 as u8; 0x40000];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert_eq!(&back[..0x20000], &a[..]);
        assert_eq!(&back[0x20000..], &b[..]);
    }

    #[test]
    fn nodatacow_overwrite_stays_in_place() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = vcb.create_fcb(5, 0x101, INODE_FLAG_NODATACOW | INODE_FLAG_NODATASUM);
        let a = vec![1 as u8; 0x10000];
        vcb.write(&mut fcb, 0, &a, WriteFlags::default()).unwrap();
        let orig = fcb.live_extents().next().unwrap().disk_extent().unwrap().clone();

        let b = vec![2 as u8; 0x4000];
        vcb.write(&mut fcb, 0x2000, &b, WriteFlags::default()).unwrap();

        // still one extent at the same disk location
        let live: Vec<_> = fcb.live_extents().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].disk_extent().unwrap().address, orig.address);

        let mut back = vec![0 as u8; 0x10000];
        vcb.read(&fcb, 0, &mut back).unwrap();
        assert!(back[..0x2000].iter().all(|x| *x == 1));
        assert!(back[0x2000..0x6000].iter().all(|x| *x == 2));
        assert!(back[0x6000..].iter().all(|x| *x == 1));
    }
}
