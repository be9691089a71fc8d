use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use disk_driver::{DiskDriver, SeekType};

use crate::rbtrfs_lib::desc::*;
use crate::rbtrfs_lib::space::{Space, SpaceList};
use crate::rbtrfs_lib::{FsError, FsResult, Vcb};

/// One physical device participating in the volume.
pub struct Device {
    pub disk_num: usize,
    pub dev_item: Mutex<DevItem>,
    pub space: Mutex<SpaceList>,
    pub readonly: bool,
    pub reloc: bool,
    driver: Mutex<Box<dyn DiskDriver>>,
}

impl Device {
    pub fn new(driver: Box<dyn DiskDriver>, dev_item: DevItem, disk_num: usize) -> Self {
        let mut space = SpaceList::new();
        if dev_item.num_bytes > DEVICE_RESERVED {
            space.add(DEVICE_RESERVED, dev_item.num_bytes - DEVICE_RESERVED);
        }
        Self {
            disk_num,
            dev_item: Mutex::new(dev_item),
            space: Mutex::new(space),
            readonly: false,
            reloc: false,
            driver: Mutex::new(driver),
        }
    }

    pub fn id(&self) -> u64 {
        self.dev_item.lock().unwrap().dev_id
    }

    pub fn num_bytes(&self) -> u64 {
        self.dev_item.lock().unwrap().num_bytes
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.dev_item.lock().unwrap().device_uuid
    }

    /// Synchronous physical read at a device byte offset.
    pub fn read_phys(&self, offset: u64, buf: &mut [u8]) -> FsResult<()> {
        let mut driver = self.driver.lock().unwrap();
        driver
            .ddriver_seek(offset as i64, SeekType::Set)
            .map_err(|e| FsError::DeviceError(format!("dev {} seek {:x}: {}", self.disk_num, offset, e)))?;
        driver
            .ddriver_read(buf, buf.len())
            .map_err(|e| FsError::DeviceError(format!("dev {} read {:x}: {}", self.disk_num, offset, e)))?;
        Ok(())
    }

    /// Synchronous gather-write at a device byte offset.
    pub fn write_phys(&self, offset: u64, bufs: &[&[u8]]) -> FsResult<()> {
        let mut driver = self.driver.lock().unwrap();
        driver
            .ddriver_seek(offset as i64, SeekType::Set)
            .map_err(|e| FsError::DeviceError(format!("dev {} seek {:x}: {}", self.disk_num, offset, e)))?;
        for buf in bufs {
            driver
                .ddriver_write(buf, buf.len())
                .map_err(|e| FsError::DeviceError(format!("dev {} write {:x}: {}", self.disk_num, offset, e)))?;
        }
        Ok(())
    }

    pub fn flush(&self) -> FsResult<()> {
        self.driver
            .lock()
            .unwrap()
            .ddriver_flush()
            .map_err(|e| FsError::DeviceError(format!("dev {} flush: {}", self.disk_num, e)))
    }
}

/// Chunk state guarded by the per-chunk lock.
pub struct ChunkInner {
    pub used: u64,
    /// Free ranges in absolute logical addresses.
    pub space: SpaceList,
    pub cache_loaded: bool,
}

impl ChunkInner {
    /// Best-fit address for `length` bytes, or None when the chunk cannot
    /// hold it. Mirrors the by-size walk of the free-space cache.
    pub fn find_data_address(&self, chunk_size: u64, length: u64) -> Option<u64> {
        if length > chunk_size - self.used {
            return None;
        }
        if self.space.is_empty() {
            return None;
        }
        self.space.find(length).map(|s| s.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedExtentRef {
    pub subvol: u64,
    pub inode: u64,
    pub offset: u64,
    pub count: i64,
}

/// Extent reference delta queued for the flush thread.
#[derive(Debug, Clone)]
pub struct ChangedExtent {
    pub address: u64,
    pub size: u64,
    pub count: i64,
    pub no_csum: bool,
    pub superseded: bool,
    pub refs: Vec<ChangedExtentRef>,
}

struct RangeLock {
    start: u64,
    length: u64,
}

pub struct Chunk {
    pub offset: u64,
    pub chunk_item: ChunkItem,
    pub cis: Vec<ChunkItemStripe>,
    pub devices: Vec<Arc<Device>>,
    pub inner: Mutex<ChunkInner>,
    pub changed_extents: Mutex<Vec<ChangedExtent>>,
    range_locks: Mutex<Vec<RangeLock>>,
    range_locks_event: Condvar,
    pub readonly: AtomicBool,
    pub reloc: AtomicBool,
    pub created: AtomicBool,
}

impl Chunk {
    pub fn chunk_type(&self) -> u64 {
        self.chunk_item.chunk_type
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Relaxed)
    }

    pub fn is_reloc(&self) -> bool {
        self.reloc.load(Ordering::Relaxed)
    }

    pub fn is_raid56(&self) -> bool {
        self.chunk_type() & (BLOCK_FLAG_RAID5 | BLOCK_FLAG_RAID6) != 0
    }

    /// Parity stripes of the profile: 1 for RAID5, 2 for RAID6, else 0.
    pub fn parity_stripes(&self) -> u16 {
        if self.chunk_type() & BLOCK_FLAG_RAID5 != 0 {
            1
        } else if self.chunk_type() & BLOCK_FLAG_RAID6 != 0 {
            2
        } else {
            0
        }
    }

    pub fn data_stripes(&self) -> u16 {
        self.chunk_item.num_stripes - self.parity_stripes()
    }

    pub fn lock_inner(&self) -> MutexGuard<'_, ChunkInner> {
        self.inner.lock().unwrap()
    }

    pub fn free_bytes(&self) -> u64 {
        let inner = self.lock_inner();
        self.chunk_item.size - inner.used
    }

    /// The full parity rows touched by `[address, address+length)`.
    pub fn get_raid56_lock_range(&self, address: u64, length: u64) -> (u64, u64) {
        let l = self.chunk_item.stripe_length;
        let datastripes = self.data_stripes() as u64;
        let (mut startoff, _) = get_raid0_offset(address - self.offset, l, datastripes as u16);
        let (endoff, _) = get_raid0_offset(address + length - self.offset - 1, l, datastripes as u16);

        startoff -= startoff % l;
        let endoff = crate::rbtrfs_lib::utils::sector_align(endoff, l);

        (self.offset + startoff * datastripes, (endoff - startoff) * datastripes)
    }

    /// Exclusive range lock over `[start, start+length)`; the guard releases
    /// on drop. Overlapping lockers sleep on the chunk's event.
    pub fn lock_range(&self, start: u64, length: u64) -> RangeLockGuard<'_> {
        let mut locks = self.range_locks.lock().unwrap();
        loop {
            let overlaps = locks
                .iter()
                .any(|r| r.start < start + length && r.start + r.length > start);
            if !overlaps {
                locks.push(RangeLock { start, length });
                return RangeLockGuard { chunk: self, start, length };
            }
            locks = self.range_locks_event.wait(locks).unwrap();
        }
    }

    fn unlock_range(&self, start: u64, length: u64) {
        let mut locks = self.range_locks.lock().unwrap();
        if let Some(pos) = locks
            .iter()
            .position(|r| r.start == start && r.length == length)
        {
            locks.remove(pos);
        }
        self.range_locks_event.notify_all();
    }

    pub fn add_changed_extent_ref(
        &self,
        address: u64,
        size: u64,
        subvol: u64,
        inode: u64,
        offset: u64,
        count: i64,
        no_csum: bool,
    ) {
        self.update_changed_extent_ref(address, size, subvol, inode, offset, count, no_csum, false)
    }

    /// Queue a reference-count delta against the on-disk extent at `address`.
    /// `superseded` marks the old extent entry as wholly replaced.
    pub fn update_changed_extent_ref(
        &self,
        address: u64,
        size: u64,
        subvol: u64,
        inode: u64,
        offset: u64,
        count: i64,
        no_csum: bool,
        superseded: bool,
    ) {
        let mut list = self.changed_extents.lock().unwrap();
        let entry = match list.iter_mut().find(|ce| ce.address == address) {
            Some(entry) => entry,
            None => {
                list.push(ChangedExtent {
                    address,
                    size,
                    count: 0,
                    no_csum,
                    superseded: false,
                    refs: vec![],
                });
                list.last_mut().unwrap()
            }
        };
        entry.count += count;
        entry.no_csum |= no_csum;
        entry.superseded |= superseded;
        match entry
            .refs
            .iter_mut()
            .find(|r| r.subvol == subvol && r.inode == inode && r.offset == offset)
        {
            Some(r) => r.count += count,
            None => entry.refs.push(ChangedExtentRef { subvol, inode, offset, count }),
        }
    }

    /// Net queued reference delta for the extent at `address`, for the flush
    /// thread and for tests.
    pub fn changed_extent_count(&self, address: u64) -> Option<i64> {
        self.changed_extents
            .lock()
            .unwrap()
            .iter()
            .find(|ce| ce.address == address)
            .map(|ce| ce.count)
    }
}

pub struct RangeLockGuard<'a> {
    chunk: &'a Chunk,
    start: u64,
    length: u64,
}

impl Drop for RangeLockGuard<'_> {
    fn drop(&mut self) {
        self.chunk.unlock_range(self.start, self.length);
    }
}

/// Split `off` within a striped region into (device byte offset, stripe index).
pub fn get_raid0_offset(off: u64, stripe_length: u64, num_stripes: u16) -> (u64, u16) {
    let startoff = off % (num_stripes as u64 * stripe_length);
    let initoff = (off / (num_stripes as u64 * stripe_length)) * stripe_length;

    let stripe = (startoff / stripe_length) as u16;
    (initoff + startoff - stripe as u64 * stripe_length, stripe)
}

struct StripeSel {
    device: Arc<Device>,
    hole: Space,
}

impl Vcb {
    pub fn get_chunk_from_address(&self, address: u64) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read().unwrap();
        for c in chunks.iter() {
            if address >= c.offset && address < c.offset + c.chunk_item.size {
                return Some(c.clone());
            }
        }
        None
    }

    /// Walk existing chunks for one matching `flags` with at least `needed`
    /// free bytes; allocate a new chunk when none qualifies.
    pub fn find_or_alloc_chunk(&self, flags: u64, needed: u64) -> FsResult<Arc<Chunk>> {
        {
            let chunks = self.chunks.read().unwrap();
            for c in chunks.iter() {
                if !c.is_readonly() && !c.is_reloc() && c.chunk_type() == flags {
                    let inner = c.lock_inner();
                    if c.chunk_item.size - inner.used >= needed {
                        return Ok(c.clone());
                    }
                }
            }
        }
        self.alloc_chunk(flags)
    }

    fn find_new_stripe(&self, stripes: &[StripeSel], max_stripe_size: u64) -> Option<StripeSel> {
        let mut devusage = u64::MAX;
        let mut best: Option<StripeSel> = None;

        for dev in self.devices.iter() {
            if dev.readonly || dev.reloc {
                continue;
            }
            if stripes.iter().any(|s| Arc::ptr_eq(&s.device, dev)) {
                continue;
            }
            let item = dev.dev_item.lock().unwrap();
            // favour devices which have been used the least
            let usage = item.bytes_used * 4096 / item.num_bytes;
            drop(item);
            if usage < devusage {
                let space = dev.space.lock().unwrap();
                // smallest hole on this device still >= max_stripe_size
                let found_hole = space.holes_at_least(max_stripe_size).next();
                if let Some(hole) = found_hole {
                    best = Some(StripeSel { device: dev.clone(), hole });
                    devusage = usage;
                }
            }
        }

        if best.is_none() {
            // Can't find hole of at least max_stripe_size; look for the
            // largest one we can find
            for dev in self.devices.iter() {
                if dev.readonly || dev.reloc {
                    continue;
                }
                if stripes.iter().any(|s| Arc::ptr_eq(&s.device, dev)) {
                    continue;
                }
                let space = dev.space.lock().unwrap();
                if let Some(hole) = space.largest() {
                    let better = match &best {
                        Some(b) => b.hole.size < hole.size,
                        None => true,
                    };
                    if better {
                        best = Some(StripeSel { device: dev.clone(), hole });
                    }
                }
            }
        }

        best
    }

    /// DUP places both stripes on one device: either two holes each big
    /// enough, or one hole that can hold both stripes back to back.
    fn find_new_dup_stripes(&self, max_stripe_size: u64) -> Option<(StripeSel, StripeSel)> {
        let mut devusage = u64::MAX;
        let mut found: Option<(Arc<Device>, Space, Space)> = None;

        for dev in self.devices.iter() {
            if dev.readonly || dev.reloc {
                continue;
            }
            let item = dev.dev_item.lock().unwrap();
            let usage = item.bytes_used * 4096 / item.num_bytes;
            drop(item);
            if usage < devusage {
                let space = dev.space.lock().unwrap();
                let mut suitable = space.holes_at_least(max_stripe_size);
                let dh1 = suitable.next();
                let dh2 = suitable.next();
                if let Some(dh1) = dh1 {
                    if dh2.is_some() || dh1.size >= 2 * max_stripe_size {
                        found = Some((dev.clone(), dh1, dh2.unwrap_or(dh1)));
                        devusage = usage;
                    }
                }
            }
        }

        if found.is_none() {
            // fall back to the device offering the most usable DUP space
            let mut size = 0;
            for dev in self.devices.iter() {
                if dev.readonly || dev.reloc {
                    continue;
                }
                let space = dev.space.lock().unwrap();
                let mut holes: Vec<Space> = space.iter().collect();
                holes.sort_by(|a, b| b.size.cmp(&a.size));
                let dh1 = match holes.first() {
                    Some(h) => *h,
                    None => continue,
                };
                let dh2 = holes.get(1).copied();
                let devsize = match dh2 {
                    Some(dh2) => std::cmp::max(dh1.size / 2, std::cmp::min(dh1.size, dh2.size)),
                    None => dh1.size / 2,
                };
                if devsize > size {
                    let second = match dh2 {
                        Some(dh2) if std::cmp::min(dh1.size, dh2.size) > dh1.size / 2 => dh2,
                        _ => dh1,
                    };
                    found = Some((dev.clone(), dh1, second));
                    size = devsize;
                }
            }
        }

        found.map(|(dev, dh1, dh2)| {
            (
                StripeSel { device: dev.clone(), hole: dh1 },
                StripeSel { device: dev, hole: dh2 },
            )
        })
    }

    fn find_new_chunk_address(chunks: &[Arc<Chunk>], size: u64) -> u64 {
        let mut lastaddr = FIRST_CHUNK_ADDRESS;
        for c in chunks.iter() {
            if c.offset >= lastaddr + size {
                return lastaddr;
            }
            lastaddr = c.offset + c.chunk_item.size;
        }
        lastaddr
    }

    /// Create a chunk for the block-group `flags`, reserving stripe ranges on
    /// the chosen devices. Fails with OutOfSpace when no viable device
    /// selection exists.
    pub fn alloc_chunk(&self, flags: u64) -> FsResult<Arc<Chunk>> {
        let mut chunks = self.chunks.write().unwrap();

        let total_size: u64 = self.devices.iter().map(|d| d.num_bytes()).sum();
        trace!("total_size = {:x}", total_size);

        // We purposely check for DATA first - mixed blocks have the same size
        // as DATA ones.
        let (max_stripe_size, mut max_chunk_size) = if flags & BLOCK_FLAG_DATA != 0 {
            let mss = 0x40000000; // 1 GB
            (mss, 10 * mss)
        } else if flags & BLOCK_FLAG_METADATA != 0 {
            let mss = if total_size > 0xC80000000 {
                0x40000000 // 1 GB
            } else {
                0x10000000 // 256 MB
            };
            (mss, mss)
        } else {
            let mss = 0x2000000; // 32 MB
            (mss, 2 * mss)
        };

        max_chunk_size = std::cmp::min(max_chunk_size, total_size / 10); // cap at 10%

        trace!(
            "would allocate a new chunk of {:x} bytes and stripe {:x}",
            max_chunk_size,
            max_stripe_size
        );

        let num_devices = self.devices.len() as u16;
        let (min_stripes, max_stripes, sub_stripes, type_) = if flags & BLOCK_FLAG_DUPLICATE != 0 {
            (2, 2, 0, BLOCK_FLAG_DUPLICATE)
        } else if flags & BLOCK_FLAG_RAID0 != 0 {
            (2, num_devices, 0, BLOCK_FLAG_RAID0)
        } else if flags & BLOCK_FLAG_RAID1 != 0 {
            (2, 2, 1, BLOCK_FLAG_RAID1)
        } else if flags & BLOCK_FLAG_RAID10 != 0 {
            (4, num_devices, 2, BLOCK_FLAG_RAID10)
        } else if flags & BLOCK_FLAG_RAID5 != 0 {
            (3, num_devices, 1, BLOCK_FLAG_RAID5)
        } else if flags & BLOCK_FLAG_RAID6 != 0 {
            (4, 257, 1, BLOCK_FLAG_RAID6)
        } else {
            // SINGLE
            (1, 1, 1, 0)
        };

        let mut stripes: Vec<StripeSel> = vec![];

        if type_ == BLOCK_FLAG_DUPLICATE {
            match self.find_new_dup_stripes(max_stripe_size) {
                Some((s1, s2)) => {
                    stripes.push(s1);
                    stripes.push(s2);
                }
                None => return Err(FsError::OutOfSpace),
            }
        } else {
            for _ in 0..max_stripes {
                match self.find_new_stripe(&stripes, max_stripe_size) {
                    Some(s) => stripes.push(s),
                    None => break,
                }
            }
        }

        let mut num_stripes = stripes.len() as u16;

        // for RAID10, round down to an even number of stripes
        if type_ == BLOCK_FLAG_RAID10 && num_stripes % sub_stripes != 0 {
            num_stripes -= num_stripes % sub_stripes;
            stripes.truncate(num_stripes as usize);
        }

        if num_stripes < min_stripes {
            warn!("found {} stripes, needed at least {}", num_stripes, min_stripes);
            return Err(FsError::OutOfSpace);
        }

        let stripe_length = STRIPE_LENGTH;
        let dup_same_hole = type_ == BLOCK_FLAG_DUPLICATE && stripes[1].hole == stripes[0].hole;

        let mut stripe_size = if dup_same_hole {
            std::cmp::min(stripes[0].hole.size / 2, max_stripe_size)
        } else {
            let mut ss = max_stripe_size;
            for s in stripes.iter() {
                if s.hole.size < ss {
                    ss = s.hole.size;
                }
            }
            ss
        };

        let factor = if type_ == 0 || type_ == BLOCK_FLAG_DUPLICATE || type_ == BLOCK_FLAG_RAID1 {
            1
        } else if type_ == BLOCK_FLAG_RAID0 {
            num_stripes as u64
        } else if type_ == BLOCK_FLAG_RAID10 {
            num_stripes as u64 / sub_stripes as u64
        } else if type_ == BLOCK_FLAG_RAID5 {
            num_stripes as u64 - 1
        } else {
            // RAID6
            num_stripes as u64 - 2
        };

        if stripe_size * factor > max_chunk_size {
            stripe_size = max_chunk_size / factor;
        }
        if stripe_size % stripe_length > 0 {
            stripe_size -= stripe_size % stripe_length;
        }
        if stripe_size == 0 {
            return Err(FsError::OutOfSpace);
        }

        let chunk_item = ChunkItem {
            size: stripe_size * factor,
            owner: 0,
            stripe_length,
            chunk_type: flags,
            opt_io_alignment: stripe_length as u32,
            opt_io_width: stripe_length as u32,
            sector_size: self.sector_size() as u32,
            num_stripes,
            sub_stripes: if sub_stripes == 0 { 1 } else { sub_stripes },
        };

        let mut cis = Vec::with_capacity(num_stripes as usize);
        let mut devices = Vec::with_capacity(num_stripes as usize);
        for (i, s) in stripes.iter().enumerate() {
            let offset = if dup_same_hole && i == 1 {
                stripes[0].hole.address + stripe_size
            } else {
                s.hole.address
            };
            cis.push(ChunkItemStripe {
                dev_id: s.device.id(),
                offset,
                dev_uuid: s.device.uuid(),
            });
            devices.push(s.device.clone());
        }

        let logaddr = Self::find_new_chunk_address(&chunks, chunk_item.size);

        {
            let mut sb = self.superblock.write().unwrap();
            sb.chunk_root_generation = sb.generation;
            if flags & (BLOCK_FLAG_RAID5 | BLOCK_FLAG_RAID6) != 0 {
                sb.incompat_flags |= INCOMPAT_FLAGS_RAID56;
            }
        }

        let mut space = SpaceList::new();
        space.add(logaddr, chunk_item.size);

        let c = Chunk {
            offset: logaddr,
            chunk_item,
            cis,
            devices,
            inner: Mutex::new(ChunkInner { used: 0, space, cache_loaded: true }),
            changed_extents: Mutex::new(vec![]),
            range_locks: Mutex::new(vec![]),
            range_locks_event: Condvar::new(),
            readonly: AtomicBool::new(false),
            reloc: AtomicBool::new(false),
            created: AtomicBool::new(true),
        };

        self.protect_superblocks(&c, stripe_size);

        for (i, s) in stripes.iter().enumerate() {
            let mut item = s.device.dev_item.lock().unwrap();
            item.bytes_used += stripe_size;
            drop(item);
            let mut dev_space = s.device.space.lock().unwrap();
            if !dev_space.subtract(c.cis[i].offset, stripe_size) {
                error!(
                    "device {} stripe range {:x}+{:x} was not free",
                    s.device.disk_num, c.cis[i].offset, stripe_size
                );
            }
        }

        info!(
            "allocated {} chunk at {:x}, size {:x}, {} stripes",
            profile_name(flags),
            c.offset,
            c.chunk_item.size,
            c.chunk_item.num_stripes
        );

        let c = Arc::new(c);
        match chunks.iter().position(|c2| c2.offset > c.offset) {
            Some(pos) => chunks.insert(pos, c.clone()),
            None => chunks.push(c.clone()),
        }

        Ok(c)
    }

    /// Remove from the chunk's free space every logical range that maps to a
    /// physical superblock location, so data writes can never clobber one.
    fn protect_superblocks(&self, c: &Chunk, stripe_size: u64) {
        let n = c.chunk_item.num_stripes as u64;
        let k = c.chunk_item.sub_stripes as u64;
        let l = c.chunk_item.stripe_length;
        let t = c.chunk_item.chunk_type;
        let mut inner = c.inner.lock().unwrap();

        for i in 0..c.chunk_item.num_stripes as usize {
            for sb in SUPERBLOCK_ADDRS {
                let cis_off = c.cis[i].offset;
                if sb + SUPERBLOCK_SIZE <= cis_off || sb >= cis_off + stripe_size {
                    continue;
                }
                let off = sb - cis_off;
                let (logical, len) = if t & BLOCK_FLAG_RAID0 != 0 {
                    (c.offset + (off / l) * n * l + i as u64 * l + off % l, SUPERBLOCK_SIZE)
                } else if t & BLOCK_FLAG_RAID10 != 0 {
                    (
                        c.offset + (off / l) * (n / k) * l + (i as u64 / k) * l + off % l,
                        SUPERBLOCK_SIZE,
                    )
                } else if t & (BLOCK_FLAG_RAID5 | BLOCK_FLAG_RAID6) != 0 {
                    // lock out the whole parity row holding the superblock
                    let ds = c.data_stripes() as u64;
                    (c.offset + (off / l) * ds * l, ds * l)
                } else {
                    (c.offset + off, SUPERBLOCK_SIZE)
                };
                if inner.space.subtract(logical, len) {
                    inner.used += len;
                    debug!(
                        "protected superblock at {:x} (logical {:x}+{:x}) in chunk {:x}",
                        sb, logical, len, c.offset
                    );
                }
            }
        }
    }
}
