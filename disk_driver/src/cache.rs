use anyhow::Result;
use log::*;
use lru::LruCache;
use std::num::NonZeroUsize;

use crate::{DiskDriver, SeekType};

const CACHE_BLOCKS: usize = 256;

/// Write-through LRU block cache over another driver. Blocks are cached at
/// iounit granularity; writes update the cache and go straight down.
pub struct CacheDiskDriver<T: DiskDriver> {
    inner: T,
    cache: LruCache<u64, Vec<u8>>,
    unit: usize,
    pointer: u64,
}

impl<T: DiskDriver> CacheDiskDriver<T> {
    pub fn new(inner: T, unit: usize) -> Self {
        Self {
            inner,
            cache: LruCache::new(NonZeroUsize::new(CACHE_BLOCKS).unwrap()),
            unit,
            pointer: 0,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn read_block(&mut self, block: u64) -> Result<Vec<u8>> {
        if let Some(data) = self.cache.get(&block) {
            return Ok(data.clone());
        }
        let mut data = vec![0 as u8; self.unit];
        self.inner.ddriver_seek((block * self.unit as u64) as i64, SeekType::Set)?;
        self.inner.ddriver_read(&mut data, self.unit)?;
        self.cache.put(block, data.clone());
        Ok(data)
    }
}

impl<T: DiskDriver> DiskDriver for CacheDiskDriver<T> {
    fn ddriver_open(&mut self, path: &str) -> Result<()> {
        self.inner.ddriver_open(path)
    }

    fn ddriver_close(&mut self) -> Result<()> {
        self.cache.clear();
        self.inner.ddriver_close()
    }

    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.pointer = match whence {
            SeekType::Set => offset as u64,
            SeekType::Cur => (self.pointer as i64 + offset) as u64,
            SeekType::End => {
                // delegate so the inner driver reports its own layout size
                return self.inner.ddriver_seek(offset, whence);
            }
        };
        self.inner.ddriver_seek(self.pointer as i64, SeekType::Set)
    }

    fn ddriver_write(&mut self, buf: &[u8], size: usize) -> Result<usize> {
        let unit = self.unit as u64;
        let mut pos = self.pointer;
        let mut done = 0;
        while done < size {
            let block = pos / unit;
            let head = (pos % unit) as usize;
            let len = std::cmp::min(size - done, self.unit - head);
            if head == 0 && len == self.unit {
                self.cache.put(block, buf[done..done + len].to_vec());
            } else if let Some(cached) = self.cache.get_mut(&block) {
                cached[head..head + len].copy_from_slice(&buf[done..done + len]);
            }
            pos += len as u64;
            done += len;
        }
        self.inner.ddriver_seek(self.pointer as i64, SeekType::Set)?;
        let n = self.inner.ddriver_write(buf, size)?;
        self.pointer += n as u64;
        Ok(n)
    }

    fn ddriver_read(&mut self, buf: &mut [u8], size: usize) -> Result<usize> {
        let unit = self.unit as u64;
        let mut pos = self.pointer;
        let mut done = 0;
        while done < size {
            let block = pos / unit;
            let head = (pos % unit) as usize;
            let len = std::cmp::min(size - done, self.unit - head);
            let data = self.read_block(block)?;
            buf[done..done + len].copy_from_slice(&data[head..head + len]);
            pos += len as u64;
            done += len;
        }
        trace!("cache read {:x}+{:x}", self.pointer, size);
        self.pointer = pos;
        self.inner.ddriver_seek(pos as i64, SeekType::Set)?;
        Ok(size)
    }

    fn ddriver_ioctl(&mut self, cmd: u32, arg: &mut [u8]) -> Result<()> {
        self.inner.ddriver_ioctl(cmd, arg)
    }

    fn ddriver_reset(&mut self) -> Result<()> {
        self.cache.clear();
        self.pointer = 0;
        self.inner.ddriver_reset()
    }

    fn ddriver_flush(&mut self) -> Result<()> {
        self.inner.ddriver_flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDiskDriver;
    use crate::test_common::driver_tester;
    use anyhow::Result;

    #[test]
    fn cached_round_trip() -> Result<()> {
        let mut driver = CacheDiskDriver::new(MemoryDiskDriver::new(), 512);
        driver_tester(&mut driver, "mem")
    }

    #[test]
    fn cache_sees_writes() -> Result<()> {
        let mut driver = CacheDiskDriver::new(MemoryDiskDriver::new(), 512);
        driver.ddriver_open("mem")?;
        // warm the cache, then overwrite and read back through it
        let mut buf = [0 as u8; 512];
        driver.ddriver_seek(0, SeekType::Set)?;
        driver.ddriver_read(&mut buf, 512)?;
        driver.ddriver_seek(0, SeekType::Set)?;
        driver.ddriver_write(&[7; 512], 512)?;
        driver.ddriver_seek(0, SeekType::Set)?;
        driver.ddriver_read(&mut buf, 512)?;
        assert!(buf.iter().all(|b| *b == 7));
        Ok(())
    }
}
