use crate::{DiskConst, DiskDriver, DiskInfo, SeekType};
use crate::{IOC_REQ_DEVICE_IO_SZ, IOC_REQ_DEVICE_RESET, IOC_REQ_DEVICE_SIZE, IOC_REQ_DEVICE_STATE};
use anyhow::{anyhow, Result};

const MEM_DISK_SIZE: usize = 4 * 0x400 * 0x400;
const MEM_DISK_UNIT: usize = 512;

/// RAM-backed device, mainly for tests.
pub struct MemoryDiskDriver {
    pub info: DiskInfo,
    pub mem: Vec<u8>,
    pointer: usize,
}

impl DiskDriver for MemoryDiskDriver {
    fn ddriver_open(self: &mut Self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn ddriver_close(self: &mut Self) -> Result<()> {
        Ok(())
    }

    fn ddriver_seek(self: &mut Self, offset: i64, whence: SeekType) -> Result<u64> {
        self.info.stats.seek_cnt += 1;
        match whence {
            SeekType::Set => self.pointer = offset as usize,
            SeekType::Cur => self.pointer = (self.pointer as i64 + offset) as usize,
            SeekType::End => self.pointer = (self.info.consts.layout_size as i64 - offset) as usize,
        };
        Ok(self.pointer as u64)
    }

    fn ddriver_write(self: &mut Self, buf: &[u8], size: usize) -> Result<usize> {
        if self.pointer + size > self.mem.len() {
            return Err(anyhow!("write past end of memory disk: {:x}+{:x}", self.pointer, size));
        }
        self.info.stats.write_cnt += 1;
        self.mem[self.pointer..self.pointer + size].copy_from_slice(&buf[..size]);
        self.pointer += size;
        Ok(size)
    }

    fn ddriver_read(self: &mut Self, buf: &mut [u8], size: usize) -> Result<usize> {
        if self.pointer + size > self.mem.len() {
            return Err(anyhow!("read past end of memory disk: {:x}+{:x}", self.pointer, size));
        }
        self.info.stats.read_cnt += 1;
        buf[..size].copy_from_slice(&self.mem[self.pointer..self.pointer + size]);
        self.pointer += size;
        Ok(size)
    }

    fn ddriver_ioctl(self: &mut Self, cmd: u32, arg: &mut [u8]) -> Result<()> {
        match cmd {
            IOC_REQ_DEVICE_SIZE => {
                arg[0..8].copy_from_slice(&self.info.consts.layout_size.to_le_bytes());
                Ok(())
            }
            IOC_REQ_DEVICE_STATE => {
                arg[0..4].copy_from_slice(&self.info.stats.write_cnt.to_le_bytes());
                arg[4..8].copy_from_slice(&self.info.stats.read_cnt.to_le_bytes());
                arg[8..12].copy_from_slice(&self.info.stats.seek_cnt.to_le_bytes());
                Ok(())
            }
            IOC_REQ_DEVICE_RESET => self.ddriver_reset(),
            IOC_REQ_DEVICE_IO_SZ => {
                arg[0..4].copy_from_slice(&self.info.consts.iounit_size.to_le_bytes());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn ddriver_reset(self: &mut Self) -> Result<()> {
        self.mem.fill(0);
        self.pointer = 0;
        self.info.stats = Default::default();
        Ok(())
    }
}

impl MemoryDiskDriver {
    pub fn new() -> Self {
        Self::with_size(MEM_DISK_SIZE)
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            info: DiskInfo {
                stats: Default::default(),
                consts: DiskConst {
                    layout_size: size as u64,
                    iounit_size: MEM_DISK_UNIT as u32,
                    ..Default::default()
                },
            },
            mem: vec![0 as u8; size],
            pointer: 0,
        }
    }
}
