use crate::{DiskConst, DiskDriver, DiskInfo, SeekType};
use crate::{IOC_REQ_DEVICE_IO_SZ, IOC_REQ_DEVICE_RESET, IOC_REQ_DEVICE_SIZE, IOC_REQ_DEVICE_STATE};
use anyhow::{anyhow, Result};
use log::*;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

const FILE_DISK_SIZE: u64 = 4 * 0x400 * 0x400;
const FILE_DISK_UNIT: usize = 512;

/// Device backed by a regular file (the disk image). The file is created
/// and extended to the configured size on open.
pub struct FileDiskDriver {
    pub info: DiskInfo,
    file: Option<std::fs::File>,
    pointer: u64,
}

impl DiskDriver for FileDiskDriver {
    fn ddriver_open(self: &mut Self, path: &str) -> Result<()> {
        info!("FileDrv open: {}", path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < self.info.consts.layout_size {
            file.set_len(self.info.consts.layout_size)?;
        } else if len > 0 {
            self.info.consts.layout_size = len;
        }
        self.file = Some(file);
        self.pointer = 0;
        Ok(())
    }

    fn ddriver_close(self: &mut Self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn ddriver_seek(self: &mut Self, offset: i64, whence: SeekType) -> Result<u64> {
        self.info.stats.seek_cnt += 1;
        match whence {
            SeekType::Set => self.pointer = offset as u64,
            SeekType::Cur => self.pointer = (self.pointer as i64 + offset) as u64,
            SeekType::End => self.pointer = (self.info.consts.layout_size as i64 - offset) as u64,
        };
        Ok(self.pointer)
    }

    fn ddriver_write(self: &mut Self, buf: &[u8], size: usize) -> Result<usize> {
        self.info.stats.write_cnt += 1;
        let pointer = self.pointer;
        let file = self.get_file()?;
        file.seek(SeekFrom::Start(pointer))?;
        file.write_all(&buf[..size])?;
        self.pointer += size as u64;
        Ok(size)
    }

    fn ddriver_read(self: &mut Self, buf: &mut [u8], size: usize) -> Result<usize> {
        self.info.stats.read_cnt += 1;
        let pointer = self.pointer;
        let file = self.get_file()?;
        file.seek(SeekFrom::Start(pointer))?;
        file.read_exact(&mut buf[..size])?;
        self.pointer += size as u64;
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
        let size = self.info.consts.layout_size;
        let file = self.get_file()?;
        file.set_len(0)?;
        file.set_len(size)?;
        self.info.stats = Default::default();
        self.pointer = 0;
        Ok(())
    }

    fn ddriver_flush(self: &mut Self) -> Result<()> {
        self.get_file()?.sync_data()?;
        Ok(())
    }
}

impl FileDiskDriver {
    pub fn new(size: u64) -> Self {
        Self {
            info: DiskInfo {
                stats: Default::default(),
                consts: DiskConst {
                    layout_size: if size == 0 { FILE_DISK_SIZE } else { size },
                    iounit_size: FILE_DISK_UNIT as u32,
                    ..Default::default()
                },
            },
            file: None,
            pointer: 0,
        }
    }

    fn get_file(self: &mut Self) -> Result<&mut std::fs::File> {
        self.file.as_mut().ok_or(anyhow!("device not opened"))
    }
}
