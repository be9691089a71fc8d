use anyhow::Result;

#[derive(Default, Debug, Clone)]
pub struct DiskStats {
    pub read_cnt: u32,
    pub write_cnt: u32,
    pub seek_cnt: u32,
}

#[derive(Debug, Clone)]
pub struct DiskConst {
    pub read_lat: u32,
    pub write_lat: u32,
    pub seek_lat: u32,
    pub track_num: i32,
    pub major_num: i32,
    pub layout_size: u64,
    pub iounit_size: u32,
}

#[derive(Default, Debug, Clone)]
pub struct DiskInfo {
    pub stats: DiskStats,
    pub consts: DiskConst,
}

impl Default for DiskConst {
    fn default() -> Self {
        Self {
            read_lat: 2,
            write_lat: 1,
            seek_lat: 4,
            track_num: 0,
            major_num: 100,
            layout_size: 4 * 0x400 * 0x400,
            iounit_size: 512,
        }
    }
}

impl DiskConst {
    pub fn disk_block_count(&self) -> u64 {
        self.layout_size / self.iounit_size as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SeekType {
    Set,
    Cur,
    End,
}

pub const IOC_REQ_DEVICE_SIZE: u32 = 0x4008_0801;
pub const IOC_REQ_DEVICE_STATE: u32 = 0x4008_0802;
pub const IOC_REQ_DEVICE_RESET: u32 = 0x4008_0803;
pub const IOC_REQ_DEVICE_IO_SZ: u32 = 0x4008_0804;

/// DiskDriver abstract interface.
///
/// One driver instance backs one device; callers that want concurrent I/O to
/// several devices run one driver per device behind its own lock.
pub trait DiskDriver: Send {
    fn ddriver_open(self: &mut Self, path: &str) -> Result<()>;
    fn ddriver_close(self: &mut Self) -> Result<()>;
    fn ddriver_seek(self: &mut Self, offset: i64, whence: SeekType) -> Result<u64>;
    fn ddriver_write(self: &mut Self, buf: &[u8], size: usize) -> Result<usize>;
    fn ddriver_read(self: &mut Self, buf: &mut [u8], size: usize) -> Result<usize>;
    fn ddriver_ioctl(self: &mut Self, cmd: u32, arg: &mut [u8]) -> Result<()>;
    fn ddriver_reset(self: &mut Self) -> Result<()>;
    fn ddriver_flush(self: &mut Self) -> Result<()> {
        Ok(())
    }
}

pub mod cache;
pub mod file;
pub mod memory;

#[cfg(test)]
pub(crate) mod test_common {
    use super::*;
    use anyhow::Result;

    pub fn driver_tester(driver: &mut dyn DiskDriver, path: &str) -> Result<()> {
        driver.ddriver_open(path)?;
        let mut size_buf = [0 as u8; 8];
        driver.ddriver_ioctl(IOC_REQ_DEVICE_SIZE, &mut size_buf)?;
        let size = u64::from_le_bytes(size_buf);
        assert!(size > 0);

        let payload = [0x5a as u8; 1024];
        driver.ddriver_seek(0x1000, SeekType::Set)?;
        driver.ddriver_write(&payload, payload.len())?;

        let mut readback = [0 as u8; 1024];
        driver.ddriver_seek(0x1000, SeekType::Set)?;
        driver.ddriver_read(&mut readback, readback.len())?;
        assert_eq!(payload, readback);

        driver.ddriver_close()
    }
}
