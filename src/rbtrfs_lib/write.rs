use log::*;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::rbtrfs_lib::chunk::Chunk;
use crate::rbtrfs_lib::desc::*;
use crate::rbtrfs_lib::raid::{
    prepare_raid0_write, prepare_raid10_write, prepare_raid56_write, Seg, StripePlan,
};
use crate::rbtrfs_lib::{FsError, FsResult, Vcb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteDataStatus {
    Ignore = 0,
    Pending = 1,
    Success = 2,
    Error = 3,
    Cancelling = 4,
    Cancelled = 5,
}

pub struct WriteDataStripe<'a> {
    status: AtomicU8,
    pub device: Arc<crate::rbtrfs_lib::chunk::Device>,
    /// Absolute device byte offset.
    pub offset: u64,
    pub segs: Vec<Seg<'a>>,
}

impl WriteDataStripe<'_> {
    pub fn status(&self) -> WriteDataStatus {
        match self.status.load(Ordering::SeqCst) {
            0 => WriteDataStatus::Ignore,
            1 => WriteDataStatus::Pending,
            2 => WriteDataStatus::Success,
            3 => WriteDataStatus::Error,
            4 => WriteDataStatus::Cancelling,
            _ => WriteDataStatus::Cancelled,
        }
    }

    fn store_status(&self, s: WriteDataStatus) {
        self.status.store(s as u8, Ordering::SeqCst);
    }
}

/// State of one logical write: the per-stripe descriptors plus any parity
/// buffers the planner produced. Buffers live until every stripe retired.
#[derive(Default)]
pub struct WriteContext<'a> {
    pub stripes: Vec<WriteDataStripe<'a>>,
    pub parity1: Option<Vec<u8>>,
    pub parity2: Option<Vec<u8>>,
}

impl Vcb {
    /// Plan the per-device stripe writes for `[address, address+len)` into
    /// `wtc` without issuing them.
    pub fn write_data<'a>(
        &self,
        address: u64,
        data: &'a [u8],
        c: &Arc<Chunk>,
        wtc: &mut WriteContext<'a>,
    ) -> FsResult<()> {
        trace!("write_data {:x}+{:x} chunk {:x}", address, data.len(), c.offset);

        let t = c.chunk_item.chunk_type;
        let plans: Vec<StripePlan<'a>> = if t & BLOCK_FLAG_RAID0 != 0 {
            prepare_raid0_write(c, address, data)?
        } else if t & BLOCK_FLAG_RAID10 != 0 {
            prepare_raid10_write(c, address, data)?
        } else if t & BLOCK_FLAG_RAID5 != 0 {
            let (plans, parity1, _) = prepare_raid56_write(c, address, data, 1)?;
            wtc.parity1 = Some(parity1);
            plans
        } else if t & BLOCK_FLAG_RAID6 != 0 {
            let (plans, parity1, parity2) = prepare_raid56_write(c, address, data, 2)?;
            wtc.parity1 = Some(parity1);
            wtc.parity2 = parity2;
            plans
        } else {
            // write same data to every location - SINGLE, DUP, RAID1
            let start = address - c.offset;
            (0..c.chunk_item.num_stripes)
                .map(|_| StripePlan {
                    start,
                    end: start + data.len() as u64,
                    segs: vec![Seg::Data(data)],
                })
                .collect()
        };

        for (i, plan) in plans.into_iter().enumerate() {
            let status = if plan.start == plan.end {
                WriteDataStatus::Ignore
            } else {
                WriteDataStatus::Pending
            };
            wtc.stripes.push(WriteDataStripe {
                status: AtomicU8::new(status as u8),
                device: c.devices[i].clone(),
                offset: c.cis[i].offset + plan.start,
                segs: plan.segs,
            });
        }
        Ok(())
    }

    /// Issue all pending stripes concurrently and wait for every one to
    /// retire. The first error wins; remaining pending siblings are
    /// cooperatively cancelled. Buffers are not touched until all stripes
    /// have completed one way or the other.
    fn dispatch_stripes(&self, wtc: &WriteContext) -> FsResult<()> {
        let first_error: Mutex<Option<FsError>> = Mutex::new(None);
        let parity1 = wtc.parity1.as_deref();
        let parity2 = wtc.parity2.as_deref();
        let stripes = &wtc.stripes;

        std::thread::scope(|scope| {
            for (idx, stripe) in stripes.iter().enumerate() {
                if stripe.status() == WriteDataStatus::Ignore {
                    continue;
                }
                let first_error = &first_error;
                scope.spawn(move || {
                    if stripe.status() == WriteDataStatus::Cancelling {
                        stripe.store_status(WriteDataStatus::Cancelled);
                        return;
                    }
                    let bufs: Vec<&[u8]> = stripe
                        .segs
                        .iter()
                        .map(|seg| match seg {
                            Seg::Data(d) => *d,
                            Seg::Parity1(r) => &parity1.unwrap()[r.clone()],
                            Seg::Parity2(r) => &parity2.unwrap()[r.clone()],
                        })
                        .collect();
                    match stripe.device.write_phys(stripe.offset, &bufs) {
                        Ok(()) => stripe.store_status(WriteDataStatus::Success),
                        Err(e) => {
                            error!("stripe write failed: {}", e);
                            stripe.store_status(WriteDataStatus::Error);
                            let mut fe = first_error.lock().unwrap();
                            if fe.is_none() {
                                *fe = Some(e);
                            }
                            drop(fe);
                            for (j, sibling) in stripes.iter().enumerate() {
                                if j != idx {
                                    let _ = sibling.status.compare_exchange(
                                        WriteDataStatus::Pending as u8,
                                        WriteDataStatus::Cancelling as u8,
                                        Ordering::SeqCst,
                                        Ordering::SeqCst,
                                    );
                                }
                            }
                        }
                    }
                });
            }
        });

        match first_error.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Full write of `data` at logical `address`: take the RAID5/6 row lock
    /// when needed, plan, dispatch, wait.
    pub fn write_data_complete(
        &self,
        address: u64,
        data: &[u8],
        c: Option<Arc<Chunk>>,
    ) -> FsResult<()> {
        let c = match c {
            Some(c) => c,
            None => self
                .get_chunk_from_address(address)
                .ok_or(FsError::Corrupted("no chunk for logical address"))?,
        };

        let _range_guard = if c.is_raid56() {
            let (lockaddr, locklen) = c.get_raid56_lock_range(address, data.len() as u64);
            Some(c.lock_range(lockaddr, locklen))
        } else {
            None
        };

        let mut wtc = WriteContext::default();
        self.write_data(address, data, &c, &mut wtc)?;
        self.dispatch_stripes(&wtc)?;

        #[cfg(debug_assertions)]
        {
            // paranoid readback of what we just wrote
            let mut buf = vec![0 as u8; data.len()];
            crate::rbtrfs_lib::raid::read_data(&c, address, &mut buf)?;
            if buf != data {
                error!("readback mismatch at {:x}+{:x}", address, data.len());
                debug_assert!(false, "readback mismatch");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbtrfs_lib::test_support::{failing_device_vcb, make_vcb};

    #[test]
    fn dup_writes_both_copies() {
        let vcb = make_vcb(1, 0x2000000);
        let c = vcb
            .alloc_chunk(BLOCK_FLAG_METADATA | BLOCK_FLAG_DUPLICATE)
            .unwrap();
        let data = vec![0xab as u8; 0x2000];
        vcb.write_data_complete(c.offset, &data, Some(c.clone())).unwrap();

        for i in 0..2 {
            let mut buf = vec![0 as u8; data.len()];
            c.devices[i]
                .read_phys(c.cis[i].offset, &mut buf)
                .unwrap();
            assert_eq!(buf, data, "mirror {}", i);
        }
    }

    #[test]
    fn raid1_mirrors_match() {
        let vcb = make_vcb(2, 0x2000000);
        let c = vcb.alloc_chunk(BLOCK_FLAG_DATA | BLOCK_FLAG_RAID1).unwrap();
        let data: Vec<u8> = (0..0x3000).map(|i| (i % 255) as u8).collect();
        vcb.write_data_complete(c.offset + 0x10000, &data, Some(c.clone())).unwrap();

        let mut a = vec![0 as u8; data.len()];
        let mut b = vec![0 as u8; data.len()];
        c.devices[0].read_phys(c.cis[0].offset + 0x10000, &mut a).unwrap();
        c.devices[1].read_phys(c.cis[1].offset + 0x10000, &mut b).unwrap();
        assert_eq!(a, data);
        assert_eq!(b, data);
    }

    #[test]
    fn raid5_write_satisfies_parity_invariant() {
        let vcb = make_vcb(3, 0x2000000);
        let c = vcb.alloc_chunk(BLOCK_FLAG_DATA | BLOCK_FLAG_RAID5).unwrap();
        let data: Vec<u8> = (0..0x400).map(|i| (i * 13 % 256) as u8).collect();
        vcb.write_data_complete(c.offset, &data, Some(c.clone())).unwrap();

        // parity span is the touched kilobyte on every stripe of row 0
        let mut d0 = vec![0 as u8; 0x400];
        let mut d1 = vec![0 as u8; 0x400];
        let mut p = vec![0 as u8; 0x400];
        c.devices[0].read_phys(c.cis[0].offset, &mut d0).unwrap();
        c.devices[1].read_phys(c.cis[1].offset, &mut d1).unwrap();
        c.devices[2].read_phys(c.cis[2].offset, &mut p).unwrap();
        assert_eq!(d0, data);
        for i in 0..0x400 {
            assert_eq!(p[i], d0[i] ^ d1[i]);
        }

        // reconstruction of stripe 0 from parity and the surviving stripe
        let rebuilt: Vec<u8> = (0..0x400).map(|i| p[i] ^ d1[i]).collect();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn first_stripe_error_cancels_siblings() {
        let (vcb, fail_flag) = failing_device_vcb(2, 0x2000000, 1);
        let c = vcb.alloc_chunk(BLOCK_FLAG_DATA | BLOCK_FLAG_RAID1).unwrap();
        fail_flag.store(true, Ordering::SeqCst);

        let data = vec![1 as u8; 0x1000];
        let err = vcb.write_data_complete(c.offset, &data, Some(c.clone()));
        assert!(matches!(err, Err(FsError::DeviceError(_))));
    }
}
