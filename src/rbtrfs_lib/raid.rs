use log::*;
use std::cmp::{max, min};
use std::ops::Range;

use crate::rbtrfs_lib::chunk::{get_raid0_offset, Chunk};
use crate::rbtrfs_lib::{FsResult, RUNTIME};

/// One piece of a per-stripe write: either borrowed payload bytes or a slice
/// of a parity buffer owned by the write context.
#[derive(Debug, Clone)]
pub enum Seg<'a> {
    Data(&'a [u8]),
    Parity1(Range<usize>),
    Parity2(Range<usize>),
}

impl Seg<'_> {
    pub fn len(&self) -> usize {
        match self {
            Seg::Data(d) => d.len(),
            Seg::Parity1(r) | Seg::Parity2(r) => r.end - r.start,
        }
    }
}

/// Per-stripe plan; `start == end` means the stripe is not written. Offsets
/// are relative to the stripe's device_offset.
#[derive(Debug, Default, Clone)]
pub struct StripePlan<'a> {
    pub start: u64,
    pub end: u64,
    pub segs: Vec<Seg<'a>>,
}

fn push_seg<'a>(plan: &mut StripePlan<'a>, devoff: u64, seg: Seg<'a>) {
    let len = seg.len() as u64;
    if plan.segs.is_empty() {
        plan.start = devoff;
        plan.end = devoff + len;
    } else {
        debug_assert_eq!(plan.end, devoff, "stripe segments must tile contiguously");
        plan.end += len;
    }
    plan.segs.push(seg);
}

/// XOR `src` into `dst`.
pub fn do_xor(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    if RUNTIME.wide_xor {
        let words = dst.len() / 8;
        for i in 0..words {
            let mut d = u64::from_ne_bytes(dst[i * 8..i * 8 + 8].try_into().unwrap());
            d ^= u64::from_ne_bytes(src[i * 8..i * 8 + 8].try_into().unwrap());
            dst[i * 8..i * 8 + 8].copy_from_slice(&d.to_ne_bytes());
        }
        for i in words * 8..dst.len() {
            dst[i] ^= src[i];
        }
    } else {
        for i in 0..dst.len() {
            dst[i] ^= src[i];
        }
    }
}

fn gf_double_byte(b: u8) -> u8 {
    (b << 1) ^ if b & 0x80 != 0 { 0x1d } else { 0 }
}

/// Multiply every byte by the primitive element 2 in GF(2^8).
pub fn galois_double(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = gf_double_byte(*b);
    }
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut out = 0;
    while b != 0 {
        if b & 1 != 0 {
            out ^= a;
        }
        a = gf_double_byte(a);
        b >>= 1;
    }
    out
}

fn gf_pow2(k: usize) -> u8 {
    let mut v = 1 as u8;
    for _ in 0..k {
        v = gf_double_byte(v);
    }
    v
}

/// `dst ^= coeff * src` over GF(2^8).
fn gf_mul_accumulate(dst: &mut [u8], src: &[u8], coeff: u8) {
    debug_assert_eq!(dst.len(), src.len());
    if coeff == 1 {
        do_xor(dst, src);
        return;
    }
    for i in 0..dst.len() {
        dst[i] ^= gf_mul(coeff, src[i]);
    }
}

/// RAID0: round-robin stripe-length units across all stripes.
pub fn prepare_raid0_write<'a>(
    c: &Chunk,
    address: u64,
    data: &'a [u8],
) -> FsResult<Vec<StripePlan<'a>>> {
    let n = c.chunk_item.num_stripes;
    let l = c.chunk_item.stripe_length;
    let length = data.len() as u64;

    let (startoff, startoffstripe) = get_raid0_offset(address - c.offset, l, n);

    let mut plans: Vec<StripePlan<'a>> = vec![Default::default(); n as usize];

    let mut pos = 0;
    let mut stripe = startoffstripe as usize;
    while pos < length {
        if pos == 0 {
            let writelen = min(length, l - startoff % l);
            push_seg(&mut plans[stripe], startoff, Seg::Data(&data[..writelen as usize]));
            pos += writelen;
        } else {
            let writelen = min(length - pos, l);
            let devoff = if plans[stripe].segs.is_empty() {
                startoff - startoff % l + if stripe < startoffstripe as usize { l } else { 0 }
            } else {
                plans[stripe].end
            };
            push_seg(
                &mut plans[stripe],
                devoff,
                Seg::Data(&data[pos as usize..(pos + writelen) as usize]),
            );
            pos += writelen;
        }
        stripe = (stripe + 1) % n as usize;
    }

    Ok(plans)
}

/// RAID10: RAID0 across N/K logical stripes, each mirrored onto K devices.
pub fn prepare_raid10_write<'a>(
    c: &Chunk,
    address: u64,
    data: &'a [u8],
) -> FsResult<Vec<StripePlan<'a>>> {
    let n = c.chunk_item.num_stripes;
    let k = c.chunk_item.sub_stripes;
    let l = c.chunk_item.stripe_length;
    let logical = n / k;
    let length = data.len() as u64;

    let (startoff, startoffstripe) = get_raid0_offset(address - c.offset, l, logical);

    let mut lplans: Vec<StripePlan<'a>> = vec![Default::default(); logical as usize];

    let mut pos = 0;
    let mut stripe = startoffstripe as usize;
    while pos < length {
        if pos == 0 {
            let writelen = min(length, l - startoff % l);
            push_seg(&mut lplans[stripe], startoff, Seg::Data(&data[..writelen as usize]));
            pos += writelen;
        } else {
            let writelen = min(length - pos, l);
            let devoff = if lplans[stripe].segs.is_empty() {
                startoff - startoff % l + if stripe < startoffstripe as usize { l } else { 0 }
            } else {
                lplans[stripe].end
            };
            push_seg(
                &mut lplans[stripe],
                devoff,
                Seg::Data(&data[pos as usize..(pos + writelen) as usize]),
            );
            pos += writelen;
        }
        stripe = (stripe + 1) % logical as usize;
    }

    // mirror each logical stripe across its sub-stripes
    let mut plans: Vec<StripePlan<'a>> = Vec::with_capacity(n as usize);
    for lp in lplans {
        for _ in 0..k {
            plans.push(lp.clone());
        }
    }
    Ok(plans)
}

struct Fragment {
    stripe: usize,
    devoff: u64,
    buf: Vec<u8>,
}

/// RAID5/RAID6 read-modify-write planner. Computes per-stripe payload plans,
/// reads the fragments of every touched parity row not covered by the write,
/// and produces the parity buffer(s) over the parity span.
pub fn prepare_raid56_write<'a>(
    c: &Chunk,
    address: u64,
    data: &'a [u8],
    parity_stripes: u16,
) -> FsResult<(Vec<StripePlan<'a>>, Vec<u8>, Option<Vec<u8>>)> {
    let n = c.chunk_item.num_stripes as usize;
    let p = parity_stripes as usize;
    let ds = n - p;
    let l = c.chunk_item.stripe_length;
    let dsl = ds as u64 * l;
    let coff = address - c.offset;
    let length = data.len() as u64;

    let first_row = coff / dsl;
    let last_row = (coff + length - 1) / dsl;

    // Parity span in device offsets: rows share device offsets, so the span
    // begins in the first row and ends in the last.
    let mut parity_start = u64::MAX;
    let mut parity_end = 0;
    for (row, tracking_start) in [(first_row, true), (last_row, false)] {
        for j in 0..ds {
            let cell_lo = row * dsl + j as u64 * l;
            let a = max(cell_lo, coff);
            let b = min(cell_lo + l, coff + length);
            if a >= b {
                continue;
            }
            let dev_a = row * l + (a - cell_lo);
            let dev_b = dev_a + (b - a);
            if tracking_start {
                parity_start = min(parity_start, dev_a);
            }
            parity_end = max(parity_end, dev_b);
        }
    }
    let span = (parity_end - parity_start) as usize;

    let mut plans: Vec<StripePlan<'a>> = vec![Default::default(); n];
    let mut parity1 = vec![0 as u8; span];
    let mut parity2 = if p == 2 { Some(vec![0 as u8; span]) } else { None };

    // Payload emission: data cells row by row, folding each contribution
    // into the parity as we go.
    for row in first_row..=last_row {
        let p1 = ((row + ds as u64) % n as u64) as usize;
        for j in 0..ds {
            let s = (p1 + p + j) % n;
            let cell_lo = row * dsl + j as u64 * l;
            let a = max(cell_lo, coff);
            let b = min(cell_lo + l, coff + length);
            if a >= b {
                continue;
            }
            let dev_a = row * l + (a - cell_lo);
            let slice = &data[(a - coff) as usize..(b - coff) as usize];
            push_seg(&mut plans[s], dev_a, Seg::Data(slice));

            let x0 = (dev_a - parity_start) as usize;
            do_xor(&mut parity1[x0..x0 + slice.len()], slice);
            if let Some(q) = parity2.as_mut() {
                gf_mul_accumulate(&mut q[x0..x0 + slice.len()], slice, gf_pow2(j));
            }
        }

        // the row's slice of the parity span goes to its parity stripe(s)
        let pr_a = max(parity_start, row * l);
        let pr_b = min(parity_end, row * l + l);
        if pr_a < pr_b {
            let r = (pr_a - parity_start) as usize..(pr_b - parity_start) as usize;
            push_seg(&mut plans[p1], pr_a, Seg::Parity1(r.clone()));
            if p == 2 {
                push_seg(&mut plans[(p1 + 1) % n], pr_a, Seg::Parity2(r));
            }
        }
    }

    // Fragments: every data-stripe byte of the parity span not covered by
    // this write must be read back to recompute parity.
    let mut fragments: Vec<Fragment> = vec![];
    for s in 0..n {
        let plan = &plans[s];
        if plan.start == plan.end {
            fragments.push(Fragment { stripe: s, devoff: parity_start, buf: vec![0; span] });
        } else {
            if plan.start > parity_start {
                fragments.push(Fragment {
                    stripe: s,
                    devoff: parity_start,
                    buf: vec![0; (plan.start - parity_start) as usize],
                });
            }
            if plan.end < parity_end {
                fragments.push(Fragment {
                    stripe: s,
                    devoff: plan.end,
                    buf: vec![0; (parity_end - plan.end) as usize],
                });
            }
        }
    }

    if !fragments.is_empty() {
        trace!(
            "raid{} rmw: {} fragment reads over span {:x}+{:x}",
            if p == 1 { 5 } else { 6 },
            fragments.len(),
            parity_start,
            span
        );
        let mut status: FsResult<()> = Ok(());
        std::thread::scope(|scope| {
            let handles: Vec<_> = fragments
                .iter_mut()
                .map(|frag| {
                    let dev = c.devices[frag.stripe].clone();
                    let offset = c.cis[frag.stripe].offset + frag.devoff;
                    scope.spawn(move || dev.read_phys(offset, &mut frag.buf))
                })
                .collect();
            for h in handles {
                if let Err(e) = h.join().unwrap() {
                    status = Err(e);
                }
            }
        });
        status?;
    }

    // Fold the fragments into the parity, splitting at row boundaries so
    // each piece picks up the role it has within its own row.
    for frag in fragments.iter() {
        let mut devoff = frag.devoff;
        let frag_end = frag.devoff + frag.buf.len() as u64;
        while devoff < frag_end {
            let row = devoff / l;
            let piece_end = min(frag_end, (row + 1) * l);
            let p1 = ((row + ds as u64) % n as u64) as usize;
            let role = (frag.stripe + 2 * n - p1 - p) % n;
            debug_assert!(role < ds, "fragment read from a parity position");
            let x0 = (devoff - parity_start) as usize;
            let piece =
                &frag.buf[(devoff - frag.devoff) as usize..(piece_end - frag.devoff) as usize];
            do_xor(&mut parity1[x0..x0 + piece.len()], piece);
            if let Some(q) = parity2.as_mut() {
                gf_mul_accumulate(&mut q[x0..x0 + piece.len()], piece, gf_pow2(role));
            }
            devoff = piece_end;
        }
    }

    Ok((plans, parity1, parity2))
}

/// Profile-aware logical read; used by the partial-write merge path and by
/// the debug readback check.
pub fn read_data(c: &Chunk, address: u64, buf: &mut [u8]) -> FsResult<()> {
    let n = c.chunk_item.num_stripes as u64;
    let l = c.chunk_item.stripe_length;
    let t = c.chunk_item.chunk_type;
    let mut off = address - c.offset;
    let mut done = 0 as usize;

    use crate::rbtrfs_lib::desc::*;

    while done < buf.len() {
        let left = (buf.len() - done) as u64;
        let (stripe, devoff, len) = if t & BLOCK_FLAG_RAID0 != 0 {
            let (devoff, stripe) = get_raid0_offset(off, l, n as u16);
            (stripe as usize, devoff, min(left, l - devoff % l))
        } else if t & BLOCK_FLAG_RAID10 != 0 {
            let k = c.chunk_item.sub_stripes as u64;
            let (devoff, stripe) = get_raid0_offset(off, l, (n / k) as u16);
            ((stripe as u64 * k) as usize, devoff, min(left, l - devoff % l))
        } else if t & (BLOCK_FLAG_RAID5 | BLOCK_FLAG_RAID6) != 0 {
            let p = c.parity_stripes() as u64;
            let ds = n - p;
            let row = off / (ds * l);
            let p1 = (row + ds) % n;
            let ls = (off / l) % ds;
            let stripe = ((p1 + p + ls) % n) as usize;
            let devoff = row * l + off % l;
            (stripe, devoff, min(left, l - off % l))
        } else {
            // SINGLE, DUP, RAID1: one copy is enough
            (0, off, left)
        };

        c.devices[stripe].read_phys(
            c.cis[stripe].offset + devoff,
            &mut buf[done..done + len as usize],
        )?;
        off += len;
        done += len as usize;
    }
    Ok(())
}
