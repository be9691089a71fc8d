use log::*;
use std::cmp::{max, min};
use std::sync::Arc;

use crate::rbtrfs_lib::chunk::{Chunk, ChunkInner};
use crate::rbtrfs_lib::compress::{compress_bit, zlib_decompress};
use crate::rbtrfs_lib::csum::calc_csum;
use crate::rbtrfs_lib::desc::*;
use crate::rbtrfs_lib::extent::{
    add_extent_to_fcb, remove_fcb_extent, Extent, ExtentContent, Fcb,
};
use crate::rbtrfs_lib::raid::read_data;
use crate::rbtrfs_lib::rollback::{add_rollback, Rollback, RollbackItem};
use crate::rbtrfs_lib::utils::sector_align;
use crate::rbtrfs_lib::{FsError, FsResult, Vcb, WriteFlags};

pub(crate) fn now_timespec() -> TimeSpec {
    let now = chrono::Utc::now();
    TimeSpec {
        seconds: now.timestamp(),
        nanoseconds: now.timestamp_subsec_nanos(),
    }
}

impl Vcb {
    pub(crate) fn load_cache_chunk(&self, c: &Chunk, inner: &mut ChunkInner) -> FsResult<()> {
        // chunks created by this driver are born with their space cache;
        // nothing to page in
        trace!("load_cache_chunk {:x}", c.offset);
        inner.cache_loaded = true;
        Ok(())
    }

    /// Carve `length` bytes out of `c`, append the extent to the file, queue
    /// the ref-count delta and write the data. Returns false when the chunk
    /// cannot hold `length` contiguously.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn insert_extent_chunk(
        &self,
        fcb: &mut Fcb,
        c: &Arc<Chunk>,
        start_data: u64,
        length: u64,
        prealloc: bool,
        data: Option<&[u8]>,
        rollback: &mut Rollback,
        compression: CompressionType,
        decoded_size: u64,
    ) -> FsResult<bool> {
        trace!(
            "insert_extent_chunk ({:x}, {:x}) chunk {:x} start {:x} len {:x} prealloc {}",
            fcb.subvol,
            fcb.inode,
            c.offset,
            start_data,
            length,
            prealloc
        );

        let address = {
            let mut inner = c.lock_inner();
            if !inner.cache_loaded {
                self.load_cache_chunk(c, &mut inner)?;
            }
            let address = match inner.find_data_address(c.chunk_item.size, length) {
                Some(a) => a,
                None => return Ok(false),
            };
            inner.used += length;
            inner.space.subtract(address, length);
            address
        };
        add_rollback(
            rollback,
            RollbackItem::SubtractSpace { chunk: c.offset, address, size: length },
        );

        let csum = match data {
            Some(data) if !prealloc && !fcb.nodatasum() => {
                Some(calc_csum(data, self.sector_size() as usize))
            }
            _ => None,
        };

        let de = ExtentData2 { address, size: length, offset: 0, num_bytes: decoded_size };
        let seq = fcb.alloc_seq();
        let ext = Extent {
            seq,
            offset: start_data,
            generation: self.generation(),
            decoded_size,
            compression,
            encryption: ENCRYPTION_NONE,
            encoding: ENCODING_NONE,
            content: if prealloc {
                ExtentContent::Prealloc(de)
            } else {
                ExtentContent::Regular(de)
            },
            unique: true,
            ignore: false,
            inserted: true,
            csum,
        };
        add_extent_to_fcb(fcb, ext, decoded_size, rollback);

        fcb.extents_changed = true;
        fcb.inode_item_changed = true;
        self.mark_fcb_dirty(fcb);

        c.add_changed_extent_ref(
            address,
            length,
            fcb.subvol,
            fcb.inode,
            start_data,
            1,
            fcb.nodatasum(),
        );

        if let Some(data) = data {
            self.write_data_complete(address, data, Some(c.clone()))?;
        }

        Ok(true)
    }

    /// Continue the file's last extent inside the same chunk when free space
    /// directly follows it on disk. Returns true when some bytes were placed.
    fn try_extend_data(
        &self,
        fcb: &mut Fcb,
        start_data: u64,
        length: u64,
        data: &[u8],
        written: &mut u64,
        rollback: &mut Rollback,
    ) -> FsResult<bool> {
        let mut found: Option<(u64, ExtentData2)> = None;
        for e in fcb.live_extents() {
            if e.offset == start_data {
                // an extent already sits at the write position
                found = None;
                break;
            } else if e.offset > start_data {
                break;
            }
            if let Some(de) = e.disk_extent() {
                found = Some((e.offset, *de));
            } else {
                found = None;
            }
        }
        let (ext_offset, de) = match found {
            Some(f) => f,
            None => return Ok(false),
        };

        if ext_offset + de.num_bytes != start_data {
            trace!(
                "last extent does not run up to start_data ({:x} + {:x} != {:x})",
                ext_offset,
                de.num_bytes,
                start_data
            );
            return Ok(false);
        }

        let c = match self.get_chunk_from_address(de.address) {
            Some(c) => c,
            None => return Ok(false),
        };
        if c.is_reloc() || c.is_readonly() || c.chunk_type() != self.data_flags {
            return Ok(false);
        }

        let newlen = {
            let mut inner = c.lock_inner();
            if length > c.chunk_item.size - inner.used {
                return Ok(false);
            }
            if !inner.cache_loaded {
                self.load_cache_chunk(&c, &mut inner)?;
            }
            match inner.space.hole_starting_at(de.address + de.size) {
                Some(hole) => min(min(hole.size, length), MAX_EXTENT_SIZE),
                None => return Ok(false),
            }
        };

        let success = self.insert_extent_chunk(
            fcb,
            &c,
            start_data,
            newlen,
            false,
            Some(&data[..newlen as usize]),
            rollback,
            CompressionType::None,
            newlen,
        )?;
        if success {
            *written += newlen;
        }
        Ok(success)
    }

    /// Reserve space for `[start, start+length)` without writing data.
    pub(crate) fn insert_prealloc_extent(
        &self,
        fcb: &mut Fcb,
        start: u64,
        length: u64,
        rollback: &mut Rollback,
    ) -> FsResult<()> {
        let page_file = fcb.is_paging_file;
        let flags = self.data_flags;
        let mut start = start;
        let mut length = length;

        // FIXME - try and maximize contiguous ranges first. If we can't do
        // that, allocate all the free space we find until it's enough.
        loop {
            let extlen = min(MAX_EXTENT_SIZE, length);
            let mut done = false;

            let candidates: Vec<Arc<Chunk>> = self.chunks.read().unwrap().clone();
            for c in candidates {
                if c.is_readonly() || c.is_reloc() || c.chunk_type() != flags {
                    continue;
                }
                if c.free_bytes() >= extlen
                    && self.insert_extent_chunk(
                        fcb,
                        &c,
                        start,
                        extlen,
                        !page_file,
                        None,
                        rollback,
                        CompressionType::None,
                        extlen,
                    )?
                {
                    done = true;
                    break;
                }
            }

            if !done {
                if let Ok(c) = self.alloc_chunk(flags) {
                    if c.free_bytes() >= extlen
                        && self.insert_extent_chunk(
                            fcb,
                            &c,
                            start,
                            extlen,
                            !page_file,
                            None,
                            rollback,
                            CompressionType::None,
                            extlen,
                        )?
                    {
                        done = true;
                    }
                }
            }

            if !done {
                warn!("couldn't find any data chunks with {:x} bytes free", length);
                return Err(FsError::OutOfSpace);
            }

            length -= extlen;
            start += extlen;
            if length == 0 {
                return Ok(());
            }
        }
    }

    /// COW allocation of `[start_data, start_data+length)`, in pieces of at
    /// most 128 MiB, extending the previous extent first when possible.
    pub(crate) fn insert_extent(
        &self,
        fcb: &mut Fcb,
        start_data: u64,
        length: u64,
        data: &[u8],
        rollback: &mut Rollback,
    ) -> FsResult<()> {
        trace!(
            "insert_extent ({:x}, {:x}) start {:x} len {:x}",
            fcb.subvol,
            fcb.inode,
            start_data,
            length
        );
        let orig_length = length;
        let mut written = 0;
        let mut start_data = start_data;
        let mut length = length;

        if start_data > 0 {
            self.try_extend_data(fcb, start_data, length, data, &mut written, rollback)?;
            if written == orig_length {
                return Ok(());
            } else if written > 0 {
                start_data += written;
                length -= written;
            }
        }

        let flags = self.data_flags;

        while written < orig_length {
            let newlen = min(length, MAX_EXTENT_SIZE);
            let mut done = false;

            // Rather than necessarily writing the whole extent at once, we
            // deal with it in blocks of 128 MB. First, see if we can write
            // the extent part to an existing chunk.
            let candidates: Vec<Arc<Chunk>> = self.chunks.read().unwrap().clone();
            for c in candidates {
                if c.is_readonly() || c.is_reloc() || c.chunk_type() != flags {
                    continue;
                }
                if c.free_bytes() >= newlen
                    && self.insert_extent_chunk(
                        fcb,
                        &c,
                        start_data,
                        newlen,
                        false,
                        Some(&data[written as usize..(written + newlen) as usize]),
                        rollback,
                        CompressionType::None,
                        newlen,
                    )?
                {
                    done = true;
                    break;
                }
            }

            if !done {
                // Otherwise, see if we can put it in a new chunk.
                if let Ok(c) = self.alloc_chunk(flags) {
                    if c.free_bytes() >= newlen
                        && self.insert_extent_chunk(
                            fcb,
                            &c,
                            start_data,
                            newlen,
                            false,
                            Some(&data[written as usize..(written + newlen) as usize]),
                            rollback,
                            CompressionType::None,
                            newlen,
                        )?
                    {
                        done = true;
                    }
                }
            }

            if !done {
                warn!("couldn't find any data chunks with {:x} bytes free", length);
                return Err(FsError::OutOfSpace);
            }

            written += newlen;
            start_data += newlen;
            length -= newlen;
        }

        Ok(())
    }

    /// Overwrite part of a unique prealloc extent in place, splitting it so
    /// the overwritten piece becomes a regular extent.
    fn do_write_file_prealloc(
        &self,
        fcb: &mut Fcb,
        seq: u64,
        start_data: u64,
        end_data: u64,
        data: &[u8],
        rollback: &mut Rollback,
    ) -> FsResult<u64> {
        let idx = fcb
            .extents
            .iter()
            .position(|e| e.seq == seq && !e.ignore)
            .ok_or(FsError::Corrupted("prealloc extent vanished"))?;
        let (offset, de, generation, unique, decoded_size) = {
            let e = &fcb.extents[idx];
            (
                e.offset,
                *e.disk_extent().ok_or(FsError::Corrupted("prealloc without disk extent"))?,
                e.generation,
                e.unique,
                e.decoded_size,
            )
        };
        let sector_size = self.sector_size();
        let num_bytes = de.num_bytes;
        let written;

        let mk = |seq: u64, offset: u64, content: ExtentContent, csum: Option<Vec<u32>>| Extent {
            seq,
            offset,
            generation,
            decoded_size,
            compression: CompressionType::None,
            encryption: ENCRYPTION_NONE,
            encoding: ENCODING_NONE,
            content,
            unique,
            ignore: false,
            inserted: true,
            csum,
        };

        if start_data <= offset && end_data >= offset + num_bytes {
            // replace all
            let payload = &data[(offset - start_data) as usize..(offset - start_data + num_bytes) as usize];
            self.write_data_complete(de.address + de.offset, payload, None)?;
            let csum = if fcb.nodatasum() {
                None
            } else {
                Some(calc_csum(payload, sector_size as usize))
            };
            let seq = fcb.alloc_seq();
            let newext = mk(seq, offset, ExtentContent::Regular(de), csum);
            remove_fcb_extent(fcb, idx, 0, rollback);
            add_extent_to_fcb(fcb, newext, 0, rollback);
            written = num_bytes;
        } else if start_data <= offset && end_data < offset + num_bytes {
            // replace beginning
            let head_len = end_data - offset;
            let mut de1 = de;
            de1.num_bytes = head_len;
            let mut de2 = de;
            de2.offset = de.offset + head_len;
            de2.num_bytes = num_bytes - head_len;

            let payload = &data[(offset - start_data) as usize..(offset - start_data + head_len) as usize];
            self.write_data_complete(de.address + de.offset, payload, None)?;
            let csum = if fcb.nodatasum() {
                None
            } else {
                Some(calc_csum(payload, sector_size as usize))
            };
            let seq1 = fcb.alloc_seq();
            let seq2 = fcb.alloc_seq();
            let newext1 = mk(seq1, offset, ExtentContent::Regular(de1), csum);
            let newext2 = mk(seq2, end_data, ExtentContent::Prealloc(de2), None);
            remove_fcb_extent(fcb, idx, 0, rollback);
            add_extent_to_fcb(fcb, newext1, 0, rollback);
            add_extent_to_fcb(fcb, newext2, 0, rollback);
            self.queue_prealloc_split_ref(fcb, offset, &de, 1);
            written = head_len;
        } else if start_data > offset && end_data >= offset + num_bytes {
            // replace end
            let mut de1 = de;
            de1.num_bytes = start_data - offset;
            let mut de2 = de;
            de2.offset = de.offset + (start_data - offset);
            de2.num_bytes = offset + num_bytes - start_data;

            let payload = &data[..de2.num_bytes as usize];
            self.write_data_complete(de.address + de2.offset, payload, None)?;
            let csum = if fcb.nodatasum() {
                None
            } else {
                Some(calc_csum(payload, sector_size as usize))
            };
            let seq1 = fcb.alloc_seq();
            let seq2 = fcb.alloc_seq();
            let newext1 = mk(seq1, offset, ExtentContent::Prealloc(de1), None);
            let newext2 = mk(seq2, start_data, ExtentContent::Regular(de2), csum);
            remove_fcb_extent(fcb, idx, 0, rollback);
            add_extent_to_fcb(fcb, newext1, 0, rollback);
            add_extent_to_fcb(fcb, newext2, 0, rollback);
            self.queue_prealloc_split_ref(fcb, offset, &de, 1);
            written = de2.num_bytes;
        } else {
            // replace middle
            let mut de1 = de;
            de1.num_bytes = start_data - offset;
            let mut de2 = de;
            de2.offset = de.offset + (start_data - offset);
            de2.num_bytes = end_data - start_data;
            let mut de3 = de;
            de3.offset = de.offset + (end_data - offset);
            de3.num_bytes = offset + num_bytes - end_data;

            let payload = &data[..de2.num_bytes as usize];
            self.write_data_complete(de.address + de2.offset, payload, None)?;
            let csum = if fcb.nodatasum() {
                None
            } else {
                Some(calc_csum(payload, sector_size as usize))
            };
            let seq1 = fcb.alloc_seq();
            let seq2 = fcb.alloc_seq();
            let seq3 = fcb.alloc_seq();
            let newext1 = mk(seq1, offset, ExtentContent::Prealloc(de1), None);
            let newext2 = mk(seq2, start_data, ExtentContent::Regular(de2), csum);
            let newext3 = mk(seq3, end_data, ExtentContent::Prealloc(de3), None);
            remove_fcb_extent(fcb, idx, 0, rollback);
            add_extent_to_fcb(fcb, newext1, 0, rollback);
            add_extent_to_fcb(fcb, newext2, 0, rollback);
            add_extent_to_fcb(fcb, newext3, 0, rollback);
            self.queue_prealloc_split_ref(fcb, offset, &de, 2);
            written = end_data - start_data;
        }

        Ok(written)
    }

    fn queue_prealloc_split_ref(&self, fcb: &Fcb, ext_offset: u64, de: &ExtentData2, delta: i64) {
        match self.get_chunk_from_address(de.address) {
            Some(c) => c.update_changed_extent_ref(
                de.address,
                de.size,
                fcb.subvol,
                fcb.inode,
                ext_offset - de.offset,
                delta,
                fcb.nodatasum(),
                false,
            ),
            None => error!("get_chunk_from_address({:x}) failed", de.address),
        }
    }

    /// Write `[start, end_data)` choosing per-extent between in-place
    /// overwrite (nodatacow or prealloc, uniquely referenced) and COW.
    pub(crate) fn do_write_file(
        &self,
        fcb: &mut Fcb,
        start: u64,
        end_data: u64,
        data: &[u8],
        rollback: &mut Rollback,
    ) -> FsResult<()> {
        let sector_size = self.sector_size();
        let mut written = 0;
        let mut length = end_data - start;
        let mut last_cow_start = 0;

        let snapshot: Vec<u64> = fcb.live_extents().map(|e| e.seq).collect();
        for seq in snapshot {
            if length == 0 {
                break;
            }
            let idx = match fcb.extents.iter().position(|e| e.seq == seq && !e.ignore) {
                Some(idx) => idx,
                None => continue,
            };
            let (ext_offset, ext_len, ext_type, unique) = {
                let e = &fcb.extents[idx];
                (e.offset, e.len(), e.extent_type(), e.unique)
            };

            if ext_offset + ext_len <= start {
                continue;
            }
            if ext_offset > start + written + length {
                break;
            }

            if !((fcb.nodatacow() || ext_type == ExtentType::Prealloc) && unique) {
                continue;
            }

            // COW everything between the last in-place extent and this one
            let start_write = max(last_cow_start, start + written);
            if start_write < ext_offset {
                let gap = ext_offset - start_write;
                self.excise_extents(fcb, start_write, ext_offset, rollback)?;
                self.insert_extent(
                    fcb,
                    start_write,
                    gap,
                    &data[(start_write - start) as usize..(start_write - start + gap) as usize],
                    rollback,
                )?;
                written += gap;
                length -= gap;
                if length == 0 {
                    break;
                }
            }

            match ext_type {
                ExtentType::Regular => {
                    let de = *fcb.extents[idx].disk_extent().unwrap();
                    let io_offset = start + written - ext_offset;
                    let write_len = min(ext_len - io_offset, length);
                    let writeaddr = de.address + de.offset + io_offset;
                    trace!("doing non-COW write to {:x}", writeaddr);

                    let payload = &data[written as usize..(written + write_len) as usize];
                    self.write_data_complete(writeaddr, payload, None)?;

                    // This shouldn't ever get called - nocow files should
                    // always also be nosum.
                    if !fcb.nodatasum() {
                        let csum = calc_csum(payload, sector_size as usize);
                        let e = &mut fcb.extents[idx];
                        if let Some(cs) = e.csum.as_mut() {
                            let at = (io_offset / sector_size) as usize;
                            cs[at..at + csum.len()].copy_from_slice(&csum);
                        }
                        e.inserted = true;
                    }

                    written += write_len;
                    length -= write_len;
                    if length == 0 {
                        break;
                    }
                }
                ExtentType::Prealloc => {
                    let w = self.do_write_file_prealloc(
                        fcb,
                        seq,
                        start + written,
                        end_data,
                        &data[written as usize..],
                        rollback,
                    )?;
                    written += w;
                    length -= w;
                    if length == 0 {
                        break;
                    }
                }
                ExtentType::Inline => {}
            }

            last_cow_start = ext_offset + ext_len;
        }

        if length > 0 {
            let start_write = max(last_cow_start, start + written);
            self.excise_extents(fcb, start_write, end_data, rollback)?;
            self.insert_extent(
                fcb,
                start_write,
                end_data - start_write,
                &data[(start_write - start) as usize..],
                rollback,
            )?;
        }

        #[cfg(debug_assertions)]
        fcb.check_extent_invariants();

        fcb.extents_changed = true;
        self.mark_fcb_dirty(fcb);
        Ok(())
    }

    /// Try to compress one 128 KiB block; fall back to a plain extent when it
    /// does not shrink.
    fn write_compressed_bit(
        &self,
        fcb: &mut Fcb,
        start: u64,
        end: u64,
        data: &[u8],
        rollback: &mut Rollback,
    ) -> FsResult<bool> {
        let sector_size = self.sector_size();
        let comp = compress_bit(data, self.options.zlib_level, sector_size)?;

        self.excise_extents(fcb, start, end, rollback)?;

        match comp {
            None => {
                self.insert_extent(fcb, start, end - start, data, rollback)?;
                Ok(false)
            }
            Some(cdata) => {
                let clen = cdata.len() as u64;
                let decoded = end - start;
                let c = self.find_or_alloc_chunk(self.data_flags, clen)?;
                if !self.insert_extent_chunk(
                    fcb,
                    &c,
                    start,
                    clen,
                    false,
                    Some(&cdata),
                    rollback,
                    CompressionType::Zlib,
                    decoded,
                )? {
                    // the candidate filled up; force a fresh chunk
                    let c = self.alloc_chunk(self.data_flags)?;
                    if !self.insert_extent_chunk(
                        fcb,
                        &c,
                        start,
                        clen,
                        false,
                        Some(&cdata),
                        rollback,
                        CompressionType::Zlib,
                        decoded,
                    )? {
                        return Err(FsError::OutOfSpace);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Compressed write path: 128 KiB blocks, with the incompressible
    /// first-block escape hatch setting NOCOMPRESS on the inode.
    pub(crate) fn write_compressed(
        &self,
        fcb: &mut Fcb,
        start_data: u64,
        end_data: u64,
        data: &[u8],
        rollback: &mut Rollback,
    ) -> FsResult<()> {
        let blocks =
            sector_align(end_data - start_data, COMPRESSED_EXTENT_SIZE) / COMPRESSED_EXTENT_SIZE;
        for i in 0..blocks {
            let s2 = start_data + i * COMPRESSED_EXTENT_SIZE;
            let e2 = min(s2 + COMPRESSED_EXTENT_SIZE, end_data);

            let compressed = self.write_compressed_bit(
                fcb,
                s2,
                e2,
                &data[(s2 - start_data) as usize..(e2 - start_data) as usize],
                rollback,
            )?;

            // If the first 128 KB of a file is incompressible, we set the
            // nocompress flag so we don't bother with the rest of it.
            if s2 == 0
                && e2 == COMPRESSED_EXTENT_SIZE
                && !compressed
                && !self.options.compress_force
            {
                fcb.inode_item.flags |= INODE_FLAG_NOCOMPRESS;
                fcb.inode_item_changed = true;
                self.mark_fcb_dirty(fcb);

                // write subsequent data non-compressed
                if e2 < end_data {
                    self.do_write_file(
                        fcb,
                        e2,
                        end_data,
                        &data[(e2 - start_data) as usize..],
                        rollback,
                    )?;
                }
                return Ok(());
            }
        }
        Ok(())
    }

    pub(crate) fn truncate_file(&self, fcb: &mut Fcb, end: u64, rollback: &mut Rollback) -> FsResult<()> {
        // FIXME - convert into inline extent if short enough
        let sector_size = self.sector_size();
        self.excise_extents(
            fcb,
            sector_align(end, sector_size),
            sector_align(fcb.inode_item.st_size, sector_size),
            rollback,
        )?;

        fcb.inode_item.st_size = end;
        fcb.inode_item_changed = true;
        trace!("setting st_size to {:x}", end);

        fcb.header.allocation_size = sector_align(end, sector_size);
        fcb.header.file_size = end;
        fcb.header.valid_data_length = end;
        Ok(())
    }

    pub(crate) fn extend_file(
        &self,
        fcb: &mut Fcb,
        end: u64,
        prealloc: bool,
        rollback: &mut Rollback,
    ) -> FsResult<()> {
        trace!("extend_file ({:x}, {:x}) to {:x}", fcb.subvol, fcb.inode, end);
        let sector_size = self.sector_size();

        let last = fcb
            .extents
            .iter()
            .enumerate()
            .rev()
            .find(|(_, e)| !e.ignore)
            .map(|(i, e)| (i, e.seq, e.offset, e.len(), e.decoded_size, e.extent_type()));

        if let Some((idx, _seq, ext_offset, ext_len, ext_decoded, ext_type)) = last {
            let mut oldalloc = ext_offset + ext_len;
            let mut cur_inline = ext_type == ExtentType::Inline;

            if cur_inline && end > self.max_inline() {
                trace!("giving inline file proper extents");
                let payload = match &fcb.extents[idx].content {
                    ExtentContent::Inline(d) => d.clone(),
                    _ => return Err(FsError::Corrupted("inline extent without payload")),
                };
                let origlength = ext_decoded;
                cur_inline = false;

                let length = sector_align(origlength, sector_size);
                let mut data = payload;
                data.resize(length as usize, 0);

                fcb.inode_item_changed = true;
                remove_fcb_extent(fcb, idx, origlength, rollback);
                self.mark_fcb_dirty(fcb);

                if self.write_fcb_compressed(fcb) {
                    self.write_compressed(fcb, ext_offset, ext_offset + length, &data, rollback)?;
                } else {
                    self.insert_extent(fcb, ext_offset, length, &data, rollback)?;
                }

                oldalloc = ext_offset + length;
            }

            if cur_inline {
                if end > oldalloc {
                    let payload = match &fcb.extents[idx].content {
                        ExtentContent::Inline(d) => d.clone(),
                        _ => return Err(FsError::Corrupted("inline extent without payload")),
                    };
                    let mut data = payload;
                    data.resize((end - ext_offset) as usize, 0);
                    let unique = fcb.extents[idx].unique;
                    let seq = fcb.alloc_seq();
                    let newext = Extent {
                        seq,
                        offset: ext_offset,
                        generation: self.generation(),
                        decoded_size: end - ext_offset,
                        compression: CompressionType::None,
                        encryption: ENCRYPTION_NONE,
                        encoding: ENCODING_NONE,
                        content: ExtentContent::Inline(data),
                        unique,
                        ignore: false,
                        inserted: true,
                        csum: None,
                    };
                    remove_fcb_extent(fcb, idx, ext_decoded, rollback);
                    add_extent_to_fcb(fcb, newext, end - ext_offset, rollback);
                    fcb.extents_changed = true;
                    self.mark_fcb_dirty(fcb);
                }

                trace!("extending inline file (oldalloc = {:x}, end = {:x})", oldalloc, end);
                fcb.inode_item.st_size = end;
                fcb.header.allocation_size = end;
                fcb.header.file_size = end;
                fcb.header.valid_data_length = end;
            } else {
                let newalloc = sector_align(end, sector_size);
                if newalloc > oldalloc {
                    if prealloc {
                        // FIXME - try and extend previous extent first
                        self.insert_prealloc_extent(fcb, oldalloc, newalloc - oldalloc, rollback)?;
                    }
                    fcb.extents_changed = true;
                }

                fcb.inode_item.st_size = end;
                fcb.inode_item_changed = true;
                self.mark_fcb_dirty(fcb);
                trace!("setting st_size to {:x}", end);

                fcb.header.allocation_size = newalloc;
                fcb.header.file_size = end;
                fcb.header.valid_data_length = end;
            }
        } else if end > self.max_inline() {
            let newalloc = sector_align(end, sector_size);
            if prealloc {
                self.insert_prealloc_extent(fcb, 0, newalloc, rollback)?;
            }
            fcb.extents_changed = true;
            fcb.inode_item_changed = true;
            self.mark_fcb_dirty(fcb);
            fcb.inode_item.st_size = end;

            fcb.header.allocation_size = newalloc;
            fcb.header.file_size = end;
            fcb.header.valid_data_length = end;
        } else {
            // brand-new short file: a zeroed inline extent
            let seq = fcb.alloc_seq();
            let ext = Extent {
                seq,
                offset: 0,
                generation: self.generation(),
                decoded_size: end,
                compression: CompressionType::None,
                encryption: ENCRYPTION_NONE,
                encoding: ENCODING_NONE,
                content: ExtentContent::Inline(vec![0 as u8; end as usize]),
                unique: false,
                ignore: false,
                inserted: true,
                csum: None,
            };
            add_extent_to_fcb(fcb, ext, end, rollback);
            fcb.extents_changed = true;
            fcb.inode_item_changed = true;
            self.mark_fcb_dirty(fcb);
            fcb.inode_item.st_size = end;

            fcb.header.allocation_size = end;
            fcb.header.file_size = end;
            fcb.header.valid_data_length = end;
        }

        Ok(())
    }

    /// Logical file read used by the partial-sector merge and by the public
    /// read entry; holes and prealloc ranges read as zeros.
    pub fn read_file(&self, fcb: &Fcb, start: u64, buf: &mut [u8]) -> FsResult<()> {
        let end = start + buf.len() as u64;
        buf.fill(0);

        for ext in fcb.live_extents() {
            if ext.end() <= start {
                continue;
            }
            if ext.offset >= end {
                break;
            }
            let a = max(start, ext.offset);
            let b = min(end, ext.end());
            let dst = &mut buf[(a - start) as usize..(b - start) as usize];

            match &ext.content {
                ExtentContent::Inline(data) => {
                    let from = (a - ext.offset) as usize;
                    dst.copy_from_slice(&data[from..from + dst.len()]);
                }
                ExtentContent::Regular(de) => {
                    if ext.compression == CompressionType::None {
                        let addr = de.address + de.offset + (a - ext.offset);
                        let c = self
                            .get_chunk_from_address(addr)
                            .ok_or(FsError::Corrupted("extent points outside all chunks"))?;
                        read_data(&c, addr, dst)?;
                    } else {
                        let c = self
                            .get_chunk_from_address(de.address)
                            .ok_or(FsError::Corrupted("extent points outside all chunks"))?;
                        let mut cbuf = vec![0 as u8; de.size as usize];
                        read_data(&c, de.address, &mut cbuf)?;
                        let plain = zlib_decompress(&cbuf, ext.decoded_size as usize)?;
                        let from = (de.offset + (a - ext.offset)) as usize;
                        dst.copy_from_slice(&plain[from..from + dst.len()]);
                    }
                }
                ExtentContent::Prealloc(_) => {}
            }
        }
        Ok(())
    }

    /// The write orchestrator: size handling, inline/compressed/regular
    /// choice, partial-sector merge, then dispatch into the chosen path.
    pub(crate) fn write_file2(
        &self,
        fcb: &mut Fcb,
        offset: u64,
        buf: &[u8],
        flags: &WriteFlags,
        rollback: &mut Rollback,
    ) -> FsResult<usize> {
        let mut length = buf.len() as u64;
        if length == 0 {
            warn!("returning success for zero-length write");
            return Ok(0);
        }
        let sector_size = self.sector_size();
        let paging_io = flags.paging_io;

        let mut newlength = if fcb.deleted { 0 } else { fcb.inode_item.st_size };
        let mut changed_length = false;

        trace!("write_file2 inode {:x} offset {:x} length {:x}", fcb.inode, offset, length);

        if offset + length > newlength {
            if paging_io {
                if offset >= newlength {
                    trace!(
                        "paging write beyond end of file (size {:x}, offset {:x})",
                        newlength,
                        offset
                    );
                    return Ok(0);
                }
                length = newlength - offset;
            } else {
                newlength = offset + length;
                changed_length = true;
                trace!("extending length to {:x}", newlength);
            }
        }

        let make_inline = newlength <= self.max_inline();
        let compress = self.write_fcb_compressed(fcb) && !fcb.is_paging_file && !make_inline;

        if changed_length {
            if newlength > fcb.header.allocation_size {
                self.extend_file(fcb, newlength, false, rollback)?;
            } else {
                fcb.inode_item.st_size = newlength;
                fcb.inode_item_changed = true;
            }
            fcb.header.file_size = newlength;
            fcb.header.valid_data_length = newlength;
        }

        let (start_data, end_data) = if make_inline {
            (0, sector_align(newlength, sector_size))
        } else if compress {
            (
                offset & !(COMPRESSED_EXTENT_SIZE - 1),
                min(
                    sector_align(offset + length, COMPRESSED_EXTENT_SIZE),
                    sector_align(newlength, sector_size),
                ),
            )
        } else {
            (
                offset & !(sector_size - 1),
                sector_align(offset + length, sector_size),
            )
        };

        fcb.header.valid_data_length = newlength;

        let no_buf = !make_inline && !compress && offset == start_data && offset + length == end_data;
        let mut merged: Vec<u8> = Vec::new();
        let data: &[u8] = if no_buf {
            buf
        } else {
            merged.resize((end_data - start_data) as usize, 0);

            if offset > start_data || offset + length < end_data {
                // merge with what's already there
                if changed_length {
                    let st_size = fcb.inode_item.st_size;
                    if st_size > start_data {
                        let upto = (st_size - start_data) as usize;
                        self.read_file(fcb, start_data, &mut merged[..upto])?;
                    }
                } else {
                    self.read_file(fcb, start_data, &mut merged[..])?;
                }
            }

            merged[(offset - start_data) as usize..(offset - start_data + length) as usize]
                .copy_from_slice(&buf[..length as usize]);
            &merged
        };

        if make_inline {
            self.excise_extents(fcb, start_data, end_data, rollback)?;

            let seq = fcb.alloc_seq();
            let ext = Extent {
                seq,
                offset: 0,
                generation: self.generation(),
                decoded_size: newlength,
                compression: CompressionType::None,
                encryption: ENCRYPTION_NONE,
                encoding: ENCODING_NONE,
                content: ExtentContent::Inline(data[..newlength as usize].to_vec()),
                unique: false,
                ignore: false,
                inserted: true,
                csum: None,
            };
            add_extent_to_fcb(fcb, ext, newlength, rollback);
            fcb.extents_changed = true;
        } else if compress {
            self.write_compressed(fcb, start_data, end_data, data, rollback)?;
        } else {
            self.do_write_file(fcb, start_data, end_data, data, rollback)?;
        }

        let pagefile = paging_io && fcb.is_paging_file;
        if !pagefile {
            let now = now_timespec();
            fcb.inode_item.transid = self.generation();
            fcb.inode_item.sequence += 1;
            fcb.inode_item.st_ctime = now;
            if changed_length {
                fcb.inode_item.st_size = newlength;
            }
            fcb.inode_item.st_mtime = now;
            fcb.inode_item_changed = true;
            self.mark_fcb_dirty(fcb);
        }

        Ok(length as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbtrfs_lib::test_support::{make_fcb, make_vcb};

    #[test]
    fn insert_extent_accounts_space_and_blocks() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = make_fcb();
        let mut rollback = vec![];
        let data = vec![9 as u8; 0x4000];

        vcb.insert_extent(&mut fcb, 0, 0x4000, &data, &mut rollback).unwrap();

        assert_eq!(fcb.inode_item.st_blocks, 0x4000);
        let live: Vec<&Extent> = fcb.live_extents().collect();
        assert_eq!(live.len(), 1);
        assert!(live[0].csum.is_some());
        assert_eq!(live[0].csum.as_ref().unwrap().len(), 4);

        let c = vcb.get_chunk_from_address(live[0].disk_extent().unwrap().address).unwrap();
        let inner = c.lock_inner();
        assert_eq!(inner.used + inner.space.total(), c.chunk_item.size);
        assert!(inner.used >= 0x4000);
    }

    #[test]
    fn try_extend_appends_in_same_chunk() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = make_fcb();
        let mut rollback = vec![];
        let data = vec![1 as u8; 0x4000];
        vcb.insert_extent(&mut fcb, 0, 0x4000, &data, &mut rollback).unwrap();
        vcb.insert_extent(&mut fcb, 0x4000, 0x4000, &data, &mut rollback).unwrap();

        let live: Vec<&Extent> = fcb.live_extents().collect();
        assert_eq!(live.len(), 2);
        let de0 = live[0].disk_extent().unwrap();
        let de1 = live[1].disk_extent().unwrap();
        // second extent landed right after the first in the same chunk
        assert_eq!(de1.address, de0.address + de0.size);
        fcb.check_extent_invariants();
    }

    #[test]
    fn read_file_zero_fills_holes() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = make_fcb();
        let mut rollback = vec![];
        let data = vec![0x77 as u8; 0x1000];
        vcb.insert_extent(&mut fcb, 0x2000, 0x1000, &data, &mut rollback).unwrap();

        let mut buf = vec![0xee as u8; 0x4000];
        vcb.read_file(&fcb, 0, &mut buf).unwrap();
        assert!(buf[..0x2000].iter().all(|b| *b == 0));
        assert_eq!(&buf[0x2000..0x3000], &data[..]);
        assert!(buf[0x3000..].iter().all(|b| *b == 0));
    }
}
