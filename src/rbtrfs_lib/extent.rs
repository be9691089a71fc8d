use log::*;

use crate::rbtrfs_lib::desc::*;
use crate::rbtrfs_lib::rollback::{add_rollback, Rollback, RollbackItem};
use crate::rbtrfs_lib::{FsError, FsResult, Vcb};

#[derive(Debug, Clone)]
pub enum ExtentContent {
    Inline(Vec<u8>),
    Regular(ExtentData2),
    Prealloc(ExtentData2),
}

/// One file extent. `ignore` soft-deletes the entry for the duration of a
/// transaction; `inserted` marks entries created in the current one.
#[derive(Debug, Clone)]
pub struct Extent {
    pub seq: u64,
    pub offset: u64,
    pub generation: u64,
    pub decoded_size: u64,
    pub compression: CompressionType,
    pub encryption: u8,
    pub encoding: u16,
    pub content: ExtentContent,
    pub unique: bool,
    pub ignore: bool,
    pub inserted: bool,
    pub csum: Option<Vec<u32>>,
}

impl Extent {
    pub fn extent_type(&self) -> ExtentType {
        match self.content {
            ExtentContent::Inline(_) => ExtentType::Inline,
            ExtentContent::Regular(_) => ExtentType::Regular,
            ExtentContent::Prealloc(_) => ExtentType::Prealloc,
        }
    }

    /// Bytes of the file covered by this extent.
    pub fn len(&self) -> u64 {
        match &self.content {
            ExtentContent::Inline(_) => self.decoded_size,
            ExtentContent::Regular(de) | ExtentContent::Prealloc(de) => de.num_bytes,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }

    pub fn disk_extent(&self) -> Option<&ExtentData2> {
        match &self.content {
            ExtentContent::Inline(_) => None,
            ExtentContent::Regular(de) | ExtentContent::Prealloc(de) => Some(de),
        }
    }

    pub fn is_prealloc(&self) -> bool {
        matches!(self.content, ExtentContent::Prealloc(_))
    }
}

/// The open file-size triple kept on the file header.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSizes {
    pub allocation_size: u64,
    pub file_size: u64,
    pub valid_data_length: u64,
}

/// Per-file control block: inode item plus the ordered in-memory extent list.
pub struct Fcb {
    pub subvol: u64,
    pub inode: u64,
    pub inode_item: InodeItem,
    pub extents: Vec<Extent>,
    pub header: FileSizes,
    pub extents_changed: bool,
    pub inode_item_changed: bool,
    pub deleted: bool,
    pub is_paging_file: bool,
    pub dirty: bool,
    next_seq: u64,
}

impl Fcb {
    pub fn new(subvol: u64, inode: u64, flags: u64) -> Self {
        let mut inode_item = InodeItem::default();
        inode_item.flags = flags;
        inode_item.st_nlink = 1;
        inode_item.st_mode = 0o100644;
        Self {
            subvol,
            inode,
            inode_item,
            extents: vec![],
            header: Default::default(),
            extents_changed: false,
            inode_item_changed: false,
            deleted: false,
            is_paging_file: false,
            dirty: false,
            next_seq: 1,
        }
    }

    pub fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn nodatacow(&self) -> bool {
        self.inode_item.flags & INODE_FLAG_NODATACOW != 0
    }

    pub fn nodatasum(&self) -> bool {
        self.inode_item.flags & INODE_FLAG_NODATASUM != 0
    }

    pub fn live_extents(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter().filter(|e| !e.ignore)
    }

    /// Non-ignored extents must be strictly ordered and disjoint.
    pub fn check_extent_invariants(&self) {
        let mut last_end = 0;
        let mut first = true;
        for e in self.live_extents() {
            if !first {
                assert!(e.offset >= last_end, "extent at {:x} overlaps previous", e.offset);
            }
            last_end = e.end();
            first = false;
        }
    }
}

/// Scalar fields copied out of an extent so new splits can be built while
/// the list is being edited.
#[derive(Clone)]
struct ExtProto {
    decoded_size: u64,
    compression: CompressionType,
    encryption: u8,
    encoding: u16,
    unique: bool,
    prealloc: bool,
    csum: Option<Vec<u32>>,
}

impl ExtProto {
    fn of(e: &Extent) -> Self {
        Self {
            decoded_size: e.decoded_size,
            compression: e.compression,
            encryption: e.encryption,
            encoding: e.encoding,
            unique: e.unique,
            prealloc: e.is_prealloc(),
            csum: e.csum.clone(),
        }
    }

    fn build(&self, seq: u64, offset: u64, generation: u64, content: ExtentContent, csum: Option<Vec<u32>>) -> Extent {
        Extent {
            seq,
            offset,
            generation,
            decoded_size: self.decoded_size,
            compression: self.compression,
            encryption: self.encryption,
            encoding: self.encoding,
            content,
            unique: self.unique,
            ignore: false,
            inserted: true,
            csum,
        }
    }

    fn disk_content(&self, de: ExtentData2) -> ExtentContent {
        if self.prealloc {
            ExtentContent::Prealloc(de)
        } else {
            ExtentContent::Regular(de)
        }
    }

    /// Csum slice for a split keeping `keep_bytes` of the decoded range
    /// starting `skip_bytes` in. Compressed extents share the whole array.
    fn sliced_csum(&self, de: &ExtentData2, skip_bytes: u64, keep_bytes: u64, sector_size: u64) -> Option<Vec<u32>> {
        match (&self.csum, self.compression) {
            (None, _) => None,
            (Some(csum), CompressionType::None) => {
                let from = (skip_bytes / sector_size) as usize;
                let count = (keep_bytes / sector_size) as usize;
                Some(csum[from..from + count].to_vec())
            }
            (Some(csum), _) => {
                debug_assert_eq!(csum.len() as u64, de.size / sector_size);
                Some(csum.clone())
            }
        }
    }
}

/// Place `ext` in file order. The caller has already excised any overlap.
/// `blocks` is the amount this extent adds to `inode.st_blocks`.
pub fn add_extent_to_fcb(fcb: &mut Fcb, ext: Extent, blocks: u64, rollback: &mut Rollback) {
    let seq = ext.seq;
    let offset = ext.offset;
    let pos = fcb
        .extents
        .iter()
        .position(|e| !e.ignore && e.offset > offset)
        .unwrap_or(fcb.extents.len());
    fcb.extents.insert(pos, ext);
    fcb.inode_item.st_blocks += blocks;
    add_rollback(rollback, RollbackItem::InsertExtent { seq, blocks });
}

/// Soft-delete the extent at `idx`. `blocks` is the amount removed from
/// `inode.st_blocks` by this deletion.
pub fn remove_fcb_extent(fcb: &mut Fcb, idx: usize, blocks: u64, rollback: &mut Rollback) {
    let ext = &mut fcb.extents[idx];
    if !ext.ignore {
        ext.ignore = true;
        let seq = ext.seq;
        fcb.inode_item.st_blocks -= blocks;
        add_rollback(rollback, RollbackItem::DeleteExtent { seq, blocks });
    }
}

impl Vcb {
    fn queue_extent_ref_delta(&self, fcb: &Fcb, ext_offset: u64, de: &ExtentData2, delta: i64) {
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

    /// Punch `[start_data, end_data)` out of the file's extent list,
    /// splitting boundary extents and updating queued extent refs.
    pub fn excise_extents(
        &self,
        fcb: &mut Fcb,
        start_data: u64,
        end_data: u64,
        rollback: &mut Rollback,
    ) -> FsResult<()> {
        trace!(
            "excise_extents inode {:x} [{:x}, {:x})",
            fcb.inode,
            start_data,
            end_data
        );
        let sector_size = self.sector_size();
        let generation = self.generation();

        let mut i = 0;
        while i < fcb.extents.len() {
            if fcb.extents[i].ignore {
                i += 1;
                continue;
            }
            let offset = fcb.extents[i].offset;
            let len = fcb.extents[i].len();
            if offset >= end_data || offset + len <= start_data {
                i += 1;
                continue;
            }

            let proto = ExtProto::of(&fcb.extents[i]);
            let content = fcb.extents[i].content.clone();

            match content {
                ExtentContent::Inline(data) => {
                    if start_data <= offset && end_data >= offset + len {
                        // remove all
                        remove_fcb_extent(fcb, i, len, rollback);
                    } else if start_data <= offset && end_data < offset + len {
                        // remove beginning
                        let size = len - (end_data - offset);
                        let mut proto = proto;
                        proto.decoded_size = size;
                        let seq = fcb.alloc_seq();
                        let newext = proto.build(
                            seq,
                            end_data,
                            generation,
                            ExtentContent::Inline(data[(end_data - offset) as usize..].to_vec()),
                            None,
                        );
                        remove_fcb_extent(fcb, i, end_data - offset, rollback);
                        add_extent_to_fcb(fcb, newext, 0, rollback);
                    } else if start_data > offset && end_data >= offset + len {
                        // remove end
                        let size = start_data - offset;
                        let mut proto = proto;
                        proto.decoded_size = size;
                        let seq = fcb.alloc_seq();
                        let newext = proto.build(
                            seq,
                            offset,
                            generation,
                            ExtentContent::Inline(data[..size as usize].to_vec()),
                            None,
                        );
                        remove_fcb_extent(fcb, i, offset + len - start_data, rollback);
                        add_extent_to_fcb(fcb, newext, 0, rollback);
                    } else {
                        // remove middle
                        let mut proto1 = proto.clone();
                        proto1.decoded_size = start_data - offset;
                        let mut proto2 = proto;
                        proto2.decoded_size = offset + len - end_data;
                        let seq1 = fcb.alloc_seq();
                        let seq2 = fcb.alloc_seq();
                        let newext1 = proto1.build(
                            seq1,
                            offset,
                            generation,
                            ExtentContent::Inline(data[..(start_data - offset) as usize].to_vec()),
                            None,
                        );
                        let newext2 = proto2.build(
                            seq2,
                            end_data,
                            generation,
                            ExtentContent::Inline(data[(end_data - offset) as usize..].to_vec()),
                            None,
                        );
                        remove_fcb_extent(fcb, i, end_data - start_data, rollback);
                        add_extent_to_fcb(fcb, newext1, 0, rollback);
                        add_extent_to_fcb(fcb, newext2, 0, rollback);
                    }
                }
                ExtentContent::Regular(de) | ExtentContent::Prealloc(de) => {
                    let accounted = de.size != 0;
                    if start_data <= offset && end_data >= offset + len {
                        // remove all
                        if accounted {
                            self.queue_extent_ref_delta(fcb, offset, &de, -1);
                        }
                        remove_fcb_extent(fcb, i, if accounted { len } else { 0 }, rollback);
                    } else if start_data <= offset && end_data < offset + len {
                        // remove beginning; the extent-tree ref is unchanged
                        let mut nde = de;
                        nde.offset = de.offset + (end_data - offset);
                        nde.num_bytes = de.num_bytes - (end_data - offset);
                        let csum = proto.sliced_csum(&nde, end_data - offset, nde.num_bytes, sector_size);
                        let seq = fcb.alloc_seq();
                        let newext =
                            proto.build(seq, end_data, generation, proto.disk_content(nde), csum);
                        remove_fcb_extent(
                            fcb,
                            i,
                            if accounted { end_data - offset } else { 0 },
                            rollback,
                        );
                        add_extent_to_fcb(fcb, newext, 0, rollback);
                    } else if start_data > offset && end_data >= offset + len {
                        // remove end
                        let mut nde = de;
                        nde.num_bytes = start_data - offset;
                        let csum = proto.sliced_csum(&nde, 0, nde.num_bytes, sector_size);
                        let seq = fcb.alloc_seq();
                        let newext =
                            proto.build(seq, offset, generation, proto.disk_content(nde), csum);
                        remove_fcb_extent(
                            fcb,
                            i,
                            if accounted { offset + len - start_data } else { 0 },
                            rollback,
                        );
                        add_extent_to_fcb(fcb, newext, 0, rollback);
                    } else {
                        // remove middle: the on-disk extent gains a referrer
                        if accounted {
                            self.queue_extent_ref_delta(fcb, offset, &de, 1);
                        }
                        let mut nde1 = de;
                        nde1.num_bytes = start_data - offset;
                        let mut nde2 = de;
                        nde2.offset = de.offset + (end_data - offset);
                        nde2.num_bytes = offset + len - end_data;
                        let csum1 = proto.sliced_csum(&nde1, 0, nde1.num_bytes, sector_size);
                        let csum2 =
                            proto.sliced_csum(&nde2, end_data - offset, nde2.num_bytes, sector_size);
                        let seq1 = fcb.alloc_seq();
                        let seq2 = fcb.alloc_seq();
                        let newext1 =
                            proto.build(seq1, offset, generation, proto.disk_content(nde1), csum1);
                        let newext2 =
                            proto.build(seq2, end_data, generation, proto.disk_content(nde2), csum2);
                        remove_fcb_extent(
                            fcb,
                            i,
                            if accounted { end_data - start_data } else { 0 },
                            rollback,
                        );
                        add_extent_to_fcb(fcb, newext1, 0, rollback);
                        add_extent_to_fcb(fcb, newext2, 0, rollback);
                    }
                }
            }

            i += 1;
        }

        fcb.extents_changed = true;
        self.mark_fcb_dirty(fcb);
        Ok(())
    }

    /// Hole punch: same excise machinery behind an aligned public entry.
    pub fn excise(&self, fcb: &mut Fcb, start: u64, end: u64, rollback: &mut Rollback) -> FsResult<()> {
        if start >= end {
            return Err(FsError::InvalidArgument("empty excise range"));
        }
        let sector_size = self.sector_size();
        if start % sector_size != 0 || end % sector_size != 0 {
            return Err(FsError::InvalidArgument("unaligned excise range"));
        }
        self.excise_extents(fcb, start, end, rollback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbtrfs_lib::test_support::{make_fcb, make_vcb};

    fn regular_extent(fcb: &mut Fcb, offset: u64, num_bytes: u64, address: u64, sectors: usize) -> Extent {
        Extent {
            seq: fcb.alloc_seq(),
            offset,
            generation: 1,
            decoded_size: num_bytes,
            compression: CompressionType::None,
            encryption: ENCRYPTION_NONE,
            encoding: ENCODING_NONE,
            content: ExtentContent::Regular(ExtentData2 {
                address,
                size: num_bytes,
                offset: 0,
                num_bytes,
            }),
            unique: true,
            ignore: false,
            inserted: false,
            csum: Some((0..sectors as u32).collect()),
        }
    }

    #[test]
    fn excise_middle_splits_and_bumps_refcount() {
        let vcb = make_vcb(1, 0x2000000);
        let c = vcb.alloc_chunk(crate::rbtrfs_lib::desc::BLOCK_FLAG_DATA).unwrap();
        let mut fcb = make_fcb();
        let len = 0x100000; // 1 MiB, 256 sectors
        let ext = regular_extent(&mut fcb, 0, len, c.offset, 256);
        fcb.extents.push(ext);
        fcb.inode_item.st_blocks = len;

        let mut rollback = vec![];
        vcb.excise_extents(&mut fcb, 0x80000, 0x81000, &mut rollback).unwrap();

        let live: Vec<&Extent> = fcb.live_extents().collect();
        assert_eq!(live.len(), 2);
        assert_eq!((live[0].offset, live[0].len()), (0, 0x80000));
        assert_eq!((live[1].offset, live[1].len()), (0x81000, 0x7f000));
        let de1 = live[1].disk_extent().unwrap();
        assert_eq!(de1.offset, 0x81000);
        // csums sliced around the hole
        assert_eq!(live[0].csum.as_ref().unwrap().len(), 0x80000 / 4096);
        assert_eq!(live[1].csum.as_ref().unwrap().len(), 0x7f000 / 4096);
        assert_eq!(live[1].csum.as_ref().unwrap()[0], 0x81);
        // the on-disk extent picked up one more referrer
        assert_eq!(c.changed_extent_count(c.offset), Some(1));
        assert_eq!(fcb.inode_item.st_blocks, len - 0x1000);
        fcb.check_extent_invariants();
    }

    #[test]
    fn excise_is_idempotent() {
        let vcb = make_vcb(1, 0x2000000);
        let c = vcb.alloc_chunk(crate::rbtrfs_lib::desc::BLOCK_FLAG_DATA).unwrap();
        let mut fcb = make_fcb();
        let ext = regular_extent(&mut fcb, 0, 0x10000, c.offset, 16);
        fcb.extents.push(ext);
        fcb.inode_item.st_blocks = 0x10000;

        let mut rollback = vec![];
        vcb.excise_extents(&mut fcb, 0, 0x10000, &mut rollback).unwrap();
        let blocks = fcb.inode_item.st_blocks;
        let live = fcb.live_extents().count();
        vcb.excise_extents(&mut fcb, 0, 0x10000, &mut rollback).unwrap();
        assert_eq!(fcb.inode_item.st_blocks, blocks);
        assert_eq!(fcb.live_extents().count(), live);
        assert_eq!(live, 0);
    }

    #[test]
    fn excise_inline_head_shifts_payload() {
        let vcb = make_vcb(1, 0x2000000);
        let mut fcb = make_fcb();
        let payload: Vec<u8> = (0..100).collect();
        let seq = fcb.alloc_seq();
        let ext = Extent {
            seq,
            offset: 0,
            generation: 1,
            decoded_size: 100,
            compression: CompressionType::None,
            encryption: ENCRYPTION_NONE,
            encoding: ENCODING_NONE,
            content: ExtentContent::Inline(payload.clone()),
            unique: false,
            ignore: false,
            inserted: false,
            csum: None,
        };
        fcb.extents.push(ext);
        fcb.inode_item.st_blocks = 100;

        let mut rollback = vec![];
        vcb.excise_extents(&mut fcb, 0, 40, &mut rollback).unwrap();
        let live: Vec<&Extent> = fcb.live_extents().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].offset, 40);
        assert_eq!(live[0].decoded_size, 60);
        match &live[0].content {
            ExtentContent::Inline(d) => assert_eq!(d.as_slice(), &payload[40..]),
            _ => panic!("expected inline"),
        }
        assert_eq!(fcb.inode_item.st_blocks, 60);
    }

    #[test]
    fn insert_keeps_order() {
        let mut fcb = make_fcb();
        let mut rollback = vec![];
        for offset in [0x3000 as u64, 0x1000, 0x2000] {
            let e = regular_extent(&mut fcb, offset, 0x1000, 0xC00000, 1);
            add_extent_to_fcb(&mut fcb, e, 0x1000, &mut rollback);
        }
        let offsets: Vec<u64> = fcb.live_extents().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0x1000, 0x2000, 0x3000]);
        fcb.check_extent_invariants();
        assert_eq!(rollback.len(), 3);
    }
}
