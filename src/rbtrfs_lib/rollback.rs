use log::*;

use crate::rbtrfs_lib::extent::Fcb;
use crate::rbtrfs_lib::Vcb;

/// One recorded mutation, replayed in reverse on abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackItem {
    /// An extent was added to the file this transaction.
    InsertExtent { seq: u64, blocks: u64 },
    /// A live extent was soft-deleted this transaction.
    DeleteExtent { seq: u64, blocks: u64 },
    /// Free space was returned to a chunk.
    AddSpace { chunk: u64, address: u64, size: u64 },
    /// Free space was taken from a chunk.
    SubtractSpace { chunk: u64, address: u64, size: u64 },
}

pub type Rollback = Vec<RollbackItem>;

pub fn add_rollback(rollback: &mut Rollback, item: RollbackItem) {
    rollback.push(item);
}

pub fn clear_rollback(rollback: &mut Rollback) {
    rollback.clear();
}

impl Vcb {
    /// Replay the journal newest-first, restoring the pre-write state.
    pub fn do_rollback(&self, fcb: &mut Fcb, rollback: &mut Rollback) {
        while let Some(item) = rollback.pop() {
            match item {
                RollbackItem::InsertExtent { seq, blocks } => {
                    if let Some(pos) = fcb.extents.iter().position(|e| e.seq == seq) {
                        fcb.extents.remove(pos);
                        fcb.inode_item.st_blocks -= blocks;
                    } else {
                        warn!("rollback: inserted extent {} not found", seq);
                    }
                }
                RollbackItem::DeleteExtent { seq, blocks } => {
                    match fcb.extents.iter_mut().find(|e| e.seq == seq) {
                        Some(ext) => {
                            ext.ignore = false;
                            fcb.inode_item.st_blocks += blocks;
                        }
                        None => warn!("rollback: deleted extent {} not found", seq),
                    }
                }
                RollbackItem::AddSpace { chunk, address, size } => {
                    if let Some(c) = self.get_chunk_from_address(chunk) {
                        let mut inner = c.inner.lock().unwrap();
                        inner.space.subtract(address, size);
                        inner.used += size;
                    }
                }
                RollbackItem::SubtractSpace { chunk, address, size } => {
                    if let Some(c) = self.get_chunk_from_address(chunk) {
                        let mut inner = c.inner.lock().unwrap();
                        inner.space.add(address, size);
                        inner.used -= size;
                    }
                }
            }
        }
    }
}
