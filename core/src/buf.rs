// Cached block buffer as seen by the dependency tracker

use crate::types::{BlockNo, BufId};

/// A cached block. The buffer cache owns it; the tracker only rewrites
/// its bytes around writes and flags it dirty when a rollback remains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    pub id: BufId,
    /// Physical block number the buffer maps
    pub blkno: BlockNo,
    pub data: Vec<u8>,
    pub dirty: bool,
}

impl BlockBuf {
    pub fn new(id: BufId, blkno: BlockNo, size: usize) -> Self {
        Self {
            id,
            blkno,
            data: vec![0; size],
            dirty: false,
        }
    }

    pub fn with_data(id: BufId, blkno: BlockNo, data: Vec<u8>) -> Self {
        Self { id, blkno, data, dirty: false }
    }
}
