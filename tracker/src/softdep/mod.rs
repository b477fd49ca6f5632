// Soft updates: metadata write ordering without a journal
//
// The filesystem writes its cached metadata blocks in any order. Each
// change whose prerequisites are not yet durable is recorded here, rolled
// back in the buffer just before a write and redone after it, so every
// image that reaches disk only references structures already on disk.

pub(crate) mod alloc;
pub(crate) mod arena;
pub(crate) mod dir;
pub(crate) mod drain;
pub(crate) mod graph;
pub(crate) mod inode;
pub(crate) mod io;
pub(crate) mod records;
pub(crate) mod state;
pub(crate) mod stats;
pub(crate) mod truncate;
pub(crate) mod worklist;

pub use arena::DepId;
pub use dir::RemoveKind;
pub use inode::InodeUpdate;
pub use io::{RollbackToken, WriteOutcome};
pub use records::DepKind;
pub use state::DepState;
pub use stats::SoftdepStats;
pub use worklist::DeferredWork;

use self::alloc::PtrArea;
use graph::DepGraph;
use softdep_core::{BlockBuf, BlockNo, BufId, Geometry, InCoreInode, Ino, Lbn, SoftdepConfig, SoftdepError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Handle of the allocation token recorded for a freshly allocated block
pub type NewblkToken = DepId;
/// Handle of the record tracking one pointer update
pub type AllocationRecord = DepId;
pub type DirAddRecord = DepId;
pub type DirRemRecord = DepId;

/// Link counts of an inode after the filesystem dropped links from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCounts {
    /// On-disk link count
    pub nlink: u16,
    /// Link count the namespace implies
    pub effnlink: u16,
}

/// Filesystem services the work queue calls with the tracker unlocked
pub trait FsBackend: Send + Sync {
    /// Return `size` bytes at `blkno` to the block allocator
    fn release_blocks(&self, ino: Ino, uid: u32, blkno: BlockNo, size: u32) -> Result<(), SoftdepError>;

    /// Return inode `ino` to the inode allocator
    fn release_inode(&self, ino: Ino, mode: u16) -> Result<(), SoftdepError>;

    /// Contents of indirect block `blkno` as last written
    fn read_indirect(&self, blkno: BlockNo) -> Result<Vec<u8>, SoftdepError>;

    /// Drop `count` on-disk links from `ino`
    fn drop_links(&self, ino: Ino, count: u16) -> Result<LinkCounts, SoftdepError>;

    /// Truncate a removed directory to zero length
    fn truncate_directory(&self, softdep: &Softdep, ino: Ino) -> Result<(), SoftdepError>;

    /// The last link to `ino` is gone from disk
    fn inode_released(&self, _softdep: &Softdep, _ino: Ino) -> Result<(), SoftdepError> {
        Ok(())
    }
}

/// Pushes the buffer cache's dirty buffers through the write hooks
pub trait BufferFlusher: Send + Sync {
    fn flush_dirty(&self, softdep: &Softdep) -> Result<(), SoftdepError>;

    /// Write one buffer now, dirty or not. A buffer no longer cached or
    /// already being written is skipped.
    fn flush_buffer(&self, softdep: &Softdep, buf: BufId) -> Result<(), SoftdepError>;
}

/// Where a block pointer being updated lives
#[derive(Debug, Clone, Copy)]
pub enum PointerSite<'a> {
    /// Inode pointer `lbn`; at or above NDADDR an indirect root
    Direct { lbn: Lbn, newsize: u32, oldsize: u32, data_buf: BufId },
    /// Extended attribute area pointer `lbn`
    ExtData { lbn: Lbn, newsize: u32, oldsize: u32, data_buf: BufId },
    /// Slot `ptrno` of an indirect block. `meta` marks a pointer to a
    /// lower-level indirect block held in `data_buf`.
    Indirect { indir_buf: &'a BlockBuf, ptrno: usize, data_buf: BufId, meta: bool },
}

/// Dependency tracker of one mount
pub struct Softdep {
    config: SoftdepConfig,
    geometry: Geometry,
    graph: Mutex<DepGraph>,
    fsck_required: AtomicBool,
}

impl Softdep {
    pub fn new(config: SoftdepConfig) -> Result<Self, SoftdepError> {
        config.validate()?;
        let geometry = config.geometry();
        log::info!(
            "softdep: mount with {} byte blocks, {} byte fragments, limit {}",
            geometry.bsize,
            geometry.fsize,
            config.max_dependencies
        );
        Ok(Self {
            graph: Mutex::new(DepGraph::new(geometry, config.max_dependencies)),
            geometry,
            config,
            fsck_required: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SoftdepConfig {
        &self.config
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Run `op` under the mount lock. A fatal error marks the mount for
    /// fsck and every later call fails with `NeedsFsck`.
    pub(crate) fn guard<T>(
        &self,
        op: impl FnOnce(&mut DepGraph) -> Result<T, SoftdepError>,
    ) -> Result<T, SoftdepError> {
        if self.fsck_required.load(Ordering::SeqCst) {
            return Err(SoftdepError::NeedsFsck);
        }
        let mut graph = self.graph.lock().unwrap();
        op(&mut graph).map_err(|e| self.poison(e))
    }

    pub(crate) fn poison(&self, err: SoftdepError) -> SoftdepError {
        if err.is_fatal() && !self.fsck_required.swap(true, Ordering::SeqCst) {
            log::error!("softdep: {}; filesystem needs fsck", err);
        }
        err
    }

    pub fn needs_fsck(&self) -> bool {
        self.fsck_required.load(Ordering::SeqCst)
    }

    // Allocation

    pub fn on_inode_allocated(&self, bitmap: BufId, ino: Ino) -> Result<(), SoftdepError> {
        self.guard(|g| g.setup_inomapdep(bitmap, ino).map(|_| ()))
    }

    pub fn on_block_allocated(&self, bitmap: BufId, blkno: BlockNo) -> Result<NewblkToken, SoftdepError> {
        self.guard(|g| g.setup_blkmapdep(bitmap, blkno))
    }

    /// A pointer of `ip` changes from `old` to the freshly allocated `new`
    pub fn on_pointer_update(
        &self,
        ip: &InCoreInode,
        site: PointerSite<'_>,
        old: BlockNo,
        new: BlockNo,
    ) -> Result<AllocationRecord, SoftdepError> {
        self.guard(|g| match site {
            PointerSite::Direct { lbn, newsize, oldsize, data_buf } => {
                g.setup_allocdirect(ip, lbn, new, old, newsize, oldsize, data_buf, PtrArea::Data)
            }
            PointerSite::ExtData { lbn, newsize, oldsize, data_buf } => {
                g.setup_allocdirect(ip, lbn, new, old, newsize, oldsize, data_buf, PtrArea::Ext)
            }
            PointerSite::Indirect { indir_buf, ptrno, data_buf, meta: false } => {
                g.setup_allocindir_page(ip, indir_buf, ptrno, new, old, data_buf)
            }
            PointerSite::Indirect { indir_buf, ptrno, data_buf, meta: true } => {
                if old != 0 {
                    return Err(SoftdepError::inconsistency(
                        "setup_allocindir_meta",
                        format!("indirect slot {} of inode {} reallocated", ptrno, ip.ino),
                    ));
                }
                g.setup_allocindir_meta(ip, indir_buf, ptrno, new, data_buf)
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn setup_allocdirect(
        &self,
        ip: &InCoreInode,
        lbn: Lbn,
        newblkno: BlockNo,
        oldblkno: BlockNo,
        newsize: u32,
        oldsize: u32,
        data_buf: BufId,
    ) -> Result<AllocationRecord, SoftdepError> {
        self.guard(|g| g.setup_allocdirect(ip, lbn, newblkno, oldblkno, newsize, oldsize, data_buf, PtrArea::Data))
    }

    pub fn setup_allocindir_page(
        &self,
        ip: &InCoreInode,
        indir_buf: &BlockBuf,
        ptrno: usize,
        newblkno: BlockNo,
        oldblkno: BlockNo,
        data_buf: BufId,
    ) -> Result<AllocationRecord, SoftdepError> {
        self.guard(|g| g.setup_allocindir_page(ip, indir_buf, ptrno, newblkno, oldblkno, data_buf))
    }

    pub fn setup_allocindir_meta(
        &self,
        ip: &InCoreInode,
        indir_buf: &BlockBuf,
        ptrno: usize,
        newblkno: BlockNo,
        new_indir_buf: BufId,
    ) -> Result<AllocationRecord, SoftdepError> {
        self.guard(|g| g.setup_allocindir_meta(ip, indir_buf, ptrno, newblkno, new_indir_buf))
    }

    // Directories

    /// Entry naming `target` was written at `offset` of directory `dp`.
    /// Whiteouts need no record and return `None`.
    pub fn on_dir_entry_added(
        &self,
        dir_buf: BufId,
        dp: &InCoreInode,
        offset: u64,
        target: Ino,
        new_dir_body: Option<BufId>,
    ) -> Result<Option<DirAddRecord>, SoftdepError> {
        self.guard(|g| g.setup_directory_add(dir_buf, dp, offset, target, new_dir_body))
    }

    pub fn on_dir_entry_removed(
        &self,
        dir_buf: BufId,
        dp: &InCoreInode,
        offset: u64,
        removed: Ino,
        is_rmdir: bool,
    ) -> Result<DirRemRecord, SoftdepError> {
        self.guard(|g| g.setup_remove(dir_buf, dp, offset, removed, is_rmdir))
    }

    /// The entry at `offset` now names `new` instead of `removed`
    pub fn on_dir_entry_changed(
        &self,
        dir_buf: BufId,
        dp: &InCoreInode,
        offset: u64,
        removed: Ino,
        new: Ino,
        kind: RemoveKind,
    ) -> Result<DirRemRecord, SoftdepError> {
        self.guard(|g| g.setup_directory_change(dir_buf, dp, offset, removed, new, kind))
    }

    pub fn change_directoryentry_offset(
        &self,
        dp: &InCoreInode,
        dir_buf: &mut BlockBuf,
        lbn: Lbn,
        oldoffset: usize,
        newoffset: usize,
        entrysize: usize,
    ) -> Result<(), SoftdepError> {
        self.guard(|g| g.change_directoryentry_offset(dp, dir_buf, lbn, oldoffset, newoffset, entrysize))
    }

    // Inodes

    pub fn on_link_count_changed(&self, ip: &InCoreInode) -> Result<(), SoftdepError> {
        self.guard(|g| g.change_linkcnt(ip))
    }

    /// Set the effective link count of an inode just read from disk
    pub fn on_inode_buffer_read(&self, ip: &mut InCoreInode) -> Result<(), SoftdepError> {
        self.guard(|g| g.load_inodeblock(ip))
    }

    /// Copy `ip` into its inode buffer
    pub fn on_inode_written(&self, ip: &InCoreInode, buf: &mut BlockBuf, wait: bool) -> Result<InodeUpdate, SoftdepError> {
        self.guard(|g| g.update_inodeblock(ip, buf, wait))
    }

    /// Truncate `ip` to `length` bytes. The cached `dirty_bufs` of the file
    /// lose their dependencies and must be discarded.
    pub fn on_truncate(
        &self,
        ip: &mut InCoreInode,
        inode_buf: &mut BlockBuf,
        dirty_bufs: &mut [BlockBuf],
        length: u64,
    ) -> Result<(), SoftdepError> {
        self.guard(|g| g.setup_freeblocks(ip, inode_buf, dirty_bufs, length).map(|_| ()))
    }

    pub fn on_inode_freed(&self, ino: Ino, mode: u16) -> Result<(), SoftdepError> {
        self.guard(|g| g.setup_freefile(ino, mode).map(|_| ()))
    }

    // Buffer writes

    pub fn before_buffer_write(&self, buf: &mut BlockBuf) -> Result<RollbackToken, SoftdepError> {
        self.guard(|g| g.before_buffer_write(buf))
    }

    pub fn after_buffer_write(&self, buf: &mut BlockBuf, token: RollbackToken) -> Result<WriteOutcome, SoftdepError> {
        self.guard(|g| g.after_buffer_write(buf, token))
    }

    /// The write failed; returns the inodes the failure is reported against
    pub fn abort_buffer_write(&self, buf: &mut BlockBuf, token: RollbackToken, error: &str) -> Result<Vec<Ino>, SoftdepError> {
        self.guard(|g| g.abort_buffer_write(buf, token, error))
    }

    pub fn take_io_error(&self, ino: Ino) -> Option<String> {
        self.graph.lock().unwrap().take_io_error(ino)
    }

    pub fn enqueue_deferred(&self, work: DeferredWork) -> Result<(), SoftdepError> {
        self.guard(|g| g.enqueue_deferred(work).map(|_| ()))
    }

    pub fn count_dependencies(&self, buf: BufId) -> Result<usize, SoftdepError> {
        self.guard(|g| g.count_dependencies(buf))
    }

    pub fn move_dependencies(&self, old: BufId, new: BufId) -> Result<(), SoftdepError> {
        self.guard(|g| g.move_dependencies(old, new))
    }

    pub fn inode_flush_targets(&self, ino: Ino) -> Result<Vec<BufId>, SoftdepError> {
        self.guard(|g| g.inode_flush_targets(ino))
    }

    pub fn inode_sync_targets(&self, ino: Ino) -> Result<Vec<BufId>, SoftdepError> {
        self.guard(|g| g.inode_sync_targets(ino))
    }

    // Introspection

    pub fn stats(&self) -> SoftdepStats {
        self.graph.lock().unwrap().stats.clone()
    }

    /// No records, queued work or writes in flight remain
    pub fn is_idle(&self) -> Result<bool, SoftdepError> {
        self.guard(|g| Ok(g.is_empty() && g.in_flight.is_empty()))
    }

    pub fn record_state(&self, id: DepId) -> Option<(DepKind, DepState)> {
        let graph = self.graph.lock().unwrap();
        graph.arena.get(id).map(|rec| (rec.dep.kind(), rec.state))
    }

    /// Live records by kind
    pub fn record_counts(&self) -> BTreeMap<DepKind, usize> {
        let graph = self.graph.lock().unwrap();
        let mut counts = BTreeMap::new();
        for (_, rec) in graph.arena.iter() {
            *counts.entry(rec.dep.kind()).or_insert(0) += 1;
        }
        counts
    }

    pub fn queued_work(&self) -> usize {
        self.graph.lock().unwrap().queue.len()
    }

    /// Live inodedeps or dirrems exceed the configured limit
    pub fn cleanup_requested(&self) -> bool {
        let mut graph = self.graph.lock().unwrap();
        if graph.cleanup_requested
            && graph.num_inodedep < graph.max_dependencies
            && graph.num_dirrem <= graph.max_dependencies / 2
        {
            graph.cleanup_requested = false;
        }
        graph.cleanup_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let config = SoftdepConfig {
            frag_size: 3000,
            ..Default::default()
        };
        assert!(matches!(Softdep::new(config), Err(SoftdepError::Configuration(_))));
    }

    #[test]
    fn test_fatal_error_poisons_mount() {
        let softdep = Softdep::new(SoftdepConfig::default()).unwrap();
        softdep.on_inode_allocated(BufId(1), 40).unwrap();
        assert!(softdep.on_inode_allocated(BufId(1), 40).is_err());
        assert!(softdep.needs_fsck());
        assert!(matches!(
            softdep.on_block_allocated(BufId(1), 500),
            Err(SoftdepError::NeedsFsck)
        ));
    }

    #[test]
    fn test_rejected_write_does_not_poison() {
        let softdep = Softdep::new(SoftdepConfig::default()).unwrap();
        let mut buf = BlockBuf::new(BufId(1), 1, 4096);
        softdep.on_inode_allocated(BufId(1), 41).unwrap();
        let token = softdep.before_buffer_write(&mut buf).unwrap();
        assert!(matches!(
            softdep.on_inode_allocated(BufId(1), 42),
            Err(SoftdepError::WriteInProgress(_))
        ));
        assert!(!softdep.needs_fsck());
        softdep.after_buffer_write(&mut buf, token).unwrap();
        softdep.on_inode_allocated(BufId(1), 42).unwrap();
    }

    #[test]
    fn test_inode_read_with_negative_effective_count_poisons_mount() {
        let softdep = Softdep::new(SoftdepConfig::default()).unwrap();
        let mut ip = InCoreInode::new(50, softdep_core::types::mode::IFREG, 0);
        ip.din.nlink = 2;
        ip.effnlink = 0;
        softdep.on_link_count_changed(&ip).unwrap();

        let mut loaded = InCoreInode::new(50, softdep_core::types::mode::IFREG, 0);
        loaded.din.nlink = 1;
        assert!(matches!(
            softdep.on_inode_buffer_read(&mut loaded),
            Err(SoftdepError::Inconsistency { .. })
        ));
        assert!(softdep.needs_fsck());
    }

    #[test]
    fn test_record_counts() {
        let softdep = Softdep::new(SoftdepConfig::default()).unwrap();
        let token = softdep.on_block_allocated(BufId(7), 900).unwrap();
        let counts = softdep.record_counts();
        assert_eq!(counts.get(&DepKind::Newblk), Some(&1));
        assert_eq!(counts.get(&DepKind::Bmsafemap), Some(&1));
        assert_eq!(softdep.record_state(token).map(|(kind, _)| kind), Some(DepKind::Newblk));
        assert!(!softdep.is_idle().unwrap());
    }
}
