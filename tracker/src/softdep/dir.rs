// Directory entry dependencies
//
// A new entry must not reach disk before the inode it names, and for a new
// directory before both its "."/".." body and the parent's raised link
// count. A removed entry must reach disk before the link count of the inode
// it named is dropped.

use super::arena::DepId;
use super::graph::{unlink, DepGraph};
use super::records::*;
use super::state::DepState;
use softdep_core::{BlockBuf, BufId, InCoreInode, Ino, SoftdepError, WINO};

/// What kind of name a removal or replacement drops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveKind {
    /// A non-directory
    File,
    /// A directory, renamed within its parent or removed
    Directory,
    /// A directory moved under a different parent; the parent link count
    /// does not change, so no ".." follow-up is issued
    DirectoryReparented,
}

impl DepGraph {
    /// Entry for `newinum` added at byte `diroffset` of directory `dp`.
    /// `newdir_buf` is the body block when the entry names a new directory.
    pub fn setup_directory_add(
        &mut self,
        dir_buf: BufId,
        dp: &InCoreInode,
        diroffset: u64,
        newinum: Ino,
        newdir_buf: Option<BufId>,
    ) -> Result<Option<DepId>, SoftdepError> {
        if newinum == WINO {
            return Ok(None);
        }
        self.ensure_not_in_flight(dir_buf)?;
        if let Some(body) = newdir_buf {
            self.ensure_not_in_flight(body)?;
        }
        let lbn = self.geom.lblkno(diroffset);
        let offset = self.geom.blkoff(diroffset);
        let (pagedep, _) = self.pagedep_lookup(dp.ino, lbn, dir_buf)?;

        let mut state = DepState::ATTACHED;
        if newdir_buf.is_some() {
            state |= DepState::MKDIR_BODY | DepState::MKDIR_PARENT;
        } else {
            state |= DepState::DEPCOMPLETE;
        }
        let dap = self.alloc(
            Dep::Diradd(Diradd { offset, newinum, pagedep, previous: None }),
            state,
        );

        if let Some(body) = newdir_buf {
            let mkdir1 = self.alloc(Dep::Mkdir(Mkdir { diradd: dap, buf: Some(body) }), DepState::MKDIR_BODY);
            self.mkdirs.push(mkdir1);
            self.worklist_insert(WorkList::Buf(body), mkdir1)?;

            let parent = self.inodedeps.get(&dp.ino).copied();
            match parent {
                Some(parent) if !self.all_complete(parent)? => {
                    let mkdir2 = self.alloc(Dep::Mkdir(Mkdir { diradd: dap, buf: None }), DepState::MKDIR_PARENT);
                    self.mkdirs.push(mkdir2);
                    self.worklist_insert(WorkList::BufWait(parent), mkdir2)?;
                }
                // The parent's link count is already on disk.
                _ => self.clear_flags(dap, DepState::MKDIR_PARENT)?,
            }
        }

        self.pagedep_mut(pagedep)?.diraddhd[dirhash(offset)].push(dap);
        let (inodedep, _) = self.inodedep_lookup(newinum);
        if self.all_complete(inodedep)? {
            self.diradd_inode_written(dap, inodedep)?;
        } else {
            self.worklist_insert(WorkList::BufWait(inodedep), dap)?;
        }
        log::debug!(
            "softdep: entry {}@{} of dir {} names inode {}",
            lbn, offset, dp.ino, newinum
        );
        Ok(Some(dap))
    }

    /// The inode named by `dap` is durable
    pub fn diradd_inode_written(&mut self, dap: DepId, inodedep: DepId) -> Result<(), SoftdepError> {
        self.set_flags(dap, DepState::COMPLETE)?;
        if self.all_complete(dap)? {
            self.diradd_commit(dap)?;
        }
        self.worklist_insert(WorkList::InodePending(inodedep), dap)
    }

    /// Move an all-complete diradd from its bucket to the page's committed list
    fn diradd_commit(&mut self, dap: DepId) -> Result<(), SoftdepError> {
        let (pagedep, offset) = {
            let d = self.diradd(dap)?;
            (d.pagedep, d.offset)
        };
        let page = self.pagedep_mut(pagedep)?;
        if unlink(&mut page.diraddhd[dirhash(offset)], dap) {
            page.pendinghd.push(dap);
        }
        Ok(())
    }

    /// Remove a diradd from whichever pagedep list holds it
    fn diradd_unlink_page(&mut self, dap: DepId) -> Result<(), SoftdepError> {
        let (pagedep, offset) = {
            let d = self.diradd(dap)?;
            (d.pagedep, d.offset)
        };
        let page = self.pagedep_mut(pagedep)?;
        if !unlink(&mut page.diraddhd[dirhash(offset)], dap) && !unlink(&mut page.pendinghd, dap) {
            return Err(SoftdepError::inconsistency(
                "diradd_unlink_page",
                format!("{} missing from pagedep of dir {}", dap, page.ino),
            ));
        }
        Ok(())
    }

    /// One of the two mkdir preconditions landed
    pub fn handle_written_mkdir(&mut self, mkdir: DepId, kind: DepState) -> Result<(), SoftdepError> {
        if !self.state(mkdir)?.contains(kind) {
            return Err(SoftdepError::inconsistency(
                "handle_written_mkdir",
                format!("{} is not waiting on {:?}", mkdir, kind),
            ));
        }
        let dap = self.mkdir(mkdir)?.diradd;
        self.clear_flags(dap, kind)?;
        if !self.state(dap)?.intersects(DepState::MKDIR_PENDING) {
            self.set_flags(dap, DepState::DEPCOMPLETE)?;
        }
        if self.all_complete(dap)? {
            self.diradd_commit(dap)?;
        }
        unlink(&mut self.mkdirs, mkdir);
        self.worklist_detach(mkdir)?;
        self.free_record(mkdir)?;
        Ok(())
    }

    /// Destroy a diradd whose entry is durable or was cancelled
    pub fn free_diradd(&mut self, dap: DepId) -> Result<(), SoftdepError> {
        self.worklist_detach(dap)?;
        self.diradd_unlink_page(dap)?;
        let state = self.state(dap)?;
        let (pagedep, newinum, previous) = {
            let d = self.diradd(dap)?;
            (d.pagedep, d.newinum, d.previous)
        };
        if state.contains(DepState::DIRCHG) {
            let dirrem = previous.ok_or_else(|| {
                SoftdepError::inconsistency("free_diradd", format!("{} changes an entry without a removal", dap))
            })?;
            let dirino = self.pagedep(pagedep)?.ino;
            self.queue_dirrem(dirrem, dirino)?;
        }
        if let Some(inodedep) = self.inodedeps.get(&newinum).copied() {
            self.free_inodedep(inodedep)?;
        }
        if state.intersects(DepState::MKDIR_PENDING) {
            let mut remaining = state & DepState::MKDIR_PENDING;
            for mkdir in self.mkdirs.clone() {
                if self.mkdir(mkdir)?.diradd != dap {
                    continue;
                }
                remaining.remove(self.state(mkdir)? & DepState::MKDIR_PENDING);
                self.worklist_detach(mkdir)?;
                unlink(&mut self.mkdirs, mkdir);
                self.free_record(mkdir)?;
            }
            if !remaining.is_empty() {
                return Err(SoftdepError::inconsistency(
                    "free_diradd",
                    format!("{} waits on {:?} with no mkdir record", dap, remaining),
                ));
            }
        }
        self.free_record(dap)?;
        Ok(())
    }

    /// Queue a dirrem whose directory block no longer names its inode on disk
    pub fn queue_dirrem(&mut self, dirrem: DepId, dirino: Ino) -> Result<(), SoftdepError> {
        let rem = self.dirrem_mut(dirrem)?;
        rem.dirinum = dirino;
        rem.pagedep = None;
        self.add_to_worklist(dirrem)
    }

    /// Build the dirrem for the entry at `diroffset`, cancelling an
    /// uncommitted diradd for the same slot. Returns the dirrem and, when the
    /// cancelled entry itself replaced an on-disk name, that name's dirrem.
    fn newdirrem(
        &mut self,
        dir_buf: BufId,
        dp: &InCoreInode,
        diroffset: u64,
        oldinum: Ino,
        kind: RemoveKind,
    ) -> Result<(DepId, Option<DepId>), SoftdepError> {
        if oldinum == WINO {
            return Err(SoftdepError::inconsistency("newdirrem", "whiteout entries have no removal"));
        }
        self.ensure_not_in_flight(dir_buf)?;
        self.new_dirrem_count();
        let state = if kind == RemoveKind::File { DepState::empty() } else { DepState::RMDIR };
        let lbn = self.geom.lblkno(diroffset);
        let offset = self.geom.blkoff(diroffset);
        let (pagedep, _) = self.pagedep_lookup(dp.ino, lbn, dir_buf)?;
        let dirrem = self.alloc(
            Dep::Dirrem(Dirrem { oldinum, dirinum: dp.ino, pagedep: Some(pagedep) }),
            state,
        );

        let mut found = None;
        {
            let page = self.pagedep(pagedep)?;
            for dap in page.diraddhd[dirhash(offset)].iter().chain(page.pendinghd.iter()) {
                if self.diradd(*dap)?.offset == offset {
                    found = Some(*dap);
                    break;
                }
            }
        }
        let Some(dap) = found else {
            return Ok((dirrem, None));
        };
        let dstate = self.state(dap)?;
        if !dstate.contains(DepState::ATTACHED) {
            return Err(SoftdepError::inconsistency("newdirrem", format!("{} not attached", dap)));
        }
        let newinum = self.diradd(dap)?.newinum;
        if newinum != oldinum {
            return Err(SoftdepError::inconsistency(
                "newdirrem",
                format!("entry names inode {} not {}", newinum, oldinum),
            ));
        }
        let mut prev = None;
        if dstate.contains(DepState::DIRCHG) {
            prev = self.diradd_mut(dap)?.previous.take();
            self.clear_flags(dap, DepState::DIRCHG)?;
        }
        // The entry never reached disk, so its inode can be released at once.
        self.set_flags(dirrem, DepState::COMPLETE)?;
        self.free_diradd(dap)?;
        Ok((dirrem, prev))
    }

    /// Entry at `diroffset` naming `oldinum` removed from directory `dp`
    pub fn setup_remove(
        &mut self,
        dir_buf: BufId,
        dp: &InCoreInode,
        diroffset: u64,
        oldinum: Ino,
        is_dir: bool,
    ) -> Result<DepId, SoftdepError> {
        let kind = if is_dir { RemoveKind::Directory } else { RemoveKind::File };
        let (dirrem, prev) = self.newdirrem(dir_buf, dp, diroffset, oldinum, kind)?;
        let pagedep = self.dirrem(dirrem)?.pagedep.ok_or_else(|| {
            SoftdepError::inconsistency("setup_remove", format!("{} has no page", dirrem))
        })?;
        if !self.state(dirrem)?.contains(DepState::COMPLETE) {
            self.pagedep_mut(pagedep)?.dirremhd.push(dirrem);
        } else {
            // The name on disk is still the one the cancelled entry replaced.
            if let Some(prev) = prev {
                self.pagedep_mut(pagedep)?.dirremhd.push(prev);
                self.dirrem_mut(prev)?.pagedep = Some(pagedep);
            }
            self.queue_dirrem(dirrem, dp.ino)?;
        }
        Ok(dirrem)
    }

    /// Entry at `diroffset` changed from `oldinum` to `newinum` (rename over)
    #[allow(clippy::too_many_arguments)]
    pub fn setup_directory_change(
        &mut self,
        dir_buf: BufId,
        dp: &InCoreInode,
        diroffset: u64,
        oldinum: Ino,
        newinum: Ino,
        kind: RemoveKind,
    ) -> Result<DepId, SoftdepError> {
        let offset = self.geom.blkoff(diroffset);
        let (dirrem, prev) = self.newdirrem(dir_buf, dp, diroffset, oldinum, kind)?;
        let pagedep = self.dirrem(dirrem)?.pagedep.ok_or_else(|| {
            SoftdepError::inconsistency("setup_directory_change", format!("{} has no page", dirrem))
        })?;
        if kind == RemoveKind::DirectoryReparented {
            self.set_flags(dirrem, DepState::DIRCHG)?;
        }
        let removed_complete = self.state(dirrem)?.contains(DepState::COMPLETE);

        if newinum == WINO {
            if removed_complete {
                if let Some(prev) = prev {
                    self.pagedep_mut(pagedep)?.dirremhd.push(prev);
                    self.dirrem_mut(prev)?.pagedep = Some(pagedep);
                }
                self.queue_dirrem(dirrem, dp.ino)?;
            } else {
                self.pagedep_mut(pagedep)?.dirremhd.push(dirrem);
            }
            return Ok(dirrem);
        }

        let dap = self.alloc(
            Dep::Diradd(Diradd { offset, newinum, pagedep, previous: None }),
            DepState::DIRCHG | DepState::ATTACHED | DepState::DEPCOMPLETE,
        );
        if !removed_complete {
            // Roll back to the old name until the new inode is durable.
            self.diradd_mut(dap)?.previous = Some(dirrem);
        } else {
            match prev {
                Some(prev) => {
                    self.diradd_mut(dap)?.previous = Some(prev);
                    self.dirrem_mut(prev)?.pagedep = Some(pagedep);
                }
                None => self.clear_flags(dap, DepState::DIRCHG)?,
            }
            self.queue_dirrem(dirrem, dp.ino)?;
        }

        let (inodedep, created) = self.inodedep_lookup(newinum);
        if created || self.all_complete(inodedep)? {
            self.set_flags(dap, DepState::COMPLETE)?;
            self.pagedep_mut(pagedep)?.pendinghd.push(dap);
            self.worklist_insert(WorkList::InodePending(inodedep), dap)?;
        } else {
            self.pagedep_mut(pagedep)?.diraddhd[dirhash(offset)].push(dap);
            self.worklist_insert(WorkList::BufWait(inodedep), dap)?;
        }
        log::debug!(
            "softdep: entry at {} of dir {} changed {} -> {}",
            diroffset, dp.ino, oldinum, newinum
        );
        Ok(dap)
    }

    /// An entry is moved within its block while compacting; keep the
    /// diradd keyed by its new offset and move the bytes
    pub fn change_directoryentry_offset(
        &mut self,
        dp: &InCoreInode,
        dir_buf: &mut BlockBuf,
        lbn: u64,
        oldoffset: usize,
        newoffset: usize,
        entrysize: usize,
    ) -> Result<(), SoftdepError> {
        self.ensure_not_in_flight(dir_buf.id)?;
        let len = dir_buf.data.len();
        if oldoffset.max(newoffset) + entrysize > len {
            return Err(SoftdepError::inconsistency(
                "change_directoryentry_offset",
                format!("entry of {} bytes at {} -> {} overruns block", entrysize, oldoffset, newoffset),
            ));
        }
        if let Some(pagedep) = self.pagedeps.get(&(dp.ino, lbn)).copied() {
            let mut moved = false;
            for dap in self.pagedep(pagedep)?.diraddhd[dirhash(oldoffset)].clone() {
                if self.diradd(dap)?.offset != oldoffset {
                    continue;
                }
                self.diradd_mut(dap)?.offset = newoffset;
                if dirhash(newoffset) != dirhash(oldoffset) {
                    let page = self.pagedep_mut(pagedep)?;
                    unlink(&mut page.diraddhd[dirhash(oldoffset)], dap);
                    page.diraddhd[dirhash(newoffset)].push(dap);
                }
                moved = true;
                break;
            }
            if !moved {
                for dap in self.pagedep(pagedep)?.pendinghd.clone() {
                    if self.diradd(dap)?.offset == oldoffset {
                        self.diradd_mut(dap)?.offset = newoffset;
                        break;
                    }
                }
            }
        }
        dir_buf.data.copy_within(oldoffset..oldoffset + entrysize, newoffset);
        Ok(())
    }

    /// The in-core link count of `ip` changed
    pub fn change_linkcnt(&mut self, ip: &InCoreInode) -> Result<(), SoftdepError> {
        if ip.din.nlink < ip.effnlink {
            return Err(SoftdepError::inconsistency(
                "change_linkcnt",
                format!("inode {} nlink {} below effective {}", ip.ino, ip.din.nlink, ip.effnlink),
            ));
        }
        let (inodedep, _) = self.inodedep_lookup(ip.ino);
        let dep = self.inodedep_mut(inodedep)?;
        dep.nlinkdelta = ip.din.nlink as i32 - ip.effnlink as i32;
        dep.unwritten = true;
        Ok(())
    }

    /// The inode now claims the new directory block on disk
    pub fn free_newdirblk(&mut self, ndb: DepId) -> Result<(), SoftdepError> {
        self.worklist_detach(ndb)?;
        let pagedep = self.newdirblk(ndb)?.pagedep;
        self.free_record(ndb)?;
        if self.arena.get(pagedep).is_none() {
            // The page was dismantled by a truncate.
            return Ok(());
        }
        self.clear_flags(pagedep, DepState::NEWBLOCK)?;
        if self.rec(pagedep)?.on.is_none() {
            // The block is not awaiting a write, so committed entries are on disk.
            for dap in self.pagedep(pagedep)?.pendinghd.clone() {
                self.free_diradd(dap)?;
            }
            if self.pagedep(pagedep)?.is_idle() {
                self.free_record(pagedep)?;
            }
        }
        Ok(())
    }
}
