// Buffer write interception
//
// No constraint is placed on when a buffer may be written. Instead, just
// before the write every change whose prerequisites are not yet on disk is
// undone in the buffer, and redone once the write has completed.

use super::arena::DepId;
use super::graph::DepGraph;
use super::records::*;
use super::state::DepState;
use softdep_core::layout::{dirent_ino, set_dirent_ino};
use softdep_core::{BlockBuf, BufId, Ino, SoftdepError};

/// Handed out by `before_buffer_write`; must accompany the completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackToken {
    pub buf: BufId,
    pub seq: u64,
    /// Fields rolled back for this write
    pub rollbacks: u64,
}

/// What the buffer cache must do after a completed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOutcome {
    /// The buffer holds changes that did not reach disk
    pub redirty: bool,
}

impl DepGraph {
    pub fn before_buffer_write(&mut self, buf: &mut BlockBuf) -> Result<RollbackToken, SoftdepError> {
        if self.in_flight.contains_key(&buf.id) {
            return Err(SoftdepError::WriteInProgress(buf.id));
        }
        let deps = self.buf_deps.get(&buf.id).cloned().unwrap_or_default();
        let mut rollbacks = 0;
        for id in deps {
            match self.kind(id)? {
                DepKind::Pagedep => rollbacks += self.initiate_write_filepage(id, buf)?,
                DepKind::Inodedep => rollbacks += self.initiate_write_inodeblock(id, buf)?,
                DepKind::Indirdep => rollbacks += self.initiate_write_indirdep(id, buf)?,
                DepKind::Mkdir | DepKind::Bmsafemap | DepKind::Allocdirect | DepKind::Allocindir => {}
                other => {
                    return Err(SoftdepError::inconsistency(
                        "before_buffer_write",
                        format!("unexpected {} on {}", other, buf.id),
                    ))
                }
            }
        }
        self.write_seq += 1;
        self.in_flight.insert(buf.id, self.write_seq);
        self.stats.writes_started += 1;
        if rollbacks > 0 {
            log::debug!("softdep: {} written with {} fields rolled back", buf.id, rollbacks);
        }
        Ok(RollbackToken { buf: buf.id, seq: self.write_seq, rollbacks })
    }

    fn check_token(&self, buf: &BlockBuf, token: &RollbackToken) -> Result<(), SoftdepError> {
        if token.buf != buf.id || self.in_flight.get(&buf.id) != Some(&token.seq) {
            return Err(SoftdepError::NoWriteInProgress(buf.id));
        }
        Ok(())
    }

    pub fn after_buffer_write(&mut self, buf: &mut BlockBuf, token: RollbackToken) -> Result<WriteOutcome, SoftdepError> {
        self.check_token(buf, &token)?;
        self.in_flight.remove(&buf.id);
        buf.dirty = false;

        let mut reattach = Vec::new();
        for id in self.take_buf_deps(buf.id)? {
            match self.kind(id)? {
                DepKind::Pagedep => {
                    if self.handle_written_filepage(id, buf)? {
                        reattach.push(id);
                    }
                }
                DepKind::Inodedep => {
                    if self.handle_written_inodeblock(id, buf)? {
                        reattach.push(id);
                    }
                }
                DepKind::Indirdep => {
                    if self.handle_written_indirdep(id, buf)? {
                        reattach.push(id);
                    }
                }
                DepKind::Bmsafemap => self.handle_written_bmsafemap(id)?,
                DepKind::Mkdir => self.handle_written_mkdir(id, DepState::MKDIR_BODY)?,
                DepKind::Allocdirect => {
                    self.set_flags(id, DepState::COMPLETE)?;
                    self.handle_allocdirect_partdone(id)?;
                }
                DepKind::Allocindir => {
                    self.set_flags(id, DepState::COMPLETE)?;
                    self.handle_allocindir_partdone(id)?;
                }
                other => {
                    return Err(SoftdepError::inconsistency(
                        "after_buffer_write",
                        format!("unexpected {} on {}", other, buf.id),
                    ))
                }
            }
        }
        for id in reattach {
            if self.arena.get(id).is_some() && self.rec(id)?.on.is_none() {
                self.worklist_insert(WorkList::Buf(buf.id), id)?;
            }
        }
        self.stats.writes_completed += 1;
        Ok(WriteOutcome { redirty: buf.dirty })
    }

    /// The write failed. Every rollback is undone without granting any
    /// completion, and the error is recorded against the inodes involved.
    pub fn abort_buffer_write(
        &mut self,
        buf: &mut BlockBuf,
        token: RollbackToken,
        error: &str,
    ) -> Result<Vec<Ino>, SoftdepError> {
        self.check_token(buf, &token)?;
        self.in_flight.remove(&buf.id);

        let mut inos = Vec::new();
        let deps = self.buf_deps.get(&buf.id).cloned().unwrap_or_default();
        for id in deps {
            match self.kind(id)? {
                DepKind::Pagedep => {
                    self.clear_flags(id, DepState::IOSTARTED)?;
                    self.roll_forward_filepage(id, buf)?;
                    inos.push(self.pagedep(id)?.ino);
                }
                DepKind::Inodedep => inos.push(self.abort_write_inodeblock(id, buf)?),
                DepKind::Indirdep => {
                    self.abort_write_indirdep(id, buf)?;
                    inos.push(self.indirdep(id)?.ino);
                }
                DepKind::Allocdirect => {
                    let inodedep = self.allocdirect(id)?.inodedep;
                    inos.push(self.inodedep(inodedep)?.ino);
                }
                DepKind::Allocindir => {
                    if let Some(ind) = self.allocindir(id)?.indirdep {
                        inos.push(self.indirdep(ind)?.ino);
                    }
                }
                DepKind::Mkdir => {
                    let dap = self.mkdir(id)?.diradd;
                    inos.push(self.diradd(dap)?.newinum);
                }
                DepKind::Bmsafemap => {
                    let map = self.bmsafemap(id)?;
                    for inodedep in &map.inodedephd {
                        inos.push(self.inodedep(*inodedep)?.ino);
                    }
                    for adp in &map.allocdirecthd {
                        let inodedep = self.allocdirect(*adp)?.inodedep;
                        inos.push(self.inodedep(inodedep)?.ino);
                    }
                }
                _ => {}
            }
        }
        inos.sort_unstable();
        inos.dedup();
        for ino in &inos {
            self.io_errors.insert(*ino, error.to_string());
        }
        buf.dirty = true;
        self.stats.writes_aborted += 1;
        log::warn!("softdep: write of {} failed ({}), inodes affected: {:?}", buf.id, error, inos);
        Ok(inos)
    }

    /// Roll back every uncommitted entry of a directory page
    fn initiate_write_filepage(&mut self, pagedep: DepId, buf: &mut BlockBuf) -> Result<u64, SoftdepError> {
        if self.state(pagedep)?.contains(DepState::IOSTARTED) {
            return Err(SoftdepError::inconsistency(
                "initiate_write_filepage",
                format!("{} already being written", pagedep),
            ));
        }
        self.set_flags(pagedep, DepState::IOSTARTED)?;
        let mut count = 0;
        for bucket in 0..DAHASHSZ {
            for dap in self.pagedep(pagedep)?.diraddhd[bucket].clone() {
                let (offset, newinum, previous) = {
                    let d = self.diradd(dap)?;
                    (d.offset, d.newinum, d.previous)
                };
                let on_page = dirent_ino(&buf.data, offset)?;
                if on_page != newinum {
                    return Err(SoftdepError::inconsistency(
                        "initiate_write_filepage",
                        format!("entry at {} of {} holds {} not {}", offset, buf.id, on_page, newinum),
                    ));
                }
                let safe = if self.state(dap)?.contains(DepState::DIRCHG) {
                    let rem = previous.ok_or_else(|| {
                        SoftdepError::inconsistency("initiate_write_filepage", format!("{} lost its removal", dap))
                    })?;
                    self.dirrem(rem)?.oldinum
                } else {
                    0
                };
                set_dirent_ino(&mut buf.data, offset, safe)?;
                self.clear_flags(dap, DepState::ATTACHED)?;
                self.set_flags(dap, DepState::UNDONE)?;
                count += 1;
            }
        }
        self.stats.dirent_rollbacks += count;
        Ok(count)
    }

    /// Put uncommitted entries back. Returns whether any were restored.
    fn roll_forward_filepage(&mut self, pagedep: DepId, buf: &mut BlockBuf) -> Result<bool, SoftdepError> {
        let mut changed = false;
        for bucket in 0..DAHASHSZ {
            for dap in self.pagedep(pagedep)?.diraddhd[bucket].clone() {
                if self.state(dap)?.contains(DepState::ATTACHED) {
                    return Err(SoftdepError::inconsistency(
                        "handle_written_filepage",
                        format!("{} was not rolled back", dap),
                    ));
                }
                let (offset, newinum) = {
                    let d = self.diradd(dap)?;
                    (d.offset, d.newinum)
                };
                set_dirent_ino(&mut buf.data, offset, newinum)?;
                self.clear_flags(dap, DepState::UNDONE)?;
                self.set_flags(dap, DepState::ATTACHED)?;
                changed = true;
            }
        }
        Ok(changed)
    }

    fn handle_written_filepage(&mut self, pagedep: DepId, buf: &mut BlockBuf) -> Result<bool, SoftdepError> {
        if !self.state(pagedep)?.contains(DepState::IOSTARTED) {
            return Err(SoftdepError::inconsistency(
                "handle_written_filepage",
                format!("{} write was never started", pagedep),
            ));
        }
        self.clear_flags(pagedep, DepState::IOSTARTED)?;
        let dirino = self.pagedep(pagedep)?.ino;

        for dirrem in std::mem::take(&mut self.pagedep_mut(pagedep)?.dirremhd) {
            self.queue_dirrem(dirrem, dirino)?;
        }
        // Entries in a block the directory does not yet claim stay tracked
        // until the block pointer is durable.
        let newblock = self.state(pagedep)?.contains(DepState::NEWBLOCK);
        if !newblock {
            for dap in self.pagedep(pagedep)?.pendinghd.clone() {
                self.free_diradd(dap)?;
            }
        }
        let changed = self.roll_forward_filepage(pagedep, buf)?;
        for bucket in 0..DAHASHSZ {
            for dap in self.pagedep(pagedep)?.diraddhd[bucket].clone() {
                if self.all_complete(dap)? {
                    let page = self.pagedep_mut(pagedep)?;
                    super::graph::unlink(&mut page.diraddhd[bucket], dap);
                    page.pendinghd.push(dap);
                }
            }
        }
        if changed {
            buf.dirty = true;
            return Ok(true);
        }
        if !newblock && self.pagedep(pagedep)?.is_idle() {
            self.free_record(pagedep)?;
        }
        Ok(false)
    }

    /// Substitute the safe copy of an indirect block for the write
    fn initiate_write_indirdep(&mut self, indirdep: DepId, buf: &mut BlockBuf) -> Result<u64, SoftdepError> {
        let state = self.state(indirdep)?;
        if state.contains(DepState::GOINGAWAY) {
            return Err(SoftdepError::inconsistency(
                "initiate_write_indirdep",
                format!("{} belongs to a truncated file", indirdep),
            ));
        }
        let dep = self.indirdep_mut(indirdep)?;
        let frees = std::mem::take(&mut dep.freefrags);
        dep.freefrags_writing.extend(frees);
        if dep.deplisthd.is_empty() {
            // The live copy holds only durable pointers.
            if dep.freefrags_writing.is_empty() {
                self.worklist_remove(indirdep)?;
                self.free_record(indirdep)?;
            }
            return Ok(0);
        }
        if dep.safe_copy.len() != buf.data.len() {
            return Err(SoftdepError::inconsistency(
                "initiate_write_indirdep",
                format!("safe copy of {} bytes for {} byte {}", dep.safe_copy.len(), buf.data.len(), buf.id),
            ));
        }
        dep.saved_live = Some(std::mem::replace(&mut buf.data, dep.safe_copy.clone()));
        self.clear_flags(indirdep, DepState::ATTACHED)?;
        self.set_flags(indirdep, DepState::UNDONE)?;
        self.stats.indirect_rollbacks += 1;
        Ok(1)
    }

    /// Bring back the live copy after the safe copy was written
    fn restore_indirdep(&mut self, indirdep: DepId, buf: &mut BlockBuf) -> Result<(), SoftdepError> {
        if !self.state(indirdep)?.contains(DepState::UNDONE) {
            return Ok(());
        }
        let live = self.indirdep_mut(indirdep)?.saved_live.take().ok_or_else(|| {
            SoftdepError::inconsistency("restore_indirdep", format!("{} lost its live copy", indirdep))
        })?;
        buf.data = live;
        self.clear_flags(indirdep, DepState::UNDONE)?;
        self.set_flags(indirdep, DepState::ATTACHED)?;
        for aip in self.indirdep(indirdep)?.donehd.clone() {
            self.handle_allocindir_partdone(aip)?;
            if self.indirdep(indirdep)?.donehd.contains(&aip) {
                return Err(SoftdepError::inconsistency(
                    "restore_indirdep",
                    format!("{} still parked after the write", aip),
                ));
            }
        }
        buf.dirty = true;
        Ok(())
    }

    fn handle_written_indirdep(&mut self, indirdep: DepId, buf: &mut BlockBuf) -> Result<bool, SoftdepError> {
        if self.state(indirdep)?.contains(DepState::GOINGAWAY) {
            return Err(SoftdepError::inconsistency(
                "handle_written_indirdep",
                format!("{} belongs to a truncated file", indirdep),
            ));
        }
        self.restore_indirdep(indirdep, buf)?;
        // The pointers that replaced these blocks are now on disk.
        for ff in std::mem::take(&mut self.indirdep_mut(indirdep)?.freefrags_writing) {
            self.add_to_worklist(ff)?;
        }
        let dep = self.indirdep(indirdep)?;
        if dep.deplisthd.is_empty() && dep.donehd.is_empty() && dep.freefrags.is_empty() {
            self.free_record(indirdep)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn abort_write_indirdep(&mut self, indirdep: DepId, buf: &mut BlockBuf) -> Result<(), SoftdepError> {
        self.restore_indirdep(indirdep, buf)?;
        let dep = self.indirdep_mut(indirdep)?;
        let writing = std::mem::take(&mut dep.freefrags_writing);
        let later = std::mem::replace(&mut dep.freefrags, writing);
        dep.freefrags.extend(later);
        Ok(())
    }

    /// A bitmap write landed: everything allocated from it is durable
    fn handle_written_bmsafemap(&mut self, bm: DepId) -> Result<(), SoftdepError> {
        let (newblks, adps, aips, inodedeps) = {
            let map = self.bmsafemap_mut(bm)?;
            (
                std::mem::take(&mut map.newblkhd),
                std::mem::take(&mut map.allocdirecthd),
                std::mem::take(&mut map.allocindirhd),
                std::mem::take(&mut map.inodedephd),
            )
        };
        for nb in newblks {
            self.set_flags(nb, DepState::DEPCOMPLETE)?;
            self.newblk_mut(nb)?.bmsafemap = None;
        }
        for adp in adps {
            self.set_flags(adp, DepState::DEPCOMPLETE)?;
            self.allocdirect_mut(adp)?.bmsafemap = None;
            self.handle_allocdirect_partdone(adp)?;
        }
        for aip in aips {
            self.set_flags(aip, DepState::DEPCOMPLETE)?;
            self.allocindir_mut(aip)?.bmsafemap = None;
            self.handle_allocindir_partdone(aip)?;
        }
        for inodedep in inodedeps {
            self.set_flags(inodedep, DepState::DEPCOMPLETE)?;
            self.inodedep_mut(inodedep)?.bmsafemap = None;
        }
        self.free_record(bm)?;
        Ok(())
    }

    pub fn take_io_error(&mut self, ino: Ino) -> Option<String> {
        self.io_errors.remove(&ino)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use softdep_core::layout::indirect_ptr;
    use softdep_core::types::mode;
    use softdep_core::{Geometry, InCoreInode};

    fn graph() -> DepGraph {
        DepGraph::new(Geometry::new(4096, 1024), 1000)
    }

    fn dir(ino: Ino) -> InCoreInode {
        let mut ip = InCoreInode::new(ino, mode::IFDIR | 0o755, 0);
        ip.din.nlink = 2;
        ip.effnlink = 2;
        ip
    }

    #[test]
    fn test_second_write_rejected() {
        let mut g = graph();
        let mut buf = BlockBuf::new(BufId(4), 4, 4096);
        let token = g.before_buffer_write(&mut buf).unwrap();
        assert!(matches!(g.before_buffer_write(&mut buf), Err(SoftdepError::WriteInProgress(_))));
        g.after_buffer_write(&mut buf, token).unwrap();
        assert!(matches!(g.after_buffer_write(&mut buf, token), Err(SoftdepError::NoWriteInProgress(_))));
    }

    #[test]
    fn test_uncommitted_entry_written_as_empty() {
        let mut g = graph();
        let parent = dir(2);
        g.setup_inomapdep(BufId(1), 50).unwrap();
        let mut page = BlockBuf::new(BufId(60), 60, 4096);
        set_dirent_ino(&mut page.data, 32, 50).unwrap();
        let dap = g.setup_directory_add(page.id, &parent, 32, 50, None).unwrap().unwrap();

        let token = g.before_buffer_write(&mut page).unwrap();
        assert_eq!(token.rollbacks, 1);
        assert_eq!(dirent_ino(&page.data, 32).unwrap(), 0);
        assert!(g.state(dap).unwrap().contains(DepState::UNDONE));

        let outcome = g.after_buffer_write(&mut page, token).unwrap();
        assert!(outcome.redirty);
        assert_eq!(dirent_ino(&page.data, 32).unwrap(), 50);
        assert!(g.state(dap).unwrap().contains(DepState::ATTACHED));
        assert_eq!(g.find_on_buf(page.id, DepKind::Pagedep).unwrap(), Some(g.pagedeps[&(2, 0)]));
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let mut g = graph();
        let parent = dir(2);
        g.setup_inomapdep(BufId(1), 51).unwrap();
        let mut page = BlockBuf::new(BufId(61), 61, 4096);
        set_dirent_ino(&mut page.data, 0, 51).unwrap();
        g.setup_directory_add(page.id, &parent, 0, 51, None).unwrap();

        let token = g.before_buffer_write(&mut page).unwrap();
        let first = page.data.clone();
        g.abort_buffer_write(&mut page, token, "media error").unwrap();
        let token = g.before_buffer_write(&mut page).unwrap();
        assert_eq!(page.data, first);
        g.after_buffer_write(&mut page, token).unwrap();
        assert_eq!(g.take_io_error(2).as_deref(), Some("media error"));
        assert_eq!(g.take_io_error(2), None);
    }

    #[test]
    fn test_bitmap_write_completes_allocations() {
        let mut g = graph();
        let ip = InCoreInode::new(70, mode::IFREG | 0o644, 0);
        let inodedep = g.setup_inomapdep(BufId(1), 70).unwrap();
        g.setup_blkmapdep(BufId(1), 900).unwrap();
        let adp = g
            .setup_allocdirect(&ip, 0, 900, 0, 4096, 0, BufId(900), super::super::alloc::PtrArea::Data)
            .unwrap();

        let mut bitmap = BlockBuf::new(BufId(1), 1, 4096);
        let token = g.before_buffer_write(&mut bitmap).unwrap();
        g.after_buffer_write(&mut bitmap, token).unwrap();
        assert!(g.state(adp).unwrap().contains(DepState::DEPCOMPLETE));
        assert!(g.state(inodedep).unwrap().contains(DepState::DEPCOMPLETE));
        assert!(g.bmsafemaps.is_empty());
    }

    #[test]
    fn test_indirect_block_written_from_safe_copy() {
        let mut g = graph();
        let ip = InCoreInode::new(71, mode::IFREG | 0o644, 0);
        let mut indir = BlockBuf::new(BufId(300), 300, 4096);
        g.setup_blkmapdep(BufId(1), 301).unwrap();
        g.setup_allocindir_page(&ip, &indir, 5, 301, 0, BufId(301)).unwrap();
        softdep_core::layout::set_indirect_ptr(&mut indir.data, 5, 301).unwrap();

        let token = g.before_buffer_write(&mut indir).unwrap();
        assert_eq!(indirect_ptr(&indir.data, 5).unwrap(), 0);
        let outcome = g.after_buffer_write(&mut indir, token).unwrap();
        assert_eq!(indirect_ptr(&indir.data, 5).unwrap(), 301);
        assert!(outcome.redirty);
        assert!(g.find_on_buf(indir.id, DepKind::Indirdep).unwrap().is_some());
    }

    #[test]
    fn test_repeated_writes_produce_same_image() {
        let mut g = graph();
        let parent = dir(2);
        g.setup_inomapdep(BufId(1), 52).unwrap();
        let mut page = BlockBuf::new(BufId(62), 62, 4096);
        set_dirent_ino(&mut page.data, 64, 52).unwrap();
        let dap = g.setup_directory_add(page.id, &parent, 64, 52, None).unwrap().unwrap();

        let token = g.before_buffer_write(&mut page).unwrap();
        let first = page.data.clone();
        assert!(g.after_buffer_write(&mut page, token).unwrap().redirty);
        let state = g.state(dap).unwrap();

        let token = g.before_buffer_write(&mut page).unwrap();
        assert_eq!(token.rollbacks, 1);
        assert_eq!(page.data, first);
        assert!(g.after_buffer_write(&mut page, token).unwrap().redirty);
        assert_eq!(dirent_ino(&page.data, 64).unwrap(), 52);
        assert_eq!(g.state(dap).unwrap(), state);
        assert_eq!(g.stats.dirent_rollbacks, 2);
    }

    #[test]
    fn test_completion_flags_survive_later_writes() {
        let mut g = graph();
        let mut ip = InCoreInode::new(72, mode::IFREG | 0o644, 0);
        ip.din.nlink = 1;
        ip.effnlink = 1;
        let inodedep = g.setup_inomapdep(BufId(1), 72).unwrap();
        g.setup_blkmapdep(BufId(1), 904).unwrap();
        let adp = g
            .setup_allocdirect(&ip, 0, 904, 0, 4096, 0, BufId(904), super::super::alloc::PtrArea::Data)
            .unwrap();
        ip.din.db[0] = 904;
        ip.din.size = 4096;
        let mut bitmap = BlockBuf::new(BufId(1), 1, 4096);
        let token = g.before_buffer_write(&mut bitmap).unwrap();
        g.after_buffer_write(&mut bitmap, token).unwrap();

        // The data block is still unwritten, so every inode write holds the
        // pointer back.
        let mut inodes = BlockBuf::new(BufId(3), 3, 4096);
        g.update_inodeblock(&ip, &mut inodes, false).unwrap();
        let token = g.before_buffer_write(&mut inodes).unwrap();
        assert_eq!(token.rollbacks, 1);
        g.abort_buffer_write(&mut inodes, token, "timeout").unwrap();
        assert!(g.state(adp).unwrap().contains(DepState::DEPCOMPLETE));
        assert!(g.state(inodedep).unwrap().contains(DepState::DEPCOMPLETE));

        let token = g.before_buffer_write(&mut inodes).unwrap();
        g.after_buffer_write(&mut inodes, token).unwrap();
        let done = DepState::COMPLETE | DepState::DEPCOMPLETE;
        assert!(g.state(inodedep).unwrap().contains(done));
        assert!(g.state(adp).unwrap().contains(DepState::DEPCOMPLETE));

        let token = g.before_buffer_write(&mut inodes).unwrap();
        g.abort_buffer_write(&mut inodes, token, "timeout").unwrap();
        assert!(g.state(inodedep).unwrap().contains(done));
        assert!(g.state(adp).unwrap().contains(DepState::DEPCOMPLETE));
        assert!(matches!(
            g.clear_flags(inodedep, DepState::COMPLETE),
            Err(SoftdepError::Inconsistency { .. })
        ));
    }
}
