// Truncation and inode release
//
// A file's blocks and the inode itself may only be handed back to the
// allocator once the zeroed inode no longer naming them is on disk.

use super::alloc::PtrArea;
use super::arena::DepId;
use super::graph::DepGraph;
use super::records::*;
use super::state::DepState;
use softdep_core::layout::DINODE_SIZE;
use softdep_core::{BlockBuf, BlockNo, InCoreInode, Ino, SoftdepError};

impl DepGraph {
    /// Truncate `ip` to `length` (only zero is supported). The zeroed inode
    /// is copied into `inode_buf`; the file's cached dirty buffers lose
    /// their dependencies and should be discarded by the caller.
    pub fn setup_freeblocks(
        &mut self,
        ip: &mut InCoreInode,
        inode_buf: &mut BlockBuf,
        dirty_bufs: &mut [BlockBuf],
        length: u64,
    ) -> Result<DepId, SoftdepError> {
        if length != 0 {
            return Err(SoftdepError::NotSupported(format!(
                "truncate of inode {} to {} bytes",
                ip.ino, length
            )));
        }
        self.ensure_not_in_flight(inode_buf.id)?;
        for buf in dirty_bufs.iter() {
            self.ensure_not_in_flight(buf.id)?;
        }
        let offset = self.geom.dinode_offset(ip.ino);
        if offset + DINODE_SIZE > inode_buf.data.len() {
            return Err(SoftdepError::inconsistency(
                "setup_freeblocks",
                format!("inode {} outside {}", ip.ino, inode_buf.id),
            ));
        }

        let din = &mut ip.din;
        let freeblks = Freeblks {
            ino: ip.ino,
            uid: din.uid,
            oldsize: din.size,
            oldextsize: din.extsize,
            chkcnt: din.blocks,
            dblks: std::mem::take(&mut din.db),
            iblks: std::mem::take(&mut din.ib),
            extblks: std::mem::take(&mut din.extb),
        };
        din.blocks = 0;
        din.size = 0;
        din.extsize = 0;
        din.encode_into(&mut inode_buf.data[offset..offset + DINODE_SIZE])?;
        inode_buf.dirty = true;

        let chkcnt = freeblks.chkcnt;
        let fb = self.alloc(Dep::Freeblks(freeblks), DepState::ATTACHED | DepState::SPACECOUNTED);
        self.stats.pending_free_frags += chkcnt;

        let (inodedep, _) = self.inodedep_lookup(ip.ino);
        if self.state(inodedep)?.contains(DepState::IOSTARTED) {
            return Err(SoftdepError::inconsistency(
                "setup_freeblocks",
                format!("inode {} busy", ip.ino),
            ));
        }
        // Pending allocations are obsolete. Until the inode bitmap is durable
        // nothing on disk names the old blocks.
        let delay = self.state(inodedep)?.contains(DepState::DEPCOMPLETE);
        for area in [PtrArea::Data, PtrArea::Ext] {
            self.merge_inode_lists(inodedep, area)?;
            while let Some(adp) = self.adp_list(inodedep, area, true)?.first().copied() {
                self.free_allocdirect(adp, delay)?;
            }
        }

        self.inodedep_mut(inodedep)?.unwritten = true;
        if self.rec(inodedep)?.on.is_none() {
            self.worklist_insert(WorkList::Buf(inode_buf.id), inodedep)?;
        }
        for id in std::mem::take(&mut self.inodedep_mut(inodedep)?.inowait) {
            let rec = self.rec_mut(id)?;
            rec.on = None;
            rec.state.remove(DepState::ONWORKLIST);
            self.worklist_insert(WorkList::BufWait(inodedep), id)?;
        }

        for buf in dirty_bufs.iter_mut() {
            self.deallocate_dependencies(buf, Some(inodedep))?;
        }

        if delay {
            self.worklist_insert(WorkList::BufWait(inodedep), fb)?;
        } else {
            self.add_to_worklist(fb)?;
        }
        log::debug!(
            "softdep: inode {} truncated, {} fragments to release{}",
            ip.ino,
            chkcnt,
            if delay { " after inode write" } else { "" }
        );
        Ok(fb)
    }

    /// Strip the dependencies of a buffer whose contents will never reach
    /// disk because its file was truncated
    pub fn deallocate_dependencies(&mut self, buf: &mut BlockBuf, inodedep: Option<DepId>) -> Result<(), SoftdepError> {
        self.ensure_not_in_flight(buf.id)?;
        for id in self.take_buf_deps(buf.id)? {
            match self.kind(id)? {
                DepKind::Indirdep => {
                    if self.state(id)?.contains(DepState::GOINGAWAY) {
                        return Err(SoftdepError::inconsistency(
                            "deallocate_dependencies",
                            format!("{} already going away", id),
                        ));
                    }
                    self.set_flags(id, DepState::GOINGAWAY)?;
                    for aip in self.indirdep(id)?.deplisthd.clone() {
                        self.free_allocindir(aip, inodedep)?;
                    }
                    let frees = std::mem::take(&mut self.indirdep_mut(id)?.freefrags);
                    for ff in frees {
                        match inodedep {
                            Some(owner) => self.worklist_insert(WorkList::BufWait(owner), ff)?,
                            None => self.add_to_worklist(ff)?,
                        }
                    }
                    // The live pointers are what the block release must walk.
                    let dep = self.indirdep_mut(id)?;
                    dep.safe_copy = buf.data.clone();
                    let blkno = dep.blkno;
                    self.going_away.insert(blkno, id);
                }
                DepKind::Pagedep => {
                    let (dirino, lists) = {
                        let page = self.pagedep(id)?;
                        let mut daps: Vec<DepId> = page.diraddhd.iter().flatten().copied().collect();
                        daps.extend(page.pendinghd.iter().copied());
                        (page.ino, daps)
                    };
                    for dap in lists {
                        self.free_diradd(dap)?;
                    }
                    let queue_now = match inodedep {
                        None => true,
                        Some(owner) => self.all_complete(owner)?,
                    };
                    for dirrem in std::mem::take(&mut self.pagedep_mut(id)?.dirremhd) {
                        {
                            let rem = self.dirrem_mut(dirrem)?;
                            rem.dirinum = dirino;
                            rem.pagedep = None;
                        }
                        match inodedep {
                            Some(owner) if !queue_now => self.worklist_insert(WorkList::BufWait(owner), dirrem)?,
                            _ => self.add_to_worklist(dirrem)?,
                        }
                    }
                    self.free_record(id)?;
                }
                DepKind::Allocindir => self.free_allocindir(id, inodedep)?,
                other => {
                    return Err(SoftdepError::inconsistency(
                        "deallocate_dependencies",
                        format!("unexpected {} on {}", other, buf.id),
                    ))
                }
            }
        }
        buf.dirty = false;
        Ok(())
    }

    /// The in-memory image of a truncated indirect block, if one was kept
    pub fn take_going_away(&mut self, blkno: BlockNo) -> Result<Option<Vec<u8>>, SoftdepError> {
        let Some(id) = self.going_away.remove(&blkno) else {
            return Ok(None);
        };
        let image = std::mem::take(&mut self.indirdep_mut(id)?.safe_copy);
        self.free_record(id)?;
        Ok(Some(image))
    }

    /// Inode `ino` is no longer referenced and may be released once its
    /// zeroed image is on disk
    pub fn setup_freefile(&mut self, ino: Ino, mode: u16) -> Result<DepId, SoftdepError> {
        let ff = self.alloc(Dep::Freefile(Freefile { ino, mode }), DepState::ATTACHED);
        match self.inodedeps.get(&ino).copied() {
            Some(inodedep) if !self.check_inode_unwritten(inodedep)? => {
                self.worklist_insert(WorkList::InoWait(inodedep), ff)?;
            }
            _ => self.add_to_worklist(ff)?,
        }
        Ok(ff)
    }

    /// If the inode never reached disk, forget it and report true
    pub fn check_inode_unwritten(&mut self, inodedep: DepId) -> Result<bool, SoftdepError> {
        let state = self.state(inodedep)?;
        let dep = self.inodedep(inodedep)?;
        if state.contains(DepState::DEPCOMPLETE) || !dep.lists_empty() || dep.nlinkdelta != 0 {
            return Ok(false);
        }
        // The bitmap still shows the inode free, and any write in progress
        // carries a zeroed image.
        let ino = dep.ino;
        let bm = dep.bmsafemap;
        if let Some(bm) = bm {
            super::graph::unlink(&mut self.bmsafemap_mut(bm)?.inodedephd, inodedep);
        }
        self.set_flags(inodedep, DepState::ALLCOMPLETE)?;
        self.clear_flags(inodedep, DepState::IOSTARTED)?;
        {
            let dep = self.inodedep_mut(inodedep)?;
            dep.bmsafemap = None;
            dep.unwritten = false;
            dep.savedino = None;
            dep.savedsize = None;
            dep.savedextsize = None;
        }
        self.worklist_detach(inodedep)?;
        if !self.free_inodedep(inodedep)? {
            return Err(SoftdepError::inconsistency(
                "check_inode_unwritten",
                format!("inode {} busy", ino),
            ));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use softdep_core::types::mode;
    use softdep_core::{BufId, Geometry};

    fn graph() -> DepGraph {
        DepGraph::new(Geometry::new(4096, 1024), 1000)
    }

    fn file(ino: Ino) -> InCoreInode {
        let mut ip = InCoreInode::new(ino, mode::IFREG | 0o644, 0);
        ip.din.nlink = 1;
        ip.effnlink = 1;
        ip
    }

    #[test]
    fn test_never_written_inode_frees_at_once() {
        let mut g = graph();
        let mut ip = file(20);
        g.setup_inomapdep(BufId(1), 20).unwrap();
        g.setup_blkmapdep(BufId(1), 1000).unwrap();
        g.setup_allocdirect(&ip, 0, 1000, 0, 4096, 0, BufId(1000), PtrArea::Data).unwrap();
        ip.din.db[0] = 1000;
        ip.din.size = 4096;
        ip.din.blocks = 4;

        let mut inode_buf = BlockBuf::new(BufId(3), 3, 4096);
        let fb = g.setup_freeblocks(&mut ip, &mut inode_buf, &mut [], 0).unwrap();
        assert_eq!(g.queue.front().copied(), Some(fb));
        assert_eq!(g.freeblks(fb).unwrap().dblks[0], 1000);
        assert_eq!(ip.din.db[0], 0);
        assert!(g.buf_deps.get(&BufId(1000)).is_none());
        assert!(g.setup_freeblocks(&mut ip, &mut inode_buf, &mut [], 10).is_err());
    }

    #[test]
    fn test_written_inode_waits_for_zeroed_image() {
        let mut g = graph();
        let mut ip = file(21);
        ip.din.db[0] = 1100;
        ip.din.blocks = 4;
        ip.din.size = 4096;
        let (inodedep, _) = g.inodedep_lookup(21);
        let mut inode_buf = BlockBuf::new(BufId(3), 3, 4096);
        let fb = g.setup_freeblocks(&mut ip, &mut inode_buf, &mut [], 0).unwrap();
        assert!(g.queue.is_empty());
        assert_eq!(g.inodedep(inodedep).unwrap().bufwait, vec![fb]);
        assert_eq!(g.find_on_buf(BufId(3), DepKind::Inodedep).unwrap(), Some(inodedep));
    }

    #[test]
    fn test_truncated_indirect_keeps_live_image() {
        let mut g = graph();
        let mut ip = file(22);
        let mut indir = BlockBuf::new(BufId(1200), 1200, 4096);
        g.setup_blkmapdep(BufId(1), 1201).unwrap();
        g.setup_allocindir_page(&ip, &indir, 0, 1201, 0, BufId(1201)).unwrap();
        softdep_core::layout::set_indirect_ptr(&mut indir.data, 0, 1201).unwrap();
        ip.din.ib[0] = 1200;
        ip.din.blocks = 8;

        let mut inode_buf = BlockBuf::new(BufId(3), 3, 4096);
        let mut dirty = vec![indir];
        g.setup_freeblocks(&mut ip, &mut inode_buf, &mut dirty, 0).unwrap();
        let image = g.take_going_away(1200).unwrap().unwrap();
        assert_eq!(softdep_core::layout::indirect_ptr(&image, 0).unwrap(), 1201);
        assert!(g.take_going_away(1200).unwrap().is_none());
        assert!(g.buf_deps.get(&BufId(1201)).is_none());
    }

    #[test]
    fn test_freefile_of_unwritten_inode_queued() {
        let mut g = graph();
        g.setup_inomapdep(BufId(1), 23).unwrap();
        let ff = g.setup_freefile(23, mode::IFREG).unwrap();
        assert_eq!(g.queue.front().copied(), Some(ff));
        assert!(g.inodedeps.get(&23).is_none());
        let bm = g.bmsafemaps[&BufId(1)];
        assert!(g.bmsafemap(bm).unwrap().inodedephd.is_empty());
    }
}
