// Block and inode allocation dependencies
//
// A freshly allocated block may not be referenced on disk before the
// bitmap recording its allocation is durable, and a block pointer may not
// name a block whose contents have not been written. Allocdirects track
// pointers held in the inode, allocindirs pointers held in indirect blocks.

use super::arena::DepId;
use super::graph::{unlink, DepGraph};
use super::records::*;
use super::state::DepState;
use softdep_core::layout::{set_indirect_ptr, NDADDR, NXADDR};
use softdep_core::{BlockBuf, BlockNo, BufId, InCoreInode, Ino, Lbn, SoftdepError};

/// Which inode pointer area an allocdirect updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PtrArea {
    Data,
    Ext,
}

impl PtrArea {
    fn of(state: DepState) -> Self {
        if state.contains(DepState::EXTDATA) {
            PtrArea::Ext
        } else {
            PtrArea::Data
        }
    }
}

impl DepGraph {
    /// Inode `newinum` was allocated from the inode bitmap in `bitmap`
    pub fn setup_inomapdep(&mut self, bitmap: BufId, newinum: Ino) -> Result<DepId, SoftdepError> {
        self.ensure_not_in_flight(bitmap)?;
        if self.inodedeps.contains_key(&newinum) {
            return Err(SoftdepError::inconsistency(
                "setup_inomapdep",
                format!("inode {} already has dependencies", newinum),
            ));
        }
        // A new inode is neither written nor backed by a durable bitmap.
        let id = self.inodedep_create(newinum, DepState::ATTACHED | DepState::COMPLETE);
        self.inodedep_mut(id)?.unwritten = true;
        let bm = self.bmsafemap_lookup(bitmap)?;
        self.bmsafemap_mut(bm)?.inodedephd.push(id);
        self.inodedep_mut(id)?.bmsafemap = Some(bm);
        log::debug!("softdep: inode {} allocated against {}", newinum, bitmap);
        Ok(id)
    }

    /// Block `blkno` was allocated from the block bitmap in `bitmap`
    pub fn setup_blkmapdep(&mut self, bitmap: BufId, blkno: BlockNo) -> Result<DepId, SoftdepError> {
        self.ensure_not_in_flight(bitmap)?;
        if blkno == 0 || self.newblks.contains_key(&blkno) {
            return Err(SoftdepError::inconsistency(
                "setup_blkmapdep",
                format!("block {} already tracked", blkno),
            ));
        }
        let bm = self.bmsafemap_lookup(bitmap)?;
        let id = self.alloc(Dep::Newblk(Newblk { blkno, bmsafemap: Some(bm) }), DepState::empty());
        self.newblks.insert(blkno, id);
        self.bmsafemap_mut(bm)?.newblkhd.push(id);
        Ok(id)
    }

    /// Deferred release of `size` bytes at `blkno`
    pub fn newfreefrag(&mut self, ino: Ino, uid: u32, blkno: BlockNo, size: u32) -> Result<Option<DepId>, SoftdepError> {
        if blkno == 0 {
            return Ok(None);
        }
        let frags = self.geom.numfrags(size as u64);
        if self.geom.fragnum(blkno) as u64 + frags > self.geom.frag as u64 {
            return Err(SoftdepError::inconsistency(
                "newfreefrag",
                format!("fragment run at {} of {} bytes crosses a block boundary", blkno, size),
            ));
        }
        let id = self.alloc(
            Dep::Freefrag(Freefrag { ino, uid, blkno, size }),
            DepState::ATTACHED | DepState::SPACECOUNTED,
        );
        self.stats.pending_free_frags += frags;
        Ok(Some(id))
    }

    /// Hand the allocation token of `blkno` to a pointer update record.
    /// Returns true when the bitmap was already durable.
    fn claim_newblk(&mut self, blkno: BlockNo, owner: DepId, kind: DepKind) -> Result<bool, SoftdepError> {
        let nb = *self.newblks.get(&blkno).ok_or_else(|| {
            SoftdepError::inconsistency("claim_newblk", format!("lost block {}", blkno))
        })?;
        let durable = self.state(nb)?.contains(DepState::DEPCOMPLETE);
        if !durable {
            let bm = self.newblk(nb)?.bmsafemap.ok_or_else(|| {
                SoftdepError::inconsistency("claim_newblk", format!("block {} has no bitmap", blkno))
            })?;
            let map = self.bmsafemap_mut(bm)?;
            unlink(&mut map.newblkhd, nb);
            match kind {
                DepKind::Allocdirect => map.allocdirecthd.push(owner),
                _ => map.allocindirhd.push(owner),
            }
            match kind {
                DepKind::Allocdirect => self.allocdirect_mut(owner)?.bmsafemap = Some(bm),
                _ => self.allocindir_mut(owner)?.bmsafemap = Some(bm),
            }
        } else {
            self.set_flags(owner, DepState::DEPCOMPLETE)?;
        }
        self.free_record(nb)?;
        Ok(durable)
    }

    /// Inode pointer `lbn` changes from `oldblkno` to the new block `newblkno`.
    /// `lbn` at or above NDADDR names indirect root `lbn - NDADDR`.
    #[allow(clippy::too_many_arguments)]
    pub fn setup_allocdirect(
        &mut self,
        ip: &InCoreInode,
        lbn: Lbn,
        newblkno: BlockNo,
        oldblkno: BlockNo,
        newsize: u32,
        oldsize: u32,
        data_buf: BufId,
        area: PtrArea,
    ) -> Result<DepId, SoftdepError> {
        self.ensure_not_in_flight(data_buf)?;
        let limit = match area {
            PtrArea::Data => NDADDR as u64 + softdep_core::NIADDR as u64,
            PtrArea::Ext => NXADDR as u64,
        };
        if lbn >= limit {
            return Err(SoftdepError::inconsistency(
                "setup_allocdirect",
                format!("pointer {} out of range for inode {}", lbn, ip.ino),
            ));
        }
        if area == PtrArea::Data && lbn >= NDADDR as u64 && oldblkno != 0 {
            return Err(SoftdepError::inconsistency(
                "setup_allocdirect",
                format!("indirect root {} of inode {} reallocated", lbn - NDADDR as u64, ip.ino),
            ));
        }
        let freefrag = if oldblkno != 0 && oldblkno != newblkno {
            self.newfreefrag(ip.ino, ip.din.uid, oldblkno, oldsize)?
        } else {
            None
        };
        let (inodedep, _) = self.inodedep_lookup(ip.ino);
        let mut state = DepState::ATTACHED;
        if area == PtrArea::Ext {
            state |= DepState::EXTDATA;
        }
        let adp = self.alloc(
            Dep::Allocdirect(Allocdirect {
                lbn,
                newblkno,
                oldblkno,
                newsize,
                oldsize,
                freefrag,
                inodedep,
                bmsafemap: None,
                newdirblk: None,
            }),
            state,
        );
        self.claim_newblk(newblkno, adp, DepKind::Allocdirect)?;
        self.worklist_insert(WorkList::Buf(data_buf), adp)?;

        if area == PtrArea::Data && lbn < NDADDR as u64 && ip.is_dir() && oldblkno == 0 {
            let (pagedep, created) = self.pagedep_lookup(ip.ino, lbn, data_buf)?;
            if created {
                self.set_flags(pagedep, DepState::NEWBLOCK)?;
                let ndb = self.alloc(Dep::Newdirblk(Newdirblk { pagedep }), DepState::ATTACHED);
                self.allocdirect_mut(adp)?.newdirblk = Some(ndb);
            }
        }

        // Keep the next-generation list sorted by lbn, merging a replaced entry.
        let list = self.adp_list(inodedep, area, false)?;
        let mut pos = list.len();
        let mut replaced = None;
        for (i, other) in list.iter().enumerate() {
            let other_lbn = self.allocdirect(*other)?.lbn;
            if other_lbn >= lbn {
                pos = i;
                if other_lbn == lbn {
                    replaced = Some(*other);
                }
                break;
            }
        }
        self.adp_list_mut(inodedep, area, false)?.insert(pos, adp);
        if let Some(old) = replaced {
            self.allocdirect_merge(adp, old)?;
        }
        log::trace!(
            "softdep: inode {} {:?} pointer {} {} -> {}",
            ip.ino, area, lbn, oldblkno, newblkno
        );
        Ok(adp)
    }

    /// `current` selects inoupdt/extupdt over the next-generation lists
    pub fn adp_list(&self, inodedep: DepId, area: PtrArea, current: bool) -> Result<&Vec<DepId>, SoftdepError> {
        let dep = self.inodedep(inodedep)?;
        Ok(match (area, current) {
            (PtrArea::Data, true) => &dep.inoupdt,
            (PtrArea::Data, false) => &dep.newinoupdt,
            (PtrArea::Ext, true) => &dep.extupdt,
            (PtrArea::Ext, false) => &dep.newextupdt,
        })
    }

    pub fn adp_list_mut(&mut self, inodedep: DepId, area: PtrArea, current: bool) -> Result<&mut Vec<DepId>, SoftdepError> {
        let dep = self.inodedep_mut(inodedep)?;
        Ok(match (area, current) {
            (PtrArea::Data, true) => &mut dep.inoupdt,
            (PtrArea::Data, false) => &mut dep.newinoupdt,
            (PtrArea::Ext, true) => &mut dep.extupdt,
            (PtrArea::Ext, false) => &mut dep.newextupdt,
        })
    }

    /// Fold `oldadp` into `newadp`, which replaces it at the same lbn
    pub fn allocdirect_merge(&mut self, newadp: DepId, oldadp: DepId) -> Result<(), SoftdepError> {
        let area = PtrArea::of(self.state(newadp)?);
        let (old_old, old_oldsize, old_new, old_newsize, old_has_ff, old_ndb) = {
            let old = self.allocdirect(oldadp)?;
            (old.oldblkno, old.oldsize, old.newblkno, old.newsize, old.freefrag.is_some(), old.newdirblk)
        };
        let new = self.allocdirect(newadp)?;
        let limit = if area == PtrArea::Ext { NXADDR } else { NDADDR };
        if new.oldblkno != old_new || new.oldsize != old_newsize || new.lbn >= limit as u64 {
            return Err(SoftdepError::inconsistency(
                "allocdirect_merge",
                format!(
                    "lbn {}: replaced pointer {}/{} does not match {}/{}",
                    new.lbn, new.oldblkno, new.oldsize, old_new, old_newsize
                ),
            ));
        }
        // When the old record was itself freeing a fragment, or claimed no
        // block, the new one adopts its freefrag and the superseded block is
        // released with the old record. An extended fragment keeps its freefrag.
        let swap = old_has_ff || old_old == 0;
        {
            let new = self.allocdirect_mut(newadp)?;
            new.oldblkno = old_old;
            new.oldsize = old_oldsize;
        }
        if swap {
            let new_ff = self.allocdirect_mut(newadp)?.freefrag.take();
            let old_ff = self.allocdirect_mut(oldadp)?.freefrag.take();
            self.allocdirect_mut(newadp)?.freefrag = old_ff;
            self.allocdirect_mut(oldadp)?.freefrag = new_ff;
        }
        if old_ndb.is_some() && self.allocdirect(newadp)?.newdirblk.is_none() {
            self.allocdirect_mut(oldadp)?.newdirblk = None;
            self.allocdirect_mut(newadp)?.newdirblk = old_ndb;
        }
        self.free_allocdirect(oldadp, false)
    }

    /// Free an allocdirect. With `delay`, released space waits for the next
    /// inode write instead of going straight to the work queue.
    pub fn free_allocdirect(&mut self, adp: DepId, delay: bool) -> Result<(), SoftdepError> {
        let state = self.state(adp)?;
        let (inodedep, bm, freefrag, newdirblk) = {
            let a = self.allocdirect(adp)?;
            (a.inodedep, a.bmsafemap, a.freefrag, a.newdirblk)
        };
        if !state.contains(DepState::DEPCOMPLETE) {
            if let Some(bm) = bm {
                unlink(&mut self.bmsafemap_mut(bm)?.allocdirecthd, adp);
            }
        }
        {
            let dep = self.inodedep_mut(inodedep)?;
            let removed = unlink(&mut dep.inoupdt, adp)
                || unlink(&mut dep.newinoupdt, adp)
                || unlink(&mut dep.extupdt, adp)
                || unlink(&mut dep.newextupdt, adp);
            if !removed {
                return Err(SoftdepError::inconsistency(
                    "free_allocdirect",
                    format!("{} missing from inode {} lists", adp, dep.ino),
                ));
            }
        }
        self.worklist_detach(adp)?;
        if let Some(ff) = freefrag {
            if delay {
                self.worklist_insert(WorkList::BufWait(inodedep), ff)?;
            } else {
                self.add_to_worklist(ff)?;
            }
        }
        if let Some(ndb) = newdirblk {
            if delay {
                self.worklist_insert(WorkList::BufWait(inodedep), ndb)?;
            } else {
                self.free_newdirblk(ndb)?;
            }
        }
        self.free_record(adp)?;
        Ok(())
    }

    /// Release allocdirects at the head of the current list that are
    /// all-complete, stopping at the first one that is not or at any entry
    /// following a fragment rollback.
    pub fn handle_allocdirect_partdone(&mut self, adp: DepId) -> Result<(), SoftdepError> {
        if !self.all_complete(adp)? {
            return Ok(());
        }
        let state = self.state(adp)?;
        if state.contains(DepState::ONWORKLIST) {
            return Err(SoftdepError::inconsistency(
                "handle_allocdirect_partdone",
                format!("{} still on its data buffer", adp),
            ));
        }
        let area = PtrArea::of(state);
        let inodedep = self.allocdirect(adp)?.inodedep;
        let bsize = self.geom.bsize;
        let list = self.adp_list(inodedep, area, true)?.clone();
        let mut start = None;
        for (i, other) in list.iter().enumerate() {
            if *other == adp {
                start = Some(i);
                break;
            }
            let oldsize = self.allocdirect(*other)?.oldsize;
            if oldsize != 0 && oldsize != bsize {
                return Ok(());
            }
        }
        let Some(start) = start else {
            // Next-generation records wait until they reach the current list.
            if !self.adp_list(inodedep, area, false)?.contains(&adp) {
                return Err(SoftdepError::inconsistency(
                    "handle_allocdirect_partdone",
                    format!("{} lost from inode lists", adp),
                ));
            }
            return Ok(());
        };
        // An inode whose bitmap is not durable was never written, so nothing
        // on disk names the old blocks.
        let delay = self.state(inodedep)?.contains(DepState::DEPCOMPLETE);
        for other in &list[start..] {
            if !self.all_complete(*other)? {
                break;
            }
            self.free_allocdirect(*other, delay)?;
        }
        Ok(())
    }

    /// Indirect block pointer `ptrno` of a data block
    pub fn setup_allocindir_page(
        &mut self,
        ip: &InCoreInode,
        indir: &BlockBuf,
        ptrno: usize,
        newblkno: BlockNo,
        oldblkno: BlockNo,
        data_buf: BufId,
    ) -> Result<DepId, SoftdepError> {
        self.ensure_not_in_flight(data_buf)?;
        self.ensure_not_in_flight(indir.id)?;
        let aip = self.newallocindir(ip, ptrno, newblkno, oldblkno)?;
        self.worklist_insert(WorkList::Buf(data_buf), aip)?;
        self.setup_allocindir_phase2(indir, aip, ip.ino)?;
        Ok(aip)
    }

    /// Indirect block pointer `ptrno` naming a lower-level indirect block
    pub fn setup_allocindir_meta(
        &mut self,
        ip: &InCoreInode,
        indir: &BlockBuf,
        ptrno: usize,
        newblkno: BlockNo,
        new_indir_buf: BufId,
    ) -> Result<DepId, SoftdepError> {
        self.ensure_not_in_flight(new_indir_buf)?;
        self.ensure_not_in_flight(indir.id)?;
        let aip = self.newallocindir(ip, ptrno, newblkno, 0)?;
        self.worklist_insert(WorkList::Buf(new_indir_buf), aip)?;
        self.setup_allocindir_phase2(indir, aip, ip.ino)?;
        Ok(aip)
    }

    fn newallocindir(&mut self, ip: &InCoreInode, ptrno: usize, newblkno: BlockNo, oldblkno: BlockNo) -> Result<DepId, SoftdepError> {
        if ptrno >= self.geom.nindir {
            return Err(SoftdepError::inconsistency(
                "newallocindir",
                format!("pointer {} beyond indirect block", ptrno),
            ));
        }
        let freefrag = self.newfreefrag(ip.ino, ip.din.uid, oldblkno, self.geom.bsize)?;
        Ok(self.alloc(
            Dep::Allocindir(Allocindir {
                ptrno,
                newblkno,
                oldblkno,
                freefrag,
                indirdep: None,
                bmsafemap: None,
            }),
            DepState::ATTACHED,
        ))
    }

    fn setup_allocindir_phase2(&mut self, indir: &BlockBuf, aip: DepId, ino: Ino) -> Result<(), SoftdepError> {
        self.ensure_not_in_flight(indir.id)?;
        let indirdep = match self.find_on_buf(indir.id, DepKind::Indirdep)? {
            Some(id) => id,
            None => {
                let id = self.alloc(
                    Dep::Indirdep(Indirdep {
                        blkno: indir.blkno,
                        ino,
                        safe_copy: indir.data.clone(),
                        saved_live: None,
                        deplisthd: Vec::new(),
                        donehd: Vec::new(),
                        freefrags: Vec::new(),
                        freefrags_writing: Vec::new(),
                    }),
                    DepState::ATTACHED,
                );
                self.worklist_insert(WorkList::Buf(indir.id), id)?;
                id
            }
        };
        let newblkno = self.allocindir(aip)?.newblkno;
        self.claim_newblk(newblkno, aip, DepKind::Allocindir)?;
        self.allocindir_mut(aip)?.indirdep = Some(indirdep);

        let (ptrno, oldblkno) = {
            let a = self.allocindir(aip)?;
            (a.ptrno, a.oldblkno)
        };
        let mut superseded = None;
        if oldblkno != 0 {
            for other in &self.indirdep(indirdep)?.deplisthd {
                if self.allocindir(*other)?.ptrno == ptrno {
                    superseded = Some(*other);
                    break;
                }
            }
        }
        if let Some(old) = superseded {
            let (old_new, old_old) = {
                let o = self.allocindir(old)?;
                (o.newblkno, o.oldblkno)
            };
            if old_new != oldblkno {
                return Err(SoftdepError::inconsistency(
                    "setup_allocindir",
                    format!("slot {} holds {} not {}", ptrno, old_new, oldblkno),
                ));
            }
            // The superseded block never reached disk; release it right away
            // and inherit the free of the block that did.
            let old_ff = self.allocindir_mut(old)?.freefrag.take();
            let new = self.allocindir_mut(aip)?;
            new.oldblkno = old_old;
            let released = std::mem::replace(&mut new.freefrag, old_ff);
            self.free_allocindir(old, None)?;
            if let Some(ff) = released {
                self.add_to_worklist(ff)?;
            }
        }
        let safe_value = self.allocindir(aip)?.oldblkno;
        let dep = self.indirdep_mut(indirdep)?;
        dep.deplisthd.push(aip);
        set_indirect_ptr(&mut dep.safe_copy, ptrno, safe_value)?;
        Ok(())
    }

    /// Once all-complete, the new pointer joins the safe copy
    pub fn handle_allocindir_partdone(&mut self, aip: DepId) -> Result<(), SoftdepError> {
        if !self.all_complete(aip)? {
            return Ok(());
        }
        if self.state(aip)?.contains(DepState::ONWORKLIST) {
            return Err(SoftdepError::inconsistency(
                "handle_allocindir_partdone",
                format!("{} still on its data buffer", aip),
            ));
        }
        let (indirdep, ptrno, newblkno, freefrag) = {
            let a = self.allocindir(aip)?;
            let indirdep = a.indirdep.ok_or_else(|| {
                SoftdepError::inconsistency("handle_allocindir_partdone", format!("{} has no indirdep", aip))
            })?;
            (indirdep, a.ptrno, a.newblkno, a.freefrag)
        };
        if self.state(indirdep)?.contains(DepState::UNDONE) {
            let dep = self.indirdep_mut(indirdep)?;
            if unlink(&mut dep.deplisthd, aip) {
                dep.donehd.push(aip);
            }
            return Ok(());
        }
        let dep = self.indirdep_mut(indirdep)?;
        set_indirect_ptr(&mut dep.safe_copy, ptrno, newblkno)?;
        unlink(&mut dep.deplisthd, aip);
        unlink(&mut dep.donehd, aip);
        // The old block stays referenced on disk until the safe copy carrying
        // the new pointer is written.
        if let Some(ff) = freefrag {
            dep.freefrags.push(ff);
        }
        self.allocindir_mut(aip)?.freefrag = None;
        self.free_record(aip)?;
        Ok(())
    }

    /// Free an allocindir. Released space goes to `inodedep`'s buffer-wait
    /// list when given, otherwise straight to the work queue.
    pub fn free_allocindir(&mut self, aip: DepId, inodedep: Option<DepId>) -> Result<(), SoftdepError> {
        let state = self.state(aip)?;
        let (bm, indirdep, freefrag) = {
            let a = self.allocindir(aip)?;
            (a.bmsafemap, a.indirdep, a.freefrag)
        };
        if !state.contains(DepState::DEPCOMPLETE) {
            if let Some(bm) = bm {
                unlink(&mut self.bmsafemap_mut(bm)?.allocindirhd, aip);
            }
        }
        self.worklist_detach(aip)?;
        if let Some(ind) = indirdep {
            let dep = self.indirdep_mut(ind)?;
            unlink(&mut dep.deplisthd, aip);
            unlink(&mut dep.donehd, aip);
        }
        if let Some(ff) = freefrag {
            match inodedep {
                Some(owner) => self.worklist_insert(WorkList::BufWait(owner), ff)?,
                None => self.add_to_worklist(ff)?,
            }
        }
        self.free_record(aip)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use softdep_core::layout::indirect_ptr;
    use softdep_core::types::mode;
    use softdep_core::Geometry;

    fn graph() -> DepGraph {
        DepGraph::new(Geometry::new(4096, 1024), 1000)
    }

    fn file(ino: Ino) -> InCoreInode {
        InCoreInode::new(ino, mode::IFREG | 0o644, 1000)
    }

    #[test]
    fn test_allocdirect_waits_on_bitmap() {
        let mut g = graph();
        let ip = file(10);
        g.setup_blkmapdep(BufId(1), 400).unwrap();
        let adp = g
            .setup_allocdirect(&ip, 0, 400, 0, 4096, 0, BufId(400), PtrArea::Data)
            .unwrap();

        let bm = g.bmsafemaps[&BufId(1)];
        assert_eq!(g.bmsafemap(bm).unwrap().allocdirecthd, vec![adp]);
        assert!(g.bmsafemap(bm).unwrap().newblkhd.is_empty());
        assert!(g.newblks.is_empty());
        assert!(!g.state(adp).unwrap().contains(DepState::DEPCOMPLETE));
        let inodedep = g.inodedeps[&10];
        assert_eq!(g.inodedep(inodedep).unwrap().newinoupdt, vec![adp]);
    }

    #[test]
    fn test_allocdirect_lists_sorted_and_merged() {
        let mut g = graph();
        let ip = file(11);
        for blk in [400, 404, 408] {
            g.setup_blkmapdep(BufId(1), blk).unwrap();
        }
        let a2 = g.setup_allocdirect(&ip, 2, 400, 0, 4096, 0, BufId(400), PtrArea::Data).unwrap();
        let a0 = g.setup_allocdirect(&ip, 0, 404, 0, 4096, 0, BufId(404), PtrArea::Data).unwrap();
        let inodedep = g.inodedeps[&11];
        assert_eq!(g.inodedep(inodedep).unwrap().newinoupdt, vec![a0, a2]);

        // Reallocating lbn 2 before anything reached disk replaces the record.
        let b2 = g.setup_allocdirect(&ip, 2, 408, 400, 4096, 4096, BufId(408), PtrArea::Data).unwrap();
        assert_eq!(g.inodedep(inodedep).unwrap().newinoupdt, vec![a0, b2]);
        assert!(g.allocdirect(a2).is_err());
        let merged = g.allocdirect(b2).unwrap();
        assert_eq!(merged.oldblkno, 0);
        assert_eq!(merged.oldsize, 0);
        // Block 400 was never on disk, so its release is queued immediately.
        assert_eq!(g.queue.len(), 1);
        assert_eq!(g.kind(g.queue[0]).unwrap(), DepKind::Freefrag);
    }

    #[test]
    fn test_freefrag_rejects_straddling_run() {
        let mut g = graph();
        assert!(g.newfreefrag(3, 0, 403, 2048).is_err());
        let ff = g.newfreefrag(3, 77, 402, 2048).unwrap().unwrap();
        assert_eq!(g.freefrag(ff).unwrap().uid, 77);
        assert_eq!(g.stats.pending_free_frags, 2);
    }

    #[test]
    fn test_allocindir_holds_old_pointer_in_safe_copy() {
        let mut g = graph();
        let ip = file(12);
        let mut indir = BlockBuf::new(BufId(500), 500, 4096);
        set_indirect_ptr(&mut indir.data, 3, 0).unwrap();
        g.setup_blkmapdep(BufId(1), 600).unwrap();
        let aip = g.setup_allocindir_page(&ip, &indir, 3, 600, 0, BufId(600)).unwrap();
        set_indirect_ptr(&mut indir.data, 3, 600).unwrap();

        let ind = g.find_on_buf(BufId(500), DepKind::Indirdep).unwrap().unwrap();
        assert_eq!(indirect_ptr(&g.indirdep(ind).unwrap().safe_copy, 3).unwrap(), 0);
        assert_eq!(g.indirdep(ind).unwrap().deplisthd, vec![aip]);

        // Data written and bitmap durable: the safe copy picks up the pointer.
        g.set_flags(aip, DepState::COMPLETE | DepState::DEPCOMPLETE).unwrap();
        g.worklist_remove(aip).unwrap();
        g.handle_allocindir_partdone(aip).unwrap();
        assert_eq!(indirect_ptr(&g.indirdep(ind).unwrap().safe_copy, 3).unwrap(), 600);
        assert!(g.indirdep(ind).unwrap().deplisthd.is_empty());
    }

    #[test]
    fn test_directory_block_gets_newdirblk() {
        let mut g = graph();
        let dir = InCoreInode::new(20, mode::IFDIR | 0o755, 0);
        g.setup_blkmapdep(BufId(1), 700).unwrap();
        let adp = g.setup_allocdirect(&dir, 0, 700, 0, 4096, 0, BufId(700), PtrArea::Data).unwrap();
        let ndb = g.allocdirect(adp).unwrap().newdirblk.unwrap();
        let pagedep = g.newdirblk(ndb).unwrap().pagedep;
        assert!(g.state(pagedep).unwrap().contains(DepState::NEWBLOCK));
        assert_eq!(g.pagedeps[&(20, 0)], pagedep);
    }
}
