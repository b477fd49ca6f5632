// Inode block dependencies
//
// The in-core inode is copied into its inode block by `update_inodeblock`.
// From then on the inodedep rides on that buffer: before each write the
// pointers of allocations that are not yet safe are rolled back to their
// old values, and afterwards rolled forward again.

use super::alloc::PtrArea;
use super::arena::DepId;
use super::graph::DepGraph;
use super::records::*;
use super::state::DepState;
use softdep_core::layout::{DINODE_SIZE, NDADDR};
use softdep_core::{BlockBuf, BlockNo, BufId, Dinode, InCoreInode, SoftdepError};

/// Result of copying an in-core inode into its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeUpdate {
    /// Bitmap buffer that must reach disk before this inode can
    pub bitmap_first: Option<BufId>,
}

/// One pointer an inode write must hold back
struct PtrRollback {
    lbn: usize,
    newblkno: BlockNo,
    oldblkno: BlockNo,
    oldsize: u32,
}

impl DepGraph {
    /// An inode was read from disk; restore its effective link count
    pub fn load_inodeblock(&self, ip: &mut InCoreInode) -> Result<(), SoftdepError> {
        ip.effnlink = ip.din.nlink;
        if let Some(id) = self.inodedeps.get(&ip.ino) {
            let delta = self.inodedep(*id)?.nlinkdelta;
            let effnlink = ip.din.nlink as i32 - delta;
            if effnlink < 0 {
                return Err(SoftdepError::inconsistency(
                    "softdep_load_inodeblock",
                    format!("inode {} has {} links but a pending delta of {}", ip.ino, ip.din.nlink, delta),
                ));
            }
            ip.effnlink = effnlink as u16;
        }
        Ok(())
    }

    /// The in-core inode `ip` is being copied into `buf`
    pub fn update_inodeblock(
        &mut self,
        ip: &InCoreInode,
        buf: &mut BlockBuf,
        waitfor: bool,
    ) -> Result<InodeUpdate, SoftdepError> {
        self.ensure_not_in_flight(buf.id)?;
        let offset = self.geom.dinode_offset(ip.ino);
        let slot_end = offset + DINODE_SIZE;
        if slot_end > buf.data.len() {
            return Err(SoftdepError::inconsistency(
                "update_inodeblock",
                format!("inode {} outside {}", ip.ino, buf.id),
            ));
        }
        let Some(inodedep) = self.inodedeps.get(&ip.ino).copied() else {
            if ip.effnlink != ip.din.nlink {
                return Err(SoftdepError::inconsistency(
                    "update_inodeblock",
                    format!("inode {} has {} links but {} effective and no record", ip.ino, ip.din.nlink, ip.effnlink),
                ));
            }
            ip.din.encode_into(&mut buf.data[offset..slot_end])?;
            buf.dirty = true;
            return Ok(InodeUpdate::default());
        };

        let delta = ip.din.nlink as i32 - ip.effnlink as i32;
        let recorded = self.inodedep(inodedep)?.nlinkdelta;
        if recorded != delta {
            return Err(SoftdepError::inconsistency(
                "update_inodeblock",
                format!("inode {} delta {} but recorded {}", ip.ino, delta, recorded),
            ));
        }
        self.inodedep_mut(inodedep)?.unwritten = true;
        match self.rec(inodedep)?.on {
            None => self.worklist_insert(WorkList::Buf(buf.id), inodedep)?,
            Some(WorkList::Buf(other)) if other == buf.id => {}
            Some(other) => {
                return Err(SoftdepError::inconsistency(
                    "update_inodeblock",
                    format!("inode {} record sits on {:?}", ip.ino, other),
                ))
            }
        }

        for area in [PtrArea::Data, PtrArea::Ext] {
            self.merge_inode_lists(inodedep, area)?;
            if let Some(first) = self.adp_list(inodedep, area, true)?.first().copied() {
                self.handle_allocdirect_partdone(first)?;
            }
        }
        // Anything waiting on this version of the inode now waits on the buffer.
        let waiting = std::mem::take(&mut self.inodedep_mut(inodedep)?.inowait);
        for id in waiting {
            let rec = self.rec_mut(id)?;
            rec.on = None;
            rec.state.remove(DepState::ONWORKLIST);
            self.worklist_insert(WorkList::BufWait(inodedep), id)?;
        }

        ip.din.encode_into(&mut buf.data[offset..slot_end])?;
        buf.dirty = true;

        let mut update = InodeUpdate::default();
        if waitfor && !self.state(inodedep)?.contains(DepState::DEPCOMPLETE) {
            let bm = self.inodedep(inodedep)?.bmsafemap.ok_or_else(|| {
                SoftdepError::inconsistency("update_inodeblock", format!("inode {} lost its bitmap", ip.ino))
            })?;
            update.bitmap_first = Some(self.bmsafemap(bm)?.buf);
        }
        Ok(update)
    }

    /// Move next-generation allocdirects onto the current list, merging
    /// those that replace a current entry
    pub fn merge_inode_lists(&mut self, inodedep: DepId, area: PtrArea) -> Result<(), SoftdepError> {
        let pending = std::mem::take(self.adp_list_mut(inodedep, area, false)?);
        for newadp in pending {
            let lbn = self.allocdirect(newadp)?.lbn;
            let list = self.adp_list(inodedep, area, true)?;
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
            self.adp_list_mut(inodedep, area, true)?.insert(pos, newadp);
            if let Some(old) = replaced {
                self.allocdirect_merge(newadp, old)?;
            }
        }
        Ok(())
    }

    fn ptr_rollbacks(&self, inodedep: DepId, area: PtrArea) -> Result<Vec<PtrRollback>, SoftdepError> {
        self.adp_list(inodedep, area, true)?
            .iter()
            .map(|id| {
                let adp = self.allocdirect(*id)?;
                Ok(PtrRollback {
                    lbn: adp.lbn as usize,
                    newblkno: adp.newblkno,
                    oldblkno: adp.oldblkno,
                    oldsize: adp.oldsize,
                })
            })
            .collect()
    }

    /// Inode block write starting. Returns the number of pointers held back.
    pub fn initiate_write_inodeblock(&mut self, inodedep: DepId, buf: &mut BlockBuf) -> Result<u64, SoftdepError> {
        let state = self.state(inodedep)?;
        let ino = self.inodedep(inodedep)?.ino;
        if state.contains(DepState::IOSTARTED) {
            return Err(SoftdepError::inconsistency(
                "initiate_write_inodeblock",
                format!("inode {} already being written", ino),
            ));
        }
        self.set_flags(inodedep, DepState::IOSTARTED)?;
        let offset = self.geom.dinode_offset(ino);
        let slot = offset..offset + DINODE_SIZE;

        // Until its bitmap is durable the inode is written as unallocated.
        if !state.contains(DepState::DEPCOMPLETE) {
            let image = buf.data[slot.clone()].to_vec();
            buf.data[slot].fill(0);
            self.inodedep_mut(inodedep)?.savedino = Some(image);
            self.stats.inode_image_rollbacks += 1;
            return Ok(1);
        }

        let mut din = Dinode::decode(&buf.data[slot.clone()])?;
        {
            let dep = self.inodedep_mut(inodedep)?;
            dep.savedsize = Some(din.size);
            dep.savedextsize = Some(din.extsize);
        }
        let data = self.ptr_rollbacks(inodedep, PtrArea::Data)?;
        let ext = self.ptr_rollbacks(inodedep, PtrArea::Ext)?;
        if data.is_empty() && ext.is_empty() {
            return Ok(0);
        }
        for id in self
            .adp_list(inodedep, PtrArea::Data, true)?
            .iter()
            .chain(self.adp_list(inodedep, PtrArea::Ext, true)?.iter())
            .copied()
            .collect::<Vec<_>>()
        {
            if !self.state(id)?.contains(DepState::ATTACHED) {
                return Err(SoftdepError::inconsistency(
                    "initiate_write_inodeblock",
                    format!("{} of inode {} already rolled back", id, ino),
                ));
            }
            self.clear_flags(id, DepState::ATTACHED)?;
            self.set_flags(id, DepState::UNDONE)?;
        }

        let bsize = self.geom.bsize;
        let mut size = din.size;
        roll_back_area(&mut din.db, &mut din.ib, &mut size, &data, bsize, ino)?;
        din.size = size;
        let mut extsize = din.extsize as u64;
        roll_back_area(&mut din.extb, &mut [], &mut extsize, &ext, bsize, ino)?;
        din.extsize = extsize as u32;
        din.encode_into(&mut buf.data[slot])?;

        let count = (data.len() + ext.len()) as u64;
        self.stats.direct_rollbacks += count;
        Ok(count)
    }

    /// Restore the pointers and sizes held back for the write. Returns
    /// whether the buffer differs from what reached disk.
    fn roll_forward_inodeblock(&mut self, inodedep: DepId, buf: &mut BlockBuf) -> Result<bool, SoftdepError> {
        let ino = self.inodedep(inodedep)?.ino;
        let offset = self.geom.dinode_offset(ino);
        let slot = offset..offset + DINODE_SIZE;
        if let Some(image) = self.inodedep_mut(inodedep)?.savedino.take() {
            buf.data[slot].copy_from_slice(&image);
            return Ok(true);
        }

        let mut din = Dinode::decode(&buf.data[slot.clone()])?;
        let mut changed = false;
        for area in [PtrArea::Data, PtrArea::Ext] {
            for id in self.adp_list(inodedep, area, true)?.clone() {
                let state = self.state(id)?;
                if state.contains(DepState::ATTACHED) {
                    return Err(SoftdepError::inconsistency(
                        "handle_written_inodeblock",
                        format!("{} of inode {} appeared during the write", id, ino),
                    ));
                }
                let adp = self.allocdirect(id)?;
                let lbn = adp.lbn as usize;
                let slot_ptr = match area {
                    PtrArea::Ext => &mut din.extb[lbn],
                    PtrArea::Data if lbn < NDADDR => &mut din.db[lbn],
                    PtrArea::Data => &mut din.ib[lbn - NDADDR],
                };
                // Entries past a fragment rollback were zeroed rather than
                // set to their old value.
                if *slot_ptr != adp.oldblkno && *slot_ptr != 0 {
                    return Err(SoftdepError::inconsistency(
                        "handle_written_inodeblock",
                        format!("inode {} pointer {} holds {} not {}", ino, adp.lbn, slot_ptr, adp.oldblkno),
                    ));
                }
                *slot_ptr = adp.newblkno;
                self.clear_flags(id, DepState::UNDONE)?;
                self.set_flags(id, DepState::ATTACHED)?;
                changed = true;
            }
        }
        let dep = self.inodedep_mut(inodedep)?;
        let savedsize = dep.savedsize.take().ok_or_else(|| {
            SoftdepError::inconsistency("handle_written_inodeblock", format!("inode {} size not saved", ino))
        })?;
        let savedextsize = dep.savedextsize.take().unwrap_or(din.extsize);
        if din.size != savedsize || din.extsize != savedextsize {
            din.size = savedsize;
            din.extsize = savedextsize;
            changed = true;
        }
        if changed {
            din.encode_into(&mut buf.data[slot])?;
        }
        Ok(changed)
    }

    /// Inode block write landed. Returns whether the inodedep must stay on
    /// the buffer.
    pub fn handle_written_inodeblock(&mut self, inodedep: DepId, buf: &mut BlockBuf) -> Result<bool, SoftdepError> {
        let ino = self.inodedep(inodedep)?.ino;
        if !self.state(inodedep)?.contains(DepState::IOSTARTED) {
            return Err(SoftdepError::inconsistency(
                "handle_written_inodeblock",
                format!("inode {} write was never started", ino),
            ));
        }
        self.clear_flags(inodedep, DepState::IOSTARTED)?;
        self.set_flags(inodedep, DepState::COMPLETE)?;

        if self.inodedep(inodedep)?.savedino.is_some() {
            self.roll_forward_inodeblock(inodedep, buf)?;
            buf.dirty = true;
            return Ok(true);
        }

        // Work queued on the buffer-wait list from here on waits for a later
        // write of this inode.
        let waiting = std::mem::take(&mut self.inodedep_mut(inodedep)?.bufwait);
        for id in &waiting {
            let rec = self.rec_mut(*id)?;
            rec.on = None;
            rec.state.remove(DepState::ONWORKLIST);
        }

        if self.roll_forward_inodeblock(inodedep, buf)? {
            buf.dirty = true;
        }
        self.inodedep_mut(inodedep)?.unwritten = false;

        for area in [PtrArea::Data, PtrArea::Ext] {
            if let Some(first) = self.adp_list(inodedep, area, true)?.first().copied() {
                self.handle_allocdirect_partdone(first)?;
            }
        }

        let mut filefree = None;
        for id in waiting {
            match self.kind(id)? {
                DepKind::Freefile => {
                    if filefree.is_some() {
                        return Err(SoftdepError::inconsistency(
                            "handle_written_inodeblock",
                            format!("inode {} freed twice", ino),
                        ));
                    }
                    filefree = Some(id);
                }
                DepKind::Mkdir => self.handle_written_mkdir(id, DepState::MKDIR_PARENT)?,
                DepKind::Diradd => self.diradd_inode_written(id, inodedep)?,
                DepKind::Freeblks | DepKind::Freefrag | DepKind::Dirrem => self.add_to_worklist(id)?,
                DepKind::Newdirblk => self.free_newdirblk(id)?,
                other => {
                    return Err(SoftdepError::inconsistency(
                        "handle_written_inodeblock",
                        format!("unexpected {} waiting on inode {}", other, ino),
                    ))
                }
            }
        }

        if let Some(ff) = filefree {
            // Frees queued above run before the inode itself is released.
            if !self.free_inodedep(inodedep)? {
                return Err(SoftdepError::inconsistency(
                    "handle_written_inodeblock",
                    format!("inode {} freed with dependencies outstanding", ino),
                ));
            }
            self.add_to_worklist(ff)?;
            return Ok(false);
        }

        if self.free_inodedep(inodedep)? {
            return Ok(false);
        }
        let dep = self.inodedep(inodedep)?;
        let pending = !dep.inoupdt.is_empty() || !dep.extupdt.is_empty() || !dep.bufwait.is_empty();
        if !dep.bufwait.is_empty() {
            buf.dirty = true;
        }
        Ok(pending)
    }

    /// Inode block write failed: restore the buffer without counting the
    /// write. Returns the inode number affected.
    pub fn abort_write_inodeblock(&mut self, inodedep: DepId, buf: &mut BlockBuf) -> Result<u32, SoftdepError> {
        let ino = self.inodedep(inodedep)?.ino;
        if !self.state(inodedep)?.contains(DepState::IOSTARTED) {
            return Err(SoftdepError::inconsistency(
                "abort_write_inodeblock",
                format!("inode {} write was never started", ino),
            ));
        }
        self.clear_flags(inodedep, DepState::IOSTARTED)?;
        self.roll_forward_inodeblock(inodedep, buf)?;
        buf.dirty = true;
        Ok(ino)
    }
}

/// Hold back the pointers of `deps` (sorted by lbn) in one pointer area.
/// `indirect` is empty for the extended attribute area.
fn roll_back_area(
    direct: &mut [BlockNo],
    indirect: &mut [BlockNo],
    size: &mut u64,
    deps: &[PtrRollback],
    bsize: u32,
    ino: u32,
) -> Result<(), SoftdepError> {
    let bsize64 = bsize as u64;
    for dep in deps {
        let slot = if dep.lbn < direct.len() {
            direct[dep.lbn]
        } else {
            indirect.get(dep.lbn - direct.len()).copied().unwrap_or(0)
        };
        if slot != dep.newblkno {
            return Err(SoftdepError::inconsistency(
                "initiate_write_inodeblock",
                format!("inode {} pointer {} holds {} not {}", ino, dep.lbn, slot, dep.newblkno),
            ));
        }
    }

    let mut last = None;
    let mut rest = deps.iter().peekable();
    while let Some(dep) = rest.peek() {
        if dep.lbn >= direct.len() {
            break;
        }
        direct[dep.lbn] = dep.oldblkno;
        // A fragment rolled back must stay the last block of the file.
        if dep.oldsize != 0 && dep.oldsize != bsize {
            let frag_end = bsize64 * dep.lbn as u64 + dep.oldsize as u64;
            if frag_end < *size {
                *size = frag_end;
            }
            direct[dep.lbn + 1..].fill(0);
            indirect.fill(0);
            return Ok(());
        }
        last = Some(dep.lbn);
        rest.next();
    }
    if let Some(lbn) = last {
        if *size <= (lbn as u64 + 1) * bsize64 {
            let allocated = direct[..=lbn].iter().rposition(|p| *p != 0);
            *size = allocated.map_or(0, |i| (i as u64 + 1) * bsize64);
        }
    }
    // Indirect roots cannot name a block whose contents are not durable.
    for dep in rest {
        indirect[dep.lbn - direct.len()] = 0;
    }
    Ok(())
}
