// Deferred work: block and inode release, link-count decrements
//
// Items are taken off the queue one at a time under the mount lock and run
// with the lock released, so handlers may call back into the tracker.

use super::arena::DepId;
use super::graph::DepGraph;
use super::records::*;
use super::state::DepState;
use super::{FsBackend, LinkCounts, Softdep};
use softdep_core::layout::{indirect_ptr, NDADDR, NIADDR, NXADDR};
use softdep_core::{BlockNo, Ino, SoftdepError};

/// Space or inode release requested from outside the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredWork {
    FreeFrag { ino: Ino, uid: u32, blkno: BlockNo, size: u32 },
    FreeFile { ino: Ino, mode: u16 },
}

/// Snapshot of a queued record, taken so the handler can run unlocked
#[derive(Debug, Clone)]
pub(crate) enum WorkItem {
    FreeFrag {
        ino: Ino,
        uid: u32,
        blkno: BlockNo,
        size: u32,
    },
    FreeBlocks {
        ino: Ino,
        uid: u32,
        oldsize: u64,
        oldextsize: u32,
        chkcnt: u64,
        dblks: [BlockNo; NDADDR],
        iblks: [BlockNo; NIADDR],
        extblks: [BlockNo; NXADDR],
    },
    Remove {
        oldinum: Ino,
        dirinum: Ino,
        rmdir: bool,
        dirchg: bool,
    },
    FreeFile {
        ino: Ino,
        mode: u16,
    },
}

impl WorkItem {
    fn ino(&self) -> Ino {
        match self {
            WorkItem::FreeFrag { ino, .. } | WorkItem::FreeBlocks { ino, .. } | WorkItem::FreeFile { ino, .. } => *ino,
            WorkItem::Remove { oldinum, .. } => *oldinum,
        }
    }
}

impl DepGraph {
    /// Pop the oldest queued record and mark it in progress
    pub fn take_work(&mut self) -> Result<Option<(DepId, WorkItem)>, SoftdepError> {
        let Some(id) = self.queue.pop_front() else {
            return Ok(None);
        };
        let rec = self.rec_mut(id)?;
        rec.on = None;
        rec.state.remove(DepState::ONWORKLIST);
        rec.state.insert(DepState::INPROGRESS);
        let state = rec.state;
        let item = match &rec.dep {
            Dep::Freefrag(ff) => WorkItem::FreeFrag {
                ino: ff.ino,
                uid: ff.uid,
                blkno: ff.blkno,
                size: ff.size,
            },
            Dep::Freeblks(fb) => WorkItem::FreeBlocks {
                ino: fb.ino,
                uid: fb.uid,
                oldsize: fb.oldsize,
                oldextsize: fb.oldextsize,
                chkcnt: fb.chkcnt,
                dblks: fb.dblks,
                iblks: fb.iblks,
                extblks: fb.extblks,
            },
            Dep::Dirrem(rem) => WorkItem::Remove {
                oldinum: rem.oldinum,
                dirinum: rem.dirinum,
                rmdir: state.contains(DepState::RMDIR),
                dirchg: state.contains(DepState::DIRCHG),
            },
            Dep::Freefile(ff) => WorkItem::FreeFile { ino: ff.ino, mode: ff.mode },
            other => {
                return Err(SoftdepError::inconsistency(
                    "take_work",
                    format!("unexpected {} {} on the work queue", other.kind(), id),
                ))
            }
        };
        Ok(Some((id, item)))
    }

    /// Drop a finished item, settling the pending-free statistic
    pub fn finish_work(&mut self, id: DepId) -> Result<(), SoftdepError> {
        let state = self.state(id)?;
        if state.contains(DepState::SPACECOUNTED) {
            let frags = match &self.rec(id)?.dep {
                Dep::Freefrag(ff) => self.geom.numfrags(ff.size as u64),
                Dep::Freeblks(fb) => fb.chkcnt,
                _ => 0,
            };
            self.stats.pending_free_frags = self.stats.pending_free_frags.saturating_sub(frags);
        }
        self.free_record(id)?;
        self.stats.work_items_processed += 1;
        Ok(())
    }

    pub fn finish_freeblks(&mut self, id: DepId, released: u64) -> Result<(), SoftdepError> {
        let (ino, expected) = {
            let fb = self.freeblks(id)?;
            (fb.ino, fb.chkcnt)
        };
        self.stats.frags_released += released;
        self.finish_work(id)?;
        if released != expected {
            log::error!(
                "softdep: inode {} released {} fragments, expected {}",
                ino,
                released,
                expected
            );
            return Err(SoftdepError::AccountingMismatch { ino, expected, released });
        }
        Ok(())
    }

    /// The on-disk link count of `ino` dropped; refresh its pending delta
    pub fn refresh_linkcnt(&mut self, ino: Ino, links: LinkCounts) -> Result<(), SoftdepError> {
        if links.nlink < links.effnlink {
            return Err(SoftdepError::inconsistency(
                "handle_workitem_remove",
                format!("inode {} link count {} below effective {}", ino, links.nlink, links.effnlink),
            ));
        }
        let (inodedep, _) = self.inodedep_lookup(ino);
        self.inodedep_mut(inodedep)?.nlinkdelta = links.nlink as i32 - links.effnlink as i32;
        self.free_inodedep(inodedep)?;
        Ok(())
    }

    /// Issue the removal of the ".." reference a removed directory held on
    /// its parent. It runs once the directory's zeroed inode is on disk.
    pub fn setup_parent_dirrem(&mut self, removed: Ino, parent: Ino) -> Result<DepId, SoftdepError> {
        self.new_dirrem_count();
        let dirrem = self.alloc(
            Dep::Dirrem(Dirrem {
                oldinum: parent,
                dirinum: parent,
                pagedep: None,
            }),
            DepState::ATTACHED,
        );
        match self.inodedeps.get(&removed).copied() {
            Some(inodedep) if !self.check_inode_unwritten(inodedep)? => {
                self.worklist_insert(WorkList::InoWait(inodedep), dirrem)?;
            }
            _ => self.add_to_worklist(dirrem)?,
        }
        Ok(dirrem)
    }

    pub fn enqueue_deferred(&mut self, work: DeferredWork) -> Result<DepId, SoftdepError> {
        match work {
            DeferredWork::FreeFrag { ino, uid, blkno, size } => {
                let ff = self.newfreefrag(ino, uid, blkno, size)?.ok_or_else(|| {
                    SoftdepError::inconsistency("enqueue_deferred", format!("free of block 0 for inode {}", ino))
                })?;
                self.add_to_worklist(ff)?;
                Ok(ff)
            }
            DeferredWork::FreeFile { ino, mode } => {
                let ff = self.alloc(Dep::Freefile(Freefile { ino, mode }), DepState::ATTACHED);
                self.add_to_worklist(ff)?;
                Ok(ff)
            }
        }
    }
}

impl Softdep {
    /// Run the items queued when the call starts. Returns how many ran.
    pub fn process_worklist(&self, backend: &dyn FsBackend) -> Result<usize, SoftdepError> {
        let pending = self.guard(|g| Ok(g.queue.len()))?;
        let mut done = 0;
        while done < pending {
            let Some((id, item)) = self.guard(|g| g.take_work())? else {
                break;
            };
            self.run_item(id, item, backend)?;
            done += 1;
        }
        if done > 0 {
            log::debug!("softdep: processed {} work items", done);
        }
        Ok(done)
    }

    /// Run work items until the queue stays empty
    pub fn flush_worklist(&self, backend: &dyn FsBackend) -> Result<usize, SoftdepError> {
        let mut total = 0;
        loop {
            let done = self.process_worklist(backend)?;
            if done == 0 {
                return Ok(total);
            }
            total += done;
        }
    }

    fn run_item(&self, id: DepId, item: WorkItem, backend: &dyn FsBackend) -> Result<(), SoftdepError> {
        let ino = item.ino();
        let result = match item {
            WorkItem::FreeFrag { ino, uid, blkno, size } => backend.release_blocks(ino, uid, blkno, size).and_then(|_| {
                self.guard(|g| {
                    g.stats.frags_released += g.geom.numfrags(size as u64);
                    g.finish_work(id)
                })
            }),
            WorkItem::FreeBlocks {
                ino,
                uid,
                oldsize,
                oldextsize,
                dblks,
                iblks,
                extblks,
                ..
            } => {
                let mut released = 0;
                match self.release_file_blocks(
                    backend,
                    ino,
                    uid,
                    oldsize,
                    oldextsize,
                    &dblks,
                    &iblks,
                    &extblks,
                    &mut released,
                ) {
                    Ok(()) => self.guard(|g| g.finish_freeblks(id, released)),
                    // Part of the file is already back in the allocator; the
                    // rest can no longer be accounted for.
                    Err(e) if released > 0 && !e.is_fatal() => {
                        log::error!(
                            "softdep: freeing blocks of inode {} stopped after {} fragments: {}",
                            ino,
                            released,
                            e
                        );
                        self.guard(|g| g.finish_freeblks(id, released)).and(Err(e))
                    }
                    Err(e) => Err(e),
                }
            }
            WorkItem::Remove {
                oldinum,
                dirinum,
                rmdir,
                dirchg,
            } => self.remove_entry(id, backend, oldinum, dirinum, rmdir, dirchg),
            WorkItem::FreeFile { ino, mode } => {
                let survived = self.guard(|g| Ok(g.inodedeps.contains_key(&ino)))?;
                if survived {
                    return Err(self.poison(SoftdepError::inconsistency(
                        "handle_workitem_freefile",
                        format!("inode {} still has dependencies", ino),
                    )));
                }
                backend.release_inode(ino, mode).and_then(|_| {
                    self.guard(|g| {
                        g.stats.inodes_released += 1;
                        g.finish_work(id)
                    })
                })
            }
        };
        match result {
            Err(e) if !e.is_fatal() && !matches!(e, SoftdepError::NeedsFsck) => {
                // The collaborator failed; the request is dropped and the
                // error reported against the inode.
                log::error!("softdep: work item for inode {} failed: {}", ino, e);
                self.guard(|g| {
                    g.io_errors.insert(ino, e.to_string());
                    if g.arena.get(id).is_some() {
                        g.finish_work(id)?;
                    }
                    Ok(())
                })
            }
            Err(e) => Err(self.poison(e)),
            Ok(()) => Ok(()),
        }
    }

    fn remove_entry(
        &self,
        id: DepId,
        backend: &dyn FsBackend,
        oldinum: Ino,
        dirinum: Ino,
        rmdir: bool,
        dirchg: bool,
    ) -> Result<(), SoftdepError> {
        // A directory loses its entry and its own "." reference.
        let links = backend.drop_links(oldinum, if rmdir { 2 } else { 1 })?;
        self.guard(|g| g.refresh_linkcnt(oldinum, links))?;
        if rmdir {
            backend.truncate_directory(self, oldinum)?;
            if !dirchg {
                self.guard(|g| g.setup_parent_dirrem(oldinum, dirinum))?;
            }
        }
        self.guard(|g| g.finish_work(id))?;
        if links.nlink == 0 {
            backend.inode_released(self, oldinum)?;
        }
        Ok(())
    }

    /// Release every block a truncated inode pointed at, deepest indirect
    /// level first. `released` counts the fragments returned so far, also
    /// when a release fails partway.
    #[allow(clippy::too_many_arguments)]
    fn release_file_blocks(
        &self,
        backend: &dyn FsBackend,
        ino: Ino,
        uid: u32,
        oldsize: u64,
        oldextsize: u32,
        dblks: &[BlockNo; NDADDR],
        iblks: &[BlockNo; NIADDR],
        extblks: &[BlockNo; NXADDR],
        released: &mut u64,
    ) -> Result<(), SoftdepError> {
        let geom = self.geometry;
        for level in (0..NIADDR).rev() {
            let bn = iblks[level];
            if bn == 0 {
                continue;
            }
            self.indir_trunc(backend, ino, uid, bn, level, released)?;
            backend.release_blocks(ino, uid, bn, geom.bsize)?;
            *released += geom.frag as u64;
        }
        for (lbn, bn) in dblks.iter().enumerate().rev() {
            if *bn == 0 {
                continue;
            }
            let size = geom.blksize(oldsize, lbn as u64);
            backend.release_blocks(ino, uid, *bn, size)?;
            *released += geom.numfrags(size as u64);
        }
        for (lbn, bn) in extblks.iter().enumerate().rev() {
            if *bn == 0 {
                continue;
            }
            let size = geom.blksize(oldextsize as u64, lbn as u64);
            backend.release_blocks(ino, uid, *bn, size)?;
            *released += geom.numfrags(size as u64);
        }
        Ok(())
    }

    /// Release the blocks below indirect block `blkno`, not the block itself
    fn indir_trunc(
        &self,
        backend: &dyn FsBackend,
        ino: Ino,
        uid: u32,
        blkno: BlockNo,
        level: usize,
        released: &mut u64,
    ) -> Result<(), SoftdepError> {
        let image = match self.guard(|g| g.take_going_away(blkno))? {
            Some(image) => image,
            None => backend.read_indirect(blkno)?,
        };
        let geom = self.geometry;
        for ptrno in (0..geom.nindir).rev() {
            let nb = indirect_ptr(&image, ptrno)?;
            if nb == 0 {
                continue;
            }
            if level > 0 {
                self.indir_trunc(backend, ino, uid, nb, level - 1, released)?;
            }
            backend.release_blocks(ino, uid, nb, geom.bsize)?;
            *released += geom.frag as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::softdep::RemoveKind;
    use softdep_core::layout::set_dirent_ino;
    use softdep_core::types::mode;
    use softdep_core::{BlockBuf, BufId, InCoreInode, SoftdepConfig};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        blocks: Mutex<Vec<(Ino, u32, BlockNo, u32)>>,
        inodes: Mutex<Vec<Ino>>,
        calls: Mutex<usize>,
        /// Fail this release call, counting from 1
        fail_call: Option<usize>,
        links: Mutex<Vec<(Ino, u16)>>,
        truncated: Mutex<Vec<Ino>>,
    }

    impl FsBackend for Recorder {
        fn release_blocks(&self, ino: Ino, uid: u32, blkno: BlockNo, size: u32) -> Result<(), SoftdepError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if blkno == 664 || self.fail_call == Some(*calls) {
                return Err(SoftdepError::Other("bad sector".to_string()));
            }
            self.blocks.lock().unwrap().push((ino, uid, blkno, size));
            Ok(())
        }

        fn release_inode(&self, ino: Ino, _mode: u16) -> Result<(), SoftdepError> {
            self.inodes.lock().unwrap().push(ino);
            Ok(())
        }

        fn read_indirect(&self, _blkno: BlockNo) -> Result<Vec<u8>, SoftdepError> {
            Ok(vec![0; 4096])
        }

        fn drop_links(&self, ino: Ino, count: u16) -> Result<LinkCounts, SoftdepError> {
            self.links.lock().unwrap().push((ino, count));
            Ok(LinkCounts { nlink: 1, effnlink: 1 })
        }

        fn truncate_directory(&self, _softdep: &Softdep, ino: Ino) -> Result<(), SoftdepError> {
            self.truncated.lock().unwrap().push(ino);
            Ok(())
        }
    }

    fn softdep() -> Softdep {
        Softdep::new(SoftdepConfig::default()).unwrap()
    }

    #[test]
    fn test_deferred_work_runs_in_order() {
        let softdep = softdep();
        let backend = Recorder::default();
        softdep
            .enqueue_deferred(DeferredWork::FreeFrag { ino: 9, uid: 1000, blkno: 120, size: 2048 })
            .unwrap();
        softdep.enqueue_deferred(DeferredWork::FreeFile { ino: 9, mode: 0o100644 }).unwrap();
        assert_eq!(softdep.stats().pending_free_frags, 2);

        assert_eq!(softdep.flush_worklist(&backend).unwrap(), 2);
        assert_eq!(backend.blocks.lock().unwrap().as_slice(), &[(9, 1000, 120, 2048)]);
        assert_eq!(backend.inodes.lock().unwrap().as_slice(), &[9]);
        let stats = softdep.stats();
        assert_eq!(stats.frags_released, 2);
        assert_eq!(stats.inodes_released, 1);
        assert_eq!(stats.pending_free_frags, 0);
        assert!(softdep.is_idle().unwrap());
    }

    #[test]
    fn test_backend_failure_is_reported_per_inode() {
        let softdep = softdep();
        let backend = Recorder::default();
        softdep
            .enqueue_deferred(DeferredWork::FreeFrag { ino: 12, uid: 0, blkno: 664, size: 4096 })
            .unwrap();
        assert_eq!(softdep.process_worklist(&backend).unwrap(), 1);
        assert!(!softdep.needs_fsck());
        assert_eq!(softdep.take_io_error(12).as_deref(), Some("bad sector"));
        assert!(softdep.is_idle().unwrap());
    }

    #[test]
    fn test_partial_freeblks_failure_needs_fsck() {
        let softdep = softdep();
        let backend = Recorder {
            fail_call: Some(2),
            ..Default::default()
        };
        let mut dblks = [0; NDADDR];
        dblks[..3].copy_from_slice(&[800, 808, 816]);
        softdep
            .guard(|g| {
                let fb = g.alloc(
                    Dep::Freeblks(Freeblks {
                        ino: 31,
                        uid: 0,
                        oldsize: 3 * 4096,
                        oldextsize: 0,
                        chkcnt: 12,
                        dblks,
                        iblks: [0; NIADDR],
                        extblks: [0; NXADDR],
                    }),
                    DepState::ATTACHED,
                );
                g.add_to_worklist(fb)
            })
            .unwrap();

        let err = softdep.process_worklist(&backend).unwrap_err();
        assert!(matches!(err, SoftdepError::AccountingMismatch { ino: 31, expected: 12, released: 4 }));
        assert_eq!(backend.blocks.lock().unwrap().as_slice(), &[(31, 0, 816, 4096)]);
        assert_eq!(softdep.stats().frags_released, 4);
        assert!(softdep.needs_fsck());
        assert!(matches!(softdep.process_worklist(&backend), Err(SoftdepError::NeedsFsck)));
    }

    #[test]
    fn test_freeblks_failure_before_any_release_is_reported() {
        let softdep = softdep();
        let backend = Recorder {
            fail_call: Some(1),
            ..Default::default()
        };
        let mut dblks = [0; NDADDR];
        dblks[0] = 800;
        softdep
            .guard(|g| {
                let fb = g.alloc(
                    Dep::Freeblks(Freeblks {
                        ino: 32,
                        uid: 0,
                        oldsize: 4096,
                        oldextsize: 0,
                        chkcnt: 4,
                        dblks,
                        iblks: [0; NIADDR],
                        extblks: [0; NXADDR],
                    }),
                    DepState::ATTACHED,
                );
                g.add_to_worklist(fb)
            })
            .unwrap();

        assert_eq!(softdep.process_worklist(&backend).unwrap(), 1);
        assert!(!softdep.needs_fsck());
        assert_eq!(softdep.take_io_error(32).as_deref(), Some("bad sector"));
        assert!(softdep.is_idle().unwrap());
    }

    fn dir(ino: Ino) -> InCoreInode {
        let mut ip = InCoreInode::new(ino, mode::IFDIR | 0o755, 0);
        ip.din.nlink = 2;
        ip.effnlink = 2;
        ip
    }

    fn write(softdep: &Softdep, buf: &mut BlockBuf) {
        let token = softdep.before_buffer_write(buf).unwrap();
        softdep.after_buffer_write(buf, token).unwrap();
    }

    #[test]
    fn test_moved_directory_drops_old_parent_after_dotdot_written() {
        let softdep = softdep();
        let backend = Recorder::default();
        // ".." of directory 20 moves from directory 5 to directory 6.
        let mut body = BlockBuf::new(BufId(900), 900, 4096);
        set_dirent_ino(&mut body.data, 32, 6).unwrap();
        softdep
            .on_dir_entry_changed(body.id, &dir(20), 32, 5, 6, RemoveKind::File)
            .unwrap();
        assert_eq!(softdep.process_worklist(&backend).unwrap(), 0);
        assert!(backend.links.lock().unwrap().is_empty());

        write(&softdep, &mut body);
        assert_eq!(softdep.process_worklist(&backend).unwrap(), 1);
        assert_eq!(backend.links.lock().unwrap().as_slice(), &[(5, 1)]);
        assert!(backend.truncated.lock().unwrap().is_empty());
        assert!(softdep.is_idle().unwrap());
    }

    #[test]
    fn test_reparented_directory_replaces_empty_one() {
        let softdep = softdep();
        let backend = Recorder::default();
        // Directory 20 arrives from another parent and takes the place of
        // the empty directory 21 in directory 6.
        let mut page = BlockBuf::new(BufId(901), 901, 4096);
        set_dirent_ino(&mut page.data, 64, 20).unwrap();
        let dap = softdep
            .on_dir_entry_changed(page.id, &dir(6), 64, 21, 20, RemoveKind::DirectoryReparented)
            .unwrap();
        let (_, state) = softdep.record_state(dap).unwrap();
        assert!(state.contains(DepState::DIRCHG));
        assert_eq!(softdep.queued_work(), 0);

        write(&softdep, &mut page);
        assert_eq!(softdep.process_worklist(&backend).unwrap(), 1);
        assert_eq!(backend.links.lock().unwrap().as_slice(), &[(21, 2)]);
        assert_eq!(backend.truncated.lock().unwrap().as_slice(), &[21]);
        // The moved directory keeps the parent's ".." link, so no follow-up.
        assert_eq!(softdep.queued_work(), 0);
        assert!(softdep.is_idle().unwrap());
    }

    #[test]
    fn test_link_count_below_effective_is_fatal() {
        let mut g = DepGraph::new(softdep_core::Geometry::new(4096, 1024), 100);
        let err = g.refresh_linkcnt(14, LinkCounts { nlink: 1, effnlink: 2 }).unwrap_err();
        assert!(err.is_fatal());
        g.refresh_linkcnt(14, LinkCounts { nlink: 2, effnlink: 2 }).unwrap();
        assert!(g.inodedeps.get(&14).is_none());
    }

    #[test]
    fn test_freeblks_mismatch() {
        let mut g = DepGraph::new(softdep_core::Geometry::new(4096, 1024), 100);
        let fb = g.alloc(
            Dep::Freeblks(Freeblks {
                ino: 30,
                uid: 0,
                oldsize: 4096,
                oldextsize: 0,
                chkcnt: 8,
                dblks: [0; NDADDR],
                iblks: [0; NIADDR],
                extblks: [0; NXADDR],
            }),
            DepState::ATTACHED,
        );
        let err = g.finish_freeblks(fb, 4).unwrap_err();
        assert!(matches!(err, SoftdepError::AccountingMismatch { ino: 30, expected: 8, released: 4 }));
        assert!(g.arena.get(fb).is_none());
    }
}
