// Unmount drain and buffer bookkeeping

use super::graph::DepGraph;
use super::records::*;
use super::state::DepState;
use super::{BufferFlusher, FsBackend, Softdep};
use softdep_core::{BufId, Ino, SoftdepError};

impl DepGraph {
    /// Outstanding dependencies a write of `buf` would still have to settle
    pub fn count_dependencies(&self, buf: BufId) -> Result<usize, SoftdepError> {
        let Some(deps) = self.buf_deps.get(&buf) else {
            return Ok(0);
        };
        let mut count = 0;
        for id in deps {
            count += match &self.rec(*id)?.dep {
                Dep::Pagedep(page) => {
                    page.diraddhd.iter().map(Vec::len).sum::<usize>() + page.pendinghd.len() + page.dirremhd.len()
                }
                Dep::Inodedep(dep) => {
                    let unsafe_map = usize::from(!self.state(*id)?.contains(DepState::DEPCOMPLETE));
                    unsafe_map
                        + dep.bufwait.len()
                        + dep.inowait.len()
                        + dep.inoupdt.len()
                        + dep.newinoupdt.len()
                        + dep.extupdt.len()
                        + dep.newextupdt.len()
                }
                Dep::Indirdep(dep) => dep.deplisthd.len() + dep.freefrags.len(),
                Dep::Bmsafemap(map) => {
                    map.allocdirecthd.len() + map.allocindirhd.len() + map.inodedephd.len() + map.newblkhd.len()
                }
                _ => 1,
            };
        }
        Ok(count)
    }

    /// The buffer cache renamed `old` to `new`
    pub fn move_dependencies(&mut self, old: BufId, new: BufId) -> Result<(), SoftdepError> {
        self.ensure_not_in_flight(old)?;
        if self.buf_deps.get(&new).is_some_and(|deps| !deps.is_empty()) {
            return Err(SoftdepError::inconsistency(
                "move_dependencies",
                format!("{} already has dependencies", new),
            ));
        }
        let deps = self.buf_deps.remove(&old).unwrap_or_default();
        for id in &deps {
            self.rec_mut(*id)?.on = Some(WorkList::Buf(new));
            match &mut self.rec_mut(*id)?.dep {
                Dep::Bmsafemap(map) => map.buf = new,
                Dep::Mkdir(mkdir) if mkdir.buf == Some(old) => mkdir.buf = Some(new),
                _ => {}
            }
        }
        if let Some(bm) = self.bmsafemaps.remove(&old) {
            self.bmsafemaps.insert(new, bm);
        }
        if !deps.is_empty() {
            log::debug!("softdep: moved {} dependencies from {} to {}", deps.len(), old, new);
            self.buf_deps.insert(new, deps);
        }
        Ok(())
    }

    /// Buffers to write, in order, so the dependencies of `ino` can settle
    pub fn inode_flush_targets(&self, ino: Ino) -> Result<Vec<BufId>, SoftdepError> {
        let Some(inodedep) = self.inodedeps.get(&ino).copied() else {
            return Ok(Vec::new());
        };
        let mut targets = Vec::new();
        let dep = self.inodedep(inodedep)?;
        if let Some(bm) = dep.bmsafemap {
            targets.push(self.bmsafemap(bm)?.buf);
        }
        let adps = dep
            .inoupdt
            .iter()
            .chain(&dep.newinoupdt)
            .chain(&dep.extupdt)
            .chain(&dep.newextupdt);
        for adp in adps {
            if let Some(bm) = self.allocdirect(*adp)?.bmsafemap {
                if !self.state(*adp)?.contains(DepState::DEPCOMPLETE) {
                    targets.push(self.bmsafemap(bm)?.buf);
                }
            }
            if let Some(WorkList::Buf(data)) = self.rec(*adp)?.on {
                targets.push(data);
            }
        }
        if let Some(WorkList::Buf(own)) = self.rec(inodedep)?.on {
            targets.push(own);
        }
        for id in dep.pendinghd.iter().chain(&dep.bufwait) {
            if let Dep::Diradd(dap) = &self.rec(*id)?.dep {
                if let Some(WorkList::Buf(page)) = self.rec(dap.pagedep)?.on {
                    targets.push(page);
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        targets.retain(|buf| seen.insert(*buf));
        Ok(targets)
    }

    /// Buffers to write so `ino` and every entry naming it are durable:
    /// its own targets, the bodies of new directories it names, then what
    /// the parent directories still need for those entries to commit
    pub fn inode_sync_targets(&self, ino: Ino) -> Result<Vec<BufId>, SoftdepError> {
        let mut targets = self.inode_flush_targets(ino)?;
        let Some(inodedep) = self.inodedeps.get(&ino).copied() else {
            return Ok(targets);
        };
        let dep = self.inodedep(inodedep)?;
        let mut parents = Vec::new();
        for id in dep.pendinghd.iter().chain(&dep.bufwait) {
            let Dep::Diradd(dap) = &self.rec(*id)?.dep else {
                continue;
            };
            if self.state(*id)?.contains(DepState::MKDIR_BODY) {
                for mkdir in &self.mkdirs {
                    let body = self.mkdir(*mkdir)?;
                    if body.diradd == *id {
                        targets.extend(body.buf);
                    }
                }
            }
            let parent = self.pagedep(dap.pagedep)?.ino;
            if parent != ino && !parents.contains(&parent) {
                parents.push(parent);
            }
        }
        for parent in parents {
            targets.extend(self.inode_flush_targets(parent)?);
        }
        let mut seen = std::collections::HashSet::new();
        targets.retain(|buf| seen.insert(*buf));
        Ok(targets)
    }
}

impl Softdep {
    /// Flush and run work until the graph is empty. Fails with
    /// `DrainStalled` when the configured passes do not converge.
    pub fn drain_all(&self, flusher: &dyn BufferFlusher, backend: &dyn FsBackend) -> Result<(), SoftdepError> {
        let passes = self.config.drain_passes;
        for pass in 0..passes {
            self.flush_worklist(backend)?;
            if self.is_idle()? {
                log::debug!("softdep: drained after {} passes", pass);
                return Ok(());
            }
            flusher.flush_dirty(self)?;
        }
        self.flush_worklist(backend)?;
        if self.is_idle()? {
            return Ok(());
        }
        let (live, queued) = self.guard(|g| Ok((g.arena.len(), g.queue.len())))?;
        log::error!(
            "softdep: {} records and {} work items left after {} drain passes",
            live,
            queued,
            passes
        );
        Err(self.poison(SoftdepError::DrainStalled(passes)))
    }

    /// Write buffers until `ino`, its blocks and the entries naming it are
    /// on disk. Other dependencies are left alone and no work is run.
    /// Fails with `DrainStalled` when the configured passes do not converge.
    pub fn sync_inode(&self, ino: Ino, flusher: &dyn BufferFlusher) -> Result<(), SoftdepError> {
        let passes = self.config.drain_passes;
        let mut written = 0;
        for _ in 0..passes {
            let targets = self.guard(|g| g.inode_sync_targets(ino))?;
            if targets.is_empty() {
                log::debug!("softdep: inode {} durable after {} writes", ino, written);
                return Ok(());
            }
            for buf in targets {
                flusher.flush_buffer(self, buf)?;
                written += 1;
            }
        }
        let left = self.guard(|g| g.inode_sync_targets(ino))?;
        if left.is_empty() {
            return Ok(());
        }
        log::error!(
            "softdep: inode {} still waits on {} buffers after {} passes",
            ino,
            left.len(),
            passes
        );
        Err(self.poison(SoftdepError::DrainStalled(passes)))
    }

    /// A buffer is being thrown away. It must not carry dependencies.
    pub fn buffer_invalidated(&self, buf: BufId) -> Result<(), SoftdepError> {
        self.guard(|g| {
            g.ensure_not_in_flight(buf)?;
            match g.buf_deps.get(&buf) {
                Some(deps) if !deps.is_empty() => Err(SoftdepError::inconsistency(
                    "buffer_invalidated",
                    format!("{} discarded with {} dependencies", buf, deps.len()),
                )),
                _ => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use softdep_core::types::mode;
    use softdep_core::{Geometry, InCoreInode};

    fn graph() -> DepGraph {
        DepGraph::new(Geometry::new(4096, 1024), 100)
    }

    #[test]
    fn test_move_dependencies() {
        let mut g = graph();
        g.setup_inomapdep(BufId(1), 30).unwrap();
        let bm = g.bmsafemaps[&BufId(1)];
        g.move_dependencies(BufId(1), BufId(2)).unwrap();
        assert_eq!(g.bmsafemaps.get(&BufId(2)), Some(&bm));
        assert_eq!(g.bmsafemap(bm).unwrap().buf, BufId(2));
        assert!(g.buf_deps.get(&BufId(1)).is_none());
        assert_eq!(g.count_dependencies(BufId(2)).unwrap(), 1);

        g.setup_inomapdep(BufId(1), 31).unwrap();
        assert!(g.move_dependencies(BufId(1), BufId(2)).is_err());
    }

    struct NoWrites;

    impl BufferFlusher for NoWrites {
        fn flush_dirty(&self, _softdep: &Softdep) -> Result<(), SoftdepError> {
            Ok(())
        }

        fn flush_buffer(&self, _softdep: &Softdep, _buf: BufId) -> Result<(), SoftdepError> {
            Ok(())
        }
    }

    #[test]
    fn test_sync_inode_stalls_without_writes() {
        let softdep = Softdep::new(softdep_core::SoftdepConfig {
            drain_passes: 3,
            ..Default::default()
        })
        .unwrap();
        softdep.on_inode_allocated(BufId(1), 33).unwrap();
        assert!(softdep.sync_inode(34, &NoWrites).is_ok());
        assert!(matches!(softdep.sync_inode(33, &NoWrites), Err(SoftdepError::DrainStalled(3))));
        assert!(softdep.needs_fsck());
    }

    #[test]
    fn test_sync_targets_include_parent_directory() {
        let mut g = graph();
        let mut dp = InCoreInode::new(2, mode::IFDIR, 0);
        dp.din.nlink = 2;
        dp.effnlink = 2;
        g.setup_inomapdep(BufId(1), 40).unwrap();
        g.setup_directory_add(BufId(900), &dp, 64, 40, None).unwrap();
        // The parent has an inode update of its own waiting on its buffer.
        g.change_linkcnt(&dp).unwrap();
        let mut inode_buf = softdep_core::BlockBuf::new(BufId(3), 3, 4096);
        g.update_inodeblock(&dp, &mut inode_buf, false).unwrap();

        let targets = g.inode_sync_targets(40).unwrap();
        assert_eq!(targets, vec![BufId(1), BufId(900), BufId(3)]);
    }

    #[test]
    fn test_flush_targets_start_with_bitmap() {
        let mut g = graph();
        let ip = InCoreInode::new(32, mode::IFREG, 0);
        g.setup_inomapdep(BufId(1), 32).unwrap();
        g.setup_blkmapdep(BufId(5), 800).unwrap();
        g.setup_allocdirect(&ip, 0, 800, 0, 4096, 0, BufId(800), super::super::alloc::PtrArea::Data)
            .unwrap();
        let targets = g.inode_flush_targets(32).unwrap();
        assert_eq!(targets, vec![BufId(1), BufId(5), BufId(800)]);
        assert!(g.inode_flush_targets(99).unwrap().is_empty());
    }
}
