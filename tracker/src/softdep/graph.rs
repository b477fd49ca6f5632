// Dependency graph of one mount: record arena, lookup tables and list plumbing

use super::arena::{Arena, DepId};
use super::records::*;
use super::state::{DepState, MONOTONIC};
use super::stats::SoftdepStats;
use softdep_core::{BlockNo, BufId, Geometry, Ino, Lbn, SoftdepError};
use std::collections::{HashMap, VecDeque};

macro_rules! record_accessors {
    ($($get:ident, $get_mut:ident, $variant:ident;)*) => {
        $(
            #[allow(dead_code)]
            pub fn $get(&self, id: DepId) -> Result<&$variant, SoftdepError> {
                match self.arena.get(id).map(|rec| &rec.dep) {
                    Some(Dep::$variant(dep)) => Ok(dep),
                    Some(other) => Err(wrong_kind(stringify!($get), id, other.kind())),
                    None => Err(stale(stringify!($get), id)),
                }
            }

            #[allow(dead_code)]
            pub fn $get_mut(&mut self, id: DepId) -> Result<&mut $variant, SoftdepError> {
                match self.arena.get_mut(id).map(|rec| &mut rec.dep) {
                    Some(Dep::$variant(dep)) => Ok(dep),
                    Some(other) => Err(wrong_kind(stringify!($get), id, other.kind())),
                    None => Err(stale(stringify!($get), id)),
                }
            }
        )*
    };
}

fn stale(context: &'static str, id: DepId) -> SoftdepError {
    SoftdepError::inconsistency(context, format!("{} does not name a live record", id))
}

fn wrong_kind(context: &'static str, id: DepId, kind: DepKind) -> SoftdepError {
    SoftdepError::inconsistency(context, format!("{} is a {}", id, kind))
}

/// Remove the first occurrence of `id`; reports whether it was present
pub(crate) fn unlink(list: &mut Vec<DepId>, id: DepId) -> bool {
    match list.iter().position(|x| *x == id) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

pub(crate) struct DepGraph {
    pub geom: Geometry,
    pub max_dependencies: usize,
    pub arena: Arena<Record>,
    /// Dependency list of every buffer that has one
    pub buf_deps: HashMap<BufId, Vec<DepId>>,
    pub pagedeps: HashMap<(Ino, Lbn), DepId>,
    pub inodedeps: HashMap<Ino, DepId>,
    pub newblks: HashMap<BlockNo, DepId>,
    pub bmsafemaps: HashMap<BufId, DepId>,
    /// Indirdeps of truncated indirect blocks, keyed by block number
    pub going_away: HashMap<BlockNo, DepId>,
    pub mkdirs: Vec<DepId>,
    pub queue: VecDeque<DepId>,
    /// Buffers between before_buffer_write and completion, with their write sequence
    pub in_flight: HashMap<BufId, u64>,
    pub write_seq: u64,
    pub io_errors: HashMap<Ino, String>,
    pub num_inodedep: usize,
    pub num_dirrem: usize,
    pub cleanup_requested: bool,
    pub stats: SoftdepStats,
}

impl DepGraph {
    pub fn new(geom: Geometry, max_dependencies: usize) -> Self {
        Self {
            geom,
            max_dependencies,
            arena: Arena::new(),
            buf_deps: HashMap::new(),
            pagedeps: HashMap::new(),
            inodedeps: HashMap::new(),
            newblks: HashMap::new(),
            bmsafemaps: HashMap::new(),
            going_away: HashMap::new(),
            mkdirs: Vec::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            write_seq: 0,
            io_errors: HashMap::new(),
            num_inodedep: 0,
            num_dirrem: 0,
            cleanup_requested: false,
            stats: SoftdepStats::default(),
        }
    }

    record_accessors! {
        pagedep, pagedep_mut, Pagedep;
        inodedep, inodedep_mut, Inodedep;
        newblk, newblk_mut, Newblk;
        bmsafemap, bmsafemap_mut, Bmsafemap;
        allocdirect, allocdirect_mut, Allocdirect;
        indirdep, indirdep_mut, Indirdep;
        allocindir, allocindir_mut, Allocindir;
        freefrag, freefrag_mut, Freefrag;
        freeblks, freeblks_mut, Freeblks;
        freefile, freefile_mut, Freefile;
        diradd, diradd_mut, Diradd;
        mkdir, mkdir_mut, Mkdir;
        dirrem, dirrem_mut, Dirrem;
        newdirblk, newdirblk_mut, Newdirblk;
    }

    pub fn rec(&self, id: DepId) -> Result<&Record, SoftdepError> {
        self.arena.get(id).ok_or_else(|| stale("record", id))
    }

    pub fn rec_mut(&mut self, id: DepId) -> Result<&mut Record, SoftdepError> {
        self.arena.get_mut(id).ok_or_else(|| stale("record", id))
    }

    pub fn kind(&self, id: DepId) -> Result<DepKind, SoftdepError> {
        Ok(self.rec(id)?.dep.kind())
    }

    pub fn state(&self, id: DepId) -> Result<DepState, SoftdepError> {
        Ok(self.rec(id)?.state)
    }

    pub fn set_flags(&mut self, id: DepId, flags: DepState) -> Result<(), SoftdepError> {
        self.rec_mut(id)?.state.insert(flags);
        Ok(())
    }

    /// Clear transient flags. Completion flags never go backwards.
    pub fn clear_flags(&mut self, id: DepId, flags: DepState) -> Result<(), SoftdepError> {
        let rec = self.rec_mut(id)?;
        if flags.intersects(MONOTONIC) && rec.state.intersects(flags & MONOTONIC) {
            return Err(SoftdepError::inconsistency(
                "clear_flags",
                format!("attempt to clear {:?} on {} {}", flags & MONOTONIC, rec.dep.kind(), id),
            ));
        }
        rec.state.remove(flags);
        Ok(())
    }

    /// The all-complete predicate, including kind-specific preconditions
    pub fn all_complete(&self, id: DepId) -> Result<bool, SoftdepError> {
        let rec = self.rec(id)?;
        let done = match &rec.dep {
            Dep::Inodedep(dep) => rec.state.all_complete() && !dep.unwritten,
            Dep::Diradd(_) => rec.state.all_complete() && !rec.state.intersects(DepState::MKDIR_PENDING),
            _ => rec.state.all_complete(),
        };
        Ok(done)
    }

    pub fn alloc(&mut self, dep: Dep, state: DepState) -> DepId {
        let kind = dep.kind();
        let id = self.arena.insert(Record { state, on: None, dep });
        self.stats.records_created += 1;
        log::trace!("softdep: new {} {}", kind, id);
        id
    }

    /// Destroy a record. It must no longer sit on any worklist.
    pub fn free_record(&mut self, id: DepId) -> Result<Dep, SoftdepError> {
        let rec = self.rec(id)?;
        if rec.on.is_some() || rec.state.contains(DepState::ONWORKLIST) {
            return Err(SoftdepError::inconsistency(
                "free_record",
                format!("{} {} still on a worklist", rec.dep.kind(), id),
            ));
        }
        let rec = self.arena.remove(id).ok_or_else(|| stale("free_record", id))?;
        match &rec.dep {
            Dep::Pagedep(dep) => {
                if self.pagedeps.get(&(dep.ino, dep.lbn)) == Some(&id) {
                    self.pagedeps.remove(&(dep.ino, dep.lbn));
                }
            }
            Dep::Inodedep(dep) => {
                if self.inodedeps.get(&dep.ino) == Some(&id) {
                    self.inodedeps.remove(&dep.ino);
                }
                self.num_inodedep -= 1;
            }
            Dep::Newblk(dep) => {
                if self.newblks.get(&dep.blkno) == Some(&id) {
                    self.newblks.remove(&dep.blkno);
                }
            }
            Dep::Bmsafemap(dep) => {
                if self.bmsafemaps.get(&dep.buf) == Some(&id) {
                    self.bmsafemaps.remove(&dep.buf);
                }
            }
            Dep::Indirdep(dep) => {
                if self.going_away.get(&dep.blkno) == Some(&id) {
                    self.going_away.remove(&dep.blkno);
                }
            }
            Dep::Dirrem(_) => self.num_dirrem -= 1,
            _ => {}
        }
        self.stats.records_freed += 1;
        log::trace!("softdep: freed {} {}", rec.dep.kind(), id);
        Ok(rec.dep)
    }

    fn list_mut(&mut self, list: WorkList) -> Result<&mut Vec<DepId>, SoftdepError> {
        match list {
            WorkList::Buf(buf) => Ok(self.buf_deps.entry(buf).or_default()),
            WorkList::BufWait(owner) => Ok(&mut self.inodedep_mut(owner)?.bufwait),
            WorkList::InoWait(owner) => Ok(&mut self.inodedep_mut(owner)?.inowait),
            WorkList::InodePending(owner) => Ok(&mut self.inodedep_mut(owner)?.pendinghd),
            WorkList::Queue => Err(SoftdepError::inconsistency("worklist", "queue is not a vector list")),
        }
    }

    pub fn worklist_insert(&mut self, list: WorkList, id: DepId) -> Result<(), SoftdepError> {
        let rec = self.rec_mut(id)?;
        if let Some(current) = rec.on {
            return Err(SoftdepError::inconsistency(
                "worklist_insert",
                format!("{} {} already on {:?}", rec.dep.kind(), id, current),
            ));
        }
        rec.on = Some(list);
        rec.state.insert(DepState::ONWORKLIST);
        match list {
            WorkList::Queue => self.queue.push_back(id),
            _ => self.list_mut(list)?.push(id),
        }
        Ok(())
    }

    pub fn worklist_remove(&mut self, id: DepId) -> Result<(), SoftdepError> {
        let rec = self.rec_mut(id)?;
        let list = rec.on.take().ok_or_else(|| {
            SoftdepError::inconsistency("worklist_remove", format!("{} {} not on a worklist", rec.dep.kind(), id))
        })?;
        rec.state.remove(DepState::ONWORKLIST);
        let found = match list {
            WorkList::Queue => match self.queue.iter().position(|x| *x == id) {
                Some(pos) => self.queue.remove(pos).is_some(),
                None => false,
            },
            WorkList::Buf(buf) => {
                let found = self.buf_deps.get_mut(&buf).map(|deps| unlink(deps, id)).unwrap_or(false);
                if self.buf_deps.get(&buf).is_some_and(Vec::is_empty) {
                    self.buf_deps.remove(&buf);
                }
                found
            }
            _ => unlink(self.list_mut(list)?, id),
        };
        if !found {
            return Err(SoftdepError::inconsistency("worklist_remove", format!("{} missing from {:?}", id, list)));
        }
        Ok(())
    }

    /// Remove from a worklist only if linked on one
    pub fn worklist_detach(&mut self, id: DepId) -> Result<(), SoftdepError> {
        if self.rec(id)?.on.is_some() {
            self.worklist_remove(id)?;
        }
        Ok(())
    }

    /// Detach and return the whole dependency list of a buffer
    pub fn take_buf_deps(&mut self, buf: BufId) -> Result<Vec<DepId>, SoftdepError> {
        let deps = self.buf_deps.remove(&buf).unwrap_or_default();
        for id in &deps {
            let rec = self.rec_mut(*id)?;
            rec.on = None;
            rec.state.remove(DepState::ONWORKLIST);
        }
        Ok(deps)
    }

    pub fn add_to_worklist(&mut self, id: DepId) -> Result<(), SoftdepError> {
        self.worklist_insert(WorkList::Queue, id)
    }

    pub fn ensure_not_in_flight(&self, buf: BufId) -> Result<(), SoftdepError> {
        if self.in_flight.contains_key(&buf) {
            log::warn!("softdep: {} changed while its write is in flight", buf);
            return Err(SoftdepError::WriteInProgress(buf));
        }
        Ok(())
    }

    pub fn find_on_buf(&self, buf: BufId, kind: DepKind) -> Result<Option<DepId>, SoftdepError> {
        if let Some(deps) = self.buf_deps.get(&buf) {
            for id in deps {
                if self.kind(*id)? == kind {
                    return Ok(Some(*id));
                }
            }
        }
        Ok(None)
    }

    /// Find or create the pagedep of directory `ino` block `lbn`, making
    /// sure it rides on the block's buffer
    pub fn pagedep_lookup(&mut self, ino: Ino, lbn: Lbn, buf: BufId) -> Result<(DepId, bool), SoftdepError> {
        if let Some(id) = self.pagedeps.get(&(ino, lbn)).copied() {
            if self.rec(id)?.on.is_none() {
                self.worklist_insert(WorkList::Buf(buf), id)?;
            }
            return Ok((id, false));
        }
        let id = self.alloc(Dep::Pagedep(Pagedep { ino, lbn, ..Default::default() }), DepState::empty());
        self.pagedeps.insert((ino, lbn), id);
        self.worklist_insert(WorkList::Buf(buf), id)?;
        Ok((id, true))
    }

    /// Find or create the inodedep of `ino`. New inodedeps start all-complete.
    pub fn inodedep_lookup(&mut self, ino: Ino) -> (DepId, bool) {
        if let Some(id) = self.inodedeps.get(&ino) {
            return (*id, false);
        }
        (self.inodedep_create(ino, DepState::ALLCOMPLETE), true)
    }

    pub fn inodedep_create(&mut self, ino: Ino, state: DepState) -> DepId {
        if self.num_inodedep >= self.max_dependencies {
            self.stats.inodedep_limit_hits += 1;
            if !self.cleanup_requested {
                log::debug!("softdep: {} inodedeps exceed limit, requesting cleanup", self.num_inodedep);
            }
            self.cleanup_requested = true;
        }
        let id = self.alloc(Dep::Inodedep(Inodedep { ino, ..Default::default() }), state);
        self.inodedeps.insert(ino, id);
        self.num_inodedep += 1;
        id
    }

    /// Find or create the tracker of bitmap buffer `buf`
    pub fn bmsafemap_lookup(&mut self, buf: BufId) -> Result<DepId, SoftdepError> {
        if let Some(id) = self.bmsafemaps.get(&buf) {
            return Ok(*id);
        }
        let id = self.alloc(
            Dep::Bmsafemap(Bmsafemap {
                buf,
                allocdirecthd: Vec::new(),
                allocindirhd: Vec::new(),
                inodedephd: Vec::new(),
                newblkhd: Vec::new(),
            }),
            DepState::empty(),
        );
        self.bmsafemaps.insert(buf, id);
        self.worklist_insert(WorkList::Buf(buf), id)?;
        Ok(id)
    }

    pub fn new_dirrem_count(&mut self) {
        self.num_dirrem += 1;
        if self.num_dirrem > self.max_dependencies / 2 {
            self.stats.dirrem_limit_hits += 1;
            self.cleanup_requested = true;
        }
    }

    /// Free an inodedep that no longer tracks anything
    pub fn free_inodedep(&mut self, id: DepId) -> Result<bool, SoftdepError> {
        let rec = self.rec(id)?;
        let dep = self.inodedep(id)?;
        if rec.on.is_some()
            || !self.all_complete(id)?
            || !dep.lists_empty()
            || dep.nlinkdelta != 0
            || dep.savedino.is_some()
        {
            return Ok(false);
        }
        self.free_record(id)?;
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty() && self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> DepGraph {
        DepGraph::new(Geometry::new(4096, 1024), 100)
    }

    #[test]
    fn test_worklist_membership() {
        let mut g = graph();
        let (ino, _) = g.inodedep_lookup(5);
        g.worklist_insert(WorkList::Buf(BufId(9)), ino).unwrap();
        assert!(g.state(ino).unwrap().contains(DepState::ONWORKLIST));
        assert!(g.worklist_insert(WorkList::Queue, ino).is_err());

        let taken = g.take_buf_deps(BufId(9)).unwrap();
        assert_eq!(taken, vec![ino]);
        assert!(!g.state(ino).unwrap().contains(DepState::ONWORKLIST));
        assert!(g.free_inodedep(ino).unwrap());
        assert!(g.is_empty());
    }

    #[test]
    fn test_completion_flags_are_monotonic() {
        let mut g = graph();
        let (ino, _) = g.inodedep_lookup(5);
        assert!(g.clear_flags(ino, DepState::DEPCOMPLETE).is_err());
        g.clear_flags(ino, DepState::IOSTARTED).unwrap();
        assert!(g.state(ino).unwrap().all_complete());
    }

    #[test]
    fn test_freed_record_does_not_resolve() {
        let mut g = graph();
        let (ino, _) = g.inodedep_lookup(7);
        g.free_record(ino).unwrap();
        assert!(matches!(g.inodedep(ino), Err(SoftdepError::Inconsistency { .. })));
        assert!(g.inodedeps.is_empty());
    }

    #[test]
    fn test_wrong_kind_is_reported() {
        let mut g = graph();
        let bm = g.bmsafemap_lookup(BufId(1)).unwrap();
        assert!(g.inodedep(bm).is_err());
        assert_eq!(g.bmsafemap(bm).unwrap().buf, BufId(1));
    }

    #[test]
    fn test_limit_requests_cleanup() {
        let mut g = DepGraph::new(Geometry::new(4096, 1024), 2);
        for ino in 10..14 {
            g.inodedep_lookup(ino);
        }
        assert!(g.cleanup_requested);
        assert_eq!(g.stats.inodedep_limit_hits, 2);
    }
}
