// Dependency record kinds
//
// Every tracked item is a `Record`: a state-flag set, the worklist it is
// linked on (if any), and a kind-specific body. Lists between records
// hold `DepId` handles into the mount's arena.

use super::arena::DepId;
use super::state::DepState;
use serde::Serialize;
use softdep_core::layout::{NDADDR, NIADDR, NXADDR};
use softdep_core::{BlockNo, BufId, Ino, Lbn};
use std::fmt;

/// Buckets a pagedep spreads its uncommitted diradds over
pub const DAHASHSZ: usize = 6;

pub fn dirhash(offset: usize) -> usize {
    (offset >> 2) % DAHASHSZ
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum DepKind {
    Pagedep,
    Inodedep,
    Newblk,
    Bmsafemap,
    Allocdirect,
    Indirdep,
    Allocindir,
    Freefrag,
    Freeblks,
    Freefile,
    Diradd,
    Mkdir,
    Dirrem,
    Newdirblk,
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DepKind::Pagedep => "pagedep",
            DepKind::Inodedep => "inodedep",
            DepKind::Newblk => "newblk",
            DepKind::Bmsafemap => "bmsafemap",
            DepKind::Allocdirect => "allocdirect",
            DepKind::Indirdep => "indirdep",
            DepKind::Allocindir => "allocindir",
            DepKind::Freefrag => "freefrag",
            DepKind::Freeblks => "freeblks",
            DepKind::Freefile => "freefile",
            DepKind::Diradd => "diradd",
            DepKind::Mkdir => "mkdir",
            DepKind::Dirrem => "dirrem",
            DepKind::Newdirblk => "newdirblk",
        };
        f.write_str(name)
    }
}

/// The worklist a record is currently linked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkList {
    /// Dependency list of a cached buffer
    Buf(BufId),
    /// Inodedep list released when the inode buffer is written
    BufWait(DepId),
    /// Inodedep list released by the next inode update
    InoWait(DepId),
    /// Committed diradds naming the inode
    InodePending(DepId),
    /// Pending work queue
    Queue,
}

pub(crate) struct Record {
    pub state: DepState,
    pub on: Option<WorkList>,
    pub dep: Dep,
}

pub(crate) enum Dep {
    Pagedep(Pagedep),
    Inodedep(Inodedep),
    Newblk(Newblk),
    Bmsafemap(Bmsafemap),
    Allocdirect(Allocdirect),
    Indirdep(Indirdep),
    Allocindir(Allocindir),
    Freefrag(Freefrag),
    Freeblks(Freeblks),
    Freefile(Freefile),
    Diradd(Diradd),
    Mkdir(Mkdir),
    Dirrem(Dirrem),
    Newdirblk(Newdirblk),
}

impl Dep {
    pub fn kind(&self) -> DepKind {
        match self {
            Dep::Pagedep(_) => DepKind::Pagedep,
            Dep::Inodedep(_) => DepKind::Inodedep,
            Dep::Newblk(_) => DepKind::Newblk,
            Dep::Bmsafemap(_) => DepKind::Bmsafemap,
            Dep::Allocdirect(_) => DepKind::Allocdirect,
            Dep::Indirdep(_) => DepKind::Indirdep,
            Dep::Allocindir(_) => DepKind::Allocindir,
            Dep::Freefrag(_) => DepKind::Freefrag,
            Dep::Freeblks(_) => DepKind::Freeblks,
            Dep::Freefile(_) => DepKind::Freefile,
            Dep::Diradd(_) => DepKind::Diradd,
            Dep::Mkdir(_) => DepKind::Mkdir,
            Dep::Dirrem(_) => DepKind::Dirrem,
            Dep::Newdirblk(_) => DepKind::Newdirblk,
        }
    }
}

/// One directory block with pending entry changes
#[derive(Default)]
pub(crate) struct Pagedep {
    pub ino: Ino,
    pub lbn: Lbn,
    /// Uncommitted diradds hashed by entry offset
    pub diraddhd: [Vec<DepId>; DAHASHSZ],
    /// Diradds whose inode is durable, waiting for this block's write
    pub pendinghd: Vec<DepId>,
    /// Dirrems waiting for this block's write
    pub dirremhd: Vec<DepId>,
}

impl Pagedep {
    pub fn is_idle(&self) -> bool {
        self.diraddhd.iter().all(Vec::is_empty) && self.pendinghd.is_empty() && self.dirremhd.is_empty()
    }
}

/// In-flight metadata of one inode
#[derive(Default)]
pub(crate) struct Inodedep {
    pub ino: Ino,
    /// nlink - effnlink
    pub nlinkdelta: i32,
    /// The in-core inode changed since it last reached disk
    pub unwritten: bool,
    /// Full image stashed while the inode is written as zeroes
    pub savedino: Option<Vec<u8>>,
    pub savedsize: Option<u64>,
    pub savedextsize: Option<u32>,
    /// Inode bitmap tracker until the bitmap is durable
    pub bmsafemap: Option<DepId>,
    pub pendinghd: Vec<DepId>,
    pub bufwait: Vec<DepId>,
    pub inowait: Vec<DepId>,
    /// Allocdirects already copied into the inode buffer, sorted by lbn
    pub inoupdt: Vec<DepId>,
    /// Allocdirects not yet copied into the inode buffer, sorted by lbn
    pub newinoupdt: Vec<DepId>,
    pub extupdt: Vec<DepId>,
    pub newextupdt: Vec<DepId>,
}

impl Inodedep {
    pub fn lists_empty(&self) -> bool {
        self.pendinghd.is_empty()
            && self.bufwait.is_empty()
            && self.inowait.is_empty()
            && self.inoupdt.is_empty()
            && self.newinoupdt.is_empty()
            && self.extupdt.is_empty()
            && self.newextupdt.is_empty()
    }
}

pub(crate) struct Newblk {
    pub blkno: BlockNo,
    pub bmsafemap: Option<DepId>,
}

/// One bitmap buffer with allocations not yet durable
pub(crate) struct Bmsafemap {
    pub buf: BufId,
    pub allocdirecthd: Vec<DepId>,
    pub allocindirhd: Vec<DepId>,
    pub inodedephd: Vec<DepId>,
    pub newblkhd: Vec<DepId>,
}

pub(crate) struct Allocdirect {
    /// Direct index, or NDADDR + level for an indirect root pointer
    pub lbn: Lbn,
    pub newblkno: BlockNo,
    pub oldblkno: BlockNo,
    pub newsize: u32,
    pub oldsize: u32,
    pub freefrag: Option<DepId>,
    pub inodedep: DepId,
    pub bmsafemap: Option<DepId>,
    pub newdirblk: Option<DepId>,
}

/// One indirect block with pointer slots not yet safe
pub(crate) struct Indirdep {
    pub blkno: BlockNo,
    /// Inode owning the indirect block
    pub ino: Ino,
    /// Image holding only durable pointers
    pub safe_copy: Vec<u8>,
    /// Live bytes stashed while the safe copy is written
    pub saved_live: Option<Vec<u8>>,
    pub deplisthd: Vec<DepId>,
    /// Allocindirs completed while the safe copy was in flight
    pub donehd: Vec<DepId>,
    /// Freefrags of replaced pointers, released once a write carries the new pointer
    pub freefrags: Vec<DepId>,
    /// Freefrags riding on the write in flight
    pub freefrags_writing: Vec<DepId>,
}

pub(crate) struct Allocindir {
    pub ptrno: usize,
    pub newblkno: BlockNo,
    pub oldblkno: BlockNo,
    pub freefrag: Option<DepId>,
    pub indirdep: Option<DepId>,
    pub bmsafemap: Option<DepId>,
}

pub(crate) struct Freefrag {
    pub ino: Ino,
    pub uid: u32,
    pub blkno: BlockNo,
    pub size: u32,
}

pub(crate) struct Freeblks {
    pub ino: Ino,
    pub uid: u32,
    pub oldsize: u64,
    pub oldextsize: u32,
    /// Expected fragments to release
    pub chkcnt: u64,
    pub dblks: [BlockNo; NDADDR],
    pub iblks: [BlockNo; NIADDR],
    pub extblks: [BlockNo; NXADDR],
}

pub(crate) struct Freefile {
    pub ino: Ino,
    pub mode: u16,
}

pub(crate) struct Diradd {
    /// Entry offset within the directory block
    pub offset: usize,
    pub newinum: Ino,
    pub pagedep: DepId,
    /// Removal of the entry this one replaces (DIRCHG)
    pub previous: Option<DepId>,
}

pub(crate) struct Mkdir {
    pub diradd: DepId,
    /// Body buffer for MKDIR_BODY, parent inode buffer otherwise
    pub buf: Option<BufId>,
}

pub(crate) struct Dirrem {
    pub oldinum: Ino,
    pub dirinum: Ino,
    pub pagedep: Option<DepId>,
}

pub(crate) struct Newdirblk {
    pub pagedep: DepId,
}
