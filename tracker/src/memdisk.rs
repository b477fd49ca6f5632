// In-memory disk and buffer cache
//
// A small filesystem laid out as: block 0 unused, inode bitmap, block
// bitmap, inode table, then data blocks. It drives the tracker the way a
// real filesystem would and keeps every image that reaches the disk, so the
// on-disk state can be checked after any single write.

use crate::softdep::{BufferFlusher, FsBackend, LinkCounts, PointerSite, RemoveKind, RollbackToken, Softdep, WriteOutcome};
use softdep_core::layout::{dirent_ino, indirect_ptr, set_dirent_ino, set_indirect_ptr, DINODE_SIZE, NDADDR};
use softdep_core::types::mode;
use softdep_core::{BlockBuf, BlockNo, BufId, Dinode, Geometry, InCoreInode, Ino, SoftdepConfig, SoftdepError, ROOT_INO};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Fixed directory entry: inode number, name length, name
pub const DIRENT_SIZE: usize = 32;
pub const MAX_NAME: usize = DIRENT_SIZE - 5;
pub const NINODES: u32 = 64;
pub const NBLOCKS: u64 = 512;

const IBMAP_BLOCK: u64 = 1;
const BBMAP_BLOCK: u64 = 2;
const ITABLE_BLOCK: u64 = 3;

fn fs_error(message: impl Into<String>) -> SoftdepError {
    SoftdepError::Other(message.into())
}

fn bit(map: &[u8], n: u64) -> bool {
    map.get((n / 8) as usize).is_some_and(|byte| byte & (1 << (n % 8)) != 0)
}

fn set_bit(map: &mut [u8], n: u64, on: bool) {
    let byte = &mut map[(n / 8) as usize];
    if on {
        *byte |= 1 << (n % 8);
    } else {
        *byte &= !(1 << (n % 8));
    }
}

fn write_dirent(data: &mut [u8], offset: usize, ino: Ino, name: &str) -> Result<(), SoftdepError> {
    if name.is_empty() || name.len() > MAX_NAME {
        return Err(fs_error(format!("bad name {:?}", name)));
    }
    data[offset..offset + DIRENT_SIZE].fill(0);
    set_dirent_ino(data, offset, ino)?;
    data[offset + 4] = name.len() as u8;
    data[offset + 5..offset + 5 + name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}

fn dirent_name(data: &[u8], offset: usize) -> String {
    let len = (data[offset + 4] as usize).min(MAX_NAME);
    String::from_utf8_lossy(&data[offset + 5..offset + 5 + len]).into_owned()
}

#[derive(Default)]
struct DiskState {
    /// Last image written to each block
    disk: HashMap<BlockNo, Vec<u8>>,
    cache: BTreeMap<BlockNo, BlockBuf>,
    inodes: HashMap<Ino, InCoreInode>,
    /// In-core inodes not yet copied into their buffer
    dirty_inodes: BTreeSet<Ino>,
    writes: u64,
    violations: Vec<String>,
}

/// Where a directory entry lives
#[derive(Debug, Clone, Copy)]
struct Slot {
    lbn: u64,
    blkno: BlockNo,
    offset: usize,
    ino: Ino,
}

pub struct MemDisk {
    softdep: Arc<Softdep>,
    geom: Geometry,
    /// First data block index
    data_start: u64,
    check_writes: AtomicBool,
    state: Mutex<DiskState>,
}

impl MemDisk {
    /// Make a fresh filesystem holding only the root directory
    pub fn new(config: SoftdepConfig) -> Result<Self, SoftdepError> {
        let softdep = Arc::new(Softdep::new(config)?);
        let geom = softdep.geometry();
        let bsize = geom.bsize as usize;
        if (bsize as u64) * 8 < NBLOCKS || NINODES % geom.inopb != 0 {
            return Err(SoftdepError::Configuration(format!(
                "block size {} too small for the in-memory disk",
                bsize
            )));
        }
        let data_start = ITABLE_BLOCK + (NINODES / geom.inopb) as u64;
        let disk = MemDisk {
            softdep,
            geom,
            data_start,
            check_writes: AtomicBool::new(false),
            state: Mutex::new(DiskState::default()),
        };
        disk.mkfs()?;
        Ok(disk)
    }

    fn mkfs(&self) -> Result<(), SoftdepError> {
        let bsize = self.geom.bsize as usize;
        let mut st = self.lock();

        let mut ibmap = vec![0; bsize];
        for ino in 0..=ROOT_INO {
            set_bit(&mut ibmap, ino as u64, true);
        }
        let mut bbmap = vec![0; bsize];
        for index in 0..=self.data_start {
            set_bit(&mut bbmap, index, true);
        }
        st.disk.insert(self.blkno(IBMAP_BLOCK), ibmap);
        st.disk.insert(self.blkno(BBMAP_BLOCK), bbmap);
        for index in ITABLE_BLOCK..self.data_start {
            st.disk.insert(self.blkno(index), vec![0; bsize]);
        }

        let root_blk = self.blkno(self.data_start);
        let mut root = Dinode {
            mode: mode::IFDIR | 0o755,
            nlink: 2,
            size: bsize as u64,
            blocks: self.geom.frag as u64,
            ..Default::default()
        };
        root.db[0] = root_blk;
        let off = self.geom.dinode_offset(ROOT_INO);
        let itable = st
            .disk
            .get_mut(&self.inode_blkno(ROOT_INO))
            .ok_or_else(|| fs_error("inode table missing"))?;
        root.encode_into(&mut itable[off..off + DINODE_SIZE])?;

        let mut body = vec![0; bsize];
        write_dirent(&mut body, 0, ROOT_INO, ".")?;
        write_dirent(&mut body, DIRENT_SIZE, ROOT_INO, "..")?;
        st.disk.insert(root_blk, body);
        log::debug!("memdisk: {} blocks, {} inodes, data from block {}", NBLOCKS, NINODES, self.data_start);
        Ok(())
    }

    pub fn softdep(&self) -> &Arc<Softdep> {
        &self.softdep
    }

    /// Check the on-disk state every time an image lands
    pub fn set_write_checks(&self, on: bool) {
        self.check_writes.store(on, Ordering::SeqCst);
    }

    pub fn take_violations(&self) -> Vec<String> {
        std::mem::take(&mut self.lock().violations)
    }

    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, DiskState> {
        self.state.lock().unwrap()
    }

    fn blkno(&self, index: u64) -> BlockNo {
        index * self.geom.frag as u64
    }

    fn inode_blkno(&self, ino: Ino) -> BlockNo {
        self.blkno(ITABLE_BLOCK + (ino / self.geom.inopb) as u64)
    }

    fn buf<'a>(&self, st: &'a mut DiskState, blkno: BlockNo) -> &'a mut BlockBuf {
        let bsize = self.geom.bsize as usize;
        let DiskState { cache, disk, .. } = st;
        cache.entry(blkno).or_insert_with(|| {
            let data = disk.get(&blkno).cloned().unwrap_or_else(|| vec![0; bsize]);
            BlockBuf::with_data(BufId(blkno), blkno, data)
        })
    }

    /// A zero-filled buffer for a freshly allocated block
    fn new_buf<'a>(&self, st: &'a mut DiskState, blkno: BlockNo) -> &'a mut BlockBuf {
        let mut buf = BlockBuf::new(BufId(blkno), blkno, self.geom.bsize as usize);
        buf.dirty = true;
        st.cache.insert(blkno, buf);
        self.buf(st, blkno)
    }

    fn inode_mut<'a>(&self, st: &'a mut DiskState, ino: Ino) -> Result<&'a mut InCoreInode, SoftdepError> {
        if !st.inodes.contains_key(&ino) {
            let blkno = self.inode_blkno(ino);
            let off = self.geom.dinode_offset(ino);
            let din = Dinode::decode(&self.buf(st, blkno).data[off..off + DINODE_SIZE])?;
            let mut ip = InCoreInode {
                ino,
                effnlink: din.nlink,
                din,
            };
            self.softdep.on_inode_buffer_read(&mut ip)?;
            st.inodes.insert(ino, ip);
        }
        st.inodes
            .get_mut(&ino)
            .ok_or_else(|| fs_error(format!("inode {} not loaded", ino)))
    }

    /// Copy changed in-core inodes into their buffers
    fn sync_inodes(&self, st: &mut DiskState) -> Result<(), SoftdepError> {
        for ino in std::mem::take(&mut st.dirty_inodes) {
            let Some(ip) = st.inodes.get(&ino).cloned() else {
                continue;
            };
            let buf = self.buf(st, self.inode_blkno(ino));
            self.softdep.on_inode_written(&ip, buf, false)?;
        }
        Ok(())
    }

    fn link_change(&self, st: &mut DiskState, ino: Ino, nlink: i32, effnlink: i32) -> Result<(), SoftdepError> {
        let ip = self.inode_mut(st, ino)?;
        let new_nlink = ip.din.nlink as i32 + nlink;
        let new_eff = ip.effnlink as i32 + effnlink;
        if new_nlink < 0 || new_eff < 0 {
            return Err(fs_error(format!("inode {} link count underflow", ino)));
        }
        ip.din.nlink = new_nlink as u16;
        ip.effnlink = new_eff as u16;
        let ip = ip.clone();
        self.softdep.on_link_count_changed(&ip)?;
        st.dirty_inodes.insert(ino);
        Ok(())
    }

    fn free_count(&self, st: &mut DiskState) -> (u64, u64) {
        let ibmap = self.buf(st, self.blkno(IBMAP_BLOCK)).data.clone();
        let inodes = (ROOT_INO as u64 + 1..NINODES as u64).filter(|n| !bit(&ibmap, *n)).count();
        let bbmap = &self.buf(st, self.blkno(BBMAP_BLOCK)).data;
        let blocks = (self.data_start..NBLOCKS).filter(|n| !bit(bbmap, *n)).count();
        (inodes as u64, blocks as u64)
    }

    fn reserve(&self, st: &mut DiskState, inodes: u64, blocks: u64) -> Result<(), SoftdepError> {
        let (free_inodes, free_blocks) = self.free_count(st);
        if free_inodes < inodes || free_blocks < blocks {
            return Err(fs_error("no space left"));
        }
        Ok(())
    }

    fn alloc_inode(&self, st: &mut DiskState, mode_bits: u16) -> Result<Ino, SoftdepError> {
        let blkno = self.blkno(IBMAP_BLOCK);
        let map = self.buf(st, blkno);
        let ino = (ROOT_INO + 1..NINODES)
            .find(|n| !bit(&map.data, *n as u64))
            .ok_or_else(|| fs_error("out of inodes"))?;
        set_bit(&mut map.data, ino as u64, true);
        map.dirty = true;
        self.softdep.on_inode_allocated(BufId(blkno), ino)?;
        st.inodes.insert(ino, InCoreInode::new(ino, mode_bits, 0));
        Ok(ino)
    }

    fn alloc_block(&self, st: &mut DiskState) -> Result<BlockNo, SoftdepError> {
        let map_blk = self.blkno(BBMAP_BLOCK);
        let map = self.buf(st, map_blk);
        let index = (self.data_start..NBLOCKS)
            .find(|n| !bit(&map.data, *n))
            .ok_or_else(|| fs_error("out of blocks"))?;
        set_bit(&mut map.data, index, true);
        map.dirty = true;
        let blkno = self.blkno(index);
        self.softdep.on_block_allocated(BufId(map_blk), blkno)?;
        Ok(blkno)
    }

    fn find_slot(&self, st: &mut DiskState, dir: Ino, name: &str) -> Result<Option<Slot>, SoftdepError> {
        let dp = self.inode_mut(st, dir)?.clone();
        if !dp.is_dir() {
            return Err(fs_error(format!("inode {} is not a directory", dir)));
        }
        let bsize = self.geom.bsize as u64;
        for lbn in 0..(dp.din.size / bsize).min(NDADDR as u64) {
            let blkno = dp.din.db[lbn as usize];
            let data = &self.buf(st, blkno).data;
            for offset in (0..data.len()).step_by(DIRENT_SIZE) {
                let ino = dirent_ino(data, offset)?;
                if ino != 0 && dirent_name(data, offset) == name {
                    return Ok(Some(Slot { lbn, blkno, offset, ino }));
                }
            }
        }
        Ok(None)
    }

    fn find_existing(&self, st: &mut DiskState, dir: Ino, name: &str) -> Result<Slot, SoftdepError> {
        self.find_slot(st, dir, name)?
            .ok_or_else(|| fs_error(format!("{} not found in directory {}", name, dir)))
    }

    fn has_free_slot(&self, st: &mut DiskState, dir: Ino) -> Result<bool, SoftdepError> {
        Ok(self.free_slot(st, dir)?.is_some())
    }

    fn free_slot(&self, st: &mut DiskState, dir: Ino) -> Result<Option<(u64, BlockNo, usize)>, SoftdepError> {
        let dp = self.inode_mut(st, dir)?.clone();
        let bsize = self.geom.bsize as u64;
        for lbn in 0..(dp.din.size / bsize).min(NDADDR as u64) {
            let blkno = dp.din.db[lbn as usize];
            let data = &self.buf(st, blkno).data;
            let free = (0..data.len())
                .step_by(DIRENT_SIZE)
                .find(|off| data[*off..*off + DIRENT_SIZE].iter().all(|b| *b == 0));
            if let Some(offset) = free {
                return Ok(Some((lbn, blkno, offset)));
            }
        }
        Ok(None)
    }

    /// Give a directory one more block
    fn extend_dir(&self, st: &mut DiskState, dir: Ino) -> Result<(u64, BlockNo), SoftdepError> {
        let bsize = self.geom.bsize;
        let mut dp = self.inode_mut(st, dir)?.clone();
        let lbn = dp.din.size / bsize as u64;
        if lbn as usize >= NDADDR {
            return Err(fs_error(format!("directory {} is full", dir)));
        }
        let blkno = self.alloc_block(st)?;
        let site = PointerSite::Direct {
            lbn,
            newsize: bsize,
            oldsize: 0,
            data_buf: BufId(blkno),
        };
        self.softdep.on_pointer_update(&dp, site, 0, blkno)?;
        dp.din.db[lbn as usize] = blkno;
        dp.din.size += bsize as u64;
        dp.din.blocks += self.geom.frag as u64;
        st.inodes.insert(dir, dp);
        st.dirty_inodes.insert(dir);
        self.new_buf(st, blkno);
        Ok((lbn, blkno))
    }

    fn add_entry(
        &self,
        st: &mut DiskState,
        dir: Ino,
        name: &str,
        target: Ino,
        body: Option<BufId>,
    ) -> Result<(), SoftdepError> {
        let (lbn, blkno, offset) = match self.free_slot(st, dir)? {
            Some(slot) => slot,
            None => {
                let (lbn, blkno) = self.extend_dir(st, dir)?;
                (lbn, blkno, 0)
            }
        };
        let dp = self.inode_mut(st, dir)?.clone();
        let buf = self.buf(st, blkno);
        write_dirent(&mut buf.data, offset, target, name)?;
        buf.dirty = true;
        let diroffset = lbn * self.geom.bsize as u64 + offset as u64;
        self.softdep.on_dir_entry_added(buf.id, &dp, diroffset, target, body)?;
        Ok(())
    }

    fn clear_entry(&self, st: &mut DiskState, slot: Slot) {
        let buf = self.buf(st, slot.blkno);
        buf.data[slot.offset..slot.offset + DIRENT_SIZE].fill(0);
        buf.dirty = true;
    }

    fn diroffset(&self, slot: &Slot) -> u64 {
        slot.lbn * self.geom.bsize as u64 + slot.offset as u64
    }

    pub fn lookup(&self, dir: Ino, name: &str) -> Result<Option<Ino>, SoftdepError> {
        let mut st = self.lock();
        Ok(self.find_slot(&mut st, dir, name)?.map(|slot| slot.ino))
    }

    /// Names in a directory, "." and ".." excluded
    pub fn list_dir(&self, dir: Ino) -> Result<Vec<(String, Ino)>, SoftdepError> {
        let mut st = self.lock();
        let dp = self.inode_mut(&mut st, dir)?.clone();
        let mut names = Vec::new();
        for lbn in 0..(dp.din.size / self.geom.bsize as u64).min(NDADDR as u64) {
            let data = &self.buf(&mut st, dp.din.db[lbn as usize]).data;
            for offset in (0..data.len()).step_by(DIRENT_SIZE) {
                let ino = dirent_ino(data, offset)?;
                let name = dirent_name(data, offset);
                if ino != 0 && name != "." && name != ".." {
                    names.push((name, ino));
                }
            }
        }
        Ok(names)
    }

    pub fn inode(&self, ino: Ino) -> Result<InCoreInode, SoftdepError> {
        let mut st = self.lock();
        Ok(self.inode_mut(&mut st, ino)?.clone())
    }

    /// Create an empty regular file
    pub fn create(&self, dir: Ino, name: &str) -> Result<Ino, SoftdepError> {
        let mut st = self.lock();
        if self.find_slot(&mut st, dir, name)?.is_some() {
            return Err(fs_error(format!("{} exists", name)));
        }
        let blocks = u64::from(!self.has_free_slot(&mut st, dir)?);
        self.reserve(&mut st, 1, blocks)?;

        let ino = self.alloc_inode(&mut st, mode::IFREG | 0o644)?;
        self.link_change(&mut st, ino, 1, 1)?;
        self.sync_inodes(&mut st)?;
        self.add_entry(&mut st, dir, name, ino, None)?;
        self.sync_inodes(&mut st)?;
        log::debug!("memdisk: created {} as inode {}", name, ino);
        Ok(ino)
    }

    pub fn mkdir(&self, dir: Ino, name: &str) -> Result<Ino, SoftdepError> {
        let mut st = self.lock();
        if self.find_slot(&mut st, dir, name)?.is_some() {
            return Err(fs_error(format!("{} exists", name)));
        }
        let blocks = 1 + u64::from(!self.has_free_slot(&mut st, dir)?);
        self.reserve(&mut st, 1, blocks)?;

        let ino = self.alloc_inode(&mut st, mode::IFDIR | 0o755)?;
        self.link_change(&mut st, ino, 2, 2)?;
        // The new ".." entry
        self.link_change(&mut st, dir, 1, 1)?;
        let (_, body) = self.extend_dir(&mut st, ino)?;
        {
            let buf = self.buf(&mut st, body);
            write_dirent(&mut buf.data, 0, ino, ".")?;
            write_dirent(&mut buf.data, DIRENT_SIZE, dir, "..")?;
        }
        self.sync_inodes(&mut st)?;
        self.add_entry(&mut st, dir, name, ino, Some(BufId(body)))?;
        self.sync_inodes(&mut st)?;
        log::debug!("memdisk: made directory {} as inode {}", name, ino);
        Ok(ino)
    }

    /// Append one full block of data to a file
    pub fn append_block(&self, ino: Ino) -> Result<BlockNo, SoftdepError> {
        let mut st = self.lock();
        let bsize = self.geom.bsize;
        let frag = self.geom.frag as u64;
        let mut ip = self.inode_mut(&mut st, ino)?.clone();
        if ip.is_dir() {
            return Err(fs_error(format!("inode {} is a directory", ino)));
        }
        let lbn = ip.din.size / bsize as u64;
        let blkno = if (lbn as usize) < NDADDR {
            self.reserve(&mut st, 0, 1)?;
            let blkno = self.alloc_block(&mut st)?;
            let site = PointerSite::Direct {
                lbn,
                newsize: bsize,
                oldsize: 0,
                data_buf: BufId(blkno),
            };
            self.softdep.on_pointer_update(&ip, site, 0, blkno)?;
            ip.din.db[lbn as usize] = blkno;
            blkno
        } else {
            let ptrno = (lbn - NDADDR as u64) as usize;
            if ptrno >= self.geom.nindir {
                return Err(SoftdepError::NotSupported(format!("inode {} beyond single indirect", ino)));
            }
            self.reserve(&mut st, 0, if ip.din.ib[0] == 0 { 2 } else { 1 })?;
            if ip.din.ib[0] == 0 {
                let ib = self.alloc_block(&mut st)?;
                let site = PointerSite::Direct {
                    lbn: NDADDR as u64,
                    newsize: bsize,
                    oldsize: 0,
                    data_buf: BufId(ib),
                };
                self.softdep.on_pointer_update(&ip, site, 0, ib)?;
                ip.din.ib[0] = ib;
                ip.din.blocks += frag;
                self.new_buf(&mut st, ib);
            }
            let ib = ip.din.ib[0];
            let blkno = self.alloc_block(&mut st)?;
            let indir = self.buf(&mut st, ib);
            let site = PointerSite::Indirect {
                indir_buf: indir,
                ptrno,
                data_buf: BufId(blkno),
                meta: false,
            };
            self.softdep.on_pointer_update(&ip, site, 0, blkno)?;
            set_indirect_ptr(&mut indir.data, ptrno, blkno)?;
            indir.dirty = true;
            blkno
        };
        ip.din.size += bsize as u64;
        ip.din.blocks += frag;
        st.inodes.insert(ino, ip);
        st.dirty_inodes.insert(ino);
        self.new_buf(&mut st, blkno).data.fill(ino as u8);
        self.sync_inodes(&mut st)?;
        Ok(blkno)
    }

    pub fn unlink(&self, dir: Ino, name: &str) -> Result<(), SoftdepError> {
        let mut st = self.lock();
        let slot = self.find_existing(&mut st, dir, name)?;
        if self.inode_mut(&mut st, slot.ino)?.is_dir() {
            return Err(fs_error(format!("{} is a directory", name)));
        }
        self.clear_entry(&mut st, slot);
        self.link_change(&mut st, slot.ino, 0, -1)?;
        let dp = self.inode_mut(&mut st, dir)?.clone();
        self.softdep
            .on_dir_entry_removed(BufId(slot.blkno), &dp, self.diroffset(&slot), slot.ino, false)?;
        self.sync_inodes(&mut st)
    }

    pub fn rmdir(&self, dir: Ino, name: &str) -> Result<(), SoftdepError> {
        let mut st = self.lock();
        let slot = self.find_existing(&mut st, dir, name)?;
        let tp = self.inode_mut(&mut st, slot.ino)?.clone();
        if !tp.is_dir() {
            return Err(fs_error(format!("{} is not a directory", name)));
        }
        for lbn in 0..(tp.din.size / self.geom.bsize as u64).min(NDADDR as u64) {
            let data = &self.buf(&mut st, tp.din.db[lbn as usize]).data;
            for offset in (0..data.len()).step_by(DIRENT_SIZE) {
                let dot = lbn == 0 && offset < 2 * DIRENT_SIZE;
                if !dot && dirent_ino(data, offset)? != 0 {
                    return Err(fs_error(format!("{} is not empty", name)));
                }
            }
        }
        self.clear_entry(&mut st, slot);
        // The entry and its own "."; the parent loses "..".
        self.link_change(&mut st, slot.ino, 0, -2)?;
        self.link_change(&mut st, dir, 0, -1)?;
        let dp = self.inode_mut(&mut st, dir)?.clone();
        self.softdep
            .on_dir_entry_removed(BufId(slot.blkno), &dp, self.diroffset(&slot), slot.ino, true)?;
        self.sync_inodes(&mut st)
    }

    /// Rename a file, replacing any file already at the destination
    pub fn rename(&self, src_dir: Ino, src_name: &str, dst_dir: Ino, dst_name: &str) -> Result<(), SoftdepError> {
        let mut st = self.lock();
        let src = self.find_existing(&mut st, src_dir, src_name)?;
        if self.inode_mut(&mut st, src.ino)?.is_dir() {
            return Err(SoftdepError::NotSupported(format!("rename of directory {}", src_name)));
        }
        if src_dir == dst_dir && src_name == dst_name {
            return Ok(());
        }
        let dst = self.find_slot(&mut st, dst_dir, dst_name)?;
        if let Some(slot) = dst {
            if self.inode_mut(&mut st, slot.ino)?.is_dir() {
                return Err(fs_error(format!("{} is a directory", dst_name)));
            }
            if slot.ino == src.ino {
                return Err(SoftdepError::NotSupported(format!("rename of {} onto its own link", src_name)));
            }
        } else {
            let blocks = u64::from(!self.has_free_slot(&mut st, dst_dir)?);
            self.reserve(&mut st, 0, blocks)?;
        }

        // The new name is counted before it is written.
        self.link_change(&mut st, src.ino, 1, 1)?;
        self.sync_inodes(&mut st)?;
        match dst {
            Some(slot) => {
                {
                    let buf = self.buf(&mut st, slot.blkno);
                    set_dirent_ino(&mut buf.data, slot.offset, src.ino)?;
                    buf.dirty = true;
                }
                self.link_change(&mut st, slot.ino, 0, -1)?;
                let dp = self.inode_mut(&mut st, dst_dir)?.clone();
                self.softdep.on_dir_entry_changed(
                    BufId(slot.blkno),
                    &dp,
                    self.diroffset(&slot),
                    slot.ino,
                    src.ino,
                    RemoveKind::File,
                )?;
            }
            None => self.add_entry(&mut st, dst_dir, dst_name, src.ino, None)?,
        }

        self.clear_entry(&mut st, src);
        self.link_change(&mut st, src.ino, 0, -1)?;
        let sdp = self.inode_mut(&mut st, src_dir)?.clone();
        self.softdep
            .on_dir_entry_removed(BufId(src.blkno), &sdp, self.diroffset(&src), src.ino, false)?;
        self.sync_inodes(&mut st)
    }

    /// Truncate a file or directory to zero length
    pub fn truncate(&self, ino: Ino) -> Result<(), SoftdepError> {
        let mut st = self.lock();
        let mut ip = self.inode_mut(&mut st, ino)?.clone();
        let mut blocks: Vec<BlockNo> = ip.din.db.iter().chain(ip.din.extb.iter()).copied().filter(|b| *b != 0).collect();
        let ib = ip.din.ib[0];
        if ib != 0 {
            let image = self.buf(&mut st, ib).data.clone();
            for ptrno in 0..self.geom.nindir {
                let bn = indirect_ptr(&image, ptrno)?;
                if bn != 0 {
                    blocks.push(bn);
                }
            }
            blocks.push(ib);
        }
        let mut cached: Vec<BlockBuf> = blocks.iter().filter_map(|bn| st.cache.remove(bn)).collect();
        let result = {
            let inode_buf = self.buf(&mut st, self.inode_blkno(ino));
            self.softdep.on_truncate(&mut ip, inode_buf, &mut cached, 0)
        };
        if let Err(e) = result {
            for buf in cached {
                st.cache.insert(buf.blkno, buf);
            }
            return Err(e);
        }
        for buf in &cached {
            self.softdep.buffer_invalidated(buf.id)?;
        }
        st.inodes.insert(ino, ip);
        st.dirty_inodes.remove(&ino);
        log::debug!("memdisk: truncated inode {}, {} cached blocks discarded", ino, cached.len());
        Ok(())
    }

    fn write_locked(&self, st: &mut DiskState, blkno: BlockNo) -> Result<WriteOutcome, SoftdepError> {
        let buf = st
            .cache
            .get_mut(&blkno)
            .ok_or_else(|| fs_error(format!("block {} not cached", blkno)))?;
        let token = self.softdep.before_buffer_write(buf)?;
        let image = buf.data.clone();
        self.land(st, blkno, image);
        let buf = st
            .cache
            .get_mut(&blkno)
            .ok_or_else(|| fs_error(format!("block {} not cached", blkno)))?;
        self.softdep.after_buffer_write(buf, token)
    }

    fn land(&self, st: &mut DiskState, blkno: BlockNo, image: Vec<u8>) {
        st.disk.insert(blkno, image);
        st.writes += 1;
        if self.check_writes.load(Ordering::SeqCst) {
            let found = self.check_disk(&st.disk);
            for v in &found {
                log::error!("memdisk: after write of block {}: {}", blkno, v);
            }
            st.violations.extend(found.into_iter().map(|v| format!("block {}: {}", blkno, v)));
        }
    }

    /// Dirty buffers, once changed inodes are copied into theirs
    pub fn dirty_buffers(&self) -> Result<Vec<BufId>, SoftdepError> {
        let mut st = self.lock();
        self.sync_inodes(&mut st)?;
        Ok(st.cache.values().filter(|b| b.dirty).map(|b| b.id).collect())
    }

    pub fn write_buffer(&self, id: BufId) -> Result<WriteOutcome, SoftdepError> {
        let mut st = self.lock();
        self.write_locked(&mut st, id.0)
    }

    /// Start a write whose completion arrives later. The buffer leaves the
    /// cache until `return_buffer`.
    pub fn start_write(&self, id: BufId) -> Result<(BlockBuf, RollbackToken), SoftdepError> {
        let mut st = self.lock();
        let mut buf = st
            .cache
            .remove(&id.0)
            .ok_or_else(|| fs_error(format!("{} not cached", id)))?;
        let token = match self.softdep.before_buffer_write(&mut buf) {
            Ok(token) => token,
            Err(e) => {
                st.cache.insert(buf.blkno, buf);
                return Err(e);
            }
        };
        self.land(&mut st, buf.blkno, buf.data.clone());
        Ok((buf, token))
    }

    pub fn return_buffer(&self, buf: BlockBuf) {
        self.lock().cache.insert(buf.blkno, buf);
    }

    /// Write every dirty buffer once, lowest block first
    pub fn flush(&self) -> Result<usize, SoftdepError> {
        let mut st = self.lock();
        self.sync_inodes(&mut st)?;
        let dirty: Vec<BlockNo> = st.cache.values().filter(|b| b.dirty).map(|b| b.blkno).collect();
        for blkno in &dirty {
            self.write_locked(&mut st, *blkno)?;
        }
        Ok(dirty.len())
    }

    pub fn process_work(&self) -> Result<usize, SoftdepError> {
        self.softdep.process_worklist(self)
    }

    /// Write and process until no dependencies remain
    pub fn sync(&self) -> Result<(), SoftdepError> {
        self.softdep.drain_all(self, self)
    }

    /// Make one inode and the entries naming it durable
    pub fn fsync(&self, ino: Ino) -> Result<(), SoftdepError> {
        {
            let mut st = self.lock();
            self.sync_inodes(&mut st)?;
        }
        self.softdep.sync_inode(ino, self)
    }

    /// Inode `ino` as the written inode block holds it
    pub fn disk_inode(&self, ino: Ino) -> Option<Dinode> {
        let st = self.lock();
        self.read_dinode(&st.disk, ino)
    }

    /// Look up `name` in directory `dir` using written blocks only
    pub fn disk_lookup(&self, dir: Ino, name: &str) -> Option<Ino> {
        let st = self.lock();
        let din = self.read_dinode(&st.disk, dir)?;
        let bsize = self.geom.bsize as usize;
        for lbn in 0..(din.size as usize / bsize).min(NDADDR) {
            let Some(data) = st.disk.get(&din.db[lbn]) else {
                continue;
            };
            for offset in (0..bsize).step_by(DIRENT_SIZE) {
                match dirent_ino(data, offset) {
                    Ok(0) | Err(_) => {}
                    Ok(ino) if dirent_name(data, offset) == name => return Some(ino),
                    Ok(_) => {}
                }
            }
        }
        None
    }

    fn read_dinode(&self, disk: &HashMap<BlockNo, Vec<u8>>, ino: Ino) -> Option<Dinode> {
        let block = disk.get(&self.inode_blkno(ino))?;
        let off = self.geom.dinode_offset(ino);
        Dinode::decode(&block[off..off + DINODE_SIZE]).ok()
    }

    pub fn check_consistency(&self) -> Vec<String> {
        let st = self.lock();
        self.check_disk(&st.disk)
    }

    /// Walk the on-disk tree from the root and report every reference to
    /// something not safely on disk
    fn check_disk(&self, disk: &HashMap<BlockNo, Vec<u8>>) -> Vec<String> {
        let mut violations = Vec::new();
        let bsize = self.geom.bsize as usize;
        let empty = vec![0u8; bsize];
        let read = |blkno: BlockNo| disk.get(&blkno).map(Vec::as_slice);
        let ibmap = read(self.blkno(IBMAP_BLOCK)).unwrap_or(empty.as_slice());
        let bbmap = read(self.blkno(BBMAP_BLOCK)).unwrap_or(empty.as_slice());
        let dinode = |ino: Ino| self.read_dinode(disk, ino);
        let check_block = |ino: Ino, bn: BlockNo, violations: &mut Vec<String>| {
            if !bit(bbmap, bn / self.geom.frag as u64) {
                violations.push(format!("inode {} points at free block {}", ino, bn));
            }
            if read(bn).is_none() {
                violations.push(format!("inode {} points at unwritten block {}", ino, bn));
            }
        };
        let check_blocks = |ino: Ino, din: &Dinode, violations: &mut Vec<String>| {
            for bn in din.db.iter().chain(din.extb.iter()).chain(din.ib.iter()) {
                if *bn != 0 {
                    check_block(ino, *bn, violations);
                }
            }
            for ib in din.ib.iter().filter(|b| **b != 0) {
                if let Some(image) = read(*ib) {
                    for ptrno in 0..self.geom.nindir {
                        match indirect_ptr(image, ptrno) {
                            Ok(0) => {}
                            Ok(bn) => check_block(ino, bn, violations),
                            Err(e) => violations.push(e.to_string()),
                        }
                    }
                }
            }
        };

        let mut refs: HashMap<Ino, u32> = HashMap::new();
        let mut visited = HashSet::new();
        let mut stack = vec![ROOT_INO];
        while let Some(dir) = stack.pop() {
            if !visited.insert(dir) {
                continue;
            }
            let Some(din) = dinode(dir) else {
                violations.push(format!("directory {} has no inode image", dir));
                continue;
            };
            check_blocks(dir, &din, &mut violations);
            for lbn in 0..(din.size as usize / bsize).min(NDADDR) {
                let bn = din.db[lbn];
                let Some(data) = (bn != 0).then(|| read(bn)).flatten() else {
                    continue;
                };
                for offset in (0..bsize).step_by(DIRENT_SIZE) {
                    let ino = match dirent_ino(data, offset) {
                        Ok(0) => continue,
                        Ok(ino) => ino,
                        Err(e) => {
                            violations.push(e.to_string());
                            continue;
                        }
                    };
                    let name = dirent_name(data, offset);
                    *refs.entry(ino).or_default() += 1;
                    if !bit(ibmap, ino as u64) {
                        violations.push(format!("{} in directory {} names free inode {}", name, dir, ino));
                    }
                    match dinode(ino) {
                        Some(target) if target.nlink == 0 => {
                            violations.push(format!("{} in directory {} names inode {} with no links", name, dir, ino));
                        }
                        Some(target) if target.is_dir() => {
                            if name != "." && name != ".." {
                                stack.push(ino);
                            }
                        }
                        Some(target) => {
                            if visited.insert(ino) {
                                check_blocks(ino, &target, &mut violations);
                            }
                        }
                        None => violations.push(format!("{} in directory {} names unwritten inode {}", name, dir, ino)),
                    }
                }
            }
        }
        let mut counted: Vec<_> = refs.into_iter().collect();
        counted.sort_unstable();
        for (ino, count) in counted {
            if let Some(din) = dinode(ino) {
                if count > din.nlink as u32 {
                    violations.push(format!("inode {} has {} references but link count {}", ino, count, din.nlink));
                }
            }
        }
        violations
    }
}

impl FsBackend for MemDisk {
    fn release_blocks(&self, ino: Ino, _uid: u32, blkno: BlockNo, size: u32) -> Result<(), SoftdepError> {
        if size != self.geom.bsize {
            return Err(SoftdepError::NotSupported(format!("fragment release of {} bytes", size)));
        }
        let mut st = self.lock();
        if let Some(buf) = st.cache.remove(&blkno) {
            self.softdep.buffer_invalidated(buf.id)?;
        }
        let map = self.buf(&mut st, self.blkno(BBMAP_BLOCK));
        let index = blkno / self.geom.frag as u64;
        if !bit(&map.data, index) {
            return Err(SoftdepError::inconsistency(
                "release_blocks",
                format!("block {} of inode {} already free", blkno, ino),
            ));
        }
        set_bit(&mut map.data, index, false);
        map.dirty = true;
        Ok(())
    }

    fn release_inode(&self, ino: Ino, _mode: u16) -> Result<(), SoftdepError> {
        let mut st = self.lock();
        let map = self.buf(&mut st, self.blkno(IBMAP_BLOCK));
        if !bit(&map.data, ino as u64) {
            return Err(SoftdepError::inconsistency("release_inode", format!("inode {} already free", ino)));
        }
        set_bit(&mut map.data, ino as u64, false);
        map.dirty = true;
        st.inodes.remove(&ino);
        st.dirty_inodes.remove(&ino);
        Ok(())
    }

    fn read_indirect(&self, blkno: BlockNo) -> Result<Vec<u8>, SoftdepError> {
        let st = self.lock();
        Ok(st
            .disk
            .get(&blkno)
            .cloned()
            .unwrap_or_else(|| vec![0; self.geom.bsize as usize]))
    }

    fn drop_links(&self, ino: Ino, count: u16) -> Result<LinkCounts, SoftdepError> {
        let mut st = self.lock();
        let ip = self.inode_mut(&mut st, ino)?;
        if ip.din.nlink < count {
            return Err(SoftdepError::inconsistency(
                "drop_links",
                format!("inode {} has {} links, dropping {}", ino, ip.din.nlink, count),
            ));
        }
        ip.din.nlink -= count;
        let links = LinkCounts {
            nlink: ip.din.nlink,
            effnlink: ip.effnlink,
        };
        st.dirty_inodes.insert(ino);
        Ok(links)
    }

    fn truncate_directory(&self, _softdep: &Softdep, ino: Ino) -> Result<(), SoftdepError> {
        self.truncate(ino)
    }

    fn inode_released(&self, _softdep: &Softdep, ino: Ino) -> Result<(), SoftdepError> {
        let is_dir = {
            let mut st = self.lock();
            self.inode_mut(&mut st, ino)?.is_dir()
        };
        // A removed directory was truncated when its entry went.
        if !is_dir {
            self.truncate(ino)?;
        }
        let mut st = self.lock();
        let ip = self.inode_mut(&mut st, ino)?;
        let old_mode = ip.din.mode;
        ip.din.mode = 0;
        self.softdep.on_inode_freed(ino, old_mode)?;
        st.dirty_inodes.insert(ino);
        self.sync_inodes(&mut st)
    }
}

impl BufferFlusher for MemDisk {
    fn flush_dirty(&self, _softdep: &Softdep) -> Result<(), SoftdepError> {
        self.flush().map(|_| ())
    }

    fn flush_buffer(&self, _softdep: &Softdep, buf: BufId) -> Result<(), SoftdepError> {
        let mut st = self.lock();
        self.sync_inodes(&mut st)?;
        if !st.cache.contains_key(&buf.0) {
            log::debug!("memdisk: {} not cached, nothing to write", buf);
            return Ok(());
        }
        self.write_locked(&mut st, buf.0).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk() -> MemDisk {
        let disk = MemDisk::new(SoftdepConfig::default()).unwrap();
        disk.set_write_checks(true);
        disk
    }

    #[test]
    fn test_fresh_disk_is_consistent() {
        let disk = disk();
        assert!(disk.check_consistency().is_empty());
        assert_eq!(disk.list_dir(ROOT_INO).unwrap(), vec![]);
        assert_eq!(disk.inode(ROOT_INO).unwrap().effnlink, 2);
    }

    #[test]
    fn test_directory_page_written_first_hides_entry() {
        let disk = disk();
        let ino = disk.create(ROOT_INO, "a").unwrap();
        let root_blk = disk.inode(ROOT_INO).unwrap().din.db[0];
        disk.write_buffer(BufId(root_blk)).unwrap();
        assert!(disk.take_violations().is_empty());
        assert_eq!(disk.lookup(ROOT_INO, "a").unwrap(), Some(ino));
        disk.sync().unwrap();
        assert!(disk.take_violations().is_empty());
        assert!(disk.softdep().is_idle().unwrap());
    }

    #[test]
    fn test_unlink_releases_inode() {
        let disk = disk();
        let ino = disk.create(ROOT_INO, "gone").unwrap();
        disk.append_block(ino).unwrap();
        disk.sync().unwrap();
        disk.unlink(ROOT_INO, "gone").unwrap();
        disk.sync().unwrap();
        assert!(disk.take_violations().is_empty());
        assert_eq!(disk.softdep().stats().inodes_released, 1);
        assert_eq!(disk.softdep().stats().frags_released, 4);
        assert_eq!(disk.create(ROOT_INO, "again").unwrap(), ino);
    }

    #[test]
    fn test_fsync_makes_one_file_durable() {
        let disk = disk();
        let dir = disk.mkdir(ROOT_INO, "d").unwrap();
        let other = disk.create(ROOT_INO, "other").unwrap();
        let other_block = disk.append_block(other).unwrap();
        let file = disk.create(dir, "f").unwrap();
        let block = disk.append_block(file).unwrap();

        disk.fsync(file).unwrap();
        assert!(disk.softdep().inode_sync_targets(file).unwrap().is_empty());
        assert!(disk.take_violations().is_empty());

        // A crash now keeps the entry, the inode and its block.
        assert_eq!(disk.disk_lookup(dir, "f"), Some(file));
        let din = disk.disk_inode(file).unwrap();
        assert_eq!(din.nlink, 1);
        assert_eq!(din.db[0], block);
        assert!(disk.check_consistency().is_empty());
        // Unrelated data was left in the cache.
        assert!(disk.dirty_buffers().unwrap().contains(&BufId(other_block)));

        disk.sync().unwrap();
        assert!(disk.softdep().is_idle().unwrap());
    }

    #[test]
    fn test_rename_over_entry_waits_for_new_inode() {
        let disk = disk();
        let old = disk.create(ROOT_INO, "old").unwrap();
        disk.sync().unwrap();
        let new = disk.create(ROOT_INO, "new").unwrap();
        disk.rename(ROOT_INO, "new", ROOT_INO, "old").unwrap();
        disk.dirty_buffers().unwrap();

        let page = BufId(disk.inode(ROOT_INO).unwrap().din.db[0]);
        disk.write_buffer(page).unwrap();
        assert_eq!(disk.disk_lookup(ROOT_INO, "old"), Some(old));
        assert_eq!(disk.disk_lookup(ROOT_INO, "new"), None);

        disk.write_buffer(BufId(disk.blkno(IBMAP_BLOCK))).unwrap();
        disk.write_buffer(BufId(disk.inode_blkno(new))).unwrap();
        disk.write_buffer(page).unwrap();
        assert_eq!(disk.disk_lookup(ROOT_INO, "old"), Some(new));
        assert!(disk.take_violations().is_empty());

        disk.sync().unwrap();
        assert!(disk.softdep().is_idle().unwrap());
        assert_eq!(disk.softdep().stats().inodes_released, 1);
    }
}
