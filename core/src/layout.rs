// In-memory staging formats the dependency tracker reads and rewrites
// All multi-byte fields are little-endian

use crate::error::SoftdepError;
use crate::types::{BlockNo, Ino, Lbn};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use static_assertions::const_assert;
use std::io::Cursor;

/// Direct block pointers in an inode
pub const NDADDR: usize = 12;
/// Indirect block pointers in an inode (single, double, triple)
pub const NIADDR: usize = 3;
/// Extended attribute block pointers in an inode
pub const NXADDR: usize = 2;

/// On-disk inode size
pub const DINODE_SIZE: usize = 256;
/// Bytes of an encoded dinode that carry fields; the rest is padding
pub const DINODE_USED: usize = 2 + 2 + 4 + 8 + 8 + 4 + 4 + 8 * (NDADDR + NIADDR + NXADDR);

const_assert!(DINODE_USED <= DINODE_SIZE);

/// Width of one indirect block pointer
pub const PTR_SIZE: usize = 8;

/// Block arithmetic derived from the block and fragment sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub bsize: u32,
    pub fsize: u32,
    /// Fragments per block
    pub frag: u32,
    /// Pointers per indirect block
    pub nindir: usize,
    /// Inodes per inode block
    pub inopb: u32,
}

impl Geometry {
    pub fn new(bsize: u32, fsize: u32) -> Self {
        Self {
            bsize,
            fsize,
            frag: bsize / fsize,
            nindir: bsize as usize / PTR_SIZE,
            inopb: (bsize as usize / DINODE_SIZE) as u32,
        }
    }

    /// Logical block containing a byte offset
    pub fn lblkno(&self, offset: u64) -> Lbn {
        offset / self.bsize as u64
    }

    /// Offset within its block of a byte offset
    pub fn blkoff(&self, offset: u64) -> usize {
        (offset % self.bsize as u64) as usize
    }

    /// Fragment index of a block number within its block
    pub fn fragnum(&self, blkno: BlockNo) -> u32 {
        (blkno % self.frag as u64) as u32
    }

    /// Number of fragments needed to hold `size` bytes
    pub fn numfrags(&self, size: u64) -> u64 {
        size.div_ceil(self.fsize as u64)
    }

    pub fn fragroundup(&self, size: u64) -> u64 {
        self.numfrags(size) * self.fsize as u64
    }

    /// Allocated size of logical block `lbn` in a file of `size` bytes
    pub fn blksize(&self, size: u64, lbn: Lbn) -> u32 {
        let bsize = self.bsize as u64;
        if lbn >= NDADDR as u64 || size >= (lbn + 1) * bsize {
            self.bsize
        } else {
            self.fragroundup(size % bsize) as u32
        }
    }

    /// Byte offset of an inode inside its inode block
    pub fn dinode_offset(&self, ino: Ino) -> usize {
        (ino % self.inopb) as usize * DINODE_SIZE
    }
}

/// On-disk inode image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dinode {
    pub mode: u16,
    pub nlink: u16,
    pub uid: u32,
    pub size: u64,
    /// Allocated space in fragments
    pub blocks: u64,
    /// Size of the extended attribute area
    pub extsize: u32,
    pub db: [BlockNo; NDADDR],
    pub ib: [BlockNo; NIADDR],
    pub extb: [BlockNo; NXADDR],
}

impl Dinode {
    pub fn decode(bytes: &[u8]) -> Result<Self, SoftdepError> {
        if bytes.len() < DINODE_USED {
            return Err(SoftdepError::inconsistency(
                "dinode decode",
                format!("short inode image of {} bytes", bytes.len()),
            ));
        }
        let mut cur = Cursor::new(bytes);
        let mut din = Dinode {
            mode: cur.read_u16::<LittleEndian>()?,
            nlink: cur.read_u16::<LittleEndian>()?,
            uid: cur.read_u32::<LittleEndian>()?,
            size: cur.read_u64::<LittleEndian>()?,
            blocks: cur.read_u64::<LittleEndian>()?,
            extsize: cur.read_u32::<LittleEndian>()?,
            ..Default::default()
        };
        let _pad = cur.read_u32::<LittleEndian>()?;
        for slot in din.db.iter_mut().chain(din.ib.iter_mut()).chain(din.extb.iter_mut()) {
            *slot = cur.read_u64::<LittleEndian>()?;
        }
        Ok(din)
    }

    /// Encode into `out`, which must hold at least `DINODE_SIZE` bytes
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), SoftdepError> {
        if out.len() < DINODE_SIZE {
            return Err(SoftdepError::inconsistency(
                "dinode encode",
                format!("inode slot of {} bytes", out.len()),
            ));
        }
        out[..DINODE_SIZE].fill(0);
        let mut cur = Cursor::new(&mut out[..DINODE_SIZE]);
        cur.write_u16::<LittleEndian>(self.mode)?;
        cur.write_u16::<LittleEndian>(self.nlink)?;
        cur.write_u32::<LittleEndian>(self.uid)?;
        cur.write_u64::<LittleEndian>(self.size)?;
        cur.write_u64::<LittleEndian>(self.blocks)?;
        cur.write_u32::<LittleEndian>(self.extsize)?;
        cur.write_u32::<LittleEndian>(0)?;
        for slot in self.db.iter().chain(self.ib.iter()).chain(self.extb.iter()) {
            cur.write_u64::<LittleEndian>(*slot)?;
        }
        Ok(())
    }

    pub fn is_dir(&self) -> bool {
        crate::types::mode::is_dir(self.mode)
    }
}

/// In-core inode: the dinode plus the link count the namespace currently implies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InCoreInode {
    pub ino: Ino,
    pub din: Dinode,
    /// Link count including removals not yet on disk
    pub effnlink: u16,
}

impl InCoreInode {
    pub fn new(ino: Ino, mode: u16, uid: u32) -> Self {
        Self {
            ino,
            din: Dinode { mode, uid, ..Default::default() },
            effnlink: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.din.is_dir()
    }
}

fn checked_range(len: usize, offset: usize, width: usize, what: &'static str) -> Result<std::ops::Range<usize>, SoftdepError> {
    match offset.checked_add(width) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(SoftdepError::inconsistency(
            what,
            format!("offset {} out of range for {} byte buffer", offset, len),
        )),
    }
}

/// Read pointer `ptrno` of an indirect block
pub fn indirect_ptr(data: &[u8], ptrno: usize) -> Result<BlockNo, SoftdepError> {
    let range = checked_range(data.len(), ptrno * PTR_SIZE, PTR_SIZE, "indirect pointer")?;
    Ok(LittleEndian::read_u64(&data[range]))
}

pub fn set_indirect_ptr(data: &mut [u8], ptrno: usize, blkno: BlockNo) -> Result<(), SoftdepError> {
    let range = checked_range(data.len(), ptrno * PTR_SIZE, PTR_SIZE, "indirect pointer")?;
    LittleEndian::write_u64(&mut data[range], blkno);
    Ok(())
}

/// Inode number of the directory entry starting at `offset`
pub fn dirent_ino(data: &[u8], offset: usize) -> Result<Ino, SoftdepError> {
    let range = checked_range(data.len(), offset, 4, "directory entry")?;
    Ok(LittleEndian::read_u32(&data[range]))
}

pub fn set_dirent_ino(data: &mut [u8], offset: usize, ino: Ino) -> Result<(), SoftdepError> {
    let range = checked_range(data.len(), offset, 4, "directory entry")?;
    LittleEndian::write_u32(&mut data[range], ino);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let geom = Geometry::new(4096, 1024);
        assert_eq!(geom.frag, 4);
        assert_eq!(geom.nindir, 512);
        assert_eq!(geom.inopb, 16);
        assert_eq!(geom.lblkno(8191), 1);
        assert_eq!(geom.blkoff(8193), 1);
        assert_eq!(geom.fragnum(13), 1);
        assert_eq!(geom.numfrags(1025), 2);
        assert_eq!(geom.dinode_offset(17), DINODE_SIZE);
    }

    #[test]
    fn test_blksize_tail_fragment() {
        let geom = Geometry::new(4096, 1024);
        // 5000 bytes: block 0 is full, block 1 holds a 1024-byte tail rounded up to 1 fragment
        assert_eq!(geom.blksize(5000, 0), 4096);
        assert_eq!(geom.blksize(5000, 1), 1024);
        assert_eq!(geom.blksize(5000, NDADDR as u64), 4096);
    }

    #[test]
    fn test_dinode_encoding() {
        let mut din = Dinode { mode: 0o100644, nlink: 1, size: 70000, blocks: 72, ..Default::default() };
        din.db[0] = 40;
        din.db[11] = 88;
        din.ib[0] = 120;
        din.extb[1] = 9;

        let mut block = vec![0xffu8; 4096];
        din.encode_into(&mut block[256..512]).unwrap();
        assert_eq!(Dinode::decode(&block[256..512]).unwrap(), din);
        assert!(block[256 + DINODE_USED..512].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_slot_bounds() {
        let mut data = vec![0u8; 64];
        set_indirect_ptr(&mut data, 7, 1234).unwrap();
        assert_eq!(indirect_ptr(&data, 7).unwrap(), 1234);
        assert!(indirect_ptr(&data, 8).is_err());

        set_dirent_ino(&mut data, 16, 99).unwrap();
        assert_eq!(dirent_ino(&data, 16).unwrap(), 99);
        assert!(set_dirent_ino(&mut data, 62, 1).is_err());
    }
}
