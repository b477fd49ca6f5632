// Identifiers shared between the tracker and its collaborators

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inode number
pub type Ino = u32;

/// Physical block number in fragment units. Zero means "no block".
pub type BlockNo = u64;

/// Logical block number within a file
pub type Lbn = u64;

/// Reserved inode number used for whiteout directory entries
pub const WINO: Ino = 1;

/// Root directory inode number
pub const ROOT_INO: Ino = 2;

/// Identity of a cached buffer, assigned by the buffer cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufId(pub u64);

impl fmt::Display for BufId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// File type bits kept in `Dinode::mode`
pub mod mode {
    pub const IFMT: u16 = 0o170000;
    pub const IFDIR: u16 = 0o040000;
    pub const IFREG: u16 = 0o100000;
    pub const IFLNK: u16 = 0o120000;

    pub fn is_dir(mode: u16) -> bool {
        mode & IFMT == IFDIR
    }
}
