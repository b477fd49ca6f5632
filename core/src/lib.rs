pub mod buf;
pub mod config;
pub mod error;
pub mod layout;
pub mod types;

pub use buf::BlockBuf;
pub use config::SoftdepConfig;
pub use error::SoftdepError;
pub use layout::{Dinode, Geometry, InCoreInode, NDADDR, NIADDR, NXADDR};
pub use types::{BlockNo, BufId, Ino, Lbn, ROOT_INO, WINO};
