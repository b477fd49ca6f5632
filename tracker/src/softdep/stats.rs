// Soft updates statistics

use serde::Serialize;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SoftdepStats {
    /// Dependency records created
    pub records_created: u64,
    /// Dependency records freed
    pub records_freed: u64,
    /// Inode pointers rolled back for a write
    pub direct_rollbacks: u64,
    /// Indirect blocks written from their safe copy
    pub indirect_rollbacks: u64,
    /// Directory entries rolled back for a write
    pub dirent_rollbacks: u64,
    /// Inodes written as zeroes because their bitmap was not durable
    pub inode_image_rollbacks: u64,
    /// Times the inodedep limit was exceeded
    pub inodedep_limit_hits: u64,
    /// Times the dirrem limit was exceeded
    pub dirrem_limit_hits: u64,
    pub writes_started: u64,
    pub writes_completed: u64,
    pub writes_aborted: u64,
    pub work_items_processed: u64,
    /// Fragments returned to the allocator
    pub frags_released: u64,
    pub inodes_released: u64,
    /// Fragments scheduled for release but not yet returned
    pub pending_free_frags: u64,
}
