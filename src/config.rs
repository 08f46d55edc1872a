//! Static file-system configuration.

/// Tunables fixed at file-system construction time.
///
/// The defaults match the sizing the core was developed against; hosts with
/// tighter RAM budgets shrink the cache pools, hosts that mostly stream large
/// files grow them.
#[derive(Clone, Copy, Debug)]
pub struct FsConfig {
    /// Number of cached-inode slots in the block cache.
    pub cache_inode_count: usize,

    /// Number of cached-block descriptors shared by all cached inodes.
    pub cache_block_count: usize,

    /// Upper bound on a data block's payload, in bytes. The effective bound
    /// is lowered at format/detect time if the smallest area cannot hold two
    /// maximal blocks.
    pub block_max_data_sz: u16,

    /// Initial capacity hint for the object index.
    pub hash_capacity: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_inode_count: 4,
            cache_block_count: 64,
            block_max_data_sz: 2048,
            hash_capacity: 256,
        }
    }
}
