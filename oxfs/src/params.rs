//! Tunables. Only constants belong here.

/// Byte budget of the block device's LRU cache.
pub const BLOCK_CACHE_BYTES: usize = 32 << 20;

/// Byte budget of the path resolver's prefix cache.
pub const PATH_CACHE_BYTES: usize = 32 << 20;

/// Default image size used by `mkfs` when no size is given.
pub const DEFAULT_IMAGE_BYTES: u64 = 256 << 20;

/// Default number of inode bitmap blocks used by `mkfs`.
pub const DEFAULT_INODE_BITMAP_BLOCKS: u32 = 1;
