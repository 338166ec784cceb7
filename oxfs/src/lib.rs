//! A POSIX-style file system stored in a single image file.
//!
//! Layers, bottom up:
//!   + Disk image: a regular file addressed as an array of fixed-size
//!     blocks ([`device::DiskFile`]).
//!   + Buffered device: a bounded write-back LRU cache in front of the
//!     image ([`device::BlockDevice`], backed by the `block_cache` crate).
//!   + Bitmaps: allocators for inode slots and data blocks ([`bitmap`]).
//!   + Inodes: on-disk records with direct, indirect-1 and indirect-2 block
//!     pointers, and the directory operations built on them ([`inode`]).
//!   + File system: the super block, the disk partition, and inode handles
//!     ([`fs::FileSystem`]).
//!   + Paths: component-wise resolution with a clock-evicted prefix cache
//!     ([`path::PathResolver`]).
//!   + Operations: the VFS-style surface an adapter binds to ([`ops::Vfs`]).
//!
//! The core performs no locking of its own; an embedding adapter serialises
//! every call under one lock. There is no journal: an interruption can leak
//! blocks but the free-after-write ordering in the shrink path keeps it
//! from double-allocating them.

pub mod bitmap;
mod data_block;
pub mod device;
mod error;
pub mod fs;
pub mod inode;
pub mod ops;
pub mod params;
pub mod path;

pub use self::error::{Error, Result};
