//! The VFS-style operation surface.
//!
//! [`Vfs`] ties the file system, the path resolver, and the open-file
//! handle table together and exposes the path- and handle-based operations
//! an adapter (e.g. a FUSE driver) binds to. Errors are POSIX codes; an
//! adapter returns [`Errno::to_ret`] (the negated code) to its kernel.
//!
//! The core is single-threaded: callers serialise every entry point under
//! one external lock.

use std::{fmt, path::Path};

use bitflags::bitflags;
use log::debug;
use oxfs_types::{
    BLOCK_SIZE, DiskInode, INODES_PER_BLOCK, MAX_NAME_LEN, T_DIR, T_FILE,
};

use crate::{
    Error, Result,
    fs::FileSystem,
    inode::{Inode, new_disk_inode},
    params,
    path::{PathResolver, split_parent},
};

/// A positive POSIX error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(i32);

impl Errno {
    pub const ENOENT: Self = Self(libc::ENOENT);
    pub const ENOTDIR: Self = Self(libc::ENOTDIR);
    pub const ENOTEMPTY: Self = Self(libc::ENOTEMPTY);
    pub const EBADF: Self = Self(libc::EBADF);
    pub const EINVAL: Self = Self(libc::EINVAL);
    pub const EIO: Self = Self(libc::EIO);
    pub const EEXIST: Self = Self(libc::EEXIST);
    pub const ENOSPC: Self = Self(libc::ENOSPC);

    /// The FUSE-style return value: the negated code.
    #[must_use]
    pub fn to_ret(self) -> i32 {
        -self.0
    }

    #[must_use]
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl From<Error> for Errno {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound | Error::InvalidPath => Self::ENOENT,
            Error::NotDirectory => Self::ENOTDIR,
            Error::NotEmpty => Self::ENOTEMPTY,
            Error::NotFile | Error::OutOfRange => Self::EINVAL,
            Error::AlreadyExists => Self::EEXIST,
            Error::NoSpace | Error::NoInodes => Self::ENOSPC,
            Error::Io(_) | Error::InvalidMagic => Self::EIO,
        }
    }
}

pub type VfsResult<T> = std::result::Result<T, Errno>;

bitflags! {
    /// Flags accepted by [`Vfs::rename`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenameFlags: u32 {
        /// Fail if the destination entry already exists.
        const NOREPLACE = 1;
        /// Swap the two entries; both must exist.
        const EXCHANGE = 2;
    }
}

/// Attributes of one inode, as reported by [`Vfs::getattr`].
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    /// Blocks consumed, index blocks included.
    pub blocks: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub block_size: u32,
}

/// File system totals, as reported by [`Vfs::statfs`].
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

/// Open-file handle table: handle values are dense and never reused within
/// a mount. Handle 0 is reserved as "not open".
struct HandleTable {
    map: std::collections::BTreeMap<u64, Inode>,
    next: u64,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            map: std::collections::BTreeMap::new(),
            next: 1,
        }
    }

    fn open(&mut self, inode: Inode) -> u64 {
        let handle = self.next;
        self.next += 1;
        self.map.insert(handle, inode);
        handle
    }

    fn get(&self, handle: u64) -> Option<Inode> {
        if handle == 0 {
            return None;
        }
        self.map.get(&handle).copied()
    }

    fn close(&mut self, handle: u64) -> bool {
        self.map.remove(&handle).is_some()
    }
}

/// The mounted file system with its resolver and handle table.
pub struct Vfs {
    fs: FileSystem,
    resolver: PathResolver,
    handles: HandleTable,
}

impl Vfs {
    /// Formats a fresh image and mounts it.
    pub fn format(
        path: &Path,
        size: u64,
        total_blocks: u32,
        inode_bitmap_blocks: u32,
    ) -> Result<Self> {
        let fs = FileSystem::create(path, size, total_blocks, inode_bitmap_blocks)?;
        Ok(Self::with_fs(fs))
    }

    /// Mounts an existing image.
    pub fn mount(path: &Path) -> Result<Self> {
        let fs = FileSystem::open(path)?;
        Ok(Self::with_fs(fs))
    }

    fn with_fs(fs: FileSystem) -> Self {
        Self {
            fs,
            resolver: PathResolver::new(params::PATH_CACHE_BYTES),
            handles: HandleTable::new(),
        }
    }

    /// Direct access to the file system, for tools and tests.
    pub fn fs_mut(&mut self) -> &mut FileSystem {
        &mut self.fs
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> VfsResult<()> {
        debug!("mkdir {path} mode {mode:o}");
        let (parent_path, name) = split_parent(path);
        let name = check_name(name)?;
        let parent = self.resolver.resolve(&mut self.fs, parent_path)?;
        if parent.find(&mut self.fs, name)?.is_some() {
            return Err(Errno::EEXIST);
        }
        let di = new_disk_inode(T_DIR, libc::S_IFDIR | (mode & 0o777));
        parent.create(&mut self.fs, name, di)?;
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        debug!("rmdir {path}");
        let (parent_path, name) = split_parent(path);
        let name = check_name(name)?;
        let parent = self.resolver.resolve(&mut self.fs, parent_path)?;
        let child = parent
            .find(&mut self.fs, name)?
            .ok_or(Errno::ENOENT)?;
        if !child.read_disk_inode(&mut self.fs)?.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if !child.is_empty_dir(&mut self.fs)? {
            return Err(Errno::ENOTEMPTY);
        }
        parent.remove(&mut self.fs, name)?;
        self.resolver.invalidate_prefix(path);
        Ok(())
    }

    /// Calls `filler` once per live entry, `.` and `..` included.
    pub fn readdir(&mut self, path: &str, mut filler: impl FnMut(&[u8])) -> VfsResult<()> {
        debug!("readdir {path}");
        let inode = self.resolver.resolve(&mut self.fs, path)?;
        inode.read_dir(&mut self.fs, |name, _| filler(name))?;
        Ok(())
    }

    pub fn rename(&mut self, src: &str, dst: &str, flags: RenameFlags) -> VfsResult<()> {
        debug!("rename {src} -> {dst} ({flags:?})");
        if flags.contains(RenameFlags::NOREPLACE | RenameFlags::EXCHANGE) {
            return Err(Errno::EINVAL);
        }
        let (src_parent_path, src_name) = split_parent(src);
        let (dst_parent_path, dst_name) = split_parent(dst);
        let src_name = check_name(src_name)?;
        let dst_name = check_name(dst_name)?;
        let src_parent = self.resolver.resolve(&mut self.fs, src_parent_path)?;
        let dst_parent = self.resolver.resolve(&mut self.fs, dst_parent_path)?;

        let dst_existing = dst_parent.find(&mut self.fs, dst_name)?;
        if flags.contains(RenameFlags::NOREPLACE) && dst_existing.is_some() {
            return Err(Errno::EEXIST);
        }

        if flags.contains(RenameFlags::EXCHANGE) {
            if dst_existing.is_none() {
                return Err(Errno::ENOENT);
            }
            let a = src_parent.unlink(&mut self.fs, src_name)?;
            let b = dst_parent.unlink(&mut self.fs, dst_name)?;
            src_parent.link(&mut self.fs, src_name, b, false)?;
            dst_parent.link(&mut self.fs, dst_name, a, false)?;
        } else {
            let moved = src_parent.unlink(&mut self.fs, src_name)?;
            dst_parent.link(&mut self.fs, dst_name, moved, true)?;
        }

        self.resolver.invalidate_prefix(src);
        self.resolver.invalidate_prefix(dst);
        Ok(())
    }

    /// Creates a regular file and opens it. An existing entry is opened
    /// instead, as with `O_CREAT` without `O_EXCL`.
    pub fn create(&mut self, path: &str, mode: u32) -> VfsResult<u64> {
        debug!("create {path} mode {mode:o}");
        let (parent_path, name) = split_parent(path);
        let name = check_name(name)?;
        let parent = self.resolver.resolve(&mut self.fs, parent_path)?;
        if let Some(existing) = parent.find(&mut self.fs, name)? {
            return Ok(self.handles.open(existing));
        }
        let di = new_disk_inode(T_FILE, libc::S_IFREG | (mode & 0o777));
        let child = parent.create(&mut self.fs, name, di)?;
        Ok(self.handles.open(child))
    }

    pub fn unlink(&mut self, path: &str) -> VfsResult<()> {
        debug!("unlink {path}");
        let (parent_path, name) = split_parent(path);
        let name = check_name(name)?;
        let parent = self.resolver.resolve(&mut self.fs, parent_path)?;
        parent.remove(&mut self.fs, name)?;
        self.resolver.invalidate_prefix(path);
        Ok(())
    }

    pub fn open(&mut self, path: &str) -> VfsResult<u64> {
        debug!("open {path}");
        let inode = self.resolver.resolve(&mut self.fs, path)?;
        Ok(self.handles.open(inode))
    }

    pub fn release(&mut self, handle: u64) -> VfsResult<()> {
        debug!("release handle {handle}");
        if !self.handles.close(handle) {
            return Err(Errno::EBADF);
        }
        Ok(())
    }

    pub fn read(&mut self, handle: u64, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let inode = self.handles.get(handle).ok_or(Errno::EBADF)?;
        let offset = u32::try_from(offset).map_err(|_| Errno::EINVAL)?;
        Ok(inode.read_at(&mut self.fs, offset, buf)?)
    }

    pub fn write(&mut self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<usize> {
        let inode = self.handles.get(handle).ok_or(Errno::EBADF)?;
        let offset = u32::try_from(offset).map_err(|_| Errno::EINVAL)?;
        Ok(inode.write_at(&mut self.fs, offset, data)?)
    }

    pub fn truncate(&mut self, path: &str, len: u64) -> VfsResult<()> {
        debug!("truncate {path} to {len}");
        let len = u32::try_from(len).map_err(|_| Errno::EINVAL)?;
        let inode = self.resolver.resolve(&mut self.fs, path)?;
        inode.resize(&mut self.fs, len)?;
        Ok(())
    }

    /// Flushes the file's blocks to the image; with `datasync` the block
    /// holding the inode record is skipped.
    pub fn fsync(&mut self, handle: u64, datasync: bool) -> VfsResult<()> {
        let inode = self.handles.get(handle).ok_or(Errno::EBADF)?;
        inode.sync(&mut self.fs, !datasync)?;
        Ok(())
    }

    pub fn getattr(&mut self, path: &str) -> VfsResult<FileStat> {
        let inode = self.resolver.resolve(&mut self.fs, path)?;
        let di = inode.read_disk_inode(&mut self.fs)?;
        Ok(FileStat {
            mode: di.mode,
            uid: di.uid,
            gid: di.gid,
            nlink: di.link_cnt,
            size: u64::from(di.size),
            blocks: u64::from(DiskInode::total_blocks(di.size)),
            atime: di.atime,
            mtime: di.mtime,
            ctime: di.ctime,
            block_size: BLOCK_SIZE as u32,
        })
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> VfsResult<()> {
        debug!("chmod {path} to {mode:o}");
        self.update_inode(path, |di| di.mode = mode)
    }

    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> VfsResult<()> {
        debug!("chown {path} to {uid}:{gid}");
        self.update_inode(path, |di| {
            di.uid = uid;
            di.gid = gid;
        })
    }

    pub fn utimens(&mut self, path: &str, atime: u32, mtime: u32) -> VfsResult<()> {
        self.update_inode(path, |di| {
            di.atime = atime;
            di.mtime = mtime;
        })
    }

    pub fn statfs(&mut self) -> VfsResult<StatFs> {
        let sb = self.fs.super_block();
        let total_blocks = u64::from(sb.data_area_blocks);
        let total_inodes = u64::from(sb.inode_area_blocks) * INODES_PER_BLOCK as u64;
        Ok(StatFs {
            block_size: BLOCK_SIZE as u32,
            total_blocks,
            free_blocks: u64::from(self.fs.count_free_data()?),
            total_inodes,
            free_inodes: u64::from(self.fs.count_free_inodes()?),
        })
    }

    /// Writes every dirty cached block to the image.
    pub fn flush(&mut self) -> VfsResult<()> {
        self.fs.sync_all()?;
        Ok(())
    }

    /// Read-modify-write of one disk inode record.
    fn update_inode(&mut self, path: &str, f: impl FnOnce(&mut DiskInode)) -> VfsResult<()> {
        let inode = self.resolver.resolve(&mut self.fs, path)?;
        let mut di = inode.read_disk_inode(&mut self.fs)?;
        f(&mut di);
        inode.write_disk_inode(&mut self.fs, &di)?;
        Ok(())
    }
}

impl Drop for Vfs {
    fn drop(&mut self) {
        if let Err(e) = self.fs.sync_all() {
            log::warn!("sync on unmount failed: {e}");
        }
    }
}

fn check_name(name: &str) -> VfsResult<&[u8]> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Errno::EINVAL);
    }
    Ok(name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_negated_posix_codes() {
        assert_eq!(Errno::ENOENT.to_ret(), -libc::ENOENT);
        assert_eq!(Errno::from(Error::NotFound), Errno::ENOENT);
        assert_eq!(Errno::from(Error::NotDirectory), Errno::ENOTDIR);
        assert_eq!(Errno::from(Error::NotEmpty), Errno::ENOTEMPTY);
        assert_eq!(Errno::from(Error::OutOfRange), Errno::EINVAL);
        assert_eq!(
            Errno::from(Error::Io(std::io::Error::other("x"))),
            Errno::EIO
        );
    }

    #[test]
    fn handles_are_dense_and_unique() {
        let mut table = HandleTable::new();
        let inode = Inode::new(oxfs_types::InodePos::INVALID);
        let a = table.open(inode);
        let b = table.open(inode);
        assert_ne!(a, b);
        assert_eq!(table.get(0), None);
        assert!(table.close(a));
        assert_eq!(table.get(a), None);
        assert!(!table.close(a));
        assert_eq!(table.get(b), Some(inode));
    }
}
