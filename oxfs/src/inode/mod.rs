//! Inode handles.
//!
//! An [`Inode`] is a small value naming a disk inode by its position in the
//! inode area. It keeps no state of its own: every operation reads the
//! on-disk record, does its work, and writes the record back, so handles
//! are cheap to copy and never go stale while the external lock is held.
//!
//! Directory content is a packed array of [`DirEntry`] records. Removal
//! compacts by moving the final entry into the vacated slot, so entry order
//! is arbitrary and lookups rescan from the start every time.

use dataview::PodMethods as _;
use log::debug;
use oxfs_types::{
    BLOCK_SIZE, DirBlock, DirEntry, DiskInode, InodeNo, InodePos, T_DIR,
};

use crate::{Error, Result, fs::FileSystem};

mod content;

/// Size of one directory entry in bytes.
pub const DIR_ENTRY_SIZE: u32 = size_of::<DirEntry>() as u32;

/// Current time as on-disk unix seconds.
pub(crate) fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as u32)
}

/// A fresh disk inode record stamped with the caller's identity and the
/// current time.
#[must_use]
pub fn new_disk_inode(ty: u32, mode: u32) -> DiskInode {
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    DiskInode::new(ty, mode, uid, gid, unix_now())
}

/// Value handle to a disk inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Inode {
    pos: InodePos,
}

impl Inode {
    #[must_use]
    pub fn new(pos: InodePos) -> Self {
        Self { pos }
    }

    #[must_use]
    pub fn pos(&self) -> InodePos {
        self.pos
    }

    /// Reads the on-disk inode record.
    pub fn read_disk_inode(&self, fs: &mut FileSystem) -> Result<DiskInode> {
        let mut blk = oxfs_types::InodeBlock::zeroed();
        fs.device.read_as(self.pos.block_no, &mut blk)?;
        Ok(blk.get(self.pos.offset).clone())
    }

    /// Writes the on-disk inode record, splicing it into its block.
    pub fn write_disk_inode(&self, fs: &mut FileSystem, di: &DiskInode) -> Result<()> {
        let mut blk = oxfs_types::InodeBlock::zeroed();
        fs.device.read_as(self.pos.block_no, &mut blk)?;
        *blk.get_mut(self.pos.offset) = di.clone();
        fs.device.write_as(self.pos.block_no, &blk)
    }

    /// Reads file content; updates the access time.
    pub fn read_at(&self, fs: &mut FileSystem, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let mut di = self.read_disk_inode(fs)?;
        let n = content::read_at(&mut di, offset, buf, &mut fs.device)?;
        self.write_disk_inode(fs, &di)?;
        Ok(n)
    }

    /// Writes file content, growing the file first if the write extends
    /// past the current end.
    pub fn write_at(&self, fs: &mut FileSystem, offset: u32, data: &[u8]) -> Result<usize> {
        let end = u64::from(offset) + data.len() as u64;
        if end > u64::from(oxfs_types::MAX_FILE_SIZE) {
            return Err(Error::OutOfRange);
        }
        let mut di = self.read_disk_inode(fs)?;
        if end as u32 > di.size {
            let freed = content::resize(&mut di, end as u32, &fs.data_bitmap, &mut fs.device)?;
            debug_assert!(freed.is_empty());
        }
        let n = content::write_at(&mut di, offset, data, &mut fs.device)?;
        self.write_disk_inode(fs, &di)?;
        Ok(n)
    }

    /// Truncates or extends a regular file to `new_size` bytes.
    pub fn resize(&self, fs: &mut FileSystem, new_size: u32) -> Result<()> {
        let mut di = self.read_disk_inode(fs)?;
        if !di.is_file() {
            return Err(Error::NotFile);
        }
        let freed = content::resize(&mut di, new_size, &fs.data_bitmap, &mut fs.device)?;
        self.write_disk_inode(fs, &di)?;
        for bn in freed {
            fs.free_data(bn)?;
        }
        Ok(())
    }

    /// Creates a child entry named `name` in this directory, backed by a
    /// newly allocated inode initialised from `child_di`. A directory child
    /// is seeded with its `.` and `..` entries.
    pub fn create(&self, fs: &mut FileSystem, name: &[u8], mut child_di: DiskInode) -> Result<Inode> {
        let mut dir_di = self.read_disk_inode(fs)?;
        if !dir_di.is_dir() {
            return Err(Error::NotDirectory);
        }

        let ino = fs.alloc_inode()?;
        let child = Inode::new(fs.inode_pos(ino));
        debug!("create {:?} as inode {ino}", String::from_utf8_lossy(name));

        // append the new entry to this directory
        let entry = DirEntry::new(name, ino);
        let end = dir_di.size;
        let freed = content::resize(&mut dir_di, end + DIR_ENTRY_SIZE, &fs.data_bitmap, &mut fs.device)?;
        debug_assert!(freed.is_empty());
        content::write_at(&mut dir_di, end, entry.as_bytes(), &mut fs.device)?;

        if child_di.ty == T_DIR {
            let dot = DirEntry::new(b".", ino);
            let dotdot = DirEntry::new(b"..", fs.inode_id(self.pos));
            let freed =
                content::resize(&mut child_di, 2 * DIR_ENTRY_SIZE, &fs.data_bitmap, &mut fs.device)?;
            debug_assert!(freed.is_empty());
            content::write_at(&mut child_di, 0, dot.as_bytes(), &mut fs.device)?;
            content::write_at(&mut child_di, DIR_ENTRY_SIZE, dotdot.as_bytes(), &mut fs.device)?;
        }

        child.write_disk_inode(fs, &child_di)?;
        self.write_disk_inode(fs, &dir_di)?;
        Ok(child)
    }

    /// Looks up `name` in this directory.
    pub fn find(&self, fs: &mut FileSystem, name: &[u8]) -> Result<Option<Inode>> {
        let mut di = self.read_disk_inode(fs)?;
        if !di.is_dir() {
            return Err(Error::NotDirectory);
        }
        Ok(self
            .lookup(fs, &mut di, name)?
            .map(|(_, ino)| Inode::new(fs.inode_pos(ino))))
    }

    /// Removes the entry `name`. The target's link count is decremented;
    /// when it reaches zero the entry slot is compacted away, the target's
    /// content truncated, and its inode freed.
    pub fn remove(&self, fs: &mut FileSystem, name: &[u8]) -> Result<()> {
        let mut dir_di = self.read_disk_inode(fs)?;
        if !dir_di.is_dir() {
            return Err(Error::NotDirectory);
        }
        let (index, ino) = self
            .lookup(fs, &mut dir_di, name)?
            .ok_or(Error::NotFound)?;

        let target = Inode::new(fs.inode_pos(ino));
        let mut target_di = target.read_disk_inode(fs)?;
        target_di.link_cnt -= 1;
        if target_di.link_cnt > 0 {
            return target.write_disk_inode(fs, &target_di);
        }

        debug!("remove {:?}: freeing inode {ino}", String::from_utf8_lossy(name));
        self.remove_entry_at(fs, &mut dir_di, index)?;

        let cleared = content::clear(&mut target_di, &fs.data_bitmap, &mut fs.device)?;
        for bn in cleared {
            fs.free_data(bn)?;
        }
        fs.free_inode(ino)
    }

    /// Adds (or, with `replace`, retargets) the entry `name` referring to
    /// `target`, incrementing the target's link count.
    pub fn link(&self, fs: &mut FileSystem, name: &[u8], target: Inode, replace: bool) -> Result<()> {
        let mut dir_di = self.read_disk_inode(fs)?;
        if !dir_di.is_dir() {
            return Err(Error::NotDirectory);
        }
        let target_ino = fs.inode_id(target.pos);
        let existing = self.lookup(fs, &mut dir_di, name)?;

        if let Some((index, _)) = existing {
            if !replace {
                return Err(Error::AlreadyExists);
            }
            target.bump_link(fs, 1)?;
            let entry = DirEntry::new(name, target_ino);
            content::write_at(&mut dir_di, index * DIR_ENTRY_SIZE, entry.as_bytes(), &mut fs.device)?;
            return self.write_disk_inode(fs, &dir_di);
        }

        target.bump_link(fs, 1)?;
        let entry = DirEntry::new(name, target_ino);
        let end = dir_di.size;
        let freed = content::resize(&mut dir_di, end + DIR_ENTRY_SIZE, &fs.data_bitmap, &mut fs.device)?;
        debug_assert!(freed.is_empty());
        content::write_at(&mut dir_di, end, entry.as_bytes(), &mut fs.device)?;
        self.write_disk_inode(fs, &dir_di)
    }

    /// Detaches the entry `name` and returns its inode without freeing
    /// anything; the target's link count is decremented. Rename is built
    /// from this plus [`Inode::link`].
    pub fn unlink(&self, fs: &mut FileSystem, name: &[u8]) -> Result<Inode> {
        let mut dir_di = self.read_disk_inode(fs)?;
        if !dir_di.is_dir() {
            return Err(Error::NotDirectory);
        }
        let (index, ino) = self
            .lookup(fs, &mut dir_di, name)?
            .ok_or(Error::NotFound)?;
        self.remove_entry_at(fs, &mut dir_di, index)?;

        let target = Inode::new(fs.inode_pos(ino));
        target.bump_link(fs, -1)?;
        Ok(target)
    }

    /// Flushes the inode's data (and index) blocks; with `metadata` also
    /// the block holding the inode record itself.
    pub fn sync(&self, fs: &mut FileSystem, metadata: bool) -> Result<()> {
        let di = self.read_disk_inode(fs)?;
        content::sync_data(&di, &mut fs.device, true)?;
        if metadata {
            fs.device.sync(self.pos.block_no)?;
        }
        Ok(())
    }

    /// Calls `f` once per live directory entry.
    pub fn read_dir(
        &self,
        fs: &mut FileSystem,
        mut f: impl FnMut(&[u8], InodeNo),
    ) -> Result<()> {
        let mut di = self.read_disk_inode(fs)?;
        if !di.is_dir() {
            return Err(Error::NotDirectory);
        }
        let blocks = DiskInode::data_blocks(di.size);
        for blk in 0..blocks {
            let dir = read_dir_block(&mut di, blk, fs)?;
            for entry in dir.entries() {
                if let Some(ino) = entry.ino() {
                    f(entry.name(), ino);
                }
            }
        }
        Ok(())
    }

    /// A directory is empty when it occupies a single data block whose only
    /// live entries are `.` and `..`.
    pub fn is_empty_dir(&self, fs: &mut FileSystem) -> Result<bool> {
        let mut di = self.read_disk_inode(fs)?;
        if !di.is_dir() {
            return Err(Error::NotDirectory);
        }
        if DiskInode::total_blocks(di.size) > 1 {
            return Ok(false);
        }
        let dir = read_dir_block(&mut di, 0, fs)?;
        for entry in dir.entries() {
            if entry.ino().is_some() && entry.name() != b"." && entry.name() != b".." {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Scans the directory for `name`; returns the entry index and inode id.
    fn lookup(
        &self,
        fs: &mut FileSystem,
        di: &mut DiskInode,
        name: &[u8],
    ) -> Result<Option<(u32, InodeNo)>> {
        let blocks = DiskInode::data_blocks(di.size);
        for blk in 0..blocks {
            let dir = read_dir_block(di, blk, fs)?;
            for (i, entry) in dir.entries().iter().enumerate() {
                let Some(ino) = entry.ino() else { continue };
                if entry.is_same_name(name) {
                    let index = blk * (BLOCK_SIZE as u32 / DIR_ENTRY_SIZE) + i as u32;
                    return Ok(Some((index, ino)));
                }
            }
        }
        Ok(None)
    }

    /// Compacts the entry at `index` away by moving the final entry into
    /// its place, then shrinks the directory by one entry.
    fn remove_entry_at(&self, fs: &mut FileSystem, dir_di: &mut DiskInode, index: u32) -> Result<()> {
        let count = dir_di.size / DIR_ENTRY_SIZE;
        debug_assert!(index < count);
        if index + 1 != count {
            let mut last = DirEntry::zeroed();
            content::read_at(
                dir_di,
                (count - 1) * DIR_ENTRY_SIZE,
                last.as_bytes_mut(),
                &mut fs.device,
            )?;
            content::write_at(dir_di, index * DIR_ENTRY_SIZE, last.as_bytes(), &mut fs.device)?;
        }
        let freed = content::resize(
            dir_di,
            (count - 1) * DIR_ENTRY_SIZE,
            &fs.data_bitmap,
            &mut fs.device,
        )?;
        self.write_disk_inode(fs, dir_di)?;
        // bits are cleared only after the updated inode is written back
        for bn in freed {
            fs.free_data(bn)?;
        }
        Ok(())
    }

    fn bump_link(&self, fs: &mut FileSystem, delta: i32) -> Result<()> {
        let mut di = self.read_disk_inode(fs)?;
        di.link_cnt = di.link_cnt.wrapping_add_signed(delta);
        self.write_disk_inode(fs, &di)
    }
}

/// Reads one directory data block; entries past the end of file stay
/// zeroed and therefore read as empty slots.
fn read_dir_block(di: &mut DiskInode, blk: u32, fs: &mut FileSystem) -> Result<DirBlock> {
    let mut dir = DirBlock::zeroed();
    let offset = blk * BLOCK_SIZE as u32;
    let len = (BLOCK_SIZE as u32).min(di.size - offset) as usize;
    content::read_at(di, offset, &mut dir.as_bytes_mut()[..len], &mut fs.device)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    use oxfs_types::T_FILE;

    use crate::fs::new_test_fs;

    fn new_dir_template() -> DiskInode {
        new_disk_inode(T_DIR, libc::S_IFDIR | 0o755)
    }

    fn new_file_template() -> DiskInode {
        new_disk_inode(T_FILE, libc::S_IFREG | 0o644)
    }

    #[test]
    fn create_then_find() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let child = root.create(&mut fs, b"notes", new_file_template()).unwrap();
        let found = root.find(&mut fs, b"notes").unwrap().unwrap();
        assert_eq!(found, child);
        assert!(root.find(&mut fs, b"other").unwrap().is_none());
    }

    #[test]
    fn find_on_file_is_not_a_directory() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let file = root.create(&mut fs, b"f", new_file_template()).unwrap();
        assert!(matches!(
            file.find(&mut fs, b"x"),
            Err(Error::NotDirectory)
        ));
    }

    #[test]
    fn new_directory_has_dot_entries() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let sub = root.create(&mut fs, b"sub", new_dir_template()).unwrap();

        let dot = sub.find(&mut fs, b".").unwrap().unwrap();
        let dotdot = sub.find(&mut fs, b"..").unwrap().unwrap();
        assert_eq!(dot, sub);
        assert_eq!(dotdot, root);
        assert!(sub.is_empty_dir(&mut fs).unwrap());
    }

    #[test]
    fn remove_frees_inode_and_blocks() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let free_inodes = fs.count_free_inodes().unwrap();
        let free_data = fs.count_free_data().unwrap();

        let file = root.create(&mut fs, b"big", new_file_template()).unwrap();
        file.write_at(&mut fs, 0, &vec![1u8; 3 * BLOCK_SIZE]).unwrap();
        root.remove(&mut fs, b"big").unwrap();

        assert!(root.find(&mut fs, b"big").unwrap().is_none());
        assert_eq!(fs.count_free_inodes().unwrap(), free_inodes);
        assert_eq!(fs.count_free_data().unwrap(), free_data);
    }

    #[test]
    fn remove_missing_entry_fails() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        assert!(matches!(
            root.remove(&mut fs, b"ghost"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn compaction_preserves_remaining_entries() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let names: Vec<Vec<u8>> = (0..40).map(|i| format!("f{i:02}").into_bytes()).collect();
        for name in &names {
            root.create(&mut fs, name, new_file_template()).unwrap();
        }
        // remove from the middle so the swap-with-last path runs
        root.remove(&mut fs, b"f07").unwrap();
        root.remove(&mut fs, b"f00").unwrap();
        root.remove(&mut fs, b"f39").unwrap();

        let mut seen = Vec::new();
        root.read_dir(&mut fs, |name, _| seen.push(name.to_vec()))
            .unwrap();
        for name in &names {
            let gone = name.as_slice() == b"f07"
                || name.as_slice() == b"f00"
                || name.as_slice() == b"f39";
            assert_eq!(
                root.find(&mut fs, name).unwrap().is_some(),
                !gone,
                "{}",
                String::from_utf8_lossy(name)
            );
            assert_eq!(seen.iter().filter(|n| *n == name).count(), usize::from(!gone));
        }
    }

    #[test]
    fn link_and_remove_track_link_count() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let file = root.create(&mut fs, b"a", new_file_template()).unwrap();

        root.link(&mut fs, b"b", file, false).unwrap();
        let di = file.read_disk_inode(&mut fs).unwrap();
        assert_eq!(di.link_cnt, 2);

        // a second link under the same name needs replace
        assert!(matches!(
            root.link(&mut fs, b"b", file, false),
            Err(Error::AlreadyExists)
        ));

        // dropping one name keeps the inode alive
        root.remove(&mut fs, b"a").unwrap();
        let di = file.read_disk_inode(&mut fs).unwrap();
        assert_eq!(di.link_cnt, 1);
        assert!(root.find(&mut fs, b"b").unwrap().is_some());
    }

    #[test]
    fn unlink_returns_inode_without_freeing() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let file = root.create(&mut fs, b"src", new_file_template()).unwrap();
        file.write_at(&mut fs, 0, b"payload").unwrap();

        let detached = root.unlink(&mut fs, b"src").unwrap();
        assert_eq!(detached, file);
        assert!(root.find(&mut fs, b"src").unwrap().is_none());

        // relink under a new name; content is intact
        root.link(&mut fs, b"dst", detached, false).unwrap();
        let mut buf = [0u8; 7];
        detached.read_at(&mut fs, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        let di = detached.read_disk_inode(&mut fs).unwrap();
        assert_eq!(di.link_cnt, 1);
    }

    #[test]
    fn write_past_end_grows_the_file() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let file = root.create(&mut fs, b"f", new_file_template()).unwrap();

        let off = 2 * BLOCK_SIZE as u32 + 100;
        assert_eq!(file.write_at(&mut fs, off, b"end").unwrap(), 3);
        let di = file.read_disk_inode(&mut fs).unwrap();
        assert_eq!(di.size, off + 3);

        // the hole reads as zeros
        let mut gap = [9u8; 64];
        file.read_at(&mut fs, BLOCK_SIZE as u32, &mut gap).unwrap();
        assert_eq!(gap, [0; 64]);
    }

    #[test]
    fn resize_rejects_directories() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        assert!(matches!(root.resize(&mut fs, 0), Err(Error::NotFile)));
    }

    #[test]
    fn truncate_restores_free_space() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let file = root.create(&mut fs, b"f", new_file_template()).unwrap();
        let free_before = fs.count_free_data().unwrap();

        file.write_at(&mut fs, 0, &vec![3u8; 40 * BLOCK_SIZE]).unwrap();
        assert!(fs.count_free_data().unwrap() < free_before);
        file.resize(&mut fs, 0).unwrap();
        assert_eq!(fs.count_free_data().unwrap(), free_before);
    }

    #[test]
    fn times_are_maintained() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        let file = root.create(&mut fs, b"f", new_file_template()).unwrap();
        let created = file.read_disk_inode(&mut fs).unwrap();
        assert!(created.atime > 0 && created.mtime > 0 && created.ctime > 0);

        file.write_at(&mut fs, 0, b"data").unwrap();
        let written = file.read_disk_inode(&mut fs).unwrap();
        assert!(written.mtime >= created.mtime);
        assert!(written.ctime >= created.ctime);
    }
}
