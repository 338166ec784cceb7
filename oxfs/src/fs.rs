//! The file system object.
//!
//! Owns the super block, both bitmaps, and the block device, and hands out
//! [`Inode`] handles. The disk is partitioned as
//! `[super][inode bitmap][inode table][data bitmap][data area][unused tail]`;
//! the partition is computed once at format time and recorded in the super
//! block.

use std::path::Path;

use dataview::PodMethods as _;
use log::{info, warn};
use oxfs_types::{
    BLOCK_SIZE, BlockNo, DirBlock, DirEntry, DiskInode, INODES_PER_BLOCK, InodeNo, InodePos,
    SuperBlock, T_DIR,
};

use crate::{
    Error, Result,
    bitmap::Bitmap,
    data_block,
    device::BlockDevice,
    inode::{self, Inode},
    params,
};

pub struct FileSystem {
    pub(crate) device: BlockDevice,
    super_block: SuperBlock,
    inode_bitmap: Bitmap,
    pub(crate) data_bitmap: Bitmap,
    inode_area_start: u32,
    data_area_start: u32,
}

impl FileSystem {
    /// Formats a fresh image at `path` and returns the mounted file system.
    ///
    /// The file is truncated to `size` bytes; `total_blocks` of it are
    /// partitioned into the on-disk areas. One data bitmap block is paired
    /// with the `8 * BLOCK_SIZE` data blocks it describes, so any remainder
    /// smaller than one such group is left unused at the tail.
    pub fn create(
        path: &Path,
        size: u64,
        total_blocks: u32,
        inode_bitmap_blocks: u32,
    ) -> Result<Self> {
        let mut device = BlockDevice::create(path, size, params::BLOCK_CACHE_BYTES)?;
        if total_blocks > device.num_blocks() || inode_bitmap_blocks == 0 {
            return Err(Error::OutOfRange);
        }

        let inode_area_blocks = inode_bitmap_blocks * 8 * INODES_PER_BLOCK as u32;
        let remaining = total_blocks
            .checked_sub(1 + inode_bitmap_blocks + inode_area_blocks)
            .ok_or(Error::OutOfRange)?;
        let data_bitmap_blocks = remaining / (1 + 8 * BLOCK_SIZE as u32);
        let data_area_blocks = data_bitmap_blocks * 8 * BLOCK_SIZE as u32;
        if data_area_blocks == 0 {
            warn!("image too small: no data blocks");
            return Err(Error::OutOfRange);
        }
        info!(
            "format: {total_blocks} blocks = 1 super + {inode_bitmap_blocks} inode bitmap \
             + {inode_area_blocks} inode area + {data_bitmap_blocks} data bitmap \
             + {data_area_blocks} data area + {} unused",
            remaining - data_bitmap_blocks - data_area_blocks,
        );

        let super_block = SuperBlock::new(
            total_blocks,
            inode_bitmap_blocks,
            inode_area_blocks,
            data_bitmap_blocks,
            data_area_blocks,
        );
        // stage 1: super block with an invalid root position
        device.write_as(BlockNo::SUPER_BLOCK, &super_block)?;

        let mut fs = Self::assemble(device, super_block);
        fs.create_root()?;
        // formatting is only done once the image is actually on disk
        fs.device.sync_all()?;
        Ok(fs)
    }

    /// Opens an existing image.
    pub fn open(path: &Path) -> Result<Self> {
        let mut device = BlockDevice::open(path, params::BLOCK_CACHE_BYTES)?;
        let mut super_block = SuperBlock::zeroed();
        device.read_as(BlockNo::SUPER_BLOCK, &mut super_block)?;
        if !super_block.is_valid() {
            warn!("bad magic in super block: {:#x}", super_block.magic);
            return Err(Error::InvalidMagic);
        }
        info!(
            "mounted: {} blocks, {} inodes, {} data blocks",
            super_block.total_blocks,
            super_block.inode_area_blocks * INODES_PER_BLOCK as u32,
            super_block.data_area_blocks,
        );
        Ok(Self::assemble(device, super_block))
    }

    /// Builds the in-memory descriptors from a validated super block.
    fn assemble(device: BlockDevice, super_block: SuperBlock) -> Self {
        let inode_area_start = super_block.inode_area_start();
        let data_area_start = super_block.data_area_start();
        let inode_bitmap = Bitmap::new(
            1,
            super_block.inode_bitmap_blocks,
            0,
            super_block.inode_area_blocks * INODES_PER_BLOCK as u32,
        );
        let data_bitmap = Bitmap::new(
            super_block.data_bitmap_start(),
            super_block.data_bitmap_blocks,
            data_area_start,
            super_block.data_area_blocks,
        );
        Self {
            device,
            super_block,
            inode_bitmap,
            data_bitmap,
            inode_area_start,
            data_area_start,
        }
    }

    /// Allocates the root directory and records its position in the super
    /// block.
    fn create_root(&mut self) -> Result<()> {
        // Inode id 0 is burned here so that a zero in a directory entry can
        // only ever mean "empty slot".
        let reserved = self.alloc_inode()?;
        debug_assert_eq!(reserved, InodeNo::EMPTY);
        let root_ino = self.alloc_inode()?;
        debug_assert_eq!(root_ino, InodeNo::ROOT);
        let root_data = self.alloc_data()?;

        let mut dir = DirBlock::zeroed();
        *dir.entry_mut(0) = DirEntry::new(b".", root_ino);
        *dir.entry_mut(1) = DirEntry::new(b"..", root_ino);
        self.device.write_as(root_data, &dir)?;

        let mut di = inode::new_disk_inode(T_DIR, libc::S_IFDIR | 0o755);
        di.size = 2 * size_of::<DirEntry>() as u32;
        di.direct[0] = root_data.value();

        let root_pos = self.inode_pos(root_ino);
        Inode::new(root_pos).write_disk_inode(self, &di)?;

        self.super_block.root_pos = root_pos;
        self.device.write_as(BlockNo::SUPER_BLOCK, &self.super_block)
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> Inode {
        Inode::new(self.super_block.root_pos)
    }

    #[must_use]
    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    /// Maps an inode id to the position of its record in the inode area.
    #[must_use]
    pub fn inode_pos(&self, ino: InodeNo) -> InodePos {
        let per_block = INODES_PER_BLOCK as u32;
        InodePos::new(
            BlockNo::new(self.inode_area_start + ino.value() / per_block),
            (ino.value() % per_block) * size_of::<DiskInode>() as u32,
        )
    }

    /// Inverse of [`FileSystem::inode_pos`].
    #[must_use]
    pub fn inode_id(&self, pos: InodePos) -> InodeNo {
        let per_block = INODES_PER_BLOCK as u32;
        InodeNo::new(
            (pos.block_no.value() - self.inode_area_start) * per_block
                + pos.offset / size_of::<DiskInode>() as u32,
        )
    }

    pub fn alloc_inode(&mut self) -> Result<InodeNo> {
        let id = self
            .inode_bitmap
            .alloc(&mut self.device)?
            .ok_or(Error::NoInodes)?;
        Ok(InodeNo::new(id))
    }

    pub fn free_inode(&mut self, ino: InodeNo) -> Result<()> {
        self.inode_bitmap.free(&mut self.device, ino.value())
    }

    /// Allocates a zeroed data block.
    pub fn alloc_data(&mut self) -> Result<BlockNo> {
        data_block::alloc(&self.data_bitmap, &mut self.device)
    }

    pub fn free_data(&mut self, block_no: BlockNo) -> Result<()> {
        data_block::free(&self.data_bitmap, &mut self.device, block_no)
    }

    /// Free data blocks left in the data area.
    pub fn count_free_data(&mut self) -> Result<u32> {
        self.data_bitmap.count_free(&mut self.device)
    }

    /// Free inode slots left in the inode area.
    pub fn count_free_inodes(&mut self) -> Result<u32> {
        self.inode_bitmap.count_free(&mut self.device)
    }

    /// Flushes every dirty cache slot to the image.
    pub fn sync_all(&mut self) -> Result<()> {
        self.device.sync_all()
    }
}

// Smallest total_blocks with a non-empty data area, for image-backed tests:
// 1 super + 1 inode bitmap + 224 inode area + one (bitmap, 8 * BLOCK_SIZE
// data) group.
#[cfg(test)]
pub(crate) const TEST_TOTAL_BLOCKS: u32 =
    2 + 8 * INODES_PER_BLOCK as u32 + 1 + 8 * BLOCK_SIZE as u32;

#[cfg(test)]
pub(crate) fn new_test_fs() -> (tempfile::TempDir, FileSystem) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");
    let fs = FileSystem::create(
        &path,
        u64::from(TEST_TOTAL_BLOCKS) * BLOCK_SIZE as u64,
        TEST_TOTAL_BLOCKS,
        1,
    )
    .unwrap();
    (dir, fs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_partitions_the_disk() {
        let (_dir, fs) = new_test_fs();
        let sb = fs.super_block();
        assert!(sb.is_valid());
        assert_eq!(sb.inode_bitmap_blocks, 1);
        assert_eq!(sb.inode_area_blocks, 8 * INODES_PER_BLOCK as u32);
        assert_eq!(sb.data_bitmap_blocks, 1);
        assert_eq!(sb.data_area_blocks, 8 * BLOCK_SIZE as u32);
        assert_eq!(
            sb.data_area_start() + sb.data_area_blocks,
            TEST_TOTAL_BLOCKS
        );
    }

    #[test]
    fn root_is_inode_one() {
        let (_dir, mut fs) = new_test_fs();
        let root = fs.root();
        assert_eq!(fs.inode_id(root.pos()), InodeNo::ROOT);
        let di = root.read_disk_inode(&mut fs).unwrap();
        assert!(di.is_dir());
        assert_eq!(di.size, 2 * size_of::<DirEntry>() as u32);
        assert_eq!(di.link_cnt, 1);
    }

    #[test]
    fn root_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.img");
        {
            let _fs = FileSystem::create(
                &path,
                u64::from(TEST_TOTAL_BLOCKS) * BLOCK_SIZE as u64,
                TEST_TOTAL_BLOCKS,
                1,
            )
            .unwrap();
        }
        let mut fs = FileSystem::open(&path).unwrap();
        let di = fs.root().read_disk_inode(&mut fs).unwrap();
        assert!(di.is_dir());
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-image");
        std::fs::write(&path, vec![0u8; 8 * BLOCK_SIZE]).unwrap();
        assert!(matches!(FileSystem::open(&path), Err(Error::InvalidMagic)));
    }

    #[test]
    fn inode_pos_round_trips() {
        let (_dir, fs) = new_test_fs();
        for id in [0u32, 1, 27, 28, 29, 1000] {
            let ino = InodeNo::new(id);
            assert_eq!(fs.inode_id(fs.inode_pos(ino)), ino);
        }
    }

    #[test]
    fn alloc_inode_skips_reserved_ids() {
        let (_dir, mut fs) = new_test_fs();
        // 0 and 1 went to the reserved slot and the root at format time
        let ino = fs.alloc_inode().unwrap();
        assert_eq!(ino, InodeNo::new(2));
    }

    #[test]
    fn data_blocks_come_from_the_data_area() {
        let (_dir, mut fs) = new_test_fs();
        let bn = fs.alloc_data().unwrap();
        assert!(bn.value() >= fs.super_block().data_area_start());
        let free_before = fs.count_free_data().unwrap();
        fs.free_data(bn).unwrap();
        assert_eq!(fs.count_free_data().unwrap(), free_before + 1);
    }
}
