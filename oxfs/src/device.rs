//! Disk image access.
//!
//! [`DiskFile`] is the raw store: a regular file treated as a fixed array of
//! [`BLOCK_SIZE`]-byte blocks, addressed with positioned reads and writes so
//! the in-core cache stays authoritative. [`BlockDevice`] is the buffered
//! facade the rest of the file system talks to: reads go through the LRU
//! cache, writes land in the cache dirty, and flushes happen at eviction or
//! on an explicit sync.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt as _,
    path::Path,
};

use block_cache::{BlockCache, Disk};
use dataview::{Pod, PodMethods as _};
use log::debug;
use oxfs_types::{BLOCK_SIZE, BlockNo};

use crate::{Error, Result};

/// A disk block as raw bytes.
pub type Block = [u8; BLOCK_SIZE];

/// The disk image file, addressable as an array of blocks.
pub struct DiskFile {
    file: File,
    num_blocks: u32,
}

impl DiskFile {
    /// Creates (or overwrites) an image file of `size` bytes.
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        debug_assert_eq!(size % BLOCK_SIZE as u64, 0);
        if size % BLOCK_SIZE as u64 != 0 {
            return Err(Error::OutOfRange);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        debug!("created disk image {} ({size} bytes)", path.display());
        Ok(Self {
            file,
            num_blocks: (size / BLOCK_SIZE as u64) as u32,
        })
    }

    /// Opens an existing image file, taking its size from the file itself.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        debug_assert_eq!(size % BLOCK_SIZE as u64, 0);
        if size % BLOCK_SIZE as u64 != 0 {
            return Err(Error::OutOfRange);
        }
        debug!("opened disk image {} ({size} bytes)", path.display());
        Ok(Self {
            file,
            num_blocks: (size / BLOCK_SIZE as u64) as u32,
        })
    }

    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }
}

impl Disk<BLOCK_SIZE> for DiskFile {
    type Error = io::Error;

    fn read_block(&mut self, index: u32, buf: &mut Block) -> io::Result<()> {
        self.file
            .read_exact_at(buf, u64::from(index) * BLOCK_SIZE as u64)
    }

    fn write_block(&mut self, index: u32, buf: &Block) -> io::Result<()> {
        self.file
            .write_all_at(buf, u64::from(index) * BLOCK_SIZE as u64)
    }
}

/// The buffered block device: a [`DiskFile`] behind a write-back LRU cache.
pub struct BlockDevice {
    disk: DiskFile,
    cache: BlockCache<BLOCK_SIZE>,
}

impl BlockDevice {
    /// Creates a device over a fresh image of `size` bytes.
    pub fn create(path: &Path, size: u64, cache_bytes: usize) -> Result<Self> {
        Ok(Self {
            disk: DiskFile::create(path, size)?,
            cache: BlockCache::with_byte_budget(cache_bytes),
        })
    }

    /// Opens a device over an existing image.
    pub fn open(path: &Path, cache_bytes: usize) -> Result<Self> {
        Ok(Self {
            disk: DiskFile::open(path)?,
            cache: BlockCache::with_byte_budget(cache_bytes),
        })
    }

    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.disk.num_blocks()
    }

    fn check(&self, block_no: BlockNo) -> Result<()> {
        if block_no.value() >= self.disk.num_blocks() {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }

    /// Reads a block, filling the cache on a miss.
    pub fn read(&mut self, block_no: BlockNo, buf: &mut Block) -> Result<()> {
        self.check(block_no)?;
        if self.cache.get(block_no.value(), buf) {
            return Ok(());
        }
        self.disk.read_block(block_no.value(), buf)?;
        self.cache.insert_clean(&mut self.disk, block_no.value(), buf)?;
        Ok(())
    }

    /// Writes a block through the cache only; the physical write is deferred
    /// to eviction or [`BlockDevice::sync`].
    pub fn write(&mut self, block_no: BlockNo, buf: &Block) -> Result<()> {
        self.check(block_no)?;
        self.cache.upsert(&mut self.disk, block_no.value(), buf)?;
        Ok(())
    }

    /// Writes a batch of blocks in order.
    ///
    /// This is a convenience, not a transaction: entries are applied one at
    /// a time and an error leaves a prefix of the batch applied.
    pub fn write_batch(&mut self, batch: &[(BlockNo, &Block)]) -> Result<()> {
        for (block_no, buf) in batch {
            self.write(*block_no, buf)?;
        }
        Ok(())
    }

    /// Flushes the block to disk if it is cached dirty; otherwise does
    /// nothing.
    pub fn sync(&mut self, block_no: BlockNo) -> Result<()> {
        self.check(block_no)?;
        self.cache.sync(&mut self.disk, block_no.value())?;
        Ok(())
    }

    /// Flushes every dirty cache slot to disk.
    pub fn sync_all(&mut self) -> Result<()> {
        self.cache.sync_all(&mut self.disk)?;
        Ok(())
    }

    /// Reads a block from the image, bypassing the cache.
    pub fn read_from_disk(&mut self, block_no: BlockNo, buf: &mut Block) -> Result<()> {
        self.check(block_no)?;
        self.disk.read_block(block_no.value(), buf)?;
        Ok(())
    }

    /// Writes a block to the image, bypassing the cache.
    pub fn write_to_disk(&mut self, block_no: BlockNo, buf: &Block) -> Result<()> {
        self.check(block_no)?;
        self.disk.write_block(block_no.value(), buf)?;
        Ok(())
    }

    /// Reads a block into a block-sized POD value.
    pub fn read_as<T>(&mut self, block_no: BlockNo, out: &mut T) -> Result<()>
    where
        T: Pod,
    {
        let buf: &mut Block = out.as_bytes_mut().try_into().expect("block-sized type");
        self.read(block_no, buf)
    }

    /// Writes a block-sized POD value.
    pub fn write_as<T>(&mut self, block_no: BlockNo, data: &T) -> Result<()>
    where
        T: Pod,
    {
        let buf: &Block = data.as_bytes().try_into().expect("block-sized type");
        self.write(block_no, buf)
    }
}
