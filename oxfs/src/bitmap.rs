//! Bitmap allocator.
//!
//! A bitmap is a contiguous run of blocks in which each bit stands for one
//! allocatable unit: an inode slot for the inode bitmap, a data block for
//! the data bitmap. The descriptor below is pure bookkeeping; the bits
//! themselves live only on disk and are read and written through the
//! device.

use dataview::PodMethods as _;
use log::warn;
use oxfs_types::{BITS_PER_BLOCK, BitmapBlock, BlockNo};

use crate::{Result, device::BlockDevice};

/// In-memory descriptor of an on-disk allocation bitmap.
pub struct Bitmap {
    /// First block of the bitmap.
    start: u32,
    /// Number of bitmap blocks.
    num_blocks: u32,
    /// Id corresponding to bit 0 of block `start`.
    segment_base: u32,
    /// Number of usable bits; trailing bits of the last block are dead when
    /// the managed area is smaller than the bitmap can describe.
    num_bits: u32,
}

impl Bitmap {
    #[must_use]
    pub fn new(start: u32, num_blocks: u32, segment_base: u32, num_bits: u32) -> Self {
        debug_assert!(num_bits as u64 <= u64::from(num_blocks) * BITS_PER_BLOCK as u64);
        Self {
            start,
            num_blocks,
            segment_base,
            num_bits,
        }
    }

    /// Number of allocatable units.
    #[must_use]
    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    /// Allocates the first free unit in scan order and returns its absolute
    /// id (`segment_base + bit index`), or `None` when the bitmap is full.
    ///
    /// Scanning from the start means freed low ids are reused first, which
    /// keeps allocations compact.
    pub fn alloc(&self, dev: &mut BlockDevice) -> Result<Option<u32>> {
        for i in 0..self.num_blocks {
            let block_no = BlockNo::new(self.start + i);
            let mut bm = BitmapBlock::zeroed();
            dev.read_as(block_no, &mut bm)?;
            let Some(bit) = bm.find_clear() else {
                continue;
            };
            let index = i * BITS_PER_BLOCK as u32 + bit as u32;
            if index >= self.num_bits {
                break;
            }
            bm.set_bit(bit);
            dev.write_as(block_no, &bm)?;
            return Ok(Some(self.segment_base + index));
        }
        warn!("bitmap at block {}: no free bit", self.start);
        Ok(None)
    }

    /// Clears the bit for `id`, making the unit allocatable again.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the bitmap's range or already free.
    pub fn free(&self, dev: &mut BlockDevice, id: u32) -> Result<()> {
        let index = id.checked_sub(self.segment_base).expect("id below segment base");
        assert!(index < self.num_bits, "id past end of bitmap");
        let block_no = BlockNo::new(self.start + index / BITS_PER_BLOCK as u32);
        let bit = index as usize % BITS_PER_BLOCK;
        let mut bm = BitmapBlock::zeroed();
        dev.read_as(block_no, &mut bm)?;
        assert!(bm.bit(bit), "freeing a free bit");
        bm.clear_bit(bit);
        dev.write_as(block_no, &bm)?;
        Ok(())
    }

    /// Number of free units left.
    pub fn count_free(&self, dev: &mut BlockDevice) -> Result<u32> {
        let mut used = 0;
        for i in 0..self.num_blocks {
            let mut bm = BitmapBlock::zeroed();
            dev.read_as(BlockNo::new(self.start + i), &mut bm)?;
            used += bm.count_ones();
        }
        Ok(self.num_bits - used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use oxfs_types::BLOCK_SIZE;

    fn new_device(blocks: u32) -> (tempfile::TempDir, BlockDevice) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let dev =
            BlockDevice::create(&path, u64::from(blocks) * BLOCK_SIZE as u64, 8 * BLOCK_SIZE)
                .unwrap();
        (dir, dev)
    }

    #[test]
    fn alloc_returns_ascending_ids() {
        let (_dir, mut dev) = new_device(8);
        let bm = Bitmap::new(1, 1, 100, 64);
        let a = bm.alloc(&mut dev).unwrap().unwrap();
        let b = bm.alloc(&mut dev).unwrap().unwrap();
        assert_eq!(a, 100);
        assert_eq!(b, 101);
    }

    #[test]
    fn freed_id_is_reused_first() {
        let (_dir, mut dev) = new_device(8);
        let bm = Bitmap::new(1, 1, 0, 64);
        let ids: Vec<_> = (0..4)
            .map(|_| bm.alloc(&mut dev).unwrap().unwrap())
            .collect();
        assert_eq!(ids, [0, 1, 2, 3]);
        bm.free(&mut dev, 1).unwrap();
        assert_eq!(bm.alloc(&mut dev).unwrap(), Some(1));
    }

    #[test]
    fn exhaustion_reports_full() {
        let (_dir, mut dev) = new_device(8);
        let bm = Bitmap::new(1, 1, 0, 3);
        for want in 0..3 {
            assert_eq!(bm.alloc(&mut dev).unwrap(), Some(want));
        }
        assert_eq!(bm.alloc(&mut dev).unwrap(), None);
        bm.free(&mut dev, 2).unwrap();
        assert_eq!(bm.alloc(&mut dev).unwrap(), Some(2));
    }

    #[test]
    fn alloc_crosses_bitmap_blocks() {
        let (_dir, mut dev) = new_device(8);
        let bits = BITS_PER_BLOCK as u32;
        let bm = Bitmap::new(1, 2, 0, 2 * bits);
        // fill the whole first block by hand
        let mut full = BitmapBlock::zeroed();
        for n in 0..BITS_PER_BLOCK {
            full.set_bit(n);
        }
        dev.write_as(BlockNo::new(1), &full).unwrap();
        assert_eq!(bm.alloc(&mut dev).unwrap(), Some(bits));
    }

    #[test]
    fn count_free_tracks_allocations() {
        let (_dir, mut dev) = new_device(8);
        let bm = Bitmap::new(1, 1, 0, 100);
        assert_eq!(bm.count_free(&mut dev).unwrap(), 100);
        let id = bm.alloc(&mut dev).unwrap().unwrap();
        assert_eq!(bm.count_free(&mut dev).unwrap(), 99);
        bm.free(&mut dev, id).unwrap();
        assert_eq!(bm.count_free(&mut dev).unwrap(), 100);
    }

    #[test]
    #[should_panic(expected = "freeing a free bit")]
    fn double_free_panics() {
        let (_dir, mut dev) = new_device(8);
        let bm = Bitmap::new(1, 1, 0, 64);
        let id = bm.alloc(&mut dev).unwrap().unwrap();
        bm.free(&mut dev, id).unwrap();
        let _ = bm.free(&mut dev, id);
    }
}
