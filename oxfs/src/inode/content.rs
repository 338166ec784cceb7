//! Inode content: the mapping from file-relative block indices to physical
//! blocks, and the growth and shrink paths that maintain it.
//!
//! The first [`DIRECT_COUNT`] data blocks are reachable through
//! `DiskInode::direct`, the next [`PTRS_PER_BLOCK`] through the indirect-1
//! block, and the rest through the indirect-2 block, each entry of which
//! names an indirect-1 "chunk" of [`PTRS_PER_BLOCK`] data blocks.

use dataview::PodMethods as _;
use oxfs_types::{
    BLOCK_SIZE, BlockNo, DIRECT_COUNT, DiskInode, IndirectBlock, MAX_BLOCK_INDEX, PTRS_PER_BLOCK,
};

use crate::{Error, Result, bitmap::Bitmap, data_block, device::BlockDevice};

const DIRECT: u32 = DIRECT_COUNT as u32;
const PER_BLOCK: u32 = PTRS_PER_BLOCK as u32;

/// Resolves the physical block backing logical block `inner` of the file.
pub(crate) fn block_id(di: &DiskInode, inner: u32, dev: &mut BlockDevice) -> Result<BlockNo> {
    if inner as usize >= MAX_BLOCK_INDEX {
        debug_assert!(false, "logical block {inner} out of range");
        return Err(Error::OutOfRange);
    }
    if inner < DIRECT {
        let bn = di.direct[inner as usize];
        if bn == 0 {
            return Err(Error::OutOfRange);
        }
        return Ok(BlockNo::new(bn));
    }
    let inner = inner - DIRECT;
    if inner < PER_BLOCK {
        if di.indirect1 == 0 {
            return Err(Error::OutOfRange);
        }
        let mut ind1 = IndirectBlock::zeroed();
        dev.read_as(BlockNo::new(di.indirect1), &mut ind1)?;
        return ind1.get(inner as usize).ok_or(Error::OutOfRange);
    }
    let j = inner - PER_BLOCK;
    if di.indirect2 == 0 {
        return Err(Error::OutOfRange);
    }
    let mut ind2 = IndirectBlock::zeroed();
    dev.read_as(BlockNo::new(di.indirect2), &mut ind2)?;
    let chunk_bn = ind2.get((j / PER_BLOCK) as usize).ok_or(Error::OutOfRange)?;
    let mut chunk = IndirectBlock::zeroed();
    dev.read_as(chunk_bn, &mut chunk)?;
    chunk.get((j % PER_BLOCK) as usize).ok_or(Error::OutOfRange)
}

/// Grows or shrinks the file to `new_size` bytes, allocating or collecting
/// data and index blocks as needed.
///
/// Shrinking does not clear bitmap bits here: the returned blocks must be
/// released by the caller only after the updated inode has been written
/// back, so that an interruption leaks space instead of double-allocating.
pub(crate) fn resize(
    di: &mut DiskInode,
    new_size: u32,
    bitmap: &Bitmap,
    dev: &mut BlockDevice,
) -> Result<Vec<BlockNo>> {
    let old_size = di.size;
    di.size = new_size;
    let now = super::unix_now();
    di.mtime = now;
    di.ctime = now;

    let old_data = DiskInode::data_blocks(old_size);
    let new_data = DiskInode::data_blocks(new_size);
    if new_data > old_data {
        grow(di, old_data, new_data, bitmap, dev)?;
        zero_tail(di, old_size, dev)?;
        Ok(Vec::new())
    } else if new_data < old_data {
        shrink(di, old_data, new_data, dev)
    } else {
        if new_size > old_size {
            zero_tail(di, old_size, dev)?;
        }
        Ok(Vec::new())
    }
}

/// Releases the file's entire content. Same contract as [`resize`]: the
/// returned blocks are freed by the caller.
pub(crate) fn clear(
    di: &mut DiskInode,
    bitmap: &Bitmap,
    dev: &mut BlockDevice,
) -> Result<Vec<BlockNo>> {
    resize(di, 0, bitmap, dev)
}

/// Zeros the bytes of the old final block past the old end of file, so a
/// later read of the grown range sees zeros rather than stale data.
fn zero_tail(di: &DiskInode, old_size: u32, dev: &mut BlockDevice) -> Result<()> {
    let off = old_size as usize % BLOCK_SIZE;
    if old_size == 0 || off == 0 {
        return Ok(());
    }
    let bn = block_id(di, old_size / BLOCK_SIZE as u32, dev)?;
    let mut blk = [0u8; BLOCK_SIZE];
    dev.read(bn, &mut blk)?;
    blk[off..].fill(0);
    dev.write(bn, &blk)
}

fn grow(
    di: &mut DiskInode,
    old_data: u32,
    new_data: u32,
    bitmap: &Bitmap,
    dev: &mut BlockDevice,
) -> Result<()> {
    // phase 1: direct pointers
    for i in old_data..new_data.min(DIRECT) {
        di.direct[i as usize] = data_block::alloc(bitmap, dev)?.value();
    }
    if new_data <= DIRECT {
        return Ok(());
    }

    // phase 2: the indirect-1 range
    let ind1_bn = if di.indirect1 == 0 {
        let bn = data_block::alloc(bitmap, dev)?;
        di.indirect1 = bn.value();
        bn
    } else {
        BlockNo::new(di.indirect1)
    };
    let lo = old_data.max(DIRECT);
    let hi = new_data.min(DIRECT + PER_BLOCK);
    if lo < hi {
        let mut ind1 = IndirectBlock::zeroed();
        dev.read_as(ind1_bn, &mut ind1)?;
        for i in lo..hi {
            ind1.set((i - DIRECT) as usize, Some(data_block::alloc(bitmap, dev)?));
        }
        dev.write_as(ind1_bn, &ind1)?;
    }
    if new_data <= DIRECT + PER_BLOCK {
        return Ok(());
    }

    // phase 3: the indirect-2 range, one chunk at a time
    let ind2_bn = if di.indirect2 == 0 {
        let bn = data_block::alloc(bitmap, dev)?;
        di.indirect2 = bn.value();
        bn
    } else {
        BlockNo::new(di.indirect2)
    };
    let mut ind2 = IndirectBlock::zeroed();
    dev.read_as(ind2_bn, &mut ind2)?;
    let mut cur: Option<(usize, BlockNo, IndirectBlock)> = None;
    for i in old_data.max(DIRECT + PER_BLOCK)..new_data {
        let j = i - DIRECT - PER_BLOCK;
        let ci = (j / PER_BLOCK) as usize;
        if cur.as_ref().map(|(c, ..)| *c) != Some(ci) {
            if let Some((_, bn, chunk)) = cur.take() {
                dev.write_as(bn, &chunk)?;
            }
            let bn = match ind2.get(ci) {
                Some(bn) => bn,
                None => {
                    let bn = data_block::alloc(bitmap, dev)?;
                    ind2.set(ci, Some(bn));
                    // persist the new second-level pointer before filling it
                    dev.write_as(ind2_bn, &ind2)?;
                    bn
                }
            };
            let mut chunk = IndirectBlock::zeroed();
            dev.read_as(bn, &mut chunk)?;
            cur = Some((ci, bn, chunk));
        }
        let (_, _, chunk) = cur.as_mut().unwrap();
        chunk.set((j % PER_BLOCK) as usize, Some(data_block::alloc(bitmap, dev)?));
    }
    if let Some((_, bn, chunk)) = cur.take() {
        dev.write_as(bn, &chunk)?;
    }
    Ok(())
}

fn shrink(
    di: &mut DiskInode,
    old_data: u32,
    new_data: u32,
    dev: &mut BlockDevice,
) -> Result<Vec<BlockNo>> {
    let mut freed = Vec::new();

    for i in new_data..old_data.min(DIRECT) {
        freed.push(BlockNo::new(di.direct[i as usize]));
        di.direct[i as usize] = 0;
    }

    if old_data > DIRECT {
        let ind1_bn = BlockNo::new(di.indirect1);
        let mut ind1 = IndirectBlock::zeroed();
        dev.read_as(ind1_bn, &mut ind1)?;
        for i in new_data.max(DIRECT)..old_data.min(DIRECT + PER_BLOCK) {
            let slot = (i - DIRECT) as usize;
            freed.push(ind1.get(slot).ok_or(Error::OutOfRange)?);
            ind1.set(slot, None);
        }
        if new_data <= DIRECT {
            freed.push(ind1_bn);
            di.indirect1 = 0;
        } else {
            dev.write_as(ind1_bn, &ind1)?;
        }
    }

    if old_data > DIRECT + PER_BLOCK {
        let ind2_bn = BlockNo::new(di.indirect2);
        let mut ind2 = IndirectBlock::zeroed();
        dev.read_as(ind2_bn, &mut ind2)?;
        // indices of the last surviving and last old data block within the
        // doubly indirect region; ri < 0 means nothing survives there
        let ri = i64::from(new_data) - i64::from(DIRECT + PER_BLOCK) - 1;
        let rj = i64::from(old_data) - i64::from(DIRECT + PER_BLOCK) - 1;
        let per = i64::from(PER_BLOCK);
        let first_chunk = if ri < 0 { 0 } else { (ri / per) as usize };
        let last_chunk = (rj / per) as usize;
        for ci in first_chunk..=last_chunk {
            let chunk_bn = ind2.get(ci).ok_or(Error::OutOfRange)?;
            let mut chunk = IndirectBlock::zeroed();
            dev.read_as(chunk_bn, &mut chunk)?;
            let lo = if ri >= 0 && ci == first_chunk {
                (ri % per) as usize + 1
            } else {
                0
            };
            let hi = if ci == last_chunk {
                (rj % per) as usize + 1
            } else {
                PER_BLOCK as usize
            };
            for slot in lo..hi {
                freed.push(chunk.get(slot).ok_or(Error::OutOfRange)?);
                chunk.set(slot, None);
            }
            if lo == 0 {
                // the chunk is now empty and goes too
                freed.push(chunk_bn);
                ind2.set(ci, None);
            } else {
                dev.write_as(chunk_bn, &chunk)?;
            }
        }
        if ri < 0 {
            freed.push(ind2_bn);
            di.indirect2 = 0;
        } else {
            dev.write_as(ind2_bn, &ind2)?;
        }
    }

    Ok(freed)
}

/// Reads up to `buf.len()` bytes starting at `offset`, clamped to the end
/// of file. Fails if `offset` lies past the end of file.
pub(crate) fn read_at(
    di: &mut DiskInode,
    offset: u32,
    buf: &mut [u8],
    dev: &mut BlockDevice,
) -> Result<usize> {
    di.atime = super::unix_now();
    if offset > di.size {
        return Err(Error::OutOfRange);
    }
    let len = (buf.len() as u64).min(u64::from(di.size - offset)) as usize;
    let mut done = 0;
    while done < len {
        let pos = offset as usize + done;
        let off_in = pos % BLOCK_SIZE;
        let n = (len - done).min(BLOCK_SIZE - off_in);
        let bn = block_id(di, (pos / BLOCK_SIZE) as u32, dev)?;
        let mut blk = [0u8; BLOCK_SIZE];
        dev.read(bn, &mut blk)?;
        buf[done..done + n].copy_from_slice(&blk[off_in..off_in + n]);
        done += n;
    }
    Ok(len)
}

/// Writes `data` starting at `offset`, clamped to the end of file; the
/// caller grows the file first. Partial edge blocks are read-modified-
/// written, interior blocks overwritten whole.
pub(crate) fn write_at(
    di: &mut DiskInode,
    offset: u32,
    data: &[u8],
    dev: &mut BlockDevice,
) -> Result<usize> {
    let now = super::unix_now();
    di.mtime = now;
    di.ctime = now;
    if offset > di.size {
        return Err(Error::OutOfRange);
    }
    let len = (data.len() as u64).min(u64::from(di.size - offset)) as usize;
    let mut done = 0;
    while done < len {
        let pos = offset as usize + done;
        let off_in = pos % BLOCK_SIZE;
        let n = (len - done).min(BLOCK_SIZE - off_in);
        let bn = block_id(di, (pos / BLOCK_SIZE) as u32, dev)?;
        if n == BLOCK_SIZE {
            let blk = data[done..done + n].try_into().expect("full block");
            dev.write(bn, blk)?;
        } else {
            let mut blk = [0u8; BLOCK_SIZE];
            dev.read(bn, &mut blk)?;
            blk[off_in..off_in + n].copy_from_slice(&data[done..done + n]);
            dev.write(bn, &blk)?;
        }
        done += n;
    }
    Ok(len)
}

/// Flushes the file's cached data blocks, and optionally its index blocks,
/// to the image.
pub(crate) fn sync_data(di: &DiskInode, dev: &mut BlockDevice, include_indirect: bool) -> Result<()> {
    let data = DiskInode::data_blocks(di.size);
    for i in 0..data {
        let bn = block_id(di, i, dev)?;
        dev.sync(bn)?;
    }
    if !include_indirect {
        return Ok(());
    }
    if di.indirect1 != 0 {
        dev.sync(BlockNo::new(di.indirect1))?;
    }
    if di.indirect2 != 0 {
        let ind2_bn = BlockNo::new(di.indirect2);
        let mut ind2 = IndirectBlock::zeroed();
        dev.read_as(ind2_bn, &mut ind2)?;
        if data > DIRECT + PER_BLOCK {
            let chunks = (data - DIRECT - PER_BLOCK).div_ceil(PER_BLOCK);
            for ci in 0..chunks as usize {
                if let Some(bn) = ind2.get(ci) {
                    dev.sync(bn)?;
                }
            }
        }
        dev.sync(ind2_bn)?;
    }
    Ok(())
}
