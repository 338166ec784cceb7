//! Data block allocation.

use oxfs_types::{BLOCK_SIZE, BlockNo};

use crate::{Error, Result, bitmap::Bitmap, device::BlockDevice};

/// Allocates a zeroed data block.
///
/// Zeroing at allocation is what makes file holes read back as zeros.
pub(crate) fn alloc(bitmap: &Bitmap, dev: &mut BlockDevice) -> Result<BlockNo> {
    let id = bitmap.alloc(dev)?.ok_or(Error::NoSpace)?;
    let block_no = BlockNo::new(id);
    dev.write(block_no, &[0; BLOCK_SIZE])?;
    Ok(block_no)
}

/// Frees a data block.
pub(crate) fn free(bitmap: &Bitmap, dev: &mut BlockDevice, block_no: BlockNo) -> Result<()> {
    bitmap.free(dev, block_no.value())
}
