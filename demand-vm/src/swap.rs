//! Swap slots on a block device, the backing store of anonymous pages

use crate::{
    bitmap::Bitmap,
    block_dev::BlockDevice,
    config::{SECTORS_PER_PAGE, SECTOR_SIZE},
    error::{VmError, VmResult},
    frame_allocator::FrameBytes,
};
use alloc::sync::Arc;
use log::trace;

/// Slot bitmap plus the device it indexes
pub struct SwapTable {
    device: Arc<dyn BlockDevice>,
    slots: Bitmap,
}

impl SwapTable {
    /// One slot per `SECTORS_PER_PAGE` sectors of `device`, all free
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = Bitmap::new(device.num_blocks() / SECTORS_PER_PAGE);
        Self { device, slots }
    }

    /// Write a page to a free slot and return the slot index
    pub fn swap_out(&mut self, page: &FrameBytes) -> VmResult<usize> {
        let slot = self.slots.alloc().ok_or(VmError::OutOfSwap)?;
        for (i, sector) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write_block(slot * SECTORS_PER_PAGE + i, sector);
        }
        trace!("swap: wrote slot {slot}");
        Ok(slot)
    }

    /// Read the page held in `slot` and free the slot
    pub fn swap_in(&mut self, slot: usize, page: &mut FrameBytes) {
        self.read(slot, page);
        self.free(slot);
    }

    /// Read the page held in `slot`, leaving the slot occupied
    pub fn read(&self, slot: usize, page: &mut FrameBytes) {
        assert!(self.slots.is_set(slot), "swap slot {slot} is not in use");
        for (i, sector) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.device.read_block(slot * SECTORS_PER_PAGE + i, sector);
        }
        trace!("swap: read slot {slot}");
    }

    /// Release a slot without reading it
    pub fn free(&mut self, slot: usize) {
        self.slots.dealloc(slot);
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.maximum()
    }

    /// Number of occupied slots
    pub fn used(&self) -> usize {
        self.slots.count_used()
    }
}
