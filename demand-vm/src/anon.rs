//! Anonymous pages, backed by swap once evicted

use crate::{error::VmResult, frame_allocator::FrameBytes, swap::SwapTable};

/// State of an anonymous page: the swap slot holding it while evicted
#[derive(Debug, Default)]
pub struct AnonPage {
    slot: Option<usize>,
}

impl AnonPage {
    /// A resident anonymous page with nothing in swap
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Swap slot holding the page, if it is evicted
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Read the page back from swap and release its slot
    pub(crate) fn swap_in(&mut self, swap: &mut SwapTable, frame: &mut FrameBytes) {
        if let Some(slot) = self.slot.take() {
            swap.swap_in(slot, frame);
        }
    }

    /// Write the page to a fresh swap slot
    pub(crate) fn swap_out(&mut self, swap: &mut SwapTable, frame: &FrameBytes) -> VmResult<usize> {
        let slot = swap.swap_out(frame)?;
        self.slot = Some(slot);
        Ok(slot)
    }

    pub(crate) fn set_slot(&mut self, slot: usize) {
        self.slot = Some(slot);
    }

    /// Drop the slot without touching swap; another page already released it
    pub(crate) fn forget_slot(&mut self) {
        self.slot = None;
    }

    /// Release the swap slot if the page holds one
    pub(crate) fn destroy(&mut self, swap: &mut SwapTable) {
        if let Some(slot) = self.slot.take() {
            swap.free(slot);
        }
    }
}
