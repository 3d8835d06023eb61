//! File-backed pages, written back to their file instead of swap

use crate::{error::VmResult, frame_allocator::FrameBytes, page::FileSlice};

/// State of a file-backed page
#[derive(Debug)]
pub struct FilePage {
    slice: FileSlice,
}

impl FilePage {
    pub(crate) fn new(slice: FileSlice) -> Self {
        Self { slice }
    }

    /// File window backing the page
    pub fn slice(&self) -> &FileSlice {
        &self.slice
    }

    /// Same window over its own handle
    pub(crate) fn reopen(&self) -> Self {
        Self::new(self.slice.reopen())
    }

    /// Reload the page from its file
    pub(crate) fn swap_in(&self, frame: &mut FrameBytes) -> VmResult<()> {
        self.slice.load(frame)
    }

    /// Write the page back if it is dirty; returns whether it did
    pub(crate) fn swap_out(&self, frame: &FrameBytes, dirty: bool) -> bool {
        if dirty {
            self.write_back(frame);
        }
        dirty
    }

    /// Write the read part of `frame` to the file
    pub(crate) fn write_back(&self, frame: &FrameBytes) {
        self.slice.write_back(frame);
    }
}
