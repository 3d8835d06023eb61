//! Implementation of the user frame pool: [`StackFrameAllocator`] and [`PhysMemory`]

use crate::{address::PhysPageNum, config::PAGE_SIZE};
use alloc::{boxed::Box, vec::Vec};

/// The bytes of one physical frame
pub type FrameBytes = [u8; PAGE_SIZE];

trait FrameAllocator {
    fn new() -> Self;
    fn alloc(&mut self) -> Option<PhysPageNum>;
    fn dealloc(&mut self, ppn: PhysPageNum);
}

/// An implementation for frame allocator
pub struct StackFrameAllocator {
    current: usize,
    end: usize,
    recycled: Vec<usize>,
}

impl StackFrameAllocator {
    /// Hand out page numbers in `[l, r)`
    pub fn init(&mut self, l: PhysPageNum, r: PhysPageNum) {
        self.current = l.0;
        self.end = r.0;
    }

    /// Number of frames that can still be handed out
    pub fn available(&self) -> usize {
        self.end - self.current + self.recycled.len()
    }
}

impl FrameAllocator for StackFrameAllocator {
    fn new() -> Self {
        Self {
            current: 0,
            end: 0,
            recycled: Vec::new(),
        }
    }

    fn alloc(&mut self) -> Option<PhysPageNum> {
        match self.recycled.pop() {
            Some(ppn) => Some(ppn.into()),
            None if self.current == self.end => None,
            None => {
                self.current += 1;
                Some((self.current - 1).into())
            }
        }
    }

    fn dealloc(&mut self, ppn: PhysPageNum) {
        let ppn = ppn.0;
        // validity check
        assert!(
            !(ppn >= self.current || self.recycled.contains(&ppn)),
            "Frame ppn={ppn:#x} has not been allocated!"
        );
        // recycle
        self.recycled.push(ppn);
    }
}

/// The user frame pool: frame contents plus the allocator handing them out
pub struct PhysMemory {
    frames: Vec<Box<FrameBytes>>,
    allocator: StackFrameAllocator,
}

impl PhysMemory {
    /// Create a pool of `frames` zeroed frames
    pub fn new(frames: usize) -> Self {
        let mut allocator = StackFrameAllocator::new();
        allocator.init(PhysPageNum(0), PhysPageNum(frames));
        Self {
            frames: (0..frames).map(|_| Box::new([0u8; PAGE_SIZE])).collect(),
            allocator,
        }
    }

    /// Allocate a zeroed frame, or [`None`] if the pool is exhausted
    pub fn alloc(&mut self) -> Option<PhysPageNum> {
        let ppn = self.allocator.alloc()?;
        self.frames[ppn.0].fill(0);
        Some(ppn)
    }

    /// Return a frame to the pool
    pub fn dealloc(&mut self, ppn: PhysPageNum) {
        self.allocator.dealloc(ppn);
    }

    /// Total number of frames in the pool
    pub fn total(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames not handed out
    pub fn free(&self) -> usize {
        self.allocator.available()
    }

    /// Contents of a frame
    pub fn bytes(&self, ppn: PhysPageNum) -> &FrameBytes {
        &self.frames[ppn.0]
    }

    /// Mutable contents of a frame
    pub fn bytes_mut(&mut self, ppn: PhysPageNum) -> &mut FrameBytes {
        &mut self.frames[ppn.0]
    }

    /// Copy the whole frame `from` into the frame `to`
    pub fn copy(&mut self, from: PhysPageNum, to: PhysPageNum) {
        if from == to {
            return;
        }
        let src = *self.frames[from.0];
        self.frames[to.0].copy_from_slice(&src);
    }
}
