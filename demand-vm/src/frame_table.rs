//! The frame table: which pages occupy each user frame, and victim selection
//!
//! A frame may be shared by several pages after a fork. Every sharer is
//! recorded as an [`Owner`]; the frame is freed when the last one leaves.
//! Victims are picked by a second-chance clock whose scan direction flips
//! on every selection, so that both ends of the table age evenly.

use crate::{
    address::{PhysPageNum, VirtPageNum},
    id::SpaceId,
};
use alloc::{collections::BTreeMap, vec, vec::Vec};
use log::trace;

/// A page mapped to a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Owner {
    /// Address space of the page
    pub space: SpaceId,
    /// Page number inside that space
    pub vpn: VirtPageNum,
}

impl Owner {
    pub fn new(space: SpaceId, vpn: VirtPageNum) -> Self {
        Self { space, vpn }
    }
}

/// A resident user frame
#[derive(Debug)]
pub struct Frame {
    owners: Vec<Owner>,
    pinned: bool,
}

impl Frame {
    /// Pages sharing the frame, the first one mapped it in
    pub fn owners(&self) -> &[Owner] {
        &self.owners
    }

    /// Whether eviction must skip the frame
    pub fn pinned(&self) -> bool {
        self.pinned
    }
}

/// All resident frames of a [`crate::Vm`]
#[derive(Debug)]
pub struct FrameTable {
    frames: BTreeMap<PhysPageNum, Frame>,
    forward: bool,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
            forward: true,
        }
    }

    /// Record a frame that was just filled for `owners`
    pub fn insert(&mut self, ppn: PhysPageNum, owners: Vec<Owner>) {
        debug_assert!(!owners.is_empty());
        let old = self.frames.insert(
            ppn,
            Frame {
                owners,
                pinned: false,
            },
        );
        assert!(old.is_none(), "frame {ppn:?} is already in use");
    }

    /// Record a single owner
    pub fn insert_one(&mut self, ppn: PhysPageNum, owner: Owner) {
        self.insert(ppn, vec![owner]);
    }

    /// Forget a frame entirely
    pub fn remove(&mut self, ppn: PhysPageNum) -> Option<Frame> {
        self.frames.remove(&ppn)
    }

    pub fn get(&self, ppn: PhysPageNum) -> Option<&Frame> {
        self.frames.get(&ppn)
    }

    /// Add another sharer of a resident frame
    pub fn add_owner(&mut self, ppn: PhysPageNum, owner: Owner) {
        if let Some(frame) = self.frames.get_mut(&ppn) {
            frame.owners.push(owner);
        }
    }

    /// Drop one sharer and return the ones left
    ///
    /// The frame entry itself is kept even when nobody is left, so that the
    /// caller decides when the frame goes back to the pool.
    pub fn remove_owner(&mut self, ppn: PhysPageNum, owner: Owner) -> &[Owner] {
        match self.frames.get_mut(&ppn) {
            Some(frame) => {
                frame.owners.retain(|o| *o != owner);
                &frame.owners
            }
            None => &[],
        }
    }

    /// Number of pages sharing `ppn`
    pub fn share_count(&self, ppn: PhysPageNum) -> usize {
        self.frames.get(&ppn).map_or(0, |frame| frame.owners.len())
    }

    /// Exclude a frame from victim selection
    pub fn pin(&mut self, ppn: PhysPageNum) {
        if let Some(frame) = self.frames.get_mut(&ppn) {
            frame.pinned = true;
        }
    }

    pub fn unpin(&mut self, ppn: PhysPageNum) {
        if let Some(frame) = self.frames.get_mut(&ppn) {
            frame.pinned = false;
        }
    }

    /// Number of resident frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PhysPageNum, &Frame)> + '_ {
        self.frames.iter().map(|(&ppn, frame)| (ppn, frame))
    }

    /// Pick a frame to evict
    ///
    /// `test_and_clear` reports whether any owner touched the frame since the
    /// last scan and clears the accessed bit of every owner. A touched frame
    /// gets a second chance; after one full pass every bit is clear, so the
    /// second pass takes the first unpinned frame. Returns `None` only if
    /// every frame is pinned.
    pub fn select_victim(
        &mut self,
        mut test_and_clear: impl FnMut(&[Owner]) -> bool,
    ) -> Option<PhysPageNum> {
        let mut order: Vec<PhysPageNum> = self
            .frames
            .iter()
            .filter(|(_, frame)| !frame.pinned)
            .map(|(&ppn, _)| ppn)
            .collect();
        if !self.forward {
            order.reverse();
        }
        self.forward = !self.forward;
        for _ in 0..2 {
            for &ppn in &order {
                let owners = &self.frames[&ppn].owners;
                if !test_and_clear(owners) {
                    trace!("clock: victim {ppn:?}");
                    return Some(ppn);
                }
            }
        }
        order.first().copied()
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}
