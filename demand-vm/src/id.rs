//! Recycled small-integer ids for address spaces and eviction groups

use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};

/// Identity of an address space inside a [`crate::Vm`]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub usize);

impl Debug for SpaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Space({})", self.0))
    }
}

/// Hands out the lowest-numbered ids, reusing released ones first
pub struct RecycleAllocator {
    current: usize,
    recycled: Vec<usize>,
}

impl RecycleAllocator {
    pub fn new() -> Self {
        RecycleAllocator {
            current: 0,
            recycled: Vec::new(),
        }
    }

    /// Allocate a id
    pub fn alloc(&mut self) -> usize {
        if let Some(id) = self.recycled.pop() {
            id
        } else {
            self.current += 1;
            self.current - 1
        }
    }

    /// Recycle a id
    pub fn dealloc(&mut self, id: usize) {
        assert!(id < self.current);
        assert!(
            !self.recycled.contains(&id),
            "id {id} has been deallocated!"
        );
        self.recycled.push(id);
    }
}

impl Default for RecycleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn released_ids_are_reused() {
        let mut ids = RecycleAllocator::new();
        assert_eq!((ids.alloc(), ids.alloc(), ids.alloc()), (0, 1, 2));
        ids.dealloc(1);
        assert_eq!(ids.alloc(), 1);
        assert_eq!(ids.alloc(), 3);
    }

    #[test]
    #[should_panic(expected = "has been deallocated")]
    fn double_release_is_fatal() {
        let mut ids = RecycleAllocator::new();
        let id = ids.alloc();
        ids.alloc();
        ids.dealloc(id);
        ids.dealloc(id);
    }
}
