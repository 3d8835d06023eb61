//! User virtual addresses, virtual page numbers and user frame numbers

use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS};
use core::fmt::{self, Debug, Formatter};
use core::ops::Range;

/// User virtual address
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Default)]
pub struct VirtAddr(pub usize);

/// User virtual page number
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Default)]
pub struct VirtPageNum(pub usize);

/// Physical page number, an index into the user frame pool
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Default)]
pub struct PhysPageNum(pub usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "VA:{:#x}", self.0)
    }
}

impl Debug for VirtPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "VPN:{:#x}", self.0)
    }
}

impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PPN:{:#x}", self.0)
    }
}

impl From<usize> for PhysPageNum {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl VirtAddr {
    /// Offset of the address inside its page
    pub fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Whether the address starts a page
    pub fn is_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Whether this is address zero
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The page containing this address
    pub fn to_vpn_by_floor(self) -> VirtPageNum {
        VirtPageNum(self.0 >> PAGE_SIZE_BITS)
    }

    /// The first page starting at or above this address
    pub fn to_vpn_by_ceil(self) -> VirtPageNum {
        VirtPageNum(self.0.div_ceil(PAGE_SIZE))
    }
}

impl VirtPageNum {
    /// Base address of this page
    pub fn addr(self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_SIZE_BITS)
    }
}

/// Half-open range of virtual pages `[start, end)`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VPNRange {
    start: VirtPageNum,
    end: VirtPageNum,
}

impl VPNRange {
    /// Pages from `start` up to, not including, `end`
    pub fn new(start: VirtPageNum, end: VirtPageNum) -> Self {
        assert!(start <= end, "start {start:?} > end {end:?}!");
        Self { start, end }
    }

    /// First page of the range
    pub fn start(self) -> VirtPageNum {
        self.start
    }

    /// Number of pages in the range
    pub fn len(self) -> usize {
        self.end.0 - self.start.0
    }

    /// Whether the range covers no page
    pub fn is_empty(self) -> bool {
        self.start == self.end
    }
}

impl IntoIterator for VPNRange {
    type Item = VirtPageNum;
    type IntoIter = core::iter::Map<Range<usize>, fn(usize) -> VirtPageNum>;

    fn into_iter(self) -> Self::IntoIter {
        (self.start.0..self.end.0).map(VirtPageNum as fn(usize) -> VirtPageNum)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn floor_and_ceil() {
        let va = VirtAddr(0x1234);
        assert_eq!(va.page_offset(), 0x234);
        assert!(!va.is_aligned());
        assert_eq!(va.to_vpn_by_floor(), VirtPageNum(1));
        assert_eq!(va.to_vpn_by_ceil(), VirtPageNum(2));
        assert_eq!(VirtAddr(0x2000).to_vpn_by_ceil(), VirtPageNum(2));
        assert_eq!(VirtAddr(0).to_vpn_by_ceil(), VirtPageNum(0));
        assert_eq!(VirtPageNum(3).addr(), VirtAddr(0x3000));
    }

    #[test]
    fn vpn_range_is_half_open() {
        let range = VPNRange::new(VirtPageNum(4), VirtPageNum(7));
        assert_eq!(range.len(), 3);
        let pages: Vec<_> = range.into_iter().collect();
        assert_eq!(pages, [VirtPageNum(4), VirtPageNum(5), VirtPageNum(6)]);
        assert!(VPNRange::new(VirtPageNum(2), VirtPageNum(2)).is_empty());
    }
}
