//! The supplemental page table: every page an address space knows about

use crate::{
    address::{VirtAddr, VirtPageNum},
    error::{VmError, VmResult},
    page::Page,
};
use alloc::collections::BTreeMap;

/// Pages of one address space, keyed by page number
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<VirtPageNum, Page>,
}

impl SupplementalPageTable {
    /// An empty table
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Page covering `va`, wherever inside the page it points
    pub fn find(&self, va: VirtAddr) -> Option<&Page> {
        self.pages.get(&va.to_vpn_by_floor())
    }

    /// Page registered at `vpn`
    pub fn get(&self, vpn: VirtPageNum) -> Option<&Page> {
        self.pages.get(&vpn)
    }

    pub(crate) fn get_mut(&mut self, vpn: VirtPageNum) -> Option<&mut Page> {
        self.pages.get_mut(&vpn)
    }

    /// Register `page`; fails if its page number is taken
    pub fn insert(&mut self, page: Page) -> VmResult<()> {
        let vpn = page.vpn();
        if self.pages.contains_key(&vpn) {
            return Err(VmError::PageExists(vpn.addr().0));
        }
        self.pages.insert(vpn, page);
        Ok(())
    }

    /// Unregister the page at `vpn`
    pub fn remove(&mut self, vpn: VirtPageNum) -> Option<Page> {
        self.pages.remove(&vpn)
    }

    /// Whether a page is registered at `vpn`
    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        self.pages.contains_key(&vpn)
    }

    /// Page numbers in address order
    pub fn vpns(&self) -> impl Iterator<Item = VirtPageNum> + '_ {
        self.pages.keys().copied()
    }

    /// Pages in address order
    pub fn iter(&self) -> impl Iterator<Item = &Page> + '_ {
        self.pages.values()
    }

    /// Number of registered pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page::{PageInit, VmType};

    fn anon(vpn: usize) -> Page {
        Page::new_uninit(VirtPageNum(vpn), true, VmType::Anon, PageInit::Zero).unwrap()
    }

    #[test]
    fn find_rounds_down() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(anon(0x20)).unwrap();
        assert!(spt.find(VirtAddr(0x20000)).is_some());
        assert!(spt.find(VirtAddr(0x20fff)).is_some());
        assert!(spt.find(VirtAddr(0x21000)).is_none());
    }

    #[test]
    fn duplicate_insert_keeps_first_page() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(anon(3)).unwrap();
        let dup = Page::new_uninit(VirtPageNum(3), false, VmType::Anon, PageInit::Zero).unwrap();
        assert_eq!(spt.insert(dup), Err(VmError::PageExists(0x3000)));
        assert!(spt.get(VirtPageNum(3)).unwrap().writable());
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn remove_then_reinsert() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(anon(5)).unwrap();
        assert!(spt.remove(VirtPageNum(5)).is_some());
        assert!(spt.remove(VirtPageNum(5)).is_none());
        assert_eq!(spt.len(), 0);
        spt.insert(anon(5)).unwrap();
        assert!(spt.contains(VirtPageNum(5)));
    }
}
