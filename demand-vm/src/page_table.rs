//! Implementation of [`PageTableEntry`] and [`PageTable`].
//!
//! This is the address-translation capability the VM core drives: it installs,
//! queries and invalidates virtual-to-physical mappings and reads or clears the
//! accessed and dirty bits that the MMU maintains.

use crate::{
    address::{PhysPageNum, VirtPageNum},
    error::{VmError, VmResult},
};
use alloc::collections::BTreeMap;
use bitflags::bitflags;

bitflags! {
    /// [`PageTableEntry`] flags
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// Page Table Entry
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PageTableEntry {
    bits: usize,
}

impl PageTableEntry {
    /// Build an entry pointing at `ppn`
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        Self {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }

    /// Physical page this entry points at
    pub fn ppn(self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }

    /// Flag bits of this entry
    pub fn flags(self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }

    fn set_flag(&mut self, flag: PTEFlags, value: bool) {
        let mut flags = self.flags();
        flags.set(flag, value);
        *self = Self::new(self.ppn(), flags);
    }

    /// Whether the entry is valid
    pub fn is_valid(self) -> bool {
        self.flags().contains(PTEFlags::V)
    }

    /// Whether the entry allows writes
    pub fn is_writable(self) -> bool {
        self.flags().contains(PTEFlags::W)
    }

    /// Whether the page was touched since the bit was last cleared
    pub fn is_accessed(self) -> bool {
        self.flags().contains(PTEFlags::A)
    }

    /// Whether the page was written since the bit was last cleared
    pub fn is_dirty(self) -> bool {
        self.flags().contains(PTEFlags::D)
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("PTE({:?}, {:?})", self.ppn(), self.flags()))
    }
}

/// Page Table of one address space
///
/// Entries are kept in a map keyed by [`VirtPageNum`]; only leaf entries exist,
/// so a missing key and an invalid entry mean the same thing.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<VirtPageNum, PageTableEntry>,
}

impl PageTable {
    /// Create an empty page table
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Install a mapping from `vpn` to `ppn`.
    ///
    /// Fails with [`VmError::AlreadyMapped`] if `vpn` is mapped already.
    pub fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, flags: PTEFlags) -> VmResult<()> {
        if self.translate(vpn).is_some() {
            return Err(VmError::AlreadyMapped(vpn.addr().0));
        }
        self.entries
            .insert(vpn, PageTableEntry::new(ppn, flags | PTEFlags::V));
        Ok(())
    }

    /// Remove the mapping of `vpn`, returning the old entry if it was valid
    pub fn unmap(&mut self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.entries.remove(&vpn).filter(|pte| pte.is_valid())
    }

    /// Translates a [`VirtPageNum`] to a [`PageTableEntry`] if it exists.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.entries.get(&vpn).copied().filter(|pte| pte.is_valid())
    }

    fn update(&mut self, vpn: VirtPageNum, flag: PTEFlags, value: bool) {
        if let Some(pte) = self.entries.get_mut(&vpn).filter(|pte| pte.is_valid()) {
            pte.set_flag(flag, value);
        }
    }

    /// Whether `vpn` is mapped and its accessed bit is set
    pub fn is_accessed(&self, vpn: VirtPageNum) -> bool {
        self.translate(vpn).is_some_and(PageTableEntry::is_accessed)
    }

    /// Set or clear the accessed bit of `vpn`
    pub fn set_accessed(&mut self, vpn: VirtPageNum, accessed: bool) {
        self.update(vpn, PTEFlags::A, accessed);
    }

    /// Whether `vpn` is mapped and its dirty bit is set
    pub fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.translate(vpn).is_some_and(PageTableEntry::is_dirty)
    }

    /// Set or clear the dirty bit of `vpn`
    pub fn set_dirty(&mut self, vpn: VirtPageNum, dirty: bool) {
        self.update(vpn, PTEFlags::D, dirty);
    }

    /// Grant or revoke write permission on `vpn`
    pub fn set_writable(&mut self, vpn: VirtPageNum, writable: bool) {
        self.update(vpn, PTEFlags::W, writable);
    }

    /// All valid mappings in address order
    pub fn iter(&self) -> impl Iterator<Item = (VirtPageNum, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .filter(|(_, pte)| pte.is_valid())
            .map(|(&vpn, &pte)| (vpn, pte))
    }
}
