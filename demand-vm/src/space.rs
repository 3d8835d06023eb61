//! [`Space`], the per-process handle on a [`Vm`]

use crate::{
    address::{PhysPageNum, VirtAddr, VirtPageNum},
    config::PAGE_SIZE,
    error::{VmError, VmResult},
    fault::PageFault,
    file::File,
    id::SpaceId,
    page::{Page, PageInit, PageState, VmType},
    vm::{Vm, VmInner},
};
use alloc::sync::Arc;
use log::warn;

/// How often one access may fault before the core gives up on it
const MAX_FAULT_RETRIES: usize = 4;

/// Summary of one registered page
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    /// Page number
    pub vpn: VirtPageNum,
    /// Backing-store kind, after first fault if it has not happened yet
    pub vm_type: VmType,
    /// Logically writable
    pub writable: bool,
    /// Where the content lives
    pub state: PageState,
    /// Id of the owning mmap region, 0 if none
    pub mmap_id: u64,
}

/// Address space of one process
///
/// Dropping the handle tears the space down, writing dirty file pages back.
pub struct Space {
    vm: Arc<Vm>,
    id: SpaceId,
}

impl Space {
    pub(crate) fn new(vm: Arc<Vm>, id: SpaceId) -> Self {
        Self { vm, id }
    }

    /// Id of this space inside its VM
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// VM this space belongs to
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    fn with<T>(&self, f: impl FnOnce(&mut VmInner, SpaceId) -> T) -> T {
        f(&mut self.vm.lock(), self.id)
    }

    /// Register a page at `va` whose content is produced by `init` at first fault
    pub fn allocate(&self, ty: VmType, va: VirtAddr, writable: bool, init: PageInit) -> VmResult<()> {
        self.with(|vm, sid| vm.allocate(sid, ty, va, writable, init))
    }

    /// [`Space::allocate`] reporting only success
    pub fn allocate_lazy(&self, ty: VmType, va: VirtAddr, writable: bool, init: PageInit) -> bool {
        self.allocate(ty, va, writable, init)
            .inspect_err(|err| warn!("vm: {:?} allocation at {va:?} failed: {err}", self.id))
            .is_ok()
    }

    /// Make the page containing `va` resident now and return its frame
    pub fn claim_page(&self, va: VirtAddr) -> VmResult<PhysPageNum> {
        self.with(|vm, sid| vm.claim(sid, va.to_vpn_by_floor()))
    }

    /// [`Space::claim_page`] reporting only success
    pub fn claim(&self, va: VirtAddr) -> bool {
        self.claim_page(va)
            .inspect_err(|err| warn!("vm: {:?} claim of {va:?} failed: {err}", self.id))
            .is_ok()
    }

    /// Resolve a page fault
    pub fn resolve_fault(&self, fault: PageFault) -> VmResult<()> {
        self.with(|vm, sid| vm.handle_fault(sid, fault))
    }

    /// Resolve a page fault; `false` means the process must be killed
    pub fn handle_fault(&self, fault: PageFault) -> bool {
        self.resolve_fault(fault).is_ok()
    }

    /// Unregister the page containing `va`, releasing its frame and backing resources
    pub fn remove(&self, va: VirtAddr) -> VmResult<()> {
        self.with(|vm, sid| vm.remove_page(sid, va.to_vpn_by_floor(), false))
    }

    /// Map `length` bytes of `file` starting at `offset` to `addr`
    ///
    /// Pages are loaded on first touch; each keeps its own reopened handle.
    pub fn mmap(
        &self,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: &Arc<dyn File>,
        offset: usize,
    ) -> VmResult<VirtAddr> {
        let mmap_id = self.vm.next_mmap_id();
        self.with(|vm, sid| vm.mmap(sid, addr, length, writable, file, offset, mmap_id))
    }

    /// Unmap the mapping that starts at `addr`
    pub fn munmap(&self, addr: VirtAddr) {
        if let Err(err) = self.with(|vm, sid| vm.munmap(sid, addr)) {
            warn!("vm: {:?} munmap of {addr:?} failed: {err}", self.id);
        }
    }

    /// Set up the initial stack page and return the initial stack pointer
    pub fn setup_stack(&self) -> VmResult<VirtAddr> {
        self.with(|vm, sid| {
            let top = vm.config.stack_top;
            let vpn = VirtAddr(top - PAGE_SIZE).to_vpn_by_floor();
            vm.allocate(sid, VmType::Anon, vpn.addr(), true, PageInit::Zero)?;
            vm.claim(sid, vpn)?;
            vm.space_mut(sid)?.stack_floor = vpn;
            Ok(VirtAddr(top))
        })
    }

    /// Create a child space sharing every page of this one copy-on-write
    pub fn fork(&self) -> VmResult<Space> {
        let child = self.vm.create_space();
        self.vm.copy_space(&child, self)?;
        Ok(child)
    }

    /// Frame currently backing `va`
    pub fn frame_of(&self, va: VirtAddr) -> Option<PhysPageNum> {
        self.with(|vm, sid| {
            vm.space(sid)
                .ok()?
                .spt
                .find(va)
                .and_then(Page::frame)
        })
    }

    /// Whether the mapping of `va` has its dirty bit set
    pub fn is_dirty(&self, va: VirtAddr) -> bool {
        self.with(|vm, sid| {
            vm.space(sid)
                .is_ok_and(|space| space.page_table.is_dirty(va.to_vpn_by_floor()))
        })
    }

    /// Description of the page containing `va`
    pub fn page_info(&self, va: VirtAddr) -> Option<PageInfo> {
        self.with(|vm, sid| {
            let page = vm.space(sid).ok()?.spt.find(va)?;
            Some(PageInfo {
                vpn: page.vpn(),
                vm_type: page.vm_type(),
                writable: page.writable(),
                state: page.state(),
                mmap_id: page.mmap_id(),
            })
        })
    }

    /// Number of registered pages
    pub fn len(&self) -> usize {
        self.with(|vm, sid| vm.space(sid).map_or(0, |space| space.spt.len()))
    }

    /// Whether no page is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy user memory at `va` into `buf`, faulting pages in as a user load would
    pub fn read(&self, va: VirtAddr, buf: &mut [u8]) -> VmResult<()> {
        self.with(|vm, sid| {
            let mut copied = 0;
            while copied < buf.len() {
                let addr = VirtAddr(va.0 + copied);
                let n = (PAGE_SIZE - addr.page_offset()).min(buf.len() - copied);
                let ppn = vm.user_access(sid, addr, false)?;
                let offset = addr.page_offset();
                buf[copied..copied + n].copy_from_slice(&vm.memory.bytes(ppn)[offset..offset + n]);
                copied += n;
            }
            Ok(())
        })
    }

    /// Copy `data` to user memory at `va`, faulting pages in as a user store would
    pub fn write(&self, va: VirtAddr, data: &[u8]) -> VmResult<()> {
        self.with(|vm, sid| {
            let mut copied = 0;
            while copied < data.len() {
                let addr = VirtAddr(va.0 + copied);
                let n = (PAGE_SIZE - addr.page_offset()).min(data.len() - copied);
                let ppn = vm.user_access(sid, addr, true)?;
                let offset = addr.page_offset();
                vm.memory.bytes_mut(ppn)[offset..offset + n].copy_from_slice(&data[copied..copied + n]);
                copied += n;
            }
            Ok(())
        })
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        self.vm.destroy_space(self.id);
    }
}

impl VmInner {
    /// Translate `va` the way the MMU would for a user access, taking faults as needed
    ///
    /// Sets the accessed bit, and the dirty bit for writes, of the final mapping.
    fn user_access(&mut self, sid: SpaceId, va: VirtAddr, write: bool) -> VmResult<PhysPageNum> {
        let vpn = va.to_vpn_by_floor();
        for _ in 0..MAX_FAULT_RETRIES {
            let fault = match self.space(sid)?.page_table.translate(vpn) {
                Some(pte) if !write || pte.is_writable() => {
                    let page_table = &mut self.space_mut(sid)?.page_table;
                    page_table.set_accessed(vpn, true);
                    if write {
                        page_table.set_dirty(vpn, true);
                    }
                    return Ok(pte.ppn());
                }
                Some(_) => PageFault::write_protect(va),
                None => PageFault::not_present(va, write),
            };
            self.handle_fault(sid, fault)?;
        }
        Err(VmError::Inconsistent("fault did not make the page accessible"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::{new_vm, new_vm_with_swap};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn anon(space: &Space, va: usize) {
        space
            .allocate(VmType::Anon, VirtAddr(va), true, PageInit::Zero)
            .unwrap();
    }

    fn pattern(seed: u64) -> [u8; PAGE_SIZE] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut page = [0u8; PAGE_SIZE];
        rng.fill(&mut page[..]);
        page
    }

    #[test]
    fn claim_is_idempotent() {
        let vm = new_vm(4);
        let space = vm.create_space();
        anon(&space, 0x1000);
        let first = space.claim_page(VirtAddr(0x1000)).unwrap();
        space.write(VirtAddr(0x1000), b"abc").unwrap();
        assert!(space.claim(VirtAddr(0x1000)));
        assert_eq!(space.claim_page(VirtAddr(0x1000)), Ok(first));
        let mut buf = [0u8; 3];
        space.read(VirtAddr(0x1000), &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(vm.stats().frames_resident, 1);
        vm.audit().unwrap();
    }

    #[test]
    fn double_allocation_is_refused() {
        let vm = new_vm(4);
        let space = vm.create_space();
        anon(&space, 0x1000);
        assert!(!space.allocate_lazy(VmType::Anon, VirtAddr(0x1008), true, PageInit::Zero));
        assert_eq!(
            space.allocate(VmType::Anon, VirtAddr(0x1000), false, PageInit::Zero),
            Err(VmError::PageExists(0x1000))
        );
    }

    #[test]
    fn anonymous_pages_survive_eviction() {
        // one spare slot: eviction needs a slot before the faulting page frees its own
        let vm = new_vm_with_swap(2, 5);
        let space = vm.create_space();
        let pages: usize = 6;
        for i in 0..pages {
            anon(&space, (i + 1) * PAGE_SIZE);
            space
                .write(VirtAddr((i + 1) * PAGE_SIZE), &pattern(i as u64))
                .unwrap();
        }
        let stats = vm.stats();
        assert!(stats.swap_outs >= 4);
        assert_eq!(stats.frames_resident, 2);
        for i in (0..pages).rev() {
            let mut page = [0u8; PAGE_SIZE];
            space.read(VirtAddr((i + 1) * PAGE_SIZE), &mut page).unwrap();
            assert_eq!(page, pattern(i as u64), "page {i}");
        }
        assert!(vm.stats().swap_ins >= 4);
        vm.audit().unwrap();
    }

    #[test]
    fn unaligned_access_spans_pages() {
        let vm = new_vm(1);
        let space = vm.create_space();
        anon(&space, 0x1000);
        anon(&space, 0x2000);
        let data = [0x11u8; 64];
        space.write(VirtAddr(0x2000 - 32), &data).unwrap();
        let mut back = [0u8; 64];
        space.read(VirtAddr(0x2000 - 32), &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn second_chance_spares_the_most_recent_page() {
        let vm = new_vm(2);
        let space = vm.create_space();
        let (a, b, c) = (VirtAddr(0xa000), VirtAddr(0xb000), VirtAddr(0xc000));
        for va in [a, b, c] {
            anon(&space, va.0);
        }
        let mut byte = [0u8];
        space.write(a, &[1]).unwrap();
        space.write(b, &[2]).unwrap();
        space.write(c, &[3]).unwrap();
        space.read(a, &mut byte).unwrap();
        assert_eq!(byte, [1]);
        assert!(space.frame_of(c).is_some());
        let evicted = [a, b]
            .iter()
            .filter(|&&va| space.frame_of(va).is_none())
            .count();
        assert_eq!(evicted, 1);
        vm.audit().unwrap();
    }

    #[test]
    fn stack_grows_down_to_the_fault() {
        let vm = new_vm(4);
        let space = vm.create_space();
        let sp = space.setup_stack().unwrap();
        assert_eq!(sp.0, vm.config().stack_top);
        assert_eq!(space.len(), 1);
        // a push three pages below the initial page
        let target = VirtAddr(sp.0 - 3 * PAGE_SIZE - 16);
        space.write(target, &[9; 8]).unwrap();
        assert_eq!(space.len(), 4);
        let mut byte = [0xffu8];
        space.read(VirtAddr(sp.0 - 2 * PAGE_SIZE), &mut byte).unwrap();
        assert_eq!(byte, [0]);
        vm.audit().unwrap();
    }

    #[test]
    fn stack_limit_is_enforced() {
        let vm = new_vm(4);
        let space = vm.create_space();
        space.setup_stack().unwrap();
        let below = VirtAddr(vm.config().stack_bottom() - 8);
        assert_eq!(
            space.write(below, &[1]),
            Err(VmError::NotMapped(below.0))
        );
    }

    #[test]
    fn out_of_swap_keeps_state_intact() {
        let vm = new_vm_with_swap(1, 1);
        let space = vm.create_space();
        for va in [0x1000, 0x2000, 0x3000] {
            anon(&space, va);
        }
        space.write(VirtAddr(0x1000), &[1]).unwrap();
        space.write(VirtAddr(0x2000), &[2]).unwrap();
        let err = space.write(VirtAddr(0x3000), &[3]).unwrap_err();
        assert_eq!(err, VmError::OutOfSwap);
        assert!(err.is_exhaustion());
        let mut byte = [0u8];
        space.read(VirtAddr(0x2000), &mut byte).unwrap();
        assert_eq!(byte, [2]);
        vm.audit().unwrap();
    }

    #[test]
    fn remove_releases_frame_and_slot() {
        let vm = new_vm(1);
        let space = vm.create_space();
        anon(&space, 0x1000);
        anon(&space, 0x2000);
        space.write(VirtAddr(0x1000), &[1]).unwrap();
        space.write(VirtAddr(0x2000), &[2]).unwrap();
        assert_eq!(vm.stats().swap_used, 1);
        space.remove(VirtAddr(0x1000)).unwrap();
        assert_eq!(vm.stats().swap_used, 0);
        space.remove(VirtAddr(0x2000)).unwrap();
        assert_eq!(vm.stats().frames_free, 1);
        assert_eq!(space.remove(VirtAddr(0x2000)), Err(VmError::NotMapped(0x2000)));
    }

    #[test]
    fn dropping_a_space_frees_everything() {
        let vm = new_vm(2);
        let space = vm.create_space();
        for i in 1..=4 {
            anon(&space, i * PAGE_SIZE);
            space.write(VirtAddr(i * PAGE_SIZE), &[i as u8]).unwrap();
        }
        drop(space);
        let stats = vm.stats();
        assert_eq!(stats.frames_free, 2);
        assert_eq!(stats.swap_used, 0);
    }

    #[test]
    fn dirty_bit_follows_writes() {
        let vm = new_vm(2);
        let space = vm.create_space();
        anon(&space, 0x1000);
        let mut byte = [0u8];
        space.read(VirtAddr(0x1000), &mut byte).unwrap();
        assert!(!space.is_dirty(VirtAddr(0x1000)));
        space.write(VirtAddr(0x1000), &[1]).unwrap();
        assert!(space.is_dirty(VirtAddr(0x1000)));
        let info = space.page_info(VirtAddr(0x1234)).unwrap();
        assert_eq!(info.vpn, VirtPageNum(1));
        assert_eq!(info.vm_type, VmType::Anon);
        assert!(matches!(info.state, PageState::Resident(_)));
    }
}
