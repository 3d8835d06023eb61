//! Page fault descriptor and dispatch

use crate::{
    address::VirtAddr,
    error::{VmError, VmResult},
    id::SpaceId,
    vm::VmInner,
};
use log::{debug, error, warn};

/// What the trap layer knows about a page fault
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address
    pub addr: VirtAddr,
    /// Raised while running user code
    pub user: bool,
    /// The access was a write
    pub write: bool,
    /// No valid mapping existed; otherwise a present page refused the access
    pub not_present: bool,
}

impl PageFault {
    /// A user access to an address with no mapping
    pub fn not_present(addr: VirtAddr, write: bool) -> Self {
        Self {
            addr,
            user: true,
            write,
            not_present: true,
        }
    }

    /// A user write to a page mapped read-only
    pub fn write_protect(addr: VirtAddr) -> Self {
        Self {
            addr,
            user: true,
            write: true,
            not_present: false,
        }
    }

    /// The same fault raised from kernel context
    #[must_use]
    pub fn in_kernel(mut self) -> Self {
        self.user = false;
        self
    }
}

impl VmInner {
    /// Resolve a fault in `sid`, or report why the access is illegal
    pub fn handle_fault(&mut self, sid: SpaceId, fault: PageFault) -> VmResult<()> {
        self.stats.faults += 1;
        let result = self.dispatch_fault(sid, fault);
        match result {
            Err(err) if err.is_protection() => warn!("fault: {sid:?} {fault:?} rejected: {err}"),
            Err(err) => error!("fault: {sid:?} {fault:?} failed: {err}"),
            Ok(()) => {}
        }
        result
    }

    fn dispatch_fault(&mut self, sid: SpaceId, fault: PageFault) -> VmResult<()> {
        let addr = fault.addr;
        if addr.is_null() || (fault.user && addr.0 >= self.config.user_vaddr_ceil) {
            return Err(VmError::InvalidAddress(addr.0));
        }
        let vpn = addr.to_vpn_by_floor();
        let Some(page) = self.space(sid)?.spt.get(vpn) else {
            if fault.user && self.in_stack_gap(sid, addr)? {
                self.grow_stack(sid, vpn)?;
                self.claim(sid, vpn)?;
                return Ok(());
            }
            return Err(VmError::NotMapped(addr.0));
        };
        if fault.write && !page.writable() {
            return Err(VmError::WriteProtected(addr.0));
        }
        match page.frame() {
            None => {
                debug!("fault: {sid:?} claims {vpn:?}");
                self.claim(sid, vpn).map(|_| ())
            }
            Some(_) if fault.write && !fault.not_present => self.break_cow(sid, vpn),
            // another sharer already brought the page back
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::{VmConfig, PAGE_SIZE},
        page::{PageInit, VmType},
        test::{contents, new_vm, MemFile},
    };

    #[test]
    fn null_and_kernel_addresses_are_rejected() {
        let vm = new_vm(4);
        let space = vm.create_space();
        let null = PageFault::not_present(VirtAddr(0), false);
        assert_eq!(space.resolve_fault(null), Err(VmError::InvalidAddress(0)));
        let high = VmConfig::default().user_vaddr_ceil;
        let kernel = PageFault::not_present(VirtAddr(high), false);
        assert_eq!(
            space.resolve_fault(kernel),
            Err(VmError::InvalidAddress(high))
        );
        assert!(!space.handle_fault(null));
        assert_eq!(vm.stats().faults, 3);
    }

    #[test]
    fn unmapped_address_is_not_mapped() {
        let vm = new_vm(4);
        let space = vm.create_space();
        let fault = PageFault::not_present(VirtAddr(0x5000), true);
        assert_eq!(space.resolve_fault(fault), Err(VmError::NotMapped(0x5000)));
    }

    #[test]
    fn write_to_read_only_page_is_a_protection_fault() {
        let vm = new_vm(4);
        let space = vm.create_space();
        space
            .allocate(VmType::Anon, VirtAddr(0x1000), false, PageInit::Zero)
            .unwrap();
        let fault = PageFault::not_present(VirtAddr(0x1010), true);
        assert_eq!(
            space.resolve_fault(fault),
            Err(VmError::WriteProtected(0x1010))
        );
        assert!(space.handle_fault(PageFault::not_present(VirtAddr(0x1010), false)));
        assert_eq!(
            space.write(VirtAddr(0x1000), &[1]),
            Err(VmError::WriteProtected(0x1000))
        );
    }

    #[test]
    fn lazy_segment_loads_on_first_touch() {
        let vm = new_vm(4);
        let space = vm.create_space();
        let file = MemFile::patterned(PAGE_SIZE + 100);
        let original = contents(file.as_ref());
        let slice = crate::page::FileSlice::new(file.clone(), PAGE_SIZE, 100, PAGE_SIZE - 100);
        space
            .allocate(VmType::Anon, VirtAddr(0x40_0000), true, PageInit::File(slice))
            .unwrap();
        assert_eq!(vm.stats().frames_resident, 0);
        let mut buf = [0u8; 200];
        space.read(VirtAddr(0x40_0000), &mut buf).unwrap();
        assert_eq!(buf[..100], original[PAGE_SIZE..]);
        assert!(buf[100..].iter().all(|&b| b == 0));
        // a segment page is anonymous once loaded: writes never reach the file
        space.write(VirtAddr(0x40_0000), &[0xee; 16]).unwrap();
        drop(space);
        assert_eq!(contents(file.as_ref()), original);
    }

    #[test]
    fn kernel_fault_in_stack_gap_does_not_grow() {
        let vm = new_vm(4);
        let space = vm.create_space();
        let top = vm.config().stack_top;
        let fault = PageFault::not_present(VirtAddr(top - 8), true).in_kernel();
        assert_eq!(space.resolve_fault(fault), Err(VmError::NotMapped(top - 8)));
    }

    #[test]
    fn custom_initializer_runs_once() {
        use alloc::sync::Arc;
        use core::sync::atomic::{AtomicUsize, Ordering};
        let vm = new_vm(4);
        let space = vm.create_space();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let init = PageInit::Custom(Arc::new(move |frame: &mut [u8; PAGE_SIZE]| {
            counter.fetch_add(1, Ordering::Relaxed);
            frame[0] = 42;
            true
        }));
        space
            .allocate(VmType::Anon, VirtAddr(0x9000), true, init)
            .unwrap();
        let mut byte = [0u8];
        space.read(VirtAddr(0x9000), &mut byte).unwrap();
        space.read(VirtAddr(0x9000), &mut byte).unwrap();
        assert_eq!(byte, [42]);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failing_initializer_leaves_page_uninitialized() {
        use alloc::sync::Arc;
        let vm = new_vm(2);
        let space = vm.create_space();
        let init = PageInit::Custom(Arc::new(|_: &mut [u8; PAGE_SIZE]| false));
        space
            .allocate(VmType::Anon, VirtAddr(0x9000), true, init)
            .unwrap();
        assert!(!space.claim(VirtAddr(0x9000)));
        assert_eq!(vm.stats().frames_free, 2);
        vm.audit().unwrap();
    }
}
