//! Constants and run-time parameters of the VM core

/// Size of a virtual page and of a physical frame
pub const PAGE_SIZE: usize = 0x1000;
/// `log2(PAGE_SIZE)`
pub const PAGE_SIZE_BITS: usize = 0xc;

/// Use a sector size of 512 bytes on the swap device
pub const SECTOR_SIZE: usize = 512;
/// Number of consecutive sectors that hold one swapped-out page
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// First address above user space (top of the SV39 lower half)
pub const USER_VADDR_CEIL: usize = 0x40_0000_0000;
/// Initial top of the user stack
pub const USER_STACK_TOP: usize = 0x3f_ffff_f000;
/// How far the user stack may grow below [`USER_STACK_TOP`]
pub const STACK_LIMIT: usize = 1 << 20;

/// Default number of frames in the user pool
pub const DEFAULT_USER_FRAMES: usize = 256;

/// Run-time parameters of a [`crate::Vm`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of physical frames available to user pages
    pub user_frames: usize,
    /// First address above user space
    pub user_vaddr_ceil: usize,
    /// Top of every address space's stack
    pub stack_top: usize,
    /// Maximum size of the stack region
    pub stack_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: DEFAULT_USER_FRAMES,
            user_vaddr_ceil: USER_VADDR_CEIL,
            stack_top: USER_STACK_TOP,
            stack_limit: STACK_LIMIT,
        }
    }
}

impl VmConfig {
    /// Set the size of the user frame pool
    #[must_use]
    pub fn with_user_frames(mut self, user_frames: usize) -> Self {
        self.user_frames = user_frames;
        self
    }

    /// Set the user address ceiling
    #[must_use]
    pub fn with_user_vaddr_ceil(mut self, ceil: usize) -> Self {
        self.user_vaddr_ceil = ceil;
        self
    }

    /// Set the stack top and the maximum stack size
    #[must_use]
    pub fn with_stack(mut self, stack_top: usize, stack_limit: usize) -> Self {
        self.stack_top = stack_top;
        self.stack_limit = stack_limit;
        self
    }

    /// Lowest address the stack may grow down to
    pub fn stack_bottom(&self) -> usize {
        self.stack_top.saturating_sub(self.stack_limit)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{address::VirtAddr, error::VmError, fault::PageFault, test::RamDisk, vm::Vm};

    #[test]
    fn custom_layout_moves_stack_and_ceiling() {
        let top = 0x8_0000;
        let config = VmConfig::default()
            .with_user_frames(4)
            .with_user_vaddr_ceil(0x10_0000)
            .with_stack(top, 2 * PAGE_SIZE);
        assert_eq!(config.stack_bottom(), top - 2 * PAGE_SIZE);
        let vm = Vm::new(config, RamDisk::with_pages(8));
        let space = vm.create_space();
        assert_eq!(space.setup_stack().unwrap(), VirtAddr(top));

        let inside = PageFault::not_present(VirtAddr(top - 2 * PAGE_SIZE), true);
        assert!(space.handle_fault(inside));
        let below = PageFault::not_present(VirtAddr(top - 3 * PAGE_SIZE), true);
        assert_eq!(
            space.resolve_fault(below),
            Err(VmError::NotMapped(top - 3 * PAGE_SIZE))
        );
        let above = PageFault::not_present(VirtAddr(0x10_0000), false);
        let err = space.resolve_fault(above).unwrap_err();
        assert_eq!(err, VmError::InvalidAddress(0x10_0000));
        assert!(err.is_protection() && !err.is_exhaustion());
    }
}
