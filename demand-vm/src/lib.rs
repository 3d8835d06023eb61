//! Demand-paged virtual memory core
//!
//! Address spaces register pages lazily, frames are handed out on fault and
//! reclaimed by a second-chance clock, anonymous pages spill to a swap
//! device, file pages are written back to their file, and fork shares
//! frames copy-on-write.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod address;
mod anon;
mod bitmap;
mod block_dev;
mod config;
mod error;
mod fault;
mod file;
mod file_page;
mod frame_allocator;
mod frame_table;
mod id;
mod mmap;
mod page;
mod page_table;
mod space;
mod spt;
mod swap;
mod vm;

pub use address::{PhysPageNum, VPNRange, VirtAddr, VirtPageNum};
pub use block_dev::BlockDevice;
pub use config::{
    VmConfig, DEFAULT_USER_FRAMES, PAGE_SIZE, PAGE_SIZE_BITS, SECTORS_PER_PAGE, SECTOR_SIZE,
    STACK_LIMIT, USER_STACK_TOP, USER_VADDR_CEIL,
};
pub use error::{VmError, VmResult};
pub use fault::PageFault;
pub use file::{read_at, write_at, File};
pub use frame_allocator::FrameBytes;
pub use id::SpaceId;
pub use page::{FileSlice, Initializer, PageInit, PageState, VmType};
pub use space::{PageInfo, Space};
pub use vm::{Vm, VmStats};
