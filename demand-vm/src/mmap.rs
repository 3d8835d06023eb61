//! Memory-mapped files

use crate::{
    address::{VirtAddr, VirtPageNum, VPNRange},
    config::PAGE_SIZE,
    error::{VmError, VmResult},
    file::File,
    id::SpaceId,
    page::{FileSlice, Page, PageInit, VmType},
    vm::VmInner,
};
use alloc::sync::Arc;
use log::{info, warn};

impl VmInner {
    /// Map `length` bytes of `file` from `offset` at `addr`, as pages tagged `mmap_id`
    ///
    /// Either every page of the region is registered or none is.
    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &mut self,
        sid: SpaceId,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: &Arc<dyn File>,
        offset: usize,
        mmap_id: u64,
    ) -> VmResult<VirtAddr> {
        if addr.is_null() || !addr.is_aligned() {
            return Err(VmError::InvalidAddress(addr.0));
        }
        if length == 0 {
            return Err(VmError::InvalidArgument("mmap of zero bytes"));
        }
        if !offset.is_multiple_of(PAGE_SIZE) {
            return Err(VmError::InvalidArgument("mmap offset is not page-aligned"));
        }
        let end = addr
            .0
            .checked_add(length)
            .filter(|&end| end <= self.config.user_vaddr_ceil)
            .ok_or(VmError::InvalidAddress(addr.0))?;
        let file_size = file.file_size();
        if file_size == 0 {
            return Err(VmError::InvalidArgument("mmap of an empty file"));
        }
        if offset >= file_size {
            return Err(VmError::InvalidArgument("mmap offset is past end of file"));
        }
        let range = VPNRange::new(addr.to_vpn_by_floor(), VirtAddr(end).to_vpn_by_ceil());
        let space = self.space(sid)?;
        if let Some(vpn) = range.into_iter().find(|&vpn| space.spt.contains(vpn)) {
            return Err(VmError::PageExists(vpn.addr().0));
        }

        let mut read_bytes = length.min(file_size - offset);
        let mut file_offset = offset;
        for vpn in range {
            let page_read = read_bytes.min(PAGE_SIZE);
            let slice = FileSlice::new(file.reopen(), file_offset, page_read, PAGE_SIZE - page_read)
                .with_mmap_id(mmap_id);
            if let Err(err) = self.allocate(sid, VmType::File, vpn.addr(), writable, PageInit::File(slice)) {
                for done in VPNRange::new(range.start(), vpn) {
                    self.remove_page(sid, done, false)?;
                }
                return Err(err);
            }
            read_bytes -= page_read;
            file_offset += page_read;
        }
        info!(
            "mmap: {sid:?} mapped inode {} at {addr:?}..{:?} as #{mmap_id}",
            file.inode_id(),
            VirtAddr(end)
        );
        Ok(addr)
    }

    /// Unmap the region that starts at `addr`, writing dirty pages back
    ///
    /// Does nothing unless `addr` is the first page of a live mapping.
    pub fn munmap(&mut self, sid: SpaceId, addr: VirtAddr) -> VmResult<()> {
        let vpn = addr.to_vpn_by_floor();
        let space = self.space(sid)?;
        let id = match space.spt.get(vpn).map(Page::mmap_id) {
            Some(id) if id != 0 => id,
            _ => return Ok(()),
        };
        let continues = vpn.0 > 0
            && space
                .spt
                .get(VirtPageNum(vpn.0 - 1))
                .is_some_and(|page| page.mmap_id() == id);
        if continues {
            warn!("munmap: {addr:?} is inside mapping #{id}, not its start");
            return Ok(());
        }
        let mut current = vpn;
        let mut pages = 0;
        while self
            .space(sid)?
            .spt
            .get(current)
            .is_some_and(|page| page.mmap_id() == id)
        {
            self.remove_page(sid, current, true)?;
            current.0 += 1;
            pages += 1;
        }
        info!("munmap: {sid:?} unmapped #{id}, {pages} page(s) at {addr:?}");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::{
        address::VirtAddr,
        config::PAGE_SIZE,
        error::VmError,
        page::{PageInit, VmType},
        test::{contents, new_vm, MemFile},
    };

    const BASE: VirtAddr = VirtAddr(0x1000_0000);

    #[test]
    fn mapping_reads_file_and_zero_fills_tail() {
        let vm = new_vm(8);
        let space = vm.create_space();
        let file = MemFile::patterned(PAGE_SIZE + 10);
        let data = contents(file.as_ref());
        space.mmap(BASE, 2 * PAGE_SIZE, false, &file, 0).unwrap();
        let mut buf = vec![0u8; 2 * PAGE_SIZE];
        space.read(BASE, &mut buf).unwrap();
        assert_eq!(buf[..PAGE_SIZE + 10], data[..]);
        assert!(buf[PAGE_SIZE + 10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn mapping_honours_file_offset() {
        let vm = new_vm(8);
        let space = vm.create_space();
        let file = MemFile::patterned(3 * PAGE_SIZE);
        let data = contents(file.as_ref());
        space.mmap(BASE, PAGE_SIZE, false, &file, PAGE_SIZE).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        space.read(BASE, &mut buf).unwrap();
        assert_eq!(buf[..], data[PAGE_SIZE..2 * PAGE_SIZE]);
    }

    #[test]
    fn bad_requests_are_rejected() {
        let vm = new_vm(8);
        let space = vm.create_space();
        let file = MemFile::patterned(100);
        let empty = MemFile::with_data(&[]);
        assert_eq!(
            space.mmap(VirtAddr(0), PAGE_SIZE, true, &file, 0),
            Err(VmError::InvalidAddress(0))
        );
        assert_eq!(
            space.mmap(VirtAddr(BASE.0 + 1), PAGE_SIZE, true, &file, 0),
            Err(VmError::InvalidAddress(BASE.0 + 1))
        );
        assert!(matches!(
            space.mmap(BASE, 0, true, &file, 0),
            Err(VmError::InvalidArgument(_))
        ));
        assert!(matches!(
            space.mmap(BASE, PAGE_SIZE, true, &empty, 0),
            Err(VmError::InvalidArgument(_))
        ));
        assert!(matches!(
            space.mmap(BASE, PAGE_SIZE, true, &file, 12),
            Err(VmError::InvalidArgument(_))
        ));
        assert!(matches!(
            space.mmap(BASE, PAGE_SIZE, true, &file, PAGE_SIZE),
            Err(VmError::InvalidArgument(_))
        ));
        let ceil = vm.config().user_vaddr_ceil;
        assert_eq!(
            space.mmap(VirtAddr(ceil - PAGE_SIZE), 2 * PAGE_SIZE, true, &file, 0),
            Err(VmError::InvalidAddress(ceil - PAGE_SIZE))
        );
        assert!(space.is_empty());
    }

    #[test]
    fn overlapping_mapping_leaves_nothing_behind() {
        let vm = new_vm(8);
        let space = vm.create_space();
        let file = MemFile::patterned(4 * PAGE_SIZE);
        space
            .allocate(VmType::Anon, VirtAddr(BASE.0 + 2 * PAGE_SIZE), true, PageInit::Zero)
            .unwrap();
        assert_eq!(
            space.mmap(BASE, 4 * PAGE_SIZE, true, &file, 0),
            Err(VmError::PageExists(BASE.0 + 2 * PAGE_SIZE))
        );
        assert_eq!(space.len(), 1);
    }

    #[test]
    fn write_evict_unmap_reaches_the_file() {
        let vm = new_vm(2);
        let space = vm.create_space();
        let file = MemFile::patterned(3 * PAGE_SIZE);
        let mut expected = contents(file.as_ref());
        space.mmap(BASE, 3 * PAGE_SIZE, true, &file, 0).unwrap();
        for (i, byte) in expected.iter_mut().enumerate().step_by(97) {
            *byte = !(i as u8);
            space.write(VirtAddr(BASE.0 + i), &[*byte]).unwrap();
        }
        assert!(vm.stats().evictions > 0);
        vm.audit().unwrap();
        space.munmap(BASE);
        assert!(space.is_empty());
        assert_eq!(contents(file.as_ref()), expected);
        assert_eq!(vm.stats().frames_free, 2);
    }

    #[test]
    fn clean_pages_are_not_written_back() {
        let vm = new_vm(4);
        let space = vm.create_space();
        let file = MemFile::patterned(PAGE_SIZE);
        space.mmap(BASE, PAGE_SIZE, true, &file, 0).unwrap();
        let mut buf = [0u8; 8];
        space.read(BASE, &mut buf).unwrap();
        space.munmap(BASE);
        assert_eq!(vm.stats().write_backs, 0);
    }

    #[test]
    #[should_panic(expected = "short write-back")]
    fn lost_write_back_is_not_ignored() {
        let vm = new_vm(4);
        let space = vm.create_space();
        let file = MemFile::read_only(&[0x11; 64]);
        space.mmap(BASE, PAGE_SIZE, true, &file, 0).unwrap();
        space.write(BASE, b"lost").unwrap();
        space.munmap(BASE);
    }

    #[test]
    fn munmap_only_acts_on_region_start() {
        let vm = new_vm(8);
        let space = vm.create_space();
        let file = MemFile::patterned(2 * PAGE_SIZE);
        space.mmap(BASE, 2 * PAGE_SIZE, true, &file, 0).unwrap();
        space
            .allocate(VmType::Anon, VirtAddr(BASE.0 + 2 * PAGE_SIZE), true, PageInit::Zero)
            .unwrap();
        space.munmap(VirtAddr(BASE.0 + PAGE_SIZE));
        space.munmap(VirtAddr(BASE.0 + 2 * PAGE_SIZE));
        space.munmap(VirtAddr(0x7000));
        assert_eq!(space.len(), 3);
        space.munmap(BASE);
        assert_eq!(space.len(), 1);
        // a second munmap of the same address is a no-op
        space.munmap(BASE);
        assert_eq!(space.len(), 1);
    }

    #[test]
    fn adjacent_mappings_unmap_independently() {
        let vm = new_vm(8);
        let space = vm.create_space();
        let file = MemFile::patterned(PAGE_SIZE);
        let second = VirtAddr(BASE.0 + PAGE_SIZE);
        space.mmap(BASE, PAGE_SIZE, true, &file, 0).unwrap();
        space.mmap(second, PAGE_SIZE, true, &file, 0).unwrap();
        space.munmap(second);
        assert_eq!(space.len(), 1);
        assert!(space.page_info(BASE).is_some());
    }

    #[test]
    fn exit_writes_back_dirty_mappings() {
        let vm = new_vm(4);
        let space = vm.create_space();
        let file = MemFile::patterned(PAGE_SIZE);
        space.mmap(BASE, PAGE_SIZE, true, &file, 0).unwrap();
        space.write(VirtAddr(BASE.0 + 5), b"hello").unwrap();
        drop(space);
        assert_eq!(&contents(file.as_ref())[5..10], b"hello");
        assert_eq!(vm.stats().frames_free, 4);
    }
}
