//! The VM core: global frame, swap and address-space state behind one lock
//!
//! Every address space, its supplemental page table and its page table live
//! inside [`VmInner`], guarded by a single [`spin::Mutex`]. Eviction and
//! copy-on-write routinely change mappings of spaces other than the faulting
//! one, so there is no finer-grained locking to get wrong.

use crate::{
    address::{PhysPageNum, VirtAddr, VirtPageNum, VPNRange},
    block_dev::BlockDevice,
    config::VmConfig,
    error::{VmError, VmResult},
    frame_allocator::PhysMemory,
    frame_table::{Frame, FrameTable, Owner},
    id::{RecycleAllocator, SpaceId},
    page::{Page, PageInit, PageKind, PageState, VmType},
    page_table::{PTEFlags, PageTable, PageTableEntry},
    space::Space,
    spt::SupplementalPageTable,
    swap::SwapTable,
};
use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, info, trace, warn};
use spin::Mutex;

/// Page table, supplemental page table and stack extent of one process
pub(crate) struct AddressSpace {
    pub spt: SupplementalPageTable,
    pub page_table: PageTable,
    /// Lowest page the stack currently reaches
    pub stack_floor: VirtPageNum,
}

/// Pages that shared a frame when it was evicted
struct EvictionGroup {
    members: Vec<Owner>,
    slot: Option<usize>,
}

/// Snapshot of frame and swap usage plus event counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Frames in the user pool
    pub frames_total: usize,
    /// Frames not holding any page
    pub frames_free: usize,
    /// Frames holding at least one page
    pub frames_resident: usize,
    /// Slots on the swap device
    pub swap_slots: usize,
    /// Occupied swap slots
    pub swap_used: usize,
    /// Page faults handled, successful or not
    pub faults: u64,
    /// Frames taken away from their pages
    pub evictions: u64,
    /// Pages read back from swap
    pub swap_ins: u64,
    /// Pages written to swap
    pub swap_outs: u64,
    /// Shared frames copied on a write fault
    pub cow_breaks: u64,
    /// File pages written back to their file
    pub write_backs: u64,
}

pub(crate) struct VmInner {
    pub config: VmConfig,
    pub memory: PhysMemory,
    pub frames: FrameTable,
    pub swap: SwapTable,
    pub spaces: BTreeMap<SpaceId, AddressSpace>,
    space_ids: RecycleAllocator,
    groups: BTreeMap<usize, EvictionGroup>,
    group_ids: RecycleAllocator,
    pub stats: VmStats,
}

/// Flags of a user mapping
pub(crate) fn user_flags(writable: bool) -> PTEFlags {
    let mut flags = PTEFlags::R | PTEFlags::U;
    flags.set(PTEFlags::W, writable);
    flags
}

impl VmInner {
    pub fn space(&self, sid: SpaceId) -> VmResult<&AddressSpace> {
        self.spaces
            .get(&sid)
            .ok_or(VmError::Inconsistent("unknown address space"))
    }

    pub fn space_mut(&mut self, sid: SpaceId) -> VmResult<&mut AddressSpace> {
        self.spaces
            .get_mut(&sid)
            .ok_or(VmError::Inconsistent("unknown address space"))
    }

    fn page_mut(&mut self, owner: Owner) -> VmResult<&mut Page> {
        self.space_mut(owner.space)?
            .spt
            .get_mut(owner.vpn)
            .ok_or(VmError::Inconsistent("frame owner has no page"))
    }

    fn create_space(&mut self) -> SpaceId {
        let sid = SpaceId(self.space_ids.alloc());
        let stack_floor = VirtAddr(self.config.stack_top).to_vpn_by_ceil();
        self.spaces.insert(
            sid,
            AddressSpace {
                spt: SupplementalPageTable::new(),
                page_table: PageTable::new(),
                stack_floor,
            },
        );
        info!("vm: created {sid:?}");
        sid
    }

    /// Register an uninitialized page at the page containing `va`
    pub fn allocate(
        &mut self,
        sid: SpaceId,
        ty: VmType,
        va: VirtAddr,
        writable: bool,
        init: PageInit,
    ) -> VmResult<()> {
        let page = Page::new_uninit(va.to_vpn_by_floor(), writable, ty, init)?;
        self.space_mut(sid)?.spt.insert(page)?;
        trace!("vm: {sid:?} registered {ty:?} page at {va:?}");
        Ok(())
    }

    /// Get a frame from the pool, evicting a resident page if it is empty
    pub fn acquire_frame(&mut self) -> VmResult<PhysPageNum> {
        if let Some(ppn) = self.memory.alloc() {
            return Ok(ppn);
        }
        let victim = self.select_victim().ok_or(VmError::OutOfFrames)?;
        self.evict(victim)?;
        self.memory.bytes_mut(victim).fill(0);
        Ok(victim)
    }

    fn select_victim(&mut self) -> Option<PhysPageNum> {
        let spaces = &mut self.spaces;
        self.frames.select_victim(|owners| {
            let mut accessed = false;
            for owner in owners {
                if let Some(space) = spaces.get_mut(&owner.space) {
                    accessed |= space.page_table.is_accessed(owner.vpn);
                    space.page_table.set_accessed(owner.vpn, false);
                }
            }
            accessed
        })
    }

    /// Move the content of `ppn` to its backing store and detach every owner
    ///
    /// The frame stays allocated; the caller reuses it.
    fn evict(&mut self, ppn: PhysPageNum) -> VmResult<()> {
        let owners = self
            .frames
            .get(ppn)
            .ok_or(VmError::Inconsistent("victim is not in the frame table"))?
            .owners()
            .to_vec();
        let dirty = owners.iter().any(|o| {
            self.spaces
                .get(&o.space)
                .is_some_and(|space| space.page_table.is_dirty(o.vpn))
        });
        let leader = owners[0];
        let evicted = {
            let Self {
                spaces,
                memory,
                swap,
                ..
            } = self;
            let page = spaces
                .get_mut(&leader.space)
                .and_then(|space| space.spt.get_mut(leader.vpn))
                .ok_or(VmError::Inconsistent("frame owner has no page"))?;
            page.swap_out(memory.bytes(ppn), dirty, swap)?
        };
        for &owner in &owners {
            self.space_mut(owner.space)?.page_table.unmap(owner.vpn);
            self.page_mut(owner)?.mark_evicted(evicted);
        }
        self.frames.remove(ppn);
        if owners.len() > 1 {
            let gid = self.group_ids.alloc();
            for &owner in &owners {
                self.page_mut(owner)?.group = Some(gid);
            }
            self.groups.insert(
                gid,
                EvictionGroup {
                    members: owners.clone(),
                    slot: evicted.slot,
                },
            );
        }
        self.stats.evictions += 1;
        if evicted.slot.is_some() {
            self.stats.swap_outs += 1;
        }
        if evicted.written_back {
            self.stats.write_backs += 1;
        }
        debug!(
            "vm: evicted {ppn:?} from {} owner(s), slot {:?}",
            owners.len(),
            evicted.slot
        );
        Ok(())
    }

    /// Make the page at `vpn` resident and return its frame
    ///
    /// Claiming a page that is already resident returns its frame.
    pub fn claim(&mut self, sid: SpaceId, vpn: VirtPageNum) -> VmResult<PhysPageNum> {
        let space = self.space(sid)?;
        let page = space
            .spt
            .get(vpn)
            .ok_or(VmError::NotMapped(vpn.addr().0))?;
        if let Some(ppn) = page.frame() {
            return Ok(ppn);
        }
        if space.page_table.translate(vpn).is_some() {
            return Err(VmError::AlreadyMapped(vpn.addr().0));
        }
        let ppn = self.acquire_frame()?;
        if let Err(err) = self.populate(Owner::new(sid, vpn), ppn) {
            self.memory.dealloc(ppn);
            return Err(err);
        }
        Ok(ppn)
    }

    /// Fill `ppn` with the content of a non-resident page and map it
    ///
    /// If the page was evicted from a shared frame, every other member of its
    /// eviction group is connected to `ppn` too.
    fn populate(&mut self, owner: Owner, ppn: PhysPageNum) -> VmResult<()> {
        let (group, from_swap) = {
            let Self {
                spaces,
                memory,
                swap,
                ..
            } = self;
            let page = spaces
                .get_mut(&owner.space)
                .and_then(|space| space.spt.get_mut(owner.vpn))
                .ok_or(VmError::NotMapped(owner.vpn.addr().0))?;
            let from_swap = matches!(page.kind(), PageKind::Anon(anon) if anon.slot().is_some());
            page.swap_in(memory.bytes_mut(ppn), swap)?;
            page.set_frame(ppn);
            (page.group.take(), from_swap)
        };
        if from_swap {
            self.stats.swap_ins += 1;
        }
        let mut owners = vec![owner];
        if let Some(gid) = group {
            let group = self
                .groups
                .remove(&gid)
                .ok_or(VmError::Inconsistent("unknown eviction group"))?;
            for &member in group.members.iter().filter(|&&m| m != owner) {
                let page = self.page_mut(member)?;
                if page.group == Some(gid) && page.frame().is_none() {
                    page.group = None;
                    page.attach(ppn);
                    owners.push(member);
                }
            }
            self.group_ids.dealloc(gid);
            debug!("vm: restored {} sharer(s) of {ppn:?}", owners.len());
        }
        let shared = owners.len() > 1;
        for &member in &owners {
            let writable = self.page_mut(member)?.writable() && !shared;
            self.space_mut(member.space)?
                .page_table
                .map(member.vpn, ppn, user_flags(writable))?;
        }
        self.frames.insert(ppn, owners);
        trace!("vm: {:?} claimed {:?} into {ppn:?}", owner.space, owner.vpn);
        Ok(())
    }

    /// Give write access back to the last page left on a shared frame
    fn restore_sole_owner(&mut self, ppn: PhysPageNum) -> VmResult<()> {
        let Some(&[owner]) = self.frames.get(ppn).map(Frame::owners) else {
            return Ok(());
        };
        if self.page_mut(owner)?.writable() {
            self.space_mut(owner.space)?
                .page_table
                .set_writable(owner.vpn, true);
        }
        Ok(())
    }

    /// Copy a shared frame for the page at `vpn` so it can be written
    pub fn break_cow(&mut self, sid: SpaceId, vpn: VirtPageNum) -> VmResult<()> {
        let owner = Owner::new(sid, vpn);
        let space = self.space(sid)?;
        let old = space
            .page_table
            .translate(vpn)
            .ok_or(VmError::Inconsistent("resident page is not mapped"))?;
        if old.is_writable() {
            return Ok(());
        }
        let ppn = old.ppn();
        if self.frames.share_count(ppn) <= 1 {
            self.space_mut(sid)?.page_table.set_writable(vpn, true);
            return Ok(());
        }
        self.frames.pin(ppn);
        let new = self.acquire_frame();
        self.frames.unpin(ppn);
        let new = new?;
        self.memory.copy(ppn, new);
        self.frames.remove_owner(ppn, owner);
        self.restore_sole_owner(ppn)?;
        let page_table = &mut self.space_mut(sid)?.page_table;
        page_table.unmap(vpn);
        page_table.map(vpn, new, user_flags(true) | (old.flags() & PTEFlags::D))?;
        self.page_mut(owner)?.set_frame(new);
        self.frames.insert_one(new, owner);
        self.stats.cow_breaks += 1;
        debug!("vm: {sid:?} copied {ppn:?} to {new:?} for {vpn:?}");
        Ok(())
    }

    /// Unregister the page at `vpn`, releasing its frame share and backing resources
    ///
    /// With `write_back`, a dirty resident file page is written to its file first.
    pub fn remove_page(&mut self, sid: SpaceId, vpn: VirtPageNum, write_back: bool) -> VmResult<()> {
        let owner = Owner::new(sid, vpn);
        let space = self.space_mut(sid)?;
        let mut page = space
            .spt
            .remove(vpn)
            .ok_or(VmError::NotMapped(vpn.addr().0))?;
        if let Some(ppn) = page.frame() {
            let dirty = space
                .page_table
                .unmap(vpn)
                .is_some_and(PageTableEntry::is_dirty);
            if write_back && dirty && page.write_back(self.memory.bytes(ppn)) {
                self.stats.write_backs += 1;
            }
            if self.frames.remove_owner(ppn, owner).is_empty() {
                self.frames.remove(ppn);
                self.memory.dealloc(ppn);
            } else {
                self.restore_sole_owner(ppn)?;
            }
        } else if let Some(gid) = page.group {
            self.leave_group(gid, owner);
        } else {
            page.destroy(&mut self.swap);
        }
        trace!("vm: {sid:?} removed page {vpn:?}");
        Ok(())
    }

    /// Drop `owner` from an eviction group
    ///
    /// A group left with one member dissolves: that page keeps the swap slot
    /// for itself. A group left empty frees its slot.
    fn leave_group(&mut self, gid: usize, owner: Owner) {
        let Some(group) = self.groups.get_mut(&gid) else {
            return;
        };
        group.members.retain(|&m| m != owner);
        let (remaining, slot) = (group.members.clone(), group.slot);
        match remaining.as_slice() {
            [] => {
                if let Some(slot) = slot {
                    self.swap.free(slot);
                }
            }
            &[last] => {
                if let Ok(page) = self.page_mut(last) {
                    page.group = None;
                }
            }
            _ => return,
        }
        self.groups.remove(&gid);
        self.group_ids.dealloc(gid);
    }

    /// Tear down a space, writing back dirty file pages
    fn destroy_space(&mut self, sid: SpaceId) {
        let Ok(space) = self.space(sid) else {
            return;
        };
        let vpns: Vec<VirtPageNum> = space.spt.vpns().collect();
        for vpn in vpns {
            if let Err(err) = self.remove_page(sid, vpn, true) {
                warn!("vm: {sid:?} failed to release {vpn:?}: {err}");
            }
        }
        self.spaces.remove(&sid);
        self.space_ids.dealloc(sid.0);
        info!("vm: destroyed {sid:?}");
    }

    /// Reproduce every page of `src` in `dst`, sharing resident frames
    fn copy_space(&mut self, dst: SpaceId, src: SpaceId) -> VmResult<()> {
        let vpns: Vec<VirtPageNum> = self.space(src)?.spt.vpns().collect();
        for vpn in vpns {
            self.copy_page(dst, src, vpn)?;
        }
        let floor = self.space(src)?.stack_floor;
        let dst_space = self.space_mut(dst)?;
        dst_space.stack_floor = dst_space.stack_floor.min(floor);
        info!("vm: copied {src:?} into {dst:?}");
        Ok(())
    }

    fn copy_page(&mut self, dst: SpaceId, src: SpaceId, vpn: VirtPageNum) -> VmResult<()> {
        if self.space(dst)?.spt.contains(vpn) {
            return Err(VmError::PageExists(vpn.addr().0));
        }
        let page = self
            .space(src)?
            .spt
            .get(vpn)
            .ok_or(VmError::NotMapped(vpn.addr().0))?;
        let state = page.state();
        if state == PageState::Evicted && page.vm_type() == VmType::Anon {
            // bring it back so both sides share one frame
            self.claim(src, vpn)?;
            return self.copy_page(dst, src, vpn);
        }
        let mut child = page.fork_copy();
        if let PageState::Resident(ppn) = state {
            child.set_frame(ppn);
            let src_space = self.space_mut(src)?;
            src_space.page_table.set_writable(vpn, false);
            let dst_space = self.space_mut(dst)?;
            dst_space.page_table.map(vpn, ppn, user_flags(false))?;
            dst_space.spt.insert(child)?;
            self.frames.add_owner(ppn, Owner::new(dst, vpn));
        } else {
            self.space_mut(dst)?.spt.insert(child)?;
        }
        Ok(())
    }

    /// Check that page tables, pages and the frame table agree
    fn audit(&self) -> VmResult<()> {
        for (&sid, space) in &self.spaces {
            for page in space.spt.iter() {
                let owner = Owner::new(sid, page.vpn());
                let pte = space.page_table.translate(page.vpn());
                match page.frame() {
                    Some(ppn) => {
                        if pte.map(PageTableEntry::ppn) != Some(ppn) {
                            return Err(VmError::Inconsistent(
                                "resident page is not mapped to its frame",
                            ));
                        }
                        let listed = self
                            .frames
                            .get(ppn)
                            .is_some_and(|frame| frame.owners().contains(&owner));
                        if !listed {
                            return Err(VmError::Inconsistent(
                                "frame table does not list a resident page",
                            ));
                        }
                    }
                    None if pte.is_some() => {
                        return Err(VmError::Inconsistent("non-resident page is mapped"))
                    }
                    None => {}
                }
            }
            for (vpn, _) in space.page_table.iter() {
                if space.spt.get(vpn).and_then(Page::frame).is_none() {
                    return Err(VmError::Inconsistent("mapping without a resident page"));
                }
            }
        }
        for (ppn, frame) in self.frames.iter() {
            if frame.pinned() {
                return Err(VmError::Inconsistent("frame left pinned"));
            }
            let shared = frame.owners().len() > 1;
            for owner in frame.owners() {
                let space = self.space(owner.space)?;
                if space.spt.get(owner.vpn).and_then(Page::frame) != Some(ppn) {
                    return Err(VmError::Inconsistent("frame owner does not point at the frame"));
                }
                let writable = space
                    .page_table
                    .translate(owner.vpn)
                    .is_some_and(PageTableEntry::is_writable);
                if shared && writable {
                    return Err(VmError::Inconsistent("shared frame is mapped writable"));
                }
            }
        }
        if self.frames.len() + self.memory.free() != self.memory.total() {
            return Err(VmError::Inconsistent("frame pool leaked a frame"));
        }
        Ok(())
    }

    /// Whether `va` lies in the region the stack of `sid` may grow into
    pub fn in_stack_gap(&self, sid: SpaceId, va: VirtAddr) -> VmResult<bool> {
        let floor = self.space(sid)?.stack_floor.addr().0;
        Ok(va.0 >= self.config.stack_bottom() && va.0 < floor)
    }

    /// Extend the stack of `sid` down to the page `vpn`
    pub fn grow_stack(&mut self, sid: SpaceId, vpn: VirtPageNum) -> VmResult<()> {
        let floor = self.space(sid)?.stack_floor;
        for page in VPNRange::new(vpn, floor) {
            if !self.space(sid)?.spt.contains(page) {
                self.allocate(sid, VmType::Anon, page.addr(), true, PageInit::Zero)?;
            }
        }
        self.space_mut(sid)?.stack_floor = vpn;
        debug!("vm: {sid:?} stack grew to {vpn:?}");
        Ok(())
    }
}

/// The virtual memory manager shared by every address space
pub struct Vm {
    inner: Mutex<VmInner>,
    next_mmap_id: AtomicU64,
}

impl Vm {
    /// Create a VM over a fresh pool of `config.user_frames` frames, swapping to `swap_device`
    pub fn new(config: VmConfig, swap_device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let swap = SwapTable::new(swap_device);
        info!(
            "vm: {} user frames, {} swap slots",
            config.user_frames,
            swap.capacity()
        );
        Arc::new(Self {
            inner: Mutex::new(VmInner {
                config,
                memory: PhysMemory::new(config.user_frames),
                frames: FrameTable::new(),
                swap,
                spaces: BTreeMap::new(),
                space_ids: RecycleAllocator::new(),
                groups: BTreeMap::new(),
                group_ids: RecycleAllocator::new(),
                stats: VmStats::default(),
            }),
            next_mmap_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, VmInner> {
        self.inner.lock()
    }

    pub(crate) fn next_mmap_id(&self) -> u64 {
        self.next_mmap_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run-time parameters this VM was built with
    pub fn config(&self) -> VmConfig {
        self.lock().config
    }

    /// Create an empty address space
    pub fn create_space(self: &Arc<Self>) -> Space {
        let id = self.lock().create_space();
        Space::new(self.clone(), id)
    }

    /// Reproduce every page of `src` in `dst`, sharing resident frames copy-on-write
    pub fn copy_space(&self, dst: &Space, src: &Space) -> VmResult<()> {
        if !core::ptr::eq(dst.vm().as_ref(), self) || !core::ptr::eq(src.vm().as_ref(), self) {
            return Err(VmError::InvalidArgument("space belongs to another vm"));
        }
        self.lock().copy_space(dst.id(), src.id())
    }

    /// [`Vm::copy_space`] reporting only success
    pub fn spt_copy(&self, dst: &Space, src: &Space) -> bool {
        self.copy_space(dst, src)
            .inspect_err(|err| warn!("vm: copy of {:?} failed: {err}", src.id()))
            .is_ok()
    }

    pub(crate) fn destroy_space(&self, sid: SpaceId) {
        self.lock().destroy_space(sid);
    }

    /// Number of pages sharing `ppn`
    pub fn share_count(&self, ppn: PhysPageNum) -> usize {
        self.lock().frames.share_count(ppn)
    }

    /// Current usage and event counters
    pub fn stats(&self) -> VmStats {
        let inner = self.lock();
        VmStats {
            frames_total: inner.memory.total(),
            frames_free: inner.memory.free(),
            frames_resident: inner.frames.len(),
            swap_slots: inner.swap.capacity(),
            swap_used: inner.swap.used(),
            ..inner.stats
        }
    }

    /// Check every mapping against the pages and the frame table
    pub fn audit(&self) -> VmResult<()> {
        self.lock().audit()
    }
}
