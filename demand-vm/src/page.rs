//! Implementation of [`Page`], a lazily initialized unit of virtual memory
//!
//! A page starts out *uninitialized*: it only carries a [`PageInit`] that
//! describes how to produce its first content. The first claim runs the
//! initializer and turns the page into an [`AnonPage`] or a [`FilePage`],
//! which then know how to move their content between a frame and their
//! backing store.

use crate::{
    address::{PhysPageNum, VirtPageNum},
    anon::AnonPage,
    error::{VmError, VmResult},
    file::{read_at, write_at, File},
    file_page::FilePage,
    frame_allocator::FrameBytes,
    swap::SwapTable,
};
use alloc::sync::Arc;
use core::fmt::{self, Debug, Formatter};

/// Backing-store kind a page ends up with after its first fault
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmType {
    /// Backed by swap once evicted
    Anon,
    /// Backed by a range of a file
    File,
}

/// Deferred initializer run against the zeroed frame at first fault
///
/// It runs with the VM locked and must not call back into the [`crate::Vm`].
pub type Initializer = Arc<dyn Fn(&mut FrameBytes) -> bool + Send + Sync>;

/// A page-sized window into a file: `read_bytes` bytes at `offset`, then `zero_bytes` zeros
#[derive(Clone)]
pub struct FileSlice {
    /// Handle owned by this slice
    pub file: Arc<dyn File>,
    /// Byte offset of the window in the file
    pub offset: usize,
    /// Bytes read from the file
    pub read_bytes: usize,
    /// Bytes zero-filled after the read part
    pub zero_bytes: usize,
    /// Id of the mmap call this slice belongs to, 0 if none
    pub mmap_id: u64,
}

impl FileSlice {
    /// A window not belonging to any mmap region
    pub fn new(file: Arc<dyn File>, offset: usize, read_bytes: usize, zero_bytes: usize) -> Self {
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes,
            mmap_id: 0,
        }
    }

    /// Tag the window with the id of its mmap region
    #[must_use]
    pub fn with_mmap_id(mut self, mmap_id: u64) -> Self {
        self.mmap_id = mmap_id;
        self
    }

    /// Same window over a freshly reopened handle
    #[must_use]
    pub fn reopen(&self) -> Self {
        Self {
            file: self.file.reopen(),
            ..self.clone()
        }
    }

    /// Read the window into `frame`, zero-filling the rest of the page
    pub fn load(&self, frame: &mut FrameBytes) -> VmResult<()> {
        let actual = read_at(self.file.as_ref(), self.offset, &mut frame[..self.read_bytes]);
        if actual != self.read_bytes {
            return Err(VmError::ShortRead {
                expected: self.read_bytes,
                actual,
            });
        }
        frame[self.read_bytes..].fill(0);
        Ok(())
    }

    /// Write the read part of `frame` back to the file
    ///
    /// A short write is an I/O failure and fatal.
    pub fn write_back(&self, frame: &FrameBytes) {
        let written = write_at(self.file.as_ref(), self.offset, &frame[..self.read_bytes]);
        assert_eq!(
            written,
            self.read_bytes,
            "short write-back to inode {} at offset {:#x}",
            self.file.inode_id(),
            self.offset
        );
    }
}

impl Debug for FileSlice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSlice")
            .field("inode", &self.file.inode_id())
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .field("mmap_id", &self.mmap_id)
            .finish()
    }
}

/// How an uninitialized page gets its first content
#[derive(Clone)]
pub enum PageInit {
    /// All zeros
    Zero,
    /// Read from a file window
    File(FileSlice),
    /// Run a custom initializer
    Custom(Initializer),
}

impl PageInit {
    /// Copy of this setup with its own file handle
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::File(slice) => Self::File(slice.reopen()),
            other => other.clone(),
        }
    }

    fn run(&self, frame: &mut FrameBytes) -> VmResult<()> {
        match self {
            Self::Zero => Ok(()),
            Self::File(slice) => slice.load(frame),
            Self::Custom(init) if init(frame) => Ok(()),
            Self::Custom(_) => Err(VmError::InvalidArgument("page initializer failed")),
        }
    }
}

impl Debug for PageInit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => f.write_str("Zero"),
            Self::File(slice) => f.debug_tuple("File").field(slice).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Pending setup of a page that has never been touched
#[derive(Debug)]
pub struct UninitPage {
    ty: VmType,
    init: PageInit,
}

/// Kind-specific state of a page
#[derive(Debug)]
pub enum PageKind {
    /// Not touched yet
    Uninit(UninitPage),
    /// Anonymous memory
    Anon(AnonPage),
    /// File-backed memory
    File(FilePage),
}

/// Where the content of a page lives right now
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Registered but never faulted in
    Uninit,
    /// In the given frame
    Resident(PhysPageNum),
    /// In swap or in the backing file
    Evicted,
}

/// What an eviction left behind in the backing store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Evicted {
    /// Swap slot holding an anonymous page
    pub slot: Option<usize>,
    /// Whether a file page was written back
    pub written_back: bool,
}

/// A page of one address space
#[derive(Debug)]
pub struct Page {
    vpn: VirtPageNum,
    writable: bool,
    frame: Option<PhysPageNum>,
    kind: PageKind,
    /// Eviction group shared with the other owners of the frame it was evicted from
    pub(crate) group: Option<usize>,
}

impl Page {
    /// A page waiting for its first fault
    pub fn new_uninit(
        vpn: VirtPageNum,
        writable: bool,
        ty: VmType,
        init: PageInit,
    ) -> VmResult<Self> {
        if ty == VmType::File && !matches!(init, PageInit::File(_)) {
            return Err(VmError::InvalidArgument(
                "file-backed page needs a file initializer",
            ));
        }
        Ok(Self {
            vpn,
            writable,
            frame: None,
            kind: PageKind::Uninit(UninitPage { ty, init }),
            group: None,
        })
    }

    /// A page sharing the state of `self`, for the child of a fork
    ///
    /// The copy gets its own file handle and no frame.
    pub(crate) fn fork_copy(&self) -> Self {
        let kind = match &self.kind {
            PageKind::Uninit(uninit) => PageKind::Uninit(UninitPage {
                ty: uninit.ty,
                init: uninit.init.duplicate(),
            }),
            PageKind::Anon(_) => PageKind::Anon(AnonPage::new()),
            PageKind::File(file) => PageKind::File(file.reopen()),
        };
        Self {
            vpn: self.vpn,
            writable: self.writable,
            frame: None,
            kind,
            group: None,
        }
    }

    /// Virtual page number of this page
    pub fn vpn(&self) -> VirtPageNum {
        self.vpn
    }

    /// Whether the page may be written
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Frame currently holding the page
    pub fn frame(&self) -> Option<PhysPageNum> {
        self.frame
    }

    /// Kind-specific state
    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    /// Type of the page, looking through a pending initializer
    pub fn vm_type(&self) -> VmType {
        match &self.kind {
            PageKind::Uninit(uninit) => uninit.ty,
            PageKind::Anon(_) => VmType::Anon,
            PageKind::File(_) => VmType::File,
        }
    }

    /// Where the content of the page lives
    pub fn state(&self) -> PageState {
        match (&self.kind, self.frame) {
            (_, Some(ppn)) => PageState::Resident(ppn),
            (PageKind::Uninit(_), None) => PageState::Uninit,
            (_, None) => PageState::Evicted,
        }
    }

    /// Id of the mmap region the page belongs to, 0 if none
    pub fn mmap_id(&self) -> u64 {
        match &self.kind {
            PageKind::Uninit(UninitPage {
                init: PageInit::File(slice),
                ..
            }) => slice.mmap_id,
            PageKind::File(file) => file.slice().mmap_id,
            _ => 0,
        }
    }

    pub(crate) fn set_frame(&mut self, ppn: PhysPageNum) {
        self.frame = Some(ppn);
    }

    /// Bring the page's content into `frame`
    ///
    /// Runs the initializer of an uninitialized page and promotes it to its
    /// final kind; reads swap for anonymous pages and the file for file pages.
    pub(crate) fn swap_in(&mut self, frame: &mut FrameBytes, swap: &mut SwapTable) -> VmResult<()> {
        match &mut self.kind {
            PageKind::Uninit(uninit) => {
                uninit.init.run(frame)?;
                self.promote();
                Ok(())
            }
            PageKind::Anon(anon) => {
                anon.swap_in(swap, frame);
                Ok(())
            }
            PageKind::File(file) => file.swap_in(frame),
        }
    }

    fn promote(&mut self) {
        let PageKind::Uninit(uninit) = core::mem::replace(&mut self.kind, PageKind::Anon(AnonPage::new()))
        else {
            unreachable!("only uninitialized pages are promoted")
        };
        if let (VmType::File, PageInit::File(slice)) = (uninit.ty, uninit.init) {
            self.kind = PageKind::File(FilePage::new(slice));
        }
    }

    /// Move the content of `frame` to the backing store and drop the frame
    ///
    /// `dirty` is the dirty bit over every mapping of the frame.
    pub(crate) fn swap_out(
        &mut self,
        frame: &FrameBytes,
        dirty: bool,
        swap: &mut SwapTable,
    ) -> VmResult<Evicted> {
        let evicted = match &mut self.kind {
            PageKind::Uninit(_) => {
                return Err(VmError::Inconsistent("resident page is uninitialized"))
            }
            PageKind::Anon(anon) => Evicted {
                slot: Some(anon.swap_out(swap, frame)?),
                written_back: false,
            },
            PageKind::File(file) => Evicted {
                slot: None,
                written_back: file.swap_out(frame, dirty),
            },
        };
        self.frame = None;
        Ok(evicted)
    }

    /// Record that the frame of this page was evicted along with `evicted`
    pub(crate) fn mark_evicted(&mut self, evicted: Evicted) {
        self.frame = None;
        if let (PageKind::Anon(anon), Some(slot)) = (&mut self.kind, evicted.slot) {
            anon.set_slot(slot);
        }
    }

    /// Connect the page to a frame another group member just filled
    pub(crate) fn attach(&mut self, ppn: PhysPageNum) {
        if let PageKind::Anon(anon) = &mut self.kind {
            anon.forget_slot();
        }
        self.frame = Some(ppn);
    }

    /// Write `frame` back to the file if this is a file page; returns whether it did
    ///
    /// Panics if the file takes fewer bytes than the page reads from it.
    pub(crate) fn write_back(&self, frame: &FrameBytes) -> bool {
        match &self.kind {
            PageKind::File(file) => {
                file.write_back(frame);
                true
            }
            _ => false,
        }
    }

    /// Release kind-specific resources of a page that owns them alone
    pub(crate) fn destroy(&mut self, swap: &mut SwapTable) {
        match &mut self.kind {
            PageKind::Anon(anon) => anon.destroy(swap),
            PageKind::Uninit(_) | PageKind::File(_) => {}
        }
    }
}
