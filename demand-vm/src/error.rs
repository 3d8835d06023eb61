//! Errors reported by the VM core

use thiserror::Error;

/// Result type of every fallible VM operation
pub type VmResult<T> = Result<T, VmError>;

/// Why a VM operation failed
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A page is already registered at this address
    #[error("a page already exists at {0:#x}")]
    PageExists(usize),
    /// No page is registered at this address
    #[error("no page is mapped at {0:#x}")]
    NotMapped(usize),
    /// Write to a page that is not logically writable
    #[error("write to read-only page at {0:#x}")]
    WriteProtected(usize),
    /// Null, kernel, or otherwise unusable address
    #[error("invalid address {0:#x}")]
    InvalidAddress(usize),
    /// Malformed request from the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// No frame is free and none can be evicted
    #[error("out of physical frames")]
    OutOfFrames,
    /// Every swap slot is occupied
    #[error("swap space exhausted")]
    OutOfSwap,
    /// The backing file returned fewer bytes than the page needs
    #[error("short read from backing file: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// bytes requested
        expected: usize,
        /// bytes returned
        actual: usize,
    },
    /// The hardware table already maps an address that the core believed free
    #[error("address {0:#x} is already mapped in the page table")]
    AlreadyMapped(usize),
    /// An internal invariant does not hold
    #[error("inconsistent vm state: {0}")]
    Inconsistent(&'static str),
}

impl VmError {
    /// Whether the error means the system ran out of a resource
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::OutOfFrames | Self::OutOfSwap)
    }

    /// Whether the error is an access the faulting process was not allowed to make
    pub fn is_protection(&self) -> bool {
        matches!(
            self,
            Self::WriteProtected(_) | Self::InvalidAddress(_) | Self::NotMapped(_)
        )
    }
}
