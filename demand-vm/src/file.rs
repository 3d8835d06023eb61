//! The file abstraction the VM core reads pages from and writes pages back to

use alloc::sync::Arc;

/// An open file handle with its own offset
pub trait File: Send + Sync {
    /// Read into `buf` at the current offset, advancing it; returns bytes read
    fn read(&self, buf: &mut [u8]) -> usize;
    /// Write `buf` at the current offset, advancing it; returns bytes written
    fn write(&self, buf: &[u8]) -> usize;
    /// Current offset of this handle
    fn offset(&self) -> usize;
    /// Move the offset of this handle
    fn set_offset(&self, offset: usize);
    /// Length of the file in bytes
    fn file_size(&self) -> usize;
    /// Identity of the underlying inode, shared by every handle on it
    fn inode_id(&self) -> u32;
    /// Open another handle on the same inode with an independent offset
    fn reopen(&self) -> Arc<dyn File>;
}

/// Seek `file` to `offset` and read into `buf`
pub fn read_at(file: &dyn File, offset: usize, buf: &mut [u8]) -> usize {
    file.set_offset(offset);
    file.read(buf)
}

/// Seek `file` to `offset` and write `buf`
pub fn write_at(file: &dyn File, offset: usize, buf: &[u8]) -> usize {
    file.set_offset(offset);
    file.write(buf)
}
