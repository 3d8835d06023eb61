use core::any::Any;

/// Trait for block devices
/// which reads and writes data in the unit of sectors
pub trait BlockDevice: Send + Sync + Any {
    /// Read data from a sector to buffer
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    /// Write data from buffer to a sector
    fn write_block(&self, block_id: usize, buf: &[u8]);
    /// Number of sectors on the device
    fn num_blocks(&self) -> usize;
}
