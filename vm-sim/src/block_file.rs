use demand_vm::{BlockDevice, SECTOR_SIZE};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

/// Swap device backed by a host image file
pub struct BlockFile(pub Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))
            .expect("Error when seeking!");
        file.read_exact(buf).expect("Not a complete sector!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))
            .expect("Error when seeking!");
        file.write_all(buf).expect("Not a complete sector!");
    }

    fn num_blocks(&self) -> usize {
        let file = self.0.lock().unwrap();
        let len = file.metadata().expect("Error when reading metadata!").len();
        usize::try_from(len).expect("Image too large!") / SECTOR_SIZE
    }
}
