use demand_vm::File;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_INODE: AtomicU32 = AtomicU32::new(1);

/// A handle on a host file with its own offset
///
/// Handles made by [`File::reopen`] share the host file but not the offset.
pub struct HostFile {
    inner: Arc<Mutex<fs::File>>,
    inode: u32,
    offset: Mutex<usize>,
}

impl HostFile {
    pub fn new(file: fs::File) -> Arc<dyn File> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(file)),
            inode: NEXT_INODE.fetch_add(1, Ordering::Relaxed),
            offset: Mutex::new(0),
        })
    }
}

impl File for HostFile {
    fn read(&self, buf: &mut [u8]) -> usize {
        let mut file = self.inner.lock().unwrap();
        let mut offset = self.offset.lock().unwrap();
        file.seek(SeekFrom::Start(*offset as u64))
            .expect("Error when seeking!");
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]).expect("Error when reading!") {
                0 => break,
                n => total += n,
            }
        }
        *offset += total;
        total
    }

    fn write(&self, buf: &[u8]) -> usize {
        let mut file = self.inner.lock().unwrap();
        let mut offset = self.offset.lock().unwrap();
        file.seek(SeekFrom::Start(*offset as u64))
            .expect("Error when seeking!");
        file.write_all(buf).expect("Error when writing!");
        *offset += buf.len();
        buf.len()
    }

    fn offset(&self) -> usize {
        *self.offset.lock().unwrap()
    }

    fn set_offset(&self, offset: usize) {
        *self.offset.lock().unwrap() = offset;
    }

    fn file_size(&self) -> usize {
        let file = self.inner.lock().unwrap();
        let len = file.metadata().expect("Error when reading metadata!").len();
        usize::try_from(len).expect("File too large!")
    }

    fn inode_id(&self) -> u32 {
        self.inode
    }

    fn reopen(&self) -> Arc<dyn File> {
        Arc::new(Self {
            inner: self.inner.clone(),
            inode: self.inode,
            offset: Mutex::new(0),
        })
    }
}
