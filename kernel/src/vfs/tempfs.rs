use crate::sync::mutex::Mutex;
use crate::vfs::{Error, File, INodeNum, Result};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::{
    cmp::min,
    sync::atomic::{AtomicUsize, Ordering},
};
use log::trace;

struct TempINode {
    data: Mutex<Vec<u8>>,
    bytes_written: AtomicUsize,
}

/// in-memory filesystem
pub struct TempFs {
    inodes: Mutex<BTreeMap<INodeNum, Arc<TempINode>>>,
}

const ROOT_INO: INodeNum = 1;

impl Default for TempFs {
    fn default() -> Self {
        Self::new()
    }
}

impl TempFs {
    pub fn new() -> TempFs {
        TempFs {
            inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create a regular file holding `data`.
    pub fn create(&self, data: &[u8]) -> INodeNum {
        let mut inodes = self.inodes.lock();
        let inode = inodes
            .last_key_value()
            .map_or(ROOT_INO + 1, |(&last, _)| last + 1);
        inodes.insert(
            inode,
            Arc::new(TempINode {
                data: Mutex::new(data.to_vec()),
                bytes_written: AtomicUsize::new(0),
            }),
        );
        trace!("tempfs: create {} length {}", inode, data.len());
        inode
    }

    pub fn open(&self, inode: INodeNum) -> Result<Arc<dyn File>> {
        self.open_file(inode, true)
    }

    pub fn open_read_only(&self, inode: INodeNum) -> Result<Arc<dyn File>> {
        self.open_file(inode, false)
    }

    fn open_file(&self, inode: INodeNum, writable: bool) -> Result<Arc<dyn File>> {
        let node = self.inodes.lock().get(&inode).cloned().ok_or(Error::NotFound)?;
        Ok(Arc::new(TempFile {
            inode,
            node,
            pos: AtomicUsize::new(0),
            writable,
        }))
    }

    /// Snapshot of a file's contents.
    pub fn contents(&self, inode: INodeNum) -> Result<Vec<u8>> {
        let inodes = self.inodes.lock();
        let node = inodes.get(&inode).ok_or(Error::NotFound)?;
        let data = node.data.lock().clone();
        Ok(data)
    }

    /// Total number of bytes ever written to a file.
    pub fn bytes_written(&self, inode: INodeNum) -> Result<usize> {
        let inodes = self.inodes.lock();
        let node = inodes.get(&inode).ok_or(Error::NotFound)?;
        Ok(node.bytes_written.load(Ordering::Relaxed))
    }
}

struct TempFile {
    inode: INodeNum,
    node: Arc<TempINode>,
    pos: AtomicUsize,
    writable: bool,
}

impl File for TempFile {
    fn inode(&self) -> INodeNum {
        self.inode
    }

    fn len(&self) -> usize {
        self.node.data.lock().len()
    }

    fn seek(&self, pos: usize) {
        self.pos.store(pos, Ordering::Relaxed);
    }

    fn tell(&self) -> usize {
        self.pos.load(Ordering::Relaxed)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let data = self.node.data.lock();
        let offset = self.pos.load(Ordering::Relaxed);
        trace!(
            "tempfs: read from {} @ offset {} length {}",
            self.inode,
            offset,
            buf.len()
        );
        if offset >= data.len() {
            // can't read any data
            return Ok(0);
        }
        let read_len = min(buf.len(), data.len() - offset);
        buf[..read_len].copy_from_slice(&data[offset..offset + read_len]);
        self.pos.store(offset + read_len, Ordering::Relaxed);
        Ok(read_len)
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let mut data = self.node.data.lock();
        trace!(
            "tempfs: write to {} @ offset {} length {}",
            self.inode,
            offset,
            buf.len()
        );
        if offset >= data.len() {
            return Ok(0);
        }
        let write_len = min(buf.len(), data.len() - offset);
        data[offset..offset + write_len].copy_from_slice(&buf[..write_len]);
        self.node
            .bytes_written
            .fetch_add(write_len, Ordering::Relaxed);
        Ok(write_len)
    }

    fn reopen(&self) -> Result<Arc<dyn File>> {
        Ok(Arc::new(TempFile {
            inode: self.inode,
            node: self.node.clone(),
            pos: AtomicUsize::new(0),
            writable: self.writable,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    // one regular file, read back in pieces
    fn simple_write_read() {
        let fs = TempFs::new();
        let inode = fs.create(b"hello");
        let file = fs.open(inode).unwrap();
        assert_eq!(file.write_at(b"J", 0).unwrap(), 1);

        let mut buf = [0; 6];
        assert_eq!(file.read(&mut buf[..]).unwrap(), 5);
        assert_eq!(&buf[..], b"Jello\0");
        assert_eq!(file.read(&mut buf[..]).unwrap(), 0);

        file.seek(3);
        assert_eq!(file.read(&mut buf[..1]).unwrap(), 1);
        assert_eq!(buf[0], b'l');
    }

    #[test]
    // writes never extend the file
    fn write_past_end() {
        let fs = TempFs::new();
        let inode = fs.create(b"abc");
        let file = fs.open(inode).unwrap();
        assert_eq!(file.write_at(b"xyz", 1).unwrap(), 2);
        assert_eq!(file.write_at(b"xyz", 3).unwrap(), 0);
        assert_eq!(fs.contents(inode).unwrap(), b"axy");
        assert_eq!(fs.bytes_written(inode).unwrap(), 2);
    }

    #[test]
    // reopened handles share data but not position
    fn reopen_is_independent() {
        let fs = TempFs::new();
        let inode = fs.create(b"0123456789");
        let first = fs.open(inode).unwrap();
        let second = first.reopen().unwrap();
        first.seek(5);
        let mut buf = [0; 2];
        second.read(&mut buf).unwrap();
        assert_eq!(&buf, b"01");
        assert_eq!(first.tell(), 5);
        assert_eq!(second.inode(), inode);
    }

    #[test]
    fn read_only_rejects_writes() {
        let fs = TempFs::new();
        let inode = fs.create(b"abc");
        let file = fs.open_read_only(inode).unwrap();
        assert_eq!(file.write_at(b"x", 0), Err(Error::ReadOnly));
        assert!(matches!(fs.open(99), Err(Error::NotFound)));
    }
}
