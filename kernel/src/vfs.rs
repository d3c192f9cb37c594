pub mod tempfs;

use alloc::sync::Arc;
use thiserror::Error;

pub type INodeNum = u64;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// inode not found
    #[error("not found")]
    NotFound,
    /// write to a file opened read-only
    #[error("file is read-only")]
    ReadOnly,
}

pub type Result<T> = core::result::Result<T, Error>;

/// An open file.
///
/// Each open file has its own position; two handles on the same inode do not
/// disturb each other's reads.
pub trait File: Send + Sync {
    /// inode number of this file
    fn inode(&self) -> INodeNum;
    /// Length of the file in bytes.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Move the position of this handle to `pos` bytes from the start.
    fn seek(&self, pos: usize);
    fn tell(&self) -> usize;
    /// Read from the current position, advancing it.
    ///
    /// Returns the number of bytes read, which is short only at end of file.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    /// Write at `offset` without touching the position.
    ///
    /// Files do not grow: bytes past the end of the file are not written, and
    /// the returned count says how many were.
    fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize>;
    /// Open a new, independent handle on the same inode.
    fn reopen(&self) -> Result<Arc<dyn File>>;
}
