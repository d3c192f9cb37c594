use crate::block::block_error::BlockError;
use alloc::{boxed::Box, string::String, sync::Arc};
use core::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};
use kidneyos_shared::sizes::SECTOR_SIZE;
use log::info;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Types of blocks
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by non-KidneyOS operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers
///
/// Drivers do their own synchronization; `Block` may be shared between
/// threads and calls may arrive concurrently.
pub trait BlockOp: Send + Sync {
    /// Read a block sector
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

impl<T: BlockOp> BlockOp for Arc<T> {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        (**self).read(sector, buf)
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        (**self).write(sector, buf)
    }
}

/// A block device
///
/// **Note:** Once blocks are made they are immutable
pub struct Block {
    /// Tha name of the block device
    block_name: String,

    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,

    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: AtomicU32,
    /// The write count
    write_count: AtomicU32,
}

impl Block {
    /// Create a block device with the given `name`. The block device's `size` in sectors and its
    /// `block_type` must be provided, as well as the `driver` to access the block.
    pub fn new(
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Self {
        info!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name, block_type, block_size,
        );

        Self {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            log::error!(
                "{}: Invalid sector {} (block size: {})",
                self.block_name,
                sector,
                self.block_size
            );
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        if self.block_type == BlockType::Foreign {
            return Err(BlockError::Foreign);
        }

        self.driver.write(sector, buf)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name,
            self.block_type,
            self.block_size,
            self.read_count(),
            self.write_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram_disk::RamDisk;
    use alloc::vec;

    #[test]
    fn test_read_write_counts() {
        let block = Block::new(BlockType::Scratch, "scratch", 4, Box::new(RamDisk::new(4)));
        let data = vec![0xAB; BLOCK_SECTOR_SIZE];
        block.write(2, &data).unwrap();

        let mut buf = vec![0; BLOCK_SECTOR_SIZE];
        block.read(2, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(block.read_count(), 1);
        assert_eq!(block.write_count(), 1);
    }

    #[test]
    fn test_bounds_and_buffers() {
        let block = Block::new(BlockType::Raw, "raw", 2, Box::new(RamDisk::new(2)));
        let mut buf = vec![0; BLOCK_SECTOR_SIZE];
        assert_eq!(block.read(2, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(block.read(0, &mut buf[..10]), Err(BlockError::BufferInvalid));
        assert_eq!(block.read_count(), 0);
    }

    #[test]
    fn test_foreign_is_read_only() {
        let block = Block::new(BlockType::Foreign, "foreign", 1, Box::new(RamDisk::new(1)));
        let buf = vec![0; BLOCK_SECTOR_SIZE];
        assert_eq!(block.write(0, &buf), Err(BlockError::Foreign));
    }
}
