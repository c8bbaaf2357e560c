#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the read-only `ByteDevice` and `BlockDevice` traits, the
//! file-backed and in-memory device implementations, and `BlockBuf`, the
//! reference-counted one-block buffer every higher layer consumes.

use apfs_error::{ApfsError, Result};
use apfs_types::{BlockSize, Paddr};
use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn check_read_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(u64::try_from(len).map_err(|_| {
            ApfsError::Invalid("read length overflows u64".to_owned())
        })?)
        .ok_or_else(|| ApfsError::Invalid("read range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(ApfsError::Io(IoError::new(
            ErrorKind::UnexpectedEof,
            format!("read out of bounds: offset={offset} len={len} device_len={device_len}"),
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`-style positioned I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not share a seek
/// position, so one handle serves all concurrent readers.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open a block device or image file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device over a shared image, used by tests and tooling.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    image: Arc<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image: Arc::new(image),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.image.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_read_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset)
            .map_err(|_| ApfsError::Invalid("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&self.image[start..start + buf.len()]);
        Ok(())
    }
}

/// Immutable, reference-counted buffer holding exactly one block, tagged
/// with the block number it was read from. The backing allocation is
/// released when the last clone drops.
#[derive(Debug, Clone)]
pub struct BlockBuf {
    block: Paddr,
    bytes: Arc<[u8]>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(block: Paddr, bytes: Vec<u8>) -> Self {
        Self {
            block,
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn block(&self) -> Paddr {
        self.block
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Share the buffer without copying its contents.
    #[must_use]
    pub fn clone_ref(&self) -> Self {
        Self {
            block: self.block,
            bytes: Arc::clone(&self.bytes),
        }
    }
}

/// Block-addressed read interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: Paddr) -> Result<BlockBuf>;

    /// Device block size.
    fn block_size(&self) -> BlockSize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;
}

/// Adapter exposing a `ByteDevice` as fixed-size blocks.
///
/// The block size can be re-set after construction: the mount bootstrap
/// probes block 0 at a small default size, then rebuilds the adapter at
/// the container's advertised size.
#[derive(Debug, Clone)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: BlockSize) -> Result<Self> {
        let len = inner.len_bytes();
        let bs = u64::from(block_size.get());
        if len % bs != 0 {
            return Err(ApfsError::Invalid(format!(
                "device length is not block-aligned: len_bytes={len} block_size={block_size}"
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / bs,
        })
    }

    /// Rebuild the adapter with a different block size over the same device.
    pub fn with_block_size(self, block_size: BlockSize) -> Result<Self> {
        Self::new(self.inner, block_size)
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: Paddr) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(ApfsError::Io(IoError::new(
                ErrorKind::UnexpectedEof,
                format!(
                    "block out of range: block={} block_count={}",
                    block.0, self.block_count
                ),
            )));
        }

        let offset = block
            .to_byte_offset(self.block_size)
            .ok_or_else(|| ApfsError::Invalid(format!("block offset overflow: block={block}")))?;
        let mut bytes = vec![0_u8; self.block_size.get() as usize];
        self.inner.read_exact_at(offset, &mut bytes)?;
        trace!(target: "apfs::block", block = block.0, "read_block");
        Ok(BlockBuf::new(block, bytes))
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, block: Paddr) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn block_size(&self) -> BlockSize {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }
}
