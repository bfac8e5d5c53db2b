#![forbid(unsafe_code)]
//! Backing-store abstraction: the external source/sink of page bytes.
//!
//! A [`PageStore`] serves blocking page-granular reads and writes at fixed
//! byte offsets. The engine performs all store I/O from worker threads,
//! outside the buffer lock.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use umem_error::{Result, UmemError};
use umem_types::StoreOffset;

/// Byte source/sink for page contents (pread/pwrite semantics).
pub trait PageStore: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `dst.len()` bytes from `offset` into `dst`.
    fn read_page(&self, offset: StoreOffset, dst: &mut [u8]) -> Result<()>;

    /// Write all bytes in `src` at `offset`.
    fn write_page(&self, offset: StoreOffset, src: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_bounds(offset: StoreOffset, len: usize, store_len: u64) -> Result<()> {
    let end = offset
        .checked_add(u64::try_from(len).map_err(|_| UmemError::OutOfBounds {
            offset: offset.0,
            len,
            store_len,
        })?)
        .ok_or(UmemError::OutOfBounds {
            offset: offset.0,
            len,
            store_len,
        })?;
    if end.0 > store_len {
        return Err(UmemError::OutOfBounds {
            offset: offset.0,
            len,
            store_len,
        });
    }
    Ok(())
}

/// File-backed page store using `pread`/`pwrite` style positional I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FilePageStore {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FilePageStore {
    /// Open a backing file, read-write if possible, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        trace!(
            target: "umem::store",
            event = "file_store_open",
            len_bytes = len,
            writable
        );
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl PageStore for FilePageStore {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_page(&self, offset: StoreOffset, dst: &mut [u8]) -> Result<()> {
        check_bounds(offset, dst.len(), self.len)?;
        self.file.read_exact_at(dst, offset.0)?;
        trace!(
            target: "umem::store",
            event = "store_read",
            offset = offset.0,
            len = dst.len()
        );
        Ok(())
    }

    fn write_page(&self, offset: StoreOffset, src: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(UmemError::ReadOnly);
        }
        check_bounds(offset, src.len(), self.len)?;
        self.file.write_all_at(src, offset.0)?;
        trace!(
            target: "umem::store",
            event = "store_write",
            offset = offset.0,
            len = src.len()
        );
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory page store backed by a shared byte vector.
///
/// Clones share the same storage, so a test can hand one clone to the
/// engine and keep another for inspection.
#[derive(Debug, Clone)]
pub struct MemoryPageStore {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryPageStore {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    /// Build a store seeded with `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents, for assertions.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl PageStore for MemoryPageStore {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_page(&self, offset: StoreOffset, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_bounds(offset, dst.len(), bytes.len() as u64)?;
        let start = offset.0 as usize;
        dst.copy_from_slice(&bytes[start..start + dst.len()]);
        Ok(())
    }

    fn write_page(&self, offset: StoreOffset, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_bounds(offset, src.len(), bytes.len() as u64)?;
        let start = offset.0 as usize;
        bytes[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
