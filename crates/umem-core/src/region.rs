//! Mapped regions and the registry that routes faulting addresses.
//!
//! A region ties a page-aligned virtual address range to one backing
//! store; the registry answers "which store, at which offset" for any
//! address inside a mapping.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use umem_error::{Result, UmemError};
use umem_store::PageStore;
use umem_types::{PageAddr, PageSize, StoreOffset};
use umem_workers::EvictRouter;

/// A contiguous mapped address range backed by one store.
pub struct Region {
    base: PageAddr,
    len_bytes: u64,
    store: Arc<dyn PageStore>,
}

impl Region {
    /// Validate and build a region. The base must be page-aligned, the
    /// length a positive multiple of the page size, and the backing store
    /// large enough to cover the whole range.
    pub fn new(
        base: PageAddr,
        len_bytes: u64,
        page_size: PageSize,
        store: Arc<dyn PageStore>,
    ) -> Result<Self> {
        if !page_size.is_aligned(base.0) {
            return Err(UmemError::Config(format!(
                "region base {base} is not aligned to page size {page_size}"
            )));
        }
        if len_bytes == 0 || !page_size.is_aligned(len_bytes) {
            return Err(UmemError::Config(format!(
                "region length {len_bytes} is not a positive multiple of page size {page_size}"
            )));
        }
        if len_bytes > store.len_bytes() {
            return Err(UmemError::Config(format!(
                "region length {len_bytes} exceeds backing store size {}",
                store.len_bytes()
            )));
        }
        Ok(Self {
            base,
            len_bytes,
            store,
        })
    }

    #[must_use]
    pub fn base(&self) -> PageAddr {
        self.base
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len_bytes
    }

    /// One past the last mapped address.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base.0 + self.len_bytes
    }

    #[must_use]
    pub fn contains(&self, addr: PageAddr) -> bool {
        addr.0 >= self.base.0 && addr.0 < self.end()
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("len_bytes", &self.len_bytes)
            .finish_non_exhaustive()
    }
}

/// Registry of active mappings, keyed by base address.
#[derive(Debug, Default)]
pub struct RegionRegistry {
    regions: Mutex<BTreeMap<u64, Region>>,
}

impl RegionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapping. Overlap with an existing region is a
    /// configuration error.
    pub fn register(&self, region: Region) -> Result<()> {
        let mut regions = self.regions.lock();
        let overlaps = regions
            .values()
            .any(|existing| region.base.0 < existing.end() && existing.base.0 < region.end());
        if overlaps {
            return Err(UmemError::RegionOverlap(region.base));
        }
        info!(
            target: "umem::core",
            event = "region_mapped",
            base = %region.base,
            len_bytes = region.len_bytes
        );
        regions.insert(region.base.0, region);
        Ok(())
    }

    /// Remove the mapping at `base`, returning it if it existed.
    pub fn unregister(&self, base: PageAddr) -> Option<Region> {
        let removed = self.regions.lock().remove(&base.0);
        if removed.is_some() {
            debug!(target: "umem::core", event = "region_unmapped", base = %base);
        }
        removed
    }

    /// Store and offset serving `addr`, if any mapping covers it.
    #[must_use]
    pub fn resolve(&self, addr: PageAddr) -> Option<(Arc<dyn PageStore>, StoreOffset)> {
        let regions = self.regions.lock();
        let (_, region) = regions.range(..=addr.0).next_back()?;
        if !region.contains(addr) {
            return None;
        }
        let offset = addr.offset_from(region.base)?;
        Some((Arc::clone(&region.store), StoreOffset(offset)))
    }

    /// Whether any mapping covers `addr`.
    #[must_use]
    pub fn covers(&self, addr: PageAddr) -> bool {
        self.resolve(addr).is_some()
    }

    /// Length and store of the mapping registered exactly at `base`.
    #[must_use]
    pub fn extent(&self, base: PageAddr) -> Option<(u64, Arc<dyn PageStore>)> {
        let regions = self.regions.lock();
        let region = regions.get(&base.0)?;
        Some((region.len_bytes, Arc::clone(&region.store)))
    }

    /// Number of active mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }

    /// Flush every region's backing store to stable storage.
    pub fn sync_all(&self) -> Result<()> {
        let regions = self.regions.lock();
        for region in regions.values() {
            region.store.sync()?;
        }
        Ok(())
    }
}

impl EvictRouter for RegionRegistry {
    fn route(&self, page_addr: PageAddr) -> Option<(Arc<dyn PageStore>, StoreOffset)> {
        self.resolve(page_addr)
    }
}
