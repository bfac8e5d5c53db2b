#![forbid(unsafe_code)]
//! Engine assembly for umem.
//!
//! An [`Engine`] owns one [`Buffer`], the three work queues, the fill and
//! evict worker pools, and the eviction manager, and routes faults from
//! mapped regions into them. The embedding application (or the platform
//! trap layer) calls [`Engine::handle_fault`] for every access to a page
//! that is not yet populated; [`Engine::read`] and [`Engine::write`] wrap
//! that call pattern for direct page access.

mod config;
mod region;

pub use config::{
    ENV_BUFSIZE, ENV_EVICT_WORKERS, ENV_FILL_WORKERS, ENV_HIGH_WATER, ENV_LOW_WATER,
    ENV_PAGESIZE, ENV_WRITE_RETRIES, EngineConfig,
};
pub use region::{Region, RegionRegistry};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};
use umem_buffer::{Admission, Buffer, BufferConfig, BufferSnapshot};
use umem_error::{Result, UmemError};
use umem_store::PageStore;
use umem_types::{PageAddr, PageSize, StoreOffset};
use umem_workers::{
    EvictWorkerPool, EvictionManager, FillCompletion, FillWorkerPool, WorkItem, WorkQueue,
    WorkerStats, write_back_with_retry,
};

/// The access that triggered a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct FaultStats {
    read_faults: AtomicU64,
    write_faults: AtomicU64,
    spurious_faults: AtomicU64,
    wp_promotions: AtomicU64,
}

/// Frozen view of all engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub read_faults: u64,
    pub write_faults: u64,
    pub spurious_faults: u64,
    pub wp_promotions: u64,
    pub pages_filled: u64,
    pub fill_errors: u64,
    pub evict_victims: u64,
    pub dirty_evicts: u64,
    pub write_retries: u64,
}

/// A running paging engine.
///
/// Shut down with [`shutdown`](Self::shutdown) after quiescing the mapped
/// regions; dropping the engine performs the same sequence as a fallback.
pub struct Engine {
    config: EngineConfig,
    buffer: Arc<Buffer>,
    registry: Arc<RegionRegistry>,
    fill_queue: Arc<WorkQueue<WorkItem>>,
    manager_queue: Arc<WorkQueue<WorkItem>>,
    fill_pool: Option<FillWorkerPool>,
    evict_pool: Option<EvictWorkerPool>,
    manager: Option<EvictionManager>,
    worker_stats: Arc<WorkerStats>,
    fault_stats: FaultStats,
    stopped: bool,
}

impl Engine {
    /// Validate `config`, build the buffer, and spawn the worker threads.
    pub fn start(config: EngineConfig) -> Result<Self> {
        let config = config.validate()?;
        let buffer = Arc::new(Buffer::new(BufferConfig {
            capacity: config.capacity_pages,
            page_size: config.page_size,
            low_water_percentage: config.low_water_percentage,
            high_water_percentage: config.high_water_percentage,
        })?);
        let registry = Arc::new(RegionRegistry::new());
        let fill_queue = Arc::new(WorkQueue::new());
        let evict_queue = Arc::new(WorkQueue::new());
        let manager_queue = Arc::new(WorkQueue::new());
        let worker_stats = Arc::new(WorkerStats::default());

        let fill_pool = FillWorkerPool::spawn(
            config.fill_workers,
            Arc::clone(&fill_queue),
            Arc::clone(&buffer),
            Arc::clone(&worker_stats),
        )?;
        let evict_pool = EvictWorkerPool::spawn(
            config.evict_workers,
            Arc::clone(&evict_queue),
            Arc::clone(&buffer),
            Arc::clone(&worker_stats),
            config.write_retry_limit,
        )?;
        let manager = EvictionManager::spawn(
            Arc::clone(&manager_queue),
            Arc::clone(&evict_queue),
            Arc::clone(&buffer),
            Arc::clone(&registry) as Arc<dyn umem_workers::EvictRouter>,
        )?;

        info!(
            target: "umem::core",
            event = "engine_started",
            capacity_pages = config.capacity_pages,
            page_size = config.page_size.get(),
            fill_workers = config.fill_workers,
            evict_workers = config.evict_workers
        );

        Ok(Self {
            config,
            buffer,
            registry,
            fill_queue,
            manager_queue,
            fill_pool: Some(fill_pool),
            evict_pool: Some(evict_pool),
            manager: Some(manager),
            worker_stats,
            fault_stats: FaultStats::default(),
            stopped: false,
        })
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.config.page_size
    }

    /// Map `len_bytes` of `store` at virtual base `base`.
    pub fn map_region(
        &self,
        base: PageAddr,
        len_bytes: u64,
        store: Arc<dyn PageStore>,
    ) -> Result<()> {
        let region = Region::new(base, len_bytes, self.config.page_size, store)?;
        self.registry.register(region)
    }

    /// Quiesce the mapping at `base`, then drop it.
    pub fn unmap_region(&self, base: PageAddr) -> Result<()> {
        self.flush_region(base)?;
        self.registry
            .unregister(base)
            .map(|_| ())
            .ok_or(UmemError::Unmapped(base))
    }

    /// Service one fault: short-circuit if the page is resident, otherwise
    /// admit it, hand a fill to the worker pool, and block until the read
    /// completes. Write faults leave the page dirty either way.
    ///
    /// Crossing the high watermark on admission nudges the eviction
    /// manager to start draining.
    pub fn handle_fault(&self, addr: PageAddr, kind: FaultKind) -> Result<()> {
        let page = self.config.page_size.page_begin(addr);
        let (store, offset) = self
            .registry
            .resolve(page)
            .ok_or(UmemError::Unmapped(page))?;

        loop {
            match self.buffer.admit(page) {
                None => return Err(UmemError::ShuttingDown),
                Some(Admission::AlreadyPresent(_)) => match kind {
                    FaultKind::Read => {
                        self.fault_stats.spurious_faults.fetch_add(1, Ordering::Relaxed);
                        trace!(
                            target: "umem::core",
                            event = "spurious_fault",
                            page = %page
                        );
                        return Ok(());
                    }
                    FaultKind::Write => match self.buffer.promote_for_write(page) {
                        Some(true) => {
                            self.fault_stats.wp_promotions.fetch_add(1, Ordering::Relaxed);
                            return Ok(());
                        }
                        Some(false) => {
                            self.fault_stats.spurious_faults.fetch_add(1, Ordering::Relaxed);
                            return Ok(());
                        }
                        // The page left residency between the lookup and
                        // the promotion; fault it back in.
                        None => continue,
                    },
                },
                Some(Admission::Admitted(slot)) => {
                    match kind {
                        FaultKind::Read => {
                            self.fault_stats.read_faults.fetch_add(1, Ordering::Relaxed);
                        }
                        FaultKind::Write => {
                            self.fault_stats.write_faults.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    let completion = Arc::new(FillCompletion::new());
                    self.fill_queue.push(WorkItem::Fill {
                        slot,
                        store,
                        offset,
                        completion: Arc::clone(&completion),
                        mark_dirty: kind == FaultKind::Write,
                    });
                    if self.buffer.high_water_reached() {
                        self.manager_queue.push(WorkItem::EvictNeeded);
                    }
                    return completion.wait();
                }
            }
        }
    }

    /// Whether the page covering `addr` is currently resident.
    #[must_use]
    pub fn is_resident(&self, addr: PageAddr) -> bool {
        let page = self.config.page_size.page_begin(addr);
        self.buffer.lookup(page).is_some()
    }

    /// Copy `dst.len()` bytes out of the mapped range starting at `addr`,
    /// faulting pages in as needed. Spans page boundaries.
    pub fn read(&self, addr: PageAddr, dst: &mut [u8]) -> Result<()> {
        let len = dst.len();
        let mut pos = 0_usize;
        self.walk_pages(addr, len, FaultKind::Read, |frame, range| {
            let n = range.len();
            dst[pos..pos + n].copy_from_slice(&frame[range]);
            pos += n;
        })
    }

    /// Copy `src` into the mapped range starting at `addr`, faulting pages
    /// in as needed and leaving them dirty. Spans page boundaries.
    pub fn write(&self, addr: PageAddr, src: &[u8]) -> Result<()> {
        let mut pos = 0_usize;
        self.walk_pages(addr, src.len(), FaultKind::Write, |frame, range| {
            let n = range.len();
            frame[range].copy_from_slice(&src[pos..pos + n]);
            pos += n;
        })
    }

    fn walk_pages(
        &self,
        addr: PageAddr,
        len: usize,
        kind: FaultKind,
        mut visit: impl FnMut(&mut [u8], std::ops::Range<usize>),
    ) -> Result<()> {
        let page_size = self.config.page_size.as_usize();
        let mut cursor = addr;
        let mut remaining = len;
        while remaining > 0 {
            let page = self.config.page_size.page_begin(cursor);
            let in_page = (cursor.0 - page.0) as usize;
            let chunk = remaining.min(page_size - in_page);
            loop {
                self.handle_fault(cursor, kind)?;
                let visited = self
                    .buffer
                    .with_present_frame(page, |frame| visit(frame, in_page..in_page + chunk));
                if visited.is_some() {
                    break;
                }
                // Evicted between the fault and the frame access; fault
                // the page back in.
            }
            cursor = cursor
                .checked_add(chunk as u64)
                .ok_or(UmemError::Unmapped(cursor))?;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Quiesce one mapping: evict every page the region at `base` covers,
    /// writing dirty ones back, then sync that region's store. Pages of
    /// the region that are mid-fill or mid-eviction are waited out; other
    /// regions' pages stay resident.
    pub fn flush_region(&self, base: PageAddr) -> Result<()> {
        let (len_bytes, store) = self
            .registry
            .extent(base)
            .ok_or(UmemError::Unmapped(base))?;
        debug!(
            target: "umem::core",
            event = "region_flush_start",
            base = %base,
            len_bytes
        );
        let page_size = u64::from(self.config.page_size.get());
        let mut flushed = 0_u64;
        let mut offset = 0_u64;
        while offset < len_bytes {
            let page = PageAddr(base.0 + offset);
            loop {
                if let Some(slot) = self.buffer.take_present(page) {
                    if self.buffer.is_dirty(slot) {
                        self.worker_stats.dirty_evicts.fetch_add(1, Ordering::Relaxed);
                        let frame = self.buffer.frame(slot).lock();
                        write_back_with_retry(
                            store.as_ref(),
                            page,
                            StoreOffset(offset),
                            &frame,
                            self.config.write_retry_limit,
                            &self.worker_stats,
                        );
                    }
                    self.worker_stats.evict_victims.fetch_add(1, Ordering::Relaxed);
                    self.buffer.release(slot);
                    flushed += 1;
                    break;
                }
                if !self.buffer.is_admitted(page) {
                    break;
                }
                // Mid-fill or mid-eviction; let the owning worker finish
                // its transition, then re-check.
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            offset += page_size;
        }
        store.sync()?;
        debug!(
            target: "umem::core",
            event = "region_flush_complete",
            base = %base,
            flushed
        );
        Ok(())
    }

    /// Quiesce the buffer: evict every resident page in admission order,
    /// writing dirty ones back, then sync every backing store. Blocks on
    /// in-flight fills rather than skipping them.
    pub fn flush_all(&self) -> Result<()> {
        debug!(
            target: "umem::core",
            event = "flush_start",
            busy = self.buffer.busy_count()
        );
        let mut flushed = 0_u64;
        while let Some(slot) = self.buffer.acquire_oldest_present() {
            let page = self.buffer.page_addr(slot);
            if self.buffer.is_dirty(slot) {
                let Some((store, offset)) = self.registry.resolve(page) else {
                    panic!("flushing page {page} with no covering region");
                };
                self.worker_stats.dirty_evicts.fetch_add(1, Ordering::Relaxed);
                let frame = self.buffer.frame(slot).lock();
                write_back_with_retry(
                    store.as_ref(),
                    page,
                    offset,
                    &frame,
                    self.config.write_retry_limit,
                    &self.worker_stats,
                );
            }
            self.worker_stats.evict_victims.fetch_add(1, Ordering::Relaxed);
            self.buffer.release(slot);
            flushed += 1;
        }
        self.registry.sync_all()?;
        debug!(target: "umem::core", event = "flush_complete", flushed);
        Ok(())
    }

    /// Flush everything, then stop and join every worker thread.
    ///
    /// Idempotent; also invoked from `Drop` as a fallback.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        info!(target: "umem::core", event = "engine_shutdown_start");
        self.flush_all()?;
        self.buffer.interrupt_waiters();
        if let Some(manager) = self.manager.take() {
            manager.shutdown();
        }
        if let Some(pool) = self.fill_pool.take() {
            pool.shutdown();
        }
        if let Some(pool) = self.evict_pool.take() {
            pool.shutdown();
        }
        // Anything the manager selected after the flush has been drained
        // by the evict pool shutdown above.
        info!(
            target: "umem::core",
            event = "engine_shutdown_complete",
            snapshot = %self.buffer.snapshot()
        );
        Ok(())
    }

    /// Point-in-time dump of the buffer's occupancy.
    #[must_use]
    pub fn buffer_snapshot(&self) -> BufferSnapshot {
        self.buffer.snapshot()
    }

    /// Merge the fault-side and worker-side counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let workers = self.worker_stats.snapshot();
        StatsSnapshot {
            read_faults: self.fault_stats.read_faults.load(Ordering::Relaxed),
            write_faults: self.fault_stats.write_faults.load(Ordering::Relaxed),
            spurious_faults: self.fault_stats.spurious_faults.load(Ordering::Relaxed),
            wp_promotions: self.fault_stats.wp_promotions.load(Ordering::Relaxed),
            pages_filled: workers.pages_filled,
            fill_errors: workers.fill_errors,
            evict_victims: workers.evict_victims,
            dirty_evicts: workers.dirty_evicts,
            write_retries: workers.write_retries,
        }
    }

    /// Zero every counter.
    pub fn reset_stats(&self) {
        self.fault_stats.read_faults.store(0, Ordering::Relaxed);
        self.fault_stats.write_faults.store(0, Ordering::Relaxed);
        self.fault_stats.spurious_faults.store(0, Ordering::Relaxed);
        self.fault_stats.wp_promotions.store(0, Ordering::Relaxed);
        self.worker_stats.reset();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("buffer", &self.buffer)
            .field("regions", &self.registry.len())
            .finish_non_exhaustive()
    }
}
