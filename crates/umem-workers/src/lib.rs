#![forbid(unsafe_code)]
//! Worker pools that move pages between the buffer and its backing
//! stores.
//!
//! Three roles, each fed by its own [`WorkQueue`]:
//! - **fill workers** read pages in and complete the faults that asked;
//! - the **eviction manager** watches the watermarks and selects victims
//!   in strict admission order;
//! - **evict workers** write dirty victims back and return their slots.
//!
//! All store I/O happens on these threads, outside the buffer lock.

mod queue;

pub use queue::{FillCompletion, WorkQueue};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};
use umem_buffer::Buffer;
use umem_error::Result;
use umem_store::PageStore;
use umem_types::{PageAddr, SlotId, StoreOffset};

/// A unit of work for one of the pools.
pub enum WorkItem {
    /// Read a page in from its backing store, then mark it present and
    /// complete the originating fault.
    Fill {
        slot: SlotId,
        store: Arc<dyn PageStore>,
        offset: StoreOffset,
        completion: Arc<FillCompletion>,
        /// The originating fault was a write: the page enters residency
        /// already dirty.
        mark_dirty: bool,
    },
    /// Write back (if dirty) and release an already-selected victim.
    Evict {
        slot: SlotId,
        store: Arc<dyn PageStore>,
        offset: StoreOffset,
    },
    /// Token asking the eviction manager to drain to the low watermark.
    EvictNeeded,
}

impl WorkItem {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fill { .. } => "FILL",
            Self::Evict { .. } => "EVICT",
            Self::EvictNeeded => "EVICT_NEEDED",
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fill { slot, offset, .. } => f
                .debug_struct("Fill")
                .field("slot", slot)
                .field("offset", offset)
                .finish_non_exhaustive(),
            Self::Evict { slot, offset, .. } => f
                .debug_struct("Evict")
                .field("slot", slot)
                .field("offset", offset)
                .finish_non_exhaustive(),
            Self::EvictNeeded => f.write_str("EvictNeeded"),
        }
    }
}

/// Resolves an evicting page's address to its backing store and offset.
///
/// Implemented by the region registry; the eviction manager consults it
/// when handing victims to the write-back workers.
pub trait EvictRouter: Send + Sync {
    fn route(&self, page_addr: PageAddr) -> Option<(Arc<dyn PageStore>, StoreOffset)>;
}

/// Counters shared by all worker threads.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub pages_filled: AtomicU64,
    pub fill_errors: AtomicU64,
    pub evict_victims: AtomicU64,
    pub dirty_evicts: AtomicU64,
    pub write_retries: AtomicU64,
}

impl WorkerStats {
    #[must_use]
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            pages_filled: self.pages_filled.load(Ordering::Relaxed),
            fill_errors: self.fill_errors.load(Ordering::Relaxed),
            evict_victims: self.evict_victims.load(Ordering::Relaxed),
            dirty_evicts: self.dirty_evicts.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.pages_filled.store(0, Ordering::Relaxed);
        self.fill_errors.store(0, Ordering::Relaxed);
        self.evict_victims.store(0, Ordering::Relaxed);
        self.dirty_evicts.store(0, Ordering::Relaxed);
        self.write_retries.store(0, Ordering::Relaxed);
    }
}

/// Frozen view of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub pages_filled: u64,
    pub fill_errors: u64,
    pub evict_victims: u64,
    pub dirty_evicts: u64,
    pub write_retries: u64,
}

/// Write a dirty page back, retrying transient store errors.
///
/// # Panics
///
/// Panics after `retry_limit` failed retries (or on the first
/// non-transient error): a dirty page can never be silently dropped.
pub fn write_back_with_retry(
    store: &dyn PageStore,
    page: PageAddr,
    offset: StoreOffset,
    bytes: &[u8],
    retry_limit: u32,
    stats: &WorkerStats,
) {
    let mut attempt = 0_u32;
    loop {
        match store.write_page(offset, bytes) {
            Ok(()) => return,
            Err(err) if err.is_transient() && attempt < retry_limit => {
                attempt += 1;
                stats.write_retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "umem::workers",
                    event = "evict_write_retry",
                    page = %page,
                    attempt,
                    error = %err
                );
            }
            Err(err) => {
                error!(
                    target: "umem::workers",
                    event = "evict_write_failed",
                    page = %page,
                    attempts = attempt + 1,
                    error = %err
                );
                panic!(
                    "dirty page {page} write-back failed after {} attempts: {err}",
                    attempt + 1
                );
            }
        }
    }
}

fn join_all(name: &str, handles: &mut Vec<JoinHandle<()>>) {
    for handle in handles.drain(..) {
        if handle.join().is_err() {
            error!(target: "umem::workers", event = "worker_panicked", pool = name);
        }
    }
}

// ---------------------------------------------------------------------------
// Fill workers
// ---------------------------------------------------------------------------

/// Pool of threads servicing `Fill` items.
pub struct FillWorkerPool {
    queue: Arc<WorkQueue<WorkItem>>,
    handles: Vec<JoinHandle<()>>,
}

impl FillWorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<WorkQueue<WorkItem>>,
        buffer: Arc<Buffer>,
        stats: Arc<WorkerStats>,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let queue = Arc::clone(&queue);
            let buffer = Arc::clone(&buffer);
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("umem-fill-{worker_id}"))
                .spawn(move || fill_worker_loop(worker_id, &queue, &buffer, &stats))?;
            handles.push(handle);
        }
        Ok(Self { queue, handles })
    }

    /// Request shutdown and block until every worker exits. Items already
    /// queued are drained first.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.queue.shutdown();
        join_all("fill", &mut self.handles);
    }
}

impl Drop for FillWorkerPool {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn fill_worker_loop(
    worker_id: usize,
    queue: &WorkQueue<WorkItem>,
    buffer: &Buffer,
    stats: &WorkerStats,
) {
    while let Some(item) = queue.pop() {
        match item {
            WorkItem::Fill {
                slot,
                store,
                offset,
                completion,
                mark_dirty,
            } => {
                let result = {
                    let mut frame = buffer.frame(slot).lock();
                    store.read_page(offset, &mut frame)
                };
                match result {
                    Ok(()) => {
                        if mark_dirty {
                            buffer.mark_dirty(slot);
                        }
                        buffer.mark_present(slot);
                        stats.pages_filled.fetch_add(1, Ordering::Relaxed);
                        trace!(
                            target: "umem::workers",
                            event = "page_filled",
                            worker_id,
                            slot = slot.0,
                            offset = offset.0,
                            dirty = mark_dirty
                        );
                        completion.complete(Ok(()));
                    }
                    Err(err) => {
                        stats.fill_errors.fetch_add(1, Ordering::Relaxed);
                        error!(
                            target: "umem::workers",
                            event = "fill_read_failed",
                            worker_id,
                            slot = slot.0,
                            offset = offset.0,
                            error = %err
                        );
                        buffer.abort_fill(slot);
                        completion.complete(Err(err));
                    }
                }
            }
            other => warn!(
                target: "umem::workers",
                event = "unexpected_work_item",
                pool = "fill",
                kind = other.kind()
            ),
        }
    }
    debug!(target: "umem::workers", event = "fill_worker_exit", worker_id);
}

// ---------------------------------------------------------------------------
// Evict workers
// ---------------------------------------------------------------------------

/// Pool of threads servicing `Evict` items: write back if dirty, then
/// return the slot to the free list.
pub struct EvictWorkerPool {
    queue: Arc<WorkQueue<WorkItem>>,
    handles: Vec<JoinHandle<()>>,
}

impl EvictWorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<WorkQueue<WorkItem>>,
        buffer: Arc<Buffer>,
        stats: Arc<WorkerStats>,
        write_retry_limit: u32,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let queue = Arc::clone(&queue);
            let buffer = Arc::clone(&buffer);
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("umem-evict-{worker_id}"))
                .spawn(move || {
                    evict_worker_loop(worker_id, &queue, &buffer, &stats, write_retry_limit);
                })?;
            handles.push(handle);
        }
        Ok(Self { queue, handles })
    }

    /// Request shutdown and block until every worker exits. Evictions
    /// already queued complete first, so no selected victim is stranded.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.queue.shutdown();
        join_all("evict", &mut self.handles);
    }
}

impl Drop for EvictWorkerPool {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn evict_worker_loop(
    worker_id: usize,
    queue: &WorkQueue<WorkItem>,
    buffer: &Buffer,
    stats: &WorkerStats,
    write_retry_limit: u32,
) {
    while let Some(item) = queue.pop() {
        match item {
            WorkItem::Evict {
                slot,
                store,
                offset,
            } => {
                stats.evict_victims.fetch_add(1, Ordering::Relaxed);
                let page = buffer.page_addr(slot);
                if buffer.is_dirty(slot) {
                    stats.dirty_evicts.fetch_add(1, Ordering::Relaxed);
                    let frame = buffer.frame(slot).lock();
                    write_back_with_retry(
                        store.as_ref(),
                        page,
                        offset,
                        &frame,
                        write_retry_limit,
                        stats,
                    );
                }
                buffer.release(slot);
                trace!(
                    target: "umem::workers",
                    event = "page_evicted",
                    worker_id,
                    page = %page,
                    slot = slot.0
                );
            }
            other => warn!(
                target: "umem::workers",
                event = "unexpected_work_item",
                pool = "evict",
                kind = other.kind()
            ),
        }
    }
    debug!(target: "umem::workers", event = "evict_worker_exit", worker_id);
}

// ---------------------------------------------------------------------------
// Eviction manager
// ---------------------------------------------------------------------------

/// Single consumer that turns watermark pressure into `Evict` items.
///
/// On every `EvictNeeded` token it pulls victims off the buffer's FIFO —
/// blocking on a still-filling head rather than skipping it — until the
/// low watermark is reached, handing each victim to the evict pool.
pub struct EvictionManager {
    queue: Arc<WorkQueue<WorkItem>>,
    handle: Option<JoinHandle<()>>,
}

impl EvictionManager {
    pub fn spawn(
        queue: Arc<WorkQueue<WorkItem>>,
        evict_queue: Arc<WorkQueue<WorkItem>>,
        buffer: Arc<Buffer>,
        router: Arc<dyn EvictRouter>,
    ) -> Result<Self> {
        let manager_queue = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name("umem-evict-mgr".to_owned())
            .spawn(move || {
                manager_loop(&manager_queue, &evict_queue, &buffer, router.as_ref());
            })?;
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    /// Request shutdown and block until the manager exits.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.queue.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(target: "umem::workers", event = "worker_panicked", pool = "evict-mgr");
            }
        }
    }
}

impl Drop for EvictionManager {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn manager_loop(
    queue: &WorkQueue<WorkItem>,
    evict_queue: &WorkQueue<WorkItem>,
    buffer: &Buffer,
    router: &dyn EvictRouter,
) {
    while let Some(item) = queue.pop() {
        match item {
            WorkItem::EvictNeeded => {
                debug!(
                    target: "umem::workers",
                    event = "evict_drain_start",
                    busy = buffer.busy_count(),
                    low_water = buffer.low_water()
                );
                while !buffer.low_water_reached() {
                    let Some(slot) = buffer.acquire_oldest_present() else {
                        break;
                    };
                    let page = buffer.page_addr(slot);
                    let Some((store, offset)) = router.route(page) else {
                        panic!("evicting page {page} with no covering region");
                    };
                    evict_queue.push(WorkItem::Evict {
                        slot,
                        store,
                        offset,
                    });
                }
                debug!(
                    target: "umem::workers",
                    event = "evict_drain_stop",
                    busy = buffer.busy_count()
                );
            }
            other => warn!(
                target: "umem::workers",
                event = "unexpected_work_item",
                pool = "evict-mgr",
                kind = other.kind()
            ),
        }
    }
    debug!(target: "umem::workers", event = "evict_manager_exit");
}
