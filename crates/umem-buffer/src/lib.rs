#![forbid(unsafe_code)]
//! The bounded page buffer at the heart of umem.
//!
//! A [`Buffer`] owns a fixed pool of descriptor slots, each backed by one
//! page frame. It tracks which virtual pages are resident, admits new
//! pages for fill, selects eviction victims in strict admission order, and
//! blocks fault handlers when the pool is saturated.
//!
//! Concurrency model:
//! - One coarse mutex protects all bookkeeping (free list, FIFO busy
//!   queue, present index, counters). Critical sections are O(1) queue and
//!   map operations.
//! - Two condition variables bound to that mutex: `cv_free` gates fillers
//!   waiting for a free slot, `cv_oldest_ready` gates the eviction
//!   consumer waiting for the FIFO head to finish filling.
//! - Page frames live outside the state mutex, one lock per slot, so fill
//!   and write-back I/O never hold the buffer lock. Frame access rights
//!   follow descriptor ownership: only the worker driving the slot's
//!   current transition touches its frame.

mod descriptor;

pub use descriptor::{PageDescriptor, PageState};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, trace};
use umem_error::{Result, UmemError};
use umem_types::{PageAddr, PageSize, SlotId};

/// Construction parameters for a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum number of resident pages. Fixed for the buffer's lifetime.
    pub capacity: usize,
    /// Size of every page frame.
    pub page_size: PageSize,
    /// Integer percentage of capacity the eviction drain stops at.
    /// 0 or 100 mean "drain only when the buffer is entirely full".
    pub low_water_percentage: u32,
    /// Integer percentage of capacity at which background eviction starts.
    /// Must be >= `low_water_percentage`. 0 or 100 mean "start only when
    /// the buffer is entirely full".
    pub high_water_percentage: u32,
}

impl BufferConfig {
    pub fn validate(self) -> Result<Self> {
        if self.capacity == 0 {
            return Err(UmemError::Config("buffer capacity must be > 0".to_owned()));
        }
        if self.low_water_percentage > 100 || self.high_water_percentage > 100 {
            return Err(UmemError::Config(format!(
                "watermark percentages must be in [0, 100]: low={} high={}",
                self.low_water_percentage, self.high_water_percentage
            )));
        }
        if self.low_water_percentage > self.high_water_percentage {
            return Err(UmemError::Config(format!(
                "low watermark {}% exceeds high watermark {}%",
                self.low_water_percentage, self.high_water_percentage
            )));
        }
        Ok(self)
    }
}

/// Watermark arithmetic: 0 and 100 both yield `capacity` exactly,
/// everything else is `floor(capacity * percentage / 100)` through a
/// float multiply.
fn apply_int_percentage(percentage: u32, capacity: usize) -> usize {
    if percentage == 0 || percentage == 100 {
        capacity
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let value = ((f64::from(percentage) / 100.0) * capacity as f64) as usize;
        value
    }
}

/// Outcome of the fault handler's single-lock lookup-or-admit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The page was already resident; no fill needed.
    AlreadyPresent(SlotId),
    /// A slot was taken for the page and transitioned FREE→FILLING.
    Admitted(SlotId),
}

struct BufferState {
    slots: Vec<PageDescriptor>,
    free: Vec<SlotId>,
    busy: VecDeque<SlotId>,
    present: HashMap<PageAddr, SlotId>,
    fill_waiting: usize,
    last_pd_waiting: Option<SlotId>,
    oldest_waiters: usize,
    stopping: bool,
}

impl BufferState {
    /// Re-point the shared waiter sentinel at the current queue head
    /// after a pop or a removal changed it, and wake parked eviction
    /// consumers that can now make progress.
    ///
    /// The sentinel is shared by every parked consumer: a waking thread
    /// must never clear it while others are still parked, or
    /// `mark_present`'s conditional signal would stop matching and the
    /// remaining consumers would sleep forever. Whoever mutates the head
    /// owns the retarget instead.
    fn retarget_evict_waiters(&mut self, cv_oldest_ready: &Condvar) {
        if self.oldest_waiters == 0 {
            self.last_pd_waiting = None;
            return;
        }
        match self.busy.front() {
            Some(&next) => {
                self.last_pd_waiting = Some(next);
                if self.slots[next.0].state == PageState::Present {
                    cv_oldest_ready.notify_one();
                }
            }
            None => {
                // Nothing left to wait for; every parked consumer gets to
                // observe the empty queue and return.
                self.last_pd_waiting = None;
                cv_oldest_ready.notify_all();
            }
        }
    }
}

/// Bounded pool of page descriptors with strict FIFO eviction order.
pub struct Buffer {
    inner: Mutex<BufferState>,
    cv_free: Condvar,
    cv_oldest_ready: Condvar,
    frames: Vec<Mutex<Box<[u8]>>>,
    capacity: usize,
    page_size: PageSize,
    low_water: usize,
    high_water: usize,
}

impl Buffer {
    /// Build a buffer with every slot FREE.
    pub fn new(config: BufferConfig) -> Result<Self> {
        let config = config.validate()?;
        let capacity = config.capacity;
        let low_water = apply_int_percentage(config.low_water_percentage, capacity);
        let high_water = apply_int_percentage(config.high_water_percentage, capacity);

        let slots = (0..capacity).map(|_| PageDescriptor::new_free()).collect();
        let free = (0..capacity).map(SlotId).collect();
        let frames = (0..capacity)
            .map(|_| Mutex::new(vec![0_u8; config.page_size.as_usize()].into_boxed_slice()))
            .collect();

        debug!(
            target: "umem::buffer",
            event = "buffer_created",
            capacity,
            page_size = config.page_size.get(),
            low_water,
            high_water
        );

        Ok(Self {
            inner: Mutex::new(BufferState {
                slots,
                free,
                busy: VecDeque::with_capacity(capacity),
                present: HashMap::with_capacity(capacity),
                fill_waiting: 0,
                last_pd_waiting: None,
                oldest_waiters: 0,
                stopping: false,
            }),
            cv_free: Condvar::new(),
            cv_oldest_ready: Condvar::new(),
            frames,
            capacity,
            page_size: config.page_size,
            low_water,
            high_water,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[must_use]
    pub fn low_water(&self) -> usize {
        self.low_water
    }

    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Descriptor for `page_addr` iff the page is in the present index.
    #[must_use]
    pub fn lookup(&self, page_addr: PageAddr) -> Option<SlotId> {
        self.inner.lock().present.get(&page_addr).copied()
    }

    /// Single-lock lookup-or-admit used by fault handlers, so a duplicate
    /// fault can never race past the present-index probe.
    ///
    /// Returns `None` when the buffer is stopping.
    pub fn admit(&self, page_addr: PageAddr) -> Option<Admission> {
        let mut state = self.inner.lock();
        if state.stopping {
            return None;
        }
        if let Some(&slot) = state.present.get(&page_addr) {
            return Some(Admission::AlreadyPresent(slot));
        }
        self.acquire_for_fill_locked(&mut state, page_addr)
            .map(Admission::Admitted)
    }

    /// Take a free slot for `page_addr`, blocking while the free list is
    /// empty. The slot comes back FILLING with a clean dirty flag, already
    /// appended to the busy queue.
    ///
    /// Exactly one caller obtains a given slot between two FREE episodes.
    /// Returns `None` when the buffer is stopping; saturation itself is not
    /// an error, only a wait.
    pub fn acquire_for_fill(&self, page_addr: PageAddr) -> Option<SlotId> {
        let mut state = self.inner.lock();
        debug_assert!(
            !state.present.contains_key(&page_addr),
            "acquire_for_fill for already-present page {page_addr}"
        );
        self.acquire_for_fill_locked(&mut state, page_addr)
    }

    fn acquire_for_fill_locked(
        &self,
        state: &mut MutexGuard<'_, BufferState>,
        page_addr: PageAddr,
    ) -> Option<SlotId> {
        state.fill_waiting += 1;
        while state.free.is_empty() && !state.stopping {
            trace!(
                target: "umem::buffer",
                event = "fill_wait",
                page = %page_addr,
                waiters = state.fill_waiting
            );
            self.cv_free.wait(state);
        }
        state.fill_waiting -= 1;
        if state.stopping {
            return None;
        }

        let slot = state.free.pop().expect("free list is non-empty after wait");
        let pd = &mut state.slots[slot.0];
        pd.page_addr = page_addr;
        pd.dirty = false;
        pd.set_state(PageState::Filling);
        state.busy.push_back(slot);

        trace!(
            target: "umem::buffer",
            event = "page_admitted",
            page = %page_addr,
            slot = slot.0,
            busy = state.busy.len()
        );
        Some(slot)
    }

    /// Complete a fill or a write-fault promotion: FILLING|UPDATING →
    /// PRESENT, insert into the present index, and wake the eviction
    /// consumer iff it is blocked on exactly this slot.
    ///
    /// The wake is conditional so completions of non-head pages never cause
    /// wasted wakeups.
    pub fn mark_present(&self, slot: SlotId) {
        let mut state = self.inner.lock();
        let addr = state.slots[slot.0].page_addr;
        state.slots[slot.0].set_state(PageState::Present);
        state.present.insert(addr, slot);
        trace!(
            target: "umem::buffer",
            event = "page_present",
            page = %addr,
            slot = slot.0,
            present = state.present.len()
        );
        if state.last_pd_waiting == Some(slot) {
            self.cv_oldest_ready.notify_one();
        }
    }

    /// Writer-fault promotion of a resident read-only page:
    /// PRESENT → UPDATING. The caller owns the slot until it calls
    /// [`mark_present`](Self::mark_present) again.
    pub fn begin_update(&self, slot: SlotId) {
        let mut state = self.inner.lock();
        state.slots[slot.0].set_state(PageState::Updating);
    }

    /// Single-lock writer-fault promotion for a resident page, the
    /// present-path counterpart of [`admit`](Self::admit): runs the
    /// PRESENT → UPDATING → PRESENT round trip and sets the dirty flag
    /// without letting an eviction slip in between.
    ///
    /// Returns `Some(true)` if the page was promoted, `Some(false)` if it
    /// was already dirty, and `None` if it is absent or mid-transition
    /// (the caller re-faults).
    pub fn promote_for_write(&self, page_addr: PageAddr) -> Option<bool> {
        let mut state = self.inner.lock();
        let &slot = state.present.get(&page_addr)?;
        let pd = &mut state.slots[slot.0];
        if pd.state != PageState::Present {
            return None;
        }
        if pd.dirty {
            return Some(false);
        }
        pd.set_state(PageState::Updating);
        pd.dirty = true;
        pd.set_state(PageState::Present);
        trace!(
            target: "umem::buffer",
            event = "page_promoted_dirty",
            page = %page_addr,
            slot = slot.0
        );
        Some(true)
    }

    /// Set the dirty flag. Only the thread owning the slot's current
    /// transition may call this; a FREE slot has no owner.
    pub fn mark_dirty(&self, slot: SlotId) {
        let mut state = self.inner.lock();
        let pd = &mut state.slots[slot.0];
        assert!(
            pd.state != PageState::Free,
            "dirty flag set on FREE descriptor slot {slot}"
        );
        pd.dirty = true;
    }

    #[must_use]
    pub fn is_dirty(&self, slot: SlotId) -> bool {
        self.inner.lock().slots[slot.0].dirty
    }

    /// Current tenant address of a slot.
    #[must_use]
    pub fn page_addr(&self, slot: SlotId) -> PageAddr {
        self.inner.lock().slots[slot.0].page_addr
    }

    #[must_use]
    pub fn state_of(&self, slot: SlotId) -> PageState {
        self.inner.lock().slots[slot.0].state
    }

    /// Select the eviction victim: the oldest admitted, not-yet-evicted
    /// page. Returns `None` if nothing is resident (or the buffer is
    /// stopping); otherwise blocks until the FIFO head has reached
    /// PRESENT, then pops it and transitions it PRESENT → LEAVING.
    ///
    /// The consumer never skips ahead of a still-filling head; eviction
    /// order is exactly admission order.
    pub fn acquire_oldest_present(&self) -> Option<SlotId> {
        let mut state = self.inner.lock();
        loop {
            let Some(&head) = state.busy.front() else {
                return None;
            };
            if state.slots[head.0].state == PageState::Present {
                state.busy.pop_front();
                state.slots[head.0].set_state(PageState::Leaving);
                let addr = state.slots[head.0].page_addr;
                state.retarget_evict_waiters(&self.cv_oldest_ready);
                trace!(
                    target: "umem::buffer",
                    event = "evict_selected",
                    page = %addr,
                    slot = head.0,
                    busy = state.busy.len()
                );
                return Some(head);
            }
            if state.stopping {
                return None;
            }
            state.last_pd_waiting = Some(head);
            state.oldest_waiters += 1;
            trace!(
                target: "umem::buffer",
                event = "evict_wait_oldest",
                slot = head.0,
                head_state = %state.slots[head.0].state
            );
            self.cv_oldest_ready.wait(&mut state);
            state.oldest_waiters -= 1;
            // Re-read the head after every wake: an aborted fill or a
            // concurrent consumer's pop may have changed it. The sentinel
            // is cleared only when no consumer is left waiting; the head
            // mutators re-point it for everyone else.
            if state.oldest_waiters == 0 {
                state.last_pd_waiting = None;
            }
        }
    }

    /// Return a slot to the free list: LEAVING → FREE. Removes the page
    /// from the present index and wakes one blocked filler, if any.
    pub fn release(&self, slot: SlotId) {
        let mut state = self.inner.lock();
        let addr = state.slots[slot.0].page_addr;
        state.slots[slot.0].set_state(PageState::Free);
        state.slots[slot.0].dirty = false;
        state.present.remove(&addr);
        state.free.push(slot);
        trace!(
            target: "umem::buffer",
            event = "page_released",
            page = %addr,
            slot = slot.0,
            free = state.free.len()
        );
        if state.fill_waiting > 0 {
            self.cv_free.notify_one();
        }
    }

    /// Recovery path for a failed fill: roll the slot back FILLING → FREE,
    /// bypassing PRESENT, and remove it from the busy queue.
    ///
    /// If the eviction consumer is blocked on this slot it is woken so it
    /// can re-examine the new queue head.
    pub fn abort_fill(&self, slot: SlotId) {
        let mut state = self.inner.lock();
        let addr = state.slots[slot.0].page_addr;
        state.slots[slot.0].rollback_fill();
        let position = state
            .busy
            .iter()
            .position(|&s| s == slot)
            .expect("aborted fill slot is on the busy queue");
        state.busy.remove(position);
        state.free.push(slot);
        state.retarget_evict_waiters(&self.cv_oldest_ready);
        debug!(
            target: "umem::buffer",
            event = "fill_aborted",
            page = %addr,
            slot = slot.0
        );
        if state.fill_waiting > 0 {
            self.cv_free.notify_one();
        }
    }

    /// Pull a specific PRESENT page out of the FIFO for targeted
    /// eviction, as used by per-region quiesce: PRESENT → LEAVING, with
    /// the slot removed from the busy queue wherever it sits. The caller
    /// owns the slot and must [`release`](Self::release) it.
    ///
    /// Returns `None` for pages that are absent or mid-transition.
    pub fn take_present(&self, page_addr: PageAddr) -> Option<SlotId> {
        let mut state = self.inner.lock();
        let &slot = state.present.get(&page_addr)?;
        if state.slots[slot.0].state != PageState::Present {
            return None;
        }
        let position = state
            .busy
            .iter()
            .position(|&s| s == slot)
            .expect("present page is on the busy queue");
        state.busy.remove(position);
        state.slots[slot.0].set_state(PageState::Leaving);
        state.retarget_evict_waiters(&self.cv_oldest_ready);
        trace!(
            target: "umem::buffer",
            event = "page_taken",
            page = %page_addr,
            slot = slot.0,
            busy = state.busy.len()
        );
        Some(slot)
    }

    /// Whether `page_addr` currently occupies any slot, in whatever
    /// state. Used by per-region quiesce to tell an absent page from one
    /// that is mid-fill or mid-eviction. A LEAVING page sits in the
    /// present index but not the busy queue, so both are consulted.
    #[must_use]
    pub fn is_admitted(&self, page_addr: PageAddr) -> bool {
        let state = self.inner.lock();
        state.present.contains_key(&page_addr)
            || state
                .busy
                .iter()
                .any(|&slot| state.slots[slot.0].page_addr == page_addr)
    }

    /// Whether background eviction should start.
    #[must_use]
    pub fn high_water_reached(&self) -> bool {
        self.inner.lock().busy.len() >= self.high_water
    }

    /// Whether background eviction may stop draining.
    #[must_use]
    pub fn low_water_reached(&self) -> bool {
        self.inner.lock().busy.len() <= self.low_water
    }

    /// Per-slot page frame. Workers lock a frame only while they own the
    /// slot's current transition, and never while holding the buffer lock.
    #[must_use]
    pub fn frame(&self, slot: SlotId) -> &Mutex<Box<[u8]>> {
        &self.frames[slot.0]
    }

    /// Run `f` over the frame of a PRESENT page, holding the buffer lock
    /// so the page cannot start leaving mid-access. Returns `None` if the
    /// page is absent or in a transient state.
    pub fn with_present_frame<R>(
        &self,
        page_addr: PageAddr,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        let state = self.inner.lock();
        let &slot = state.present.get(&page_addr)?;
        if state.slots[slot.0].state != PageState::Present {
            return None;
        }
        // A PRESENT slot has no transition owner, so its frame lock is
        // uncontended here and cannot invert against a worker waiting for
        // the buffer lock.
        let mut frame = self.frames[slot.0].lock();
        Some(f(&mut frame))
    }

    /// Mark the buffer stopping and wake every blocked waiter. Blocking
    /// operations observe the flag and return `None`.
    pub fn interrupt_waiters(&self) {
        let mut state = self.inner.lock();
        state.stopping = true;
        drop(state);
        self.cv_free.notify_all();
        self.cv_oldest_ready.notify_all();
        debug!(target: "umem::buffer", event = "buffer_interrupted");
    }

    #[must_use]
    pub fn present_count(&self) -> usize {
        self.inner.lock().present.len()
    }

    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.inner.lock().busy.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    #[must_use]
    pub fn fill_waiting_count(&self) -> usize {
        self.inner.lock().fill_waiting
    }

    /// Point-in-time dump of the buffer's bookkeeping, for debugging and
    /// tests.
    #[must_use]
    pub fn snapshot(&self) -> BufferSnapshot {
        let state = self.inner.lock();
        BufferSnapshot {
            capacity: self.capacity,
            fill_waiting: state.fill_waiting,
            present: state.present.len(),
            free: state.free.len(),
            busy: state.busy.len(),
            low_water: self.low_water,
            high_water: self.high_water,
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity)
            .field("page_size", &self.page_size)
            .field("low_water", &self.low_water)
            .field("high_water", &self.high_water)
            .finish_non_exhaustive()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let state = self.inner.get_mut();
        assert!(
            state.present.is_empty(),
            "buffer dropped with {} pages still present; quiesce the region first",
            state.present.len()
        );
    }
}

/// Frozen view of buffer occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub capacity: usize,
    pub fill_waiting: usize,
    pub present: usize,
    pub free: usize,
    pub busy: usize,
    pub low_water: usize,
    pub high_water: usize,
}

impl fmt::Display for BufferSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ capacity: {}, fill_waiting: {}, present: {}, free: {}, busy: {}, low_water: {}, high_water: {} }}",
            self.capacity,
            self.fill_waiting,
            self.present,
            self.free,
            self.busy,
            self.low_water,
            self.high_water
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn make_buffer(capacity: usize, low: u32, high: u32) -> Buffer {
        Buffer::new(BufferConfig {
            capacity,
            page_size: PageSize::new(4096).unwrap(),
            low_water_percentage: low,
            high_water_percentage: high,
        })
        .expect("buffer config is valid")
    }

    fn page(n: u64) -> PageAddr {
        PageAddr(n * 4096)
    }

    fn assert_pool_invariants(buffer: &Buffer) {
        let snap = buffer.snapshot();
        assert_eq!(
            snap.free + snap.busy,
            snap.capacity,
            "free + busy must equal capacity at rest: {snap}"
        );
        assert!(snap.present <= snap.busy);
    }

    // -- watermark arithmetic --

    #[test]
    fn watermark_percentages_floor_through_float() {
        assert_eq!(apply_int_percentage(75, 100), 75);
        assert_eq!(apply_int_percentage(100, 100), 100);
        assert_eq!(apply_int_percentage(33, 10), 3);
        assert_eq!(apply_int_percentage(0, 10), 10);
        assert_eq!(apply_int_percentage(50, 4), 2);
        assert_eq!(apply_int_percentage(1, 50), 0);
    }

    #[test]
    fn config_rejects_bad_parameters() {
        let base = BufferConfig {
            capacity: 8,
            page_size: PageSize::new(4096).unwrap(),
            low_water_percentage: 50,
            high_water_percentage: 90,
        };
        assert!(BufferConfig { capacity: 0, ..base }.validate().is_err());
        assert!(
            BufferConfig {
                high_water_percentage: 101,
                ..base
            }
            .validate()
            .is_err()
        );
        assert!(
            BufferConfig {
                low_water_percentage: 95,
                ..base
            }
            .validate()
            .is_err()
        );
        assert!(base.validate().is_ok());
    }

    // -- admission and lookup --

    #[test]
    fn fresh_buffer_is_entirely_free() {
        let buffer = make_buffer(4, 50, 100);
        let snap = buffer.snapshot();
        assert_eq!(snap.free, 4);
        assert_eq!(snap.busy, 0);
        assert_eq!(snap.present, 0);
        assert_eq!(snap.fill_waiting, 0);
    }

    #[test]
    fn lookup_misses_until_present() {
        let buffer = make_buffer(4, 50, 100);
        assert!(buffer.lookup(page(1)).is_none());

        let slot = buffer.acquire_for_fill(page(1)).unwrap();
        assert!(buffer.lookup(page(1)).is_none(), "FILLING is not present");
        assert_eq!(buffer.state_of(slot), PageState::Filling);
        assert!(!buffer.is_dirty(slot));

        buffer.mark_present(slot);
        assert_eq!(buffer.lookup(page(1)), Some(slot));
        assert_eq!(buffer.lookup(page(1)), Some(slot), "lookup is idempotent");

        // Restore for teardown.
        let victim = buffer.acquire_oldest_present().unwrap();
        buffer.release(victim);
    }

    #[test]
    fn admit_short_circuits_duplicate_faults() {
        let buffer = make_buffer(4, 50, 100);
        let slot = match buffer.admit(page(7)).unwrap() {
            Admission::Admitted(slot) => slot,
            Admission::AlreadyPresent(_) => panic!("page cannot be present yet"),
        };
        buffer.mark_present(slot);

        match buffer.admit(page(7)).unwrap() {
            Admission::AlreadyPresent(found) => assert_eq!(found, slot),
            Admission::Admitted(_) => panic!("duplicate admission for present page"),
        }

        let victim = buffer.acquire_oldest_present().unwrap();
        buffer.release(victim);
    }

    #[test]
    fn acquire_release_round_trip_restores_the_pool() {
        let buffer = make_buffer(3, 50, 100);
        let before = buffer.snapshot();

        let slot = buffer.acquire_for_fill(page(9)).unwrap();
        buffer.mark_present(slot);
        assert_pool_invariants(&buffer);

        let victim = buffer.acquire_oldest_present().unwrap();
        assert_eq!(victim, slot);
        buffer.release(victim);

        assert_eq!(buffer.snapshot(), before);
        assert!(buffer.lookup(page(9)).is_none());
    }

    #[test]
    fn eviction_order_equals_admission_order() {
        let buffer = make_buffer(4, 0, 100);
        let slots: Vec<SlotId> = (0..4)
            .map(|n| buffer.acquire_for_fill(page(n)).unwrap())
            .collect();
        for &slot in &slots {
            buffer.mark_present(slot);
        }
        assert_pool_invariants(&buffer);

        for &expected in &slots {
            let victim = buffer.acquire_oldest_present().unwrap();
            assert_eq!(victim, expected);
            buffer.release(victim);
        }
        assert!(buffer.acquire_oldest_present().is_none());
    }

    #[test]
    fn update_promotion_round_trip_keeps_page_present() {
        let buffer = make_buffer(2, 50, 100);
        let slot = buffer.acquire_for_fill(page(3)).unwrap();
        buffer.mark_present(slot);

        buffer.begin_update(slot);
        assert_eq!(buffer.state_of(slot), PageState::Updating);
        assert_eq!(
            buffer.lookup(page(3)),
            Some(slot),
            "updating pages stay in the present index"
        );
        buffer.mark_dirty(slot);
        buffer.mark_present(slot);

        assert!(buffer.is_dirty(slot));
        let victim = buffer.acquire_oldest_present().unwrap();
        buffer.release(victim);
    }

    #[test]
    fn promote_for_write_dirties_exactly_once() {
        let buffer = make_buffer(2, 50, 100);
        assert!(buffer.promote_for_write(page(4)).is_none());

        let slot = buffer.acquire_for_fill(page(4)).unwrap();
        assert!(
            buffer.promote_for_write(page(4)).is_none(),
            "a FILLING page is not promotable"
        );
        buffer.mark_present(slot);

        assert_eq!(buffer.promote_for_write(page(4)), Some(true));
        assert!(buffer.is_dirty(slot));
        assert_eq!(buffer.promote_for_write(page(4)), Some(false));
        assert_eq!(buffer.state_of(slot), PageState::Present);

        let victim = buffer.acquire_oldest_present().unwrap();
        buffer.release(victim);
    }

    #[test]
    fn watermark_predicates_follow_busy_len() {
        let buffer = make_buffer(4, 50, 75);
        assert_eq!(buffer.high_water(), 3);
        assert_eq!(buffer.low_water(), 2);
        assert!(buffer.low_water_reached());
        assert!(!buffer.high_water_reached());

        let slots: Vec<SlotId> = (0..3)
            .map(|n| buffer.acquire_for_fill(page(n)).unwrap())
            .collect();
        assert!(buffer.high_water_reached());
        assert!(!buffer.low_water_reached());

        for &slot in &slots {
            buffer.mark_present(slot);
        }
        while !buffer.low_water_reached() {
            let victim = buffer.acquire_oldest_present().unwrap();
            buffer.release(victim);
        }
        assert!(buffer.low_water_reached());

        // Drain the rest for teardown.
        while let Some(victim) = buffer.acquire_oldest_present() {
            buffer.release(victim);
        }
    }

    // -- blocking behavior --

    #[test]
    fn acquire_for_fill_blocks_at_capacity_until_release() {
        let buffer = Arc::new(make_buffer(1, 0, 100));
        let first = buffer.acquire_for_fill(page(0)).unwrap();
        buffer.mark_present(first);

        let unblocked = Arc::new(AtomicBool::new(false));
        let waiter = {
            let buffer = Arc::clone(&buffer);
            let unblocked = Arc::clone(&unblocked);
            thread::spawn(move || {
                let slot = buffer.acquire_for_fill(page(1)).unwrap();
                unblocked.store(true, Ordering::SeqCst);
                assert_eq!(buffer.page_addr(slot), page(1));
                assert!(!buffer.is_dirty(slot));
                buffer.mark_present(slot);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(
            !unblocked.load(Ordering::SeqCst),
            "second fill must block while the pool is saturated"
        );
        assert_eq!(buffer.fill_waiting_count(), 1);

        let victim = buffer.acquire_oldest_present().unwrap();
        buffer.release(victim);

        waiter.join().expect("no panic");
        assert!(unblocked.load(Ordering::SeqCst));

        let victim = buffer.acquire_oldest_present().unwrap();
        buffer.release(victim);
    }

    #[test]
    fn oldest_ready_signal_is_conditional_on_the_head() {
        let buffer = Arc::new(make_buffer(3, 0, 100));
        let s0 = buffer.acquire_for_fill(page(0)).unwrap();
        let s1 = buffer.acquire_for_fill(page(1)).unwrap();
        let s2 = buffer.acquire_for_fill(page(2)).unwrap();

        let got_head = Arc::new(AtomicBool::new(false));
        let evictor = {
            let buffer = Arc::clone(&buffer);
            let got_head = Arc::clone(&got_head);
            thread::spawn(move || {
                let victim = buffer.acquire_oldest_present().unwrap();
                got_head.store(true, Ordering::SeqCst);
                victim
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!got_head.load(Ordering::SeqCst));

        buffer.mark_present(s2);
        thread::sleep(Duration::from_millis(30));
        assert!(
            !got_head.load(Ordering::SeqCst),
            "completing a non-head page must not wake the evictor"
        );

        buffer.mark_present(s1);
        thread::sleep(Duration::from_millis(30));
        assert!(
            !got_head.load(Ordering::SeqCst),
            "completing the second-oldest page must not wake the evictor"
        );

        buffer.mark_present(s0);
        let victim = evictor.join().expect("no panic");
        assert_eq!(victim, s0);
        buffer.release(victim);

        while let Some(victim) = buffer.acquire_oldest_present() {
            buffer.release(victim);
        }
    }

    #[test]
    fn eviction_blocks_on_filling_head_despite_later_completions() {
        // Admit four pages, complete them out of order (2, 0, 3, 1), and
        // check the first two evictions still come out as 0 then 1.
        let buffer = Arc::new(make_buffer(4, 50, 100));
        let slots: Vec<SlotId> = (0..4)
            .map(|n| buffer.acquire_for_fill(page(n)).unwrap())
            .collect();

        let evictor = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let first = buffer.acquire_oldest_present().unwrap();
                let second = buffer.acquire_oldest_present().unwrap();
                (first, second)
            })
        };

        for &index in &[2_usize, 0, 3, 1] {
            thread::sleep(Duration::from_millis(10));
            buffer.mark_present(slots[index]);
        }

        let (first, second) = evictor.join().expect("no panic");
        assert_eq!(buffer.page_addr(first), page(0));
        assert_eq!(buffer.page_addr(second), page(1));
        buffer.release(first);
        buffer.release(second);

        while let Some(victim) = buffer.acquire_oldest_present() {
            buffer.release(victim);
        }
    }

    #[test]
    fn concurrent_evictors_on_the_same_filling_head_all_make_progress() {
        // Two consumers block on the same still-filling head. Waking one
        // must not strand the other: after the first pops, the survivor
        // has to stay wired to the new head even though that head is not
        // yet PRESENT.
        let buffer = Arc::new(make_buffer(3, 0, 100));
        let s0 = buffer.acquire_for_fill(page(0)).unwrap();
        let s1 = buffer.acquire_for_fill(page(1)).unwrap();
        let s2 = buffer.acquire_for_fill(page(2)).unwrap();

        let returned = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = Vec::new();
        for _ in 0..2 {
            let buffer = Arc::clone(&buffer);
            let returned = Arc::clone(&returned);
            consumers.push(thread::spawn(move || {
                let victim = buffer.acquire_oldest_present().unwrap();
                returned.lock().push(victim);
            }));
        }
        thread::sleep(Duration::from_millis(30));
        assert!(returned.lock().is_empty());

        buffer.mark_present(s0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(
            *returned.lock(),
            vec![s0],
            "exactly one consumer takes the completed head"
        );

        // A non-head completion must not wake the remaining consumer.
        buffer.mark_present(s2);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(*returned.lock(), vec![s0]);

        buffer.mark_present(s1);
        for consumer in consumers {
            consumer.join().expect("no panic");
        }
        assert_eq!(*returned.lock(), vec![s0, s1]);

        buffer.release(s0);
        buffer.release(s1);
        while let Some(victim) = buffer.acquire_oldest_present() {
            buffer.release(victim);
        }
    }

    #[test]
    fn pop_to_empty_wakes_every_remaining_consumer() {
        let buffer = Arc::new(make_buffer(2, 0, 100));
        let s0 = buffer.acquire_for_fill(page(0)).unwrap();

        let mut consumers = Vec::new();
        for _ in 0..2 {
            let buffer = Arc::clone(&buffer);
            consumers.push(thread::spawn(move || buffer.acquire_oldest_present()));
        }
        thread::sleep(Duration::from_millis(30));

        // One consumer pops the only page; the other must observe the
        // emptied queue and return instead of sleeping forever.
        buffer.mark_present(s0);
        let mut results: Vec<_> = consumers
            .into_iter()
            .map(|consumer| consumer.join().expect("no panic"))
            .collect();
        results.sort();
        assert_eq!(results, vec![None, Some(s0)]);
        buffer.release(s0);
    }

    #[test]
    fn take_present_pulls_a_specific_page_out_of_the_fifo() {
        let buffer = make_buffer(3, 0, 100);
        let slots: Vec<SlotId> = (0..3)
            .map(|n| buffer.acquire_for_fill(page(n)).unwrap())
            .collect();

        assert!(buffer.take_present(page(9)).is_none());
        assert!(
            buffer.take_present(page(1)).is_none(),
            "a FILLING page cannot be taken"
        );
        assert!(buffer.is_admitted(page(1)));

        for &slot in &slots {
            buffer.mark_present(slot);
        }

        let taken = buffer.take_present(page(1)).unwrap();
        assert_eq!(taken, slots[1]);
        assert_eq!(buffer.state_of(taken), PageState::Leaving);
        assert!(
            buffer.is_admitted(page(1)),
            "a LEAVING page is still admitted until released"
        );
        buffer.release(taken);
        assert!(buffer.lookup(page(1)).is_none());
        assert!(!buffer.is_admitted(page(1)));

        // FIFO order of the remaining pages is unchanged.
        let first = buffer.acquire_oldest_present().unwrap();
        assert_eq!(buffer.page_addr(first), page(0));
        buffer.release(first);
        let second = buffer.acquire_oldest_present().unwrap();
        assert_eq!(buffer.page_addr(second), page(2));
        buffer.release(second);
    }

    #[test]
    fn abort_fill_rolls_back_and_wakes_blocked_evictor() {
        let buffer = Arc::new(make_buffer(2, 0, 100));
        let s0 = buffer.acquire_for_fill(page(0)).unwrap();
        let s1 = buffer.acquire_for_fill(page(1)).unwrap();

        let evictor = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.acquire_oldest_present())
        };
        thread::sleep(Duration::from_millis(30));

        // The evictor is blocked on s0; abort its fill. The evictor must
        // move on to the new head instead of waiting forever.
        buffer.abort_fill(s0);
        thread::sleep(Duration::from_millis(10));
        buffer.mark_present(s1);

        let victim = evictor.join().expect("no panic").unwrap();
        assert_eq!(victim, s1);
        buffer.release(victim);

        let snap = buffer.snapshot();
        assert_eq!(snap.free, 2);
        assert_eq!(snap.busy, 0);
        assert_eq!(snap.present, 0);
    }

    #[test]
    fn interrupt_unblocks_fill_waiters() {
        let buffer = Arc::new(make_buffer(1, 0, 100));
        let slot = buffer.acquire_for_fill(page(0)).unwrap();
        buffer.mark_present(slot);

        let waiter = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.acquire_for_fill(page(1)))
        };
        thread::sleep(Duration::from_millis(30));

        buffer.interrupt_waiters();
        assert!(waiter.join().expect("no panic").is_none());

        // A stopping buffer still hands out a PRESENT head so teardown can
        // drain it; only waits are short-circuited.
        let victim = buffer.acquire_oldest_present().unwrap();
        buffer.release(victim);
    }

    // -- teardown guard --

    #[test]
    #[should_panic(expected = "pages still present")]
    fn drop_with_resident_pages_panics() {
        let buffer = make_buffer(2, 0, 100);
        let slot = buffer.acquire_for_fill(page(0)).unwrap();
        buffer.mark_present(slot);
        drop(buffer);
    }

    // -- rendering --

    #[test]
    fn snapshot_renders_all_counters() {
        let buffer = make_buffer(4, 50, 75);
        let slot = buffer.acquire_for_fill(page(0)).unwrap();
        buffer.mark_present(slot);

        let rendered = buffer.snapshot().to_string();
        assert_eq!(
            rendered,
            "{ capacity: 4, fill_waiting: 0, present: 1, free: 3, busy: 1, low_water: 2, high_water: 3 }"
        );

        let victim = buffer.acquire_oldest_present().unwrap();
        buffer.release(victim);
    }

    #[test]
    fn frames_match_configured_page_size() {
        let buffer = make_buffer(2, 0, 100);
        let slot = buffer.acquire_for_fill(page(0)).unwrap();
        {
            let mut frame = buffer.frame(slot).lock();
            assert_eq!(frame.len(), 4096);
            frame[0] = 0xEE;
        }
        buffer.mark_present(slot);

        let copied = buffer
            .with_present_frame(page(0), |bytes| bytes[0])
            .expect("page is present");
        assert_eq!(copied, 0xEE);
        assert!(
            buffer.with_present_frame(page(1), |_| ()).is_none(),
            "absent pages have no frame view"
        );

        let victim = buffer.acquire_oldest_present().unwrap();
        buffer.release(victim);
    }
}
