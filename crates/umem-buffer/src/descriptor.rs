//! Page descriptor slots and their lifecycle state machine.
//!
//! A descriptor is a slot in the buffer's fixed pool; `page_addr` is its
//! current tenant. The state machine serializes concurrent operations on
//! the same page: FREE and PRESENT are the only resting states, every
//! other state is owned by exactly one worker until it completes.

use serde::{Deserialize, Serialize};
use std::fmt;
use umem_types::PageAddr;

/// Lifecycle state of a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageState {
    /// Slot has no tenant and sits in the free list.
    Free,
    /// A fill worker is reading the page in.
    Filling,
    /// Page contents are resident and visible.
    Present,
    /// A write fault is promoting a read-only resident page.
    Updating,
    /// An evict worker owns the slot and is writing back / releasing.
    Leaving,
}

impl PageState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Filling => "FILLING",
            Self::Present => "PRESENT",
            Self::Updating => "UPDATING",
            Self::Leaving => "LEAVING",
        }
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One slot of the fixed descriptor pool.
#[derive(Debug)]
pub struct PageDescriptor {
    pub(crate) page_addr: PageAddr,
    pub(crate) dirty: bool,
    pub(crate) state: PageState,
}

impl PageDescriptor {
    pub(crate) fn new_free() -> Self {
        Self {
            page_addr: PageAddr(0),
            dirty: false,
            state: PageState::Free,
        }
    }

    #[must_use]
    pub fn page_addr(&self) -> PageAddr {
        self.page_addr
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn state(&self) -> PageState {
        self.state
    }

    /// Perform a lifecycle transition.
    ///
    /// # Panics
    ///
    /// Any transition outside the permitted set is a programming error and
    /// panics with the offending from→to pair.
    pub(crate) fn set_state(&mut self, to: PageState) {
        use PageState::{Filling, Free, Leaving, Present, Updating};
        let legal = matches!(
            (self.state, to),
            (Free, Filling)
                | (Filling, Present)
                | (Updating, Present)
                | (Present, Updating)
                | (Present, Leaving)
                | (Leaving, Free)
        );
        assert!(
            legal,
            "invalid page state transition: {} -> {} (page {})",
            self.state, to, self.page_addr
        );
        self.state = to;
    }

    /// Recovery rollback for a failed fill: FILLING → FREE, bypassing
    /// PRESENT. Kept separate from [`set_state`](Self::set_state) so the
    /// normal table stays closed.
    pub(crate) fn rollback_fill(&mut self) {
        assert!(
            self.state == PageState::Filling,
            "fill rollback on descriptor in state {} (page {})",
            self.state,
            self.page_addr
        );
        self.state = PageState::Free;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_in(state: PageState) -> PageDescriptor {
        let mut pd = PageDescriptor::new_free();
        pd.state = state;
        pd
    }

    #[test]
    fn full_lifecycle_is_legal() {
        let mut pd = PageDescriptor::new_free();
        pd.set_state(PageState::Filling);
        pd.set_state(PageState::Present);
        pd.set_state(PageState::Updating);
        pd.set_state(PageState::Present);
        pd.set_state(PageState::Leaving);
        pd.set_state(PageState::Free);
    }

    #[test]
    #[should_panic(expected = "invalid page state transition: FREE -> PRESENT")]
    fn free_to_present_panics() {
        descriptor_in(PageState::Free).set_state(PageState::Present);
    }

    #[test]
    #[should_panic(expected = "invalid page state transition: FILLING -> LEAVING")]
    fn filling_to_leaving_panics() {
        descriptor_in(PageState::Filling).set_state(PageState::Leaving);
    }

    #[test]
    #[should_panic(expected = "invalid page state transition: PRESENT -> FREE")]
    fn present_to_free_panics() {
        descriptor_in(PageState::Present).set_state(PageState::Free);
    }

    #[test]
    #[should_panic(expected = "invalid page state transition: LEAVING -> PRESENT")]
    fn leaving_to_present_panics() {
        descriptor_in(PageState::Leaving).set_state(PageState::Present);
    }

    #[test]
    fn rollback_only_from_filling() {
        let mut pd = descriptor_in(PageState::Filling);
        pd.dirty = true;
        pd.rollback_fill();
        assert_eq!(pd.state(), PageState::Free);
        assert!(!pd.is_dirty());
    }

    #[test]
    #[should_panic(expected = "fill rollback on descriptor in state PRESENT")]
    fn rollback_from_present_panics() {
        descriptor_in(PageState::Present).rollback_fill();
    }
}
