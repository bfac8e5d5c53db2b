#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default page size used when nothing else is configured.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Virtual address of a page in a mapped region.
///
/// Always page-aligned once it has passed through [`PageSize::page_begin`];
/// raw fault addresses are aligned down before they reach the buffer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageAddr(pub u64);

impl PageAddr {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Byte distance from `base` to this address, `None` if `base` is above.
    #[must_use]
    pub fn offset_from(self, base: Self) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}

impl fmt::Display for PageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Byte offset into a backing store (pread/pwrite semantics).
///
/// Unit-carrying wrapper to keep store offsets and virtual addresses from
/// mixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreOffset(pub u64);

impl StoreOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for StoreOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a descriptor slot in the buffer's fixed pool.
///
/// Slots are never allocated per page; a `SlotId` names storage, not a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated page size (power of two, at least 512 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageSize(u32);

impl PageSize {
    /// Create a `PageSize` if `value` is a power of two in [512, 16 MiB].
    pub fn new(value: u32) -> Result<Self, TypeError> {
        if !value.is_power_of_two() || !(512..=16 * 1024 * 1024).contains(&value) {
            return Err(TypeError::InvalidField {
                field: "page_size",
                reason: "must be a power of two in 512..=16MiB",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Align a raw fault address down to the start of its page.
    #[must_use]
    pub fn page_begin(self, addr: PageAddr) -> PageAddr {
        PageAddr(addr.0 & !u64::from(self.0 - 1))
    }

    /// Whether `value` lies on a page boundary.
    #[must_use]
    pub fn is_aligned(self, value: u64) -> bool {
        value & u64::from(self.0 - 1) == 0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self(DEFAULT_PAGE_SIZE)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validation errors for value-type constructors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}
