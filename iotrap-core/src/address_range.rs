use std::fmt;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// A non-empty window of the 32-bit guest address space, bounded inclusively below and above.
///
/// Enforces the invariant that `self.start() <= self.end()`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct AddressRange {
    start: u32,
    end: u32,
}

impl Display for AddressRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#010x}, {:#010x}]", self.start, self.end)
    }
}

impl AddressRange {
    pub fn new(start: u32, end: u32) -> Result<Self, InvalidBoundsError> {
        (start <= end)
            .then_some(Self { start, end })
            .ok_or(InvalidBoundsError { start, end })
    }

    pub fn start(self) -> u32 {
        self.start
    }

    pub fn end(self) -> u32 {
        self.end
    }

    /// Check if an address is contained within this address range.
    pub fn contains(self, address: u32) -> bool {
        self.start <= address && address <= self.end
    }

    /// Returns `true` if the access `address..address + size` lies entirely within this range.
    ///
    /// Zero-sized accesses are treated like single byte accesses.
    pub fn contains_access(self, address: u32, size: usize) -> bool {
        if !self.contains(address) {
            return false;
        }
        match u32::try_from(size.saturating_sub(1)) {
            Ok(delta) => self.end - address >= delta,
            Err(_) => false,
        }
    }

    /// Returns `true` if at least one address is contained in both ranges.
    pub fn overlaps(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns the offset of `address` relative to the start of this range, or `None` if the
    /// address lies outside of it.
    pub fn offset_of(self, address: u32) -> Option<u32> {
        self.contains(address).then(|| address - self.start)
    }

    /// Returns `self.end() - self.start()`, which is the size minus 1.
    pub fn delta(self) -> u32 {
        self.end - self.start
    }

    /// Returns the size of this address range if it is representable by a `usize`, or `None`
    /// otherwise.
    pub fn size(self) -> Option<usize> {
        const_assert!(usize::BITS >= 32);
        (self.delta() as usize).checked_add(1)
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("bounds [{start:#x}, {end:#x}] do not form a valid 32-bit address range")]
pub struct InvalidBoundsError {
    start: u32,
    end: u32,
}

#[macro_export]
macro_rules! address_range {
    ($start:expr, $end:expr) => {
        $crate::address_range::AddressRange::new($start, $end).unwrap()
    };
}
