//! Interception of host memory-protection faults caused by guest accesses to emulated hardware
//! registers.
//!
//! Large parts of the guest address space are mapped directly onto host memory. The windows that
//! hold hardware registers are left without backing pages, so every guest access to them traps.
//! The [`FaultHandler`] decodes the faulting host instruction, performs the access against a
//! [`HardwareBus`](bus::HardwareBus) instead, patches the saved processor context, and lets the
//! faulted instruction stream continue as if the access had completed against real memory.

#[macro_use]
extern crate static_assertions;

use std::fmt;

pub mod address_map;
pub mod address_range;
pub mod bus;
pub mod classify;
pub mod context;
pub mod decode;
pub mod dispatch;
#[cfg(all(target_os = "linux", target_arch = "x86"))]
pub mod host;
pub mod io_bus;
pub mod registers;
pub mod resources;
pub mod transfer;
pub mod trap;

/// Re-export of [`AddressRange`] for convenience.
pub use address_range::AddressRange;
pub use context::FaultContext;
pub use dispatch::{Dispatch, FatalFault, FaultHandler, FaultOutcome};

/// Width of a single operand or bus transfer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Width {
    /// A _byte_ is 8 bits.
    Byte = 1,
    /// A _word_ is 16 bits (2 bytes).
    Word = 2,
    /// A _long_ (longword) is 32 bits (4 bytes).
    Long = 4,
}

impl Width {
    /// Returns the number of bytes covered by this width.
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Returns the mask selecting the low bits covered by this width.
    pub fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xFF,
            Self::Word => 0xFFFF,
            Self::Long => 0xFFFF_FFFF,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Width::Byte => "byte",
            Width::Word => "word",
            Width::Long => "long",
        })
    }
}
