//! Mapping of faulting host addresses onto the guest bus.

use crate::address_map::{AddressMap, AddressMapError};
use crate::{address_range, AddressRange};
use std::fmt;
use thiserror::Error;

/// Layout of the host-mapped guest address space.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    /// Host address at which guest address `0` is mapped.
    pub host_base: usize,
    /// Guest window holding the system hardware registers.
    pub system_window: AddressRange,
    /// Guest window holding the hardware registers as seen with all 32 address lines decoded.
    pub high_window: AddressRange,
    /// Guest window that mirrors the low 24-bit address space.
    pub alias_window: AddressRange,
    /// Subtracted from addresses in [`alias_window`](Self::alias_window) to obtain the bus offset.
    pub alias_offset: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_base: 0,
            system_window: address_range![0x00F0_0000, 0x00FF_FFFF],
            high_window: address_range![0xFFF0_0000, 0xFFFF_FFFF],
            alias_window: address_range![0xFF00_0000, 0xFFFF_FFFF],
            alias_offset: 0xFF00_0000,
        }
    }
}

impl Config {
    /// Check that the windows describe a usable layout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.windows()?;
        if self.alias_offset > self.alias_window.start() {
            return Err(ConfigError::AliasUnderflow {
                window: self.alias_window,
                offset: self.alias_offset,
            });
        }
        Ok(())
    }

    fn windows(&self) -> Result<AddressMap<Window>, ConfigError> {
        Ok(AddressMap::try_from(vec![
            (self.system_window, Window::System),
            (self.high_window, Window::High),
        ])?)
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("hardware windows overlap: {0}")]
    OverlappingWindows(#[from] AddressMapError),
    #[error("alias window {window} cannot be folded down by {offset:#x}")]
    AliasUnderflow { window: AddressRange, offset: u32 },
}

/// The hardware window a faulting address fell into.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Window {
    System,
    High,
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::High => "high",
        })
    }
}

/// Where a faulting access should go.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Classification {
    /// The access targets emulated hardware at bus offset `offset`.
    Hardware { window: Window, offset: u32 },
    /// No hardware answers at `guest_address`; the guest sees a bus error.
    OutOfRange { guest_address: u32 },
}

/// Classifies faulting host addresses according to a validated [`Config`].
#[derive(Debug)]
pub struct AddressClassifier {
    host_base: usize,
    windows: AddressMap<Window>,
    alias_window: AddressRange,
    alias_offset: u32,
}

impl AddressClassifier {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            host_base: config.host_base,
            windows: config.windows()?,
            alias_window: config.alias_window,
            alias_offset: config.alias_offset,
        })
    }

    /// Translate a host address into the guest address it was mapped from.
    ///
    /// The guest address space is 32 bits wide and wraps around.
    pub fn guest_address(&self, fault_address: usize) -> u32 {
        fault_address.wrapping_sub(self.host_base) as u32
    }

    pub fn classify(&self, fault_address: usize) -> Classification {
        let guest_address = self.guest_address(fault_address);
        match self.windows.value(guest_address) {
            Some(&window) => {
                let offset = if self.alias_window.contains(guest_address) {
                    guest_address - self.alias_offset
                } else {
                    guest_address
                };
                Classification::Hardware { window, offset }
            }
            None => Classification::OutOfRange { guest_address },
        }
    }
}

impl Default for AddressClassifier {
    fn default() -> Self {
        Self {
            host_base: 0,
            windows: crate::addr_map! {
                [0x00F0_0000, 0x00FF_FFFF] => Window::System,
                [0xFFF0_0000, 0xFFFF_FFFF] => Window::High,
            },
            alias_window: address_range![0xFF00_0000, 0xFFFF_FFFF],
            alias_offset: 0xFF00_0000,
        }
    }
}
