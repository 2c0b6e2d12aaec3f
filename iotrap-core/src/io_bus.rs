use crate::address_map::{AddressMap, AddressMapError};
use crate::bus::HardwareBus;
use crate::AddressRange;
use log::trace;

/// Abstraction of the hardware register space, forwarding bus offsets to the attached devices.
///
/// Every device occupies one window of the normalized bus offset space and sees offsets relative
/// to the start of its window.
///
/// Vacant regions (offsets no device is mapped to) are allowed, but accessing them does nothing:
/// reads leave the buffer untouched and writes are dropped. An access is forwarded if and only if
/// the entire offset range `address..(address+size)` is contained within the window that `address`
/// is in.
#[derive(Debug)]
pub struct IoBus {
    memory_map: AddressMap<Box<dyn HardwareBus>>,
}

impl IoBus {
    /// Build a bus from `(window, device)` pairs. The windows must not overlap.
    pub fn new(devices: Vec<(AddressRange, Box<dyn HardwareBus>)>) -> Result<Self, AddressMapError> {
        Ok(Self {
            memory_map: AddressMap::try_from(devices)?,
        })
    }

    /// Returns the windows devices are mapped to, in ascending order.
    pub fn windows(&self) -> impl Iterator<Item = AddressRange> + '_ {
        self.memory_map.iter().map(|(range, _)| range)
    }

    /// Validates the `(address, size)` pair, returning the device and the rebased offset if the
    /// access is accepted, and `None` otherwise.
    fn check_access(&self, address: u32, size: usize) -> Option<(&dyn HardwareBus, u32)> {
        let (range, device) = self.memory_map.range_value(address)?;
        if !range.contains_access(address, size) {
            return None;
        }
        Some((device.as_ref(), range.offset_of(address)?))
    }
}

impl HardwareBus for IoBus {
    fn read(&self, buf: &mut [u8], address: u32) {
        match self.check_access(address, buf.len()) {
            Some((device, offset)) => device.read(buf, offset),
            None => trace!("Dropping read of {} bytes at vacant offset {address:#010x}", buf.len()),
        }
    }

    fn write(&self, address: u32, buf: &[u8]) {
        match self.check_access(address, buf.len()) {
            Some((device, offset)) => device.write(offset, buf),
            None => trace!("Dropping write of {} bytes at vacant offset {address:#010x}", buf.len()),
        }
    }
}
