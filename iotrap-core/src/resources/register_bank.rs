use crate::bus::HardwareBus;
use crate::AddressRange;
use std::cell::RefCell;

/// Plain byte-addressed register storage without side effects.
///
/// Backs register windows whose device logic lives elsewhere, and serves as a stand-in device
/// when replaying faults. Reads return what was last written (zero after reset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBank {
    data: RefCell<Vec<u8>>,
    /// The highest byte offset.
    max_address: u32,
}

impl RegisterBank {
    /// Create a new zero-initialized bank that holds `size` bytes.
    ///
    /// `size` must be at least one, and at most `1 << 32` (since it must be addressable by `u32`).
    /// If `size` does not satisfy these conditions, `None` is returned.
    pub fn new(size: usize) -> Option<Self> {
        if size == 0 || (usize::BITS > 32 && size as u64 > (1 << 32)) {
            None
        } else {
            Some(Self {
                data: RefCell::new(vec![0; size]),
                max_address: (size - 1) as u32,
            })
        }
    }

    /// Returns the size expressed in bytes. Guaranteed to be at least one.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.max_address as usize + 1
    }

    /// Returns the offsets covered by this bank, always starting at `0`.
    pub fn range(&self) -> AddressRange {
        AddressRange::new(0, self.max_address).unwrap()
    }

    /// Force all registers back to zero.
    pub fn reset(&self) {
        self.data.borrow_mut().fill(0);
    }

    /// Returns a copy of the bytes in `address..address + len`, clipped to the bank.
    pub fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.read(&mut buf, address);
        buf
    }

    /// Reads a range of bytes into `buf`.
    ///
    /// Elements in `buf` corresponding to offsets outside `self.range()` are left untouched.
    pub fn read(&self, buf: &mut [u8], address: u32) {
        if address > self.max_address || buf.is_empty() {
            return;
        }
        let size = buf.len().min((self.max_address - address) as usize + 1);
        let start = address as usize;
        buf[..size].copy_from_slice(&self.data.borrow()[start..start + size]);
    }

    /// Writes a range of bytes from `buf`.
    ///
    /// Bytes that would land outside `self.range()` are ignored.
    pub fn write(&self, address: u32, buf: &[u8]) {
        if address > self.max_address || buf.is_empty() {
            return;
        }
        let size = buf.len().min((self.max_address - address) as usize + 1);
        let start = address as usize;
        self.data.borrow_mut()[start..start + size].copy_from_slice(&buf[..size]);
    }
}

impl HardwareBus for RegisterBank {
    fn read(&self, buf: &mut [u8], address: u32) {
        RegisterBank::read(self, buf, address)
    }

    fn write(&self, address: u32, buf: &[u8]) {
        RegisterBank::write(self, address, buf)
    }
}
