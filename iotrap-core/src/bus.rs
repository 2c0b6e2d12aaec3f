//! Defines the interface through which intercepted accesses reach the emulated hardware.

use std::fmt::Debug;
use std::rc::Rc;

macro_rules! access_fns {
    ( $( $read_fn:ident, $write_fn:ident => $u:ident ),* $(,)? ) => {
        $(
            /// Invoke a read for the specified bus offset, decoding the bytes in the guest's
            /// big-endian byte order.
            fn $read_fn(&self, address: u32) -> $u {
                let mut buf = [0u8; std::mem::size_of::<$u>()];
                self.read(&mut buf, address);
                $u::from_be_bytes(buf)
            }

            /// Invoke a write for the specified bus offset, encoding the value in the guest's
            /// big-endian byte order.
            fn $write_fn(&self, address: u32, value: $u) {
                self.write(address, &value.to_be_bytes())
            }
        )*
    };
}

/// The emulated hardware as seen by the fault handler.
///
/// Addresses are normalized bus offsets, i.e. guest addresses with the high alias window already
/// folded down. Out-of-range addresses are filtered before they reach the bus, so none of the
/// methods can fail.
///
/// The guest is big-endian: the byte at the lowest offset is the most significant byte of a word
/// or long. The typed helpers ([`read_word`](Self::read_word), [`write_long`](Self::write_long),
/// ...) take care of this, implementors only deal with byte slices.
///
/// Accesses are performed through `&self`, as the handler runs from within a fault on the guest
/// thread and cannot hold a unique borrow across it. Devices keep their state behind interior
/// mutability.
pub trait HardwareBus: Debug {
    /// Invoke a read access for `address` with size `buf.len()`, writing the result to `buf`.
    fn read(&self, buf: &mut [u8], address: u32);

    /// Invoke a write access for `address` with size `buf.len()`, reading the data from `buf`.
    fn write(&self, address: u32, buf: &[u8]);

    fn read_byte(&self, address: u32) -> u8 {
        let mut buf = [0];
        self.read(&mut buf, address);
        buf[0]
    }

    fn write_byte(&self, address: u32, value: u8) {
        self.write(address, &[value])
    }

    access_fns! {
        read_word, write_word => u16,
        read_long, write_long => u32,
    }
}

impl<B: HardwareBus + ?Sized> HardwareBus for &B {
    fn read(&self, buf: &mut [u8], address: u32) {
        (**self).read(buf, address)
    }

    fn write(&self, address: u32, buf: &[u8]) {
        (**self).write(address, buf)
    }
}

impl<B: HardwareBus + ?Sized> HardwareBus for Box<B> {
    fn read(&self, buf: &mut [u8], address: u32) {
        (**self).read(buf, address)
    }

    fn write(&self, address: u32, buf: &[u8]) {
        (**self).write(address, buf)
    }
}

impl<B: HardwareBus + ?Sized> HardwareBus for Rc<B> {
    fn read(&self, buf: &mut [u8], address: u32) {
        (**self).read(buf, address)
    }

    fn write(&self, address: u32, buf: &[u8]) {
        (**self).write(address, buf)
    }
}
