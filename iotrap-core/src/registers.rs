//! Locating the register named by a ModR/M register field inside a [`FaultContext`].

use crate::context::{FaultContext, Gpr};
use crate::Width;
use std::fmt;

/// A 3-bit register field as encoded in the instruction. Can take values in the range `0..8`.
///
/// Which register it names depends on the operand width, see [`Slot::locate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RegisterIndex(u8);

impl RegisterIndex {
    /// Create a register index, returning `None` if `index > 7`.
    pub fn new<U: TryInto<u8>>(index: U) -> Option<Self> {
        let index = index.try_into().ok()?;
        (index < 8).then_some(Self(index))
    }

    /// Convert a 3-bit value into a register index.
    /// Panics if the value doesn't fit in 3 bits (`0..=7`).
    pub fn from_u3(value_u3: u8) -> Self {
        if value_u3 > 7 {
            panic!("out of range u3 used");
        }
        Self(value_u3)
    }
}

impl From<RegisterIndex> for u8 {
    fn from(value: RegisterIndex) -> Self {
        value.0
    }
}

impl fmt::Display for RegisterIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Storage location of a (sub-)register inside a [`FaultContext`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Slot {
    /// Bits `0..8` of the register (`al`, `cl`, `dl`, `bl`).
    LowByte(Gpr),
    /// Bits `8..16` of the register (`ah`, `ch`, `dh`, `bh`).
    HighByte(Gpr),
    /// The register starting at bit `0`, accessed at whatever width the operation needs.
    Full(Gpr),
}

impl Slot {
    /// Map a register field onto its storage location for an operand of `width`.
    ///
    /// With byte operands, indices 4 to 7 do not name `esp`, `ebp`, `esi` and `edi` but the second
    /// byte of `eax`, `ecx`, `edx` and `ebx`. Wider operands use the plain encoding order.
    pub fn locate(index: RegisterIndex, width: Width) -> Self {
        let encoding = u8::from(index);
        match (width, encoding) {
            (Width::Byte, 0..=3) => Self::LowByte(Gpr::from_u3(encoding)),
            (Width::Byte, _) => Self::HighByte(Gpr::from_u3(encoding - 4)),
            _ => Self::Full(Gpr::from_u3(encoding)),
        }
    }

    /// The register containing this slot.
    pub fn gpr(self) -> Gpr {
        match self {
            Self::LowByte(gpr) | Self::HighByte(gpr) | Self::Full(gpr) => gpr,
        }
    }

    fn shift(self) -> u32 {
        match self {
            Self::HighByte(_) => 8,
            Self::LowByte(_) | Self::Full(_) => 0,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LowByte(gpr) => write!(f, "{}l", &gpr.name()[1..2]),
            Self::HighByte(gpr) => write!(f, "{}h", &gpr.name()[1..2]),
            Self::Full(gpr) => write!(f, "{gpr}"),
        }
    }
}

/// A located register inside a context, accessed at an explicit width.
///
/// Writes narrower than the register leave the remaining bits untouched, matching how the host
/// instruction would have updated the register.
#[derive(Debug)]
pub struct RegisterRef<'c> {
    context: &'c mut FaultContext,
    slot: Slot,
}

impl<'c> RegisterRef<'c> {
    pub fn new(context: &'c mut FaultContext, slot: Slot) -> Self {
        Self { context, slot }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Read `width` bits starting at the slot.
    ///
    /// Slots naming a single byte are always read as a byte, whatever `width` says.
    pub fn read(&self, width: Width) -> u32 {
        let value = self.context.gpr(self.slot.gpr()) >> self.slot.shift();
        match self.slot {
            Slot::LowByte(_) | Slot::HighByte(_) => value & Width::Byte.mask(),
            Slot::Full(_) => value & width.mask(),
        }
    }

    /// Write the low `width` bits of `value` into the slot.
    ///
    /// Slots naming a single byte are always written as a byte, whatever `width` says.
    pub fn write(&mut self, width: Width, value: u32) {
        let width = match self.slot {
            Slot::LowByte(_) | Slot::HighByte(_) => Width::Byte,
            Slot::Full(_) => width,
        };
        let shift = self.slot.shift();
        let mask = width.mask() << shift;
        let register = self.context.gpr_mut(self.slot.gpr());
        *register = (*register & !mask) | ((value << shift) & mask);
    }

    pub fn read_u8(&self) -> u8 {
        self.read(Width::Byte) as u8
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write(Width::Byte, u32::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_registers_ignore_width() {
        for width in [Width::Byte, Width::Word, Width::Long] {
            for (encoding, gpr) in [Gpr::Eax, Gpr::Ecx, Gpr::Edx, Gpr::Ebx].into_iter().enumerate() {
                let slot = Slot::locate(RegisterIndex::from_u3(encoding as u8), width);
                assert_eq!(gpr, slot.gpr());
                assert_ne!(Slot::HighByte(gpr), slot);
            }
        }
    }

    #[test]
    fn test_byte_width_names_high_bytes() {
        let expected = [Gpr::Eax, Gpr::Ecx, Gpr::Edx, Gpr::Ebx];
        for (encoding, gpr) in (4..8).zip(expected) {
            assert_eq!(
                Slot::HighByte(gpr),
                Slot::locate(RegisterIndex::from_u3(encoding), Width::Byte)
            );
        }
    }

    #[test]
    fn test_wide_operands_name_pointer_and_index_registers() {
        for width in [Width::Word, Width::Long] {
            let slots: Vec<Slot> = (5..8)
                .map(|encoding| Slot::locate(RegisterIndex::from_u3(encoding), width))
                .collect();
            assert_eq!(
                vec![Slot::Full(Gpr::Ebp), Slot::Full(Gpr::Esi), Slot::Full(Gpr::Edi)],
                slots
            );
        }
        assert_eq!(
            Slot::Full(Gpr::Esp),
            Slot::locate(RegisterIndex::from_u3(4), Width::Long)
        );
    }

    #[test]
    fn test_register_index_bounds() {
        assert_eq!(Some(RegisterIndex::from_u3(0)), RegisterIndex::new(0u32));
        assert!(RegisterIndex::new(7).is_some());
        assert!(RegisterIndex::new(8).is_none());
        assert!(RegisterIndex::new(-1).is_none());
    }

    #[test]
    fn test_high_byte_access() {
        let mut context = FaultContext::new(0, 0).with_gpr(Gpr::Edx, 0x1234_5678);
        let mut dh = RegisterRef::new(&mut context, Slot::HighByte(Gpr::Edx));
        assert_eq!(0x56, dh.read_u8());
        dh.write_u8(0xAB);
        assert_eq!(0xAB, dh.read(Width::Long));
        assert_eq!(0x1234_AB78, context.gpr(Gpr::Edx));
    }

    #[test]
    fn test_partial_writes_preserve_upper_bits() {
        let mut context = FaultContext::new(0, 0).with_gpr(Gpr::Esi, 0xCAFE_BABE);
        let mut si = RegisterRef::new(&mut context, Slot::Full(Gpr::Esi));
        si.write(Width::Word, 0x0001_2345);
        assert_eq!(0x2345, si.read(Width::Word));
        assert_eq!(0xCAFE_2345, si.read(Width::Long));

        let mut al = RegisterRef::new(&mut context, Slot::LowByte(Gpr::Eax));
        al.write(Width::Long, 0xFFFF_FF42);
        assert_eq!(0x0000_0042, context.gpr(Gpr::Eax));
    }

    #[test]
    fn test_slot_display() {
        assert_eq!("al", Slot::LowByte(Gpr::Eax).to_string());
        assert_eq!("bh", Slot::HighByte(Gpr::Ebx).to_string());
        assert_eq!("edi", Slot::Full(Gpr::Edi).to_string());
    }
}
