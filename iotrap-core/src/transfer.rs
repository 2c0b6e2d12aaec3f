//! Carrying out the decoded access against the hardware bus.

use crate::bus::HardwareBus;
use crate::context::{flags, FaultContext};
use crate::decode::{Direction, InstructionDescriptor, Operation};
use crate::registers::{RegisterRef, Slot};
use crate::Width;
use bitvec::order::Lsb0;
use bitvec::view::BitView;
use log::trace;
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum TransferError {
    #[error("{operation:?} has no {direction:?} form")]
    Unsupported {
        operation: Operation,
        direction: Direction,
    },
    #[error("immediate store without an immediate operand")]
    MissingImmediate,
}

/// Perform the access described by `descriptor` at bus offset `offset`, updating `context` the way
/// the faulting instruction would have.
///
/// The program counter is left alone. Every access reaches the bus exactly once, except for the
/// read-modify-write of `or m8, r8`, which reads once and then writes once.
pub fn execute<B: HardwareBus + ?Sized>(
    bus: &B,
    offset: u32,
    descriptor: &InstructionDescriptor,
    context: &mut FaultContext,
) -> Result<(), TransferError> {
    let width = descriptor.width;
    let bus_width = descriptor.bus_width();
    let slot = Slot::locate(descriptor.register, width);

    match (descriptor.operation, descriptor.direction) {
        (Operation::MoveByte | Operation::Move | Operation::ZeroExtendByte, Direction::Load) => {
            let value = read_bus(bus, offset, bus_width);
            RegisterRef::new(context, slot).write(width, value);
        }
        // Clears the whole register, even with a 16-bit destination.
        (Operation::ZeroExtendWord, Direction::Load) => {
            let value = u32::from(bus.read_word(offset));
            RegisterRef::new(context, slot).write(Width::Long, value);
        }
        (Operation::SignExtendByte, Direction::Load) => {
            let value = bus.read_byte(offset) as i8 as i32 as u32;
            RegisterRef::new(context, slot).write(width, value);
        }
        (
            operation @ (Operation::OrByte
            | Operation::AndByte
            | Operation::AddByte
            | Operation::CompareByte),
            Direction::Load,
        ) => {
            let memory = bus.read_byte(offset);
            let mut register = RegisterRef::new(context, slot);
            let outcome = Alu::combine(operation, register.read_u8(), memory);
            if operation != Operation::CompareByte {
                register.write_u8(outcome.value);
            }
            trace!("{} {slot}, {memory:#04x} = {:#04x}", operation.mnemonic(), outcome.value);
            outcome.update_flags(context.eflags_mut());
        }
        (Operation::MoveByte | Operation::Move, Direction::Store) => {
            let value = RegisterRef::new(context, slot).read(width);
            write_bus(bus, offset, bus_width, value);
        }
        (Operation::MoveImmediateByte, Direction::Store) => {
            let immediate = descriptor.immediate.ok_or(TransferError::MissingImmediate)?;
            bus.write_byte(offset, immediate);
        }
        (Operation::OrByte, Direction::Store) => {
            let memory = bus.read_byte(offset);
            let register = RegisterRef::new(context, slot).read_u8();
            let outcome = Alu::combine(Operation::OrByte, memory, register);
            bus.write_byte(offset, outcome.value);
            outcome.update_flags(context.eflags_mut());
        }
        (operation, direction) => {
            return Err(TransferError::Unsupported {
                operation,
                direction,
            })
        }
    }
    Ok(())
}

fn read_bus<B: HardwareBus + ?Sized>(bus: &B, offset: u32, width: Width) -> u32 {
    match width {
        Width::Byte => u32::from(bus.read_byte(offset)),
        Width::Word => u32::from(bus.read_word(offset)),
        Width::Long => bus.read_long(offset),
    }
}

fn write_bus<B: HardwareBus + ?Sized>(bus: &B, offset: u32, width: Width, value: u32) {
    match width {
        Width::Byte => bus.write_byte(offset, value as u8),
        Width::Word => bus.write_word(offset, value as u16),
        Width::Long => bus.write_long(offset, value),
    }
}

/// Result of an 8-bit combine operation together with the status it produces.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Alu {
    value: u8,
    carry: bool,
    overflow: bool,
    adjust: bool,
}

impl Alu {
    /// Compute `lhs <operation> rhs`. Comparison computes `lhs - rhs`.
    fn combine(operation: Operation, lhs: u8, rhs: u8) -> Self {
        match operation {
            Operation::AddByte => {
                let (value, carry) = lhs.overflowing_add(rhs);
                Self {
                    value,
                    carry,
                    overflow: (lhs ^ value) & (rhs ^ value) & 0x80 != 0,
                    adjust: (lhs ^ rhs ^ value) & 0x10 != 0,
                }
            }
            Operation::CompareByte => {
                let (value, carry) = lhs.overflowing_sub(rhs);
                Self {
                    value,
                    carry,
                    overflow: (lhs ^ rhs) & (lhs ^ value) & 0x80 != 0,
                    adjust: (lhs ^ rhs ^ value) & 0x10 != 0,
                }
            }
            Operation::AndByte => Self::logical(lhs & rhs),
            _ => Self::logical(lhs | rhs),
        }
    }

    fn logical(value: u8) -> Self {
        Self {
            value,
            carry: false,
            overflow: false,
            adjust: false,
        }
    }

    fn update_flags(self, eflags: &mut u32) {
        let bits = eflags.view_bits_mut::<Lsb0>();
        bits.set(flags::CF, self.carry);
        bits.set(flags::PF, self.value.count_ones() % 2 == 0);
        bits.set(flags::AF, self.adjust);
        bits.set(flags::ZF, self.value == 0);
        bits.set(flags::SF, self.value & 0x80 != 0);
        bits.set(flags::OF, self.overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Gpr;
    use crate::resources::register_bank::RegisterBank;
    use std::cell::Cell;

    const OFFSET: u32 = 0x10;

    /// Counts accesses on top of a register bank.
    #[derive(Debug)]
    struct Counting {
        bank: RegisterBank,
        reads: Cell<usize>,
        writes: Cell<usize>,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                bank: RegisterBank::new(0x100).unwrap(),
                reads: Cell::new(0),
                writes: Cell::new(0),
            }
        }
    }

    impl HardwareBus for Counting {
        fn read(&self, buf: &mut [u8], address: u32) {
            self.reads.set(self.reads.get() + 1);
            self.bank.read(buf, address)
        }

        fn write(&self, address: u32, buf: &[u8]) {
            self.writes.set(self.writes.get() + 1);
            self.bank.write(address, buf)
        }
    }

    fn run(bus: &impl HardwareBus, code: &[u8], context: &mut FaultContext) {
        let descriptor = InstructionDescriptor::decode(code).unwrap();
        execute(bus, OFFSET, &descriptor, context).unwrap();
    }

    fn flag(context: &FaultContext, bit: usize) -> bool {
        context.eflags() & (1 << bit) != 0
    }

    #[test]
    fn test_store_then_load() {
        let bus = RegisterBank::new(0x100).unwrap();
        for (store, load, value) in [
            (&[0x88, 0x08][..], &[0x8A, 0x10][..], 0x0000_00A5),
            (&[0x66, 0x89, 0x08][..], &[0x66, 0x8B, 0x10][..], 0x0000_BEEF),
            (&[0x89, 0x08][..], &[0x8B, 0x10][..], 0xDEAD_BEEF),
        ] {
            let mut context = FaultContext::new(0, 0).with_gpr(Gpr::Ecx, value);
            run(&bus, store, &mut context);
            run(&bus, load, &mut context);
            assert_eq!(value, context.gpr(Gpr::Edx), "{store:02x?}");
        }
        assert_eq!(0xDEAD_BEEF, bus.read_long(OFFSET));
    }

    #[test]
    fn test_narrow_loads_keep_upper_bits() {
        let bus = RegisterBank::new(0x100).unwrap();
        bus.write_word(OFFSET, 0x1234);
        let mut context = FaultContext::new(0, 0).with_gpr(Gpr::Ebx, 0xFFFF_FFFF);
        // mov bh, [eax]
        run(&bus, &[0x8A, 0x38], &mut context);
        assert_eq!(0xFFFF_12FF, context.gpr(Gpr::Ebx));
        // mov bx, [eax]
        run(&bus, &[0x66, 0x8B, 0x18], &mut context);
        assert_eq!(0xFFFF_1234, context.gpr(Gpr::Ebx));
    }

    #[test]
    fn test_extending_loads() {
        let bus = RegisterBank::new(0x100).unwrap();
        bus.write_word(OFFSET, 0x8081);
        let mut context = FaultContext::new(0, 0).with_gpr(Gpr::Esi, 0xFFFF_FFFF);

        // movzx esi, byte [eax]
        run(&bus, &[0x0F, 0xB6, 0x30], &mut context);
        assert_eq!(0x0000_0080, context.gpr(Gpr::Esi));
        // movsx esi, byte [eax]
        run(&bus, &[0x0F, 0xBE, 0x30], &mut context);
        assert_eq!(0xFFFF_FF80, context.gpr(Gpr::Esi));
        // movzx esi, word [eax]
        run(&bus, &[0x0F, 0xB7, 0x30], &mut context);
        assert_eq!(0x0000_8081, context.gpr(Gpr::Esi));

        // 16-bit destinations leave the upper half alone.
        context.set_gpr(Gpr::Esi, 0xCAFE_0000);
        // movsx si, byte [eax]
        run(&bus, &[0x66, 0x0F, 0xBE, 0x30], &mut context);
        assert_eq!(0xCAFE_FF80, context.gpr(Gpr::Esi));
        // movzx si, byte [eax]
        run(&bus, &[0x66, 0x0F, 0xB6, 0x30], &mut context);
        assert_eq!(0xCAFE_0080, context.gpr(Gpr::Esi));
    }

    #[test]
    fn test_word_zero_extension_clears_full_register() {
        let bus = RegisterBank::new(0x100).unwrap();
        bus.write_word(OFFSET, 0x8081);
        let mut context = FaultContext::new(0, 0).with_gpr(Gpr::Esi, 0xCAFE_0000);
        // movzx si, word [eax]
        run(&bus, &[0x66, 0x0F, 0xB7, 0x30], &mut context);
        assert_eq!(0x0000_8081, context.gpr(Gpr::Esi));
    }

    #[test]
    fn test_immediate_store() {
        let bus = Counting::new();
        let mut context = FaultContext::new(0, 0);
        // mov byte [eax], 0x7f
        run(&bus, &[0xC6, 0x00, 0x7F], &mut context);
        assert_eq!(0x7F, bus.bank.read_byte(OFFSET));
        assert_eq!((0, 1), (bus.reads.get(), bus.writes.get()));
    }

    #[test]
    fn test_or_store_reads_once_then_writes_once() {
        let bus = Counting::new();
        bus.bank.write_byte(OFFSET, 0x0F);
        let mut context = FaultContext::new(0, 0).with_gpr(Gpr::Ecx, 0x0000_3000);
        // or [eax], ch
        run(&bus, &[0x08, 0x28], &mut context);
        assert_eq!(0x3F, bus.bank.read_byte(OFFSET));
        assert_eq!((1, 1), (bus.reads.get(), bus.writes.get()));
        assert_eq!(0x0000_3000, context.gpr(Gpr::Ecx));
    }

    #[test]
    fn test_combine_loads() {
        let bus = RegisterBank::new(0x100).unwrap();
        bus.write_byte(OFFSET, 0x0F);
        let mut context = FaultContext::new(0, 0).with_gpr(Gpr::Eax, 0x1234_56F1);

        // and al, [eax]
        run(&bus, &[0x22, 0x00], &mut context);
        assert_eq!(0x1234_5601, context.gpr(Gpr::Eax));
        // or al, [eax]
        run(&bus, &[0x0A, 0x00], &mut context);
        assert_eq!(0x1234_560F, context.gpr(Gpr::Eax));
        // add al, [eax]
        run(&bus, &[0x02, 0x00], &mut context);
        assert_eq!(0x1234_561E, context.gpr(Gpr::Eax));
        assert!(flag(&context, flags::AF));
        assert!(!flag(&context, flags::CF));
    }

    #[test]
    fn test_compare_never_changes_register() {
        let bus = RegisterBank::new(0x100).unwrap();
        for memory in [0x00, 0x01, 0x42, 0x7F, 0x80, 0xFF] {
            bus.write_byte(OFFSET, memory);
            for register in [0x00, 0x42, 0x80, 0xFF] {
                let mut context =
                    FaultContext::new(0, 0).with_gpr(Gpr::Edx, 0xAAAA_AA00 | register);
                // cmp dl, [eax]
                run(&bus, &[0x3A, 0x10], &mut context);
                assert_eq!(0xAAAA_AA00 | register, context.gpr(Gpr::Edx));
                assert_eq!(register == memory as u32, flag(&context, flags::ZF));
                assert_eq!((register as u8) < memory, flag(&context, flags::CF));
            }
        }
    }

    #[test]
    fn test_add_flags() {
        let cases = [
            // lhs, rhs, value, CF, OF, AF
            (0x7F, 0x01, 0x80, false, true, true),
            (0xFF, 0x01, 0x00, true, false, true),
            (0x80, 0x80, 0x00, true, true, false),
            (0x10, 0x20, 0x30, false, false, false),
        ];
        for (lhs, rhs, value, carry, overflow, adjust) in cases {
            let outcome = Alu::combine(Operation::AddByte, lhs, rhs);
            assert_eq!(
                Alu {
                    value,
                    carry,
                    overflow,
                    adjust
                },
                outcome,
                "{lhs:#04x} + {rhs:#04x}"
            );
        }
    }

    #[test]
    fn test_compare_flags() {
        let outcome = Alu::combine(Operation::CompareByte, 0x80, 0x01);
        assert_eq!(0x7F, outcome.value);
        assert!(outcome.overflow);
        assert!(!outcome.carry);
        assert!(outcome.adjust);

        let mut eflags = 1 << 1 | 1 << 9;
        outcome.update_flags(&mut eflags);
        let expected = 1 << 1 | 1 << 9 | 1 << flags::OF | 1 << flags::AF;
        assert_eq!(expected, eflags);
    }

    #[test]
    fn test_logical_flags_clear_carry_and_overflow() {
        let mut eflags = flags::STATUS_MASK;
        Alu::combine(Operation::OrByte, 0x80, 0x01).update_flags(&mut eflags);
        // 0x81 has two bits set: even parity, negative, non-zero
        assert_eq!(1 << flags::PF | 1 << flags::SF, eflags);

        Alu::combine(Operation::AndByte, 0xF0, 0x0F).update_flags(&mut eflags);
        assert_eq!(1 << flags::PF | 1 << flags::ZF, eflags);
    }

    #[test]
    fn test_unsupported_pairs() {
        let bus = RegisterBank::new(0x100).unwrap();
        let mut context = FaultContext::new(0, 0);
        let descriptor = InstructionDescriptor::decode(&[0x02, 0x00]).unwrap();
        let store = InstructionDescriptor {
            direction: Direction::Store,
            ..descriptor
        };
        assert_eq!(
            Err(TransferError::Unsupported {
                operation: Operation::AddByte,
                direction: Direction::Store
            }),
            execute(&bus, OFFSET, &store, &mut context)
        );

        let immediate = InstructionDescriptor::decode(&[0xC6, 0x00, 0x01]).unwrap();
        let load = InstructionDescriptor {
            direction: Direction::Load,
            ..immediate
        };
        assert!(execute(&bus, OFFSET, &load, &mut context).is_err());

        let missing = InstructionDescriptor {
            immediate: None,
            ..immediate
        };
        assert_eq!(
            Err(TransferError::MissingImmediate),
            execute(&bus, OFFSET, &missing, &mut context)
        );
        assert_eq!(0, bus.read_byte(OFFSET));
    }
}
