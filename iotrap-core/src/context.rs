//! Processor state captured when the host raised the protection fault.

use std::fmt;

/// The number of general purpose registers addressable through a ModR/M register field.
pub const GPR_COUNT: usize = 8;

/// A general purpose register of the host, in the order of its instruction encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Self; GPR_COUNT] = [
        Self::Eax,
        Self::Ecx,
        Self::Edx,
        Self::Ebx,
        Self::Esp,
        Self::Ebp,
        Self::Esi,
        Self::Edi,
    ];

    /// Convert a 3-bit register encoding into a register.
    /// Panics if the value doesn't fit in 3 bits (`0..=7`).
    pub fn from_u3(value_u3: u8) -> Self {
        const_assert_eq!(GPR_COUNT, 8);
        match Self::ALL.get(usize::from(value_u3)) {
            Some(&gpr) => gpr,
            None => panic!("out of range u3 used"),
        }
    }

    /// Look up a register by its assembler name (`eax`, `ecx`, ...), ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|gpr| gpr.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Eax => "eax",
            Self::Ecx => "ecx",
            Self::Edx => "edx",
            Self::Ebx => "ebx",
            Self::Esp => "esp",
            Self::Ebp => "ebp",
            Self::Esi => "esi",
            Self::Edi => "edi",
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit positions of the arithmetic status flags in the flags register.
pub mod flags {
    /// Carry flag.
    pub const CF: usize = 0;
    /// Parity flag, set if the low byte of the result has an even number of set bits.
    pub const PF: usize = 2;
    /// Auxiliary carry flag (carry or borrow out of bit 3).
    pub const AF: usize = 4;
    /// Zero flag.
    pub const ZF: usize = 6;
    /// Sign flag.
    pub const SF: usize = 7;
    /// Overflow flag.
    pub const OF: usize = 11;

    /// Mask covering all arithmetic status flags.
    pub const STATUS_MASK: u32 = 1 << CF | 1 << PF | 1 << AF | 1 << ZF | 1 << SF | 1 << OF;
}

/// The host processor state at the moment of the fault.
///
/// Only lives for the duration of one fault handling invocation. The handler mutates it in place,
/// after which the host restores it and continues at [`pc`](Self::pc).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FaultContext {
    /// Linear address whose access caused the fault.
    fault_address: usize,
    /// Address of the faulting instruction.
    pc: usize,
    eflags: u32,
    gprs: [u32; GPR_COUNT],
}

impl FaultContext {
    /// Returns a context with all registers and flags cleared.
    pub fn new(fault_address: usize, pc: usize) -> Self {
        Self {
            fault_address,
            pc,
            eflags: 0,
            gprs: [0; GPR_COUNT],
        }
    }

    pub fn fault_address(&self) -> usize {
        self.fault_address
    }

    /// Returns the value of the program counter.
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Returns a mutable reference to the program counter.
    pub fn pc_mut(&mut self) -> &mut usize {
        &mut self.pc
    }

    pub fn gpr(&self, gpr: Gpr) -> u32 {
        self.gprs[gpr as usize]
    }

    pub fn set_gpr(&mut self, gpr: Gpr, value: u32) {
        self.gprs[gpr as usize] = value;
    }

    pub(crate) fn gpr_mut(&mut self, gpr: Gpr) -> &mut u32 {
        &mut self.gprs[gpr as usize]
    }

    pub fn eflags(&self) -> u32 {
        self.eflags
    }

    pub fn eflags_mut(&mut self) -> &mut u32 {
        &mut self.eflags
    }

    /// Builder-style helper setting a register, mostly useful to set up a context by hand.
    pub fn with_gpr(mut self, gpr: Gpr, value: u32) -> Self {
        self.set_gpr(gpr, value);
        self
    }
}
