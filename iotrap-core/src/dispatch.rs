//! Top-level fault handling.

use crate::bus::HardwareBus;
use crate::classify::{AddressClassifier, Classification, Config, ConfigError};
use crate::context::FaultContext;
use crate::decode::{DecodeError, InstructionDescriptor};
use crate::transfer::{self, TransferError};
use crate::trap::ExceptionPath;
use log::{debug, error, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Receiver of host protection faults.
pub trait Dispatch {
    /// Handle the fault described by `context`, with `code` holding the bytes at the faulting
    /// program counter.
    ///
    /// Returns once `context` describes where execution continues. Does not return at all if the
    /// fault cannot be handled.
    fn on_fault(&self, context: &mut FaultContext, code: &[u8]);
}

/// How a handled fault continues.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FaultOutcome {
    /// The access was emulated and execution continues right after the faulting instruction.
    Resumed { next_pc: usize },
    /// The access hit no hardware and execution continues in the CPU core's exception path.
    BusError { guest_address: u32 },
}

/// A fault that cannot be handled without leaving the guest in an undefined state.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum FatalFault {
    #[error("fault at {address:#010x} while another fault was being handled")]
    NestedFault { address: usize },
    #[error("unrecognized instruction at {pc:#010x}: {source}")]
    UnknownInstruction {
        pc: usize,
        #[source]
        source: DecodeError,
    },
    #[error("cannot emulate {instruction}: {source}")]
    Transfer {
        instruction: InstructionDescriptor,
        #[source]
        source: TransferError,
    },
}

/// Emulates faulting accesses to hardware registers against a [`HardwareBus`].
///
/// Handling is not reentrant: a fault raised while another one is in progress (by the bus
/// implementation, say) is fatal. After a fatal fault the handler stays locked.
///
/// Per-fault tracing goes through the installed logger, which is not async-signal-safe. Handlers
/// running inside a signal handler should be made [`quiet`](Self::quiet) unless debugging.
#[derive(Debug)]
pub struct FaultHandler<B, E> {
    bus: B,
    exceptions: E,
    classifier: AddressClassifier,
    in_handler: AtomicBool,
    log_faults: bool,
}

impl<B: HardwareBus, E: ExceptionPath> FaultHandler<B, E> {
    pub fn new(bus: B, exceptions: E, config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::with_classifier(
            bus,
            exceptions,
            AddressClassifier::new(config)?,
        ))
    }

    pub fn with_classifier(bus: B, exceptions: E, classifier: AddressClassifier) -> Self {
        Self {
            bus,
            exceptions,
            classifier,
            in_handler: AtomicBool::new(false),
            log_faults: true,
        }
    }

    /// Disable the per-fault `trace!` and `debug!` records. Fatal faults are still logged.
    pub fn quiet(mut self) -> Self {
        self.log_faults = false;
        self
    }

    pub fn logs_faults(&self) -> bool {
        self.log_faults
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn exceptions(&self) -> &E {
        &self.exceptions
    }

    /// Returns `true` while a fault is being handled.
    pub fn is_handling(&self) -> bool {
        self.in_handler.load(Ordering::SeqCst)
    }

    /// Handle one fault, reporting unrecoverable conditions instead of aborting.
    ///
    /// On success `context` has been updated to continue either after the faulting instruction or
    /// in the exception path. On failure, `context` is in an unspecified state and must not be
    /// resumed.
    pub fn try_handle(
        &self,
        context: &mut FaultContext,
        code: &[u8],
    ) -> Result<FaultOutcome, FatalFault> {
        if self.in_handler.swap(true, Ordering::SeqCst) {
            return Err(FatalFault::NestedFault {
                address: context.fault_address(),
            });
        }

        let (window, offset) = match self.classifier.classify(context.fault_address()) {
            Classification::Hardware { window, offset } => (window, offset),
            Classification::OutOfRange { guest_address } => {
                if self.log_faults {
                    debug!(
                        pc = context.pc(), guest_address = guest_address;
                        "Bus error accessing {guest_address:#010x} from pc {:#010x}",
                        context.pc()
                    );
                }
                self.in_handler.store(false, Ordering::SeqCst);
                self.exceptions.raise_bus_error(context, guest_address);
                return Ok(FaultOutcome::BusError { guest_address });
            }
        };

        let instruction =
            InstructionDescriptor::decode(code).map_err(|source| FatalFault::UnknownInstruction {
                pc: context.pc(),
                source,
            })?;
        if self.log_faults {
            trace!(
                pc = context.pc(), offset = offset;
                "Emulating {instruction} at pc {:#010x} on {window} offset {offset:#010x}",
                context.pc()
            );
        }

        transfer::execute(&self.bus, offset, &instruction, context)
            .map_err(|source| FatalFault::Transfer {
                instruction,
                source,
            })?;

        let next_pc = context.pc().wrapping_add(instruction.length);
        *context.pc_mut() = next_pc;
        if self.log_faults {
            trace!(next_pc = next_pc; "Resuming at {next_pc:#010x}");
        }

        self.in_handler.store(false, Ordering::SeqCst);
        Ok(FaultOutcome::Resumed { next_pc })
    }
}

impl<B: HardwareBus, E: ExceptionPath> Dispatch for FaultHandler<B, E> {
    fn on_fault(&self, context: &mut FaultContext, code: &[u8]) {
        if let Err(fault) = self.try_handle(context, code) {
            error!("Aborting: {fault}");
            std::process::abort();
        }
    }
}

impl<D: Dispatch + ?Sized> Dispatch for Box<D> {
    fn on_fault(&self, context: &mut FaultContext, code: &[u8]) {
        (**self).on_fault(context, code)
    }
}
