//! Delivery of guest bus errors into the CPU core.
//!
//! A bus error leaves the fault handler through a one-way exit: instead of resuming after the
//! faulting instruction, the saved program counter is redirected to an entry point owned by the
//! CPU core. The core finds the reason for its arrival in a [`BusErrorLatch`].

use crate::context::FaultContext;
use std::cell::Cell;
use std::fmt::Debug;
use std::rc::Rc;

/// Distinguishing code with which the CPU core recognizes a bus error arriving at its entry point.
pub const BUS_ERROR_CODE: u32 = 2;

/// A pending guest bus error.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BusError {
    pub code: u32,
    /// Guest address of the failed access.
    pub address: u32,
}

/// The CPU core's exception path, as seen by the fault handler.
pub trait ExceptionPath: Debug {
    /// Arrange for `context` to continue in the CPU core's exception handling, raising a bus error
    /// for `guest_address`.
    ///
    /// The faulting instruction must not be resumed afterwards.
    fn raise_bus_error(&self, context: &mut FaultContext, guest_address: u32);
}

impl<E: ExceptionPath + ?Sized> ExceptionPath for &E {
    fn raise_bus_error(&self, context: &mut FaultContext, guest_address: u32) {
        (**self).raise_bus_error(context, guest_address)
    }
}

impl<E: ExceptionPath + ?Sized> ExceptionPath for Box<E> {
    fn raise_bus_error(&self, context: &mut FaultContext, guest_address: u32) {
        (**self).raise_bus_error(context, guest_address)
    }
}

/// Guest-visible fault state shared between the CPU core and its [`ResumePoint`].
#[derive(Debug, Default)]
pub struct BusErrorLatch {
    pending: Cell<Option<BusError>>,
}

impl BusErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a bus error, replacing any that was not taken yet.
    pub fn raise(&self, error: BusError) {
        self.pending.set(Some(error));
    }

    pub fn pending(&self) -> Option<BusError> {
        self.pending.get()
    }

    /// Consume the pending bus error, if any.
    pub fn take(&self) -> Option<BusError> {
        self.pending.take()
    }
}

/// Entry point of the CPU core's exception handling.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    entry: usize,
    code: u32,
    latch: Rc<BusErrorLatch>,
}

impl ResumePoint {
    /// Resume at host address `entry`, tagging bus errors with [`BUS_ERROR_CODE`].
    pub fn new(entry: usize, latch: Rc<BusErrorLatch>) -> Self {
        Self::with_code(entry, BUS_ERROR_CODE, latch)
    }

    pub fn with_code(entry: usize, code: u32, latch: Rc<BusErrorLatch>) -> Self {
        Self { entry, code, latch }
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn latch(&self) -> &Rc<BusErrorLatch> {
        &self.latch
    }
}

impl ExceptionPath for ResumePoint {
    fn raise_bus_error(&self, context: &mut FaultContext, guest_address: u32) {
        self.latch.raise(BusError {
            code: self.code,
            address: guest_address,
        });
        *context.pc_mut() = self.entry;
    }
}
