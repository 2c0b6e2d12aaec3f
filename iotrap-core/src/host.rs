//! Delivery of host `SIGSEGV` faults to a [`Dispatch`] implementation on i386 Linux.

use crate::context::{FaultContext, Gpr};
use crate::decode::MAX_INSTRUCTION_LEN;
use crate::dispatch::Dispatch;
use libc::{c_int, c_void, siginfo_t, ucontext_t};
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use thiserror::Error;

/// The installed dispatcher. Set once and never released.
static DISPATCH: AtomicPtr<Box<dyn Dispatch>> = AtomicPtr::new(ptr::null_mut());

/// Position of each general purpose register in `mcontext_t::gregs`.
const GREGS: [(Gpr, c_int); 8] = [
    (Gpr::Eax, libc::REG_EAX),
    (Gpr::Ecx, libc::REG_ECX),
    (Gpr::Edx, libc::REG_EDX),
    (Gpr::Ebx, libc::REG_EBX),
    (Gpr::Esp, libc::REG_ESP),
    (Gpr::Ebp, libc::REG_EBP),
    (Gpr::Esi, libc::REG_ESI),
    (Gpr::Edi, libc::REG_EDI),
];

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("a fault dispatcher is already installed")]
    AlreadyInstalled,
    #[error("failed to register the SIGSEGV handler: {0}")]
    Sigaction(#[from] io::Error),
}

/// Route all `SIGSEGV` faults of the process to `dispatch`.
///
/// The dispatcher is called on whichever thread faulted. Only the guest thread may touch the
/// unmapped hardware windows, as dispatchers are generally not thread safe. Anything `dispatch`
/// logs is written from signal context, so a [`FaultHandler`](crate::FaultHandler) should be made
/// quiet before installing it unless the process is being debugged.
pub fn install(dispatch: Box<dyn Dispatch>) -> Result<(), InstallError> {
    let raw = Box::into_raw(Box::new(dispatch));
    if DISPATCH
        .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        // SAFETY: `raw` was created above and never published.
        drop(unsafe { Box::from_raw(raw) });
        return Err(InstallError::AlreadyInstalled);
    }

    // SAFETY: `action` is fully initialized before being passed on, and `handle_sigsegv` has the
    // signature `SA_SIGINFO` requires.
    let result = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigsegv as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut())
    };
    if result != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Returns `true` once a dispatcher has been installed.
pub fn is_installed() -> bool {
    !DISPATCH.load(Ordering::SeqCst).is_null()
}

extern "C" fn handle_sigsegv(_signal: c_int, info: *mut siginfo_t, ucontext: *mut c_void) {
    let dispatch = DISPATCH.load(Ordering::SeqCst);
    if dispatch.is_null() || info.is_null() || ucontext.is_null() {
        std::process::abort();
    }

    // SAFETY: the kernel passes valid `siginfo_t` and `ucontext_t` pointers to `SA_SIGINFO`
    // handlers, and `dispatch` points to a box that is never freed once published.
    let (dispatch, fault_address, gregs) = unsafe {
        (
            &*dispatch,
            (*info).si_addr() as usize,
            &mut (*(ucontext as *mut ucontext_t)).uc_mcontext.gregs,
        )
    };

    let pc = gregs[libc::REG_EIP as usize] as u32 as usize;
    let mut context = FaultContext::new(fault_address, pc);
    for (gpr, index) in GREGS {
        context.set_gpr(gpr, gregs[index as usize] as u32);
    }
    *context.eflags_mut() = gregs[libc::REG_EFL as usize] as u32;

    // SAFETY: the faulting instruction was just fetched from `pc`, so its bytes are mapped. The
    // decoder never looks past the end of the instruction.
    let code = unsafe { std::slice::from_raw_parts(pc as *const u8, MAX_INSTRUCTION_LEN) };
    dispatch.on_fault(&mut context, code);

    for (gpr, index) in GREGS {
        gregs[index as usize] = context.gpr(gpr) as libc::greg_t;
    }
    gregs[libc::REG_EFL as usize] = context.eflags() as libc::greg_t;
    gregs[libc::REG_EIP as usize] = context.pc() as libc::greg_t;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gregs_cover_all_registers() {
        let gprs: Vec<Gpr> = GREGS.iter().map(|&(gpr, _)| gpr).collect();
        assert_eq!(Gpr::ALL.to_vec(), gprs);

        let mut indices: Vec<c_int> = GREGS.iter().map(|&(_, index)| index).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(GREGS.len(), indices.len());
        assert!(!indices.contains(&libc::REG_EIP));
        assert!(!indices.contains(&libc::REG_EFL));
    }
}
