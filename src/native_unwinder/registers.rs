//! Platform-specific register capture feeding [`super::walk_fp_chain`].

/// Program counter, stack pointer and frame pointer of a thread at one
/// instant, in a uniform architecture-independent shape.
#[derive(Clone, Copy, Debug, Default)]
pub struct Registers {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
}

/// Extracts [`Registers`] from the `ucontext_t` the kernel hands a
/// POSIX signal handler (§4.5). Async-signal-safe: pure reads of a
/// structure already on the handler's stack.
///
/// # Safety
/// `ctx` must be the context pointer the kernel passed to a
/// `SA_SIGINFO` handler, valid for the duration of this call.
#[cfg(all(unix, not(target_os = "macos"), target_arch = "x86_64"))]
pub unsafe fn from_ucontext(ctx: *const libc::ucontext_t) -> Registers {
    // SAFETY: `ctx` is the context pointer the kernel passed to a
    // `SA_SIGINFO` handler; it is valid for the duration of the
    // handler call.
    let mcontext = unsafe { &(*ctx).uc_mcontext };
    Registers {
        pc: mcontext.gregs[libc::REG_RIP as usize] as usize,
        sp: mcontext.gregs[libc::REG_RSP as usize] as usize,
        fp: mcontext.gregs[libc::REG_RBP as usize] as usize,
    }
}

/// # Safety
/// See the x86_64 variant above.
#[cfg(all(unix, not(target_os = "macos"), target_arch = "aarch64"))]
pub unsafe fn from_ucontext(ctx: *const libc::ucontext_t) -> Registers {
    // SAFETY: see the x86_64 variant above.
    let mcontext = unsafe { &(*ctx).uc_mcontext };
    Registers {
        pc: mcontext.pc as usize,
        sp: mcontext.sp as usize,
        // aarch64 has no dedicated frame-pointer register in this
        // context struct; x29 (regs[29]) is the platform convention.
        fp: mcontext.regs[29] as usize,
    }
}

/// Extracts [`Registers`] from a Mach thread state read with
/// `thread_get_state` while the target thread is suspended (§4.6).
#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub fn from_mach_thread_state(state: &mach2::structs::x86_thread_state64_t) -> Registers {
    Registers {
        pc: super::strip_pac(state.__rip as usize),
        sp: state.__rsp as usize,
        fp: state.__rbp as usize,
    }
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub fn from_mach_thread_state(state: &mach2::structs::arm_thread_state64_t) -> Registers {
    Registers {
        pc: super::strip_pac(state.__pc as usize),
        sp: state.__sp as usize,
        fp: state.__fp as usize,
    }
}

/// Extracts [`Registers`] from a Windows `CONTEXT` captured via
/// `GetThreadContext` while the target thread is suspended (§4.7).
#[cfg(target_os = "windows")]
pub fn from_windows_context(ctx: &windows_sys::Win32::System::Diagnostics::Debug::CONTEXT) -> Registers {
    Registers {
        pc: ctx.Rip as usize,
        sp: ctx.Rsp as usize,
        fp: ctx.Rbp as usize,
    }
}
