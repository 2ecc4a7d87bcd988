//! Saved kernel context and the `swtch` contract.

/// Callee-saved registers for kernel context switches. Contexts are stored
/// at the bottom of the stack they describe; the stack pointer is the
/// address of the context. `swtch` does not save `eip` explicitly, but it
/// is on the stack and `allocproc` manipulates it.
#[derive(Default)]
#[repr(C)]
pub struct Context {
    pub edi: usize,
    pub esi: usize,
    pub ebx: usize,
    pub ebp: usize,
    pub eip: usize,
}

impl Context {
    pub const fn zero() -> Self {
        Self {
            edi: 0,
            esi: 0,
            ebx: 0,
            ebp: 0,
            eip: 0,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        extern "C" {
            // swtch.S: save the current context at *old, load the one at new.
            pub fn swtch(old: *mut *mut Context, new: *mut Context);
        }
    } else {
        /// Hosted stand-in for the context-switch assembly. The scheduler is
        /// never entered on a hosted build.
        pub unsafe fn swtch(_old: *mut *mut Context, _new: *mut Context) {
            unreachable!("swtch requires the x86 target");
        }
    }
}
