// strand/context.rs — saved CPU state and the switch path.
//
// A context holds the callee-saved registers plus rsp/rip/rflags, an
// optional 512-byte FPU area, and a generation counter bumped on every
// switch. New strands start through a thunk that moves the argument into
// place, calls the entry function, and jumps to the exit hook with the
// entry's return value. On non-x86_64 hosts the switch is a recorded stub;
// the strand state machine is fully drivable without it.

use alloc::boxed::Box;

/// Strand entry point: receives the argument, returns the exit code.
pub type EntryFn = extern "C" fn(u64) -> u32;

/// Exit hook installed under every entry; never returns.
pub type ExitFn = extern "C" fn(u32) -> !;

/// 512-byte FXSAVE area, 16-byte aligned.
#[repr(C, align(16))]
pub struct FpuArea(pub [u8; 512]);

impl FpuArea {
    pub fn zeroed() -> Box<FpuArea> {
        Box::new(FpuArea([0; 512]))
    }
}

#[repr(C)]
pub struct CpuContext {
    // layout consumed by the switch assembly; keep these nine first
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub generation: u64,
    pub fpu: Option<Box<FpuArea>>,
}

const RFLAGS_IF: u64 = 0x202;

impl CpuContext {
    pub fn empty() -> CpuContext {
        CpuContext {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            rflags: RFLAGS_IF,
            generation: 0,
            fpu: None,
        }
    }

    /// Arrange the first dispatch: the thunk finds the entry in rbx, the
    /// argument in r12 and the exit hook in r13.
    pub fn init_for_entry(&mut self, entry: EntryFn, arg: u64, stack_top: u64, exit: ExitFn) {
        self.rbx = entry as usize as u64;
        self.r12 = arg;
        self.r13 = exit as usize as u64;
        self.rsp = stack_top & !0xf;
        self.rip = strand_entry_thunk_addr();
        self.rflags = RFLAGS_IF;
    }

    /// Dispatchable means a resume point and a stack exist.
    pub fn is_valid(&self) -> bool {
        self.rip != 0 && self.rsp != 0
    }

    pub fn with_fpu(mut self) -> CpuContext {
        self.fpu = Some(FpuArea::zeroed());
        self
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        core::arch::global_asm!(
            ".global __halcyon_context_switch",
            "__halcyon_context_switch:",
            "mov [rdi + 0x00], rbx",
            "mov [rdi + 0x08], rbp",
            "mov [rdi + 0x10], r12",
            "mov [rdi + 0x18], r13",
            "mov [rdi + 0x20], r14",
            "mov [rdi + 0x28], r15",
            "mov [rdi + 0x30], rsp",
            "lea rax, [rip + .Lhalcyon_ctx_resume]",
            "mov [rdi + 0x38], rax",
            "pushfq",
            "pop rax",
            "mov [rdi + 0x40], rax",
            "mov rsp, [rsi + 0x30]",
            "push qword ptr [rsi + 0x40]",
            "popfq",
            "mov rbx, [rsi + 0x00]",
            "mov rbp, [rsi + 0x08]",
            "mov r12, [rsi + 0x10]",
            "mov r13, [rsi + 0x18]",
            "mov r14, [rsi + 0x20]",
            "mov r15, [rsi + 0x28]",
            "jmp qword ptr [rsi + 0x38]",
            ".Lhalcyon_ctx_resume:",
            "ret",
            ".global __halcyon_strand_entry",
            "__halcyon_strand_entry:",
            "mov rdi, r12",
            "call rbx",
            "mov edi, eax",
            "jmp r13",
        );

        extern "C" {
            fn __halcyon_context_switch(save: *mut CpuContext, load: *const CpuContext);
            fn __halcyon_strand_entry();
        }

        fn strand_entry_thunk_addr() -> u64 {
            __halcyon_strand_entry as usize as u64
        }

        /// Save into `from`, resume `to`.
        ///
        /// # Safety
        /// `to` must hold a context prepared by `init_for_entry` or a prior
        /// switch, with a live stack. Interrupts are the caller's problem.
        pub unsafe fn switch(from: &mut CpuContext, to: &mut CpuContext) {
            from.generation += 1;
            to.generation += 1;
            __halcyon_context_switch(from as *mut CpuContext, to as *const CpuContext);
        }
    } else {
        fn strand_entry_thunk_addr() -> u64 {
            // nonzero placeholder so contexts validate on foreign hosts
            0x1000
        }

        /// Foreign-host stub; the cooperative state machine runs without a
        /// real register switch.
        pub unsafe fn switch(from: &mut CpuContext, to: &mut CpuContext) {
            from.generation += 1;
            to.generation += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn test_entry(_arg: u64) -> u32 {
        0
    }

    extern "C" fn test_exit(_code: u32) -> ! {
        unreachable!("exit hook is never driven in hosted tests")
    }

    #[test]
    fn init_prepares_a_dispatchable_context() {
        let mut ctx = CpuContext::empty();
        assert!(!ctx.is_valid());
        ctx.init_for_entry(test_entry, 0xFEED, 0x7000_0000_1234, test_exit);
        assert!(ctx.is_valid());
        assert_eq!(ctx.rsp % 16, 0);
        assert_eq!(ctx.r12, 0xFEED);
        assert_eq!(ctx.rbx, test_entry as usize as u64);
        assert_eq!(ctx.r13, test_exit as usize as u64);
    }

    #[test]
    fn fpu_area_is_aligned() {
        let ctx = CpuContext::empty().with_fpu();
        let area = ctx.fpu.as_ref().expect("fpu");
        assert_eq!(area.0.len(), 512);
        assert_eq!(&area.0 as *const _ as usize % 16, 0);
    }
}
