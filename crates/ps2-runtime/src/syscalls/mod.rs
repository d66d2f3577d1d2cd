//! EE kernel syscall dispatch.
//!
//! Recompiled code reaches the kernel two ways: by symbol, through the
//! [`NAMED_SYSCALLS`] table the recompiler binds against, and by number,
//! through [`dispatch_numeric_syscall`]. Either way the ABI is the same:
//! arguments in $a0..$a3, the caller's $gp in GPR 28, and a signed 32-bit
//! status (or positive handler id) returned in $v0.

pub mod path;

use crate::cpu::{reg, R5900Context};
use crate::irq::IrqHandlerInfo;
use crate::memory::Rdram;
use crate::runtime::Ps2Runtime;

/// Kernel success status.
pub const KE_OK: i32 = 0;

/// Uniform signature shared by every named syscall.
pub type SyscallFn = fn(&Rdram, &mut R5900Context, &Ps2Runtime);

/// EE kernel syscall numbers handled by [`dispatch_numeric_syscall`].
pub mod num {
    pub const ADD_INTC_HANDLER: u32 = 0x10;
    pub const REMOVE_INTC_HANDLER: u32 = 0x11;
    pub const ADD_DMAC_HANDLER: u32 = 0x12;
    pub const REMOVE_DMAC_HANDLER: u32 = 0x13;
    pub const ENABLE_INTC: u32 = 0x14;
    pub const DISABLE_INTC: u32 = 0x15;
    pub const ENABLE_DMAC: u32 = 0x16;
    pub const DISABLE_DMAC: u32 = 0x17;
    pub const SET_VSYNC_FLAG: u32 = 0x72;
}

/// The symbolic syscall surface, in the order the kernel documents them.
pub const NAMED_SYSCALLS: &[(&str, SyscallFn)] = &[
    ("SetVSyncFlag", set_vsync_flag),
    ("AddIntcHandler", add_intc_handler),
    ("RemoveIntcHandler", remove_intc_handler),
    ("EnableIntcHandler", enable_intc_handler),
    ("DisableIntcHandler", disable_intc_handler),
    ("EnableIntc", enable_intc),
    ("DisableIntc", disable_intc),
    ("AddDmacHandler", add_dmac_handler),
    ("RemoveDmacHandler", remove_dmac_handler),
    ("EnableDmacHandler", enable_dmac_handler),
    ("DisableDmacHandler", disable_dmac_handler),
    ("EnableDmac", enable_dmac),
    ("DisableDmac", disable_dmac),
];

pub fn lookup_named(name: &str) -> Option<SyscallFn> {
    NAMED_SYSCALLS
        .iter()
        .find(|(entry, _)| *entry == name)
        .map(|&(_, func)| func)
}

/// Route a syscall identified by its EE kernel number.
/// Returns `false` if the number is not handled here.
pub fn dispatch_numeric_syscall(
    syscall_number: u32,
    rdram: &Rdram,
    ctx: &mut R5900Context,
    runtime: &Ps2Runtime,
) -> bool {
    let handler: SyscallFn = match syscall_number {
        num::ADD_INTC_HANDLER => add_intc_handler,
        num::REMOVE_INTC_HANDLER => remove_intc_handler,
        num::ADD_DMAC_HANDLER => add_dmac_handler,
        num::REMOVE_DMAC_HANDLER => remove_dmac_handler,
        num::ENABLE_INTC => enable_intc,
        num::DISABLE_INTC => disable_intc,
        num::ENABLE_DMAC => enable_dmac,
        num::DISABLE_DMAC => disable_dmac,
        num::SET_VSYNC_FLAG => set_vsync_flag,
        _ => return false,
    };
    handler(rdram, ctx, runtime);
    true
}

/// Sink for syscalls with no implementation. Logs the encoded id (once per
/// unique id) and hands the guest a zero return.
pub fn todo_syscall(
    _rdram: &Rdram,
    ctx: &mut R5900Context,
    runtime: &Ps2Runtime,
    encoded_id: u32,
) {
    runtime.record_todo_syscall(encoded_id);
    ctx.set_return_s32(0);
}

/// SetVSyncFlag(flag_ptr, tick_ptr) — register the one-shot end-of-frame
/// signal. Both guest words are cleared immediately; the next delivered
/// VBlank writes 1 to the flag word and the 64-bit frame count to the tick
/// word, then drops the registration.
pub fn set_vsync_flag(rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    let flag_addr = ctx.gpr_u32(reg::A0);
    let tick_addr = ctx.gpr_u32(reg::A1);

    runtime.irq().register_vsync(flag_addr, tick_addr);
    rdram.write_u32(flag_addr, 0);
    rdram.write_u64(tick_addr, 0);

    runtime.ensure_vblank_worker();
    ctx.set_return_s32(KE_OK);
}

/// AddIntcHandler(cause, handler, next, arg) — `next` (the chain position)
/// is accepted and ignored; handlers run in registration order. Returns the
/// new handler id.
pub fn add_intc_handler(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    let cause = ctx.gpr_u32(reg::A0);
    let handler = ctx.gpr_u32(reg::A1);
    let arg = ctx.gpr_u32(reg::A3);
    let id = runtime.irq().add_intc_handler(IrqHandlerInfo {
        cause,
        handler,
        arg,
        gp: ctx.gpr_u32(reg::GP),
        sp: 0, // dedicated IRQ stack, not the caller's
        enabled: true,
    });
    log::debug!(
        "AddIntcHandler id={} cause={} handler={:#010X} arg={:#X}",
        id,
        cause,
        handler,
        arg
    );

    runtime.ensure_vblank_worker();
    ctx.set_return_s32(id);
}

/// RemoveIntcHandler(cause, handler_id) — the id rides in $a1, matching the
/// kernel signature. Unknown ids are a no-op.
pub fn remove_intc_handler(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    let id = ctx.gpr_u32(reg::A1) as i32;
    runtime.irq().remove_intc_handler(id);
    ctx.set_return_s32(KE_OK);
}

pub fn enable_intc_handler(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    let id = ctx.gpr_u32(reg::A1) as i32;
    runtime.irq().enable_intc_handler(id);
    ctx.set_return_s32(KE_OK);
}

pub fn disable_intc_handler(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    let id = ctx.gpr_u32(reg::A1) as i32;
    runtime.irq().disable_intc_handler(id);
    ctx.set_return_s32(KE_OK);
}

/// EnableIntc(cause) — set the cause bit in the INTC enable mask.
pub fn enable_intc(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    runtime.irq().enable_intc(ctx.gpr_u32(reg::A0));
    ctx.set_return_s32(KE_OK);
}

pub fn disable_intc(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    runtime.irq().disable_intc(ctx.gpr_u32(reg::A0));
    ctx.set_return_s32(KE_OK);
}

/// AddDmacHandler(channel, handler, next, arg) — returns the new handler id.
/// Unlike the INTC flavour, registration alone does not start the VBlank
/// worker; DMAC interrupts are driven by DMA completion, not by the timer.
pub fn add_dmac_handler(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    let channel = ctx.gpr_u32(reg::A0);
    let handler = ctx.gpr_u32(reg::A1);
    let arg = ctx.gpr_u32(reg::A3);
    let id = runtime.irq().add_dmac_handler(IrqHandlerInfo {
        cause: channel,
        handler,
        arg,
        gp: ctx.gpr_u32(reg::GP),
        sp: 0, // dedicated IRQ stack, not the caller's
        enabled: true,
    });
    log::debug!(
        "AddDmacHandler id={} channel={} handler={:#010X} arg={:#X}",
        id,
        channel,
        handler,
        arg
    );
    ctx.set_return_s32(id);
}

pub fn remove_dmac_handler(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    let id = ctx.gpr_u32(reg::A1) as i32;
    runtime.irq().remove_dmac_handler(id);
    ctx.set_return_s32(KE_OK);
}

pub fn enable_dmac_handler(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    let id = ctx.gpr_u32(reg::A1) as i32;
    runtime.irq().enable_dmac_handler(id);
    ctx.set_return_s32(KE_OK);
}

pub fn disable_dmac_handler(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    let id = ctx.gpr_u32(reg::A1) as i32;
    runtime.irq().disable_dmac_handler(id);
    ctx.set_return_s32(KE_OK);
}

pub fn enable_dmac(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    runtime.irq().enable_dmac(ctx.gpr_u32(reg::A0));
    ctx.set_return_s32(KE_OK);
}

pub fn disable_dmac(_rdram: &Rdram, ctx: &mut R5900Context, runtime: &Ps2Runtime) {
    runtime.irq().disable_dmac(ctx.gpr_u32(reg::A0));
    ctx.set_return_s32(KE_OK);
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::irq::IntcCause;
    use crate::runtime::GuestExit;

    fn main_thread_runtime() -> (Ps2Runtime, Rdram) {
        let runtime = Ps2Runtime::new();
        runtime.set_main_thread();
        (runtime, Rdram::new())
    }

    fn ctx_with_args(a0: u32, a1: u32, a2: u32, a3: u32, gp: u32) -> R5900Context {
        let mut ctx = R5900Context::new();
        ctx.set_gpr_u32(reg::A0, a0);
        ctx.set_gpr_u32(reg::A1, a1);
        ctx.set_gpr_u32(reg::A2, a2);
        ctx.set_gpr_u32(reg::A3, a3);
        ctx.set_gpr_u32(reg::GP, gp);
        ctx
    }

    #[test]
    fn named_table_resolves_every_entry() {
        for (name, _) in NAMED_SYSCALLS {
            assert!(lookup_named(name).is_some(), "missing {}", name);
        }
        assert!(lookup_named("CreateThread").is_none());
    }

    #[test]
    fn set_vsync_flag_clears_guest_words_and_returns_ok() {
        let (runtime, rdram) = main_thread_runtime();
        rdram.write_u32(0x100, 0xFFFF_FFFF);
        rdram.write_u64(0x200, u64::MAX);

        let mut ctx = ctx_with_args(0x100, 0x200, 0, 0, 0);
        set_vsync_flag(&rdram, &mut ctx, &runtime);

        assert_eq!(ctx.gpr_u32(reg::V0) as i32, KE_OK);
        assert_eq!(rdram.read_u32(0x100), 0);
        assert_eq!(rdram.read_u64(0x200), 0);
        assert!(runtime.irq().worker_running());
        runtime.request_stop();
    }

    #[test]
    fn add_intc_handler_marshals_registers_and_returns_id() {
        let (runtime, rdram) = main_thread_runtime();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            runtime.register_function(0xDEAD, move |_rdram, ctx, _runtime| {
                seen.lock().unwrap().push((
                    ctx.gpr_u32(reg::A0),
                    ctx.gpr_u32(reg::A1),
                    ctx.gpr_u32(reg::GP),
                ));
                GuestExit::Returned
            });
        }

        let mut ctx = ctx_with_args(IntcCause::VblankStart as u32, 0xDEAD, 0, 0x42, 0x0099_0000);
        add_intc_handler(&rdram, &mut ctx, &runtime);
        let id = ctx.gpr_u32(reg::V0) as i32;
        assert!(id >= 1);

        runtime.irq().post_vblank_ticks(1);
        runtime.poll_vblank(&rdram);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(IntcCause::VblankStart as u32, 0x42, 0x0099_0000)]
        );
        runtime.request_stop();
    }

    #[test]
    fn handler_id_ops_take_the_id_in_a1() {
        let (runtime, rdram) = main_thread_runtime();
        let mut ctx = ctx_with_args(IntcCause::VblankStart as u32, 0xDEAD, 0, 0, 0);
        add_intc_handler(&rdram, &mut ctx, &runtime);
        let id = ctx.gpr_u32(reg::V0);

        let mut ctx = ctx_with_args(IntcCause::VblankStart as u32, id, 0, 0, 0);
        disable_intc_handler(&rdram, &mut ctx, &runtime);
        assert_eq!(ctx.gpr_u32(reg::V0) as i32, KE_OK);

        let mut ctx = ctx_with_args(IntcCause::VblankStart as u32, id, 0, 0, 0);
        remove_intc_handler(&rdram, &mut ctx, &runtime);
        assert_eq!(ctx.gpr_u32(reg::V0) as i32, KE_OK);
        runtime.request_stop();
    }

    #[test]
    fn numeric_dispatch_routes_known_numbers() {
        let (runtime, rdram) = main_thread_runtime();

        let mut ctx = ctx_with_args(IntcCause::VblankStart as u32, 0xDEAD, 0, 0, 0);
        assert!(dispatch_numeric_syscall(
            num::ADD_INTC_HANDLER,
            &rdram,
            &mut ctx,
            &runtime
        ));
        assert_eq!(ctx.gpr_u32(reg::V0), 1);

        let mut ctx = ctx_with_args(0x100, 0x200, 0, 0, 0);
        assert!(dispatch_numeric_syscall(
            num::SET_VSYNC_FLAG,
            &rdram,
            &mut ctx,
            &runtime
        ));
        runtime.request_stop();
    }

    #[test]
    fn numeric_dispatch_rejects_unknown_numbers() {
        let (runtime, rdram) = main_thread_runtime();
        let mut ctx = R5900Context::new();
        assert!(!dispatch_numeric_syscall(0x3C, &rdram, &mut ctx, &runtime));
        assert!(!dispatch_numeric_syscall(0xFFFF, &rdram, &mut ctx, &runtime));
    }

    #[test]
    fn todo_sink_returns_zero_to_the_guest() {
        let (runtime, rdram) = main_thread_runtime();
        let mut ctx = R5900Context::new();
        ctx.set_return_s32(-1);
        todo_syscall(&rdram, &mut ctx, &runtime, 0x1234);
        assert_eq!(ctx.gpr_u64(reg::V0), 0);
    }

    #[test]
    fn vsync_registration_with_null_tick_pointer() {
        let (runtime, rdram) = main_thread_runtime();
        let mut ctx = ctx_with_args(0x100, 0, 0, 0, 0);
        set_vsync_flag(&rdram, &mut ctx, &runtime);

        runtime.irq().post_vblank_ticks(1);
        runtime.poll_vblank(&rdram);
        assert_eq!(rdram.read_u32(0x100), 1);
        runtime.request_stop();
    }
}
