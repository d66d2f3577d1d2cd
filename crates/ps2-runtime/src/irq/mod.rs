//! EE interrupt delivery — INTC/DMAC handler tables and cooperative VBlank.
//!
//! A background worker posts VBlank tick events on a ~60 Hz cadence; the main
//! dispatch thread drains them between guest basic blocks and invokes the
//! registered handlers inline, with a fresh register context per invocation.
//! Handlers therefore always run under the guest execution gate, on the one
//! thread that is allowed to touch guest state — interrupts fire at
//! "instruction boundaries" exactly as they do on the single-core EE.

mod worker;

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::cpu::{reg, R5900Context};
use crate::memory::Rdram;
use crate::runtime::{lock, GuestExit, Ps2Runtime};

/// VBlank period: ~60 Hz, in whole microseconds.
pub const VBLANK_PERIOD: Duration = Duration::from_micros(16_667);

/// Most ticks a single worker wake or a single drain will deliver after a
/// stall; anything older is dropped rather than replayed as a burst.
pub const MAX_CATCHUP: i32 = 4;

/// Top of the dedicated IRQ stack, one past the end of main RAM. Used for
/// handlers registered with `sp == 0`; their prologues store below it.
pub const IRQ_STACK_TOP: u32 = 0x0200_0000;

const MAX_WARN_LINES: u32 = 8;

/// EE INTC cause lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IntcCause {
    Gs = 0,
    SBus = 1,
    VblankStart = 2,
    VblankEnd = 3,
    Vif0 = 4,
    Vif1 = 5,
    Vu0 = 6,
    Vu1 = 7,
    Ipu = 8,
    Timer0 = 9,
    Timer1 = 10,
    Timer2 = 11,
    Timer3 = 12,
    Sfifo = 13,
    Vu0Watchdog = 14,
}

/// EE DMA controller channels. The discriminant is both the channel index
/// and the DMAC interrupt cause for that channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DmacChannel {
    Vif0 = 0,
    Vif1 = 1,
    Gif = 2,
    FromIpu = 3,
    ToIpu = 4,
    Sif0 = 5,
    Sif1 = 6,
    Sif2 = 7,
    FromSpr = 8,
    ToSpr = 9,
}

impl DmacChannel {
    /// Map a channel register block base (Dn_CHCR) to the channel.
    pub fn from_base(base: u32) -> Option<Self> {
        match base {
            0x1000_8000 => Some(Self::Vif0),
            0x1000_9000 => Some(Self::Vif1),
            0x1000_A000 => Some(Self::Gif),
            0x1000_B000 => Some(Self::FromIpu),
            0x1000_B400 => Some(Self::ToIpu),
            0x1000_C000 => Some(Self::Sif0),
            0x1000_C400 => Some(Self::Sif1),
            0x1000_C800 => Some(Self::Sif2),
            0x1000_D000 => Some(Self::FromSpr),
            0x1000_D400 => Some(Self::ToSpr),
            _ => None,
        }
    }
}

/// One registered INTC or DMAC handler.
#[derive(Debug, Clone)]
pub struct IrqHandlerInfo {
    pub cause: u32,
    /// Guest address of the handler function.
    pub handler: u32,
    /// Opaque argument passed to the handler in $a1.
    pub arg: u32,
    /// Caller's $gp, restored for the handler invocation.
    pub gp: u32,
    /// Stack pointer for the handler context; 0 selects [`IRQ_STACK_TOP`].
    pub sp: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy)]
enum IrqKind {
    Intc,
    Dmac,
}

impl IrqKind {
    fn name(self) -> &'static str {
        match self {
            IrqKind::Intc => "INTC",
            IrqKind::Dmac => "DMAC",
        }
    }
}

/// Both handler tables plus the per-cause enable masks, under one lock.
///
/// `BTreeMap` keeps iteration in ascending-id order, which is registration
/// order: ids start at 1, only grow, and are never reused.
struct HandlerTables {
    intc: BTreeMap<i32, IrqHandlerInfo>,
    dmac: BTreeMap<i32, IrqHandlerInfo>,
    next_intc_id: i32,
    next_dmac_id: i32,
    /// Bit `c` set ⇔ cause `c` enabled. Reset state: everything enabled.
    intc_mask: u32,
    dmac_mask: u32,
}

/// The one-shot end-of-frame registration plus the frame counter.
struct VsyncState {
    flag_addr: u32,
    tick_addr: u32,
    tick_counter: u64,
}

/// All interrupt state for one emulated process.
///
/// Lock order: worker start > handler tables > vsync. No lock is ever held
/// while a guest handler runs.
pub struct InterruptController {
    tables: Mutex<HandlerTables>,
    vsync: Mutex<VsyncState>,
    timer: Arc<worker::VblankTimer>,
    worker_start: Mutex<()>,
    missing_fn_warns: AtomicU32,
    handler_panic_warns: AtomicU32,
    unknown_channel_warns: AtomicU32,
}

impl InterruptController {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HandlerTables {
                intc: BTreeMap::new(),
                dmac: BTreeMap::new(),
                next_intc_id: 1,
                next_dmac_id: 1,
                intc_mask: u32::MAX,
                dmac_mask: u32::MAX,
            }),
            vsync: Mutex::new(VsyncState {
                flag_addr: 0,
                tick_addr: 0,
                tick_counter: 0,
            }),
            timer: Arc::new(worker::VblankTimer::new()),
            worker_start: Mutex::new(()),
            missing_fn_warns: AtomicU32::new(0),
            handler_panic_warns: AtomicU32::new(0),
            unknown_channel_warns: AtomicU32::new(0),
        }
    }

    // --- Handler registration -------------------------------------------

    /// Store an INTC handler and return its id (>= 1). Ids are never reused.
    pub fn add_intc_handler(&self, info: IrqHandlerInfo) -> i32 {
        let mut tables = lock(&self.tables);
        let id = tables.next_intc_id;
        tables.next_intc_id += 1;
        tables.intc.insert(id, info);
        id
    }

    pub fn add_dmac_handler(&self, info: IrqHandlerInfo) -> i32 {
        let mut tables = lock(&self.tables);
        let id = tables.next_dmac_id;
        tables.next_dmac_id += 1;
        tables.dmac.insert(id, info);
        id
    }

    /// Remove a handler. Ids <= 0 and unknown ids are no-ops.
    pub fn remove_intc_handler(&self, id: i32) {
        if id > 0 {
            lock(&self.tables).intc.remove(&id);
        }
    }

    pub fn remove_dmac_handler(&self, id: i32) {
        if id > 0 {
            lock(&self.tables).dmac.remove(&id);
        }
    }

    pub fn enable_intc_handler(&self, id: i32) {
        self.set_handler_enabled(IrqKind::Intc, id, true);
    }

    pub fn disable_intc_handler(&self, id: i32) {
        self.set_handler_enabled(IrqKind::Intc, id, false);
    }

    pub fn enable_dmac_handler(&self, id: i32) {
        self.set_handler_enabled(IrqKind::Dmac, id, true);
    }

    pub fn disable_dmac_handler(&self, id: i32) {
        self.set_handler_enabled(IrqKind::Dmac, id, false);
    }

    fn set_handler_enabled(&self, kind: IrqKind, id: i32, enabled: bool) {
        let mut tables = lock(&self.tables);
        let table = match kind {
            IrqKind::Intc => &mut tables.intc,
            IrqKind::Dmac => &mut tables.dmac,
        };
        if let Some(info) = table.get_mut(&id) {
            info.enabled = enabled;
        }
    }

    // --- Cause masks ----------------------------------------------------

    pub fn enable_intc(&self, cause: u32) {
        self.set_cause_enabled(IrqKind::Intc, cause, true);
    }

    pub fn disable_intc(&self, cause: u32) {
        self.set_cause_enabled(IrqKind::Intc, cause, false);
    }

    pub fn enable_dmac(&self, cause: u32) {
        self.set_cause_enabled(IrqKind::Dmac, cause, true);
    }

    pub fn disable_dmac(&self, cause: u32) {
        self.set_cause_enabled(IrqKind::Dmac, cause, false);
    }

    fn set_cause_enabled(&self, kind: IrqKind, cause: u32, enabled: bool) {
        if cause >= 32 {
            return;
        }
        let mut tables = lock(&self.tables);
        let mask = match kind {
            IrqKind::Intc => &mut tables.intc_mask,
            IrqKind::Dmac => &mut tables.dmac_mask,
        };
        if enabled {
            *mask |= 1 << cause;
        } else {
            *mask &= !(1 << cause);
        }
    }

    // --- VSync registration ---------------------------------------------

    /// Replace the one-shot VSync registration. The next delivered VBlank
    /// writes the guest flag/tick words and clears the registration.
    pub fn register_vsync(&self, flag_addr: u32, tick_addr: u32) {
        let mut vsync = lock(&self.vsync);
        vsync.flag_addr = flag_addr;
        vsync.tick_addr = tick_addr;
    }

    // --- Cooperative dispatch -------------------------------------------

    /// Drain pending VBlank ticks and deliver them.
    ///
    /// Per tick: bump the frame counter, consume the VSync registration
    /// (flag write, then tick write), then run the enabled INTC handlers for
    /// VBlank-start followed by VBlank-end. Called on the main dispatch
    /// thread with the guest execution gate held; [`Ps2Runtime::poll_vblank`]
    /// is the checked wrapper.
    pub fn poll_vblank(&self, rdram: &Rdram, runtime: &Ps2Runtime) {
        let pending = self.timer.drain().clamp(0, MAX_CATCHUP);
        for _ in 0..pending {
            let (tick, flag_addr, tick_addr) = {
                let mut vsync = lock(&self.vsync);
                vsync.tick_counter += 1;
                let registration = (vsync.flag_addr, vsync.tick_addr);
                vsync.flag_addr = 0;
                vsync.tick_addr = 0;
                (vsync.tick_counter, registration.0, registration.1)
            };

            if flag_addr != 0 {
                rdram.write_u32(flag_addr, 1);
            }
            if tick_addr != 0 {
                rdram.write_u64(tick_addr, tick);
            }

            self.dispatch_intc_handlers(rdram, runtime, IntcCause::VblankStart as u32);
            self.dispatch_intc_handlers(rdram, runtime, IntcCause::VblankEnd as u32);
        }
    }

    pub fn dispatch_intc_handlers(&self, rdram: &Rdram, runtime: &Ps2Runtime, cause: u32) {
        self.dispatch_for_cause(rdram, runtime, IrqKind::Intc, cause);
    }

    pub fn dispatch_dmac_handlers(&self, rdram: &Rdram, runtime: &Ps2Runtime, cause: u32) {
        self.dispatch_for_cause(rdram, runtime, IrqKind::Dmac, cause);
    }

    /// Fire the DMAC handlers for the channel whose register block starts at
    /// `channel_base`. Called by DMA emulation when a transfer completes.
    pub fn dispatch_dmac_for_channel(
        &self,
        rdram: &Rdram,
        runtime: &Ps2Runtime,
        channel_base: u32,
    ) {
        match DmacChannel::from_base(channel_base) {
            Some(channel) => self.dispatch_dmac_handlers(rdram, runtime, channel as u32),
            None => {
                let warned = self.unknown_channel_warns.fetch_add(1, Ordering::Relaxed);
                if warned < MAX_WARN_LINES {
                    log::warn!("DMAC completion for unknown channel base {:#010X}", channel_base);
                }
            }
        }
    }

    fn dispatch_for_cause(&self, rdram: &Rdram, runtime: &Ps2Runtime, kind: IrqKind, cause: u32) {
        // Snapshot under the lock, invoke outside it: handlers may call back
        // into add/remove without deadlocking, and membership is fixed for
        // the duration of this round.
        let snapshot: Vec<IrqHandlerInfo> = {
            let tables = lock(&self.tables);
            let (mask, table) = match kind {
                IrqKind::Intc => (tables.intc_mask, &tables.intc),
                IrqKind::Dmac => (tables.dmac_mask, &tables.dmac),
            };
            if cause < 32 && mask & (1 << cause) == 0 {
                return;
            }
            table
                .values()
                .filter(|info| info.enabled && info.cause == cause && info.handler != 0)
                .cloned()
                .collect()
        };

        for info in &snapshot {
            self.invoke_handler(rdram, runtime, kind, cause, info);
        }
    }

    fn invoke_handler(
        &self,
        rdram: &Rdram,
        runtime: &Ps2Runtime,
        kind: IrqKind,
        cause: u32,
        info: &IrqHandlerInfo,
    ) {
        let Some(func) = runtime.lookup_function(info.handler) else {
            let warned = self.missing_fn_warns.fetch_add(1, Ordering::Relaxed);
            if warned < MAX_WARN_LINES {
                log::warn!(
                    "{} handler {:#010X} has no recompiled function; skipping",
                    kind.name(),
                    info.handler
                );
            }
            return;
        };

        let mut ctx = R5900Context::new();
        ctx.set_gpr_u32(reg::GP, info.gp);
        ctx.set_gpr_u32(reg::SP, if info.sp != 0 { info.sp } else { IRQ_STACK_TOP });
        ctx.set_gpr_u32(reg::RA, 0);
        ctx.set_gpr_u32(reg::A0, cause);
        ctx.set_gpr_u32(reg::A1, info.arg);
        ctx.pc = info.handler;

        // ExitThread from a handler just ends that invocation. A panicking
        // handler must not take the dispatch thread (and every handler after
        // it) down with it.
        let result = panic::catch_unwind(AssertUnwindSafe(|| func(rdram, &mut ctx, runtime)));
        match result {
            Ok(GuestExit::Returned) | Ok(GuestExit::ThreadExit) => {}
            Err(_) => {
                let warned = self.handler_panic_warns.fetch_add(1, Ordering::Relaxed);
                if warned < MAX_WARN_LINES {
                    log::warn!(
                        "{} handler {:#010X} panicked; continuing dispatch",
                        kind.name(),
                        info.handler
                    );
                }
            }
        }
    }

    // --- Timer worker ---------------------------------------------------

    /// Start the VBlank timer worker if it is not already running.
    /// `stop_requested` is the runtime-wide shutdown flag the worker polls.
    pub fn ensure_worker_running(&self, stop_requested: Arc<AtomicBool>) {
        let _start = lock(&self.worker_start);
        if self.timer.running.load(Ordering::Acquire) {
            return;
        }

        self.timer.stop.store(false, Ordering::Release);
        self.timer.running.store(true, Ordering::Release);

        let timer = Arc::clone(&self.timer);
        let spawned = thread::Builder::new()
            .name("vblank-timer".into())
            .spawn(move || worker::worker_main(timer, stop_requested));
        if let Err(err) = spawned {
            // Roll back so a later call retries.
            self.timer.running.store(false, Ordering::Release);
            log::warn!("Failed to spawn VBlank timer worker: {}", err);
        }
    }

    /// Ask the worker to exit and wait up to 100 ms for it to do so.
    pub fn stop_worker(&self) {
        self.timer.stop.store(true, Ordering::Release);
        for _ in 0..100 {
            if !self.timer.running.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub(crate) fn worker_running(&self) -> bool {
        self.timer.running.load(Ordering::Acquire)
    }

    /// Test seam: queue ticks exactly as the worker would.
    pub(crate) fn post_vblank_ticks(&self, ticks: i32) {
        self.timer.post(ticks);
    }
}
