use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::cpu::R5900Context;
use crate::irq::InterruptController;
use crate::memory::Rdram;

/// Outcome of a recompiled guest function.
///
/// The EE kernel's ExitThread control flow is carried back through the ABI as
/// a tag rather than by unwinding; every dispatch site checks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestExit {
    /// Normal return to the caller.
    Returned,
    /// The guest called ExitThread — unwind to the host dispatch loop.
    ThreadExit,
}

/// A native function compiled from one guest function.
///
/// Callers must hold the guest execution gate for the duration of the call.
pub type RecompiledFn =
    Arc<dyn Fn(&Rdram, &mut R5900Context, &Ps2Runtime) -> GuestExit + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no recompiled function registered for guest address {0:#010X}")]
    MissingFunction(u32),
}

/// Host filesystem roots backing the guest device prefixes.
///
/// Unset roots fall back as the path resolver documents: host and CD roots
/// fall back to the ELF directory, the memory card to `<elf>/mc0`.
#[derive(Debug, Clone, Default)]
pub struct IoPaths {
    pub host_root: Option<PathBuf>,
    pub cd_root: Option<PathBuf>,
    pub mc_root: Option<PathBuf>,
    pub elf_directory: Option<PathBuf>,
}

/// Locks a mutex, ignoring poison.
///
/// Handler panics are contained by dispatch before any of these locks could
/// be held, so a poisoned mutex carries no extra information here.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The host-side runtime that recompiled EE code calls back into.
///
/// Owns the recompiled-function registry, the guest execution gate, the
/// interrupt controller, and the main-dispatch-thread identity. One value
/// exists per emulated process; every piece of state that used to be a
/// process-wide static lives here.
pub struct Ps2Runtime {
    /// Guest entry address → native function.
    functions: Mutex<HashMap<u32, RecompiledFn>>,

    /// Guest execution gate. The EE is single-core: exactly one host thread
    /// runs recompiled code at a time, and blocking syscalls release this
    /// before waiting and reacquire it before touching guest state again.
    exec_gate: Mutex<()>,

    /// The main dispatch thread — the only thread that polls VBlank.
    main_thread: Mutex<Option<ThreadId>>,

    /// Set by `request_stop`; polled by the VBlank timer worker.
    stop_requested: Arc<AtomicBool>,

    io_paths: Mutex<IoPaths>,

    /// Hit counts for syscalls with no implementation, keyed by encoded id.
    /// Each id is logged once, on first encounter.
    todo_syscalls: Mutex<HashMap<u32, u64>>,

    irq: InterruptController,
}

impl Ps2Runtime {
    pub fn new() -> Self {
        Self {
            functions: Mutex::new(HashMap::new()),
            exec_gate: Mutex::new(()),
            main_thread: Mutex::new(None),
            stop_requested: Arc::new(AtomicBool::new(false)),
            io_paths: Mutex::new(IoPaths::default()),
            todo_syscalls: Mutex::new(HashMap::new()),
            irq: InterruptController::new(),
        }
    }

    pub fn irq(&self) -> &InterruptController {
        &self.irq
    }

    /// Register the native function for a guest entry address.
    /// Re-registering an address replaces the previous entry.
    pub fn register_function<F>(&self, addr: u32, func: F)
    where
        F: Fn(&Rdram, &mut R5900Context, &Ps2Runtime) -> GuestExit + Send + Sync + 'static,
    {
        lock(&self.functions).insert(addr, Arc::new(func));
    }

    pub fn lookup_function(&self, addr: u32) -> Option<RecompiledFn> {
        lock(&self.functions).get(&addr).cloned()
    }

    pub fn has_function(&self, addr: u32) -> bool {
        lock(&self.functions).contains_key(&addr)
    }

    /// Invoke the recompiled function at `addr`.
    ///
    /// The caller must hold the guest execution gate.
    pub fn call(
        &self,
        rdram: &Rdram,
        ctx: &mut R5900Context,
        addr: u32,
    ) -> Result<GuestExit, RuntimeError> {
        let func = self
            .lookup_function(addr)
            .ok_or(RuntimeError::MissingFunction(addr))?;
        ctx.pc = addr;
        Ok(func(rdram, ctx, self))
    }

    /// Acquire the guest execution gate.
    ///
    /// Hold the returned guard across any call into recompiled code. Blocking
    /// syscall paths must drop it before waiting and re-lock on wake; holding
    /// it across a wait deadlocks the process.
    pub fn lock_guest_exec(&self) -> MutexGuard<'_, ()> {
        lock(&self.exec_gate)
    }

    /// Record the calling thread as the main dispatch thread.
    /// A later call from another thread takes over the role.
    pub fn set_main_thread(&self) {
        *lock(&self.main_thread) = Some(thread::current().id());
    }

    pub fn is_main_thread(&self) -> bool {
        *lock(&self.main_thread) == Some(thread::current().id())
    }

    /// Drain pending VBlank ticks and dispatch INTC handlers on this thread.
    ///
    /// Only the main dispatch thread delivers interrupts; calls from any
    /// other thread are no-ops. The caller must hold the guest execution
    /// gate, since registered handlers run inline.
    pub fn poll_vblank(&self, rdram: &Rdram) {
        if !self.is_main_thread() {
            return;
        }
        self.irq.poll_vblank(rdram, self);
    }

    /// Entry point for DMA-channel emulation: fire the DMAC handlers for the
    /// channel whose register block starts at `channel_base`.
    pub fn dispatch_dmac_for_channel(&self, rdram: &Rdram, channel_base: u32) {
        self.irq.dispatch_dmac_for_channel(rdram, self, channel_base);
    }

    /// Lazily start the VBlank timer worker.
    pub fn ensure_vblank_worker(&self) {
        self.irq
            .ensure_worker_running(Arc::clone(&self.stop_requested));
    }

    /// Signal shutdown: the timer worker exits within one period, and
    /// recompiled dispatch loops should wind down at their next check.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.irq.stop_worker();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn set_io_paths(&self, paths: IoPaths) {
        *lock(&self.io_paths) = paths;
    }

    pub fn io_paths(&self) -> IoPaths {
        lock(&self.io_paths).clone()
    }

    /// Count an unimplemented syscall; logs once per unique id.
    pub fn record_todo_syscall(&self, encoded_id: u32) {
        let mut seen = lock(&self.todo_syscalls);
        let count = seen.entry(encoded_id).or_insert(0);
        if *count == 0 {
            log::warn!("Unimplemented syscall {:#010X}", encoded_id);
        }
        *count += 1;
    }

    /// Dump summary of all unimplemented syscalls encountered.
    pub fn dump_todo_summary(&self) {
        let seen = lock(&self.todo_syscalls);
        if seen.is_empty() {
            return;
        }
        let mut entries: Vec<_> = seen.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1));
        eprintln!("=== Unimplemented syscall summary ===");
        for (id, count) in &entries {
            eprintln!("  {:#010X} hit {} time(s)", id, count);
        }
    }
}

impl Drop for Ps2Runtime {
    fn drop(&mut self) {
        self.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn registry_lookup_and_call() {
        let runtime = Ps2Runtime::new();
        let rdram = Rdram::new();
        runtime.register_function(0x0010_0000, |rdram, ctx, _runtime| {
            rdram.write_u32(0x2000, ctx.pc);
            GuestExit::Returned
        });

        assert!(runtime.has_function(0x0010_0000));
        assert!(!runtime.has_function(0x0010_0004));

        let mut ctx = R5900Context::new();
        let exit = runtime.call(&rdram, &mut ctx, 0x0010_0000);
        assert!(matches!(exit, Ok(GuestExit::Returned)));
        assert_eq!(rdram.read_u32(0x2000), 0x0010_0000);

        let missing = runtime.call(&rdram, &mut ctx, 0x0010_0004);
        assert!(matches!(
            missing,
            Err(RuntimeError::MissingFunction(0x0010_0004))
        ));
    }

    #[test]
    fn exec_gate_serializes_guest_code() {
        let runtime = Arc::new(Ps2Runtime::new());
        let inside = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicU32::new(0));

        let mut threads = Vec::new();
        for _ in 0..8 {
            let runtime = Arc::clone(&runtime);
            let inside = Arc::clone(&inside);
            let entries = Arc::clone(&entries);
            threads.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _guard = runtime.lock_guest_exec();
                    assert!(!inside.swap(true, Ordering::SeqCst), "gate violated");
                    entries.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(10));
                    inside.store(false, Ordering::SeqCst);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 8 * 50);
    }

    #[test]
    fn main_thread_identity_tracks_latest_caller() {
        let runtime = Arc::new(Ps2Runtime::new());
        assert!(!runtime.is_main_thread());

        runtime.set_main_thread();
        assert!(runtime.is_main_thread());

        let handle = {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                assert!(!runtime.is_main_thread());
                runtime.set_main_thread();
                assert!(runtime.is_main_thread());
            })
        };
        handle.join().unwrap();

        // The spawned thread took over the role.
        assert!(!runtime.is_main_thread());
    }

    #[test]
    fn todo_syscalls_are_counted_per_id() {
        let runtime = Ps2Runtime::new();
        runtime.record_todo_syscall(0x77);
        runtime.record_todo_syscall(0x77);
        runtime.record_todo_syscall(0x99);
        let seen = lock(&runtime.todo_syscalls);
        assert_eq!(seen.get(&0x77), Some(&2));
        assert_eq!(seen.get(&0x99), Some(&1));
    }

    #[test]
    fn io_paths_round_trip() {
        let runtime = Ps2Runtime::new();
        runtime.set_io_paths(IoPaths {
            host_root: Some(PathBuf::from("/tmp/game")),
            ..IoPaths::default()
        });
        assert_eq!(
            runtime.io_paths().host_root.as_deref(),
            Some(std::path::Path::new("/tmp/game"))
        );
    }
}
