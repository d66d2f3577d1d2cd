//! Background VBlank ticker.
//!
//! The worker only posts tick *events*: it never touches guest memory, never
//! takes the handler-table lock, and never runs guest code. Delivery happens
//! on the main dispatch thread via `poll_vblank`, which owns the guest
//! execution gate — the same shape as the real EE, where interrupts fire on
//! the one core at instruction boundaries.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use super::{MAX_CATCHUP, VBLANK_PERIOD};

pub(super) struct VblankTimer {
    /// Ticks posted by the worker, drained by `poll_vblank`.
    pub(super) pending: AtomicI32,
    pub(super) running: AtomicBool,
    pub(super) stop: AtomicBool,
}

impl VblankTimer {
    pub(super) fn new() -> Self {
        Self {
            pending: AtomicI32::new(0),
            running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    pub(super) fn post(&self, ticks: i32) {
        self.pending.fetch_add(ticks, Ordering::Release);
    }

    pub(super) fn drain(&self) -> i32 {
        self.pending.swap(0, Ordering::AcqRel)
    }
}

pub(super) fn worker_main(timer: Arc<VblankTimer>, stop_requested: Arc<AtomicBool>) {
    let mut next_tick = Instant::now() + VBLANK_PERIOD;

    while !timer.stop.load(Ordering::Acquire) && !stop_requested.load(Ordering::Acquire) {
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        }

        // Count periods that elapsed while we slept (or while the host
        // descheduled us), capped so a long stall does not turn into a burst.
        let now = Instant::now();
        let mut ticks = 0;
        while now >= next_tick && ticks < MAX_CATCHUP {
            ticks += 1;
            next_tick += VBLANK_PERIOD;
        }
        if ticks == 0 {
            continue;
        }

        timer.post(ticks);
    }

    log::debug!("VBlank timer worker exiting");
    timer.running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_and_drain_accumulate() {
        let timer = VblankTimer::new();
        timer.post(2);
        timer.post(3);
        assert_eq!(timer.drain(), 5);
        assert_eq!(timer.drain(), 0);
    }

    #[test]
    fn worker_exits_on_stop_flag() {
        let timer = Arc::new(VblankTimer::new());
        let stop_requested = Arc::new(AtomicBool::new(false));
        timer.running.store(true, Ordering::Release);

        let handle = {
            let timer = Arc::clone(&timer);
            let stop_requested = Arc::clone(&stop_requested);
            thread::spawn(move || worker_main(timer, stop_requested))
        };

        timer.stop.store(true, Ordering::Release);
        handle.join().unwrap();
        assert!(!timer.running.load(Ordering::Acquire));
    }

    #[test]
    fn worker_posts_ticks_over_time() {
        let timer = Arc::new(VblankTimer::new());
        let stop_requested = Arc::new(AtomicBool::new(false));
        timer.running.store(true, Ordering::Release);

        let handle = {
            let timer = Arc::clone(&timer);
            let stop_requested = Arc::clone(&stop_requested);
            thread::spawn(move || worker_main(timer, stop_requested))
        };

        // Three periods is enough for at least one tick even on a loaded host.
        thread::sleep(3 * VBLANK_PERIOD);
        timer.stop.store(true, Ordering::Release);
        handle.join().unwrap();

        assert!(timer.drain() >= 1);
    }
}
