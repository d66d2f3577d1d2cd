pub mod cpu;
pub mod irq;
pub mod memory;
pub mod runtime;
pub mod syscalls;

pub use runtime::{GuestExit, Ps2Runtime};
