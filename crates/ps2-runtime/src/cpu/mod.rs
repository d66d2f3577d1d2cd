pub mod r5900;

pub use r5900::{reg, R5900Context};
