pub mod channel;
pub mod config;
pub mod consumer;
pub mod core;
mod errors;
pub mod lifecycle;
pub mod producer;
pub mod sched;
pub mod shutdown;
pub mod sink;
pub mod timing;

#[cfg(test)]
mod tests;

pub use crate::errors::{AudioShmError, Result, SinkError, StartupError};

pub const MAX_SLOTS: usize = core::MAX_SLOTS;
