//! The scheduler: owns the shared state and the processor pool.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, builder, constructor, and accessor methods
//! - `dispatch`: submit / notify / remove
//! - `lifecycle`: starting and stopping the processor pool

mod core;
mod dispatch;
mod lifecycle;
#[cfg(test)]
mod tests;

pub use self::core::{Scheduler, SchedulerBuilder};
