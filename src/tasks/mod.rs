//! Background Tasks Module
//!
//! Contains background tasks that run periodically alongside a shared cache.
//!
//! # Tasks
//! - TTL Sweep: Reaps expired cache entries and purges freed value storage at
//!   configured intervals

mod cleanup;

pub use cleanup::spawn_sweep_task;
