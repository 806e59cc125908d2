//! Run orchestration.
//!
//! Owns the scan/dispatch loop, bounded admission of executions and post-run processing
//! (completion markers, terminal state, work-dir cleanup, notifications). The CLI layer only
//! builds an `Orchestrator` and drives it.

mod controller;
mod post_process;
mod slots;


pub use controller::{CycleReport, Orchestrator};
pub use slots::{ConcurrencyController, Slot};
