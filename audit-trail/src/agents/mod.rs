//! Supervised background tasks
//!
//! The audit pipeline's long-running loops are submitted to a
//! [`BackgroundWorker`], which tracks them by name and cancels them together
//! on shutdown.

mod background_worker;

pub use background_worker::{BackgroundWorker, TaskStatus};
