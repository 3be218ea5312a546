//! Async Effect Toolkit
#![warn(missing_debug_implementations)]

mod log;

pub mod task;
pub mod notify;

pub mod client;
pub mod fs;
pub mod proc;

pub use task::{CancelHandle, Canceled, Settle, Task};
pub use notify::{Mailbox, Subscription};
