//! Synchronization primitives

pub mod waitq;

pub use waitq::{SleepFlags, SleepResult, WaitQueue, WaitQueueGuard, WakeupMode};
