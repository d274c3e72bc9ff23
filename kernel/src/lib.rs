//! KaaL IPC Kernel
//!
//! The inter-process communication core of a capability-based microkernel,
//! built as a hosted library so that it runs (and is tested) outside a real
//! kernel image.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//! - `kernel`: the kernel context owning every global table
//! - `objects`: phones, mailboxes, calls and capability tables
//! - `ipc`: the call lifecycle, system methods and IRQ notifications
//! - `synch`: wait queues
//! - `scheduler`: the thread blocking boundary
//! - `memory`: address spaces and kernel side buffers
//! - `syscall`: the user-facing syscall surface
//!
//! # Example
//!
//! ```rust
//! use kaal_ipc_kernel::{IpcConfig, Kernel};
//!
//! let kernel = Kernel::new(IpcConfig::default()).unwrap();
//! let client = kernel.create_task("client").unwrap();
//! let server = kernel.create_task("server").unwrap();
//! let phone = kernel.connect_tasks(client.task().id(), server.task().id()).unwrap();
//! let call = kaal_ipc_kernel::syscall::sys_ipc_call_async(&kernel, &client, phone, 7, &[3, 4]).unwrap();
//! assert!(call > 0);
//! ```

pub mod config;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod memory;
pub mod objects;
pub mod scheduler;
pub mod stats;
pub mod synch;
pub mod syscall;
pub mod task;

pub use config::{ConfigError, IpcConfig};
pub use error::{IpcError, Result};
pub use kernel::Kernel;
pub use objects::{CallData, CapHandle};
pub use stats::StatsSnapshot;
pub use task::{Current, TaskId, TaskPerms};
