//! backburner-core
//!
//! Deferred-task scheduling with two interchangeable backends behind one
//! [`store::TaskStore`] contract:
//! - **memory**: a sorted in-process timer queue for ephemeral tasks
//! - **persistent**: SQLite-backed rows with status tracking and crash
//!   recovery
//!
//! Around them:
//! - **hook**: the unit of work (named registry dispatch or callable
//!   objects)
//! - **scheduler**: the timer loop driving `run()` plus the bounded
//!   dispatch pool
//! - **lrt**: admission control for long-running tasks
//! - **proxy**: the wire shapes used to forward operations to a daemon

pub mod clock;
pub mod config;
pub mod error;
pub mod hook;
pub mod lrt;
pub mod memory;
pub mod persistent;
pub mod proxy;
pub mod record;
pub mod scheduler;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Result, TaskError};
pub use hook::{Hook, HookRef, HookRegistry, Params};
pub use memory::MemoryTaskStore;
pub use persistent::{PersistentTaskStore, TaskDb, TaskStatus};
pub use record::TaskRecord;
pub use scheduler::{Dispatcher, Scheduler};
pub use store::TaskStore;
