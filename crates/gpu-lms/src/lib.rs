//! # gpu-lms: large-model-support swapping for device memory
//!
//! This crate schedules host/device transfers for training runtimes whose
//! per-iteration working set exceeds device memory. A training iteration
//! performs a deterministic sequence of array accesses; the scheduler
//! records that sequence once, plans asynchronous prefetches and evictions
//! around every compute function, and replays the plan on later iterations
//! so each function finds its inputs resident without the device budget
//! ever being exceeded.
//!
//! ## Architecture
//!
//! ```text
//!  compute graph hooks          array accesses
//!        │                            │
//!        ▼                            ▼
//!  ┌────────────┐  record/trace  ┌──────────┐
//!  │ Scheduler  │◀───────────────│ AccessHook│◀── SyncedArray get/cast/clear
//!  │ (executor) │                └──────────┘
//!  └─────┬──────┘
//!        │ iteration 0: AccessTrace ──▶ planner ──▶ FunctionSchedules
//!        │ iteration n: prefetch / evict / wait per function
//!        ▼
//!  SyncedArray store (host ⇄ device residency)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use gpu_lms::{
//!     AccessHook, AsyncFlags, Context, Dtype, SchedulerConfig, SwapInOutScheduler,
//!     SyncedArray,
//! };
//!
//! # fn main() -> gpu_lms::Result<()> {
//! let hook = AccessHook::new();
//! let config = SchedulerConfig::new(
//!     Context::new("CpuCachedArray"),
//!     Context::new("CudaCachedArray"),
//!     8 * 1024 * 1024 * 1024,
//! );
//! let scheduler = SwapInOutScheduler::new(config, hook.clone());
//!
//! let weights = SyncedArray::new(hook.clone(), 1024 * 1024);
//! let device = Context::new("CudaCachedArray");
//!
//! // One training iteration, driven by the graph executor's hooks.
//! scheduler.start_scheduling();
//! scheduler.pre_function_callback()?;
//! weights.get(Dtype::Float32, &device, AsyncFlags::NONE)?;
//! scheduler.post_function_callback();
//! scheduler.pre_update_callback()?;
//! scheduler.post_update_callback();
//! scheduler.end_scheduling()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
mod dali;
pub mod error;
pub mod hook;
pub mod schedule;
pub mod scheduler;
pub mod tensor;
pub mod trace;

pub use config::SchedulerConfig;
pub use error::{Error, ErrorKind, Result};
pub use hook::{AccessHook, AccessKind, AccessObserver, DeviceSynchronizer, NullSynchronizer};
pub use schedule::FunctionSchedules;
pub use scheduler::{SchedulerStats, SwapInOutScheduler};
pub use tensor::{AsyncFlags, Context, Dtype, SyncedArray, SyncedArrayRef, SyncedArrayWeak};
pub use trace::{RecTag, RecordInfo, SyncedArrayId};
