//! Fan-out/join execution of independent tasks.
//!
//! The central abstraction is [`ParallelExecutor`]: hand it a set of tasks,
//! it runs them "in parallel if supported" and blocks the calling thread until
//! every task finished. On top of that single primitive it offers fan-out over
//! sequences, indexed sequences and key/value pairs, as well as deferred
//! batches that are flushed in one run.
//!
//! # Key Components
//!
//! ## Executors
//!
//! - [`sync_executor::SynchronousExecutor`] - Dispatches tasks to a worker pool
//!   and joins on a barrier. A lazily created process-wide instance is
//!   available through [`SynchronousExecutor::global`].
//! - [`sequential::SequentialExecutor`] - Runs tasks inline on the caller.
//!
//! Both report progress to an attached [`executor::ProgressMonitor`] and
//! summarize task failures in an [`executor::ExecutionReport`].
//!
//! ## Thread Management
//!
//! - [`thread_factory::ThreadFactory`] - Names worker threads `"<name> - <n>"`
//!   and applies daemon and priority settings
//! - [`thread_pool::ThreadPool`] - Fixed-size or cached (grow on demand,
//!   expire when idle) pool of worker threads
//!
//! ## Synchronization
//!
//! - [`settable_future::SettableFuture`] - Write-once result slot with
//!   completion, cancellation and timeout hooks
//! - [`join_barrier::JoinBarrier`] - Countdown latch used to join a fan-out
//! - [`interrupt::Interrupt`] - Cooperative cancellation token that wakes
//!   blocked waiters
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use fanout_workflow::{ParallelExecutor, SynchronousExecutor};
//!
//! let executor = SynchronousExecutor::with_fixed_pool(4).unwrap();
//! let sum = Arc::new(AtomicUsize::new(0));
//! let report = executor.for_each(1..=10, {
//!     let sum = sum.clone();
//!     move |i| {
//!         sum.fetch_add(i, Ordering::Relaxed);
//!     }
//! });
//! assert!(report.is_clean());
//! assert_eq!(sum.load(Ordering::Relaxed), 55);
//! ```

pub mod batch;
pub mod executor;
pub mod fan_out;
pub mod interrupt;
pub mod join_barrier;
pub mod sequential;
pub mod settable_future;
pub mod sync_executor;
pub mod thread_factory;
pub mod thread_pool;

pub use executor::{ExecutionReport, ObservableExecutor, ParallelExecutor, ProgressMonitor, Task};
pub use interrupt::Interrupt;
pub use sequential::SequentialExecutor;
pub use settable_future::SettableFuture;
pub use sync_executor::SynchronousExecutor;
pub use thread_factory::{ThreadFactory, ThreadPriority};
pub use thread_pool::{PoolSize, ThreadPool};
