//! Fan-out executor backed by a worker pool.
//!
//! [`SynchronousExecutor`] dispatches every task of a run to its
//! [`ThreadPool`] and blocks the calling thread on a [`JoinBarrier`] until all
//! of them signalled. Compared to handing work to a general-purpose pool, it
//! lets the caller pick the pool size (fixed or unbounded), the worker names
//! and their priority, which matters for many high-latency, low-CPU tasks.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use fanout_common::Result;

use crate::{
    batch::BatchQueue,
    executor::{
        ExecutionReport, FanOutRun, MonitorSlot, ObservableExecutor, ParallelExecutor,
        ProgressMonitor, Task, with_known_len,
    },
    interrupt::Interrupt,
    join_barrier::JoinBarrier,
    thread_factory::{ThreadFactory, ThreadPriority},
    thread_pool::{PoolSize, ThreadPool, default_parallelism},
};

/// Executes task sets on a worker pool and joins on their completion.
///
/// Concurrent runs on one executor each get their own barrier and progress
/// counter; they share the pool, so their tasks may interleave.
pub struct SynchronousExecutor {
    pool: ThreadPool,
    batch: BatchQueue,
    monitor: MonitorSlot,
}

impl SynchronousExecutor {
    /// Starts configuring an executor. See [`SynchronousExecutorBuilder`] for
    /// the defaults.
    pub fn builder() -> SynchronousExecutorBuilder {
        SynchronousExecutorBuilder::default()
    }

    /// Runs tasks on `pool`.
    ///
    /// The pool may be shared with other executors or with direct
    /// [`ThreadPool::spawn`] callers; their work items queue behind each other.
    pub fn with_pool(pool: ThreadPool) -> SynchronousExecutor {
        SynchronousExecutor {
            pool,
            batch: BatchQueue::new(),
            monitor: MonitorSlot::default(),
        }
    }

    /// Executor with an unbounded number of threads.
    ///
    /// Suited to many blocking, low-CPU tasks: every task that finds no idle
    /// worker gets a new thread. Threads are named `fanout-worker - <n>`.
    ///
    /// # Errors
    ///
    /// Never fails with the default configuration; the `Result` mirrors the
    /// other constructors.
    pub fn with_cached_pool() -> Result<SynchronousExecutor> {
        Self::builder().cached().build()
    }

    /// Executor with exactly `num_threads` threads.
    ///
    /// # Arguments
    ///
    /// * `num_threads` - The number of worker threads. Must be greater than 0.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if `num_threads` is 0, or with `ThreadSpawn`
    /// if a worker thread cannot be created.
    ///
    /// # Examples
    ///
    /// ```
    /// use fanout_workflow::{ParallelExecutor, SynchronousExecutor};
    ///
    /// assert!(SynchronousExecutor::with_fixed_pool(0).is_err());
    ///
    /// let executor = SynchronousExecutor::with_fixed_pool(2).unwrap();
    /// assert_eq!(executor.pool().worker_count(), 2);
    /// assert!(executor.execute((0..4).map(|_| || {})).is_clean());
    /// ```
    pub fn with_fixed_pool(num_threads: usize) -> Result<SynchronousExecutor> {
        Self::builder().fixed(num_threads).build()
    }

    /// Executor with one thread per available CPU (8 if unknown).
    ///
    /// # Errors
    ///
    /// Fails with `ThreadSpawn` if a worker thread cannot be created.
    pub fn with_default_fixed_pool() -> Result<SynchronousExecutor> {
        Self::builder().default_fixed().build()
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Configures the size of the global executor's pool.
    ///
    /// # Arguments
    ///
    /// * `pool_size` - The number of threads of the global executor. Values
    ///   less than 1 are clamped to 1.
    ///
    /// # Thread Safety
    ///
    /// May be called from any thread, but only the last call made before the
    /// first [`global()`](Self::global) takes effect. Later calls are ignored.
    pub fn configure_global_pool_size(pool_size: usize) {
        GLOBAL_POOL_SIZE.store(pool_size.max(1), Ordering::SeqCst);
    }

    /// Returns the lazily created process-wide executor.
    ///
    /// The executor is created on the first call. Its pool size is determined by:
    /// 1. A value previously set via
    ///    [`configure_global_pool_size()`](Self::configure_global_pool_size), or
    /// 2. The number of available CPUs (8 if unknown).
    ///
    /// The workers are daemon threads named `fanout-global - <n>`, so they do
    /// not keep the process alive.
    ///
    /// # Panics
    ///
    /// Panics if the worker threads cannot be spawned.
    pub fn global() -> &'static SynchronousExecutor {
        static EXECUTOR: OnceLock<SynchronousExecutor> = OnceLock::new();
        EXECUTOR.get_or_init(|| {
            Self::builder()
                .fixed(Self::get_global_pool_size())
                .name("fanout-global")
                .daemon(true)
                .build()
                .expect("spawn global executor threads")
        })
    }

    fn get_global_pool_size() -> usize {
        match GLOBAL_POOL_SIZE.load(Ordering::SeqCst) {
            0 => default_parallelism(),
            size => size,
        }
    }

    fn fan_out(
        &self,
        total: usize,
        tasks: &mut dyn Iterator<Item = Task>,
        interrupt: Option<&Interrupt>,
    ) -> ExecutionReport {
        let run = FanOutRun::start(total, self.monitor.snapshot());
        let barrier = Arc::new(JoinBarrier::new(total));

        let mut dispatched = 0;
        for task in (&mut *tasks).take(total) {
            dispatched += 1;
            let signal = barrier.signal_on_drop();
            let worker_run = run.clone();
            let job = move || {
                worker_run.run_task(task);
                drop(signal);
            };
            if let Err(e) = self.pool.spawn_detached(job) {
                // The rejected job was dropped, which already signalled the barrier.
                run.skip_task(e.to_string());
            }
        }
        if dispatched < total {
            log::warn!("task iterator announced {total} tasks but yielded {dispatched}");
            for _ in dispatched..total {
                run.skip_task("task missing from iterator".to_string());
                barrier.count_down();
            }
        }

        let opened = match interrupt {
            Some(interrupt) => barrier.wait_interruptible(interrupt),
            None => {
                barrier.wait();
                true
            }
        };
        let mut report = run.report(!opened);

        if opened {
            let mut rest = tasks.peekable();
            if rest.peek().is_some() {
                log::warn!("task iterator yielded more than the announced {total} tasks");
                report.merge(self.execute_tasks(&mut rest, interrupt));
            }
        }
        report
    }
}

impl ParallelExecutor for SynchronousExecutor {
    /// Dispatches every task to the pool and blocks until all of them
    /// finished or `interrupt` is raised.
    ///
    /// With a monitor attached, the monitor is read once up front and receives
    /// `(0, total)` followed by one update per finished task.
    fn execute_tasks(
        &self,
        tasks: &mut dyn Iterator<Item = Task>,
        interrupt: Option<&Interrupt>,
    ) -> ExecutionReport {
        with_known_len(tasks, |total, tasks| self.fan_out(total, tasks, interrupt))
    }

    fn batch_queue(&self) -> &BatchQueue {
        &self.batch
    }
}

impl ObservableExecutor for SynchronousExecutor {
    fn set_progress_monitor(&self, monitor: Option<Arc<dyn ProgressMonitor>>) {
        self.monitor.set(monitor);
    }

    fn progress_monitor(&self) -> Option<Arc<dyn ProgressMonitor>> {
        self.monitor.snapshot()
    }
}

impl std::fmt::Debug for SynchronousExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronousExecutor")
            .field("pool", &self.pool)
            .field("batch", &self.batch)
            .field("monitored", &self.monitor.snapshot().is_some())
            .finish()
    }
}

/// Configures a [`SynchronousExecutor`] and its worker pool.
///
/// Defaults: fixed pool with one thread per CPU, non-daemon threads named
/// `fanout-worker - <n>` at normal priority. A pool that is cached keeps idle
/// threads for [`PoolSize::DEFAULT_KEEP_ALIVE`].
#[derive(Clone, Debug)]
pub struct SynchronousExecutorBuilder {
    size: SizeChoice,
    keep_alive: Duration,
    name: Option<String>,
    daemon: bool,
    priority: ThreadPriority,
    factory: Option<ThreadFactory>,
}

#[derive(Clone, Copy, Debug)]
enum SizeChoice {
    Cached,
    Fixed(usize),
    DefaultFixed,
}

impl Default for SynchronousExecutorBuilder {
    fn default() -> Self {
        SynchronousExecutorBuilder {
            size: SizeChoice::DefaultFixed,
            keep_alive: PoolSize::DEFAULT_KEEP_ALIVE,
            name: None,
            daemon: false,
            priority: ThreadPriority::NORMAL,
            factory: None,
        }
    }
}

impl SynchronousExecutorBuilder {
    /// Unbounded pool.
    pub fn cached(mut self) -> Self {
        self.size = SizeChoice::Cached;
        self
    }

    /// Pool of exactly `num_threads` threads.
    pub fn fixed(mut self, num_threads: usize) -> Self {
        self.size = SizeChoice::Fixed(num_threads);
        self
    }

    /// Pool with one thread per available CPU.
    pub fn default_fixed(mut self) -> Self {
        self.size = SizeChoice::DefaultFixed;
        self
    }

    /// How long an idle thread of a cached pool waits for work before exiting.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Uses `factory` for the pool's threads, overriding `name`, `daemon` and
    /// `priority`.
    pub fn thread_factory(mut self, factory: ThreadFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Validates the configuration and starts the pool.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` for a zero fixed size, a zero keep-alive
    /// or a blank name, and with `ThreadSpawn` if a worker cannot be created.
    pub fn build(self) -> Result<SynchronousExecutor> {
        let factory = match self.factory {
            Some(factory) => factory,
            None => ThreadFactory::builder(
                self.name
                    .unwrap_or_else(|| ThreadFactory::DEFAULT_NAME.to_string()),
            )
            .daemon(self.daemon)
            .priority(self.priority)
            .build()?,
        };
        let size = match self.size {
            SizeChoice::Cached => PoolSize::Cached {
                keep_alive: self.keep_alive,
            },
            SizeChoice::Fixed(num_threads) => PoolSize::Fixed(num_threads),
            SizeChoice::DefaultFixed => PoolSize::default_fixed(),
        };
        Ok(SynchronousExecutor::with_pool(ThreadPool::new(size, factory)?))
    }
}

/// Global configuration for the global executor's pool size.
///
/// A value of 0 means no explicit size was configured.
static GLOBAL_POOL_SIZE: AtomicUsize = AtomicUsize::new(0);
