//! Worker pools backing the executors.
//!
//! A [`ThreadPool`] owns a set of worker threads created by a
//! [`ThreadFactory`] and a shared FIFO queue of work items. Two sizing policies
//! are supported:
//!
//! - [`PoolSize::Fixed`]: a fixed number of workers, spawned up front.
//! - [`PoolSize::Cached`]: no upper bound. A new worker is spawned whenever the
//!   queued work outnumbers the idle workers; workers that stay idle for the
//!   keep-alive period exit.
//!
//! Work items are fire-and-forget ([`spawn_detached`](ThreadPool::spawn_detached))
//! or deliver their result through a [`SettableFuture`]
//! ([`spawn`](ThreadPool::spawn)). A panicking work item is logged and does not
//! take its worker down.

use std::{
    any::Any,
    collections::VecDeque,
    fmt, panic,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use fanout_common::{Error, Result, verify_arg};

use crate::{settable_future::SettableFuture, thread_factory::ThreadFactory};

/// A boxed function that can be executed by a worker thread.
type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Sizing policy of a [`ThreadPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolSize {
    Fixed(usize),
    Cached { keep_alive: Duration },
}

impl PoolSize {
    pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

    /// Unbounded pool with the default keep-alive.
    pub fn cached() -> PoolSize {
        PoolSize::Cached {
            keep_alive: Self::DEFAULT_KEEP_ALIVE,
        }
    }

    /// Fixed pool with one worker per available CPU (8 if unknown).
    pub fn default_fixed() -> PoolSize {
        PoolSize::Fixed(default_parallelism())
    }
}

/// Number of logical CPUs, falling back to 8 if it cannot be determined.
pub fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8)
}

/// A pool of worker threads executing queued work items.
///
/// ## Cloning
///
/// Clones share the same workers and queue. The pool shuts down when the last
/// clone is dropped: queued items still run, then the workers exit. Workers of
/// a non-daemon factory are joined at that point; daemon workers are detached.
#[derive(Clone)]
pub struct ThreadPool(Arc<PoolOwner>);

impl ThreadPool {
    /// Creates a pool with `num_threads` workers.
    ///
    /// All workers are spawned before this returns and stay alive until the
    /// pool is dropped.
    ///
    /// # Arguments
    ///
    /// * `num_threads` - The number of worker threads. Must be greater than 0.
    /// * `factory` - Names the workers and decides their daemon flag and priority.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if `num_threads` is 0, or with `ThreadSpawn`
    /// if a worker thread cannot be created.
    pub fn fixed(num_threads: usize, factory: ThreadFactory) -> Result<ThreadPool> {
        Self::new(PoolSize::Fixed(num_threads), factory)
    }

    /// Creates an unbounded pool with the default keep-alive.
    ///
    /// No worker exists until the first work item arrives. Workers are added
    /// while queued items outnumber idle workers and exit after
    /// [`PoolSize::DEFAULT_KEEP_ALIVE`] without work.
    pub fn cached(factory: ThreadFactory) -> Result<ThreadPool> {
        Self::new(PoolSize::cached(), factory)
    }

    /// Creates a pool with one worker per available CPU.
    pub fn with_default_threads(factory: ThreadFactory) -> Result<ThreadPool> {
        Self::new(PoolSize::default_fixed(), factory)
    }

    /// Creates a pool with the given sizing policy.
    ///
    /// # Arguments
    ///
    /// * `size` - [`PoolSize::Fixed`] with a positive thread count, or
    ///   [`PoolSize::Cached`] with a non-zero keep-alive.
    /// * `factory` - Creates the worker threads. Every pool built from the same
    ///   factory continues its thread numbering.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` for a zero thread count or keep-alive, and
    /// with `ThreadSpawn` if an eagerly spawned worker cannot be created. The
    /// workers spawned before the failure are shut down.
    pub fn new(size: PoolSize, factory: ThreadFactory) -> Result<ThreadPool> {
        match size {
            PoolSize::Fixed(num_threads) => verify_arg!(num_threads, num_threads > 0),
            PoolSize::Cached { keep_alive } => verify_arg!(keep_alive, !keep_alive.is_zero()),
        }

        let pool = ThreadPool(Arc::new(PoolOwner {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                condvar: Condvar::new(),
                workers: Mutex::new(Vec::new()),
                size,
                factory,
            }),
        }));

        if let PoolSize::Fixed(num_threads) = size {
            for _ in 0..num_threads {
                pool.0.shared.lock().live_workers += 1;
                // A failure drops `pool`, which stops the workers spawned so far.
                if let Err(e) = pool.0.shared.spawn_worker() {
                    pool.0.shared.lock().live_workers -= 1;
                    return Err(e);
                }
            }
        }
        log::debug!(
            "created {:?} pool '{}'",
            size,
            pool.0.shared.factory.name()
        );
        Ok(pool)
    }

    /// Spawns a work item and returns a future for its result.
    ///
    /// If the work item panics the future is cancelled, so
    /// [`wait`](SettableFuture::wait) returns `None`.
    ///
    /// # Errors
    ///
    /// Fails with `PoolShutdown` if the pool is shutting down.
    pub fn spawn<F, R>(&self, f: F) -> Result<SettableFuture<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let result = SettableFuture::new();
        let producer = result.clone();
        self.spawn_detached(move || {
            let cancel = CancelOnDrop(&producer);
            producer.complete(f());
            drop(cancel);
        })?;
        Ok(result)
    }

    /// Queues a work item without a way to observe its completion.
    ///
    /// Fails only if the pool is shutting down. If a cached pool needs a new
    /// worker but the thread cannot be spawned while no other worker is alive,
    /// the item runs on the calling thread instead.
    pub fn spawn_detached<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.0.shared;
        let needs_worker = {
            let mut state = shared.lock();
            if state.shutdown {
                return Err(Error::pool_shutdown());
            }
            // Decided under the same lock as the push, so an expiring idle
            // worker cannot strand the item.
            let needs_worker = matches!(shared.size, PoolSize::Cached { .. })
                && state.queue.len() >= state.idle_workers;
            if needs_worker {
                state.live_workers += 1;
            }
            state.queue.push_back(Box::new(f));
            needs_worker
        };
        shared.condvar.notify_one();

        if needs_worker {
            if let Err(e) = shared.spawn_worker() {
                log::error!("{e}");
                let stranded: Vec<TaskFn> = {
                    let mut state = shared.lock();
                    state.live_workers -= 1;
                    if state.live_workers > 0 {
                        return Ok(());
                    }
                    state.queue.drain(..).collect()
                };
                for task in stranded {
                    run_task(task);
                }
            }
        }
        Ok(())
    }

    pub fn size(&self) -> PoolSize {
        self.0.shared.size
    }

    pub fn factory(&self) -> &ThreadFactory {
        &self.0.shared.factory
    }

    /// Number of workers currently alive.
    pub fn worker_count(&self) -> usize {
        self.0.shared.lock().live_workers
    }

    /// Number of workers currently waiting for work.
    pub fn idle_count(&self) -> usize {
        self.0.shared.lock().idle_workers
    }

    /// Number of work items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.0.shared.lock().queue.len()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.shared.lock();
        f.debug_struct("ThreadPool")
            .field("size", &self.0.shared.size)
            .field("factory", &self.0.shared.factory)
            .field("live_workers", &state.live_workers)
            .field("idle_workers", &state.idle_workers)
            .field("queued", &state.queue.len())
            .finish()
    }
}

/// Shuts the pool down when the last [`ThreadPool`] clone goes away.
struct PoolOwner {
    shared: Arc<Shared>,
}

impl Drop for PoolOwner {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.condvar.notify_all();
        log::debug!("shutting down pool '{}'", self.shared.factory.name());

        if self.shared.factory.is_daemon() {
            return;
        }
        let workers = std::mem::take(
            &mut *self
                .shared
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for worker in workers {
            // The last handle may be dropped by one of the pool's own work items.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

struct Shared {
    state: Mutex<PoolState>,
    condvar: Condvar,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    size: PoolSize,
    factory: ThreadFactory,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<TaskFn>,
    idle_workers: usize,
    live_workers: usize,
    shutdown: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns one worker. The caller has already counted it in `live_workers`.
    fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let shared = self.clone();
        let handle = self.factory.spawn(move || shared.worker_loop())?;
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
        Ok(())
    }

    /// Worker thread function that processes work items from the queue.
    fn worker_loop(&self) {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                drop(state);
                run_task(task);
                state = self.lock();
                continue;
            }
            if state.shutdown {
                break;
            }

            state.idle_workers += 1;
            let expired = match self.size {
                PoolSize::Fixed(_) => {
                    state = self
                        .condvar
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                    false
                }
                PoolSize::Cached { keep_alive } => {
                    let (guard, res) = self
                        .condvar
                        .wait_timeout(state, keep_alive)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                    res.timed_out() && state.queue.is_empty()
                }
            };
            state.idle_workers -= 1;
            if expired {
                log::debug!(
                    "worker '{}' idle for {:?}, exiting",
                    thread::current().name().unwrap_or_default(),
                    self.size
                );
                break;
            }
        }
        state.live_workers -= 1;
    }
}

/// Runs a work item, containing any panic it raises.
fn run_task(task: TaskFn) {
    if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(task)) {
        log::warn!(
            "work item panicked on '{}': {}",
            thread::current().name().unwrap_or("<unnamed>"),
            panic_message(payload.as_ref())
        );
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Cancels the future if the producing work item unwinds before completing it.
struct CancelOnDrop<'a, R>(&'a SettableFuture<R>);

impl<R> Drop for CancelOnDrop<'_, R> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_factory::ThreadFactory;
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::{Duration, Instant},
    };

    fn factory(name: &str) -> ThreadFactory {
        ThreadFactory::new(name, false).unwrap()
    }

    #[test]
    fn test_new_thread_pool() {
        let pool = ThreadPool::fixed(2, factory("new")).unwrap();
        assert_eq!(pool.worker_count(), 2);
        drop(pool);
    }

    #[test]
    fn test_new_thread_pool_zero_threads() {
        assert!(ThreadPool::fixed(0, factory("zero")).is_err());
        assert!(
            ThreadPool::new(
                PoolSize::Cached {
                    keep_alive: Duration::ZERO
                },
                factory("zero")
            )
            .is_err()
        );
    }

    #[test]
    fn test_with_default_threads() {
        let pool = ThreadPool::with_default_threads(factory("default")).unwrap();
        assert_eq!(pool.size(), PoolSize::Fixed(default_parallelism()));
    }

    #[test]
    fn test_spawn_simple_task() {
        let pool = ThreadPool::fixed(2, factory("simple")).unwrap();
        let future = pool.spawn(|| 42).unwrap();
        assert_eq!(future.wait(), Some(42));
    }

    #[test]
    fn test_spawn_multiple_tasks() {
        let pool = ThreadPool::fixed(2, factory("multi")).unwrap();
        let futures: Vec<_> = (0..10).map(|i| pool.spawn(move || i * 2).unwrap()).collect();
        for (i, future) in futures.into_iter().enumerate() {
            assert_eq!(future.wait(), Some(i * 2));
        }
    }

    #[test]
    fn test_panicking_task_cancels_future_and_keeps_worker() {
        let pool = ThreadPool::fixed(1, factory("panic")).unwrap();
        let failed = pool.spawn(|| -> u32 { panic!("boom") }).unwrap();
        assert_eq!(failed.wait(), None);
        assert!(failed.is_cancelled());
        assert_eq!(pool.spawn(|| 7).unwrap().wait(), Some(7));
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn test_worker_names_follow_factory() {
        let pool = ThreadPool::fixed(3, factory("named")).unwrap();
        let mut names: Vec<_> = (0..30)
            .map(|_| {
                pool.spawn(|| {
                    thread::sleep(Duration::from_millis(1));
                    thread::current().name().map(str::to_string)
                })
                .unwrap()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|f| f.wait().flatten().unwrap())
            .collect();
        names.sort();
        names.dedup();
        assert!(names.len() <= 3);
        assert!(names.iter().all(|n| n.starts_with("named - ")));
    }

    #[test]
    fn test_factory_counter_spans_pools() {
        let factory = factory("spanning");
        let first = ThreadPool::fixed(2, factory.clone()).unwrap();
        let second = ThreadPool::fixed(2, factory.clone()).unwrap();
        assert_eq!(factory.threads_created(), 4);
        let name = second
            .spawn(|| thread::current().name().map(str::to_string))
            .unwrap()
            .wait()
            .flatten()
            .unwrap();
        assert!(name == "spanning - 3" || name == "spanning - 4");
        drop(first);
    }

    #[test]
    fn test_concurrent_task_execution() {
        let pool = ThreadPool::fixed(4, factory("concurrent")).unwrap();
        let start_time = Instant::now();
        let sleep_duration = Duration::from_millis(50);

        let futures: Vec<_> = (0..4)
            .map(|_| {
                pool.spawn(move || {
                    thread::sleep(sleep_duration);
                    42
                })
                .unwrap()
            })
            .collect();

        for future in futures {
            assert_eq!(future.wait(), Some(42));
        }

        // With 4 threads running 4 tasks concurrently, should take roughly sleep_duration
        assert!(start_time.elapsed() < sleep_duration * 4);
    }

    #[test]
    fn test_cached_pool_grows_with_demand() {
        let pool = ThreadPool::cached(factory("cached")).unwrap();
        assert_eq!(pool.worker_count(), 0);

        let release = Arc::new(Mutex::new(()));
        let gate = release.lock().unwrap();
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let release = release.clone();
            let started = started.clone();
            pool.spawn_detached(move || {
                started.fetch_add(1, Ordering::SeqCst);
                let _gate = release.lock().unwrap();
            })
            .unwrap();
        }

        // All five block on the gate at once, so each needs its own worker.
        let deadline = Instant::now() + Duration::from_secs(5);
        while started.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(started.load(Ordering::SeqCst), 5);
        assert!(pool.worker_count() >= 5);
        drop(gate);
    }

    #[test]
    fn test_cached_workers_expire() {
        let pool = ThreadPool::new(
            PoolSize::Cached {
                keep_alive: Duration::from_millis(20),
            },
            factory("expiring"),
        )
        .unwrap();
        assert_eq!(pool.spawn(|| 1).unwrap().wait(), Some(1));

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.worker_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.spawn(|| 2).unwrap().wait(), Some(2));
    }

    #[test]
    fn test_drop_drains_queue_for_non_daemon_pool() {
        let pool = ThreadPool::fixed(1, factory("draining")).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.spawn_detached(move || {
                thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_daemon_pool_detaches_on_drop() {
        let pool = ThreadPool::fixed(1, ThreadFactory::new("daemon", true).unwrap()).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.spawn_detached(move || {
            thread::sleep(Duration::from_millis(30));
            tx.send(()).unwrap();
        })
        .unwrap();
        let started = Instant::now();
        drop(pool);
        assert!(started.elapsed() < Duration::from_millis(30));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_thread_pool_clone() {
        let pool1 = ThreadPool::fixed(2, factory("clone")).unwrap();
        let pool2 = pool1.clone();

        let future1 = pool1.spawn(|| "from pool1").unwrap();
        let future2 = pool2.spawn(|| "from pool2").unwrap();

        assert_eq!(future1.wait(), Some("from pool1"));
        assert_eq!(future2.wait(), Some("from pool2"));
    }

    #[test]
    fn test_recursive_task_spawning() {
        let pool = ThreadPool::fixed(2, factory("recursive")).unwrap();
        let pool_clone = pool.clone();

        let future = pool
            .spawn(move || {
                let inner = pool_clone.spawn(|| 100).unwrap();
                inner.wait().unwrap() + 50
            })
            .unwrap();

        assert_eq!(future.wait(), Some(150));
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| -> u8 { panic!("static message") }).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload = panic::catch_unwind(|| -> u8 { panic!("formatted {}", 5) }).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 5");
    }
}
