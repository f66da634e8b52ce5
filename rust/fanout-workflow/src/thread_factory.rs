//! Named, prioritized worker thread creation.
//!
//! A [`ThreadFactory`] hands out threads whose display names follow the
//! `"<name> - <n>"` scheme, where `n` comes from a per-factory counter that
//! starts at 1. Clones of a factory share the counter, so several pools built
//! from the same factory never reuse a number.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use fanout_common::{Error, Result, verify_arg};

/// Scheduling priority of a worker thread, on a `1..=10` scale.
///
/// On Linux the priority is applied to each worker as a nice value relative to
/// [`NORMAL`](Self::NORMAL). Raising the priority above normal usually requires
/// elevated privileges; when the adjustment is refused the worker keeps running
/// at its inherited priority. On other platforms the value is recorded only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadPriority(u8);

impl ThreadPriority {
    pub const MIN: ThreadPriority = ThreadPriority(1);
    pub const NORMAL: ThreadPriority = ThreadPriority(5);
    pub const MAX: ThreadPriority = ThreadPriority(10);

    /// Creates a priority, rejecting values outside `MIN..=MAX`.
    pub fn new(value: u8) -> Result<ThreadPriority> {
        verify_arg!(
            priority,
            (ThreadPriority::MIN.0..=ThreadPriority::MAX.0).contains(&value)
        );
        Ok(ThreadPriority(value))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Nice value corresponding to this priority (`NORMAL` maps to 0).
    pub fn nice_value(self) -> i32 {
        (i32::from(Self::NORMAL.0) - i32::from(self.0)) * 2
    }
}

impl Default for ThreadPriority {
    fn default() -> Self {
        ThreadPriority::NORMAL
    }
}

impl fmt::Display for ThreadPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produces worker threads for a pool.
///
/// The daemon flag decides what happens to the threads when their pool is
/// dropped: daemon workers are detached, non-daemon workers are joined once
/// the pool's queue has drained.
#[derive(Clone)]
pub struct ThreadFactory(Arc<FactoryInner>);

struct FactoryInner {
    name: String,
    daemon: bool,
    priority: ThreadPriority,
    counter: AtomicUsize,
}

impl ThreadFactory {
    pub const DEFAULT_NAME: &'static str = "fanout-worker";

    /// Creates a factory with normal priority.
    pub fn new(name: impl Into<String>, daemon: bool) -> Result<ThreadFactory> {
        Self::builder(name).daemon(daemon).build()
    }

    /// Creates a factory with the given priority.
    pub fn with_priority(
        name: impl Into<String>,
        daemon: bool,
        priority: ThreadPriority,
    ) -> Result<ThreadFactory> {
        Self::builder(name).daemon(daemon).priority(priority).build()
    }

    pub fn builder(name: impl Into<String>) -> ThreadFactoryBuilder {
        ThreadFactoryBuilder {
            name: name.into(),
            daemon: false,
            priority: ThreadPriority::NORMAL,
        }
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_daemon(&self) -> bool {
        self.0.daemon
    }

    pub fn priority(&self) -> ThreadPriority {
        self.0.priority
    }

    /// Number of thread names handed out so far.
    pub fn threads_created(&self) -> usize {
        self.0.counter.load(Ordering::SeqCst)
    }

    /// Reserves the next thread number and returns the resulting name.
    pub fn next_thread_name(&self) -> String {
        let n = self.0.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{} - {}", self.0.name, n)
    }

    /// Spawns a new named thread running `f` at the factory's priority.
    pub fn spawn<F>(&self, f: F) -> Result<thread::JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = self.next_thread_name();
        let priority = self.0.priority;
        log::debug!("spawning worker thread '{name}' (priority {priority})");
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                apply_priority(priority);
                f();
            })
            .map_err(|e| Error::thread_spawn(name, e))
    }
}

impl Default for ThreadFactory {
    fn default() -> Self {
        ThreadFactory(Arc::new(FactoryInner {
            name: Self::DEFAULT_NAME.to_string(),
            daemon: false,
            priority: ThreadPriority::NORMAL,
            counter: AtomicUsize::new(0),
        }))
    }
}

impl fmt::Debug for ThreadFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadFactory")
            .field("name", &self.0.name)
            .field("daemon", &self.0.daemon)
            .field("priority", &self.0.priority)
            .field("threads_created", &self.threads_created())
            .finish()
    }
}

/// Configures a [`ThreadFactory`].
#[derive(Clone, Debug)]
pub struct ThreadFactoryBuilder {
    name: String,
    daemon: bool,
    priority: ThreadPriority,
}

impl ThreadFactoryBuilder {
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn build(self) -> Result<ThreadFactory> {
        verify_arg!(name, !self.name.trim().is_empty());
        Ok(ThreadFactory(Arc::new(FactoryInner {
            name: self.name,
            daemon: self.daemon,
            priority: self.priority,
            counter: AtomicUsize::new(0),
        })))
    }
}

#[cfg(target_os = "linux")]
fn apply_priority(priority: ThreadPriority) {
    if priority == ThreadPriority::NORMAL {
        return;
    }
    // PRIO_PROCESS with a thread id targets just that thread on Linux.
    let rc = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, priority.nice_value())
    };
    if rc != 0 {
        log::warn!(
            "failed to set priority {priority} on '{}': {}",
            thread::current().name().unwrap_or_default(),
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(priority: ThreadPriority) {
    if priority != ThreadPriority::NORMAL {
        log::debug!("thread priority {priority} is not applied on this platform");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn test_priority_bounds() {
        assert!(ThreadPriority::new(0).is_err());
        assert!(ThreadPriority::new(11).is_err());
        assert_eq!(ThreadPriority::new(1).unwrap(), ThreadPriority::MIN);
        assert_eq!(ThreadPriority::new(10).unwrap(), ThreadPriority::MAX);
        assert_eq!(ThreadPriority::default(), ThreadPriority::NORMAL);
        assert_eq!(ThreadPriority::NORMAL.nice_value(), 0);
        assert!(ThreadPriority::MIN.nice_value() > 0);
        assert!(ThreadPriority::MAX.nice_value() < 0);
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(ThreadFactory::new("", false).is_err());
        assert!(ThreadFactory::new("   ", true).is_err());
    }

    #[test]
    fn test_thread_names_count_from_one() {
        let factory = ThreadFactory::new("io", true).unwrap();
        assert_eq!(factory.next_thread_name(), "io - 1");
        assert_eq!(factory.next_thread_name(), "io - 2");
        assert_eq!(factory.threads_created(), 2);
    }

    #[test]
    fn test_counter_shared_across_clones() {
        let factory = ThreadFactory::new("shared", false).unwrap();
        let clone = factory.clone();
        assert_eq!(factory.next_thread_name(), "shared - 1");
        assert_eq!(clone.next_thread_name(), "shared - 2");
        assert_eq!(factory.threads_created(), 2);
    }

    #[test]
    fn test_spawned_thread_is_named() {
        let factory = ThreadFactory::with_priority("named", false, ThreadPriority::MIN).unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = factory
            .spawn(move || {
                tx.send(thread::current().name().map(str::to_string)).unwrap();
            })
            .unwrap();
        handle.join().unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("named - 1"));
    }

    #[cfg(target_os = "linux")]
    fn current_nice() -> i32 {
        unsafe {
            let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
            libc::getpriority(libc::PRIO_PROCESS, tid)
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_priority_applied_to_worker() {
        let inherited = thread::spawn(current_nice).join().unwrap();

        let factory = ThreadFactory::with_priority("nice", false, ThreadPriority::MIN).unwrap();
        let (tx, rx) = mpsc::channel();
        factory
            .spawn(move || tx.send(current_nice()).unwrap())
            .unwrap()
            .join()
            .unwrap();
        let applied = rx.recv().unwrap();

        // Lowering the nice value needs privileges, so only a niceness at or
        // below the target is guaranteed to move.
        if inherited <= ThreadPriority::MIN.nice_value() {
            assert_eq!(applied, ThreadPriority::MIN.nice_value());
        } else {
            assert!(applied >= ThreadPriority::MIN.nice_value());
        }

        let normal = ThreadFactory::new("normal", false).unwrap();
        let (tx, rx) = mpsc::channel();
        normal
            .spawn(move || tx.send(current_nice()).unwrap())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(rx.recv().unwrap(), inherited);
    }

    #[test]
    fn test_concurrent_names_are_unique() {
        let factory = ThreadFactory::new("race", false).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let factory = factory.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|_| factory.next_thread_name())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut names: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 400);
        assert_eq!(factory.threads_created(), 400);
    }
}
