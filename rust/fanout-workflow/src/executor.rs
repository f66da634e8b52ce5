//! The parallel executor contract.
//!
//! A [`ParallelExecutor`] runs a set of [`Task`]s "in parallel if supported" and
//! blocks until every one of them finished. Everything else, fanning out over a
//! sequence, a sequence with positions, or key/value pairs, and flushing a batch,
//! is built on the single primitive [`execute_tasks`](ParallelExecutor::execute_tasks).
//!
//! ## Task failures
//!
//! A task that panics is not propagated to the caller and does not stop its
//! siblings or the join. The panic is logged, forwarded to an attached
//! [`ProgressMonitor`] as a non-critical error, and counted in the returned
//! [`ExecutionReport`], whose `last_failure` holds the message of the most
//! recent one.
//!
//! ## Ordering
//!
//! Tasks run in no particular order. The only guarantee is that, unless the
//! wait was interrupted, all tasks have finished when the call returns.

use std::{
    panic,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use crate::{
    batch::BatchQueue,
    fan_out::{self, TaskIter},
    interrupt::Interrupt,
    thread_pool::panic_message,
};

/// An opaque unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Boxes a closure into a [`Task`].
pub fn task(f: impl FnOnce() + Send + 'static) -> Task {
    Box::new(f)
}

/// Observer of a fan-out run.
///
/// For a run of `total` tasks the monitor first receives `(0, total)`, then one
/// update per finished task with strictly increasing `done` values ending at
/// `total`.
pub trait ProgressMonitor: Send + Sync {
    fn update_progress(&self, done: usize, total: usize);

    fn update_message(&self, _message: &str) {}

    fn on_error(&self, _message: &str, _critical: bool) {}
}

/// Outcome of one executor run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Number of tasks in the run.
    pub total: usize,
    /// Number of tasks that panicked, as far as observed when the call returned.
    pub failed: usize,
    /// Message of the most recent failure.
    pub last_failure: Option<String>,
    /// The wait was interrupted; some tasks may still be running.
    pub interrupted: bool,
}

impl ExecutionReport {
    /// All tasks finished and none of them failed.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }

    /// Folds the report of a follow-up run into this one.
    pub fn merge(&mut self, other: ExecutionReport) {
        self.total += other.total;
        self.failed += other.failed;
        if other.last_failure.is_some() {
            self.last_failure = other.last_failure;
        }
        self.interrupted |= other.interrupted;
    }
}

pub trait ParallelExecutor: Send + Sync {
    /// Runs all tasks yielded by `tasks` and blocks until they finished, or
    /// until `interrupt` is raised.
    fn execute_tasks(
        &self,
        tasks: &mut dyn Iterator<Item = Task>,
        interrupt: Option<&Interrupt>,
    ) -> ExecutionReport;

    /// The pending-task queue of this executor.
    fn batch_queue(&self) -> &BatchQueue;

    /// Runs every closure of `tasks` and blocks until all finished.
    fn execute<I, F>(&self, tasks: I) -> ExecutionReport
    where
        Self: Sized,
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        self.execute_tasks(&mut tasks.into_iter().map(|f| task(f)), None)
    }

    /// Like [`execute`](Self::execute), returning early once `interrupt` is
    /// raised. Tasks already handed out keep running.
    fn execute_interruptible<I, F>(&self, tasks: I, interrupt: &Interrupt) -> ExecutionReport
    where
        Self: Sized,
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        self.execute_tasks(&mut tasks.into_iter().map(|f| task(f)), Some(interrupt))
    }

    /// Applies `f` to every item.
    fn for_each<I, F>(&self, items: I, f: F) -> ExecutionReport
    where
        Self: Sized,
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item) + Send + Sync + 'static,
    {
        let mut tasks: TaskIter<I::IntoIter, F> = fan_out::tasks(items, f);
        self.execute_tasks(&mut tasks, None)
    }

    /// Applies `f` to every item along with its zero-based position in the
    /// input, assigned in input order.
    fn for_each_indexed<I, F>(&self, items: I, f: F) -> ExecutionReport
    where
        Self: Sized,
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item, usize) + Send + Sync + 'static,
    {
        self.execute_tasks(&mut fan_out::indexed_tasks(items, f), None)
    }

    /// Applies `f` to every key/value pair, e.g. the entries of a map.
    fn for_each_entry<I, K, V, F>(&self, entries: I, f: F) -> ExecutionReport
    where
        Self: Sized,
        I: IntoIterator<Item = (K, V)>,
        K: Send + 'static,
        V: Send + 'static,
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.execute_tasks(&mut fan_out::entry_tasks(entries, f), None)
    }

    /// Adds closures to the pending batch.
    fn batch<I, F>(&self, tasks: I)
    where
        Self: Sized,
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        self.batch_queue().push_all(tasks.into_iter().map(|f| task(f)));
    }

    /// Runs everything currently batched and blocks until it finished.
    ///
    /// Tasks batched concurrently with this call may end up in this flush or
    /// the next one.
    fn execute_batch(&self) -> ExecutionReport {
        let pending = self.batch_queue().take_all();
        self.execute_tasks(&mut pending.into_iter(), None)
    }
}

/// An executor that reports progress to an attached [`ProgressMonitor`].
pub trait ObservableExecutor: ParallelExecutor {
    /// Attaches `monitor`, replacing any previous one; `None` detaches.
    ///
    /// Runs already in progress keep reporting to the monitor they started with.
    fn set_progress_monitor(&self, monitor: Option<Arc<dyn ProgressMonitor>>);

    fn progress_monitor(&self) -> Option<Arc<dyn ProgressMonitor>>;
}

/// Last-write-wins slot holding the attached monitor.
#[derive(Default)]
pub(crate) struct MonitorSlot(RwLock<Option<Arc<dyn ProgressMonitor>>>);

impl MonitorSlot {
    pub(crate) fn set(&self, monitor: Option<Arc<dyn ProgressMonitor>>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = monitor;
    }

    pub(crate) fn snapshot(&self) -> Option<Arc<dyn ProgressMonitor>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Calls `f` with the task count and the tasks, buffering them first only when
/// the iterator cannot tell its exact length.
pub(crate) fn with_known_len<R>(
    tasks: &mut dyn Iterator<Item = Task>,
    f: impl FnOnce(usize, &mut dyn Iterator<Item = Task>) -> R,
) -> R {
    match tasks.size_hint() {
        (lower, Some(upper)) if lower == upper => f(lower, tasks),
        _ => {
            let buffered: Vec<Task> = tasks.collect();
            f(buffered.len(), &mut buffered.into_iter())
        }
    }
}

/// Bookkeeping shared by all tasks of one executor run.
///
/// Progress is counted under a lock that is held while the monitor is called,
/// so the monitor observes `done` values in increasing order.
pub(crate) struct FanOutRun {
    total: usize,
    monitor: Option<Arc<dyn ProgressMonitor>>,
    done: Mutex<usize>,
    failures: Mutex<Failures>,
}

#[derive(Default)]
struct Failures {
    count: usize,
    last: Option<String>,
}

impl FanOutRun {
    /// Starts a run and emits the initial `(0, total)` update.
    pub(crate) fn start(total: usize, monitor: Option<Arc<dyn ProgressMonitor>>) -> Arc<FanOutRun> {
        log::trace!(
            "fan-out of {total} tasks (monitor attached: {})",
            monitor.is_some()
        );
        if let Some(monitor) = &monitor {
            monitor.update_progress(0, total);
        }
        Arc::new(FanOutRun {
            total,
            monitor,
            done: Mutex::new(0),
            failures: Mutex::new(Failures::default()),
        })
    }

    /// Runs one task, containing its panic, then advances progress.
    pub(crate) fn run_task(&self, task: Task) {
        if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(task)) {
            self.record_failure(format!("task panicked: {}", panic_message(payload.as_ref())));
        }
        self.advance();
    }

    /// Accounts for a task that could not be run at all.
    pub(crate) fn skip_task(&self, reason: String) {
        self.record_failure(reason);
        self.advance();
    }

    pub(crate) fn report(&self, interrupted: bool) -> ExecutionReport {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        ExecutionReport {
            total: self.total,
            failed: failures.count,
            last_failure: failures.last.clone(),
            interrupted,
        }
    }

    fn record_failure(&self, message: String) {
        log::warn!("{message}");
        if let Some(monitor) = &self.monitor {
            monitor.on_error(&message, false);
        }
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.count += 1;
        failures.last = Some(message);
    }

    fn advance(&self) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done += 1;
        monitor.update_progress(*done, self.total);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<(usize, usize)>>,
        errors: Mutex<Vec<(String, bool)>>,
    }

    impl ProgressMonitor for Recorder {
        fn update_progress(&self, done: usize, total: usize) {
            self.updates.lock().unwrap().push((done, total));
        }

        fn on_error(&self, message: &str, critical: bool) {
            self.errors.lock().unwrap().push((message.to_string(), critical));
        }
    }

    #[test]
    fn test_run_reports_progress_and_failures() {
        let recorder = Arc::new(Recorder::default());
        let run = FanOutRun::start(3, Some(recorder.clone()));
        run.run_task(task(|| {}));
        run.run_task(task(|| panic!("broken")));
        run.skip_task("not scheduled".to_string());

        assert_eq!(
            *recorder.updates.lock().unwrap(),
            vec![(0, 3), (1, 3), (2, 3), (3, 3)]
        );
        let errors = recorder.errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], ("task panicked: broken".to_string(), false));

        let report = run.report(false);
        assert_eq!(report.total, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.last_failure.as_deref(), Some("not scheduled"));
        assert!(!report.is_clean());
    }

    #[test]
    fn test_run_without_monitor() {
        let run = FanOutRun::start(1, None);
        run.run_task(task(|| {}));
        assert!(run.report(false).is_clean());
        assert!(!run.report(true).is_clean());
    }

    #[test]
    fn test_with_known_len() {
        let mut exact = (0..4).map(|_| task(|| {}));
        assert_eq!(with_known_len(&mut exact, |len, tasks| (len, tasks.count())), (4, 4));

        let mut filtered = (0..10).filter(|i| i % 2 == 0).map(|_| task(|| {}));
        assert_eq!(
            with_known_len(&mut filtered, |len, tasks| (len, tasks.count())),
            (5, 5)
        );
    }

    #[test]
    fn test_report_merge() {
        let mut report = ExecutionReport {
            total: 2,
            failed: 1,
            last_failure: Some("first".to_string()),
            interrupted: false,
        };
        report.merge(ExecutionReport {
            total: 3,
            failed: 0,
            last_failure: None,
            interrupted: false,
        });
        assert_eq!(report.total, 5);
        assert_eq!(report.failed, 1);
        assert_eq!(report.last_failure.as_deref(), Some("first"));
    }

    #[test]
    fn test_monitor_slot_last_write_wins() {
        let slot = MonitorSlot::default();
        assert!(slot.snapshot().is_none());
        let first: Arc<dyn ProgressMonitor> = Arc::new(Recorder::default());
        let second: Arc<dyn ProgressMonitor> = Arc::new(Recorder::default());
        slot.set(Some(first.clone()));
        let snapshot = slot.snapshot().unwrap();
        slot.set(Some(second.clone()));
        assert!(Arc::ptr_eq(&snapshot, &first));
        assert!(Arc::ptr_eq(&slot.snapshot().unwrap(), &second));
        slot.set(None);
        assert!(slot.snapshot().is_none());
    }
}
