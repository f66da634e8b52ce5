//! Executor that runs every task on the calling thread.
//!
//! Useful where spawning threads is undesirable, e.g. in tests or when the
//! caller is itself a pool worker, while keeping the [`ParallelExecutor`]
//! contract: panics are contained, progress is reported, and the batch queue
//! works the same way.

use std::sync::Arc;

use crate::{
    batch::BatchQueue,
    executor::{
        ExecutionReport, FanOutRun, MonitorSlot, ObservableExecutor, ParallelExecutor,
        ProgressMonitor, Task, with_known_len,
    },
    interrupt::Interrupt,
};

/// Runs tasks one after another, in input order.
#[derive(Default)]
pub struct SequentialExecutor {
    batch: BatchQueue,
    monitor: MonitorSlot,
}

impl SequentialExecutor {
    pub fn new() -> SequentialExecutor {
        SequentialExecutor::default()
    }

    fn run_inline(
        &self,
        total: usize,
        tasks: &mut dyn Iterator<Item = Task>,
        interrupt: Option<&Interrupt>,
    ) -> ExecutionReport {
        let run = FanOutRun::start(total, self.monitor.snapshot());
        let mut ran = 0;
        for task in (&mut *tasks).take(total) {
            if interrupt.is_some_and(Interrupt::is_raised) {
                log::debug!("sequential run of {total} tasks interrupted");
                return run.report(true);
            }
            ran += 1;
            run.run_task(task);
        }
        if ran < total {
            log::warn!("task iterator announced {total} tasks but yielded {ran}");
            for _ in ran..total {
                run.skip_task("task missing from iterator".to_string());
            }
        }
        let mut report = run.report(false);

        let mut rest = tasks.peekable();
        if rest.peek().is_some() {
            log::warn!("task iterator yielded more than the announced {total} tasks");
            report.merge(self.execute_tasks(&mut rest, interrupt));
        }
        report
    }
}

impl ParallelExecutor for SequentialExecutor {
    /// Runs the tasks inline. The interrupt is checked before each task; once
    /// it is raised the remaining tasks are dropped without running.
    fn execute_tasks(
        &self,
        tasks: &mut dyn Iterator<Item = Task>,
        interrupt: Option<&Interrupt>,
    ) -> ExecutionReport {
        with_known_len(tasks, |total, tasks| self.run_inline(total, tasks, interrupt))
    }

    fn batch_queue(&self) -> &BatchQueue {
        &self.batch
    }
}

impl ObservableExecutor for SequentialExecutor {
    fn set_progress_monitor(&self, monitor: Option<Arc<dyn ProgressMonitor>>) {
        self.monitor.set(monitor);
    }

    fn progress_monitor(&self) -> Option<Arc<dyn ProgressMonitor>> {
        self.monitor.snapshot()
    }
}

impl std::fmt::Debug for SequentialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialExecutor")
            .field("batch", &self.batch)
            .finish()
    }
}
