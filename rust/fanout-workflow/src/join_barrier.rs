//! Countdown join barrier.
//!
//! A [`JoinBarrier`] is armed with the number of expected signals and opens once
//! that many [`count_down`](JoinBarrier::count_down) calls arrived. It is the
//! fan-in point of an executor run: every dispatched task signals once, the
//! submitting thread waits for the barrier to open.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use crate::interrupt::Interrupt;

pub struct JoinBarrier {
    remaining: Mutex<usize>,
    condvar: Condvar,
}

impl JoinBarrier {
    /// Creates a barrier expecting `count` signals. A zero count is open already.
    pub fn new(count: usize) -> JoinBarrier {
        JoinBarrier {
            remaining: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    /// Records one signal. Signals past zero are ignored.
    pub fn count_down(&self) {
        let mut remaining = self.lock();
        if *remaining == 0 {
            return;
        }
        *remaining -= 1;
        if *remaining == 0 {
            self.condvar.notify_all();
        }
    }

    /// Returns a guard that signals the barrier when dropped, including during
    /// unwinding.
    pub fn signal_on_drop(self: &Arc<Self>) -> BarrierSignal {
        BarrierSignal(self.clone())
    }

    pub fn remaining(&self) -> usize {
        *self.lock()
    }

    pub fn is_open(&self) -> bool {
        self.remaining() == 0
    }

    /// Blocks until the barrier opens.
    pub fn wait(&self) {
        let remaining = self.lock();
        let _open = self
            .condvar
            .wait_while(remaining, |remaining| *remaining > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Blocks until the barrier opens or `timeout` elapses.
    ///
    /// Returns `true` if the barrier is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut remaining = self.lock();
        while *remaining > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            remaining = self
                .condvar
                .wait_timeout(remaining, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Blocks until the barrier opens or `interrupt` is raised.
    ///
    /// Returns `true` if the barrier is open. An interrupted wait leaves the
    /// outstanding signals pending.
    pub fn wait_interruptible(self: &Arc<Self>, interrupt: &Interrupt) -> bool {
        let barrier = self.clone();
        let _registration = interrupt.register(move || {
            let _remaining = barrier.lock();
            barrier.condvar.notify_all();
        });

        let remaining = self.lock();
        let remaining = self
            .condvar
            .wait_while(remaining, |remaining| {
                *remaining > 0 && !interrupt.is_raised()
            })
            .unwrap_or_else(PoisonError::into_inner);
        *remaining == 0
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for JoinBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinBarrier")
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Signals its [`JoinBarrier`] exactly once, when dropped.
#[must_use = "the barrier is signalled when the guard is dropped"]
pub struct BarrierSignal(Arc<JoinBarrier>);

impl Drop for BarrierSignal {
    fn drop(&mut self) {
        self.0.count_down();
    }
}
