//! Cooperative interruption of blocking waits.
//!
//! Threads cannot be interrupted from the outside, so every blocking wait in
//! this crate has an `_interruptible` flavor that takes an [`Interrupt`]. Raising
//! the interrupt wakes all waits currently registered with it; they return early
//! without affecting the work they were waiting on.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

type Waker = Arc<dyn Fn() + Send + Sync>;

/// A shareable interruption flag.
///
/// Clones refer to the same flag. Once raised, the flag stays raised until
/// [`reset`](Self::reset) is called; waits started while it is raised return
/// immediately.
#[derive(Clone, Default)]
pub struct Interrupt(Arc<InterruptState>);

#[derive(Default)]
struct InterruptState {
    raised: AtomicBool,
    wakers: Mutex<Wakers>,
}

#[derive(Default)]
struct Wakers {
    next_id: u64,
    entries: Vec<(u64, Waker)>,
}

impl Interrupt {
    pub fn new() -> Interrupt {
        Interrupt::default()
    }

    /// Raises the flag and wakes every registered wait.
    pub fn raise(&self) {
        self.0.raised.store(true, Ordering::SeqCst);
        let wakers: Vec<Waker> = self
            .0
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, waker)| waker.clone())
            .collect();
        for waker in wakers {
            waker();
        }
    }

    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::SeqCst)
    }

    /// Clears the flag so the interrupt can be reused.
    pub fn reset(&self) {
        self.0.raised.store(false, Ordering::SeqCst);
    }

    /// Registers a waker that is invoked on [`raise`](Self::raise) for as long
    /// as the returned registration is alive.
    ///
    /// The waker must take the lock guarding the waiter's condition before
    /// notifying, so a raise cannot slip between the waiter's check and its
    /// wait.
    pub(crate) fn register(&self, waker: impl Fn() + Send + Sync + 'static) -> Registration<'_> {
        let mut wakers = self.0.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        let id = wakers.next_id;
        wakers.next_id += 1;
        wakers.entries.push((id, Arc::new(waker)));
        Registration {
            interrupt: self,
            id,
        }
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.0
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("raised", &self.is_raised())
            .finish()
    }
}

/// Keeps a waker registered with an [`Interrupt`] until dropped.
pub(crate) struct Registration<'a> {
    interrupt: &'a Interrupt,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.interrupt
            .0
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .retain(|(id, _)| *id != self.id);
    }
}
