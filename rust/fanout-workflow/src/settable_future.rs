//! A write-once, cancellable result holder with blocking retrieval.
//!
//! [`SettableFuture`] is completed by a producer through
//! [`complete`](SettableFuture::complete) or abandoned through
//! [`cancel`](SettableFuture::cancel). Consumers block on it with
//! [`wait`](SettableFuture::wait), [`wait_timeout`](SettableFuture::wait_timeout)
//! or [`wait_interruptible`](SettableFuture::wait_interruptible), any number of
//! times, before or after the transition.
//!
//! ## Lifecycle
//!
//! 1. Pending: created empty
//! 2. Completed: exactly one `complete` call stored a value
//! 3. Cancelled: exactly one `cancel` call won instead
//!
//! Whichever of `complete` and `cancel` comes first wins; the loser is a no-op.
//! After the transition the state never changes again.
//!
//! ## Callbacks
//!
//! - `on_completion` runs exactly once, on the winning `complete` or `cancel`.
//! - `on_cancel` runs before `on_completion` when `cancel` wins.
//! - `on_timeout` runs each time a timed wait reaches its deadline while the
//!   future is still pending. It never triggers `on_completion`.
//!
//! Callbacks run on the thread that caused them, outside the internal lock, so
//! they may query or even complete the future. Waiters on other threads are
//! released only after the completion callbacks have returned; a callback that
//! waits on its own future gets the outcome right away.

use std::{
    fmt,
    marker::PhantomData,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use fanout_common::{Error, Result};

use crate::interrupt::Interrupt;

type Callback = Box<dyn FnOnce() + Send + 'static>;
type TimeoutHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// A single-assignment result slot shared between producers and consumers.
///
/// Clones refer to the same slot.
pub struct SettableFuture<T>(Arc<FutureCell<T>>);

impl<T> SettableFuture<T> {
    /// Creates a pending future without callbacks.
    pub fn new() -> SettableFuture<T> {
        Self::builder().build()
    }

    pub fn builder() -> SettableFutureBuilder<T> {
        SettableFutureBuilder {
            on_completion: None,
            on_cancel: None,
            on_timeout: None,
            _marker: PhantomData,
        }
    }

    /// Stores `value` and releases all waiters.
    ///
    /// Returns `false` without any effect if the future was already completed
    /// or cancelled.
    pub fn complete(&self, value: T) -> bool {
        let on_completion = {
            let mut slot = self.0.lock();
            if !slot.state.is_pending() {
                return false;
            }
            slot.state = State::Completed(value);
            slot.settling = Some(thread::current().id());
            slot.on_cancel = None;
            slot.on_completion.take()
        };

        let _settle = SettleOnDrop(&self.0);
        if let Some(callback) = on_completion {
            callback();
        }
        true
    }

    /// Cancels the future and releases all waiters.
    ///
    /// Returns `true` if this call performed the cancellation, `false` if the
    /// future was already completed or cancelled.
    pub fn cancel(&self) -> bool {
        let (on_cancel, on_completion) = {
            let mut slot = self.0.lock();
            if !slot.state.is_pending() {
                return false;
            }
            slot.state = State::Cancelled;
            slot.settling = Some(thread::current().id());
            (slot.on_cancel.take(), slot.on_completion.take())
        };

        let _settle = SettleOnDrop(&self.0);
        if let Some(callback) = on_cancel {
            callback();
        }
        if let Some(callback) = on_completion {
            callback();
        }
        true
    }

    /// Returns `true` once the future was either completed or cancelled.
    pub fn is_done(&self) -> bool {
        !self.0.lock().state.is_pending()
    }

    /// Returns `true` if the future holds a value.
    pub fn is_completed(&self) -> bool {
        matches!(self.0.lock().state, State::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.0.lock().state, State::Cancelled)
    }

    /// The instant this future was created.
    pub fn created_at(&self) -> Instant {
        self.0.created_at
    }

    pub fn has_on_completion(&self) -> bool {
        self.0.has_on_completion
    }

    pub fn has_on_cancel(&self) -> bool {
        self.0.has_on_cancel
    }

    pub fn has_on_timeout(&self) -> bool {
        self.0.on_timeout.is_some()
    }

    /// Returns a closure that completes this future with its argument.
    ///
    /// Useful for handing the future to callback-style producers.
    pub fn completer(&self) -> impl Fn(T) + Send + Sync + 'static
    where
        T: Send + 'static,
    {
        let future = self.clone();
        move |value| {
            future.complete(value);
        }
    }
}

impl<T: Clone> SettableFuture<T> {
    /// Blocks until the future is completed or cancelled.
    ///
    /// Returns the stored value, or `None` if the future was cancelled.
    pub fn wait(&self) -> Option<T> {
        let slot = self.0.lock();
        self.0.wait_settled(slot).state.value()
    }

    /// Blocks for at most `timeout`.
    ///
    /// When the timeout elapses while the future is pending, the `on_timeout`
    /// hook runs and the state is checked once more: a `complete` or `cancel`
    /// that got in before that check is reported as if it had arrived in time.
    /// Otherwise the wait fails with `ErrorKind::TimedOut`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline, timeout),
            None => Ok(self.wait()),
        }
    }

    /// Like [`wait_timeout`](Self::wait_timeout) with an absolute deadline.
    ///
    /// Combined with [`created_at`](Self::created_at) this bounds the total
    /// lifetime of the future rather than a single wait.
    pub fn wait_deadline(&self, deadline: Instant) -> Result<Option<T>> {
        self.wait_until(deadline, deadline.saturating_duration_since(Instant::now()))
    }

    /// Blocks until the future is done or `interrupt` is raised.
    ///
    /// An interrupted wait fails with `ErrorKind::Interrupted` and leaves the
    /// future untouched.
    pub fn wait_interruptible(&self, interrupt: &Interrupt) -> Result<Option<T>>
    where
        T: Send + 'static,
    {
        let cell = self.0.clone();
        let _registration = interrupt.register(move || {
            let _slot = cell.lock();
            cell.condvar.notify_all();
        });

        let slot = self.0.lock();
        let slot = self
            .0
            .condvar
            .wait_while(slot, |slot| !slot.is_ready() && !interrupt.is_raised())
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_ready() {
            Ok(slot.state.value())
        } else {
            Err(Error::interrupted())
        }
    }

    fn wait_until(&self, deadline: Instant, requested: Duration) -> Result<Option<T>> {
        if let Some(outcome) = self.0.wait_settled_until(deadline) {
            return Ok(outcome);
        }

        if let Some(hook) = &self.0.on_timeout {
            hook();
        }

        // The hook (or a racing producer) may have resolved the future.
        let slot = self.0.lock();
        if slot.state.is_pending() {
            Err(Error::timed_out(requested))
        } else {
            Ok(self.0.wait_settled(slot).state.value())
        }
    }
}

impl<T> Clone for SettableFuture<T> {
    fn clone(&self) -> Self {
        SettableFuture(self.0.clone())
    }
}

impl<T> Default for SettableFuture<T> {
    fn default() -> Self {
        SettableFuture::new()
    }
}

impl<T> fmt::Debug for SettableFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.0.lock().state {
            State::Pending => "pending",
            State::Completed(_) => "completed",
            State::Cancelled => "cancelled",
        };
        f.debug_struct("SettableFuture")
            .field("state", &state)
            .field("created_at", &self.0.created_at)
            .finish()
    }
}

/// Configures the callbacks of a [`SettableFuture`].
pub struct SettableFutureBuilder<T> {
    on_completion: Option<Callback>,
    on_cancel: Option<Callback>,
    on_timeout: Option<TimeoutHook>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SettableFutureBuilder<T> {
    /// Runs once when the future is completed or cancelled.
    pub fn on_completion(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_completion = Some(Box::new(f));
        self
    }

    /// Runs once when the future is cancelled, before `on_completion`.
    pub fn on_cancel(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    /// Runs whenever a timed wait expires on a pending future.
    pub fn on_timeout(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_timeout = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> SettableFuture<T> {
        SettableFuture(Arc::new(FutureCell {
            has_on_completion: self.on_completion.is_some(),
            has_on_cancel: self.on_cancel.is_some(),
            slot: Mutex::new(Slot {
                state: State::Pending,
                settled: false,
                settling: None,
                on_completion: self.on_completion,
                on_cancel: self.on_cancel,
            }),
            condvar: Condvar::new(),
            on_timeout: self.on_timeout,
            created_at: Instant::now(),
        }))
    }
}

/// Shared state behind a [`SettableFuture`].
///
/// `state` flips exactly once under the lock. `settled` follows it after the
/// completion callbacks ran; waiters block on `settled`, except on the thread
/// running the callbacks, recorded in `settling`.
struct FutureCell<T> {
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
    on_timeout: Option<TimeoutHook>,
    has_on_completion: bool,
    has_on_cancel: bool,
    created_at: Instant,
}

struct Slot<T> {
    state: State<T>,
    settled: bool,
    settling: Option<ThreadId>,
    on_completion: Option<Callback>,
    on_cancel: Option<Callback>,
}

impl<T> Slot<T> {
    /// The outcome may be read by the current thread.
    fn is_ready(&self) -> bool {
        self.settled || self.settling == Some(thread::current().id())
    }
}

impl<T> FutureCell<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self) {
        let mut slot = self.lock();
        slot.settled = true;
        slot.settling = None;
        drop(slot);
        self.condvar.notify_all();
    }

    fn wait_settled<'a>(&self, slot: MutexGuard<'a, Slot<T>>) -> MutexGuard<'a, Slot<T>> {
        self.condvar
            .wait_while(slot, |slot| !slot.is_ready())
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the outcome until `deadline`.
    ///
    /// Returns `None` only if the future is still pending at the deadline. A
    /// future that already transitioned is waited on past the deadline until
    /// its callbacks finished.
    fn wait_settled_until(&self, deadline: Instant) -> Option<Option<T>>
    where
        T: Clone,
    {
        let mut slot = self.lock();
        loop {
            if slot.is_ready() {
                return Some(slot.state.value());
            }
            let now = Instant::now();
            if now >= deadline {
                if slot.state.is_pending() {
                    return None;
                }
                return Some(self.wait_settled(slot).state.value());
            }
            slot = self
                .condvar
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Marks the cell settled even if a completion callback panics.
struct SettleOnDrop<'a, T>(&'a FutureCell<T>);

impl<T> Drop for SettleOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.settle();
    }
}

enum State<T> {
    Pending,
    Completed(T),
    Cancelled,
}

impl<T> State<T> {
    fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }

    fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        match self {
            State::Completed(value) => Some(value.clone()),
            State::Pending | State::Cancelled => None,
        }
    }
}
