use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::executor::EventExecutor;

/// The failure cause carried by a failed future.
///
/// Shared so any number of listeners can observe the same error; any error
/// type fits, which lets higher layers thread their own taxonomies through
/// without this crate knowing about them.
pub type Cause = Arc<dyn Error + Send + Sync>;

type Listener<T> = Box<dyn FnOnce(&Future<T>) + Send>;

enum State<T> {
    Pending(Vec<Listener<T>>),
    Success(T),
    Failure(Cause),
    Cancelled,
}

impl<T> State<T> {
    fn is_pending(&self) -> bool {
        matches!(self, State::Pending(_))
    }
}

struct Inner<T> {
    executor: Arc<dyn EventExecutor>,
    state: Mutex<State<T>>,
    done: Condvar,
}

/// The writing half of a write-once asynchronous result.
///
/// Exactly one of [`Promise::try_success`], [`Promise::try_failure`] or
/// [`Promise::cancel`] wins; the rest become no-ops and report `false`.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

/// The reading half of a write-once asynchronous result.
///
/// Cloning is cheap and every clone observes the same completion.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("done", &!self.inner.state.lock().is_pending())
            .finish()
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("done", &!self.inner.state.lock().is_pending())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Creates a pending promise whose listeners will run on `executor`.
    pub fn new(executor: Arc<dyn EventExecutor>) -> Promise<T> {
        Promise {
            inner: Arc::new(Inner {
                executor,
                state: Mutex::new(State::Pending(Vec::new())),
                done: Condvar::new(),
            }),
        }
    }

    /// The reading half.
    pub fn future(&self) -> Future<T> {
        Future {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Completes with a value. Returns `false` if already complete.
    pub fn try_success(&self, value: T) -> bool {
        self.complete(State::Success(value))
    }

    /// Completes with a failure cause. Returns `false` if already complete.
    pub fn try_failure(&self, cause: Cause) -> bool {
        self.complete(State::Failure(cause))
    }

    /// Moves a pending promise to cancelled. Returns `false` if already
    /// complete.
    pub fn cancel(&self) -> bool {
        self.complete(State::Cancelled)
    }

    /// `true` once the promise has left the pending state.
    pub fn is_done(&self) -> bool {
        !self.inner.state.lock().is_pending()
    }

    fn complete(&self, terminal: State<T>) -> bool {
        complete(&self.inner, terminal)
    }
}

/// The single write: swaps the terminal state in, wakes waiters, and fans
/// the stored listeners out. Every completion path funnels through here.
fn complete<T: Clone + Send + 'static>(inner: &Arc<Inner<T>>, terminal: State<T>) -> bool {
    let listeners = {
        let mut state = inner.state.lock();
        if !state.is_pending() {
            return false;
        }
        match std::mem::replace(&mut *state, terminal) {
            State::Pending(listeners) => listeners,
            _ => unreachable!(),
        }
    };
    inner.done.notify_all();
    Future::notify(inner, listeners, false);
    true
}

impl<T: Clone + Send + 'static> Future<T> {
    /// The executor the promise was bound to; listeners run here.
    pub fn executor(&self) -> &Arc<dyn EventExecutor> {
        &self.inner.executor
    }

    /// `true` once completed, whatever the outcome.
    pub fn is_done(&self) -> bool {
        !self.inner.state.lock().is_pending()
    }

    /// `true` if completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Success(_))
    }

    /// `true` if the promise was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Cancelled)
    }

    /// Moves a still-pending result to cancelled. Returns `false` when the
    /// result had already completed - cancellation is a racy no-op then.
    pub fn cancel(&self) -> bool {
        complete(&self.inner, State::Cancelled)
    }

    /// The failure cause, if the future failed.
    pub fn cause(&self) -> Option<Cause> {
        match &*self.inner.state.lock() {
            State::Failure(cause) => Some(Arc::clone(cause)),
            _ => None,
        }
    }

    /// The success value, if any, without waiting.
    pub fn result(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            State::Success(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Registers a completion listener.
    ///
    /// Listeners registered before completion run exactly once, in
    /// registration order, on the promise's executor (inline when completion
    /// already happens there). A listener registered after completion is
    /// scheduled on that executor; it is never invoked inline on the
    /// registering thread, so executor affinity holds unconditionally.
    pub fn add_listener(&self, listener: impl FnOnce(&Future<T>) + Send + 'static) {
        let late = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    None
                }
                _ => Some(Box::new(listener) as Listener<T>),
            }
        };
        if let Some(listener) = late {
            Future::notify(&self.inner, vec![listener], true);
        }
    }

    /// Blocks until completion, returning the value or the cause.
    ///
    /// Cancellation surfaces as a [`CancelledError`] cause.
    ///
    /// # Panics
    ///
    /// Panics when called on the promise's own executor thread: the wait
    /// could never finish.
    pub fn sync(&self) -> Result<T, Cause> {
        assert!(
            !self.inner.executor.in_executor(),
            "Future::sync() called from its own executor thread"
        );
        let mut state = self.inner.state.lock();
        while state.is_pending() {
            self.inner.done.wait(&mut state);
        }
        match &*state {
            State::Success(value) => Ok(value.clone()),
            State::Failure(cause) => Err(Arc::clone(cause)),
            State::Cancelled => Err(Arc::new(CancelledError)),
            State::Pending(_) => unreachable!(),
        }
    }

    /// Bounded wait. Returns `true` if the future completed within
    /// `timeout`.
    ///
    /// # Panics
    ///
    /// Panics when called on the promise's own executor thread.
    pub fn await_timeout(&self, timeout: Duration) -> bool {
        assert!(
            !self.inner.executor.in_executor(),
            "Future::await_timeout() called from its own executor thread"
        );
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.is_pending() {
            if self
                .inner
                .done
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return !state.is_pending();
            }
        }
        true
    }

    fn notify(inner: &Arc<Inner<T>>, listeners: Vec<Listener<T>>, force_schedule: bool) {
        if listeners.is_empty() {
            return;
        }
        let future = Future {
            inner: Arc::clone(inner),
        };
        if !force_schedule && inner.executor.in_executor() {
            for listener in listeners {
                listener(&future);
            }
        } else {
            inner.executor.execute(Box::new(move || {
                for listener in listeners {
                    listener(&future);
                }
            }));
        }
    }
}

/// Cause reported by [`Future::sync`] for a cancelled future.
#[derive(Debug)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation was cancelled")
    }
}

impl Error for CancelledError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ImmediateExecutor, TaskExecutor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completion_is_write_once() {
        let promise: Promise<u32> = Promise::new(ImmediateExecutor::new());
        assert!(promise.try_success(1));
        assert!(!promise.try_success(2));
        assert!(!promise.try_failure(Arc::new(CancelledError)));
        assert!(!promise.cancel());
        assert_eq!(promise.future().result(), Some(1));
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let promise: Promise<()> = Promise::new(ImmediateExecutor::new());
        let future = promise.future();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            future.add_listener(move |_| order.lock().push(i));
        }
        promise.try_success(());
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn late_listener_is_scheduled_on_executor() {
        let executor = TaskExecutor::new("promise-test").unwrap();
        let promise: Promise<()> = Promise::new(executor.clone());
        promise.try_success(());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let exec2 = executor.clone();
        promise.future().add_listener(move |_| {
            assert!(exec2.in_executor());
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(1))
            .sync()
            .unwrap();
    }

    #[test]
    fn sync_returns_failure_cause() {
        let executor = TaskExecutor::new("promise-sync").unwrap();
        let promise: Promise<()> = Promise::new(executor.clone());
        let future = promise.future();
        promise.try_failure(Arc::new(CancelledError));
        assert!(future.sync().is_err());
        assert!(!future.is_success());
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(1))
            .sync()
            .unwrap();
    }

    #[test]
    fn cancel_through_the_future_is_terminal() {
        let promise: Promise<u32> = Promise::new(ImmediateExecutor::new());
        let future = promise.future();
        assert!(future.cancel());
        assert!(future.is_cancelled());
        assert!(!promise.try_success(9));
        assert!(!future.cancel());
        assert!(future.sync().is_err());
    }

    #[test]
    fn await_timeout_expires_on_pending() {
        let promise: Promise<()> = Promise::new(ImmediateExecutor::new());
        let future = promise.future();
        assert!(!future.await_timeout(Duration::from_millis(20)));
        promise.try_success(());
        assert!(future.await_timeout(Duration::from_millis(20)));
    }
}
