use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::future::{Future, Promise};

/// A unit of work submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded execution context with a stable worker identity.
///
/// All submission paths are FIFO per executor: two tasks submitted from the
/// same thread run in submission order. Submitting from the worker thread
/// itself enqueues without a wakeup; from any other thread the worker is
/// woken.
pub trait EventExecutor: Send + Sync + 'static {
    /// The worker's name, also used as its thread name.
    fn name(&self) -> &str;

    /// Enqueues `task` for execution on the worker.
    fn execute(&self, task: Task);

    /// Enqueues `task` to run after `delay`. The returned handle cancels the
    /// task if it has not started yet.
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle;

    /// `true` when the calling thread is this executor's worker.
    fn in_executor(&self) -> bool;

    /// `true` once a graceful shutdown has been requested.
    fn is_shutting_down(&self) -> bool;

    /// `true` once the worker has exited.
    fn is_terminated(&self) -> bool;

    /// Starts the quiet-period shutdown protocol: the worker keeps draining
    /// tasks, and exits once no new task has arrived for `quiet_period` or
    /// once `timeout` has elapsed, whichever comes first.
    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()>;

    /// Completes when the worker has exited and drained.
    fn termination_future(&self) -> Future<()>;
}

/// Cancellation handle for a task accepted by [`EventExecutor::schedule`].
#[derive(Clone)]
pub struct ScheduledHandle {
    entry: Arc<TimerEntry>,
}

impl ScheduledHandle {
    /// Cancels the task if it has not begun. Returns `true` if this call
    /// performed the cancellation.
    pub fn cancel(&self) -> bool {
        let first = !self.entry.cancelled.swap(true, Ordering::AcqRel);
        if first {
            // Drop the closure eagerly; the heap entry expires on its own.
            self.entry.task.lock().take();
        }
        first
    }

    /// `true` if the task was cancelled before it ran.
    pub fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cancelled: AtomicBool,
    task: Mutex<Option<Task>>,
}

struct TimerSlot(Arc<TimerEntry>);

impl PartialEq for TimerSlot {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.seq == other.0.seq
    }
}

impl Eq for TimerSlot {}

impl PartialOrd for TimerSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the nearest deadline
        // on top.
        other
            .0
            .deadline
            .cmp(&self.0.deadline)
            .then(other.0.seq.cmp(&self.0.seq))
    }
}

/// Executor lifecycle states.
pub(crate) const ST_RUNNING: u8 = 1;
pub(crate) const ST_SHUTTING_DOWN: u8 = 2;
pub(crate) const ST_SHUTDOWN: u8 = 3;
pub(crate) const ST_TERMINATED: u8 = 4;

struct ShutdownClock {
    quiet: Duration,
    timeout_at: Instant,
    started: Instant,
}

/// State shared between an executor handle and its worker thread. Both
/// [`TaskExecutor`] and the reactor build their loops on this.
pub(crate) struct WorkerState {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    timers: Mutex<BinaryHeap<TimerSlot>>,
    seq: AtomicU64,
    state: AtomicU8,
    thread: Mutex<Option<ThreadId>>,
    termination: Promise<()>,
    clock: Mutex<Option<ShutdownClock>>,
    last_activity: Mutex<Instant>,
}

impl WorkerState {
    pub(crate) fn new(name: &str) -> Arc<WorkerState> {
        Arc::new(WorkerState {
            name: name.to_owned(),
            queue: Mutex::new(VecDeque::new()),
            timers: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            state: AtomicU8::new(ST_RUNNING),
            thread: Mutex::new(None),
            termination: Promise::new(ImmediateExecutor::new()),
            clock: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn bind_thread(&self) {
        *self.thread.lock() = Some(thread::current().id());
    }

    pub(crate) fn in_worker(&self) -> bool {
        *self.thread.lock() == Some(thread::current().id())
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    pub(crate) fn push(&self, task: Task) {
        if self.state() >= ST_SHUTDOWN {
            warn!("{}: task submitted after shutdown, dropping", self.name);
            return;
        }
        self.queue.lock().push_back(task);
    }

    pub(crate) fn has_ready_tasks(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    pub(crate) fn schedule_at(&self, delay: Duration, task: Task) -> ScheduledHandle {
        let entry = Arc::new(TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            cancelled: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        });
        self.timers.lock().push(TimerSlot(Arc::clone(&entry)));
        ScheduledHandle { entry }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.lock().peek().map(|slot| slot.0.deadline)
    }

    /// Moves every timer that is due (and not cancelled) onto the ready
    /// queue, preserving deadline order.
    pub(crate) fn fetch_due_timers(&self, now: Instant) {
        loop {
            let entry = {
                let mut timers = self.timers.lock();
                match timers.peek() {
                    Some(slot) if slot.0.deadline <= now => timers.pop().map(|s| s.0),
                    _ => return,
                }
            };
            let Some(entry) = entry else { return };
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            let task = entry.task.lock().take();
            if let Some(task) = task {
                self.queue.lock().push_back(task);
            }
        }
    }

    /// Runs ready tasks until the queue is empty or `deadline` passes
    /// (checked every 64 tasks). Returns how many ran.
    pub(crate) fn run_ready_tasks(&self, deadline: Option<Instant>) -> usize {
        let mut ran = 0usize;
        loop {
            let task = self.queue.lock().pop_front();
            let Some(task) = task else { break };
            task();
            ran += 1;
            if ran % 64 == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        break;
                    }
                }
            }
        }
        if ran > 0 {
            // Feeds the quiet-period clock: any task pushes termination out.
            *self.last_activity.lock() = Instant::now();
        }
        ran
    }

    pub(crate) fn begin_shutdown(&self, quiet: Duration, timeout: Duration) -> bool {
        if self
            .state
            .compare_exchange(
                ST_RUNNING,
                ST_SHUTTING_DOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let now = Instant::now();
        *self.clock.lock() = Some(ShutdownClock {
            quiet,
            timeout_at: now + timeout,
            started: now,
        });
        true
    }

    /// One round of the quiet-period protocol. Drains whatever is ready and
    /// decides whether the worker may exit.
    pub(crate) fn confirm_shutdown(&self) -> bool {
        self.fetch_due_timers(Instant::now());
        let ran = self.run_ready_tasks(None);
        let clock = self.clock.lock();
        let Some(clock) = clock.as_ref() else {
            return true;
        };
        let now = Instant::now();
        if now >= clock.timeout_at {
            return true;
        }
        if ran > 0 {
            return false;
        }
        // Quiet since the later of shutdown start and the last task.
        let last = (*self.last_activity.lock()).max(clock.started);
        now.duration_since(last) >= clock.quiet
    }

    /// Final drain after the loop exits, then completes the termination
    /// future. Undelivered timers are cancelled.
    pub(crate) fn terminate(&self) {
        self.set_state(ST_SHUTDOWN);
        self.fetch_due_timers(Instant::now());
        self.run_ready_tasks(None);
        for slot in self.timers.lock().drain() {
            slot.0.cancelled.store(true, Ordering::Release);
            slot.0.task.lock().take();
        }
        self.set_state(ST_TERMINATED);
        self.termination.try_success(());
    }

    pub(crate) fn termination_future(&self) -> Future<()> {
        self.termination.future()
    }
}

struct Parker {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Parker {
    fn new() -> Parker {
        Parker {
            notified: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn park(&self, timeout: Option<Duration>, worker: &WorkerState) {
        let mut notified = self.notified.lock();
        if *notified {
            *notified = false;
            return;
        }
        // A task pushed before unpark() is visible here; an unpark racing
        // with the wait below still lands because it needs this lock.
        if worker.has_ready_tasks() {
            return;
        }
        match timeout {
            Some(timeout) => {
                self.cond.wait_for(&mut notified, timeout);
            }
            None => self.cond.wait(&mut notified),
        }
        *notified = false;
    }

    fn unpark(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cond.notify_one();
    }
}

/// A plain event executor: one worker thread, a FIFO task queue and a timer
/// queue, no I/O. The reactor shares the same queueing discipline and adds a
/// selector.
pub struct TaskExecutor {
    worker: Arc<WorkerState>,
    parker: Arc<Parker>,
}

impl TaskExecutor {
    /// Spawns the worker thread and returns the executor handle.
    pub fn new(name: &str) -> io::Result<Arc<TaskExecutor>> {
        let worker = WorkerState::new(name);
        let parker = Arc::new(Parker::new());
        {
            let worker = Arc::clone(&worker);
            let parker = Arc::clone(&parker);
            thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || Self::run(worker, parker))?;
        }
        Ok(Arc::new(TaskExecutor { worker, parker }))
    }

    fn run(worker: Arc<WorkerState>, parker: Arc<Parker>) {
        worker.bind_thread();
        loop {
            if worker.state() == ST_SHUTTING_DOWN {
                if worker.confirm_shutdown() {
                    break;
                }
                parker.park(Some(Duration::from_millis(50)), &worker);
                continue;
            }
            worker.fetch_due_timers(Instant::now());
            let ran = worker.run_ready_tasks(None);
            if ran == 0 && worker.state() != ST_SHUTTING_DOWN {
                let timeout = worker
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()));
                parker.park(timeout, &worker);
            }
        }
        worker.terminate();
    }
}

impl EventExecutor for TaskExecutor {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn execute(&self, task: Task) {
        self.worker.push(task);
        if !self.in_executor() {
            self.parker.unpark();
        }
    }

    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        let handle = self.worker.schedule_at(delay, task);
        if !self.in_executor() {
            self.parker.unpark();
        }
        handle
    }

    fn in_executor(&self) -> bool {
        self.worker.in_worker()
    }

    fn is_shutting_down(&self) -> bool {
        self.worker.state() >= ST_SHUTTING_DOWN
    }

    fn is_terminated(&self) -> bool {
        self.worker.state() == ST_TERMINATED
    }

    fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()> {
        self.worker.begin_shutdown(quiet_period, timeout);
        self.parker.unpark();
        self.worker.termination_future()
    }

    fn termination_future(&self) -> Future<()> {
        self.worker.termination_future()
    }
}

/// An executor that runs every task inline on the submitting thread.
///
/// Used for futures that outlive any worker (group termination, executor
/// termination). It has no worker identity, so `in_executor` is always
/// `false` and waiting on its futures is always allowed.
pub struct ImmediateExecutor;

impl ImmediateExecutor {
    /// A fresh immediate executor. Stateless; any instance is as good as
    /// another.
    pub fn new() -> Arc<ImmediateExecutor> {
        Arc::new(ImmediateExecutor)
    }
}

impl EventExecutor for ImmediateExecutor {
    fn name(&self) -> &str {
        "immediate"
    }

    fn execute(&self, task: Task) {
        task();
    }

    fn schedule(&self, _delay: Duration, _task: Task) -> ScheduledHandle {
        panic!("ImmediateExecutor does not support delayed tasks");
    }

    fn in_executor(&self) -> bool {
        false
    }

    fn is_shutting_down(&self) -> bool {
        false
    }

    fn is_terminated(&self) -> bool {
        false
    }

    fn shutdown_gracefully(&self, _quiet_period: Duration, _timeout: Duration) -> Future<()> {
        self.termination_future()
    }

    fn termination_future(&self) -> Future<()> {
        let promise: Promise<()> = Promise::new(ImmediateExecutor::new());
        promise.try_success(());
        promise.future()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_in_submission_order() {
        let executor = TaskExecutor::new("exec-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let seen = Arc::clone(&seen);
            executor.execute(Box::new(move || seen.lock().push(i)));
        }
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .sync()
            .unwrap();
        assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn in_executor_is_worker_affine() {
        let executor = TaskExecutor::new("exec-affine").unwrap();
        assert!(!executor.in_executor());
        let inner = Arc::clone(&executor);
        let saw = Arc::new(AtomicBool::new(false));
        let saw2 = Arc::clone(&saw);
        executor.execute(Box::new(move || {
            saw2.store(inner.in_executor(), Ordering::SeqCst);
        }));
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .sync()
            .unwrap();
        assert!(saw.load(Ordering::SeqCst));
    }

    #[test]
    fn scheduled_task_waits_for_its_delay() {
        let executor = TaskExecutor::new("exec-timer").unwrap();
        let fired = Arc::new(Mutex::new(None));
        let fired2 = Arc::clone(&fired);
        let start = Instant::now();
        executor.schedule(
            Duration::from_millis(50),
            Box::new(move || *fired2.lock() = Some(start.elapsed())),
        );
        std::thread::sleep(Duration::from_millis(150));
        let elapsed = fired.lock().expect("timer did not fire");
        assert!(elapsed >= Duration::from_millis(50));
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .sync()
            .unwrap();
    }

    #[test]
    fn cancel_before_run_suppresses_the_task() {
        let executor = TaskExecutor::new("exec-cancel").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let handle = executor.schedule(
            Duration::from_millis(80),
            Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(handle.cancel());
        assert!(!handle.cancel());
        std::thread::sleep(Duration::from_millis(160));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        executor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .sync()
            .unwrap();
    }

    #[test]
    fn quiet_period_extends_while_tasks_arrive() {
        let executor = TaskExecutor::new("exec-quiet").unwrap();
        let future = executor.shutdown_gracefully(Duration::from_millis(50), Duration::from_secs(5));
        // Still draining: a task submitted during the quiet period runs.
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        executor.execute(Box::new(move || ran2.store(true, Ordering::SeqCst)));
        future.sync().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(executor.is_terminated());
    }
}
