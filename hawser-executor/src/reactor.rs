use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, trace, warn};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::executor::{
    EventExecutor, ScheduledHandle, Task, WorkerState, ST_SHUTTING_DOWN, ST_TERMINATED,
};
use crate::future::Future;

/// Interest-operation bits a channel keeps on its selection key.
///
/// The reactor registers sources for the union of whatever the mask may
/// grow into and routes each ready event through the owner's mask, so
/// adding or removing a bit is a cheap reregister, not a new registration.
pub mod interest {
    /// Readiness for reading.
    pub const READ: u8 = 0b001;
    /// Readiness for writing (flush backlog).
    pub const WRITE: u8 = 0b010;
    /// Completion of a non-blocking connect.
    pub const CONNECT: u8 = 0b100;
}

/// Token reserved for the reactor's own waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Default capacity of the per-iteration event buffer.
const EVENTS_CAPACITY: usize = 1024;

/// Selector backstop so a quiet reactor still notices shutdown requests.
const IDLE_SELECT_TIMEOUT: Duration = Duration::from_secs(1);

/// What a registered channel exposes to its reactor.
///
/// Both callbacks run on the reactor thread.
pub trait IoHandle: Send + Sync + 'static {
    /// A readiness event for the channel's source. `readable`/`writable`
    /// reflect the raw event; the channel filters them through its own
    /// interest mask.
    fn ready(&self, readable: bool, writable: bool);

    /// The reactor is terminating; the channel must close.
    fn reactor_shutdown(&self);
}

struct IoShared {
    poll: Mutex<Poll>,
    waker: Waker,
    handles: Mutex<Slab<Arc<dyn IoHandle>>>,
    io_ratio: AtomicU8,
}

impl IoShared {
    fn dispatch(&self, token: Token, readable: bool, writable: bool) {
        let handle = self.handles.lock().get(token.0).cloned();
        match handle {
            Some(handle) => handle.ready(readable, writable),
            // Deregistered between poll and dispatch; nothing to notify.
            None => trace!("dropping event for cancelled token {:?}", token),
        }
    }

    fn select_now(&self) {
        let mut events = Events::with_capacity(64);
        if let Err(err) = self.poll.lock().poll(&mut events, Some(Duration::ZERO)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("select_now failed: {}", err);
            }
            return;
        }
        for event in events.iter() {
            if event.token() != WAKE_TOKEN {
                self.dispatch(event.token(), event.is_readable(), event.is_writable());
            }
        }
    }
}

/// An event executor that also owns a readiness selector.
///
/// The worker interleaves three things per iteration: a `select` on the
/// poll, dispatch of ready events to the owning channels, and the task/timer
/// queues every executor has. `io_ratio` bounds the share of each iteration
/// spent on I/O dispatch versus queued tasks.
pub struct Reactor {
    worker: Arc<WorkerState>,
    shared: Arc<IoShared>,
}

impl Reactor {
    /// Creates the selector and spawns the reactor thread.
    ///
    /// # Panics
    ///
    /// Panics if `io_ratio` is outside `[1, 100]`.
    pub fn new(
        name: &str,
        io_ratio: u8,
        core: Option<core_affinity::CoreId>,
    ) -> io::Result<Arc<Reactor>> {
        assert!(
            (1..=100).contains(&io_ratio),
            "io_ratio {} outside [1, 100]",
            io_ratio
        );
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(IoShared {
            poll: Mutex::new(poll),
            waker,
            handles: Mutex::new(Slab::new()),
            io_ratio: AtomicU8::new(io_ratio),
        });
        let worker = WorkerState::new(name);
        {
            let worker = Arc::clone(&worker);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || Self::run(worker, shared, core))?;
        }
        Ok(Arc::new(Reactor { worker, shared }))
    }

    /// Adjusts the I/O-versus-tasks time split.
    ///
    /// # Panics
    ///
    /// Panics if `ratio` is outside `[1, 100]`.
    pub fn set_io_ratio(&self, ratio: u8) {
        assert!((1..=100).contains(&ratio), "io_ratio {} outside [1, 100]", ratio);
        self.shared.io_ratio.store(ratio, Ordering::Release);
    }

    /// Registers `source` with the selector and attaches `handle` to the
    /// resulting selection token. Reactor-thread only.
    ///
    /// A registration can trip over a stale entry left by a source cancelled
    /// since the last select; in that case the reactor selects now to flush
    /// the cancellation and retries exactly once.
    pub fn register_source(
        &self,
        source: &mut dyn Source,
        ops: u8,
        handle: Arc<dyn IoHandle>,
    ) -> io::Result<Token> {
        debug_assert!(self.in_executor(), "register_source off the reactor thread");
        let key = self.shared.handles.lock().insert(handle);
        let token = Token(key);
        let mut selected = false;
        loop {
            let result = self
                .shared
                .poll
                .lock()
                .registry()
                .register(source, token, translate_ops(ops));
            match result {
                Ok(()) => return Ok(token),
                Err(err) if !selected => {
                    self.shared.select_now();
                    selected = true;
                    trace!("registration retry for {:?} after {}", token, err);
                }
                Err(err) => {
                    self.shared.handles.lock().remove(key);
                    return Err(err);
                }
            }
        }
    }

    /// Updates the interest mask of a registered source. Reactor-thread
    /// only.
    pub fn reregister_source(
        &self,
        source: &mut dyn Source,
        token: Token,
        ops: u8,
    ) -> io::Result<()> {
        debug_assert!(self.in_executor(), "reregister_source off the reactor thread");
        self.shared
            .poll
            .lock()
            .registry()
            .reregister(source, token, translate_ops(ops))
    }

    /// Cancels a registration. Reactor-thread only. Events already selected
    /// for the token are skipped at dispatch.
    pub fn deregister_source(&self, source: &mut dyn Source, token: Token) -> io::Result<()> {
        debug_assert!(self.in_executor(), "deregister_source off the reactor thread");
        let handle = self.shared.handles.lock().try_remove(token.0);
        if handle.is_none() {
            trace!("{}: deregister of unknown token {:?}", self.name(), token);
        }
        self.shared.poll.lock().registry().deregister(source)
    }

    /// Non-blocking select that dispatches whatever is immediately ready.
    /// Reactor-thread only.
    pub fn select_now(&self) {
        debug_assert!(self.in_executor(), "select_now off the reactor thread");
        self.shared.select_now();
    }

    fn run(worker: Arc<WorkerState>, shared: Arc<IoShared>, core: Option<core_affinity::CoreId>) {
        if let Some(core) = core {
            if !core_affinity::set_for_current(core) {
                warn!("{}: failed to pin to core {:?}", worker.name(), core.id);
            }
        }
        worker.bind_thread();
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            let timeout = Self::select_timeout(&worker);
            {
                let mut poll = shared.poll.lock();
                if let Err(err) = poll.poll(&mut events, timeout) {
                    events.clear();
                    if err.kind() != io::ErrorKind::Interrupted {
                        // Unrecoverable selector: shut the reactor down; its
                        // channels are closed on the way out.
                        error!("{}: selector failed: {}", worker.name(), err);
                        worker.begin_shutdown(Duration::ZERO, Duration::ZERO);
                    }
                }
            }

            let io_start = Instant::now();
            for event in events.iter() {
                if event.token() != WAKE_TOKEN {
                    shared.dispatch(event.token(), event.is_readable(), event.is_writable());
                }
            }
            let io_time = io_start.elapsed();

            worker.fetch_due_timers(Instant::now());
            let ratio = shared.io_ratio.load(Ordering::Acquire);
            if ratio >= 100 {
                worker.run_ready_tasks(None);
            } else {
                let budget = io_time * u32::from(100 - ratio) / u32::from(ratio);
                worker.run_ready_tasks(Some(Instant::now() + budget));
            }

            if worker.state() == ST_SHUTTING_DOWN && worker.confirm_shutdown() {
                break;
            }
        }
        // Close every channel still registered, then drain what the close
        // path queued.
        let handles: Vec<Arc<dyn IoHandle>> = shared.handles.lock().drain().collect();
        for handle in handles {
            handle.reactor_shutdown();
        }
        worker.terminate();
    }

    fn select_timeout(worker: &WorkerState) -> Option<Duration> {
        if worker.has_ready_tasks() {
            return Some(Duration::ZERO);
        }
        if worker.state() == ST_SHUTTING_DOWN {
            return Some(Duration::from_millis(50));
        }
        match worker.next_deadline() {
            Some(deadline) => Some(
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(IDLE_SELECT_TIMEOUT),
            ),
            None => Some(IDLE_SELECT_TIMEOUT),
        }
    }

    fn wake(&self) {
        if let Err(err) = self.shared.waker.wake() {
            warn!("{}: waker failed: {}", self.name(), err);
        }
    }
}

impl EventExecutor for Reactor {
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn execute(&self, task: Task) {
        self.worker.push(task);
        if !self.in_executor() {
            self.wake();
        }
    }

    fn schedule(&self, delay: Duration, task: Task) -> ScheduledHandle {
        let handle = self.worker.schedule_at(delay, task);
        if !self.in_executor() {
            self.wake();
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
        self.wake();
        self.worker.termination_future()
    }

    fn termination_future(&self) -> Future<()> {
        self.worker.termination_future()
    }
}

fn translate_ops(ops: u8) -> Interest {
    let readable = ops & interest::READ != 0;
    // Both WRITE and CONNECT surface as writable readiness.
    let writable = ops & (interest::WRITE | interest::CONNECT) != 0;
    match (readable, writable) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        // Parked registration: mio cannot express an empty interest set, so
        // park on READABLE and let the owner's mask discard the edge.
        (false, false) => Interest::READABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[test]
    fn reactor_runs_cross_thread_tasks() {
        let reactor = Reactor::new("reactor-test", 50, None).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let hits = Arc::clone(&hits);
            reactor.execute(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) < 8 && Instant::now() < deadline {
            thread::yield_now();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 8);
        reactor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .sync()
            .unwrap();
        assert!(reactor.is_terminated());
    }

    #[test]
    fn reactor_timers_fire_on_the_loop() {
        let reactor = Reactor::new("reactor-timer", 50, None).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let reactor2 = Arc::clone(&reactor);
        reactor.schedule(
            Duration::from_millis(30),
            Box::new(move || {
                assert!(reactor2.in_executor());
                fired2.store(true, Ordering::SeqCst);
            }),
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::yield_now();
        }
        assert!(fired.load(Ordering::SeqCst));
        reactor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .sync()
            .unwrap();
    }

    #[test]
    fn shutdown_closes_registered_handles() {
        struct Probe {
            closed: AtomicBool,
        }
        impl IoHandle for Arc<Probe> {
            fn ready(&self, _readable: bool, _writable: bool) {}
            fn reactor_shutdown(&self) {
                self.closed.store(true, Ordering::SeqCst);
            }
        }

        let reactor = Reactor::new("reactor-close", 50, None).unwrap();
        let probe = Arc::new(Probe {
            closed: AtomicBool::new(false),
        });
        // Register a real socket so the selector has something to watch.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        let reactor2 = Arc::clone(&reactor);
        let probe2 = Arc::clone(&probe);
        reactor.execute(Box::new(move || {
            use std::os::fd::AsRawFd;
            let fd = stream.as_raw_fd();
            let mut source = mio::unix::SourceFd(&fd);
            reactor2
                .register_source(&mut source, interest::READ, Arc::new(Arc::clone(&probe2)))
                .unwrap();
            // Keep the stream alive for the reactor's lifetime.
            std::mem::forget(stream);
        }));
        reactor
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .sync()
            .unwrap();
        assert!(probe.closed.load(Ordering::SeqCst));
    }
}
