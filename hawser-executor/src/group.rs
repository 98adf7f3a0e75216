use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::executor::{EventExecutor, ImmediateExecutor};
use crate::future::{Future, Promise};
use crate::reactor::Reactor;

/// Picks which child of a group serves the next registration.
pub trait ExecutorChooser: Send + Sync + 'static {
    /// The index of the next child.
    fn next_index(&self) -> usize;
}

/// Round-robin via bitmask; only valid for power-of-two group sizes.
pub struct PowerOfTwoChooser {
    idx: AtomicUsize,
    mask: usize,
}

impl PowerOfTwoChooser {
    /// # Panics
    ///
    /// Panics if `len` is not a power of two.
    pub fn new(len: usize) -> PowerOfTwoChooser {
        assert!(len.is_power_of_two(), "len {} is not a power of two", len);
        PowerOfTwoChooser {
            idx: AtomicUsize::new(0),
            mask: len - 1,
        }
    }
}

impl ExecutorChooser for PowerOfTwoChooser {
    fn next_index(&self) -> usize {
        self.idx.fetch_add(1, Ordering::Relaxed) & self.mask
    }
}

/// Round-robin via modulus; works for any group size.
pub struct GenericChooser {
    idx: AtomicUsize,
    len: usize,
}

impl GenericChooser {
    /// # Panics
    ///
    /// Panics if `len` is zero.
    pub fn new(len: usize) -> GenericChooser {
        assert!(len > 0, "empty group");
        GenericChooser {
            idx: AtomicUsize::new(0),
            len,
        }
    }
}

impl ExecutorChooser for GenericChooser {
    fn next_index(&self) -> usize {
        self.idx.fetch_add(1, Ordering::Relaxed) % self.len
    }
}

/// The default chooser policy: bitmask when the size allows it, modulus
/// otherwise.
pub fn default_chooser(len: usize) -> Arc<dyn ExecutorChooser> {
    if len.is_power_of_two() {
        Arc::new(PowerOfTwoChooser::new(len))
    } else {
        Arc::new(GenericChooser::new(len))
    }
}

/// Builds the chooser once the group size is known.
pub type ChooserFactory = fn(usize) -> Arc<dyn ExecutorChooser>;

/// A fixed set of executors behind a chooser, with aggregated termination.
pub struct ExecutorGroup<E: EventExecutor> {
    children: Box<[Arc<E>]>,
    chooser: Arc<dyn ExecutorChooser>,
    termination: Future<()>,
}

impl<E: EventExecutor> ExecutorGroup<E> {
    /// Creates `n` children from `factory`.
    ///
    /// If any child fails to construct, the ones already created are shut
    /// down and joined before the error is returned, so a failed group
    /// leaves no threads behind.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn build(
        n: usize,
        chooser_factory: ChooserFactory,
        mut factory: impl FnMut(usize) -> io::Result<Arc<E>>,
    ) -> io::Result<ExecutorGroup<E>> {
        assert!(n > 0, "group needs at least one executor");
        let mut children: Vec<Arc<E>> = Vec::with_capacity(n);
        for i in 0..n {
            match factory(i) {
                Ok(child) => children.push(child),
                Err(err) => {
                    debug!("child {} failed to start, rolling back: {}", i, err);
                    for child in &children {
                        child.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
                    }
                    for child in &children {
                        let _ = child.termination_future().sync();
                    }
                    return Err(err);
                }
            }
        }

        let termination_promise: Promise<()> = Promise::new(ImmediateExecutor::new());
        let termination = termination_promise.future();
        let terminated = Arc::new(AtomicUsize::new(0));
        for child in &children {
            let terminated = Arc::clone(&terminated);
            let promise = termination_promise.clone();
            child.termination_future().add_listener(move |_| {
                if terminated.fetch_add(1, Ordering::AcqRel) + 1 == n {
                    promise.try_success(());
                }
            });
        }

        Ok(ExecutorGroup {
            children: children.into_boxed_slice(),
            chooser: chooser_factory(n),
            termination,
        })
    }

    /// The chooser's next child.
    pub fn next(&self) -> &Arc<E> {
        &self.children[self.chooser.next_index()]
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// `true` for a group with no children; never true for a built group.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Iterates the children in construction order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<E>> {
        self.children.iter()
    }

    /// Requests graceful shutdown of every child and returns the group's
    /// termination future.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Future<()> {
        for child in self.children.iter() {
            child.shutdown_gracefully(quiet_period, timeout);
        }
        self.termination.clone()
    }

    /// Completes when every child has terminated.
    pub fn termination_future(&self) -> Future<()> {
        self.termination.clone()
    }
}

/// A group of I/O reactors: the event-loop pool channels register with.
pub type ReactorGroup = ExecutorGroup<Reactor>;

impl ReactorGroup {
    /// A reactor group with default settings (see [`ReactorGroupBuilder`]).
    pub fn new() -> io::Result<ReactorGroup> {
        ReactorGroupBuilder::new().build()
    }

    /// A reactor group with `n_threads` reactors and otherwise default
    /// settings.
    pub fn with_threads(n_threads: usize) -> io::Result<ReactorGroup> {
        ReactorGroupBuilder::new().n_threads(n_threads).build()
    }
}

/// Configures and builds a [`ReactorGroup`].
pub struct ReactorGroupBuilder {
    n_threads: usize,
    io_ratio: u8,
    pin_cores: bool,
    name_prefix: String,
    chooser_factory: ChooserFactory,
}

impl Default for ReactorGroupBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorGroupBuilder {
    /// Defaults: 2 x available parallelism threads, `io_ratio` 50, no core
    /// pinning, thread names `hawser-reactor-N`, default chooser.
    pub fn new() -> ReactorGroupBuilder {
        ReactorGroupBuilder {
            n_threads: 0,
            io_ratio: 50,
            pin_cores: false,
            name_prefix: "hawser-reactor".to_owned(),
            chooser_factory: default_chooser,
        }
    }

    /// Number of reactor threads; 0 keeps the default.
    pub fn n_threads(mut self, n: usize) -> Self {
        self.n_threads = n;
        self
    }

    /// Share of loop time reserved for I/O dispatch, in `[1, 100]`.
    pub fn io_ratio(mut self, ratio: u8) -> Self {
        self.io_ratio = ratio;
        self
    }

    /// Pins reactor threads to distinct cores where the platform allows it.
    pub fn pin_cores(mut self, pin: bool) -> Self {
        self.pin_cores = pin;
        self
    }

    /// Prefix for reactor thread names.
    pub fn name_prefix(mut self, prefix: &str) -> Self {
        self.name_prefix = prefix.to_owned();
        self
    }

    /// Replaces the chooser policy.
    pub fn chooser_factory(mut self, factory: ChooserFactory) -> Self {
        self.chooser_factory = factory;
        self
    }

    /// Builds the group, rolling back on partial failure.
    pub fn build(self) -> io::Result<ReactorGroup> {
        let n = if self.n_threads == 0 {
            default_thread_count()
        } else {
            self.n_threads
        };
        let cores = if self.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let prefix = self.name_prefix;
        let io_ratio = self.io_ratio;
        ExecutorGroup::build(n, self.chooser_factory, move |i| {
            let core = cores.get(i % cores.len().max(1)).copied();
            Reactor::new(&format!("{}-{}", prefix, i), io_ratio, core)
        })
    }
}

/// The default reactor count: twice the hardware parallelism.
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskExecutor;
    use std::io::{Error, ErrorKind};
    use std::time::Instant;

    #[test]
    fn power_of_two_chooser_wraps_with_a_mask() {
        let chooser = PowerOfTwoChooser::new(4);
        let picks: Vec<usize> = (0..8).map(|_| chooser.next_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn generic_chooser_wraps_with_a_modulus() {
        let chooser = GenericChooser::new(3);
        let picks: Vec<usize> = (0..8).map(|_| chooser.next_index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn default_chooser_picks_by_size() {
        let group = ExecutorGroup::build(4, default_chooser, |i| {
            TaskExecutor::new(&format!("chooser-{}", i))
        })
        .unwrap();
        let first: *const _ = Arc::as_ptr(group.next());
        for _ in 0..3 {
            group.next();
        }
        // Fifth pick wraps to the first child.
        assert_eq!(first, Arc::as_ptr(group.next()));
        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
            .sync()
            .unwrap();
    }

    #[test]
    fn partial_construction_failure_rolls_back() {
        let result: io::Result<ExecutorGroup<TaskExecutor>> =
            ExecutorGroup::build(3, default_chooser, |i| {
                if i == 2 {
                    Err(Error::new(ErrorKind::Other, "third child refused"))
                } else {
                    TaskExecutor::new(&format!("rollback-{}", i))
                }
            });
        assert!(result.is_err());
    }

    #[test]
    fn group_terminates_within_the_timeout_bound() {
        let group = ExecutorGroup::build(2, default_chooser, |i| {
            TaskExecutor::new(&format!("terminate-{}", i))
        })
        .unwrap();
        let start = Instant::now();
        let future =
            group.shutdown_gracefully(Duration::from_millis(50), Duration::from_millis(500));
        future.sync().unwrap();
        assert!(group.termination_future().is_done());
        assert!(start.elapsed() < Duration::from_secs(2));
        for child in group.iter() {
            assert!(child.is_terminated());
        }
    }
}
