//! # Hawser Executor - Event Loops for the Hawser Transport Engine
//!
//! `hawser-executor` provides the execution layer of the hawser transport
//! engine: write-once asynchronous results, single-threaded event executors,
//! the mio-backed I/O reactor, and executor groups with round-robin
//! selection.
//!
//! ## Overview
//!
//! Everything in hawser happens on an [`EventExecutor`]: a single worker
//! thread draining a FIFO task queue and a delay-scheduled timer queue.
//! Submitting work from another thread enqueues a task and wakes the worker;
//! submitting from the worker itself just enqueues. That one rule gives
//! every channel serial, thread-affine execution without per-channel locks.
//!
//! Two executors ship with the crate:
//!
//! - [`TaskExecutor`]: tasks and timers only, parked on a condvar.
//! - [`Reactor`]: tasks and timers interleaved with readiness polling on a
//!   [`mio::Poll`] selector. Channels register their sockets here; ready
//!   events are routed to the owning channel's [`IoHandle`]. The
//!   `io_ratio` knob bounds how loop time is split between I/O dispatch
//!   and queued tasks.
//!
//! [`ExecutorGroup`] bundles N executors behind a chooser (bitmask
//! round-robin when N is a power of two, modulus otherwise) and aggregates
//! their termination into one future. Shutdown follows the quiet-period
//! protocol: after [`EventExecutor::shutdown_gracefully`] an executor keeps
//! draining until no new task has arrived for the quiet period, or the hard
//! timeout elapses.
//!
//! ## Asynchronous results
//!
//! A [`Promise`] is the writing half and a [`Future`] the reading half of a
//! write-once cell with states pending / success / failure / cancelled.
//! Listeners run exactly once, in registration order, on the promise's
//! executor - which is what keeps handler callbacks on their pipeline's
//! thread. Futures are waitable from outside the executor
//! ([`Future::sync`], [`Future::await_timeout`]); waiting on an executor's
//! own thread is a programming error and panics rather than deadlocks.

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]
#![allow(dead_code)]

pub(crate) mod executor;
pub(crate) mod future;
pub(crate) mod group;
pub(crate) mod reactor;

pub use executor::{EventExecutor, ImmediateExecutor, ScheduledHandle, Task, TaskExecutor};
pub use future::{Cause, Future, Promise};
pub use group::{
    default_chooser, ExecutorChooser, ExecutorGroup, GenericChooser, PowerOfTwoChooser,
    ReactorGroup, ReactorGroupBuilder,
};
pub use reactor::{interest, IoHandle, Reactor};
