use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use hawser_buffer::ByteBuf;
use hawser_executor::{
    interest, EventExecutor, Future, ImmediateExecutor, IoHandle, Promise, Reactor, ReactorGroup,
    ScheduledHandle,
};
use log::{debug, trace, warn};
use mio::unix::SourceFd;
use mio::Token;
use parking_lot::Mutex;

use crate::config::ChannelConfig;
use crate::error::TransportError;
use crate::message::{release_refcounted, Message};
use crate::outbound::{OutboundBuffer, Writability};
use crate::pipeline::Pipeline;
use crate::recv::RecvBufHandle;
use crate::transport::{ReadOutcome, Transport, TcpTransport, WriteOutcome};

/// Cap on write attempts per flush before the rest waits for writable
/// readiness, so one fat writer cannot hog the reactor.
const WRITE_SPIN_LIMIT: usize = 16;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique channel identity, printable in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> ChannelId {
        ChannelId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{:#06x}", self.0)
    }
}

/// The channel's selector handle: the token the reactor knows it by plus
/// the engine-level interest mask.
struct SelectionKey {
    token: Token,
    ops: u8,
}

struct ConnectInFlight {
    promise: Promise<()>,
    remote: SocketAddr,
    timeout: Option<ScheduledHandle>,
}

/// Channel state mutated only by the owning reactor. The mutex makes that
/// discipline safe rather than assumed; it is never held across pipeline
/// events or promise completion, both of which may re-enter.
struct IoState {
    transport: Box<dyn Transport>,
    key: Option<SelectionKey>,
    read_pending: bool,
    in_flush: bool,
    connect: Option<ConnectInFlight>,
    outbound: OutboundBuffer,
    recv_handle: Option<Box<dyn RecvBufHandle>>,
}

pub(crate) struct ChannelCore {
    id: ChannelId,
    parent: Option<ChannelId>,
    config: ChannelConfig,
    pipeline: Pipeline,
    reactor: OnceLock<Arc<Reactor>>,
    open: AtomicBool,
    registered: AtomicBool,
    active: AtomicBool,
    writable: AtomicBool,
    close_started: AtomicBool,
    closed: AtomicBool,
    close_waiters: Mutex<Vec<Promise<()>>>,
    io: Mutex<IoState>,
}

/// Routes reactor callbacks to the channel without keeping it alive.
struct IoBridge {
    core: Weak<ChannelCore>,
}

impl IoHandle for IoBridge {
    fn ready(&self, readable: bool, writable: bool) {
        if let Some(core) = self.core.upgrade() {
            core.on_ready(readable, writable);
        }
    }

    fn reactor_shutdown(&self) {
        if let Some(core) = self.core.upgrade() {
            core.unsafe_close(None);
        }
    }
}

/// A non-blocking connection endpoint: per-connection state, a pipeline of
/// handlers, and an assigned reactor that owns all of its I/O.
///
/// `Channel` is a cheap handle; clones observe the same channel. All
/// operations are asynchronous: they return a [`Future`] that completes on
/// the channel's reactor, and may be called from any thread - calls off the
/// reactor are trampolined onto it.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.core.id)
            .field("open", &self.is_open())
            .field("registered", &self.is_registered())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Channel {
    /// A channel over a fresh non-blocking TCP endpoint (IPv4).
    pub fn tcp() -> std::io::Result<Channel> {
        Ok(Channel::with_transport(Box::new(TcpTransport::new()?)))
    }

    /// A channel over a caller-supplied transport.
    pub fn with_transport(transport: Box<dyn Transport>) -> Channel {
        let core = Arc::new_cyclic(|weak: &Weak<ChannelCore>| ChannelCore {
            id: ChannelId::next(),
            parent: None,
            config: ChannelConfig::new(),
            pipeline: Pipeline::new(weak.clone()),
            reactor: OnceLock::new(),
            open: AtomicBool::new(true),
            registered: AtomicBool::new(false),
            active: AtomicBool::new(false),
            writable: AtomicBool::new(true),
            close_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_waiters: Mutex::new(Vec::new()),
            io: Mutex::new(IoState {
                transport,
                key: None,
                read_pending: false,
                in_flush: false,
                connect: None,
                outbound: OutboundBuffer::new(),
                recv_handle: None,
            }),
        });
        Channel { core }
    }

    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Channel {
        Channel { core }
    }

    /// This channel's process-unique id.
    pub fn id(&self) -> ChannelId {
        self.core.id
    }

    /// The parent that accepted this channel, if any. Always `None` for
    /// client channels.
    pub fn parent_id(&self) -> Option<ChannelId> {
        self.core.parent
    }

    /// The channel's configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.core.config
    }

    /// The channel's pipeline.
    pub fn pipeline(&self) -> Pipeline {
        self.core.pipeline.clone()
    }

    /// The reactor this channel is bound to, once registered.
    pub fn reactor(&self) -> Option<Arc<Reactor>> {
        self.core.reactor.get().cloned()
    }

    /// `true` until the channel is closed.
    pub fn is_open(&self) -> bool {
        self.core.open.load(Ordering::Acquire)
    }

    /// `true` while registered with a reactor.
    pub fn is_registered(&self) -> bool {
        self.core.registered.load(Ordering::Acquire)
    }

    /// `true` while connected.
    pub fn is_active(&self) -> bool {
        self.core.active.load(Ordering::Acquire)
    }

    /// `false` while pending outbound bytes sit above the high watermark.
    pub fn is_writable(&self) -> bool {
        self.core.writable.load(Ordering::Acquire)
    }

    /// The bound local address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.io.lock().transport.local_addr().ok()
    }

    /// The connected peer address, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.io.lock().transport.peer_addr().ok()
    }

    /// Attaches the channel to `reactor` for the rest of its life.
    ///
    /// Fails with *IllegalState* when already registered. The returned
    /// future completes after `channel_registered` has been fired.
    pub fn register(&self, reactor: &Arc<Reactor>) -> Future<()> {
        let promise: Promise<()> =
            Promise::new(Arc::clone(reactor) as Arc<dyn EventExecutor>);
        let future = promise.future();
        let core = Arc::clone(&self.core);
        let target = Arc::clone(reactor);
        if reactor.in_executor() {
            core.unsafe_register(target, promise);
        } else {
            reactor.execute(Box::new(move || core.unsafe_register(target, promise)));
        }
        future
    }

    /// Registers with the group's next reactor.
    pub fn register_to(&self, group: &ReactorGroup) -> Future<()> {
        self.register(group.next())
    }

    /// Binds the local side of the channel.
    pub fn bind(&self, addr: SocketAddr) -> Future<()> {
        match self.check_registered() {
            Ok(()) => self.core.pipeline.bind(addr),
            Err(future) => future,
        }
    }

    /// Connects to `remote`. See the crate docs for the state machine; the
    /// future fails with *ConnectTimeout*, *ConnectRefused*, an I/O error,
    /// or *IllegalState* when a connect is already pending.
    pub fn connect(&self, remote: SocketAddr) -> Future<()> {
        self.connect_from(remote, None)
    }

    /// Connects to `remote` from a specific local address.
    pub fn connect_from(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Future<()> {
        match self.check_registered() {
            Ok(()) => self.core.pipeline.connect(remote, local),
            Err(future) => future,
        }
    }

    /// Disconnects from the peer. For TCP this closes the channel.
    pub fn disconnect(&self) -> Future<()> {
        match self.check_registered() {
            Ok(()) => self.core.pipeline.disconnect(),
            Err(future) => future,
        }
    }

    /// Closes the channel. Idempotent: every caller's future completes with
    /// the same terminal state once the close has run.
    pub fn close(&self) -> Future<()> {
        self.core.pipeline.close()
    }

    /// Detaches the channel from its reactor without closing it. A detached
    /// channel cannot be re-registered.
    pub fn deregister(&self) -> Future<()> {
        match self.check_registered() {
            Ok(()) => self.core.pipeline.deregister(),
            Err(future) => future,
        }
    }

    /// Requests one read batch (a no-op while one is already pending).
    pub fn read(&self) {
        self.core.pipeline.read();
    }

    /// Enqueues `msg` on the outbound buffer. The future completes when the
    /// kernel accepts the bytes.
    pub fn write(&self, msg: Message) -> Future<()> {
        match self.check_registered() {
            Ok(()) => self.core.pipeline.write(msg),
            Err(future) => {
                release_refcounted(msg.as_ref());
                future
            }
        }
    }

    /// Flushes whatever has been written so far.
    pub fn flush(&self) {
        self.core.pipeline.flush();
    }

    /// Write followed by flush.
    pub fn write_and_flush(&self, msg: Message) -> Future<()> {
        let future = self.write(msg);
        self.flush();
        future
    }

    fn check_registered(&self) -> Result<(), Future<()>> {
        if self.core.reactor.get().is_some() {
            return Ok(());
        }
        let promise: Promise<()> = Promise::new(ImmediateExecutor::new());
        promise.try_failure(
            TransportError::IllegalState("channel is not registered with a reactor").into_cause(),
        );
        Err(promise.future())
    }
}

impl ChannelCore {
    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn reactor_opt(&self) -> Option<Arc<dyn EventExecutor>> {
        self.reactor
            .get()
            .map(|reactor| Arc::clone(reactor) as Arc<dyn EventExecutor>)
    }

    fn reactor(&self) -> Option<&Arc<Reactor>> {
        self.reactor.get()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Readiness router. `OP_CONNECT` resolves first: a connect completion
    /// arrives as writable readiness and must not be mistaken for flush
    /// room.
    fn on_ready(self: &Arc<Self>, readable: bool, writable: bool) {
        let ops = match self.io.lock().key.as_ref() {
            Some(key) => key.ops,
            None => return,
        };
        if writable && ops & interest::CONNECT != 0 {
            self.unsafe_finish_connect();
        }
        if writable && ops & interest::WRITE != 0 {
            self.unsafe_force_flush();
        }
        if readable && ops & interest::READ != 0 {
            self.unsafe_read();
        }
    }

    /// Adds and removes interest bits, pushing the change to the selector.
    /// Caller holds the I/O lock.
    fn update_interest(&self, io: &mut IoState, add: u8, remove: u8) {
        let Some(reactor) = self.reactor() else { return };
        let fd = io.transport.raw_fd();
        if let Some(key) = io.key.as_mut() {
            let ops = (key.ops | add) & !remove;
            if ops != key.ops {
                key.ops = ops;
                let mut source = SourceFd(&fd);
                if let Err(err) = reactor.reregister_source(&mut source, key.token, ops) {
                    warn!("{}: interest update failed: {}", self.id, err);
                }
            }
        }
    }

    // ---- unsafe contract: reactor-only entry points -------------------

    pub(crate) fn unsafe_register(self: &Arc<Self>, reactor: Arc<Reactor>, promise: Promise<()>) {
        debug_assert!(reactor.in_executor());
        if !self.is_open() {
            promise.try_failure(TransportError::ClosedChannel.into_cause());
            return;
        }
        if self.reactor.set(Arc::clone(&reactor)).is_err() || self.is_registered() {
            promise.try_failure(
                TransportError::IllegalState("channel is already registered").into_cause(),
            );
            return;
        }
        let registration = {
            let mut io = self.io.lock();
            let io = &mut *io;
            let fd = io.transport.raw_fd();
            let mut source = SourceFd(&fd);
            let bridge = Arc::new(IoBridge {
                core: Arc::downgrade(self),
            });
            reactor
                .register_source(&mut source, 0, bridge)
                .map(|token| io.key = Some(SelectionKey { token, ops: 0 }))
        };
        if let Err(err) = registration {
            warn!("{}: registration failed: {}", self.id, err);
            self.unsafe_close_forcibly();
            promise.try_failure(TransportError::Io(err).into_cause());
            return;
        }
        self.registered.store(true, Ordering::Release);
        trace!("{}: registered with {}", self.id, reactor.name());
        // Deferred handler_added callbacks run before any pipeline event.
        self.pipeline.invoke_pending_handler_added();
        promise.try_success(());
        self.pipeline.fire_channel_registered();
    }

    pub(crate) fn unsafe_bind(self: &Arc<Self>, addr: SocketAddr, promise: Promise<()>) {
        let result = self.io.lock().transport.bind(addr);
        match result {
            Ok(()) => {
                promise.try_success(());
            }
            Err(err) => {
                promise.try_failure(TransportError::Io(err).into_cause());
            }
        }
    }

    pub(crate) fn unsafe_connect(
        self: &Arc<Self>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: Promise<()>,
    ) {
        if !self.is_open() {
            promise.try_failure(TransportError::ClosedChannel.into_cause());
            return;
        }

        enum Outcome {
            Finished,
            Pending,
            AlreadyPending,
            Failed(std::io::Error),
        }

        let outcome = {
            let mut io = self.io.lock();
            if io.connect.is_some() {
                Outcome::AlreadyPending
            } else {
                match io.transport.connect(remote, local) {
                    Ok(true) => Outcome::Finished,
                    Ok(false) => {
                        io.connect = Some(ConnectInFlight {
                            promise: promise.clone(),
                            remote,
                            timeout: None,
                        });
                        self.update_interest(&mut io, interest::CONNECT, 0);
                        Outcome::Pending
                    }
                    Err(err) => Outcome::Failed(err),
                }
            }
        };

        match outcome {
            Outcome::AlreadyPending => {
                // No OS connect is attempted for the loser.
                promise.try_failure(TransportError::connection_pending().into_cause());
            }
            Outcome::Finished => {
                debug!("{}: connect to {} finished synchronously", self.id, remote);
                self.finish_activation(promise);
            }
            Outcome::Pending => {
                self.arm_connect_timeout(remote);
                let core = Arc::downgrade(self);
                promise.future().add_listener(move |future| {
                    if future.is_cancelled() {
                        if let Some(core) = core.upgrade() {
                            core.connect_cancelled();
                        }
                    }
                });
            }
            Outcome::Failed(err) => {
                promise.try_failure(TransportError::from_connect_io(err).into_cause());
            }
        }
    }

    fn arm_connect_timeout(self: &Arc<Self>, remote: SocketAddr) {
        let Some(timeout) = self.config.connect_timeout() else {
            return;
        };
        let Some(reactor) = self.reactor() else { return };
        let core = Arc::downgrade(self);
        let handle = reactor.schedule(
            timeout,
            Box::new(move || {
                if let Some(core) = core.upgrade() {
                    core.connect_timed_out(remote, timeout);
                }
            }),
        );
        if let Some(connect) = self.io.lock().connect.as_mut() {
            connect.timeout = Some(handle);
        } else {
            // Connect resolved before the timer was stored.
            handle.cancel();
        }
    }

    fn connect_timed_out(self: &Arc<Self>, remote: SocketAddr, timeout: Duration) {
        let promise = {
            let mut io = self.io.lock();
            match io.connect.as_ref() {
                Some(connect) if connect.remote == remote => {
                    io.connect.take().map(|connect| connect.promise)
                }
                _ => None,
            }
        };
        let Some(promise) = promise else { return };
        warn!("{}: connect to {} timed out", self.id, remote);
        if promise.try_failure(TransportError::ConnectTimeout(timeout).into_cause()) {
            self.unsafe_close(None);
        }
    }

    fn connect_cancelled(self: &Arc<Self>) {
        let timeout = {
            let mut io = self.io.lock();
            io.connect.take().and_then(|connect| connect.timeout)
        };
        if let Some(timeout) = timeout {
            timeout.cancel();
        }
        self.unsafe_close(None);
    }

    pub(crate) fn unsafe_finish_connect(self: &Arc<Self>) {
        let result = {
            let mut io = self.io.lock();
            let io = &mut *io;
            self.update_interest(io, 0, interest::CONNECT);
            io.transport.finish_connect()
        };
        let connect = { self.io.lock().connect.take() };
        let Some(connect) = connect else {
            // Cancelled or timed out before the selector got here.
            return;
        };
        if let Some(timeout) = connect.timeout {
            timeout.cancel();
        }
        match result {
            Ok(()) => {
                debug!("{}: connected to {}", self.id, connect.remote);
                self.finish_activation(connect.promise);
            }
            Err(err) => {
                debug!("{}: connect to {} failed: {}", self.id, connect.remote, err);
                connect
                    .promise
                    .try_failure(TransportError::from_connect_io(err).into_cause());
            }
        }
    }

    /// Marks the channel active and completes the connect promise. A
    /// cancellation that won the race closes the channel, but
    /// `channel_active` still fires first: what happened, happened.
    fn finish_activation(self: &Arc<Self>, promise: Promise<()>) {
        let was_active = self.active.swap(true, Ordering::AcqRel);
        let promise_set = promise.try_success(());
        if !was_active {
            self.pipeline.fire_channel_active();
        }
        if !promise_set {
            self.unsafe_close(None);
        }
    }

    pub(crate) fn unsafe_disconnect(self: &Arc<Self>, promise: Promise<()>) {
        // A TCP stream has no half-open notion at this layer; disconnect is
        // close.
        self.unsafe_close(Some(promise));
    }

    pub(crate) fn unsafe_begin_read(self: &Arc<Self>) {
        let mut io = self.io.lock();
        let io = &mut *io;
        if io.key.is_none() {
            return;
        }
        io.read_pending = true;
        self.update_interest(io, interest::READ, 0);
    }

    pub(crate) fn unsafe_write(self: &Arc<Self>, msg: Message, promise: Promise<()>) {
        let buf = match msg.downcast::<ByteBuf>() {
            Ok(buf) => *buf,
            Err(msg) => {
                release_refcounted(msg.as_ref());
                promise.try_failure(
                    TransportError::IllegalState("outbound message must be a ByteBuf")
                        .into_cause(),
                );
                return;
            }
        };
        if !self.is_open() {
            if let Err(err) = buf.release() {
                warn!("{}: releasing write after close failed: {}", self.id, err);
            }
            promise.try_failure(TransportError::ClosedChannel.into_cause());
            return;
        }
        let size = buf.readable_bytes();
        let change = {
            let mut io = self.io.lock();
            io.outbound
                .add_message(buf, size, promise, self.config.high_water_mark())
        };
        if change == Writability::BecameUnwritable {
            self.writable.store(false, Ordering::Release);
            self.pipeline.fire_channel_writability_changed();
        }
    }

    pub(crate) fn unsafe_flush(self: &Arc<Self>) {
        let flush_pending = {
            let mut io = self.io.lock();
            io.outbound.add_flush();
            io.key
                .as_ref()
                .map(|key| key.ops & interest::WRITE != 0)
                .unwrap_or(false)
        };
        // With OP_WRITE armed the reactor will call force_flush when the
        // socket drains; pushing now would just collect WouldBlock.
        if !flush_pending {
            self.do_flush();
        }
    }

    pub(crate) fn unsafe_force_flush(self: &Arc<Self>) {
        self.do_flush();
    }

    fn do_flush(self: &Arc<Self>) {
        if !self.is_active() {
            // Nothing to drain into; a flush here fails its entries rather
            // than queueing them forever.
            let open = self.is_open();
            let stranded = {
                let mut io = self.io.lock();
                io.outbound.drain_flushed()
            };
            if stranded.is_empty() {
                return;
            }
            let cause = if open {
                TransportError::IllegalState("channel is not yet connected").into_cause()
            } else {
                TransportError::ClosedChannel.into_cause()
            };
            for promise in stranded {
                promise.try_failure(cause.clone());
            }
            return;
        }
        let mut completions: Vec<Promise<()>> = Vec::new();
        let mut became_writable = false;
        let mut write_error: Option<std::io::Error> = None;
        {
            let mut io = self.io.lock();
            let io = &mut *io;
            if io.in_flush {
                return;
            }
            io.in_flush = true;
            let low = self.config.low_water_mark();
            let mut request_write = false;
            for _ in 0..WRITE_SPIN_LIMIT {
                let Some(buf) = io.outbound.current() else { break };
                if buf.readable_bytes() == 0 {
                    // Zero-length writes complete without touching the
                    // socket.
                    let (promise, change) = io.outbound.remove_written(low);
                    completions.extend(promise);
                    if change == Writability::BecameWritable {
                        became_writable = true;
                    }
                    continue;
                }
                match io.transport.write(buf) {
                    Ok(WriteOutcome::Written(0)) | Ok(WriteOutcome::WouldBlock) => {
                        request_write = true;
                        break;
                    }
                    Ok(WriteOutcome::Written(n)) => {
                        buf.skip_bytes(n);
                        if buf.readable_bytes() == 0 {
                            let (promise, change) = io.outbound.remove_written(low);
                            completions.extend(promise);
                            if change == Writability::BecameWritable {
                                became_writable = true;
                            }
                        }
                        // A partial write leaves the entry at the head; the
                        // next iteration retries what the kernel left.
                    }
                    Err(err) => {
                        write_error = Some(err);
                        break;
                    }
                }
            }
            if io.outbound.has_flushable() && write_error.is_none() {
                request_write = true;
            }
            if request_write {
                self.update_interest(io, interest::WRITE, 0);
            } else {
                self.update_interest(io, 0, interest::WRITE);
            }
            io.in_flush = false;
        }
        for promise in completions {
            promise.try_success(());
        }
        if became_writable {
            self.writable.store(true, Ordering::Release);
            self.pipeline.fire_channel_writability_changed();
        }
        if let Some(err) = write_error {
            warn!("{}: write failed, closing: {}", self.id, err);
            self.unsafe_close(None);
        }
    }

    pub(crate) fn unsafe_read(self: &Arc<Self>) {
        let alloc = self.config.allocator();
        let mut handle = {
            let mut io = self.io.lock();
            io.read_pending = false;
            io.recv_handle
                .take()
                .unwrap_or_else(|| self.config.recv_buf_allocator().new_handle())
        };
        handle.begin_batch();

        let mut eof = false;
        let mut read_error: Option<std::io::Error> = None;
        loop {
            let mut buf = match handle.allocate(alloc.as_ref()) {
                Ok(buf) => buf,
                Err(err) => {
                    self.pipeline
                        .fire_exception_caught(TransportError::Buffer(err).into_cause());
                    break;
                }
            };
            let outcome = { self.io.lock().transport.read(&mut buf) };
            match outcome {
                Ok(ReadOutcome::Read(n)) => {
                    handle.record_read(n);
                    self.pipeline.fire_channel_read(Box::new(buf));
                    if !self.is_open() || !handle.continue_reading() {
                        break;
                    }
                }
                Ok(ReadOutcome::WouldBlock) => {
                    discard(buf, &self.id);
                    break;
                }
                Ok(ReadOutcome::Eof) => {
                    discard(buf, &self.id);
                    eof = true;
                    break;
                }
                Err(err) => {
                    discard(buf, &self.id);
                    read_error = Some(err);
                    break;
                }
            }
        }

        handle.batch_complete();
        {
            let mut io = self.io.lock();
            io.recv_handle = Some(handle);
        }
        self.pipeline.fire_channel_read_complete();

        if let Some(err) = read_error {
            self.pipeline
                .fire_exception_caught(TransportError::Io(err).into_cause());
            self.unsafe_close(None);
        } else if eof {
            debug!("{}: end of stream", self.id);
            self.unsafe_close(None);
        } else {
            // Auto-read re-armed the interest during read_complete; if
            // nobody asked for more, stop the selector from spinning.
            let mut io = self.io.lock();
            let io = &mut *io;
            if !io.read_pending {
                self.update_interest(io, 0, interest::READ);
            }
        }
    }

    /// The close sequence. Idempotent: the first call runs it, later calls
    /// (and concurrent ones) complete with the same terminal state.
    pub(crate) fn unsafe_close(self: &Arc<Self>, promise: Option<Promise<()>>) {
        {
            let mut waiters = self.close_waiters.lock();
            if self.close_started.swap(true, Ordering::AcqRel) {
                match promise {
                    Some(promise) if self.closed.load(Ordering::Acquire) => {
                        promise.try_success(());
                    }
                    Some(promise) => waiters.push(promise),
                    None => {}
                }
                return;
            }
            if let Some(promise) = promise {
                waiters.push(promise);
            }
        }

        // Outstanding connect attempt dies with the channel.
        let connect = { self.io.lock().connect.take() };
        if let Some(connect) = connect {
            if let Some(timeout) = connect.timeout {
                timeout.cancel();
            }
            connect
                .promise
                .try_failure(TransportError::ClosedChannel.into_cause());
        }

        self.open.store(false, Ordering::Release);
        self.active.store(false, Ordering::Release);

        let (close_result, pending) = {
            let mut io = self.io.lock();
            let io = &mut *io;
            let close_result = io.transport.close();
            let pending = io.outbound.drain_all();
            (close_result, pending)
        };
        if let Err(err) = close_result {
            warn!("{}: transport close failed: {}", self.id, err);
        }
        // Every queued write fails; the kernel never saw their bytes.
        let cause = TransportError::ClosedChannel.into_cause();
        for promise in pending {
            promise.try_failure(cause.clone());
        }

        // Unconditional: a closed channel is inactive whether or not the
        // connect ever finished; the once-only guarantee comes from the
        // close sequence running once.
        self.pipeline.fire_channel_inactive();

        if self.registered.swap(false, Ordering::AcqRel) {
            self.do_deregister();
            self.pipeline.fire_channel_unregistered();
        }

        self.closed.store(true, Ordering::Release);
        let waiters = std::mem::take(&mut *self.close_waiters.lock());
        for promise in waiters {
            promise.try_success(());
        }
        trace!("{}: closed", self.id);
    }

    /// Closes the socket without running the close sequence; used when
    /// registration fails before the channel ever lived.
    pub(crate) fn unsafe_close_forcibly(&self) {
        self.open.store(false, Ordering::Release);
        if let Err(err) = self.io.lock().transport.close() {
            debug!("{}: forcible close failed: {}", self.id, err);
        }
    }

    pub(crate) fn unsafe_deregister(self: &Arc<Self>, promise: Promise<()>) {
        if !self.registered.swap(false, Ordering::AcqRel) {
            promise.try_success(());
            return;
        }
        self.do_deregister();
        self.pipeline.fire_channel_unregistered();
        promise.try_success(());
    }

    fn do_deregister(self: &Arc<Self>) {
        let Some(reactor) = self.reactor() else { return };
        let mut io = self.io.lock();
        let io = &mut *io;
        io.read_pending = false;
        if let Some(key) = io.key.take() {
            let fd = io.transport.raw_fd();
            let mut source = SourceFd(&fd);
            if let Err(err) = reactor.deregister_source(&mut source, key.token) {
                debug!("{}: deregister failed: {}", self.id, err);
            }
        }
    }
}

fn discard(buf: ByteBuf, id: &ChannelId) {
    if let Err(err) = buf.release() {
        warn!("{}: failed to release an unused receive buffer: {}", id, err);
    }
}
