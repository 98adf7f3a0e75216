use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hawser_executor::{Cause, EventExecutor, Future, ImmediateExecutor, Promise};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::channel::{Channel, ChannelCore};
use crate::error::TransportError;
use crate::handler::{Capabilities, ChannelHandler, Handler, InboundHandler, OutboundHandler};
use crate::message::{release_refcounted, Message};

pub(crate) enum HandlerSlot {
    Inbound(Mutex<Box<dyn InboundHandler>>),
    Outbound(Mutex<Box<dyn OutboundHandler>>),
    Duplex(Mutex<Box<dyn crate::handler::DuplexHandler>>),
}

impl HandlerSlot {
    fn of(handler: Handler) -> HandlerSlot {
        match handler {
            Handler::Inbound(h) => HandlerSlot::Inbound(Mutex::new(h)),
            Handler::Outbound(h) => HandlerSlot::Outbound(Mutex::new(h)),
            Handler::Duplex(h) => HandlerSlot::Duplex(Mutex::new(h)),
        }
    }
}

/// Invokes an inbound callback on the handler in `slot`, locking only that
/// handler's cell for the duration of the call.
///
/// The cell is only ever locked on the context's own executor, so a failed
/// `try_lock` means re-entrancy: this handler, somewhere up the stack,
/// issued an operation that routed back to itself (a read handler calling
/// `channel.write()` is the classic case). The `else` arm forwards the
/// event past the handler instead of deadlocking on its own cell.
macro_rules! inbound_call {
    ($this:expr, $ctx:expr, $method:ident ($($arg:expr),*) else $fallback:block) => {
        match &$this.slot {
            HandlerSlot::Inbound(h) => match h.try_lock() {
                Some(mut h) => h.$method($ctx $(, $arg)*),
                None => $fallback,
            },
            HandlerSlot::Duplex(h) => match h.try_lock() {
                Some(mut h) => h.$method($ctx $(, $arg)*),
                None => $fallback,
            },
            HandlerSlot::Outbound(_) => unreachable!("capability bits let an inbound event through"),
        }
    };
}

/// Invokes an outbound callback on the handler in `slot`; same re-entrancy
/// rules as `inbound_call`.
macro_rules! outbound_call {
    ($this:expr, $ctx:expr, $method:ident ($($arg:expr),*) else $fallback:block) => {
        match &$this.slot {
            HandlerSlot::Outbound(h) => match h.try_lock() {
                Some(mut h) => h.$method($ctx $(, $arg)*),
                None => $fallback,
            },
            HandlerSlot::Duplex(h) => match h.try_lock() {
                Some(mut h) => h.$method($ctx $(, $arg)*),
                None => $fallback,
            },
            HandlerSlot::Inbound(_) => unreachable!("capability bits let an outbound op through"),
        }
    };
}

/// Invokes a lifecycle callback, present on every handler kind. A
/// re-entrant hit here has nothing to forward to; it is dropped.
macro_rules! lifecycle_call {
    ($this:expr, $ctx:expr, $method:ident) => {
        match &$this.slot {
            HandlerSlot::Inbound(h) => match h.try_lock() {
                Some(mut h) => h.$method($ctx),
                None => trace!("re-entrant lifecycle callback on '{}'", $this.name),
            },
            HandlerSlot::Outbound(h) => match h.try_lock() {
                Some(mut h) => h.$method($ctx),
                None => trace!("re-entrant lifecycle callback on '{}'", $this.name),
            },
            HandlerSlot::Duplex(h) => match h.try_lock() {
                Some(mut h) => h.$method($ctx),
                None => trace!("re-entrant lifecycle callback on '{}'", $this.name),
            },
        }
    };
}

/// A handler's position in a pipeline: its links, its cached capability
/// bits, and the executor its callbacks run on.
pub(crate) struct ContextInner {
    name: String,
    pipeline: Weak<PipelineInner>,
    channel: Weak<ChannelCore>,
    executor: Option<Arc<dyn EventExecutor>>,
    caps: Capabilities,
    slot: HandlerSlot,
    next: RwLock<Option<Arc<ContextInner>>>,
    prev: RwLock<Option<Weak<ContextInner>>>,
    removed: AtomicBool,
}

/// Turns a panic payload into readable text.
fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

/// Runs `f` on `ctx`'s executor: inline when already there, re-queued
/// otherwise. This is the only place events hop threads.
fn dispatch(ctx: &Arc<ContextInner>, f: impl FnOnce(&Arc<ContextInner>) + Send + 'static) {
    let executor = ctx.executor();
    if executor.in_executor() {
        f(ctx);
    } else {
        let ctx = Arc::clone(ctx);
        executor.execute(Box::new(move || f(&ctx)));
    }
}

impl ContextInner {
    pub(crate) fn executor(&self) -> Arc<dyn EventExecutor> {
        if let Some(executor) = &self.executor {
            return Arc::clone(executor);
        }
        if let Some(core) = self.channel.upgrade() {
            if let Some(reactor) = core.reactor_opt() {
                return reactor;
            }
        }
        ImmediateExecutor::new()
    }

    fn as_context(self: &Arc<Self>) -> HandlerContext {
        HandlerContext {
            inner: Arc::clone(self),
        }
    }

    fn next_inbound(&self) -> Option<Arc<ContextInner>> {
        let mut cursor = self.next.read().clone();
        while let Some(ctx) = cursor {
            if ctx.caps.inbound {
                return Some(ctx);
            }
            cursor = ctx.next.read().clone();
        }
        None
    }

    fn prev_outbound(&self) -> Option<Arc<ContextInner>> {
        let mut cursor = self.prev.read().clone().and_then(|weak| weak.upgrade());
        while let Some(ctx) = cursor {
            if ctx.caps.outbound {
                return Some(ctx);
            }
            cursor = ctx.prev.read().clone().and_then(|weak| weak.upgrade());
        }
        None
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Runs an inbound callback under the panic funnel: a panicking handler
    /// becomes `exception_caught` at the next inbound context.
    fn guarded(self: &Arc<Self>, f: impl FnOnce(&HandlerContext)) {
        let ctx = self.as_context();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(&ctx))) {
            let text = panic_text(payload);
            warn!("handler '{}' panicked: {}", self.name, text);
            ctx.fire_exception_caught(TransportError::HandlerPanic(text).into_cause());
        }
    }

    /// Runs an outbound callback; a panic fails the operation's promise
    /// instead of entering the inbound path.
    fn guarded_outbound(self: &Arc<Self>, promise: Option<&Promise<()>>, f: impl FnOnce(&HandlerContext)) {
        let ctx = self.as_context();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(&ctx))) {
            let text = panic_text(payload);
            warn!("handler '{}' panicked in outbound op: {}", self.name, text);
            if let Some(promise) = promise {
                promise.try_failure(TransportError::HandlerPanic(text).into_cause());
            }
        }
    }

    // ---- inbound invocation -------------------------------------------

    pub(crate) fn invoke_handler_added(self: &Arc<Self>) {
        dispatch(self, |this| {
            this.guarded(|ctx| {
                lifecycle_call!(this, ctx, handler_added);
            });
        });
    }

    /// Always queued, never inline: removal is commonly triggered from
    /// inside the removed handler's own callback (the initializer removes
    /// itself), and its cell is still locked there.
    pub(crate) fn invoke_handler_removed(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.executor().execute(Box::new(move || {
            this.guarded(|ctx| {
                lifecycle_call!(this, ctx, handler_removed);
            });
        }));
    }

    pub(crate) fn invoke_channel_registered(self: &Arc<Self>) {
        dispatch(self, |this| {
            if this.is_removed() {
                this.as_context().fire_channel_registered();
                return;
            }
            this.guarded(|ctx| {
                inbound_call!(this, ctx, channel_registered() else { ctx.fire_channel_registered() });
            });
        });
    }

    pub(crate) fn invoke_channel_unregistered(self: &Arc<Self>) {
        dispatch(self, |this| {
            if this.is_removed() {
                this.as_context().fire_channel_unregistered();
                return;
            }
            this.guarded(|ctx| {
                inbound_call!(this, ctx, channel_unregistered() else { ctx.fire_channel_unregistered() });
            });
        });
    }

    pub(crate) fn invoke_channel_active(self: &Arc<Self>) {
        dispatch(self, |this| {
            if this.is_removed() {
                this.as_context().fire_channel_active();
                return;
            }
            this.guarded(|ctx| {
                inbound_call!(this, ctx, channel_active() else { ctx.fire_channel_active() });
            });
        });
    }

    pub(crate) fn invoke_channel_inactive(self: &Arc<Self>) {
        dispatch(self, |this| {
            if this.is_removed() {
                this.as_context().fire_channel_inactive();
                return;
            }
            this.guarded(|ctx| {
                inbound_call!(this, ctx, channel_inactive() else { ctx.fire_channel_inactive() });
            });
        });
    }

    pub(crate) fn invoke_channel_read(self: &Arc<Self>, msg: Message) {
        dispatch(self, move |this| {
            if this.is_removed() {
                this.as_context().fire_channel_read(msg);
                return;
            }
            this.guarded(move |ctx| {
                inbound_call!(this, ctx, channel_read(msg) else { ctx.fire_channel_read(msg) });
            });
        });
    }

    pub(crate) fn invoke_channel_read_complete(self: &Arc<Self>) {
        dispatch(self, |this| {
            if this.is_removed() {
                this.as_context().fire_channel_read_complete();
                return;
            }
            this.guarded(|ctx| {
                inbound_call!(this, ctx, channel_read_complete() else { ctx.fire_channel_read_complete() });
            });
        });
    }

    pub(crate) fn invoke_channel_writability_changed(self: &Arc<Self>) {
        dispatch(self, |this| {
            if this.is_removed() {
                this.as_context().fire_channel_writability_changed();
                return;
            }
            this.guarded(|ctx| {
                inbound_call!(this, ctx, channel_writability_changed() else { ctx.fire_channel_writability_changed() });
            });
        });
    }

    pub(crate) fn invoke_user_event(self: &Arc<Self>, event: Message) {
        dispatch(self, move |this| {
            if this.is_removed() {
                this.as_context().fire_user_event(event);
                return;
            }
            this.guarded(move |ctx| {
                inbound_call!(this, ctx, user_event(event) else { ctx.fire_user_event(event) });
            });
        });
    }

    pub(crate) fn invoke_exception_caught(self: &Arc<Self>, cause: Cause) {
        dispatch(self, move |this| {
            if this.is_removed() {
                this.as_context().fire_exception_caught(cause);
                return;
            }
            let ctx = this.as_context();
            let result = catch_unwind(AssertUnwindSafe(|| {
                inbound_call!(this, &ctx, exception_caught(Arc::clone(&cause)) else { ctx.fire_exception_caught(Arc::clone(&cause)) });
            }));
            if result.is_err() {
                // A throwing exception handler has nowhere left to go.
                warn!(
                    "handler '{}' panicked inside exception_caught; original cause: {}",
                    this.name, cause
                );
            }
        });
    }

    // ---- outbound invocation ------------------------------------------

    pub(crate) fn invoke_bind(self: &Arc<Self>, addr: SocketAddr, promise: Promise<()>) {
        dispatch(self, move |this| {
            if this.is_removed() {
                this.as_context().bind_with(addr, promise);
                return;
            }
            this.guarded_outbound(Some(&promise), |ctx| {
                outbound_call!(this, ctx, bind(addr, promise.clone()) else { ctx.bind_with(addr, promise.clone()) });
            });
        });
    }

    pub(crate) fn invoke_connect(
        self: &Arc<Self>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: Promise<()>,
    ) {
        dispatch(self, move |this| {
            if this.is_removed() {
                this.as_context().connect_with(remote, local, promise);
                return;
            }
            this.guarded_outbound(Some(&promise), |ctx| {
                outbound_call!(this, ctx, connect(remote, local, promise.clone()) else { ctx.connect_with(remote, local, promise.clone()) });
            });
        });
    }

    pub(crate) fn invoke_disconnect(self: &Arc<Self>, promise: Promise<()>) {
        dispatch(self, move |this| {
            if this.is_removed() {
                this.as_context().disconnect_with(promise);
                return;
            }
            this.guarded_outbound(Some(&promise), |ctx| {
                outbound_call!(this, ctx, disconnect(promise.clone()) else { ctx.disconnect_with(promise.clone()) });
            });
        });
    }

    pub(crate) fn invoke_close(self: &Arc<Self>, promise: Promise<()>) {
        dispatch(self, move |this| {
            if this.is_removed() {
                this.as_context().close_with(promise);
                return;
            }
            this.guarded_outbound(Some(&promise), |ctx| {
                outbound_call!(this, ctx, close(promise.clone()) else { ctx.close_with(promise.clone()) });
            });
        });
    }

    pub(crate) fn invoke_deregister(self: &Arc<Self>, promise: Promise<()>) {
        dispatch(self, move |this| {
            if this.is_removed() {
                this.as_context().deregister_with(promise);
                return;
            }
            this.guarded_outbound(Some(&promise), |ctx| {
                outbound_call!(this, ctx, deregister(promise.clone()) else { ctx.deregister_with(promise.clone()) });
            });
        });
    }

    pub(crate) fn invoke_read(self: &Arc<Self>) {
        dispatch(self, |this| {
            if this.is_removed() {
                this.as_context().read();
                return;
            }
            this.guarded_outbound(None, |ctx| {
                outbound_call!(this, ctx, read() else { ctx.read() });
            });
        });
    }

    pub(crate) fn invoke_write(self: &Arc<Self>, msg: Message, promise: Promise<()>) {
        dispatch(self, move |this| {
            if this.is_removed() {
                this.as_context().write_with(msg, promise);
                return;
            }
            let on_panic = promise.clone();
            this.guarded_outbound(Some(&on_panic), move |ctx| {
                outbound_call!(this, ctx, write(msg, promise) else { ctx.write_with(msg, promise) });
            });
        });
    }

    pub(crate) fn invoke_flush(self: &Arc<Self>) {
        dispatch(self, |this| {
            if this.is_removed() {
                this.as_context().flush();
                return;
            }
            this.guarded_outbound(None, |ctx| {
                outbound_call!(this, ctx, flush() else { ctx.flush() });
            });
        });
    }
}

/// A handler's view of its channel: the hub for forwarding events inbound
/// and issuing operations outbound.
#[derive(Clone)]
pub struct HandlerContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl HandlerContext {
    /// The context's unique name within its pipeline.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The channel this pipeline belongs to.
    pub fn channel(&self) -> Channel {
        Channel::from_core(
            self.inner
                .channel
                .upgrade()
                .expect("channel dropped while its pipeline is running"),
        )
    }

    /// The executor this context's handler runs on.
    pub fn executor(&self) -> Arc<dyn EventExecutor> {
        self.inner.executor()
    }

    /// The owning pipeline.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline {
            inner: self
                .inner
                .pipeline
                .upgrade()
                .expect("pipeline dropped while its context is running"),
        }
    }

    // ---- inbound forwarding -------------------------------------------

    /// Forwards `channel_registered` to the next inbound context.
    pub fn fire_channel_registered(&self) {
        if let Some(next) = self.inner.next_inbound() {
            next.invoke_channel_registered();
        }
    }

    /// Forwards `channel_unregistered` to the next inbound context.
    pub fn fire_channel_unregistered(&self) {
        if let Some(next) = self.inner.next_inbound() {
            next.invoke_channel_unregistered();
        }
    }

    /// Forwards `channel_active` to the next inbound context.
    pub fn fire_channel_active(&self) {
        if let Some(next) = self.inner.next_inbound() {
            next.invoke_channel_active();
        }
    }

    /// Forwards `channel_inactive` to the next inbound context.
    pub fn fire_channel_inactive(&self) {
        if let Some(next) = self.inner.next_inbound() {
            next.invoke_channel_inactive();
        }
    }

    /// Forwards an inbound message to the next inbound context.
    pub fn fire_channel_read(&self, msg: Message) {
        match self.inner.next_inbound() {
            Some(next) => next.invoke_channel_read(msg),
            None => {
                warn!("channel_read fell off the end of the pipeline");
                release_refcounted(msg.as_ref());
            }
        }
    }

    /// Forwards `channel_read_complete` to the next inbound context.
    pub fn fire_channel_read_complete(&self) {
        if let Some(next) = self.inner.next_inbound() {
            next.invoke_channel_read_complete();
        }
    }

    /// Forwards `channel_writability_changed` to the next inbound context.
    pub fn fire_channel_writability_changed(&self) {
        if let Some(next) = self.inner.next_inbound() {
            next.invoke_channel_writability_changed();
        }
    }

    /// Forwards a user event to the next inbound context.
    pub fn fire_user_event(&self, event: Message) {
        match self.inner.next_inbound() {
            Some(next) => next.invoke_user_event(event),
            None => {
                release_refcounted(event.as_ref());
            }
        }
    }

    /// Forwards an error to the next inbound context.
    pub fn fire_exception_caught(&self, cause: Cause) {
        match self.inner.next_inbound() {
            Some(next) => next.invoke_exception_caught(cause),
            None => warn!("exception fell off the end of the pipeline: {}", cause),
        }
    }

    // ---- outbound operations ------------------------------------------

    fn new_promise(&self) -> Promise<()> {
        Promise::new(self.inner.executor())
    }

    /// Binds through the outbound path.
    pub fn bind(&self, addr: SocketAddr) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        self.bind_with(addr, promise);
        future
    }

    /// Binds with a caller-supplied promise.
    pub fn bind_with(&self, addr: SocketAddr, promise: Promise<()>) {
        match self.inner.prev_outbound() {
            Some(prev) => prev.invoke_bind(addr, promise),
            None => drop_off_head(&promise),
        }
    }

    /// Connects through the outbound path.
    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        self.connect_with(remote, local, promise);
        future
    }

    /// Connects with a caller-supplied promise.
    pub fn connect_with(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: Promise<()>,
    ) {
        match self.inner.prev_outbound() {
            Some(prev) => prev.invoke_connect(remote, local, promise),
            None => drop_off_head(&promise),
        }
    }

    /// Disconnects through the outbound path.
    pub fn disconnect(&self) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        self.disconnect_with(promise);
        future
    }

    /// Disconnects with a caller-supplied promise.
    pub fn disconnect_with(&self, promise: Promise<()>) {
        match self.inner.prev_outbound() {
            Some(prev) => prev.invoke_disconnect(promise),
            None => drop_off_head(&promise),
        }
    }

    /// Closes through the outbound path.
    pub fn close(&self) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        self.close_with(promise);
        future
    }

    /// Closes with a caller-supplied promise.
    pub fn close_with(&self, promise: Promise<()>) {
        match self.inner.prev_outbound() {
            Some(prev) => prev.invoke_close(promise),
            None => drop_off_head(&promise),
        }
    }

    /// Deregisters through the outbound path.
    pub fn deregister(&self) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        self.deregister_with(promise);
        future
    }

    /// Deregisters with a caller-supplied promise.
    pub fn deregister_with(&self, promise: Promise<()>) {
        match self.inner.prev_outbound() {
            Some(prev) => prev.invoke_deregister(promise),
            None => drop_off_head(&promise),
        }
    }

    /// Requests the next read batch through the outbound path.
    pub fn read(&self) {
        if let Some(prev) = self.inner.prev_outbound() {
            prev.invoke_read();
        }
    }

    /// Writes through the outbound path. The future completes when the
    /// bytes reach the kernel, or fails with the close/cancel cause.
    pub fn write(&self, msg: Message) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        self.write_with(msg, promise);
        future
    }

    /// Writes with a caller-supplied promise.
    pub fn write_with(&self, msg: Message, promise: Promise<()>) {
        match self.inner.prev_outbound() {
            Some(prev) => prev.invoke_write(msg, promise),
            None => {
                release_refcounted(msg.as_ref());
                drop_off_head(&promise);
            }
        }
    }

    /// Flushes through the outbound path.
    pub fn flush(&self) {
        if let Some(prev) = self.inner.prev_outbound() {
            prev.invoke_flush();
        }
    }

    /// Write followed by flush, returning the write's future.
    pub fn write_and_flush(&self, msg: Message) -> Future<()> {
        let future = self.write(msg);
        self.flush();
        future
    }
}

/// Only reachable when an outbound operation starts from the head itself;
/// there is no floor left to serve it.
fn drop_off_head(promise: &Promise<()>) {
    promise.try_failure(
        TransportError::IllegalState("operation fell off the pipeline head").into_cause(),
    );
}

pub(crate) struct PipelineInner {
    channel: Weak<ChannelCore>,
    head: Arc<ContextInner>,
    tail: Arc<ContextInner>,
    /// Guards link mutation and name uniqueness. Never held across handler
    /// callbacks, so no event dispatch can observe a half-linked chain or
    /// deadlock against a structural change.
    structure: Mutex<()>,
    /// Contexts added before registration; their `handler_added` runs when
    /// the channel registers.
    pending_added: Mutex<Vec<Arc<ContextInner>>>,
}

/// The ordered chain of handlers attached to one channel.
///
/// Two permanent sentinels bracket the user chain: the head terminates
/// outbound operations on the channel's internals, the tail is the inbound
/// default that logs unhandled events and releases reference-counted
/// messages. Inbound events run head to tail, outbound operations tail to
/// head, each skipping contexts whose capability bits do not include the
/// event.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub(crate) fn new(channel: Weak<ChannelCore>) -> Pipeline {
        let inner = Arc::new_cyclic(|pipeline: &Weak<PipelineInner>| {
            let head = Arc::new(ContextInner {
                name: "head".to_owned(),
                pipeline: pipeline.clone(),
                channel: channel.clone(),
                executor: None,
                caps: Capabilities {
                    inbound: true,
                    outbound: true,
                },
                slot: HandlerSlot::Duplex(Mutex::new(Box::new(HeadHandler {
                    channel: channel.clone(),
                }))),
                next: RwLock::new(None),
                prev: RwLock::new(None),
                removed: AtomicBool::new(false),
            });
            let tail = Arc::new(ContextInner {
                name: "tail".to_owned(),
                pipeline: pipeline.clone(),
                channel: channel.clone(),
                executor: None,
                caps: Capabilities {
                    inbound: true,
                    outbound: false,
                },
                slot: HandlerSlot::Inbound(Mutex::new(Box::new(TailHandler))),
                next: RwLock::new(None),
                prev: RwLock::new(None),
                removed: AtomicBool::new(false),
            });
            *head.next.write() = Some(Arc::clone(&tail));
            *tail.prev.write() = Some(Arc::downgrade(&head));
            PipelineInner {
                channel,
                head,
                tail,
                structure: Mutex::new(()),
                pending_added: Mutex::new(Vec::new()),
            }
        });
        Pipeline { inner }
    }

    /// The channel this pipeline belongs to.
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade().map(Channel::from_core)
    }

    // ---- structural operations ----------------------------------------

    /// Appends a handler just before the tail.
    pub fn add_last(&self, name: &str, handler: Handler) -> Result<(), TransportError> {
        self.add_last_with(name, None, handler)
    }

    /// Appends a handler with an executor override: its callbacks run there
    /// instead of on the channel's reactor.
    pub fn add_last_with(
        &self,
        name: &str,
        executor: Option<Arc<dyn EventExecutor>>,
        handler: Handler,
    ) -> Result<(), TransportError> {
        let ctx = {
            let _guard = self.inner.structure.lock();
            self.check_duplicate(name)?;
            let anchor = self
                .inner
                .tail
                .prev
                .read()
                .clone()
                .and_then(|weak| weak.upgrade())
                .unwrap_or_else(|| Arc::clone(&self.inner.head));
            self.link_after(&anchor, name, executor, handler)
        };
        self.note_added(&ctx);
        Ok(())
    }

    /// Prepends a handler just after the head.
    pub fn add_first(&self, name: &str, handler: Handler) -> Result<(), TransportError> {
        self.add_first_with(name, None, handler)
    }

    /// Prepends with an executor override.
    pub fn add_first_with(
        &self,
        name: &str,
        executor: Option<Arc<dyn EventExecutor>>,
        handler: Handler,
    ) -> Result<(), TransportError> {
        let ctx = {
            let _guard = self.inner.structure.lock();
            self.check_duplicate(name)?;
            let head = Arc::clone(&self.inner.head);
            self.link_after(&head, name, executor, handler)
        };
        self.note_added(&ctx);
        Ok(())
    }

    /// Inserts a handler right before the named one.
    pub fn add_before(
        &self,
        anchor: &str,
        name: &str,
        handler: Handler,
    ) -> Result<(), TransportError> {
        let ctx = {
            let _guard = self.inner.structure.lock();
            self.check_duplicate(name)?;
            let anchor_ctx = self
                .find(anchor)
                .ok_or(TransportError::IllegalState("no such handler"))?;
            let target = anchor_ctx
                .prev
                .read()
                .clone()
                .and_then(|weak| weak.upgrade())
                .ok_or(TransportError::IllegalState("anchor is detached"))?;
            self.link_after(&target, name, None, handler)
        };
        self.note_added(&ctx);
        Ok(())
    }

    /// Inserts a handler right after the named one.
    pub fn add_after(
        &self,
        anchor: &str,
        name: &str,
        handler: Handler,
    ) -> Result<(), TransportError> {
        let ctx = {
            let _guard = self.inner.structure.lock();
            self.check_duplicate(name)?;
            let target = self
                .find(anchor)
                .ok_or(TransportError::IllegalState("no such handler"))?;
            self.link_after(&target, name, None, handler)
        };
        self.note_added(&ctx);
        Ok(())
    }

    /// Detaches the named handler. Its `handler_removed` fires on its
    /// executor; the surrounding chain re-links as if it was never there.
    pub fn remove(&self, name: &str) -> Result<(), TransportError> {
        let ctx = {
            let _guard = self.inner.structure.lock();
            let ctx = self
                .find(name)
                .ok_or(TransportError::IllegalState("no such handler"))?;
            self.unlink(&ctx);
            ctx
        };
        ctx.invoke_handler_removed();
        Ok(())
    }

    /// Swaps the named handler for a new one in place.
    pub fn replace(
        &self,
        old_name: &str,
        new_name: &str,
        handler: Handler,
    ) -> Result<(), TransportError> {
        let (old_ctx, new_ctx) = {
            let _guard = self.inner.structure.lock();
            if old_name != new_name {
                self.check_duplicate(new_name)?;
            }
            let old_ctx = self
                .find(old_name)
                .ok_or(TransportError::IllegalState("no such handler"))?;
            let prev = old_ctx
                .prev
                .read()
                .clone()
                .and_then(|weak| weak.upgrade())
                .ok_or(TransportError::IllegalState("anchor is detached"))?;
            let new_ctx = self.link_after(&prev, new_name, None, handler);
            self.unlink(&old_ctx);
            (old_ctx, new_ctx)
        };
        self.note_added(&new_ctx);
        old_ctx.invoke_handler_removed();
        Ok(())
    }

    /// The context for the named handler, if present.
    pub fn get(&self, name: &str) -> Option<HandlerContext> {
        let _guard = self.inner.structure.lock();
        self.find(name).map(|inner| HandlerContext { inner })
    }

    /// The first user context (head excluded).
    pub fn first(&self) -> Option<HandlerContext> {
        let _guard = self.inner.structure.lock();
        let next = self.inner.head.next.read().clone()?;
        if Arc::ptr_eq(&next, &self.inner.tail) {
            None
        } else {
            Some(HandlerContext { inner: next })
        }
    }

    /// The last user context (tail excluded).
    pub fn last(&self) -> Option<HandlerContext> {
        let _guard = self.inner.structure.lock();
        let prev = self.inner.tail.prev.read().clone()?.upgrade()?;
        if Arc::ptr_eq(&prev, &self.inner.head) {
            None
        } else {
            Some(HandlerContext { inner: prev })
        }
    }

    /// Handler names, head to tail, sentinels excluded.
    pub fn names(&self) -> Vec<String> {
        let _guard = self.inner.structure.lock();
        let mut names = Vec::new();
        let mut cursor = self.inner.head.next.read().clone();
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(&ctx, &self.inner.tail) {
                break;
            }
            names.push(ctx.name.clone());
            cursor = ctx.next.read().clone();
        }
        names
    }

    fn find(&self, name: &str) -> Option<Arc<ContextInner>> {
        let mut cursor = self.inner.head.next.read().clone();
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(&ctx, &self.inner.tail) {
                return None;
            }
            if ctx.name == name {
                return Some(ctx);
            }
            cursor = ctx.next.read().clone();
        }
        None
    }

    fn check_duplicate(&self, name: &str) -> Result<(), TransportError> {
        if name == "head" || name == "tail" {
            return Err(TransportError::IllegalState("reserved handler name"));
        }
        if self.find(name).is_some() {
            return Err(TransportError::IllegalState("duplicate handler name"));
        }
        Ok(())
    }

    /// Links a new context after `anchor`. Caller holds the structure lock.
    fn link_after(
        &self,
        anchor: &Arc<ContextInner>,
        name: &str,
        executor: Option<Arc<dyn EventExecutor>>,
        handler: Handler,
    ) -> Arc<ContextInner> {
        let caps = Capabilities::of(&handler);
        let next = anchor.next.read().clone().unwrap_or_else(|| Arc::clone(&self.inner.tail));
        let ctx = Arc::new(ContextInner {
            name: name.to_owned(),
            pipeline: Arc::downgrade(&self.inner),
            channel: self.inner.channel.clone(),
            executor,
            caps,
            slot: HandlerSlot::of(handler),
            next: RwLock::new(Some(Arc::clone(&next))),
            prev: RwLock::new(Some(Arc::downgrade(anchor))),
            removed: AtomicBool::new(false),
        });
        *anchor.next.write() = Some(Arc::clone(&ctx));
        *next.prev.write() = Some(Arc::downgrade(&ctx));
        ctx
    }

    /// Unlinks `ctx` from the chain. Its own links stay intact so an event
    /// mid-traversal keeps a path to both ends. Caller holds the structure
    /// lock.
    fn unlink(&self, ctx: &Arc<ContextInner>) {
        let prev = ctx.prev.read().clone().and_then(|weak| weak.upgrade());
        let next = ctx.next.read().clone();
        if let (Some(prev), Some(next)) = (prev, next) {
            *prev.next.write() = Some(Arc::clone(&next));
            *next.prev.write() = Some(Arc::downgrade(&prev));
        }
        ctx.removed.store(true, Ordering::Release);
    }

    /// `handler_added` runs now if the channel is registered, otherwise
    /// when registration happens.
    fn note_added(&self, ctx: &Arc<ContextInner>) {
        let registered = self
            .inner
            .channel
            .upgrade()
            .map(|core| core.is_registered())
            .unwrap_or(false);
        if registered {
            ctx.invoke_handler_added();
        } else {
            self.inner.pending_added.lock().push(Arc::clone(ctx));
        }
    }

    /// Runs the deferred `handler_added` callbacks, in addition order.
    /// Called by the registration path on the reactor.
    pub(crate) fn invoke_pending_handler_added(&self) {
        loop {
            // One at a time: an initializer running here may add more
            // handlers, which land on the pending list only if the channel
            // flag is still unregistered - it is not by now, so new adds run
            // inline in their natural order.
            let ctx = {
                let mut pending = self.inner.pending_added.lock();
                if pending.is_empty() {
                    return;
                }
                pending.remove(0)
            };
            ctx.invoke_handler_added();
        }
    }

    pub(crate) fn remove_context(&self, ctx: &Arc<ContextInner>) {
        {
            let _guard = self.inner.structure.lock();
            if ctx.is_removed() {
                return;
            }
            self.unlink(ctx);
        }
        ctx.invoke_handler_removed();
    }

    // ---- inbound entry points (fired by the channel internals) --------

    /// Fires `channel_registered` from the head.
    pub fn fire_channel_registered(&self) {
        self.inner.head.invoke_channel_registered();
    }

    /// Fires `channel_unregistered` from the head.
    pub fn fire_channel_unregistered(&self) {
        self.inner.head.invoke_channel_unregistered();
    }

    /// Fires `channel_active` from the head.
    pub fn fire_channel_active(&self) {
        self.inner.head.invoke_channel_active();
    }

    /// Fires `channel_inactive` from the head.
    pub fn fire_channel_inactive(&self) {
        self.inner.head.invoke_channel_inactive();
    }

    /// Fires one inbound message from the head.
    pub fn fire_channel_read(&self, msg: Message) {
        self.inner.head.invoke_channel_read(msg);
    }

    /// Fires `channel_read_complete` from the head.
    pub fn fire_channel_read_complete(&self) {
        self.inner.head.invoke_channel_read_complete();
    }

    /// Fires `channel_writability_changed` from the head.
    pub fn fire_channel_writability_changed(&self) {
        self.inner.head.invoke_channel_writability_changed();
    }

    /// Fires a user event from the head.
    pub fn fire_user_event(&self, event: Message) {
        self.inner.head.invoke_user_event(event);
    }

    /// Fires an error from the head.
    pub fn fire_exception_caught(&self, cause: Cause) {
        self.inner.head.invoke_exception_caught(cause);
    }

    // ---- outbound entry points (start at the tail) --------------------

    fn new_promise(&self) -> Promise<()> {
        Promise::new(self.inner.tail.executor())
    }

    /// Binds the channel through the full outbound chain.
    pub fn bind(&self, addr: SocketAddr) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        match self.inner.tail.prev_outbound() {
            Some(ctx) => ctx.invoke_bind(addr, promise),
            None => drop_off_head(&promise),
        }
        future
    }

    /// Connects the channel through the full outbound chain.
    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        match self.inner.tail.prev_outbound() {
            Some(ctx) => ctx.invoke_connect(remote, local, promise),
            None => drop_off_head(&promise),
        }
        future
    }

    /// Disconnects through the full outbound chain.
    pub fn disconnect(&self) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        match self.inner.tail.prev_outbound() {
            Some(ctx) => ctx.invoke_disconnect(promise),
            None => drop_off_head(&promise),
        }
        future
    }

    /// Closes through the full outbound chain.
    pub fn close(&self) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        match self.inner.tail.prev_outbound() {
            Some(ctx) => ctx.invoke_close(promise),
            None => drop_off_head(&promise),
        }
        future
    }

    /// Deregisters through the full outbound chain.
    pub fn deregister(&self) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        match self.inner.tail.prev_outbound() {
            Some(ctx) => ctx.invoke_deregister(promise),
            None => drop_off_head(&promise),
        }
        future
    }

    /// Requests a read batch through the full outbound chain.
    pub fn read(&self) {
        if let Some(ctx) = self.inner.tail.prev_outbound() {
            ctx.invoke_read();
        }
    }

    /// Writes through the full outbound chain.
    pub fn write(&self, msg: Message) -> Future<()> {
        let promise = self.new_promise();
        let future = promise.future();
        match self.inner.tail.prev_outbound() {
            Some(ctx) => ctx.invoke_write(msg, promise),
            None => {
                release_refcounted(msg.as_ref());
                drop_off_head(&promise);
            }
        }
        future
    }

    /// Flushes through the full outbound chain.
    pub fn flush(&self) {
        if let Some(ctx) = self.inner.tail.prev_outbound() {
            ctx.invoke_flush();
        }
    }

    /// Write followed by flush.
    pub fn write_and_flush(&self, msg: Message) -> Future<()> {
        let future = self.write(msg);
        self.flush();
        future
    }
}

/// The outbound floor and inbound entry of every pipeline. Outbound
/// operations that reach it are handed to the channel's internals; inbound
/// lifecycle events passing through it trigger the auto-read policy.
struct HeadHandler {
    channel: Weak<ChannelCore>,
}

impl HeadHandler {
    fn core(&self, promise: Option<&Promise<()>>) -> Option<Arc<ChannelCore>> {
        match self.channel.upgrade() {
            Some(core) => Some(core),
            None => {
                if let Some(promise) = promise {
                    promise.try_failure(TransportError::ClosedChannel.into_cause());
                }
                None
            }
        }
    }

    fn read_if_auto_read(&self, ctx: &HandlerContext) {
        let channel = ctx.channel();
        if channel.config().auto_read() {
            channel.read();
        }
    }
}

impl ChannelHandler for HeadHandler {}

impl InboundHandler for HeadHandler {
    fn channel_active(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_active();
        self.read_if_auto_read(ctx);
    }

    fn channel_read_complete(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_read_complete();
        self.read_if_auto_read(ctx);
    }
}

impl OutboundHandler for HeadHandler {
    fn bind(&mut self, _ctx: &HandlerContext, addr: SocketAddr, promise: Promise<()>) {
        if let Some(core) = self.core(Some(&promise)) {
            core.unsafe_bind(addr, promise);
        }
    }

    fn connect(
        &mut self,
        _ctx: &HandlerContext,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: Promise<()>,
    ) {
        if let Some(core) = self.core(Some(&promise)) {
            core.unsafe_connect(remote, local, promise);
        }
    }

    fn disconnect(&mut self, _ctx: &HandlerContext, promise: Promise<()>) {
        if let Some(core) = self.core(Some(&promise)) {
            core.unsafe_disconnect(promise);
        }
    }

    fn close(&mut self, _ctx: &HandlerContext, promise: Promise<()>) {
        if let Some(core) = self.core(Some(&promise)) {
            core.unsafe_close(Some(promise));
        }
    }

    fn deregister(&mut self, _ctx: &HandlerContext, promise: Promise<()>) {
        if let Some(core) = self.core(Some(&promise)) {
            core.unsafe_deregister(promise);
        }
    }

    fn read(&mut self, _ctx: &HandlerContext) {
        if let Some(core) = self.core(None) {
            core.unsafe_begin_read();
        }
    }

    fn write(&mut self, _ctx: &HandlerContext, msg: Message, promise: Promise<()>) {
        match self.core(Some(&promise)) {
            Some(core) => core.unsafe_write(msg, promise),
            None => {
                release_refcounted(msg.as_ref());
            }
        }
    }

    fn flush(&mut self, _ctx: &HandlerContext) {
        if let Some(core) = self.core(None) {
            core.unsafe_flush();
        }
    }
}

/// The inbound default at the end of every pipeline: unhandled events are
/// logged or discarded, and reference-counted messages that get this far
/// are released so an inattentive pipeline cannot leak.
struct TailHandler;

impl ChannelHandler for TailHandler {}

impl InboundHandler for TailHandler {
    fn channel_registered(&mut self, _ctx: &HandlerContext) {}

    fn channel_unregistered(&mut self, _ctx: &HandlerContext) {}

    fn channel_active(&mut self, _ctx: &HandlerContext) {}

    fn channel_inactive(&mut self, _ctx: &HandlerContext) {}

    fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) {
        debug!(
            "{}: discarding inbound message that reached the tail",
            ctx.channel().id()
        );
        release_refcounted(msg.as_ref());
    }

    fn channel_read_complete(&mut self, _ctx: &HandlerContext) {}

    fn channel_writability_changed(&mut self, _ctx: &HandlerContext) {}

    fn user_event(&mut self, _ctx: &HandlerContext, event: Message) {
        release_refcounted(event.as_ref());
    }

    fn exception_caught(&mut self, ctx: &HandlerContext, cause: Cause) {
        warn!(
            "{}: unhandled exception reached the tail: {}",
            ctx.channel().id(),
            cause
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::handler::ChannelHandler;
    use hawser_buffer::{BufferAllocator, UnpooledAllocator};

    // Unregistered channels dispatch inline on the calling thread, which
    // keeps these tests single-threaded and deterministic.

    struct Tap {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Tap {
        fn note(&self, what: &str) {
            self.log.lock().push(format!("{}:{}", self.tag, what));
        }
    }

    impl ChannelHandler for Tap {
        fn handler_added(&mut self, _ctx: &HandlerContext) {
            self.note("added");
        }

        fn handler_removed(&mut self, _ctx: &HandlerContext) {
            self.note("removed");
        }
    }

    impl InboundHandler for Tap {
        fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) {
            self.note("read");
            ctx.fire_channel_read(msg);
        }

        fn exception_caught(&mut self, ctx: &HandlerContext, cause: Cause) {
            self.note(&format!("exception:{}", cause));
            ctx.fire_exception_caught(cause);
        }
    }

    fn tap(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Handler {
        Handler::inbound(Tap {
            tag,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn inbound_events_run_head_to_tail() {
        let channel = Channel::tcp().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = channel.pipeline();
        pipeline.add_last("a", tap("a", &log)).unwrap();
        pipeline.add_last("b", tap("b", &log)).unwrap();
        pipeline.add_last("c", tap("c", &log)).unwrap();
        pipeline.fire_channel_read(Box::new("x".to_owned()));
        assert_eq!(*log.lock(), vec!["a:read", "b:read", "c:read"]);
    }

    #[test]
    fn add_then_remove_restores_the_chain() {
        let channel = Channel::tcp().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = channel.pipeline();
        pipeline.add_last("a", tap("a", &log)).unwrap();
        pipeline.add_last("c", tap("c", &log)).unwrap();
        let before = pipeline.names();

        pipeline.add_after("a", "b", tap("b", &log)).unwrap();
        assert_eq!(pipeline.names(), vec!["a", "b", "c"]);
        pipeline.remove("b").unwrap();
        assert_eq!(pipeline.names(), before);

        // Propagation sees the restored neighbor chain.
        log.lock().clear();
        pipeline.fire_channel_read(Box::new("x".to_owned()));
        assert_eq!(*log.lock(), vec!["a:read", "c:read"]);
    }

    #[test]
    fn positional_inserts_land_where_asked() {
        let channel = Channel::tcp().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = channel.pipeline();
        pipeline.add_last("b", tap("b", &log)).unwrap();
        pipeline.add_first("a", tap("a", &log)).unwrap();
        pipeline.add_before("b", "ab", tap("ab", &log)).unwrap();
        pipeline.add_after("b", "z", tap("z", &log)).unwrap();
        assert_eq!(pipeline.names(), vec!["a", "ab", "b", "z"]);
    }

    #[test]
    fn names_are_unique_and_sentinels_reserved() {
        let channel = Channel::tcp().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = channel.pipeline();
        pipeline.add_last("a", tap("a", &log)).unwrap();
        assert!(pipeline.add_last("a", tap("a", &log)).is_err());
        assert!(pipeline.add_last("head", tap("x", &log)).is_err());
        assert!(pipeline.remove("nope").is_err());
    }

    #[test]
    fn replace_swaps_in_place() {
        let channel = Channel::tcp().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = channel.pipeline();
        pipeline.add_last("a", tap("a", &log)).unwrap();
        pipeline.add_last("b", tap("b", &log)).unwrap();
        pipeline.add_last("c", tap("c", &log)).unwrap();
        pipeline.replace("b", "x", tap("x", &log)).unwrap();
        assert_eq!(pipeline.names(), vec!["a", "x", "c"]);
        log.lock().clear();
        pipeline.fire_channel_read(Box::new("m".to_owned()));
        assert_eq!(*log.lock(), vec!["a:read", "x:read", "c:read"]);
    }

    #[test]
    fn a_panicking_handler_becomes_exception_caught_downstream() {
        struct Boom;
        impl ChannelHandler for Boom {}
        impl InboundHandler for Boom {
            fn channel_read(&mut self, _ctx: &HandlerContext, _msg: Message) {
                panic!("boom");
            }
        }
        let channel = Channel::tcp().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = channel.pipeline();
        pipeline.add_last("boom", Handler::inbound(Boom)).unwrap();
        pipeline.add_last("after", tap("after", &log)).unwrap();
        pipeline.fire_channel_read(Box::new("x".to_owned()));
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("after:exception:"), "got {:?}", *log);
        assert!(log[0].contains("boom"));
    }

    #[test]
    fn outbound_only_handlers_are_skipped_inbound() {
        struct NoopOutbound;
        impl ChannelHandler for NoopOutbound {}
        impl OutboundHandler for NoopOutbound {}
        let channel = Channel::tcp().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = channel.pipeline();
        pipeline.add_last("a", tap("a", &log)).unwrap();
        pipeline
            .add_last("out", Handler::outbound(NoopOutbound))
            .unwrap();
        pipeline.add_last("b", tap("b", &log)).unwrap();
        pipeline.fire_channel_read(Box::new("x".to_owned()));
        assert_eq!(*log.lock(), vec!["a:read", "b:read"]);
    }

    #[test]
    fn flush_before_connect_fails_the_write_promise() {
        let channel = Channel::tcp().unwrap();
        let mut buf = UnpooledAllocator.heap_buffer(8).unwrap();
        buf.write_bytes(b"data").unwrap();
        let future = channel.pipeline().write_and_flush(Box::new(buf));
        assert!(future.is_done());
        let cause = future.cause().expect("must fail before connect");
        assert!(matches!(
            cause.downcast_ref::<TransportError>(),
            Some(TransportError::IllegalState(_))
        ));
    }

    #[test]
    fn echo_style_reentrancy_passes_through_instead_of_deadlocking() {
        // A duplex handler that writes through the channel-level entry from
        // inside its own read callback routes the write back through its
        // own context.
        struct Echo;
        impl ChannelHandler for Echo {}
        impl InboundHandler for Echo {
            fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) {
                let text = msg.downcast::<String>().unwrap();
                ctx.channel()
                    .pipeline()
                    .write(Box::new(format!("echo:{}", text)));
            }
        }
        impl OutboundHandler for Echo {}

        let channel = Channel::tcp().unwrap();
        channel
            .pipeline()
            .add_last("echo", Handler::duplex(Echo))
            .unwrap();
        // Completes (without deadlock) by queueing the echoed write on the
        // outbound buffer; nothing flushes it here.
        channel
            .pipeline()
            .fire_channel_read(Box::new("ping".to_owned()));
        assert_eq!(channel.pipeline().names(), vec!["echo"]);
    }

    #[test]
    fn unhandled_messages_are_released_by_the_tail() {
        let channel = Channel::tcp().unwrap();
        let buf = UnpooledAllocator.heap_buffer(8).unwrap();
        let probe = buf.retained().unwrap();
        channel.pipeline().fire_channel_read(Box::new(buf));
        assert_eq!(probe.refcnt(), 1);
        probe.release().unwrap();
    }
}
