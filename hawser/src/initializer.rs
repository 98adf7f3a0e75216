use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::TransportError;
use crate::handler::{ChannelHandler, InboundHandler};
use crate::pipeline::HandlerContext;

/// A one-shot handler that populates a channel's pipeline and removes
/// itself.
///
/// The init closure runs exactly once per channel - when the channel
/// registers, or immediately if the initializer is added to an
/// already-registered channel. Nested initializers added from inside the
/// closure initialize in addition order. An init failure funnels into
/// `exception_caught` and closes the channel.
///
/// ```no_run
/// use hawser::{Channel, ChannelInitializer, Handler};
///
/// let channel = Channel::tcp().unwrap();
/// channel.pipeline().add_last(
///     "init",
///     Handler::inbound(ChannelInitializer::new(|ch: &Channel| {
///         // ch.pipeline().add_last("decoder", ...)?;
///         // ch.pipeline().add_last("app", ...)?;
///         Ok(())
///     })),
/// ).unwrap();
/// ```
pub struct ChannelInitializer {
    init: Mutex<Option<InitFn>>,
    done: AtomicBool,
}

type InitFn = Box<dyn FnOnce(&Channel) -> Result<(), TransportError> + Send>;

impl ChannelInitializer {
    /// Wraps the init closure.
    pub fn new(
        init: impl FnOnce(&Channel) -> Result<(), TransportError> + Send + 'static,
    ) -> ChannelInitializer {
        ChannelInitializer {
            init: Mutex::new(Some(Box::new(init))),
            done: AtomicBool::new(false),
        }
    }

    /// Runs the init closure if it has not run yet. Returns `true` when
    /// this call performed the initialization.
    fn init_channel(&self, ctx: &HandlerContext) -> bool {
        // Guard against re-entrance: handler_added and channel_registered
        // can race to be first.
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        let channel = ctx.channel();
        let init = self.init.lock().take();
        let result = match init {
            Some(init) => init(&channel),
            None => Ok(()),
        };
        // Self-removal before error handling: a second initialization must
        // be impossible even if close re-enters the pipeline.
        ctx.pipeline().remove_context(&ctx.inner);
        if let Err(err) = result {
            warn!("{}: pipeline init failed: {}", channel.id(), err);
            ctx.fire_exception_caught(err.into_cause());
            channel.close();
        }
        true
    }
}

impl ChannelHandler for ChannelInitializer {
    fn handler_added(&mut self, ctx: &HandlerContext) {
        if ctx.channel().is_registered() {
            self.init_channel(ctx);
        }
    }
}

impl InboundHandler for ChannelInitializer {
    fn channel_registered(&mut self, ctx: &HandlerContext) {
        // Normally handler_added has already initialized and removed us;
        // this path covers an initializer added with registration racing
        // in.
        if self.init_channel(ctx) {
            // Handlers added during init missed this event; replay it from
            // the head so they observe it.
            ctx.pipeline().fire_channel_registered();
        } else {
            ctx.fire_channel_registered();
        }
    }

    fn exception_caught(&mut self, ctx: &HandlerContext, cause: hawser_executor::Cause) {
        warn!(
            "{}: initializer saw an exception, closing: {}",
            ctx.channel().id(),
            cause
        );
        ctx.channel().close();
    }
}
