//! # Hawser - An Event-Driven Network Transport Engine
//!
//! `hawser` is an asynchronous, event-driven transport framework for Rust:
//! applications compose **channels** (bidirectional byte conduits over a
//! non-blocking socket) out of **handler pipelines**, while a small pool of
//! **reactor threads** multiplexes readiness across thousands of channels.
//!
//! It is built the way [Netty](https://netty.io) and its descendants build
//! transports: callback state machines driven by a selector, not
//! async/await.
//!
//! ## Core Concepts
//!
//! ### Channel
//!
//! A [`Channel`] is the per-connection object: identity, configuration,
//! lifecycle state (`open` / `registered` / `active`), an outbound write
//! buffer with watermarks, and a pipeline. Every operation on it -
//! `register`, `connect`, `write`, `flush`, `close` - is asynchronous and
//! returns a [`Future`](hawser_executor::Future); calls from outside the
//! channel's reactor are trampolined onto it, so channel state is only
//! ever touched by one thread.
//!
//! ### Pipeline
//!
//! A [`Pipeline`] is an ordered, mutable chain of handlers bracketed by two
//! permanent sentinels. Inbound events enter at the head and travel toward
//! the tail; outbound operations enter at the tail and travel toward the
//! head, which terminates them on the socket:
//!
//! ```text
//!                                                  | write()
//!   +----------------------------------------------+-----------+
//!   |                     Pipeline                 |           |
//!   |                                             \|/          |
//!   |   +------------------+-----------+----------+--------+   |
//!   |   |                     TAIL (inbound default)       |   |
//!   |   +------------------+-----------+----------+--------+   |
//!   |             /|\                             |            |
//!   |   +----------+----------+------------+------+--------+   |
//!   |   |                  Handler  N                      |   |
//!   |   +----------+----------+------------+------+--------+   |
//!   |             /|\                             |            |
//!   |              |                              |            |
//!   |   fire_channel_read()                 ctx.write()        |
//!   |              |                              |            |
//!   |   +----------+----------+------------+-----\|/-------+   |
//!   |   |                  Handler  1                      |   |
//!   |   +----------+----------+------------+------+--------+   |
//!   |             /|\                             |            |
//!   |   +----------+----------+------------+-----\|/-------+   |
//!   |   |               HEAD (outbound floor)              |   |
//!   |   +----------+----------+------------+------+--------+   |
//!   |             /|\                             |            |
//!   +--------------+------------------------------+------------+
//!                  | readiness                    \|/ syscalls
//!   +--------------+------------------------------+------------+
//!   |                     Reactor (one thread, many channels)  |
//!   +----------------------------------------------------------+
//! ```
//!
//! Handlers implement [`InboundHandler`], [`OutboundHandler`], or both; the
//! [`Handler`] wrapper carries the capability bits propagation uses to skip
//! non-participants. Each context runs its callbacks on the channel's
//! reactor unless it was added with an executor override, in which case
//! events hop onto that executor.
//!
//! ### Buffers and release discipline
//!
//! Inbound bytes arrive as reference-counted
//! [`ByteBuf`](hawser_buffer::ByteBuf)s. A handler that consumes a message
//! owns its release; messages nobody consumed are released by the tail, and
//! the [`TypedInbound`] adapter auto-releases matched messages. Memory is
//! bounded without a garbage collector because every buffer has exactly one
//! releasing owner at any moment.
//!
//! ### Reactors
//!
//! A reactor ([`hawser_executor::Reactor`]) owns a selector and a task
//! queue; channels register their sockets with exactly one reactor for
//! life. Readiness events route to the channel's internal operations:
//! readable to the read loop, writable to the flush backlog or an
//! in-flight connect. Handlers must never block a reactor - a blocked
//! handler stalls every channel on that loop.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hawser::{Channel, ChannelInitializer, Handler};
//! use hawser_executor::ReactorGroup;
//!
//! let group = Arc::new(ReactorGroup::with_threads(1).unwrap());
//! let channel = Channel::tcp().unwrap();
//! channel.pipeline().add_last(
//!     "init",
//!     Handler::inbound(ChannelInitializer::new(|ch: &Channel| {
//!         // assemble codecs and application handlers here
//!         Ok(())
//!     })),
//! ).unwrap();
//!
//! channel.register_to(&group).sync().unwrap();
//! channel.connect("127.0.0.1:7000".parse().unwrap()).sync().unwrap();
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]
#![allow(dead_code)]

pub(crate) mod channel;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod handler;
pub(crate) mod initializer;
pub(crate) mod message;
pub(crate) mod outbound;
pub(crate) mod pipeline;
pub(crate) mod recv;
pub(crate) mod transport;
pub(crate) mod typed;

pub use channel::{Channel, ChannelId};
pub use config::{
    ChannelConfig, ChannelOption, DEFAULT_CONNECT_TIMEOUT_MILLIS,
    DEFAULT_WRITE_BUFFER_HIGH_WATER_MARK, DEFAULT_WRITE_BUFFER_LOW_WATER_MARK,
};
pub use error::TransportError;
pub use handler::{Capabilities, ChannelHandler, DuplexHandler, Handler, InboundHandler, OutboundHandler};
pub use initializer::ChannelInitializer;
pub use message::{release_refcounted, Message};
pub use pipeline::{HandlerContext, Pipeline};
pub use recv::{AdaptiveRecvBuf, FixedRecvBuf, RecvBufAllocator, RecvBufHandle};
pub use transport::{ReadOutcome, TcpTransport, Transport, WriteOutcome};
pub use typed::{TypedHandler, TypedInbound};
