//! # Hawser Codec - Protocol Codecs for Hawser Pipelines
//!
//! `hawser-codec` provides reusable codec handlers for the hawser transport
//! engine: a byte-to-message decode loop with a line-based framer, a UTF-8
//! string codec, and a message-to-byte encoder adapter.
//!
//! ## Building a Pipeline with Codecs
//!
//! ```no_run
//! use hawser::{Channel, ChannelInitializer, Handler};
//! use hawser_codec::{ByteToMessageDecoder, LineFramer, StringCodec};
//!
//! let channel = Channel::tcp().unwrap();
//! channel.pipeline().add_last(
//!     "init",
//!     Handler::inbound(ChannelInitializer::new(|ch: &Channel| {
//!         let pipeline = ch.pipeline();
//!         pipeline.add_last(
//!             "framer",
//!             Handler::inbound(ByteToMessageDecoder::new(Box::new(LineFramer::new(8192, true)))),
//!         )?;
//!         pipeline.add_last("strings", Handler::duplex(StringCodec::new()))?;
//!         // pipeline.add_last("app", ...)?;
//!         Ok(())
//!     })),
//! ).unwrap();
//! ```
//!
//! Decoded frames travel the pipeline as [`bytes::BytesMut`]; the string
//! codec converts them to and from `String`. Decode failures surface as the
//! *Decoder* error kind through `exception_caught`; encode failures fail
//! the write's promise with the *Encoder* kind.

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

pub(crate) mod byte_to_message;
pub(crate) mod message_to_byte;
pub(crate) mod string_codec;

pub use byte_to_message::{ByteToMessageDecoder, FrameDecoder, LineFramer};
pub use message_to_byte::{Encoder, MessageToByte};
pub use string_codec::StringCodec;
