//! The helpful bootstrap API which enables an easy setup of a client
//! channel: create, initialize, register, resolve, connect.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hawser::{Channel, ChannelOption, TransportError};
//! use hawser_bootstrap::Bootstrap;
//! use hawser_executor::ReactorGroup;
//!
//! let group = Arc::new(ReactorGroup::new().unwrap());
//! let channel = Bootstrap::new()
//!     .group(Arc::clone(&group))
//!     .option(ChannelOption::ConnectTimeoutMillis(5_000))
//!     .handler(|ch: &Channel| {
//!         // assemble the pipeline
//!         Ok(())
//!     })
//!     .connect("chat.example.org:6000")
//!     .sync()
//!     .unwrap();
//! channel.write_and_flush(Box::new("hello\n".to_owned()));
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use hawser::{Channel, ChannelInitializer, ChannelOption, Handler, TransportError};
use hawser_executor::{EventExecutor, Future, ImmediateExecutor, Promise, ReactorGroup};
use log::{debug, warn};

type InitFn = dyn Fn(&Channel) -> Result<(), TransportError> + Send + Sync;

/// Builder that assembles and connects a client channel.
///
/// Each connect creates a fresh channel, applies the options, installs the
/// handler as a one-shot pipeline initializer, registers with the group's
/// next reactor, resolves the remote name on that reactor, and drives the
/// channel's connect. A failure at any stage fails the returned future and
/// closes whatever partial progress was made.
pub struct Bootstrap {
    group: Option<Arc<ReactorGroup>>,
    options: Vec<ChannelOption>,
    initializer: Option<Arc<InitFn>>,
    local: Option<SocketAddr>,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl Bootstrap {
    /// An empty bootstrap; `group` and `handler` are mandatory before
    /// `connect`.
    pub fn new() -> Bootstrap {
        Bootstrap {
            group: None,
            options: Vec::new(),
            initializer: None,
            local: None,
        }
    }

    /// The reactor group that will own connected channels.
    pub fn group(mut self, group: Arc<ReactorGroup>) -> Bootstrap {
        self.group = Some(group);
        self
    }

    /// Adds a channel option applied before registration.
    pub fn option(mut self, option: ChannelOption) -> Bootstrap {
        self.options.push(option);
        self
    }

    /// The pipeline initializer run once per connected channel.
    pub fn handler(
        mut self,
        init: impl Fn(&Channel) -> Result<(), TransportError> + Send + Sync + 'static,
    ) -> Bootstrap {
        self.initializer = Some(Arc::new(init));
        self
    }

    /// Binds connects to a fixed local address.
    pub fn local_addr(mut self, addr: SocketAddr) -> Bootstrap {
        self.local = Some(addr);
        self
    }

    /// Connects to a `host:port` string. Name resolution runs on the
    /// channel's reactor; a name with no usable address fails the future
    /// with *UnresolvedAddress*.
    pub fn connect(&self, addr: &str) -> Future<Channel> {
        self.start(Remote::Name(addr.to_owned()))
    }

    /// Connects to an already-resolved address.
    pub fn connect_to(&self, addr: SocketAddr) -> Future<Channel> {
        self.start(Remote::Resolved(addr))
    }

    fn start(&self, remote: Remote) -> Future<Channel> {
        let Some(group) = self.group.clone() else {
            return failed(TransportError::IllegalState("bootstrap has no group"));
        };
        let Some(initializer) = self.initializer.clone() else {
            return failed(TransportError::IllegalState("bootstrap has no handler"));
        };

        let channel = match Channel::tcp() {
            Ok(channel) => channel,
            Err(err) => return failed(TransportError::Io(err)),
        };
        for option in &self.options {
            channel.config().set_option(option.clone());
        }
        if let Err(err) = channel.pipeline().add_last(
            "initializer",
            Handler::inbound(ChannelInitializer::new(move |ch: &Channel| initializer(ch))),
        ) {
            return failed(err);
        }

        let reactor = Arc::clone(group.next());
        let promise: Promise<Channel> =
            Promise::new(Arc::clone(&reactor) as Arc<dyn EventExecutor>);
        let future = promise.future();
        let local = self.local;

        let register_future = channel.register(&reactor);
        let chained = channel.clone();
        register_future.add_listener(move |registered| {
            if let Some(cause) = registered.cause() {
                warn!("{}: registration failed: {}", chained.id(), cause);
                promise.try_failure(cause);
                chained.close();
                return;
            }
            if registered.is_cancelled() {
                promise.cancel();
                chained.close();
                return;
            }
            // On the reactor now: resolve, then connect.
            let addr = match remote.resolve() {
                Ok(addr) => addr,
                Err(err) => {
                    promise.try_failure(err.into_cause());
                    chained.close();
                    return;
                }
            };
            debug!("{}: connecting to {}", chained.id(), addr);
            let connected = chained.connect_from(addr, local);
            let chained = chained.clone();
            connected.add_listener(move |connect| {
                if let Some(cause) = connect.cause() {
                    promise.try_failure(cause);
                    chained.close();
                } else if connect.is_cancelled() {
                    promise.cancel();
                    chained.close();
                } else {
                    promise.try_success(chained.clone());
                }
            });
        });
        future
    }
}

enum Remote {
    Name(String),
    Resolved(SocketAddr),
}

impl Remote {
    /// Blocking std resolution, deliberately run on the reactor that owns
    /// the channel: the engine carries no async resolver.
    fn resolve(&self) -> Result<SocketAddr, TransportError> {
        match self {
            Remote::Resolved(addr) => Ok(*addr),
            Remote::Name(name) => match name.to_socket_addrs() {
                // Prefer an IPv4 address: the default transport socket is
                // an IPv4 endpoint.
                Ok(addrs) => {
                    let mut fallback = None;
                    for addr in addrs {
                        if addr.is_ipv4() {
                            return Ok(addr);
                        }
                        fallback.get_or_insert(addr);
                    }
                    fallback.ok_or_else(|| TransportError::UnresolvedAddress(name.clone()))
                }
                Err(err) => {
                    debug!("resolution of {} failed: {}", name, err);
                    Err(TransportError::UnresolvedAddress(name.clone()))
                }
            },
        }
    }
}

fn failed(err: TransportError) -> Future<Channel> {
    let promise: Promise<Channel> = Promise::new(ImmediateExecutor::new());
    promise.try_failure(err.into_cause());
    promise.future()
}
