//! End-to-end lifecycle coverage against real loopback sockets.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hawser::{
    Channel, ChannelHandler, ChannelInitializer, Handler, HandlerContext, InboundHandler, Message,
    TransportError,
};
use hawser_buffer::{BufferAllocator, UnpooledAllocator};
use hawser_executor::{Cause, EventExecutor, Reactor, TaskExecutor};

/// Records every event it sees, then forwards.
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn note(&self, what: &str) {
        self.log.lock().push(what.to_owned());
    }
}

impl ChannelHandler for Recorder {
    fn handler_added(&mut self, _ctx: &HandlerContext) {
        self.note("handler_added");
    }
}

impl InboundHandler for Recorder {
    fn channel_registered(&mut self, ctx: &HandlerContext) {
        self.note("channel_registered");
        ctx.fire_channel_registered();
    }

    fn channel_active(&mut self, ctx: &HandlerContext) {
        self.note("channel_active");
        ctx.fire_channel_active();
    }

    fn channel_inactive(&mut self, ctx: &HandlerContext) {
        self.note("channel_inactive");
        ctx.fire_channel_inactive();
    }

    fn channel_unregistered(&mut self, ctx: &HandlerContext) {
        self.note("channel_unregistered");
        ctx.fire_channel_unregistered();
    }

    fn channel_read(&mut self, ctx: &HandlerContext, msg: Message) {
        self.note("channel_read");
        ctx.fire_channel_read(msg);
    }

    fn channel_writability_changed(&mut self, ctx: &HandlerContext) {
        self.note(&format!("writability:{}", ctx.channel().is_writable()));
        ctx.fire_channel_writability_changed();
    }

    fn exception_caught(&mut self, ctx: &HandlerContext, cause: Cause) {
        self.note(&format!("exception:{}", cause));
        ctx.fire_exception_caught(cause);
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn reactor(name: &str) -> Arc<Reactor> {
    Reactor::new(name, 50, None).unwrap()
}

fn shutdown(reactor: &Arc<Reactor>) {
    reactor
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
        .sync()
        .unwrap();
}

fn data_buf(bytes: &[u8]) -> Message {
    let mut buf = UnpooledAllocator.heap_buffer(bytes.len()).unwrap();
    buf.write_bytes(bytes).unwrap();
    Box::new(buf)
}

#[test]
fn connect_success_event_order() {
    let reactor = reactor("lifecycle-connect");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let channel = Channel::tcp().unwrap();
    let user_log = Arc::clone(&log);
    channel
        .pipeline()
        .add_last(
            "init",
            Handler::inbound(ChannelInitializer::new(move |ch: &Channel| {
                ch.pipeline().add_last(
                    "user",
                    Handler::inbound(Recorder {
                        log: Arc::clone(&user_log),
                    }),
                )
            })),
        )
        .unwrap();
    // The initializer ran at registration and removed itself.
    channel.register(&reactor).sync().unwrap();
    assert_eq!(channel.pipeline().names(), vec!["user"]);

    channel.connect(addr).sync().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        log.lock().contains(&"channel_active".to_owned())
    }));
    assert_eq!(
        *log.lock(),
        vec!["handler_added", "channel_registered", "channel_active"]
    );
    assert!(channel.is_active());

    channel.close().sync().unwrap();
    shutdown(&reactor);
}

#[test]
fn connect_times_out_against_a_saturated_backlog() {
    let reactor = reactor("lifecycle-timeout");

    // A listener whose accept queue is full drops further handshakes, so a
    // fresh connect stays pending until our deadline fires.
    let listener = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .unwrap();
    listener
        .bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into())
        .unwrap();
    listener.listen(1).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();
    let mut clog = Vec::new();
    for _ in 0..8 {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        socket.set_nonblocking(true).unwrap();
        let _ = socket.connect(&addr.into());
        clog.push(socket);
    }
    std::thread::sleep(Duration::from_millis(50));

    let log = Arc::new(Mutex::new(Vec::new()));
    let channel = Channel::tcp().unwrap();
    channel
        .pipeline()
        .add_last(
            "user",
            Handler::inbound(Recorder {
                log: Arc::clone(&log),
            }),
        )
        .unwrap();
    channel.config().set_connect_timeout_millis(100);
    channel.register(&reactor).sync().unwrap();

    let started = Instant::now();
    let cause = channel.connect(addr).sync().unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(matches!(
        cause.downcast_ref::<TransportError>(),
        Some(TransportError::ConnectTimeout(_))
    ));

    assert!(wait_until(Duration::from_secs(2), || !channel.is_open()));
    assert!(wait_until(Duration::from_secs(2), || {
        log.lock().contains(&"channel_unregistered".to_owned())
    }));
    let log = log.lock();
    assert!(!log.contains(&"channel_active".to_owned()));
    assert!(log.contains(&"channel_inactive".to_owned()));
    drop(log);
    shutdown(&reactor);
}

#[test]
fn watermark_crossings_toggle_writability_once_each_way() {
    let reactor = reactor("lifecycle-watermark");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let channel = Channel::tcp().unwrap();
    channel
        .pipeline()
        .add_last(
            "user",
            Handler::inbound(Recorder {
                log: Arc::clone(&log),
            }),
        )
        .unwrap();
    channel.register(&reactor).sync().unwrap();
    channel.connect(addr).sync().unwrap();
    let (peer, _) = listener.accept().unwrap();

    // 70 KiB of unflushed writes against the 64 KiB high watermark: one
    // unwritable transition, no matter how many writes follow it.
    let first = channel.write(data_buf(&vec![7u8; 35 * 1024]));
    let second = channel.write(data_buf(&vec![7u8; 35 * 1024]));
    assert!(wait_until(Duration::from_secs(2), || {
        log.lock().iter().any(|entry| entry == "writability:false")
    }));
    assert!(!channel.is_writable());

    // Flushing drains to the peer; falling below 32 KiB restores
    // writability exactly once.
    channel.flush();
    let reader = std::thread::spawn(move || {
        use std::io::Read;
        let mut peer = peer;
        let mut sink = vec![0u8; 8192];
        let mut total = 0usize;
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        while total < 70 * 1024 {
            match peer.read(&mut sink) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
        peer
    });
    assert!(wait_until(Duration::from_secs(2), || {
        log.lock().iter().any(|entry| entry == "writability:true")
    }));
    assert!(channel.is_writable());
    assert!(first.await_timeout(Duration::from_secs(2)) && first.is_success());
    assert!(second.await_timeout(Duration::from_secs(2)) && second.is_success());
    let toggles: Vec<_> = log
        .lock()
        .iter()
        .filter(|entry| entry.starts_with("writability:"))
        .cloned()
        .collect();
    assert_eq!(toggles, vec!["writability:false", "writability:true"]);

    channel.close().sync().unwrap();
    drop(reader.join().unwrap());
    shutdown(&reactor);
}

#[test]
fn close_races_flush_and_wins() {
    let reactor = reactor("lifecycle-close-race");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let channel = Channel::tcp().unwrap();
    channel.register(&reactor).sync().unwrap();
    channel.connect(addr).sync().unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    // Enqueue without flushing, then close: the promise must fail with
    // ClosedChannel and no byte of the message may reach the peer.
    let write = channel.write(data_buf(b"never delivered"));
    let close = channel.close();
    close.sync().unwrap();

    assert!(write.await_timeout(Duration::from_secs(2)));
    let cause = write.cause().expect("write must fail");
    assert!(matches!(
        cause.downcast_ref::<TransportError>(),
        Some(TransportError::ClosedChannel)
    ));

    use std::io::Read;
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut received = Vec::new();
    let _ = peer.read_to_end(&mut received);
    assert!(received.is_empty(), "kernel saw {:?}", received);

    shutdown(&reactor);
}

#[test]
fn close_is_idempotent_for_every_caller() {
    let reactor = reactor("lifecycle-double-close");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let channel = Channel::tcp().unwrap();
    channel.register(&reactor).sync().unwrap();
    channel.connect(addr).sync().unwrap();

    let first = channel.close();
    let second = channel.close();
    first.sync().unwrap();
    second.sync().unwrap();
    assert!(first.is_success() && second.is_success());
    assert!(!channel.is_open());

    // A third close after the fact observes the same terminal state.
    channel.close().sync().unwrap();
    shutdown(&reactor);
}

#[test]
fn second_connect_fails_fast_while_one_is_pending() {
    let reactor = reactor("lifecycle-connect-pending");

    // Reuse the saturated-backlog listener so the first connect stays
    // pending long enough to race the second.
    let listener = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .unwrap();
    listener
        .bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into())
        .unwrap();
    listener.listen(1).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();
    let mut clog = Vec::new();
    for _ in 0..8 {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        socket.set_nonblocking(true).unwrap();
        let _ = socket.connect(&addr.into());
        clog.push(socket);
    }
    std::thread::sleep(Duration::from_millis(50));

    let channel = Channel::tcp().unwrap();
    channel.register(&reactor).sync().unwrap();
    let first = channel.connect(addr);
    let cause = channel.connect(addr).sync().unwrap_err();
    assert!(matches!(
        cause.downcast_ref::<TransportError>(),
        Some(TransportError::IllegalState(_))
    ));
    assert!(!first.is_done(), "the original connect is unaffected");

    channel.close().sync().unwrap();
    shutdown(&reactor);
}

#[test]
fn cancelling_a_pending_connect_closes_the_channel() {
    let reactor = reactor("lifecycle-connect-cancel");

    let listener = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .unwrap();
    listener
        .bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into())
        .unwrap();
    listener.listen(1).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();
    let mut clog = Vec::new();
    for _ in 0..8 {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        socket.set_nonblocking(true).unwrap();
        let _ = socket.connect(&addr.into());
        clog.push(socket);
    }
    std::thread::sleep(Duration::from_millis(50));

    let channel = Channel::tcp().unwrap();
    channel.register(&reactor).sync().unwrap();
    let connect = channel.connect(addr);
    assert!(connect.cancel());
    assert!(connect.is_cancelled());
    assert!(wait_until(Duration::from_secs(2), || !channel.is_open()));

    shutdown(&reactor);
}

#[test]
fn handler_with_executor_override_runs_there() {
    let worker = TaskExecutor::new("affine-worker").unwrap();
    let channel = Channel::tcp().unwrap();
    let hits: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));

    struct Affine {
        executor: Arc<TaskExecutor>,
        hits: Arc<Mutex<Vec<bool>>>,
    }
    impl ChannelHandler for Affine {}
    impl InboundHandler for Affine {
        fn channel_read(&mut self, _ctx: &HandlerContext, msg: Message) {
            self.hits.lock().push(self.executor.in_executor());
            hawser::release_refcounted(msg.as_ref());
        }
    }

    channel
        .pipeline()
        .add_last_with(
            "affine",
            Some(Arc::clone(&worker) as Arc<dyn EventExecutor>),
            Handler::inbound(Affine {
                executor: Arc::clone(&worker),
                hits: Arc::clone(&hits),
            }),
        )
        .unwrap();
    channel
        .pipeline()
        .fire_channel_read(Box::new("payload".to_owned()));

    assert!(wait_until(Duration::from_secs(2), || !hits.lock().is_empty()));
    assert_eq!(*hits.lock(), vec![true]);
    worker
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
        .sync()
        .unwrap();
}

#[test]
fn explicit_deregister_fires_unregistered_once() {
    let reactor = reactor("lifecycle-deregister");
    let log = Arc::new(Mutex::new(Vec::new()));
    let channel = Channel::tcp().unwrap();
    channel
        .pipeline()
        .add_last(
            "user",
            Handler::inbound(Recorder {
                log: Arc::clone(&log),
            }),
        )
        .unwrap();
    channel.register(&reactor).sync().unwrap();
    channel.deregister().sync().unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        log.lock().contains(&"channel_unregistered".to_owned())
    }));
    assert!(!channel.is_registered());
    assert!(channel.is_open());
    let count = log
        .lock()
        .iter()
        .filter(|entry| *entry == "channel_unregistered")
        .count();
    assert_eq!(count, 1);
    shutdown(&reactor);
}
