use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use hawser_buffer::ByteBuf;
use socket2::{Domain, Protocol, Socket, Type};

/// Result of one non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were appended to the buffer.
    Read(usize),
    /// The socket had nothing for us right now.
    WouldBlock,
    /// The peer closed its write side.
    Eof,
}

/// Result of one non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// `n` bytes were accepted by the kernel.
    Written(usize),
    /// The kernel refused further bytes; wait for writable readiness.
    WouldBlock,
}

/// The transport-specific half of a channel: a non-blocking endpoint the
/// reactor can select on.
///
/// All methods run on the channel's reactor except construction.
pub trait Transport: Send + 'static {
    /// The selectable descriptor backing this transport. Stable for the
    /// transport's lifetime.
    fn raw_fd(&self) -> RawFd;

    /// Binds the local side.
    fn bind(&mut self, addr: SocketAddr) -> io::Result<()>;

    /// Starts a connect. `Ok(true)` means the OS finished synchronously;
    /// `Ok(false)` means the attempt is in flight and completion will
    /// surface as writable readiness.
    fn connect(&mut self, remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<bool>;

    /// Resolves an in-flight connect once the selector reports readiness.
    /// Must surface the socket error when the attempt failed.
    fn finish_connect(&mut self) -> io::Result<()>;

    /// Reads once into `buf`'s writable region.
    fn read(&mut self, buf: &mut ByteBuf) -> io::Result<ReadOutcome>;

    /// Writes `buf`'s readable region once.
    fn write(&mut self, buf: &ByteBuf) -> io::Result<WriteOutcome>;

    /// The bound local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// The connected peer address.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Closes the endpoint. Idempotent.
    fn close(&mut self) -> io::Result<()>;
}

/// A non-blocking TCP stream endpoint.
///
/// The socket is created unconnected so the channel can register with its
/// reactor before any connect is issued; the descriptor never changes.
pub struct TcpTransport {
    socket: Socket,
    shut: bool,
}

impl TcpTransport {
    /// An unconnected IPv4 TCP socket in non-blocking mode.
    pub fn new() -> io::Result<TcpTransport> {
        Self::with_domain(Domain::IPV4)
    }

    /// An unconnected IPv6 TCP socket in non-blocking mode.
    pub fn new_v6() -> io::Result<TcpTransport> {
        Self::with_domain(Domain::IPV6)
    }

    fn with_domain(domain: Domain) -> io::Result<TcpTransport> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        Ok(TcpTransport { socket, shut: false })
    }
}

impl Transport for TcpTransport {
    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.socket.bind(&addr.into())
    }

    fn connect(&mut self, remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<bool> {
        if let Some(local) = local {
            self.socket.bind(&local.into())?;
        }
        match self.socket.connect(&remote.into()) {
            Ok(()) => Ok(true),
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn finish_connect(&mut self) -> io::Result<()> {
        if let Some(err) = self.socket.take_error()? {
            return Err(err);
        }
        // A writable edge with no SO_ERROR can still be a spurious wake;
        // the peer address only exists on an established stream.
        self.socket.peer_addr()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut ByteBuf) -> io::Result<ReadOutcome> {
        let dst = buf
            .writable_mut()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        loop {
            match (&self.socket).read(dst) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => {
                    buf.advance_writer(n);
                    return Ok(ReadOutcome::Read(n));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn write(&mut self, buf: &ByteBuf) -> io::Result<WriteOutcome> {
        let src = buf
            .readable()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        loop {
            match (&self.socket).write(src) {
                Ok(n) => return Ok(WriteOutcome::Written(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::WouldBlock)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-inet local address"))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "non-inet peer address"))
    }

    fn close(&mut self) -> io::Result<()> {
        if self.shut {
            return Ok(());
        }
        self.shut = true;
        // The descriptor itself is reclaimed when the transport drops; the
        // shutdown is what the peer observes.
        match self.socket.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hawser_buffer::{BufferAllocator, UnpooledAllocator};
    use std::net::TcpListener;

    #[test]
    fn connect_to_loopback_is_pending_then_established() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut transport = TcpTransport::new().unwrap();
        let done = transport.connect(addr, None).unwrap();
        let (peer, _) = listener.accept().unwrap();
        if !done {
            // Poll until the non-blocking connect resolves.
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
            loop {
                match transport.finish_connect() {
                    Ok(()) => break,
                    Err(_) if std::time::Instant::now() < deadline => {
                        std::thread::sleep(std::time::Duration::from_millis(5))
                    }
                    Err(err) => panic!("connect never resolved: {}", err),
                }
            }
        }
        assert_eq!(transport.peer_addr().unwrap(), addr);
        drop(peer);
    }

    #[test]
    fn read_round_trip_through_a_byte_buf() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut transport = TcpTransport::new().unwrap();
        transport.connect(addr, None).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        std::io::Write::write_all(&mut peer, b"ahoy").unwrap();

        let mut buf = UnpooledAllocator.heap_buffer(64).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while buf.readable_bytes() < 4 {
            match transport.read(&mut buf).unwrap() {
                ReadOutcome::Read(_) | ReadOutcome::WouldBlock => {
                    assert!(std::time::Instant::now() < deadline, "read timed out");
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                ReadOutcome::Eof => panic!("peer closed early"),
            }
        }
        assert_eq!(buf.readable().unwrap(), b"ahoy");
        buf.release().unwrap();
    }
}
