//! Thin ownership wrapper over one TCP descriptor.
//!
//! A [`Socket`] is owned by exactly one handler. It is never shared between threads at the
//! same time; other connections that need to write to it (the chat rooms for instance) get a
//! duplicated, send-only [`PeerWriter`] instead.

use std::{
    fmt,
    io::{self, Read},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    ops::BitOr,
    os::fd::{AsRawFd, RawFd},
};

use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};
use tracing::trace;

use crate::error::{Error, Result};

/// Backlog passed to `listen(2)` by [`Socket::listen`].
pub const DEFAULT_BACKLOG: i32 = 128;

/// Descriptor value reported for a closed socket.
pub const INVALID_DESCRIPTOR: RawFd = -1;

/// Creation flags for [`Socket::init`] and [`Socket::accept`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SockFlags(u8);

impl SockFlags {
    pub const NONE: SockFlags = SockFlags(0);
    pub const NONBLOCK: SockFlags = SockFlags(0b01);
    pub const CLOEXEC: SockFlags = SockFlags(0b10);

    pub const fn contains(self, other: SockFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SockFlags {
    type Output = SockFlags;

    fn bitor(self, rhs: SockFlags) -> SockFlags {
        SockFlags(self.0 | rhs.0)
    }
}

/// Outcome of a single [`Socket::recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// `n` bytes were written to the front of the buffer.
    Data(usize),
    /// The peer performed an orderly shutdown.
    Closed,
    /// Nothing to read right now. Not an error.
    WouldBlock,
}

pub struct Socket {
    inner: Option<RawSocket>,
    addr: Option<SocketAddr>,
}

impl Socket {
    /// Creates an IPv4 stream socket. The flags are applied by `socket(2)` itself, so the
    /// descriptor is never visible without them.
    pub fn init(flags: SockFlags) -> Result<Self> {
        let mut ty = Type::STREAM;
        if flags.contains(SockFlags::NONBLOCK) {
            ty = ty.nonblocking();
        }
        if flags.contains(SockFlags::CLOEXEC) {
            ty = ty.cloexec();
        }
        let socket = RawSocket::new_raw(Domain::IPV4, ty, Some(Protocol::TCP))?;
        Ok(Self {
            inner: Some(socket),
            addr: None,
        })
    }

    /// Non-blocking, close-on-exec stream socket: the flags every listener and accepted
    /// connection uses.
    pub fn nonblocking() -> Result<Self> {
        Self::init(SockFlags::NONBLOCK | SockFlags::CLOEXEC)
    }

    fn raw(&self) -> Result<&RawSocket> {
        self.inner.as_ref().ok_or(Error::Closed)
    }

    pub fn set_reuse_addr(&self) -> Result<()> {
        Ok(self.raw()?.set_reuse_address(true)?)
    }

    pub fn bind(&mut self, ip: &str, port: u16) -> Result<()> {
        let addr = SocketAddr::V4(SocketAddrV4::new(parse_ipv4(ip)?, port));
        self.raw()?.bind(&SockAddr::from(addr))?;
        self.addr = Some(addr);
        Ok(())
    }

    pub fn bind_any(&mut self, port: u16) -> Result<()> {
        self.bind("0.0.0.0", port)
    }

    pub fn listen(&self) -> Result<()> {
        self.listen_with_backlog(DEFAULT_BACKLOG)
    }

    pub fn listen_with_backlog(&self, backlog: i32) -> Result<()> {
        Ok(self.raw()?.listen(backlog)?)
    }

    /// Accepts one pending connection.
    ///
    /// Returns `Ok(None)` when no connection is pending on a non-blocking listener, which is
    /// how callers tell an empty backlog apart from a real accept failure.
    pub fn accept(&self, flags: SockFlags) -> Result<Option<Socket>> {
        match self.raw()?.accept() {
            Ok((socket, peer)) => {
                apply_flags(&socket, flags)?;
                Ok(Some(Socket {
                    inner: Some(socket),
                    addr: peer.as_socket(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Accept(e)),
        }
    }

    /// Connects to `ip:port`. On a non-blocking socket a connect still in progress counts as
    /// success; readiness for writing signals its completion.
    pub fn connect(&mut self, ip: &str, port: u16) -> Result<()> {
        let addr = SocketAddr::V4(SocketAddrV4::new(parse_ipv4(ip)?, port));
        match self.raw()?.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        self.addr = Some(addr);
        Ok(())
    }

    /// Writes as much of `buf` as the kernel takes in one call.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let n = send_once(self.raw()?, buf)?;
        trace!(peer = %self.peer_label(), bytes = n, "send");
        Ok(n)
    }

    /// Writes all of `buf`, retrying short writes.
    ///
    /// Outbound data is expected to fit in the socket buffer; if the kernel would block before
    /// the whole message is written the call fails with [`Error::ShortWrite`].
    pub fn send_all(&self, buf: &[u8]) -> Result<()> {
        send_all(self.raw()?, self.peer_or_unspecified(), buf)?;
        trace!(peer = %self.peer_label(), bytes = buf.len(), "send");
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<Recv> {
        let mut socket = self.raw()?;
        loop {
            return match socket.read(buf) {
                Ok(0) => {
                    trace!(peer = %self.peer_label(), "recv: closed by peer");
                    Ok(Recv::Closed)
                }
                Ok(n) => {
                    trace!(peer = %self.peer_label(), bytes = n, "recv");
                    Ok(Recv::Data(n))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(peer = %self.peer_label(), "recv: would block");
                    Ok(Recv::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e.into()),
            };
        }
    }

    /// Closes the descriptor. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        self.inner.take().is_some()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Raw descriptor, or [`INVALID_DESCRIPTOR`] once closed.
    pub fn descriptor(&self) -> RawFd {
        self.inner
            .as_ref()
            .map_or(INVALID_DESCRIPTOR, |s| s.as_raw_fd())
    }

    /// Peer address for accepted or connected sockets, bound address for listeners.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn peer_ip(&self) -> String {
        self.addr.map(|a| a.ip().to_string()).unwrap_or_default()
    }

    pub fn peer_port(&self) -> u16 {
        self.addr.map_or(0, |a| a.port())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.raw()?
            .local_addr()?
            .as_socket()
            .ok_or_else(|| Error::Address("local address is not an inet address".into()))
    }

    /// Duplicates the descriptor into a send-only writer for use by other connections.
    pub fn try_clone_writer(&self) -> Result<PeerWriter> {
        Ok(PeerWriter {
            socket: self.raw()?.try_clone()?,
            peer: self.peer_or_unspecified(),
        })
    }

    fn peer_or_unspecified(&self) -> SocketAddr {
        self.addr
            .unwrap_or(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
    }

    fn peer_label(&self) -> String {
        format!("{}:{}", self.peer_ip(), self.peer_port())
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.descriptor())
            .field("addr", &self.addr)
            .finish()
    }
}

/// Send half of another connection's socket, backed by a duplicated descriptor.
pub struct PeerWriter {
    socket: RawSocket,
    peer: SocketAddr,
}

impl PeerWriter {
    pub fn send_all(&self, buf: &[u8]) -> Result<()> {
        send_all(&self.socket, self.peer, buf)?;
        trace!(peer = %self.peer, bytes = buf.len(), "send");
        Ok(())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl fmt::Debug for PeerWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerWriter")
            .field("fd", &self.socket.as_raw_fd())
            .field("peer", &self.peer)
            .finish()
    }
}

fn apply_flags(socket: &RawSocket, flags: SockFlags) -> io::Result<()> {
    socket.set_nonblocking(flags.contains(SockFlags::NONBLOCK))?;
    socket.set_cloexec(flags.contains(SockFlags::CLOEXEC))
}

fn parse_ipv4(ip: &str) -> Result<Ipv4Addr> {
    ip.parse().map_err(|_| Error::Address(ip.to_string()))
}

fn send_once(socket: &RawSocket, buf: &[u8]) -> io::Result<usize> {
    loop {
        match socket.send_with_flags(buf, libc::MSG_NOSIGNAL) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn send_all(socket: &RawSocket, peer: SocketAddr, buf: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match send_once(socket, &buf[written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(Error::ShortWrite {
                    peer,
                    written,
                    total: buf.len(),
                })
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
