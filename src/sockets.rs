//! OS-level socket ownership: listeners, data connections, and the wake-up
//! channel that lets other threads interrupt a blocked poll.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::poller::{Poller, Readiness, Ready};
use crate::protocol::LISTENSOCK_FILENO;


const LISTEN_BACKLOG: i32 = 100;
const READ_CHUNK: usize = 8192;

/// A stable reference to one data socket owned by a [`SocketGroup`].
///
/// The descriptor alone is not stable because the OS recycles descriptor
/// numbers; the generation counter makes a stale [`SocketId`] harmless. A
/// submission against a recycled descriptor simply misses the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SocketId {
    pub(crate) fd: RawFd,
    pub(crate) gen: u64,
}

/// A cloneable handle that interrupts the group's blocked poll.
///
/// Repeated wakes collapse into a single event until the group observes it.
#[derive(Debug, Clone)]
pub(crate) struct WakeHandle {
    waker: Arc<mio::Waker>,
    waking: Arc<AtomicBool>,
}

impl WakeHandle {
    pub(crate) fn wake(&self) {
        if !self.waking.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                tracing::error!(error = %e, "unable to write to the wake-up channel");
            }
        }
    }
}


pub(crate) struct Connection {
    sock: Socket,
    pub(crate) id: SocketId,
    /// Record reassembly buffer, filled by `read_some`.
    pub(crate) inbox: BytesMut,
    outbox: VecDeque<Bytes>,
    /// Close the socket once the outbox drains.
    close_after: bool,
    /// Peer shut down its writing half; drain reads, then tear down.
    closing: bool,
    wants_writable: bool,
}

impl Connection {
    fn new(sock: Socket, id: SocketId) -> Self {
        Self {
            sock, id,
            inbox: BytesMut::with_capacity(READ_CHUNK),
            outbox: VecDeque::new(),
            close_after: false,
            closing: false,
            wants_writable: false,
        }
    }
}


/// An event produced by [`SocketGroup::poll`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum SocketEvent {
    /// A data socket has input (or an error condition to observe via read).
    Readable(SocketId),
    /// A data socket with a non-empty outbox became writable again.
    Writable(SocketId),
    /// Another thread requested a wake-up.
    Woken,
}

/// Outcome of a single non-blocking read.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReadStatus {
    Data(usize),
    WouldBlock,
    Eof,
}

/// Outcome of flushing a connection's outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushStatus {
    Drained,
    Pending,
    Closed,
}


/// Owner of all listeners and data sockets, and of the poller they are
/// registered with.
///
/// Only the transceiver thread may call into a [`SocketGroup`]; the sole
/// cross-thread entry point is the [`WakeHandle`].
pub(crate) struct SocketGroup {
    poller: Poller,
    wake: WakeHandle,
    listeners: HashMap<RawFd, Socket>,
    conns: HashMap<RawFd, Connection>,
    bound_paths: Vec<PathBuf>,
    allowed_peers: Option<Vec<IpAddr>>,
    reuse: bool,
    accepting: bool,
    refresh_listeners: bool,
    next_gen: u64,
}

impl SocketGroup {
    pub(crate) fn new() -> io::Result<Self> {
        let poller = Poller::new()?;
        let wake = WakeHandle {
            waker: Arc::new(poller.waker()?),
            waking: Arc::new(AtomicBool::new(false)),
        };
        Ok(Self {
            poller, wake,
            listeners: HashMap::new(),
            conns: HashMap::new(),
            bound_paths: Vec::new(),
            allowed_peers: allowed_peers_from_env(),
            reuse: false,
            accepting: true,
            refresh_listeners: false,
            next_gen: 0,
        })
    }

    pub(crate) fn wake_handle(&self) -> WakeHandle {
        self.wake.clone()
    }

    /// Enables `SO_REUSEADDR` on listeners created afterwards.
    pub(crate) fn set_reuse(&mut self, reuse: bool) {
        self.reuse = reuse;
    }

    /// Adopts the listening socket a FastCGI-aware parent passed on
    /// descriptor 0.
    ///
    /// The parent is responsible for the `bind`/`listen` calls; the
    /// descriptor is only verified to be in listening state and switched to
    /// non-blocking mode.
    #[allow(unsafe_code)] // adopting a raw inherited descriptor
    pub(crate) fn listen_inherited(&mut self) -> io::Result<()> {
        use std::os::fd::{FromRawFd, IntoRawFd};

        if self.listeners.contains_key(&LISTENSOCK_FILENO) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor 0 is already being listened on",
            ));
        }

        // SAFETY: the FastCGI launch convention hands us ownership of fd 0.
        let sock = unsafe { Socket::from_raw_fd(LISTENSOCK_FILENO) };
        match nix::sys::socket::getsockopt(&sock, nix::sys::socket::sockopt::AcceptConn) {
            Ok(true) => (),
            Ok(false) | Err(_) => {
                // Hand the descriptor back untouched.
                let _ = sock.into_raw_fd();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "descriptor 0 is not a listening socket",
                ));
            },
        }
        sock.set_nonblocking(true)?;

        self.listeners.insert(LISTENSOCK_FILENO, sock);
        self.refresh_listeners = true;
        Ok(())
    }

    /// Binds and listens on a local stream socket at `path`.
    ///
    /// A stale socket file at `path` is removed first. `owner` and `group`
    /// are resolved by name; `permissions` is a raw mode such as `0o660`.
    /// The path is unlinked again when the group is dropped.
    pub(crate) fn listen_unix(
        &mut self,
        path: &Path,
        permissions: Option<u32>,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(e),
        }

        let sock = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        if self.reuse {
            sock.set_reuse_address(true)?;
        }
        sock.bind(&SockAddr::unix(path)?)?;

        if owner.is_some() || group.is_some() {
            let uid = owner.map(resolve_uid).transpose()?;
            let gid = group.map(resolve_gid).transpose()?;
            nix::unistd::chown(path, uid, gid).map_err(io::Error::from)?;
        }
        if let Some(mode) = permissions {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }

        sock.listen(LISTEN_BACKLOG)?;
        sock.set_nonblocking(true)?;

        tracing::debug!(path = %path.display(), "listening on local socket");
        self.bound_paths.push(path.to_owned());
        self.listeners.insert(sock.as_raw_fd(), sock);
        self.refresh_listeners = true;
        Ok(())
    }

    /// Binds and listens on a TCP endpoint.
    ///
    /// `interface` defaults to the wildcard address; `service` is a numeric
    /// port. Resolved addresses are tried in order until one of them binds.
    pub(crate) fn listen_tcp(&mut self, interface: Option<&str>, service: &str) -> io::Result<()> {
        use std::net::ToSocketAddrs;

        let host = interface.unwrap_or("0.0.0.0");
        let port: u16 = service.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "service must be a numeric port")
        })?;

        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match self.bind_tcp(addr) {
                Ok(sock) => {
                    tracing::debug!(%addr, "listening on TCP socket");
                    self.listeners.insert(sock.as_raw_fd(), sock);
                    self.refresh_listeners = true;
                    return Ok(());
                },
                Err(e) => {
                    tracing::warn!(%addr, error = %e, "unable to bind address, trying next");
                    last_err = Some(e);
                },
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolution came up empty")
        }))
    }

    fn bind_tcp(&self, addr: SocketAddr) -> io::Result<Socket> {
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if self.reuse {
            sock.set_reuse_address(true)?;
        }
        sock.bind(&addr.into())?;
        sock.listen(LISTEN_BACKLOG)?;
        sock.set_nonblocking(true)?;
        Ok(sock)
    }

    /// Returns the local addresses of all TCP listeners.
    pub(crate) fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|l| l.local_addr().ok()?.as_socket())
            .collect()
    }

    /// Pauses or resumes acceptance of new connections.
    ///
    /// While paused, listeners are removed from the poll set, so pending
    /// connections pile up in the kernel backlog instead of being accepted.
    pub(crate) fn accept(&mut self, status: bool) {
        if status != self.accepting {
            self.accepting = status;
            self.refresh_listeners = true;
            self.wake.wake();
        }
    }

    /// Waits for socket activity and reports one event.
    ///
    /// Listener readiness is handled internally (connections are accepted
    /// and registered); only data-socket events and wake-ups surface.
    /// Returns [`None`] when `block` is false and nothing is ready.
    pub(crate) fn poll(&mut self, block: bool) -> io::Result<Option<SocketEvent>> {
        loop {
            if self.refresh_listeners {
                for fd in self.listeners.keys() {
                    let _ = self.poller.del(*fd);
                    if self.accepting {
                        self.poller.add(*fd)?;
                    }
                }
                self.refresh_listeners = false;
            }

            let timeout = if block { None } else { Some(Duration::ZERO) };
            let Some(ready) = self.poller.poll(timeout)? else {
                return Ok(None);
            };

            if ready.is_wake() {
                self.wake.waking.store(false, Ordering::Release);
                return Ok(Some(SocketEvent::Woken));
            }
            if self.listeners.contains_key(&ready.fd) {
                if ready.events.intersects(Readiness::ERR | Readiness::HUP) {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "listen socket entered an error state",
                    ));
                }
                self.accept_pending(ready.fd);
                continue;
            }

            match self.conns.get_mut(&ready.fd) {
                None => {
                    // A close raced the event batch; nothing left to do.
                    tracing::trace!(fd = ready.fd, "event for a departed socket");
                    continue;
                },
                Some(conn) => return Ok(Some(Self::classify(conn, ready))),
            }
        }
    }

    fn classify(conn: &mut Connection, ready: Ready) -> SocketEvent {
        if ready.events.intersects(Readiness::RDHUP | Readiness::HUP | Readiness::ERR) {
            if !conn.closing && !ready.events.contains(Readiness::RDHUP) {
                tracing::warn!(fd = conn.id.fd, events = ?ready.events, "socket hung up");
            }
            conn.closing = true;
        }
        if ready.events.contains(Readiness::OUT) && !ready.events.contains(Readiness::IN) {
            SocketEvent::Writable(conn.id)
        } else {
            // Error states also surface as Readable: the next read observes
            // them and tears the socket down.
            SocketEvent::Readable(conn.id)
        }
    }

    fn accept_pending(&mut self, listener: RawFd) {
        let Some(sock) = self.listeners.get(&listener) else { return };
        loop {
            let (conn, addr) = match sock.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(fd = listener, error = %e, "accept failed");
                    break;
                },
            };
            if !self.accepting {
                // Pause raced the readiness event; let the peer see a close.
                continue;
            }
            if let (Some(allowed), Some(peer)) = (&self.allowed_peers, addr.as_socket()) {
                if !allowed.contains(&peer.ip()) {
                    tracing::warn!(peer = %peer.ip(), "rejecting web server outside FCGI_WEB_SERVER_ADDRS");
                    continue;
                }
            }

            let fd = conn.as_raw_fd();
            if let Err(e) = conn.set_nonblocking(true).and_then(|()| self.poller.add(fd)) {
                tracing::error!(fd, error = %e, "unable to register accepted socket");
                continue;
            }
            let id = SocketId { fd, gen: self.next_gen };
            self.next_gen += 1;
            tracing::debug!(fd, "accepted connection");
            self.conns.insert(fd, Connection::new(conn, id));
        }
    }

    fn conn_mut(&mut self, id: SocketId) -> Option<&mut Connection> {
        self.conns.get_mut(&id.fd).filter(|c| c.id == id)
    }

    pub(crate) fn contains(&self, id: SocketId) -> bool {
        self.conns.get(&id.fd).is_some_and(|c| c.id == id)
    }

    /// Reads once into the connection's reassembly buffer.
    ///
    /// # Errors
    /// A hard I/O error is returned to the caller, which must invalidate
    /// the socket via [`SocketGroup::close`].
    pub(crate) fn read_some(&mut self, id: SocketId) -> io::Result<ReadStatus> {
        let Some(conn) = self.conn_mut(id) else {
            return Ok(ReadStatus::Eof);
        };
        let mut chunk = [0; READ_CHUNK];
        loop {
            match (&conn.sock).read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => {
                    conn.inbox.extend_from_slice(&chunk[..n]);
                    return Ok(ReadStatus::Data(n));
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the reassembly buffer for `id`, if the socket is still alive.
    pub(crate) fn inbox_mut(&mut self, id: SocketId) -> Option<&mut BytesMut> {
        self.conn_mut(id).map(|c| &mut c.inbox)
    }

    /// Appends serialized records to the connection's outbox.
    ///
    /// Returns false if the socket is gone; the caller drops the payload.
    pub(crate) fn queue_write(&mut self, id: SocketId, data: Bytes) -> bool {
        match self.conn_mut(id) {
            Some(conn) if !conn.closing => {
                conn.outbox.push_back(data);
                true
            },
            _ => false,
        }
    }

    /// Arranges for the socket to close once its outbox drains.
    pub(crate) fn close_after_flush(&mut self, id: SocketId) {
        if let Some(conn) = self.conn_mut(id) {
            conn.close_after = true;
        }
    }

    /// Writes as much of the outbox as the socket accepts right now.
    ///
    /// Short writes keep the tail queued and arm write-readiness; a hard
    /// error (or a completed close-after) tears the socket down.
    pub(crate) fn flush(&mut self, id: SocketId) -> FlushStatus {
        let Some(conn) = self.conns.get_mut(&id.fd).filter(|c| c.id == id) else {
            return FlushStatus::Closed;
        };
        let fd = conn.id.fd;
        let mut fatal = false;

        while let Some(front) = conn.outbox.front_mut() {
            match conn.sock.send_with_flags(front, libc::MSG_NOSIGNAL) {
                Ok(n) if n == front.len() => {
                    conn.outbox.pop_front();
                },
                Ok(n) => front.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !conn.wants_writable {
                        conn.wants_writable = true;
                        if let Err(e) = self.poller.set_writable(fd, true) {
                            tracing::error!(fd, error = %e, "unable to arm write readiness");
                            fatal = true;
                            break;
                        }
                    }
                    return FlushStatus::Pending;
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => {
                    tracing::warn!(fd, error = %e, "socket write failed");
                    fatal = true;
                    break;
                },
            }
        }

        if fatal {
            self.close(id);
            return FlushStatus::Closed;
        }
        let conn = self.conns.get_mut(&id.fd).expect("connection was checked above");
        if conn.wants_writable {
            conn.wants_writable = false;
            let _ = self.poller.set_writable(fd, false);
        }
        if conn.close_after {
            self.close(id);
            FlushStatus::Closed
        } else {
            FlushStatus::Drained
        }
    }

    /// Shuts down and discards the socket. Harmless for stale ids.
    pub(crate) fn close(&mut self, id: SocketId) {
        let matches = self.conns.get(&id.fd).is_some_and(|c| c.id == id);
        if matches {
            let conn = self.conns.remove(&id.fd).expect("entry was checked above");
            tracing::debug!(fd = id.fd, "closing connection");
            let _ = conn.sock.shutdown(std::net::Shutdown::Both);
            let _ = self.poller.del(id.fd);
        }
    }

    /// Identities of every live data socket.
    pub(crate) fn socket_ids(&self) -> Vec<SocketId> {
        self.conns.values().map(|c| c.id).collect()
    }

    /// Tests whether every outbox has been written out.
    pub(crate) fn all_flushed(&self) -> bool {
        self.conns.values().all(|c| c.outbox.is_empty())
    }
}

impl Drop for SocketGroup {
    fn drop(&mut self) {
        for listener in self.listeners.values() {
            let _ = listener.shutdown(std::net::Shutdown::Both);
        }
        for path in &self.bound_paths {
            let _ = std::fs::remove_file(path);
        }
    }
}


fn resolve_uid(name: &str) -> io::Result<nix::unistd::Uid> {
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid),
        Ok(None) => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown user {name:?}"),
        )),
        Err(e) => Err(e.into()),
    }
}

fn resolve_gid(name: &str) -> io::Result<nix::unistd::Gid> {
    match nix::unistd::Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid),
        Ok(None) => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown group {name:?}"),
        )),
        Err(e) => Err(e.into()),
    }
}

fn allowed_peers_from_env() -> Option<Vec<IpAddr>> {
    let raw = std::env::var("FCGI_WEB_SERVER_ADDRS").ok()?;
    Some(parse_peer_list(&raw))
}

fn parse_peer_list(raw: &str) -> Vec<IpAddr> {
    let mut peers = Vec::new();
    for part in raw.split(',') {
        match part.trim().parse() {
            Ok(addr) => peers.push(addr),
            Err(_) => tracing::warn!(entry = part, "ignoring unparsable FCGI_WEB_SERVER_ADDRS entry"),
        }
    }
    peers
}
