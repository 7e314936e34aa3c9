//! One outbound DNS-over-TLS connection to a forwarder.
//!
//! The connection is driven entirely by reactor events:
//!
//! ```text
//! CONNECTING --handshake + pin ok--> OPEN --shutdown()--> SHUTTING_DOWN
//!     |                               |                        |
//!     +---------- error / timeout ----+------------------------+--> CLOSED
//! ```
//!
//! The owner sees decrypted bytes through the incoming callback and, exactly
//! once, the shutdown callback when the connection reaches CLOSED. An
//! optional open callback reports the move to OPEN. None of them is ever
//! invoked from inside `send`, `shutdown` or `drop`; they only run from
//! reactor dispatch.

use super::registry::ForwarderRegistry;
use super::verify::{self, TrustError};
use super::write_queue::WriteQueue;
use super::tls::TlsContext;
use crate::reactor::Reactor;
use ferrous_dot_domain::config::ConnectionConfig;
use ferrous_dot_domain::{DomainError, Forwarder, Pin};
use rustls::ClientConnection;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 4096;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a connection in callbacks so the owner can correlate data with
/// the request that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    ShuttingDown,
    Closed,
}

pub type IncomingCallback = Box<dyn FnMut(ConnectionId, Vec<u8>)>;
pub type ShutdownCallback = Box<dyn FnOnce(ConnectionId)>;
pub type OpenCallback = Box<dyn FnOnce(ConnectionId)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    /// TCP connect plus TLS handshake
    pub connect: Duration,
    /// Open connection without inbound data
    pub idle: Duration,
    /// A write waiting for the socket
    pub io: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnectionTimeouts {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            connect: config.connect_timeout(),
            idle: config.idle_timeout(),
            io: config.io_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Readable,
    Writable,
    Exception,
}

enum Notice {
    Opened,
    Incoming(Vec<u8>),
    Closed,
}

pub struct ForwarderConnection {
    inner: Rc<RefCell<Inner>>,
    id: ConnectionId,
    remote: SocketAddr,
}

impl ForwarderConnection {
    /// Connect to the currently preferred forwarder of `registry`.
    pub fn new<I, S>(
        reactor: &Reactor,
        registry: &ForwarderRegistry,
        incoming: I,
        shutdown: S,
        context: &TlsContext,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self, DomainError>
    where
        I: FnMut(ConnectionId, Vec<u8>) + 'static,
        S: FnOnce(ConnectionId) + 'static,
    {
        let forwarder = registry.first().ok_or(DomainError::NoForwarders)?;
        Self::connect(reactor, forwarder, incoming, shutdown, context, timeouts)
    }

    /// Connect to a specific forwarder. Hostname and pin are copied, so later
    /// changes to the registry do not affect this connection.
    pub fn connect<I, S>(
        reactor: &Reactor,
        forwarder: &Forwarder,
        incoming: I,
        shutdown: S,
        context: &TlsContext,
        timeouts: ConnectionTimeouts,
    ) -> Result<Self, DomainError>
    where
        I: FnMut(ConnectionId, Vec<u8>) + 'static,
        S: FnOnce(ConnectionId) + 'static,
    {
        let tls = context.session(&forwarder.hostname)?;
        let stream = open_socket(forwarder.remote).map_err(|e| DomainError::TransportError {
            server: forwarder.remote.to_string(),
            reason: e.to_string(),
        })?;
        let id = ConnectionId::next();
        let connect_deadline = Instant::now() + timeouts.connect;

        let inner = Rc::new_cyclic(|this| {
            RefCell::new(Inner {
                id,
                this: this.clone(),
                reactor: reactor.clone(),
                state: ConnectionState::Connecting,
                fd: stream.as_raw_fd(),
                stream: Some(stream),
                tls,
                buffers: WriteQueue::new(),
                remote: forwarder.remote,
                hostname: forwarder.hostname.clone(),
                pin: forwarder.pin,
                timeouts,
                connect_deadline,
                read_deadline: None,
                write_deadline: None,
                tcp_connected: false,
                opened: false,
                close_notify_sent: false,
                error: None,
                open: None,
                incoming: Some(Box::new(incoming)),
                shutdown: Some(Box::new(shutdown)),
            })
        });

        {
            let mut conn = inner.borrow_mut();
            conn.watch_exception();
            conn.watch_write(connect_deadline);
        }

        debug!(
            connection = %id,
            server = %forwarder.remote,
            hostname = %forwarder.hostname,
            "Connecting to forwarder"
        );
        Ok(Self {
            inner,
            id,
            remote: forwarder.remote,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the forwarder this connection was opened to.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    /// The failure that closed the connection, if it did not close cleanly.
    pub fn error(&self) -> Option<DomainError> {
        self.inner.borrow().error.clone()
    }

    /// True once the connection no longer accepts sends.
    pub fn closed(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::ShuttingDown | ConnectionState::Closed
        )
    }

    /// Run `callback` once from the reactor when the connection becomes
    /// OPEN, i.e. as soon as `send` starts accepting buffers. Replaces any
    /// earlier open callback.
    pub fn on_open<F>(&self, callback: F)
    where
        F: FnOnce(ConnectionId) + 'static,
    {
        self.inner.borrow_mut().open = Some(Box::new(callback));
    }

    /// Queue `buffer` for sending. Only accepted while OPEN.
    pub fn send(&self, buffer: Vec<u8>) -> bool {
        self.inner.borrow_mut().send(buffer)
    }

    /// Begin a graceful close. Idempotent; the shutdown callback fires later
    /// from the reactor.
    pub fn shutdown(&self) {
        self.inner.borrow_mut().begin_shutdown();
    }
}

impl Drop for ForwarderConnection {
    fn drop(&mut self) {
        match self.inner.try_borrow_mut() {
            Ok(mut conn) => {
                conn.open = None;
                conn.incoming = None;
                conn.shutdown = None;
                if conn.state != ConnectionState::Closed {
                    debug!(connection = %self.id, server = %self.remote, "Dropping live forwarder connection");
                }
                conn.release();
            }
            Err(_) => warn!(connection = %self.id, "Forwarder connection dropped while busy"),
        }
    }
}

impl fmt::Debug for ForwarderConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwarderConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

fn open_socket(remote: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&remote.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    let stream: TcpStream = socket.into();
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Entry point for every reactor callback of a connection.
fn dispatch(this: &Weak<RefCell<Inner>>, event: Event) {
    let Some(inner) = this.upgrade() else {
        return;
    };
    let notices = match inner.try_borrow_mut() {
        Ok(mut conn) => conn.handle(event),
        Err(_) => {
            warn!(?event, "Forwarder connection busy, event dropped");
            return;
        }
    };
    deliver(&inner, notices);
}

/// Run owner callbacks with no borrow held, so they may call back into the
/// connection or drop it.
fn deliver(inner: &Rc<RefCell<Inner>>, notices: Vec<Notice>) {
    for notice in notices {
        match notice {
            Notice::Opened => {
                let (id, callback) = {
                    let mut conn = inner.borrow_mut();
                    (conn.id, conn.open.take())
                };
                if let Some(callback) = callback {
                    callback(id);
                }
            }
            Notice::Incoming(data) => {
                let (id, callback) = {
                    let mut conn = inner.borrow_mut();
                    (conn.id, conn.incoming.take())
                };
                if let Some(mut callback) = callback {
                    callback(id, data);
                    let mut conn = inner.borrow_mut();
                    if conn.state != ConnectionState::Closed && conn.incoming.is_none() {
                        conn.incoming = Some(callback);
                    }
                }
            }
            Notice::Closed => {
                let (id, callback) = {
                    let mut conn = inner.borrow_mut();
                    (conn.id, conn.shutdown.take())
                };
                if let Some(callback) = callback {
                    callback(id);
                }
            }
        }
    }
}

fn socket_of(stream: &Option<TcpStream>) -> io::Result<&TcpStream> {
    stream
        .as_ref()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
}

/// Read decrypted bytes into `out`. Returns true once the peer has sent
/// `close_notify` and everything before it was read.
fn drain_plaintext(tls: &mut ClientConnection, out: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match tls.reader().read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

/// Data read before a close is delivered ahead of it.
fn with_data(data: Vec<u8>, mut notices: Vec<Notice>) -> Vec<Notice> {
    if !data.is_empty() {
        notices.insert(0, Notice::Incoming(data));
    }
    notices
}

fn transport_error(remote: SocketAddr, e: io::Error) -> DomainError {
    DomainError::TransportError {
        server: remote.to_string(),
        reason: e.to_string(),
    }
}

fn handshake_error(remote: SocketAddr, reason: &str) -> DomainError {
    DomainError::HandshakeFailed {
        server: remote.to_string(),
        reason: reason.to_string(),
    }
}

struct Inner {
    id: ConnectionId,
    this: Weak<RefCell<Inner>>,
    reactor: Reactor,
    state: ConnectionState,
    fd: RawFd,
    stream: Option<TcpStream>,
    tls: ClientConnection,
    buffers: WriteQueue,
    remote: SocketAddr,
    hostname: String,
    pin: Pin,
    timeouts: ConnectionTimeouts,
    connect_deadline: Instant,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    tcp_connected: bool,
    /// Handshake finished and the peer passed verification.
    opened: bool,
    close_notify_sent: bool,
    error: Option<DomainError>,
    open: Option<OpenCallback>,
    incoming: Option<IncomingCallback>,
    shutdown: Option<ShutdownCallback>,
}

impl Inner {
    fn handle(&mut self, event: Event) -> Vec<Notice> {
        trace!(connection = %self.id, ?event, state = ?self.state, "Forwarder event");
        match (self.state, event) {
            (ConnectionState::Closed, _) => Vec::new(),
            (_, Event::Exception) => {
                let error = self.exception_error();
                self.fail(error)
            }
            (ConnectionState::Connecting, _) => self.connect(),
            (ConnectionState::Open, Event::Readable) => self.incoming(),
            (ConnectionState::Open, Event::Writable) => self.outgoing(),
            (ConnectionState::ShuttingDown, Event::Readable) => {
                self.unwatch_read();
                Vec::new()
            }
            (ConnectionState::ShuttingDown, Event::Writable) => self.shutdown_step(),
        }
    }

    fn send(&mut self, buffer: Vec<u8>) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        trace!(connection = %self.id, len = buffer.len(), queued = self.buffers.len(), "Queueing buffer");
        self.buffers.push(buffer);
        if !self.reactor.interest(self.fd).write {
            self.watch_write(Instant::now() + self.timeouts.io);
        }
        true
    }

    fn begin_shutdown(&mut self) {
        match self.state {
            ConnectionState::ShuttingDown | ConnectionState::Closed => {}
            ConnectionState::Connecting => {
                debug!(connection = %self.id, "Shutdown requested while connecting");
                self.state = ConnectionState::ShuttingDown;
                self.unwatch_read();
                self.watch_write(self.connect_deadline);
            }
            ConnectionState::Open => {
                debug!(connection = %self.id, queued = self.buffers.len(), "Shutting down forwarder connection");
                self.state = ConnectionState::ShuttingDown;
                self.unwatch_read();
                self.watch_write(Instant::now() + self.timeouts.io);
            }
        }
    }

    // CONNECTING

    fn connect(&mut self) -> Vec<Notice> {
        if !self.tcp_connected {
            match self.tcp_status() {
                Ok(true) => {
                    self.tcp_connected = true;
                    debug!(connection = %self.id, server = %self.remote, "TCP connection established");
                }
                Ok(false) => {
                    self.watch_handshake();
                    return Vec::new();
                }
                Err(e) => return self.fail(transport_error(self.remote, e)),
            }
        }

        if let Err(e) = self.pump_handshake() {
            return self.fail(e);
        }
        if self.tls.is_handshaking() {
            self.watch_handshake();
            return Vec::new();
        }

        if let Err(e) = self.verify_connection() {
            return self.fail(e);
        }
        self.open()
    }

    fn tcp_status(&self) -> io::Result<bool> {
        let stream = self.socket()?;
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move handshake records in both directions until the socket blocks.
    fn pump_handshake(&mut self) -> Result<(), DomainError> {
        let remote = self.remote;
        let mut socket = socket_of(&self.stream).map_err(|e| transport_error(remote, e))?;
        loop {
            let mut progressed = false;

            while self.tls.wants_write() {
                match self.tls.write_tls(&mut socket) {
                    Ok(_) => progressed = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(transport_error(remote, e)),
                }
            }

            if !self.tls.is_handshaking() {
                return Ok(());
            }

            if self.tls.wants_read() {
                match self.tls.read_tls(&mut socket) {
                    Ok(0) => {
                        return Err(handshake_error(remote, "connection closed during handshake"));
                    }
                    Ok(_) => {
                        progressed = true;
                        if let Err(e) = self.tls.process_new_packets() {
                            // let the peer see our alert
                            let _ = self.tls.write_tls(&mut socket);
                            return Err(handshake_error(remote, &e.to_string()));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => progressed = true,
                    Err(e) => return Err(transport_error(remote, e)),
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    fn watch_handshake(&mut self) {
        let deadline = self.connect_deadline;
        if !self.tcp_connected || self.tls.wants_write() {
            self.watch_write(deadline);
        } else {
            self.unwatch_write();
        }
        if self.tcp_connected && self.tls.wants_read() {
            self.watch_read(deadline);
        } else {
            self.unwatch_read();
        }
    }

    /// The handshake alone proves nothing about who we talk to: the leaf
    /// certificate must carry the configured hostname and pinned key.
    fn verify_connection(&self) -> Result<(), DomainError> {
        let leaf = self
            .tls
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or(TrustError::NoCertificate)
            .map_err(|e| e.into_domain(self.remote))?;

        verify::verify_peer(leaf.as_ref(), &self.hostname, &self.pin)
            .map_err(|e| e.into_domain(self.remote))
    }

    fn open(&mut self) -> Vec<Notice> {
        self.state = ConnectionState::Open;
        self.opened = true;
        info!(
            connection = %self.id,
            server = %self.remote,
            hostname = %self.hostname,
            "Forwarder connection open"
        );

        let now = Instant::now();
        self.watch_read(now + self.timeouts.idle);
        if self.tls.wants_write() || !self.buffers.is_empty() {
            self.watch_write(now + self.timeouts.io);
        } else {
            self.unwatch_write();
        }

        // application data may have arrived with the last handshake flight
        let mut data = Vec::new();
        let closing = match drain_plaintext(&mut self.tls, &mut data) {
            Ok(false) => Vec::new(),
            Ok(true) => self.close(),
            Err(e) => self.fail(transport_error(self.remote, e)),
        };
        let mut notices = vec![Notice::Opened];
        notices.extend(with_data(data, closing));
        notices
    }

    // OPEN

    fn incoming(&mut self) -> Vec<Notice> {
        let remote = self.remote;
        let mut data = Vec::new();
        let mut peer_closed = false;
        let mut failure = None;

        match socket_of(&self.stream) {
            Ok(mut socket) => loop {
                match self.tls.read_tls(&mut socket) {
                    Ok(0) => {
                        peer_closed = true;
                        break;
                    }
                    Ok(_) => {
                        if let Err(e) = self.tls.process_new_packets() {
                            let _ = self.tls.write_tls(&mut socket);
                            failure = Some(DomainError::TransportError {
                                server: remote.to_string(),
                                reason: e.to_string(),
                            });
                            break;
                        }
                        match drain_plaintext(&mut self.tls, &mut data) {
                            Ok(false) => {}
                            Ok(true) => {
                                peer_closed = true;
                                break;
                            }
                            Err(e) => {
                                failure = Some(transport_error(remote, e));
                                break;
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        failure = Some(transport_error(remote, e));
                        break;
                    }
                }
            },
            Err(e) => failure = Some(transport_error(remote, e)),
        }

        if !data.is_empty() {
            trace!(connection = %self.id, len = data.len(), "Received from forwarder");
        }

        let closing = if let Some(error) = failure {
            self.fail(error)
        } else if peer_closed {
            debug!(connection = %self.id, server = %self.remote, "Forwarder closed the connection");
            self.close()
        } else {
            let now = Instant::now();
            self.watch_read(now + self.timeouts.idle);
            if self.tls.wants_write() && !self.reactor.interest(self.fd).write {
                self.watch_write(now + self.timeouts.io);
            }
            Vec::new()
        };
        with_data(data, closing)
    }

    fn outgoing(&mut self) -> Vec<Notice> {
        match self.write_step() {
            Err(e) => self.fail(e),
            Ok(true) => {
                self.unwatch_write();
                Vec::new()
            }
            Ok(false) => {
                self.watch_write(Instant::now() + self.timeouts.io);
                Vec::new()
            }
        }
    }

    /// Flush pending TLS records, then hand the head buffer to the TLS
    /// writer. Returns true when nothing is left to send.
    fn write_step(&mut self) -> Result<bool, DomainError> {
        if !self.flush_tls()? {
            return Ok(false);
        }
        if !self.buffers.is_empty() {
            let written = self.buffers.write_head(&mut self.tls.writer());
            let written = written.map_err(|e| transport_error(self.remote, e))?;
            trace!(connection = %self.id, written, remaining = self.buffers.len(), "Wrote to forwarder");
            self.flush_tls()?;
        }
        Ok(self.buffers.is_empty() && !self.tls.wants_write())
    }

    /// Returns true when the TLS layer has nothing left to write.
    fn flush_tls(&mut self) -> Result<bool, DomainError> {
        let remote = self.remote;
        let mut socket = socket_of(&self.stream).map_err(|e| transport_error(remote, e))?;
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(transport_error(remote, e)),
            }
        }
        Ok(true)
    }

    // SHUTTING_DOWN

    /// Queued buffers go out first, then `close_notify`, then the socket is
    /// released.
    fn shutdown_step(&mut self) -> Vec<Notice> {
        if !self.opened {
            debug!(connection = %self.id, "Abandoning connection attempt");
            return self.close();
        }

        loop {
            match self.write_step() {
                Err(e) => return self.fail(e),
                Ok(false) => {
                    self.watch_write(Instant::now() + self.timeouts.io);
                    return Vec::new();
                }
                Ok(true) if !self.close_notify_sent => {
                    self.tls.send_close_notify();
                    self.close_notify_sent = true;
                }
                Ok(true) => break,
            }
        }

        self.discard_inbound();
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Write);
        }
        debug!(connection = %self.id, server = %self.remote, "Sent close_notify");
        self.close()
    }

    /// Consume whatever the peer already sent (session tickets, a late
    /// response) so closing the socket does not turn into a reset.
    fn discard_inbound(&mut self) {
        let Ok(mut socket) = socket_of(&self.stream) else {
            return;
        };
        let mut sink = Vec::new();
        while let Ok(n) = self.tls.read_tls(&mut socket) {
            if n == 0 || self.tls.process_new_packets().is_err() {
                break;
            }
            let _ = drain_plaintext(&mut self.tls, &mut sink);
            sink.clear();
        }
    }

    // CLOSED

    fn fail(&mut self, error: DomainError) -> Vec<Notice> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        warn!(
            connection = %self.id,
            server = %self.remote,
            state = ?self.state,
            error = %error,
            "Forwarder connection failed"
        );
        self.error = Some(error);
        self.close()
    }

    fn close(&mut self) -> Vec<Notice> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }
        self.release();
        debug!(connection = %self.id, server = %self.remote, "Forwarder connection closed");
        vec![Notice::Closed]
    }

    /// Drop every registration and the socket.
    fn release(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.reactor.remove_all(self.fd);
        self.stream = None;
        self.buffers.clear();
        self.read_deadline = None;
        self.write_deadline = None;
        self.state = ConnectionState::Closed;
    }

    // helpers

    fn socket(&self) -> io::Result<&TcpStream> {
        socket_of(&self.stream)
    }

    fn exception_error(&self) -> DomainError {
        let server = self.remote.to_string();
        match self.stream.as_ref().map(TcpStream::take_error) {
            Some(Ok(Some(e))) | Some(Err(e)) => DomainError::TransportError {
                server,
                reason: e.to_string(),
            },
            _ => {
                let now = Instant::now();
                let expired = [self.read_deadline, self.write_deadline]
                    .into_iter()
                    .flatten()
                    .any(|deadline| deadline <= now);
                if expired {
                    DomainError::TransportTimeout { server }
                } else {
                    DomainError::TransportError {
                        server,
                        reason: "connection hung up".to_string(),
                    }
                }
            }
        }
    }

    fn watch_exception(&self) {
        let this = self.this.clone();
        self.reactor
            .register_exception(self.fd, move |_| dispatch(&this, Event::Exception));
    }

    fn watch_read(&mut self, deadline: Instant) {
        let this = self.this.clone();
        self.reactor.remove_read(self.fd);
        self.reactor.register_read(
            self.fd,
            move |_| dispatch(&this, Event::Readable),
            Some(deadline),
        );
        self.read_deadline = Some(deadline);
    }

    fn unwatch_read(&mut self) {
        self.reactor.remove_read(self.fd);
        self.read_deadline = None;
    }

    fn watch_write(&mut self, deadline: Instant) {
        let this = self.this.clone();
        self.reactor.remove_write(self.fd);
        self.reactor.register_write(
            self.fd,
            move |_| dispatch(&this, Event::Writable),
            Some(deadline),
        );
        self.write_deadline = Some(deadline);
    }

    fn unwatch_write(&mut self) {
        self.reactor.remove_write(self.fd);
        self.write_deadline = None;
    }
}
