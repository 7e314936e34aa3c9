use crate::forwarder::write_queue::WriteQueue;
use crate::forwarder::ClientForwarders;
use crate::framing::FrameBuffer;
use crate::reactor::Reactor;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const LISTEN_BACKLOG: i32 = 128;
const READ_CHUNK: usize = 4096;

type ClientId = u64;

#[derive(Debug, Clone, Copy)]
enum ClientEvent {
    Readable,
    Writable,
    Exception,
}

/// Accepts DNS over TCP. Queries are already length-prefixed on the wire, so
/// complete frames go to the forwarders unchanged and responses are queued
/// back in arrival order.
pub struct TcpServer {
    inner: Rc<RefCell<TcpInner>>,
    local: SocketAddr,
}

struct TcpInner {
    this: Weak<RefCell<TcpInner>>,
    listener: TcpListener,
    reactor: Reactor,
    forwarders: ClientForwarders,
    idle_timeout: Duration,
    clients: HashMap<ClientId, Client>,
    next_client: ClientId,
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    frames: FrameBuffer,
    replies: WriteQueue,
    outstanding: usize,
    read_closed: bool,
}

impl Client {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn finished(&self) -> bool {
        self.read_closed && self.outstanding == 0 && self.replies.is_empty()
    }
}

impl TcpServer {
    pub fn bind(
        reactor: &Reactor,
        forwarders: ClientForwarders,
        address: SocketAddr,
        idle_timeout: Duration,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&address.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        let listener: TcpListener = socket.into();
        let local = listener.local_addr()?;
        let fd = listener.as_raw_fd();

        let inner = Rc::new_cyclic(|this| {
            RefCell::new(TcpInner {
                this: this.clone(),
                listener,
                reactor: reactor.clone(),
                forwarders,
                idle_timeout,
                clients: HashMap::new(),
                next_client: 1,
            })
        });

        let weak = Rc::downgrade(&inner);
        reactor.register_read(
            fd,
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.borrow_mut().accept();
                }
            },
            None,
        );
        reactor.register_exception(fd, move |_| {
            warn!(address = %local, "TCP listener error");
        });

        info!(address = %local, "TCP listener ready");
        Ok(Self { inner, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Connected clients.
    pub fn clients(&self) -> usize {
        self.inner.borrow().clients.len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            let ids: Vec<ClientId> = inner.clients.keys().copied().collect();
            for id in ids {
                inner.close(id);
            }
            let fd = inner.listener.as_raw_fd();
            inner.reactor.remove_all(fd);
        }
        debug!(address = %self.local, "TCP listener closed");
    }
}

impl TcpInner {
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.add_client(stream, peer) {
                        warn!(client = %peer, error = %e, "Unable to set up TCP client");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "TCP accept failed");
                    break;
                }
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let id = self.next_client;
        self.next_client += 1;

        let client = Client {
            stream,
            peer,
            frames: FrameBuffer::new(),
            replies: WriteQueue::new(),
            outstanding: 0,
            read_closed: false,
        };
        let fd = client.fd();
        self.clients.insert(id, client);

        let this = self.this.clone();
        self.reactor
            .register_exception(fd, move |_| Self::event(&this, id, ClientEvent::Exception));
        self.watch_read(id, fd);
        debug!(client = %peer, "TCP client connected");
        Ok(())
    }

    fn event(this: &Weak<RefCell<Self>>, id: ClientId, event: ClientEvent) {
        let Some(inner) = this.upgrade() else {
            return;
        };
        let queries = {
            let mut server = inner.borrow_mut();
            match event {
                ClientEvent::Readable => server.readable(id),
                ClientEvent::Writable => {
                    server.writable(id);
                    Vec::new()
                }
                ClientEvent::Exception => {
                    server.close(id);
                    Vec::new()
                }
            }
        };

        if queries.is_empty() {
            return;
        }
        let forwarders = inner.borrow().forwarders.clone();
        for query in queries {
            let this = this.clone();
            forwarders.request(query, move |response| Self::respond(&this, id, response));
        }
    }

    /// Complete frames read from the client.
    fn readable(&mut self, id: ClientId) -> Vec<Vec<u8>> {
        let Some(client) = self.clients.get_mut(&id) else {
            return Vec::new();
        };

        let mut chunk = [0u8; READ_CHUNK];
        let mut failed = false;
        loop {
            match client.stream.read(&mut chunk) {
                Ok(0) => {
                    client.read_closed = true;
                    break;
                }
                Ok(n) => client.frames.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(client = %client.peer, error = %e, "TCP client read failed");
                    failed = true;
                    break;
                }
            }
        }

        let mut queries = Vec::new();
        while let Some(frame) = client.frames.next_frame() {
            queries.push(frame);
        }
        client.outstanding += queries.len();
        trace!(client = %client.peer, queries = queries.len(), "TCP queries received");

        let fd = client.fd();
        if failed {
            self.close(id);
            return Vec::new();
        }
        if client.read_closed {
            self.reactor.remove_read(fd);
            if client.finished() {
                self.close(id);
            }
        } else {
            self.watch_read(id, fd);
        }
        queries
    }

    /// A reply from the forwarders; `None` when the query was given up on.
    fn respond(this: &Weak<RefCell<Self>>, id: ClientId, response: Option<Vec<u8>>) {
        let Some(inner) = this.upgrade() else {
            return;
        };
        let mut server = inner.borrow_mut();
        let Some(client) = server.clients.get_mut(&id) else {
            trace!("Client went away before its response arrived");
            return;
        };
        client.outstanding = client.outstanding.saturating_sub(1);
        let fd = client.fd();
        match response {
            Some(response) => {
                client.replies.push(response);
                if !server.reactor.interest(fd).write {
                    server.watch_write(id, fd);
                }
            }
            None => {
                debug!(client = %client.peer, "TCP query went unanswered");
                if client.finished() {
                    server.close(id);
                }
            }
        }
    }

    fn writable(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let fd = client.fd();
        while !client.replies.is_empty() {
            match client.replies.write_head(&mut client.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(client = %client.peer, error = %e, "TCP client write failed");
                    self.close(id);
                    return;
                }
            }
        }

        if !client.replies.is_empty() {
            self.watch_write(id, fd);
            return;
        }
        self.reactor.remove_write(fd);
        if client.finished() {
            self.close(id);
        }
    }

    fn close(&mut self, id: ClientId) {
        if let Some(client) = self.clients.remove(&id) {
            self.reactor.remove_all(client.fd());
            debug!(client = %client.peer, pending = client.outstanding, "TCP client closed");
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.idle_timeout
    }

    fn watch_read(&self, id: ClientId, fd: RawFd) {
        let this = self.this.clone();
        self.reactor.remove_read(fd);
        self.reactor.register_read(
            fd,
            move |_| Self::event(&this, id, ClientEvent::Readable),
            Some(self.deadline()),
        );
    }

    fn watch_write(&self, id: ClientId, fd: RawFd) {
        let this = self.this.clone();
        self.reactor.remove_write(fd);
        self.reactor.register_write(
            fd,
            move |_| Self::event(&this, id, ClientEvent::Writable),
            Some(self.deadline()),
        );
    }
}
