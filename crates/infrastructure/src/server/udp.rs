use crate::forwarder::ClientForwarders;
use crate::framing::{self, MAX_MESSAGE_SIZE};
use crate::reactor::Reactor;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, info, trace, warn};

/// Accepts plaintext DNS datagrams. Each query is length-prefixed for the
/// forwarders and the prefix is stripped again from the response.
pub struct UdpServer {
    inner: Rc<UdpInner>,
}

struct UdpInner {
    socket: UdpSocket,
    local: SocketAddr,
    /// Receive buffer, sized for the largest DNS message.
    buffer: RefCell<Vec<u8>>,
    reactor: Reactor,
    forwarders: ClientForwarders,
}

impl UdpServer {
    pub fn bind(
        reactor: &Reactor,
        forwarders: ClientForwarders,
        address: SocketAddr,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&address.into())?;
        socket.set_nonblocking(true)?;
        let socket: UdpSocket = socket.into();
        let local = socket.local_addr()?;

        let inner = Rc::new(UdpInner {
            socket,
            local,
            buffer: RefCell::new(vec![0u8; MAX_MESSAGE_SIZE]),
            reactor: reactor.clone(),
            forwarders,
        });

        let fd = inner.socket.as_raw_fd();
        let weak = Rc::downgrade(&inner);
        reactor.register_read(
            fd,
            move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.readable();
                }
            },
            None,
        );
        let weak = Rc::downgrade(&inner);
        reactor.register_exception(fd, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.exception();
            }
        });

        info!(address = %local, "UDP listener ready");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.inner.reactor.remove_all(self.inner.fd());
        debug!(address = %self.inner.local, "UDP listener closed");
    }
}

impl UdpInner {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn readable(self: &Rc<Self>) {
        let mut buffer = self.buffer.borrow_mut();
        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, peer)) => self.query(&buffer[..len], peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(address = %self.local, error = %e, "UDP receive failed");
                    break;
                }
            }
        }
    }

    fn query(self: &Rc<Self>, message: &[u8], peer: SocketAddr) {
        let payload = match framing::encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(client = %peer, error = %e, "Dropping UDP query");
                return;
            }
        };
        trace!(client = %peer, len = message.len(), "UDP query received");

        let weak: Weak<Self> = Rc::downgrade(self);
        self.forwarders.request(payload, move |response| match (weak.upgrade(), response) {
            (Some(inner), Some(response)) => inner.respond(peer, &response),
            (Some(_), None) => debug!(client = %peer, "UDP query went unanswered"),
            (None, _) => {}
        });
    }

    fn respond(&self, peer: SocketAddr, frame: &[u8]) {
        let Some(message) = framing::strip(frame) else {
            warn!(client = %peer, len = frame.len(), "Truncated response from forwarder");
            return;
        };
        match self.socket.send_to(message, peer) {
            Ok(_) => trace!(client = %peer, len = message.len(), "UDP response sent"),
            Err(e) => warn!(client = %peer, error = %e, "UDP send failed"),
        }
    }

    fn exception(&self) {
        // ICMP errors from earlier sends surface here; reading clears them
        match self.socket.take_error() {
            Ok(Some(e)) => debug!(address = %self.local, error = %e, "UDP socket error"),
            Ok(None) => {}
            Err(e) => warn!(address = %self.local, error = %e, "UDP socket error"),
        }
    }
}
