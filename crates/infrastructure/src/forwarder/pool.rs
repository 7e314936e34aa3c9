use super::connection::{ConnectionId, ConnectionTimeouts, ForwarderConnection};
use super::registry::ForwarderRegistry;
use super::tls::TlsContext;
use crate::framing::FrameBuffer;
use crate::reactor::Reactor;
use ferrous_dot_domain::config::ConnectionConfig;
use ferrous_dot_domain::Forwarder;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use tracing::{debug, info, trace, warn};

/// Receives the length-prefixed response, or `None` once the request has
/// been given up on.
pub type Reply = Box<dyn FnOnce(Option<Vec<u8>>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub timeouts: ConnectionTimeouts,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for PoolSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_connections: config.max_connections.max(1),
            timeouts: ConnectionTimeouts::from(config),
        }
    }
}

/// Carries client queries to the forwarders, one connection per query.
///
/// A query goes to the currently preferred forwarder. When its connection
/// closes before a response arrived the forwarder is rotated to the back of
/// the registry and the query is retried on the new preference, at most once
/// per configured forwarder. After that the reply is called with `None`.
#[derive(Clone)]
pub struct ClientForwarders {
    inner: Rc<RefCell<PoolInner>>,
}

struct Request {
    /// Length-prefixed query
    payload: Vec<u8>,
    reply: Reply,
    attempts: usize,
}

struct Active {
    connection: ForwarderConnection,
    frames: FrameBuffer,
    /// Taken once the response has been delivered.
    request: Option<Request>,
}

struct PoolInner {
    this: Weak<RefCell<PoolInner>>,
    reactor: Reactor,
    registry: ForwarderRegistry,
    tls: TlsContext,
    settings: PoolSettings,
    active: HashMap<ConnectionId, Active>,
    backlog: VecDeque<Request>,
}

impl ClientForwarders {
    pub fn new(
        reactor: &Reactor,
        registry: ForwarderRegistry,
        tls: TlsContext,
        settings: PoolSettings,
    ) -> Self {
        let inner = Rc::new_cyclic(|this| {
            RefCell::new(PoolInner {
                this: this.clone(),
                reactor: reactor.clone(),
                registry,
                tls,
                settings,
                active: HashMap::new(),
                backlog: VecDeque::new(),
            })
        });
        Self { inner }
    }

    /// Forward one length-prefixed DNS query. `reply` runs exactly once,
    /// with the length-prefixed response or with `None` if every forwarder
    /// failed. It may run before `request` returns.
    pub fn request<F>(&self, payload: Vec<u8>, reply: F)
    where
        F: FnOnce(Option<Vec<u8>>) + 'static,
    {
        let request = Request {
            payload,
            reply: Box::new(reply),
            attempts: 0,
        };
        let abandoned = self.inner.borrow_mut().start(request);
        abandon(abandoned);
    }

    /// Live forwarder connections.
    pub fn active(&self) -> usize {
        self.inner.borrow().active.len()
    }

    /// Requests waiting for a free connection slot.
    pub fn backlog(&self) -> usize {
        self.inner.borrow().backlog.len()
    }

    /// Forwarders in current preference order.
    pub fn forwarders(&self) -> Vec<Forwarder> {
        self.inner.borrow().registry.get().to_vec()
    }
}

/// Tell owners of given-up requests, with no pool borrow held.
fn abandon(replies: impl IntoIterator<Item = Reply>) {
    for reply in replies {
        reply(None);
    }
}

impl PoolInner {
    /// Returns the reply of a request that could not be placed anywhere.
    fn start(&mut self, mut request: Request) -> Option<Reply> {
        if self.active.len() >= self.settings.max_connections {
            trace!(backlog = self.backlog.len() + 1, "Connection limit reached, request queued");
            self.backlog.push_back(request);
            return None;
        }

        while request.attempts < self.registry.len() {
            request.attempts += 1;
            match self.open() {
                Ok(connection) => {
                    debug!(
                        connection = %connection.id(),
                        server = %connection.remote(),
                        attempt = request.attempts,
                        "Forwarding request"
                    );
                    self.active.insert(
                        connection.id(),
                        Active {
                            connection,
                            frames: FrameBuffer::new(),
                            request: Some(request),
                        },
                    );
                    return None;
                }
                Err(e) => {
                    warn!(error = %e, "Unable to open forwarder connection");
                    if let Some(forwarder) = self.registry.first().cloned() {
                        self.registry.set_bad(&forwarder);
                    }
                }
            }
        }

        warn!(attempts = request.attempts, "No forwarder could answer, dropping request");
        Some(request.reply)
    }

    fn open(&self) -> Result<ForwarderConnection, ferrous_dot_domain::DomainError> {
        let incoming = {
            let this = self.this.clone();
            move |id, data: Vec<u8>| Self::incoming(&this, id, &data)
        };
        let shutdown = {
            let this = self.this.clone();
            move |id| Self::closed(&this, id)
        };
        let connection = ForwarderConnection::new(
            &self.reactor,
            &self.registry,
            incoming,
            shutdown,
            &self.tls,
            self.settings.timeouts,
        )?;

        let this = self.this.clone();
        connection.on_open(move |id| Self::opened(&this, id));
        Ok(connection)
    }

    fn opened(this: &Weak<RefCell<Self>>, id: ConnectionId) {
        let Some(inner) = this.upgrade() else {
            return;
        };
        let pool = inner.borrow();
        let Some(active) = pool.active.get(&id) else {
            return;
        };
        if let Some(request) = &active.request {
            if !active.connection.send(request.payload.clone()) {
                warn!(connection = %id, "Forwarder connection refused the request");
            }
        }
    }

    fn incoming(this: &Weak<RefCell<Self>>, id: ConnectionId, data: &[u8]) {
        let Some(inner) = this.upgrade() else {
            return;
        };
        let delivery = {
            let mut pool = inner.borrow_mut();
            let Some(active) = pool.active.get_mut(&id) else {
                return;
            };
            active.frames.extend(data);
            let Some(frame) = active.frames.next_frame() else {
                return;
            };
            let Some(request) = active.request.take() else {
                trace!(connection = %id, "Ignoring data after the response");
                return;
            };
            trace!(connection = %id, len = frame.len(), "Response received");
            active.connection.shutdown();
            (request.reply, frame)
        };

        let (reply, frame) = delivery;
        reply(Some(frame));
    }

    fn closed(this: &Weak<RefCell<Self>>, id: ConnectionId) {
        let Some(inner) = this.upgrade() else {
            return;
        };
        let abandoned = {
            let mut pool = inner.borrow_mut();
            let Some(active) = pool.active.remove(&id) else {
                return;
            };

            let mut abandoned = Vec::new();
            if let Some(request) = active.request {
                let remote = active.connection.remote();
                info!(
                    connection = %id,
                    server = %remote,
                    error = ?active.connection.error(),
                    "Forwarder closed without a response"
                );
                pool.registry.set_bad_address(&remote);
                drop(active.connection);
                abandoned.extend(pool.start(request));
            }

            while pool.active.len() < pool.settings.max_connections {
                let Some(request) = pool.backlog.pop_front() else {
                    break;
                };
                abandoned.extend(pool.start(request));
            }
            abandoned
        };
        abandon(abandoned);
    }
}
