//! Ferrous DoT infrastructure: the poll reactor, forwarder connections and
//! the plaintext DNS listeners.
pub mod forwarder;
pub mod framing;
pub mod reactor;
pub mod server;

pub use forwarder::{
    ClientForwarders, ConnectionId, ConnectionState, ConnectionTimeouts, ForwarderConnection,
    ForwarderRegistry, PoolSettings, TlsContext,
};
pub use reactor::{Interest, Reactor};
pub use server::Server;
