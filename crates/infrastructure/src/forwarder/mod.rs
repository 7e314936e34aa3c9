pub mod connection;
pub mod pool;
pub mod registry;
pub mod tls;
pub mod verify;
pub mod write_queue;

pub use connection::{ConnectionId, ConnectionState, ConnectionTimeouts, ForwarderConnection};
pub use pool::{ClientForwarders, PoolSettings};
pub use registry::ForwarderRegistry;
pub use tls::TlsContext;
pub use verify::{spki_pin, verify_peer, TrustError};
pub use write_queue::WriteQueue;
