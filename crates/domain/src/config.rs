pub mod connection;
pub mod errors;
pub mod forwarders;
pub mod logging;
pub mod root;
pub mod server;

pub use connection::ConnectionConfig;
pub use errors::ConfigError;
pub use forwarders::ForwarderEntry;
pub use logging::LoggingConfig;
pub use root::{CliOverrides, Config};
pub use server::ServerConfig;
