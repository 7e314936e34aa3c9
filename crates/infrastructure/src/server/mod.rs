pub mod tcp;
pub mod udp;

pub use tcp::TcpServer;
pub use udp::UdpServer;

use crate::forwarder::ClientForwarders;
use crate::reactor::Reactor;
use ferrous_dot_domain::config::ServerConfig;
use ferrous_dot_domain::DomainError;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::error;

/// Plaintext DNS listeners feeding one forwarder pool.
pub struct Server {
    reactor: Reactor,
    forwarders: ClientForwarders,
    udp: Vec<UdpServer>,
    tcp: Vec<TcpServer>,
}

impl Server {
    pub fn new(reactor: &Reactor, forwarders: ClientForwarders) -> Self {
        Self {
            reactor: reactor.clone(),
            forwarders,
            udp: Vec::new(),
            tcp: Vec::new(),
        }
    }

    pub fn add_udp(&mut self, address: SocketAddr) -> Result<SocketAddr, DomainError> {
        let server = UdpServer::bind(&self.reactor, self.forwarders.clone(), address)
            .map_err(|e| bind_error(address, "UDP", e))?;
        let local = server.local_addr();
        self.udp.push(server);
        Ok(local)
    }

    pub fn add_tcp(
        &mut self,
        address: SocketAddr,
        idle_timeout: Duration,
    ) -> Result<SocketAddr, DomainError> {
        let server = TcpServer::bind(&self.reactor, self.forwarders.clone(), address, idle_timeout)
            .map_err(|e| bind_error(address, "TCP", e))?;
        let local = server.local_addr();
        self.tcp.push(server);
        Ok(local)
    }

    /// Bind every protocol enabled in `config`. On failure nothing stays
    /// bound.
    pub fn listen(
        &mut self,
        config: &ServerConfig,
        idle_timeout: Duration,
    ) -> Result<Vec<SocketAddr>, DomainError> {
        let address = config.socket_addr()?;
        let result = self.bind_enabled(config, address, idle_timeout);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn bind_enabled(
        &mut self,
        config: &ServerConfig,
        address: SocketAddr,
        idle_timeout: Duration,
    ) -> Result<Vec<SocketAddr>, DomainError> {
        let mut bound = Vec::new();
        if config.udp {
            bound.push(self.add_udp(address)?);
        }
        if config.tcp {
            bound.push(self.add_tcp(address, idle_timeout)?);
        }
        Ok(bound)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.udp
            .iter()
            .map(UdpServer::local_addr)
            .chain(self.tcp.iter().map(TcpServer::local_addr))
            .collect()
    }

    /// Stop listening. Forwarder connections already in flight finish on
    /// their own.
    pub fn close(&mut self) {
        self.udp.clear();
        self.tcp.clear();
    }
}

fn bind_error(address: SocketAddr, protocol: &str, e: std::io::Error) -> DomainError {
    error!(address = %address, protocol, error = %e, "Unable to bind listener");
    DomainError::IoError(format!("Unable to bind {} {}: {}", protocol, address, e))
}
