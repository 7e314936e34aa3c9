use ferrous_dot_domain::Config;
use ferrous_dot_infrastructure::{
    ClientForwarders, ForwarderRegistry, PoolSettings, Reactor, Server, TlsContext,
};
use tracing::info;

/// Everything the proxy runs on: one reactor and the client-facing
/// listeners feeding the forwarder pool.
pub struct DotServices {
    pub reactor: Reactor,
    pub server: Server,
}

impl DotServices {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let reactor = Reactor::new();

        let registry: ForwarderRegistry = config.forwarders()?.into_iter().collect();
        for (preference, forwarder) in registry.iter().enumerate() {
            info!(preference, forwarder = %forwarder, "Forwarder configured");
        }

        let tls = TlsContext::new(&config.connection.ciphers)?;
        let settings = PoolSettings::from(&config.connection);
        info!(
            max_connections = settings.max_connections,
            connect_timeout_secs = config.connection.connect_timeout,
            "Forwarder pool ready"
        );
        let forwarders = ClientForwarders::new(&reactor, registry, tls, settings);
        let server = Server::new(&reactor, forwarders);

        Ok(Self { reactor, server })
    }

    /// Bind the configured listeners.
    pub fn listen(&mut self, config: &Config) -> anyhow::Result<()> {
        let bound = self
            .server
            .listen(&config.server, config.connection.idle_timeout())?;
        for address in bound {
            info!(address = %address, "Listening for DNS queries");
        }
        Ok(())
    }

    /// Serve until every listener and connection is gone.
    pub fn run(&self) -> anyhow::Result<()> {
        self.reactor.run()?;
        Ok(())
    }
}
