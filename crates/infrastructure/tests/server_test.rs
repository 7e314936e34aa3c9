use ferrous_dot_domain::config::ServerConfig;
use ferrous_dot_infrastructure::server::TcpServer;
use ferrous_dot_infrastructure::{ClientForwarders, PoolSettings, Reactor, Server, TlsContext};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

mod helpers;
use helpers::{
    frame, query, registry, silent_forwarder, spin_until, timeouts, Behavior, MockDotServer,
};

fn proxy(reactor: &Reactor, upstream: &MockDotServer) -> Server {
    let pool = ClientForwarders::new(
        reactor,
        registry(&[&upstream.forwarder()]),
        TlsContext::new(&[]).unwrap(),
        PoolSettings::default(),
    );
    Server::new(reactor, pool)
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn test_udp_query_is_relayed() {
    let upstream = MockDotServer::start(Behavior::Echo);
    let reactor = Reactor::new();
    let mut server = proxy(&reactor, &upstream);
    let address = server.add_udp(loopback()).unwrap();

    let client = UdpSocket::bind(loopback()).unwrap();
    client.set_nonblocking(true).unwrap();
    let message = query(0xbeef);
    client.send_to(&message, address).unwrap();

    let mut buf = [0u8; 512];
    let mut answer = None;
    assert!(spin_until(&reactor, || {
        match client.recv_from(&mut buf) {
            Ok((len, from)) => answer = Some((buf[..len].to_vec(), from)),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
        }
        answer.is_some()
    }));

    let (response, from) = answer.unwrap();
    assert_eq!(response, message);
    assert_eq!(from, address);
    assert_eq!(upstream.next_session().data, frame(&message));
}

#[test]
fn test_tcp_queries_are_relayed_in_order() {
    let upstream = MockDotServer::start(Behavior::Echo);
    let reactor = Reactor::new();
    let mut server = proxy(&reactor, &upstream);
    let address = server.add_tcp(loopback(), Duration::from_secs(5)).unwrap();

    let mut client = TcpStream::connect(address).unwrap();
    let mut both = frame(&query(1));
    both.extend(frame(&query(2)));
    client.write_all(&both).unwrap();
    client.set_nonblocking(true).unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    assert!(spin_until(&reactor, || {
        match client.read(&mut buf) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
        }
        received.len() >= both.len()
    }));

    // one forwarder connection per query, so answers may come back either way
    let first = frame(&query(1));
    let second = frame(&query(2));
    assert!(
        received == [first.clone(), second.clone()].concat()
            || received == [second, first].concat()
    );
}

#[test]
fn test_close_releases_listeners_and_clients() {
    let upstream = MockDotServer::start(Behavior::Echo);
    let reactor = Reactor::new();
    let mut server = proxy(&reactor, &upstream);
    let config = ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        udp: false,
        tcp: true,
    };
    let bound = server.listen(&config, Duration::from_secs(5)).unwrap();
    assert_eq!(bound.len(), 1);

    let client = TcpStream::connect(bound[0]).unwrap();
    drop(client);

    reactor.turn(Some(Duration::from_millis(100))).unwrap();
    reactor.turn(Some(Duration::from_millis(100))).unwrap();

    server.close();
    assert!(server.local_addrs().is_empty());
    assert!(reactor.is_empty());
}

#[test]
fn test_listen_rejects_hostname() {
    let upstream = MockDotServer::start(Behavior::Echo);
    let reactor = Reactor::new();
    let mut server = proxy(&reactor, &upstream);
    let config = ServerConfig {
        bind_address: "localhost".to_string(),
        ..ServerConfig::default()
    };
    assert!(server.listen(&config, Duration::from_secs(5)).is_err());
    assert!(reactor.is_empty());
}

#[test]
fn test_half_closed_client_released_when_query_abandoned() {
    let (_silent, forwarder) = silent_forwarder();
    let reactor = Reactor::new();
    let pool = ClientForwarders::new(
        &reactor,
        registry(&[&forwarder]),
        TlsContext::new(&[]).unwrap(),
        PoolSettings {
            max_connections: 5,
            timeouts: timeouts(Duration::from_millis(100)),
        },
    );
    let server =
        TcpServer::bind(&reactor, pool.clone(), loopback(), Duration::from_secs(30)).unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(&frame(&query(9))).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    assert!(spin_until(&reactor, || server.clients() == 0));
    assert_eq!(pool.active(), 0);
    assert_eq!(reactor.handles(), 1, "only the listener stays registered");

    // the listener closed the stream without answering
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}
