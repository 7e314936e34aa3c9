use ferrous_dot_domain::{Forwarder, Pin};
use ferrous_dot_infrastructure::{ConnectionTimeouts, ForwarderRegistry, Reactor};
use std::net::TcpListener;
use std::time::{Duration, Instant};

/// A forwarder whose TCP connect succeeds through the listen backlog but
/// which never speaks TLS. Keep the listener alive for the test.
pub fn silent_forwarder() -> (TcpListener, Forwarder) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let forwarder = Forwarder::new(
        listener.local_addr().unwrap(),
        "silent.ferrous.test",
        Pin::new([0x51; 32]),
    );
    (listener, forwarder)
}

pub fn registry(forwarders: &[&Forwarder]) -> ForwarderRegistry {
    forwarders.iter().map(|f| (*f).clone()).collect()
}

pub fn timeouts(connect: Duration) -> ConnectionTimeouts {
    ConnectionTimeouts {
        connect,
        idle: Duration::from_secs(5),
        io: Duration::from_secs(5),
    }
}

pub fn frame(message: &[u8]) -> Vec<u8> {
    let mut framed = (message.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(message);
    framed
}

/// A DNS-looking query; only the first bytes matter to the proxy.
pub fn query(id: u16) -> Vec<u8> {
    let mut message = id.to_be_bytes().to_vec();
    message.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    message.extend_from_slice(b"\x07example\x03com\x00\x00\x01\x00\x01");
    message
}

/// Turn the reactor until `done` holds. Returns false after ten seconds.
pub fn spin_until(reactor: &Reactor, mut done: impl FnMut() -> bool) -> bool {
    let give_up = Instant::now() + Duration::from_secs(10);
    while !done() {
        if Instant::now() > give_up {
            return false;
        }
        reactor.turn(Some(Duration::from_millis(20))).unwrap();
    }
    true
}
