use ferrous_dot_domain::{DomainError, Forwarder, Pin};
use ferrous_dot_infrastructure::{ConnectionState, ForwarderConnection, Reactor, TlsContext};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

mod helpers;
use helpers::{
    frame, query, registry, silent_forwarder, spin_until, timeouts, Behavior, MockDotServer,
    TEST_HOSTNAME,
};

struct Observed {
    opened: Rc<Cell<bool>>,
    incoming: Rc<RefCell<Vec<u8>>>,
    shutdowns: Rc<Cell<u32>>,
}

fn connect(reactor: &Reactor, forwarder: &Forwarder) -> (ForwarderConnection, Observed) {
    let observed = Observed {
        opened: Rc::new(Cell::new(false)),
        incoming: Rc::new(RefCell::new(Vec::new())),
        shutdowns: Rc::new(Cell::new(0)),
    };
    let incoming = Rc::clone(&observed.incoming);
    let shutdowns = Rc::clone(&observed.shutdowns);

    let connection = ForwarderConnection::new(
        reactor,
        &registry(&[forwarder]),
        move |_, data| incoming.borrow_mut().extend_from_slice(&data),
        move |_| shutdowns.set(shutdowns.get() + 1),
        &TlsContext::new(&[]).unwrap(),
        timeouts(Duration::from_secs(5)),
    )
    .unwrap();

    let opened = Rc::clone(&observed.opened);
    connection.on_open(move |_| opened.set(true));
    (connection, observed)
}

#[test]
fn test_pinned_forwarder_round_trip() {
    let server = MockDotServer::start(Behavior::Echo);
    let reactor = Reactor::new();
    let (connection, observed) = connect(&reactor, &server.forwarder());

    assert_eq!(connection.state(), ConnectionState::Connecting);
    assert!(spin_until(&reactor, || observed.opened.get()));
    assert_eq!(connection.state(), ConnectionState::Open);

    let request = frame(&query(0x1234));
    assert!(connection.send(request.clone()));
    assert!(spin_until(&reactor, || observed.incoming.borrow().len() >= request.len()));
    assert_eq!(*observed.incoming.borrow(), request);

    connection.shutdown();
    assert!(connection.closed());
    assert!(spin_until(&reactor, || observed.shutdowns.get() > 0));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(connection.error().is_none());
    assert!(reactor.is_empty());

    let session = server.next_session();
    assert_eq!(session.data, request);
}

#[test]
fn test_sends_arrive_in_order_and_shutdown_flushes_first() {
    let server = MockDotServer::start(Behavior::Record);
    let reactor = Reactor::new();
    let (connection, observed) = connect(&reactor, &server.forwarder());
    assert!(spin_until(&reactor, || observed.opened.get()));

    // queued before any write readiness is processed
    assert!(connection.send(b"A".repeat(3000)));
    assert!(connection.send(b"B".repeat(3000)));
    assert!(connection.send(b"C".repeat(3000)));
    connection.shutdown();
    connection.shutdown();

    assert!(!connection.send(b"late".to_vec()));
    assert!(connection.closed());
    assert_eq!(observed.shutdowns.get(), 0);

    assert!(spin_until(&reactor, || observed.shutdowns.get() > 0));
    reactor.turn(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(observed.shutdowns.get(), 1);

    let session = server.next_session();
    let mut expected = b"A".repeat(3000);
    expected.extend(b"B".repeat(3000));
    expected.extend(b"C".repeat(3000));
    assert_eq!(session.data, expected);
    assert!(session.clean_close, "client must send close_notify");
}

#[test]
fn test_oversized_buffers_are_written_one_at_a_time() {
    let server = MockDotServer::start(Behavior::Record);
    let reactor = Reactor::new();
    let (connection, observed) = connect(&reactor, &server.forwarder());
    assert!(spin_until(&reactor, || observed.opened.get()));

    // larger than the TLS writer accepts in one go, so each buffer is
    // handed over in pieces
    let buffers: Vec<Vec<u8>> = (0u8..3)
        .map(|n| (0..100_000u32).map(|i| (i % 251) as u8 ^ n).collect())
        .collect();
    for buffer in &buffers {
        assert!(connection.send(buffer.clone()));
    }
    connection.shutdown();

    // one write readiness per turn, and each hands over at most the head
    // buffer, so three buffers can never drain in fewer turns
    let mut turns = 0;
    while observed.shutdowns.get() == 0 {
        assert!(turns < 10_000, "connection never closed");
        reactor.turn(Some(Duration::from_millis(20))).unwrap();
        turns += 1;
    }
    assert!(turns >= buffers.len(), "took {} turns", turns);
    assert!(connection.error().is_none());

    let session = server.next_session();
    assert_eq!(session.data, buffers.concat());
    assert!(session.clean_close);
}

#[test]
fn test_wrong_pin_never_opens() {
    let server = MockDotServer::start(Behavior::Echo);
    let reactor = Reactor::new();
    let forwarder = Forwarder::new(server.addr(), TEST_HOSTNAME, Pin::new([0xAB; 32]));
    let (connection, observed) = connect(&reactor, &forwarder);

    assert!(spin_until(&reactor, || observed.shutdowns.get() > 0));
    assert!(!observed.opened.get());
    assert!(observed.incoming.borrow().is_empty());
    assert!(!connection.send(frame(b"never")));
    assert!(matches!(
        connection.error(),
        Some(DomainError::PinMismatch { .. })
    ));
    assert_eq!(observed.shutdowns.get(), 1);
}

#[test]
fn test_wrong_hostname_never_opens() {
    let server = MockDotServer::start(Behavior::Echo);
    let reactor = Reactor::new();
    let forwarder = Forwarder::new(server.addr(), "dns.elsewhere.test", server.pin());
    let (connection, observed) = connect(&reactor, &forwarder);

    assert!(spin_until(&reactor, || observed.shutdowns.get() > 0));
    assert!(!observed.opened.get());
    assert!(matches!(
        connection.error(),
        Some(DomainError::HostnameMismatch { .. })
    ));
    assert!(connection.error().is_some_and(|e| e.is_trust_failure()));
}

#[test]
fn test_connect_timeout_rotates_forwarder() {
    let (_silent, a) = silent_forwarder();
    let b = MockDotServer::start(Behavior::Echo).forwarder();
    let c = MockDotServer::start(Behavior::Echo).forwarder();
    let mut forwarders = registry(&[&a, &b, &c]);

    let reactor = Reactor::new();
    let failed = Rc::new(Cell::new(None));
    let on_shutdown = Rc::clone(&failed);

    let connection = ForwarderConnection::new(
        &reactor,
        &forwarders,
        |_, _| panic!("silent forwarder sent data"),
        move |id| on_shutdown.set(Some(id)),
        &TlsContext::new(&[]).unwrap(),
        timeouts(Duration::from_millis(200)),
    )
    .unwrap();
    assert_eq!(connection.remote(), a.remote);

    assert!(spin_until(&reactor, || failed.get().is_some()));
    assert_eq!(failed.get(), Some(connection.id()));
    assert!(matches!(
        connection.error(),
        Some(DomainError::TransportTimeout { .. })
    ));

    forwarders.set_bad_address(&connection.remote());
    let order: Vec<_> = forwarders.iter().map(|f| f.remote).collect();
    assert_eq!(order, vec![b.remote, c.remote, a.remote]);
}

#[test]
fn test_drop_while_open_skips_callbacks() {
    let server = MockDotServer::start(Behavior::Record);
    let reactor = Reactor::new();
    let (connection, observed) = connect(&reactor, &server.forwarder());
    assert!(spin_until(&reactor, || observed.opened.get()));

    drop(connection);
    assert!(reactor.is_empty());
    reactor.run().unwrap();
    assert_eq!(observed.shutdowns.get(), 0);

    let session = server.next_session();
    assert!(!session.clean_close);
}
