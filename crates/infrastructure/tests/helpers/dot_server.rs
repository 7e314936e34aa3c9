use ferrous_dot_domain::{Forwarder, Pin};
use ferrous_dot_infrastructure::forwarder::spki_pin;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const TEST_HOSTNAME: &str = "dot.ferrous.test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer every length-prefixed frame with itself.
    Echo,
    /// Read everything until the client closes.
    Record,
}

/// What the server saw on one accepted connection.
#[derive(Debug)]
pub struct Session {
    pub data: Vec<u8>,
    /// The client ended with `close_notify`.
    pub clean_close: bool,
}

/// Blocking DNS-over-TLS server on a helper thread with a fresh self-signed
/// certificate for [`TEST_HOSTNAME`].
pub struct MockDotServer {
    addr: SocketAddr,
    pin: Pin,
    sessions: mpsc::Receiver<Session>,
}

impl MockDotServer {
    pub fn start(behavior: Behavior) -> Self {
        let certified = rcgen::generate_simple_self_signed(vec![TEST_HOSTNAME.to_string()]).unwrap();
        let cert: CertificateDer<'static> = certified.cert.der().clone();
        let pin = spki_pin(cert.as_ref()).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, sessions) = mpsc::channel();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    break;
                };
                let session = serve(Arc::clone(&config), stream, behavior);
                if tx.send(session).is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            pin,
            sessions,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn pin(&self) -> Pin {
        self.pin
    }

    pub fn forwarder(&self) -> Forwarder {
        Forwarder::new(self.addr, TEST_HOSTNAME, self.pin)
    }

    /// Wait for the next finished connection.
    pub fn next_session(&self) -> Session {
        self.sessions
            .recv_timeout(Duration::from_secs(10))
            .expect("no session finished on the mock server")
    }
}

fn serve(config: Arc<ServerConfig>, stream: TcpStream, behavior: Behavior) -> Session {
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let connection = ServerConnection::new(config).unwrap();
    let mut tls = StreamOwned::new(connection, stream);
    let mut session = Session {
        data: Vec::new(),
        clean_close: false,
    };

    match behavior {
        Behavior::Record => {
            let mut buf = [0u8; 1024];
            loop {
                match tls.read(&mut buf) {
                    Ok(0) => {
                        session.clean_close = true;
                        break;
                    }
                    Ok(n) => session.data.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
        }
        Behavior::Echo => loop {
            let mut prefix = [0u8; 2];
            if tls.read_exact(&mut prefix).is_err() {
                break;
            }
            let mut message = vec![0u8; u16::from_be_bytes(prefix) as usize];
            if tls.read_exact(&mut message).is_err() {
                break;
            }
            session.data.extend_from_slice(&prefix);
            session.data.extend_from_slice(&message);

            let written = tls
                .write_all(&prefix)
                .and_then(|_| tls.write_all(&message))
                .and_then(|_| tls.flush());
            if written.is_err() {
                break;
            }
        },
    }
    session
}
