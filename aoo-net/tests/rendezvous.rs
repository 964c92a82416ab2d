//! Client/server integration over loopback sockets: login, group
//! membership, the peer UDP handshake, and handshake failure modes.

use std::net::UdpSocket;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use aoo_net::{Client, ClientEvent, Reply, Server, ServerOptions};

const WAIT: Duration = Duration::from_secs(10);

fn start_server() -> (u16, Arc<AtomicBool>, JoinHandle<()>) {
    let mut server = Server::new(0, ServerOptions::default()).unwrap();
    let port = server.port();
    let quit = server.quit_handle();
    let handle = thread::spawn(move || {
        let _ = server.run();
    });
    (port, quit, handle)
}

struct TestClient {
    client: Arc<Client>,
    udp: UdpSocket,
}

impl TestClient {
    fn new() -> Self {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        udp.set_nonblocking(true).unwrap();
        let client = Arc::new(Client::new(udp.local_addr().unwrap().port()));
        let runner = client.clone();
        thread::spawn(move || runner.run());
        Self { client, udp }
    }

    /// One round of UDP plumbing: flush outgoing datagrams, deliver
    /// incoming ones.
    fn pump(&self) {
        let udp = &self.udp;
        self.client.send(&mut |bytes: &[u8], addr| {
            let _ = udp.send_to(bytes, addr);
        });
        let mut buf = [0u8; 4096];
        loop {
            match self.udp.recv_from(&mut buf) {
                Ok((n, from)) => self.client.handle_message(&buf[..n], from),
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn connect(&self, port: u16, user: &str, password: &str) -> Result<Reply, String> {
        let (tx, rx) = mpsc::channel();
        self.client.connect(
            "127.0.0.1",
            port,
            user,
            password,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        self.wait_for(rx)
    }

    fn group_join(&self, group: &str, password: &str) -> Result<Reply, String> {
        let (tx, rx) = mpsc::channel();
        self.client.group_join(
            group,
            password,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        self.wait_for(rx)
    }

    fn disconnect(&self) -> Result<Reply, String> {
        let (tx, rx) = mpsc::channel();
        self.client.disconnect(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        self.wait_for(rx)
    }

    fn wait_for(&self, rx: mpsc::Receiver<Result<Reply, String>>) -> Result<Reply, String> {
        let deadline = Instant::now() + WAIT;
        loop {
            self.pump();
            match rx.recv_timeout(Duration::from_millis(10)) {
                Ok(result) => return result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if Instant::now() > deadline {
                        panic!("no reply within {WAIT:?}");
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => panic!("callback dropped"),
            }
        }
    }

    /// Pump until `want` matches an event, or panic after the deadline.
    fn wait_for_event(&self, want: &dyn Fn(&ClientEvent) -> bool) -> ClientEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            self.pump();
            let mut found = None;
            self.client.poll_events(&mut |event| {
                if found.is_none() && want(&event) {
                    found = Some(event);
                }
            });
            if let Some(event) = found {
                return event;
            }
            if Instant::now() > deadline {
                panic!("expected event did not arrive within {WAIT:?}");
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

#[test]
fn test_connect_join_and_peer_handshake() {
    let (port, quit, _handle) = start_server();

    let alice = TestClient::new();
    let bob = TestClient::new();

    match alice.connect(port, "alice", "pw-a").unwrap() {
        Reply::Connect(reply) => {
            // the server reflects the UDP socket as our public endpoint
            assert_eq!(
                reply.public_addr.port(),
                alice.udp.local_addr().unwrap().port()
            );
        }
        other => panic!("unexpected reply {other:?}"),
    }
    bob.connect(port, "bob", "pw-b").unwrap();

    alice.group_join("band", "secret").unwrap();
    bob.group_join("band", "secret").unwrap();

    // both ends discover a working UDP path and announce the peer
    let event = alice.wait_for_event(&|e| matches!(e, ClientEvent::PeerJoin { .. }));
    match event {
        ClientEvent::PeerJoin { group, user, addr, .. } => {
            assert_eq!(group, "band");
            assert_eq!(user, "bob");
            assert_eq!(addr, bob.udp.local_addr().unwrap());
        }
        other => panic!("unexpected event {other:?}"),
    }
    bob.wait_for_event(&|e| matches!(e, ClientEvent::PeerJoin { user, .. } if user == "alice"));

    assert!(alice.client.find_peer("band", "bob").is_some());

    quit.store(true, std::sync::atomic::Ordering::Release);
}

#[test]
fn test_wrong_group_password_rejected() {
    let (port, quit, _handle) = start_server();

    let alice = TestClient::new();
    let bob = TestClient::new();
    alice.connect(port, "alice2", "x").unwrap();
    bob.connect(port, "bob2", "y").unwrap();

    alice.group_join("studio", "right").unwrap();
    match bob.group_join("studio", "wrong") {
        Err(msg) => assert_eq!(msg, "wrong password"),
        Ok(_) => panic!("join with wrong password succeeded"),
    }

    quit.store(true, std::sync::atomic::Ordering::Release);
}

#[test]
fn test_wrong_user_password_rejected() {
    let (port, quit, _handle) = start_server();

    let carol = TestClient::new();
    carol.connect(port, "carol", "first").unwrap();
    carol.disconnect().unwrap();
    // give the server a moment to reap the old connection
    thread::sleep(Duration::from_millis(300));

    match carol.connect(port, "carol", "second") {
        Err(msg) => assert_eq!(msg, "wrong password"),
        Ok(_) => panic!("login with wrong password succeeded"),
    }

    quit.store(true, std::sync::atomic::Ordering::Release);
}

#[test]
fn test_udp_blackhole_times_out() {
    let (port, quit, _handle) = start_server();

    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    let client = Arc::new(Client::new(udp.local_addr().unwrap().port()));
    let runner = client.clone();
    thread::spawn(move || runner.run());

    let (tx, rx) = mpsc::channel();
    client.connect(
        "127.0.0.1",
        port,
        "ghost",
        "pw",
        Box::new(move |r| {
            let _ = tx.send(r);
        }),
    );

    // TCP connects fine, but every UDP handshake probe is dropped
    let deadline = Instant::now() + Duration::from_secs(8);
    let result = loop {
        client.send(&mut |_bytes: &[u8], _addr| {
            // black hole
        });
        match rx.recv_timeout(Duration::from_millis(20)) {
            Ok(result) => break result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                assert!(Instant::now() < deadline, "connect callback never fired");
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => panic!("callback dropped"),
        }
    };
    match result {
        Err(msg) => assert_eq!(msg, "UDP handshake time out"),
        Ok(_) => panic!("connect succeeded through a black hole"),
    }
    assert_eq!(client.state(), aoo_net::ClientState::Disconnected);

    quit.store(true, std::sync::atomic::Ordering::Release);
}
