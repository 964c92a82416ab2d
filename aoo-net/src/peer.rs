//! Client-side peer state: the UDP handshake over the two candidate
//! addresses and per-peer keep-alive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crossbeam_channel::Sender;
use rosc::{OscMessage, OscType};
use tracing::{debug, error, warn};

use aoo::osc;
use aoo::time::TimeTag;

use crate::client::ClientEvent;

const ADDR_NONE: u8 = 0;
const ADDR_PUBLIC: u8 = 1;
const ADDR_LOCAL: u8 = 2;

/// One remote user in one group, as announced by the server.
///
/// Until one of the candidate addresses answers, the peer is in a probing
/// state and pings both; the first address that replies becomes the real
/// address. Mutable state is atomic so the UDP and event contexts can
/// observe it without locking.
pub struct Peer {
    group: String,
    user: String,
    id: i32,
    public_addr: SocketAddr,
    local_addr: SocketAddr,
    /// Which candidate answered first; written once.
    real_addr: AtomicU8,
    start_time: f64,
    /// Elapsed seconds (f64 bits) of the last ping sent.
    last_ping_time: AtomicU64,
    send_reply: AtomicBool,
    timed_out: AtomicBool,
}

impl Peer {
    pub fn new(
        group: String,
        user: String,
        id: i32,
        public_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Self {
        debug!("create peer {}|{}", group, user);
        Self {
            group,
            user,
            id,
            public_addr,
            local_addr,
            real_addr: AtomicU8::new(ADDR_NONE),
            start_time: TimeTag::now().to_seconds(),
            last_ping_time: AtomicU64::new(0f64.to_bits()),
            send_reply: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// The address that answered the handshake, if any.
    pub fn real_address(&self) -> Option<SocketAddr> {
        match self.real_addr.load(Ordering::Acquire) {
            ADDR_PUBLIC => Some(self.public_addr),
            ADDR_LOCAL => Some(self.local_addr),
            _ => None,
        }
    }

    pub fn connected(&self) -> bool {
        self.real_addr.load(Ordering::Acquire) != ADDR_NONE
    }

    /// Does a datagram from `addr` belong to this peer? Before the
    /// handshake completes both candidates match; afterwards only the
    /// real address does.
    pub fn matches(&self, addr: SocketAddr) -> bool {
        match self.real_address() {
            Some(real) => real == addr,
            None => addr == self.public_addr || addr == self.local_addr,
        }
    }

    pub fn matches_name(&self, group: &str, user: &str) -> bool {
        self.group == group && self.user == user
    }

    /// Periodic sending: handshake probes while unconnected, pings and
    /// queued replies afterwards.
    pub fn send(
        &self,
        now: f64,
        ping_interval: f64,
        request_interval: f64,
        request_timeout: f64,
        send_fn: &mut dyn FnMut(&[u8], SocketAddr),
        events: &Sender<ClientEvent>,
    ) {
        let elapsed = now - self.start_time;
        let last_ping = f64::from_bits(self.last_ping_time.load(Ordering::Relaxed));
        let delta = elapsed - last_ping;

        if let Some(real) = self.real_address() {
            if delta >= ping_interval {
                self.send_verb(osc::MSG_PING, real, send_fn);
                self.last_ping_time
                    .store(elapsed.to_bits(), Ordering::Relaxed);
            }
            if self.send_reply.swap(false, Ordering::AcqRel) {
                self.send_verb("reply", real, send_fn);
            }
        } else if !self.timed_out.load(Ordering::Acquire) {
            if elapsed > request_timeout {
                // couldn't establish a UDP path on either address
                error!(
                    "couldn't establish connection to {}|{}; timed out after {} s",
                    self.group, self.user, request_timeout
                );
                self.timed_out.store(true, Ordering::Release);
                let _ = events.send(ClientEvent::PeerError {
                    group: self.group.clone(),
                    user: self.user.clone(),
                    message: format!(
                        "couldn't establish connection with peer {}|{}",
                        self.group, self.user
                    ),
                });
                return;
            }
            // probe both candidates until one answers
            if delta >= request_interval {
                self.send_verb(osc::MSG_PING, self.local_addr, send_fn);
                self.send_verb(osc::MSG_PING, self.public_addr, send_fn);
                self.last_ping_time
                    .store(elapsed.to_bits(), Ordering::Relaxed);
            }
        }
    }

    fn send_verb(&self, verb: &str, addr: SocketAddr, send_fn: &mut dyn FnMut(&[u8], SocketAddr)) {
        let msg = format!("{}/peer/{}", osc::DOMAIN, verb);
        match osc::encode(msg, vec![]) {
            Ok(bytes) => send_fn(&bytes, addr),
            Err(err) => warn!("couldn't encode peer message: {}", err),
        }
    }

    /// Handle one incoming peer datagram. The first message from either
    /// candidate fixes the real address and completes the handshake.
    pub fn handle_message(
        &self,
        msg: &OscMessage,
        verb: &str,
        addr: SocketAddr,
        events: &Sender<ClientEvent>,
    ) {
        if self.real_addr.load(Ordering::Acquire) == ADDR_NONE {
            let which = if addr == self.public_addr {
                ADDR_PUBLIC
            } else if addr == self.local_addr {
                ADDR_LOCAL
            } else {
                error!("peer message from unmatched address {}", addr);
                return;
            };
            // first reply wins; losing the race is fine
            if self
                .real_addr
                .compare_exchange(ADDR_NONE, which, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(
                    "established connection with {}|{} via {}",
                    self.group, self.user, addr
                );
                let _ = events.send(ClientEvent::PeerJoin {
                    group: self.group.clone(),
                    user: self.user.clone(),
                    id: self.id,
                    addr,
                });
            }
        }
        match verb {
            osc::MSG_PING => {
                self.send_reply.store(true, Ordering::Release);
            }
            "reply" => {
                debug!("got reply from {}|{}", self.group, self.user);
            }
            "message" => {
                let blob = msg.args.iter().find_map(|a| match a {
                    OscType::Blob(b) => Some(b.clone()),
                    _ => None,
                });
                match blob {
                    Some(data) => {
                        let _ = events.send(ClientEvent::PeerMessage { data, addr });
                    }
                    None => warn!("peer message without payload from {}", addr),
                }
            }
            other => {
                warn!(
                    "received unknown message '{}' from {}|{}",
                    other, self.group, self.user
                );
            }
        }
    }

    /// Wrap a payload in `/aoo/peer/message` and send it to the real
    /// address, if the handshake has completed.
    pub fn send_message(&self, data: &[u8], send_fn: &mut dyn FnMut(&[u8], SocketAddr)) {
        let Some(real) = self.real_address() else {
            return;
        };
        let msg = format!("{}/peer/message", osc::DOMAIN);
        match osc::encode(msg, vec![OscType::Blob(data.to_vec())]) {
            Ok(bytes) => send_fn(&bytes, real),
            Err(err) => warn!("couldn't encode peer message: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn make_peer() -> Peer {
        Peer::new(
            "band".into(),
            "bob".into(),
            7,
            "198.51.100.7:40000".parse().unwrap(),
            "192.168.1.5:40000".parse().unwrap(),
        )
    }

    fn ping_msg() -> OscMessage {
        OscMessage {
            addr: "/aoo/peer/ping".into(),
            args: vec![],
        }
    }

    #[test]
    fn test_probes_both_addresses_until_reply() {
        let peer = make_peer();
        let (tx, rx) = unbounded();
        let now = TimeTag::now().to_seconds();

        let mut sent = Vec::new();
        peer.send(now + 1.0, 5.0, 0.1, 5.0, &mut |_, addr| sent.push(addr), &tx);
        assert_eq!(sent.len(), 2, "expected a probe to each candidate");
        assert!(sent.contains(&peer.local_addr));
        assert!(sent.contains(&peer.public_addr));
        assert!(rx.try_recv().is_err());

        // only the local address answers
        peer.handle_message(&ping_msg(), osc::MSG_PING, peer.local_addr, &tx);
        assert_eq!(peer.real_address(), Some(peer.local_addr));
        match rx.try_recv() {
            Ok(ClientEvent::PeerJoin { group, user, addr, .. }) => {
                assert_eq!(group, "band");
                assert_eq!(user, "bob");
                assert_eq!(addr, peer.local_addr);
            }
            other => panic!("expected PeerJoin, got {other:?}"),
        }

        // from now on traffic only goes to the local address, including
        // the reply to the ping we just got
        sent.clear();
        peer.send(now + 7.0, 5.0, 0.1, 5.0, &mut |_, addr| sent.push(addr), &tx);
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|&a| a == peer.local_addr));
    }

    #[test]
    fn test_matching_narrows_after_handshake() {
        let peer = make_peer();
        let (tx, _rx) = unbounded();
        assert!(peer.matches(peer.public_addr));
        assert!(peer.matches(peer.local_addr));

        peer.handle_message(&ping_msg(), osc::MSG_PING, peer.local_addr, &tx);
        assert!(peer.matches(peer.local_addr));
        assert!(!peer.matches(peer.public_addr));
    }

    #[test]
    fn test_unreachable_peer_times_out() {
        let peer = make_peer();
        let (tx, rx) = unbounded();
        let now = TimeTag::now().to_seconds();

        // no reply within the timeout
        let mut sent = Vec::new();
        peer.send(now + 6.0, 5.0, 0.1, 5.0, &mut |_, addr| sent.push(addr), &tx);
        assert!(sent.is_empty());
        match rx.try_recv() {
            Ok(ClientEvent::PeerError { group, user, .. }) => {
                assert_eq!(group, "band");
                assert_eq!(user, "bob");
            }
            other => panic!("expected PeerError, got {other:?}"),
        }

        // timed out peers stay silent
        sent.clear();
        peer.send(now + 7.0, 5.0, 0.1, 5.0, &mut |_, addr| sent.push(addr), &tx);
        assert!(sent.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
