//! Connection client: TCP control channel to the rendezvous server, the
//! UDP handshake that discovers our public address, and the peer roster.
//!
//! All mutable client state is touched by exactly one thread: the network
//! thread running [`Client::run`]. Host-facing requests post commands to
//! an unbounded MPSC queue and get their callback invoked from that
//! thread once the reply arrives or the request times out. UDP traffic
//! is carried by the host's socket through [`Client::handle_message`] /
//! [`Client::send`], so control and audio plane can share one socket.

use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rosc::{OscMessage, OscPacket, OscType};
use tracing::{debug, error, warn};

use aoo::osc::{self, Args, Role};
use aoo::time::TimeTag;

use crate::error::Result;
use crate::peer::Peer;
use crate::slip;
use crate::{PING_INTERVAL, REQUEST_INTERVAL, REQUEST_TIMEOUT};

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_POLL: Duration = Duration::from_millis(20);

/// Connection state, observable from any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Disconnected = 0,
    Connecting = 1,
    Handshake = 2,
    Login = 3,
    Connected = 4,
}

impl ClientState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ClientState::Connecting,
            2 => ClientState::Handshake,
            3 => ClientState::Login,
            4 => ClientState::Connected,
            _ => ClientState::Disconnected,
        }
    }
}

/// Successful connect reply.
#[derive(Debug, Clone)]
pub struct ConnectReply {
    pub user_id: i32,
    pub public_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Reply delivered to a request callback.
#[derive(Debug, Clone)]
pub enum Reply {
    None,
    Connect(ConnectReply),
}

/// Request callback, invoked on the network thread.
pub type Callback = Box<dyn FnOnce(std::result::Result<Reply, String>) + Send>;

/// Events delivered to the host application.
#[derive(Debug)]
pub enum ClientEvent {
    /// The server connection went away (not host initiated).
    Disconnect { message: String },
    /// Non-fatal protocol error.
    Error { message: String },
    /// A peer answered the UDP handshake and is reachable.
    PeerJoin {
        group: String,
        user: String,
        id: i32,
        addr: SocketAddr,
    },
    /// A peer left its group.
    PeerLeave {
        group: String,
        user: String,
        id: i32,
        addr: Option<SocketAddr>,
    },
    /// A peer could not be reached on either candidate address.
    PeerError {
        group: String,
        user: String,
        message: String,
    },
    /// Payload relayed from a peer.
    PeerMessage { data: Vec<u8>, addr: SocketAddr },
}

/// Addressing for outgoing peer messages.
#[derive(Debug, Clone)]
pub enum Target {
    /// One peer by its (real) address.
    Peer(SocketAddr),
    /// Every connected peer in a group.
    Group(String),
    /// Every connected peer.
    All,
}

enum Command {
    Connect {
        host: String,
        port: u16,
        user: String,
        password: String,
        cb: Callback,
    },
    Disconnect {
        cb: Callback,
    },
    Login,
    HandshakeTimeout,
    GroupJoin {
        group: String,
        password: String,
        cb: Callback,
    },
    GroupLeave {
        group: String,
        cb: Callback,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    GroupJoin,
    GroupLeave,
}

struct Pending {
    kind: PendingKind,
    group: String,
    cb: Callback,
    deadline: f64,
}

/// State owned by the network thread.
struct NetCore {
    tcp: Option<TcpStream>,
    decoder: slip::Decoder,
    username: String,
    password: String,
    local_addr: Option<SocketAddr>,
    connect_cb: Option<Callback>,
    pending: Vec<Pending>,
    last_tcp_ping: f64,
}

/// Timing state owned by the UDP context.
struct UdpShared {
    public_addr: Option<SocketAddr>,
    first_request_time: f64,
    last_ping_time: f64,
}

struct OutgoingMessage {
    data: Vec<u8>,
    target: Target,
}

/// The connection client.
pub struct Client {
    /// Local UDP port carrying the audio plane; advertised to the server.
    udp_port: u16,
    state: AtomicU8,
    quit: AtomicBool,
    commands: (Sender<Command>, Receiver<Command>),
    events: (Sender<ClientEvent>, Receiver<ClientEvent>),
    messages: (Sender<OutgoingMessage>, Receiver<OutgoingMessage>),
    peers: RwLock<Vec<Arc<Peer>>>,
    server_addr: RwLock<Option<SocketAddr>>,
    core: Mutex<NetCore>,
    udp: Mutex<UdpShared>,
}

fn now_secs() -> f64 {
    TimeTag::now().to_seconds()
}

impl Client {
    pub fn new(udp_port: u16) -> Self {
        Self {
            udp_port,
            state: AtomicU8::new(ClientState::Disconnected as u8),
            quit: AtomicBool::new(false),
            commands: unbounded(),
            events: unbounded(),
            messages: unbounded(),
            peers: RwLock::new(Vec::new()),
            server_addr: RwLock::new(None),
            core: Mutex::new(NetCore {
                tcp: None,
                decoder: slip::Decoder::new(),
                username: String::new(),
                password: String::new(),
                local_addr: None,
                connect_cb: None,
                pending: Vec::new(),
                last_tcp_ping: 0.0,
            }),
            udp: Mutex::new(UdpShared {
                public_addr: None,
                first_request_time: 0.0,
                last_ping_time: 0.0,
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Connect to a rendezvous server. The password is hashed on the
    /// calling thread; the callback fires from the network thread.
    pub fn connect(&self, host: &str, port: u16, user: &str, password: &str, cb: Callback) {
        let state = self.state();
        if state != ClientState::Disconnected {
            let msg = if state == ClientState::Connected {
                "already connected"
            } else {
                "already connecting"
            };
            cb(Err(msg.into()));
            return;
        }
        self.set_state(ClientState::Connecting);
        let _ = self.commands.0.send(Command::Connect {
            host: host.into(),
            port,
            user: user.into(),
            password: crate::password_hash(password),
            cb,
        });
    }

    pub fn disconnect(&self, cb: Callback) {
        let _ = self.commands.0.send(Command::Disconnect { cb });
    }

    pub fn group_join(&self, group: &str, password: &str, cb: Callback) {
        let _ = self.commands.0.send(Command::GroupJoin {
            group: group.into(),
            password: crate::password_hash(password),
            cb,
        });
    }

    pub fn group_leave(&self, group: &str, cb: Callback) {
        let _ = self.commands.0.send(Command::GroupLeave {
            group: group.into(),
            cb,
        });
    }

    /// Queue a payload for delivery over `/aoo/peer/message`; it goes out
    /// with the next [`Client::send`] call.
    pub fn send_peer_message(&self, data: &[u8], target: Target) {
        let _ = self.messages.0.send(OutgoingMessage {
            data: data.to_vec(),
            target,
        });
    }

    /// Real address of a connected peer.
    pub fn find_peer(&self, group: &str, user: &str) -> Option<SocketAddr> {
        self.peers
            .read()
            .iter()
            .find(|p| p.matches_name(group, user))
            .and_then(|p| p.real_address())
    }

    /// Drain pending events on the caller's thread.
    pub fn poll_events(&self, handler: &mut dyn FnMut(ClientEvent)) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.1.try_recv() {
            handler(event);
            count += 1;
        }
        count
    }

    /// Stop the network thread at its next loop iteration.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    /// Network thread main loop: executes commands, drives the TCP
    /// connection, times out pending requests. Returns when
    /// [`Client::quit`] is called.
    pub fn run(&self) {
        while !self.quit.load(Ordering::Acquire) {
            match self.commands.1.recv_timeout(COMMAND_POLL) {
                Ok(cmd) => self.perform(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok(cmd) = self.commands.1.try_recv() {
                self.perform(cmd);
            }
            self.receive_tcp();
            self.tick_tcp();
        }
    }

    fn perform(&self, cmd: Command) {
        match cmd {
            Command::Connect {
                host,
                port,
                user,
                password,
                cb,
            } => self.perform_connect(&host, port, user, password, cb),
            Command::Disconnect { cb } => self.perform_disconnect(cb),
            Command::Login => self.perform_login(),
            Command::HandshakeTimeout => self.perform_handshake_timeout(),
            Command::GroupJoin {
                group,
                password,
                cb,
            } => self.perform_group_join(group, password, cb),
            Command::GroupLeave { group, cb } => self.perform_group_leave(group, cb),
        }
    }

    fn perform_connect(&self, host: &str, port: u16, user: String, password: String, cb: Callback) {
        let mut core = self.core.lock();
        if core.tcp.is_some() {
            cb(Err("already connected".into()));
            return;
        }
        // blocking DNS is fine here: we already run on the network thread
        let addr = match (host, port).to_socket_addrs().ok().and_then(|mut a| a.next()) {
            Some(addr) => addr,
            None => {
                self.set_state(ClientState::Disconnected);
                cb(Err(format!("couldn't resolve host '{host}'")));
                return;
            }
        };
        let stream = match TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                self.set_state(ClientState::Disconnected);
                cb(Err(format!("couldn't connect: {err}")));
                return;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            warn!("couldn't set TCP_NODELAY: {}", err);
        }
        if let Err(err) = stream.set_nonblocking(true) {
            self.set_state(ClientState::Disconnected);
            cb(Err(format!("couldn't set non-blocking: {err}")));
            return;
        }
        // the UDP socket shares our interface but has its own port
        let local_addr = stream
            .local_addr()
            .map(|a| SocketAddr::new(a.ip(), self.udp_port))
            .ok();

        debug!("connected to {} (local {:?})", addr, local_addr);
        core.tcp = Some(stream);
        core.decoder.reset();
        core.username = user;
        core.password = password;
        core.local_addr = local_addr;
        core.connect_cb = Some(cb);
        core.last_tcp_ping = 0.0;
        drop(core);

        *self.server_addr.write() = Some(addr);
        {
            let mut udp = self.udp.lock();
            udp.public_addr = None;
            udp.first_request_time = 0.0;
            udp.last_ping_time = 0.0;
        }
        self.set_state(ClientState::Handshake);
    }

    fn perform_disconnect(&self, cb: Callback) {
        if self.state() != ClientState::Connected {
            let msg = if self.state() == ClientState::Disconnected {
                "not connected"
            } else {
                "still connecting"
            };
            cb(Err(msg.into()));
            return;
        }
        let mut core = self.core.lock();
        self.close(&mut core, None);
        cb(Ok(Reply::None));
    }

    /// `/aoo/server/login <user> <pwd> <pub_ip> <pub_port> <loc_ip>
    /// <loc_port>` over TCP.
    fn perform_login(&self) {
        let mut core = self.core.lock();
        let public = self.udp.lock().public_addr;
        let (Some(public), Some(local)) = (public, core.local_addr) else {
            error!("bug: login without addresses");
            return;
        };
        self.set_state(ClientState::Login);
        let msg = osc::encode(
            format!("{}/server/login", osc::DOMAIN),
            vec![
                OscType::String(core.username.clone()),
                OscType::String(core.password.clone()),
                OscType::String(public.ip().to_string()),
                OscType::Int(public.port() as i32),
                OscType::String(local.ip().to_string()),
                OscType::Int(local.port() as i32),
            ],
        );
        match msg {
            Ok(bytes) => self.send_tcp(&mut core, &bytes),
            Err(err) => error!("couldn't encode login: {}", err),
        }
    }

    fn perform_handshake_timeout(&self) {
        if self.state() != ClientState::Handshake {
            return;
        }
        let mut core = self.core.lock();
        let cb = core.connect_cb.take();
        self.close(&mut core, None);
        drop(core);
        if let Some(cb) = cb {
            cb(Err("UDP handshake time out".into()));
        }
    }

    fn perform_group_join(&self, group: String, password: String, cb: Callback) {
        if self.state() != ClientState::Connected {
            cb(Err("not connected".into()));
            return;
        }
        let mut core = self.core.lock();
        let msg = osc::encode(
            format!("{}/server/group/join", osc::DOMAIN),
            vec![OscType::String(group.clone()), OscType::String(password)],
        );
        match msg {
            Ok(bytes) => {
                self.send_tcp(&mut core, &bytes);
                core.pending.push(Pending {
                    kind: PendingKind::GroupJoin,
                    group,
                    cb,
                    deadline: now_secs() + REQUEST_TIMEOUT,
                });
            }
            Err(err) => cb(Err(err.to_string())),
        }
    }

    fn perform_group_leave(&self, group: String, cb: Callback) {
        if self.state() != ClientState::Connected {
            cb(Err("not connected".into()));
            return;
        }
        let mut core = self.core.lock();
        let msg = osc::encode(
            format!("{}/server/group/leave", osc::DOMAIN),
            vec![OscType::String(group.clone())],
        );
        match msg {
            Ok(bytes) => {
                self.send_tcp(&mut core, &bytes);
                core.pending.push(Pending {
                    kind: PendingKind::GroupLeave,
                    group,
                    cb,
                    deadline: now_secs() + REQUEST_TIMEOUT,
                });
            }
            Err(err) => cb(Err(err.to_string())),
        }
    }

    /// Tear down the TCP session. A `message` marks a non-manual close
    /// and is surfaced as a `Disconnect` event.
    fn close(&self, core: &mut NetCore, message: Option<String>) {
        if core.tcp.take().is_some() {
            debug!("connection closed");
        }
        core.decoder.reset();
        core.username.clear();
        core.password.clear();
        for pending in core.pending.drain(..) {
            (pending.cb)(Err("disconnected".into()));
        }
        if let Some(cb) = core.connect_cb.take() {
            cb(Err(message.clone().unwrap_or_else(|| "disconnected".into())));
        }
        self.peers.write().clear();
        *self.server_addr.write() = None;
        self.set_state(ClientState::Disconnected);
        if let Some(message) = message {
            let _ = self.events.0.send(ClientEvent::Disconnect { message });
        }
    }

    fn send_tcp(&self, core: &mut NetCore, payload: &[u8]) {
        let framed = slip::encode(payload);
        if let Some(tcp) = core.tcp.as_mut() {
            use std::io::Write;
            if let Err(err) = tcp.write_all(&framed) {
                error!("TCP send failed: {}", err);
                self.close(core, Some(format!("TCP send failed: {err}")));
            }
        }
    }

    fn receive_tcp(&self) {
        let mut core = self.core.lock();
        if core.tcp.is_none() {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            let result = core.tcp.as_mut().unwrap().read(&mut buf);
            match result {
                Ok(0) => {
                    self.close(&mut core, Some("server closed the connection".into()));
                    return;
                }
                Ok(n) => {
                    let mut frames: Vec<Vec<u8>> = Vec::new();
                    core.decoder.feed(&buf[..n], &mut |f| frames.push(f.to_vec()));
                    for frame in frames {
                        self.handle_server_frame(&mut core, &frame);
                        if core.tcp.is_none() {
                            return;
                        }
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.close(&mut core, Some(format!("TCP receive failed: {err}")));
                    return;
                }
            }
        }
    }

    /// One SLIP frame off the TCP stream: an OSC message or bundle.
    fn handle_server_frame(&self, core: &mut NetCore, data: &[u8]) {
        match rosc::decoder::decode_udp(data) {
            Ok((_, packet)) => self.handle_server_packet(core, packet),
            Err(err) => {
                // a broken control stream is fatal for the session
                let message = format!("malformed server message: {err:?}");
                let _ = self.events.0.send(ClientEvent::Error {
                    message: message.clone(),
                });
                self.close(core, Some(message));
            }
        }
    }

    fn handle_server_packet(&self, core: &mut NetCore, packet: OscPacket) {
        match packet {
            OscPacket::Message(msg) => self.handle_server_message(core, &msg),
            OscPacket::Bundle(bundle) => {
                for packet in bundle.content {
                    self.handle_server_packet(core, packet);
                }
            }
        }
    }

    fn handle_server_message(&self, core: &mut NetCore, msg: &OscMessage) {
        let Some((role, _, verb)) = osc::parse_address(&msg.addr) else {
            warn!("not an AoO message: {}", msg.addr);
            return;
        };
        if role != Role::Client {
            warn!("not a client message: {}", msg.addr);
            return;
        }
        let result = match verb {
            "ping" => Ok(()),
            "login" => self.handle_login(core, msg),
            "peer/join" => self.handle_peer_join(msg),
            "peer/leave" => self.handle_peer_leave(msg),
            "group/join" => self.handle_group_reply(core, msg, PendingKind::GroupJoin),
            "group/leave" => self.handle_group_reply(core, msg, PendingKind::GroupLeave),
            other => {
                warn!("received unknown message '{}' from server", other);
                Ok(())
            }
        };
        if let Err(err) = result {
            let message = format!("bad '{verb}' message: {err}");
            let _ = self.events.0.send(ClientEvent::Error {
                message: message.clone(),
            });
            self.close(core, Some(message));
        }
    }

    /// `/aoo/client/login <status> (<user_id> | <errmsg>)`
    fn handle_login(&self, core: &mut NetCore, msg: &OscMessage) -> Result<()> {
        if self.state() != ClientState::Login {
            return Ok(());
        }
        let mut args = Args::new(msg);
        let status = args.int()?;
        if status > 0 {
            let user_id = args.int()?;
            let public = self.udp.lock().public_addr;
            let (Some(public_addr), Some(local_addr)) = (public, core.local_addr) else {
                error!("bug: login reply without addresses");
                return Ok(());
            };
            self.set_state(ClientState::Connected);
            debug!("successfully logged in (user id {})", user_id);
            if let Some(cb) = core.connect_cb.take() {
                cb(Ok(Reply::Connect(ConnectReply {
                    user_id,
                    public_addr,
                    local_addr,
                })));
            }
        } else {
            let errmsg = if args.remaining() > 0 {
                args.string()?.to_string()
            } else {
                "unknown error".to_string()
            };
            warn!("login failed: {}", errmsg);
            let cb = core.connect_cb.take();
            self.close(core, None);
            if let Some(cb) = cb {
                cb(Err(errmsg));
            }
        }
        Ok(())
    }

    /// `/aoo/client/peer/join <group> <user> <pub_ip> <pub_port> <loc_ip>
    /// <loc_port> <user_id>`
    fn handle_peer_join(&self, msg: &OscMessage) -> Result<()> {
        let mut args = Args::new(msg);
        let group = args.string()?.to_string();
        let user = args.string()?.to_string();
        let public_addr = parse_addr(args.string()?, args.int()?)?;
        let local_addr = parse_addr(args.string()?, args.int()?)?;
        let id = args.int()?;

        let mut peers = self.peers.write();
        if peers.iter().any(|p| p.matches_name(&group, &user)) {
            error!("peer {}|{} already added", group, user);
            return Ok(());
        }
        debug!("new peer {}|{} ({})", group, user, public_addr);
        peers.push(Arc::new(Peer::new(group, user, id, public_addr, local_addr)));
        // no event yet; it fires once the UDP handshake completes
        Ok(())
    }

    /// `/aoo/client/peer/leave <group> <user> <user_id>`
    fn handle_peer_leave(&self, msg: &OscMessage) -> Result<()> {
        let mut args = Args::new(msg);
        let group = args.string()?.to_string();
        let user = args.string()?.to_string();
        let id = args.int()?;

        let mut peers = self.peers.write();
        let Some(pos) = peers.iter().position(|p| p.matches_name(&group, &user)) else {
            error!("couldn't remove peer {}|{}", group, user);
            return Ok(());
        };
        let peer = peers.remove(pos);
        let _ = self.events.0.send(ClientEvent::PeerLeave {
            group,
            user,
            id,
            addr: peer.real_address(),
        });
        Ok(())
    }

    /// `/aoo/client/group/join <group> <status> [<errmsg>]` and the
    /// matching leave reply.
    fn handle_group_reply(
        &self,
        core: &mut NetCore,
        msg: &OscMessage,
        kind: PendingKind,
    ) -> Result<()> {
        let mut args = Args::new(msg);
        let group = args.string()?.to_string();
        let status = args.int()?;
        let errmsg = if args.remaining() > 0 {
            args.string()?.to_string()
        } else {
            String::new()
        };
        let Some(pos) = core
            .pending
            .iter()
            .position(|p| p.kind == kind && p.group == group)
        else {
            warn!("unexpected group reply for '{}'", group);
            return Ok(());
        };
        let pending = core.pending.remove(pos);
        if status > 0 {
            (pending.cb)(Ok(Reply::None));
        } else {
            let errmsg = if errmsg.is_empty() {
                "unknown error".to_string()
            } else {
                errmsg
            };
            (pending.cb)(Err(errmsg));
        }
        Ok(())
    }

    /// Periodic TCP work: keep-alive pings and request timeouts.
    fn tick_tcp(&self) {
        let now = now_secs();
        let mut core = self.core.lock();
        if self.state() == ClientState::Connected
            && core.tcp.is_some()
            && now - core.last_tcp_ping >= PING_INTERVAL
        {
            core.last_tcp_ping = now;
            match osc::encode(format!("{}/server/ping", osc::DOMAIN), vec![]) {
                Ok(bytes) => self.send_tcp(&mut core, &bytes),
                Err(err) => error!("couldn't encode ping: {}", err),
            }
        }
        let timed_out: Vec<Pending> = {
            let mut expired = Vec::new();
            let mut i = 0;
            while i < core.pending.len() {
                if core.pending[i].deadline <= now {
                    expired.push(core.pending.remove(i));
                } else {
                    i += 1;
                }
            }
            expired
        };
        drop(core);
        for pending in timed_out {
            (pending.cb)(Err("request timed out".into()));
        }
    }

    /// Handle one UDP datagram: server replies during the handshake and
    /// peer traffic afterwards.
    pub fn handle_message(&self, data: &[u8], from: SocketAddr) {
        let msg = match osc::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                // bad datagrams are dropped, the session survives
                debug!("malformed UDP message from {}: {}", from, err);
                return;
            }
        };
        let Some((role, _, verb)) = osc::parse_address(&msg.addr) else {
            warn!("not an AoO message: {}", msg.addr);
            return;
        };
        let is_server = *self.server_addr.read() == Some(from);
        if is_server {
            if role != Role::Client {
                warn!("not a server message: {}", msg.addr);
                return;
            }
            self.handle_server_udp(&msg, verb);
        } else {
            if role != Role::Peer {
                warn!("not a peer message: {}", msg.addr);
                return;
            }
            // a user in several groups shows up as several peers on one
            // endpoint; every match gets the message
            let peers = self.peers.read();
            let mut matched = false;
            for peer in peers.iter() {
                if peer.matches(from) {
                    peer.handle_message(&msg, verb, from, &self.events.0);
                    matched = true;
                }
            }
            if !matched {
                // expected during handshakes; pings may arrive before the
                // server told us about the peer
                debug!("ignoring UDP message {} from {}", msg.addr, from);
            }
        }
    }

    fn handle_server_udp(&self, msg: &OscMessage, verb: &str) {
        match verb {
            "ping" => debug!("got UDP ping from server"),
            "reply" => {
                let mut args = Args::new(msg);
                let public = (|| -> Result<SocketAddr> {
                    let ip = args.string()?;
                    let port = args.int()?;
                    parse_addr(ip, port)
                })();
                match public {
                    Ok(addr) => {
                        if self
                            .state
                            .compare_exchange(
                                ClientState::Handshake as u8,
                                ClientState::Login as u8,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            debug!("public endpoint is {}", addr);
                            self.udp.lock().public_addr = Some(addr);
                            let _ = self.commands.0.send(Command::Login);
                        }
                    }
                    Err(err) => warn!("bad /reply message: {}", err),
                }
            }
            other => warn!("received unknown UDP message '{}' from server", other),
        }
    }

    /// Periodic UDP sending: handshake probes, server keep-alive, queued
    /// peer messages and per-peer pings. Call this regularly from the
    /// thread that owns the UDP socket.
    pub fn send(&self, send_fn: &mut dyn FnMut(&[u8], SocketAddr)) {
        let state = self.state();
        if state == ClientState::Disconnected || state == ClientState::Connecting {
            return;
        }
        let now = now_secs();
        let server = *self.server_addr.read();

        if state == ClientState::Handshake {
            let mut udp = self.udp.lock();
            if udp.first_request_time == 0.0 {
                udp.first_request_time = now;
            } else if now - udp.first_request_time > REQUEST_TIMEOUT {
                drop(udp);
                let _ = self.commands.0.send(Command::HandshakeTimeout);
                return;
            }
            if now - udp.last_ping_time >= REQUEST_INTERVAL {
                udp.last_ping_time = now;
                if let Some(server) = server {
                    match osc::encode(format!("{}/server/request", osc::DOMAIN), vec![]) {
                        Ok(bytes) => send_fn(&bytes, server),
                        Err(err) => error!("couldn't encode request: {}", err),
                    }
                }
            }
            return;
        }

        if state == ClientState::Connected {
            {
                let mut udp = self.udp.lock();
                if now - udp.last_ping_time >= PING_INTERVAL {
                    udp.last_ping_time = now;
                    if let Some(server) = server {
                        match osc::encode(format!("{}/server/ping", osc::DOMAIN), vec![]) {
                            Ok(bytes) => send_fn(&bytes, server),
                            Err(err) => error!("couldn't encode ping: {}", err),
                        }
                    }
                }
            }

            // queued outgoing peer messages
            while let Ok(outgoing) = self.messages.1.try_recv() {
                let peers = self.peers.read();
                for peer in peers.iter() {
                    let wanted = match &outgoing.target {
                        Target::Peer(addr) => peer.matches(*addr),
                        Target::Group(group) => peer.group() == group,
                        Target::All => true,
                    };
                    if wanted {
                        peer.send_message(&outgoing.data, send_fn);
                    }
                }
            }
        }

        // peer keep-alive and handshake probing
        let peers = self.peers.read();
        for peer in peers.iter() {
            peer.send(
                now,
                PING_INTERVAL,
                REQUEST_INTERVAL,
                REQUEST_TIMEOUT,
                send_fn,
                &self.events.0,
            );
        }
    }
}

fn parse_addr(ip: &str, port: i32) -> Result<SocketAddr> {
    let ip = ip
        .parse()
        .map_err(|_| crate::Error::Osc(format!("bad IP address '{ip}'")))?;
    Ok(SocketAddr::new(ip, port as u16))
}
