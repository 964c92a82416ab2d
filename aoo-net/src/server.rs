//! Rendezvous server: authenticates clients over TCP, answers UDP
//! address-discovery requests, and introduces group members to each other
//! so they can negotiate direct UDP paths.
//!
//! Single threaded: one poll loop over the TCP listener, the accepted
//! connections and the UDP socket, all non-blocking.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use aoo::osc::{self, Args, Role};

use crate::error::{Error, Result};
use crate::slip;

const POLL_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Accept the relay flag at the boundary; relaying itself is handled
    /// elsewhere.
    pub relay: bool,
}

struct UserRecord {
    password: String,
    id: i32,
}

#[derive(Default)]
struct GroupRecord {
    password: String,
    /// Connection tokens of the current members.
    members: Vec<u64>,
}

struct LoginInfo {
    name: String,
    id: i32,
    /// Addresses as sent in the login message: public first, local
    /// second.
    addresses: Vec<(String, i32)>,
    groups: Vec<String>,
}

struct ClientConn {
    token: u64,
    stream: TcpStream,
    addr: SocketAddr,
    decoder: slip::Decoder,
    login: Option<LoginInfo>,
    alive: bool,
}

/// The rendezvous server.
pub struct Server {
    tcp: TcpListener,
    udp: UdpSocket,
    options: ServerOptions,
    clients: Vec<ClientConn>,
    users: HashMap<String, UserRecord>,
    groups: HashMap<String, GroupRecord>,
    next_user_id: i32,
    next_token: u64,
    quit: Arc<AtomicBool>,
}

impl Server {
    /// Bind the TCP listener and UDP responder on `port` (0 picks an
    /// ephemeral port shared by both).
    pub fn new(port: u16, options: ServerOptions) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
        socket.bind(&bind_addr.into())?;
        socket.listen(32)?;
        let tcp: TcpListener = socket.into();
        tcp.set_nonblocking(true)?;

        let actual_port = tcp.local_addr()?.port();
        let udp = UdpSocket::bind(("0.0.0.0", actual_port))?;
        udp.set_nonblocking(true)?;

        info!(
            "listening on port {} (relay {})",
            actual_port,
            if options.relay { "on" } else { "off" }
        );
        Ok(Self {
            tcp,
            udp,
            options,
            clients: Vec::new(),
            users: HashMap::new(),
            groups: HashMap::new(),
            next_user_id: 0,
            next_token: 0,
            quit: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn port(&self) -> u16 {
        self.tcp.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn relay_enabled(&self) -> bool {
        self.options.relay
    }

    /// Flag that stops [`Server::run`] at its next iteration.
    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        self.quit.clone()
    }

    /// Poll loop; returns when the quit flag is set.
    pub fn run(&mut self) -> Result<()> {
        while !self.quit.load(Ordering::Acquire) {
            self.accept_clients();
            self.receive_udp();
            self.receive_tcp();
            self.reap_closed();
            std::thread::sleep(POLL_SLEEP);
        }
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.tcp.accept() {
                Ok((stream, addr)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        warn!("couldn't configure client socket: {}", err);
                        continue;
                    }
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!("couldn't set TCP_NODELAY: {}", err);
                    }
                    debug!("accepted client from {}", addr);
                    let token = self.next_token;
                    self.next_token += 1;
                    self.clients.push(ClientConn {
                        token,
                        stream,
                        addr,
                        decoder: slip::Decoder::new(),
                        login: None,
                        alive: true,
                    });
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    break;
                }
            }
        }
    }

    /// UDP handshake traffic: `/aoo/server/request` and `/aoo/server/ping`.
    fn receive_udp(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.udp.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Err(err) = self.handle_udp_message(&buf[..n], from) {
                        debug!("bad UDP message from {}: {}", from, err);
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("UDP receive failed: {}", err);
                    break;
                }
            }
        }
    }

    fn handle_udp_message(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        let msg = osc::decode(data)?;
        let Some((role, _, verb)) = osc::parse_address(&msg.addr) else {
            return Err(Error::Osc(format!("not an AoO message: {}", msg.addr)));
        };
        if role != Role::Server {
            return Err(Error::Osc(format!("not a server message: {}", msg.addr)));
        }
        match verb {
            "ping" => {
                let reply = osc::encode(format!("{}/client/ping", osc::DOMAIN), vec![])?;
                let _ = self.udp.send_to(&reply, from);
            }
            "request" => {
                // tell the client how the world sees it
                let reply = osc::encode(
                    format!("{}/client/reply", osc::DOMAIN),
                    vec![
                        OscType::String(from.ip().to_string()),
                        OscType::Int(from.port() as i32),
                    ],
                )?;
                let _ = self.udp.send_to(&reply, from);
            }
            other => {
                warn!("unknown UDP message '{}' from {}", other, from);
            }
        }
        Ok(())
    }

    fn receive_tcp(&mut self) {
        for i in 0..self.clients.len() {
            let mut frames: Vec<Vec<u8>> = Vec::new();
            {
                let conn = &mut self.clients[i];
                if !conn.alive {
                    continue;
                }
                let mut buf = [0u8; 4096];
                loop {
                    match conn.stream.read(&mut buf) {
                        Ok(0) => {
                            debug!("client {} closed the connection", conn.addr);
                            conn.alive = false;
                            break;
                        }
                        Ok(n) => {
                            conn.decoder.feed(&buf[..n], &mut |f| frames.push(f.to_vec()));
                        }
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            warn!("client {} receive failed: {}", conn.addr, err);
                            conn.alive = false;
                            break;
                        }
                    }
                }
            }
            for frame in frames {
                self.handle_client_frame(i, &frame);
            }
        }
    }

    fn handle_client_frame(&mut self, idx: usize, data: &[u8]) {
        match rosc::decoder::decode_udp(data) {
            Ok((_, packet)) => self.handle_client_packet(idx, packet),
            Err(err) => {
                warn!(
                    "malformed message from {}: {:?}; closing connection",
                    self.clients[idx].addr, err
                );
                self.clients[idx].alive = false;
            }
        }
    }

    fn handle_client_packet(&mut self, idx: usize, packet: OscPacket) {
        match packet {
            OscPacket::Message(msg) => self.handle_client_message(idx, &msg),
            OscPacket::Bundle(bundle) => {
                for packet in bundle.content {
                    self.handle_client_packet(idx, packet);
                }
            }
        }
    }

    fn handle_client_message(&mut self, idx: usize, msg: &OscMessage) {
        let Some((role, _, verb)) = osc::parse_address(&msg.addr) else {
            warn!("not an AoO message: {}", msg.addr);
            return;
        };
        if role != Role::Server {
            warn!("not a server message: {}", msg.addr);
            return;
        }
        let result = match verb {
            "ping" => self.handle_ping(idx),
            "login" => self.handle_login(idx, msg),
            "group/join" => self.handle_group_join(idx, msg),
            "group/leave" => self.handle_group_leave(idx, msg),
            other => {
                warn!("unknown message '{}' from {}", other, self.clients[idx].addr);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("bad '{}' message from {}: {}", verb, self.clients[idx].addr, err);
        }
    }

    fn handle_ping(&mut self, idx: usize) -> Result<()> {
        let reply = osc::encode(format!("{}/client/ping", osc::DOMAIN), vec![])?;
        self.send_to_client(idx, &reply);
        Ok(())
    }

    /// `/aoo/server/login <user> <pwd> (<ip> <port>)+` — the public
    /// address pair first, the local one second.
    fn handle_login(&mut self, idx: usize, msg: &OscMessage) -> Result<()> {
        let mut args = Args::new(msg);
        let name = args.string()?.to_string();
        let password = args.string()?.to_string();
        let mut addresses = Vec::new();
        while args.remaining() >= 2 {
            let ip = args.string()?.to_string();
            let port = args.int()?;
            addresses.push((ip, port));
        }

        let mut status = 0;
        let mut user_id = 0;
        let mut errmsg = String::new();

        if self.clients[idx].login.is_some() {
            errmsg = "already logged in".into();
        } else if self
            .clients
            .iter()
            .any(|c| c.alive && c.login.as_ref().map(|l| l.name == name).unwrap_or(false))
        {
            errmsg = "user already logged in".into();
        } else {
            let next_id = self.next_user_id;
            let mut created = false;
            let record = self.users.entry(name.clone()).or_insert_with(|| {
                created = true;
                UserRecord {
                    password: password.clone(),
                    id: next_id,
                }
            });
            if record.password != password {
                errmsg = "wrong password".into();
            } else {
                status = 1;
                user_id = record.id;
            }
            if created {
                self.next_user_id += 1;
            }
            if status > 0 {
                info!("user '{}' logged in (id {})", name, user_id);
                self.clients[idx].login = Some(LoginInfo {
                    name,
                    id: user_id,
                    addresses,
                    groups: Vec::new(),
                });
            }
        }

        let mut reply_args = vec![OscType::Int(status)];
        if status > 0 {
            reply_args.push(OscType::Int(user_id));
        } else {
            reply_args.push(OscType::String(errmsg));
        }
        let reply = osc::encode(format!("{}/client/login", osc::DOMAIN), reply_args)?;
        self.send_to_client(idx, &reply);
        Ok(())
    }

    /// `/aoo/server/group/join <group> <pwd>`
    fn handle_group_join(&mut self, idx: usize, msg: &OscMessage) -> Result<()> {
        let mut args = Args::new(msg);
        let name = args.string()?.to_string();
        let password = args.string()?.to_string();

        let mut status = 0;
        let mut errmsg = String::new();
        let token = self.clients[idx].token;

        if self.clients[idx].login.is_none() {
            errmsg = "not logged in".into();
        } else {
            let group = self.groups.entry(name.clone()).or_insert_with(|| GroupRecord {
                password: password.clone(),
                members: Vec::new(),
            });
            if group.password != password {
                errmsg = "wrong password".into();
            } else if group.members.contains(&token) {
                errmsg = "already a group member".into();
            } else {
                group.members.push(token);
                status = 1;
            }
        }

        if status > 0 {
            if let Some(login) = self.clients[idx].login.as_mut() {
                login.groups.push(name.clone());
                info!("user '{}' joined group '{}'", login.name, name);
            }
            self.notify_group_join(idx, &name);
        }

        let reply = osc::encode(
            format!("{}/client/group/join", osc::DOMAIN),
            vec![
                OscType::String(name),
                OscType::Int(status),
                OscType::String(errmsg),
            ],
        )?;
        self.send_to_client(idx, &reply);
        Ok(())
    }

    /// `/aoo/server/group/leave <group>`
    fn handle_group_leave(&mut self, idx: usize, msg: &OscMessage) -> Result<()> {
        let mut args = Args::new(msg);
        let name = args.string()?.to_string();

        let mut status = 0;
        let mut errmsg = String::new();
        let token = self.clients[idx].token;

        if self.clients[idx].login.is_none() {
            errmsg = "not logged in".into();
        } else {
            match self.groups.get_mut(&name) {
                Some(group) => {
                    if let Some(pos) = group.members.iter().position(|&t| t == token) {
                        group.members.remove(pos);
                        status = 1;
                    } else {
                        errmsg = "not a group member".into();
                    }
                }
                None => errmsg = "couldn't find group".into(),
            }
        }

        if status > 0 {
            if let Some(login) = self.clients[idx].login.as_mut() {
                login.groups.retain(|g| g != &name);
                info!("user '{}' left group '{}'", login.name, name);
            }
            self.notify_group_leave(idx, &name);
        }

        let reply = osc::encode(
            format!("{}/client/group/leave", osc::DOMAIN),
            vec![
                OscType::String(name),
                OscType::Int(status),
                OscType::String(errmsg),
            ],
        )?;
        self.send_to_client(idx, &reply);
        Ok(())
    }

    /// Introduce a new member and the existing members to each other.
    fn notify_group_join(&mut self, idx: usize, group: &str) {
        let token = self.clients[idx].token;
        let members: Vec<u64> = match self.groups.get(group) {
            Some(g) => g.members.iter().copied().filter(|&t| t != token).collect(),
            None => return,
        };
        for other in members {
            let Some(other_idx) = self.clients.iter().position(|c| c.token == other) else {
                continue;
            };
            if let Some(bytes) = self.peer_join_message(group, other_idx) {
                self.send_to_client(idx, &bytes);
            }
            if let Some(bytes) = self.peer_join_message(group, idx) {
                self.send_to_client(other_idx, &bytes);
            }
        }
    }

    /// Tell the remaining members that a peer left.
    fn notify_group_leave(&mut self, idx: usize, group: &str) {
        let token = self.clients[idx].token;
        let Some(login) = self.clients[idx].login.as_ref() else {
            return;
        };
        let (name, id) = (login.name.clone(), login.id);
        let members: Vec<u64> = match self.groups.get(group) {
            Some(g) => g.members.iter().copied().filter(|&t| t != token).collect(),
            None => return,
        };
        let bytes = match osc::encode(
            format!("{}/client/peer/leave", osc::DOMAIN),
            vec![
                OscType::String(group.to_string()),
                OscType::String(name),
                OscType::Int(id),
            ],
        ) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("couldn't encode peer/leave: {}", err);
                return;
            }
        };
        for other in members {
            if let Some(other_idx) = self.clients.iter().position(|c| c.token == other) {
                self.send_to_client(other_idx, &bytes);
            }
        }
    }

    /// `/aoo/client/peer/join <group> <user> <pub_ip> <pub_port> <loc_ip>
    /// <loc_port> <user_id>` describing the client at `about`.
    fn peer_join_message(&self, group: &str, about: usize) -> Option<Vec<u8>> {
        let login = self.clients[about].login.as_ref()?;
        if login.addresses.len() < 2 {
            warn!("user '{}' logged in without both addresses", login.name);
            return None;
        }
        let mut args = vec![
            OscType::String(group.to_string()),
            OscType::String(login.name.clone()),
        ];
        for (ip, port) in login.addresses.iter().take(2) {
            args.push(OscType::String(ip.clone()));
            args.push(OscType::Int(*port));
        }
        args.push(OscType::Int(login.id));
        match osc::encode(format!("{}/client/peer/join", osc::DOMAIN), args) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!("couldn't encode peer/join: {}", err);
                None
            }
        }
    }

    fn send_to_client(&mut self, idx: usize, payload: &[u8]) {
        let framed = slip::encode(payload);
        let conn = &mut self.clients[idx];
        if let Err(err) = conn.stream.write_all(&framed) {
            warn!("send to {} failed: {}", conn.addr, err);
            conn.alive = false;
        }
    }

    /// Drop closed connections, removing them from their groups with
    /// leave notifications.
    fn reap_closed(&mut self) {
        loop {
            let Some(idx) = self.clients.iter().position(|c| !c.alive) else {
                break;
            };
            let token = self.clients[idx].token;
            let groups: Vec<String> = self.clients[idx]
                .login
                .as_ref()
                .map(|l| l.groups.clone())
                .unwrap_or_default();
            for group in groups {
                if let Some(record) = self.groups.get_mut(&group) {
                    record.members.retain(|&t| t != token);
                }
                self.notify_group_leave(idx, &group);
            }
            if let Some(login) = self.clients[idx].login.as_ref() {
                info!("user '{}' disconnected", login.name);
            }
            self.clients.remove(idx);
        }
    }
}
