//! OSC message helpers for the audio plane.
//!
//! The wire encoding itself is handled by `rosc`; this module adds the
//! `/aoo` address scheme (role + numeric id + verb) and a small typed
//! argument reader.

use rosc::{OscMessage, OscPacket, OscType};

use crate::error::{Error, Result};
use crate::time::TimeTag;
use crate::types::{EndpointId, WILDCARD_ID};

pub const DOMAIN: &str = "/aoo";

/// Role of the addressed endpoint in an `/aoo` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Sink,
    Server,
    Client,
    Peer,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Sink => "sink",
            Role::Server => "server",
            Role::Client => "client",
            Role::Peer => "peer",
        }
    }
}

// audio plane verbs
pub const MSG_DATA: &str = "data";
pub const MSG_FORMAT: &str = "format";
pub const MSG_REQUEST: &str = "request";
pub const MSG_RESEND: &str = "resend";
pub const MSG_PING: &str = "ping";
pub const MSG_INVITE: &str = "invite";
pub const MSG_UNINVITE: &str = "uninvite";

/// Build an address like `/aoo/sink/7/data`.
pub fn address(role: Role, id: EndpointId, verb: &str) -> String {
    if id == WILDCARD_ID {
        format!("{}/{}/*/{}", DOMAIN, role.as_str(), verb)
    } else {
        format!("{}/{}/{}/{}", DOMAIN, role.as_str(), id, verb)
    }
}

/// Encode a single OSC message to wire bytes.
pub fn encode(addr: String, args: Vec<OscType>) -> Result<Vec<u8>> {
    let packet = OscPacket::Message(OscMessage { addr, args });
    Ok(rosc::encoder::encode(&packet)?)
}

/// Decode one datagram into a single OSC message. Bundles are only used on
/// the control plane and are rejected here.
pub fn decode(data: &[u8]) -> Result<OscMessage> {
    let (_, packet) = rosc::decoder::decode_udp(data)?;
    match packet {
        OscPacket::Message(msg) => Ok(msg),
        OscPacket::Bundle(_) => Err(Error::Osc("unexpected OSC bundle".into())),
    }
}

/// Split an `/aoo/<role>/<id>/<verb>` address into its parts.
/// Returns `None` for addresses outside the `/aoo` scheme.
pub fn parse_address(addr: &str) -> Option<(Role, EndpointId, &str)> {
    let rest = addr.strip_prefix(DOMAIN)?.strip_prefix('/')?;
    let (role_str, rest) = rest.split_once('/')?;
    let role = match role_str {
        "source" => Role::Source,
        "sink" => Role::Sink,
        "server" => Role::Server,
        "client" => Role::Client,
        "peer" => Role::Peer,
        _ => return None,
    };
    match role {
        Role::Source | Role::Sink => {
            let (id_str, verb) = rest.split_once('/')?;
            let id = if id_str == "*" {
                WILDCARD_ID
            } else {
                id_str.parse().ok()?
            };
            Some((role, id, verb))
        }
        // control plane addresses carry no numeric id
        _ => Some((role, WILDCARD_ID, rest)),
    }
}

/// Typed reader over the argument list of a received message.
pub struct Args<'a> {
    iter: std::slice::Iter<'a, OscType>,
}

impl<'a> Args<'a> {
    pub fn new(msg: &'a OscMessage) -> Self {
        Self {
            iter: msg.args.iter(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.iter.len()
    }

    fn next(&mut self) -> Result<&'a OscType> {
        self.iter
            .next()
            .ok_or_else(|| Error::Osc("missing argument".into()))
    }

    pub fn int(&mut self) -> Result<i32> {
        match self.next()? {
            OscType::Int(i) => Ok(*i),
            other => Err(Error::Osc(format!("expected int, got {other:?}"))),
        }
    }

    pub fn double(&mut self) -> Result<f64> {
        match self.next()? {
            OscType::Double(d) => Ok(*d),
            OscType::Float(f) => Ok(*f as f64),
            other => Err(Error::Osc(format!("expected double, got {other:?}"))),
        }
    }

    pub fn string(&mut self) -> Result<&'a str> {
        match self.next()? {
            OscType::String(s) => Ok(s.as_str()),
            other => Err(Error::Osc(format!("expected string, got {other:?}"))),
        }
    }

    pub fn blob(&mut self) -> Result<&'a [u8]> {
        match self.next()? {
            OscType::Blob(b) => Ok(b.as_slice()),
            other => Err(Error::Osc(format!("expected blob, got {other:?}"))),
        }
    }

    pub fn time(&mut self) -> Result<TimeTag> {
        match self.next()? {
            OscType::Time(t) => Ok((*t).into()),
            other => Err(Error::Osc(format!("expected time tag, got {other:?}"))),
        }
    }
}
