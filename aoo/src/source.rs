//! Source engine: format negotiation, frame-based encoding and
//! fragmentation into OSC data packets, retransmission history and
//! ping/invitation accounting.
//!
//! Threading: `process()` runs on the RT audio context and never blocks;
//! `handle_message()` and `send()` run on the network context;
//! `poll_events()` runs wherever the host drains events. Audio travels
//! from RT to network through lock-free SPSC rings.

use std::net::SocketAddr;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use rosc::OscType;
use tracing::{debug, warn};

use crate::buffer::{DynamicResampler, HistoryBuffer};
use crate::codec::{self, Encoder};
use crate::error::{Error, Result};
use crate::event::SourceEvent;
use crate::osc::{self, Args, Role};
use crate::time::{TimeDll, TimeTag};
use crate::types::{Endpoint, EndpointId, Format, WILDCARD_ID};
use crate::{DATA_HEADER_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE};

/// Source configuration, fixed at `setup()`.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Depth of the audio FIFO between the RT and network contexts.
    pub buffer_ms: i32,
    /// Depth of the retransmission history; 0 disables resending.
    pub resend_buffer_ms: i32,
    /// UDP packet size budget for data messages.
    pub packet_size: i32,
    /// Time-DLL bandwidth in (0, 1].
    pub time_filter_bandwidth: f64,
    /// Accept `/invite` and `/uninvite` without asking the host.
    pub auto_accept_invites: bool,
    /// Ping interval towards the sinks, seconds.
    pub ping_interval: f64,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            buffer_ms: 10,
            resend_buffer_ms: 1000,
            packet_size: 512,
            time_filter_bandwidth: 0.012,
            auto_accept_invites: false,
            ping_interval: 5.0,
        }
    }
}

/// One sink in the roster.
struct SinkDesc {
    endpoint: Endpoint,
    channel: i32,
    format_changed: bool,
}

/// State owned by the RT audio context.
struct RtState {
    samplerate: i32,
    blocksize: i32,
    nchannels: i32,
    bandwidth: f64,
    dll: TimeDll,
    start_time: f64,
    started: bool,
    enc_samplerate: i32,
    enc_blocksize: i32,
    resampler: DynamicResampler,
    bypass_resampler: bool,
    audio: Option<HeapProd<f32>>,
    srates: Option<HeapProd<f64>>,
    interleave: Vec<f32>,
    block: Vec<f32>,
}

/// State owned by the network context.
struct NetState {
    encoder: Option<Box<dyn Encoder>>,
    salt: i32,
    sequence: i32,
    history: HistoryBuffer,
    audio: Option<HeapCons<f32>>,
    srates: Option<HeapCons<f64>>,
    samples: Vec<f32>,
    wire: Vec<u8>,
    last_ping_time: f64,
}

/// The source endpoint engine.
pub struct Source {
    id: EndpointId,
    opts: RwLock<SourceOptions>,
    rt: Mutex<RtState>,
    net: Mutex<NetState>,
    sinks: RwLock<Vec<SinkDesc>>,
    events: (Sender<SourceEvent>, Receiver<SourceEvent>),
}

fn make_salt() -> i32 {
    rand::random()
}

/// Number of FIFO slots covering `ms` milliseconds of audio at the given
/// rate and block size, rounded up, at least one.
fn buffer_blocks(ms: i32, samplerate: i32, blocksize: i32) -> usize {
    let samples = ms.max(0) as f64 * samplerate as f64 * 0.001;
    ((samples / blocksize as f64).ceil() as usize).max(1)
}

impl Source {
    pub fn new(id: EndpointId) -> Self {
        Self {
            id,
            opts: RwLock::new(SourceOptions::default()),
            rt: Mutex::new(RtState {
                samplerate: 0,
                blocksize: 0,
                nchannels: 0,
                bandwidth: 0.012,
                dll: TimeDll::default(),
                start_time: 0.0,
                started: false,
                enc_samplerate: 0,
                enc_blocksize: 0,
                resampler: DynamicResampler::new(),
                bypass_resampler: true,
                audio: None,
                srates: None,
                interleave: Vec::new(),
                block: Vec::new(),
            }),
            net: Mutex::new(NetState {
                encoder: None,
                salt: make_salt(),
                sequence: 0,
                history: HistoryBuffer::new(0),
                audio: None,
                srates: None,
                samples: Vec::new(),
                wire: Vec::new(),
                last_ping_time: 0.0,
            }),
            sinks: RwLock::new(Vec::new()),
            events: unbounded(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// (Re)configure for the host stream format. Legal to call between
    /// audio ticks.
    pub fn setup(
        &self,
        samplerate: i32,
        blocksize: i32,
        nchannels: i32,
        opts: SourceOptions,
    ) -> Result<()> {
        if samplerate < 1 || blocksize < 1 || nchannels < 1 {
            return Err(Error::InvalidArgument(format!(
                "bad stream setup: {samplerate} Hz, {blocksize} frames, {nchannels} ch"
            )));
        }
        let mut opts = opts;
        if opts.packet_size < MIN_PACKET_SIZE {
            warn!("packet size too small, clamping to {}", MIN_PACKET_SIZE);
            opts.packet_size = MIN_PACKET_SIZE;
        } else if opts.packet_size > MAX_PACKET_SIZE {
            warn!("packet size too large, clamping to {}", MAX_PACKET_SIZE);
            opts.packet_size = MAX_PACKET_SIZE;
        }
        *self.opts.write() = opts;

        let mut rt = self.rt.lock();
        let mut net = self.net.lock();
        rt.samplerate = samplerate;
        rt.blocksize = blocksize;
        rt.nchannels = nchannels;
        rt.bandwidth = self.opts.read().time_filter_bandwidth;
        rt.started = false;
        rt.interleave = vec![0.0; (blocksize * nchannels) as usize];
        if net.encoder.is_some() {
            self.update(&mut rt, &mut net);
        }
        Ok(())
    }

    /// Select the stream format. Creates or reconfigures the encoder,
    /// bumps the stream salt and schedules a format message to every sink.
    pub fn set_format(&self, fmt: Format) -> Result<Format> {
        let mut rt = self.rt.lock();
        let mut net = self.net.lock();

        let recreate = match &net.encoder {
            Some(enc) => enc.format().map(|f| f.codec != fmt.codec).unwrap_or(true),
            None => true,
        };
        if recreate {
            let codec = codec::find_codec(&fmt.codec)
                .ok_or_else(|| Error::UnsupportedCodec(fmt.codec.clone()))?;
            net.encoder = Some(codec.create_encoder());
        }
        let encoder = net.encoder.as_mut().unwrap();
        encoder.setup(&fmt)?;
        let adjusted = encoder.format().unwrap().clone();

        net.salt = make_salt();
        net.sequence = 0;
        self.update(&mut rt, &mut net);

        for sink in self.sinks.write().iter_mut() {
            sink.format_changed = true;
        }
        Ok(adjusted)
    }

    /// Current encoder format, if a format has been set.
    pub fn format(&self) -> Option<Format> {
        self.net.lock().encoder.as_ref().and_then(|e| e.format().cloned())
    }

    /// Rebuild queues, resampler and history for the current host format
    /// and encoder format. Both locks are held by the caller.
    fn update(&self, rt: &mut RtState, net: &mut NetState) {
        let Some(fmt) = net.encoder.as_ref().and_then(|e| e.format().cloned()) else {
            return;
        };
        if rt.samplerate < 1 || rt.blocksize < 1 || rt.nchannels < 1 {
            return;
        }
        let opts = self.opts.read().clone();
        let nsamples = fmt.block_samples();
        let nbuffers = buffer_blocks(opts.buffer_ms, fmt.samplerate, fmt.blocksize);

        let (audio_prod, audio_cons) = HeapRb::<f32>::new(nbuffers * nsamples).split();
        let (sr_prod, sr_cons) = HeapRb::<f64>::new(nbuffers).split();
        rt.audio = Some(audio_prod);
        rt.srates = Some(sr_prod);
        net.audio = Some(audio_cons);
        net.srates = Some(sr_cons);

        rt.enc_samplerate = fmt.samplerate;
        rt.enc_blocksize = fmt.blocksize;
        rt.bypass_resampler = fmt.blocksize == rt.blocksize && fmt.samplerate == rt.samplerate;
        if !rt.bypass_resampler {
            rt.resampler.setup(
                rt.blocksize,
                fmt.blocksize,
                rt.samplerate,
                fmt.samplerate,
                rt.nchannels,
            );
        } else {
            rt.resampler.clear();
        }
        rt.block = vec![0.0; nsamples];

        // an empty history disables retransmission
        let history_blocks = if opts.resend_buffer_ms > 0 {
            buffer_blocks(opts.resend_buffer_ms, fmt.samplerate, fmt.blocksize)
        } else {
            0
        };
        net.history.resize(history_blocks);
        net.samples = vec![0.0; nsamples];
        net.wire = vec![0; nsamples * 8 + 64];
        debug!(
            "source update: {} fifo blocks, {} history blocks",
            nbuffers, history_blocks
        );
    }

    /// Add a sink to the roster and schedule a format message for it.
    pub fn add_sink(&self, endpoint: Endpoint, channel: i32) {
        if endpoint.id == WILDCARD_ID {
            // replace all existing descriptors for this address
            self.remove_sink(Endpoint::new(endpoint.addr, WILDCARD_ID));
        }
        let mut sinks = self.sinks.write();
        if sinks.iter().any(|s| s.endpoint == endpoint) {
            warn!("sink {} already added", endpoint);
            return;
        }
        sinks.push(SinkDesc {
            endpoint,
            channel: channel.max(0),
            format_changed: true,
        });
    }

    /// Remove one sink, or every sink at an address when the id is the
    /// wildcard.
    pub fn remove_sink(&self, endpoint: Endpoint) {
        let mut sinks = self.sinks.write();
        if endpoint.id == WILDCARD_ID {
            sinks.retain(|s| s.endpoint.addr != endpoint.addr);
        } else {
            let before = sinks.len();
            sinks.retain(|s| s.endpoint != endpoint);
            if sinks.len() == before {
                warn!("sink {} not found", endpoint);
            }
        }
    }

    pub fn remove_all(&self) {
        self.sinks.write().clear();
    }

    /// Change the channel offset at which a sink mixes this stream.
    pub fn set_sink_channel(&self, endpoint: Endpoint, channel: i32) {
        if channel < 0 {
            warn!("channel offset {} out of range", channel);
            return;
        }
        let mut sinks = self.sinks.write();
        for sink in sinks.iter_mut() {
            if sink.endpoint.addr == endpoint.addr
                && (endpoint.id == WILDCARD_ID || sink.endpoint.id == endpoint.id)
            {
                sink.channel = channel;
            }
        }
    }

    /// Handle one incoming OSC message addressed to this source.
    /// Replies (format resends, retransmitted frames) go out through
    /// `reply`.
    pub fn handle_message(
        &self,
        data: &[u8],
        from: SocketAddr,
        reply: &mut dyn FnMut(&[u8]),
    ) {
        let msg = match osc::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("malformed OSC message from {}: {}", from, err);
                return;
            }
        };
        let Some((role, id, verb)) = osc::parse_address(&msg.addr) else {
            warn!("not an AoO message: {}", msg.addr);
            return;
        };
        if role != Role::Source {
            warn!("not a source message: {}", msg.addr);
            return;
        }
        if id != self.id && id != WILDCARD_ID {
            warn!("wrong source id {}", id);
            return;
        }
        let mut args = Args::new(&msg);
        let result = match verb {
            osc::MSG_REQUEST => self.handle_request(&mut args, from, reply),
            osc::MSG_RESEND => self.handle_resend(&mut args, from, reply),
            osc::MSG_PING => self.handle_ping(&mut args, from),
            osc::MSG_INVITE => self.handle_invite(&mut args, from, true),
            osc::MSG_UNINVITE => self.handle_invite(&mut args, from, false),
            other => {
                warn!("unknown message '{}'", other);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("bad '{}' message from {}: {}", verb, from, err);
        }
    }

    /// `/aoo/source/<id>/request <sink_id>`: first contact from a sink.
    fn handle_request(
        &self,
        args: &mut Args,
        from: SocketAddr,
        reply: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let sink_id = args.int()?;
        let endpoint = Endpoint::new(from, sink_id);
        let known = self.sinks.read().iter().any(|s| s.endpoint == endpoint);
        if !known {
            self.add_sink(endpoint, 0);
        }
        // the last format message might have been lost; resend right away
        if let Some(bytes) = self.make_format_message(endpoint.id)? {
            reply(&bytes);
            let mut sinks = self.sinks.write();
            if let Some(sink) = sinks.iter_mut().find(|s| s.endpoint == endpoint) {
                sink.format_changed = false;
            }
        }
        Ok(())
    }

    /// `/aoo/source/<id>/resend <sink_id> <salt> (<seq> <frame>)+`
    fn handle_resend(
        &self,
        args: &mut Args,
        from: SocketAddr,
        reply: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let net = self.net.lock();
        if net.history.capacity() == 0 {
            return Ok(());
        }
        let sink_id = args.int()?;
        let salt = args.int()?;
        let endpoint = Endpoint::new(from, sink_id);
        let channel = {
            let sinks = self.sinks.read();
            match sinks.iter().find(|s| s.endpoint == endpoint) {
                Some(sink) => sink.channel,
                None => {
                    debug!("ignoring /resend: sink {} not found", endpoint);
                    return Ok(());
                }
            }
        };
        if salt != net.salt {
            debug!("ignoring /resend: source has changed");
            return Ok(());
        }
        while args.remaining() >= 2 {
            let seq = args.int()?;
            let frame = args.int()?;
            let Some(block) = net.history.find(seq) else {
                debug!("couldn't find block {}", seq);
                continue;
            };
            let frames: Vec<i32> = if frame < 0 {
                (0..block.num_frames()).collect()
            } else {
                vec![frame]
            };
            for f in frames {
                let Some(payload) = block.frame(f) else {
                    warn!("frame {} of block {} out of range", f, seq);
                    continue;
                };
                let bytes = data_message(
                    sink_id,
                    self.id,
                    net.salt,
                    block.sequence,
                    block.samplerate,
                    channel,
                    block.size(),
                    block.num_frames(),
                    f,
                    payload,
                )?;
                reply(&bytes);
            }
        }
        Ok(())
    }

    /// `/aoo/source/<id>/ping <sink_id> [<tt>]`
    fn handle_ping(&self, args: &mut Args, from: SocketAddr) -> Result<()> {
        let sink_id = args.int()?;
        let endpoint = Endpoint::new(from, sink_id);
        if !self.sinks.read().iter().any(|s| s.endpoint == endpoint) {
            warn!("received ping from unknown sink {}", endpoint);
            return Ok(());
        }
        let tt = if args.remaining() > 0 {
            args.time()?
        } else {
            TimeTag(0)
        };
        let _ = self.events.0.send(SourceEvent::Ping { endpoint, tt });
        Ok(())
    }

    /// `/aoo/source/<id>/invite <sink_id>` and `/uninvite`.
    fn handle_invite(&self, args: &mut Args, from: SocketAddr, invite: bool) -> Result<()> {
        let sink_id = args.int()?;
        let endpoint = Endpoint::new(from, sink_id);
        if self.opts.read().auto_accept_invites {
            if invite {
                self.add_sink(endpoint, 0);
            } else {
                self.remove_sink(endpoint);
            }
        } else {
            let event = if invite {
                SourceEvent::Invite { endpoint }
            } else {
                SourceEvent::Uninvite { endpoint }
            };
            let _ = self.events.0.send(event);
        }
        Ok(())
    }

    /// Feed one host block. Returns true when new data is queued for the
    /// network context.
    pub fn process(&self, data: &[&[f32]], tt: TimeTag) -> bool {
        // never block the audio thread; skip the tick on contention
        let Some(mut rt) = self.rt.try_lock() else {
            return false;
        };
        let rt = &mut *rt;
        if rt.samplerate < 1 {
            return false;
        }

        if !rt.started {
            rt.start_time = tt.to_seconds();
            let (sr, bs, bw) = (rt.samplerate as f64, rt.blocksize, rt.bandwidth);
            rt.dll.setup(sr, bs, bw, 0.0);
            rt.started = true;
        } else {
            let elapsed = tt.to_seconds() - rt.start_time;
            rt.dll.update(elapsed);
        }

        let (Some(audio), Some(srates)) = (rt.audio.as_mut(), rt.srates.as_mut()) else {
            return false;
        };

        let nchannels = rt.nchannels as usize;
        let blocksize = rt.blocksize as usize;
        if data.len() < nchannels || data.iter().take(nchannels).any(|c| c.len() < blocksize) {
            return false;
        }
        // non-interleaved -> interleaved
        for (i, channel) in data.iter().take(nchannels).enumerate() {
            for (j, &sample) in channel.iter().take(blocksize).enumerate() {
                rt.interleave[j * nchannels + i] = sample;
            }
        }

        let out_samples = rt.block.len();
        if rt.bypass_resampler {
            if audio.vacant_len() >= out_samples && srates.vacant_len() >= 1 {
                audio.push_slice(&rt.interleave);
                let _ = srates.try_push(rt.dll.samplerate());
                true
            } else {
                false
            }
        } else {
            if !rt.resampler.write(&rt.interleave) {
                return false;
            }
            let ratio = rt.enc_samplerate as f64 / rt.samplerate as f64;
            while audio.vacant_len() >= out_samples && srates.vacant_len() >= 1 {
                if !rt.resampler.read(&mut rt.block) {
                    break;
                }
                audio.push_slice(&rt.block);
                let _ = srates.try_push(rt.dll.samplerate() * ratio);
            }
            true
        }
    }

    /// Drain pending format messages and encoded blocks to the sinks.
    /// Called from the network context; returns true while there may be
    /// more to send.
    pub fn send(&self, send_fn: &mut dyn FnMut(&[u8], SocketAddr)) -> bool {
        if self.send_format(send_fn) {
            // roster changed under us; encoded data goes out next call
            return true;
        }
        self.send_data(send_fn)
    }

    /// Emit a format message to every sink whose format is out of date.
    fn send_format(&self, send_fn: &mut dyn FnMut(&[u8], SocketAddr)) -> bool {
        let pending: Vec<Endpoint> = self
            .sinks
            .read()
            .iter()
            .filter(|s| s.format_changed)
            .map(|s| s.endpoint)
            .collect();
        if pending.is_empty() {
            return false;
        }
        for endpoint in &pending {
            match self.make_format_message(endpoint.id) {
                Ok(Some(bytes)) => {
                    send_fn(&bytes, endpoint.addr);
                    let mut sinks = self.sinks.write();
                    if let Some(sink) = sinks.iter_mut().find(|s| s.endpoint == *endpoint) {
                        sink.format_changed = false;
                    }
                }
                Ok(None) => {}
                Err(err) => warn!("couldn't send format to {}: {}", endpoint, err),
            }
        }
        true
    }

    fn send_data(&self, send_fn: &mut dyn FnMut(&[u8], SocketAddr)) -> bool {
        let mut net = self.net.lock();
        let net = &mut *net;
        let Some(encoder) = net.encoder.as_mut() else {
            return false;
        };
        let Some(fmt) = encoder.format().cloned() else {
            return false;
        };
        let nsamples = fmt.block_samples();
        let (Some(audio), Some(srates)) = (net.audio.as_mut(), net.srates.as_mut()) else {
            return false;
        };
        if audio.occupied_len() < nsamples || srates.occupied_len() < 1 {
            self.send_ping(net, send_fn);
            return false;
        }

        let samplerate = srates.try_pop().unwrap_or(fmt.samplerate as f64);
        audio.pop_slice(&mut net.samples[..nsamples]);

        let total = match encoder.encode(&net.samples[..nsamples], &mut net.wire) {
            Ok(n) => n as i32,
            Err(err) => {
                // skip this block; the sink sees a sequence gap
                warn!("encode error: {}", err);
                return true;
            }
        };

        let sequence = net.sequence;
        let packet_size = self.opts.read().packet_size;
        let max_payload = (packet_size - DATA_HEADER_SIZE).max(1);
        let nframes = if total == 0 {
            1
        } else {
            (total + max_payload - 1) / max_payload
        };
        if total > 0 {
            net.history.push(
                sequence,
                samplerate,
                &net.wire[..total as usize],
                nframes,
                max_payload,
            );
        }

        {
            let sinks = self.sinks.read();
            for frame in 0..nframes {
                let payload = if total == 0 {
                    &[][..]
                } else {
                    let onset = (frame * max_payload) as usize;
                    let end = (onset + max_payload as usize).min(total as usize);
                    &net.wire[onset..end]
                };
                for sink in sinks.iter() {
                    match data_message(
                        sink.endpoint.id,
                        self.id,
                        net.salt,
                        sequence,
                        samplerate,
                        sink.channel,
                        total,
                        nframes,
                        frame,
                        payload,
                    ) {
                        Ok(bytes) => send_fn(&bytes, sink.endpoint.addr),
                        Err(err) => warn!("couldn't send block {}: {}", sequence, err),
                    }
                }
            }
        }

        net.sequence = net.sequence.wrapping_add(1);
        if net.sequence == i32::MAX {
            // force the sinks to restart with a fresh stream generation;
            // the history belongs to the old one and its eviction marker
            // would shadow the restarted sequence range
            net.salt = make_salt();
            net.sequence = 0;
            net.history.clear();
            for sink in self.sinks.write().iter_mut() {
                sink.format_changed = true;
            }
        }
        self.send_ping(net, send_fn);
        true
    }

    /// `/aoo/sink/<id>/ping <src_id> <tt>` at the configured interval.
    fn send_ping(&self, net: &mut NetState, send_fn: &mut dyn FnMut(&[u8], SocketAddr)) {
        let interval = self.opts.read().ping_interval;
        if interval <= 0.0 {
            return;
        }
        let now = TimeTag::now();
        let elapsed = now.to_seconds();
        if net.last_ping_time == 0.0 {
            // arm the interval on the first call
            net.last_ping_time = elapsed;
            return;
        }
        if elapsed - net.last_ping_time < interval {
            return;
        }
        net.last_ping_time = elapsed;
        let sinks = self.sinks.read();
        for sink in sinks.iter() {
            let msg = osc::encode(
                osc::address(Role::Sink, sink.endpoint.id, osc::MSG_PING),
                vec![OscType::Int(self.id), OscType::Time(now.into())],
            );
            match msg {
                Ok(bytes) => send_fn(&bytes, sink.endpoint.addr),
                Err(err) => warn!("couldn't send ping: {}", err),
            }
        }
    }

    /// Build `/aoo/sink/<id>/format` for one sink from the current
    /// encoder state.
    fn make_format_message(&self, sink_id: EndpointId) -> Result<Option<Vec<u8>>> {
        let net = self.net.lock();
        let Some(encoder) = net.encoder.as_ref() else {
            return Ok(None);
        };
        let Some(fmt) = encoder.format() else {
            return Ok(None);
        };
        let options = encoder.write_format()?;
        let bytes = osc::encode(
            osc::address(Role::Sink, sink_id, osc::MSG_FORMAT),
            vec![
                OscType::Int(self.id),
                OscType::Int(net.salt),
                OscType::Int(fmt.nchannels),
                OscType::Int(fmt.samplerate),
                OscType::Int(fmt.blocksize),
                OscType::String(fmt.codec.clone()),
                OscType::Blob(options),
            ],
        )?;
        Ok(Some(bytes))
    }

    /// Drain pending events on the caller's thread.
    pub fn poll_events(&self, handler: &mut dyn FnMut(SourceEvent)) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.1.try_recv() {
            handler(event);
            count += 1;
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }
}

/// `/aoo/sink/<id>/data <src> <salt> <seq> <sr> <chan> <total> <nframes>
/// <frame> <blob>`
#[allow(clippy::too_many_arguments)]
fn data_message(
    sink_id: EndpointId,
    source_id: EndpointId,
    salt: i32,
    sequence: i32,
    samplerate: f64,
    channel: i32,
    total_size: i32,
    nframes: i32,
    frame: i32,
    payload: &[u8],
) -> Result<Vec<u8>> {
    osc::encode(
        osc::address(Role::Sink, sink_id, osc::MSG_DATA),
        vec![
            OscType::Int(source_id),
            OscType::Int(salt),
            OscType::Int(sequence),
            OscType::Double(samplerate),
            OscType::Int(channel),
            OscType::Int(total_size),
            OscType::Int(nframes),
            OscType::Int(frame),
            OscType::Blob(payload.to_vec()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_format() -> Format {
        Format {
            nchannels: 2,
            samplerate: 48000,
            blocksize: 64,
            codec: "pcm".into(),
        }
    }

    fn make_source() -> Source {
        crate::initialize();
        let source = Source::new(1);
        source.setup(48000, 64, 2, SourceOptions::default()).unwrap();
        source.set_format(test_format()).unwrap();
        source
    }

    fn endpoint(port: u16, id: i32) -> Endpoint {
        Endpoint::new(format!("127.0.0.1:{port}").parse().unwrap(), id)
    }

    #[test]
    fn test_set_format_requires_codec() {
        crate::initialize();
        let source = Source::new(1);
        source.setup(48000, 64, 2, SourceOptions::default()).unwrap();
        let mut fmt = test_format();
        fmt.codec = "mp3".into();
        match source.set_format(fmt) {
            Err(Error::UnsupportedCodec(name)) => assert_eq!(name, "mp3"),
            other => panic!("expected UnsupportedCodec, got {other:?}"),
        }
    }

    #[test]
    fn test_roster_wildcard_removal() {
        let source = make_source();
        source.add_sink(endpoint(9000, 1), 0);
        source.add_sink(endpoint(9000, 2), 0);
        source.add_sink(endpoint(9001, 1), 0);
        assert_eq!(source.sink_count(), 3);
        source.remove_sink(endpoint(9000, WILDCARD_ID));
        assert_eq!(source.sink_count(), 1);
    }

    #[test]
    fn test_first_send_emits_format() {
        let source = make_source();
        source.add_sink(endpoint(9000, 2), 0);
        let mut sent = Vec::new();
        source.send(&mut |bytes: &[u8], addr| sent.push((bytes.to_vec(), addr)));
        assert_eq!(sent.len(), 1);
        let msg = osc::decode(&sent[0].0).unwrap();
        assert_eq!(msg.addr, "/aoo/sink/2/format");
        // format is only sent once
        sent.clear();
        source.send(&mut |bytes: &[u8], addr| sent.push((bytes.to_vec(), addr)));
        assert!(sent.is_empty());
    }

    #[test]
    fn test_process_and_send_produces_data() {
        let source = make_source();
        source.add_sink(endpoint(9000, 2), 3);
        // flush the format message
        source.send(&mut |_: &[u8], _| {});

        let left = vec![0.25f32; 64];
        let right = vec![-0.25f32; 64];
        let channels: Vec<&[f32]> = vec![&left, &right];
        assert!(source.process(&channels, TimeTag::now()));

        let mut sent = Vec::new();
        assert!(source.send(&mut |bytes: &[u8], _| sent.push(bytes.to_vec())));
        // 512 payload bytes at a 512 B packet budget -> two frames
        assert_eq!(sent.len(), 2);
        let msg = osc::decode(&sent[0]).unwrap();
        assert_eq!(msg.addr, "/aoo/sink/2/data");
        let mut args = Args::new(&msg);
        assert_eq!(args.int().unwrap(), 1); // source id
        let _salt = args.int().unwrap();
        assert_eq!(args.int().unwrap(), 0); // first sequence
        assert!(args.double().unwrap() > 0.0); // samplerate
        assert_eq!(args.int().unwrap(), 3); // channel offset
        let total = args.int().unwrap();
        assert_eq!(total, 64 * 2 * 4); // float32 wire size
        assert_eq!(args.int().unwrap(), 2); // nframes at 512 B packets
        assert_eq!(args.int().unwrap(), 0); // frame 0
    }

    #[test]
    fn test_sequence_increases() {
        let source = make_source();
        source.add_sink(endpoint(9000, 2), 0);
        source.send(&mut |_: &[u8], _| {});

        let block = vec![0.0f32; 64];
        let mut sequences = Vec::new();
        for _ in 0..3 {
            let channels: Vec<&[f32]> = vec![&block, &block];
            source.process(&channels, TimeTag::now());
            let mut sent = Vec::new();
            source.send(&mut |bytes: &[u8], _| sent.push(bytes.to_vec()));
            for bytes in &sent {
                let msg = osc::decode(bytes).unwrap();
                let mut args = Args::new(&msg);
                let _ = args.int().unwrap();
                let _ = args.int().unwrap();
                sequences.push(args.int().unwrap());
            }
        }
        // two frames per block, strictly increasing per block
        assert_eq!(sequences, vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_resend_from_history() {
        let source = make_source();
        let sink = endpoint(9000, 2);
        source.add_sink(sink, 0);
        source.send(&mut |_: &[u8], _| {});

        let block = vec![0.5f32; 64];
        let mut salt = 0;
        for _ in 0..4 {
            let channels: Vec<&[f32]> = vec![&block, &block];
            source.process(&channels, TimeTag::now());
            source.send(&mut |bytes: &[u8], _| {
                let msg = osc::decode(bytes).unwrap();
                let mut args = Args::new(&msg);
                let _ = args.int().unwrap();
                salt = args.int().unwrap();
            });
        }

        // request block 2 in full (frame = -1)
        let request = osc::encode(
            osc::address(Role::Source, 1, osc::MSG_RESEND),
            vec![
                OscType::Int(2),
                OscType::Int(salt),
                OscType::Int(2),
                OscType::Int(-1),
            ],
        )
        .unwrap();
        let mut resent = Vec::new();
        source.handle_message(&request, sink.addr, &mut |bytes| resent.push(bytes.to_vec()));
        assert_eq!(resent.len(), 2); // both frames of block 2
        for bytes in &resent {
            let msg = osc::decode(bytes).unwrap();
            let mut args = Args::new(&msg);
            let _ = args.int().unwrap();
            let _ = args.int().unwrap();
            assert_eq!(args.int().unwrap(), 2);
        }

        // wrong salt is silently ignored
        let request = osc::encode(
            osc::address(Role::Source, 1, osc::MSG_RESEND),
            vec![
                OscType::Int(2),
                OscType::Int(salt.wrapping_add(1)),
                OscType::Int(2),
                OscType::Int(-1),
            ],
        )
        .unwrap();
        resent.clear();
        source.handle_message(&request, sink.addr, &mut |bytes| resent.push(bytes.to_vec()));
        assert!(resent.is_empty());
    }

    #[test]
    fn test_request_registers_sink() {
        let source = make_source();
        let request = osc::encode(
            osc::address(Role::Source, 1, osc::MSG_REQUEST),
            vec![OscType::Int(5)],
        )
        .unwrap();
        let from: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        let mut replies = Vec::new();
        source.handle_message(&request, from, &mut |bytes| replies.push(bytes.to_vec()));
        assert_eq!(source.sink_count(), 1);
        // the format goes straight back
        assert_eq!(replies.len(), 1);
        let msg = osc::decode(&replies[0]).unwrap();
        assert_eq!(msg.addr, "/aoo/sink/5/format");
    }

    #[test]
    fn test_resampler_bridges_host_and_encoder_rate() {
        crate::initialize();
        // host runs at half the encoder rate; the internal resampler
        // has to produce roughly two encoder blocks per host block
        let source = Source::new(1);
        source.setup(24000, 64, 2, SourceOptions::default()).unwrap();
        source
            .set_format(Format {
                nchannels: 2,
                samplerate: 48000,
                blocksize: 64,
                codec: "pcm".into(),
            })
            .unwrap();
        source.add_sink(endpoint(9000, 2), 0);
        source.send(&mut |_: &[u8], _| {});

        let block = vec![0.5f32; 64];
        let step = 64.0 / 24000.0;
        let mut tt = TimeTag::from_seconds(3_900_000_000.0);
        let mut blocks = 0;
        for _ in 0..10 {
            tt = TimeTag::from_seconds(tt.to_seconds() + step);
            let channels: Vec<&[f32]> = vec![&block, &block];
            assert!(source.process(&channels, tt));
            while source.send(&mut |bytes: &[u8], _| {
                let msg = osc::decode(bytes).unwrap();
                if msg.addr.ends_with("/data") {
                    let mut args = Args::new(&msg);
                    for _ in 0..7 {
                        let _ = args.int();
                    }
                    if args.int().unwrap() == 0 {
                        blocks += 1; // count first frames only
                    }
                }
            }) {}
        }
        assert!(
            (15..=21).contains(&blocks),
            "expected about 2 blocks per tick, got {blocks} in 10 ticks"
        );
    }

    #[test]
    fn test_invite_event_by_default() {
        let source = make_source();
        let invite = osc::encode(
            osc::address(Role::Source, 1, osc::MSG_INVITE),
            vec![OscType::Int(9)],
        )
        .unwrap();
        let from: SocketAddr = "127.0.0.1:9200".parse().unwrap();
        source.handle_message(&invite, from, &mut |_| {});
        // fails closed: no sink added, event emitted instead
        assert_eq!(source.sink_count(), 0);
        let mut events = Vec::new();
        source.poll_events(&mut |e| events.push(e));
        assert_eq!(
            events,
            vec![SourceEvent::Invite {
                endpoint: Endpoint::new(from, 9)
            }]
        );
    }
}
