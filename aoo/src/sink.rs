//! Sink engine: packet reassembly, jitter buffering, decoding, dynamic
//! resampling for clock-drift compensation, retransmission requests and
//! stream-state events.
//!
//! Threading mirrors the source: `process()` runs on the RT audio context
//! and only ever try-locks, `handle_message()` and `send()` run on the
//! network context, `poll_events()` wherever the host drains events.
//! Decoded audio travels from the network context to RT through lock-free
//! SPSC rings, one pair per remote source.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use rosc::OscType;
use tracing::{debug, warn};

use crate::buffer::{
    BlockAckList, DynamicResampler, JitterBuffer, ReceivedBlock, MAX_BLOCK_FRAMES,
};
use crate::codec::{self, Decoder};
use crate::error::{Error, Result};
use crate::event::{SinkEvent, StreamState};
use crate::osc::{self, Args, Role};
use crate::time::{TimeDll, TimeTag, Timer, TimerState};
use crate::types::{Endpoint, EndpointId, Format, WILDCARD_ID};
use crate::{MAX_PACKET_SIZE, MIN_PACKET_SIZE};

/// Extra jitter-buffer slots beyond the audio FIFO depth, to ride out
/// network jitter at small buffer sizes.
const JITTER_SLACK: usize = 16;

/// Don't hunt for missing blocks below this queue length; short queues
/// are usually plain reordering.
const MISSING_CHECK_THRESHOLD: usize = 3;

/// Sink configuration, fixed at `setup()`.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Playback delay and FIFO depth per source.
    pub buffer_ms: i32,
    /// Max resend requests per block.
    pub resend_limit: i32,
    /// Debounce between resend requests for the same block, ms.
    pub resend_interval_ms: i32,
    /// Max frames requested per missing-block pass.
    pub resend_max_frames: i32,
    /// UDP packet size budget for request messages.
    pub packet_size: i32,
    /// Time-DLL bandwidth in (0, 1].
    pub time_filter_bandwidth: f64,
    /// Clamp the mix to [-1, 1] before output.
    pub clip_output: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            buffer_ms: 25,
            resend_limit: 16,
            resend_interval_ms: 100,
            resend_max_frames: 64,
            packet_size: 512,
            time_filter_bandwidth: 0.012,
            clip_output: false,
        }
    }
}

/// Host stream format.
#[derive(Debug, Clone, Default)]
struct HostFormat {
    samplerate: i32,
    blocksize: i32,
    nchannels: i32,
}

/// Routing/rate info travelling alongside each decoded block.
#[derive(Debug, Clone, Copy)]
struct BlockInfo {
    samplerate: f64,
    channel: i32,
}

/// One incoming data packet, decoded from OSC.
struct DataPacket<'a> {
    sequence: i32,
    samplerate: f64,
    channel: i32,
    total_size: i32,
    nframes: i32,
    frame: i32,
    data: &'a [u8],
}

/// Atomic per-source stream state shared between all three contexts.
struct StreamStats {
    lost: AtomicI32,
    reordered: AtomicI32,
    resent: AtomicI32,
    gap: AtomicI32,
    lost_since_ping: AtomicI32,
    recover: AtomicBool,
    format_request: AtomicBool,
    ping_pending: AtomicBool,
    ping_tt1: AtomicU64,
    ping_tt2: AtomicU64,
    /// 0 = none, 1 = invite, 2 = uninvite.
    invite: AtomicI32,
    /// 0 = stop, 1 = play.
    state: AtomicI32,
}

impl StreamStats {
    fn new() -> Self {
        Self {
            lost: AtomicI32::new(0),
            reordered: AtomicI32::new(0),
            resent: AtomicI32::new(0),
            gap: AtomicI32::new(0),
            lost_since_ping: AtomicI32::new(0),
            recover: AtomicBool::new(false),
            format_request: AtomicBool::new(false),
            ping_pending: AtomicBool::new(false),
            ping_tt1: AtomicU64::new(0),
            ping_tt2: AtomicU64::new(0),
            invite: AtomicI32::new(0),
            state: AtomicI32::new(0),
        }
    }

    fn reset(&self) {
        self.lost.store(0, Ordering::Relaxed);
        self.reordered.store(0, Ordering::Relaxed);
        self.resent.store(0, Ordering::Relaxed);
        self.gap.store(0, Ordering::Relaxed);
        self.lost_since_ping.store(0, Ordering::Relaxed);
        self.recover.store(false, Ordering::Relaxed);
        self.state.store(0, Ordering::Relaxed);
    }

    fn add_lost(&self, n: i32) {
        self.lost.fetch_add(n, Ordering::Relaxed);
        self.lost_since_ping.fetch_add(n, Ordering::Relaxed);
    }

    fn add_reordered(&self, n: i32) {
        self.reordered.fetch_add(n, Ordering::Relaxed);
    }

    fn add_resent(&self, n: i32) {
        self.resent.fetch_add(n, Ordering::Relaxed);
    }

    fn add_gap(&self, n: i32) {
        self.gap.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns true when the state actually changed.
    fn update_state(&self, state: StreamState) -> bool {
        let new = state as i32;
        self.state.swap(new, Ordering::AcqRel) != new
    }
}

/// Reassembly state, owned by the network context.
struct RecvState {
    decoder: Option<Box<dyn Decoder>>,
    salt: i32,
    newest: i32,
    next: i32,
    jitter: JitterBuffer,
    acks: BlockAckList,
    resend_queue: Vec<(i32, i32)>,
    audio: Option<HeapProd<f32>>,
    info: Option<HeapProd<BlockInfo>>,
    dec_nsamples: usize,
    dec_samplerate: f64,
    scratch: Vec<f32>,
    silence: Vec<f32>,
}

/// Playback state, owned by the RT audio context.
struct PlayState {
    audio: Option<HeapCons<f32>>,
    info: Option<HeapCons<BlockInfo>>,
    resampler: DynamicResampler,
    channel: i32,
    samplerate: f64,
    dec_nchannels: usize,
    dec_nsamples: usize,
    transfer: Vec<f32>,
    read_buf: Vec<f32>,
}

/// Per-source descriptor inside the sink.
struct SourceDesc {
    endpoint: Endpoint,
    recv: Mutex<RecvState>,
    play: Mutex<PlayState>,
    stats: StreamStats,
    events: Sender<SinkEvent>,
}

impl SourceDesc {
    fn new(endpoint: Endpoint, salt: i32, events: Sender<SinkEvent>) -> Self {
        let _ = events.send(SinkEvent::SourceAdd { endpoint });
        debug!("add new source {}", endpoint);
        Self {
            endpoint,
            recv: Mutex::new(RecvState {
                decoder: None,
                salt,
                newest: 0,
                next: -1,
                jitter: JitterBuffer::new(0),
                acks: BlockAckList::new(),
                resend_queue: Vec::new(),
                audio: None,
                info: None,
                dec_nsamples: 0,
                dec_samplerate: 0.0,
                scratch: Vec::new(),
                silence: Vec::new(),
            }),
            play: Mutex::new(PlayState {
                audio: None,
                info: None,
                resampler: DynamicResampler::new(),
                channel: 0,
                samplerate: 0.0,
                dec_nchannels: 0,
                dec_nsamples: 0,
                transfer: Vec::new(),
                read_buf: Vec::new(),
            }),
            stats: StreamStats::new(),
            events,
        }
    }
}

/// RT-owned sink state.
struct RtState {
    buffer: Vec<f32>,
    dll: TimeDll,
    timer: Timer,
}

/// The sink endpoint engine.
pub struct Sink {
    id: EndpointId,
    opts: RwLock<SinkOptions>,
    host: RwLock<HostFormat>,
    rt: Mutex<RtState>,
    sources: RwLock<Vec<Arc<SourceDesc>>>,
    /// Elapsed stream seconds (f64 bits), mirrored from the RT timer for
    /// the network context.
    stream_time: AtomicU64,
    events: (Sender<SinkEvent>, Receiver<SinkEvent>),
}

fn buffer_blocks(ms: i32, samplerate: i32, blocksize: i32) -> usize {
    let samples = ms.max(0) as f64 * samplerate as f64 * 0.001;
    ((samples / blocksize as f64).ceil() as usize).max(1)
}

impl Sink {
    pub fn new(id: EndpointId) -> Self {
        Self {
            id,
            opts: RwLock::new(SinkOptions::default()),
            host: RwLock::new(HostFormat::default()),
            rt: Mutex::new(RtState {
                buffer: Vec::new(),
                dll: TimeDll::default(),
                timer: Timer::new(),
            }),
            sources: RwLock::new(Vec::new()),
            stream_time: AtomicU64::new(0),
            events: unbounded(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// (Re)configure for the host stream format; resets the timing filter
    /// and rebuilds every per-source pipeline.
    pub fn setup(
        &self,
        samplerate: i32,
        blocksize: i32,
        nchannels: i32,
        opts: SinkOptions,
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
        *self.host.write() = HostFormat {
            samplerate,
            blocksize,
            nchannels,
        };
        {
            let mut rt = self.rt.lock();
            rt.buffer = vec![0.0; (blocksize * nchannels) as usize];
            rt.timer.setup(samplerate, blocksize);
        }
        for desc in self.sources.read().iter() {
            self.update_source(desc);
        }
        Ok(())
    }

    /// Ask a source to start streaming to this sink.
    pub fn invite_source(&self, endpoint: Endpoint) {
        let desc = self.find_or_add_source(endpoint, 0);
        desc.stats.invite.store(1, Ordering::Release);
    }

    /// Ask a source to stop streaming to this sink.
    pub fn uninvite_source(&self, endpoint: Endpoint) {
        match self.find_source(endpoint) {
            Some(desc) => desc.stats.invite.store(2, Ordering::Release),
            None => warn!("can't uninvite unknown source {}", endpoint),
        }
    }

    pub fn uninvite_all(&self) {
        for desc in self.sources.read().iter() {
            desc.stats.invite.store(2, Ordering::Release);
        }
    }

    /// Ask for a full reset of one source (or all) on the next packet.
    pub fn request_recover(&self, endpoint: Option<Endpoint>) {
        for desc in self.sources.read().iter() {
            if endpoint.map(|e| e == desc.endpoint).unwrap_or(true) {
                desc.stats.recover.store(true, Ordering::Release);
            }
        }
    }

    fn find_source(&self, endpoint: Endpoint) -> Option<Arc<SourceDesc>> {
        self.sources
            .read()
            .iter()
            .find(|s| s.endpoint == endpoint)
            .cloned()
    }

    fn find_or_add_source(&self, endpoint: Endpoint, salt: i32) -> Arc<SourceDesc> {
        if let Some(desc) = self.find_source(endpoint) {
            return desc;
        }
        let desc = Arc::new(SourceDesc::new(endpoint, salt, self.events.0.clone()));
        self.sources.write().push(desc.clone());
        desc
    }

    /// Handle one incoming OSC message addressed to this sink.
    pub fn handle_message(&self, data: &[u8], from: SocketAddr) {
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
        if role != Role::Sink {
            warn!("not a sink message: {}", msg.addr);
            return;
        }
        if id != self.id && id != WILDCARD_ID {
            warn!("wrong sink id {}", id);
            return;
        }
        if self.host.read().samplerate < 1 {
            return; // not set up yet
        }
        let mut args = Args::new(&msg);
        let result = match verb {
            osc::MSG_FORMAT => self.handle_format(&mut args, from),
            osc::MSG_DATA => self.handle_data(&mut args, from),
            osc::MSG_PING => self.handle_ping(&mut args, from),
            other => {
                warn!("unknown message '{}'", other);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("bad '{}' message from {}: {}", verb, from, err);
        }
    }

    /// `/aoo/sink/<id>/format <src> <salt> <nchannels> <sr> <blocksize>
    /// <codec> <options>`
    fn handle_format(&self, args: &mut Args, from: SocketAddr) -> Result<()> {
        let id = args.int()?;
        let salt = args.int()?;
        let fmt = Format {
            nchannels: args.int()?,
            samplerate: args.int()?,
            blocksize: args.int()?,
            codec: args.string()?.to_string(),
        };
        let options = args.blob()?;
        if id < 0 {
            return Err(Error::Osc("bad source id in format message".into()));
        }
        let endpoint = Endpoint::new(from, id);
        let desc = self.find_or_add_source(endpoint, salt);

        {
            let mut recv = desc.recv.lock();
            let mut play = desc.play.lock();
            recv.salt = salt;

            let recreate = match &recv.decoder {
                Some(dec) => dec.format().map(|f| f.codec != fmt.codec).unwrap_or(true),
                None => true,
            };
            if recreate {
                let codec = codec::find_codec(&fmt.codec)
                    .ok_or_else(|| Error::UnsupportedCodec(fmt.codec.clone()))?;
                recv.decoder = Some(codec.create_decoder());
            }
            recv.decoder.as_mut().unwrap().read_format(&fmt, options)?;
            self.update_source_locked(&desc.stats, &mut recv, &mut play);
        }

        let _ = desc.events.send(SinkEvent::SourceFormat { endpoint });
        Ok(())
    }

    /// `/aoo/sink/<id>/data <src> <salt> <seq> <sr> <chan> <total>
    /// <nframes> <frame> <blob>`
    fn handle_data(&self, args: &mut Args, from: SocketAddr) -> Result<()> {
        let id = args.int()?;
        let salt = args.int()?;
        let packet = DataPacket {
            sequence: args.int()?,
            samplerate: args.double()?,
            channel: args.int()?,
            total_size: args.int()?,
            nframes: args.int()?,
            frame: args.int()?,
            data: args.blob()?,
        };
        if id < 0 {
            return Err(Error::Osc("bad source id in data message".into()));
        }
        let endpoint = Endpoint::new(from, id);
        match self.find_source(endpoint) {
            Some(desc) => {
                self.source_handle_data(&desc, salt, &packet);
                Ok(())
            }
            None => {
                // register the source and ask for its format first
                let desc = self.find_or_add_source(endpoint, salt);
                desc.stats.format_request.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    /// `/aoo/sink/<id>/ping <src> <tt>`
    fn handle_ping(&self, args: &mut Args, from: SocketAddr) -> Result<()> {
        let id = args.int()?;
        let tt1 = args.time()?;
        if id < 0 {
            return Err(Error::Osc("bad source id in ping message".into()));
        }
        let endpoint = Endpoint::new(from, id);
        let Some(desc) = self.find_source(endpoint) else {
            warn!("couldn't find source {} for ping", endpoint);
            return Ok(());
        };
        let tt2 = TimeTag::now();
        desc.stats.ping_tt1.store(tt1.0, Ordering::Relaxed);
        desc.stats.ping_tt2.store(tt2.0, Ordering::Relaxed);
        desc.stats.ping_pending.store(true, Ordering::Release);
        let _ = desc.events.send(SinkEvent::Ping { endpoint, tt1, tt2 });
        Ok(())
    }

    /// Rebuild one source's pipeline for the current decoder format.
    fn update_source(&self, desc: &SourceDesc) {
        let mut recv = desc.recv.lock();
        let mut play = desc.play.lock();
        self.update_source_locked(&desc.stats, &mut recv, &mut play);
    }

    fn update_source_locked(&self, stats: &StreamStats, recv: &mut RecvState, play: &mut PlayState) {
        let Some(fmt) = recv.decoder.as_ref().and_then(|d| d.format().cloned()) else {
            return;
        };
        let host = self.host.read().clone();
        if host.samplerate < 1 {
            return;
        }
        let opts = self.opts.read().clone();
        let nsamples = fmt.block_samples();
        let nbuffers = buffer_blocks(opts.buffer_ms, fmt.samplerate, fmt.blocksize);

        let (audio_prod, audio_cons) = HeapRb::<f32>::new(nbuffers * nsamples).split();
        let (info_prod, info_cons) = HeapRb::<BlockInfo>::new(nbuffers).split();
        recv.audio = Some(audio_prod);
        recv.info = Some(info_prod);
        play.audio = Some(audio_cons);
        play.info = Some(info_cons);

        recv.dec_nsamples = nsamples;
        recv.dec_samplerate = fmt.samplerate as f64;
        recv.scratch = vec![0.0; nsamples];
        recv.silence = vec![0.0; nsamples];
        recv.jitter.resize(nbuffers + JITTER_SLACK);
        recv.newest = 0;
        recv.next = -1;
        recv.acks.set_limit(opts.resend_limit);
        recv.acks.clear();
        recv.resend_queue.clear();

        play.resampler.setup(
            fmt.blocksize,
            host.blocksize,
            fmt.samplerate,
            host.samplerate,
            fmt.nchannels,
        );
        play.channel = 0;
        play.samplerate = fmt.samplerate as f64;
        play.dec_nchannels = fmt.nchannels as usize;
        play.dec_nsamples = nsamples;
        play.transfer = vec![0.0; nsamples];
        play.read_buf = vec![0.0; (host.blocksize * fmt.nchannels) as usize];

        stats.reset();

        // start playback buffer_ms behind: prefill the FIFO with silence
        let count = write_silent_blocks(recv, 0, usize::MAX);
        debug!(
            "update source: {} fifo blocks, jitter capacity {}, wrote {} silent blocks",
            nbuffers,
            recv.jitter.capacity(),
            count
        );
    }

    fn source_handle_data(&self, desc: &SourceDesc, salt: i32, d: &DataPacket) {
        let mut recv = desc.recv.lock();
        let recv = &mut *recv;
        let stats = &desc.stats;

        // the source format might have changed behind our back
        if salt != recv.salt {
            stats.format_request.store(true, Ordering::Release);
            return;
        }
        if recv.decoder.is_none() || recv.dec_nsamples == 0 {
            debug!("ignore data message: no decoder yet");
            return;
        }
        let dropped = d.total_size == 0;
        if d.total_size < 0
            || (!dropped
                && (d.nframes < 1
                    || d.nframes > MAX_BLOCK_FRAMES
                    || d.frame < 0
                    || d.frame >= d.nframes
                    || d.data.len() > d.total_size as usize))
        {
            warn!("invalid data packet for block {}", d.sequence);
            return;
        }

        if recv.next < 0 {
            recv.next = d.sequence; // first-packet sync
        }
        if d.sequence < recv.next {
            debug!("discarded old block {}", d.sequence);
            return;
        }

        let diff = d.sequence as i64 - recv.newest as i64;
        let large_gap = recv.newest > 0 && diff > recv.jitter.capacity() as i64;
        let recover = stats.recover.swap(false, Ordering::AcqRel);
        let was_known = recv.jitter.find_mut(d.sequence).is_some();

        if diff < 0 {
            // count whole blocks, not every late frame of one
            if !was_known {
                if recv.acks.contains(d.sequence) {
                    debug!("resent block {}", d.sequence);
                    stats.add_resent(1);
                } else {
                    debug!("block {} out of order", d.sequence);
                    stats.add_reordered(1);
                }
            }
        } else {
            if recv.newest > 0 && diff > 1 {
                debug!("skipped {} blocks", diff - 1);
            }
            recv.newest = d.sequence;
        }

        if large_gap || recover {
            // full reset: the queue and the skipped span play as silence
            let mut lost = recv.jitter.len() as i32;
            if large_gap {
                lost += (diff - 1) as i32;
            }
            stats.add_lost(lost);
            if diff > 1 {
                stats.add_gap((diff - 1) as i32);
            }
            recv.jitter.clear();
            recv.acks.clear();
            recv.resend_queue.clear();
            recv.next = d.sequence;
            let count = write_silent_blocks(recv, 1, usize::MAX);
            debug!(
                "wrote {} silent blocks for {}",
                count,
                if large_gap { "transmission gap" } else { "recovery" }
            );
        }

        // find or insert the block and record the frame
        let known = recv.jitter.find_mut(d.sequence).is_some();
        if known {
            let block = recv.jitter.find_mut(d.sequence).unwrap();
            if dropped || block.dropped() || block.has_frame(d.frame) {
                debug!(
                    "frame {} of block {} already received",
                    d.frame, d.sequence
                );
                return;
            }
            block.add_frame(d.frame, d.data);
        } else {
            if recv.jitter.is_full() {
                evict_oldest(recv, stats);
            }
            if dropped {
                // skip marker: complete by construction, plays as silence
                recv.jitter
                    .insert(ReceivedBlock::new_dropped(d.sequence, d.samplerate));
            } else {
                let block = recv.jitter.insert(ReceivedBlock::new(
                    d.sequence,
                    d.samplerate,
                    d.channel,
                    d.total_size,
                    d.nframes,
                ));
                block.add_frame(d.frame, d.data);
            }
        }

        self.drain_blocks(recv);
        check_outdated_blocks(recv, stats);
        self.check_missing_blocks(recv);
    }

    /// Decode consecutive complete blocks into the audio FIFO, in
    /// sequence order.
    fn drain_blocks(&self, recv: &mut RecvState) {
        let nsamples = recv.dec_nsamples;
        loop {
            let Some(front) = recv.jitter.front() else {
                break;
            };
            if !front.complete() || front.sequence != recv.next {
                break;
            }
            let (Some(audio), Some(info)) = (recv.audio.as_mut(), recv.info.as_mut()) else {
                break;
            };
            if audio.vacant_len() < nsamples || info.vacant_len() < 1 {
                break;
            }

            recv.scratch[..nsamples].fill(0.0);
            if !front.dropped() {
                if let Some(decoder) = recv.decoder.as_mut() {
                    if let Err(err) = decoder.decode(front.data(), &mut recv.scratch[..nsamples]) {
                        debug!("bad block {}: {}", front.sequence, err);
                        recv.scratch[..nsamples].fill(0.0);
                    }
                }
            }
            let sr = if front.samplerate > 0.0 {
                front.samplerate
            } else {
                recv.dec_samplerate
            };
            let channel = front.channel;
            let sequence = front.sequence;

            let (Some(audio), Some(info)) = (recv.audio.as_mut(), recv.info.as_mut()) else {
                break;
            };
            audio.push_slice(&recv.scratch[..nsamples]);
            let _ = info.try_push(BlockInfo {
                samplerate: sr,
                channel,
            });

            recv.acks.remove(sequence);
            recv.jitter.pop_front();
            recv.next = recv.next.wrapping_add(1);
        }
    }

    /// Queue resend requests for holes in the jitter buffer.
    fn check_missing_blocks(&self, recv: &mut RecvState) {
        if recv.jitter.is_empty() {
            if !recv.acks.is_empty() {
                warn!("bug: ack list not empty");
                recv.acks.clear();
            }
            return;
        }
        let len = recv.jitter.len();
        if len < MISSING_CHECK_THRESHOLD {
            return;
        }
        let opts = self.opts.read();
        let interval = opts.resend_interval_ms as f64 * 0.001;
        let max_frames = opts.resend_max_frames;
        drop(opts);
        let now = f64::from_bits(self.stream_time.load(Ordering::Relaxed));
        let next = recv.next;

        let jitter = &recv.jitter;
        let acks = &mut recv.acks;
        let queue = &mut recv.resend_queue;
        let mut numframes = 0;

        // request missing frames of incomplete blocks, except the newest
        // block which may still be in flight
        'incomplete: for block in jitter.iter().take(len - 1) {
            if block.complete() {
                continue;
            }
            if acks.check(block.sequence, now, interval) {
                for i in 0..block.num_frames() {
                    if !block.has_frame(i) {
                        if numframes < max_frames {
                            queue.push((block.sequence, i));
                            numframes += 1;
                        } else {
                            break 'incomplete;
                        }
                    }
                }
            }
        }

        // request whole blocks for every gap before a queued block
        let mut expected = next;
        'gaps: for block in jitter.iter() {
            let missing = block.sequence as i64 - expected as i64;
            if missing > 0 {
                for i in 0..missing as i32 {
                    if acks.check(expected + i, now, interval) {
                        if numframes + block.num_frames() <= max_frames {
                            queue.push((expected + i, -1));
                            numframes += block.num_frames();
                        } else {
                            break 'gaps;
                        }
                    }
                }
            } else if missing < 0 {
                warn!("bug: sequence {} below expected {}", block.sequence, expected);
            }
            expected = block.sequence + 1;
        }

        let removed = recv.acks.remove_before(next);
        if removed > 0 {
            debug!("removed {} outdated acks", removed);
        }
    }

    /// Mix one host block from every source. Returns true when any source
    /// contributed audio.
    pub fn process(&self, data: &mut [&mut [f32]], tt: TimeTag) -> bool {
        let Some(mut rt) = self.rt.try_lock() else {
            for channel in data.iter_mut() {
                channel.fill(0.0);
            }
            return false;
        };
        let rt = &mut *rt;
        let host = match self.host.try_read() {
            Some(host) => host.clone(),
            None => {
                for channel in data.iter_mut() {
                    channel.fill(0.0);
                }
                return false;
            }
        };
        if host.samplerate < 1 {
            for channel in data.iter_mut() {
                channel.fill(0.0);
            }
            return false;
        }
        rt.buffer.fill(0.0);

        match rt.timer.update(tt) {
            TimerState::Reset => {
                debug!("setup time DLL for sink");
                let bw = self.opts.read().time_filter_bandwidth;
                rt.dll
                    .setup(host.samplerate as f64, host.blocksize, bw, 0.0);
            }
            TimerState::Error(err) => {
                warn!("DSP tick(s) took too long ({} ms late)", err * 1000.0);
                if let Some(sources) = self.sources.try_read() {
                    for desc in sources.iter() {
                        desc.stats.recover.store(true, Ordering::Release);
                    }
                }
                rt.timer.reset();
            }
            TimerState::Ok => {
                let elapsed = rt.timer.elapsed();
                rt.dll.update(elapsed);
            }
        }
        self.stream_time
            .store(rt.timer.elapsed().to_bits(), Ordering::Relaxed);
        let real_sr = rt.dll.samplerate();

        let mut did_something = false;
        if let Some(sources) = self.sources.try_read() {
            for desc in sources.iter() {
                if source_process(desc, &mut rt.buffer, real_sr, &host) {
                    did_something = true;
                }
            }
        }

        if did_something {
            if self.opts.read().clip_output {
                for sample in rt.buffer.iter_mut() {
                    *sample = sample.clamp(-1.0, 1.0);
                }
            }
            let blocksize = host.blocksize as usize;
            for (i, channel) in data.iter_mut().take(host.nchannels as usize).enumerate() {
                let src = &rt.buffer[i * blocksize..(i + 1) * blocksize];
                let n = blocksize.min(channel.len());
                channel[..n].copy_from_slice(&src[..n]);
            }
        } else {
            for channel in data.iter_mut() {
                channel.fill(0.0);
            }
        }
        did_something
    }

    /// Emit queued format requests, resend requests, ping replies and
    /// invitation messages. Called from the network context.
    pub fn send(&self, send_fn: &mut dyn FnMut(&[u8], SocketAddr)) -> bool {
        let sources: Vec<Arc<SourceDesc>> = self.sources.read().iter().cloned().collect();
        let mut did_something = false;
        for desc in sources {
            did_something |= self.send_format_request(&desc, send_fn);
            did_something |= self.send_data_requests(&desc, send_fn);
            did_something |= self.send_notifications(&desc, send_fn);
        }
        did_something
    }

    /// `/aoo/source/<id>/request <sink_id>`
    fn send_format_request(
        &self,
        desc: &SourceDesc,
        send_fn: &mut dyn FnMut(&[u8], SocketAddr),
    ) -> bool {
        if !desc.stats.format_request.swap(false, Ordering::AcqRel) {
            return false;
        }
        debug!("request format for source {}", desc.endpoint);
        match osc::encode(
            osc::address(Role::Source, desc.endpoint.id, osc::MSG_REQUEST),
            vec![OscType::Int(self.id)],
        ) {
            Ok(bytes) => {
                send_fn(&bytes, desc.endpoint.addr);
                true
            }
            Err(err) => {
                warn!("couldn't send format request: {}", err);
                false
            }
        }
    }

    /// `/aoo/source/<id>/resend <sink_id> <salt> (<seq> <frame>)+`
    fn send_data_requests(
        &self,
        desc: &SourceDesc,
        send_fn: &mut dyn FnMut(&[u8], SocketAddr),
    ) -> bool {
        let (salt, requests) = {
            let mut recv = desc.recv.lock();
            if recv.resend_queue.is_empty() {
                return false;
            }
            (recv.salt, std::mem::take(&mut recv.resend_queue))
        };
        let addr = osc::address(Role::Source, desc.endpoint.id, osc::MSG_RESEND);
        // bound each message by the packet size budget:
        // address + type tags + sink id + salt, then ~10 bytes per pair
        let packet_size = self.opts.read().packet_size as usize;
        let overhead = addr.len() + 16;
        let max_requests = packet_size.saturating_sub(overhead).max(10) / 10;

        for chunk in requests.chunks(max_requests) {
            let mut args = Vec::with_capacity(2 + chunk.len() * 2);
            args.push(OscType::Int(self.id));
            args.push(OscType::Int(salt));
            for &(seq, frame) in chunk {
                args.push(OscType::Int(seq));
                args.push(OscType::Int(frame));
            }
            match osc::encode(addr.clone(), args) {
                Ok(bytes) => send_fn(&bytes, desc.endpoint.addr),
                Err(err) => warn!("couldn't send resend request: {}", err),
            }
        }
        true
    }

    /// Ping replies and invitation messages.
    fn send_notifications(
        &self,
        desc: &SourceDesc,
        send_fn: &mut dyn FnMut(&[u8], SocketAddr),
    ) -> bool {
        let mut did_something = false;

        if desc.stats.ping_pending.swap(false, Ordering::AcqRel) {
            // only reply while the stream is playing
            if desc.stats.state.load(Ordering::Acquire) == StreamState::Play as i32 {
                let tt1 = TimeTag(desc.stats.ping_tt1.load(Ordering::Relaxed));
                let tt2 = TimeTag(desc.stats.ping_tt2.load(Ordering::Relaxed));
                let lost = desc.stats.lost_since_ping.swap(0, Ordering::Relaxed);
                match osc::encode(
                    osc::address(Role::Source, desc.endpoint.id, osc::MSG_PING),
                    vec![
                        OscType::Int(self.id),
                        OscType::Time(tt1.into()),
                        OscType::Time(tt2.into()),
                        OscType::Int(lost),
                    ],
                ) {
                    Ok(bytes) => {
                        send_fn(&bytes, desc.endpoint.addr);
                        did_something = true;
                    }
                    Err(err) => warn!("couldn't send ping reply: {}", err),
                }
            }
        }

        let invite = desc.stats.invite.swap(0, Ordering::AcqRel);
        if invite != 0 {
            let verb = if invite == 1 {
                osc::MSG_INVITE
            } else {
                osc::MSG_UNINVITE
            };
            match osc::encode(
                osc::address(Role::Source, desc.endpoint.id, verb),
                vec![OscType::Int(self.id)],
            ) {
                Ok(bytes) => {
                    send_fn(&bytes, desc.endpoint.addr);
                    did_something = true;
                }
                Err(err) => warn!("couldn't send {}: {}", verb, err),
            }
        }
        did_something
    }

    /// Drain pending events on the caller's thread.
    pub fn poll_events(&self, handler: &mut dyn FnMut(SinkEvent)) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.1.try_recv() {
            handler(event);
            count += 1;
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn source_count(&self) -> usize {
        self.sources.read().len()
    }
}

/// Push up to `max` silent blocks, keeping `leave` slots free.
fn write_silent_blocks(recv: &mut RecvState, leave: usize, max: usize) -> usize {
    let nsamples = recv.dec_nsamples;
    if nsamples == 0 {
        return 0;
    }
    let sr = recv.dec_samplerate;
    let mut count = 0;
    while count < max {
        let (Some(audio), Some(info)) = (recv.audio.as_mut(), recv.info.as_mut()) else {
            break;
        };
        if audio.vacant_len() < nsamples * (leave + 1) || info.vacant_len() < leave + 1 {
            break;
        }
        audio.push_slice(&recv.silence[..nsamples]);
        let _ = info.try_push(BlockInfo {
            samplerate: sr,
            channel: 0,
        });
        count += 1;
    }
    count
}

/// Drop the oldest block to make room, pushing one silent block in its
/// place.
fn evict_oldest(recv: &mut RecvState, stats: &StreamStats) {
    let Some(old) = recv.jitter.pop_front() else {
        return;
    };
    write_silent_blocks(recv, 0, 1);
    if recv.next <= old.sequence {
        recv.next = old.sequence.wrapping_add(1);
    }
    recv.acks.remove(old.sequence);
    stats.add_lost(1);
    debug!("dropped block {}", old.sequence);
}

/// Pop blocks that have fallen out of the jitter window.
fn check_outdated_blocks(recv: &mut RecvState, stats: &StreamStats) {
    loop {
        let Some(front) = recv.jitter.front() else {
            break;
        };
        if (recv.newest as i64 - front.sequence as i64) < recv.jitter.capacity() as i64 {
            break;
        }
        let old = front.sequence;
        debug!("pop outdated block {}", old);
        recv.jitter.pop_front();
        recv.acks.remove(old);
        if recv.next <= old {
            recv.next = old.wrapping_add(1);
        }
        stats.add_lost(1);
    }
}

/// RT half of one source: move decoded audio through the resampler into
/// the mix buffer and emit state/loss events.
fn source_process(desc: &SourceDesc, mix: &mut [f32], real_sr: f64, host: &HostFormat) -> bool {
    // skip the tick rather than block the audio thread
    let Some(mut play) = desc.play.try_lock() else {
        return false;
    };
    let play = &mut *play;
    let nsamples = play.dec_nsamples;
    if nsamples == 0 {
        return false;
    }

    loop {
        let (Some(audio), Some(info)) = (play.audio.as_mut(), play.info.as_mut()) else {
            return false;
        };
        if audio.occupied_len() < nsamples || info.occupied_len() < 1 {
            break;
        }
        if play.resampler.write_available() < nsamples {
            break;
        }
        let block_info = info.try_pop().unwrap();
        play.channel = block_info.channel;
        play.samplerate = block_info.samplerate;
        audio.pop_slice(&mut play.transfer[..nsamples]);
        play.resampler.write(&play.transfer[..nsamples]);
    }

    // at most one event of each kind per process call
    let endpoint = desc.endpoint;
    let lost = desc.stats.lost.swap(0, Ordering::Relaxed);
    if lost > 0 {
        let _ = desc.events.send(SinkEvent::BlockLost {
            endpoint,
            count: lost,
        });
    }
    let reordered = desc.stats.reordered.swap(0, Ordering::Relaxed);
    if reordered > 0 {
        let _ = desc.events.send(SinkEvent::BlockReordered {
            endpoint,
            count: reordered,
        });
    }
    let resent = desc.stats.resent.swap(0, Ordering::Relaxed);
    if resent > 0 {
        let _ = desc.events.send(SinkEvent::BlockResent {
            endpoint,
            count: resent,
        });
    }
    let gap = desc.stats.gap.swap(0, Ordering::Relaxed);
    if gap > 0 {
        let _ = desc.events.send(SinkEvent::BlockGap {
            endpoint,
            count: gap,
        });
    }

    // retune for the current source rate against our effective rate
    play.resampler.update(play.samplerate, real_sr);

    let readsamples = host.blocksize as usize * play.dec_nchannels;
    if play.read_buf.len() < readsamples {
        play.read_buf.resize(readsamples, 0.0);
    }
    if play.resampler.read(&mut play.read_buf[..readsamples]) {
        // interleaved -> per-channel sum at the source's channel offset;
        // out-of-range source channels are silently dropped
        let nch = play.dec_nchannels;
        let blocksize = host.blocksize as usize;
        for i in 0..nch {
            let chn = i + play.channel.max(0) as usize;
            if chn >= host.nchannels as usize {
                continue;
            }
            let out = &mut mix[chn * blocksize..(chn + 1) * blocksize];
            for (j, sample) in out.iter_mut().enumerate() {
                *sample += play.read_buf[j * nch + i];
            }
        }
        if desc.stats.update_state(StreamState::Play) {
            let _ = desc.events.send(SinkEvent::SourceState {
                endpoint,
                state: StreamState::Play,
            });
        }
        true
    } else {
        // buffer ran dry
        if desc.stats.update_state(StreamState::Stop) {
            let _ = desc.events.send(SinkEvent::SourceState {
                endpoint,
                state: StreamState::Stop,
            });
        }
        false
    }
}
