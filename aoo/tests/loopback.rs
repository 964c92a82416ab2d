//! Source-to-sink loopback over an in-memory wire: clean streaming,
//! single-block loss with retransmission, large gaps and mid-stream
//! format changes.

use std::net::SocketAddr;

use aoo::osc::{self, Args};
use aoo::{
    Endpoint, Format, Sink, SinkEvent, SinkOptions, Source, SourceOptions, StreamState, TimeTag,
};

const SR: i32 = 48000;
const BLOCK: i32 = 64;
const CHANNELS: i32 = 2;

fn src_addr() -> SocketAddr {
    "127.0.0.1:5000".parse().unwrap()
}

fn sink_addr() -> SocketAddr {
    "127.0.0.1:6000".parse().unwrap()
}

fn pcm_format() -> Format {
    Format {
        nchannels: CHANNELS,
        samplerate: SR,
        blocksize: BLOCK,
        codec: "pcm".into(),
    }
}

/// Sequence number of a data message, if it is one.
fn data_sequence(bytes: &[u8]) -> Option<i32> {
    let msg = osc::decode(bytes).ok()?;
    if !msg.addr.ends_with("/data") {
        return None;
    }
    let mut args = Args::new(&msg);
    let _src = args.int().ok()?;
    let _salt = args.int().ok()?;
    args.int().ok()
}

struct Loopback {
    source: Source,
    sink: Sink,
    tt: TimeTag,
    step: f64,
    /// Per-channel output collected across all ticks.
    output: Vec<Vec<f32>>,
    events: Vec<SinkEvent>,
    resend_requests: Vec<(i32, i32)>,
}

impl Loopback {
    fn new(source_opts: SourceOptions, sink_opts: SinkOptions) -> Self {
        aoo::initialize();
        let source = Source::new(1);
        source.setup(SR, BLOCK, CHANNELS, source_opts).unwrap();
        source.set_format(pcm_format()).unwrap();
        source.add_sink(Endpoint::new(sink_addr(), 2), 0);

        let sink = Sink::new(2);
        sink.setup(SR, BLOCK, CHANNELS, sink_opts).unwrap();

        Self {
            source,
            sink,
            tt: TimeTag::from_seconds(3_900_000_000.0),
            step: BLOCK as f64 / SR as f64,
            output: vec![Vec::new(); CHANNELS as usize],
            events: Vec::new(),
            resend_requests: Vec::new(),
        }
    }

    /// Run one audio tick on both ends, carrying datagrams across the
    /// in-memory wire. `drop_data` filters source data messages by
    /// sequence number.
    fn tick(&mut self, input: &[&[f32]], drop_data: &dyn Fn(i32) -> bool) {
        self.tt = TimeTag::from_seconds(self.tt.to_seconds() + self.step);

        self.source.process(input, self.tt);

        // source -> sink; send() moves one block per call, so drain it
        let mut packets = Vec::new();
        let mut guard = 0;
        while self
            .source
            .send(&mut |bytes: &[u8], _| packets.push(bytes.to_vec()))
            && guard < 64
        {
            guard += 1;
        }
        for bytes in packets {
            if let Some(seq) = data_sequence(&bytes) {
                if drop_data(seq) {
                    continue;
                }
            }
            self.sink.handle_message(&bytes, src_addr());
        }

        // sink -> source (requests), replies straight back to the sink
        let mut requests = Vec::new();
        self.sink
            .send(&mut |bytes: &[u8], _| requests.push(bytes.to_vec()));
        for bytes in requests {
            self.record_resend_request(&bytes);
            let sink = &self.sink;
            self.source
                .handle_message(&bytes, sink_addr(), &mut |reply| {
                    sink.handle_message(reply, src_addr());
                });
        }

        // render one block
        let mut left = vec![0.0f32; BLOCK as usize];
        let mut right = vec![0.0f32; BLOCK as usize];
        {
            let mut out: Vec<&mut [f32]> = vec![&mut left, &mut right];
            self.sink.process(&mut out, self.tt);
        }
        self.output[0].extend_from_slice(&left);
        self.output[1].extend_from_slice(&right);

        let events = &mut self.events;
        self.sink.poll_events(&mut |e| events.push(e));
    }

    fn record_resend_request(&mut self, bytes: &[u8]) {
        let Ok(msg) = osc::decode(bytes) else { return };
        if !msg.addr.ends_with("/resend") {
            return;
        }
        let mut args = Args::new(&msg);
        let _sink = args.int().unwrap();
        let _salt = args.int().unwrap();
        while args.remaining() >= 2 {
            let seq = args.int().unwrap();
            let frame = args.int().unwrap();
            self.resend_requests.push((seq, frame));
        }
    }

    fn lost(&self) -> i32 {
        self.events
            .iter()
            .map(|e| match e {
                SinkEvent::BlockLost { count, .. } => *count,
                _ => 0,
            })
            .sum()
    }

    fn resent(&self) -> i32 {
        self.events
            .iter()
            .map(|e| match e {
                SinkEvent::BlockResent { count, .. } => *count,
                _ => 0,
            })
            .sum()
    }

    fn reordered(&self) -> i32 {
        self.events
            .iter()
            .map(|e| match e {
                SinkEvent::BlockReordered { count, .. } => *count,
                _ => 0,
            })
            .sum()
    }

    fn gap(&self) -> i32 {
        self.events
            .iter()
            .map(|e| match e {
                SinkEvent::BlockGap { count, .. } => *count,
                _ => 0,
            })
            .sum()
    }

    fn states(&self) -> Vec<StreamState> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::SourceState { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }
}

/// Deterministic non-zero ramp; channel 1 is the negative of channel 0.
fn ramp_block(tick: usize, channel: usize) -> Vec<f32> {
    (0..BLOCK as usize)
        .map(|j| {
            let g = tick * BLOCK as usize + j;
            let v = ((g % 20000) as f32 + 1.0) / 32768.0;
            if channel == 0 {
                v
            } else {
                -v
            }
        })
        .collect()
}

/// First index with a non-silent sample.
fn first_audio(samples: &[f32]) -> Option<usize> {
    samples.iter().position(|&v| v != 0.0)
}

#[test]
fn test_clean_loopback() {
    let mut link = Loopback::new(SourceOptions::default(), SinkOptions::default());
    let ticks = 200;
    for t in 0..ticks {
        let left = ramp_block(t, 0);
        let right = ramp_block(t, 1);
        let input: Vec<&[f32]> = vec![&left, &right];
        link.tick(&input, &|_| false);
    }

    assert_eq!(link.lost(), 0);
    assert_eq!(link.reordered(), 0);
    assert_eq!(link.resent(), 0);
    assert!(link.resend_requests.is_empty());
    assert_eq!(link.states(), vec![StreamState::Play]);

    // after the configured buffering delay the output is the input;
    // float32 PCM is lossless, only sub-sample resampler drift remains
    let out = &link.output[0];
    let delay = first_audio(out).expect("no audio came through");
    assert!(delay > 0, "expected a playback delay");
    // roughly buffer_ms worth of latency
    let delay_ms = delay as f64 * 1000.0 / SR as f64;
    assert!(
        delay_ms < 60.0,
        "playback delay {delay_ms} ms way over budget"
    );
    let n = out.len() - delay;
    for k in 0..n {
        let g = k % 20000;
        let expected = (g as f32 + 1.0) / 32768.0;
        assert!(
            (out[delay + k] - expected).abs() < 1e-3,
            "sample {k} mismatch: {} vs {expected}",
            out[delay + k]
        );
        assert!((link.output[1][delay + k] + expected).abs() < 1e-3);
    }
}

#[test]
fn test_single_block_loss_is_repaired() {
    let mut link = Loopback::new(SourceOptions::default(), SinkOptions::default());
    let ticks = 200;
    for t in 0..ticks {
        let left = ramp_block(t, 0);
        let right = ramp_block(t, 1);
        let input: Vec<&[f32]> = vec![&left, &right];
        link.tick(&input, &|seq| seq == 100);
    }

    // exactly one whole-block request for the dropped sequence
    let requests_for_100: Vec<_> = link
        .resend_requests
        .iter()
        .filter(|(seq, _)| *seq == 100)
        .collect();
    assert_eq!(requests_for_100, vec![&(100, -1)]);

    assert_eq!(link.resent(), 1);
    assert_eq!(link.lost(), 0);

    // the repaired stream is indistinguishable from a clean one
    let out = &link.output[0];
    let delay = first_audio(out).expect("no audio came through");
    let n = out.len() - delay;
    for k in 0..n {
        let g = k % 20000;
        let expected = (g as f32 + 1.0) / 32768.0;
        assert!(
            (out[delay + k] - expected).abs() < 1e-3,
            "sample {k} mismatch: {} vs {expected}",
            out[delay + k]
        );
    }
}

#[test]
fn test_large_gap_resets_without_request_storm() {
    let mut link = Loopback::new(SourceOptions::default(), SinkOptions::default());
    let ticks = 400;
    for t in 0..ticks {
        let left = ramp_block(t, 0);
        let right = ramp_block(t, 1);
        let input: Vec<&[f32]> = vec![&left, &right];
        link.tick(&input, &|seq| (200..=260).contains(&seq));
    }

    assert!(link.gap() >= 61, "gap {} too small", link.gap());
    assert!(link.lost() >= 61, "lost {} too small", link.lost());

    // the sink must not try to recover all 61 blocks
    assert!(
        !link
            .resend_requests
            .iter()
            .any(|(seq, _)| (200..=260).contains(seq)),
        "requested retransmission inside a large gap"
    );

    // the buffer ran dry during the gap and playback resumed after it
    let states = link.states();
    assert!(states.contains(&StreamState::Stop));
    assert_eq!(*states.last().unwrap(), StreamState::Play);

    // stream continues after the gap: the tail of the output matches the
    // tail of the input
    let out = &link.output[0];
    let tail = &out[out.len() - BLOCK as usize..];
    assert!(tail.iter().any(|&v| v != 0.0), "no audio after the gap");
}

#[test]
fn test_format_change_mid_stream() {
    let mut link = Loopback::new(SourceOptions::default(), SinkOptions::default());
    for t in 0..100 {
        let left = ramp_block(t, 0);
        let right = ramp_block(t, 1);
        let input: Vec<&[f32]> = vec![&left, &right];
        link.tick(&input, &|_| false);
    }

    // switch to a bigger block size; the salt changes and the sink must
    // renegotiate
    let mut fmt = pcm_format();
    fmt.blocksize = 128;
    link.source.set_format(fmt).unwrap();

    let before = link
        .events
        .iter()
        .filter(|e| matches!(e, SinkEvent::SourceFormat { .. }))
        .count();

    for t in 100..300 {
        let left = ramp_block(t, 0);
        let right = ramp_block(t, 1);
        let input: Vec<&[f32]> = vec![&left, &right];
        link.tick(&input, &|_| false);
    }

    let after = link
        .events
        .iter()
        .filter(|e| matches!(e, SinkEvent::SourceFormat { .. }))
        .count();
    assert!(after > before, "sink never saw the new format");

    // audio keeps flowing with the new block size
    assert_eq!(*link.states().last().unwrap(), StreamState::Play);
    let out = &link.output[0];
    let tail = &out[out.len() - BLOCK as usize..];
    assert!(tail.iter().any(|&v| v != 0.0), "no audio after format change");
}

#[test]
fn test_ping_round_trip() {
    let mut source_opts = SourceOptions::default();
    source_opts.ping_interval = 1e-9; // effectively every send
    let mut link = Loopback::new(source_opts, SinkOptions::default());

    for t in 0..100 {
        let left = ramp_block(t, 0);
        let right = ramp_block(t, 1);
        let input: Vec<&[f32]> = vec![&left, &right];
        link.tick(&input, &|_| false);
    }

    // the sink saw pings from the source
    assert!(link
        .events
        .iter()
        .any(|e| matches!(e, SinkEvent::Ping { .. })));

    // and the source saw the sink's replies
    let mut source_pings = 0;
    link.source.poll_events(&mut |e| {
        if matches!(e, aoo::SourceEvent::Ping { .. }) {
            source_pings += 1;
        }
    });
    assert!(source_pings > 0, "source never saw a ping reply");
}

#[test]
fn test_skip_marker_plays_as_silence() {
    // a custom tick that makes the encoder emit a zero-size block is not
    // reachable through the public API with the PCM codec, so exercise
    // the wire shape directly: hand-craft a data message with
    // total_size == 0 and make sure the sink treats it as one silent
    // block without counting a loss.
    aoo::initialize();
    let sink = Sink::new(2);
    sink.setup(SR, BLOCK, CHANNELS, SinkOptions::default()).unwrap();

    // negotiate a format first
    let source = Source::new(1);
    source
        .setup(SR, BLOCK, CHANNELS, SourceOptions::default())
        .unwrap();
    source.set_format(pcm_format()).unwrap();
    source.add_sink(Endpoint::new(sink_addr(), 2), 0);
    let mut salt = 0;
    source.send(&mut |bytes: &[u8], _| {
        let msg = osc::decode(bytes).unwrap();
        let mut args = Args::new(&msg);
        let _ = args.int().unwrap();
        salt = args.int().unwrap();
        sink.handle_message(bytes, src_addr());
    });

    // one real block, one skip marker, one real block
    let payload = vec![0u8; (BLOCK * CHANNELS * 4) as usize];
    for (seq, skip) in [(0, false), (1, true), (2, false)] {
        let (total, blob) = if skip {
            (0, Vec::new())
        } else {
            (payload.len() as i32, payload.clone())
        };
        let bytes = osc::encode(
            osc::address(osc::Role::Sink, 2, osc::MSG_DATA),
            vec![
                rosc::OscType::Int(1),
                rosc::OscType::Int(salt),
                rosc::OscType::Int(seq),
                rosc::OscType::Double(SR as f64),
                rosc::OscType::Int(0),
                rosc::OscType::Int(total),
                rosc::OscType::Int(1),
                rosc::OscType::Int(0),
                rosc::OscType::Blob(blob),
            ],
        )
        .unwrap();
        sink.handle_message(&bytes, src_addr());
    }

    let mut events = Vec::new();
    let mut left = vec![0.0f32; BLOCK as usize];
    let mut right = vec![0.0f32; BLOCK as usize];
    let mut out: Vec<&mut [f32]> = vec![&mut left, &mut right];
    sink.process(&mut out, TimeTag::from_seconds(3_900_000_000.0));
    sink.poll_events(&mut |e| events.push(e));

    // all three blocks were accepted in order; nothing counts as lost
    assert!(!events
        .iter()
        .any(|e| matches!(e, SinkEvent::BlockLost { .. })));
}
