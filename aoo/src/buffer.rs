//! Block storage shared by the source and sink engines: the retransmission
//! history ring, the sink-side jitter buffer with per-frame reassembly,
//! the resend bookkeeping list and the dynamic resampler.

use std::collections::VecDeque;

use tracing::warn;

/// Upper bound on the number of UDP frames one block may be split into;
/// the reassembly bitset is sized for it.
pub const MAX_BLOCK_FRAMES: i32 = 256;

const FRAME_BITS_WORDS: usize = (MAX_BLOCK_FRAMES as usize) / 64;

/// One encoded block in the retransmission history.
#[derive(Debug, Clone)]
pub struct Block {
    pub sequence: i32,
    pub samplerate: f64,
    data: Vec<u8>,
    nframes: i32,
    framesize: i32,
}

impl Default for Block {
    fn default() -> Self {
        Self {
            sequence: -1,
            samplerate: 0.0,
            data: Vec::new(),
            nframes: 0,
            framesize: 0,
        }
    }
}

impl Block {
    pub fn set(&mut self, sequence: i32, samplerate: f64, data: &[u8], nframes: i32, framesize: i32) {
        self.sequence = sequence;
        self.samplerate = samplerate;
        self.data.clear();
        self.data.extend_from_slice(data);
        self.nframes = nframes;
        self.framesize = framesize;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> i32 {
        self.data.len() as i32
    }

    pub fn num_frames(&self) -> i32 {
        self.nframes
    }

    /// Byte range of one frame; the last frame may be shorter.
    pub fn frame(&self, which: i32) -> Option<&[u8]> {
        if which < 0 || which >= self.nframes {
            return None;
        }
        let onset = (which * self.framesize) as usize;
        if which == self.nframes - 1 {
            Some(&self.data[onset..])
        } else {
            Some(&self.data[onset..onset + self.framesize as usize])
        }
    }
}

/// A block being reassembled from its frames in the jitter buffer.
#[derive(Debug, Clone)]
pub struct ReceivedBlock {
    pub sequence: i32,
    pub samplerate: f64,
    pub channel: i32,
    buffer: Vec<u8>,
    nframes: i32,
    framesize: i32,
    /// Bit i set = frame i still missing.
    frames_missing: [u64; FRAME_BITS_WORDS],
    dropped: bool,
}

impl ReceivedBlock {
    pub fn new(sequence: i32, samplerate: f64, channel: i32, nbytes: i32, nframes: i32) -> Self {
        debug_assert!(nbytes > 0 && nframes > 0 && nframes <= MAX_BLOCK_FRAMES);
        let mut frames_missing = [0u64; FRAME_BITS_WORDS];
        for i in 0..nframes {
            frames_missing[(i / 64) as usize] |= 1u64 << (i % 64);
        }
        Self {
            sequence,
            samplerate,
            channel,
            buffer: vec![0; nbytes as usize],
            nframes,
            framesize: 0,
            frames_missing,
            dropped: false,
        }
    }

    /// A deliberately skipped block: complete by construction, decodes as
    /// silence.
    pub fn new_dropped(sequence: i32, samplerate: f64) -> Self {
        Self {
            sequence,
            samplerate,
            channel: 0,
            buffer: Vec::new(),
            nframes: 0,
            framesize: 0,
            frames_missing: [0u64; FRAME_BITS_WORDS],
            dropped: true,
        }
    }

    pub fn dropped(&self) -> bool {
        self.dropped
    }

    pub fn complete(&self) -> bool {
        self.frames_missing.iter().all(|&w| w == 0)
    }

    pub fn num_frames(&self) -> i32 {
        self.nframes
    }

    pub fn has_frame(&self, which: i32) -> bool {
        debug_assert!(which >= 0 && which < self.nframes);
        self.frames_missing[(which / 64) as usize] & (1u64 << (which % 64)) == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Copy one frame into its slot and clear its missing bit. The last
    /// frame is aligned to the end of the buffer.
    pub fn add_frame(&mut self, which: i32, data: &[u8]) {
        debug_assert!(which >= 0 && which < self.nframes);
        let n = data.len();
        if which == self.nframes - 1 {
            let onset = self.buffer.len() - n;
            self.buffer[onset..].copy_from_slice(data);
        } else {
            let onset = which as usize * n;
            self.buffer[onset..onset + n].copy_from_slice(data);
            self.framesize = n as i32;
        }
        self.frames_missing[(which / 64) as usize] &= !(1u64 << (which % 64));
    }
}

/// Ordered window of received blocks awaiting completion and decode.
///
/// Blocks are kept sorted by sequence; lookups and insertions binary
/// search the deque.
pub struct JitterBuffer {
    blocks: VecDeque<ReceivedBlock>,
    capacity: usize,
}

impl JitterBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.blocks.clear();
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn front(&self) -> Option<&ReceivedBlock> {
        self.blocks.front()
    }

    pub fn pop_front(&mut self) -> Option<ReceivedBlock> {
        self.blocks.pop_front()
    }

    pub fn find_mut(&mut self, sequence: i32) -> Option<&mut ReceivedBlock> {
        // most packets complete the most recent block
        if self.blocks.back().map(|b| b.sequence) == Some(sequence) {
            return self.blocks.back_mut();
        }
        let idx = self.blocks.partition_point(|b| b.sequence < sequence);
        match self.blocks.get(idx) {
            Some(b) if b.sequence == sequence => self.blocks.get_mut(idx),
            _ => None,
        }
    }

    /// Insert a block keeping sequence order. The caller has checked that
    /// the buffer is not full and the sequence is not present.
    pub fn insert(&mut self, block: ReceivedBlock) -> &mut ReceivedBlock {
        debug_assert!(!self.is_full());
        let idx = self.blocks.partition_point(|b| b.sequence < block.sequence);
        self.blocks.insert(idx, block);
        &mut self.blocks[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReceivedBlock> {
        self.blocks.iter()
    }
}

/// Per-sequence retransmission bookkeeping: when a resend was last
/// requested and how many times.
#[derive(Debug, Clone, Copy)]
pub struct BlockAck {
    pub sequence: i32,
    num_tries: i32,
    timestamp: f64,
}

impl BlockAck {
    fn new(sequence: i32) -> Self {
        Self {
            sequence,
            num_tries: 0,
            timestamp: -1e9,
        }
    }

    pub fn num_tries(&self) -> i32 {
        self.num_tries
    }

    /// True when another request may go out: the retry limit is not
    /// exhausted and at least `interval` seconds have passed since the
    /// last one. Updates the bookkeeping on success.
    pub fn check(&mut self, time: f64, interval: f64, limit: i32) -> bool {
        if self.num_tries >= limit {
            return false;
        }
        if time - self.timestamp < interval {
            return false;
        }
        self.timestamp = time;
        self.num_tries += 1;
        true
    }
}

/// Sorted vector of [`BlockAck`] entries keyed by sequence.
///
/// Of the two historical layouts (open-addressing hash vs. sorted vector)
/// this is the sorted vector: lookups are O(log n), removal of outdated
/// entries is a single drain, and the entry count is bounded by the
/// jitter capacity anyway.
pub struct BlockAckList {
    data: Vec<BlockAck>,
    limit: i32,
}

impl BlockAckList {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            limit: 0,
        }
    }

    pub fn set_limit(&mut self, limit: i32) {
        self.limit = limit;
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains(&self, sequence: i32) -> bool {
        self.data
            .binary_search_by_key(&sequence, |a| a.sequence)
            .is_ok()
    }

    /// Run [`BlockAck::check`] for `sequence`, inserting the entry first
    /// if needed.
    pub fn check(&mut self, sequence: i32, time: f64, interval: f64) -> bool {
        let limit = self.limit;
        let idx = match self.data.binary_search_by_key(&sequence, |a| a.sequence) {
            Ok(idx) => idx,
            Err(idx) => {
                self.data.insert(idx, BlockAck::new(sequence));
                idx
            }
        };
        self.data[idx].check(time, interval, limit)
    }

    pub fn remove(&mut self, sequence: i32) -> bool {
        match self.data.binary_search_by_key(&sequence, |a| a.sequence) {
            Ok(idx) => {
                self.data.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    /// Drop every entry older than `sequence`; returns how many were
    /// removed.
    pub fn remove_before(&mut self, sequence: i32) -> usize {
        let idx = self.data.partition_point(|a| a.sequence < sequence);
        self.data.drain(..idx).count()
    }

    /// Smallest retained sequence, for invariant checks.
    pub fn oldest(&self) -> Option<i32> {
        self.data.first().map(|a| a.sequence)
    }
}

/// Ring of the last N emitted blocks, indexed by sequence, for answering
/// resend requests. An empty ring disables retransmission.
pub struct HistoryBuffer {
    blocks: Vec<Block>,
    head: usize,
    /// Sequence of the most recently evicted block.
    oldest: i32,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: vec![Block::default(); capacity],
            head: 0,
            oldest: -1,
        }
    }

    pub fn resize(&mut self, capacity: usize) {
        self.blocks = vec![Block::default(); capacity];
        self.clear();
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.oldest = -1;
        for block in &mut self.blocks {
            block.sequence = -1;
        }
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn push(&mut self, sequence: i32, samplerate: f64, data: &[u8], nframes: i32, framesize: i32) {
        if self.blocks.is_empty() {
            return;
        }
        if self.blocks[self.head].sequence >= 0 {
            self.oldest = self.blocks[self.head].sequence;
        }
        self.blocks[self.head].set(sequence, samplerate, data, nframes, framesize);
        self.head = (self.head + 1) % self.blocks.len();
    }

    pub fn find(&self, sequence: i32) -> Option<&Block> {
        if sequence <= self.oldest {
            return None;
        }
        // blocks are pushed in order, so [head..] (the oldest entries)
        // and [..head] (the most recent ones) are both sorted runs
        let (recent, oldest) = self.blocks.split_at(self.head);
        Self::search(oldest, sequence).or_else(|| Self::search(recent, sequence))
    }

    fn search(run: &[Block], sequence: i32) -> Option<&Block> {
        let idx = run.partition_point(|b| b.sequence < sequence);
        match run.get(idx) {
            Some(b) if b.sequence == sequence => Some(b),
            _ => None,
        }
    }
}

/// Extra capacity factor for rate fluctuations and odd block sizes.
const RESAMPLER_SPACE: f64 = 2.5;

/// Linear-interpolation resampler whose ratio is retuned every block from
/// the smoothed source and sink sample rates.
pub struct DynamicResampler {
    buffer: Vec<f32>,
    nchannels: usize,
    rdpos: f64,
    wrpos: usize,
    balance: f64,
    ratio: f64,
    ideal_ratio: f64,
}

impl DynamicResampler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            nchannels: 1,
            rdpos: 0.0,
            wrpos: 0,
            balance: 0.0,
            ratio: 1.0,
            ideal_ratio: 1.0,
        }
    }

    pub fn setup(&mut self, nfrom: i32, nto: i32, srfrom: i32, srto: i32, nchannels: i32) {
        self.clear();
        self.nchannels = nchannels.max(1) as usize;
        self.ideal_ratio = srto as f64 / srfrom as f64;
        let mut blocksize = if self.ideal_ratio < 1.0 {
            // downsampling needs more input per output block
            nfrom.max((nto as f64 / self.ideal_ratio + 0.5) as i32)
        } else {
            nfrom.max(nto)
        } as f64;
        blocksize *= RESAMPLER_SPACE;
        self.buffer = vec![0.0; blocksize as usize * self.nchannels];
        self.update(srfrom as f64, srto as f64);
    }

    pub fn clear(&mut self) {
        self.ratio = 1.0;
        self.rdpos = 0.0;
        self.wrpos = 0;
        self.balance = 0.0;
    }

    pub fn ratio(&self) -> f64 {
        self.ideal_ratio
    }

    pub fn update(&mut self, srfrom: f64, srto: f64) {
        if srfrom == srto {
            self.ratio = 1.0;
        } else {
            self.ratio = srto / srfrom;
        }
    }

    pub fn write_available(&self) -> usize {
        (self.buffer.len() as f64 - self.balance).max(0.0) as usize
    }

    /// Write `data` into the ring; fails when there is no room.
    pub fn write(&mut self, data: &[f32]) -> bool {
        let n = data.len();
        let size = self.buffer.len();
        if size.saturating_sub(self.balance as usize) < n {
            return false;
        }
        let end = self.wrpos + n;
        let split = if end > size { size - self.wrpos } else { n };
        self.buffer[self.wrpos..self.wrpos + split].copy_from_slice(&data[..split]);
        self.buffer[..n - split].copy_from_slice(&data[split..]);
        self.wrpos = (self.wrpos + n) % size;
        self.balance += n as f64;
        true
    }

    /// Read `out.len()` samples at the current ratio; fails when not
    /// enough input has accumulated.
    pub fn read(&mut self, out: &mut [f32]) -> bool {
        let n = out.len();
        let size = self.buffer.len();
        if size == 0 || n == 0 {
            return false;
        }
        let limit = size / self.nchannels;
        let advance = 1.0 / self.ratio;

        if self.ratio == 1.0 && self.rdpos.fract() == 0.0 {
            // pass-through fast path
            if (self.balance as usize) < n {
                return false;
            }
            let pos = self.rdpos as usize * self.nchannels;
            let end = pos + n;
            let split = if end > size { size - pos } else { n };
            out[..split].copy_from_slice(&self.buffer[pos..pos + split]);
            out[split..].copy_from_slice(&self.buffer[..n - split]);
            self.rdpos = ((pos + n) % size / self.nchannels) as f64;
            self.balance -= n as f64;
            return true;
        }

        // interpolating path; keep one frame of headroom for the
        // look-ahead sample
        let avail = ((self.balance * self.ratio) as usize / self.nchannels) * self.nchannels;
        if avail <= n {
            return false;
        }
        let mut pos = self.rdpos;
        let mut i = 0;
        while i < n {
            let index = pos as usize;
            let fract = (pos - index as f64) as f32;
            for j in 0..self.nchannels {
                let idx1 = index * self.nchannels + j;
                let mut idx2 = (index + 1) * self.nchannels + j;
                if idx2 >= size {
                    idx2 -= size;
                }
                let a = self.buffer[idx1];
                let b = self.buffer[idx2];
                out[i + j] = a + (b - a) * fract;
            }
            pos += advance;
            if pos >= limit as f64 {
                pos -= limit as f64;
            }
            i += self.nchannels;
        }
        self.rdpos = pos;
        self.balance -= n as f64 * advance;
        if self.balance < 0.0 {
            warn!("resampler balance underflow");
            self.balance = 0.0;
        }
        true
    }
}
