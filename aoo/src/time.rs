//! Timing subsystem: OSC/NTP time tags, the time-DLL that smooths the
//! measured block period into an effective sample rate, and a timer that
//! detects DSP scheduling glitches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970),
/// leap years included.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Scale factor between nanoseconds and the 32-bit NTP fraction.
const FRAC_PER_NANO: f64 = 4.294_967_296; // 2^32 / 1e9

/// 64-bit OSC/NTP time stamp: seconds since 1900 in the high word,
/// fractional seconds x 2^32 in the low word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeTag(pub u64);

impl TimeTag {
    /// Current system time as an NTP time tag.
    pub fn now() -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seconds = epoch.as_secs() + NTP_UNIX_OFFSET;
        let frac = (epoch.subsec_nanos() as f64 * FRAC_PER_NANO) as u64 & 0xFFFF_FFFF;
        TimeTag((seconds << 32) | frac)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn seconds(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn fraction(&self) -> u32 {
        self.0 as u32
    }

    pub fn to_seconds(&self) -> f64 {
        (self.0 >> 32) as f64 + (self.0 as u32) as f64 / 4_294_967_296.0
    }

    pub fn from_seconds(s: f64) -> Self {
        let secs = s.floor();
        let frac = ((s - secs) * 4_294_967_296.0) as u64 & 0xFFFF_FFFF;
        TimeTag(((secs as u64) << 32) | frac)
    }

    /// Signed duration `b - a` in seconds.
    pub fn duration(a: TimeTag, b: TimeTag) -> f64 {
        if b.0 >= a.0 {
            TimeTag(b.0.wrapping_sub(a.0)).to_seconds()
        } else {
            -TimeTag(a.0.wrapping_sub(b.0)).to_seconds()
        }
    }
}

impl From<u64> for TimeTag {
    fn from(raw: u64) -> Self {
        TimeTag(raw)
    }
}

impl From<TimeTag> for rosc::OscTime {
    fn from(tt: TimeTag) -> Self {
        rosc::OscTime {
            seconds: tt.seconds(),
            fractional: tt.fraction(),
        }
    }
}

impl From<rosc::OscTime> for TimeTag {
    fn from(t: rosc::OscTime) -> Self {
        TimeTag(((t.seconds as u64) << 32) | t.fractional as u64)
    }
}

/// Delay-locked loop that filters the measured period between successive
/// `process()` calls into a smoothed block period and effective sample rate.
///
/// Two-pole IIR after Fons Adriaensen ("Using a DLL to filter time").
/// `bandwidth` in (0, 1] scales the loop gain; lower values track slower
/// but reject more jitter.
#[derive(Debug, Clone, Default)]
pub struct TimeDll {
    blocksize: f64,
    b: f64,
    c: f64,
    t0: f64,
    t1: f64,
    e2: f64,
}

impl TimeDll {
    /// Reset the loop for a nominal rate and block size, anchored at time
    /// `t` (seconds).
    pub fn setup(&mut self, samplerate: f64, blocksize: i32, bandwidth: f64, t: f64) {
        self.blocksize = blocksize as f64;
        let tper = blocksize as f64 / samplerate;
        let omega = 2.0 * std::f64::consts::PI * bandwidth * tper;
        self.b = std::f64::consts::SQRT_2 * omega;
        self.c = omega * omega;
        self.e2 = tper;
        self.t0 = t;
        self.t1 = t + tper;
    }

    /// Feed the observed time (seconds) of the current block boundary.
    pub fn update(&mut self, t: f64) {
        let e = t - self.t1;
        self.t0 = self.t1;
        self.t1 += self.b * e + self.e2;
        self.e2 += self.c * e;
    }

    /// Smoothed block duration in seconds.
    pub fn period(&self) -> f64 {
        self.t1 - self.t0
    }

    /// Smoothed effective sample rate.
    pub fn samplerate(&self) -> f64 {
        self.blocksize / self.period()
    }
}

/// Outcome of one [`Timer::update`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerState {
    /// First call after a reset; the caller should (re)initialize its DLL.
    Reset,
    Ok,
    /// The moving-average block delta exceeded the tolerance; the payload is
    /// the excess of the last delta over the nominal delta in seconds.
    Error(f64),
}

const TIMER_WINDOW: usize = 64;

/// Tolerated relative deviation of the average delta from the nominal one.
const TIMER_TOLERANCE: f64 = 0.25;

/// Tracks elapsed stream time from the host's block time tags and flags
/// scheduling glitches.
///
/// With a ring-buffer scheduler the host delivers several blocks in a
/// burst: one long delta followed by short ones. The moving average over
/// the last 64 deltas stays near the nominal delta in that case; only a
/// genuinely late DSP tick pushes it over the tolerance.
pub struct Timer {
    /// Raw time tag of the last update; readable from any thread.
    last: AtomicU64,
    /// Elapsed seconds as f64 bits; readable from any thread.
    elapsed: AtomicU64,
    nominal_delta: f64,
    sum: f64,
    deltas: [f64; TIMER_WINDOW],
    head: usize,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
            elapsed: AtomicU64::new(0),
            nominal_delta: 0.0,
            sum: 0.0,
            deltas: [0.0; TIMER_WINDOW],
            head: 0,
        }
    }

    pub fn setup(&mut self, samplerate: i32, blocksize: i32) {
        self.nominal_delta = blocksize as f64 / samplerate as f64;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.last.store(0, Ordering::Relaxed);
        self.elapsed.store(0f64.to_bits(), Ordering::Relaxed);
        self.deltas = [self.nominal_delta; TIMER_WINDOW];
        self.sum = self.nominal_delta * TIMER_WINDOW as f64;
        self.head = 0;
    }

    /// Elapsed stream time in seconds since the last reset.
    pub fn elapsed(&self) -> f64 {
        f64::from_bits(self.elapsed.load(Ordering::Relaxed))
    }

    /// Absolute time tag of the last update.
    pub fn absolute(&self) -> TimeTag {
        TimeTag(self.last.load(Ordering::Relaxed))
    }

    pub fn update(&mut self, t: TimeTag) -> TimerState {
        let last = TimeTag(self.last.load(Ordering::Relaxed));
        self.last.store(t.0, Ordering::Relaxed);
        if last.is_empty() {
            return TimerState::Reset;
        }

        let delta = TimeTag::duration(last, t);
        let elapsed = self.elapsed() + delta;
        self.elapsed.store(elapsed.to_bits(), Ordering::Relaxed);

        // recursive moving average over the delta window
        self.head = (self.head + 1) & (TIMER_WINDOW - 1);
        self.sum += delta - self.deltas[self.head];
        self.deltas[self.head] = delta;

        let average = self.sum / TIMER_WINDOW as f64;
        if average - self.nominal_delta > self.nominal_delta * TIMER_TOLERANCE {
            TimerState::Error((delta - self.nominal_delta).max(0.0))
        } else {
            TimerState::Ok
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timetag_roundtrip() {
        let tt = TimeTag::from_seconds(3_800_000_000.5);
        assert_eq!(tt.seconds(), 3_800_000_000);
        assert!((tt.to_seconds() - 3_800_000_000.5).abs() < 1e-6);
    }

    #[test]
    fn test_timetag_duration() {
        let a = TimeTag::from_seconds(100.0);
        let b = TimeTag::from_seconds(100.25);
        assert!((TimeTag::duration(a, b) - 0.25).abs() < 1e-9);
        assert!((TimeTag::duration(b, a) + 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_dll_converges_to_nominal() {
        // constant input period -> samplerate converges to nominal
        let sr = 48000.0;
        let blocksize = 64;
        let period = blocksize as f64 / sr;
        for bw in [0.012, 0.1, 0.5, 1.0] {
            let mut dll = TimeDll::default();
            dll.setup(sr, blocksize, bw, 0.0);
            let mut t = 0.0;
            for _ in 0..20000 {
                t += period;
                dll.update(t);
            }
            let err = (dll.samplerate() - sr).abs() / sr;
            assert!(err < 1e-6, "bw {bw}: relative error {err}");
        }
    }

    #[test]
    fn test_dll_tracks_offset_rate() {
        // input running 0.1% fast -> samplerate converges to the real rate
        let sr = 48000.0;
        let real_sr = sr * 1.001;
        let blocksize = 64;
        let period = blocksize as f64 / real_sr;
        let mut dll = TimeDll::default();
        dll.setup(sr, blocksize, 0.1, 0.0);
        let mut t = 0.0;
        for _ in 0..50000 {
            t += period;
            dll.update(t);
        }
        let err = (dll.samplerate() - real_sr).abs() / real_sr;
        assert!(err < 1e-5, "relative error {err}");
    }

    #[test]
    fn test_timer_detects_glitch() {
        let mut timer = Timer::new();
        timer.setup(48000, 64);
        let nominal = 64.0 / 48000.0;

        let mut now = TimeTag::from_seconds(1000.0);
        assert_eq!(timer.update(now), TimerState::Reset);

        for _ in 0..100 {
            now = TimeTag::from_seconds(now.to_seconds() + nominal);
            assert_eq!(timer.update(now), TimerState::Ok);
        }

        // one enormous delta blows the moving average
        now = TimeTag::from_seconds(now.to_seconds() + nominal * 100.0);
        match timer.update(now) {
            TimerState::Error(err) => assert!(err > nominal * 50.0),
            other => panic!("expected error state, got {other:?}"),
        }
    }

    #[test]
    fn test_timer_elapsed() {
        let mut timer = Timer::new();
        timer.setup(48000, 64);
        let nominal = 64.0 / 48000.0;
        let mut now = TimeTag::from_seconds(5.0);
        timer.update(now);
        for _ in 0..10 {
            now = TimeTag::from_seconds(now.to_seconds() + nominal);
            timer.update(now);
        }
        assert!((timer.elapsed() - nominal * 10.0).abs() < 1e-6);
    }
}
