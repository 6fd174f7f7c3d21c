use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Beats wrap at this value; `jump_to_beat` relocates into `1..=MAX_BEAT`.
pub const MAX_BEAT: u64 = 65536;
pub const BEATS_PER_BAR: u64 = 4;

/// Lock-free f64 cell, the bit-pattern-in-an-atomic trick the teacher crate's
/// neighbourhood (deck playback state) uses for audio-thread-shared floats.
pub(crate) struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        AtomicF64 {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.bits.load(order))
    }

    pub fn store(&self, value: f64, order: Ordering) {
        self.bits.store(value.to_bits(), order)
    }
}

/// Immutable snapshot of the metronome at one instant (spec.md's Snapshot entity).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub beat: u64,
    pub beat_within_bar: u8,
    pub tempo: f64,
    pub beat_interval_ms: f64,
    pub bar_interval_ms: f64,
    /// Signed distance in ms from `now` to the nearest beat boundary;
    /// negative means the beat already passed.
    pub distance_from_nearest_beat_ms: f64,
}

/// Monotonic beat counter with adjustable phase, per spec.md §3/§4.9.
///
/// `start` is the instant beat 1 begins. Tempo is stored lock-free so the
/// status-send and beat-sender tasks can read it without blocking the
/// ingest task that may be adjusting it concurrently.
pub struct Metronome {
    start: std::sync::Mutex<Instant>,
    tempo_bpm: AtomicF64,
}

impl Metronome {
    pub fn new(tempo_bpm: f64) -> Self {
        assert!(tempo_bpm > 0.0, "tempo must be positive");
        Metronome {
            start: std::sync::Mutex::new(Instant::now()),
            tempo_bpm: AtomicF64::new(tempo_bpm),
        }
    }

    pub fn tempo(&self) -> f64 {
        self.tempo_bpm.load(Ordering::Acquire)
    }

    /// Sets tempo in place, preserving the beat that is currently sounding.
    pub fn set_tempo(&self, new_tempo: f64, now: Instant) {
        assert!(new_tempo > 0.0, "tempo must be positive");
        let beat = self.beat_at(now);
        self.tempo_bpm.store(new_tempo, Ordering::Release);
        self.set_beat_start(beat, now, new_tempo);
    }

    fn beat_interval_ms_for(tempo: f64) -> f64 {
        60_000.0 / tempo
    }

    pub fn beat_interval_ms(&self) -> f64 {
        Self::beat_interval_ms_for(self.tempo())
    }

    pub fn bar_interval_ms(&self) -> f64 {
        self.beat_interval_ms() * BEATS_PER_BAR as f64
    }

    /// Beat number at `now`: floor((now - start) * bpm / 60_000) + 1.
    pub fn beat_at(&self, now: Instant) -> u64 {
        let start = *self.start.lock().unwrap();
        let elapsed_ms = now.saturating_duration_since(start).as_secs_f64() * 1000.0;
        let tempo = self.tempo();
        let beats_elapsed = (elapsed_ms * tempo / 60_000.0).floor();
        (beats_elapsed as i64 + 1).max(1) as u64
    }

    pub fn beat(&self) -> u64 {
        self.beat_at(Instant::now())
    }

    pub fn beat_within_bar_at(&self, now: Instant) -> u8 {
        let beat = self.beat_at(now);
        (((beat - 1) % BEATS_PER_BAR) + 1) as u8
    }

    pub fn beat_within_bar(&self) -> u8 {
        self.beat_within_bar_at(Instant::now())
    }

    fn set_beat_start(&self, beat: u64, now: Instant, tempo: f64) {
        let interval = Self::beat_interval_ms_for(tempo);
        let offset_ms = (beat - 1) as f64 * interval;
        let mut start = self.start.lock().unwrap();
        *start = now - std::time::Duration::from_secs_f64(offset_ms / 1000.0);
    }

    /// Relocates the timeline so beat `n` (wrapped into `1..=MAX_BEAT`) is
    /// current. Never produces beat 0 (spec.md §3 invariant).
    pub fn jump_to_beat(&self, n: u64, now: Instant) {
        let wrapped = if n == 0 {
            1
        } else {
            ((n - 1) % MAX_BEAT) + 1
        };
        self.set_beat_start(wrapped, now, self.tempo());
    }

    /// Nudges the phase by `delta_ms` (negative moves the timeline earlier,
    /// i.e. the next beat arrives sooner). If the resulting beat would drop
    /// below 1, a bar's worth of beats is added back to stay monotonic
    /// (spec.md §3's metronome invariant).
    pub fn adjust_start(&self, delta_ms: f64, now: Instant) {
        let mut start = self.start.lock().unwrap();
        if delta_ms >= 0.0 {
            *start -= std::time::Duration::from_secs_f64(delta_ms / 1000.0);
        } else {
            *start += std::time::Duration::from_secs_f64((-delta_ms) / 1000.0);
        }
        // A large negative delta can push start past `now`, which would
        // make beat_at(now) read as beat 1 forever. Add a bar back to stay
        // monotonic instead (spec.md §3's metronome invariant).
        if *start > now {
            let bar_ms = Self::beat_interval_ms_for(self.tempo()) * BEATS_PER_BAR as f64;
            *start -= std::time::Duration::from_secs_f64(bar_ms / 1000.0);
        }
    }

    /// Snaps the running phase to the nearest beat boundary (used by the
    /// sync-follower on receipt of a master beat, spec.md §4.7).
    pub fn snap_to_beat(&self, now: Instant) {
        let beat = self.beat_at(now);
        self.set_beat_start(beat, now, self.tempo());
    }

    pub fn snapshot_at(&self, now: Instant) -> Snapshot {
        let tempo = self.tempo();
        let beat = self.beat_at(now);
        let beat_within_bar = self.beat_within_bar_at(now);
        let interval = Self::beat_interval_ms_for(tempo);
        let start = *self.start.lock().unwrap();
        let elapsed_ms = now.saturating_duration_since(start).as_secs_f64() * 1000.0;
        let phase_ms = elapsed_ms - (beat - 1) as f64 * interval;
        let distance = if phase_ms <= interval / 2.0 {
            -phase_ms
        } else {
            interval - phase_ms
        };
        Snapshot {
            beat,
            beat_within_bar,
            tempo,
            beat_interval_ms: interval,
            bar_interval_ms: interval * BEATS_PER_BAR as f64,
            distance_from_nearest_beat_ms: distance,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_at(Instant::now())
    }

    /// Milliseconds from `now` until the next beat boundary (always >= 0).
    pub fn time_until_next_beat_ms(&self, now: Instant) -> f64 {
        let interval = self.beat_interval_ms();
        let start = *self.start.lock().unwrap();
        let elapsed_ms = now.saturating_duration_since(start).as_secs_f64() * 1000.0;
        let into_beat = elapsed_ms % interval;
        if into_beat <= f64::EPSILON {
            0.0
        } else {
            interval - into_beat
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn beat_starts_at_one() {
        let m = Metronome::new(120.0);
        assert_eq!(m.beat_at(Instant::now()), 1);
    }

    #[test]
    fn beat_advances_with_tempo() {
        let m = Metronome::new(120.0);
        let now = Instant::now();
        // 120 BPM -> 500ms/beat.
        assert_eq!(m.beat_at(now + Duration::from_millis(499)), 1);
        assert_eq!(m.beat_at(now + Duration::from_millis(500)), 2);
        assert_eq!(m.beat_at(now + Duration::from_millis(5500)), 12);
    }

    #[test]
    fn jump_to_beat_wraps_at_max_beat() {
        let m = Metronome::new(120.0);
        let now = Instant::now();
        m.jump_to_beat(MAX_BEAT + 3, now);
        assert_eq!(m.beat_at(now), 3);
        m.jump_to_beat(0, now);
        assert_eq!(m.beat_at(now), 1);
    }

    #[test]
    fn adjust_start_never_produces_beat_below_one() {
        let m = Metronome::new(120.0);
        let now = Instant::now();
        m.jump_to_beat(1, now);
        // Push the phase far enough back that naive math would go negative.
        m.adjust_start(-10_000.0, now);
        assert!(m.beat_at(now) >= 1);
    }

    #[test]
    fn beat_within_bar_cycles_1_to_4() {
        let m = Metronome::new(120.0);
        let now = Instant::now();
        m.jump_to_beat(1, now);
        for expected in [1u8, 2, 3, 4, 1, 2] {
            assert_eq!(m.beat_within_bar_at(now), expected);
            m.jump_to_beat(m.beat_at(now) + 1, now);
        }
    }
}
