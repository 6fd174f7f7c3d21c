//! Per-track beat grid and cue list data types (spec.md §3's `BeatGrid` and
//! `CueList.Entry`). These are pure values: populating them from an analysis
//! file is the job of the external collaborator that parses rekordbox
//! export data, not this crate.

/// One cue point or loop, sorted into a [`CueList`] by `time_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CueEntry {
    pub time_ms: u32,
    /// 0 means not a loop.
    pub loop_time_ms: u32,
    /// 0 = memory point, otherwise a hot-cue slot number.
    pub hot_cue_number: u8,
    pub is_loop: bool,
    pub color_code: u8,
    pub comment: String,
}

/// Cue/loop points for a track, always kept sorted by `time_ms`.
#[derive(Debug, Clone, Default)]
pub struct CueList {
    entries: Vec<CueEntry>,
}

impl CueList {
    pub fn new() -> Self {
        CueList {
            entries: Vec::new(),
        }
    }

    /// Inserts `entry`, keeping entries sorted by `time_ms`.
    pub fn insert(&mut self, entry: CueEntry) {
        let pos = self
            .entries
            .partition_point(|e| e.time_ms <= entry.time_ms);
        self.entries.insert(pos, entry);
    }

    pub fn entries(&self) -> &[CueEntry] {
        &self.entries
    }

    pub fn hot_cue(&self, number: u8) -> Option<&CueEntry> {
        self.entries
            .iter()
            .find(|e| e.hot_cue_number == number && number != 0)
    }
}

/// Per-track beat grid: parallel arrays of time-in-track and
/// beat-within-bar, binary-searchable on time (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct BeatGrid {
    time_ms: Vec<u32>,
    beat_within_bar: Vec<u8>,
}

impl BeatGrid {
    pub fn new() -> Self {
        BeatGrid {
            time_ms: Vec::new(),
            beat_within_bar: Vec::new(),
        }
    }

    /// Appends a beat; `time_ms` must be non-decreasing across calls.
    pub fn push_beat(&mut self, time_ms: u32, beat_within_bar: u8) {
        debug_assert!(self.time_ms.last().map_or(true, |&t| time_ms >= t));
        self.time_ms.push(time_ms);
        self.beat_within_bar.push(beat_within_bar);
    }

    pub fn beat_count(&self) -> usize {
        self.time_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ms.is_empty()
    }

    /// Finds the 1-based beat index active at `time_ms`. Returns a negative
    /// number of milliseconds-before-the-first-beat when `time_ms` precedes
    /// the grid's first beat (there being no beat index to return yet).
    /// Past the last beat, extrapolates using the last two beats' interval
    /// rather than raising (spec.md §9's past-last-beat design note), so
    /// loop regions that play past the grid's nominal end still resolve to
    /// a beat index instead of an error.
    pub fn find_beat_at_time(&self, time_ms: i64) -> Result<usize, i64> {
        if self.time_ms.is_empty() {
            return Err(time_ms);
        }
        let first = self.time_ms[0] as i64;
        if time_ms < first {
            return Err(time_ms - first);
        }
        let last_idx = self.time_ms.len() - 1;
        let last = self.time_ms[last_idx] as i64;
        if time_ms > last {
            let interval = if last_idx > 0 {
                (last - self.time_ms[last_idx - 1] as i64).max(1)
            } else {
                1
            };
            let excess = time_ms - last;
            let beats_past = (excess - 1) / interval;
            return Ok(last_idx + 1 + beats_past as usize);
        }
        // Binary search for the latest beat at or before time_ms.
        let idx = self
            .time_ms
            .partition_point(|&t| (t as i64) <= time_ms)
            .saturating_sub(1);
        Ok(idx + 1)
    }

    /// The beat-within-bar for the looked-up beat index. Past the grid's
    /// end, the bar phase simply holds at its last known value rather than
    /// being projected forward, since nothing in the grid tells us where
    /// bar boundaries fall beyond the last recorded beat.
    pub fn beat_within_bar_at_time(&self, time_ms: i64) -> Option<u8> {
        match self.find_beat_at_time(time_ms) {
            Ok(idx) if idx >= 1 && idx <= self.beat_within_bar.len() => {
                Some(self.beat_within_bar[idx - 1])
            }
            Ok(_) => self.beat_within_bar.last().copied(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_grid() -> BeatGrid {
        let mut g = BeatGrid::new();
        for (i, t) in [0u32, 500, 1000, 1500, 2000].iter().enumerate() {
            g.push_beat(*t, ((i % 4) + 1) as u8);
        }
        g
    }

    #[test]
    fn finds_exact_and_between_beats() {
        let g = sample_grid();
        assert_eq!(g.find_beat_at_time(0), Ok(1));
        assert_eq!(g.find_beat_at_time(600), Ok(2));
        assert_eq!(g.find_beat_at_time(1999), Ok(4));
    }

    #[test]
    fn before_first_beat_is_negative() {
        let g = sample_grid();
        assert_eq!(g.find_beat_at_time(-200), Err(-200));
    }

    #[test]
    fn past_last_beat_extrapolates_bar_position() {
        let g = sample_grid();
        // 500ms past the last beat (index 5, at 2000ms) with a 500ms
        // interval extrapolates to beat index 6; bar phase holds at the
        // last known value (1) rather than being projected forward.
        assert_eq!(g.find_beat_at_time(3000), Ok(6));
        assert_eq!(g.beat_within_bar_at_time(3000), Some(1));
    }

    #[test]
    fn empty_grid_has_no_beats() {
        let g = BeatGrid::new();
        assert!(g.find_beat_at_time(0).is_err());
    }

    #[test]
    fn cue_list_stays_sorted() {
        let mut cues = CueList::new();
        cues.insert(CueEntry {
            time_ms: 5000,
            loop_time_ms: 0,
            hot_cue_number: 1,
            is_loop: false,
            color_code: 0,
            comment: String::new(),
        });
        cues.insert(CueEntry {
            time_ms: 1000,
            loop_time_ms: 0,
            hot_cue_number: 2,
            is_loop: false,
            color_code: 0,
            comment: String::new(),
        });
        let times: Vec<u32> = cues.entries().iter().map(|e| e.time_ms).collect();
        assert_eq!(times, vec![1000, 5000]);
        assert_eq!(cues.hot_cue(2).unwrap().time_ms, 1000);
    }
}
