use serde::{Deserialize, Serialize};

use super::history::{mean, BoundedHistory};

/// Number of beat timestamps kept for estimation.
pub const BEAT_HISTORY_CAPACITY: usize = 20;
/// Intervals at or below this (ms) are treated as noise (200 BPM and up).
pub const MIN_BEAT_INTERVAL_MS: f64 = 300.0;
/// Intervals at or above this (ms) are treated as gaps (30 BPM and below).
pub const MAX_BEAT_INTERVAL_MS: f64 = 2_000.0;

const REPORT_MIN_CONFIDENCE: f64 = 0.5;
const REPORT_MIN_BEATS: usize = 4;

/// Tempo inferred from recent beats, or the authoritative tempo in
/// generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TempoEstimate {
    /// Beats per minute; `0.0` when unknown.
    pub tempo: f64,
    /// Regularity of the underlying intervals, in `[0, 1]`.
    pub confidence: f64,
    pub timestamp: f64,
}

impl TempoEstimate {
    pub fn unknown(timestamp: f64) -> Self {
        Self {
            tempo: 0.0,
            confidence: 0.0,
            timestamp,
        }
    }

    /// A tempo that is set, not estimated.
    pub fn exact(tempo: f64, timestamp: f64) -> Self {
        Self {
            tempo,
            confidence: 1.0,
            timestamp,
        }
    }

    pub fn is_known(&self) -> bool {
        self.tempo > 0.0
    }

    /// Whether the estimate is stable enough to announce, given how many
    /// beats have been recorded.
    pub fn is_reportable(&self, recorded_beats: usize) -> bool {
        self.is_known()
            && self.confidence > REPORT_MIN_CONFIDENCE
            && recorded_beats >= REPORT_MIN_BEATS
    }
}

/// Estimates tempo from the spacing of recently recorded beats.
#[derive(Debug, Clone)]
pub struct TempoEstimator {
    beats: BoundedHistory<f64>,
}

impl Default for TempoEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TempoEstimator {
    pub fn new() -> Self {
        Self {
            beats: BoundedHistory::new(BEAT_HISTORY_CAPACITY),
        }
    }

    pub fn record(&mut self, timestamp: f64) {
        self.beats.push(timestamp);
    }

    pub fn reset(&mut self) {
        self.beats.clear();
    }

    pub fn recorded_count(&self) -> usize {
        self.beats.len()
    }

    pub fn history(&self) -> &BoundedHistory<f64> {
        &self.beats
    }

    /// Computes the current estimate without touching the history.
    ///
    /// Intervals outside `(300, 2000)` ms are dropped before averaging.
    /// Confidence is `1 - variance / mean²` of the kept intervals, clamped at
    /// zero, so perfectly even spacing scores `1.0`.
    pub fn estimate(&self) -> TempoEstimate {
        let timestamp = self.beats.last().copied().unwrap_or_default();
        if self.beats.len() < 2 {
            return TempoEstimate::unknown(timestamp);
        }

        let intervals: Vec<f64> = self
            .beats
            .iter()
            .zip(self.beats.iter().skip(1))
            .map(|(previous, next)| next - previous)
            .filter(|interval| *interval > MIN_BEAT_INTERVAL_MS && *interval < MAX_BEAT_INTERVAL_MS)
            .collect();

        let Some(average) = mean(intervals.iter().copied()) else {
            return TempoEstimate::unknown(timestamp);
        };

        let variance = intervals
            .iter()
            .map(|interval| (interval - average).powi(2))
            .sum::<f64>()
            / intervals.len() as f64;

        TempoEstimate {
            tempo: (60_000.0 / average).round(),
            confidence: (1.0 - variance / (average * average)).max(0.0),
            timestamp,
        }
    }
}
