use super::history::BoundedHistory;

/// Number of energy readings kept for the adaptive threshold.
pub const ENERGY_HISTORY_CAPACITY: usize = 10;
/// Minimum spacing between two onsets, in milliseconds.
pub const REFRACTORY_PERIOD_MS: f64 = 300.0;

const MIN_ADAPTIVE_SAMPLES: usize = 3;
const MEAN_THRESHOLD_FACTOR: f64 = 1.5;
const PEAK_THRESHOLD_FACTOR: f64 = 0.7;
const RISE_WINDOW: usize = 3;
const RISE_FACTOR: f64 = 1.3;
const INTENSITY_GAIN: f64 = 10.0;

/// A sample that was classified as a beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Onset {
    pub timestamp: f64,
    pub energy: f64,
    /// Normalised beat strength, `min(1, energy * 10)`.
    pub intensity: f64,
}

/// Streaming energy-rise classifier.
///
/// Feed it one reading per sampling tick; it keeps a short rolling window and
/// does no polling of its own.
#[derive(Debug, Clone)]
pub struct OnsetDetector {
    threshold: f64,
    energy: BoundedHistory<f64>,
    last_onset: Option<f64>,
}

impl OnsetDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            energy: BoundedHistory::new(ENERGY_HISTORY_CAPACITY),
            last_onset: None,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    pub fn history(&self) -> &BoundedHistory<f64> {
        &self.energy
    }

    pub fn last_onset(&self) -> Option<f64> {
        self.last_onset
    }

    pub fn reset(&mut self) {
        self.energy.clear();
        self.last_onset = None;
    }

    /// Energy floor for the next classification. Loud passages lower the
    /// floor below the static threshold only when the window's own mean and
    /// peak say so; with fewer than three readings the static value is used.
    pub fn dynamic_threshold(&self) -> f64 {
        if self.energy.len() < MIN_ADAPTIVE_SAMPLES {
            return self.threshold;
        }

        let mean = self.energy.mean().unwrap_or_default();
        let peak = self.energy.max().unwrap_or_default();
        self.threshold
            .min(mean * MEAN_THRESHOLD_FACTOR)
            .min(peak * PEAK_THRESHOLD_FACTOR)
    }

    /// Pushes `energy` observed at `timestamp` (ms) and reports whether it
    /// starts a new beat. Non-finite readings are dropped without touching
    /// the window.
    pub fn classify(&mut self, energy: f64, timestamp: f64) -> Option<Onset> {
        if !energy.is_finite() {
            tracing::trace!(energy, timestamp, "ignoring non-finite energy reading");
            return None;
        }
        self.energy.push(energy);

        if energy < self.dynamic_threshold() {
            return None;
        }

        if let Some(last) = self.last_onset {
            if timestamp - last < REFRACTORY_PERIOD_MS {
                return None;
            }
        }

        if self.energy.len() >= MIN_ADAPTIVE_SAMPLES {
            let recent = self.energy.tail_mean(RISE_WINDOW).unwrap_or_default();
            if !(energy > recent * RISE_FACTOR) {
                return None;
            }
        }

        self.last_onset = Some(timestamp);
        Some(Onset {
            timestamp,
            energy,
            intensity: (energy * INTENSITY_GAIN).min(1.0),
        })
    }
}
