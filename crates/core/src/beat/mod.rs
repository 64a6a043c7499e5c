use serde::{Deserialize, Serialize};

use crate::{config::validate_beats_per_measure, Result};

/// Payload of every `beat` event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    /// Monotonic time of the beat in milliseconds.
    pub timestamp: f64,
    /// Beat strength in `[0, 1]`.
    pub intensity: f64,
    /// Tempo in BPM, when one is known.
    pub tempo: Option<f64>,
    /// Position within the measure, `1..=beats_per_measure`.
    pub beat_index: u32,
    pub beats_per_measure: u32,
}

impl BeatEvent {
    pub fn is_downbeat(&self) -> bool {
        self.beat_index == 1
    }
}

/// Tracks the position within a measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasureCounter {
    beat_index: u32,
    beats_per_measure: u32,
}

impl MeasureCounter {
    pub fn new(beats_per_measure: u32) -> Result<Self> {
        validate_beats_per_measure(beats_per_measure)?;
        Ok(Self {
            beat_index: 1,
            beats_per_measure,
        })
    }

    pub fn current(&self) -> u32 {
        self.beat_index
    }

    pub fn beats_per_measure(&self) -> u32 {
        self.beats_per_measure
    }

    /// Moves to the next beat, wrapping from the last beat back to 1.
    pub fn advance(&mut self) {
        self.beat_index = (self.beat_index % self.beats_per_measure) + 1;
    }

    pub fn reset(&mut self) {
        self.beat_index = 1;
    }

    /// Changes the measure length. The position is kept when it still fits
    /// and falls back to the first beat otherwise.
    pub fn set_beats_per_measure(&mut self, beats_per_measure: u32) -> Result<()> {
        validate_beats_per_measure(beats_per_measure)?;
        self.beats_per_measure = beats_per_measure;
        if self.beat_index > beats_per_measure {
            self.beat_index = 1;
        }
        Ok(())
    }

    pub(crate) fn beat(&self, timestamp: f64, intensity: f64, tempo: Option<f64>) -> BeatEvent {
        BeatEvent {
            timestamp,
            intensity: intensity.clamp(0.0, 1.0),
            tempo,
            beat_index: self.beat_index,
            beats_per_measure: self.beats_per_measure,
        }
    }
}
