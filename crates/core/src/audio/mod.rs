use std::{collections::VecDeque, fmt};

use crate::{BeatEmitterError, Result};

/// Supplies one energy reading per sampling tick in detection mode.
///
/// Implementations wrap whatever actually captures the signal (an audio
/// callback, a file decoder, a test script). The emitter calls
/// [`EnergySource::acquire`] once on start and [`EnergySource::release`] on
/// stop.
pub trait EnergySource: Send + fmt::Debug {
    /// Opens the underlying signal. Failing here aborts the start.
    fn acquire(&mut self) -> Result<()>;

    /// Returns the newest reading, or `None` when nothing new is available.
    fn read_energy(&mut self) -> Result<Option<f64>>;

    fn release(&mut self) {}
}

/// Plays back a fixed list of energy readings, one per read.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    readings: VecDeque<f64>,
    acquired: bool,
}

impl ReplaySource {
    pub fn new(readings: impl IntoIterator<Item = f64>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
            acquired: false,
        }
    }

    /// Builds a source from precomputed sample frames, one reading per frame.
    pub fn from_frames<'a>(frames: impl IntoIterator<Item = &'a [f32]>) -> Self {
        Self::new(frames.into_iter().map(mean_square_energy))
    }

    pub fn remaining(&self) -> usize {
        self.readings.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }
}

impl EnergySource for ReplaySource {
    fn acquire(&mut self) -> Result<()> {
        self.acquired = true;
        Ok(())
    }

    fn read_energy(&mut self) -> Result<Option<f64>> {
        if !self.acquired {
            return Err(BeatEmitterError::acquisition("replay source read before acquire"));
        }
        Ok(self.readings.pop_front())
    }

    fn release(&mut self) {
        self.acquired = false;
    }
}

/// Mean of the squared time-domain samples of one frame.
pub fn mean_square_energy(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f64 = samples
        .iter()
        .map(|sample| f64::from(*sample) * f64::from(*sample))
        .sum();
    sum / samples.len() as f64
}

/// Mean linear power of the bins of a dB magnitude spectrum between `low_hz`
/// and `high_hz`. Bins are assumed to span `0..sample_rate / 2` evenly.
pub fn band_energy(magnitudes_db: &[f32], sample_rate: u32, low_hz: f32, high_hz: f32) -> f64 {
    if magnitudes_db.is_empty() || sample_rate == 0 || high_hz < low_hz {
        return 0.0;
    }

    let nyquist = sample_rate as f32 / 2.0;
    let last = magnitudes_db.len() - 1;
    let bin = |hz: f32| (((hz / nyquist) * magnitudes_db.len() as f32).floor().max(0.0) as usize).min(last);
    let (low, high) = (bin(low_hz), bin(high_hz));

    let band = &magnitudes_db[low..=high];
    let power: f64 = band
        .iter()
        .map(|db| 10f64.powf(f64::from(*db) / 10.0))
        .sum();
    power / band.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_readings_in_order() {
        let mut source = ReplaySource::new([0.1, 0.2]);
        assert!(source.read_energy().is_err());

        source.acquire().unwrap();
        assert_eq!(source.read_energy().unwrap(), Some(0.1));
        assert_eq!(source.read_energy().unwrap(), Some(0.2));
        assert_eq!(source.read_energy().unwrap(), None);
        assert!(source.is_exhausted());

        source.release();
        assert!(!source.is_acquired());
    }

    #[test]
    fn frames_become_mean_square_readings() {
        let loud = [1.0_f32; 8];
        let quiet = [0.0_f32; 8];
        let source = ReplaySource::from_frames([&loud[..], &quiet[..]]);
        assert_eq!(source.remaining(), 2);
        assert_eq!(source.readings, VecDeque::from(vec![1.0, 0.0]));
    }

    #[test]
    fn mean_square_of_signal() {
        assert_eq!(mean_square_energy(&[]), 0.0);
        assert!((mean_square_energy(&[0.5, -0.5, 0.5, -0.5]) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn band_energy_converts_decibels() {
        // 0 dB is unit power, -10 dB a tenth of it.
        let spectrum = [0.0_f32, 0.0, -10.0, -10.0];
        assert!((band_energy(&spectrum, 8, 0.0, 1.0) - 1.0).abs() < 1e-9);
        assert!((band_energy(&spectrum, 8, 2.0, 4.0) - 0.1).abs() < 1e-9);
        assert_eq!(band_energy(&spectrum, 8, 3.0, 1.0), 0.0);
    }
}
