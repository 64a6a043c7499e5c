use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{timeline::PrecisionScheduler, BeatEmitterError, Result};

/// Selects which component set drives a [`crate::BeatEmitter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmitterMode {
    /// Beats are generated from the configured tempo.
    #[default]
    #[serde(alias = "timer-based")]
    Generation,
    /// Beats are inferred from an energy signal.
    #[serde(alias = "audio-analysis")]
    Detection,
}

impl fmt::Display for EmitterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generation => f.write_str("generation"),
            Self::Detection => f.write_str("detection"),
        }
    }
}

/// Immutable configuration snapshot. Updates build a new snapshot with
/// [`EmitterConfig::merged`] and replace the old one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    pub mode: EmitterMode,
    /// Target tempo in beats per minute (generation mode).
    pub tempo: f64,
    pub beats_per_measure: u32,
    pub min_tempo: f64,
    pub max_tempo: f64,
    /// Static energy floor for onset detection, in `[0, 1]`.
    pub detection_threshold: f64,
    /// Intensity carried by generated beats, in `[0, 1]`.
    pub fixed_intensity: f64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            mode: EmitterMode::Generation,
            tempo: 120.0,
            beats_per_measure: 4,
            min_tempo: 60.0,
            max_tempo: 180.0,
            detection_threshold: 0.1,
            fixed_intensity: 0.8,
        }
    }
}

impl EmitterConfig {
    pub fn generation(tempo: f64) -> Self {
        Self {
            tempo,
            ..Self::default()
        }
    }

    pub fn detection() -> Self {
        Self {
            mode: EmitterMode::Detection,
            ..Self::default()
        }
    }

    /// Parses a full or partial JSON document; missing keys take defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns a new snapshot with every `Some` field of `overrides` applied.
    pub fn merged(&self, overrides: &ConfigOverrides) -> Self {
        Self {
            mode: overrides.mode.unwrap_or(self.mode),
            tempo: overrides.tempo.unwrap_or(self.tempo),
            beats_per_measure: overrides
                .beats_per_measure
                .unwrap_or(self.beats_per_measure),
            min_tempo: overrides.min_tempo.unwrap_or(self.min_tempo),
            max_tempo: overrides.max_tempo.unwrap_or(self.max_tempo),
            detection_threshold: overrides
                .detection_threshold
                .unwrap_or(self.detection_threshold),
            fixed_intensity: overrides.fixed_intensity.unwrap_or(self.fixed_intensity),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_tempo(self.tempo)?;
        validate_beats_per_measure(self.beats_per_measure)?;
        if !(self.min_tempo.is_finite() && self.min_tempo > 0.0) {
            return Err(BeatEmitterError::invalid("min tempo must be greater than 0"));
        }
        if !(self.max_tempo.is_finite() && self.max_tempo >= self.min_tempo) {
            return Err(BeatEmitterError::invalid(
                "max tempo must not be below min tempo",
            ));
        }
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(BeatEmitterError::invalid(
                "detection threshold must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.fixed_intensity) {
            return Err(BeatEmitterError::invalid(
                "fixed intensity must be within [0, 1]",
            ));
        }
        Ok(())
    }

    /// Beat period in milliseconds for the configured tempo.
    pub fn period_ms(&self) -> Result<f64> {
        PrecisionScheduler::period_for_tempo(self.tempo)
    }
}

/// Partial configuration supplied by callers; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub mode: Option<EmitterMode>,
    pub tempo: Option<f64>,
    pub beats_per_measure: Option<u32>,
    pub min_tempo: Option<f64>,
    pub max_tempo: Option<f64>,
    pub detection_threshold: Option<f64>,
    pub fixed_intensity: Option<f64>,
}

impl ConfigOverrides {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

pub(crate) fn validate_tempo(tempo: f64) -> Result<()> {
    if tempo.is_finite() && tempo > 0.0 {
        Ok(())
    } else {
        Err(BeatEmitterError::invalid("tempo must be greater than 0"))
    }
}

pub(crate) fn validate_beats_per_measure(beats_per_measure: u32) -> Result<()> {
    if beats_per_measure == 0 {
        Err(BeatEmitterError::invalid(
            "beats per measure must be greater than 0",
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EmitterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mode, EmitterMode::Generation);
        assert_eq!(config.beats_per_measure, 4);
        assert_eq!(config.period_ms().unwrap(), 500.0);
        assert!(EmitterConfig::generation(0.0).period_ms().is_err());
    }

    #[test]
    fn overrides_replace_only_present_fields() {
        let base = EmitterConfig::default();
        let merged = base.merged(&ConfigOverrides {
            tempo: Some(90.0),
            beats_per_measure: Some(3),
            ..Default::default()
        });

        assert_eq!(merged.tempo, 90.0);
        assert_eq!(merged.beats_per_measure, 3);
        assert_eq!(merged.fixed_intensity, base.fixed_intensity);
        assert_eq!(merged.mode, base.mode);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            EmitterConfig::generation(0.0),
            EmitterConfig::generation(-10.0),
            EmitterConfig::generation(f64::NAN),
            EmitterConfig {
                beats_per_measure: 0,
                ..Default::default()
            },
            EmitterConfig {
                detection_threshold: 1.5,
                ..Default::default()
            },
            EmitterConfig {
                min_tempo: 200.0,
                ..Default::default()
            },
        ];

        for config in bad {
            let err = config.validate().unwrap_err();
            assert!(err.is_invalid_configuration(), "{config:?}");
        }
    }

    #[test]
    fn parses_partial_json_with_legacy_mode_names() {
        let config =
            EmitterConfig::from_json(r#"{ "mode": "audio-analysis", "tempo": 100 }"#).unwrap();
        assert_eq!(config.mode, EmitterMode::Detection);
        assert_eq!(config.tempo, 100.0);
        assert_eq!(config.beats_per_measure, 4);

        let overrides = ConfigOverrides::from_json(r#"{ "beats_per_measure": 6 }"#).unwrap();
        assert_eq!(overrides.beats_per_measure, Some(6));
        assert!(overrides.tempo.is_none());
        assert!(!overrides.is_empty());
    }
}
