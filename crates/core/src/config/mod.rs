use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{analysis::NoiseFilter, MotionAlarmError, RecordingSettings, Result};

/// Top-level configuration structure for the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub detector: DetectorConfig,
    pub events: EventConfig,
    pub recording: RecordingSettings,
}

impl AppConfig {
    /// Loads a configuration file. Missing sections and fields fall back to
    /// their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field invariants the controller relies on.
    pub fn validate(&self) -> Result<()> {
        self.detector.validate()?;

        if self.recording.fps == 0 {
            return Err(invalid("recording.fps must be positive"));
        }
        if self.recording.extension.is_empty() {
            return Err(invalid("recording.extension must not be empty"));
        }
        if !(1..=100).contains(&self.recording.jpeg_quality) {
            return Err(invalid("recording.jpeg_quality must be within 1..=100"));
        }
        if self.events.target.is_empty() {
            return Err(invalid("events.target must not be empty"));
        }

        Ok(())
    }
}

/// Frame acquisition pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Number of polls allowed while waiting for the first valid frame.
    pub warmup_attempts: u32,
    pub warmup_delay_ms: u64,
    /// Pause inserted after every processed frame.
    pub loop_pause_ms: u64,
}

impl StreamConfig {
    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }

    pub fn loop_pause(&self) -> Duration {
        Duration::from_millis(self.loop_pause_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            warmup_attempts: 40,
            warmup_delay_ms: 50,
            loop_pause_ms: 5,
        }
    }
}

/// Detection thresholds, timers and background adaptation rates.
///
/// Area thresholds are expressed as fractions of the frame so that the same
/// configuration works across resolutions; see
/// [`Thresholds::from_resolution`](crate::Thresholds::from_resolution).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Regions smaller than this share of the frame are treated as noise.
    pub min_region_ratio: f64,
    /// Motion area above this share of the frame is unambiguous motion.
    pub high_ratio: f64,
    /// Motion area below this share of the frame counts as a quiet scene.
    pub low_ratio: f64,
    /// Per-pixel intensity difference that marks a pixel as changed.
    pub pixel_threshold: u8,
    /// Gaussian sigma applied to every grayscale frame before differencing.
    pub blur_sigma: f32,
    pub noise_filter: NoiseFilter,
    /// Consecutive quiet frames needed before a motion episode ends.
    pub idle_frames_required: u32,
    /// Longest episode before the scene is assumed to have changed.
    pub max_continuous_motion_ms: u64,
    pub rates: AdaptationRates,
}

impl DetectorConfig {
    pub fn max_continuous_motion(&self) -> Duration {
        Duration::from_millis(self.max_continuous_motion_ms)
    }

    fn validate(&self) -> Result<()> {
        for (name, ratio) in [
            ("min_region_ratio", self.min_region_ratio),
            ("high_ratio", self.high_ratio),
            ("low_ratio", self.low_ratio),
        ] {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(invalid(format!("detector.{name} must be within (0, 1)")));
            }
        }
        if self.low_ratio >= self.high_ratio {
            return Err(invalid("detector.low_ratio must be below detector.high_ratio"));
        }
        if self.idle_frames_required == 0 {
            return Err(invalid("detector.idle_frames_required must be positive"));
        }
        if self.max_continuous_motion_ms == 0 {
            return Err(invalid("detector.max_continuous_motion_ms must be positive"));
        }
        if !self.blur_sigma.is_finite() || self.blur_sigma < 0.0 {
            return Err(invalid("detector.blur_sigma must be a non-negative number"));
        }
        self.rates.validate()
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_region_ratio: 0.002,
            high_ratio: 0.01,
            low_ratio: 0.003,
            pixel_threshold: 25,
            blur_sigma: 3.5,
            noise_filter: NoiseFilter::default(),
            idle_frames_required: 10,
            max_continuous_motion_ms: 8_000,
            rates: AdaptationRates::default(),
        }
    }
}

/// Blend factors used when folding the current frame into the background.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationRates {
    /// Quiet scene while idle; tracks lighting drift.
    pub idle: f32,
    /// Frame that opens a motion episode.
    pub motion_enter: f32,
    /// Strong motion inside an episode; keeps the moving object out of the
    /// background.
    pub motion_sustained: f32,
    /// Quiet frames inside an episode.
    pub motion_quiet: f32,
    /// Magnitude between the low and high thresholds.
    pub ambiguous: f32,
}

impl AdaptationRates {
    fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("idle", self.idle),
            ("motion_enter", self.motion_enter),
            ("motion_sustained", self.motion_sustained),
            ("motion_quiet", self.motion_quiet),
            ("ambiguous", self.ambiguous),
        ] {
            if !(rate > 0.0 && rate < 1.0) {
                return Err(invalid(format!("detector.rates.{name} must be within (0, 1)")));
            }
        }

        if !(self.motion_sustained <= self.motion_enter
            && self.motion_enter <= self.ambiguous
            && self.ambiguous <= self.idle)
        {
            return Err(invalid(
                "detector.rates must satisfy motion_sustained <= motion_enter <= ambiguous <= idle",
            ));
        }

        Ok(())
    }
}

impl Default for AdaptationRates {
    fn default() -> Self {
        Self {
            idle: 0.08,
            motion_enter: 0.02,
            motion_sustained: 0.01,
            motion_quiet: 0.20,
            ambiguous: 0.06,
        }
    }
}

/// Outbound motion alert settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// `host:port` of the alert listener.
    pub target: String,
    /// Minimum spacing between two accepted alerts.
    pub cooldown_ms: u64,
    pub start_message: String,
    pub continue_message: String,
}

impl EventConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            target: "192.168.7.1:12346".to_string(),
            cooldown_ms: 300,
            start_message: "MOTION\n".to_string(),
            continue_message: "MOTION\n".to_string(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> MotionAlarmError {
    MotionAlarmError::InvalidConfig(reason.into())
}
