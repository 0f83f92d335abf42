use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{config::AdaptationRates, DetectorConfig};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionState {
    Idle,
    Motion,
}

/// Area thresholds derived from the frame resolution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub width: u32,
    pub height: u32,
    /// Regions smaller than this many pixels are noise.
    pub min_region_area: u32,
    /// Magnitude above which motion is unambiguous.
    pub high_area: f64,
    /// Magnitude below which the scene is quiet.
    pub low_area: f64,
}

impl Thresholds {
    pub fn from_resolution(width: u32, height: u32, config: &DetectorConfig) -> Self {
        let pixels = f64::from(width) * f64::from(height);
        Self {
            width,
            height,
            min_region_area: (pixels * config.min_region_ratio) as u32,
            high_area: pixels * config.high_ratio,
            low_area: pixels * config.low_ratio,
        }
    }

    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

/// How the background should absorb the current frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adaptation {
    Blend(f32),
    /// Replace the reference with the current frame.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingAction {
    Keep,
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MotionStarted,
    /// The episode outlived the motion timeout; the frame became the new
    /// background.
    SceneReset,
    ReturnedToIdle,
}

/// Alert the machine would like to send, subject to the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Start,
    Continuing,
}

/// Everything the controller must do for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// State after this frame.
    pub state: MotionState,
    pub magnitude: f64,
    pub transition: Option<Transition>,
    pub adaptation: Adaptation,
    pub recording: RecordingAction,
    pub alert: Option<AlertKind>,
}

/// IDLE / MOTION hysteresis with an idle debounce and a motion timeout.
#[derive(Debug, Clone)]
pub struct HysteresisMachine {
    state: MotionState,
    thresholds: Thresholds,
    rates: AdaptationRates,
    idle_frames_required: u32,
    max_continuous_motion: Duration,
    frames_below_low: u32,
    motion_started_at: Option<Instant>,
}

impl HysteresisMachine {
    pub fn new(thresholds: Thresholds, config: &DetectorConfig) -> Self {
        Self {
            state: MotionState::Idle,
            thresholds,
            rates: config.rates,
            idle_frames_required: config.idle_frames_required,
            max_continuous_motion: config.max_continuous_motion(),
            frames_below_low: 0,
            motion_started_at: None,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn frames_below_low(&self) -> u32 {
        self.frames_below_low
    }

    pub fn motion_started_at(&self) -> Option<Instant> {
        self.motion_started_at
    }

    /// Installs new thresholds and drops back to IDLE.
    pub fn reconfigure(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
        self.state = MotionState::Idle;
        self.frames_below_low = 0;
        self.motion_started_at = None;
    }

    /// Runs one step of the transition table for the frame observed at `now`.
    pub fn evaluate(&mut self, magnitude: f64, now: Instant) -> Decision {
        match self.state {
            MotionState::Idle => self.evaluate_idle(magnitude, now),
            MotionState::Motion => self.evaluate_motion(magnitude, now),
        }
    }

    fn evaluate_idle(&mut self, magnitude: f64, now: Instant) -> Decision {
        if magnitude > self.thresholds.high_area {
            self.state = MotionState::Motion;
            self.motion_started_at = Some(now);
            self.frames_below_low = 0;
            return Decision {
                state: self.state,
                magnitude,
                transition: Some(Transition::MotionStarted),
                adaptation: Adaptation::Blend(self.rates.motion_enter),
                recording: RecordingAction::Start,
                alert: Some(AlertKind::Start),
            };
        }

        self.steady(magnitude, self.rates.idle, None)
    }

    fn evaluate_motion(&mut self, magnitude: f64, now: Instant) -> Decision {
        // The timeout takes precedence over whatever the magnitude says.
        let started = self.motion_started_at.unwrap_or(now);
        if now.saturating_duration_since(started) > self.max_continuous_motion {
            self.enter_idle();
            return Decision {
                state: self.state,
                magnitude,
                transition: Some(Transition::SceneReset),
                adaptation: Adaptation::Reset,
                recording: RecordingAction::Stop,
                alert: None,
            };
        }

        if magnitude > self.thresholds.high_area {
            self.frames_below_low = 0;
            return self.steady(
                magnitude,
                self.rates.motion_sustained,
                Some(AlertKind::Continuing),
            );
        }

        if magnitude < self.thresholds.low_area {
            self.frames_below_low += 1;
            if self.frames_below_low >= self.idle_frames_required {
                self.enter_idle();
                return Decision {
                    state: self.state,
                    magnitude,
                    transition: Some(Transition::ReturnedToIdle),
                    adaptation: Adaptation::Blend(self.rates.motion_quiet),
                    recording: RecordingAction::Stop,
                    alert: None,
                };
            }
            return self.steady(magnitude, self.rates.motion_quiet, None);
        }

        self.frames_below_low = 0;
        self.steady(magnitude, self.rates.ambiguous, None)
    }

    fn enter_idle(&mut self) {
        self.state = MotionState::Idle;
        self.frames_below_low = 0;
        self.motion_started_at = None;
    }

    fn steady(&self, magnitude: f64, rate: f32, alert: Option<AlertKind>) -> Decision {
        Decision {
            state: self.state,
            magnitude,
            transition: None,
            adaptation: Adaptation::Blend(rate),
            recording: RecordingAction::Keep,
            alert,
        }
    }
}
