//! Core library for the Motion Alarm camera controller.
//!
//! The crate turns a stream of camera frames into a two-state (IDLE / MOTION)
//! decision using an adaptive background model with hysteresis, sends
//! throttled motion alerts, and records one clip per motion episode. Each
//! module owns a distinct subsystem; the camera, codec and network endpoints
//! sit behind narrow traits so the controller can be driven by fakes.

pub mod analysis;
pub mod background;
pub mod config;
pub mod detector;
pub mod driver;
pub mod error;
pub mod events;
pub mod frame;
pub mod record;

pub use analysis::{preprocess, DifferenceAnalyzer, MotionAnalyzer, NoiseFilter};
pub use background::BackgroundModel;
pub use config::{AdaptationRates, AppConfig, DetectorConfig, EventConfig, StreamConfig};
pub use detector::{
    Adaptation, AlertKind, Decision, HysteresisMachine, MotionState, RecordingAction, Thresholds,
    Transition,
};
pub use driver::{run, run_with_clock, MotionController, RunSummary, ShutdownToken, StopReason};
pub use error::{MotionAlarmError, Result};
pub use events::{EventThrottle, EventTransport, UdpTransport};
pub use frame::{warm_up, Frame, FrameSource, MjpegSource};
pub use record::{
    clip_name, ensure_clips_dir, ClipFormat, ClipRecorder, ClipSink, MjpegClipSink,
    RecordingSession, RecordingSettings,
};
