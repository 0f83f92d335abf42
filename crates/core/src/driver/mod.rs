use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    analysis::{preprocess, MotionAnalyzer},
    Adaptation, AlertKind, AppConfig, BackgroundModel, ClipRecorder, ClipSink, Decision,
    EventConfig, EventThrottle, EventTransport, Frame, FrameSource, HysteresisMachine,
    MotionState, RecordingAction, Result, Thresholds, Transition,
};

/// Cooperative stop flag shared between the frame loop and whoever wants it
/// to end (typically a signal handler).
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The stateful decision and recording controller. Owns the background
/// model, the hysteresis machine and all side-effect channels.
pub struct MotionController {
    config: AppConfig,
    thresholds: Thresholds,
    background: BackgroundModel,
    machine: HysteresisMachine,
    throttle: EventThrottle,
    recorder: ClipRecorder,
    analyzer: Box<dyn MotionAnalyzer + Send>,
    transport: Box<dyn EventTransport + Send>,
    transport_open: bool,
}

impl MotionController {
    /// Builds a controller whose background is seeded from `first_frame`.
    pub fn new(
        config: AppConfig,
        first_frame: &Frame,
        mut analyzer: Box<dyn MotionAnalyzer + Send>,
        sink: Box<dyn ClipSink + Send>,
        transport: Box<dyn EventTransport + Send>,
    ) -> Self {
        let (width, height) = first_frame.dimensions();
        let thresholds = Thresholds::from_resolution(width, height, &config.detector);
        analyzer.configure(&thresholds);
        log_thresholds(&thresholds);

        let seed = preprocess(first_frame, config.detector.blur_sigma);
        Self {
            thresholds,
            background: BackgroundModel::new(&seed),
            machine: HysteresisMachine::new(thresholds, &config.detector),
            throttle: EventThrottle::new(config.events.cooldown()),
            recorder: ClipRecorder::new(config.recording.clone(), sink),
            analyzer,
            transport,
            transport_open: true,
            config,
        }
    }

    pub fn state(&self) -> MotionState {
        self.machine.state()
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }

    pub fn recorder(&self) -> &ClipRecorder {
        &self.recorder
    }

    pub fn alerts_sent(&self) -> u64 {
        self.throttle.accepted()
    }

    /// Runs one frame through the controller: record, analyse, decide, then
    /// apply the decision's background and side-effect actions.
    pub fn process_frame(&mut self, frame: &Frame, now: Instant) -> Result<Decision> {
        let (width, height) = frame.dimensions();
        if !self.thresholds.matches(width, height) {
            self.handle_resolution_change(frame);
        }

        self.recorder.write_frame(frame);

        let gray = preprocess(frame, self.config.detector.blur_sigma);
        let magnitude = self.analyzer.magnitude(&gray, self.background.reference());
        let decision = self.machine.evaluate(magnitude, now);

        match decision.adaptation {
            Adaptation::Blend(rate) => self.background.update(&gray, rate)?,
            Adaptation::Reset => self.background.reset(&gray),
        }

        match decision.recording {
            RecordingAction::Start => {
                self.recorder.start(frame);
            }
            RecordingAction::Stop => {
                self.recorder.stop();
            }
            RecordingAction::Keep => {}
        }

        let alerted = match decision.alert {
            Some(kind) => {
                let message = alert_message(&self.config.events, kind);
                self.throttle
                    .try_emit(self.transport.as_mut(), message.as_bytes(), now)
            }
            None => false,
        };

        log_decision(&decision, alerted);
        Ok(decision)
    }

    /// Closes any open clip, then the event transport. Safe to call more
    /// than once.
    pub fn shutdown(&mut self) {
        self.recorder.stop();
        if self.transport_open {
            self.transport.close();
            self.transport_open = false;
            tracing::debug!("event transport closed");
        }
    }

    fn handle_resolution_change(&mut self, frame: &Frame) {
        let (width, height) = frame.dimensions();
        tracing::warn!(
            from_width = self.thresholds.width,
            from_height = self.thresholds.height,
            width,
            height,
            "stream resolution changed; re-seeding background"
        );

        self.recorder.stop();
        self.thresholds = Thresholds::from_resolution(width, height, &self.config.detector);
        self.analyzer.configure(&self.thresholds);
        self.machine.reconfigure(self.thresholds);
        self.background
            .reset(&preprocess(frame, self.config.detector.blur_sigma));
        log_thresholds(&self.thresholds);
    }
}

impl std::fmt::Debug for MotionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionController")
            .field("state", &self.machine.state())
            .field("thresholds", &self.thresholds)
            .field("recorder", &self.recorder)
            .field("throttle", &self.throttle)
            .field("transport_open", &self.transport_open)
            .finish()
    }
}

fn alert_message(events: &EventConfig, kind: AlertKind) -> &str {
    match kind {
        AlertKind::Start => &events.start_message,
        AlertKind::Continuing => &events.continue_message,
    }
}

fn log_thresholds(thresholds: &Thresholds) {
    tracing::info!(
        width = thresholds.width,
        height = thresholds.height,
        min_region_area = thresholds.min_region_area,
        high_area = thresholds.high_area,
        low_area = thresholds.low_area,
        "motion thresholds"
    );
}

fn log_decision(decision: &Decision, alerted: bool) {
    let area = decision.magnitude;
    match decision.transition {
        Some(Transition::MotionStarted) => tracing::info!(area, alerted, "[MOTION] START"),
        Some(Transition::SceneReset) => tracing::info!(
            area,
            "[SCENE] long motion, treating current frame as new background, back to IDLE"
        ),
        Some(Transition::ReturnedToIdle) => tracing::info!(area, "[IDLE] back to idle"),
        None if alerted => tracing::info!(area, "[MOTION] motion"),
        None => tracing::trace!(area, state = ?decision.state, "frame"),
    }
}

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The frame source yielded no frame.
    EndOfStream,
    Cancelled,
}

/// Totals for one run of the frame loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub clips_started: u64,
    pub alerts_sent: u64,
    pub stop_reason: StopReason,
}

/// Drives `controller` with frames from `source` until the source runs dry
/// or `token` is cancelled, then shuts the controller down.
pub fn run<S: FrameSource + ?Sized>(
    source: &mut S,
    controller: &mut MotionController,
    token: &ShutdownToken,
    pause: Duration,
) -> RunSummary {
    run_with_clock(source, controller, token, pause, Instant::now)
}

/// [`run`] with an injectable clock.
pub fn run_with_clock<S, C>(
    source: &mut S,
    controller: &mut MotionController,
    token: &ShutdownToken,
    pause: Duration,
    mut clock: C,
) -> RunSummary
where
    S: FrameSource + ?Sized,
    C: FnMut() -> Instant,
{
    tracing::info!("starting motion detection with hysteresis and recording");
    let mut frames = 0;

    let stop_reason = loop {
        if token.is_cancelled() {
            tracing::info!("shutdown requested, leaving frame loop");
            break StopReason::Cancelled;
        }

        let Some(frame) = source.next_frame() else {
            // Sources wired to the token give up a blocked fetch on cancel.
            if token.is_cancelled() {
                tracing::info!("shutdown requested while waiting for a frame");
                break StopReason::Cancelled;
            }
            tracing::error!("empty frame from stream, exiting");
            break StopReason::EndOfStream;
        };

        match controller.process_frame(&frame, clock()) {
            Ok(_) => frames += 1,
            Err(err) => tracing::warn!(error = %err, "frame skipped"),
        }

        if !pause.is_zero() {
            thread::sleep(pause);
        }
    };

    controller.shutdown();

    let summary = RunSummary {
        frames,
        clips_started: controller.recorder().clips_started(),
        alerts_sent: controller.alerts_sent(),
        stop_reason,
    };
    tracing::info!(
        frames = summary.frames,
        clips = summary.clips_started,
        alerts = summary.alerts_sent,
        reason = ?summary.stop_reason,
        "frame loop finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        path::{Path, PathBuf},
        sync::Mutex,
    };

    use image::GrayImage;

    use super::*;
    use crate::{ClipFormat, MotionAlarmError, RecordingSettings};

    /// Magnitudes are replayed in order, one per frame.
    struct ScriptedAnalyzer(VecDeque<f64>);

    impl MotionAnalyzer for ScriptedAnalyzer {
        fn magnitude(&mut self, _current: &GrayImage, _reference: &GrayImage) -> f64 {
            self.0.pop_front().unwrap_or(0.0)
        }
    }

    /// Yields the queued frames, then `None`; counts every call.
    struct ScriptedSource {
        frames: VecDeque<Frame>,
        calls: usize,
        cancel_after: Option<(usize, ShutdownToken)>,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Frame>) -> Self {
            Self {
                frames: frames.into(),
                calls: 0,
                cancel_after: None,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Option<Frame> {
            self.calls += 1;
            if let Some((after, token)) = &self.cancel_after {
                if self.calls >= *after {
                    token.cancel();
                }
            }
            self.frames.pop_front()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum SinkEvent {
        Open(PathBuf),
        Write(u8),
        Release,
    }

    struct MemorySink {
        events: Arc<Mutex<Vec<SinkEvent>>>,
        fail_open: bool,
    }

    impl ClipSink for MemorySink {
        fn open(&mut self, path: &Path, _format: &ClipFormat) -> Result<()> {
            if self.fail_open {
                return Err(MotionAlarmError::msg("no codec"));
            }
            self.events
                .lock()
                .unwrap()
                .push(SinkEvent::Open(path.to_path_buf()));
            Ok(())
        }

        fn write(&mut self, frame: &Frame) -> Result<()> {
            // Frames are tagged through their red channel.
            let tag = frame.image().get_pixel(0, 0).0[0];
            self.events.lock().unwrap().push(SinkEvent::Write(tag));
            Ok(())
        }

        fn release(&mut self) -> Result<()> {
            self.events.lock().unwrap().push(SinkEvent::Release);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TransportLog {
        sent: Vec<Vec<u8>>,
        closed: bool,
    }

    struct MemoryTransport(Arc<Mutex<TransportLog>>);

    impl EventTransport for MemoryTransport {
        fn send(&mut self, payload: &[u8]) -> io::Result<()> {
            let mut log = self.0.lock().unwrap();
            if log.closed {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }
            log.sent.push(payload.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closed = true;
        }
    }

    struct Harness {
        controller: MotionController,
        sink: Arc<Mutex<Vec<SinkEvent>>>,
        transport: Arc<Mutex<TransportLog>>,
    }

    fn config(idle_frames_required: u32) -> AppConfig {
        let mut config = AppConfig::default();
        config.detector.idle_frames_required = idle_frames_required;
        config.detector.blur_sigma = 0.0;
        config.recording = RecordingSettings {
            clips_dir: PathBuf::from("clips"),
            ..RecordingSettings::default()
        };
        config
    }

    // 100x100 frames: HighArea = 100, LowArea = 30.
    fn harness(magnitudes: &[f64], idle_frames_required: u32, fail_open: bool) -> Harness {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let transport = Arc::new(Mutex::new(TransportLog::default()));
        let controller = MotionController::new(
            config(idle_frames_required),
            &tagged(0),
            Box::new(ScriptedAnalyzer(magnitudes.iter().copied().collect())),
            Box::new(MemorySink {
                events: sink.clone(),
                fail_open,
            }),
            Box::new(MemoryTransport(transport.clone())),
        );
        Harness {
            controller,
            sink,
            transport,
        }
    }

    fn tagged(tag: u8) -> Frame {
        Frame::filled(100, 100, [tag, 0, 0])
    }

    fn writes(events: &[SinkEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Write(tag) => Some(*tag),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn records_exactly_the_motion_episode() {
        let mut h = harness(&[0.0, 500.0, 500.0, 0.0, 0.0, 0.0, 0.0], 2, false);
        let start = Instant::now();

        for tag in 1..=7u8 {
            let now = start + Duration::from_millis(66 * u64::from(tag));
            h.controller.process_frame(&tagged(tag), now).unwrap();
        }

        let events = h.sink.lock().unwrap().clone();
        // Frame 2 opens the clip, frame 5 completes the quiet run and is the
        // last frame written before the release.
        assert_eq!(writes(&events), vec![2, 3, 4, 5]);
        assert!(matches!(events.first(), Some(SinkEvent::Open(_))));
        assert_eq!(events.last(), Some(&SinkEvent::Release));
        assert_eq!(h.controller.state(), MotionState::Idle);
        assert!(!h.controller.recorder().is_recording());
    }

    #[test]
    fn alerts_are_throttled_during_sustained_motion() {
        let magnitudes = vec![500.0; 30];
        let mut h = harness(&magnitudes, 10, false);
        let start = Instant::now();

        // 15 fps for two seconds.
        for i in 0..30u64 {
            let now = start + Duration::from_millis(i * 1000 / 15);
            h.controller.process_frame(&tagged(1), now).unwrap();
        }

        let sent = h.transport.lock().unwrap().sent.len();
        // Accepted at 0, 333, 666, 1000, 1333, 1666 ms.
        assert_eq!(sent, 6);
        assert_eq!(h.controller.alerts_sent(), 6);
    }

    #[test]
    fn timeout_reseeds_background_and_stops_clip() {
        let mut h = harness(&[500.0, 500.0, 500.0], 10, false);
        let start = Instant::now();

        h.controller.process_frame(&tagged(1), start).unwrap();
        h.controller
            .process_frame(&tagged(2), start + Duration::from_secs(4))
            .unwrap();
        let decision = h
            .controller
            .process_frame(&tagged(200), start + Duration::from_millis(8_500))
            .unwrap();

        assert_eq!(decision.transition, Some(Transition::SceneReset));
        assert_eq!(h.controller.state(), MotionState::Idle);
        assert_eq!(
            h.controller.background().reference(),
            &tagged(200).to_gray()
        );
        let events = h.sink.lock().unwrap().clone();
        assert_eq!(events.last(), Some(&SinkEvent::Release));
        assert_eq!(writes(&events), vec![1, 2, 200]);
    }

    #[test]
    fn clip_open_failure_does_not_stop_alerts() {
        let mut h = harness(&[500.0, 500.0], 10, true);
        let start = Instant::now();

        h.controller.process_frame(&tagged(1), start).unwrap();
        h.controller
            .process_frame(&tagged(2), start + Duration::from_secs(1))
            .unwrap();

        assert_eq!(h.controller.state(), MotionState::Motion);
        assert!(!h.controller.recorder().is_recording());
        assert!(writes(&h.sink.lock().unwrap()).is_empty());
        assert_eq!(h.transport.lock().unwrap().sent.len(), 2);
    }

    #[test]
    fn alert_payloads_follow_configuration() {
        let mut h = harness(&[500.0, 500.0], 10, false);
        h.controller.config.events.start_message = "START\n".to_string();
        h.controller.config.events.continue_message = "MORE\n".to_string();
        let start = Instant::now();

        h.controller.process_frame(&tagged(1), start).unwrap();
        h.controller
            .process_frame(&tagged(1), start + Duration::from_secs(1))
            .unwrap();

        let sent = h.transport.lock().unwrap().sent.clone();
        assert_eq!(sent, vec![b"START\n".to_vec(), b"MORE\n".to_vec()]);
    }

    #[test]
    fn resolution_change_rederives_thresholds() {
        let mut h = harness(&[500.0, 0.0], 10, false);
        let start = Instant::now();

        h.controller.process_frame(&tagged(1), start).unwrap();
        assert!(h.controller.recorder().is_recording());

        let smaller = Frame::filled(50, 40, [9, 0, 0]);
        let decision = h.controller.process_frame(&smaller, start).unwrap();

        assert_eq!(decision.state, MotionState::Idle);
        assert!(h.controller.thresholds().matches(50, 40));
        assert!(!h.controller.recorder().is_recording());
        assert_eq!(h.controller.background().dimensions(), (50, 40));
    }

    #[test]
    fn empty_frame_ends_loop_and_closes_clip() {
        let mut h = harness(&[500.0, 500.0, 500.0, 500.0], 10, false);
        let mut source = ScriptedSource::new((1..=4).map(tagged).collect());

        let summary = run(
            &mut source,
            &mut h.controller,
            &ShutdownToken::new(),
            Duration::ZERO,
        );

        assert_eq!(source.calls, 5);
        assert_eq!(summary.frames, 4);
        assert_eq!(summary.stop_reason, StopReason::EndOfStream);
        assert_eq!(summary.clips_started, 1);
        let events = h.sink.lock().unwrap().clone();
        assert_eq!(writes(&events), vec![1, 2, 3, 4]);
        assert_eq!(events.last(), Some(&SinkEvent::Release));
        assert!(h.transport.lock().unwrap().closed);
    }

    #[test]
    fn cancellation_stops_before_next_fetch() {
        let mut h = harness(&[500.0; 10], 10, false);
        let token = ShutdownToken::new();
        let mut source = ScriptedSource::new((1..=10).map(tagged).collect());
        source.cancel_after = Some((3, token.clone()));

        let start = Instant::now();
        let mut tick = 0u64;
        let summary = run_with_clock(&mut source, &mut h.controller, &token, Duration::ZERO, || {
            tick += 1;
            start + Duration::from_millis(tick * 66)
        });

        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert_eq!(summary.frames, 3);
        assert_eq!(source.calls, 3);
        assert!(!h.controller.recorder().is_recording());
        assert!(h.transport.lock().unwrap().closed);
        assert_eq!(
            h.sink.lock().unwrap().last(),
            Some(&SinkEvent::Release)
        );
    }

    #[test]
    fn fetch_abandoned_on_cancel_is_a_clean_shutdown() {
        let mut h = harness(&[500.0; 10], 10, false);
        let token = ShutdownToken::new();
        let mut source = ScriptedSource::new((1..=2).map(tagged).collect());
        source.cancel_after = Some((3, token.clone()));

        let summary = run(&mut source, &mut h.controller, &token, Duration::ZERO);

        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.clips_started, 1);
        assert_eq!(
            h.sink.lock().unwrap().last(),
            Some(&SinkEvent::Release)
        );
        assert!(h.transport.lock().unwrap().closed);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut h = harness(&[500.0], 10, false);
        h.controller.process_frame(&tagged(1), Instant::now()).unwrap();

        h.controller.shutdown();
        h.controller.shutdown();

        let releases = h
            .sink
            .lock()
            .unwrap()
            .iter()
            .filter(|event| **event == SinkEvent::Release)
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn token_is_shared_between_clones() {
        let token = ShutdownToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());

        handle.cancel();
        assert!(token.is_cancelled());
    }
}
