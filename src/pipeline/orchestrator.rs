use crate::capture::{FrameSource, SourceOpener};
use crate::common::{Frame, KeyedEma, PixelRect, Point, encode_jpeg};
use crate::error::CaptureError;
use crate::fiducial::{DetectionMeta, FiducialAnchor, FiducialTracker};
use crate::pipeline::broadcast::Broadcaster;
use crate::pipeline::fusion::fuse;
use crate::pipeline::governor::PerformanceBudget;
use crate::pipeline::guidance::{GuidanceTracker, evaluate};
use crate::pipeline::landmarks::{LandmarkExtractor, LandmarkSet};
use crate::pipeline::latency_log::{LatencyLog, LatencyRecord};
use crate::pipeline::overlay::{MarkerCue, OverlayContext, build_overlay, positioning_hint};
use crate::pipeline::roi;
use crate::remote::cache::CACHE_TTL;
use crate::remote::{RemoteRequest, RemoteResult, RemoteSlot};
use crate::state::health::PoseHealth;
use crate::state::{ActiveStep, HealthHandle, SessionHandle, Settings, SettingsHandle};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SMOOTHING_ALPHA: f64 = 0.4;
const OVERLAY_INTERVAL: Duration = Duration::from_millis(66);
const NO_FACE_AFTER: Duration = Duration::from_secs(2);
const HINT_INTERVAL: Duration = Duration::from_secs(1);
const BUDGET_WARNING_INTERVAL: Duration = Duration::from_secs(1);
const LATENCY_BUDGET_MS: f64 = 150.0;
const EXTREME_LATENCY_MS: f64 = 1500.0;
const EXTREME_LATENCY_WINDOW: Duration = Duration::from_secs(5);
const REOPEN_RETRY: Duration = Duration::from_secs(1);
const NOT_READY_PAUSE: Duration = Duration::from_millis(50);
const DUPLICATE_FRAME_PAUSE: Duration = Duration::from_millis(5);
const REMOTE_JPEG_QUALITY: u8 = 70;

/// Shared state the orchestrator reads and writes every cycle.
#[derive(Clone, Default)]
pub struct SharedHandles {
    pub settings: SettingsHandle,
    pub health: HealthHandle,
    pub session: SessionHandle,
}

/// What a single processed frame produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CycleReport {
    pub latency_ms: f64,
    pub overlay_sent: bool,
    pub hint_sent: bool,
    pub soft_reset: bool,
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Processed(CycleReport),
    Idle(Duration),
}

/// Owns the per-frame processing loop. Single writer of smoothing, guidance
/// and budget state.
pub struct PerceptionOrchestrator {
    handles: SharedHandles,
    source: Box<dyn FrameSource>,
    opener: Box<dyn SourceOpener>,
    extractor: Box<dyn LandmarkExtractor>,
    tracker: FiducialTracker,
    remote: Option<RemoteSlot>,
    broadcaster: Arc<dyn Broadcaster>,
    latency_log: Option<LatencyLog>,

    cycle: u64,
    last_frame_ns: Option<u64>,
    budget: Option<PerformanceBudget>,
    local: LandmarkSet,
    face_box: Option<PixelRect>,
    last_remote: Option<(RemoteResult, Instant)>,
    smoothing: KeyedEma<String, 2>,
    landmarks: LandmarkSet,
    anchors: Vec<FiducialAnchor>,
    meta: DetectionMeta,
    guidance: GuidanceTracker,
    face_seen_at: Option<Instant>,
    last_hint: Option<Instant>,
    last_overlay: Option<Instant>,
    last_budget_warning: Option<Instant>,
    slow_since: Option<Instant>,
    reset_armed: bool,
    reopen_pending: Option<Instant>,
}

impl PerceptionOrchestrator {
    pub fn new(
        handles: SharedHandles,
        source: Box<dyn FrameSource>,
        opener: Box<dyn SourceOpener>,
        extractor: Box<dyn LandmarkExtractor>,
        tracker: FiducialTracker,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            handles,
            source,
            opener,
            extractor,
            tracker,
            remote: None,
            broadcaster,
            latency_log: None,
            cycle: 0,
            last_frame_ns: None,
            budget: None,
            local: LandmarkSet::new(),
            face_box: None,
            last_remote: None,
            smoothing: KeyedEma::new(SMOOTHING_ALPHA),
            landmarks: LandmarkSet::new(),
            anchors: Vec::new(),
            meta: DetectionMeta::default(),
            guidance: GuidanceTracker::default(),
            face_seen_at: None,
            last_hint: None,
            last_overlay: None,
            last_budget_warning: None,
            slow_since: None,
            reset_armed: true,
            reopen_pending: None,
        }
    }

    pub fn with_remote(mut self, slot: RemoteSlot) -> Self {
        self.remote = Some(slot);
        self
    }

    pub fn with_latency_log(mut self, log: LatencyLog) -> Self {
        self.latency_log = Some(log);
        self
    }

    /// Smoothed full-frame landmarks from the last processed cycle.
    pub fn landmarks(&self) -> &LandmarkSet {
        &self.landmarks
    }

    pub fn anchors(&self) -> &[FiducialAnchor] {
        &self.anchors
    }

    pub fn budget(&self) -> Option<&PerformanceBudget> {
        self.budget.as_ref()
    }

    /// Run the loop on a dedicated thread until `cancel_token` fires.
    pub fn spawn(self, cancel_token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("perception-orchestrator".to_string())
            .spawn(move || self.run(cancel_token))
    }

    pub fn run(mut self, cancel_token: CancellationToken) {
        info!("Perception loop started");
        while !cancel_token.is_cancelled() {
            match self.tick(Instant::now()) {
                Tick::Processed(_) => {}
                Tick::Idle(pause) => std::thread::sleep(pause),
            }
        }
        self.source.close();
        info!("Perception loop stopped");
    }

    /// One loop iteration: read the latest frame and process it if it is new.
    pub fn tick(&mut self, now: Instant) -> Tick {
        if let Some(last_attempt) = self.reopen_pending {
            if now.saturating_duration_since(last_attempt) >= REOPEN_RETRY {
                self.reopen(now);
            }
            return Tick::Idle(NOT_READY_PAUSE);
        }

        match self.source.read() {
            Ok(frame) => {
                if self.last_frame_ns == Some(frame.timestamp_ns()) {
                    // A stalled device keeps serving its last frame, which only ages.
                    let age_ms = now.saturating_duration_since(frame.captured_at()).as_secs_f64() * 1000.0;
                    if self.track_extreme_latency(age_ms, now) {
                        self.soft_reset(now);
                    }
                    return Tick::Idle(DUPLICATE_FRAME_PAUSE);
                }
                self.last_frame_ns = Some(frame.timestamp_ns());
                let report = self.process_frame(&frame, now);
                if report.soft_reset {
                    self.soft_reset(now);
                }
                Tick::Processed(report)
            }
            Err(CaptureError::NotReady) => Tick::Idle(NOT_READY_PAUSE),
            Err(err) => {
                debug!("Frame read failed: {}", err);
                Tick::Idle(NOT_READY_PAUSE)
            }
        }
    }

    fn soft_reset(&mut self, now: Instant) {
        warn!("Latency above {}ms for {:?}, reopening camera", EXTREME_LATENCY_MS, EXTREME_LATENCY_WINDOW);
        self.source.close();
        self.reopen(now);
    }

    fn reopen(&mut self, now: Instant) {
        match self.opener.open() {
            Ok(source) => {
                info!("Camera reopened ({:?})", source.status());
                self.source = source;
                self.last_frame_ns = None;
                self.reopen_pending = None;
            }
            Err(err) => {
                error!("Camera reopen failed: {}", err);
                self.reopen_pending = Some(now);
            }
        }
    }

    #[instrument(skip_all, fields(frame_ns = frame.timestamp_ns()))]
    pub fn process_frame(&mut self, frame: &Frame, now: Instant) -> CycleReport {
        let started = Instant::now();
        let settings = self.handles.settings.snapshot();
        let (width, height) = (frame.width(), frame.height());
        self.cycle += 1;
        let cycle_index = self.cycle - 1;
        let budget = self
            .budget
            .get_or_insert_with(|| PerformanceBudget::new(width, settings.aruco_stride, now))
            .snapshot();

        if let Some(slot) = &self.remote {
            slot.service().update_limits(settings.remote_limits());
        }

        // Local landmarks, reused between face strides.
        let face_ran = settings.face && cycle_index % u64::from(budget.face_stride) == 0;
        if !settings.face {
            self.local.clear();
            self.face_box = None;
            self.face_seen_at = Some(now);
        } else if face_ran {
            let (local, face_found) = self.extract_local(frame, &settings, budget.face_target_width);
            self.local = local;
            if face_found {
                self.face_seen_at = Some(now);
            }
        }
        let face_seen_at = *self.face_seen_at.get_or_insert(now);

        let remote = self.remote_refinement(frame, &settings, face_ran, now);
        let fused = fuse(self.local.clone(), remote.as_ref());
        self.landmarks = fused
            .into_iter()
            .map(|(name, point)| {
                let [x, y] = self.smoothing.update(name.clone(), [point.x, point.y]);
                (name, Point::new(x, y))
            })
            .collect();
        let landmark_at = now + started.elapsed();

        // Fiducials, reused between fiducial strides.
        if settings.aruco {
            if cycle_index % u64::from(budget.fiducial_stride) == 0 {
                let (anchors, meta) =
                    self.tracker
                        .detect(frame, settings.aruco_pose, settings.marker_size_m, now);
                self.anchors = anchors;
                self.meta = meta;
            }
        } else {
            self.anchors.clear();
            self.meta = self.tracker.meta(settings.aruco_pose);
        }

        let step = self.handles.session.active_step();
        let cues = self.guidance_cues(step.as_ref(), width, height, now);

        let mut report = CycleReport::default();
        let no_face = settings.face && now.saturating_duration_since(face_seen_at) > NO_FACE_AFTER;
        if no_face {
            let due = self
                .last_hint
                .map_or(true, |last| now.saturating_duration_since(last) >= HINT_INTERVAL);
            if due {
                self.broadcaster.broadcast(positioning_hint());
                self.last_hint = Some(now);
                report.hint_sent = true;
            }
        } else if self
            .last_overlay
            .map_or(true, |last| now.saturating_duration_since(last) >= OVERLAY_INTERVAL)
        {
            let message = build_overlay(&OverlayContext {
                frame_width: width,
                frame_height: height,
                landmarks: &self.landmarks,
                anchors: &self.anchors,
                step: step.as_ref(),
                cues: &cues,
                hands_enabled: settings.hands,
                now,
            });
            self.broadcaster.broadcast(message);
            self.last_overlay = Some(now);
            report.overlay_sent = true;
        }

        let overlay_at = now + started.elapsed();
        let latency_ms = overlay_at
            .saturating_duration_since(frame.captured_at())
            .as_secs_f64()
            * 1000.0;
        report.latency_ms = latency_ms;
        if latency_ms > LATENCY_BUDGET_MS {
            let due = self
                .last_budget_warning
                .map_or(true, |last| now.saturating_duration_since(last) >= BUDGET_WARNING_INTERVAL);
            if due {
                warn!("Cycle over the {}ms budget: {:.1}ms", LATENCY_BUDGET_MS, latency_ms);
                self.last_budget_warning = Some(now);
            }
        }

        let budget_changed = self
            .budget
            .as_mut()
            .map(|budget| budget.adapt(latency_ms, settings.aruco_stride, now))
            .unwrap_or(false);
        if budget_changed {
            debug!("Budget now {:?}", self.budget.as_ref().map(PerformanceBudget::snapshot));
        }

        self.publish_health(latency_ms);
        self.log_latency(frame, &settings, remote.as_ref(), landmark_at, overlay_at, latency_ms);
        report.soft_reset = self.track_extreme_latency(latency_ms, now);
        report
    }

    /// Face (inside the ROI window) and hand landmarks in full-frame coordinates,
    /// plus whether a face was found.
    fn extract_local(&mut self, frame: &Frame, settings: &Settings, target_width: u32) -> (LandmarkSet, bool) {
        let (width, height) = (frame.width(), frame.height());
        let window = roi::select_window(self.face_box, width, height);
        let input = roi::downscale(roi::crop(frame.image(), window), target_width);

        let face = self.extractor.detect_face(&input);
        let face_found = face.is_some();
        let mut local = match face {
            Some(face) => {
                self.face_box = face
                    .bbox
                    .map(|bbox| roi::remap_box(bbox, window, width, height))
                    .filter(|bbox| !bbox.is_empty());
                roi::remap_landmarks(face.landmarks, window, width, height)
            }
            None => {
                self.face_box = None;
                LandmarkSet::new()
            }
        };

        if settings.hands {
            let full = roi::downscale(frame.image().clone(), target_width);
            local.extend(self.extractor.detect_hands(&full));
        }
        (local, face_found)
    }

    /// Poll the remote slot, submit the current face region when the slot is free,
    /// and return the last remote result while it is younger than its TTL.
    fn remote_refinement(
        &mut self,
        frame: &Frame,
        settings: &Settings,
        face_ran: bool,
        now: Instant,
    ) -> Option<RemoteResult> {
        let enabled = settings.use_cloud && settings.face;
        if let Some(slot) = self.remote.as_mut() {
            if let Some(done) = slot.poll() {
                let mut result = done.result;
                result.landmarks =
                    roi::remap_landmarks(result.landmarks, done.roi, done.frame_width, done.frame_height);
                self.last_remote = Some((result, now));
            }
            if enabled && face_ran && !slot.is_pending() {
                if let Some(face_box) = self.face_box {
                    submit_region(slot, frame, face_box);
                }
            }
        }

        let expired = self
            .last_remote
            .as_ref()
            .map_or(false, |(_, received)| now.saturating_duration_since(*received) >= CACHE_TTL);
        if !enabled || expired {
            self.last_remote = None;
        }
        self.last_remote.as_ref().map(|(result, _)| result.clone())
    }

    fn guidance_cues(&mut self, step: Option<&ActiveStep>, width: u32, height: u32, now: Instant) -> Vec<MarkerCue> {
        let Some(step) = step else {
            return Vec::new();
        };
        step.step
            .tool_bindings
            .iter()
            .map(|binding| {
                let anchor = self.anchors.iter().find(|a| a.id == binding.marker_id);
                let target_px = self
                    .landmarks
                    .get(&binding.target_landmark)
                    .map(|p| p.to_pixels(width, height));
                let alignment = evaluate(anchor, Some(binding), target_px, self.meta.pose_available);
                let state = self.guidance.observe(binding.marker_id, alignment.state, now);
                MarkerCue {
                    marker_id: binding.marker_id,
                    state,
                    marker_px: anchor.map(|a| a.center),
                    target_px,
                    tilt_hint: alignment.tilt_hint,
                }
            })
            .collect()
    }

    fn publish_health(&self, latency_ms: f64) {
        let remote = self
            .remote
            .as_ref()
            .map(|slot| slot.service().metrics())
            .unwrap_or_default();
        let pose = PoseHealth {
            requested: self.meta.pose_requested,
            available: self.meta.pose_available,
            intrinsics_error: self.meta.intrinsics_error.clone(),
        };
        let budget = self.budget.as_ref().map(PerformanceBudget::snapshot).unwrap_or_default();
        self.handles.health.update(|health| {
            health.latency_ms = latency_ms;
            health.remote = remote;
            health.pose = pose;
            health.budget = budget;
        });
    }

    fn log_latency(
        &mut self,
        frame: &Frame,
        settings: &Settings,
        remote: Option<&RemoteResult>,
        landmark_at: Instant,
        overlay_at: Instant,
        latency_ms: f64,
    ) {
        let Some(log) = self.latency_log.as_mut() else {
            return;
        };
        let breaker_open = self
            .remote
            .as_ref()
            .map(|slot| slot.service().metrics().breaker_open)
            .unwrap_or(false);
        let record = LatencyRecord {
            capture_ts: frame.wall_time(),
            landmark_ts: wall_at(frame, landmark_at),
            overlay_ts: wall_at(frame, overlay_at),
            e2e_ms: latency_ms,
            fps: self.handles.health.snapshot().fps,
            use_cloud: settings.use_cloud,
            cloud_latency_ms: remote.map(|r| r.latency_ms),
            cloud_confidence: remote.map(|r| r.confidence),
            cloud_ok: remote.map(|r| r.ok),
            breaker_open,
        };
        if let Err(err) = log.append(&record) {
            warn!("Failed to append to {}: {}", log.path().display(), err);
        }
    }

    /// Returns true once per sustained episode of extreme latency.
    fn track_extreme_latency(&mut self, latency_ms: f64, now: Instant) -> bool {
        if latency_ms <= EXTREME_LATENCY_MS {
            if !self.reset_armed {
                info!("Latency recovered ({:.0}ms)", latency_ms);
            }
            self.slow_since = None;
            self.reset_armed = true;
            return false;
        }
        let since = *self.slow_since.get_or_insert(now);
        if self.reset_armed && now.saturating_duration_since(since) >= EXTREME_LATENCY_WINDOW {
            self.reset_armed = false;
            return true;
        }
        false
    }
}

/// Encode the expanded face region and hand it to the remote worker.
fn submit_region(slot: &mut RemoteSlot, frame: &Frame, face_box: PixelRect) {
    let (width, height) = (frame.width(), frame.height());
    let window = roi::expand(face_box, width, height);
    if window.is_empty() {
        return;
    }
    let crop = roi::crop(frame.image(), window);
    match encode_jpeg(&crop, REMOTE_JPEG_QUALITY) {
        Ok(jpeg) => {
            let request = RemoteRequest {
                jpeg,
                width: crop.width(),
                height: crop.height(),
                captured_ns: frame.timestamp_ns(),
            };
            slot.submit(request, window, width, height);
        }
        Err(err) => warn!("Failed to encode remote ROI: {}", err),
    }
}

fn wall_at(frame: &Frame, at: Instant) -> DateTime<Utc> {
    let offset = at.saturating_duration_since(frame.captured_at());
    frame.wall_time() + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CameraOpener, CameraSource, CaptureBackend, CaptureDevice, DeviceOpener};
    use crate::config::CameraConfig;
    use crate::error::DetectError;
    use crate::fiducial::{DetectedMarker, IntrinsicsCache, MarkerDetector};
    use crate::pipeline::broadcast::tests::RecordingBroadcaster;
    use crate::pipeline::landmarks::{FaceDetection, NormalizedBox};
    use crate::pipeline::overlay::{Accent, Shape};
    use crate::remote::RemoteLandmarkService;
    use crate::remote::service::tests::{ScriptedRemote, mouth_annotation};
    use crate::state::{CameraStatus, GuidedStep, ToolBinding};
    use image::{GrayImage, RgbImage};
    use indexmap::IndexMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};
    use uuid::Uuid;

    /// Serves whatever frame the test last stored.
    #[derive(Clone, Default)]
    struct SharedSource {
        frame: Arc<Mutex<Option<Frame>>>,
    }

    impl SharedSource {
        fn set(&self, frame: Frame) {
            *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
        }
    }

    impl FrameSource for SharedSource {
        fn read(&self) -> Result<Frame, CaptureError> {
            self.frame
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or(CaptureError::NotReady)
        }

        fn status(&self) -> CameraStatus {
            CameraStatus::Mock
        }

        fn close(&mut self) {}
    }

    struct CountingOpener {
        source: SharedSource,
        opens: Arc<AtomicUsize>,
    }

    impl SourceOpener for CountingOpener {
        fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(self.source.clone()))
        }
    }

    /// Reports a face with its mouth at the center whenever `present` is set.
    struct ScriptedExtractor {
        present: Arc<AtomicBool>,
    }

    impl LandmarkExtractor for ScriptedExtractor {
        fn detect_face(&mut self, _image: &RgbImage) -> Option<FaceDetection> {
            if !self.present.load(Ordering::SeqCst) {
                return None;
            }
            let mut landmarks = LandmarkSet::new();
            landmarks.insert("mouth_center".to_string(), Point::new(0.5, 0.5));
            Some(FaceDetection {
                landmarks,
                bbox: Some(NormalizedBox {
                    x: 0.25,
                    y: 0.25,
                    w: 0.5,
                    h: 0.5,
                }),
            })
        }

        fn detect_hands(&mut self, _image: &RgbImage) -> LandmarkSet {
            LandmarkSet::new()
        }
    }

    struct FixedMarkers(Vec<DetectedMarker>);

    impl MarkerDetector for FixedMarkers {
        fn detect(&mut self, _gray: &GrayImage) -> Result<Vec<DetectedMarker>, DetectError> {
            Ok(self.0.clone())
        }
    }

    struct Harness {
        orchestrator: PerceptionOrchestrator,
        broadcaster: RecordingBroadcaster,
        source: SharedSource,
        face: Arc<AtomicBool>,
        opens: Arc<AtomicUsize>,
        handles: SharedHandles,
    }

    fn harness(settings: Settings, markers: Vec<DetectedMarker>) -> Harness {
        let handles = SharedHandles {
            settings: SettingsHandle::new(settings),
            ..SharedHandles::default()
        };
        let source = SharedSource::default();
        let face = Arc::new(AtomicBool::new(true));
        let opens = Arc::new(AtomicUsize::new(0));
        let broadcaster = RecordingBroadcaster::default();
        let tracker = FiducialTracker::new(
            Box::new(FixedMarkers(markers)),
            Arc::new(IntrinsicsCache::new("/nonexistent/intrinsics.json")),
        );
        let orchestrator = PerceptionOrchestrator::new(
            handles.clone(),
            Box::new(source.clone()),
            Box::new(CountingOpener {
                source: source.clone(),
                opens: opens.clone(),
            }),
            Box::new(ScriptedExtractor {
                present: face.clone(),
            }),
            tracker,
            Arc::new(broadcaster.clone()),
        );
        Harness {
            orchestrator,
            broadcaster,
            source,
            face,
            opens,
            handles,
        }
    }

    fn frame_at(captured_at: Instant) -> Frame {
        Frame::new(RgbImage::new(640, 480), captured_at)
    }

    fn remote_result(ok: bool, entries: &[(&str, f64, f64)]) -> RemoteResult {
        RemoteResult {
            ok,
            confidence: 0.8,
            latency_ms: 412.5,
            landmarks: entries
                .iter()
                .map(|(name, x, y)| (name.to_string(), Point::new(*x, *y)))
                .collect(),
            ..RemoteResult::default()
        }
    }

    fn cloud_settings() -> Settings {
        Settings {
            use_cloud: true,
            ..Settings::default()
        }
    }

    fn hints(broadcaster: &RecordingBroadcaster) -> usize {
        broadcaster
            .messages()
            .iter()
            .filter(|message| **message == positioning_hint())
            .count()
    }

    #[test]
    fn stalled_face_emits_exactly_one_positioning_hint() {
        let mut h = harness(Settings::default(), Vec::new());
        h.face.store(false, Ordering::SeqCst);
        let start = Instant::now();
        for k in 0..=21u64 {
            let now = start + Duration::from_millis(100 * k);
            h.orchestrator.process_frame(&frame_at(now), now);
        }
        assert_eq!(hints(&h.broadcaster), 1);
    }

    #[test]
    fn positioning_hint_repeats_about_once_per_second() {
        let mut h = harness(Settings::default(), Vec::new());
        h.face.store(false, Ordering::SeqCst);
        let start = Instant::now();
        for k in 0..=40u64 {
            let now = start + Duration::from_millis(100 * k);
            h.orchestrator.process_frame(&frame_at(now), now);
        }
        // Hints at 2.1s and 3.1s.
        assert_eq!(hints(&h.broadcaster), 2);
    }

    #[test]
    fn face_disabled_never_hints() {
        let settings = Settings {
            face: false,
            ..Settings::default()
        };
        let mut h = harness(settings, Vec::new());
        let start = Instant::now();
        for k in 0..40u64 {
            let now = start + Duration::from_millis(100 * k);
            h.orchestrator.process_frame(&frame_at(now), now);
        }
        assert_eq!(hints(&h.broadcaster), 0);
    }

    #[test]
    fn overlay_emission_is_throttled() {
        let mut h = harness(Settings::default(), Vec::new());
        let start = Instant::now();
        let mut sent = 0;
        for k in 0..=10u64 {
            let now = start + Duration::from_millis(20 * k);
            if h.orchestrator.process_frame(&frame_at(now), now).overlay_sent {
                sent += 1;
            }
        }
        assert_eq!(sent, 3);
        assert_eq!(h.broadcaster.messages().len(), 3);
    }

    #[test]
    fn local_landmarks_are_smoothed_and_health_updated() {
        let mut h = harness(Settings::default(), Vec::new());
        let now = Instant::now();
        let report = h.orchestrator.process_frame(&frame_at(now), now);
        assert_eq!(h.orchestrator.landmarks()["mouth_center"], Point::new(0.5, 0.5));
        let health = h.handles.health.snapshot();
        assert_eq!(health.latency_ms, report.latency_ms);
        assert_eq!(health.budget.face_stride, 1);
        assert!(!health.remote.enabled);
    }

    #[test]
    fn bound_marker_on_target_shows_hold_cue() {
        let settings = Settings {
            aruco: true,
            ..Settings::default()
        };
        // Marker centered on the mouth at (320, 240).
        let marker = DetectedMarker {
            id: 7,
            corners: [
                Point::new(310.0, 230.0),
                Point::new(330.0, 230.0),
                Point::new(330.0, 250.0),
                Point::new(310.0, 250.0),
            ],
        };
        let mut h = harness(settings, vec![marker]);
        let mut routines = IndexMap::new();
        routines.insert(
            "brush".to_string(),
            vec![GuidedStep {
                title: "Brush".to_string(),
                subtitle: String::new(),
                hint: None,
                min_time_s: 10.0,
                target_anchors: vec!["mouth_center".to_string()],
                tool_bindings: vec![ToolBinding {
                    marker_id: 7,
                    target_landmark: "mouth_center".to_string(),
                    distance_tol_px: 40.0,
                    yaw_tol_deg: 15.0,
                    pitch_tol_deg: 15.0,
                }],
            }],
        );
        h.handles.session = SessionHandle::new(routines);
        h.orchestrator.handles.session = h.handles.session.clone();
        let now = Instant::now();
        assert!(h.handles.session.start("brush", now));

        h.orchestrator.process_frame(&frame_at(now), now);
        let messages = h.broadcaster.messages();
        let overlay = messages.last().expect("overlay");
        assert!(overlay.shapes.iter().any(|shape| matches!(
            shape,
            Shape::Ring { accent: Accent::Success, .. }
        )));
        assert_eq!(overlay.hud.as_ref().and_then(|hud| hud.step.clone()).as_deref(), Some("Step 1 of 1"));
        assert_eq!(h.orchestrator.anchors()[0].center, Point::new(320.0, 240.0));
        assert!(!h.handles.health.snapshot().pose.available);
    }

    #[test]
    fn sustained_extreme_latency_soft_resets_once_per_episode() {
        let mut h = harness(Settings::default(), Vec::new());
        let start = Instant::now() + Duration::from_secs(10);
        let lag = Duration::from_millis(1600);
        let mut step = 0u64;
        let mut tick = |h: &mut Harness, lagging: bool| {
            let now = start + Duration::from_millis(500 * step);
            step += 1;
            let captured_at = if lagging { now - lag } else { now };
            h.source.set(frame_at(captured_at));
            h.orchestrator.tick(now)
        };

        for _ in 0..10 {
            tick(&mut h, true);
        }
        assert_eq!(h.opens.load(Ordering::SeqCst), 0);
        assert!(matches!(
            tick(&mut h, true),
            Tick::Processed(CycleReport { soft_reset: true, .. })
        ));
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);

        for _ in 0..12 {
            tick(&mut h, true);
        }
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);

        // Recovery re-arms the reset.
        tick(&mut h, false);
        for _ in 0..11 {
            tick(&mut h, true);
        }
        assert_eq!(h.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn not_ready_and_duplicate_frames_pause() {
        let mut h = harness(Settings::default(), Vec::new());
        let now = Instant::now();
        assert_eq!(h.orchestrator.tick(now), Tick::Idle(NOT_READY_PAUSE));

        h.source.set(frame_at(now));
        assert!(matches!(h.orchestrator.tick(now), Tick::Processed(_)));
        assert_eq!(h.orchestrator.tick(now), Tick::Idle(DUPLICATE_FRAME_PAUSE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_refinement_is_fused_through_the_slot() {
        let settings = Settings {
            use_cloud: true,
            ..Settings::default()
        };
        let Harness {
            orchestrator,
            handles,
            ..
        } = harness(settings.clone(), Vec::new());
        let remote = Arc::new(ScriptedRemote::new(vec![], Ok(mouth_annotation(0.75, 0.5, 0.8))));
        let service = RemoteLandmarkService::new(remote.clone(), settings.remote_limits());
        let mut orchestrator =
            orchestrator.with_remote(RemoteSlot::new(service, tokio::runtime::Handle::current()));

        let start = Instant::now();
        orchestrator.process_frame(&frame_at(start), start);
        assert_eq!(orchestrator.landmarks()["mouth_center"], Point::new(0.5, 0.5));

        let mut fused = None;
        for k in 1..200u64 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let now = start + Duration::from_millis(5 * k);
            orchestrator.process_frame(&frame_at(now), now);
            let mouth = orchestrator.landmarks()["mouth_center"];
            if mouth.x > 0.5 {
                fused = Some(mouth);
                break;
            }
        }
        let mouth = fused.expect("remote result fused");
        // ROI mouth at 0.75 maps to x = 0.675 of the frame; weight 0.8 then EMA 0.4.
        assert!((mouth.x - (0.5 + 0.4 * (0.64 - 0.5))).abs() < 0.01);
        assert_eq!(remote.calls(), 1);
        assert!(handles.health.snapshot().remote.enabled);
    }

    #[test]
    fn remote_result_holds_until_its_ttl_expires() {
        let mut h = harness(cloud_settings(), Vec::new());
        let start = Instant::now();
        h.orchestrator.process_frame(&frame_at(start), start);
        h.orchestrator.last_remote = Some((remote_result(true, &[("mouth_center", 0.75, 0.5)]), start));

        let mut previous = 0.5;
        for k in 1..=10u64 {
            let now = start + Duration::from_millis(100 * k);
            h.orchestrator.process_frame(&frame_at(now), now);
            let x = h.orchestrator.landmarks()["mouth_center"].x;
            assert!(x > previous, "cycle {k}: {x} <= {previous}");
            previous = x;
        }
        // Local 0.5 and remote 0.75 blend to 0.7 at weight 0.8.
        assert!((previous - 0.7).abs() < 0.005);

        let expired = start + CACHE_TTL;
        h.orchestrator.process_frame(&frame_at(expired), expired);
        assert!(h.orchestrator.last_remote.is_none());
        assert!(h.orchestrator.landmarks()["mouth_center"].x < previous);
    }

    #[test]
    fn disabling_cloud_drops_the_held_remote_result() {
        let mut h = harness(cloud_settings(), Vec::new());
        let start = Instant::now();
        h.orchestrator.last_remote = Some((remote_result(true, &[("mouth_center", 0.75, 0.5)]), start));
        h.orchestrator.process_frame(&frame_at(start), start);
        assert!(h.orchestrator.landmarks()["mouth_center"].x > 0.5);

        h.handles.settings.update(|settings| settings.use_cloud = false);
        let now = start + Duration::from_millis(100);
        h.orchestrator.process_frame(&frame_at(now), now);
        assert!(h.orchestrator.last_remote.is_none());
    }

    #[test]
    fn negative_remote_result_leaves_landmarks_unchanged() {
        let mut h = harness(cloud_settings(), Vec::new());
        let start = Instant::now();
        h.orchestrator.last_remote = Some((
            remote_result(false, &[("mouth_center", 0.9, 0.9), ("cheek_left", 0.3, 0.6)]),
            start,
        ));
        for k in 0..5u64 {
            let now = start + Duration::from_millis(100 * k);
            h.orchestrator.process_frame(&frame_at(now), now);
            assert_eq!(h.orchestrator.landmarks()["mouth_center"], Point::new(0.5, 0.5));
            assert!(!h.orchestrator.landmarks().contains_key("cheek_left"));
        }
    }

    #[test]
    fn remote_only_landmark_is_adopted() {
        let mut h = harness(cloud_settings(), Vec::new());
        let now = Instant::now();
        h.orchestrator.last_remote = Some((remote_result(true, &[("cheek_left", 0.3, 0.6)]), now));
        h.orchestrator.process_frame(&frame_at(now), now);

        let cheek = h.orchestrator.landmarks()["cheek_left"];
        assert!((cheek.x - 0.3).abs() < 1e-9);
        assert!((cheek.y - 0.6).abs() < 1e-9);
        assert_eq!(h.orchestrator.landmarks()["mouth_center"], Point::new(0.5, 0.5));
    }

    #[test]
    fn latency_log_reports_the_contributing_remote_result() {
        let dir = std::env::temp_dir().join(format!("mirror-orchestrator-{}", Uuid::new_v4()));
        let path = dir.join("latency.csv");
        let Harness { orchestrator, .. } = harness(cloud_settings(), Vec::new());
        let mut orchestrator = orchestrator.with_latency_log(LatencyLog::open(&path).expect("open log"));

        let start = Instant::now();
        orchestrator.process_frame(&frame_at(start), start);
        orchestrator.last_remote = Some((remote_result(true, &[("mouth_center", 0.75, 0.5)]), start));
        for k in 1..=3u64 {
            let now = start + Duration::from_millis(100 * k);
            orchestrator.process_frame(&frame_at(now), now);
        }

        let contents = std::fs::read_to_string(&path).expect("read log");
        let rows: Vec<&str> = contents.lines().skip(1).collect();
        assert_eq!(rows.len(), 4);
        assert!(rows[0].ends_with(",1,,,,0"));
        for row in &rows[1..] {
            assert!(row.ends_with(",1,412.50,0.800,1,0"), "{row}");
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn stale_frame_from_stalled_device_soft_resets() {
        let mut h = harness(Settings::default(), Vec::new());
        let start = Instant::now() + Duration::from_secs(10);
        h.source.set(frame_at(start));
        let at = |k: u64| start + Duration::from_millis(500 * k);

        assert!(matches!(h.orchestrator.tick(at(0)), Tick::Processed(_)));
        for k in 1..14 {
            assert_eq!(h.orchestrator.tick(at(k)), Tick::Idle(DUPLICATE_FRAME_PAUSE));
        }
        assert_eq!(h.opens.load(Ordering::SeqCst), 0);

        // Older than 1.5s since 2.0s, sustained for 5s.
        h.orchestrator.tick(at(14));
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);

        for k in 15..40 {
            h.orchestrator.tick(at(k));
        }
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn budget_overrun_warning_is_rate_limited() {
        let mut h = harness(Settings::default(), Vec::new());
        let start = Instant::now() + Duration::from_secs(1);
        let lag = Duration::from_millis(200);
        let mut warned = Vec::new();
        for k in 0..=20u64 {
            let now = start + Duration::from_millis(100 * k);
            h.orchestrator.process_frame(&frame_at(now - lag), now);
            if h.orchestrator.last_budget_warning == Some(now) {
                warned.push(k);
            }
        }
        assert_eq!(warned, vec![0, 10, 20]);
    }

    #[test]
    fn runs_from_a_mock_fallback_camera() {
        let handles = SharedHandles::default();
        let config = CameraConfig {
            width: 64,
            height: 48,
            fps: 100,
            device: 3,
            allow_mock: true,
        };
        let failing: DeviceOpener = Arc::new(|config: &CameraConfig, _: CaptureBackend| -> Result<Box<dyn CaptureDevice>, CaptureError> {
            Err(CaptureError::DeviceUnavailable {
                device: config.device,
                reason: "no such device".to_string(),
            })
        });
        let source = CameraSource::open_with(&config, handles.health.clone(), &failing)
            .expect("mock source opens");
        let opener = CameraOpener::with_device_opener(config, handles.health.clone(), failing);
        let broadcaster = RecordingBroadcaster::default();
        let tracker = FiducialTracker::new(
            Box::new(FixedMarkers(Vec::new())),
            Arc::new(IntrinsicsCache::new("/nonexistent/intrinsics.json")),
        );
        let mut orchestrator = PerceptionOrchestrator::new(
            handles.clone(),
            Box::new(source),
            Box::new(opener),
            Box::new(ScriptedExtractor {
                present: Arc::new(AtomicBool::new(true)),
            }),
            tracker,
            Arc::new(broadcaster.clone()),
        );

        let deadline = Instant::now() + Duration::from_secs(3);
        let report = loop {
            match orchestrator.tick(Instant::now()) {
                Tick::Processed(report) => break report,
                Tick::Idle(pause) => {
                    assert!(Instant::now() < deadline, "no frame processed in time");
                    std::thread::sleep(pause);
                }
            }
        };
        assert!(report.overlay_sent);
        assert_eq!(broadcaster.messages().len(), 1);
        assert_eq!(orchestrator.landmarks()["mouth_center"], Point::new(0.5, 0.5));
        let health = handles.health.snapshot();
        assert_eq!(health.camera, CameraStatus::Mock);
        assert!(health.last_frame_ns.is_some());

        orchestrator.source.close();
        assert_eq!(handles.health.snapshot().camera, CameraStatus::Off);
    }
}
