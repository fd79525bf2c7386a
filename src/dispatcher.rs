//! The live capture loop.
//!
//! A single task owns the session, the sampling timer, in-flight requests and
//! the gallery. [`Dispatcher`] is a cheap handle that talks to it over a
//! command channel, every command carrying a oneshot for the reply.

use crate::{
    api::{DetectionMode, RealtimeResponse, SaveCaptureRequest, SaveCaptureResponse},
    client::{InferenceBackend, RealtimeRequest},
    dispatch_stats::{DispatchStats, StatsSnapshot},
    error::{CaptureError, Result},
    frame::decode_image_data,
    gallery::{Gallery, DEFAULT_RETENTION},
    render::{Renderer, SequenceGate},
    session::{
        CaptureArchiveEntry, DetectionResult, FrameSampleRequest, SessionInfo, TaggedResult,
    },
    source::{FrameSource, SourceProvider, SourceSelector},
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle, JoinSet},
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Skip a timer fire while the previous frame of the session is still outstanding.
    pub single_flight: bool,
    /// Upper bound for one realtime or archive call, after which the frame counts as failed.
    pub request_timeout: Duration,
    /// Archive every positive result.
    pub auto_save: bool,
    /// Ask the service to draw boxes into `processed_image`.
    pub show_boxes: bool,
    /// Interval used until `start_session` or `set_interval` picks another.
    pub default_interval: Duration,
    /// Gallery size.
    pub retention: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            single_flight: false,
            request_timeout: Duration::from_secs(10),
            auto_save: false,
            show_boxes: true,
            default_interval: Duration::from_millis(500),
            retention: DEFAULT_RETENTION,
        }
    }
}

enum Command {
    Start {
        selector: SourceSelector,
        interval: Option<Duration>,
        mode: DetectionMode,
        reply: oneshot::Sender<Result<SessionInfo>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SetInterval {
        interval: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    SetMode {
        mode: DetectionMode,
        reply: oneshot::Sender<()>,
    },
    SetAutoSave {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    SetShowBoxes {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    CaptureNow {
        reply: oneshot::Sender<Result<CaptureArchiveEntry>>,
    },
    Gallery {
        reply: oneshot::Sender<Vec<CaptureArchiveEntry>>,
    },
    Stats {
        reply: oneshot::Sender<StatsSnapshot>,
    },
    Session {
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
}

/// Handle to the capture loop. Clones share the same loop, which exits once
/// every handle is dropped or [`Dispatcher::shutdown`] is called.
#[derive(Clone)]
pub struct Dispatcher {
    commands: mpsc::Sender<Command>,
    cancellation_token: CancellationToken,
}

impl Dispatcher {
    /// Spawns the loop on the current runtime.
    pub fn spawn(
        config: DispatcherConfig,
        backend: Arc<dyn InferenceBackend>,
        provider: Arc<dyn SourceProvider>,
        renderer: Box<dyn Renderer>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let cancellation_token = CancellationToken::new();
        let task = DispatcherTask::new(config, backend, provider, renderer);
        let handle = tokio::spawn(task.run(rx, cancellation_token.clone()));
        (
            Self {
                commands: tx,
                cancellation_token,
            },
            handle,
        )
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CaptureError::DispatcherClosed)?;
        response.await.map_err(|_| CaptureError::DispatcherClosed)
    }

    /// Acquires the source and starts sampling. A running session is stopped first.
    ///
    /// Without an `interval` the session samples at the last one set through
    /// [`Dispatcher::set_interval`], or `DispatcherConfig::default_interval`.
    pub async fn start_session(
        &self,
        selector: SourceSelector,
        interval: Option<Duration>,
        mode: DetectionMode,
    ) -> Result<SessionInfo> {
        self.request(|reply| Command::Start {
            selector,
            interval,
            mode,
            reply,
        })
        .await?
    }

    /// Releases the source and stops the timer. No-op without a session.
    pub async fn stop_session(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn set_interval(&self, interval: Duration) -> Result<()> {
        self.request(|reply| Command::SetInterval { interval, reply })
            .await?
    }

    /// Applies to frames sampled from now on, in-flight frames keep their mode.
    pub async fn set_mode(&self, mode: DetectionMode) -> Result<()> {
        self.request(|reply| Command::SetMode { mode, reply }).await
    }

    pub async fn set_auto_save(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetAutoSave { enabled, reply })
            .await
    }

    pub async fn set_show_boxes(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetShowBoxes { enabled, reply })
            .await
    }

    /// Grabs a frame right away and archives it, whatever the timer and auto-save say.
    pub async fn capture_now(&self) -> Result<CaptureArchiveEntry> {
        self.request(|reply| Command::CaptureNow { reply }).await?
    }

    /// Recent captures, newest first.
    pub async fn gallery(&self) -> Result<Vec<CaptureArchiveEntry>> {
        self.request(|reply| Command::Gallery { reply }).await
    }

    pub async fn stats(&self) -> Result<StatsSnapshot> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn session(&self) -> Result<Option<SessionInfo>> {
        self.request(|reply| Command::Session { reply }).await
    }

    /// Stops the loop. Outstanding requests are aborted and their responses dropped.
    pub fn shutdown(&self) {
        self.cancellation_token.cancel();
    }
}

struct CaptureSession {
    info: SessionInfo,
    source: Box<dyn FrameSource>,
    ticker: Interval,
    outstanding: usize,
}

struct FrameOutcome {
    sample: FrameSampleRequest,
    round_trip: Duration,
    response: Result<RealtimeResponse>,
}

struct SaveOutcome {
    capture_id: u64,
    mode: DetectionMode,
    captured_at: DateTime<Utc>,
    response: Result<SaveCaptureResponse>,
    reply: Option<oneshot::Sender<Result<CaptureArchiveEntry>>>,
}

struct DispatcherTask {
    config: DispatcherConfig,
    backend: Arc<dyn InferenceBackend>,
    provider: Arc<dyn SourceProvider>,
    renderer: Box<dyn Renderer>,
    session: Option<CaptureSession>,
    mode: DetectionMode,
    interval: Duration,
    auto_save: bool,
    show_boxes: bool,
    next_session_id: u64,
    next_sequence_id: u64,
    capture_count: u64,
    in_flight: JoinSet<FrameOutcome>,
    saves: JoinSet<SaveOutcome>,
    gate: SequenceGate,
    gallery: Gallery,
    stats: DispatchStats,
}

impl DispatcherTask {
    fn new(
        config: DispatcherConfig,
        backend: Arc<dyn InferenceBackend>,
        provider: Arc<dyn SourceProvider>,
        renderer: Box<dyn Renderer>,
    ) -> Self {
        Self {
            mode: DetectionMode::Plate,
            interval: config.default_interval,
            auto_save: config.auto_save,
            show_boxes: config.show_boxes,
            gallery: Gallery::new(config.retention),
            config,
            backend,
            provider,
            renderer,
            session: None,
            next_session_id: 0,
            next_sequence_id: 0,
            capture_count: 0,
            in_flight: JoinSet::new(),
            saves: JoinSet::new(),
            gate: SequenceGate::default(),
            stats: DispatchStats::default(),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, token: CancellationToken) {
        debug!("Starting capture dispatcher");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(()) = next_tick(&mut self.session) => self.on_tick().await,
                Some(joined) = self.in_flight.join_next() => self.on_frame_done(joined),
                Some(joined) = self.saves.join_next() => self.on_save_done(joined),
            }
        }
        self.stop_session("dispatcher shut down");
        self.renderer.flush().await;
        debug!("Stop capture dispatcher");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                selector,
                interval,
                mode,
                reply,
            } => {
                let result = self.start_session(selector, interval, mode).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop_session("stopped");
                self.renderer.flush().await;
                let _ = reply.send(());
            }
            Command::SetInterval { interval, reply } => {
                let _ = reply.send(self.set_interval(interval));
            }
            Command::SetMode { mode, reply } => {
                if mode != self.mode {
                    info!("Switching detection mode {} -> {}", self.mode, mode);
                }
                self.mode = mode;
                if let Some(session) = self.session.as_mut() {
                    session.info.mode = mode;
                }
                let _ = reply.send(());
            }
            Command::SetAutoSave { enabled, reply } => {
                self.auto_save = enabled;
                let _ = reply.send(());
            }
            Command::SetShowBoxes { enabled, reply } => {
                self.show_boxes = enabled;
                let _ = reply.send(());
            }
            Command::CaptureNow { reply } => self.capture_now(reply).await,
            Command::Gallery { reply } => {
                let _ = reply.send(self.gallery.to_vec());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats.snapshot());
            }
            Command::Session { reply } => {
                let _ = reply.send(self.session.as_ref().map(|s| s.info.clone()));
            }
        }
    }

    async fn start_session(
        &mut self,
        selector: SourceSelector,
        interval: Option<Duration>,
        mode: DetectionMode,
    ) -> Result<SessionInfo> {
        let interval = interval.unwrap_or(self.interval);
        if interval.is_zero() {
            return Err(CaptureError::InvalidInterval);
        }
        self.stop_session("replaced by a new session");

        let source = match self.provider.acquire(&selector).await {
            Ok(source) => source,
            Err(e) => {
                error!("Failed to open source {}: {}", selector, e);
                return Err(e);
            }
        };

        self.next_session_id += 1;
        self.mode = mode;
        self.interval = interval;
        let info = SessionInfo {
            session_id: self.next_session_id,
            selector,
            interval,
            mode,
        };
        info!(
            "Session {} started on {} every {:#?} in {} mode",
            info.session_id, info.selector, interval, mode
        );
        self.session = Some(CaptureSession {
            info: info.clone(),
            source,
            ticker: sampling_timer(interval),
            outstanding: 0,
        });
        Ok(info)
    }

    fn stop_session(&mut self, reason: &str) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.source.release();
        if session.outstanding > 0 {
            debug!(
                "Session {}: dropping {} outstanding frames",
                session.info.session_id, session.outstanding
            );
        }
        info!("Session {} ended: {}", session.info.session_id, reason);
        self.renderer.session_ended(session.info.session_id, reason);
    }

    fn set_interval(&mut self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(CaptureError::InvalidInterval);
        }
        self.interval = interval;
        if let Some(session) = self.session.as_mut() {
            // Assigning drops the old timer, there is never more than one to poll.
            session.ticker = sampling_timer(interval);
            session.info.interval = interval;
            debug!(
                "Session {}: sampling every {:#?}",
                session.info.session_id, interval
            );
        }
        Ok(())
    }

    async fn on_tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.config.single_flight && session.outstanding > 0 {
            debug!(
                "Session {}: skipping frame, {} still outstanding",
                session.info.session_id, session.outstanding
            );
            self.stats.record_dropped();
            return;
        }

        match session.source.grab().await {
            Ok(payload) => {
                session.outstanding += 1;
                let session_id = session.info.session_id;
                self.dispatch_frame(session_id, payload);
            }
            Err(e) => {
                error!("Frame source failed: {:?}", e);
                self.stop_session(&format!("source failed: {e:#}"));
            }
        }
    }

    fn dispatch_frame(&mut self, session_id: u64, payload: Vec<u8>) {
        self.next_sequence_id += 1;
        let sample = FrameSampleRequest {
            sequence_id: self.next_sequence_id,
            session_id,
            payload,
            mode: self.mode,
            show_boxes: self.show_boxes,
            requested_at: Utc::now(),
        };
        debug!(
            "Dispatching frame #{} ({} bytes) in {} mode",
            sample.sequence_id,
            sample.payload.len(),
            sample.mode
        );
        self.stats.record_dispatch();

        let backend = self.backend.clone();
        let timeout = self.config.request_timeout;
        self.in_flight.spawn(async move {
            let request = RealtimeRequest {
                image_data: sample.payload.clone(),
                mode: sample.mode,
                show_boxes: sample.show_boxes,
            };
            let started = Instant::now();
            let response = match tokio::time::timeout(timeout, backend.process_realtime(request)).await
            {
                Ok(response) => response,
                Err(_) => Err(CaptureError::DispatchFailure(format!(
                    "no response within {timeout:#?}"
                ))),
            };
            FrameOutcome {
                sample,
                round_trip: started.elapsed(),
                response,
            }
        });
    }

    fn on_frame_done(&mut self, joined: std::result::Result<FrameOutcome, JoinError>) {
        let FrameOutcome {
            sample,
            round_trip,
            response,
        } = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                if !e.is_cancelled() {
                    error!("Frame task failed: {:?}", e);
                }
                return;
            }
        };

        match self.session.as_mut() {
            Some(session) if session.info.session_id == sample.session_id => {
                session.outstanding = session.outstanding.saturating_sub(1);
            }
            _ => {
                debug!(
                    "Frame #{} arrived after session {} ended, discarding",
                    sample.sequence_id, sample.session_id
                );
                self.stats.record_discarded();
                return;
            }
        }

        let response = match response {
            Ok(response) => response,
            Err(CaptureError::EndpointError(message)) => {
                warn!("Frame #{}: processing error: {}", sample.sequence_id, message);
                self.stats.record_endpoint_error();
                self.renderer.render_error(sample.mode, &message);
                return;
            }
            Err(e) => {
                warn!("Frame #{} failed: {}", sample.sequence_id, e);
                self.stats.record_failure();
                return;
            }
        };

        let detection_data = if self.auto_save {
            serde_json::to_string(&response).ok()
        } else {
            None
        };
        let tagged = TaggedResult {
            sequence_id: sample.sequence_id,
            session_id: sample.session_id,
            requested_at: sample.requested_at,
            round_trip,
            result: DetectionResult::from_response(sample.mode, response),
        };

        if self.gate.admit(tagged.mode(), tagged.sequence_id) {
            self.stats.record_rendered(Instant::now(), round_trip);
            self.renderer.render_result(&tagged);
        } else {
            debug!(
                "Frame #{} is older than the last rendered {} frame, not rendering",
                tagged.sequence_id,
                tagged.mode()
            );
            self.stats.record_stale();
        }

        if self.auto_save && tagged.result.is_positive() {
            // Prefer the annotated frame, like the live view shows it.
            let image = tagged
                .result
                .rendered_frame()
                .and_then(|frame| decode_image_data(frame).ok())
                .unwrap_or(sample.payload);
            self.archive(image, sample.mode, detection_data, None);
        }
    }

    async fn capture_now(&mut self, reply: oneshot::Sender<Result<CaptureArchiveEntry>>) {
        let Some(session) = self.session.as_mut() else {
            let _ = reply.send(Err(CaptureError::NoActiveSession));
            return;
        };
        match session.source.grab().await {
            Ok(frame) => self.archive(frame, self.mode, None, Some(reply)),
            Err(e) => {
                error!("Frame source failed during capture: {:?}", e);
                let message = format!("source failed: {e:#}");
                self.stop_session(&message);
                let _ = reply.send(Err(CaptureError::SourceUnavailable(message)));
            }
        }
    }

    fn archive(
        &mut self,
        image_data: Vec<u8>,
        mode: DetectionMode,
        detection_data: Option<String>,
        reply: Option<oneshot::Sender<Result<CaptureArchiveEntry>>>,
    ) {
        self.capture_count += 1;
        let capture_id = self.capture_count;
        let captured_at = Utc::now();
        let request = SaveCaptureRequest {
            image_data,
            mode,
            capture_id,
            detection_data,
        };
        debug!("Saving capture {} in {} mode", capture_id, mode);

        let backend = self.backend.clone();
        let timeout = self.config.request_timeout;
        self.saves.spawn(async move {
            let response = match tokio::time::timeout(timeout, backend.save_capture(request)).await
            {
                Ok(response) => response,
                Err(_) => Err(CaptureError::DispatchFailure(format!(
                    "no response within {timeout:#?}"
                ))),
            };
            SaveOutcome {
                capture_id,
                mode,
                captured_at,
                response,
                reply,
            }
        });
    }

    fn on_save_done(&mut self, joined: std::result::Result<SaveOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                if !e.is_cancelled() {
                    error!("Capture task failed: {:?}", e);
                }
                return;
            }
        };

        let result = match outcome.response {
            Ok(saved) => {
                let entry = CaptureArchiveEntry {
                    capture_id: outcome.capture_id,
                    image_ref: saved.image_path,
                    detection_id: saved.detection_id,
                    captured_at: outcome.captured_at,
                    mode: outcome.mode,
                };
                if let Some(evicted) = self.gallery.insert(entry.clone()) {
                    debug!("Gallery full, evicted capture {}", evicted.capture_id);
                }
                self.stats.record_capture();
                self.renderer.render_capture(&entry);
                Ok(entry)
            }
            Err(e) => {
                error!("Error saving capture {}: {}", outcome.capture_id, e);
                if let CaptureError::EndpointError(message) = &e {
                    self.renderer.render_error(outcome.mode, message);
                }
                Err(e)
            }
        };

        if let Some(reply) = outcome.reply {
            let _ = reply.send(result);
        }
    }
}

/// First fire is one period out, like a browser `setInterval`.
fn sampling_timer(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(session: &mut Option<CaptureSession>) -> Option<()> {
    match session {
        Some(session) => {
            session.ticker.tick().await;
            Some(())
        }
        None => None,
    }
}
