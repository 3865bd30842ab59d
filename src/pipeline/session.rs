//! Capture session coordinator
//!
//! Owns the region and full-screen streams of one capture session, starts and
//! stops them as a unit and folds their outcomes into a single
//! [`SessionStatus`]. Every `start` opens a new generation; callbacks from a
//! superseded generation never touch the current status.

use futures_util::future::join;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::capture::{
    CaptureSource, CaptureStream, DisplayDescriptor, DropPolicy, FrameSink, PoolLimits,
    StopObserver, StreamOptions, StreamStopped,
};
use crate::config::{SessionConfig, StreamKind};
use crate::error::CaptureError;
use crate::pipeline::health::StreamDiagnostics;
use crate::pipeline::state::{SessionStatus, StatusCell, StreamState};

/// Consumer endpoints of a session.
#[derive(Clone)]
pub struct SessionCallbacks {
    pub region_sink: Arc<dyn FrameSink>,
    pub full_screen_sink: Arc<dyn FrameSink>,
    pub stop_observer: Option<Arc<dyn StopObserver>>,
}

impl SessionCallbacks {
    pub fn new(region_sink: Arc<dyn FrameSink>, full_screen_sink: Arc<dyn FrameSink>) -> Self {
        Self {
            region_sink,
            full_screen_sink,
            stop_observer: None,
        }
    }

    pub fn with_stop_observer(mut self, observer: Arc<dyn StopObserver>) -> Self {
        self.stop_observer = Some(observer);
        self
    }
}

/// Tunables applied to every stream the session creates.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub pool_limits: PoolLimits,
    pub drop_policy: DropPolicy,
}

/// Per-stream diagnostics of the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionDiagnostics {
    pub generation: u64,
    pub region: Option<StreamDiagnostics>,
    pub full_screen: Option<StreamDiagnostics>,
}

type StartOutcome = Option<Result<(), CaptureError>>;

struct GenerationState {
    id: u64,
    cancel: CancellationToken,
    stop_requested: AtomicBool,
}

struct ActiveGeneration {
    state: Arc<GenerationState>,
    region: Option<Arc<CaptureStream>>,
    full_screen: Option<Arc<CaptureStream>>,
    started: watch::Receiver<StartOutcome>,
}

impl ActiveGeneration {
    fn streams(&self) -> impl Iterator<Item = &Arc<CaptureStream>> {
        self.region.iter().chain(self.full_screen.iter())
    }

    /// Cancel startup and stop both streams. Returns `false` if already stopping.
    fn request_stop(&self) -> bool {
        if self.state.stop_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.cancel.cancel();
        for stream in self.streams() {
            stream.stop();
        }
        true
    }
}

struct SessionShared {
    source: Arc<dyn CaptureSource>,
    callbacks: SessionCallbacks,
    options: SessionOptions,
    status: StatusCell,
    generation: AtomicU64,
    active: Mutex<Option<ActiveGeneration>>,
}

impl SessionShared {
    fn active(&self) -> MutexGuard<'_, Option<ActiveGeneration>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Status writes from asynchronous paths only land for the live generation.
    fn set_status_for(&self, generation: &GenerationState, status: SessionStatus) {
        if self.is_current(generation.id) {
            self.status.set(status);
        } else {
            info!(
                "Ignoring {} from superseded session gen {}",
                status, generation.id
            );
        }
    }

    fn on_stream_stopped(&self, generation: &GenerationState, event: StreamStopped) {
        if let Some(cause) = &event.cause {
            let stopping = generation.stop_requested.load(Ordering::Acquire);
            match cause {
                CaptureError::SourceRuntimeFault { .. } => {
                    warn!("Session gen {}: {} stream lost: {}", event.generation, event.kind, cause)
                }
                _ if stopping => {
                    error!(
                        "Session gen {}: {} stream failed to stop: {}",
                        event.generation, event.kind, cause
                    );
                    self.set_status_for(generation, SessionStatus::UnknownError);
                }
                // start failures are folded in by the supervisor
                _ => {}
            }
        }

        if let Some(observer) = &self.callbacks.stop_observer {
            observer.on_stream_stopped(event);
        }
    }
}

fn status_for(error: &CaptureError) -> SessionStatus {
    match error {
        CaptureError::Validation { .. } => SessionStatus::InitializationFailed,
        CaptureError::ResourceNotFound { .. } => SessionStatus::NoDisplaysFound,
        CaptureError::SourceStartFailure { .. }
        | CaptureError::SourceRuntimeFault { .. }
        | CaptureError::Unknown { .. } => SessionStatus::StartCaptureFailed,
    }
}

/// A capture session over one platform source.
pub struct CaptureSession {
    shared: Arc<SessionShared>,
}

impl CaptureSession {
    pub fn new(source: Arc<dyn CaptureSource>, callbacks: SessionCallbacks) -> Self {
        Self::with_options(source, callbacks, SessionOptions::default())
    }

    pub fn with_options(
        source: Arc<dyn CaptureSource>,
        callbacks: SessionCallbacks,
        options: SessionOptions,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                source,
                callbacks,
                options,
                status: StatusCell::new(SessionStatus::Success),
                generation: AtomicU64::new(0),
                active: Mutex::new(None),
            }),
        }
    }

    /// Validate `config` and start both streams in the background.
    ///
    /// Only validation errors are returned here; everything discovered later
    /// is reported through [`status`](Self::status), [`wait_started`](Self::wait_started)
    /// and the stop observer. Must be called from within a tokio runtime.
    pub fn start(&self, config: SessionConfig) -> Result<(), CaptureError> {
        if let Err(e) = config.validate() {
            warn!("Rejected capture session config: {}", e);
            self.shared.status.set(SessionStatus::InitializationFailed);
            return Err(e);
        }

        let state = {
            let mut active = self.shared.active();
            if let Some(previous) = active.take() {
                info!("Superseding capture session gen {}", previous.state.id);
                previous.request_stop();
            }

            let id = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let state = Arc::new(GenerationState {
                id,
                cancel: CancellationToken::new(),
                stop_requested: AtomicBool::new(false),
            });
            let (started_tx, started_rx) = watch::channel(None);
            *active = Some(ActiveGeneration {
                state: Arc::clone(&state),
                region: None,
                full_screen: None,
                started: started_rx,
            });
            self.shared.status.set(SessionStatus::Success);

            tokio::spawn(Self::supervise(
                Arc::clone(&self.shared),
                Arc::clone(&state),
                config.clone(),
                started_tx,
            ));
            state
        };

        info!(
            "Capture session gen {} accepted: display {} region {:?} at {} fps, full screen at {} fps",
            state.id,
            config.display_id,
            config.region(),
            config.region_frame_rate,
            config.full_screen_frame_rate
        );
        Ok(())
    }

    async fn supervise(
        shared: Arc<SessionShared>,
        generation: Arc<GenerationState>,
        config: SessionConfig,
        started: watch::Sender<StartOutcome>,
    ) {
        let outcome = Self::start_streams(&shared, &generation, &config).await;

        match &outcome {
            Ok(()) if generation.cancel.is_cancelled() => {
                info!("Capture session gen {} stopped during startup", generation.id)
            }
            Ok(()) => info!("Capture session gen {} running", generation.id),
            Err(e) if generation.cancel.is_cancelled() => {
                info!("Capture session gen {} startup abandoned: {}", generation.id, e)
            }
            Err(e) => {
                error!("Capture session gen {} failed to start: {}", generation.id, e);
                shared.set_status_for(&generation, status_for(e));
            }
        }

        started.send_replace(Some(outcome));
    }

    async fn start_streams(
        shared: &Arc<SessionShared>,
        generation: &Arc<GenerationState>,
        config: &SessionConfig,
    ) -> Result<(), CaptureError> {
        let display = tokio::select! {
            _ = generation.cancel.cancelled() => return Err(Self::abandoned(generation)),
            display = shared.source.find_display(config.display_id) => {
                display.map_err(|e| Self::display_unavailable(generation, config.display_id, e))?
            }
        };

        let region_cfg = config.region_stream();
        if !region_cfg.crop.fits_within(display.width, display.height) {
            return Err(CaptureError::start_failure(format!(
                "Region {:?} exceeds display {} ({} x {})",
                region_cfg.crop, display.id, display.width, display.height
            )));
        }

        let region = Arc::new(Self::build_stream(shared, generation, StreamKind::Region, config, &display));
        let full_screen = Arc::new(Self::build_stream(
            shared,
            generation,
            StreamKind::FullScreen,
            config,
            &display,
        ));

        let (region_started, full_started) = {
            let mut active = shared.active();
            let slot = match active.as_mut() {
                Some(slot) if slot.state.id == generation.id && !generation.cancel.is_cancelled() => slot,
                _ => return Err(Self::abandoned(generation)),
            };
            let completions = (region.start(), full_screen.start());
            slot.region = Some(Arc::clone(&region));
            slot.full_screen = Some(Arc::clone(&full_screen));
            completions
        };

        let (region_result, full_result) = join(region_started, full_started).await;
        if let Err(e) = region_result.and(full_result) {
            region.stop();
            full_screen.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Any failure to resolve the display surfaces as `ResourceNotFound`.
    fn display_unavailable(
        generation: &GenerationState,
        display_id: u32,
        cause: CaptureError,
    ) -> CaptureError {
        if !matches!(cause, CaptureError::ResourceNotFound { .. }) {
            warn!(
                "Session gen {}: could not resolve display {}: {}",
                generation.id, display_id, cause
            );
        }
        CaptureError::ResourceNotFound { display_id }
    }

    fn abandoned(generation: &GenerationState) -> CaptureError {
        CaptureError::unknown(format!("session gen {} was stopped before it started", generation.id))
    }

    fn build_stream(
        shared: &Arc<SessionShared>,
        generation: &Arc<GenerationState>,
        kind: StreamKind,
        config: &SessionConfig,
        display: &DisplayDescriptor,
    ) -> CaptureStream {
        let (stream_cfg, sink) = match kind {
            StreamKind::Region => (config.region_stream(), Arc::clone(&shared.callbacks.region_sink)),
            StreamKind::FullScreen => (
                config.full_screen_stream(display.width, display.height),
                Arc::clone(&shared.callbacks.full_screen_sink),
            ),
        };

        let weak: Weak<SessionShared> = Arc::downgrade(shared);
        let observed = Arc::clone(generation);
        let observer = move |event: StreamStopped| {
            if let Some(shared) = weak.upgrade() {
                shared.on_stream_stopped(&observed, event);
            }
        };

        CaptureStream::with_options(
            kind,
            stream_cfg,
            Arc::clone(&shared.source),
            sink,
            Arc::new(observer),
            StreamOptions {
                generation: generation.id,
                pool_limits: shared.options.pool_limits,
                drop_policy: shared.options.drop_policy,
            },
        )
    }

    /// Stop both streams and return the current status without waiting.
    ///
    /// Stopped notifications only come from streams that were created. When
    /// the stop lands while the display is still being resolved, no stream
    /// exists yet and [`wait_started`](Self::wait_started) reports the
    /// abandoned startup instead.
    pub fn stop(&self) -> SessionStatus {
        if let Some(active) = self.shared.active().as_ref() {
            if active.request_stop() {
                info!("Stopping capture session gen {}", active.state.id);
            }
        }
        self.status()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.get()
    }

    /// Generation of the most recent accepted `start`, 0 before the first.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Resolves with the startup outcome of the current generation.
    pub async fn wait_started(&self) -> Result<(), CaptureError> {
        let rx = self.shared.active().as_ref().map(|a| a.started.clone());
        let Some(mut rx) = rx else {
            return Err(CaptureError::unknown("no capture session was started"));
        };

        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
            Err(_) => Err(CaptureError::unknown("session supervisor ended without an outcome")),
        }
    }

    pub fn stream_state(&self, kind: StreamKind) -> Option<StreamState> {
        let active = self.shared.active();
        let slot = active.as_ref()?;
        let stream = match kind {
            StreamKind::Region => slot.region.as_ref(),
            StreamKind::FullScreen => slot.full_screen.as_ref(),
        };
        stream.map(|s| s.state())
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        let active = self.shared.active();
        match active.as_ref() {
            Some(slot) => SessionDiagnostics {
                generation: slot.state.id,
                region: slot.region.as_ref().map(|s| s.diagnostics()),
                full_screen: slot.full_screen.as_ref().map(|s| s.diagnostics()),
            },
            None => SessionDiagnostics::default(),
        }
    }

    pub fn reset_diagnostics(&self) {
        if let Some(slot) = self.shared.active().as_ref() {
            for stream in slot.streams() {
                stream.reset_diagnostics();
            }
        }
    }

    #[cfg(test)]
    fn stream(&self, kind: StreamKind) -> Option<Arc<CaptureStream>> {
        let active = self.shared.active();
        let slot = active.as_ref()?;
        match kind {
            StreamKind::Region => slot.region.clone(),
            StreamKind::FullScreen => slot.full_screen.clone(),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(active) = self.shared.active().as_ref() {
            active.request_stop();
        }
    }
}
