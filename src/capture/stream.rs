use log::{debug, error, info, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{oneshot, watch};

use super::convert::convert;
use super::dropper::{DropPolicy, FrameDropper};
use super::frame_pool::{BufferPool, PoolLimits};
use super::traits::{CaptureHandle, CaptureSource, FrameSink, StopObserver, StreamStopped};
use super::{Frame, RawSample};
use crate::assets::{LOG_EVERY_N_DROPS, LOG_EVERY_N_FRAMES};
use crate::config::{StreamConfig, StreamKind};
use crate::error::CaptureError;
use crate::pipeline::health::{StreamDiagnostics, StreamHealth};
use crate::pipeline::state::StreamState;

/// Per-stream tunables and identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Session generation reported in the stopped notification.
    pub generation: u64,
    pub pool_limits: PoolLimits,
    pub drop_policy: DropPolicy,
}

struct StreamShared {
    kind: StreamKind,
    config: StreamConfig,
    generation: u64,
    pool: Arc<BufferPool>,
    dropper: FrameDropper,
    health: StreamHealth,
    /// Cleared at stop request; later samples are discarded.
    accepting: AtomicBool,
    sequence: AtomicU64,
    sink: RwLock<Option<Arc<dyn FrameSink>>>,
    observer: Mutex<Option<Arc<dyn StopObserver>>>,
    handle: Mutex<Option<Box<dyn CaptureHandle>>>,
    state: watch::Sender<StreamState>,
}

impl StreamShared {
    fn label(&self) -> String {
        format!("{} stream (gen {})", self.kind, self.generation)
    }

    /// Apply `f` atomically. Returns the previous state if the move was valid.
    fn transition(&self, f: impl FnOnce(&StreamState) -> Option<StreamState>) -> Option<StreamState> {
        let mut applied = None;
        self.state.send_if_modified(|state| match f(state) {
            Some(target) if state.can_transition_to(&target) => {
                applied = Some(*state);
                *state = target;
                true
            }
            _ => false,
        });
        applied
    }

    fn current_state(&self) -> StreamState {
        *self.state.borrow()
    }

    fn revoke_sink(&self) {
        self.accepting.store(false, Ordering::Release);
        let mut sink = self.sink.write().unwrap_or_else(|p| p.into_inner());
        *sink = None;
    }

    fn current_sink(&self) -> Option<Arc<dyn FrameSink>> {
        self.sink
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(Arc::clone)
    }

    fn take_handle(&self) -> Option<Box<dyn CaptureHandle>> {
        self.handle.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn notify_stopped(&self, cause: Option<CaptureError>) {
        let observer = self.observer.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(observer) = observer else {
            return;
        };

        match &cause {
            None => info!("{} stopped", self.label()),
            Some(e) => warn!("{} stopped: {}", self.label(), e),
        }

        observer.on_stream_stopped(StreamStopped {
            kind: self.kind,
            generation: self.generation,
            cause,
        });
    }

    /// Settle a stop that went through `Stopping`.
    fn finish_stop(&self, result: Result<(), CaptureError>) {
        match result {
            Ok(()) => {
                if self.transition(|_| Some(StreamState::Stopped)).is_some() {
                    self.notify_stopped(None);
                }
            }
            Err(e) => {
                error!("{}: source failed to stop: {}", self.label(), e);
                if self.transition(|_| Some(StreamState::Error)).is_some() {
                    self.notify_stopped(Some(e));
                }
            }
        }
    }
}

fn spawn_stop(shared: Arc<StreamShared>, mut handle: Box<dyn CaptureHandle>) {
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(async move {
                let result = handle.stop().await;
                shared.finish_stop(result);
            });
        }
        Err(_) => {
            warn!("{}: no runtime to stop the source, dropping its handle", shared.label());
            drop(handle);
            shared.finish_stop(Ok(()));
        }
    }
}

/// Upstream entry points for a platform source.
///
/// Cloned into the source at `open`; every call lands on the stream that
/// created it.
#[derive(Clone)]
pub struct StreamInput {
    shared: Arc<StreamShared>,
}

impl StreamInput {
    /// Admit, convert and deliver one sample. Never panics or propagates errors.
    pub fn on_raw_frame(&self, sample: &RawSample<'_>) {
        let shared = &*self.shared;

        if !shared.accepting.load(Ordering::Acquire) {
            let late = shared.health.record_late_frame();
            if late % LOG_EVERY_N_DROPS == 1 {
                debug!("{}: discarded {} late frames", shared.label(), late);
            }
            return;
        }

        if let Err(reason) = sample.validate() {
            let malformed = shared.health.record_malformed();
            if malformed % LOG_EVERY_N_DROPS == 1 {
                warn!(
                    "{}: rejected malformed sample ({} so far): {}",
                    shared.label(),
                    malformed,
                    reason
                );
            }
            return;
        }

        if shared.dropper.should_drop(shared.pool.stats(), Instant::now()) {
            let stats = shared.dropper.stats();
            if stats.dropped % LOG_EVERY_N_DROPS == 1 {
                warn!(
                    "{}: dropping frames under backpressure ({} of {}, {:.1}%)",
                    shared.label(),
                    stats.dropped,
                    stats.total,
                    stats.drop_rate_percent
                );
            }
            return;
        }

        // Returned to the pool on every exit path below, unwinding included.
        let mut lease = shared.pool.lease(sample.frame_len());
        convert(sample, lease.as_mut_slice());

        let Some(sink) = shared.current_sink() else {
            shared.health.record_late_frame();
            return;
        };

        let frame = Frame {
            width: sample.width,
            height: sample.height,
            data: lease.as_slice(),
            sequence: shared.sequence.fetch_add(1, Ordering::Relaxed),
        };

        match catch_unwind(AssertUnwindSafe(|| sink.on_frame_ready(&frame))) {
            Ok(Ok(())) => {
                let delivered = shared.health.record_frame(frame.len());
                if delivered % LOG_EVERY_N_FRAMES == 0 {
                    let pool = shared.pool.stats();
                    debug!(
                        "{}: {} frames delivered, {} buffers out (peak {})",
                        shared.label(),
                        delivered,
                        pool.outstanding,
                        pool.peak_outstanding
                    );
                }
            }
            Ok(Err(e)) => {
                let failures = shared.health.record_sink_failure();
                if failures % LOG_EVERY_N_DROPS == 1 {
                    warn!("{}: sink rejected frame {}: {:#}", shared.label(), frame.sequence, e);
                }
            }
            Err(_) => {
                shared.health.record_sink_failure();
                error!("{}: sink panicked on frame {}", shared.label(), frame.sequence);
            }
        }
    }

    /// Source-initiated termination.
    pub fn on_stream_fault(&self, reason: impl Into<String>) {
        let shared = &self.shared;
        let reason = reason.into();

        if shared.transition(|_| Some(StreamState::Error)).is_none() {
            debug!("{}: ignoring fault after stop: {}", shared.label(), reason);
            return;
        }

        error!("{}: source fault: {}", shared.label(), reason);
        shared.revoke_sink();
        if let Some(handle) = shared.take_handle() {
            // The state is already terminal, so this only releases the source.
            spawn_stop(Arc::clone(&self.shared), handle);
        }
        shared.notify_stopped(Some(CaptureError::runtime_fault(reason)));
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn config(&self) -> StreamConfig {
        self.shared.config
    }
}

/// Resolves with the outcome of a `CaptureStream::start` registration.
pub struct StartCompletion {
    rx: oneshot::Receiver<Result<(), CaptureError>>,
}

impl StartCompletion {
    fn ready(result: Result<(), CaptureError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for StartCompletion {
    type Output = Result<(), CaptureError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(CaptureError::unknown("start task ended without an outcome"))
            })
        })
    }
}

/// One logical capture stream: receives samples from a source, converts them
/// and hands them to the sink.
pub struct CaptureStream {
    shared: Arc<StreamShared>,
    source: Arc<dyn CaptureSource>,
}

impl CaptureStream {
    pub fn new(
        kind: StreamKind,
        config: StreamConfig,
        source: Arc<dyn CaptureSource>,
        sink: Arc<dyn FrameSink>,
        observer: Arc<dyn StopObserver>,
    ) -> Self {
        Self::with_options(kind, config, source, sink, observer, StreamOptions::default())
    }

    pub fn with_options(
        kind: StreamKind,
        config: StreamConfig,
        source: Arc<dyn CaptureSource>,
        sink: Arc<dyn FrameSink>,
        observer: Arc<dyn StopObserver>,
        options: StreamOptions,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Idle);
        Self {
            shared: Arc::new(StreamShared {
                kind,
                config,
                generation: options.generation,
                pool: Arc::new(BufferPool::new(options.pool_limits)),
                dropper: FrameDropper::new(options.drop_policy),
                health: StreamHealth::new(),
                accepting: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                sink: RwLock::new(Some(sink)),
                observer: Mutex::new(Some(observer)),
                handle: Mutex::new(None),
                state,
            }),
            source,
        }
    }

    /// Ask the source to begin delivering samples.
    ///
    /// Returns immediately; the completion resolves once the source accepted
    /// or rejected the stream. Must be called from within a tokio runtime.
    pub fn start(&self) -> StartCompletion {
        if let Err(state) = self.begin_starting() {
            return StartCompletion::ready(Err(CaptureError::start_failure(format!(
                "{} cannot start from {}",
                self.shared.label(),
                state
            ))));
        }

        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let input = self.input();

        tokio::spawn(async move {
            info!(
                "{}: opening display {} crop {:?} at {} fps",
                shared.label(),
                shared.config.display_id,
                shared.config.crop,
                shared.config.frame_rate
            );

            let outcome = match source.open(shared.config, input).await {
                Ok(handle) => Self::on_opened(&shared, handle),
                Err(e) => {
                    error!("{}: source rejected start: {}", shared.label(), e);
                    shared.revoke_sink();
                    if shared.transition(|_| Some(StreamState::Error)).is_some() {
                        shared.notify_stopped(Some(e.clone()));
                    }
                    Err(e)
                }
            };

            let _ = tx.send(outcome);
        });

        StartCompletion { rx }
    }

    /// Idle to Starting; on failure returns the state that blocked it.
    fn begin_starting(&self) -> Result<(), StreamState> {
        let moved = self.shared.transition(|state| match state {
            StreamState::Idle => Some(StreamState::Starting),
            _ => None,
        });
        match moved {
            Some(_) => {
                self.shared.accepting.store(true, Ordering::Release);
                Ok(())
            }
            None => Err(self.shared.current_state()),
        }
    }

    fn on_opened(shared: &Arc<StreamShared>, handle: Box<dyn CaptureHandle>) -> Result<(), CaptureError> {
        // Parked before the state flips so a concurrent stop always finds it.
        *shared.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        let started = shared.transition(|state| match state {
            StreamState::Starting => Some(StreamState::Running {
                started_at: Instant::now(),
            }),
            _ => None,
        });
        if started.is_some() {
            info!("{}: running", shared.label());
            return Ok(());
        }

        // Stopped or faulted while the source was still registering.
        let state = shared.current_state();
        if let Some(handle) = shared.take_handle() {
            spawn_stop(Arc::clone(shared), handle);
        }
        match state {
            StreamState::Error => Err(CaptureError::runtime_fault(format!(
                "{} faulted during start",
                shared.label()
            ))),
            _ => Ok(()),
        }
    }

    /// Ask the source to cease delivery. No-op unless starting or running.
    pub fn stop(&self) {
        let shared = &self.shared;
        let Some(previous) = shared.transition(|state| match state {
            StreamState::Starting | StreamState::Running { .. } => Some(StreamState::Stopping),
            _ => None,
        }) else {
            return;
        };

        info!("{}: stop requested while {}", shared.label(), previous);
        shared.revoke_sink();

        if previous.is_running() {
            match shared.take_handle() {
                Some(handle) => spawn_stop(Arc::clone(shared), handle),
                None => shared.finish_stop(Ok(())),
            }
        }
    }

    pub fn state(&self) -> StreamState {
        self.shared.current_state()
    }

    /// Resolves once the stream reached `Stopped` or `Error`.
    pub async fn wait_terminal(&self) -> StreamState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(StreamState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Upstream handle for the source (also usable to drive the stream directly).
    pub fn input(&self) -> StreamInput {
        StreamInput {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn config(&self) -> StreamConfig {
        self.shared.config
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    pub fn pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.shared.pool)
    }

    pub fn diagnostics(&self) -> StreamDiagnostics {
        StreamDiagnostics::collect(
            self.shared.pool.stats(),
            self.shared.dropper.stats(),
            &self.shared.health,
        )
    }

    pub fn reset_diagnostics(&self) {
        self.shared.pool.reset_stats();
        self.shared.dropper.reset();
        self.shared.health.reset();
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            self.stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::display::DisplayDescriptor;
    use crate::config::CropRect;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// How the scripted source answers `open` and `stop`.
    #[derive(Clone, Default)]
    pub(crate) struct Script {
        pub open_error: Option<CaptureError>,
        pub open_delay: Option<Duration>,
        pub stop_error: Option<CaptureError>,
    }

    /// Source that records inputs instead of producing samples.
    #[derive(Default)]
    pub(crate) struct ScriptedSource {
        pub script: Mutex<Script>,
        pub displays: Vec<DisplayDescriptor>,
        pub inputs: Mutex<Vec<StreamInput>>,
        pub stops: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        pub fn new(script: Script) -> Self {
            Self {
                script: Mutex::new(script),
                displays: vec![DisplayDescriptor::new(0, 1920, 1080)],
                ..Default::default()
            }
        }

        pub fn input(&self, kind: StreamKind) -> Option<StreamInput> {
            self.inputs
                .lock()
                .unwrap()
                .iter()
                .find(|i| i.kind() == kind)
                .cloned()
        }
    }

    struct ScriptedHandle {
        stop_error: Option<CaptureError>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CaptureHandle for ScriptedHandle {
        async fn stop(&mut self) -> Result<(), CaptureError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            match self.stop_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl CaptureSource for ScriptedSource {
        async fn available_displays(&self) -> Result<Vec<DisplayDescriptor>, CaptureError> {
            Ok(self.displays.clone())
        }

        async fn open(
            &self,
            _config: StreamConfig,
            input: StreamInput,
        ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
            let script = self.script.lock().unwrap().clone();
            if let Some(delay) = script.open_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(e) = script.open_error {
                return Err(e);
            }
            self.inputs.lock().unwrap().push(input);
            Ok(Box::new(ScriptedHandle {
                stop_error: script.stop_error,
                stops: Arc::clone(&self.stops),
            }))
        }
    }

    pub(crate) fn argb_sample_bytes(width: u32, height: u32) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| [0xFF, i as u8, (i >> 8) as u8, 7])
            .collect()
    }

    fn stream_with(
        source: Arc<ScriptedSource>,
        sink: Arc<dyn FrameSink>,
    ) -> (CaptureStream, mpsc::UnboundedReceiver<StreamStopped>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = move |event: StreamStopped| {
            let _ = tx.send(event);
        };
        let config = StreamConfig::new(0, CropRect::new(0, 0, 100, 100), 30);
        let stream = CaptureStream::new(StreamKind::Region, config, source, sink, Arc::new(observer));
        (stream, rx)
    }

    fn counting_sink() -> (Arc<dyn FrameSink>, Arc<Mutex<Vec<usize>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_sink = Arc::clone(&seen);
        let sink = move |frame: &Frame<'_>| -> anyhow::Result<()> {
            seen_by_sink.lock().unwrap().push(frame.len());
            Ok(())
        };
        let sink: Arc<dyn FrameSink> = Arc::new(sink);
        (sink, seen)
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let (sink, _) = counting_sink();
        let (stream, mut stopped) = stream_with(Arc::clone(&source), sink);

        assert_eq!(stream.state(), StreamState::Idle);
        stream.start().await.expect("source accepts");
        assert!(stream.state().is_running());

        stream.stop();
        assert_eq!(stream.wait_terminal().await, StreamState::Stopped);

        let event = stopped.recv().await.expect("stopped notification");
        assert_eq!(event.kind, StreamKind::Region);
        assert!(event.cause.is_none());
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let (sink, _) = counting_sink();
        let (stream, mut stopped) = stream_with(Arc::clone(&source), sink);

        stream.start().await.unwrap();
        stream.stop();
        stream.wait_terminal().await;
        stream.stop();
        stream.stop();
        tokio::task::yield_now().await;

        assert!(stopped.recv().await.is_some());
        assert!(stopped.try_recv().is_err());
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_on_idle_is_noop() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let (sink, _) = counting_sink();
        let (stream, mut stopped) = stream_with(source, sink);

        stream.stop();
        assert_eq!(stream.state(), StreamState::Idle);
        assert!(stopped.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_start_reports_cause() {
        let source = Arc::new(ScriptedSource::new(Script {
            open_error: Some(CaptureError::start_failure("permission denied")),
            ..Script::default()
        }));
        let (sink, _) = counting_sink();
        let (stream, mut stopped) = stream_with(source, sink);

        let result = stream.start().await;
        assert!(matches!(result, Err(CaptureError::SourceStartFailure { .. })));
        assert_eq!(stream.state(), StreamState::Error);

        let event = stopped.recv().await.unwrap();
        assert!(matches!(event.cause, Some(CaptureError::SourceStartFailure { .. })));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let (sink, _) = counting_sink();
        let (stream, _stopped) = stream_with(source, sink);

        stream.start().await.unwrap();
        assert!(stream.start().await.is_err());
        assert!(stream.state().is_running());
    }

    #[tokio::test]
    async fn test_stop_while_starting() {
        let source = Arc::new(ScriptedSource::new(Script {
            open_delay: Some(Duration::from_millis(20)),
            ..Script::default()
        }));
        let (sink, _) = counting_sink();
        let (stream, mut stopped) = stream_with(Arc::clone(&source), sink);

        let completion = stream.start();
        assert_eq!(stream.state(), StreamState::Starting);
        stream.stop();
        assert_eq!(stream.state(), StreamState::Stopping);

        assert!(completion.await.is_ok());
        assert_eq!(stream.wait_terminal().await, StreamState::Stopped);
        assert!(stopped.recv().await.unwrap().cause.is_none());
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delivers_converted_frames() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let (sink, seen) = counting_sink();
        let (stream, _stopped) = stream_with(Arc::clone(&source), sink);
        stream.start().await.unwrap();

        let input = source.input(StreamKind::Region).unwrap();
        let data = argb_sample_bytes(100, 100);
        input.on_raw_frame(&RawSample::new(100, 100, 400, &data));

        assert_eq!(*seen.lock().unwrap(), vec![30_000]);
        let diag = stream.diagnostics();
        assert_eq!(diag.frames_delivered, 1);
        assert_eq!(diag.outstanding_buffers, 0);
    }

    #[tokio::test]
    async fn test_late_frames_discarded_after_stop() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let (sink, seen) = counting_sink();
        let (stream, _stopped) = stream_with(Arc::clone(&source), sink);
        stream.start().await.unwrap();
        let input = source.input(StreamKind::Region).unwrap();

        stream.stop();
        let data = argb_sample_bytes(10, 10);
        input.on_raw_frame(&RawSample::new(10, 10, 40, &data));

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(stream.diagnostics().late_frames, 1);
        assert_eq!(stream.diagnostics().outstanding_buffers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_races_delivery_threads() {
        const THREADS: usize = 4;

        let source = Arc::new(ScriptedSource::new(Script::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_sink = Arc::clone(&calls);
        let sink = move |_: &Frame<'_>| -> anyhow::Result<()> {
            calls_in_sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let (stream, mut stopped) = stream_with(Arc::clone(&source), Arc::new(sink));
        stream.start().await.unwrap();
        let input = source.input(StreamKind::Region).unwrap();

        let stop_requested = Arc::new(AtomicBool::new(false));
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let input = input.clone();
                let stop_requested = Arc::clone(&stop_requested);
                std::thread::spawn(move || {
                    let data = argb_sample_bytes(8, 8);
                    let sample = RawSample::new(8, 8, 32, &data);
                    let mut after_stop = 0;
                    while after_stop < 200 {
                        input.on_raw_frame(&sample);
                        if stop_requested.load(Ordering::Acquire) {
                            after_stop += 1;
                        }
                    }
                })
            })
            .collect();

        while calls.load(Ordering::SeqCst) < 50 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        stream.stop();
        // each thread may be past the sink lookup already
        let calls_at_stop = calls.load(Ordering::SeqCst);
        stop_requested.store(true, Ordering::Release);

        tokio::task::spawn_blocking(move || {
            for worker in workers {
                worker.join().unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(stream.wait_terminal().await, StreamState::Stopped);
        assert!(stopped.recv().await.unwrap().cause.is_none());

        let settled = calls.load(Ordering::SeqCst);
        assert!(settled <= calls_at_stop + THREADS);

        let data = argb_sample_bytes(8, 8);
        input.on_raw_frame(&RawSample::new(8, 8, 32, &data));
        assert_eq!(calls.load(Ordering::SeqCst), settled);

        let diag = stream.diagnostics();
        assert_eq!(diag.outstanding_buffers, 0);
        assert!(diag.late_frames >= (THREADS * 200) as u64);
        assert_eq!(diag.frames_delivered as usize, settled);
    }

    #[tokio::test]
    async fn test_sink_failures_release_buffers() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_sink = Arc::clone(&calls);
        let sink = move |_: &Frame<'_>| -> anyhow::Result<()> {
            match calls_in_sink.fetch_add(1, Ordering::SeqCst) {
                0 => anyhow::bail!("consumer busy"),
                1 => panic!("consumer crashed"),
                _ => Ok(()),
            }
        };
        let (stream, _stopped) = stream_with(Arc::clone(&source), Arc::new(sink));
        stream.start().await.unwrap();
        let input = source.input(StreamKind::Region).unwrap();

        let data = argb_sample_bytes(4, 4);
        for _ in 0..3 {
            input.on_raw_frame(&RawSample::new(4, 4, 16, &data));
        }

        let diag = stream.diagnostics();
        assert_eq!(diag.sink_failures, 2);
        assert_eq!(diag.frames_delivered, 1);
        assert_eq!(diag.outstanding_buffers, 0);
        assert!(stream.state().is_running());
    }

    #[tokio::test]
    async fn test_malformed_sample_rejected() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let (sink, seen) = counting_sink();
        let (stream, _stopped) = stream_with(Arc::clone(&source), sink);
        stream.start().await.unwrap();
        let input = source.input(StreamKind::Region).unwrap();

        let data = [0u8; 10];
        input.on_raw_frame(&RawSample::new(4, 4, 16, &data));

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(stream.diagnostics().malformed_samples, 1);
        assert_eq!(stream.diagnostics().frames_seen, 0);
    }

    #[tokio::test]
    async fn test_source_fault() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let (sink, _) = counting_sink();
        let (stream, mut stopped) = stream_with(Arc::clone(&source), sink);
        stream.start().await.unwrap();

        source.input(StreamKind::Region).unwrap().on_stream_fault("display disconnected");
        assert_eq!(stream.state(), StreamState::Error);

        let event = stopped.recv().await.unwrap();
        assert!(matches!(event.cause, Some(CaptureError::SourceRuntimeFault { .. })));

        // a later stop neither re-fires nor changes state
        stream.stop();
        assert_eq!(stream.state(), StreamState::Error);
        tokio::task::yield_now().await;
        assert!(stopped.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_failure_reports_cause() {
        let source = Arc::new(ScriptedSource::new(Script {
            stop_error: Some(CaptureError::unknown("teardown failed")),
            ..Script::default()
        }));
        let (sink, _) = counting_sink();
        let (stream, mut stopped) = stream_with(source, sink);
        stream.start().await.unwrap();

        stream.stop();
        assert_eq!(stream.wait_terminal().await, StreamState::Error);
        assert!(matches!(
            stopped.recv().await.unwrap().cause,
            Some(CaptureError::Unknown { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_diagnostics() {
        let source = Arc::new(ScriptedSource::new(Script::default()));
        let (sink, _) = counting_sink();
        let (stream, _stopped) = stream_with(Arc::clone(&source), sink);
        stream.start().await.unwrap();
        let input = source.input(StreamKind::Region).unwrap();

        let data = argb_sample_bytes(2, 2);
        input.on_raw_frame(&RawSample::new(2, 2, 8, &data));
        assert_eq!(stream.diagnostics().frames_seen, 1);

        stream.reset_diagnostics();
        let diag = stream.diagnostics();
        assert_eq!(diag.frames_seen, 0);
        assert_eq!(diag.frames_delivered, 0);
        assert_eq!(diag.buffers_created, 0);
    }
}
