//! The capture service state machine.
//!
//! Owns the platform adapter's lifecycle and turns its raw event
//! stream into the crate's public surface:
//!
//! ```text
//!  Idle ──set_configuration──► Configured ──start_capture──► Capturing
//!                                   ▲                            │
//!                                   │ (both streams confirm,     ▼
//!                                   │  or 5 s timeout)        Stopping
//!                                   └────────────────────────────┘
//! ```
//!
//! One dispatch loop drains the adapter channel: Region frames feed
//! the signature fast path and the frame broadcast, FullScreen frames
//! feed the exhaustive scan, and stop confirmations feed the
//! two-stream stop rendezvous. An **involuntary** stop (reason not
//! recognized as a benign external close) marks the service stopped,
//! cleans up, and emits a typed event so the caller can decide whether
//! to restart; a **voluntary** stop participates only in the
//! rendezvous and never auto-notifies.
//!
//! Reconfiguration while capturing is debounced with a generation
//! counter: every change bumps the generation, and the delayed apply
//! task discards itself when its captured generation went stale —
//! rapid successive edits collapse into the last one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::capture::adapter::CaptureAdapter;
use crate::capture::{CaptureEvent, CaptureEventRx, CaptureEventTx, CaptureStoppedEvent, FrameKind, StopReason};
use crate::config::CaptureConfiguration;
use crate::diagnostics::FrameRateCounter;
use crate::display::{DisplayInfo, DisplayService};
use crate::error::BeamError;
use crate::locator::PatternLocator;
use crate::overlay::{OverlayCompositor, Subsystem};

/// How long to wait for both streams to confirm a manual stop before
/// cleaning up unilaterally.
const STOP_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(5);

// ── CapturePhase ─────────────────────────────────────────────────

/// The service lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapturePhase {
    /// No configuration supplied yet.
    #[default]
    Idle,
    /// A normalized configuration is held; not capturing.
    Configured,
    /// The native session is active.
    Capturing,
    /// A manual stop awaits its two stream confirmations.
    Stopping,
}

impl std::fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Configured => write!(f, "Configured"),
            Self::Capturing => write!(f, "Capturing"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

// ── Service events ───────────────────────────────────────────────

/// Notifications broadcast to external subscribers.
#[derive(Debug, Clone)]
pub enum CaptureServiceEvent {
    /// Capture started or stopped.
    StateChanged(bool),
    /// The native layer stopped involuntarily; the caller may choose
    /// to restart.
    Stopped(CaptureStoppedEvent),
}

// ── Stop rendezvous ──────────────────────────────────────────────

/// Tracks which streams have confirmed a stop.
struct StopRendezvous {
    flags: std::sync::Mutex<(bool, bool)>,
    notify: Notify,
}

impl StopRendezvous {
    fn new() -> Self {
        Self {
            flags: std::sync::Mutex::new((false, false)),
            notify: Notify::new(),
        }
    }

    /// Reset before requesting a stop.
    fn arm(&self) {
        if let Ok(mut flags) = self.flags.lock() {
            *flags = (false, false);
        }
    }

    fn mark(&self, kind: FrameKind) {
        let done = {
            let Ok(mut flags) = self.flags.lock() else {
                return;
            };
            match kind {
                FrameKind::Region => flags.0 = true,
                FrameKind::FullScreen => flags.1 = true,
            }
            flags.0 && flags.1
        };
        if done {
            self.notify.notify_waiters();
        }
    }

    fn is_done(&self) -> bool {
        self.flags.lock().map(|f| f.0 && f.1).unwrap_or(true)
    }

    async fn wait_both(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}

// ── CaptureService ───────────────────────────────────────────────

struct Control {
    config: Option<CaptureConfiguration>,
    phase: CapturePhase,
}

struct ServiceShared {
    /// Serializes every lifecycle operation against the adapter.
    adapter: AsyncMutex<Box<dyn CaptureAdapter>>,
    /// Configuration and phase; never held across an await.
    control: std::sync::Mutex<Control>,
    displays: std::sync::Mutex<DisplayService>,
    locator: Arc<PatternLocator>,
    overlay: Arc<OverlayCompositor>,
    frames: broadcast::Sender<Bytes>,
    events: broadcast::Sender<CaptureServiceEvent>,
    frame_rate: watch::Sender<f64>,
    stop_wait: StopRendezvous,
    /// Debounce generation; a pending apply with a stale generation
    /// discards itself.
    generation: AtomicU64,
    /// Width of the configured display, for fullscreen pixel math.
    display_width: AtomicU32,
    /// Cloned into the adapter on every start.
    adapter_events: CaptureEventTx,
}

/// Owns the platform adapter and exposes the unified pipeline events.
pub struct CaptureService {
    shared: Arc<ServiceShared>,
    ticker: tokio::task::JoinHandle<()>,
}

impl CaptureService {
    /// Build the service around `adapter`. Must be called within a
    /// Tokio runtime: the dispatch loop and the locator ticker are
    /// spawned here.
    pub fn new(
        adapter: Box<dyn CaptureAdapter>,
        displays: DisplayService,
        overlay: Arc<OverlayCompositor>,
    ) -> Self {
        let (adapter_events, event_rx) = crate::capture::event_channel();
        let (frames, _) = broadcast::channel(8);
        let (events, _) = broadcast::channel(16);
        let (frame_rate, _) = watch::channel(0.0);
        let locator = Arc::new(PatternLocator::new());

        let shared = Arc::new(ServiceShared {
            adapter: AsyncMutex::new(adapter),
            control: std::sync::Mutex::new(Control {
                config: None,
                phase: CapturePhase::Idle,
            }),
            displays: std::sync::Mutex::new(displays),
            locator: Arc::clone(&locator),
            overlay,
            frames,
            events,
            frame_rate,
            stop_wait: StopRendezvous::new(),
            generation: AtomicU64::new(0),
            display_width: AtomicU32::new(0),
            adapter_events,
        });

        tokio::spawn(dispatch_loop(Arc::downgrade(&shared), event_rx));
        let ticker = locator.spawn_ticker();

        Self { shared, ticker }
    }

    // ── Outputs ──────────────────────────────────────────────────

    /// Region frames, re-broadcast after the signature fast path.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Bytes> {
        self.shared.frames.subscribe()
    }

    /// Sender handle for the region-frame broadcast, for collaborators
    /// that subscribe on their own schedule (the USB transport
    /// re-subscribes on every connect).
    pub fn frame_sender(&self) -> broadcast::Sender<Bytes> {
        self.shared.frames.clone()
    }

    /// State changes and involuntary-stop notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CaptureServiceEvent> {
        self.shared.events.subscribe()
    }

    /// Measured frame rate, updated about once per second.
    pub fn frame_rate(&self) -> watch::Receiver<f64> {
        self.shared.frame_rate.subscribe()
    }

    /// The signature locator (enable flag, location events).
    pub fn locator(&self) -> Arc<PatternLocator> {
        Arc::clone(&self.shared.locator)
    }

    // ── State access ─────────────────────────────────────────────

    pub fn phase(&self) -> CapturePhase {
        self.shared
            .control
            .lock()
            .map(|c| c.phase)
            .unwrap_or_default()
    }

    pub fn is_capturing(&self) -> bool {
        self.phase() == CapturePhase::Capturing
    }

    pub fn current_configuration(&self) -> Option<CaptureConfiguration> {
        self.shared
            .control
            .lock()
            .ok()
            .and_then(|c| c.config.clone())
    }

    /// Snapshot of the known displays.
    pub fn displays(&self) -> Vec<DisplayInfo> {
        self.shared
            .displays
            .lock()
            .map(|d| d.displays().to_vec())
            .unwrap_or_default()
    }

    /// Re-enumerate displays after a display-change notification.
    pub fn refresh_displays(&self) {
        if let Ok(mut displays) = self.shared.displays.lock() {
            displays.refresh();
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Forwarded to the adapter (probe-and-settle on macOS,
    /// always-granted on Windows).
    pub async fn check_permission(&self) -> Result<bool, BeamError> {
        let mut adapter = self.shared.adapter.lock().await;
        adapter.check_permission().await
    }

    /// Normalize and store a new configuration. When capturing and
    /// the configuration actually changed, schedules a debounced
    /// adapter update; rapid successive calls collapse into the last.
    pub async fn set_configuration(&self, configuration: CaptureConfiguration) {
        info!(%configuration, "setting configuration");

        let normalized = {
            let Ok(displays) = self.shared.displays.lock() else {
                return;
            };
            let normalized = configuration.normalized(displays.displays());
            let width = displays
                .display(normalized.display_id)
                .map(|d| d.width)
                .unwrap_or(0);
            self.shared.display_width.store(width, Ordering::Relaxed);
            normalized
        };

        let (previous, needs_update) = {
            let Ok(mut control) = self.shared.control.lock() else {
                return;
            };
            let previous = control.config.replace(normalized.clone());
            if control.phase == CapturePhase::Idle {
                control.phase = CapturePhase::Configured;
            }
            let needs_update = control.phase == CapturePhase::Capturing
                && previous.is_some()
                && previous.as_ref() != Some(&normalized);
            (previous, needs_update)
        };

        if !needs_update {
            return;
        }
        let Some(previous) = previous else { return };

        let delay = {
            let adapter = self.shared.adapter.lock().await;
            adapter.configuration_change_delay(Some(&previous), &normalized)
        };
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.generation.load(Ordering::SeqCst) != generation {
                debug!("discarding stale configuration update");
                return;
            }
            apply_configuration(&shared, previous, normalized).await;
        });
    }

    /// Start capturing with the current configuration.
    ///
    /// Fails fast when no configuration is set or the configured
    /// display is gone. A double start is a warning, not an error.
    pub async fn start_capture(&self) -> Result<(), BeamError> {
        info!("starting capture");
        let mut adapter = self.shared.adapter.lock().await;

        let config = {
            let control = self
                .shared
                .control
                .lock()
                .map_err(|_| BeamError::ChannelClosed)?;
            if matches!(
                control.phase,
                CapturePhase::Capturing | CapturePhase::Stopping
            ) {
                warn!("already capturing");
                return Ok(());
            }
            control
                .config
                .clone()
                .ok_or(BeamError::ConfigurationMissing)?
        };

        let display = {
            let displays = self
                .shared
                .displays
                .lock()
                .map_err(|_| BeamError::ChannelClosed)?;
            if !config.is_valid(displays.displays()) {
                return Err(match config.display_id {
                    None => BeamError::InvalidConfiguration("no display selected"),
                    Some(id) if displays.display(Some(id)).is_none() => {
                        BeamError::UnknownDisplay(id)
                    }
                    Some(_) => BeamError::InvalidConfiguration("invalid capture rectangle"),
                });
            }
            let id = config.display_id.ok_or(BeamError::ConfigurationMissing)?;
            displays
                .display(Some(id))
                .cloned()
                .ok_or(BeamError::UnknownDisplay(id))?
        };

        adapter.start(&config, &display, self.shared.adapter_events.clone())?;

        if let Ok(mut control) = self.shared.control.lock() {
            control.phase = CapturePhase::Capturing;
        }
        self.shared
            .overlay
            .set_text(Subsystem::Capture, "Capturing", false);
        let _ = self
            .shared
            .events
            .send(CaptureServiceEvent::StateChanged(true));

        info!("started capture");
        Ok(())
    }

    /// Stop capturing. Completes once both streams confirm, or after
    /// the 5 s rendezvous timeout — cleanup proceeds either way so an
    /// unresponsive native layer cannot deadlock the service.
    pub async fn stop_capture(&self) {
        info!("stopping capture");
        {
            let mut adapter = self.shared.adapter.lock().await;
            {
                let Ok(mut control) = self.shared.control.lock() else {
                    return;
                };
                if control.phase != CapturePhase::Capturing {
                    info!("was not capturing");
                    return;
                }
                control.phase = CapturePhase::Stopping;
            }
            self.shared.stop_wait.arm();
            adapter.request_stop();
        }

        if tokio::time::timeout(STOP_RENDEZVOUS_TIMEOUT, self.shared.stop_wait.wait_both())
            .await
            .is_err()
        {
            warn!("stop confirmations timed out, cleaning up unilaterally");
        }

        finish_stop(&self.shared);
        info!("stopped capture");
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

// ── Internals ────────────────────────────────────────────────────

fn finish_stop(shared: &ServiceShared) {
    if let Ok(mut control) = shared.control.lock() {
        control.phase = CapturePhase::Configured;
    }
    shared.overlay.set_text(Subsystem::Capture, "", false);
    let _ = shared.events.send(CaptureServiceEvent::StateChanged(false));
}

async fn apply_configuration(
    shared: &Arc<ServiceShared>,
    previous: CaptureConfiguration,
    next: CaptureConfiguration,
) {
    let display = {
        let Ok(displays) = shared.displays.lock() else {
            return;
        };
        displays.display(next.display_id).cloned()
    };
    let Some(display) = display else {
        warn!("configured display disappeared before the update applied");
        return;
    };

    let mut adapter = shared.adapter.lock().await;
    {
        let Ok(control) = shared.control.lock() else {
            return;
        };
        // The world may have moved on during the debounce delay.
        if control.phase != CapturePhase::Capturing || control.config.as_ref() != Some(&next) {
            return;
        }
    }

    if let Err(e) = adapter
        .apply_configuration(&previous, &next, &display, shared.adapter_events.clone())
        .await
    {
        error!("failed to apply configuration update: {e}");
    }
}

async fn handle_involuntary_stop(shared: &Arc<ServiceShared>, event: CaptureStoppedEvent) {
    let mut adapter = shared.adapter.lock().await;
    {
        let Ok(control) = shared.control.lock() else {
            return;
        };
        if control.phase != CapturePhase::Capturing {
            // A manual stop is already in charge, or we already
            // recovered from the first stream's notification.
            return;
        }
    }

    error!(
        code = event.error_code,
        message = %event.message,
        "capture stopped involuntarily"
    );

    // Tear down the surviving stream before reporting.
    adapter.request_stop();
    drop(adapter);

    finish_stop(shared);
    let _ = shared.events.send(CaptureServiceEvent::Stopped(event));
}

async fn dispatch_loop(shared: std::sync::Weak<ServiceShared>, mut events: CaptureEventRx) {
    let mut rate_counter = FrameRateCounter::new();

    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match event {
            CaptureEvent::Frame {
                kind: FrameKind::Region,
                data,
            } => {
                shared.locator.on_region_frame(&data);
                if let Some(rate) = rate_counter.on_frame() {
                    let _ = shared.frame_rate.send(rate);
                }
                let _ = shared.frames.send(data);
            }
            CaptureEvent::Frame {
                kind: FrameKind::FullScreen,
                data,
            } => {
                let width = shared.display_width.load(Ordering::Relaxed);
                shared.locator.on_fullscreen_frame(width, &data);
            }
            CaptureEvent::Stopped { kind, event } => {
                // Every confirmation counts toward a pending rendezvous.
                shared.stop_wait.mark(kind);
                if event.reason == StopReason::Unknown {
                    handle_involuntary_stop(&shared, event).await;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::DisplayInfo;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn display_3008() -> DisplayInfo {
        DisplayInfo {
            id: 0,
            width: 3008,
            height: 1692,
            is_primary: true,
            bounds_x: 0,
            bounds_y: 0,
            dpi_x: None,
            dpi_y: None,
        }
    }

    fn config_at(x: i32, y: i32, rate: u32) -> CaptureConfiguration {
        CaptureConfiguration {
            display_id: Some(0),
            capture_x: x,
            capture_y: y,
            width: 960,
            height: 161,
            frame_rate: rate,
        }
    }

    #[derive(Default)]
    struct ScriptedState {
        events: Option<CaptureEventTx>,
        capturing: bool,
        applied: Vec<CaptureConfiguration>,
    }

    /// In-memory adapter: confirms stops for the scripted streams and
    /// records every applied configuration.
    struct ScriptedAdapter {
        state: Arc<StdMutex<ScriptedState>>,
        starts: Arc<AtomicUsize>,
        /// Which streams confirm a requested stop.
        confirm: Vec<FrameKind>,
    }

    impl ScriptedAdapter {
        fn new() -> (Self, Arc<StdMutex<ScriptedState>>, Arc<AtomicUsize>) {
            let state = Arc::new(StdMutex::new(ScriptedState::default()));
            let starts = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    state: Arc::clone(&state),
                    starts: Arc::clone(&starts),
                    confirm: vec![FrameKind::Region, FrameKind::FullScreen],
                },
                state,
                starts,
            )
        }

        fn confirming(mut self, streams: Vec<FrameKind>) -> Self {
            self.confirm = streams;
            self
        }
    }

    #[async_trait]
    impl CaptureAdapter for ScriptedAdapter {
        async fn check_permission(&mut self) -> Result<bool, BeamError> {
            Ok(true)
        }

        fn is_capturing(&self) -> bool {
            self.state.lock().unwrap().capturing
        }

        fn start(
            &mut self,
            _config: &CaptureConfiguration,
            _display: &DisplayInfo,
            events: CaptureEventTx,
        ) -> Result<(), BeamError> {
            let mut state = self.state.lock().unwrap();
            if state.capturing {
                return Err(BeamError::AlreadyCapturing);
            }
            state.capturing = true;
            state.events = Some(events);
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn request_stop(&mut self) {
            let mut state = self.state.lock().unwrap();
            if !state.capturing {
                return;
            }
            state.capturing = false;
            if let Some(events) = &state.events {
                for &kind in &self.confirm {
                    let _ = events.send(CaptureEvent::Stopped {
                        kind,
                        event: CaptureStoppedEvent {
                            error_code: 0,
                            message: "requested".into(),
                            reason: StopReason::Voluntary,
                        },
                    });
                }
            }
        }

        fn configuration_change_delay(
            &self,
            _current: Option<&CaptureConfiguration>,
            _next: &CaptureConfiguration,
        ) -> Duration {
            Duration::from_millis(400)
        }

        async fn apply_configuration(
            &mut self,
            _previous: &CaptureConfiguration,
            next: &CaptureConfiguration,
            _display: &DisplayInfo,
            _events: CaptureEventTx,
        ) -> Result<(), BeamError> {
            self.state.lock().unwrap().applied.push(next.clone());
            Ok(())
        }
    }

    fn service_with(adapter: ScriptedAdapter) -> CaptureService {
        CaptureService::new(
            Box::new(adapter),
            DisplayService::with_displays(vec![display_3008()]),
            Arc::new(OverlayCompositor::new()),
        )
    }

    async fn settle() {
        // Let the dispatch loop drain.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn start_without_configuration_fails() {
        let (adapter, _, _) = ScriptedAdapter::new();
        let service = service_with(adapter);

        let err = service.start_capture().await.unwrap_err();
        assert!(matches!(err, BeamError::ConfigurationMissing));
        assert_eq!(service.phase(), CapturePhase::Idle);
    }

    #[tokio::test]
    async fn configuration_is_stored_normalized() {
        let (adapter, _, _) = ScriptedAdapter::new();
        let service = service_with(adapter);

        service.set_configuration(config_at(400, 1000, 24)).await;

        // Already in bounds: stored unchanged.
        assert_eq!(service.current_configuration(), Some(config_at(400, 1000, 24)));
        assert_eq!(service.phase(), CapturePhase::Configured);

        service.set_configuration(config_at(9000, -5, 400)).await;
        let stored = service.current_configuration().unwrap();
        assert_eq!(stored.capture_x, 3008 - 960);
        assert_eq!(stored.capture_y, 0);
        assert_eq!(stored.frame_rate, 100);
    }

    #[tokio::test]
    async fn double_start_is_a_noop() {
        let (adapter, _, starts) = ScriptedAdapter::new();
        let service = service_with(adapter);

        service.set_configuration(config_at(0, 0, 24)).await;
        service.start_capture().await.unwrap();
        service.start_capture().await.unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(service.is_capturing());
    }

    #[tokio::test]
    async fn start_with_missing_display_fails() {
        let (adapter, _, _) = ScriptedAdapter::new();
        let service = CaptureService::new(
            Box::new(adapter),
            DisplayService::with_displays(vec![display_3008()]),
            Arc::new(OverlayCompositor::new()),
        );

        service.set_configuration(config_at(0, 0, 24)).await;
        // The display disappears between configuration and start.
        if let Ok(mut displays) = service.shared.displays.lock() {
            *displays = DisplayService::with_displays(Vec::new());
        }

        let err = service.start_capture().await.unwrap_err();
        assert!(matches!(err, BeamError::UnknownDisplay(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_completes_on_both_confirmations() {
        let (adapter, _, _) = ScriptedAdapter::new();
        let service = service_with(adapter);

        service.set_configuration(config_at(0, 0, 24)).await;
        service.start_capture().await.unwrap();
        settle().await;

        service.stop_capture().await;
        assert_eq!(service.phase(), CapturePhase::Configured);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_times_out_when_one_stream_never_confirms() {
        let (adapter, _, _) = ScriptedAdapter::new();
        let adapter = adapter.confirming(vec![FrameKind::Region]);
        let service = service_with(adapter);

        service.set_configuration(config_at(0, 0, 24)).await;
        service.start_capture().await.unwrap();
        settle().await;

        // The paused clock auto-advances through the 5 s timeout.
        service.stop_capture().await;
        assert_eq!(service.phase(), CapturePhase::Configured);
    }

    #[tokio::test]
    async fn involuntary_stop_recovers_and_notifies() {
        let (adapter, state, _) = ScriptedAdapter::new();
        let service = service_with(adapter);
        let mut events = service.subscribe_events();

        service.set_configuration(config_at(0, 0, 24)).await;
        service.start_capture().await.unwrap();

        let tx = state.lock().unwrap().events.clone().unwrap();
        tx.send(CaptureEvent::Stopped {
            kind: FrameKind::Region,
            event: CaptureStoppedEvent {
                error_code: -1001,
                message: "stream failed".into(),
                reason: StopReason::Unknown,
            },
        })
        .unwrap();
        settle().await;

        assert_eq!(service.phase(), CapturePhase::Configured);

        let mut saw_stopped = false;
        let mut saw_state_change = false;
        while let Ok(event) = events.try_recv() {
            match event {
                CaptureServiceEvent::Stopped(e) => {
                    assert_eq!(e.error_code, -1001);
                    saw_stopped = true;
                }
                CaptureServiceEvent::StateChanged(false) => saw_state_change = true,
                CaptureServiceEvent::StateChanged(true) => {}
            }
        }
        assert!(saw_stopped);
        assert!(saw_state_change);
    }

    #[tokio::test]
    async fn region_frames_are_rebroadcast() {
        let (adapter, state, _) = ScriptedAdapter::new();
        let service = service_with(adapter);
        let mut frames = service.subscribe_frames();

        service.set_configuration(config_at(0, 0, 24)).await;
        service.start_capture().await.unwrap();

        let tx = state.lock().unwrap().events.clone().unwrap();
        tx.send(CaptureEvent::Frame {
            kind: FrameKind::Region,
            data: Bytes::from_static(&[1, 2, 3]),
        })
        .unwrap();
        settle().await;

        assert_eq!(frames.try_recv().unwrap(), Bytes::from_static(&[1, 2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_reconfiguration_collapses_to_last(){
        let (adapter, state, _) = ScriptedAdapter::new();
        let service = service_with(adapter);

        service.set_configuration(config_at(0, 0, 24)).await;
        service.start_capture().await.unwrap();

        service.set_configuration(config_at(100, 0, 24)).await;
        service.set_configuration(config_at(200, 0, 24)).await;
        service.set_configuration(config_at(300, 0, 24)).await;

        // Ride past every debounce window.
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        let applied = state.lock().unwrap().applied.clone();
        assert_eq!(applied.len(), 1, "stale updates must discard themselves");
        assert_eq!(applied[0].capture_x, 300);
    }

    #[tokio::test]
    async fn reconfiguration_while_idle_applies_nothing() {
        let (adapter, state, _) = ScriptedAdapter::new();
        let service = service_with(adapter);

        service.set_configuration(config_at(0, 0, 24)).await;
        service.set_configuration(config_at(50, 0, 24)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(state.lock().unwrap().applied.is_empty());
    }
}
