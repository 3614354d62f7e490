//! The per-OS capture seam.
//!
//! Each platform bridges its native, callback-driven capture facility
//! into [`CaptureEvent`]s behind this trait. The service owns exactly
//! one adapter, picked by [`platform_adapter`] at startup — no
//! scattered compile-time conditionals above this seam.

use std::time::Duration;

use async_trait::async_trait;

use crate::capture::CaptureEventTx;
use crate::config::CaptureConfiguration;
use crate::display::DisplayInfo;
use crate::error::BeamError;

// ── CaptureAdapter ───────────────────────────────────────────────

/// A platform capture backend.
///
/// Lifecycle: `start` opens the native session and begins emitting
/// frame events on the supplied channel from native callback threads;
/// `request_stop` asks the native layer to end both streams — the
/// confirmations arrive asynchronously as [`CaptureEvent::Stopped`]
/// events, one per stream. At most one native session is active per
/// adapter at a time.
#[async_trait]
pub trait CaptureAdapter: Send {
    /// Probe OS screen-recording permission. May suspend (macOS
    /// issues a check and settles before querying the granted state).
    async fn check_permission(&mut self) -> Result<bool, BeamError>;

    /// Whether a native session is currently active.
    fn is_capturing(&self) -> bool;

    /// Open the native session for `config` on `display`.
    fn start(
        &mut self,
        config: &CaptureConfiguration,
        display: &DisplayInfo,
        events: CaptureEventTx,
    ) -> Result<(), BeamError>;

    /// Ask the native layer to end the session. Safe to call when not
    /// capturing. Stream confirmations arrive as stop events.
    fn request_stop(&mut self);

    /// How long to debounce before applying a configuration change.
    fn configuration_change_delay(
        &self,
        current: Option<&CaptureConfiguration>,
        next: &CaptureConfiguration,
    ) -> Duration;

    /// Apply a configuration change while capturing. The default is a
    /// full restart; platforms that can live-patch parameters
    /// override this.
    async fn apply_configuration(
        &mut self,
        _previous: &CaptureConfiguration,
        next: &CaptureConfiguration,
        display: &DisplayInfo,
        events: CaptureEventTx,
    ) -> Result<(), BeamError> {
        self.request_stop();
        self.start(next, display, events)
    }
}

// ── Startup factory ──────────────────────────────────────────────

/// The capture adapter for the running platform.
#[cfg(target_os = "macos")]
pub fn platform_adapter() -> Result<Box<dyn CaptureAdapter>, BeamError> {
    Ok(Box::new(crate::capture::macos::MacCaptureAdapter::new()))
}

/// The capture adapter for the running platform.
#[cfg(target_os = "windows")]
pub fn platform_adapter() -> Result<Box<dyn CaptureAdapter>, BeamError> {
    Ok(Box::new(crate::capture::windows::WindowsCaptureAdapter::new()))
}

/// The capture adapter for the running platform.
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub fn platform_adapter() -> Result<Box<dyn CaptureAdapter>, BeamError> {
    Err(BeamError::Unsupported)
}
