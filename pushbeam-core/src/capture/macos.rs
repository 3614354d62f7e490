//! macOS capture adapter over the ScreenCaptureKit bridge dylib.
//!
//! The bridge (`libscreenstream.dylib`) drives ScreenCaptureKit and
//! invokes plain C callbacks from its own dispatch threads:
//!
//! ```text
//! StartCapture(display, x, y, w, h, fps, fullscreen_fps,
//!              region_cb, fullscreen_cb,
//!              region_stopped_cb, fullscreen_stopped_cb) → i32
//! StopCapture() → i32
//! ```
//!
//! Region frames arrive pre-cropped at the configured size (RGB24);
//! fullscreen frames arrive at native resolution about once per
//! second. Each stream reports its own stop through its stopped
//! callback, which is what the service's two-stream rendezvous waits
//! on.
//!
//! ## Callback dispatch
//!
//! The C callbacks carry no user context, so sessions are resolved
//! through an explicit registry: an arena of session slots plus an
//! atomic "active" index. The handle into the arena lives exactly as
//! long as the adapter's session — it is claimed in `start`, and the
//! slot is freed when the session is replaced or the adapter drops.
//! The dylib supports a single capture session at a time, matching
//! the one-active-session invariant of the adapter itself.

use std::ffi::{CStr, c_char};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use crate::capture::pool::{FramePool, PooledBuffer};
use crate::capture::{CaptureEvent, CaptureEventTx, CaptureStoppedEvent, FrameKind, StopReason};
use crate::codec::{self, PANEL_WIDTH, REGION_HEIGHT, REGION_RGB_BYTES};
use crate::config::CaptureConfiguration;
use crate::display::DisplayInfo;
use crate::error::BeamError;

/// Settle delay between issuing the permission check and querying the
/// granted state.
const PERMISSION_SETTLE: Duration = Duration::from_millis(100);

/// Stop codes that mean "closed from outside, nothing is wrong":
/// a clean shutdown and SCStreamErrorUserStopped.
const BENIGN_STOP_CODES: [i32; 2] = [0, -3817];

/// Log one overrun warning per this many dropped frames.
const OVERRUN_LOG_INTERVAL: u64 = 100;

// ── Native ABI ───────────────────────────────────────────────────

type FrameCallback = unsafe extern "C" fn(data: *const u8, length: i32);
type StopCallback = unsafe extern "C" fn(error_code: i32, description: *const c_char);

#[link(name = "screenstream")]
unsafe extern "C" {
    #[link_name = "CheckCapturePermission"]
    fn native_check_permission();
    #[link_name = "IsCapturePermissionGranted"]
    fn native_is_permission_granted() -> bool;
    #[link_name = "StartCapture"]
    fn native_start_capture(
        display_id: i32,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        frame_rate: i32,
        full_screen_frame_rate: i32,
        region_callback: FrameCallback,
        full_screen_callback: FrameCallback,
        region_stopped_callback: StopCallback,
        full_screen_stopped_callback: StopCallback,
    ) -> i32;
    #[link_name = "StopCapture"]
    fn native_stop_capture() -> i32;
}

// ── Session registry ─────────────────────────────────────────────

static SESSIONS: Mutex<Vec<Option<Arc<SessionShared>>>> = Mutex::new(Vec::new());
/// Slot index + 1 of the session the callbacks resolve to; 0 = none.
static ACTIVE_SESSION: AtomicUsize = AtomicUsize::new(0);

fn register_session(session: &Arc<SessionShared>) -> usize {
    let mut sessions = SESSIONS.lock().unwrap_or_else(|p| p.into_inner());
    let slot = sessions
        .iter()
        .position(Option::is_none)
        .unwrap_or_else(|| {
            sessions.push(None);
            sessions.len() - 1
        });
    sessions[slot] = Some(Arc::clone(session));
    ACTIVE_SESSION.store(slot + 1, Ordering::Release);
    slot
}

fn unregister_session(slot: usize) {
    let mut sessions = SESSIONS.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(entry) = sessions.get_mut(slot) {
        *entry = None;
    }
    let _ = ACTIVE_SESSION.compare_exchange(
        slot + 1,
        0,
        Ordering::AcqRel,
        Ordering::Relaxed,
    );
}

fn with_active_session(f: impl FnOnce(&SessionShared)) {
    let index = ACTIVE_SESSION.load(Ordering::Acquire);
    if index == 0 {
        return;
    }
    let session = {
        let sessions = SESSIONS.lock().unwrap_or_else(|p| p.into_inner());
        sessions.get(index - 1).and_then(Clone::clone)
    };
    if let Some(session) = session {
        f(&session);
    }
}

// ── Session state ────────────────────────────────────────────────

struct StreamState {
    /// `None` once torn down; the lock serializes an in-flight native
    /// callback against stop-time teardown.
    buffer: Mutex<Option<PooledBuffer>>,
    overruns: AtomicU64,
}

impl StreamState {
    fn new(pool: &Arc<FramePool>) -> Self {
        Self {
            buffer: Mutex::new(Some(pool.rent())),
            overruns: AtomicU64::new(0),
        }
    }

    fn teardown(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            *buffer = None;
        }
    }
}

struct SessionShared {
    events: CaptureEventTx,
    capturing: AtomicBool,
    voluntary: AtomicBool,
    region: StreamState,
    fullscreen: StreamState,
    /// Configured region size; frames are scaled to the panel crop
    /// when a HiDPI capture does not already match it.
    region_width: u32,
    region_height: u32,
    scaled: Mutex<Vec<u8>>,
}

impl SessionShared {
    fn on_frame(&self, kind: FrameKind, data: *const u8, length: i32) {
        if !self.capturing.load(Ordering::Acquire) || length <= 0 || data.is_null() {
            return;
        }
        let src = unsafe { std::slice::from_raw_parts(data, length as usize) };

        let stream = match kind {
            FrameKind::Region => &self.region,
            FrameKind::FullScreen => &self.fullscreen,
        };
        let Ok(mut guard) = stream.buffer.lock() else {
            return;
        };
        let Some(buffer) = guard.as_mut() else {
            // Torn down while this callback was in flight.
            return;
        };

        if let Err(e) = buffer.write(src) {
            let dropped = stream.overruns.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % OVERRUN_LOG_INTERVAL == 1 {
                warn!(?kind, dropped, "{e}");
            }
            return;
        }

        let payload = match kind {
            FrameKind::Region
                if (self.region_width, self.region_height) != (PANEL_WIDTH, REGION_HEIGHT) =>
            {
                let Ok(mut scaled) = self.scaled.lock() else {
                    return;
                };
                codec::scale_rgb24(
                    buffer.filled(),
                    self.region_width,
                    self.region_height,
                    &mut scaled,
                    PANEL_WIDTH,
                    REGION_HEIGHT,
                );
                Bytes::copy_from_slice(&scaled)
            }
            _ => Bytes::copy_from_slice(buffer.filled()),
        };
        drop(guard);

        let _ = self.events.send(CaptureEvent::Frame { kind, data: payload });
    }

    fn on_stopped(&self, kind: FrameKind, error_code: i32, description: *const c_char) {
        let message = if description.is_null() {
            format!("stream stopped with code {error_code}")
        } else {
            unsafe { CStr::from_ptr(description) }
                .to_string_lossy()
                .into_owned()
        };

        let reason = if self.voluntary.load(Ordering::Acquire)
            || BENIGN_STOP_CODES.contains(&error_code)
        {
            StopReason::Voluntary
        } else {
            StopReason::Unknown
        };

        let _ = self.events.send(CaptureEvent::Stopped {
            kind,
            event: CaptureStoppedEvent {
                error_code,
                message,
                reason,
            },
        });
    }
}

// ── Callback trampolines ─────────────────────────────────────────

unsafe extern "C" fn region_frame_cb(data: *const u8, length: i32) {
    with_active_session(|s| s.on_frame(FrameKind::Region, data, length));
}

unsafe extern "C" fn fullscreen_frame_cb(data: *const u8, length: i32) {
    with_active_session(|s| s.on_frame(FrameKind::FullScreen, data, length));
}

unsafe extern "C" fn region_stopped_cb(error_code: i32, description: *const c_char) {
    with_active_session(|s| s.on_stopped(FrameKind::Region, error_code, description));
}

unsafe extern "C" fn fullscreen_stopped_cb(error_code: i32, description: *const c_char) {
    with_active_session(|s| s.on_stopped(FrameKind::FullScreen, error_code, description));
}

// ── MacCaptureAdapter ────────────────────────────────────────────

/// ScreenCaptureKit-backed capture adapter.
pub struct MacCaptureAdapter {
    session: Option<(usize, Arc<SessionShared>)>,
}

impl MacCaptureAdapter {
    pub fn new() -> Self {
        Self { session: None }
    }

    fn release_session(&mut self) {
        if let Some((slot, _)) = self.session.take() {
            unregister_session(slot);
        }
    }
}

impl Default for MacCaptureAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureAdapter for MacCaptureAdapter {
    async fn check_permission(&mut self) -> Result<bool, BeamError> {
        unsafe { native_check_permission() };
        tokio::time::sleep(PERMISSION_SETTLE).await;
        Ok(unsafe { native_is_permission_granted() })
    }

    fn is_capturing(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|(_, s)| s.capturing.load(Ordering::Acquire))
    }

    fn start(
        &mut self,
        config: &CaptureConfiguration,
        display: &DisplayInfo,
        events: CaptureEventTx,
    ) -> Result<(), BeamError> {
        if self.is_capturing() {
            return Err(BeamError::AlreadyCapturing);
        }
        self.release_session();

        let region_pool = FramePool::new((config.width * config.height) as usize * 3);
        let fullscreen_pool = FramePool::new((display.width * display.height) as usize * 3);

        let session = Arc::new(SessionShared {
            events,
            capturing: AtomicBool::new(false),
            voluntary: AtomicBool::new(false),
            region: StreamState::new(&region_pool),
            fullscreen: StreamState::new(&fullscreen_pool),
            region_width: config.width,
            region_height: config.height,
            scaled: Mutex::new(vec![0u8; REGION_RGB_BYTES]),
        });
        let slot = register_session(&session);

        let result = unsafe {
            native_start_capture(
                display.id as i32,
                config.capture_x,
                config.capture_y,
                config.width as i32,
                config.height as i32,
                config.frame_rate as i32,
                1,
                region_frame_cb,
                fullscreen_frame_cb,
                region_stopped_cb,
                fullscreen_stopped_cb,
            )
        };
        if result != 0 {
            unregister_session(slot);
            return Err(BeamError::NativeCapture { code: result });
        }

        session.capturing.store(true, Ordering::Release);
        self.session = Some((slot, session));
        info!("native capture started");
        Ok(())
    }

    fn request_stop(&mut self) {
        let Some((_, session)) = &self.session else {
            return;
        };
        session.voluntary.store(true, Ordering::Release);
        if !session.capturing.swap(false, Ordering::AcqRel) {
            return;
        }

        // Return the pooled buffers before the native layer drains;
        // a late callback finds the slot empty and drops its frame.
        session.region.teardown();
        session.fullscreen.teardown();

        let result = unsafe { native_stop_capture() };
        if result != 0 {
            warn!(code = result, "StopCapture reported an error");
        }
        // The slot stays registered so the stopped callbacks can
        // still resolve the session; it is freed on the next start
        // or when the adapter drops.
    }

    fn configuration_change_delay(
        &self,
        _current: Option<&CaptureConfiguration>,
        _next: &CaptureConfiguration,
    ) -> Duration {
        Duration::from_millis(400)
    }
}

impl Drop for MacCaptureAdapter {
    fn drop(&mut self) {
        self.request_stop();
        self.release_session();
    }
}
