//! Screen capture: platform adapters and the owning service.
//!
//! | Module    | Purpose                                             |
//! |-----------|-----------------------------------------------------|
//! | `pool`    | Pooled frame buffers with an overrun guard          |
//! | `adapter` | The per-OS capture seam and startup factory         |
//! | `service` | State machine owning adapter start/stop/reconfigure |
//! | `macos`   | ScreenCaptureKit bridge adapter (macOS)             |
//! | `windows` | DXGI Desktop Duplication adapter (Windows)          |

pub mod adapter;
pub mod pool;
pub mod service;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "windows")]
pub mod windows;

use bytes::Bytes;
use tokio::sync::mpsc;

pub use adapter::{CaptureAdapter, platform_adapter};
pub use pool::{FramePool, PooledBuffer};
pub use service::{CapturePhase, CaptureService, CaptureServiceEvent};

// ── Frame events ─────────────────────────────────────────────────

/// The two logical capture streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Fixed panel-resolution crop used for mirroring and the fast
    /// signature check.
    Region,
    /// Native-resolution capture, throttled to ~1/s, used only to
    /// relocate a lost signature.
    FullScreen,
}

/// Why a capture stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Ended on its own; requires recovery policy upstream.
    Unknown,
    /// Explicitly requested, or a benign external close.
    Voluntary,
}

/// A capture stream ended.
#[derive(Debug, Clone)]
pub struct CaptureStoppedEvent {
    pub error_code: i32,
    pub message: String,
    pub reason: StopReason,
}

/// Events flowing from an adapter into the service dispatch loop.
///
/// Frame payloads are copies taken from the adapter's pooled buffers;
/// the native buffer is never referenced past its callback.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Frame { kind: FrameKind, data: Bytes },
    Stopped {
        kind: FrameKind,
        event: CaptureStoppedEvent,
    },
}

/// Sender half handed to adapters on start.
pub type CaptureEventTx = mpsc::UnboundedSender<CaptureEvent>;
/// Receiver half consumed by the service dispatch loop.
pub type CaptureEventRx = mpsc::UnboundedReceiver<CaptureEvent>;

/// Build the adapter→service event channel.
pub fn event_channel() -> (CaptureEventTx, CaptureEventRx) {
    mpsc::unbounded_channel()
}
