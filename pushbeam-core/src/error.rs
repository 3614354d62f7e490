//! Domain-specific error types for the mirroring pipeline.
//!
//! All fallible operations return `Result<T, BeamError>`.
//! Per-frame failures never unwind across the native callback
//! boundary — they are logged and the frame is dropped.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the mirroring pipeline.
#[derive(Debug, Error)]
pub enum BeamError {
    // ── Configuration Errors ─────────────────────────────────────
    /// An operation required a configuration that was never supplied.
    #[error("configuration not set")]
    ConfigurationMissing,

    /// The supplied configuration cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    /// The configured display is no longer present.
    #[error("unknown display: {0}")]
    UnknownDisplay(u32),

    // ── Capture Errors ───────────────────────────────────────────
    /// Screen-recording permission was not granted by the OS.
    #[error("capture permission not granted")]
    PermissionDenied,

    /// A native capture call returned a non-zero result code.
    #[error("native capture call failed with code {code}")]
    NativeCapture { code: i32 },

    /// `start` was called on an adapter that already has an active
    /// native session.
    #[error("capture already in progress")]
    AlreadyCapturing,

    /// A native callback delivered more bytes than the pooled buffer
    /// can hold. The frame is dropped.
    #[error("frame of {len} bytes exceeds pooled buffer capacity {capacity}")]
    BufferOverrun { len: usize, capacity: usize },

    /// No capture adapter exists for this platform.
    #[error("screen capture is not supported on this platform")]
    Unsupported,

    // ── USB Errors ───────────────────────────────────────────────
    /// A libusb call failed. `name` is the resolved human-readable
    /// error name (vendor lookup with a built-in fallback table).
    #[error("usb transfer failed: {name} (code {code})")]
    UsbTransport { code: i32, name: String },

    /// Disconnect was requested while no device was connected.
    #[error("cannot disconnect, not connected")]
    NotConnected,

    // ── Async Plumbing ───────────────────────────────────────────
    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// An event channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BeamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BeamError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = BeamError::BufferOverrun {
            len: 5000,
            capacity: 4096,
        };
        assert!(e.to_string().contains("5000"));
        assert!(e.to_string().contains("4096"));

        let e = BeamError::UsbTransport {
            code: -7,
            name: "Timeout".into(),
        };
        assert!(e.to_string().contains("Timeout"));
        assert!(e.to_string().contains("-7"));
    }

    #[test]
    fn not_connected_message() {
        assert!(BeamError::NotConnected.to_string().contains("not connected"));
    }
}
