//! # pushbeam-core
//!
//! Real-time pipeline that mirrors a cropped region of a computer
//! display onto the 960×160 panel of a Push 2/3 controller.
//!
//! ```text
//! DisplayService ─► CaptureAdapter ─► CaptureService ─┬─► PatternLocator
//!                                                     │
//!                                    OverlayCompositor┴─► UsbTransport ─► panel
//! ```
//!
//! This crate contains:
//! - **Display**: physical display enumeration ([`DisplayService`])
//! - **Config**: normalized capture configuration ([`CaptureConfiguration`])
//! - **Capture**: per-OS adapters behind one seam, owned by the
//!   [`CaptureService`] state machine
//! - **Codec**: panel wire-format conversion and bilinear scaling
//! - **Locator**: signature-based capture-offset auto-location
//! - **Overlay**: corner diagnostic text, alpha-blended into frames
//! - **Usb**: the chunked bulk wire protocol ([`UsbTransport`])
//! - **Error**: [`BeamError`] — typed, `thiserror`-based hierarchy
//!
//! GUI, settings persistence and wiring live with the embedding
//! application; they consume [`CaptureConfiguration`] and the event
//! streams exposed here.

pub mod capture;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod display;
pub mod error;
pub mod locator;
pub mod overlay;
pub mod usb;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{
    CaptureAdapter, CaptureEvent, CapturePhase, CaptureService, CaptureServiceEvent,
    CaptureStoppedEvent, FrameKind, StopReason, platform_adapter,
};
pub use config::CaptureConfiguration;
pub use diagnostics::FrameRateCounter;
pub use display::{DisplayInfo, DisplayService};
pub use error::BeamError;
pub use locator::{Location, LocatorEvent, PatternLocator};
pub use overlay::{OverlayCompositor, OverlayMode, Subsystem};
pub use usb::{DeviceIdentity, RusbBackend, UsbBackend, UsbTransport};
