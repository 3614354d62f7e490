//! The display wire protocol and its transport.
//!
//! ## Wire format
//!
//! Per outgoing image:
//!
//! ```text
//! header:  16 bytes  FF CC AA 88 00 .. 00   (bulk, 1000 ms timeout)
//! payload: 327 680 bytes of panel data      (RGB565 swapped, XORed,
//!          row-padded), split into 65 536-byte chunks, each one bulk
//!          transfer with a 200 ms timeout
//! ```
//!
//! A failed or short transfer aborts that frame — there is no
//! partial-frame retry — and counts one consecutive error; three in a
//! row trip a circuit breaker that disables sends until the next
//! [`connect`](UsbTransport::connect).
//!
//! ## Backpressure
//!
//! Strictly one send is in flight. A frame arriving while the
//! background sender is busy is dropped whole (most-recent-wins, no
//! queue) — bounded latency beats completeness here. Conversion runs
//! on the caller's thread into a staging buffer, then swaps into the
//! send slot under its own lock, so the sender always transmits a
//! complete, stable buffer.
//!
//! A once-per-second watchdog keeps the panel alive when capture
//! stalls: it re-transmits the last converted buffer whenever no new
//! frame arrived within the last second and the overlay has nothing
//! visible to say about it. Overlay changes re-render independently of
//! capture cadence.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, PANEL_FRAME_BYTES, PANEL_RGB_BYTES, PANEL_WIDTH, REGION_RGB_BYTES};
use crate::error::BeamError;
use crate::overlay::{OverlayCompositor, Subsystem};
use crate::usb::backend::{UsbBackend, describe_error};
use crate::usb::identity::DeviceIdentity;

/// Fixed frame header: magic plus zero padding.
pub const FRAME_HEADER: [u8; 16] = [
    0xFF, 0xCC, 0xAA, 0x88, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00,
];

/// Bulk chunk size the panel expects (512 × 128).
pub const CHUNK_SIZE: usize = 512 * 128;

const HEADER_TIMEOUT: Duration = Duration::from_millis(1000);
const CHUNK_TIMEOUT: Duration = Duration::from_millis(200);

/// Consecutive transfer failures that trip the circuit breaker.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Watchdog period; also the "recent frame" horizon.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

// ── Shared state ─────────────────────────────────────────────────

struct DeviceState {
    backend: Box<dyn UsbBackend>,
    identity: DeviceIdentity,
}

/// Staging buffers for the convert path. The converted frame swaps
/// into the separate send slot so conversion and transmission never
/// alias.
struct Staging {
    cropped: Vec<u8>,
    last_rgb: Vec<u8>,
    conversion: Vec<u8>,
}

#[derive(Default)]
struct Tasks {
    listener: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    overlay: Option<JoinHandle<()>>,
}

struct TransportShared {
    /// One lock for the device handle: connect, disconnect and send
    /// never interleave.
    device: Mutex<DeviceState>,
    staging: Mutex<Staging>,
    send: Mutex<Vec<u8>>,
    overlay: Arc<OverlayCompositor>,
    connected: AtomicBool,
    in_flight: AtomicBool,
    consecutive_errors: AtomicU32,
    seen_frames: AtomicU64,
    skipped_frames: AtomicU64,
    last_frame: Mutex<Option<Instant>>,
}

impl TransportShared {
    fn note_frame(&self) {
        if let Ok(mut last) = self.last_frame.lock() {
            *last = Some(Instant::now());
        }
    }

    fn has_recent_frame(&self) -> bool {
        self.last_frame
            .lock()
            .ok()
            .and_then(|l| *l)
            .is_some_and(|at| at.elapsed() <= WATCHDOG_PERIOD)
    }

    /// Accept one region frame (panel crop plus signature row).
    fn send_frame(self: &Arc<Self>, frame: &[u8]) {
        let seen = self.seen_frames.fetch_add(1, Ordering::Relaxed) + 1;
        let skipped = self.skipped_frames.load(Ordering::Relaxed);
        if skipped % 1000 == 1 {
            info!(skipped, seen, "dropped frames while sends were in flight");
        }

        if self.in_flight.load(Ordering::Acquire) {
            self.skipped_frames.fetch_add(1, Ordering::Relaxed);
            debug!("previous send still in flight, dropping frame");
            return;
        }

        if self.consecutive_errors.load(Ordering::Acquire) >= MAX_CONSECUTIVE_ERRORS {
            error!("too many consecutive errors, transmission disabled until reconnect");
            return;
        }

        if frame.len() < REGION_RGB_BYTES {
            warn!(len = frame.len(), "region frame too short");
            return;
        }

        {
            let Ok(mut staging) = self.staging.lock() else {
                return;
            };
            // Drop the signature row off the top.
            let crop_start = PANEL_WIDTH as usize * 3;
            staging
                .last_rgb
                .copy_from_slice(&frame[crop_start..crop_start + PANEL_RGB_BYTES]);
            self.convert_locked(&mut staging);
        }

        self.spawn_send();
    }

    /// Blend the overlay over the last frame, convert to the wire
    /// format, and swap the result into the send slot.
    fn convert_locked(&self, staging: &mut Staging) {
        let Staging {
            cropped,
            last_rgb,
            conversion,
        } = staging;
        cropped.copy_from_slice(last_rgb);
        self.overlay.blend_into(cropped);
        codec::rgb24_to_panel(cropped, conversion);
        if let Ok(mut send) = self.send.lock() {
            std::mem::swap(&mut *send, conversion);
        }
    }

    /// Hand the send buffer to the background worker, unless one is
    /// already busy.
    fn spawn_send(self: &Arc<Self>) {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let result = shared.transmit_current();
            shared.in_flight.store(false, Ordering::Release);
            match result {
                Ok(()) => {
                    shared.consecutive_errors.store(0, Ordering::Release);
                }
                Err(e) => {
                    error!("could not send frame: {e}");
                    shared.consecutive_errors.fetch_add(1, Ordering::AcqRel);
                }
            }
        });
    }

    /// Transmit header plus chunked payload. Aborts the frame on the
    /// first failed or short transfer.
    fn transmit_current(&self) -> Result<(), BeamError> {
        let Ok(mut device) = self.device.lock() else {
            return Ok(());
        };
        if !self.connected.load(Ordering::Acquire) {
            warn!("device went away before the send started");
            return Ok(());
        }
        let identity = device.identity;
        let Ok(send) = self.send.lock() else {
            return Ok(());
        };
        debug_assert_eq!(send.len() % CHUNK_SIZE, 0);

        let (code, sent) =
            device
                .backend
                .bulk_transfer(identity.endpoint, &FRAME_HEADER, HEADER_TIMEOUT);
        if code != 0 || sent != FRAME_HEADER.len() {
            error!(sent, "could not send full frame header");
            return Err(BeamError::UsbTransport {
                code,
                name: describe_error(&*device.backend, code),
            });
        }

        for (index, chunk) in send.chunks(CHUNK_SIZE).enumerate() {
            let (code, sent) = device
                .backend
                .bulk_transfer(identity.endpoint, chunk, CHUNK_TIMEOUT);
            if code != 0 || sent != chunk.len() {
                error!(
                    index,
                    sent,
                    expected = chunk.len(),
                    "usb transfer failed mid-frame"
                );
                return Err(BeamError::UsbTransport {
                    code,
                    name: describe_error(&*device.backend, code),
                });
            }
        }

        Ok(())
    }

    /// Re-render the overlay over the last frame and push it out.
    fn refresh_overlay(self: &Arc<Self>) {
        if !self.connected.load(Ordering::Acquire) || self.in_flight.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut staging) = self.staging.lock() {
            self.convert_locked(&mut staging);
        }
        self.spawn_send();
    }
}

// ── UsbTransport ─────────────────────────────────────────────────

/// Owns the USB device handle and the outgoing frame path.
pub struct UsbTransport {
    shared: Arc<TransportShared>,
    frames: Mutex<Option<broadcast::Sender<Bytes>>>,
    tasks: Mutex<Tasks>,
}

impl UsbTransport {
    pub fn new(backend: Box<dyn UsbBackend>, overlay: Arc<OverlayCompositor>) -> Self {
        Self {
            shared: Arc::new(TransportShared {
                device: Mutex::new(DeviceState {
                    backend,
                    identity: DeviceIdentity::PUSH2,
                }),
                staging: Mutex::new(Staging {
                    cropped: vec![0u8; PANEL_RGB_BYTES],
                    last_rgb: vec![0u8; PANEL_RGB_BYTES],
                    conversion: vec![0u8; PANEL_FRAME_BYTES],
                }),
                send: Mutex::new(vec![0u8; PANEL_FRAME_BYTES]),
                overlay,
                connected: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                consecutive_errors: AtomicU32::new(0),
                seen_frames: AtomicU64::new(0),
                skipped_frames: AtomicU64::new(0),
                last_frame: Mutex::new(None),
            }),
            frames: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Region frames to mirror; subscribed on every `connect`.
    pub fn set_frame_source(&self, frames: broadcast::Sender<Bytes>) {
        if let Ok(mut slot) = self.frames.lock() {
            *slot = Some(frames);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Frames offered to the transport so far.
    pub fn seen_frames(&self) -> u64 {
        self.shared.seen_frames.load(Ordering::Relaxed)
    }

    /// Frames dropped because a send was in flight.
    pub fn skipped_frames(&self) -> u64 {
        self.shared.skipped_frames.load(Ordering::Relaxed)
    }

    /// Open the device and claim its display interface.
    ///
    /// Tries the primary identity, then the fallback hardware
    /// variant. Any failure releases partially acquired native
    /// resources and returns `false`.
    pub fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }

        {
            let Ok(mut device) = self.shared.device.lock() else {
                return false;
            };

            let code = device.backend.init();
            if code != 0 {
                error!(
                    "failed to initialize libusb: {}",
                    describe_error(&*device.backend, code)
                );
                return false;
            }

            let mut chosen = None;
            for identity in DeviceIdentity::PROBE_ORDER {
                if device.backend.open(identity.vendor_id, identity.product_id) {
                    chosen = Some(identity);
                    break;
                }
            }
            let Some(identity) = chosen else {
                device.backend.exit();
                error!("unable to find Push 2/3, is it connected?");
                return false;
            };
            info!("{} connected", identity.name());

            let code = device.backend.claim_interface(identity.interface_number);
            if code != 0 {
                error!(
                    "claim interface failed: {}",
                    describe_error(&*device.backend, code)
                );
                device.backend.release_interface(identity.interface_number);
                device.backend.close();
                device.backend.exit();
                return false;
            }

            device.identity = identity;
        }

        self.shared.consecutive_errors.store(0, Ordering::Release);
        self.shared.connected.store(true, Ordering::Release);
        self.spawn_frame_listener();
        self.shared
            .overlay
            .set_text(Subsystem::Transmission, "Connected", true);
        true
    }

    /// Feed one region frame directly (the frame listener does this
    /// for subscribed sources).
    pub fn send_frame(&self, frame: &[u8]) {
        self.shared.note_frame();
        self.shared.send_frame(frame);
    }

    /// Release the interface and free every native resource.
    ///
    /// Disconnecting while not connected is an error unless `force`
    /// is set; with `force` the call is idempotent.
    pub fn disconnect(&self, force: bool) -> Result<(), BeamError> {
        // Unsubscribe first: no frame may race the closing handle.
        if let Ok(mut tasks) = self.tasks.lock()
            && let Some(listener) = tasks.listener.take()
        {
            listener.abort();
        }

        if !force && !self.is_connected() {
            return Err(BeamError::NotConnected);
        }

        let Ok(mut device) = self.shared.device.lock() else {
            return Ok(());
        };
        let was_connected = self.shared.connected.swap(false, Ordering::AcqRel);
        if was_connected {
            let identity = device.identity;
            let code = device.backend.release_interface(identity.interface_number);
            if code != 0 {
                error!(
                    "failed to release interface: {}",
                    describe_error(&*device.backend, code)
                );
            }
            device.backend.close();
        }
        device.backend.exit();
        info!("disconnected");
        Ok(())
    }

    /// Start the watchdog and the overlay-change listener. Call once
    /// from within the runtime that should own them.
    pub fn start_watchdog(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };

        if tasks.watchdog.is_none() {
            let shared = Arc::clone(&self.shared);
            tasks.watchdog = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(WATCHDOG_PERIOD);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    watchdog_tick(&shared);
                }
            }));
        }

        if tasks.overlay.is_none() {
            let shared = Arc::clone(&self.shared);
            let mut changes = shared.overlay.subscribe_changes();
            tasks.overlay = Some(tokio::spawn(async move {
                while changes.changed().await.is_ok() {
                    shared.refresh_overlay();
                }
            }));
        }
    }

    fn spawn_frame_listener(&self) {
        let source = self.frames.lock().ok().and_then(|f| f.clone());
        let Some(source) = source else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime: the caller pushes frames via send_frame.
            return;
        };

        let mut rx = source.subscribe();
        let shared = Arc::clone(&self.shared);
        let task = handle.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        shared.note_frame();
                        shared.send_frame(&frame);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(previous) = tasks.listener.replace(task) {
                previous.abort();
            }
        }
    }
}

fn watchdog_tick(shared: &Arc<TransportShared>) {
    if !shared.connected.load(Ordering::Acquire) {
        return;
    }

    let now = clock_text();

    if shared.has_recent_frame() {
        shared
            .overlay
            .set_text(Subsystem::Transmission, &format!("Streaming ({now})"), false);
        return;
    }

    if shared.seen_frames.load(Ordering::Relaxed) > 0 {
        let visible = shared.overlay.set_text(
            Subsystem::Transmission,
            &format!("Resending ({now})"),
            false,
        );
        if !visible {
            // Nothing on the overlay to say it — refresh the panel
            // with the last converted buffer so it does not go stale.
            shared.spawn_send();
        }
        return;
    }

    shared
        .overlay
        .set_text(Subsystem::Transmission, "Connected", true);
}

fn clock_text() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        % 86_400;
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        seconds % 3600 / 60,
        seconds % 60
    )
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in [
                tasks.listener.take(),
                tasks.watchdog.take(),
                tasks.overlay.take(),
            ]
            .into_iter()
            .flatten()
            {
                task.abort();
            }
        }
        let _ = self.disconnect(true);
    }
}

// ── Tests ────────────────────────────────────────────────────────
