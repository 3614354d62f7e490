//! Signature-based capture-offset auto-location.
//!
//! The mirrored application embeds a fixed 16-unit two-tone signature
//! (`abaabbbaaaabbbbb`, tone A gray `0x1C`, tone B gray `0x2C`) at the
//! top-left of the monitored region, followed by a long black run.
//! [`PatternLocator`] watches both frame streams:
//!
//! - **Region frames** (fast path): the signature must sit at byte
//!   offset 0. Any mismatch flips an internal "lost" flag; the
//!   externally visible [`LocatorEvent::Lost`] fires only on the edge
//!   transition, deferred to the periodic tick so one glitched frame
//!   cannot cause flicker.
//! - **FullScreen frames**: an exhaustive byte scan relocates the
//!   signature anywhere on the display. Anti-aliased tails are
//!   tolerated by a truncated-prefix retry, and a black-run fallback
//!   matches the signature within a ±5 per-channel tolerance.
//!
//! [`LocatorEvent::Found`] is level-triggered: it re-fires on every
//! tick while a corrected location is known, so a caller can keep
//! re-asserting the capture offset until the region realigns.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ── Signature constants ──────────────────────────────────────────

/// Tolerance per channel for the approximate fallback matches.
const TOLERANCE: i16 = 5;

const TONE_A: u8 = 0x1C;
const TONE_B: u8 = 0x2C;

/// `abaabbbaaaabbbbb` as gray tones, one byte per unit.
const COLOR_PATTERN: [u8; 16] = [
    TONE_A, TONE_B, TONE_A, TONE_A, //
    TONE_B, TONE_B, TONE_B, TONE_A, //
    TONE_A, TONE_A, TONE_A, TONE_B, //
    TONE_B, TONE_B, TONE_B, TONE_B,
];

const fn expand_pattern() -> [u8; 48] {
    let mut out = [0u8; 48];
    let mut i = 0;
    while i < COLOR_PATTERN.len() {
        out[i * 3] = COLOR_PATTERN[i];
        out[i * 3 + 1] = COLOR_PATTERN[i];
        out[i * 3 + 2] = COLOR_PATTERN[i];
        i += 1;
    }
    out
}

/// The signature expanded to RGB24 bytes.
const SIGNATURE_BYTES: [u8; 48] = expand_pattern();

/// Some compositors render the signature tail unreliably; the scan
/// retries with this many leading bytes.
const SIGNATURE_PREFIX_LEN: usize = 14;

/// Black pixels following the signature, used by the fallback scan.
const BLACK_RUN_PIXELS: usize = 374;
const BLACK_RUN_BYTES: usize = BLACK_RUN_PIXELS * 3;

/// Interval between location-check ticks.
pub const LOCATION_CHECK_PERIOD: Duration = Duration::from_millis(500);

// ── Events ───────────────────────────────────────────────────────

/// A signature-match position, in display pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub x: u32,
    pub y: u32,
}

/// Notifications emitted on location-check ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorEvent {
    /// The signature left the region origin (edge-triggered).
    Lost,
    /// The signature was relocated (level-triggered: re-fires every
    /// tick until the capture realigns).
    Found(Location),
}

// ── PatternLocator ───────────────────────────────────────────────

struct LocatorState {
    enabled: bool,
    lost: bool,
    lost_notified: bool,
    found: Option<Location>,
}

/// Watches frames for the embedded signature and reports drift.
pub struct PatternLocator {
    state: Mutex<LocatorState>,
    events: broadcast::Sender<LocatorEvent>,
}

impl PatternLocator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(LocatorState {
                enabled: false,
                lost: false,
                lost_notified: false,
                found: None,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocatorEvent> {
        self.events.subscribe()
    }

    /// Gate the fullscreen scans. The region fast path always runs.
    pub fn set_enabled(&self, enabled: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.enabled = enabled;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().map(|s| s.enabled).unwrap_or(false)
    }

    /// Fast path: the signature must be exactly at offset 0.
    pub fn on_region_frame(&self, buffer: &[u8]) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.lost {
            // Already lost; the tick-driven fullscreen scan owns recovery.
            return;
        }
        if buffer.starts_with(&SIGNATURE_BYTES) {
            return;
        }
        state.lost = true;
    }

    /// Exhaustive scan of a fullscreen frame (`width` pixels per row).
    pub fn on_fullscreen_frame(&self, width: u32, buffer: &[u8]) {
        if width == 0 || !self.is_enabled() {
            return;
        }

        let result = find(buffer, &SIGNATURE_BYTES)
            .or_else(|| find(buffer, &SIGNATURE_BYTES[..SIGNATURE_PREFIX_LEN]));

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match result {
            // Offset 0 means the capture is already aligned: the
            // location is "home", nothing to re-assert.
            Some(0) => state.found = None,
            Some(index) => state.found = Some(location_at(index, width)),
            None => {
                if let Some(index) = find_by_black_run(buffer) {
                    state.found = Some(location_at(index, width));
                }
                // No hit at all: keep whatever we knew before.
            }
        }
    }

    /// One location-check tick. Normally driven by
    /// [`spawn_ticker`](Self::spawn_ticker); exposed for tests.
    pub fn tick(&self) {
        let (emit_lost, found) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let emit_lost = state.lost && !state.lost_notified;
            if emit_lost {
                state.lost_notified = true;
            }
            let found = state.found;
            if found.is_some() {
                state.lost = false;
                state.lost_notified = false;
            }
            (emit_lost, found)
        };

        if emit_lost {
            let _ = self.events.send(LocatorEvent::Lost);
        }
        if let Some(location) = found {
            let _ = self.events.send(LocatorEvent::Found(location));
        }
    }

    /// Run [`tick`](Self::tick) every [`LOCATION_CHECK_PERIOD`].
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let locator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LOCATION_CHECK_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                locator.tick();
            }
        })
    }
}

impl Default for PatternLocator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Byte scanning ────────────────────────────────────────────────

fn location_at(byte_index: usize, width: u32) -> Location {
    let pixel_index = byte_index / 3;
    Location {
        x: pixel_index as u32 % width,
        y: pixel_index as u32 / width,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Fallback: look for the black run that follows the signature, then
/// validate the 48 preceding bytes within tolerance.
fn find_by_black_run(buffer: &[u8]) -> Option<usize> {
    const BLACK: [u8; BLACK_RUN_BYTES] = [0u8; BLACK_RUN_BYTES];

    let mut search_start = 0;
    while let Some(offset) = find(&buffer[search_start..], &BLACK) {
        let run_start = search_start + offset;
        if let Some(signature_start) = run_start.checked_sub(SIGNATURE_BYTES.len())
            && is_signature_match(buffer, signature_start)
        {
            return Some(signature_start);
        }
        search_start = run_start + 1;
    }
    None
}

fn near(actual: u8, expected: u8) -> bool {
    (actual as i16 - expected as i16).abs() <= TOLERANCE
}

fn is_signature_match(buffer: &[u8], offset: usize) -> bool {
    if buffer.len() < offset + COLOR_PATTERN.len() * 3 {
        return false;
    }
    COLOR_PATTERN.iter().enumerate().all(|(unit, &tone)| {
        let i = offset + unit * 3;
        near(buffer[i], tone) && near(buffer[i + 1], tone) && near(buffer[i + 2], tone)
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<LocatorEvent>) -> Vec<LocatorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Region buffer with the signature at offset 0.
    fn aligned_region() -> Vec<u8> {
        let mut buf = vec![0x80u8; 960 * 3];
        buf[..48].copy_from_slice(&SIGNATURE_BYTES);
        buf
    }

    /// Fullscreen buffer (`width`×`height`) with the signature placed
    /// at `pixel`, each tone offset by `jitter`.
    fn fullscreen_with_signature(width: u32, height: u32, pixel: usize, jitter: i16) -> Vec<u8> {
        let mut buf = vec![0x80u8; (width * height) as usize * 3];
        for (unit, &tone) in COLOR_PATTERN.iter().enumerate() {
            let value = (tone as i16 + jitter) as u8;
            let i = (pixel + unit) * 3;
            buf[i..i + 3].fill(value);
        }
        let run_start = (pixel + 16) * 3;
        buf[run_start..run_start + BLACK_RUN_BYTES].fill(0);
        buf
    }

    #[test]
    fn aligned_region_never_loses() {
        let locator = PatternLocator::new();
        let mut rx = locator.subscribe();

        locator.on_region_frame(&aligned_region());
        locator.tick();

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn lost_fires_once_on_edge() {
        let locator = PatternLocator::new();
        let mut rx = locator.subscribe();

        locator.on_region_frame(&vec![0u8; 960 * 3]);
        assert!(drain(&mut rx).is_empty(), "notification deferred to tick");

        locator.tick();
        assert_eq!(drain(&mut rx), vec![LocatorEvent::Lost]);

        locator.tick();
        assert!(drain(&mut rx).is_empty(), "edge-triggered, no repeat");
    }

    #[test]
    fn fullscreen_hit_reports_pixel_coordinates() {
        let width = 200;
        let pixel = 5 * width as usize + 17; // (17, 5)
        let locator = PatternLocator::new();
        locator.set_enabled(true);
        let mut rx = locator.subscribe();

        locator.on_region_frame(&vec![0u8; 960 * 3]);
        locator.on_fullscreen_frame(width, &fullscreen_with_signature(width, 20, pixel, 0));
        locator.tick();

        assert_eq!(
            drain(&mut rx),
            vec![
                LocatorEvent::Lost,
                LocatorEvent::Found(Location { x: 17, y: 5 })
            ]
        );
    }

    #[test]
    fn found_refires_every_tick() {
        let width = 200;
        let locator = PatternLocator::new();
        locator.set_enabled(true);
        let mut rx = locator.subscribe();

        locator.on_fullscreen_frame(width, &fullscreen_with_signature(width, 20, 7, 0));
        locator.tick();
        locator.tick();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LocatorEvent::Found(_)));
        assert_eq!(events[0], events[1]);
    }

    #[test]
    fn aligned_fullscreen_clears_location() {
        let width = 200;
        let locator = PatternLocator::new();
        locator.set_enabled(true);
        let mut rx = locator.subscribe();

        locator.on_fullscreen_frame(width, &fullscreen_with_signature(width, 20, 7, 0));
        locator.on_fullscreen_frame(width, &fullscreen_with_signature(width, 20, 0, 0));
        locator.tick();

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn black_run_fallback_tolerates_jitter() {
        let width = 500;
        let pixel = 3 * width as usize + 40; // (40, 3)
        let locator = PatternLocator::new();
        locator.set_enabled(true);
        let mut rx = locator.subscribe();

        // Jittered tones defeat both exact scans but sit within the
        // ±5 tolerance of the black-run fallback.
        locator.on_fullscreen_frame(width, &fullscreen_with_signature(width, 8, pixel, 3));
        locator.tick();

        assert_eq!(
            drain(&mut rx),
            vec![LocatorEvent::Found(Location { x: 40, y: 3 })]
        );
    }

    #[test]
    fn no_hit_keeps_previous_location() {
        let width = 200;
        let locator = PatternLocator::new();
        locator.set_enabled(true);
        let mut rx = locator.subscribe();

        locator.on_fullscreen_frame(width, &fullscreen_with_signature(width, 20, 7, 0));
        locator.on_fullscreen_frame(width, &vec![0x80u8; (width * 20) as usize * 3]);
        locator.tick();

        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn disabled_locator_ignores_fullscreen() {
        let width = 200;
        let locator = PatternLocator::new();
        let mut rx = locator.subscribe();

        locator.on_fullscreen_frame(width, &fullscreen_with_signature(width, 20, 7, 0));
        locator.tick();

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn tolerance_boundary() {
        let buf = fullscreen_with_signature(100, 8, 10, 5);
        assert!(is_signature_match(&buf, 30));
        let buf = fullscreen_with_signature(100, 8, 10, 6);
        assert!(!is_signature_match(&buf, 30));
    }

    #[test]
    fn region_shorter_than_signature_counts_as_lost() {
        let locator = PatternLocator::new();
        let mut rx = locator.subscribe();

        locator.on_region_frame(&[0u8; 16]);
        locator.tick();

        assert_eq!(drain(&mut rx), vec![LocatorEvent::Lost]);
    }
}
