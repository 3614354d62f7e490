//! Diagnostic text overlay.
//!
//! A persistent RGBA canvas at panel resolution holds up to four text
//! slots, one per corner, keyed by the subsystem that owns them. Any
//! text update triggers a full redraw of every slot whose visibility
//! passes the current mode; the redraw reports whether anything is
//! visible so callers can skip redundant downstream work. Outgoing
//! frames blend the canvas per pixel using its alpha channel.

use std::collections::HashMap;
use std::sync::Mutex;

use font8x8::legacy::BASIC_LEGACY;
use tokio::sync::watch;

use crate::codec::{PANEL_HEIGHT, PANEL_WIDTH};

// ── Slots ────────────────────────────────────────────────────────

/// Pipeline subsystems that may own a text slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// Top-left corner.
    General,
    /// Top-right corner.
    Capture,
    /// Bottom-left corner.
    CaptureIssues,
    /// Bottom-right corner.
    Transmission,
}

/// Overlay visibility mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayMode {
    /// Show only slots marked always-display.
    #[default]
    Normal,
    /// Show every non-empty slot.
    Verbose,
}

#[derive(Debug, Clone)]
struct Slot {
    text: String,
    always_display: bool,
}

// ── Geometry ─────────────────────────────────────────────────────

/// Glyph scale applied to the built-in 8×8 font.
const GLYPH_SCALE: usize = 2;
const GLYPH_SIZE: usize = 8 * GLYPH_SCALE;
const TEXT_ALPHA: u8 = 170;

const LEFT_X: usize = 170;
const RIGHT_X: usize = PANEL_WIDTH as usize - 5;
const TOP_Y: usize = 44;
const BOTTOM_Y: usize = PANEL_HEIGHT as usize - 52;

// ── OverlayCompositor ────────────────────────────────────────────

struct Inner {
    canvas: Vec<u8>, // RGBA, PANEL_WIDTH × PANEL_HEIGHT
    slots: HashMap<Subsystem, Slot>,
    mode: OverlayMode,
    generation: u64,
}

/// Renders diagnostic text into an alpha bitmap at panel resolution.
pub struct OverlayCompositor {
    inner: Mutex<Inner>,
    changed: watch::Sender<u64>,
}

impl OverlayCompositor {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                canvas: vec![0u8; (PANEL_WIDTH * PANEL_HEIGHT) as usize * 4],
                slots: HashMap::new(),
                mode: OverlayMode::default(),
                generation: 0,
            }),
            changed,
        }
    }

    /// Observe overlay changes; the value is a redraw generation.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Replace one slot's text and redraw.
    ///
    /// Returns whether the overlay has any visible content after the
    /// redraw — `false` lets the transport know a manual re-send is
    /// needed instead of an overlay-driven one.
    pub fn set_text(&self, subsystem: Subsystem, text: &str, always_display: bool) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner.slots.insert(
            subsystem,
            Slot {
                text: text.to_string(),
                always_display,
            },
        );
        let visible = redraw(&mut inner);
        if visible {
            inner.generation += 1;
            let _ = self.changed.send(inner.generation);
        }
        visible
    }

    /// Switch between normal and verbose visibility and redraw.
    pub fn set_mode(&self, mode: OverlayMode) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.mode = mode;
        redraw(&mut inner);
        inner.generation += 1;
        let _ = self.changed.send(inner.generation);
    }

    pub fn mode(&self) -> OverlayMode {
        self.inner.lock().map(|i| i.mode).unwrap_or_default()
    }

    /// Alpha-composite the canvas into a tightly packed RGB24 panel
    /// frame. Fully transparent overlay pixels are skipped.
    pub fn blend_into(&self, frame: &mut [u8]) {
        let Ok(inner) = self.inner.lock() else {
            return;
        };
        let pixels = (PANEL_WIDTH * PANEL_HEIGHT) as usize;
        debug_assert!(frame.len() >= pixels * 3);

        for i in 0..pixels {
            let alpha = inner.canvas[i * 4 + 3] as u16;
            if alpha == 0 {
                continue;
            }
            let inv = 255 - alpha;
            for c in 0..3 {
                let overlay = inner.canvas[i * 4 + c] as u16;
                let base = frame[i * 3 + c] as u16;
                frame[i * 3 + c] = ((overlay * alpha + base * inv) / 255) as u8;
            }
        }
    }
}

impl Default for OverlayCompositor {
    fn default() -> Self {
        Self::new()
    }
}

// ── Rendering ────────────────────────────────────────────────────

fn redraw(inner: &mut Inner) -> bool {
    inner.canvas.fill(0);
    let mut visible = false;

    for (&subsystem, slot) in &inner.slots {
        if slot.text.is_empty() {
            continue;
        }
        if inner.mode == OverlayMode::Normal && !slot.always_display {
            continue;
        }

        let text = slot.text.to_uppercase();
        let width = text.chars().count() * GLYPH_SIZE;
        let (x, y) = match subsystem {
            Subsystem::General => (LEFT_X, TOP_Y),
            Subsystem::Capture => (RIGHT_X.saturating_sub(width), TOP_Y),
            Subsystem::CaptureIssues => (LEFT_X, BOTTOM_Y),
            Subsystem::Transmission => (RIGHT_X.saturating_sub(width), BOTTOM_Y),
        };

        draw_text(&mut inner.canvas, &text, x, y);
        visible = true;
    }

    visible
}

fn draw_text(canvas: &mut [u8], text: &str, origin_x: usize, origin_y: usize) {
    for (index, ch) in text.chars().enumerate() {
        let code = ch as usize;
        if code >= BASIC_LEGACY.len() {
            continue;
        }
        draw_glyph(
            canvas,
            &BASIC_LEGACY[code],
            origin_x + index * GLYPH_SIZE,
            origin_y,
        );
    }
}

fn draw_glyph(canvas: &mut [u8], glyph: &[u8; 8], origin_x: usize, origin_y: usize) {
    for (row, &bits) in glyph.iter().enumerate() {
        for col in 0..8 {
            if bits >> col & 1 == 0 {
                continue;
            }
            for sy in 0..GLYPH_SCALE {
                for sx in 0..GLYPH_SCALE {
                    let x = origin_x + col * GLYPH_SCALE + sx;
                    let y = origin_y + row * GLYPH_SCALE + sy;
                    if x >= PANEL_WIDTH as usize || y >= PANEL_HEIGHT as usize {
                        continue;
                    }
                    let i = (y * PANEL_WIDTH as usize + x) * 4;
                    canvas[i..i + 3].fill(0xFF);
                    canvas[i + 3] = TEXT_ALPHA;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
