//! Capture configuration and its normalization.
//!
//! [`CaptureConfiguration`] is an immutable value: it is replaced
//! wholesale, never mutated in place, and the service only ever
//! applies it in normalized form. Normalization resolves the target
//! display (configured id, else primary, else first attached), sizes
//! the rectangle to the panel crop scaled by the display's scaling
//! factor, and clamps the origin so the rectangle stays on screen.

use serde::{Deserialize, Serialize};

use crate::codec::{PANEL_WIDTH, REGION_HEIGHT};
use crate::display::DisplayInfo;

// ── CaptureConfiguration ─────────────────────────────────────────

/// Where and how fast to capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfiguration {
    /// Target display. `None` means "no display selected".
    pub display_id: Option<u32>,
    /// Left edge of the capture rectangle, in display pixels.
    pub capture_x: i32,
    /// Top edge of the capture rectangle, in display pixels.
    pub capture_y: i32,
    /// Rectangle width. Overwritten by normalization.
    pub width: u32,
    /// Rectangle height. Overwritten by normalization.
    pub height: u32,
    /// Region frames per second, clamped to 1..=100.
    pub frame_rate: u32,
}

impl CaptureConfiguration {
    /// Resolve against the attached displays and clamp every field.
    ///
    /// Display fallback chain: configured id → primary → first
    /// attached. When no display exists at all, the result carries
    /// `display_id: None` and fails [`is_valid`](Self::is_valid).
    pub fn normalized(&self, displays: &[DisplayInfo]) -> CaptureConfiguration {
        let display = displays
            .iter()
            .find(|d| Some(d.id) == self.display_id)
            .or_else(|| displays.iter().find(|d| d.is_primary))
            .or_else(|| displays.first());

        match display {
            Some(display) => self.normalize_against(display),
            None => Self {
                display_id: None,
                ..self.clone()
            },
        }
    }

    fn normalize_against(&self, display: &DisplayInfo) -> CaptureConfiguration {
        let scale = display.scaling_factor();
        let effective_width = (PANEL_WIDTH as f32 * scale + 0.5) as u32;
        let effective_height = (REGION_HEIGHT as f32 * scale + 0.5) as u32;
        let max_x = display.width.saturating_sub(effective_width) as i32;
        let max_y = display.height.saturating_sub(effective_height) as i32;

        CaptureConfiguration {
            display_id: Some(display.id),
            capture_x: self.capture_x.clamp(0, max_x),
            capture_y: self.capture_y.clamp(0, max_y),
            width: effective_width,
            height: effective_height,
            frame_rate: self.frame_rate.clamp(1, 100),
        }
    }

    /// Whether this configuration can start a capture right now.
    pub fn is_valid(&self, displays: &[DisplayInfo]) -> bool {
        let Some(id) = self.display_id else {
            return false;
        };
        displays.iter().any(|d| d.id == id)
            && self.capture_x >= 0
            && self.capture_y >= 0
            && self.width > 0
            && self.height > 0
            && self.frame_rate > 0
    }
}

impl std::fmt::Display for CaptureConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.display_id {
            Some(id) => write!(
                f,
                "display {} @ ({}, {}) {}x{} {} fps",
                id, self.capture_x, self.capture_y, self.width, self.height, self.frame_rate
            ),
            None => write!(f, "no display selected"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn display(id: u32, width: u32, height: u32, primary: bool) -> DisplayInfo {
        DisplayInfo {
            id,
            width,
            height,
            is_primary: primary,
            bounds_x: 0,
            bounds_y: 0,
            dpi_x: None,
            dpi_y: None,
        }
    }

    fn config(display_id: Option<u32>, x: i32, y: i32, rate: u32) -> CaptureConfiguration {
        CaptureConfiguration {
            display_id,
            capture_x: x,
            capture_y: y,
            width: PANEL_WIDTH,
            height: REGION_HEIGHT,
            frame_rate: rate,
        }
    }

    #[test]
    fn in_bounds_configuration_unchanged() {
        let displays = [display(0, 3008, 1692, true)];
        let normalized = config(Some(0), 400, 1000, 24).normalized(&displays);

        assert_eq!(normalized, config(Some(0), 400, 1000, 24));
        assert!(normalized.is_valid(&displays));
    }

    #[test]
    fn rectangle_clamped_inside_display() {
        let displays = [display(0, 1920, 1080, true)];
        let normalized = config(Some(0), 5000, -40, 30).normalized(&displays);

        assert_eq!(normalized.capture_x, 1920 - PANEL_WIDTH as i32);
        assert_eq!(normalized.capture_y, 0);
        assert!(normalized.capture_x + normalized.width as i32 <= 1920);
        assert!(normalized.capture_y + normalized.height as i32 <= 1080);
    }

    #[test]
    fn frame_rate_clamped() {
        let displays = [display(0, 1920, 1080, true)];
        assert_eq!(config(Some(0), 0, 0, 0).normalized(&displays).frame_rate, 1);
        assert_eq!(
            config(Some(0), 0, 0, 500).normalized(&displays).frame_rate,
            100
        );
    }

    #[test]
    fn unknown_display_falls_back_to_primary() {
        let displays = [display(1, 1920, 1080, false), display(2, 2560, 1440, true)];
        let normalized = config(Some(9), 0, 0, 30).normalized(&displays);
        assert_eq!(normalized.display_id, Some(2));
    }

    #[test]
    fn no_primary_falls_back_to_first() {
        let displays = [display(4, 1920, 1080, false), display(7, 2560, 1440, false)];
        let normalized = config(None, 0, 0, 30).normalized(&displays);
        assert_eq!(normalized.display_id, Some(4));
    }

    #[test]
    fn empty_display_set_yields_invalid() {
        let normalized = config(Some(0), 0, 0, 30).normalized(&[]);
        assert_eq!(normalized.display_id, None);
        assert!(!normalized.is_valid(&[]));
    }

    #[test]
    fn scaling_factor_sizes_rectangle() {
        let mut hidpi = display(0, 4000, 2400, true);
        hidpi.dpi_x = Some(192.0);
        let normalized = config(Some(0), 0, 0, 30).normalized(&[hidpi]);
        assert_eq!(normalized.width, PANEL_WIDTH * 2);
        assert_eq!(normalized.height, REGION_HEIGHT * 2);
    }

    #[test]
    fn display_too_small_clamps_origin_to_zero() {
        let displays = [display(0, 800, 100, true)];
        let normalized = config(Some(0), 300, 300, 30).normalized(&displays);
        assert_eq!(normalized.capture_x, 0);
        assert_eq!(normalized.capture_y, 0);
    }

    #[test]
    fn validity_requires_attached_display() {
        let displays = [display(0, 3008, 1692, true)];
        let cfg = config(Some(0), 0, 0, 30).normalized(&displays);
        assert!(cfg.is_valid(&displays));
        assert!(!cfg.is_valid(&[display(3, 3008, 1692, true)]));
        assert!(!config(None, 0, 0, 30).is_valid(&displays));
    }

    #[test]
    fn settings_round_trip() {
        let cfg = config(Some(0), 400, 1000, 24);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CaptureConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
