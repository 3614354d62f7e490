//! Physical display enumeration.
//!
//! [`DisplayService`] is a leaf component: it lists the displays that
//! exist right now (id, geometry, DPI) and answers lookups. The
//! platform enumerators are compile-time gated; callers that already
//! know their display set (tests, remoting) inject it via
//! [`DisplayService::with_displays`].

use serde::{Deserialize, Serialize};

// ── DisplayInfo ──────────────────────────────────────────────────

/// Immutable description of one physical display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    /// Platform display id (CGDirectDisplayID / monitor index).
    pub id: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Whether this is the primary display.
    pub is_primary: bool,
    /// Left edge in the virtual desktop.
    pub bounds_x: i32,
    /// Top edge in the virtual desktop.
    pub bounds_y: i32,
    /// Horizontal DPI, when the platform reports it.
    pub dpi_x: Option<f32>,
    /// Vertical DPI, when the platform reports it.
    pub dpi_y: Option<f32>,
}

impl DisplayInfo {
    /// Scaling factor used to size the capture rectangle, derived from
    /// the horizontal DPI against the 96-dpi baseline. 1.0 when the
    /// platform does not report DPI.
    pub fn scaling_factor(&self) -> f32 {
        self.dpi_x.map(|dpi| dpi / 96.0).unwrap_or(1.0)
    }
}

impl std::fmt::Display for DisplayInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}x{}, {}",
            self.id,
            self.width,
            self.height,
            if self.is_primary { "Primary" } else { "Secondary" }
        )
    }
}

// ── DisplayService ───────────────────────────────────────────────

/// Enumerates and looks up physical displays.
pub struct DisplayService {
    displays: Vec<DisplayInfo>,
}

impl DisplayService {
    /// Enumerate the displays attached right now.
    pub fn new() -> Self {
        Self::with_displays(platform::list_displays())
    }

    /// Build a service over a known display set (tests, injection).
    pub fn with_displays(mut displays: Vec<DisplayInfo>) -> Self {
        displays.sort_by_key(|d| d.id);
        Self { displays }
    }

    /// All displays, ordered by id.
    pub fn displays(&self) -> &[DisplayInfo] {
        &self.displays
    }

    /// Look up a display by id. `None` id never matches.
    pub fn display(&self, display_id: Option<u32>) -> Option<&DisplayInfo> {
        let id = display_id?;
        self.displays.iter().find(|d| d.id == id)
    }

    /// The display a fresh session should default to: the preferred id
    /// when still attached, otherwise the first display.
    pub fn default_display(&self, preferred: Option<u32>) -> Option<&DisplayInfo> {
        self.display(preferred).or_else(|| self.displays.first())
    }

    /// Re-enumerate after a display-change notification.
    pub fn refresh(&mut self) {
        let mut displays = platform::list_displays();
        displays.sort_by_key(|d| d.id);
        self.displays = displays;
    }
}

impl Default for DisplayService {
    fn default() -> Self {
        Self::new()
    }
}

// ── macOS enumeration (CoreGraphics) ─────────────────────────────

#[cfg(target_os = "macos")]
mod platform {
    use super::DisplayInfo;

    #[link(name = "CoreGraphics", kind = "framework")]
    unsafe extern "C" {
        fn CGGetActiveDisplayList(
            max_displays: u32,
            active_displays: *mut u32,
            display_count: *mut u32,
        ) -> i32;
        fn CGDisplayPixelsWide(display: u32) -> usize;
        fn CGDisplayPixelsHigh(display: u32) -> usize;
        fn CGDisplayIsMain(display: u32) -> i32;
        fn CGDisplayBounds(display: u32) -> CGRect;
        fn CGDisplayScreenSize(display: u32) -> CGSize;
    }

    #[repr(C)]
    struct CGPoint {
        x: f64,
        y: f64,
    }

    #[repr(C)]
    struct CGSize {
        width: f64,
        height: f64,
    }

    #[repr(C)]
    struct CGRect {
        origin: CGPoint,
        size: CGSize,
    }

    const MAX_DISPLAYS: usize = 16;

    pub(super) fn list_displays() -> Vec<DisplayInfo> {
        let mut ids = [0u32; MAX_DISPLAYS];
        let mut count = 0u32;
        let result =
            unsafe { CGGetActiveDisplayList(MAX_DISPLAYS as u32, ids.as_mut_ptr(), &mut count) };
        if result != 0 {
            return Vec::new();
        }

        ids[..count as usize]
            .iter()
            .map(|&id| {
                let width = unsafe { CGDisplayPixelsWide(id) } as u32;
                let height = unsafe { CGDisplayPixelsHigh(id) } as u32;
                let bounds = unsafe { CGDisplayBounds(id) };
                let size_mm = unsafe { CGDisplayScreenSize(id) };
                // Physical size of 0 means "unknown" (projectors, virtual displays).
                let dpi_x = (size_mm.width > 0.0)
                    .then(|| width as f32 / (size_mm.width as f32 / 25.4));
                let dpi_y = (size_mm.height > 0.0)
                    .then(|| height as f32 / (size_mm.height as f32 / 25.4));

                DisplayInfo {
                    id,
                    width,
                    height,
                    is_primary: unsafe { CGDisplayIsMain(id) } != 0,
                    bounds_x: bounds.origin.x as i32,
                    bounds_y: bounds.origin.y as i32,
                    dpi_x,
                    dpi_y,
                }
            })
            .collect()
    }
}

// ── Windows enumeration (GDI) ────────────────────────────────────

#[cfg(target_os = "windows")]
mod platform {
    use super::DisplayInfo;
    use windows::Win32::Foundation::{BOOL, LPARAM, RECT, TRUE};
    use windows::Win32::Graphics::Gdi::{
        EnumDisplayMonitors, GetMonitorInfoW, HDC, HMONITOR, MONITORINFO, MONITORINFOF_PRIMARY,
    };

    unsafe extern "system" fn on_monitor(
        monitor: HMONITOR,
        _hdc: HDC,
        _clip: *mut RECT,
        state: LPARAM,
    ) -> BOOL {
        let displays = unsafe { &mut *(state.0 as *mut Vec<DisplayInfo>) };

        let mut info = MONITORINFO {
            cbSize: std::mem::size_of::<MONITORINFO>() as u32,
            ..Default::default()
        };
        if unsafe { GetMonitorInfoW(monitor, &mut info) }.as_bool() {
            let rect = info.rcMonitor;
            displays.push(DisplayInfo {
                id: displays.len() as u32,
                width: (rect.right - rect.left) as u32,
                height: (rect.bottom - rect.top) as u32,
                is_primary: info.dwFlags & MONITORINFOF_PRIMARY != 0,
                bounds_x: rect.left,
                bounds_y: rect.top,
                dpi_x: None,
                dpi_y: None,
            });
        }

        TRUE
    }

    pub(super) fn list_displays() -> Vec<DisplayInfo> {
        let mut displays: Vec<DisplayInfo> = Vec::new();
        unsafe {
            let _ = EnumDisplayMonitors(
                None,
                None,
                Some(on_monitor),
                LPARAM(&mut displays as *mut _ as isize),
            );
        }
        displays
    }
}

// ── Other platforms ──────────────────────────────────────────────

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
mod platform {
    use super::DisplayInfo;

    pub(super) fn list_displays() -> Vec<DisplayInfo> {
        Vec::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn display(id: u32, primary: bool) -> DisplayInfo {
        DisplayInfo {
            id,
            width: 1920,
            height: 1080,
            is_primary: primary,
            bounds_x: 0,
            bounds_y: 0,
            dpi_x: None,
            dpi_y: None,
        }
    }

    #[test]
    fn displays_sorted_by_id() {
        let service = DisplayService::with_displays(vec![display(3, false), display(1, true)]);
        let ids: Vec<u32> = service.displays().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn lookup_by_id() {
        let service = DisplayService::with_displays(vec![display(1, true), display(2, false)]);
        assert_eq!(service.display(Some(2)).unwrap().id, 2);
        assert!(service.display(Some(9)).is_none());
        assert!(service.display(None).is_none());
    }

    #[test]
    fn default_display_prefers_known_id() {
        let service = DisplayService::with_displays(vec![display(1, true), display(2, false)]);
        assert_eq!(service.default_display(Some(2)).unwrap().id, 2);
        assert_eq!(service.default_display(Some(9)).unwrap().id, 1);
        assert_eq!(service.default_display(None).unwrap().id, 1);
    }

    #[test]
    fn scaling_factor_from_dpi() {
        let mut d = display(1, true);
        assert_eq!(d.scaling_factor(), 1.0);
        d.dpi_x = Some(192.0);
        assert_eq!(d.scaling_factor(), 2.0);
    }

    #[test]
    fn display_format() {
        assert_eq!(display(1, true).to_string(), "1: 1920x1080, Primary");
        assert_eq!(display(2, false).to_string(), "2: 1920x1080, Secondary");
    }
}
