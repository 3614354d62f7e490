//! Pixel-format conversion for the panel wire format, plus bilinear
//! scaling.
//!
//! Everything here is pure and deterministic: no state, no I/O.
//!
//! ## Panel wire format
//!
//! The panel is 960×160. Each output pixel is RGB565, little-endian,
//! with the **red and blue five-bit fields swapped** relative to naive
//! RGB565 (confirmed by golden vectors against real hardware). Every
//! payload byte is then XORed with the repeating 4-byte pattern
//! `E7 F3 E7 FF` — a wire-format signal-conditioning requirement, not
//! encryption. After each 1920-byte pixel row, 128 bytes of un-XORed
//! zero padding follow, giving a 2048-byte row stride and a
//! 327 680-byte frame payload.

// ── Panel geometry ───────────────────────────────────────────────

/// Panel width in pixels.
pub const PANEL_WIDTH: u32 = 960;
/// Panel height in pixels.
pub const PANEL_HEIGHT: u32 = 160;
/// Height of the captured region crop: the panel rows plus the one
/// signature row along the top, which is cropped off before display.
pub const REGION_HEIGHT: u32 = 161;
/// Padding bytes appended after each output row (not XORed).
pub const ROW_PADDING: usize = 128;
/// Output row stride: two bytes per pixel plus padding.
pub const PANEL_ROW_STRIDE: usize = PANEL_WIDTH as usize * 2 + ROW_PADDING;
/// Total panel payload size per frame.
pub const PANEL_FRAME_BYTES: usize = PANEL_ROW_STRIDE * PANEL_HEIGHT as usize;
/// RGB24 byte size of one panel-resolution frame.
pub const PANEL_RGB_BYTES: usize = (PANEL_WIDTH * PANEL_HEIGHT) as usize * 3;
/// RGB24 byte size of one region crop (panel plus signature row).
pub const REGION_RGB_BYTES: usize = (PANEL_WIDTH * REGION_HEIGHT) as usize * 3;

/// XOR conditioning pattern applied to pixel bytes (not padding).
const XOR_PATTERN: [u8; 4] = [0xE7, 0xF3, 0xE7, 0xFF];

// ── RGB565 conversion ────────────────────────────────────────────

/// Quantize one RGB pixel to the panel's swapped RGB565 layout.
#[inline]
fn pixel_to_wire(r: u8, g: u8, b: u8) -> u16 {
    let rgb565 = (((r as u16 & 0xF8) << 8) // red → bits 11-15
        | ((g as u16 & 0xFC) << 3)         // green → bits 5-10
        | ((b as u16 & 0xF8) >> 3)) as u16; // blue → bits 0-4

    // The panel expects red and blue transposed.
    ((rgb565 & 0x1F) << 11) | (rgb565 & 0x07E0) | ((rgb565 & 0xF800) >> 11)
}

/// Write one pixel's two wire bytes at `dst_index`, XOR applied.
#[inline]
fn put_wire_pixel(dst: &mut [u8], dst_index: usize, wire: u16) {
    let [low, high] = wire.to_le_bytes();
    dst[dst_index] = low ^ XOR_PATTERN[dst_index % 4];
    dst[dst_index + 1] = high ^ XOR_PATTERN[(dst_index + 1) % 4];
}

/// Convert a tightly packed RGB24 panel frame (960×160×3 bytes) into
/// the full wire payload. `dst` must hold [`PANEL_FRAME_BYTES`].
///
/// # Panics
///
/// Panics if either slice is shorter than the panel frame requires.
pub fn rgb24_to_panel(src: &[u8], dst: &mut [u8]) {
    assert!(src.len() >= PANEL_RGB_BYTES);
    assert!(dst.len() >= PANEL_FRAME_BYTES);

    let mut dst_index = 0;
    for y in 0..PANEL_HEIGHT as usize {
        for x in 0..PANEL_WIDTH as usize {
            let i = (y * PANEL_WIDTH as usize + x) * 3;
            let wire = pixel_to_wire(src[i], src[i + 1], src[i + 2]);
            put_wire_pixel(dst, dst_index, wire);
            dst_index += 2;
        }

        // Row padding stays zero and un-XORed.
        dst[dst_index..dst_index + ROW_PADDING].fill(0);
        dst_index += ROW_PADDING;
    }
}

/// Convert a tightly packed BGRA32 panel frame (960×160×4 bytes) into
/// the full wire payload. Alpha is ignored.
///
/// # Panics
///
/// Panics if either slice is shorter than the panel frame requires.
pub fn bgra32_to_panel(src: &[u8], dst: &mut [u8]) {
    assert!(src.len() >= (PANEL_WIDTH * PANEL_HEIGHT) as usize * 4);
    assert!(dst.len() >= PANEL_FRAME_BYTES);

    let mut dst_index = 0;
    for y in 0..PANEL_HEIGHT as usize {
        for x in 0..PANEL_WIDTH as usize {
            let i = (y * PANEL_WIDTH as usize + x) * 4;
            let (b, g, r) = (src[i], src[i + 1], src[i + 2]);
            let wire = pixel_to_wire(r, g, b);
            put_wire_pixel(dst, dst_index, wire);
            dst_index += 2;
        }

        dst[dst_index..dst_index + ROW_PADDING].fill(0);
        dst_index += ROW_PADDING;
    }
}

// ── Bilinear scaling ─────────────────────────────────────────────

/// Bilinear-resize a tightly packed RGB24 image, edge-clamped.
///
/// Used when the native capture size does not already match the fixed
/// panel crop (HiDPI displays capture at 2× and scale down).
///
/// # Panics
///
/// Panics if a dimension is zero or a slice is too short.
pub fn scale_rgb24(
    src: &[u8],
    src_width: u32,
    src_height: u32,
    dst: &mut [u8],
    dst_width: u32,
    dst_height: u32,
) {
    assert!(src_width > 0 && src_height > 0 && dst_width > 0 && dst_height > 0);
    assert!(src.len() >= (src_width * src_height) as usize * 3);
    assert!(dst.len() >= (dst_width * dst_height) as usize * 3);

    let x_ratio = src_width as f32 / dst_width as f32;
    let y_ratio = src_height as f32 / dst_height as f32;

    for dy in 0..dst_height {
        // Pixel-center mapping, clamped to the source edges.
        let sy = ((dy as f32 + 0.5) * y_ratio - 0.5).max(0.0);
        let y0 = sy as u32;
        let y1 = (y0 + 1).min(src_height - 1);
        let fy = sy - y0 as f32;

        for dx in 0..dst_width {
            let sx = ((dx as f32 + 0.5) * x_ratio - 0.5).max(0.0);
            let x0 = sx as u32;
            let x1 = (x0 + 1).min(src_width - 1);
            let fx = sx - x0 as f32;

            let p00 = ((y0 * src_width + x0) * 3) as usize;
            let p01 = ((y0 * src_width + x1) * 3) as usize;
            let p10 = ((y1 * src_width + x0) * 3) as usize;
            let p11 = ((y1 * src_width + x1) * 3) as usize;
            let out = ((dy * dst_width + dx) * 3) as usize;

            for c in 0..3 {
                let top = src[p00 + c] as f32 * (1.0 - fx) + src[p01 + c] as f32 * fx;
                let bottom = src[p10 + c] as f32 * (1.0 - fx) + src[p11 + c] as f32 * fx;
                dst[out + c] = (top * (1.0 - fy) + bottom * fy + 0.5) as u8;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
