//! Windows capture adapter: DXGI Desktop Duplication.
//!
//! One worker thread drives the `IDXGIOutputDuplication` pipeline:
//!
//! 1. Create a D3D11 device.
//! 2. Duplicate the target monitor's output.
//! 3. Per frame: `AcquireNextFrame`, copy to a CPU-readable staging
//!    texture, map, convert.
//!
//! The full desktop frame arrives in BGRA; the worker crops the
//! configured region (converting to tightly packed RGB24), scales to
//! the panel crop when HiDPI sizing differs, and emits a FullScreen
//! frame at most once per second for the signature relocator. Region
//! offset and frame rate are live-patched without a restart; a display
//! change forces one.
//!
//! # Safety
//!
//! All unsafe FFI is confined to [`DxgiDuplicator`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use crate::capture::pool::FramePool;
use crate::capture::{CaptureEvent, CaptureEventTx, CaptureStoppedEvent, FrameKind, StopReason};
use crate::codec::{self, PANEL_WIDTH, REGION_HEIGHT, REGION_RGB_BYTES};
use crate::config::CaptureConfiguration;
use crate::display::DisplayInfo;
use crate::error::BeamError;

/// `AcquireNextFrame` wait per loop iteration.
const ACQUIRE_TIMEOUT_MS: u32 = 100;
/// Minimum spacing between FullScreen frames.
const FULLSCREEN_INTERVAL: Duration = Duration::from_secs(1);
/// Settle delay between stop and restart on a display change.
const RESTART_SETTLE: Duration = Duration::from_millis(200);

// ── Shared worker state ──────────────────────────────────────────

#[derive(Clone, Copy)]
struct RegionRect {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

struct WinShared {
    events: CaptureEventTx,
    running: AtomicBool,
    voluntary: AtomicBool,
    region: Mutex<RegionRect>,
    frame_rate: AtomicU32,
}

impl WinShared {
    fn emit_stopped(&self, error_code: i32, message: &str) {
        let reason = if self.voluntary.load(Ordering::Acquire) {
            StopReason::Voluntary
        } else {
            StopReason::Unknown
        };
        for kind in [FrameKind::Region, FrameKind::FullScreen] {
            let _ = self.events.send(CaptureEvent::Stopped {
                kind,
                event: CaptureStoppedEvent {
                    error_code,
                    message: message.to_string(),
                    reason,
                },
            });
        }
    }
}

// ── WindowsCaptureAdapter ────────────────────────────────────────

/// DXGI Desktop Duplication capture adapter.
pub struct WindowsCaptureAdapter {
    shared: Option<Arc<WinShared>>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl WindowsCaptureAdapter {
    pub fn new() -> Self {
        Self {
            shared: None,
            worker: None,
        }
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Default for WindowsCaptureAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureAdapter for WindowsCaptureAdapter {
    async fn check_permission(&mut self) -> Result<bool, BeamError> {
        // Desktop duplication needs no special permission.
        Ok(true)
    }

    fn is_capturing(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::Acquire))
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
        self.join_worker();

        let shared = Arc::new(WinShared {
            events,
            running: AtomicBool::new(true),
            voluntary: AtomicBool::new(false),
            region: Mutex::new(RegionRect {
                x: config.capture_x,
                y: config.capture_y,
                width: config.width,
                height: config.height,
            }),
            frame_rate: AtomicU32::new(config.frame_rate),
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let display = display.clone();
        let worker = std::thread::Builder::new()
            .name("dxgi-capture".into())
            .spawn(move || capture_loop(display, worker_shared, ready_tx))
            .map_err(|_| BeamError::NativeCapture { code: -1 })?;

        // The duplication pipeline initializes on the worker thread;
        // surface its result synchronously.
        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.shared = Some(shared);
                self.worker = Some(worker);
                info!("desktop duplication started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(BeamError::ChannelClosed)
            }
        }
    }

    fn request_stop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.voluntary.store(true, Ordering::Release);
            shared.running.store(false, Ordering::Release);
        }
    }

    fn configuration_change_delay(
        &self,
        current: Option<&CaptureConfiguration>,
        next: &CaptureConfiguration,
    ) -> Duration {
        match current {
            Some(current) if current.display_id != next.display_id => Duration::from_millis(500),
            _ => Duration::ZERO,
        }
    }

    async fn apply_configuration(
        &mut self,
        previous: &CaptureConfiguration,
        next: &CaptureConfiguration,
        display: &DisplayInfo,
        events: CaptureEventTx,
    ) -> Result<(), BeamError> {
        if previous.display_id != next.display_id {
            self.request_stop();
            tokio::time::sleep(RESTART_SETTLE).await;
            if self.is_capturing() {
                return Ok(());
            }
            return self.start(next, display, events);
        }

        // Same display: live-patch without a restart.
        if let Some(shared) = &self.shared {
            if let Ok(mut rect) = shared.region.lock() {
                *rect = RegionRect {
                    x: next.capture_x,
                    y: next.capture_y,
                    width: next.width,
                    height: next.height,
                };
            }
            shared.frame_rate.store(next.frame_rate, Ordering::Release);
        }
        Ok(())
    }
}

impl Drop for WindowsCaptureAdapter {
    fn drop(&mut self) {
        self.request_stop();
        self.join_worker();
    }
}

// ── Capture loop ─────────────────────────────────────────────────

fn capture_loop(
    display: DisplayInfo,
    shared: Arc<WinShared>,
    ready_tx: std::sync::mpsc::Sender<Result<(), BeamError>>,
) {
    let mut duplicator = match DxgiDuplicator::new(display.id) {
        Ok(d) => {
            let _ = ready_tx.send(Ok(()));
            d
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let fullscreen_pool = FramePool::new((display.width * display.height) as usize * 3);
    let region_pool = FramePool::new((display.width * display.height) as usize * 3);
    let mut fullscreen_buffer = fullscreen_pool.rent();
    let mut region_buffer = region_pool.rent();
    let mut scaled = vec![0u8; REGION_RGB_BYTES];
    let mut desktop: Vec<u8> = Vec::new();
    let mut last_fullscreen: Option<Instant> = None;

    while shared.running.load(Ordering::Acquire) {
        let tick = Instant::now();

        match duplicator.capture_into(&mut desktop, ACQUIRE_TIMEOUT_MS) {
            Ok(stride) => {
                let (width, height) = (duplicator.width(), duplicator.height());

                if last_fullscreen.is_none_or(|t| t.elapsed() >= FULLSCREEN_INTERVAL) {
                    let len = (width * height) as usize * 3;
                    bgra_rows_to_rgb24(
                        &desktop,
                        stride as usize,
                        0,
                        0,
                        width,
                        height,
                        fullscreen_buffer.as_mut_slice(),
                    );
                    fullscreen_buffer.set_filled(len);
                    let _ = shared.events.send(CaptureEvent::Frame {
                        kind: FrameKind::FullScreen,
                        data: Bytes::copy_from_slice(fullscreen_buffer.filled()),
                    });
                    last_fullscreen = Some(Instant::now());
                }

                let rect = shared
                    .region
                    .lock()
                    .map(|r| *r)
                    .unwrap_or(RegionRect {
                        x: 0,
                        y: 0,
                        width: PANEL_WIDTH,
                        height: REGION_HEIGHT,
                    });

                if rect.x >= 0
                    && rect.y >= 0
                    && rect.x as u32 + rect.width <= width
                    && rect.y as u32 + rect.height <= height
                {
                    let len = (rect.width * rect.height) as usize * 3;
                    bgra_rows_to_rgb24(
                        &desktop,
                        stride as usize,
                        rect.x as u32,
                        rect.y as u32,
                        rect.width,
                        rect.height,
                        region_buffer.as_mut_slice(),
                    );
                    region_buffer.set_filled(len);

                    let payload = if (rect.width, rect.height) != (PANEL_WIDTH, REGION_HEIGHT) {
                        codec::scale_rgb24(
                            region_buffer.filled(),
                            rect.width,
                            rect.height,
                            &mut scaled,
                            PANEL_WIDTH,
                            REGION_HEIGHT,
                        );
                        Bytes::copy_from_slice(&scaled)
                    } else {
                        Bytes::copy_from_slice(region_buffer.filled())
                    };
                    let _ = shared.events.send(CaptureEvent::Frame {
                        kind: FrameKind::Region,
                        data: payload,
                    });
                }
            }
            Err(DxgiError::Timeout) => {
                // No new desktop frame within the deadline.
            }
            Err(DxgiError::Native(code)) => {
                warn!(code, "desktop duplication failed");
                shared.running.store(false, Ordering::Release);
                shared.emit_stopped(code, "desktop duplication failed");
                return;
            }
        }

        // Frame pacing.
        let rate = shared.frame_rate.load(Ordering::Acquire).max(1);
        let interval = Duration::from_secs_f64(1.0 / rate as f64);
        let elapsed = tick.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }

    shared.emit_stopped(0, "capture stopped");
}

/// Convert a BGRA sub-rectangle (strided rows) into tightly packed
/// RGB24.
fn bgra_rows_to_rgb24(
    src: &[u8],
    stride: usize,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    dst: &mut [u8],
) {
    for row in 0..height as usize {
        let src_row = (y as usize + row) * stride + x as usize * 4;
        let dst_row = row * width as usize * 3;
        for col in 0..width as usize {
            let s = src_row + col * 4;
            let d = dst_row + col * 3;
            dst[d] = src[s + 2];
            dst[d + 1] = src[s + 1];
            dst[d + 2] = src[s];
        }
    }
}

// ── DxgiDuplicator ───────────────────────────────────────────────

enum DxgiError {
    Timeout,
    Native(i32),
}

/// Wraps the `IDXGIOutputDuplication` pipeline for one monitor.
struct DxgiDuplicator {
    width: u32,
    height: u32,
    context: windows::Win32::Graphics::Direct3D11::ID3D11DeviceContext,
    duplication: windows::Win32::Graphics::Dxgi::IDXGIOutputDuplication,
    staging_texture: windows::Win32::Graphics::Direct3D11::ID3D11Texture2D,
    // Kept alive for the duplication's lifetime.
    _device: windows::Win32::Graphics::Direct3D11::ID3D11Device,
}

impl DxgiDuplicator {
    fn new(monitor_index: u32) -> Result<Self, BeamError> {
        unsafe { Self::init(monitor_index) }
    }

    unsafe fn init(monitor_index: u32) -> Result<Self, BeamError> {
        use windows::Win32::Graphics::{
            Direct3D::D3D_DRIVER_TYPE_HARDWARE,
            Direct3D11::*,
            Dxgi::{Common::*, *},
        };
        use windows::core::Interface;

        let native = |e: windows::core::Error| BeamError::NativeCapture { code: e.code().0 };

        // 1. D3D11 device + immediate context.
        let mut device = None;
        let mut context = None;
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(native)?;
        }
        let device = device.ok_or(BeamError::NativeCapture { code: -1 })?;
        let context = context.ok_or(BeamError::NativeCapture { code: -1 })?;

        // 2. Device → adapter → output for the target monitor.
        let dxgi_device: IDXGIDevice = device.cast().map_err(native)?;
        let adapter = unsafe { dxgi_device.GetAdapter() }.map_err(native)?;
        let output: IDXGIOutput = unsafe { adapter.EnumOutputs(monitor_index) }.map_err(native)?;

        // 3. Duplicate the output.
        let output1: IDXGIOutput1 = output.cast().map_err(native)?;
        let duplication = unsafe { output1.DuplicateOutput(&device) }.map_err(native)?;

        let desc = unsafe { duplication.GetDesc() };
        let width = desc.ModeDesc.Width;
        let height = desc.ModeDesc.Height;

        // 4. CPU-readable staging texture.
        let staging_desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut staging_texture = None;
        unsafe {
            device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging_texture))
                .map_err(native)?;
        }
        let staging_texture = staging_texture.ok_or(BeamError::NativeCapture { code: -1 })?;

        Ok(Self {
            width,
            height,
            context,
            duplication,
            staging_texture,
            _device: device,
        })
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    /// Copy the next desktop frame into `out`, returning its stride.
    fn capture_into(&mut self, out: &mut Vec<u8>, timeout_ms: u32) -> Result<u32, DxgiError> {
        unsafe { self.capture_inner(out, timeout_ms) }
    }

    unsafe fn capture_inner(&mut self, out: &mut Vec<u8>, timeout_ms: u32) -> Result<u32, DxgiError> {
        use windows::Win32::Graphics::Direct3D11::*;
        use windows::Win32::Graphics::Dxgi::*;
        use windows::core::Interface;

        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource = None;

        match unsafe {
            self.duplication
                .AcquireNextFrame(timeout_ms, &mut frame_info, &mut resource)
        } {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => return Err(DxgiError::Timeout),
            Err(e) => return Err(DxgiError::Native(e.code().0)),
        }

        let Some(resource) = resource else {
            let _ = unsafe { self.duplication.ReleaseFrame() };
            return Err(DxgiError::Native(-1));
        };
        let texture: ID3D11Texture2D = match resource.cast() {
            Ok(t) => t,
            Err(e) => {
                let _ = unsafe { self.duplication.ReleaseFrame() };
                return Err(DxgiError::Native(e.code().0));
            }
        };

        unsafe { self.context.CopyResource(&self.staging_texture, &texture) };
        let _ = unsafe { self.duplication.ReleaseFrame() };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&self.staging_texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| DxgiError::Native(e.code().0))?;
        }

        let stride = mapped.RowPitch;
        let total = stride as usize * self.height as usize;
        out.resize(total, 0);
        unsafe {
            out.copy_from_slice(std::slice::from_raw_parts(mapped.pData as *const u8, total));
            self.context.Unmap(&self.staging_texture, 0);
        }

        Ok(stride)
    }
}
