//! End-to-end pipeline tests: scripted capture adapter → service →
//! transport → mock USB backend, asserting the full wire contract.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use pushbeam_core::capture::{CaptureEvent, CaptureEventTx, CapturePhase, FrameKind};
use pushbeam_core::codec::{PANEL_FRAME_BYTES, PANEL_WIDTH, REGION_HEIGHT};
use pushbeam_core::usb::transport::{CHUNK_SIZE, FRAME_HEADER};
use pushbeam_core::{
    BeamError, CaptureAdapter, CaptureConfiguration, CaptureService, DisplayInfo, DisplayService,
    OverlayCompositor, UsbBackend, UsbTransport,
};

// ── Scripted capture adapter ─────────────────────────────────────

#[derive(Default)]
struct AdapterState {
    events: Option<CaptureEventTx>,
    capturing: bool,
}

struct PipeAdapter {
    state: Arc<Mutex<AdapterState>>,
}

impl PipeAdapter {
    fn new() -> (Self, Arc<Mutex<AdapterState>>) {
        let state = Arc::new(Mutex::new(AdapterState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

#[async_trait]
impl CaptureAdapter for PipeAdapter {
    async fn check_permission(&mut self) -> Result<bool, BeamError> {
        Ok(true)
    }

    fn is_capturing(&self) -> bool {
        self.state.lock().unwrap().capturing
    }

    fn start(
        &mut self,
        _config: &CaptureConfiguration,
        _display: &DisplayInfo,
        events: CaptureEventTx,
    ) -> Result<(), BeamError> {
        let mut state = self.state.lock().unwrap();
        state.capturing = true;
        state.events = Some(events);
        Ok(())
    }

    fn request_stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.capturing = false;
        if let Some(events) = &state.events {
            for kind in [FrameKind::Region, FrameKind::FullScreen] {
                let _ = events.send(CaptureEvent::Stopped {
                    kind,
                    event: pushbeam_core::CaptureStoppedEvent {
                        error_code: 0,
                        message: "requested".into(),
                        reason: pushbeam_core::StopReason::Voluntary,
                    },
                });
            }
        }
    }

    fn configuration_change_delay(
        &self,
        _current: Option<&CaptureConfiguration>,
        _next: &CaptureConfiguration,
    ) -> Duration {
        Duration::ZERO
    }
}

// ── Mock USB backend ─────────────────────────────────────────────

#[derive(Default)]
struct UsbState {
    transfers: Vec<Vec<u8>>,
}

struct PipeBackend {
    state: Arc<Mutex<UsbState>>,
}

impl PipeBackend {
    fn new() -> (Self, Arc<Mutex<UsbState>>) {
        let state = Arc::new(Mutex::new(UsbState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl UsbBackend for PipeBackend {
    fn init(&mut self) -> i32 {
        0
    }
    fn open(&mut self, _vendor_id: u16, _product_id: u16) -> bool {
        true
    }
    fn claim_interface(&mut self, _interface: u8) -> i32 {
        0
    }
    fn bulk_transfer(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> (i32, usize) {
        self.state.lock().unwrap().transfers.push(data.to_vec());
        (0, data.len())
    }
    fn release_interface(&mut self, _interface: u8) -> i32 {
        0
    }
    fn close(&mut self) {}
    fn exit(&mut self) {}
    fn error_name(&self, _code: i32) -> Option<String> {
        None
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn display_3008() -> DisplayInfo {
    DisplayInfo {
        id: 0,
        width: 3008,
        height: 1692,
        is_primary: true,
        bounds_x: 0,
        bounds_y: 0,
        dpi_x: None,
        dpi_y: None,
    }
}

fn region_frame(fill: u8) -> Bytes {
    Bytes::from(vec![fill; (PANEL_WIDTH * REGION_HEIGHT) as usize * 3])
}

async fn wait_for_transfers(state: &Arc<Mutex<UsbState>>, count: usize) {
    for _ in 0..1000 {
        if state.lock().unwrap().transfers.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!(
        "expected {count} transfers, saw {}",
        state.lock().unwrap().transfers.len()
    );
}

// ── Scenario ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn region_frames_reach_the_panel() {
    init_tracing();
    let overlay = Arc::new(OverlayCompositor::new());

    let (adapter, adapter_state) = PipeAdapter::new();
    let service = CaptureService::new(
        Box::new(adapter),
        DisplayService::with_displays(vec![display_3008()]),
        Arc::clone(&overlay),
    );

    let (backend, usb_state) = PipeBackend::new();
    let transport = UsbTransport::new(Box::new(backend), Arc::clone(&overlay));
    transport.set_frame_source(service.frame_sender());

    // Already inside the display: normalization leaves it untouched.
    let configuration = CaptureConfiguration {
        display_id: Some(0),
        capture_x: 400,
        capture_y: 1000,
        width: 960,
        height: 161,
        frame_rate: 24,
    };
    service.set_configuration(configuration.clone()).await;
    assert_eq!(service.current_configuration(), Some(configuration));

    assert!(transport.connect());
    service.start_capture().await.unwrap();
    assert!(service.is_capturing());

    let frames_per_wire = 1 + PANEL_FRAME_BYTES / CHUNK_SIZE;

    // First region frame: one complete wire frame.
    let events = adapter_state.lock().unwrap().events.clone().unwrap();
    events
        .send(CaptureEvent::Frame {
            kind: FrameKind::Region,
            data: region_frame(0x11),
        })
        .unwrap();
    wait_for_transfers(&usb_state, frames_per_wire).await;

    {
        let transfers = &usb_state.lock().unwrap().transfers;
        assert_eq!(transfers[0], FRAME_HEADER);
        let payload: usize = transfers[1..].iter().map(Vec::len).sum();
        assert_eq!(payload % CHUNK_SIZE, 0);
        assert_eq!(payload, PANEL_FRAME_BYTES);
    }

    // Second frame, sent after the first completed: exactly one more
    // wire frame, header first.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.skipped_frames(), 0);
    events
        .send(CaptureEvent::Frame {
            kind: FrameKind::Region,
            data: region_frame(0x22),
        })
        .unwrap();
    wait_for_transfers(&usb_state, 2 * frames_per_wire).await;

    {
        let transfers = &usb_state.lock().unwrap().transfers;
        assert_eq!(transfers[frames_per_wire], FRAME_HEADER);
    }

    // Stop: both streams confirm, the service returns to Configured.
    service.stop_capture().await;
    assert_eq!(service.phase(), CapturePhase::Configured);
    assert!(!service.is_capturing());

    transport.disconnect(false).unwrap();
    assert!(!transport.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fullscreen_relocation_reaches_subscribers() {
    init_tracing();
    let overlay = Arc::new(OverlayCompositor::new());
    let (adapter, adapter_state) = PipeAdapter::new();
    let service = CaptureService::new(
        Box::new(adapter),
        DisplayService::with_displays(vec![display_3008()]),
        Arc::clone(&overlay),
    );

    let locator = service.locator();
    locator.set_enabled(true);
    let mut locations = locator.subscribe();

    service
        .set_configuration(CaptureConfiguration {
            display_id: Some(0),
            capture_x: 0,
            capture_y: 0,
            width: 960,
            height: 161,
            frame_rate: 24,
        })
        .await;
    service.start_capture().await.unwrap();

    // A region frame without the signature, then a fullscreen frame
    // carrying it at pixel (500, 500).
    let events = adapter_state.lock().unwrap().events.clone().unwrap();
    events
        .send(CaptureEvent::Frame {
            kind: FrameKind::Region,
            data: region_frame(0x00),
        })
        .unwrap();

    let width = 3008usize;
    let pixel = 500 * width + 500;
    let mut fullscreen = vec![0x80u8; width * 520 * 3];
    let tones: [u8; 16] = [
        0x1C, 0x2C, 0x1C, 0x1C, 0x2C, 0x2C, 0x2C, 0x1C, 0x1C, 0x1C, 0x1C, 0x2C, 0x2C, 0x2C, 0x2C,
        0x2C,
    ];
    for (unit, tone) in tones.iter().enumerate() {
        let at = (pixel + unit) * 3;
        fullscreen[at..at + 3].fill(*tone);
    }
    events
        .send(CaptureEvent::Frame {
            kind: FrameKind::FullScreen,
            data: Bytes::from(fullscreen),
        })
        .unwrap();

    // The 500 ms ticker fires LocationLost (edge) then
    // LocationFound(500, 500) (level).
    let mut found = None;
    let mut lost = false;
    for _ in 0..600 {
        match locations.try_recv() {
            Ok(pushbeam_core::LocatorEvent::Lost) => lost = true,
            Ok(pushbeam_core::LocatorEvent::Found(at)) => {
                found = Some(at);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    assert!(lost);
    let found = found.expect("location should be recovered");
    assert_eq!((found.x, found.y), (500, 500));
}
