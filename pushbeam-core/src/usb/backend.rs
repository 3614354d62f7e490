//! The libusb seam.
//!
//! [`UsbBackend`] mirrors the handful of libusb calls the transport
//! needs, using libusb-style signed result codes (0 = success). The
//! production implementation is [`RusbBackend`]; tests substitute a
//! recording mock so the wire protocol is verifiable without
//! hardware.

use std::time::Duration;

use rusb::UsbContext;

// ── Result codes ─────────────────────────────────────────────────

/// libusb result codes as used across the seam.
pub const LIBUSB_SUCCESS: i32 = 0;

fn error_code(error: rusb::Error) -> i32 {
    match error {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

// ── UsbBackend ───────────────────────────────────────────────────

/// Minimal libusb surface used by the transport.
pub trait UsbBackend: Send {
    /// Create the USB context. 0 on success.
    fn init(&mut self) -> i32;

    /// Open the device with the given ids. `false` when absent.
    fn open(&mut self, vendor_id: u16, product_id: u16) -> bool;

    /// Claim an interface on the open device. 0 on success.
    fn claim_interface(&mut self, interface: u8) -> i32;

    /// One bulk OUT transfer. Returns `(result code, bytes sent)`.
    fn bulk_transfer(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> (i32, usize);

    /// Release a claimed interface. 0 on success.
    fn release_interface(&mut self, interface: u8) -> i32;

    /// Close the device handle. No-op when nothing is open.
    fn close(&mut self);

    /// Free the USB context. No-op when uninitialized.
    fn exit(&mut self);

    /// Vendor name for a result code, when the library knows one.
    fn error_name(&self, code: i32) -> Option<String>;
}

/// Resolve a result code to a human string: vendor lookup first, then
/// the built-in fallback table.
pub fn describe_error(backend: &dyn UsbBackend, code: i32) -> String {
    if let Some(name) = backend.error_name(code) {
        return name;
    }
    match code {
        0 => "Success".to_string(),
        -1 => "Input/output error".to_string(),
        -2 => "Invalid parameter".to_string(),
        -3 => "Access denied (insufficient permissions)".to_string(),
        -4 => "No such device".to_string(),
        -5 => "Interface not found".to_string(),
        -6 => "Resource busy".to_string(),
        -7 => "Timeout".to_string(),
        _ => format!("Unknown error (code: {code})"),
    }
}

// ── RusbBackend ──────────────────────────────────────────────────

/// Production backend over `rusb`.
#[derive(Default)]
pub struct RusbBackend {
    context: Option<rusb::Context>,
    handle: Option<rusb::DeviceHandle<rusb::Context>>,
}

impl RusbBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UsbBackend for RusbBackend {
    fn init(&mut self) -> i32 {
        match rusb::Context::new() {
            Ok(context) => {
                self.context = Some(context);
                LIBUSB_SUCCESS
            }
            Err(e) => error_code(e),
        }
    }

    fn open(&mut self, vendor_id: u16, product_id: u16) -> bool {
        let Some(context) = &self.context else {
            return false;
        };
        match context.open_device_with_vid_pid(vendor_id, product_id) {
            Some(handle) => {
                self.handle = Some(handle);
                true
            }
            None => false,
        }
    }

    fn claim_interface(&mut self, interface: u8) -> i32 {
        let Some(handle) = &mut self.handle else {
            return error_code(rusb::Error::NoDevice);
        };
        match handle.claim_interface(interface) {
            Ok(()) => LIBUSB_SUCCESS,
            Err(e) => error_code(e),
        }
    }

    fn bulk_transfer(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> (i32, usize) {
        let Some(handle) = &self.handle else {
            return (error_code(rusb::Error::NoDevice), 0);
        };
        match handle.write_bulk(endpoint, data, timeout) {
            Ok(sent) => (LIBUSB_SUCCESS, sent),
            Err(e) => (error_code(e), 0),
        }
    }

    fn release_interface(&mut self, interface: u8) -> i32 {
        let Some(handle) = &mut self.handle else {
            return error_code(rusb::Error::NoDevice);
        };
        match handle.release_interface(interface) {
            Ok(()) => LIBUSB_SUCCESS,
            Err(e) => error_code(e),
        }
    }

    fn close(&mut self) {
        self.handle = None;
    }

    fn exit(&mut self) {
        self.context = None;
    }

    fn error_name(&self, code: i32) -> Option<String> {
        let name = match code {
            -1 => "LIBUSB_ERROR_IO",
            -2 => "LIBUSB_ERROR_INVALID_PARAM",
            -3 => "LIBUSB_ERROR_ACCESS",
            -4 => "LIBUSB_ERROR_NO_DEVICE",
            -5 => "LIBUSB_ERROR_NOT_FOUND",
            -6 => "LIBUSB_ERROR_BUSY",
            -7 => "LIBUSB_ERROR_TIMEOUT",
            -8 => "LIBUSB_ERROR_OVERFLOW",
            -9 => "LIBUSB_ERROR_PIPE",
            -10 => "LIBUSB_ERROR_INTERRUPTED",
            -11 => "LIBUSB_ERROR_NO_MEM",
            -12 => "LIBUSB_ERROR_NOT_SUPPORTED",
            _ => return None,
        };
        Some(name.to_string())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Nameless;

    impl UsbBackend for Nameless {
        fn init(&mut self) -> i32 {
            0
        }
        fn open(&mut self, _: u16, _: u16) -> bool {
            false
        }
        fn claim_interface(&mut self, _: u8) -> i32 {
            0
        }
        fn bulk_transfer(&mut self, _: u8, data: &[u8], _: Duration) -> (i32, usize) {
            (0, data.len())
        }
        fn release_interface(&mut self, _: u8) -> i32 {
            0
        }
        fn close(&mut self) {}
        fn exit(&mut self) {}
        fn error_name(&self, _: i32) -> Option<String> {
            None
        }
    }

    #[test]
    fn fallback_table_covers_common_codes() {
        let backend = Nameless;
        assert_eq!(describe_error(&backend, 0), "Success");
        assert_eq!(describe_error(&backend, -7), "Timeout");
        assert_eq!(
            describe_error(&backend, -4),
            "No such device"
        );
        assert!(describe_error(&backend, -42).contains("-42"));
    }

    #[test]
    fn vendor_name_wins_over_fallback() {
        let backend = RusbBackend::new();
        assert_eq!(
            describe_error(&backend, -7),
            "LIBUSB_ERROR_TIMEOUT"
        );
    }
}
