//! USB transport for the controller's display.
//!
//! | Module      | Purpose                                         |
//! |-------------|-------------------------------------------------|
//! | `identity`  | Known hardware identities (vendor/product ids)  |
//! | `backend`   | libusb seam: trait + `rusb` implementation      |
//! | `transport` | Chunked bulk wire protocol, breaker, watchdog   |

pub mod backend;
pub mod identity;
pub mod transport;

pub use backend::{RusbBackend, UsbBackend};
pub use identity::DeviceIdentity;
pub use transport::UsbTransport;
