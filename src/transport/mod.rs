//! Transport layer for the NSO GameCube controller.
//!
//! Two very different delivery models are folded into one interface:
//!
//! - [`usb`] - synchronous polling against the HID endpoint (~250 Hz),
//!   preceded by the vendor init handshake over the bulk OUT endpoint.
//! - [`ble`] - asynchronous GATT notifications (~33 Hz at the stack default
//!   connection interval, faster where the interval can be shortened).
//!
//! A transport runs on its own execution context and emits
//! [`TransportEvent`]s into a channel: a `Connected` marker once steady-state
//! delivery begins, one `Frame` per raw report, and a `Disconnected` marker on
//! loss. The pipeline layer consumes the channel and never touches
//! device-specific APIs.
//!
//! ```text
//!  UsbTransport ──┐
//!                 ├──► mpsc<TransportEvent> ──► pipeline
//!  BleTransport ──┘
//! ```

pub mod ble;
pub mod usb;

use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::controller::decoder::ReportVariant;

/// Nintendo's USB vendor id.
pub const VENDOR_ID: u16 = 0x057e;

/// Product id of the NSO GameCube controller.
pub const PRODUCT_ID: u16 = 0x2073;

/// USB interface carrying the vendor protocol.
pub const USB_INTERFACE: u8 = 1;

/// Init report that wakes the controller into its full report mode.
pub const DEFAULT_REPORT_DATA: [u8; 16] = [
    0x03, 0x91, 0x00, 0x0d, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Player-LED report; also stops the pairing blink.
pub const SET_LED_DATA: [u8; 16] = [
    0x09, 0x91, 0x00, 0x07, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Usb,
    Ble,
}

impl TransportKind {
    pub fn variant(self) -> ReportVariant {
        match self {
            TransportKind::Usb => ReportVariant::Usb,
            TransportKind::Ble => ReportVariant::Ble,
        }
    }

    /// Connection type byte used in DSU pad metadata.
    pub fn dsu_connection_type(self) -> u8 {
        match self {
            TransportKind::Usb => 0x01,
            TransportKind::Ble => 0x02,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "USB"),
            TransportKind::Ble => write!(f, "BLE"),
        }
    }
}

/// One raw read from the device, consumed within a single pipeline tick.
#[derive(Debug, Clone)]
pub struct RawReport {
    pub bytes: Vec<u8>,
    pub variant: ReportVariant,
    pub arrived_at: Instant,
}

/// Lifecycle and data events emitted by a running transport.
#[derive(Debug)]
pub enum TransportEvent {
    Connected { description: String },
    Frame(RawReport),
    Disconnected { reason: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no matching device found: {0}")]
    DeviceNotFound(String),

    #[error("BLE scan timed out after {0:?}")]
    ScanTimeout(Duration),

    #[error("BLE connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("device initialization failed: {0}")]
    Init(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("event channel closed")]
    ChannelClosed,
}

/// A source of raw controller reports.
///
/// `run` owns the device for its whole lifetime: discovery, the init
/// handshake, and steady-state delivery. It returns when the device is lost,
/// the event channel is dropped, or `cancel` fires; cancellation must be
/// observed within one read or notification cycle.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn variant(&self) -> ReportVariant {
        self.kind().variant()
    }

    async fn run(
        &mut self,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;
}
