//! USB transport: vendor init handshake, then blocking HID polling.
//!
//! The controller only streams input reports after two 16-byte writes on the
//! bulk OUT endpoint of interface 1 (default report, then LED report). Input
//! reports are then read through the HID layer as fast as the host poll rate
//! allows. The whole lifecycle runs on a blocking worker thread; the read
//! loop uses a short timeout so cancellation is observed within one cycle.

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use rusb::{DeviceHandle, Direction, GlobalContext, TransferType};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    RawReport, Transport, TransportError, TransportEvent, TransportKind, DEFAULT_REPORT_DATA,
    PRODUCT_ID, SET_LED_DATA, USB_INTERFACE, VENDOR_ID,
};
use crate::controller::decoder::ReportVariant;

const INIT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const INIT_SETTLE: Duration = Duration::from_millis(100);

/// Read timeout per poll; bounds how long cancellation can go unnoticed.
const READ_TIMEOUT_MS: i32 = 10;

pub struct UsbTransport {
    device_index: usize,
}

impl UsbTransport {
    /// `device_index` selects among multiple attached controllers, in
    /// enumeration order.
    pub fn new(device_index: usize) -> Self {
        Self { device_index }
    }
}

#[async_trait]
impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    async fn run(
        &mut self,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let device_index = self.device_index;
        tokio::task::spawn_blocking(move || run_blocking(device_index, events, cancel))
            .await
            .map_err(|e| TransportError::Init(format!("USB worker thread failed: {e}")))?
    }
}

fn run_blocking(
    device_index: usize,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let (usb_handle, out_endpoint) = open_usb(device_index)?;
    initialize(&usb_handle, out_endpoint)?;
    let hid = open_hid(device_index)?;

    events
        .blocking_send(TransportEvent::Connected {
            description: format!("usb[{device_index}]"),
        })
        .map_err(|_| TransportError::ChannelClosed)?;
    info!("USB controller {device_index} initialized, polling input reports");

    let mut buf = [0u8; 64];
    while !cancel.is_cancelled() {
        match hid.read_timeout(&mut buf, READ_TIMEOUT_MS) {
            // 0 bytes = poll timeout, nothing queued
            Ok(0) => continue,
            Ok(n) => {
                let report = RawReport {
                    bytes: buf[..n].to_vec(),
                    variant: ReportVariant::Usb,
                    arrived_at: Instant::now(),
                };
                if events.blocking_send(TransportEvent::Frame(report)).is_err() {
                    debug!("pipeline dropped its receiver, stopping USB reads");
                    break;
                }
            }
            Err(e) => {
                warn!("USB read failed: {e}");
                let _ = events.blocking_send(TransportEvent::Disconnected {
                    reason: e.to_string(),
                });
                break;
            }
        }
    }

    // Dropping the handles releases the claimed interface.
    Ok(())
}

fn open_usb(device_index: usize) -> Result<(DeviceHandle<GlobalContext>, u8), TransportError> {
    let devices = rusb::devices()?;
    let device = devices
        .iter()
        .filter(|device| {
            device
                .device_descriptor()
                .map(|desc| desc.vendor_id() == VENDOR_ID && desc.product_id() == PRODUCT_ID)
                .unwrap_or(false)
        })
        .nth(device_index)
        .ok_or_else(|| {
            TransportError::DeviceNotFound(format!(
                "no NSO GameCube controller on USB (index {device_index})"
            ))
        })?;

    let handle = device.open()?;
    // Unsupported on some platforms; claiming below surfaces real failures.
    let _ = handle.set_auto_detach_kernel_driver(true);
    handle.claim_interface(USB_INTERFACE)?;

    let config = device.active_config_descriptor()?;
    let mut out_endpoint = None;
    for interface in config.interfaces() {
        if interface.number() != USB_INTERFACE {
            continue;
        }
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.direction() == Direction::Out
                    && endpoint.transfer_type() == TransferType::Bulk
                {
                    out_endpoint = Some(endpoint.address());
                }
            }
        }
    }
    let out_endpoint = out_endpoint.ok_or_else(|| {
        TransportError::Init(format!("no bulk OUT endpoint on interface {USB_INTERFACE}"))
    })?;

    Ok((handle, out_endpoint))
}

fn initialize(
    handle: &DeviceHandle<GlobalContext>,
    out_endpoint: u8,
) -> Result<(), TransportError> {
    handle.write_bulk(out_endpoint, &DEFAULT_REPORT_DATA, INIT_WRITE_TIMEOUT)?;
    debug!("default report sent");
    thread::sleep(INIT_SETTLE);

    handle.write_bulk(out_endpoint, &SET_LED_DATA, INIT_WRITE_TIMEOUT)?;
    debug!("LED report sent");
    thread::sleep(INIT_SETTLE);

    Ok(())
}

fn open_hid(device_index: usize) -> Result<HidDevice, TransportError> {
    let api = HidApi::new()?;
    let info = api
        .device_list()
        .filter(|info| info.vendor_id() == VENDOR_ID && info.product_id() == PRODUCT_ID)
        .nth(device_index)
        .ok_or_else(|| {
            TransportError::DeviceNotFound(
                "controller initialized over USB but not visible as a HID device".into(),
            )
        })?;
    Ok(info.open_device(&api)?)
}
