//! BLE transport: filtered scan, vendor handshake, notification stream.
//!
//! Discovery scans for peripherals advertising the HID service and carrying
//! the Nintendo name prefix (or matching an explicit address), so nearby
//! unrelated BLE devices are never paired with. After connecting we write the
//! READ_SPI wake command, the default/LED reports, and the set-input-mode
//! subcommand so the controller streams complete frames; input then arrives
//! as 63-byte notifications.
//!
//! The notification path stays minimal: each payload is wrapped into a
//! [`RawReport`] and forwarded. Decoding, calibration bookkeeping, and
//! latency accounting all happen on the pipeline task, off the BLE delivery
//! context.
//!
//! On Linux the kernel's default connection interval caps delivery around
//! 33 Hz. Before connecting we try to request 7.5-15 ms through the bluetooth
//! debugfs knobs; that needs elevated privileges and silently falls back to
//! the stack default when unavailable.

use async_trait::async_trait;
use btleplug::api::{
    bleuuid::uuid_from_u16, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    RawReport, Transport, TransportError, TransportEvent, TransportKind, DEFAULT_REPORT_DATA,
    SET_LED_DATA,
};
use crate::controller::decoder::ReportVariant;
use crate::persistence::controller_store::ControllerStore;

/// Standard HID-over-GATT service, used as the scan filter.
const HID_SERVICE_UUID: Uuid = uuid_from_u16(0x1812);

/// HID Report characteristic; preferred for notifications when present.
const HID_REPORT_UUID: Uuid = uuid_from_u16(0x2a4d);

/// Advertised name prefix of the controller family.
pub const NAME_PREFIX: &str = "Nintendo";

/// READ_SPI wake command; the controller answers it even before pairing.
pub const BLE_HANDSHAKE_READ_SPI: [u8; 16] = [
    0x02, 0x91, 0x01, 0x04, 0x00, 0x08, 0x00, 0x00, 0x40, 0x7e, 0x00, 0x00, 0x00, 0x30, 0x01, 0x00,
];

/// Subcommand 0x03, mode 0x30: standard full input reports.
pub const SET_INPUT_MODE: [u8; 11] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x30,
];

const SCAN_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection interval bounds in 1.25 ms units: 6 = 7.5 ms, 12 = 15 ms.
const CONN_MIN_INTERVAL_UNITS: u8 = 6;
const CONN_MAX_INTERVAL_UNITS: u8 = 12;

pub struct BleTransport {
    address: Option<String>,
    store: Option<ControllerStore>,
}

impl BleTransport {
    /// With `address` the scan matches only that peripheral; without it the
    /// first device passing the service + name filter wins.
    pub fn new(address: Option<String>) -> Self {
        Self {
            address,
            store: None,
        }
    }

    /// Records the connected address as last-connected in `store`.
    pub fn with_store(mut self, store: ControllerStore) -> Self {
        self.store = Some(store);
        self
    }

    async fn matches(&self, peripheral: &Peripheral) -> bool {
        let props = match peripheral.properties().await {
            Ok(Some(props)) => props,
            _ => return false,
        };
        match &self.address {
            Some(address) => props.address.to_string().eq_ignore_ascii_case(address),
            None => props
                .local_name
                .map(|name| name.starts_with(NAME_PREFIX))
                .unwrap_or(false),
        }
    }

    /// Scans until a matching peripheral appears. `Ok(None)` means the scan
    /// was cancelled by the operator.
    async fn locate(
        &self,
        central: &Adapter,
        cancel: &CancellationToken,
    ) -> Result<Option<Peripheral>, TransportError> {
        let mut adapter_events = central.events().await?;
        central
            .start_scan(ScanFilter {
                services: vec![HID_SERVICE_UUID],
            })
            .await?;
        info!("scanning for controller (hold the pair button)...");

        let deadline = tokio::time::Instant::now() + SCAN_TIMEOUT;
        let found = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = central.stop_scan().await;
                    return Ok(None);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = central.stop_scan().await;
                    return Err(TransportError::ScanTimeout(SCAN_TIMEOUT));
                }
                event = adapter_events.next() => {
                    let id = match event {
                        Some(CentralEvent::DeviceDiscovered(id))
                        | Some(CentralEvent::DeviceUpdated(id)) => id,
                        Some(_) => continue,
                        None => {
                            return Err(TransportError::DeviceNotFound(
                                "Bluetooth adapter event stream ended".into(),
                            ));
                        }
                    };
                    let peripheral = central.peripheral(&id).await?;
                    if self.matches(&peripheral).await {
                        break peripheral;
                    }
                }
            }
        };
        let _ = central.stop_scan().await;
        Ok(Some(found))
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn run(
        &mut self,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        try_shorten_connection_interval();

        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::DeviceNotFound("no Bluetooth adapter".into()))?;

        let peripheral = match self.locate(&central, &cancel).await? {
            Some(peripheral) => peripheral,
            None => return Ok(()),
        };
        let address = peripheral.address().to_string();
        info!("found controller at {address}, connecting...");

        tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| TransportError::ConnectTimeout(CONNECT_TIMEOUT))??;
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let notify_char = characteristics
            .iter()
            .find(|c| c.uuid == HID_REPORT_UUID && c.properties.contains(CharPropFlags::NOTIFY))
            .or_else(|| {
                characteristics.iter().find(|c| {
                    c.properties
                        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
                })
            })
            .cloned()
            .ok_or_else(|| TransportError::Init("no notify characteristic".into()))?;
        let write_char = characteristics
            .iter()
            .find(|c| {
                c.properties
                    .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
            })
            .cloned()
            .ok_or_else(|| TransportError::Init("no writable characteristic".into()))?;

        peripheral.subscribe(&notify_char).await?;
        handshake(&peripheral, &write_char).await;
        info!("handshake sent, controller should stop blinking");

        if let Some(store) = &self.store {
            if let Err(e) = store.set_last_connected(&address) {
                warn!("could not record last-connected controller: {e}");
            }
        }

        let mut notifications = peripheral.notifications().await?;
        events
            .send(TransportEvent::Connected {
                description: format!("ble[{address}]"),
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notification = notifications.next() => match notification {
                    Some(data) => {
                        let report = RawReport {
                            bytes: data.value,
                            variant: ReportVariant::Ble,
                            arrived_at: Instant::now(),
                        };
                        if events.send(TransportEvent::Frame(report)).await.is_err() {
                            debug!("pipeline dropped its receiver, stopping notifications");
                            break;
                        }
                    }
                    None => {
                        warn!("notification stream ended for {address}");
                        let _ = events
                            .send(TransportEvent::Disconnected {
                                reason: "notification stream ended".into(),
                            })
                            .await;
                        break;
                    }
                }
            }
        }

        let _ = peripheral.disconnect().await;
        Ok(())
    }
}

/// Sends the wake/init sequence on the writable characteristic. Individual
/// writes may be rejected depending on firmware state; that is not fatal as
/// long as notifications flow.
async fn handshake(peripheral: &Peripheral, write_char: &Characteristic) {
    let write_type = if write_char
        .properties
        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    };

    for payload in [
        &BLE_HANDSHAKE_READ_SPI[..],
        &DEFAULT_REPORT_DATA[..],
        &SET_LED_DATA[..],
        &SET_INPUT_MODE[..],
    ] {
        if let Err(e) = peripheral.write(write_char, payload, write_type).await {
            debug!("handshake write rejected: {e}");
        }
    }
}

/// Requests a shorter BLE connection interval through the kernel debugfs.
/// Needs root; absence or refusal is logged and ignored, leaving the stack
/// default (~33 Hz) in place.
#[cfg(target_os = "linux")]
fn try_shorten_connection_interval() {
    let base = std::path::Path::new("/sys/kernel/debug/bluetooth/hci0");
    for (name, units) in [
        ("conn_min_interval", CONN_MIN_INTERVAL_UNITS),
        ("conn_max_interval", CONN_MAX_INTERVAL_UNITS),
    ] {
        let path = base.join(name);
        if let Err(e) = std::fs::write(&path, units.to_string()) {
            debug!(
                "connection interval tuning unavailable ({}): {e}",
                path.display()
            );
            return;
        }
    }
    info!("requested 7.5-15ms BLE connection interval via debugfs");
}

#[cfg(not(target_os = "linux"))]
fn try_shorten_connection_interval() {
    let _ = (CONN_MIN_INTERVAL_UNITS, CONN_MAX_INTERVAL_UNITS);
}
