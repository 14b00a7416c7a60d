//! Session manager and per-slot supervisors.

use statum::{machine, state};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BridgeConfig, SlotConfig, TransportChoice};
use crate::controller::pipeline::{PipelineHandle, PipelineSettings};
use crate::dsu::{DsuConfig, DsuError, DsuPublisher, DsuServer};
use crate::persistence::ControllerStore;
use crate::transport::ble::BleTransport;
use crate::transport::usb::UsbTransport;
use crate::transport::{Transport, TransportError};

/// DSU exposes at most four pads.
pub const MAX_SLOTS: usize = 4;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Dsu(#[from] DsuError),

    #[error("no slots configured")]
    NoSlots,

    #[error("more than {MAX_SLOTS} slots configured")]
    TooManySlots,

    #[error("slot {0} out of range (0-3)")]
    SlotOutOfRange(u8),

    #[error("slot {0} configured more than once")]
    DuplicateSlot(u8),
}

/// States of one slot supervisor.
#[state]
#[derive(Debug, Clone)]
pub enum SlotLifecycle {
    Resolving,    // Locating the controller and starting its pipeline
    Active,       // Pipeline running, bound to the DSU slot
    Disconnected, // Transport lost; slot inactive until re-resolved
}

/// Per-slot supervisor. One instance drives one connect attempt; reconnecting
/// builds a fresh runner (and with it a fresh pipeline and calibration).
#[machine]
pub struct SlotRunner<S: SlotLifecycle> {
    slot: u8,
    choice: TransportChoice,
    settings: PipelineSettings,
    publisher: DsuPublisher,
    store: Option<ControllerStore>,
    cancel: CancellationToken,
    pipeline: Option<PipelineHandle>,
}

impl SlotRunner<Resolving> {
    fn create(
        slot: u8,
        choice: TransportChoice,
        settings: PipelineSettings,
        publisher: DsuPublisher,
        store: Option<ControllerStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(slot, choice, settings, publisher, store, cancel, None)
    }

    /// Builds the transport for this slot's choice, spawns the pipeline, and
    /// binds it to the DSU slot.
    fn resolve(mut self) -> Result<SlotRunner<Active>, TransportError> {
        let transport = build_transport(&self.choice, self.store.clone())?;
        info!("slot {}: starting {} pipeline", self.slot, transport.kind());

        let pipeline =
            PipelineHandle::spawn(self.slot, transport, self.settings.clone(), &self.cancel);
        self.publisher.bind_slot(self.slot, pipeline.subscribe());
        self.pipeline = Some(pipeline);
        Ok(self.transition())
    }
}

impl SlotRunner<Active> {
    /// Waits for the pipeline to end: transport loss, startup failure, or
    /// operator cancellation.
    async fn run_until_disconnect(mut self) -> SlotRunner<Disconnected> {
        if let Some(pipeline) = self.pipeline.take() {
            match pipeline.join().await {
                Ok(()) => info!("slot {}: pipeline stopped", self.slot),
                Err(e) => warn!("slot {}: pipeline failed: {e}", self.slot),
            }
        }
        self.transition()
    }
}

impl SlotRunner<Disconnected> {}

fn build_transport(
    choice: &TransportChoice,
    store: Option<ControllerStore>,
) -> Result<Box<dyn Transport>, TransportError> {
    match choice {
        TransportChoice::Usb { device_index } => Ok(Box::new(UsbTransport::new(*device_index))),
        TransportChoice::Ble {
            address,
            saved_name,
        } => {
            let address = match (address, saved_name) {
                (Some(address), _) => Some(address.clone()),
                (None, Some(name)) => {
                    let store = store.as_ref().ok_or_else(|| {
                        TransportError::DeviceNotFound(
                            "saved-controller store unavailable".into(),
                        )
                    })?;
                    let found = store.lookup(name).map_err(|e| {
                        TransportError::DeviceNotFound(format!(
                            "saved-controller store unreadable: {e}"
                        ))
                    })?;
                    Some(found.ok_or_else(|| {
                        TransportError::DeviceNotFound(format!(
                            "no saved controller named '{name}'"
                        ))
                    })?)
                }
                (None, None) => None, // filtered scan
            };
            let mut transport = BleTransport::new(address);
            if let Some(store) = store {
                transport = transport.with_store(store);
            }
            Ok(Box::new(transport))
        }
    }
}

/// Supervises one slot for the whole session, re-resolving after disconnects
/// when configured to.
async fn run_slot(
    config: SlotConfig,
    settings: PipelineSettings,
    publisher: DsuPublisher,
    store: Option<ControllerStore>,
    cancel: CancellationToken,
    auto_reconnect: bool,
) {
    loop {
        let runner = SlotRunner::create(
            config.slot,
            config.choice.clone(),
            settings.clone(),
            publisher.clone(),
            store.clone(),
            cancel.clone(),
        );
        match runner.resolve() {
            Ok(active) => {
                let _disconnected = active.run_until_disconnect().await;
            }
            Err(e) => error!("slot {}: {e}", config.slot),
        }

        if cancel.is_cancelled() || !auto_reconnect {
            break;
        }
        info!(
            "slot {}: reconnecting in {}s",
            config.slot,
            RECONNECT_DELAY.as_secs()
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// A running bridge session: DSU server plus one supervisor per slot.
pub struct SessionHandle {
    dsu_port: u16,
    cancel: CancellationToken,
    server: DsuServer,
    supervisors: Vec<(u8, JoinHandle<()>)>,
}

impl SessionHandle {
    pub async fn start(config: BridgeConfig) -> Result<Self, SessionError> {
        validate_slots(&config.slots)?;

        let cancel = CancellationToken::new();
        let server = DsuServer::bind(
            DsuConfig {
                bind_addr: config.bind_addr,
                port: config.dsu_port,
                server_id: std::process::id(),
                ..DsuConfig::default()
            },
            cancel.child_token(),
        )
        .await?;
        let publisher = server.publisher();

        let store = match ControllerStore::open_default() {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("saved-controller store unavailable: {e}");
                None
            }
        };
        let settings = PipelineSettings {
            latency_stats: config.latency_stats,
        };
        let auto_reconnect = config.auto_reconnect;

        let supervisors = config
            .slots
            .into_iter()
            .map(|slot_config| {
                let slot = slot_config.slot;
                let task = tokio::spawn(run_slot(
                    slot_config,
                    settings.clone(),
                    publisher.clone(),
                    store.clone(),
                    cancel.child_token(),
                    auto_reconnect,
                ));
                (slot, task)
            })
            .collect();

        Ok(Self {
            dsu_port: server.port(),
            cancel,
            server,
            supervisors,
        })
    }

    /// The DSU port actually bound; tell the emulator this one.
    pub fn dsu_port(&self) -> u16 {
        self.dsu_port
    }

    /// Stops every pipeline transport, then the DSU server, leaving no
    /// subscription bound to a released port.
    pub async fn shutdown(self) {
        info!("stopping session");
        self.cancel.cancel();
        for (slot, task) in self.supervisors {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("slot {slot} supervisor failed: {e}");
                }
            }
        }
        self.server.shutdown().await;
        info!("session stopped");
    }
}

fn validate_slots(slots: &[SlotConfig]) -> Result<(), SessionError> {
    if slots.is_empty() {
        return Err(SessionError::NoSlots);
    }
    if slots.len() > MAX_SLOTS {
        return Err(SessionError::TooManySlots);
    }
    let mut seen = [false; MAX_SLOTS];
    for config in slots {
        let slot = config.slot;
        if slot as usize >= MAX_SLOTS {
            return Err(SessionError::SlotOutOfRange(slot));
        }
        if seen[slot as usize] {
            return Err(SessionError::DuplicateSlot(slot));
        }
        seen[slot as usize] = true;
    }
    Ok(())
}
