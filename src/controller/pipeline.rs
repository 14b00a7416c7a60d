//! Controller pipeline: one running controller behind a latest-value cell.
//!
//! Each pipeline owns a transport task and folds its event stream through the
//! decoder and calibrator into a `tokio::sync::watch` cell. The pipeline task
//! is the cell's only writer; every write replaces the previous snapshot
//! atomically, so readers always observe the most recent state and never a
//! backlog. Malformed reports are dropped without touching the snapshot or
//! its sequence number.

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::calibration::{
    CalibrationError, CalibrationPolicy, Calibrator, CALIBRATION_WINDOW,
};
use super::decoder::{self, Buttons};
use super::latency::LatencyMonitor;
use crate::transport::{Transport, TransportError, TransportEvent, TransportKind};

/// Capacity of the transport event queue feeding one pipeline.
const EVENT_QUEUE: usize = 64;

/// Calibrated, externally visible state of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    pub buttons: Buttons,
    pub main_x: i16,
    pub main_y: i16,
    pub c_x: i16,
    pub c_y: i16,
    pub trigger_l: u8,
    pub trigger_r: u8,
    /// Strictly increasing per accepted frame; starts at 1.
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Calibrating,
    Active,
    Disconnected,
}

/// Value stored in the per-slot watch cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotSnapshot {
    pub status: ConnectionStatus,
    pub kind: TransportKind,
    pub state: ControllerState,
}

impl SlotSnapshot {
    fn initial(kind: TransportKind) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            kind,
            state: ControllerState::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("pipeline task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    /// Enables the inter-arrival latency window; off by default.
    pub latency_stats: bool,
}

/// Handle to a spawned pipeline. Dropping the handle does not stop the
/// pipeline; use [`PipelineHandle::shutdown`] or cancel the parent token.
pub struct PipelineHandle {
    slot: u8,
    snapshot_rx: watch::Receiver<SlotSnapshot>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), PipelineError>>,
}

impl PipelineHandle {
    /// Spawns the pipeline task for `transport`. `parent` cancellation stops
    /// this pipeline along with its owner; the handle also carries its own
    /// child token for targeted shutdown.
    pub fn spawn(
        slot: u8,
        transport: Box<dyn Transport>,
        settings: PipelineSettings,
        parent: &CancellationToken,
    ) -> Self {
        let kind = transport.kind();
        let cancel = parent.child_token();
        let (snapshot_tx, snapshot_rx) = watch::channel(SlotSnapshot::initial(kind));
        let task = tokio::spawn(run_pipeline(
            slot,
            transport,
            settings,
            snapshot_tx,
            cancel.clone(),
        ));
        Self {
            slot,
            snapshot_rx,
            cancel,
            task,
        }
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// A new reader of this pipeline's latest-value cell.
    pub fn subscribe(&self) -> watch::Receiver<SlotSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Waits until the pipeline ends on its own (transport loss, calibration
    /// failure, or cancellation).
    pub async fn join(self) -> Result<(), PipelineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Task(e.to_string())),
        }
    }

    /// Signals the transport to stop and waits for the task to finish.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        self.cancel.cancel();
        self.join().await
    }
}

async fn run_pipeline(
    slot: u8,
    mut transport: Box<dyn Transport>,
    settings: PipelineSettings,
    snapshot_tx: watch::Sender<SlotSnapshot>,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let variant = transport.variant();
    let kind = transport.kind();

    let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE);
    let transport_cancel = cancel.child_token();
    let transport_task = {
        let transport_cancel = transport_cancel.clone();
        tokio::spawn(async move { transport.run(event_tx, transport_cancel).await })
    };

    let mut calibrator = Calibrator::new(CalibrationPolicy::for_variant(variant));
    let mut latency = LatencyMonitor::new(settings.latency_stats);
    let mut sequence: u64 = 0;
    let mut calibration_deadline: Option<tokio::time::Instant> = None;

    let outcome: Result<(), PipelineError> = loop {
        let awaiting_calibration =
            calibration_deadline.is_some() && calibrator.offset().is_none();
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),

            _ = tokio::time::sleep_until(
                calibration_deadline.unwrap_or_else(tokio::time::Instant::now)
            ), if awaiting_calibration => {
                error!("slot {slot}: calibration window expired");
                break Err(CalibrationError::Timeout {
                    elapsed: CALIBRATION_WINDOW,
                    collected: calibrator.sample_count(),
                }
                .into());
            }

            event = event_rx.recv() => match event {
                None => {
                    debug!("slot {slot}: transport event stream ended");
                    break Ok(());
                }
                Some(TransportEvent::Connected { description }) => {
                    info!("slot {slot}: {description} connected, calibrating sticks");
                    calibration_deadline =
                        Some(tokio::time::Instant::now() + CALIBRATION_WINDOW);
                    snapshot_tx.send_modify(|snapshot| {
                        snapshot.status = ConnectionStatus::Calibrating;
                    });
                }
                Some(TransportEvent::Frame(report)) => {
                    let frame = match decoder::decode(variant, &report.bytes) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("slot {slot}: dropping report: {e}");
                            continue;
                        }
                    };

                    if let Some(stats) = latency.record(report.arrived_at) {
                        info!(
                            "slot {slot}: latency avg {:.2}ms jitter {:.2}ms range [{:.1}-{:.1}]",
                            stats.avg_ms, stats.jitter_ms, stats.min_ms, stats.max_ms
                        );
                    }

                    let offset = match calibrator.offset() {
                        Some(offset) => offset,
                        None => {
                            if let Some(offset) = calibrator.observe(&frame) {
                                info!(
                                    "slot {slot}: calibration complete, centers \
                                     main=({}, {}) c=({}, {})",
                                    offset.main_x, offset.main_y, offset.c_x, offset.c_y
                                );
                                calibration_deadline = None;
                            }
                            // Calibration samples are consumed, not published.
                            continue;
                        }
                    };

                    let axes = offset.apply(&frame);
                    sequence += 1;
                    let state = ControllerState {
                        buttons: frame.buttons,
                        main_x: axes.main_x,
                        main_y: axes.main_y,
                        c_x: axes.c_x,
                        c_y: axes.c_y,
                        trigger_l: frame.trigger_l,
                        trigger_r: frame.trigger_r,
                        sequence,
                    };
                    snapshot_tx.send_replace(SlotSnapshot {
                        status: ConnectionStatus::Active,
                        kind,
                        state,
                    });
                }
                Some(TransportEvent::Disconnected { reason }) => {
                    warn!("slot {slot}: transport disconnected: {reason}");
                    break Ok(());
                }
            }
        }
    };

    // Publish the terminal status before the cell's writer goes away; readers
    // must never keep treating the last state as live.
    snapshot_tx.send_modify(|snapshot| {
        snapshot.status = ConnectionStatus::Disconnected;
    });

    // Closing the event channel unblocks a transport stuck in a send; the
    // token covers the ones waiting on I/O.
    drop(event_rx);
    transport_cancel.cancel();
    let transport_result = match transport_task.await {
        Ok(result) => result,
        Err(e) => {
            error!("slot {slot}: transport task panicked: {e}");
            return Err(PipelineError::Task(e.to_string()));
        }
    };

    match (outcome, transport_result) {
        (Err(e), _) => Err(e),
        (Ok(()), Err(e)) => Err(e.into()),
        (Ok(()), Ok(())) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::decoder::ReportVariant;
    use crate::transport::RawReport;
    use async_trait::async_trait;
    use std::time::{Duration, Instant};

    /// Feeds a fixed report sequence, then either disconnects or idles.
    struct ScriptedTransport {
        reports: Vec<Vec<u8>>,
        disconnect_after: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Usb
        }

        async fn run(
            &mut self,
            events: mpsc::Sender<TransportEvent>,
            cancel: CancellationToken,
        ) -> Result<(), TransportError> {
            events
                .send(TransportEvent::Connected {
                    description: "scripted".into(),
                })
                .await
                .map_err(|_| TransportError::ChannelClosed)?;
            for bytes in self.reports.drain(..) {
                let report = RawReport {
                    bytes,
                    variant: ReportVariant::Usb,
                    arrived_at: Instant::now(),
                };
                if events.send(TransportEvent::Frame(report)).await.is_err() {
                    return Ok(());
                }
            }
            if self.disconnect_after {
                let _ = events
                    .send(TransportEvent::Disconnected {
                        reason: "script finished".into(),
                    })
                    .await;
            } else {
                cancel.cancelled().await;
            }
            Ok(())
        }
    }

    fn usb_report(main: (u16, u16)) -> Vec<u8> {
        let mut report = vec![0u8; 64];
        report[6] = (main.0 & 0xFF) as u8;
        report[7] = ((main.0 >> 8) & 0x0F) as u8 | ((main.1 & 0x0F) << 4) as u8;
        report[8] = (main.1 >> 4) as u8;
        // c-stick at nominal center
        report[9] = 0x00;
        report[10] = 0x08;
        report[11] = 0x80;
        report
    }

    fn neutral() -> Vec<u8> {
        usb_report((2048, 2048))
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SlotSnapshot>,
        predicate: impl Fn(&SlotSnapshot) -> bool,
    ) -> SlotSnapshot {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if predicate(&snapshot) {
                        return *snapshot;
                    }
                }
                rx.changed().await.expect("pipeline writer gone");
            }
        })
        .await
        .expect("snapshot condition not reached in time")
    }

    fn spawn_scripted(reports: Vec<Vec<u8>>, disconnect_after: bool) -> PipelineHandle {
        let cancel = CancellationToken::new();
        PipelineHandle::spawn(
            0,
            Box::new(ScriptedTransport {
                reports,
                disconnect_after,
            }),
            PipelineSettings::default(),
            &cancel,
        )
    }

    #[tokio::test]
    async fn neutral_frame_calibrates_to_zero() {
        let mut reports: Vec<Vec<u8>> = (0..10).map(|_| neutral()).collect();
        reports.push(neutral());
        let handle = spawn_scripted(reports, false);

        let mut rx = handle.subscribe();
        let snapshot = wait_for(&mut rx, |s| s.status == ConnectionStatus::Active).await;
        assert_eq!(snapshot.state.sequence, 1);
        assert_eq!(snapshot.state.main_x, 0);
        assert_eq!(snapshot.state.main_y, 0);
        assert_eq!(snapshot.state.c_x, 0);
        assert_eq!(snapshot.state.c_y, 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn deflected_frame_is_centered_against_offset() {
        let mut reports: Vec<Vec<u8>> = (0..10).map(|_| neutral()).collect();
        reports.push(usb_report((0xABC, 0x123)));
        let handle = spawn_scripted(reports, false);

        let mut rx = handle.subscribe();
        let snapshot = wait_for(&mut rx, |s| s.status == ConnectionStatus::Active).await;
        assert_eq!(snapshot.state.main_x, 700);
        assert_eq!(snapshot.state.main_y, -1757);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_reports_do_not_advance_sequence() {
        let mut reports: Vec<Vec<u8>> = (0..10).map(|_| neutral()).collect();
        reports.push(vec![0u8; 12]); // wrong length, dropped
        reports.push(usb_report((0xABC, 0x123)));
        let handle = spawn_scripted(reports, false);

        let mut rx = handle.subscribe();
        let snapshot = wait_for(&mut rx, |s| s.status == ConnectionStatus::Active).await;
        // The malformed report did not consume a sequence number.
        assert_eq!(snapshot.state.sequence, 1);
        assert_eq!(snapshot.state.main_x, 700);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sequence_counts_every_accepted_frame() {
        let mut reports: Vec<Vec<u8>> = (0..10).map(|_| neutral()).collect();
        for _ in 0..25 {
            reports.push(neutral());
        }
        reports.push(usb_report((100, 100)));
        let handle = spawn_scripted(reports, false);

        let mut rx = handle.subscribe();
        let snapshot = wait_for(&mut rx, |s| s.state.sequence == 26).await;
        assert_eq!(snapshot.state.main_x, 100 - 2048);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_published() {
        let reports: Vec<Vec<u8>> = (0..11).map(|_| neutral()).collect();
        let handle = spawn_scripted(reports, true);

        let mut rx = handle.subscribe();
        let snapshot = wait_for(&mut rx, |s| s.status == ConnectionStatus::Disconnected).await;
        // The last known state survives alongside the terminal status.
        assert_eq!(snapshot.state.sequence, 1);

        handle.join().await.unwrap();
    }
}
