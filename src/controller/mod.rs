//! Controller subsystem: from raw HID bytes to calibrated shared state
//!
//! Implements the per-controller processing chain:
//!
//! 1. [`decoder`] - Raw report bytes to a normalized input frame
//! 2. [`calibration`] - Stick center measurement and offset application
//! 3. [`latency`] - Inter-arrival statistics over a rolling window
//! 4. [`pipeline`] - Lifecycle glue binding a transport to the shared state cell
//!
//! # Architecture
//!
//! ```text
//! Transport ──► Decoder ──► Calibrator ──► watch::Sender<SlotSnapshot>
//!  (raw bytes)  (InputFrame) (centered)      (latest-value cell)
//! ```
//!
//! The pipeline task is the only writer of its slot's state cell; the DSU
//! server side holds the matching receivers and never blocks the writer.

pub mod calibration;
pub mod decoder;
pub mod latency;
pub mod pipeline;
