//! Stick center calibration.
//!
//! The controller reports absolute 12-bit axis values with a resting position
//! near 2048 that differs per unit. At pipeline start we measure the actual
//! center from a bounded sample prefix and thereafter subtract it, yielding a
//! signed range centered on zero.
//!
//! The measurement policy depends on the transport: USB reports arrive at a
//! stable ~250 Hz, so the mean of the first 10 samples suffices. BLE
//! notifications jitter during connection setup, so we skip the first few
//! reports and take the median of 50. Once an offset has been emitted it is
//! frozen for the lifetime of the pipeline; reconnecting spawns a new pipeline
//! and with it a fresh calibration.

use std::time::Duration;
use thiserror::Error;

use super::decoder::{InputFrame, ReportVariant};

/// Sample count for the USB mean policy.
pub const USB_SAMPLE_TARGET: usize = 10;

/// Reports discarded before BLE sampling starts.
pub const BLE_SETTLE_FRAMES: usize = 5;

/// Sample count for the BLE median policy.
pub const BLE_SAMPLE_TARGET: usize = 50;

/// Deadline for collecting the full sample set, measured from transport
/// connect. Expiry fails the pipeline rather than shipping uncentered sticks.
pub const CALIBRATION_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPolicy {
    UsbMean,
    BleMedian,
}

impl CalibrationPolicy {
    pub fn for_variant(variant: ReportVariant) -> Self {
        match variant {
            ReportVariant::Usb => CalibrationPolicy::UsbMean,
            ReportVariant::Ble => CalibrationPolicy::BleMedian,
        }
    }

    fn settle_frames(self) -> usize {
        match self {
            CalibrationPolicy::UsbMean => 0,
            CalibrationPolicy::BleMedian => BLE_SETTLE_FRAMES,
        }
    }

    fn sample_target(self) -> usize {
        match self {
            CalibrationPolicy::UsbMean => USB_SAMPLE_TARGET,
            CalibrationPolicy::BleMedian => BLE_SAMPLE_TARGET,
        }
    }
}

/// Measured per-axis stick centers. Immutable once emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationOffset {
    pub main_x: u16,
    pub main_y: u16,
    pub c_x: u16,
    pub c_y: u16,
}

/// Signed, centered axis values (≈ -2048..2047).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CenteredAxes {
    pub main_x: i16,
    pub main_y: i16,
    pub c_x: i16,
    pub c_y: i16,
}

impl CalibrationOffset {
    /// Rewrites a raw frame's axes to centered signed form.
    pub fn apply(&self, frame: &InputFrame) -> CenteredAxes {
        CenteredAxes {
            main_x: (frame.main.x as i32 - self.main_x as i32) as i16,
            main_y: (frame.main.y as i32 - self.main_y as i32) as i16,
            c_x: (frame.c_stick.x as i32 - self.c_x as i32) as i16,
            c_y: (frame.c_stick.y as i32 - self.c_y as i32) as i16,
        }
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("stick calibration timed out after {elapsed:?} with {collected} samples")]
    Timeout {
        elapsed: Duration,
        collected: usize,
    },
}

/// Accumulates raw axis samples until the policy's target is reached, then
/// emits the center offset exactly once.
#[derive(Debug)]
pub struct Calibrator {
    policy: CalibrationPolicy,
    settle_remaining: usize,
    samples: Vec<[u16; 4]>,
    offset: Option<CalibrationOffset>,
}

impl Calibrator {
    pub fn new(policy: CalibrationPolicy) -> Self {
        Self {
            policy,
            settle_remaining: policy.settle_frames(),
            samples: Vec::with_capacity(policy.sample_target()),
            offset: None,
        }
    }

    pub fn offset(&self) -> Option<CalibrationOffset> {
        self.offset
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Feeds one raw frame. Returns `Some` exactly once, when the sample
    /// target is reached; afterwards the calibrator is inert.
    pub fn observe(&mut self, frame: &InputFrame) -> Option<CalibrationOffset> {
        if self.offset.is_some() {
            return None;
        }
        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            return None;
        }

        self.samples.push([
            frame.main.x,
            frame.main.y,
            frame.c_stick.x,
            frame.c_stick.y,
        ]);
        if self.samples.len() < self.policy.sample_target() {
            return None;
        }

        let center = |axis: usize| -> u16 {
            match self.policy {
                CalibrationPolicy::UsbMean => axis_mean(&self.samples, axis),
                CalibrationPolicy::BleMedian => axis_median(&self.samples, axis),
            }
        };
        let offset = CalibrationOffset {
            main_x: center(0),
            main_y: center(1),
            c_x: center(2),
            c_y: center(3),
        };

        self.samples.clear();
        self.offset = Some(offset);
        Some(offset)
    }
}

fn axis_mean(samples: &[[u16; 4]], axis: usize) -> u16 {
    let sum: u32 = samples.iter().map(|s| s[axis] as u32).sum();
    (sum / samples.len() as u32) as u16
}

fn axis_median(samples: &[[u16; 4]], axis: usize) -> u16 {
    let mut values: Vec<u16> = samples.iter().map(|s| s[axis]).collect();
    values.sort_unstable();
    values[values.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::decoder::{StickRaw, AXIS_CENTER};

    fn frame(main: (u16, u16), c: (u16, u16)) -> InputFrame {
        InputFrame {
            main: StickRaw {
                x: main.0,
                y: main.1,
            },
            c_stick: StickRaw { x: c.0, y: c.1 },
            ..InputFrame::default()
        }
    }

    #[test]
    fn constant_samples_yield_that_center() {
        let mut calibrator = Calibrator::new(CalibrationPolicy::UsbMean);
        let sample = frame((1900, 2100), (2048, 2048));

        let mut emitted = None;
        for _ in 0..USB_SAMPLE_TARGET {
            emitted = calibrator.observe(&sample);
        }
        let offset = emitted.expect("offset after full sample window");
        assert_eq!(offset.main_x, 1900);
        assert_eq!(offset.main_y, 2100);
        assert_eq!(offset.c_x, 2048);
        assert_eq!(offset.c_y, 2048);

        // The same frame calibrates to exactly zero on every axis.
        assert_eq!(offset.apply(&sample), CenteredAxes::default());
    }

    #[test]
    fn usb_mean_over_first_ten() {
        let mut calibrator = Calibrator::new(CalibrationPolicy::UsbMean);
        for i in 0..USB_SAMPLE_TARGET as u16 {
            let emitted = calibrator.observe(&frame((2040 + i, 2048), (2048, 2048)));
            if i as usize == USB_SAMPLE_TARGET - 1 {
                // mean of 2040..=2049
                assert_eq!(emitted.unwrap().main_x, 2044);
            } else {
                assert!(emitted.is_none());
            }
        }
    }

    #[test]
    fn ble_median_resists_outliers() {
        let mut calibrator = Calibrator::new(CalibrationPolicy::BleMedian);

        // Settle frames carry garbage from connection setup.
        for _ in 0..BLE_SETTLE_FRAMES {
            assert!(calibrator.observe(&frame((0, 0), (0, 0))).is_none());
            assert_eq!(calibrator.sample_count(), 0);
        }

        let mut emitted = None;
        for i in 0..BLE_SAMPLE_TARGET {
            // One wild outlier among steady samples.
            let x = if i == 7 { 4095 } else { 2050 };
            emitted = calibrator.observe(&frame((x, 2048), (2048, 2048)));
        }
        assert_eq!(emitted.unwrap().main_x, 2050);
    }

    #[test]
    fn offset_is_frozen_after_emit() {
        let mut calibrator = Calibrator::new(CalibrationPolicy::UsbMean);
        for _ in 0..USB_SAMPLE_TARGET {
            calibrator.observe(&frame((2048, 2048), (2048, 2048)));
        }
        let frozen = calibrator.offset().unwrap();

        for _ in 0..USB_SAMPLE_TARGET {
            assert!(calibrator.observe(&frame((100, 100), (100, 100))).is_none());
        }
        assert_eq!(calibrator.offset().unwrap(), frozen);
    }

    #[test]
    fn centered_output_is_signed() {
        let offset = CalibrationOffset {
            main_x: AXIS_CENTER,
            main_y: AXIS_CENTER,
            c_x: AXIS_CENTER,
            c_y: AXIS_CENTER,
        };
        let axes = offset.apply(&frame((0xABC, 0x123), (0, 4095)));
        assert_eq!(axes.main_x, 700);
        assert_eq!(axes.main_y, -1757);
        assert_eq!(axes.c_x, -2048);
        assert_eq!(axes.c_y, 2047);
    }
}
