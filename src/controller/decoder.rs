//! HID input report decoding for the NSO GameCube controller.
//!
//! The controller sends fixed-size reports whose field layout depends on the
//! transport framing: USB reports are 64 bytes, BLE notification payloads are
//! 63 bytes with every field shifted down by one byte. Both variants share the
//! same bit assignments and the same 12-bit nibble packing for the sticks:
//!
//! ```text
//! byte n:   X low 8 bits
//! byte n+1: X high 4 bits (low nibble) | Y low 4 bits (high nibble)
//! byte n+2: Y high 8 bits
//! ```
//!
//! Decoding is a pure function over the raw bytes; it performs no I/O and
//! keeps no state.

use thiserror::Error;

/// Maximum raw value of a 12-bit stick axis.
pub const AXIS_MAX: u16 = 4095;

/// Nominal stick center (2^11); measured centers land near this value.
pub const AXIS_CENTER: u16 = 2048;

/// Report framing variant, selecting the byte-offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportVariant {
    Usb,
    Ble,
}

impl ReportVariant {
    /// Fixed report size for this framing.
    pub const fn report_len(self) -> usize {
        match self {
            ReportVariant::Usb => 64,
            ReportVariant::Ble => 63,
        }
    }

    const fn layout(self) -> &'static ReportLayout {
        match self {
            ReportVariant::Usb => &USB_LAYOUT,
            ReportVariant::Ble => &BLE_LAYOUT,
        }
    }
}

/// Byte offsets of the decoded fields within one report.
struct ReportLayout {
    buttons: usize,
    main_stick: usize,
    c_stick: usize,
    trigger_l: usize,
    trigger_r: usize,
}

const USB_LAYOUT: ReportLayout = ReportLayout {
    buttons: 3,
    main_stick: 6,
    c_stick: 9,
    trigger_l: 13,
    trigger_r: 14,
};

// BLE offsets mapped from the 63-byte notification payload. Same shape as
// USB, one byte earlier.
const BLE_LAYOUT: ReportLayout = ReportLayout {
    buttons: 2,
    main_stick: 5,
    c_stick: 8,
    trigger_l: 12,
    trigger_r: 13,
};

/// Physical controls reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    A,
    B,
    X,
    Y,
    Z,
    L,
    R,
    Zl,
    Start,
    Home,
    Capture,
    DpadUp,
    DpadDown,
    DpadLeft,
    DpadRight,
}

/// Bit assignments relative to the variant's button base offset.
const BUTTON_TABLE: [(Button, usize, u8); 15] = [
    (Button::B, 0, 0x01),
    (Button::A, 0, 0x02),
    (Button::Y, 0, 0x04),
    (Button::X, 0, 0x08),
    (Button::R, 0, 0x10),
    (Button::Z, 0, 0x20),
    (Button::Start, 0, 0x40),
    (Button::DpadDown, 1, 0x01),
    (Button::DpadRight, 1, 0x02),
    (Button::DpadLeft, 1, 0x04),
    (Button::DpadUp, 1, 0x08),
    (Button::L, 1, 0x10),
    (Button::Zl, 1, 0x20),
    (Button::Home, 2, 0x01),
    (Button::Capture, 2, 0x02),
];

/// Packed set of pressed buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Buttons(u16);

impl Buttons {
    pub const fn empty() -> Self {
        Self(0)
    }

    fn bit(button: Button) -> u16 {
        1 << (button as u16)
    }

    pub fn contains(self, button: Button) -> bool {
        self.0 & Self::bit(button) != 0
    }

    pub fn insert(&mut self, button: Button) {
        self.0 |= Self::bit(button);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the pressed buttons in table order.
    pub fn iter(self) -> impl Iterator<Item = Button> {
        BUTTON_TABLE
            .iter()
            .map(|(button, _, _)| *button)
            .filter(move |button| self.contains(*button))
    }
}

/// Raw 12-bit stick sample, [0, 4095] per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StickRaw {
    pub x: u16,
    pub y: u16,
}

/// Decoded, uncalibrated input state of one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputFrame {
    pub buttons: Buttons,
    pub main: StickRaw,
    pub c_stick: StickRaw,
    pub trigger_l: u8,
    pub trigger_r: u8,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed {variant:?} report: expected {expected} bytes, got {actual}")]
    MalformedReport {
        variant: ReportVariant,
        expected: usize,
        actual: usize,
    },
}

/// Decodes one raw report into an [`InputFrame`].
///
/// Rejects reports whose length does not match the variant's fixed size.
pub fn decode(variant: ReportVariant, data: &[u8]) -> Result<InputFrame, DecodeError> {
    let expected = variant.report_len();
    if data.len() != expected {
        return Err(DecodeError::MalformedReport {
            variant,
            expected,
            actual: data.len(),
        });
    }

    let layout = variant.layout();

    let mut buttons = Buttons::empty();
    for (button, offset, mask) in BUTTON_TABLE {
        if data[layout.buttons + offset] & mask != 0 {
            buttons.insert(button);
        }
    }

    let main = unpack_stick(
        data[layout.main_stick],
        data[layout.main_stick + 1],
        data[layout.main_stick + 2],
    );
    let c_stick = unpack_stick(
        data[layout.c_stick],
        data[layout.c_stick + 1],
        data[layout.c_stick + 2],
    );

    let mut trigger_l = data[layout.trigger_l];
    let mut trigger_r = data[layout.trigger_r];

    // BLE firmware revisions that leave the analog trigger bytes at zero
    // still set the digital L/Z bits; fall back so triggers remain usable.
    if variant == ReportVariant::Ble && trigger_l == 0 && trigger_r == 0 {
        if buttons.contains(Button::Zl) {
            trigger_l = u8::MAX;
        }
        if buttons.contains(Button::Z) {
            trigger_r = u8::MAX;
        }
    }

    Ok(InputFrame {
        buttons,
        main,
        c_stick,
        trigger_l,
        trigger_r,
    })
}

/// Unpacks two 12-bit axes from three nibble-packed bytes.
pub fn unpack_stick(b0: u8, b1: u8, b2: u8) -> StickRaw {
    StickRaw {
        x: b0 as u16 | ((b1 as u16 & 0x0F) << 8),
        y: (b1 as u16 >> 4) | ((b2 as u16) << 4),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_stick(x: u16, y: u16) -> [u8; 3] {
        [
            (x & 0xFF) as u8,
            ((x >> 8) & 0x0F) as u8 | ((y & 0x0F) << 4) as u8,
            (y >> 4) as u8,
        ]
    }

    fn usb_report(main: (u16, u16), c: (u16, u16)) -> Vec<u8> {
        let mut report = vec![0u8; ReportVariant::Usb.report_len()];
        report[6..9].copy_from_slice(&pack_stick(main.0, main.1));
        report[9..12].copy_from_slice(&pack_stick(c.0, c.1));
        report
    }

    #[test]
    fn stick_packing_round_trips() {
        let samples = [
            (0, 0),
            (1, 4094),
            (0xABC, 0x123),
            (2048, 2048),
            (AXIS_MAX, 0),
            (0, AXIS_MAX),
            (AXIS_MAX, AXIS_MAX),
        ];
        for (x, y) in samples {
            let bytes = pack_stick(x, y);
            assert_eq!(unpack_stick(bytes[0], bytes[1], bytes[2]), StickRaw { x, y });
        }
    }

    #[test]
    fn decodes_usb_sticks_and_triggers() {
        let mut report = usb_report((0xABC, 0x123), (2048, 2048));
        report[13] = 200;
        report[14] = 17;

        let frame = decode(ReportVariant::Usb, &report).unwrap();
        assert_eq!(frame.main, StickRaw { x: 0xABC, y: 0x123 });
        assert_eq!(frame.c_stick, StickRaw { x: 2048, y: 2048 });
        assert_eq!(frame.trigger_l, 200);
        assert_eq!(frame.trigger_r, 17);
        assert!(frame.buttons.is_empty());
    }

    #[test]
    fn decodes_usb_buttons() {
        let mut report = usb_report((2048, 2048), (2048, 2048));
        report[3] = 0x02 | 0x40; // A + Start
        report[4] = 0x08 | 0x20; // DpadUp + ZL
        report[5] = 0x01; // Home

        let frame = decode(ReportVariant::Usb, &report).unwrap();
        let pressed: Vec<Button> = frame.buttons.iter().collect();
        assert_eq!(
            pressed,
            vec![
                Button::A,
                Button::Start,
                Button::DpadUp,
                Button::Zl,
                Button::Home
            ]
        );
        assert!(!frame.buttons.contains(Button::B));
    }

    #[test]
    fn decodes_ble_offsets() {
        let mut report = vec![0u8; ReportVariant::Ble.report_len()];
        report[2] = 0x01; // B
        report[5..8].copy_from_slice(&pack_stick(100, 200));
        report[8..11].copy_from_slice(&pack_stick(300, 400));
        report[12] = 55;
        report[13] = 66;

        let frame = decode(ReportVariant::Ble, &report).unwrap();
        assert!(frame.buttons.contains(Button::B));
        assert_eq!(frame.main, StickRaw { x: 100, y: 200 });
        assert_eq!(frame.c_stick, StickRaw { x: 300, y: 400 });
        assert_eq!(frame.trigger_l, 55);
        assert_eq!(frame.trigger_r, 66);
    }

    #[test]
    fn ble_digital_trigger_fallback() {
        let mut report = vec![0u8; ReportVariant::Ble.report_len()];
        report[2] = 0x20; // Z
        report[3] = 0x20; // ZL

        let frame = decode(ReportVariant::Ble, &report).unwrap();
        assert_eq!(frame.trigger_l, 255);
        assert_eq!(frame.trigger_r, 255);
    }

    #[test]
    fn rejects_wrong_length() {
        let report = vec![0u8; 12];
        let err = decode(ReportVariant::Usb, &report).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedReport {
                expected: 64,
                actual: 12,
                ..
            }
        ));

        let report = vec![0u8; 64];
        assert!(decode(ReportVariant::Ble, &report).is_err());
    }
}
