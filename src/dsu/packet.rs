//! DSU wire format.
//!
//! Every packet starts with a 16-byte header: 4 magic bytes (`DSUS` from the
//! server, `DSUC` from clients), u16 protocol version (1001), u16 payload
//! length counting everything after the header (message type included), u32
//! CRC32 computed over the whole packet with the CRC field zeroed, and a u32
//! sender id. The u32 message type follows the header. All integers are
//! little-endian. Emulator compatibility depends on reproducing this layout
//! byte for byte.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::controller::pipeline::ControllerState;
use crate::controller::decoder::Button;

pub const MAGIC_SERVER: &[u8; 4] = b"DSUS";
pub const MAGIC_CLIENT: &[u8; 4] = b"DSUC";

pub const PROTOCOL_VERSION: u16 = 1001;

pub const MSG_VERSION: u32 = 0x0010_0000;
pub const MSG_PORT_INFO: u32 = 0x0010_0001;
pub const MSG_PAD_DATA: u32 = 0x0010_0002;

/// Magic through sender id; the message type sits just past it.
pub const HEADER_LEN: usize = 16;

pub const VERSION_RESPONSE_LEN: usize = 24;
pub const PORT_INFO_RESPONSE_LEN: usize = 32;
pub const PAD_DATA_PACKET_LEN: usize = 100;

const MODEL_FULL_GYRO: u8 = 0x02;
const BATTERY_FULL: u8 = 0x05;

#[derive(Debug, Error)]
pub enum DsuProtocolError {
    #[error("packet too short ({0} bytes)")]
    Truncated(usize),

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported protocol version {0}")]
    BadVersion(u16),

    #[error("unknown message type {0:#010x}")]
    UnknownType(u32),
}

/// Which pads a data request subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationTarget {
    AllSlots,
    Slot(u8),
    Mac([u8; 6]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Version,
    PortInfo { slots: Vec<u8> },
    PadData { target: RegistrationTarget },
}

/// Parses one inbound client packet. Anything that does not parse is dropped
/// by the caller without touching existing subscriptions.
pub fn parse_request(data: &[u8]) -> Result<ClientRequest, DsuProtocolError> {
    if data.len() < HEADER_LEN + 4 {
        return Err(DsuProtocolError::Truncated(data.len()));
    }
    if &data[0..4] != MAGIC_CLIENT {
        return Err(DsuProtocolError::BadMagic);
    }
    let version = LittleEndian::read_u16(&data[4..6]);
    if version != PROTOCOL_VERSION {
        return Err(DsuProtocolError::BadVersion(version));
    }

    let msg_type = LittleEndian::read_u32(&data[16..20]);
    match msg_type {
        MSG_VERSION => Ok(ClientRequest::Version),
        MSG_PORT_INFO => {
            if data.len() < 24 {
                return Err(DsuProtocolError::Truncated(data.len()));
            }
            let count = LittleEndian::read_i32(&data[20..24]).clamp(0, 4) as usize;
            if data.len() < 24 + count {
                return Err(DsuProtocolError::Truncated(data.len()));
            }
            Ok(ClientRequest::PortInfo {
                slots: data[24..24 + count].to_vec(),
            })
        }
        MSG_PAD_DATA => {
            if data.len() < 28 {
                return Err(DsuProtocolError::Truncated(data.len()));
            }
            let flags = data[20];
            let slot = data[21];
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&data[22..28]);
            let target = if flags == 0 {
                RegistrationTarget::AllSlots
            } else if flags & 0x01 != 0 {
                RegistrationTarget::Slot(slot)
            } else {
                RegistrationTarget::Mac(mac)
            };
            Ok(ClientRequest::PadData { target })
        }
        other => Err(DsuProtocolError::UnknownType(other)),
    }
}

/// Per-slot metadata carried in port-info and pad-data packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PadMeta {
    pub slot: u8,
    pub connected: bool,
    /// DSU connection type: 1 = USB, 2 = Bluetooth, 0 = none.
    pub connection: u8,
    pub mac: [u8; 6],
}

impl PadMeta {
    pub fn for_slot(slot: u8, connected: bool, connection: u8) -> Self {
        Self {
            slot,
            connected,
            connection,
            // Synthetic but stable per slot; clients use it as an identity.
            mac: [0x00, 0x11, 0x22, 0x33, 0x44, slot],
        }
    }
}

fn write_header(packet: &mut [u8], server_id: u32, msg_type: u32) {
    packet[0..4].copy_from_slice(MAGIC_SERVER);
    LittleEndian::write_u16(&mut packet[4..6], PROTOCOL_VERSION);
    let payload_len = (packet.len() - HEADER_LEN) as u16;
    LittleEndian::write_u16(&mut packet[6..8], payload_len);
    LittleEndian::write_u32(&mut packet[12..16], server_id);
    LittleEndian::write_u32(&mut packet[16..20], msg_type);
}

/// The CRC field is still zero when this runs, which is exactly the state the
/// checksum must be computed over.
fn finalize_crc(packet: &mut [u8]) {
    let crc = crc32fast::hash(packet);
    LittleEndian::write_u32(&mut packet[8..12], crc);
}

/// Recomputes a packet's checksum and compares it against the stored field.
pub fn checksum_matches(data: &[u8]) -> bool {
    if data.len() < HEADER_LEN {
        return false;
    }
    let stored = LittleEndian::read_u32(&data[8..12]);
    let mut copy = data.to_vec();
    copy[8..12].fill(0);
    crc32fast::hash(&copy) == stored
}

pub fn version_response(server_id: u32) -> Vec<u8> {
    let mut packet = vec![0u8; VERSION_RESPONSE_LEN];
    write_header(&mut packet, server_id, MSG_VERSION);
    LittleEndian::write_u16(&mut packet[20..22], PROTOCOL_VERSION);
    finalize_crc(&mut packet);
    packet
}

fn write_pad_block(packet: &mut [u8], meta: &PadMeta) {
    packet[20] = meta.slot;
    packet[21] = if meta.connected { 2 } else { 0 };
    packet[22] = MODEL_FULL_GYRO;
    packet[23] = meta.connection;
    packet[24..30].copy_from_slice(&meta.mac);
    packet[30] = if meta.connected { BATTERY_FULL } else { 0 };
}

pub fn port_info_response(server_id: u32, meta: &PadMeta) -> Vec<u8> {
    let mut packet = vec![0u8; PORT_INFO_RESPONSE_LEN];
    write_header(&mut packet, server_id, MSG_PORT_INFO);
    write_pad_block(&mut packet, meta);
    finalize_crc(&mut packet);
    packet
}

pub fn pad_data_packet(
    server_id: u32,
    meta: &PadMeta,
    state: &ControllerState,
    counter: u32,
) -> Vec<u8> {
    let mut packet = vec![0u8; PAD_DATA_PACKET_LEN];
    write_header(&mut packet, server_id, MSG_PAD_DATA);
    write_pad_block(&mut packet, meta);
    packet[31] = 1; // active
    LittleEndian::write_u32(&mut packet[32..36], counter);

    let buttons = state.buttons;
    let mut dpad_byte = 0u8;
    if buttons.contains(Button::DpadLeft) {
        dpad_byte |= 0x01;
    }
    if buttons.contains(Button::DpadDown) {
        dpad_byte |= 0x02;
    }
    if buttons.contains(Button::DpadRight) {
        dpad_byte |= 0x04;
    }
    if buttons.contains(Button::DpadUp) {
        dpad_byte |= 0x08;
    }
    if buttons.contains(Button::Start) {
        dpad_byte |= 0x10; // Options
    }

    // GameCube face/shoulder buttons on the DualShock bit positions.
    let mut face_byte = 0u8;
    if buttons.contains(Button::Z) {
        face_byte |= 0x01; // R2
    }
    if buttons.contains(Button::Zl) {
        face_byte |= 0x02; // L2
    }
    if buttons.contains(Button::L) {
        face_byte |= 0x04; // L1
    }
    if buttons.contains(Button::R) {
        face_byte |= 0x08; // R1
    }
    if buttons.contains(Button::X) {
        face_byte |= 0x10; // Square
    }
    if buttons.contains(Button::A) {
        face_byte |= 0x20; // Cross
    }
    if buttons.contains(Button::B) {
        face_byte |= 0x40; // Circle
    }
    if buttons.contains(Button::Y) {
        face_byte |= 0x80; // Triangle
    }

    packet[36] = dpad_byte;
    packet[37] = face_byte;
    packet[38] = if buttons.contains(Button::Home) { 0x01 } else { 0 };
    packet[39] = 0; // touch button

    packet[40] = stick_to_byte(state.main_x);
    packet[41] = stick_to_byte(-(state.main_y as i32) as i16); // DSU Y grows downward
    packet[42] = stick_to_byte(state.c_x);
    packet[43] = stick_to_byte(-(state.c_y as i32) as i16);

    packet[54] = state.trigger_l;
    packet[55] = state.trigger_r;

    finalize_crc(&mut packet);
    packet
}

/// Maps a centered axis (≈ -2048..2047) to the protocol's 128-centered byte.
/// The divisor leaves headroom so worn sticks still reach the rim.
fn stick_to_byte(value: i16) -> u8 {
    let normalized = (value as f64 / 2000.0).clamp(-1.0, 1.0);
    (normalized * 127.0 + 128.0) as u8
}

/// Builds a client-side request packet; shared by the protocol and server
/// tests, which stand in for a real DSU client.
#[cfg(test)]
pub(crate) fn encode_client_request(msg_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; HEADER_LEN + 4 + payload.len()];
    packet[0..4].copy_from_slice(MAGIC_CLIENT);
    LittleEndian::write_u16(&mut packet[4..6], PROTOCOL_VERSION);
    LittleEndian::write_u16(&mut packet[6..8], (4 + payload.len()) as u16);
    LittleEndian::write_u32(&mut packet[16..20], msg_type);
    packet[20..].copy_from_slice(payload);
    packet
}
