//! Ring GATT layout and command framing
//!
//! Rings speak fixed 16-byte frames over a UART-style service: one opcode byte,
//! up to 14 payload bytes (zero padded) and a trailing checksum that is the sum
//! of the first 15 bytes modulo 256. A response echoes the request opcode; the
//! opcode with its high bit set marks a rejected request.

use std::collections::BTreeMap;

use ringlink_core::{CommandKind, DeviceCommand};
use uuid::Uuid;

use crate::error::BleRadioError;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Ring vendor service UUID
pub const RING_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E40FFF0_B5A3_F393_E0A9_E50E24DCCA9E);

/// Characteristic commands are written to
pub const RING_WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Characteristic responses are notified on
pub const RING_NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

// ----------------------------------------------------------------------------
// Status Codes
// ----------------------------------------------------------------------------

/// Generic GATT failure
pub const STATUS_GATT_ERROR: i32 = 133;
/// Link supervision timeout; reported for unsolicited disconnects
pub const STATUS_LINK_LOST: i32 = 8;
pub const STATUS_NOT_CONNECTED: i32 = 0x101;
pub const STATUS_NOT_FOUND: i32 = 0x102;
pub const STATUS_NO_CHARACTERISTIC: i32 = 0x103;
pub const STATUS_TIMEOUT: i32 = 0x104;
pub const STATUS_BAD_FRAME: i32 = 0x105;
pub const STATUS_REJECTED: i32 = 0x106;
pub const STATUS_PERMISSION_DENIED: i32 = 0x107;

// ----------------------------------------------------------------------------
// Command Frames
// ----------------------------------------------------------------------------

pub const FRAME_LEN: usize = 16;
pub const MAX_FRAME_PAYLOAD: usize = FRAME_LEN - 2;

/// Opcode that makes the ring vibrate
pub const CMD_FIND_DEVICE: u8 = 0x50;
const FIND_DEVICE_PAYLOAD: [u8; 2] = [0x55, 0xAA];

/// Error flag set on the opcode of a rejected response
pub const RESPONSE_ERROR_FLAG: u8 = 0x80;

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Build a frame for `opcode` carrying `payload`
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Result<[u8; FRAME_LEN], BleRadioError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(BleRadioError::PayloadTooLarge {
            size: payload.len(),
            max_size: MAX_FRAME_PAYLOAD,
        });
    }
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = opcode;
    frame[1..1 + payload.len()].copy_from_slice(payload);
    frame[FRAME_LEN - 1] = checksum(&frame[..FRAME_LEN - 1]);
    Ok(frame)
}

/// Split a received frame into opcode and payload; `None` if malformed
pub fn decode_frame(bytes: &[u8]) -> Option<(u8, &[u8])> {
    if bytes.len() != FRAME_LEN {
        return None;
    }
    if checksum(&bytes[..FRAME_LEN - 1]) != bytes[FRAME_LEN - 1] {
        return None;
    }
    Some((bytes[0], &bytes[1..FRAME_LEN - 1]))
}

/// Opcode and payload for an engine command
///
/// Custom commands carry their opcode as the first payload byte.
pub fn command_frame(command: &DeviceCommand) -> Result<(u8, Vec<u8>), BleRadioError> {
    match &command.kind {
        CommandKind::Locate => Ok((CMD_FIND_DEVICE, FIND_DEVICE_PAYLOAD.to_vec())),
        CommandKind::Custom(name) => command
            .payload
            .split_first()
            .map(|(opcode, rest)| (*opcode, rest.to_vec()))
            .ok_or_else(|| BleRadioError::EmptyCommand { name: name.clone() }),
    }
}

// ----------------------------------------------------------------------------
// Advertisement Data
// ----------------------------------------------------------------------------

const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
const AD_TYPE_MANUFACTURER: u8 = 0xFF;

fn push_ad(out: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    // Length byte covers the type byte; oversize structures are dropped
    if data.len() < usize::from(u8::MAX) {
        out.push(data.len() as u8 + 1);
        out.push(ad_type);
        out.extend_from_slice(data);
    }
}

/// Reassemble advertisement bytes from the fields the host stack parsed out
pub fn advertisement_bytes(name: Option<&str>, manufacturer: &BTreeMap<u16, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(name) = name {
        push_ad(&mut out, AD_TYPE_COMPLETE_NAME, name.as_bytes());
    }
    for (company, data) in manufacturer {
        let mut body = company.to_le_bytes().to_vec();
        body.extend_from_slice(data);
        push_ad(&mut out, AD_TYPE_MANUFACTURER, &body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_device_frame() {
        let (opcode, payload) = command_frame(&DeviceCommand::locate()).unwrap();
        let frame = encode_frame(opcode, &payload).unwrap();
        assert_eq!(
            hex::encode_upper(frame),
            "5055AA0000000000000000000000004F"
        );
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let mut frame = encode_frame(0x03, &[0x01]).unwrap();
        assert_eq!(decode_frame(&frame), Some((0x03, &frame[1..15])));
        frame[15] ^= 0x01;
        assert_eq!(decode_frame(&frame), None);
        assert_eq!(decode_frame(&frame[..8]), None);
    }

    #[test]
    fn test_payload_limit() {
        assert!(encode_frame(0x01, &[0; MAX_FRAME_PAYLOAD]).is_ok());
        assert!(matches!(
            encode_frame(0x01, &[0; MAX_FRAME_PAYLOAD + 1]),
            Err(BleRadioError::PayloadTooLarge { size: 15, .. })
        ));
    }

    #[test]
    fn test_custom_command_needs_opcode() {
        let command = DeviceCommand::new(CommandKind::Custom("battery".into()), vec![0x03]);
        assert_eq!(command_frame(&command).unwrap(), (0x03, Vec::new()));

        let empty = DeviceCommand::new(CommandKind::Custom("battery".into()), Vec::new());
        assert!(command_frame(&empty).is_err());
    }

    #[test]
    fn test_advertisement_bytes() {
        let mut manufacturer = BTreeMap::new();
        manufacturer.insert(0x0059, vec![0x01, 0x02]);
        let raw = advertisement_bytes(Some("R02"), &manufacturer);
        assert_eq!(hex::encode_upper(raw), "040952303205FF59000102");
    }
}
