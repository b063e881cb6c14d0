use crate::error::{Result, RingError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Structured frame size in bytes
pub const FRAME_SIZE: usize = 16;

/// Maximum payload carried by a structured frame
pub const MAX_PAYLOAD_SIZE: usize = 13;

/// Offset of the first payload byte in a structured frame
pub const PAYLOAD_OFFSET: usize = 2;

/// Header byte of vendor structured frames, in both directions
pub const STRUCTURED_HEADER: u8 = 0xEF;

/// Leading byte of the compact heart-rate dialect
pub const COMPACT_HEART_RATE_TAG: u8 = 0x01;

/// Leading byte of the compact blood-oxygen dialect
pub const COMPACT_BLOOD_OXYGEN_TAG: u8 = 0x02;

/// Mode byte asking the ring to stream a measurement continuously
pub const MODE_CONTINUOUS: u8 = 0x01;

/// Mode byte asking the ring for a single measurement
pub const MODE_MANUAL: u8 = 0x02;

/// Standard heart-rate control point value that starts a measurement
pub const CONTROL_POINT_START: [u8; 1] = [0x01];

/// Single-byte heart-rate trigger honored by older firmware
pub const LEGACY_HEART_RATE_TRIGGER: [u8; 1] = [0x69];

/// Single-byte blood-oxygen trigger honored by older firmware
pub const LEGACY_BLOOD_OXYGEN_TRIGGER: [u8; 1] = [0x6B];

/// Standard Heart Rate service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Control Point characteristic (0x2A39)
pub const HEART_RATE_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a39_0000_1000_8000_0080_5f9b_34fb);

/// Standard Battery service (0x180F)
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);

/// Battery Level characteristic (0x2A19)
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

/// Primary vendor service, a Nordic UART variant
pub const VENDOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_fff0_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Vendor data characteristic (ring to app notifications)
pub const VENDOR_DATA_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Vendor command characteristic (app to ring writes)
pub const VENDOR_COMMAND_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Secondary vendor service used by newer firmware for bulk telemetry
pub const SECONDARY_SERVICE_UUID: Uuid = Uuid::from_u128(0xde5b_f728_d711_4e47_af26_65e3_012a_5dc7);

/// Secondary vendor data characteristic
pub const SECONDARY_DATA_UUID: Uuid = Uuid::from_u128(0xde5b_f729_d711_4e47_af26_65e3_012a_5dc7);

/// A notifiable, readable or writable endpoint: service plus characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    /// Service UUID
    pub service: Uuid,
    /// Characteristic UUID
    pub characteristic: Uuid,
}

impl Channel {
    /// Standard heart-rate notifications
    pub const HEART_RATE_MEASUREMENT: Self =
        Self::new(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID);
    /// Standard heart-rate control point
    pub const HEART_RATE_CONTROL_POINT: Self =
        Self::new(HEART_RATE_SERVICE_UUID, HEART_RATE_CONTROL_POINT_UUID);
    /// Standard battery level
    pub const BATTERY_LEVEL: Self = Self::new(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID);
    /// Proprietary telemetry
    pub const VENDOR_DATA: Self = Self::new(VENDOR_SERVICE_UUID, VENDOR_DATA_UUID);
    /// Structured and raw command sink
    pub const VENDOR_COMMAND: Self = Self::new(VENDOR_SERVICE_UUID, VENDOR_COMMAND_UUID);
    /// Secondary proprietary telemetry path
    pub const SECONDARY_DATA: Self = Self::new(SECONDARY_SERVICE_UUID, SECONDARY_DATA_UUID);

    /// Create a channel from its UUIDs
    #[must_use]
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Opcodes of the vendor structured protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Enable or disable streaming of measurement data
    DataTransfer = 0x01,
    /// Heart-rate capture; also tags heart-rate frames sent by the ring
    HeartRate = 0x02,
    /// Blood-oxygen capture; also tags blood-oxygen frames sent by the ring
    BloodOxygen = 0x03,
}

impl Opcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::DataTransfer),
            0x02 => Some(Self::HeartRate),
            0x03 => Some(Self::BloodOxygen),
            _ => None,
        }
    }
}

/// 8-bit truncated sum of `bytes`
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A command ready to be written to the ring
///
/// Structured frames are always [`FRAME_SIZE`] bytes:
/// - Byte 0: header
/// - Byte 1: opcode
/// - Bytes 2-14: payload, zero filled
/// - Byte 15: truncated sum of bytes 0-14
///
/// Raw frames are short legacy trigger sequences written verbatim, without
/// header or checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPacket {
    /// 16-byte header/opcode/payload/checksum frame
    Structured(Bytes),
    /// Legacy passthrough frame
    Raw(Bytes),
}

impl CommandPacket {
    /// Build a structured frame
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidParameters`] if `payload` is longer than
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn structured(header: u8, opcode: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RingError::InvalidParameters(format!(
                "Payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        buf.put_u8(header);
        buf.put_u8(opcode);
        buf.extend_from_slice(payload);
        buf.resize(FRAME_SIZE - 1, 0);

        let sum = checksum(&buf);
        buf.put_u8(sum);

        Ok(Self::Structured(buf.freeze()))
    }

    /// Build a vendor command with the standard header
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidParameters`] if `payload` is too long.
    pub fn vendor(opcode: Opcode, payload: &[u8]) -> Result<Self> {
        Self::structured(STRUCTURED_HEADER, opcode as u8, payload)
    }

    /// Wrap legacy bytes without framing
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self::Raw(bytes.into())
    }

    /// Wire bytes of this packet
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Structured(bytes) | Self::Raw(bytes) => bytes,
        }
    }

    /// Whether this packet is a checksummed structured frame
    #[must_use]
    pub const fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }

    /// Parse and verify a structured frame
    ///
    /// # Errors
    ///
    /// Returns [`RingError::MalformedTelemetry`] if the frame has the wrong
    /// length or its checksum does not match.
    pub fn parse_structured(data: &[u8]) -> Result<StructuredFrame> {
        if data.len() != FRAME_SIZE {
            return Err(RingError::MalformedTelemetry(format!(
                "Frame is {} bytes, expected {FRAME_SIZE}",
                data.len()
            )));
        }

        let expected = checksum(&data[..FRAME_SIZE - 1]);
        let actual = data[FRAME_SIZE - 1];
        if expected != actual {
            return Err(RingError::MalformedTelemetry(format!(
                "Checksum mismatch: computed {expected:02X}, frame carries {actual:02X}"
            )));
        }

        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        payload.copy_from_slice(&data[PAYLOAD_OFFSET..FRAME_SIZE - 1]);

        Ok(StructuredFrame {
            header: data[0],
            opcode: data[1],
            payload,
        })
    }
}

/// Fields of a verified structured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredFrame {
    /// Header byte
    pub header: u8,
    /// Opcode byte
    pub opcode: u8,
    /// Zero-filled payload
    pub payload: [u8; MAX_PAYLOAD_SIZE],
}

/// Encode bytes with the standard base64 alphabet
///
/// Some platform bridges only carry characteristic values as text.
#[must_use]
pub fn encode_binary(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode standard base64 text
///
/// # Errors
///
/// Returns [`RingError::Codec`] on malformed input; partial output is never
/// returned.
pub fn decode_binary(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| RingError::Codec(format!("Invalid base64 payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_structured_frame_layout() {
        let packet = CommandPacket::vendor(Opcode::HeartRate, &[MODE_CONTINUOUS]).unwrap();
        let bytes = packet.as_bytes();

        assert_eq!(bytes.len(), FRAME_SIZE);
        assert_eq!(bytes[0], STRUCTURED_HEADER);
        assert_eq!(bytes[1], Opcode::HeartRate as u8);
        assert_eq!(bytes[2], MODE_CONTINUOUS);
        assert!(bytes[3..15].iter().all(|b| *b == 0));
        assert_eq!(bytes[15], 0xEF_u8.wrapping_add(0x02).wrapping_add(0x01));
    }

    #[test]
    fn test_empty_payload_frame() {
        let packet = CommandPacket::structured(0x10, 0x20, &[]).unwrap();
        assert_eq!(packet.as_bytes().len(), FRAME_SIZE);
        assert_eq!(packet.as_bytes()[15], 0x30);
        assert!(packet.is_structured());
    }

    #[test]
    fn test_payload_too_long_rejected() {
        let result = CommandPacket::structured(STRUCTURED_HEADER, 0x01, &[0u8; 14]);
        assert!(matches!(result, Err(RingError::InvalidParameters(_))));
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_raw_packet_passthrough() {
        let packet = CommandPacket::raw(LEGACY_HEART_RATE_TRIGGER.to_vec());
        assert_eq!(packet.as_bytes(), &LEGACY_HEART_RATE_TRIGGER);
        assert!(!packet.is_structured());
    }

    #[test]
    fn test_parse_structured_rejects_bad_checksum() {
        let packet = CommandPacket::vendor(Opcode::BloodOxygen, &[MODE_MANUAL]).unwrap();
        let mut bytes = packet.as_bytes().to_vec();

        let frame = CommandPacket::parse_structured(&bytes).unwrap();
        assert_eq!(Opcode::from_u8(frame.opcode), Some(Opcode::BloodOxygen));
        assert_eq!(frame.payload[0], MODE_MANUAL);

        bytes[15] = bytes[15].wrapping_add(1);
        assert!(CommandPacket::parse_structured(&bytes).is_err());
        assert!(CommandPacket::parse_structured(&bytes[..10]).is_err());
    }

    #[test]
    fn test_binary_codec() {
        assert_eq!(encode_binary(&[0x01, 0x48, 0x32, 0x00]), "AUgyAA==");
        assert_eq!(decode_binary("AUgyAA==").unwrap(), vec![0x01, 0x48, 0x32, 0x00]);
        assert!(matches!(decode_binary("AUg*AA=="), Err(RingError::Codec(_))));
        assert!(decode_binary("AUgyA").is_err());
    }

    #[test]
    fn test_channel_uuids() {
        assert_eq!(
            HEART_RATE_MEASUREMENT_UUID.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            VENDOR_SERVICE_UUID.to_string(),
            "6e40fff0-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(Channel::VENDOR_COMMAND.service, Channel::VENDOR_DATA.service);
    }

    proptest! {
        #[test]
        fn structured_frames_are_sixteen_bytes_with_valid_checksum(
            header in any::<u8>(),
            opcode in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE),
        ) {
            let packet = CommandPacket::structured(header, opcode, &payload).unwrap();
            let bytes = packet.as_bytes();
            prop_assert_eq!(bytes.len(), FRAME_SIZE);
            prop_assert_eq!(bytes[15], checksum(&bytes[..15]));
            prop_assert_eq!(&bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()], &payload[..]);
        }
    }
}
