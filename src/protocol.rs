use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{PuckError, Result};

/// Maximum bytes per characteristic write for this class of device
pub const MAX_WRITE_SIZE: usize = 20;

/// Maximum payload bytes after the leading tag byte
pub const MAX_PAYLOAD_SIZE: usize = MAX_WRITE_SIZE - 1;

/// A raw inbound packet: one tag byte plus whatever followed it
///
/// Decoding is deliberately minimal. Semantic interpretation (including
/// checksum handling) belongs to [`ProtocolProfile::classify`], because tag
/// values differ between firmware revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Type tag, always the first byte on the wire
    pub tag: u8,
    /// Remaining bytes, 0..=19
    pub payload: Vec<u8>,
}

impl Packet {
    /// Split a notification value into tag and payload
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::EmptyPacket`] for zero-length input. Any other
    /// byte sequence decodes successfully.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        match data.split_first() {
            Some((&tag, payload)) => Ok(Self {
                tag,
                payload: payload.to_vec(),
            }),
            None => Err(PuckError::EmptyPacket),
        }
    }
}

/// Outbound commands understood by the Puck firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Initial handshake sent right after notification subscription
    Handshake,
    /// Ask the device to report its current status
    StatusRequest,
    /// Begin a workout session
    StartSession,
    /// End the current workout session
    EndSession,
    /// Run the on-device calibration routine
    Calibrate,
    /// Reset the rep counter to zero
    ResetReps,
    /// Acknowledge an NFC-detected event
    NfcAck,
}

/// How the firmware encodes the rep count payload
///
/// Some firmware revisions send a single byte (capped at 255), others send a
/// two-byte big-endian count. The width is a profile parameter because both
/// forms exist in the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepCountWidth {
    /// One byte, 0-255
    Single,
    /// Two bytes, big-endian
    DoubleBe,
}

/// Inbound tag byte assignments for one firmware family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMap {
    /// Rep count update
    pub rep_count: u8,
    /// Handshake / initial status response
    pub handshake: u8,
    /// Session active/idle status
    pub session_status: u8,
    /// Heartbeat with battery level
    pub heartbeat: u8,
    /// Device-reported error code
    pub device_error: u8,
    /// Device noticed an NFC tap
    pub nfc_detected: u8,
    /// Device-initiated auto-connect signal
    pub auto_connect: u8,
    /// Device acknowledged our NFC ack
    pub nfc_ack: u8,
    /// Device acknowledged a rep counter reset
    pub rep_reset: u8,
}

/// Outbound command tag assignments for one firmware family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMap {
    /// [`Command::Handshake`]
    pub handshake: u8,
    /// [`Command::StatusRequest`]
    pub status_request: u8,
    /// [`Command::StartSession`]
    pub start_session: u8,
    /// [`Command::EndSession`]
    pub end_session: u8,
    /// [`Command::Calibrate`]
    pub calibrate: u8,
    /// [`Command::ResetReps`]
    pub reset_reps: u8,
    /// [`Command::NfcAck`]
    pub nfc_ack: u8,
}

impl CommandMap {
    /// Tag byte for a command under this map
    #[must_use]
    pub const fn tag_for(&self, command: Command) -> u8 {
        match command {
            Command::Handshake => self.handshake,
            Command::StatusRequest => self.status_request,
            Command::StartSession => self.start_session,
            Command::EndSession => self.end_session,
            Command::Calibrate => self.calibrate,
            Command::ResetReps => self.reset_reps,
            Command::NfcAck => self.nfc_ack,
        }
    }
}

/// Per-deployment wire protocol description
///
/// Firmware revisions in the field disagree on tag byte values, rep count
/// width, and whether a trailing additive checksum is present. A profile is
/// chosen at connection time instead of hard-coding one dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolProfile {
    /// Inbound tag assignments
    pub tags: TagMap,
    /// Outbound command tag assignments
    pub commands: CommandMap,
    /// Rep count payload width
    pub rep_count_width: RepCountWidth,
    /// Whether every frame carries a trailing sum-checksum byte
    pub trailing_checksum: bool,
}

/// Inbound packets after semantic classification
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Rep count update
    RepCount(u32),
    /// Handshake / initial status response
    Handshake {
        /// Firmware revision byte
        firmware_revision: u8,
        /// Whether the device considers itself calibrated
        calibrated: bool,
    },
    /// Session became active or idle
    SessionStatus {
        /// `true` while a workout session is running
        active: bool,
    },
    /// Periodic heartbeat
    Heartbeat {
        /// Battery level as a fraction, 0.0-1.0
        battery_level: f32,
    },
    /// Device-reported error
    DeviceError {
        /// Firmware-defined error code
        code: u8,
    },
    /// Device noticed an NFC tap
    NfcDetected,
    /// Device asks the host to treat this as a connection trigger
    AutoConnect,
    /// Device acknowledged our NFC ack
    NfcAck,
    /// Device acknowledged a rep counter reset; a lower count may follow
    RepReset,
    /// Tag not present in the active profile; logged and ignored upstream
    Unknown {
        /// Raw tag byte
        tag: u8,
        /// Raw payload
        payload: Vec<u8>,
    },
}

impl ProtocolProfile {
    /// Current production tag assignments
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            tags: TagMap {
                rep_count: 0x01,
                handshake: 0x02,
                session_status: 0x03,
                heartbeat: 0x04,
                device_error: 0x05,
                nfc_detected: 0x06,
                auto_connect: 0x07,
                nfc_ack: 0x08,
                rep_reset: 0x09,
            },
            commands: CommandMap {
                handshake: 0x10,
                status_request: 0x11,
                start_session: 0x12,
                end_session: 0x13,
                calibrate: 0x14,
                reset_reps: 0x15,
                nfc_ack: 0x16,
            },
            rep_count_width: RepCountWidth::Single,
            trailing_checksum: false,
        }
    }

    /// Tag assignments used by first-generation Pucks
    ///
    /// The early firmware numbers tags from zero and already sends two-byte
    /// counts, which the one-byte revisions later dropped.
    #[must_use]
    pub const fn legacy() -> Self {
        Self {
            tags: TagMap {
                rep_count: 0x00,
                handshake: 0x01,
                session_status: 0x02,
                heartbeat: 0x03,
                device_error: 0x04,
                nfc_detected: 0x05,
                auto_connect: 0x06,
                nfc_ack: 0x07,
                rep_reset: 0x08,
            },
            commands: CommandMap {
                handshake: 0x20,
                status_request: 0x21,
                start_session: 0x22,
                end_session: 0x23,
                calibrate: 0x24,
                reset_reps: 0x25,
                nfc_ack: 0x26,
            },
            rep_count_width: RepCountWidth::DoubleBe,
            trailing_checksum: false,
        }
    }

    /// Override the rep count payload width
    #[must_use]
    pub const fn with_rep_count_width(mut self, width: RepCountWidth) -> Self {
        self.rep_count_width = width;
        self
    }

    /// Enable or disable the trailing sum-checksum variant
    #[must_use]
    pub const fn with_trailing_checksum(mut self, enabled: bool) -> Self {
        self.trailing_checksum = enabled;
        self
    }

    /// Largest payload an outbound command may carry under this profile
    #[must_use]
    pub const fn max_payload(&self) -> usize {
        if self.trailing_checksum {
            MAX_PAYLOAD_SIZE - 1
        } else {
            MAX_PAYLOAD_SIZE
        }
    }

    /// Encode an outbound command frame
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::PayloadTooLarge`] if the payload does not fit in
    /// a single characteristic write. That is a caller programming error, not
    /// a runtime condition.
    pub fn encode(&self, command: Command, payload: &[u8]) -> Result<Bytes> {
        let max = self.max_payload();
        if payload.len() > max {
            return Err(PuckError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let tag = self.commands.tag_for(command);
        let mut buf = BytesMut::with_capacity(1 + payload.len() + 1);
        buf.put_u8(tag);
        buf.extend_from_slice(payload);
        if self.trailing_checksum {
            buf.put_u8(checksum(tag, payload));
        }
        Ok(buf.freeze())
    }

    /// Classify a raw packet under this profile
    ///
    /// Unknown tags are not errors: they classify to [`InboundEvent::Unknown`]
    /// so callers can log and move on. Malformed payloads for known tags are
    /// treated the same way.
    ///
    /// # Errors
    ///
    /// Returns [`PuckError::ChecksumMismatch`] when the checksum variant is
    /// active and verification fails; the packet should be dropped.
    pub fn classify(&self, packet: &Packet) -> Result<InboundEvent> {
        let payload: &[u8] = if self.trailing_checksum {
            match packet.payload.split_last() {
                Some((&received, body)) => {
                    let computed = checksum(packet.tag, body);
                    if computed != received {
                        return Err(PuckError::ChecksumMismatch { computed, received });
                    }
                    body
                }
                // Tag-only frame: nothing to verify, tolerate it.
                None => &[],
            }
        } else {
            &packet.payload
        };

        let tags = &self.tags;
        let event = if packet.tag == tags.rep_count {
            match self.parse_rep_count(payload) {
                Some(count) => InboundEvent::RepCount(count),
                None => self.unknown(packet),
            }
        } else if packet.tag == tags.handshake {
            InboundEvent::Handshake {
                firmware_revision: payload.first().copied().unwrap_or(0),
                calibrated: payload.get(1).is_some_and(|flags| flags & 0x01 != 0),
            }
        } else if packet.tag == tags.session_status {
            InboundEvent::SessionStatus {
                active: payload.first().is_some_and(|&b| b != 0),
            }
        } else if packet.tag == tags.heartbeat {
            let percent = payload.first().copied().unwrap_or(0).min(100);
            InboundEvent::Heartbeat {
                battery_level: f32::from(percent) / 100.0,
            }
        } else if packet.tag == tags.device_error {
            InboundEvent::DeviceError {
                code: payload.first().copied().unwrap_or(0),
            }
        } else if packet.tag == tags.nfc_detected {
            InboundEvent::NfcDetected
        } else if packet.tag == tags.auto_connect {
            InboundEvent::AutoConnect
        } else if packet.tag == tags.nfc_ack {
            InboundEvent::NfcAck
        } else if packet.tag == tags.rep_reset {
            InboundEvent::RepReset
        } else {
            self.unknown(packet)
        };

        Ok(event)
    }

    fn parse_rep_count(&self, payload: &[u8]) -> Option<u32> {
        match self.rep_count_width {
            RepCountWidth::Single => payload.first().map(|&b| u32::from(b)),
            RepCountWidth::DoubleBe => match payload {
                [hi, lo, ..] => Some(u32::from(u16::from_be_bytes([*hi, *lo]))),
                _ => None,
            },
        }
    }

    #[allow(clippy::unused_self)]
    fn unknown(&self, packet: &Packet) -> InboundEvent {
        InboundEvent::Unknown {
            tag: packet.tag,
            payload: packet.payload.clone(),
        }
    }
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self::standard()
    }
}

/// Encode a raw frame without profile involvement
///
/// # Errors
///
/// Returns [`PuckError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_SIZE`].
pub fn encode_raw(tag: u8, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(PuckError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(tag);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

fn checksum(tag: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(tag, |sum, &byte| sum.wrapping_add(byte))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_splits_tag_and_payload() {
        for tag in 0..=u8::MAX {
            let bytes = [tag, 0xAA, 0xBB];
            let packet = Packet::from_bytes(&bytes).unwrap();
            assert_eq!(packet.tag, tag);
            assert_eq!(packet.payload, vec![0xAA, 0xBB]);
        }
    }

    #[test]
    fn test_decode_empty_fails() {
        assert!(matches!(
            Packet::from_bytes(&[]),
            Err(PuckError::EmptyPacket)
        ));
    }

    #[test]
    fn test_decode_tag_only() {
        let packet = Packet::from_bytes(&[0x42]).unwrap();
        assert_eq!(packet.tag, 0x42);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_unknown_tag_is_not_an_error() {
        let profile = ProtocolProfile::standard();
        for tag in 0..=u8::MAX {
            let packet = Packet::from_bytes(&[tag, 0x01]).unwrap();
            // Every tag classifies; values outside the map become Unknown.
            let event = profile.classify(&packet).unwrap();
            if tag > 0x09 {
                assert!(matches!(event, InboundEvent::Unknown { tag: t, .. } if t == tag));
            }
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let payload: Vec<u8> = (0..19).collect();
        let frame = encode_raw(0x33, &payload).unwrap();
        let packet = Packet::from_bytes(&frame).unwrap();
        assert_eq!(packet.tag, 0x33);
        assert_eq!(packet.payload, payload);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = [0u8; 20];
        assert!(matches!(
            encode_raw(0x01, &payload),
            Err(PuckError::PayloadTooLarge { len: 20, max: 19 })
        ));

        let profile = ProtocolProfile::standard().with_trailing_checksum(true);
        let payload = [0u8; 19];
        assert!(matches!(
            profile.encode(Command::Handshake, &payload),
            Err(PuckError::PayloadTooLarge { len: 19, max: 18 })
        ));
    }

    #[test]
    fn test_rep_count_single_byte() {
        let profile = ProtocolProfile::standard();
        let packet = Packet::from_bytes(&[profile.tags.rep_count, 42]).unwrap();
        assert_eq!(
            profile.classify(&packet).unwrap(),
            InboundEvent::RepCount(42)
        );
    }

    #[test]
    fn test_rep_count_two_byte_big_endian() {
        let profile = ProtocolProfile::legacy();
        let packet = Packet::from_bytes(&[profile.tags.rep_count, 0x01, 0x2C]).unwrap();
        assert_eq!(
            profile.classify(&packet).unwrap(),
            InboundEvent::RepCount(300)
        );
    }

    #[test]
    fn test_rep_count_short_payload_classifies_unknown() {
        let profile = ProtocolProfile::legacy();
        let packet = Packet::from_bytes(&[profile.tags.rep_count, 0x05]).unwrap();
        assert!(matches!(
            profile.classify(&packet).unwrap(),
            InboundEvent::Unknown { .. }
        ));
    }

    #[test]
    fn test_heartbeat_battery_fraction() {
        let profile = ProtocolProfile::standard();
        let packet = Packet::from_bytes(&[profile.tags.heartbeat, 75]).unwrap();
        match profile.classify(&packet).unwrap() {
            InboundEvent::Heartbeat { battery_level } => {
                assert!((battery_level - 0.75).abs() < f32::EPSILON);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Out-of-range raw values clamp instead of exceeding 1.0.
        let packet = Packet::from_bytes(&[profile.tags.heartbeat, 200]).unwrap();
        match profile.classify(&packet).unwrap() {
            InboundEvent::Heartbeat { battery_level } => {
                assert!((battery_level - 1.0).abs() < f32::EPSILON);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_command_encoding_uses_profile_tags() {
        let profile = ProtocolProfile::standard();
        let frame = profile.encode(Command::ResetReps, &[]).unwrap();
        assert_eq!(&frame[..], &[profile.commands.reset_reps]);

        let legacy = ProtocolProfile::legacy();
        let frame = legacy.encode(Command::ResetReps, &[]).unwrap();
        assert_eq!(&frame[..], &[legacy.commands.reset_reps]);
    }

    #[test]
    fn test_checksum_round_trip_and_mismatch() {
        let profile = ProtocolProfile::standard().with_trailing_checksum(true);
        let frame = profile.encode(Command::StatusRequest, &[0x10, 0x20]).unwrap();

        // The frame our encoder produces verifies under the same profile.
        let packet = Packet::from_bytes(&frame).unwrap();
        assert!(profile.classify(&packet).is_ok());

        // Corrupt one payload byte and the checksum no longer matches.
        let mut corrupted = frame.to_vec();
        corrupted[1] ^= 0xFF;
        let packet = Packet::from_bytes(&corrupted).unwrap();
        assert!(matches!(
            profile.classify(&packet),
            Err(PuckError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_handshake_flags() {
        let profile = ProtocolProfile::standard();
        let packet = Packet::from_bytes(&[profile.tags.handshake, 0x03, 0x01]).unwrap();
        assert_eq!(
            profile.classify(&packet).unwrap(),
            InboundEvent::Handshake {
                firmware_revision: 3,
                calibrated: true
            }
        );
    }
}
