//! Telemetry notification decoding.
//!
//! The peripheral firmware prefixes every heart-rate notification with a
//! one-byte status tag:
//!
//! | tag    | meaning         | payload                     |
//! |--------|-----------------|-----------------------------|
//! | `0x06` | booting         | none                        |
//! | `0x14` | connection lost | none                        |
//! | `0x16` | reading ok      | byte 1: heart rate (u8 bpm) |

use thiserror::Error;

use crate::types::{LinkStatus, TelemetrySample};

/// A notification payload that carried a known tag but could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The payload ended before the value byte.
    #[error("Notification tag {tag:#04x} needs a value byte, got {len} byte(s)")]
    Truncated {
        /// Status tag.
        tag: u8,
        /// Payload length received.
        len: usize,
    },
}

/// Outcome of decoding one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A status-only signal (booting, connection lost). Logged, not uploaded.
    Status(LinkStatus),
    /// A valid reading to upload.
    Telemetry(TelemetrySample),
    /// Unknown tag, empty payload, or a notification from another characteristic.
    Unrecognized,
}

/// Decoder bound to the telemetry characteristic of one connection.
#[derive(Debug, Clone, Copy)]
pub struct NotificationDecoder {
    telemetry_handle: u16,
}

impl NotificationDecoder {
    /// Create a decoder accepting notifications from `telemetry_handle`.
    #[must_use]
    pub const fn new(telemetry_handle: u16) -> Self {
        Self { telemetry_handle }
    }

    /// Handle of the telemetry characteristic.
    #[must_use]
    pub const fn telemetry_handle(&self) -> u16 {
        self.telemetry_handle
    }

    /// Decode a raw notification.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] when a reading tag arrives without
    /// its value byte.
    pub fn decode(&self, handle: u16, payload: &[u8]) -> Result<Decoded, DecodeError> {
        if handle != self.telemetry_handle {
            return Ok(Decoded::Unrecognized);
        }
        let Some(&tag) = payload.first() else {
            return Ok(Decoded::Unrecognized);
        };

        match LinkStatus::from_tag(tag) {
            Some(LinkStatus::NotifyOk) => {
                let bpm = *payload.get(1).ok_or(DecodeError::Truncated {
                    tag,
                    len: payload.len(),
                })?;
                Ok(Decoded::Telemetry(TelemetrySample::heart_rate(bpm)))
            }
            Some(status) => Ok(Decoded::Status(status)),
            None => Ok(Decoded::Unrecognized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HEART_RATE;

    const HANDLE: u16 = 0x000e;

    fn decoder() -> NotificationDecoder {
        NotificationDecoder::new(HANDLE)
    }

    #[test]
    fn test_reading_decodes_every_byte_value() {
        for bpm in 0..=u8::MAX {
            let decoded = decoder().decode(HANDLE, &[0x16, bpm]).unwrap();
            assert_eq!(decoded, Decoded::Telemetry(TelemetrySample::heart_rate(bpm)));
        }
    }

    #[test]
    fn test_reading_ignores_trailing_bytes() {
        let decoded = decoder().decode(HANDLE, &[0x16, 72, 0xff, 0x01]).unwrap();
        let Decoded::Telemetry(sample) = decoded else {
            panic!("expected telemetry, got {decoded:?}");
        };
        assert_eq!(sample.get(HEART_RATE), Some(72));
        assert_eq!(sample.len(), 1);
    }

    #[test]
    fn test_status_tags() {
        assert_eq!(
            decoder().decode(HANDLE, &[0x14]).unwrap(),
            Decoded::Status(LinkStatus::ConnectionLost)
        );
        assert_eq!(
            decoder().decode(HANDLE, &[0x06, 0x00]).unwrap(),
            Decoded::Status(LinkStatus::Booting)
        );
    }

    #[test]
    fn test_unknown_tags_are_unrecognized() {
        for tag in (0..=u8::MAX).filter(|t| ![0x06, 0x14, 0x16].contains(t)) {
            assert_eq!(
                decoder().decode(HANDLE, &[tag, 72]).unwrap(),
                Decoded::Unrecognized
            );
        }
    }

    #[test]
    fn test_empty_payload_is_unrecognized() {
        assert_eq!(decoder().decode(HANDLE, &[]).unwrap(), Decoded::Unrecognized);
    }

    #[test]
    fn test_other_handle_is_unrecognized() {
        assert_eq!(
            decoder().decode(HANDLE + 1, &[0x16, 72]).unwrap(),
            Decoded::Unrecognized
        );
    }

    #[test]
    fn test_truncated_reading_is_error() {
        assert_eq!(
            decoder().decode(HANDLE, &[0x16]),
            Err(DecodeError::Truncated { tag: 0x16, len: 1 })
        );
    }
}
