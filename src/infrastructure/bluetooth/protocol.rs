//! Pod Wire Protocol
//!
//! This module contains the protocol definitions for talking to the
//! Acoustic Pod: the UART-style GATT identifiers, the pairing
//! advertisement filter, and the text frame codec.
//!
//! Frames are ASCII `HEADER` or `HEADER:ARGS`, newline-terminated, and
//! base64-encoded at the transport boundary. The pod answers a request
//! with a frame reusing the request's header; correlation happens on
//! that header alone.

use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;
use uuid::Uuid;

/// UART-style service the pod exposes.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Write characteristic - requests travel phone-to-pod here.
pub const TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Notify characteristic - responses travel pod-to-phone here.
pub const RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

/// Company identifier in the first two bytes (little-endian) of the
/// pod's manufacturer data; pairing scans filter on it.
pub const POD_COMPANY_ID: u16 = 0xFF01;

/// Local name the pod advertises.
pub const POD_ADVERTISED_NAME: &str = "XIAO-BLE-SECURE";

/// Known request/response headers.
pub mod headers {
    /// Ask the pod for its current frequency; it answers
    /// `GET_FREQ:<hz>`.
    pub const GET_FREQ: &str = "GET_FREQ";
}

/// Why an inbound frame was dropped.
#[derive(Debug, PartialEq, Error)]
pub enum FrameError {
    #[error("Frame is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Frame has no header/payload separator")]
    MissingSeparator,
}

/// Correlation header of an outbound message: everything before the
/// first `:`, or the whole message when it carries no arguments.
pub fn request_header(message: &str) -> &str {
    match message.split_once(':') {
        Some((header, _)) => header,
        None => message,
    }
}

/// Frame an outbound message: newline-terminated, base64 at the
/// transport boundary.
pub fn encode_frame(message: &str) -> String {
    general_purpose::STANDARD.encode(format!("{}\n", message))
}

/// Decode an inbound notification value into `(header, payload)`.
///
/// The value is base64-decoded to text, trimmed, and split on the first
/// `:`; a frame without a separator carries no payload and is dropped.
pub fn decode_frame(raw: &str) -> Result<(String, String), FrameError> {
    let bytes = general_purpose::STANDARD.decode(raw)?;
    let text = String::from_utf8(bytes)?;
    let trimmed = text.trim();
    let (header, payload) = trimmed
        .split_once(':')
        .ok_or(FrameError::MissingSeparator)?;
    Ok((header.to_string(), payload.to_string()))
}

/// Company identifier from raw manufacturer data, when present.
pub fn manufacturer_company_id(data: &[u8]) -> Option<u16> {
    if data.len() < 2 {
        return None;
    }
    Some(u16::from_le_bytes([data[0], data[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uart_uuids_are_the_nordic_triple() {
        assert_eq!(
            UART_SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            TX_CHAR_UUID.to_string(),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            RX_CHAR_UUID.to_string(),
            "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn outbound_frames_are_newline_terminated_base64() {
        let frame = encode_frame("GET_FREQ");
        let bytes = general_purpose::STANDARD.decode(&frame).unwrap();
        assert_eq!(bytes, b"GET_FREQ\n");
    }

    #[test]
    fn inbound_frames_split_on_first_separator() {
        let frame = general_purpose::STANDARD.encode("GET_FREQ:132.7\n");
        assert_eq!(
            decode_frame(&frame).unwrap(),
            ("GET_FREQ".to_string(), "132.7".to_string())
        );

        // Payload keeps any further separators
        let frame = general_purpose::STANDARD.encode("CFG:a:b:c");
        assert_eq!(
            decode_frame(&frame).unwrap(),
            ("CFG".to_string(), "a:b:c".to_string())
        );

        // Empty payload is still a payload
        let frame = general_purpose::STANDARD.encode("PING:\n");
        assert_eq!(
            decode_frame(&frame).unwrap(),
            ("PING".to_string(), String::new())
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            decode_frame("not base64!!!"),
            Err(FrameError::Base64(_))
        ));

        let no_separator = general_purpose::STANDARD.encode("GET_FREQ\n");
        assert_eq!(
            decode_frame(&no_separator),
            Err(FrameError::MissingSeparator)
        );

        let not_utf8 = general_purpose::STANDARD.encode([0xFFu8, 0xFE, 0x3A, 0x41]);
        assert!(matches!(decode_frame(&not_utf8), Err(FrameError::Utf8(_))));
    }

    #[test]
    fn header_is_text_before_first_separator() {
        assert_eq!(request_header("GET_FREQ"), "GET_FREQ");
        assert_eq!(request_header("SET_FREQ:132.7"), "SET_FREQ");
        assert_eq!(request_header("CFG:a:b"), "CFG");
    }

    #[test]
    fn company_id_reads_little_endian() {
        assert_eq!(manufacturer_company_id(&[0x01, 0xFF]), Some(POD_COMPANY_ID));
        assert_eq!(manufacturer_company_id(&[0x01, 0xFF, 0xAA]), Some(0xFF01));
        assert_eq!(manufacturer_company_id(&[0xFF, 0x01]), Some(0x01FF));
        assert_eq!(manufacturer_company_id(&[0x01]), None);
        assert_eq!(manufacturer_company_id(&[]), None);
    }
}
