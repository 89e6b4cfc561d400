//! Transport-safe text encoding for payloads and errors.
//!
//! Host channels carry strings only, so byte buffers travel as standard base64.
//! Decoding failures are protocol violations: a host that sends undecodable data
//! is broken, not unlucky.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{BridgeError, ProtocolViolation};

pub fn encode_bytes(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_bytes(data64: &str) -> Result<Vec<u8>, ProtocolViolation> {
    STANDARD
        .decode(data64)
        .map_err(|e| ProtocolViolation::Decode(e.to_string()))
}

pub fn encode_str(text: &str) -> String {
    encode_bytes(text.as_bytes())
}

pub fn decode_str(text64: &str) -> Result<String, ProtocolViolation> {
    let bytes = decode_bytes(text64)?;
    String::from_utf8(bytes).map_err(|e| ProtocolViolation::InvalidUtf8(e.to_string()))
}

/// How a transport carries error messages.
///
/// In both encodings the empty string means "no error".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorEncoding {
    /// Message text as-is.
    #[default]
    Plain,
    /// Message UTF-8 bytes, base64-encoded.
    Base64,
}

impl ErrorEncoding {
    /// Host side: encode an optional error message for the wire.
    pub fn encode(self, message: Option<&str>) -> String {
        match (self, message) {
            (_, None) => String::new(),
            (Self::Plain, Some(message)) => message.to_string(),
            (Self::Base64, Some(message)) => encode_str(message),
        }
    }

    /// Bridge side: decode a wire error into "no error" or a host-reported failure.
    pub fn decode(self, encoded: &str) -> Result<Option<BridgeError>, ProtocolViolation> {
        if encoded.is_empty() {
            return Ok(None);
        }
        let message = match self {
            Self::Plain => encoded.to_string(),
            Self::Base64 => decode_str(encoded)?,
        };
        Ok(Some(BridgeError::Host(message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_survive_encoding() {
        let cases: [&[u8]; 4] = [b"", &[0u8; 16], &[0xff, 0xfe, 0x00, 0x80, 0xc3], b"ping"];
        for case in cases {
            assert_eq!(decode_bytes(&encode_bytes(case)).unwrap(), case);
        }
    }

    #[test]
    fn standard_alphabet_with_padding() {
        assert_eq!(encode_bytes(b"ping"), "cGluZw==");
        assert_eq!(encode_bytes(&[0xfb, 0xff]), "+/8=");
    }

    #[test]
    fn garbage_is_a_violation() {
        assert!(matches!(
            decode_bytes("not base64!"),
            Err(ProtocolViolation::Decode(_))
        ));
    }

    #[test]
    fn decode_str_requires_utf8() {
        let encoded = encode_bytes(&[0xff, 0xfe]);
        assert!(matches!(
            decode_str(&encoded),
            Err(ProtocolViolation::InvalidUtf8(_))
        ));
        assert_eq!(decode_str(&encode_str("/tmp/ä.sock")).unwrap(), "/tmp/ä.sock");
    }

    #[test]
    fn empty_error_means_none() {
        assert_eq!(ErrorEncoding::Plain.decode("").unwrap(), None);
        assert_eq!(ErrorEncoding::Base64.decode("").unwrap(), None);
        assert_eq!(ErrorEncoding::Base64.encode(None), "");
    }

    #[test]
    fn error_messages_decode_per_encoding() {
        assert_eq!(
            ErrorEncoding::Plain.decode("connection refused").unwrap(),
            Some(BridgeError::host("connection refused"))
        );
        let wire = ErrorEncoding::Base64.encode(Some("connection refused"));
        assert_eq!(wire, "Y29ubmVjdGlvbiByZWZ1c2Vk");
        assert_eq!(
            ErrorEncoding::Base64.decode(&wire).unwrap(),
            Some(BridgeError::host("connection refused"))
        );
    }

    #[test]
    fn undecodable_base64_error_is_a_violation() {
        assert!(ErrorEncoding::Base64.decode("%%%").is_err());
    }
}
