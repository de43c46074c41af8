use crate::error::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical form of one scan message pushed by the mobile app.
///
/// The wire format has shipped with both camelCase and snake_case field
/// names, so both are accepted here and normalized at this boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanMessage {
    #[serde(rename = "citizenId", alias = "citizen_id")]
    pub citizen_id: String,
    /// Base64-encoded JPEG of the card photo.
    #[serde(rename = "faceImage", alias = "face_image")]
    pub face_image: String,
}

impl ScanMessage {
    pub fn from_value(value: &Value) -> Result<Self> {
        let message: ScanMessage = serde_json::from_value(value.clone())
            .map_err(|e| VerifyError::Other(anyhow::anyhow!("Invalid scan message: {}", e)))?;
        if message.citizen_id.is_empty() {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "Invalid scan message: empty citizenId"
            )));
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub status: String,
    pub message: String,
}

impl Ack {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
            message: "CCCD data received".to_string(),
        }
    }
}

/// Reassembles JSON messages from a raw TCP byte stream.
///
/// The protocol has no length prefix or delimiter: after every chunk the
/// whole accumulated buffer is tried as one JSON document. A parse failure
/// just means "not complete yet", except for byte sequences that can never
/// become valid UTF-8, which indicate framing corruption and reset the
/// buffer so a broken peer cannot wedge the connection.
pub struct MessageDecoder {
    buffer: Vec<u8>,
    max_bytes: usize,
}

impl MessageDecoder {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_bytes,
        }
    }

    /// Appends a chunk and returns a message if the buffer now parses.
    ///
    /// One message per accumulation cycle: the exchange is strictly
    /// request-then-acknowledge, so trailing bytes are not expected and
    /// the buffer is cleared on a successful parse.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<Value>> {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() > self.max_bytes {
            let size = self.buffer.len();
            self.buffer.clear();
            return Err(VerifyError::MessageTooLarge {
                size,
                limit: self.max_bytes,
            });
        }

        let text = match std::str::from_utf8(&self.buffer) {
            Ok(text) => text,
            Err(e) if e.error_len().is_some() => {
                // Invalid byte sequence, not a truncated tail.
                tracing::debug!("Discarding {} undecodable bytes", self.buffer.len());
                self.buffer.clear();
                return Ok(None);
            }
            // Multi-byte character split across chunks.
            Err(_) => return Ok(None),
        };

        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                self.buffer.clear();
                Ok(Some(value))
            }
            // Incomplete JSON, keep accumulating.
            Err(_) => Ok(None),
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 64 * 1024;

    fn sample_json() -> String {
        serde_json::json!({
            "citizenId": "001204038012",
            "faceImage": "aGVsbG8=",
            "deviceName": "Pixel 7",
        })
        .to_string()
    }

    #[test]
    fn decodes_single_chunk() {
        let mut decoder = MessageDecoder::new(MAX);
        let value = decoder.feed(sample_json().as_bytes()).unwrap().unwrap();
        assert_eq!(value["citizenId"], "001204038012");
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn decodes_byte_by_byte_exactly_once() {
        let json = sample_json();
        let mut decoder = MessageDecoder::new(MAX);
        let mut decoded = Vec::new();
        for byte in json.as_bytes() {
            if let Some(value) = decoder.feed(std::slice::from_ref(byte)).unwrap() {
                decoded.push(value);
            }
        }
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0]["citizenId"], "001204038012");
    }

    #[test]
    fn split_multibyte_character_is_tolerated() {
        // "Đ" encodes to two bytes; split the message in the middle of it.
        let json = r#"{"citizenId":"001","faceImage":"aGVsbG8=","name":"Đạt"}"#;
        let bytes = json.as_bytes();
        let split = json.find('Đ').unwrap() + 1;

        let mut decoder = MessageDecoder::new(MAX);
        assert!(decoder.feed(&bytes[..split]).unwrap().is_none());
        let value = decoder.feed(&bytes[split..]).unwrap().unwrap();
        assert_eq!(value["name"], "Đạt");
    }

    #[test]
    fn corrupt_bytes_reset_then_valid_message_decodes() {
        let mut decoder = MessageDecoder::new(MAX);
        // 0xFF can never start a valid UTF-8 sequence.
        assert!(decoder.feed(&[0xFF, 0xFE, 0x80]).unwrap().is_none());
        assert_eq!(decoder.buffered_len(), 0);

        let value = decoder.feed(sample_json().as_bytes()).unwrap().unwrap();
        assert_eq!(value["citizenId"], "001204038012");
    }

    #[test]
    fn oversized_buffer_errors_and_recovers() {
        let mut decoder = MessageDecoder::new(16);
        let err = decoder.feed(&[b'{'; 32]).unwrap_err();
        match err {
            VerifyError::MessageTooLarge { size, limit } => {
                assert_eq!(size, 32);
                assert_eq!(limit, 16);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The buffer was discarded; the connection can carry on.
        let value = decoder.feed(br#"{"a":1}"#).unwrap().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn normalizes_both_field_name_variants() {
        let camel = serde_json::json!({"citizenId": "001", "faceImage": "eA=="});
        let snake = serde_json::json!({"citizen_id": "001", "face_image": "eA=="});

        for value in [camel, snake] {
            let message = ScanMessage::from_value(&value).unwrap();
            assert_eq!(message.citizen_id, "001");
            assert_eq!(message.face_image, "eA==");
        }
    }

    #[test]
    fn rejects_message_missing_required_fields() {
        let value = serde_json::json!({"citizenId": "001"});
        assert!(ScanMessage::from_value(&value).is_err());

        let value = serde_json::json!({"citizenId": "", "faceImage": "eA=="});
        assert!(ScanMessage::from_value(&value).is_err());
    }

    #[test]
    fn ack_wire_format() {
        let ack = serde_json::to_value(Ack::success()).unwrap();
        assert_eq!(ack["status"], "success");
        assert_eq!(ack["message"], "CCCD data received");
    }
}
