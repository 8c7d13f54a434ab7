//! Upstream payload decoding.
//!
//! The feed answers either with plain JSON or with a base64 body whose bytes are
//! XOR-obfuscated with a single key byte (the first byte of the configured key). The content type is a hint, not a guarantee,
//! so detection falls through: JSON content type, then base64+XOR, then plain JSON.

use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;
use tracing::debug;

use crate::error::DecodeError;
use crate::models::RawRecord;

/// Keys under which the feed nests its record list, in lookup order.
const RECORD_KEYS: &[&str] = &["situationsRecords", "incidencias", "features", "data"];

#[derive(Debug, Clone)]
pub struct Decoder {
    xor_key: Vec<u8>,
}

impl Decoder {
    pub fn new(xor_key: impl AsRef<[u8]>) -> Self {
        Self {
            xor_key: xor_key.as_ref().to_vec(),
        }
    }

    /// Decode a response body into raw records.
    pub fn decode(&self, body: &[u8], content_type: Option<&str>) -> Result<Vec<RawRecord>, DecodeError> {
        let payload = self.parse_payload(body, content_type)?;
        extract_records(payload)
    }

    fn parse_payload(&self, body: &[u8], content_type: Option<&str>) -> Result<Value, DecodeError> {
        let text = std::str::from_utf8(body)?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(DecodeError::EmptyBody);
        }
        let content_type = content_type.unwrap_or_default().to_ascii_lowercase();

        if content_type.contains("application/json") {
            match serde_json::from_str(trimmed) {
                Ok(value) => return Ok(value),
                Err(e) => debug!("Body labelled JSON did not parse, trying other encodings: {}", e),
            }
        }

        if content_type.contains("text/plain") || looks_base64(trimmed) {
            match self.deobfuscate(trimmed) {
                Ok(value) => return Ok(value),
                Err(e) => debug!("Body is not base64+xor JSON: {}", e),
            }
        }

        Ok(serde_json::from_str(trimmed)?)
    }

    fn deobfuscate(&self, text: &str) -> Result<Value, DecodeError> {
        let bytes = general_purpose::STANDARD.decode(pad_base64(text))?;
        let plain = String::from_utf8(xor(&bytes, &self.xor_key)?)?;
        Ok(serde_json::from_str(&plain)?)
    }
}

/// Symmetric byte-wise XOR with the first byte of `key`. Later key bytes are ignored,
/// which is how the feed scrambles its payload.
pub fn xor(bytes: &[u8], key: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let key_byte = *key.first().ok_or(DecodeError::EmptyKey)?;
    Ok(bytes.iter().map(|b| b ^ key_byte).collect())
}

fn looks_base64(text: &str) -> bool {
    !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

fn pad_base64(text: &str) -> String {
    let mut padded = text.to_string();
    let missing = padded.len() % 4;
    if missing != 0 {
        padded.extend(std::iter::repeat('=').take(4 - missing));
    }
    padded
}

fn extract_records(payload: Value) -> Result<Vec<RawRecord>, DecodeError> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let key = RECORD_KEYS
                .iter()
                .find(|key| map.get(**key).map_or(false, Value::is_array))
                .ok_or(DecodeError::UnexpectedShape("object without a record list"))?;
            match map.remove(*key) {
                Some(Value::Array(items)) => items,
                _ => return Err(DecodeError::UnexpectedShape("object without a record list")),
            }
        }
        _ => return Err(DecodeError::UnexpectedShape("neither an array nor an object")),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(fields) => Some(RawRecord::new(fields)),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obfuscate(plain: &str, key: &[u8]) -> String {
        general_purpose::STANDARD.encode(xor(plain.as_bytes(), key).unwrap())
    }

    #[test]
    fn plain_json_array() {
        let decoder = Decoder::new("K");
        let body = json!([{"fuente": "DGT3.0"}, 42, {"fuente": "other"}]).to_string();
        let records = decoder.decode(body.as_bytes(), Some("application/json")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source().as_deref(), Some("DGT3.0"));
    }

    #[test]
    fn nested_record_list() {
        let decoder = Decoder::new("K");
        let body = json!({"meta": {}, "incidencias": [{"id": "a"}], "data": [{"id": "b"}]}).to_string();
        let records = decoder.decode(body.as_bytes(), None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].upstream_id().as_deref(), Some("a"));
    }

    #[test]
    fn obfuscated_body_round_trips() {
        let decoder = Decoder::new("K");
        let plain = json!({"situationsRecords": [{"id": "x", "causa": "Vehículo detenido"}]}).to_string();
        let body = obfuscate(&plain, b"K");
        let records = decoder.decode(body.as_bytes(), Some("text/plain; charset=utf-8")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cause().as_deref(), Some("Vehículo detenido"));
    }

    #[test]
    fn missing_padding_is_restored() {
        let decoder = Decoder::new("key");
        let plain = json!([{"id": "pad"}]).to_string();
        let body = obfuscate(&plain, b"key");
        let unpadded = body.trim_end_matches('=');
        let records = decoder.decode(unpadded.as_bytes(), None).unwrap();
        assert_eq!(records[0].upstream_id().as_deref(), Some("pad"));
    }

    #[test]
    fn empty_list_is_not_an_error() {
        let decoder = Decoder::new("K");
        let records = decoder.decode(b"[]", Some("application/json")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn malformed_input_is_a_decode_error() {
        let decoder = Decoder::new("K");
        assert!(matches!(decoder.decode(b"   ", None), Err(DecodeError::EmptyBody)));
        assert!(matches!(decoder.decode(b"<html>oops</html>", Some("text/html")), Err(DecodeError::Json(_))));
        assert!(matches!(
            decoder.decode(br#"{"status": "ok"}"#, Some("application/json")),
            Err(DecodeError::UnexpectedShape(_))
        ));
        assert!(matches!(decoder.decode(b"\"just a string\"", None), Err(DecodeError::UnexpectedShape(_))));
    }

    #[test]
    fn xor_is_symmetric_and_needs_a_key() {
        let data = b"incident";
        let once = xor(data, b"ab").unwrap();
        assert_ne!(once, data.to_vec());
        assert_eq!(xor(&once, b"ab").unwrap(), data.to_vec());
        assert!(matches!(xor(data, b""), Err(DecodeError::EmptyKey)));
    }

    #[test]
    fn only_the_first_key_byte_scrambles() {
        assert_eq!(xor(b"abc", b"KEY").unwrap(), xor(b"abc", b"K").unwrap());

        let plain = json!([{"id": "multi", "subcausa": "Vehículo detenido"}]).to_string();
        let scrambled: Vec<u8> = plain.bytes().map(|b| b ^ b'K').collect();
        let body = general_purpose::STANDARD.encode(scrambled);
        let records = Decoder::new("KEY").decode(body.as_bytes(), Some("text/plain")).unwrap();
        assert_eq!(records[0].upstream_id().as_deref(), Some("multi"));
    }

    #[test]
    fn non_utf8_body_is_a_decode_error() {
        let decoder = Decoder::new("K");
        let latin1 = b"[{\"fuente\":\"DGT3.0\",\"subcausa\":\"Veh\xedculo detenido\"}]";
        assert!(matches!(
            decoder.decode(latin1, Some("application/json")),
            Err(DecodeError::Encoding(_))
        ));
        assert!(matches!(decoder.decode(latin1, None), Err(DecodeError::Encoding(_))));
    }
}
