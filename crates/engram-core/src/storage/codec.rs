//! Embedding Column Codec
//!
//! Vectors persist as `f16b64:<len>:<base64>`: float16 components packed
//! little-endian and base64-encoded. Reads also accept the legacy JSON
//! array format, so databases written before the packed codec keep loading.
//! Float16 is lossy but round-trips unit vectors within rtol 1e-3.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use half::f16;

const FLOAT16_PREFIX: &str = "f16b64";

/// Encode a vector for persistence; empty vectors encode as `[]`
pub fn encode_vector(values: &[f32]) -> String {
    if values.is_empty() {
        return "[]".to_string();
    }
    let mut bytes = Vec::with_capacity(values.len() * 2);
    for value in values {
        bytes.extend_from_slice(&f16::from_f32(*value).to_le_bytes());
    }
    format!("{FLOAT16_PREFIX}:{}:{}", values.len(), BASE64.encode(bytes))
}

/// Decode either the packed float16 format or a legacy JSON array.
/// Malformed payloads decode to an empty vector rather than failing reads.
pub fn decode_vector(serialized: &str) -> Vec<f32> {
    let text = serialized.trim();
    if text.is_empty() || text == "[]" {
        return Vec::new();
    }
    if let Some(rest) = text.strip_prefix(&format!("{FLOAT16_PREFIX}:")) {
        let Some((size_text, payload)) = rest.split_once(':') else {
            return Vec::new();
        };
        let Ok(size) = size_text.parse::<usize>() else {
            return Vec::new();
        };
        let Ok(binary) = BASE64.decode(payload) else {
            return Vec::new();
        };
        if size == 0 || binary.len() != size * 2 {
            return Vec::new();
        }
        return binary
            .chunks_exact(2)
            .map(|pair| f16::from_le_bytes([pair[0], pair[1]]).to_f32())
            .collect();
    }

    // Legacy JSON fallback
    match serde_json::from_str::<Vec<serde_json::Value>>(text) {
        Ok(items) => items
            .iter()
            .filter_map(|item| item.as_f64().map(|value| value as f32))
            .collect(),
        Err(_) => Vec::new(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_within_tolerance() {
        let values: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.37).sin() * 0.2).collect();
        let decoded = decode_vector(&encode_vector(&values));
        assert_eq!(decoded.len(), values.len());
        for (original, restored) in values.iter().zip(decoded.iter()) {
            assert!((original - restored).abs() <= 1e-3 * original.abs().max(1.0));
        }
    }

    #[test]
    fn test_empty_vector() {
        assert_eq!(encode_vector(&[]), "[]");
        assert!(decode_vector("[]").is_empty());
        assert!(decode_vector("  ").is_empty());
    }

    #[test]
    fn test_legacy_json_fallback() {
        let decoded = decode_vector("[0.5, -0.25, 1.0]");
        assert_eq!(decoded, vec![0.5, -0.25, 1.0]);
    }

    #[test]
    fn test_malformed_payloads_decode_empty() {
        assert!(decode_vector("f16b64:nonsense").is_empty());
        assert!(decode_vector("f16b64:4:!!!").is_empty());
        assert!(decode_vector("f16b64:100:AAAA").is_empty());
        assert!(decode_vector("not json at all").is_empty());
    }
}
