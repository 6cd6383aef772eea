//! Request fingerprints used as cache and in-flight keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash used for fingerprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
  /// SHA-256, hex encoded
  #[default]
  Sha256,
  /// 32-bit rolling hash, base36 encoded
  Rolling,
}

/// Fingerprint `payload` under `discriminator`.
///
/// Object keys are sorted before hashing, so payloads that differ only in key
/// order share a fingerprint.
pub fn fingerprint(payload: &Value, discriminator: &str, algorithm: HashAlgorithm) -> String {
  let canonical = canonical_json(payload);
  let digest = match algorithm {
    HashAlgorithm::Sha256 => {
      let mut hasher = Sha256::new();
      hasher.update(canonical.as_bytes());
      hex::encode(hasher.finalize())
    }
    HashAlgorithm::Rolling => rolling_hash(&canonical),
  };
  format!("{}_{}", discriminator, digest)
}

/// Serialize with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
  sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      // serde_json without preserve_order keeps maps sorted; sorting here keeps
      // the output stable if that feature is ever enabled
      Value::Object(
        entries
          .into_iter()
          .map(|(key, value)| (key.clone(), sort_keys(value)))
          .collect(),
      )
    }
    Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
    other => other.clone(),
  }
}

/// `hash = hash * 31 + unit` over UTF-16 units with 32-bit wraparound.
fn rolling_hash(input: &str) -> String {
  let hash = input
    .encode_utf16()
    .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)));
  to_base36(hash)
}

fn to_base36(value: i32) -> String {
  const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

  let mut magnitude = value.unsigned_abs();
  if magnitude == 0 {
    return "0".to_string();
  }

  let mut digits = Vec::new();
  while magnitude > 0 {
    digits.push(DIGITS[(magnitude % 36) as usize]);
    magnitude /= 36;
  }
  if value < 0 {
    digits.push(b'-');
  }
  digits.reverse();
  String::from_utf8_lossy(&digits).into_owned()
}
