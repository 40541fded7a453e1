//! Content hashes, input fingerprints and canonical JSON encoding.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Computes the lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// SHA-256 of an artifact's bytes. This is the artifact's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hashes raw bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(sha256_hex(data))
    }

    /// Parses a hex digest, rejecting anything that is not 64 lowercase hex chars.
    pub fn parse(value: &str) -> Option<Self> {
        is_sha256_hex(value).then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two hex characters, used as the shard directory.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    /// Abbreviated form for logs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of everything that determines a computation's result.
///
/// Two computations with the same fingerprint are interchangeable, which is
/// what lets a deterministic stage skip work it has already done.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Starts a fingerprint for work done by `stage`.
    pub fn builder(stage: &str) -> FingerprintBuilder {
        FingerprintBuilder::new(stage)
    }

    pub fn parse(value: &str) -> Option<Self> {
        is_sha256_hex(value).then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incrementally hashes named fields into a [`Fingerprint`].
///
/// Keys and values are length-prefixed so that field boundaries can never be
/// confused (`("ab", "c")` and `("a", "bc")` hash differently).
#[derive(Clone)]
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new(stage: &str) -> Self {
        let builder = Self {
            hasher: Sha256::new(),
        };
        builder.field("stage", stage)
    }

    pub fn field(mut self, key: &str, value: &str) -> Self {
        for part in [key.as_bytes(), value.as_bytes()] {
            self.hasher.update((part.len() as u64).to_le_bytes());
            self.hasher.update(part);
        }
        self
    }

    /// Adds a list of values under one key, in the order given.
    pub fn list<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values: Vec<S> = values.into_iter().collect();
        self = self.field(key, &values.len().to_string());
        for value in &values {
            self = self.field(key, value.as_ref());
        }
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.hasher.finalize()))
    }
}

/// Serializes `value` as canonical JSON: object keys sorted, no insignificant
/// whitespace. Equal values always produce equal bytes.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(value)?);
    serde_json::to_vec(&value)
}

/// Canonical JSON with indentation, for artifacts humans will open.
pub fn canonical_json_pretty<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(value)?);
    let mut bytes = serde_json::to_vec_pretty(&value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
