//! Content hashes and cache fingerprints.
//!
//! Two hash families with different jobs: [`ContentHash`] is the SHA-256
//! digest the remote service keys blobs by, and [`Fingerprint`] is a local
//! blake3 key over whatever identity material a cache needs. Remote hashes
//! must match what the service computes; local fingerprints only need to be
//! stable within one schema version.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// SHA-256 digest of a blob's content, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Streaming hash of a file; avoids loading large objects into memory.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local blake3 cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 16 hex chars are plenty for logs.
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Incremental fingerprint builder with domain separation.
///
/// Fields are framed with a label and a newline so adjacent values cannot
/// collide across field boundaries.
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
}

impl FingerprintBuilder {
    /// `schema` names the keyspace and versions it, e.g. `"deps-v1"`.
    pub fn new(schema: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(schema.as_bytes());
        hasher.update(b"\n");
        Self { hasher }
    }

    pub fn field(mut self, label: &str, value: &str) -> Self {
        self.hasher.update(label.as_bytes());
        self.hasher.update(b":");
        self.hasher.update(value.as_bytes());
        self.hasher.update(b"\n");
        self
    }

    pub fn field_bytes(mut self, label: &str, value: &[u8]) -> Self {
        self.hasher.update(label.as_bytes());
        self.hasher.update(b":");
        self.hasher.update(value);
        self.hasher.update(b"\n");
        self
    }

    /// Hash a list of values order-sensitively under one label.
    pub fn field_list<I, S>(mut self, label: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.hasher.update(label.as_bytes());
        self.hasher.update(b"[");
        for v in values {
            self.hasher.update(v.as_ref().as_bytes());
            self.hasher.update(b"\x1f");
        }
        self.hasher.update(b"]\n");
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(*self.hasher.finalize().as_bytes())
    }
}
