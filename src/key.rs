//! Cache Key Builder
//!
//! Keys are `name:canonical` where `canonical` is the compact JSON form of
//! the attribute mapping. `BTreeMap` and `serde_json::Map` both iterate in
//! key order, so equal attributes always produce the same text. Once the
//! canonical text reaches [`MAX_INLINE_ATTRIBUTES_LEN`] bytes it is replaced
//! by its SHA1 digest, which keeps keys bounded while the readable method
//! prefix stays in place for `SCAN`/`KEYS` patterns.

use std::collections::BTreeMap;

use serde_json::Value;
use sha1::{Digest, Sha1};

/// Canonical attribute text at or above this length is hashed
pub const MAX_INLINE_ATTRIBUTES_LEN: usize = 512;

/// Deterministic key construction
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    pub fn build(name: &str, attributes: &BTreeMap<String, Value>) -> String {
        // A map with string keys and `Value` leaves always serializes
        let canonical = serde_json::to_string(attributes).unwrap_or_default();

        if canonical.len() < MAX_INLINE_ATTRIBUTES_LEN {
            format!("{name}:{canonical}")
        } else {
            let digest = Sha1::digest(canonical.as_bytes());
            format!("{name}:{}", hex::encode(digest))
        }
    }
}
