//! Cache key derivation.

use crate::directive;
use crate::types::Value;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque cache key handed to backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[derive(Serialize)]
struct Canonical<'a> {
    query: &'a str,
    params: Vec<KeyParam<'a>>,
}

/// Parameter encoding used only for hashing. Floats go in as raw bits since
/// JSON has no representation for NaN or the infinities.
#[derive(Serialize)]
enum KeyParam<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> From<&'a Value> for KeyParam<'a> {
    fn from(value: &'a Value) -> Self {
        match value {
            Value::Null => KeyParam::Null,
            Value::Bool(b) => KeyParam::Bool(*b),
            Value::Int(i) => KeyParam::Int(*i),
            Value::Float(f) => KeyParam::Float(f.to_bits()),
            Value::Text(s) => KeyParam::Text(s),
            Value::Bytes(b) => KeyParam::Bytes(b),
        }
    }
}

/// Derives keys from the directive-stripped query text and the bound
/// parameters, in order.
#[derive(Debug, Clone, Default)]
pub struct KeyGenerator {
    prefix: Option<String>,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self { prefix: None }
    }

    /// Namespace every key as `prefix:hash` (useful on shared key-value stores).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn generate(&self, query: &str, params: &[Value]) -> Result<CacheKey> {
        let normalized = directive::strip(query);
        let canonical = serde_json::to_string(&Canonical {
            query: &normalized,
            params: params.iter().map(KeyParam::from).collect(),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Ok(match self.prefix {
            Some(ref p) => CacheKey::new(format!("{}:{}", p, hash)),
            None => CacheKey::new(hash),
        })
    }
}
