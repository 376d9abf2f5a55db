//! Core types for vigil

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifier of whoever wrote a tape cell - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct WriterId(Arc<str>);

impl WriterId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WriterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WriterId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for WriterId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for WriterId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for WriterId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Named trait values describing an entity's measured state.
///
/// Keys are kept in byte order, so iteration (and therefore every sum taken
/// over a payload) is deterministic. A `Payload` is always non-empty and all
/// of its values are finite; construction is the only validation point.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, f64>);

impl Payload {
    pub fn new(traits: BTreeMap<String, f64>) -> Result<Self> {
        if traits.is_empty() {
            return Err(Error::invalid_payload("payload has no traits"));
        }
        for (name, value) in &traits {
            if name.is_empty() {
                return Err(Error::invalid_payload("trait name is empty"));
            }
            if !value.is_finite() {
                return Err(Error::invalid_trait(
                    name,
                    format!("value {} is not finite", value),
                ));
            }
        }
        Ok(Self(traits))
    }

    /// Build from `(name, value)` pairs. Later duplicates replace earlier ones.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn traits(&self) -> &BTreeMap<String, f64> {
        &self.0
    }

    pub fn into_traits(self) -> BTreeMap<String, f64> {
        self.0
    }

    /// Canonical byte rendering used for identity derivation.
    ///
    /// `{"name":v,...}` with keys in byte order, names JSON-escaped and every
    /// value printed in scientific notation with 12 fractional digits.
    /// Negative zero is written as zero.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * 32);
        buf.push(b'{');
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                buf.push(b',');
            }
            // A String always serializes.
            let key = serde_json::to_string(name).unwrap_or_default();
            buf.extend_from_slice(key.as_bytes());
            buf.push(b':');
            buf.extend_from_slice(canonical_float(*value).as_bytes());
        }
        buf.push(b'}');
        buf
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let traits = BTreeMap::<String, f64>::deserialize(deserializer)?;
        Payload::new(traits).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<BTreeMap<String, f64>> for Payload {
    type Error = Error;

    fn try_from(traits: BTreeMap<String, f64>) -> Result<Self> {
        Self::new(traits)
    }
}

fn canonical_float(value: f64) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    format!("{:.12e}", value)
}
