use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::quality::{QualityIssue, QualityLog};

/// External collaborator that produced a raw snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Per-entity market screener record.
    Market,
    /// Network-wide native-unit price feed.
    Price,
    /// Per-entity on-chain probe.
    OnChain,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Price => "price",
            Self::OnChain => "on_chain",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "market" => Some(Self::Market),
            "price" => Some(Self::Price),
            "on_chain" => Some(Self::OnChain),
            _ => None,
        }
    }
}

/// One fetch of one source. Append-only; never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    /// `None` for the network-wide price feed.
    pub netuid: Option<u32>,
    pub source: SourceKind,
    pub payload: Value,
    pub fetched_at: i64,
}

impl RawSnapshot {
    pub fn payload(&self) -> Payload<'_> {
        Payload::new(self.netuid, &self.payload)
    }
}

/// Defensive reader over a semi-structured payload.
///
/// Every accessor takes a list of key aliases (first match wins) because
/// upstream schemas rename fields over time. An absent or `null` field is
/// `None` without side effects. A field that is present but unusable is
/// also `None`, and is recorded in the [`QualityLog`].
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    netuid: Option<u32>,
    value: &'a Value,
}

impl<'a> Payload<'a> {
    pub fn new(netuid: Option<u32>, value: &'a Value) -> Self {
        Self { netuid, value }
    }

    /// First non-null value under any of `keys`, with the key that matched.
    fn lookup(&self, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
        let obj = self.value.as_object()?;
        keys.iter()
            .find_map(|k| obj.get(*k).filter(|v| !v.is_null()).map(|v| (*k, v)))
    }

    /// A finite number, accepting JSON numbers and numeric strings.
    pub fn number(&self, keys: &[&'static str], quality: &mut QualityLog) -> Option<f64> {
        let (key, value) = self.lookup(keys)?;
        match value_as_f64(value) {
            Some(x) if x.is_finite() => Some(x),
            Some(_) => {
                quality.record(self.netuid, key, QualityIssue::NonFinite);
                None
            }
            None => {
                quality.record(self.netuid, key, QualityIssue::TypeMismatch);
                None
            }
        }
    }

    /// An exact decimal, for on-chain integer amounts (RAO).
    pub fn decimal(&self, keys: &[&'static str], quality: &mut QualityLog) -> Option<Decimal> {
        let (key, value) = self.lookup(keys)?;
        let parsed = match value {
            Value::Number(n) => parse_decimal(&n.to_string()),
            Value::String(s) => parse_decimal(s.trim()),
            _ => None,
        };
        if parsed.is_none() {
            quality.record(self.netuid, key, QualityIssue::TypeMismatch);
        }
        parsed
    }

    /// A numeric array. Elements may be non-finite (numeric strings such as
    /// `"NaN"`); callers decide per field whether to drop them. Any
    /// non-numeric element makes the whole array unusable.
    pub fn numbers(&self, keys: &[&'static str], quality: &mut QualityLog) -> Option<Vec<f64>> {
        let (key, value) = self.lookup(keys)?;
        let parsed = value
            .as_array()
            .and_then(|items| items.iter().map(value_as_f64).collect::<Option<Vec<_>>>());
        if parsed.is_none() {
            quality.record(self.netuid, key, QualityIssue::TypeMismatch);
        }
        parsed
    }

    /// A boolean array, accepting `true`/`false` and `0`/`1`.
    pub fn flags(&self, keys: &[&'static str], quality: &mut QualityLog) -> Option<Vec<bool>> {
        let (key, value) = self.lookup(keys)?;
        let parsed = value.as_array().and_then(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    Value::Number(n) => n.as_f64().map(|x| x != 0.0),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
        });
        if parsed.is_none() {
            quality.record(self.netuid, key, QualityIssue::TypeMismatch);
        }
        parsed
    }

    /// An array of sub-objects, each wrapped as a [`Payload`].
    pub fn objects(&self, keys: &[&'static str], quality: &mut QualityLog) -> Option<Vec<Payload<'a>>> {
        let (key, value) = self.lookup(keys)?;
        match value.as_array() {
            Some(items) => Some(
                items
                    .iter()
                    .map(|v| Payload::new(self.netuid, v))
                    .collect(),
            ),
            None => {
                quality.record(self.netuid, key, QualityIssue::TypeMismatch);
                None
            }
        }
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}
