//! Parameter values and combinations.
//!
//! A simulator's parameter set is only known at runtime, so combinations are
//! ordered maps from parameter name to a dynamically typed [`ParamValue`].
//! Insertion order is significant: it is the order in which `--name=value`
//! arguments reach the simulator.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the parameter carrying the run seed.
pub const RNGRUN: &str = "RngRun";

/// A single parameter value.
///
/// `Int` and `Float` compare by numeric value, so `Int(1) == Float(1.0)`.
/// This mirrors how the values behave once they round-trip through the JSON
/// catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// An ordered parameter combination.
pub type ParamMap = IndexMap<String, ParamValue>;

/// Hashable key identifying an equivalence class of combinations.
pub type CombinationKey = Vec<(String, String)>;

impl ParamValue {
    /// Infers a typed value from a textual default.
    ///
    /// `true`/`false` become booleans, integers become `Int`, other numbers
    /// become `Float` and anything else is kept as a string.
    pub fn infer(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return Self::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Self::Bool(false);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Int(i);
        }
        match trimmed.parse::<f64>() {
            Ok(f) if !trimmed.is_empty() => Self::Float(f),
            _ => Self::Str(text.to_string()),
        }
    }

    /// Converts a JSON scalar. Arrays, objects and null yield `None`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Float),
            },
            serde_json::Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the value as an integer if it is one, or a float with no
    /// fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Stable textual form used for equivalence keys.
    ///
    /// Numbers share one namespace so that `1` and `1.0` collapse.
    pub fn canonical(&self) -> String {
        match self {
            Self::Bool(b) => format!("b:{}", b),
            Self::Str(s) => format!("s:{}", s),
            Self::Int(i) => format!("n:{}", i),
            Self::Float(f) => match self.as_i64() {
                Some(i) => format!("n:{}", i),
                None => format!("n:{:?}", f),
            },
        }
    }
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{:?}", x),
            Self::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Builds a combination from `(name, value)` pairs, keeping their order.
pub fn param_map<K, V, I>(pairs: I) -> ParamMap
where
    K: Into<String>,
    V: Into<ParamValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Equivalence key of a combination, independent of key order.
///
/// With `ignore_rngrun` set, combinations differing only in their seed map to
/// the same key.
pub fn combination_key(params: &ParamMap, ignore_rngrun: bool) -> CombinationKey {
    let mut key: CombinationKey = params
        .iter()
        .filter(|(k, _)| !(ignore_rngrun && k.as_str() == RNGRUN))
        .map(|(k, v)| (k.clone(), v.canonical()))
        .collect();
    key.sort();
    key
}

/// True when both combinations agree on every parameter except `RngRun`.
pub fn equivalent(a: &ParamMap, b: &ParamMap) -> bool {
    combination_key(a, true) == combination_key(b, true)
}

/// Returns the combination with `RngRun` removed.
pub fn without_rngrun(params: &ParamMap) -> ParamMap {
    params
        .iter()
        .filter(|(k, _)| k.as_str() != RNGRUN)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Reads the `RngRun` value of a combination, if present and integral.
pub fn rngrun_of(params: &ParamMap) -> Option<i64> {
    params.get(RNGRUN).and_then(ParamValue::as_i64)
}
