//! Named parameters shared with CPU models.
//!
//! Every configuration field is mirrored here under a stable name so a loaded module can query
//! it through the environment callbacks, alongside free-form entries from the config file.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// A single parameter value. Deserialised untagged, so `42` becomes [`ParamValue::UInt`],
/// `-1` becomes [`ParamValue::Int`] and `"x"` becomes [`ParamValue::Str`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Str(String),
}

impl ParamValue {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            ParamValue::Bool(v) => Some(u64::from(*v)),
            ParamValue::UInt(v) => Some(*v),
            ParamValue::Int(v) => u64::try_from(*v).ok(),
            ParamValue::Str(s) => parse_uint(s),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Bool(v) => Some(i64::from(*v)),
            ParamValue::UInt(v) => i64::try_from(*v).ok(),
            ParamValue::Int(v) => Some(*v),
            ParamValue::Str(s) => s.trim().parse().ok(),
        }
    }
}

/// Accepts decimal or `0x`-prefixed hexadecimal.
fn parse_uint(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::UInt(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::UInt(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// Thread-safe parameter table, readable from both the kernel and CPU threads.
#[derive(Debug, Default)]
pub struct Params {
    values: RwLock<BTreeMap<String, ParamValue>>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(name).cloned()
    }

    pub fn get_uint(&self, name: &str) -> Option<u64> {
        self.get(name)?.as_uint()
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_int()
    }

    /// Any value renders as a string; only a missing name yields `None`.
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).map(|v| v.to_string())
    }

    pub fn names(&self) -> Vec<String> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions_respect_sign() {
        let params = Params::new();
        params.set("neg", -3i64);
        params.set("big", u64::MAX);
        params.set("hex", "0x8000_0000".replace('_', ""));
        params.set("flag", true);

        assert_eq!(params.get_uint("neg"), None);
        assert_eq!(params.get_int("neg"), Some(-3));
        assert_eq!(params.get_int("big"), None);
        assert_eq!(params.get_uint("hex"), Some(0x8000_0000));
        assert_eq!(params.get_uint("flag"), Some(1));
        assert_eq!(params.get_uint("missing"), None);
    }

    #[test]
    fn strings_render_any_value() {
        let params = Params::new();
        params.set("gdb_port", 1234u64);
        params.set("kernel_cmd", "console=ttyS0");
        assert_eq!(params.get_string("gdb_port").as_deref(), Some("1234"));
        assert_eq!(
            params.get_string("kernel_cmd").as_deref(),
            Some("console=ttyS0")
        );
        assert_eq!(params.names(), vec!["gdb_port", "kernel_cmd"]);
    }

    #[test]
    fn untagged_json_picks_the_narrowest_variant() {
        let values: BTreeMap<String, ParamValue> =
            serde_json::from_str(r#"{"a": 7, "b": -7, "c": "seven", "d": false}"#).unwrap();
        assert_eq!(values["a"], ParamValue::UInt(7));
        assert_eq!(values["b"], ParamValue::Int(-7));
        assert_eq!(values["c"], ParamValue::Str("seven".into()));
        assert_eq!(values["d"], ParamValue::Bool(false));
    }
}
