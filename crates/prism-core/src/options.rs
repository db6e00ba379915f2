//! Reading `configure` option maps.
//!
//! Formatters accept a closed set of keys. Unknown keys are ignored and
//! values of the wrong type or outside the accepted range leave the target
//! untouched, with a warning.

use std::ops::RangeInclusive;
use tracing::warn;

/// Typed accessor over a JSON options object.
pub struct OptionReader<'a> {
    component: &'a str,
    map: &'a serde_json::Map<String, serde_json::Value>,
}

impl<'a> OptionReader<'a> {
    /// Returns `None` when `options` is not a JSON object.
    pub fn new(component: &'a str, options: &'a serde_json::Value) -> Option<Self> {
        options.as_object().map(|map| Self { component, map })
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Reads a boolean into `target`.
    pub fn bool(&self, key: &str, target: &mut bool) {
        match self.map.get(key) {
            None => {}
            Some(serde_json::Value::Bool(b)) => *target = *b,
            Some(other) => self.reject(key, other),
        }
    }

    /// Reads an integer into `target` if it lies in `range`, otherwise
    /// resets `target` to `fallback`.
    pub fn int_in(&self, key: &str, range: RangeInclusive<i64>, fallback: i64, target: &mut i64) {
        let Some(value) = self.map.get(key) else {
            return;
        };
        match value.as_i64() {
            Some(n) if range.contains(&n) => *target = n,
            _ => {
                self.reject(key, value);
                *target = fallback;
            }
        }
    }

    /// Reads an unsigned size into `target` when it is at least `min`.
    pub fn usize_min(&self, key: &str, min: usize, target: &mut usize) {
        let Some(value) = self.map.get(key) else {
            return;
        };
        match value.as_u64().and_then(|n| usize::try_from(n).ok()) {
            Some(n) if n >= min => *target = n,
            _ => self.reject(key, value),
        }
    }

    /// Reads a float and clamps it into `range`.
    pub fn f64_clamped(&self, key: &str, range: RangeInclusive<f64>, target: &mut f64) {
        let Some(value) = self.map.get(key) else {
            return;
        };
        match value.as_f64() {
            Some(n) if n.is_finite() => *target = n.clamp(*range.start(), *range.end()),
            _ => self.reject(key, value),
        }
    }

    /// Reads a string accepted by `accept`.
    pub fn string(&self, key: &str, accept: impl Fn(&str) -> bool, target: &mut String) {
        let Some(value) = self.map.get(key) else {
            return;
        };
        match value.as_str() {
            Some(s) if accept(s) => *target = s.to_string(),
            _ => self.reject(key, value),
        }
    }

    /// Reads a list of strings. Non-string entries are skipped.
    pub fn strings(&self, key: &str, target: &mut Vec<String>) {
        let Some(value) = self.map.get(key) else {
            return;
        };
        match value.as_array() {
            Some(items) => {
                *target = items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
            None => self.reject(key, value),
        }
    }

    fn reject(&self, key: &str, value: &serde_json::Value) {
        warn!(
            component = self.component,
            key,
            value = %value,
            "Ignoring invalid configuration value"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_object_rejected() {
        assert!(OptionReader::new("t", &json!([1, 2])).is_none());
        assert!(OptionReader::new("t", &json!({})).is_some());
    }

    #[test]
    fn test_bool_wrong_type_keeps_value() {
        let opts = json!({"a": true, "b": "yes"});
        let reader = OptionReader::new("t", &opts).unwrap();
        let mut a = false;
        let mut b = true;
        reader.bool("a", &mut a);
        reader.bool("b", &mut b);
        reader.bool("missing", &mut a);
        assert!(a);
        assert!(b);
    }

    #[test]
    fn test_int_out_of_range_falls_back() {
        let opts = json!({"limit": 0, "ok": 50});
        let reader = OptionReader::new("t", &opts).unwrap();
        let mut limit = 500;
        let mut ok = 10;
        reader.int_in("limit", 1..=100, 10, &mut limit);
        reader.int_in("ok", 1..=100, 10, &mut ok);
        assert_eq!(limit, 10);
        assert_eq!(ok, 50);
    }

    #[test]
    fn test_float_clamped() {
        let opts = json!({"rate": 4.5});
        let reader = OptionReader::new("t", &opts).unwrap();
        let mut rate = 0.0;
        reader.f64_clamped("rate", 0.0..=1.0, &mut rate);
        assert_eq!(rate, 1.0);
    }

    #[test]
    fn test_strings_and_string() {
        let opts = json!({"names": ["a", 1, "b"], "mode": "fast"});
        let reader = OptionReader::new("t", &opts).unwrap();
        let mut names = Vec::new();
        let mut mode = "slow".to_string();
        reader.strings("names", &mut names);
        reader.string("mode", |m| m == "fast" || m == "slow", &mut mode);
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(mode, "fast");
    }
}
