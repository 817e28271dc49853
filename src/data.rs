use std::collections::BTreeMap;
use std::fmt;

/// The synthetic key under which a bare scalar travels inside an
/// associative payload, and under which an existing scalar is parked
/// when a structured update arrives for the same entry.
pub const SCALAR_KEY: &str = "";

/// A dynamically typed value as carried by channels, commands and replies.
///
/// Associative payloads keep their entries ordered so encodings and
/// emitted snapshots are deterministic.
#[derive(Debug, Clone)]
pub enum SpecData {
    Null,
    Int(i32),
    Double(f64),
    Str(String),
    Assoc(BTreeMap<String, SpecData>),
    Array(Vec<SpecData>),
}

impl SpecData {
    /// Parse text the way the server renders scalars: integer first,
    /// floating point second, otherwise keep the text.
    pub fn coerce(text: &str) -> SpecData {
        if let Ok(i) = text.parse::<i32>() {
            return SpecData::Int(i);
        }
        if let Ok(f) = text.parse::<f64>() {
            return SpecData::Double(f);
        }
        SpecData::Str(text.to_string())
    }

    /// Apply the coerce rule if this value is text; mappings and already
    /// typed scalars pass through unchanged.
    pub fn coerced(&self) -> SpecData {
        match self {
            SpecData::Str(s) => SpecData::coerce(s),
            other => other.clone(),
        }
    }

    /// Round-trippable literal form, used when formatting commands for
    /// peers that only accept text.
    pub fn repr(&self) -> String {
        match self {
            SpecData::Null => String::new(),
            SpecData::Int(i) => i.to_string(),
            SpecData::Double(d) => fmt_double(*d),
            SpecData::Str(s) => {
                let escaped = s.replace('\\', "\\\\").replace('\'', "\\'");
                format!("'{escaped}'")
            }
            SpecData::Assoc(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("'{}': {}", k, v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            SpecData::Array(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.repr()).collect();
                format!("[{}]", inner.join(", "))
            }
        }
    }

    /// Plain text rendering used for scalar wire payloads.
    pub fn as_text(&self) -> String {
        match self {
            SpecData::Null => String::new(),
            SpecData::Int(i) => i.to_string(),
            SpecData::Double(d) => fmt_double(*d),
            SpecData::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// Numeric view across the scalar variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SpecData::Int(i) => Some(*i as f64),
            SpecData::Double(d) => Some(*d),
            SpecData::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            SpecData::Int(i) => Some(*i),
            SpecData::Double(d) => Some(*d as i32),
            SpecData::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_assoc(&self) -> Option<&BTreeMap<String, SpecData>> {
        match self {
            SpecData::Assoc(map) => Some(map),
            _ => None,
        }
    }

    /// Truth value in the interpreter's sense: zero, empty and null are
    /// false, everything else is true.
    pub fn truthy(&self) -> bool {
        match self {
            SpecData::Null => false,
            SpecData::Int(i) => *i != 0,
            SpecData::Double(d) => *d != 0.0,
            SpecData::Str(s) => !s.is_empty(),
            SpecData::Assoc(map) => !map.is_empty(),
            SpecData::Array(items) => !items.is_empty(),
        }
    }
}

fn fmt_double(d: f64) -> String {
    if d.is_finite() && d == d.trunc() {
        format!("{d:.1}")
    } else {
        format!("{d}")
    }
}

/// Equality crosses the numeric variants, so a countdown reaching
/// `Double(0.0)` satisfies a wait for `Int(0)`.
impl PartialEq for SpecData {
    fn eq(&self, other: &Self) -> bool {
        use SpecData::*;
        match (self, other) {
            (Null, Null) => true,
            (Int(a), Int(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Int(a), Double(b)) | (Double(b), Int(a)) => (*a as f64) == *b,
            (Str(a), Str(b)) => a == b,
            (Assoc(a), Assoc(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for SpecData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

impl From<i32> for SpecData {
    fn from(v: i32) -> Self {
        SpecData::Int(v)
    }
}

impl From<f64> for SpecData {
    fn from(v: f64) -> Self {
        SpecData::Double(v)
    }
}

impl From<&str> for SpecData {
    fn from(v: &str) -> Self {
        SpecData::Str(v.to_string())
    }
}

impl From<String> for SpecData {
    fn from(v: String) -> Self {
        SpecData::Str(v)
    }
}

impl From<bool> for SpecData {
    fn from(v: bool) -> Self {
        SpecData::Int(v as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_boundaries() {
        assert_eq!(SpecData::coerce("42"), SpecData::Int(42));
        assert_eq!(SpecData::coerce("3.14"), SpecData::Double(3.14));
        assert_eq!(SpecData::coerce("abc"), SpecData::Str("abc".into()));
        assert_eq!(SpecData::coerce(""), SpecData::Str("".into()));
    }

    #[test]
    fn mappings_are_never_coerced() {
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), SpecData::Str("v".into()));
        let value = SpecData::Assoc(map.clone());
        assert_eq!(value.coerced(), SpecData::Assoc(map));
    }

    #[test]
    fn numeric_equality_crosses_variants() {
        assert_eq!(SpecData::Int(0), SpecData::Double(0.0));
        assert_ne!(SpecData::Int(1), SpecData::Double(1.5));
        assert_ne!(SpecData::Str("0".into()), SpecData::Int(0));
    }

    #[test]
    fn repr_round_trips_strings() {
        assert_eq!(SpecData::Str("a'b".into()).repr(), "'a\\'b'");
        assert_eq!(SpecData::Int(12).repr(), "12");
        assert_eq!(SpecData::Double(1.0).repr(), "1.0");
    }
}
