//! Datum - the JSON-like document value type.
//!
//! A `Datum` represents any value a query can store or manipulate. It's
//! similar to JSON but designed specifically for database operations.
//!
//! # Supported Types
//!
//! - **Null**: Absence of a value
//! - **Boolean**: true or false
//! - **Number**: f64 floating point numbers
//! - **String**: UTF-8 encoded text
//! - **Binary**: raw byte blobs
//! - **Array**: Ordered list of datums
//! - **Object**: Key-value map (like JSON object)
//!
//! Aggregates are immutable once built: [`ArrayBuilder`] and [`ObjectBuilder`]
//! accumulate elements against the active [`Limits`] configuration and are
//! consumed once into a final `Datum`, so a value that exceeds the size limit
//! fails at build time, not later.

use crate::query::env::Limits;
use crate::reql::error::{QueryError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Datum represents a stored or computed document value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Datum>),
    Object(HashMap<String, Datum>),
}

impl Datum {
    /// Check if datum is null
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Get as string
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Datum::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&Vec<Datum>> {
        match self {
            Datum::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object
    pub fn as_object(&self) -> Option<&HashMap<String, Datum>> {
        match self {
            Datum::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Get as binary blob
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Datum::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// The uppercase type name used in error messages and by TYPE_OF.
    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "NULL",
            Datum::Boolean(_) => "BOOL",
            Datum::Number(_) => "NUMBER",
            Datum::String(_) => "STRING",
            Datum::Binary(_) => "BINARY",
            Datum::Array(_) => "ARRAY",
            Datum::Object(_) => "OBJECT",
        }
    }

    /// Extract an integer, the way every index-consuming operator does.
    ///
    /// Non-numbers are a type error; fractional numbers are a logic error.
    pub fn as_int(&self) -> Result<i64> {
        let n = self.as_number().ok_or_else(|| {
            QueryError::type_error(format!(
                "Expected type NUMBER but found {}.",
                self.type_name()
            ))
        })?;
        if n.fract() != 0.0 || !n.is_finite() {
            return Err(QueryError::logic(format!("Number not an integer: {}", n)));
        }
        Ok(n as i64)
    }

    /// `null` and `false` are falsey; every other datum is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Datum::Null | Datum::Boolean(false))
    }

    /// Total order across all datum types, used for comparisons and MIN/MAX.
    ///
    /// Types rank Null < Bool < Number < String < Binary < Array < Object;
    /// arrays compare lexicographically, objects by sorted key/value pairs.
    pub fn total_cmp(&self, other: &Datum) -> Ordering {
        fn rank(d: &Datum) -> u8 {
            match d {
                Datum::Null => 0,
                Datum::Boolean(_) => 1,
                Datum::Number(_) => 2,
                Datum::String(_) => 3,
                Datum::Binary(_) => 4,
                Datum::Array(_) => 5,
                Datum::Object(_) => 6,
            }
        }

        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Boolean(a), Datum::Boolean(b)) => a.cmp(b),
            (Datum::Number(a), Datum::Number(b)) => a.total_cmp(b),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            (Datum::Binary(a), Datum::Binary(b)) => a.cmp(b),
            (Datum::Array(a), Datum::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Datum::Object(a), Datum::Object(b)) => {
                let mut ka: Vec<&String> = a.keys().collect();
                let mut kb: Vec<&String> = b.keys().collect();
                ka.sort();
                kb.sort();
                for (x, y) in ka.iter().zip(kb.iter()) {
                    let ord = x.cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    let ord = a[x.as_str()].total_cmp(&b[y.as_str()]);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                ka.len().cmp(&kb.len())
            }
            _ => rank(self).cmp(&rank(other)),
        }
    }

    /// Build an object datum from key/value pairs.
    pub fn object<K: Into<String>, I: IntoIterator<Item = (K, Datum)>>(pairs: I) -> Self {
        Datum::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Accumulates array elements against the configured size limit.
///
/// Consumed once into an immutable `Datum::Array`.
pub struct ArrayBuilder {
    limit: usize,
    items: Vec<Datum>,
}

impl ArrayBuilder {
    pub fn new(limits: &Limits) -> Self {
        Self {
            limit: limits.array_size_limit,
            items: Vec::new(),
        }
    }

    pub fn with_capacity(limits: &Limits, capacity: usize) -> Self {
        Self {
            limit: limits.array_size_limit,
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, datum: Datum) -> Result<()> {
        if self.items.len() >= self.limit {
            return Err(QueryError::resource_limit(format!(
                "Array over size limit: {}.",
                self.limit
            )));
        }
        self.items.push(datum);
        Ok(())
    }

    pub fn extend<I: IntoIterator<Item = Datum>>(&mut self, items: I) -> Result<()> {
        for item in items {
            self.push(item)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn finish(self) -> Datum {
        Datum::Array(self.items)
    }

    pub fn into_vec(self) -> Vec<Datum> {
        self.items
    }
}

/// Accumulates object fields against the configured size limit.
pub struct ObjectBuilder {
    limit: usize,
    fields: HashMap<String, Datum>,
}

impl ObjectBuilder {
    pub fn new(limits: &Limits) -> Self {
        Self {
            limit: limits.array_size_limit,
            fields: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Datum) -> Result<()> {
        let key = key.into();
        if !self.fields.contains_key(&key) && self.fields.len() >= self.limit {
            return Err(QueryError::resource_limit(format!(
                "Object over size limit: {}.",
                self.limit
            )));
        }
        self.fields.insert(key, value);
        Ok(())
    }

    pub fn finish(self) -> Datum {
        Datum::Object(self.fields)
    }
}

// Conversions
impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Boolean(b)
    }
}

impl From<i32> for Datum {
    fn from(n: i32) -> Self {
        Datum::Number(n as f64)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Number(n as f64)
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Datum::Number(n)
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::String(s)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::String(s.to_string())
    }
}

impl From<Vec<Datum>> for Datum {
    fn from(items: Vec<Datum>) -> Self {
        Datum::Array(items)
    }
}

impl From<serde_json::Value> for Datum {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Datum::Null,
            serde_json::Value::Bool(b) => Datum::Boolean(b),
            serde_json::Value::Number(n) => Datum::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Datum::String(s),
            serde_json::Value::Array(arr) => {
                Datum::Array(arr.into_iter().map(Datum::from).collect())
            }
            serde_json::Value::Object(obj) => {
                // The BINARY pseudo-object round-trips back into a blob.
                if obj.get("$reql_type$").and_then(|v| v.as_str()) == Some("BINARY") {
                    if let Some(data) = obj.get("data").and_then(|v| v.as_str()) {
                        if let Ok(bytes) = BASE64.decode(data) {
                            return Datum::Binary(bytes);
                        }
                    }
                }
                Datum::Object(obj.into_iter().map(|(k, v)| (k, Datum::from(v))).collect())
            }
        }
    }
}

impl From<Datum> for serde_json::Value {
    fn from(datum: Datum) -> Self {
        match datum {
            Datum::Null => serde_json::Value::Null,
            Datum::Boolean(b) => serde_json::Value::Bool(b),
            Datum::Number(n) => serde_json::Value::Number(
                serde_json::Number::from_f64(n).unwrap_or_else(|| serde_json::Number::from(0)),
            ),
            Datum::String(s) => serde_json::Value::String(s),
            Datum::Binary(bytes) => serde_json::json!({
                "$reql_type$": "BINARY",
                "data": BASE64.encode(&bytes),
            }),
            Datum::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(serde_json::Value::from).collect())
            }
            Datum::Object(obj) => serde_json::Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "null"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Number(n) => write!(f, "{}", n),
            Datum::String(s) => write!(f, "\"{}\"", s),
            Datum::Binary(b) => write!(f, "<binary, {} bytes>", b.len()),
            Datum::Array(arr) => {
                write!(f, "[")?;
                for (i, item) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Datum::Object(obj) => {
                write!(f, "{{")?;
                for (i, (key, value)) in obj.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reql::error::ErrorKind;

    #[test]
    fn test_as_int() {
        assert_eq!(Datum::Number(3.0).as_int().unwrap(), 3);
        assert_eq!(Datum::Number(-2.0).as_int().unwrap(), -2);
        assert_eq!(
            Datum::Number(1.5).as_int().unwrap_err().kind(),
            ErrorKind::Logic
        );
        assert_eq!(
            Datum::String("3".into()).as_int().unwrap_err().kind(),
            ErrorKind::Type
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(!Datum::Null.is_truthy());
        assert!(!Datum::Boolean(false).is_truthy());
        assert!(Datum::Boolean(true).is_truthy());
        assert!(Datum::Number(0.0).is_truthy());
        assert!(Datum::String(String::new()).is_truthy());
    }

    #[test]
    fn test_total_order_across_types() {
        let null = Datum::Null;
        let num = Datum::Number(1.0);
        let s = Datum::String("a".into());
        assert_eq!(null.total_cmp(&num), Ordering::Less);
        assert_eq!(num.total_cmp(&s), Ordering::Less);
        assert_eq!(s.total_cmp(&null), Ordering::Greater);
    }

    #[test]
    fn test_array_lexicographic_order() {
        let a = Datum::Array(vec![Datum::Number(1.0), Datum::Number(2.0)]);
        let b = Datum::Array(vec![Datum::Number(1.0), Datum::Number(3.0)]);
        let c = Datum::Array(vec![Datum::Number(1.0)]);
        assert_eq!(a.total_cmp(&b), Ordering::Less);
        assert_eq!(c.total_cmp(&a), Ordering::Less);
    }

    #[test]
    fn test_array_builder_limit() {
        let limits = Limits {
            array_size_limit: 2,
        };
        let mut builder = ArrayBuilder::new(&limits);
        builder.push(Datum::Number(1.0)).unwrap();
        builder.push(Datum::Number(2.0)).unwrap();
        let err = builder.push(Datum::Number(3.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    }

    #[test]
    fn test_binary_json_round_trip() {
        let blob = Datum::Binary(vec![0, 159, 146, 150]);
        let json: serde_json::Value = blob.clone().into();
        assert_eq!(json["$reql_type$"], "BINARY");
        assert_eq!(Datum::from(json), blob);
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"name": "Alice", "age": 30, "tags": ["a", "b"]});
        let datum = Datum::from(json.clone());
        let obj = datum.as_object().unwrap();
        assert_eq!(obj.get("name").and_then(|d| d.as_string()), Some("Alice"));
        assert_eq!(obj.get("age").and_then(|d| d.as_number()), Some(30.0));
        let back: serde_json::Value = datum.clone().into();
        assert_eq!(back, json);
    }
}
