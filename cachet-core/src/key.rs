//! Query keys and their canonical encoding.
//!
//! A [`QueryKey`] is an ordered list of segments. Each segment is either a
//! primitive (null, bool, number, string) or a flat object whose values are
//! primitives. Two keys are equal iff their canonical encodings are equal;
//! object fields are encoded in sorted order so that field order in the
//! input never changes the key.
//!
//! Keys are hierarchical by convention: `["posts"]` is a prefix of
//! `["posts", "codeit"]`, which lets bulk operations target a whole family
//! of entries through a [`KeyFilter`].

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

use crate::error::KeyError;

// ============================================================================
// PRIMITIVES AND SEGMENTS
// ============================================================================

/// A scalar key component.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
}

impl Primitive {
    /// Convert a JSON value into a primitive, rejecting arrays and objects.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => Some(Self::Number(integral(n.clone()))),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Convert back into a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
        }
    }

    /// Create a floating point primitive. Fails for NaN and infinities.
    pub fn float(value: f64) -> Result<Self, KeyError> {
        Number::from_f64(value)
            .map(|n| Self::Number(integral(n)))
            .ok_or_else(|| KeyError::InvalidSegment {
                index: 0,
                reason: format!("{value} is not a finite number"),
            })
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(true) => out.push_str("true"),
            Self::Bool(false) => out.push_str("false"),
            Self::Number(n) => out.push_str(&integral(n.clone()).to_string()),
            // Display on a JSON string value yields the escaped, quoted form.
            Self::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        }
    }
}

/// Integral floats become integers, so `1` and `1.0` name the same key.
fn integral(n: Number) -> Number {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < EXACT => Number::from(f as i64),
        _ => n,
    }
}

macro_rules! primitive_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Primitive {
                fn from(value: $ty) -> Self {
                    Self::Number(Number::from(value))
                }
            }
        )*
    };
}

primitive_from_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl From<bool> for Primitive {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Primitive {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Primitive {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&String> for Primitive {
    fn from(value: &String) -> Self {
        Self::String(value.clone())
    }
}

impl<T: Into<Primitive>> From<Option<T>> for Primitive {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One component of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq)]
pub enum KeySegment {
    Primitive(Primitive),
    /// Flat object; fields are kept sorted.
    Object(BTreeMap<String, Primitive>),
}

impl KeySegment {
    /// Build an object segment from `(field, value)` pairs.
    pub fn object<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Primitive>,
    {
        Self::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Convert a JSON value into a segment.
    ///
    /// Objects must be flat: any nested array or object is rejected.
    pub fn from_json(index: usize, value: &Value) -> Result<Self, KeyError> {
        match value {
            Value::Array(_) => Err(KeyError::InvalidSegment {
                index,
                reason: "arrays are not allowed as key segments".to_string(),
            }),
            Value::Object(map) => {
                let mut fields = BTreeMap::new();
                for (field, inner) in map {
                    let primitive =
                        Primitive::from_json(inner).ok_or_else(|| KeyError::InvalidSegment {
                            index,
                            reason: format!("field `{field}` is not a primitive"),
                        })?;
                    fields.insert(field.clone(), primitive);
                }
                Ok(Self::Object(fields))
            }
            other => Ok(Self::Primitive(
                Primitive::from_json(other).unwrap_or(Primitive::Null),
            )),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Primitive(p) => p.to_json(),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Does `self`, taken from a candidate prefix, match `other` from a full key?
    ///
    /// Object segments match when every field present in `self` is present
    /// in `other` with an equal value.
    pub fn matches(&self, other: &KeySegment) -> bool {
        match (self, other) {
            (Self::Primitive(a), Self::Primitive(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => {
                a.iter().all(|(field, value)| b.get(field) == Some(value))
            }
            _ => false,
        }
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Self::Primitive(p) => p.write_canonical(out),
            Self::Object(fields) => {
                out.push('{');
                for (i, (field, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String(field.clone()).to_string());
                    out.push(':');
                    value.write_canonical(out);
                }
                out.push('}');
            }
        }
    }
}

impl<T: Into<Primitive>> From<T> for KeySegment {
    fn from(value: T) -> Self {
        Self::Primitive(value.into())
    }
}

impl From<BTreeMap<String, Primitive>> for KeySegment {
    fn from(value: BTreeMap<String, Primitive>) -> Self {
        Self::Object(value)
    }
}

// ============================================================================
// QUERY KEY
// ============================================================================

/// Structured cache key with a precomputed canonical encoding.
#[derive(Clone)]
pub struct QueryKey {
    segments: Vec<KeySegment>,
    canonical: String,
}

impl QueryKey {
    pub fn new(segments: Vec<KeySegment>) -> Self {
        let canonical = encode_segments(&segments);
        Self {
            segments,
            canonical,
        }
    }

    /// The empty key. It is a prefix of every key.
    pub fn root() -> Self {
        Self::new(Vec::new())
    }

    /// Parse a key from a JSON array.
    pub fn from_json(value: &Value) -> Result<Self, KeyError> {
        let items = value.as_array().ok_or(KeyError::NotAnArray)?;
        let segments = items
            .iter()
            .enumerate()
            .map(|(i, v)| KeySegment::from_json(i, v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(segments))
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.segments.iter().map(KeySegment::to_json).collect())
    }

    /// Return a new key with `segment` appended.
    pub fn child(&self, segment: impl Into<KeySegment>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self::new(segments)
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.segments
    }

    /// Canonical string encoding used as the map index.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True iff `self` is a (non-strict) prefix of `full`.
    pub fn is_prefix_of(&self, full: &QueryKey) -> bool {
        is_prefix_of(self, full)
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.canonical)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        QueryKey::from_json(&value).map_err(D::Error::custom)
    }
}

/// Build a [`QueryKey`] from a list of segment expressions.
///
/// ```ignore
/// let key = query_key!["likeStatus", post_id, username];
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::QueryKey::root()
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::QueryKey::new(vec![$($crate::KeySegment::from($segment)),+])
    };
}

// ============================================================================
// CODEC FUNCTIONS
// ============================================================================

/// Deterministic canonical encoding of a key.
pub fn encode(key: &QueryKey) -> String {
    key.canonical.clone()
}

/// True iff every segment of `candidate`, in order, matches the
/// corresponding segment of `full`.
pub fn is_prefix_of(candidate: &QueryKey, full: &QueryKey) -> bool {
    candidate.segments.len() <= full.segments.len()
        && candidate
            .segments
            .iter()
            .zip(full.segments.iter())
            .all(|(c, f)| c.matches(f))
}

fn encode_segments(segments: &[KeySegment]) -> String {
    let mut out = String::with_capacity(segments.len() * 12 + 2);
    out.push('[');
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        segment.write_canonical(&mut out);
    }
    out.push(']');
    out
}

// ============================================================================
// FILTERS
// ============================================================================

/// Selects entries for bulk operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// Every entry in the cache.
    All,
    /// Exactly one key.
    Exact(QueryKey),
    /// Every key that starts with the given key.
    Prefix(QueryKey),
}

impl KeyFilter {
    pub fn exact(key: QueryKey) -> Self {
        Self::Exact(key)
    }

    pub fn prefix(key: QueryKey) -> Self {
        Self::Prefix(key)
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => exact == key,
            Self::Prefix(prefix) => prefix.is_prefix_of(key),
        }
    }
}

/// A bare key filters by prefix, which is what bulk invalidation wants by default.
impl From<QueryKey> for KeyFilter {
    fn from(key: QueryKey) -> Self {
        Self::Prefix(key)
    }
}

impl From<&QueryKey> for KeyFilter {
    fn from(key: &QueryKey) -> Self {
        Self::Prefix(key.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn primitive_strategy() -> impl Strategy<Value = Primitive> {
        prop_oneof![
            Just(Primitive::Null),
            any::<bool>().prop_map(Primitive::Bool),
            any::<i64>().prop_map(Primitive::from),
            "[a-z]{0,8}".prop_map(Primitive::String),
        ]
    }

    fn segment_strategy() -> impl Strategy<Value = KeySegment> {
        prop_oneof![
            primitive_strategy().prop_map(KeySegment::Primitive),
            prop::collection::btree_map("[a-z]{1,6}", primitive_strategy(), 0..4)
                .prop_map(KeySegment::Object),
        ]
    }

    fn key_strategy() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(segment_strategy(), 0..5).prop_map(QueryKey::new)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Object field insertion order never changes the encoding.
        #[test]
        fn prop_encoding_ignores_field_order(
            fields in prop::collection::vec(("[a-z]{1,6}", any::<i64>()), 0..6)
        ) {
            let forward = KeySegment::object(fields.iter().cloned());
            let reversed = KeySegment::object(fields.iter().rev().cloned());
            // Duplicate field names keep the last insert, so compare only unique sets.
            let unique: std::collections::BTreeSet<_> = fields.iter().map(|(k, _)| k.clone()).collect();
            prop_assume!(unique.len() == fields.len());
            prop_assert_eq!(QueryKey::new(vec![forward]), QueryKey::new(vec![reversed]));
        }

        /// Every key is a prefix of itself and of its children.
        #[test]
        fn prop_prefix_reflexive_and_extends(key in key_strategy(), extra in segment_strategy()) {
            prop_assert!(key.is_prefix_of(&key));
            let child = key.child(extra);
            prop_assert!(key.is_prefix_of(&child));
            prop_assert!(!child.is_prefix_of(&key));
        }

        /// Encoding then parsing yields an equal key.
        #[test]
        fn prop_json_parse_preserves_identity(key in key_strategy()) {
            let parsed = QueryKey::from_json(&key.to_json()).unwrap();
            prop_assert_eq!(parsed.canonical(), key.canonical());
        }
    }
}
