#![forbid(unsafe_code)]

//! Structured values with copy-on-write path updates.
//!
//! [`Value`] is a closed set of variants: scalars, sequences, mappings, and
//! named records. Containers use persistent collections from `im`, so
//! [`Value::with_path_replaced`] rebuilds only the spine from the root to the
//! replaced node; every untouched subtree is shared with the original.
//!
//! # Path steps
//!
//! | Step | Applies to | Missing on last step | Missing on inner step |
//! |------|-----------|----------------------|-----------------------|
//! | [`PathStep::Attr`] | `Record`, `Map` | record: error, map: insert | error |
//! | [`PathStep::Key`] | `Map` | insert | error |
//! | [`PathStep::Index`] | `Seq` | error | error |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::BuildHasher;

use im::{OrdMap, Vector};

use crate::error::{LensError, MergeError};

/// A structured value held by a [`Store<Value>`](crate::store::Store).
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vector<Value>),
    Map(OrdMap<String, Value>),
    Record {
        name: String,
        fields: OrdMap<String, Value>,
    },
}

/// One step of a lens path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    /// Record field (or mapping member) by name.
    Attr(String),
    /// Mapping key.
    Key(String),
    /// Sequence position.
    Index(usize),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attr(name) => write!(f, ".{name}"),
            Self::Key(key) => write!(f, "[{key:?}]"),
            Self::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// Render a path as `$.field["key"][0]`.
#[must_use]
pub fn format_path(path: &[PathStep]) -> String {
    let mut out = String::from("$");
    for step in path {
        out.push_str(&step.to_string());
    }
    out
}

impl Value {
    /// Record value with the given type name and fields.
    pub fn record<K, V>(name: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Record {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn seq<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        Self::Seq(items.into_iter().map(Into::into).collect())
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Seq(_) => "sequence",
            Self::Map(_) => "map",
            Self::Record { .. } => "record",
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, and integers widened to `f64`.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_seq(&self) -> Option<&Vector<Value>> {
        match self {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }

    /// Members of a map or record.
    #[must_use]
    pub fn as_map(&self) -> Option<&OrdMap<String, Value>> {
        match self {
            Self::Map(map) | Self::Record { fields: map, .. } => Some(map),
            _ => None,
        }
    }

    /// Number of children for containers.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Seq(items) => Some(items.len()),
            Self::Map(map) | Self::Record { fields: map, .. } => Some(map.len()),
            _ => None,
        }
    }

    fn child(&self, path: &[PathStep], depth: usize) -> Result<Option<&Value>, LensError> {
        let here = || format_path(&path[..=depth]);
        match (self, &path[depth]) {
            (Self::Record { fields, .. }, PathStep::Attr(field)) => match fields.get(field) {
                Some(child) => Ok(Some(child)),
                None => Err(LensError::MissingField {
                    path: here(),
                    field: field.clone(),
                }),
            },
            (Self::Map(map), PathStep::Attr(key) | PathStep::Key(key)) => Ok(map.get(key)),
            (Self::Seq(items), PathStep::Index(index)) => match items.get(*index) {
                Some(child) => Ok(Some(child)),
                None => Err(LensError::OutOfRange {
                    path: here(),
                    index: *index,
                    len: items.len(),
                }),
            },
            (other, _) => Err(LensError::NotAContainer {
                path: here(),
                found: other.kind(),
            }),
        }
    }

    /// Resolve `path` against this value.
    pub fn get_path(&self, path: &[PathStep]) -> Result<&Value, LensError> {
        let mut node = self;
        for (depth, step) in path.iter().enumerate() {
            node = match node.child(path, depth)? {
                Some(child) => child,
                None => {
                    return Err(LensError::MissingKey {
                        path: format_path(&path[..=depth]),
                        key: step_name(step),
                    });
                }
            };
        }
        Ok(node)
    }

    /// A copy of this value with the node at `path` replaced by `new`.
    ///
    /// `self` is not modified. A missing mapping key on the last step is
    /// inserted; any other unresolvable step is an error and nothing is
    /// written.
    pub fn with_path_replaced(&self, path: &[PathStep], new: Value) -> Result<Value, LensError> {
        self.replace_at(path, 0, new)
    }

    fn replace_at(&self, path: &[PathStep], depth: usize, new: Value) -> Result<Value, LensError> {
        if depth == path.len() {
            return Ok(new);
        }
        let last = depth + 1 == path.len();
        let replaced = match self.child(path, depth)? {
            Some(child) => child.replace_at(path, depth + 1, new)?,
            None if last => new,
            None => {
                return Err(LensError::MissingKey {
                    path: format_path(&path[..=depth]),
                    key: step_name(&path[depth]),
                });
            }
        };
        Ok(match (self, &path[depth]) {
            (Self::Record { name, fields }, PathStep::Attr(field)) => Self::Record {
                name: name.clone(),
                fields: fields.update(field.clone(), replaced),
            },
            (Self::Map(map), PathStep::Attr(key) | PathStep::Key(key)) => {
                Self::Map(map.update(key.clone(), replaced))
            }
            (Self::Seq(items), PathStep::Index(index)) => Self::Seq(items.update(*index, replaced)),
            // `child` already rejected every other combination.
            (other, _) => {
                return Err(LensError::NotAContainer {
                    path: format_path(&path[..=depth]),
                    found: other.kind(),
                });
            }
        })
    }
}

fn step_name(step: &PathStep) -> String {
    match step {
        PathStep::Attr(name) | PathStep::Key(name) => name.clone(),
        PathStep::Index(index) => index.to_string(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self))
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Type-aware partial update used by
/// [`Store::update`](crate::store::Store::update).
///
/// Record-like values replace named fields; mapping-like values replace (or
/// add) named keys. The result is a new value; `self` is untouched.
pub trait Merge: Sized {
    /// The partial update.
    type Patch;

    fn merge(&self, patch: Self::Patch) -> Result<Self, MergeError>;
}

/// Named members to replace in a [`Value`], in application order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(Vec<(String, Value)>);

impl Fields {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member to the patch.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Fields {
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl Merge for Value {
    type Patch = Fields;

    fn merge(&self, patch: Fields) -> Result<Self, MergeError> {
        match self {
            Self::Record { name, fields } => {
                let mut fields = fields.clone();
                for (field, value) in patch.0 {
                    if !fields.contains_key(&field) {
                        return Err(MergeError::UnknownField {
                            record: name.clone(),
                            field,
                        });
                    }
                    fields.insert(field, value);
                }
                Ok(Self::Record {
                    name: name.clone(),
                    fields,
                })
            }
            Self::Map(map) => {
                let mut map = map.clone();
                for (key, value) in patch.0 {
                    map.insert(key, value);
                }
                Ok(Self::Map(map))
            }
            other => Err(MergeError::NotMergeable {
                found: other.kind(),
            }),
        }
    }
}

impl<V: Clone> Merge for BTreeMap<String, V> {
    type Patch = Vec<(String, V)>;

    fn merge(&self, patch: Self::Patch) -> Result<Self, MergeError> {
        let mut next = self.clone();
        next.extend(patch);
        Ok(next)
    }
}

impl<V: Clone, S: BuildHasher + Clone> Merge for HashMap<String, V, S> {
    type Patch = Vec<(String, V)>;

    fn merge(&self, patch: Self::Patch) -> Result<Self, MergeError> {
        let mut next = self.clone();
        next.extend(patch);
        Ok(next)
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(value: Option<V>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Self::seq(items)
    }
}

impl<V: Into<Value>> From<BTreeMap<String, V>> for Value {
    fn from(entries: BTreeMap<String, V>) -> Self {
        Self::map(entries)
    }
}

impl<V: Into<Value>, S: BuildHasher> From<HashMap<String, V, S>> for Value {
    fn from(entries: HashMap<String, V, S>) -> Self {
        Self::map(entries)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            Json::String(s) => Self::Str(s),
            Json::Array(items) => Self::Seq(items.into_iter().map(Self::from).collect()),
            Json::Object(map) => Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

/// Records serialize as plain objects; non-finite floats become `null`.
impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(x) => serde_json::Number::from_f64(*x).map_or(Json::Null, Json::Number),
            Value::Str(s) => Json::String(s.clone()),
            Value::Seq(items) => Json::Array(items.iter().map(Json::from).collect()),
            Value::Map(map) | Value::Record { fields: map, .. } => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Json::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        Self::from(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str) -> PathStep {
        PathStep::Attr(name.to_string())
    }

    fn doc() -> Value {
        Value::record(
            "Doc",
            [
                ("title", Value::from("draft")),
                ("tags", Value::seq(["a", "b"])),
                ("meta", Value::map([("owner", "ana")])),
            ],
        )
    }

    #[test]
    fn get_path_walks_all_step_kinds() {
        let doc = doc();
        let path = [attr("tags"), PathStep::Index(1)];
        assert_eq!(doc.get_path(&path), Ok(&Value::from("b")));
        let path = [attr("meta"), PathStep::Key("owner".into())];
        assert_eq!(doc.get_path(&path).ok().and_then(Value::as_str), Some("ana"));
        assert_eq!(doc.get_path(&[]), Ok(&doc));
    }

    #[test]
    fn replace_leaves_original_untouched() {
        let doc = doc();
        let path = [attr("tags"), PathStep::Index(0)];
        let next = doc.with_path_replaced(&path, Value::from("z")).unwrap();
        assert_eq!(next.get_path(&path), Ok(&Value::from("z")));
        assert_eq!(doc.get_path(&path), Ok(&Value::from("a")));
        assert_eq!(next.get_path(&[attr("title")]), doc.get_path(&[attr("title")]));
    }

    #[test]
    fn index_past_end_is_out_of_range() {
        let list = Value::seq([1, 2]);
        let err = list
            .with_path_replaced(&[PathStep::Index(2)], Value::from(3))
            .unwrap_err();
        assert_eq!(
            err,
            LensError::OutOfRange {
                path: "$[2]".into(),
                index: 2,
                len: 2
            }
        );
    }

    #[test]
    fn map_key_is_inserted_only_on_last_step() {
        let doc = doc();
        let path = [attr("meta"), PathStep::Key("reviewer".into())];
        let next = doc.with_path_replaced(&path, Value::from("bo")).unwrap();
        assert_eq!(next.get_path(&path), Ok(&Value::from("bo")));

        let deep = [attr("meta"), PathStep::Key("missing".into()), attr("x")];
        assert!(matches!(
            doc.with_path_replaced(&deep, Value::Null),
            Err(LensError::MissingKey { .. })
        ));
    }

    #[test]
    fn record_rejects_unknown_field() {
        let err = doc().with_path_replaced(&[attr("nope")], Value::Null).unwrap_err();
        assert!(matches!(err, LensError::MissingField { ref field, .. } if field == "nope"));
    }

    #[test]
    fn scalar_is_not_a_container() {
        let err = Value::from(3).get_path(&[PathStep::Index(0)]).unwrap_err();
        assert_eq!(
            err,
            LensError::NotAContainer {
                path: "$[0]".into(),
                found: "int"
            }
        );
    }

    #[test]
    fn merge_record_and_map() {
        let next = doc().merge(Fields::new().with("title", "final")).unwrap();
        assert_eq!(next.get_path(&[attr("title")]), Ok(&Value::from("final")));
        assert!(matches!(
            doc().merge(Fields::from([("bogus", 1)])),
            Err(MergeError::UnknownField { .. })
        ));

        let map = Value::map([("a", 1)]);
        let next = map.merge(Fields::from([("b", 2)])).unwrap();
        assert_eq!(next.len(), Some(2));
        assert!(matches!(
            Value::from(1).merge(Fields::new()),
            Err(MergeError::NotMergeable { found: "int" })
        ));
    }

    #[test]
    fn json_conversion() {
        let json = serde_json::json!({"n": 1, "x": 1.5, "items": [true, null], "s": "hi"});
        let value = Value::from(json.clone());
        assert_eq!(value.get_path(&[attr("n")]), Ok(&Value::Int(1)));
        assert_eq!(serde_json::Value::from(&value), json);
        assert_eq!(value.to_string(), json.to_string());
    }

    proptest::proptest! {
        #[test]
        fn replace_at_index_round_trips(
            items in proptest::collection::vec(proptest::prelude::any::<i64>(), 1..16),
            pick in proptest::prelude::any::<proptest::sample::Index>(),
            new in proptest::prelude::any::<i64>(),
        ) {
            let list = Value::seq(items.clone());
            let path = [PathStep::Index(pick.index(items.len()))];
            let next = list.with_path_replaced(&path, Value::from(new)).unwrap();
            proptest::prop_assert_eq!(next.get_path(&path), Ok(&Value::Int(new)));
            proptest::prop_assert_eq!(next.len(), Some(items.len()));
            proptest::prop_assert_eq!(list, Value::seq(items));
        }
    }

    #[test]
    fn path_display() {
        let path = [attr("a"), PathStep::Key("b c".into()), PathStep::Index(3)];
        assert_eq!(format_path(&path), r#"$.a["b c"][3]"#);
    }
}
