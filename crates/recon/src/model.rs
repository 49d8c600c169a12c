use std::collections::BTreeMap;
use std::fmt;

use ordered_float::OrderedFloat;
use serde::{Serialize, Serializer};

use crate::conflict::ConflictReport;

/// Shared null returned for missing fields.
pub(crate) static NULL: Value = Value::Null;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// One `{system, value}` identifier pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Identifier {
    pub system: String,
    pub value: String,
}

impl Identifier {
    pub fn new(system: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            value: value.into(),
        }
    }
}

/// Free text plus a list of codings (a "codeable concept").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CodedText {
    pub text: Box<Value>,
    pub coding: Vec<Value>,
}

impl CodedText {
    pub fn new(text: impl Into<Value>, coding: Vec<Value>) -> Self {
        Self {
            text: Box::new(text.into()),
            coding,
        }
    }
}

/// A field value. Nested collections of child entities are `Records`, so the
/// nested merger never has to guess whether a list holds records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(String),
    Identifiers(Vec<Identifier>),
    Coded(CodedText),
    List(Vec<Value>),
    Object(EntityRecord),
    Records(Vec<EntityRecord>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short shape name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Identifiers(_) => "identifier list",
            Self::Coded(_) => "coded text",
            Self::List(_) => "list",
            Self::Object(_) => "object",
            Self::Records(_) => "record list",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(OrderedFloat(f))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<EntityRecord> for Value {
    fn from(record: EntityRecord) -> Self {
        Self::Object(record)
    }
}

/// Untyped conversion. Identifier lists, coded text and record lists only
/// come out of the config-aware loader in `input`, which also rejects
/// integers above `i64::MAX` before they reach the `Float` fallback here.
impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(OrderedFloat(n.as_f64().unwrap_or(f64::NAN))),
            },
            Json::String(s) => Self::Str(s),
            Json::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Json::Object(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(f.into_inner()),
            Self::Str(s) => serializer.serialize_str(s),
            Self::Identifiers(ids) => ids.serialize(serializer),
            Self::Coded(coded) => coded.serialize(serializer),
            Self::List(items) => items.serialize(serializer),
            Self::Object(record) => record.serialize(serializer),
            Self::Records(records) => records.serialize(serializer),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
            other => {
                let json = serde_json::to_string(other).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A normalized entity record: field name → value, ordered by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityRecord {
    fields: BTreeMap<String, Value>,
}

impl EntityRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field value with missing fields read as null.
    pub fn value(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    /// Field value if present and non-null.
    pub fn present(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Builder-style insert, handy for literals in tests and fixtures.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }
}

impl FromIterator<(String, Value)> for EntityRecord {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// Source tag → record, for records sharing one identity.
pub type Members<'a> = BTreeMap<String, &'a EntityRecord>;

/// All records (one per source tag) known to describe one identity.
#[derive(Debug, Clone)]
pub struct SourceCluster<'a> {
    pub identity: Value,
    pub members: Members<'a>,
}

impl<'a> SourceCluster<'a> {
    pub fn new(identity: Value) -> Self {
        Self {
            identity,
            members: Members::new(),
        }
    }

    /// Add a record, returning the tag it was filed under. A second record
    /// from the same source becomes `source#2`, and so on.
    pub fn insert(&mut self, source: &str, record: &'a EntityRecord) -> String {
        let tag = unique_tag(&self.members, source);
        self.members.insert(tag.clone(), record);
        tag
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// First free tag among `source`, `source#2`, `source#3`, ...
pub(crate) fn unique_tag<V>(taken: &BTreeMap<String, V>, source: &str) -> String {
    if !taken.contains_key(source) {
        return source.to_string();
    }
    let mut ordinal = 2u32;
    loop {
        let tag = format!("{source}#{ordinal}");
        if !taken.contains_key(&tag) {
            return tag;
        }
        ordinal += 1;
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Normalized records from one upstream source.
#[derive(Debug, Clone)]
pub struct SourceInput {
    pub source: String,
    pub records: Vec<EntityRecord>,
}

/// Every stream taking part in one run. A stream may repeat identities.
#[derive(Debug, Clone, Default)]
pub struct ReconInput {
    pub sources: Vec<SourceInput>,
}

// ---------------------------------------------------------------------------
// Summary + Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconSummary {
    pub input_records: usize,
    pub identities: usize,
    pub merged: usize,
    pub passed_through: usize,
    pub conflicts: usize,
    pub resolutions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconMeta {
    pub config_name: String,
    pub root_entity: String,
    pub engine_version: String,
    pub run_at: String,
    pub source_priority: Vec<String>,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconResult {
    pub meta: ReconMeta,
    pub summary: ReconSummary,
    /// One record per top-level identity, in identity order.
    pub records: Vec<EntityRecord>,
    pub report: ConflictReport,
}
