//! Field merge policies.
//!
//! Every policy is a pure function of the non-null values gathered from a
//! cluster (keyed by source tag), the priority order and the field default.

use std::collections::{BTreeMap, HashSet};

use crate::model::{CodedText, EntityRecord, Identifier, Value};

/// Non-null field values keyed by source tag.
pub type SourceValues<'a> = BTreeMap<&'a str, &'a Value>;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Sort key for a source tag: listed position, base source name, then the
/// `#n` ordinals of duplicate records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TagRank<'t> {
    position: usize,
    base: &'t str,
    ordinals: Vec<u32>,
}

fn rank<'t>(tag: &'t str, priority: &[String]) -> TagRank<'t> {
    if let Some(position) = priority.iter().position(|p| p == tag) {
        return TagRank {
            position,
            base: "",
            ordinals: Vec::new(),
        };
    }

    let mut parts = tag.split('#');
    let base = parts.next().unwrap_or(tag);
    let ordinals = parts.map(|n| n.parse().unwrap_or(u32::MAX)).collect();
    match priority.iter().position(|p| p == base) {
        Some(position) => TagRank {
            position,
            base: "",
            ordinals,
        },
        None => TagRank {
            position: priority.len(),
            base,
            ordinals,
        },
    }
}

/// Order every tag of a cluster: listed sources in priority order (with
/// their duplicates right behind them), then unlisted sources by name.
pub fn effective_priority<'t, I>(tags: I, priority: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = &'t str>,
{
    let mut ranked: Vec<(TagRank<'t>, &'t str)> =
        tags.into_iter().map(|tag| (rank(tag, priority), tag)).collect();
    ranked.sort();
    ranked.dedup_by(|a, b| a.1 == b.1);
    ranked.into_iter().map(|(_, tag)| tag.to_string()).collect()
}

/// Values in priority order; sources missing from `priority` follow in tag
/// order.
pub fn in_priority<'p, 'v>(
    values: &'p SourceValues<'v>,
    priority: &'p [String],
) -> impl Iterator<Item = (&'p str, &'v Value)> + 'p {
    let listed = priority
        .iter()
        .filter_map(move |tag| values.get_key_value(tag.as_str()).map(|(t, v)| (*t, *v)));
    let unlisted = values
        .iter()
        .map(|(t, v)| (*t, *v))
        .filter(move |(tag, _)| !priority.iter().any(|p| p.as_str() == *tag));
    listed.chain(unlisted).filter(|(_, v)| !v.is_null())
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Winning source and value for `coalesce`. Only listed sources compete.
pub fn coalesce_pick<'p, 'v>(
    values: &SourceValues<'v>,
    priority: &'p [String],
) -> Option<(&'p str, &'v Value)> {
    priority.iter().find_map(|tag| {
        values
            .get(tag.as_str())
            .filter(|v| !v.is_null())
            .map(|v| (tag.as_str(), *v))
    })
}

pub fn coalesce(values: &SourceValues<'_>, priority: &[String], default: &Value) -> Value {
    coalesce_pick(values, priority)
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| default.clone())
}

pub fn append(values: &SourceValues<'_>, priority: &[String]) -> Value {
    let mut out = Vec::new();
    for (_, value) in in_priority(values, priority) {
        flatten_one(value, &mut out);
    }
    Value::List(out)
}

/// `append`, keeping the first occurrence of each value.
pub fn append_unique(values: &SourceValues<'_>, priority: &[String]) -> Value {
    let Value::List(items) = append(values, priority) else {
        return Value::List(Vec::new());
    };
    let mut seen = HashSet::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    Value::List(out)
}

/// Union of `{system, value}` pairs, first occurrence in priority order kept.
pub fn merge_identifiers(values: &SourceValues<'_>, priority: &[String], default: &Value) -> Value {
    if values.is_empty() {
        return default.clone();
    }

    let mut seen: HashSet<Identifier> = HashSet::new();
    let mut out = Vec::new();
    for (tag, value) in in_priority(values, priority) {
        let Some(ids) = identifiers_of(value) else {
            log::warn!("source {tag}: ignoring {} value in identifier field", value.kind());
            continue;
        };
        for id in ids {
            if seen.insert(id.clone()) {
                out.push(id);
            }
        }
    }
    Value::Identifiers(out)
}

/// `coalesce` on text, `append` on codings.
pub fn merge_coded_text(values: &SourceValues<'_>, priority: &[String], default: &Value) -> Value {
    if values.is_empty() {
        return coded_default(default);
    }
    let text = coalesce(&coded_texts(values), priority, &coded_fallback(default));
    with_codings(values, priority, text)
}

/// Each source's text. A bare string is text without codings.
pub fn coded_texts<'v>(values: &SourceValues<'v>) -> SourceValues<'v> {
    values
        .iter()
        .map(|(tag, value)| {
            let text = match *value {
                Value::Coded(coded) => coded.text.as_ref(),
                Value::Object(record) => record.value("text"),
                other => other,
            };
            (*tag, text)
        })
        .collect()
}

/// Text used when no source has one.
pub fn coded_fallback(default: &Value) -> Value {
    match default {
        Value::Coded(coded) => coded.text.as_ref().clone(),
        Value::Str(_) => default.clone(),
        _ => Value::Null,
    }
}

/// A coded-text default, with a plain string promoted to text.
pub fn coded_default(default: &Value) -> Value {
    match default {
        Value::Str(_) => Value::Coded(CodedText::new(default.clone(), Vec::new())),
        other => other.clone(),
    }
}

/// Every source's codings in priority order, under an already chosen text.
pub fn with_codings(values: &SourceValues<'_>, priority: &[String], text: Value) -> Value {
    let mut coding = Vec::new();
    for (_, value) in in_priority(values, priority) {
        match value {
            Value::Coded(coded) => coding.extend(coded.coding.iter().cloned()),
            Value::Object(record) => flatten_one(record.value("coding"), &mut coding),
            _ => {}
        }
    }

    Value::Coded(CodedText {
        text: Box::new(text),
        coding,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Push a value's items one level deep.
pub(crate) fn flatten_one(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Null => {}
        Value::List(items) => out.extend(items.iter().cloned()),
        Value::Records(records) => out.extend(records.iter().cloned().map(Value::Object)),
        Value::Identifiers(ids) => out.extend(ids.iter().map(identifier_object)),
        other => out.push(other.clone()),
    }
}

fn identifier_object(id: &Identifier) -> Value {
    Value::Object(
        EntityRecord::new()
            .with("system", id.system.as_str())
            .with("value", id.value.as_str()),
    )
}

/// Identifier pairs carried by a value, if it has that shape.
fn identifiers_of(value: &Value) -> Option<Vec<Identifier>> {
    match value {
        Value::Identifiers(ids) => Some(ids.clone()),
        Value::Object(record) => identifier_from_record(record).map(|id| vec![id]),
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(record) => identifier_from_record(record),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn identifier_from_record(record: &EntityRecord) -> Option<Identifier> {
    let part = |key: &str| match record.present(key)? {
        Value::Str(s) => Some(s.clone()),
        scalar @ (Value::Int(_) | Value::Float(_) | Value::Bool(_)) => Some(scalar.to_string()),
        _ => None,
    };
    Some(Identifier::new(part("system")?, part("value")?))
}
