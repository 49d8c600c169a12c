//! Config-aware loading of normalized records.
//!
//! Field shapes come from the entity's merge policies: identifier lists,
//! coded text and nested record lists are only produced here, so the merge
//! code can match on `Value` variants instead of probing JSON.

use serde_json::Value as Json;

use crate::config::{EntitySpec, MergePolicy, ReconConfig};
use crate::error::ReconError;
use crate::model::{CodedText, EntityRecord, Identifier, Value};

/// Parse one source's records: JSON Lines (blank lines skipped) or a single
/// JSON array. Records are shaped by the root entity's spec.
pub fn load_records(
    source: &str,
    data: &str,
    config: &ReconConfig,
) -> Result<Vec<EntityRecord>, ReconError> {
    let root = config.root_spec()?;
    let parse_err = |line: usize, message: String| ReconError::InputParse {
        source_tag: source.to_string(),
        line,
        message,
    };

    if data.trim_start().starts_with('[') {
        let items: Vec<Json> =
            serde_json::from_str(data).map_err(|e| parse_err(e.line(), e.to_string()))?;
        return items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                record_from_json(item, root, config).map_err(|e| parse_err(i + 1, e.to_string()))
            })
            .collect();
    }

    let mut records = Vec::new();
    for (i, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let json: Json = serde_json::from_str(line).map_err(|e| parse_err(i + 1, e.to_string()))?;
        let record =
            record_from_json(json, root, config).map_err(|e| parse_err(i + 1, e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}

/// Convert one JSON object into a record of the given entity type.
/// Fields the entity does not declare are converted untyped.
pub fn record_from_json(
    json: Json,
    spec: &EntitySpec,
    config: &ReconConfig,
) -> Result<EntityRecord, ReconError> {
    let Json::Object(map) = json else {
        return Err(ReconError::InvalidValue {
            entity: spec.name.clone(),
            field: "<record>".into(),
            reason: format!("expected a JSON object, found {}", json_kind(&json)),
        });
    };

    let mut record = EntityRecord::new();
    for (field, value) in map {
        let field_spec = spec.fields.get(&field);
        // Identifiers keep numbers as exact text; child records check themselves.
        let exact = matches!(
            field_spec.map(|f| &f.policy),
            Some(MergePolicy::MergeIdentifiers | MergePolicy::MergeNestedById { .. })
        );
        if let Some(n) = oversized_integer(&value).filter(|_| !exact) {
            return Err(ReconError::InvalidValue {
                entity: spec.name.clone(),
                field,
                reason: format!("integer {n} does not fit a signed 64-bit value"),
            });
        }
        let value = match field_spec {
            Some(field_spec) => convert_value(value, &field_spec.policy, &spec.name, &field, config)?,
            None => Value::from(value),
        };
        record.insert(field, value);
    }
    Ok(record)
}

/// Convert a field's JSON value into the shape its policy merges.
pub fn convert_value(
    json: Json,
    policy: &MergePolicy,
    entity: &str,
    field: &str,
    config: &ReconConfig,
) -> Result<Value, ReconError> {
    if json.is_null() {
        return Ok(Value::Null);
    }
    let invalid = |reason: String| ReconError::InvalidValue {
        entity: entity.to_string(),
        field: field.to_string(),
        reason,
    };

    match policy {
        MergePolicy::MergeIdentifiers => identifiers_from_json(json).map(Value::Identifiers).map_err(invalid),
        MergePolicy::MergeCodedText => coded_from_json(json).map(Value::Coded).map_err(invalid),
        MergePolicy::MergeNestedById { entity: child } => {
            let child_spec = config.entity(child)?;
            match json {
                Json::Array(items) => items
                    .into_iter()
                    .map(|item| record_from_json(item, child_spec, config))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Records),
                other => Err(invalid(format!(
                    "expected a list of {child} records, found {}",
                    json_kind(&other)
                ))),
            }
        }
        MergePolicy::Coalesce | MergePolicy::Append | MergePolicy::AppendUnique => Ok(Value::from(json)),
    }
}

fn identifiers_from_json(json: Json) -> Result<Vec<Identifier>, String> {
    match json {
        Json::Array(items) => items.into_iter().map(identifier_from_json).collect(),
        Json::Object(_) => Ok(vec![identifier_from_json(json)?]),
        other => Err(format!(
            "expected a list of {{system, value}} identifiers, found {}",
            json_kind(&other)
        )),
    }
}

fn identifier_from_json(json: Json) -> Result<Identifier, String> {
    let Json::Object(map) = json else {
        return Err(format!("expected an identifier object, found {}", json_kind(&json)));
    };
    let part = |key: &str| -> Result<String, String> {
        match map.get(key) {
            Some(Json::String(s)) => Ok(s.clone()),
            Some(Json::Number(n)) => Ok(n.to_string()),
            Some(Json::Bool(b)) => Ok(b.to_string()),
            Some(other) if !other.is_null() => {
                Err(format!("identifier '{key}' must be a scalar, found {}", json_kind(other)))
            }
            _ => Err(format!("identifier is missing '{key}'")),
        }
    };
    Ok(Identifier {
        system: part("system")?,
        value: part("value")?,
    })
}

fn coded_from_json(json: Json) -> Result<CodedText, String> {
    match json {
        Json::String(text) => Ok(CodedText::new(text, Vec::new())),
        Json::Object(mut map) => {
            let text = map.remove("text").map(Value::from).unwrap_or_default();
            let coding = match map.remove("coding") {
                None | Some(Json::Null) => Vec::new(),
                Some(Json::Array(items)) => items.into_iter().map(Value::from).collect(),
                Some(single) => vec![Value::from(single)],
            };
            Ok(CodedText {
                text: Box::new(text),
                coding,
            })
        }
        other => Err(format!(
            "expected {{text, coding}} or a string, found {}",
            json_kind(&other)
        )),
    }
}

/// First integer that would lose precision as `Value::Float`.
fn oversized_integer(json: &Json) -> Option<&serde_json::Number> {
    match json {
        Json::Number(n) if n.is_u64() && !n.is_i64() => Some(n),
        Json::Array(items) => items.iter().find_map(oversized_integer),
        Json::Object(map) => map.values().find_map(oversized_integer),
        _ => None,
    }
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
