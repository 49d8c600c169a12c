//! Merge of nested child collections by child identity.

use std::collections::HashMap;

use crate::config::EntitySpec;
use crate::error::ReconError;
use crate::executor::{reconcile, MergeContext};
use crate::model::{EntityRecord, SourceCluster, Value};
use crate::policy::{effective_priority, SourceValues};

/// Where a nested collection sits: the parent record and field holding it,
/// and the child entity's spec.
pub struct NestedField<'a> {
    pub parent: &'a str,
    pub parent_identity: &'a Value,
    pub field: &'a str,
    pub child: &'a EntitySpec,
    pub default: &'a Value,
}

/// Group every source's children by child identity (first seen first) and
/// reconcile each group with the child spec. Returns one record per
/// distinct child identity.
pub fn merge_nested(
    nested: &NestedField<'_>,
    values: &SourceValues<'_>,
    priority: &[String],
    ctx: MergeContext<'_>,
) -> Result<Value, ReconError> {
    if values.is_empty() {
        return Ok(nested.default.clone());
    }

    let mut groups: Vec<SourceCluster<'_>> = Vec::new();
    let mut by_identity: HashMap<Value, usize> = HashMap::new();

    for tag in effective_priority(values.keys().copied(), priority) {
        let Some(value) = values.get(tag.as_str()).copied() else {
            continue;
        };
        for child in child_records(nested, &tag, value)? {
            let identity = child.present(&nested.child.identity).ok_or_else(|| {
                ReconError::MissingIdentity {
                    entity: nested.child.name.clone(),
                    source_tag: tag.clone(),
                    field: nested.child.identity.clone(),
                    context: format!(
                        "{} {} -> {}",
                        nested.parent, nested.parent_identity, nested.field
                    ),
                }
            })?;
            let slot = *by_identity.entry(identity.clone()).or_insert_with(|| {
                groups.push(SourceCluster::new(identity.clone()));
                groups.len() - 1
            });
            groups[slot].insert(&tag, child);
        }
    }

    let merged = groups
        .iter()
        .map(|group| reconcile(nested.child, group, priority, ctx))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Records(merged))
}

/// The child records one source put in a nested field.
fn child_records<'v>(
    nested: &NestedField<'_>,
    tag: &str,
    value: &'v Value,
) -> Result<Vec<&'v EntityRecord>, ReconError> {
    let invalid = |found: &str| ReconError::InvalidValue {
        entity: nested.parent.to_string(),
        field: nested.field.to_string(),
        reason: format!(
            "source {tag}: expected {} records, found {found}",
            nested.child.name
        ),
    };
    match value {
        Value::Records(records) => Ok(records.iter().collect()),
        Value::Object(record) => Ok(vec![record]),
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(record) => Ok(record),
                other => Err(invalid(other.kind())),
            })
            .collect(),
        other => Err(invalid(other.kind())),
    }
}
