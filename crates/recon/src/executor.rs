//! Merge one source cluster into a canonical record.

use crate::config::{EntitySpec, FieldSpec, MergePolicy, ReconConfig};
use crate::conflict::{ConflictLog, IdentityKey, Resolution};
use crate::error::ReconError;
use crate::model::{EntityRecord, SourceCluster, Value};
use crate::nested::{merge_nested, NestedField};
use crate::policy::{self, effective_priority, in_priority, SourceValues};

/// Run-wide state threaded through every merge call.
#[derive(Clone, Copy)]
pub struct MergeContext<'c> {
    pub config: &'c ReconConfig,
    pub log: &'c ConflictLog,
}

impl<'c> MergeContext<'c> {
    pub fn new(config: &'c ReconConfig, log: &'c ConflictLog) -> Self {
        Self { config, log }
    }
}

/// Audit every member, then project a singleton or merge the cluster.
pub fn reconcile(
    spec: &EntitySpec,
    cluster: &SourceCluster<'_>,
    ambient: &[String],
    ctx: MergeContext<'_>,
) -> Result<EntityRecord, ReconError> {
    audit_members(spec, cluster, ambient, ctx);

    if cluster.len() == 1 {
        if let Some((tag, record)) = cluster.members.iter().next() {
            return project(spec, &cluster.identity, tag, record, ambient, ctx);
        }
    }
    merge_cluster(spec, cluster, ambient, ctx)
}

/// Feed the conflict log, highest-priority member first so it becomes the
/// reference record for agreement checks.
pub fn audit_members(
    spec: &EntitySpec,
    cluster: &SourceCluster<'_>,
    ambient: &[String],
    ctx: MergeContext<'_>,
) {
    if spec.audit.is_empty() {
        return;
    }
    let key = IdentityKey::new(&spec.name, cluster.identity.clone());
    let order = effective_priority(cluster.members.keys().map(String::as_str), ambient);
    for tag in &order {
        let Some(record) = cluster.members.get(tag) else {
            continue;
        };
        for field in &spec.audit.distinct {
            ctx.log.observe_distinct(record, field);
        }
        if !spec.audit.agreement.is_empty() {
            ctx.log.check_agreement(&key, tag, record, &spec.audit.agreement);
        }
    }
}

/// Merge a cluster of two or more records field by field. Only declared
/// fields survive; the identity field always carries the cluster identity.
pub fn merge_cluster(
    spec: &EntitySpec,
    cluster: &SourceCluster<'_>,
    ambient: &[String],
    ctx: MergeContext<'_>,
) -> Result<EntityRecord, ReconError> {
    let mut merged = EntityRecord::new();

    for (field, field_spec) in &spec.fields {
        if *field == spec.identity {
            continue;
        }
        let base = field_spec.source_priority.as_deref().unwrap_or(ambient);
        let priority = effective_priority(cluster.members.keys().map(String::as_str), base);
        let values: SourceValues = cluster
            .members
            .iter()
            .filter_map(|(tag, record)| record.present(field).map(|v| (tag.as_str(), v)))
            .collect();

        let value = match &field_spec.policy {
            MergePolicy::Coalesce => {
                coalesce_logged(spec, &cluster.identity, field, &values, &priority, &field_spec.default, ctx)
            }
            MergePolicy::Append => policy::append(&values, &priority),
            MergePolicy::AppendUnique => policy::append_unique(&values, &priority),
            MergePolicy::MergeIdentifiers => {
                policy::merge_identifiers(&values, &priority, &field_spec.default)
            }
            MergePolicy::MergeCodedText if !values.is_empty() => {
                let texts = policy::coded_texts(&values);
                let fallback = policy::coded_fallback(&field_spec.default);
                let text = coalesce_logged(spec, &cluster.identity, field, &texts, &priority, &fallback, ctx);
                policy::with_codings(&values, &priority, text)
            }
            MergePolicy::MergeCodedText => policy::coded_default(&field_spec.default),
            MergePolicy::MergeNestedById { entity } => {
                let nested = NestedField {
                    parent: &spec.name,
                    parent_identity: &cluster.identity,
                    field,
                    child: ctx.config.entity(entity)?,
                    default: &field_spec.default,
                };
                merge_nested(&nested, &values, base, ctx)?
            }
        };
        merged.insert(field.clone(), value);
    }

    merged.insert(spec.identity.clone(), cluster.identity.clone());
    log::debug!(
        "{} {}: merged {} records",
        spec.name,
        cluster.identity,
        cluster.len()
    );
    Ok(merged)
}

/// Pass-through for a single record: its own value for each declared
/// field, the field's empty result where it has none. Nested collections
/// still go through the nested merger so duplicate children collapse.
pub fn project(
    spec: &EntitySpec,
    identity: &Value,
    tag: &str,
    record: &EntityRecord,
    ambient: &[String],
    ctx: MergeContext<'_>,
) -> Result<EntityRecord, ReconError> {
    let mut projected = EntityRecord::new();

    for (field, field_spec) in &spec.fields {
        if *field == spec.identity {
            continue;
        }
        let value = match (&field_spec.policy, record.present(field)) {
            (MergePolicy::MergeNestedById { entity }, present) => {
                let values: SourceValues = present.map(|v| (tag, v)).into_iter().collect();
                let nested = NestedField {
                    parent: &spec.name,
                    parent_identity: identity,
                    field,
                    child: ctx.config.entity(entity)?,
                    default: &field_spec.default,
                };
                let base = field_spec.source_priority.as_deref().unwrap_or(ambient);
                merge_nested(&nested, &values, base, ctx)?
            }
            (_, Some(value)) => value.clone(),
            (_, None) => empty_value(field_spec),
        };
        projected.insert(field.clone(), value);
    }

    projected.insert(spec.identity.clone(), identity.clone());
    Ok(projected)
}

/// What a policy yields when no source has the field.
fn empty_value(field_spec: &FieldSpec) -> Value {
    match field_spec.policy {
        MergePolicy::Append | MergePolicy::AppendUnique => Value::List(Vec::new()),
        MergePolicy::MergeCodedText => policy::coded_default(&field_spec.default),
        _ => field_spec.default.clone(),
    }
}

/// `coalesce`, logging every lower-ranked value that differed from the pick.
/// Coded text passes its per-source texts through here as well.
fn coalesce_logged(
    spec: &EntitySpec,
    identity: &Value,
    field: &str,
    values: &SourceValues<'_>,
    priority: &[String],
    default: &Value,
    ctx: MergeContext<'_>,
) -> Value {
    let Some((kept_source, kept)) = policy::coalesce_pick(values, priority) else {
        return default.clone();
    };
    for (tag, other) in in_priority(values, priority) {
        if tag == kept_source || other == kept {
            continue;
        }
        ctx.log.record_resolution(Resolution {
            entity: spec.name.clone(),
            identity: identity.clone(),
            field: field.to_string(),
            kept_source: kept_source.to_string(),
            kept: kept.clone(),
            discarded_source: tag.to_string(),
            discarded: other.clone(),
        });
    }
    kept.clone()
}
