//! Run-scoped audit log.
//!
//! The log never touches merged data. It collects three things while
//! clusters are merged: distinct values per tracked field name, agreement
//! mismatches per identity, and coalesce decisions that dropped a differing
//! value. State sits behind one mutex so parallel merges can share it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;

use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::ReconError;
use crate::model::{EntityRecord, Value};

/// Identity scoped by entity type, so a Subject "1" and a Specimen "1"
/// never compare against each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IdentityKey {
    pub entity: String,
    pub id: Value,
}

impl IdentityKey {
    pub fn new(entity: impl Into<String>, id: Value) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

/// Two records of one identity disagree on a field expected to agree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub entity: String,
    pub identity: Value,
    pub field: String,
    /// Value from the first record seen for this identity.
    pub cached: Value,
    pub observed: Value,
    pub cached_source: String,
    pub observed_source: String,
}

/// A coalesce pick that discarded a different, non-null, lower-priority value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub entity: String,
    pub identity: Value,
    pub field: String,
    pub kept_source: String,
    pub kept: Value,
    pub discarded_source: String,
    pub discarded: Value,
}

#[derive(Debug)]
struct CachedValues {
    source: String,
    values: Vec<(String, Value)>,
}

#[derive(Debug, Default)]
struct LogState {
    distinct: BTreeMap<String, BTreeSet<Value>>,
    agreement: HashMap<IdentityKey, CachedValues>,
    conflicts: Vec<Conflict>,
    resolutions: Vec<Resolution>,
}

#[derive(Debug, Default)]
pub struct ConflictLog {
    state: Mutex<LogState>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `record[field]` (null when missing) among the run-wide values
    /// of `field`. Values are keyed by field name only.
    pub fn observe_distinct(&self, record: &EntityRecord, field: &str) {
        let value = record.value(field).clone();
        let mut state = self.state.lock();
        state.distinct.entry(field.to_string()).or_default().insert(value);
    }

    /// The first record seen for an identity sets the expected values of
    /// `fields`; every later record is compared against them.
    pub fn check_agreement(
        &self,
        identity: &IdentityKey,
        source: &str,
        record: &EntityRecord,
        fields: &[String],
    ) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(cached) = state.agreement.get(identity) else {
            let values = fields
                .iter()
                .map(|f| (f.clone(), record.value(f).clone()))
                .collect();
            state.agreement.insert(
                identity.clone(),
                CachedValues {
                    source: source.to_string(),
                    values,
                },
            );
            return;
        };

        for (field, expected) in &cached.values {
            let observed = record.value(field);
            if observed == expected {
                continue;
            }
            log::warn!(
                "{} {}: '{field}' disagrees ({}={expected}, {source}={observed})",
                identity.entity,
                identity.id,
                cached.source,
            );
            state.conflicts.push(Conflict {
                entity: identity.entity.clone(),
                identity: identity.id.clone(),
                field: field.clone(),
                cached: expected.clone(),
                observed: observed.clone(),
                cached_source: cached.source.clone(),
                observed_source: source.to_string(),
            });
        }
    }

    pub fn record_resolution(&self, resolution: Resolution) {
        log::debug!(
            "{} {}: '{}' kept {} from {}, discarded {} from {}",
            resolution.entity,
            resolution.identity,
            resolution.field,
            resolution.kept,
            resolution.kept_source,
            resolution.discarded,
            resolution.discarded_source,
        );
        self.state.lock().resolutions.push(resolution);
    }

    pub fn conflict_count(&self) -> usize {
        self.state.lock().conflicts.len()
    }

    /// Snapshot of everything observed so far.
    pub fn report(&self) -> ConflictReport {
        let state = self.state.lock();
        ConflictReport::build(
            &state.distinct,
            state.conflicts.clone(),
            state.resolutions.clone(),
        )
    }

    pub fn into_report(self) -> ConflictReport {
        let state = self.state.into_inner();
        ConflictReport::build(&state.distinct, state.conflicts, state.resolutions)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

const CSV_HEADER: &[&str] = &[
    "kind",
    "entity",
    "identity",
    "field",
    "left_source",
    "left_value",
    "right_source",
    "right_value",
];

/// Integers and floats compare by magnitude; everything else keeps the
/// derived `Value` order, where the numeric variants sit next to each other.
fn report_order(a: &Value, b: &Value) -> Ordering {
    let number = |v: &Value| match v {
        Value::Int(i) => Some(OrderedFloat(*i as f64)),
        Value::Float(f) => Some(*f),
        _ => None,
    };
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConflictReport {
    /// Per tracked field, sorted distinct values with null last.
    pub distinct_values: BTreeMap<String, Vec<Value>>,
    pub conflicts: Vec<Conflict>,
    pub resolutions: Vec<Resolution>,
}

impl ConflictReport {
    fn build(
        distinct: &BTreeMap<String, BTreeSet<Value>>,
        mut conflicts: Vec<Conflict>,
        mut resolutions: Vec<Resolution>,
    ) -> Self {
        let distinct_values = distinct
            .iter()
            .map(|(field, values)| {
                let mut sorted: Vec<Value> = values.iter().filter(|v| !v.is_null()).cloned().collect();
                sorted.sort_by(report_order);
                if values.contains(&Value::Null) {
                    sorted.push(Value::Null);
                }
                (field.clone(), sorted)
            })
            .collect();

        // Stable: discovery order survives within one identity.
        conflicts.sort_by(|a, b| (&a.entity, &a.identity).cmp(&(&b.entity, &b.identity)));
        resolutions.sort_by(|a, b| (&a.entity, &a.identity).cmp(&(&b.entity, &b.identity)));

        Self {
            distinct_values,
            conflicts,
            resolutions,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Human-readable rendering.
    pub fn write_text(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "Distinct values")?;
        if self.distinct_values.is_empty() {
            writeln!(out, "  (no fields tracked)")?;
        }
        for (field, values) in &self.distinct_values {
            let rendered: Vec<String> = values.iter().map(Value::to_string).collect();
            writeln!(out, "  {field} ({}): {}", values.len(), rendered.join(", "))?;
        }

        writeln!(out)?;
        writeln!(out, "Conflicts ({})", self.conflicts.len())?;
        for c in &self.conflicts {
            writeln!(
                out,
                "  {} {} {}: {}={} vs {}={}",
                c.entity, c.identity, c.field, c.cached_source, c.cached, c.observed_source, c.observed
            )?;
        }

        writeln!(out)?;
        writeln!(out, "Resolutions ({})", self.resolutions.len())?;
        for r in &self.resolutions {
            writeln!(
                out,
                "  {} {} {}: kept {}={}, discarded {}={}",
                r.entity, r.identity, r.field, r.kept_source, r.kept, r.discarded_source, r.discarded
            )?;
        }
        Ok(())
    }

    /// Conflicts then resolutions, one row each.
    pub fn write_conflicts_csv(&self, writer: impl Write) -> Result<(), ReconError> {
        let csv_err = |e: csv::Error| ReconError::Io(format!("CSV write error: {e}"));
        let mut csv = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(writer);

        csv.write_record(CSV_HEADER).map_err(csv_err)?;
        for c in &self.conflicts {
            csv.write_record([
                "conflict",
                c.entity.as_str(),
                c.identity.to_string().as_str(),
                c.field.as_str(),
                c.cached_source.as_str(),
                c.cached.to_string().as_str(),
                c.observed_source.as_str(),
                c.observed.to_string().as_str(),
            ])
            .map_err(csv_err)?;
        }
        for r in &self.resolutions {
            csv.write_record([
                "resolution",
                r.entity.as_str(),
                r.identity.to_string().as_str(),
                r.field.as_str(),
                r.kept_source.as_str(),
                r.kept.to_string().as_str(),
                r.discarded_source.as_str(),
                r.discarded.to_string().as_str(),
            ])
            .map_err(csv_err)?;
        }

        csv.flush()
            .map_err(|e| ReconError::Io(format!("CSV flush error: {e}")))?;
        Ok(())
    }
}
