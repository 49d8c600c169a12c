use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ReconError;
use crate::input::convert_value;
use crate::model::Value;

pub const DEFAULT_IDENTITY_FIELD: &str = "id";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Validated merge configuration for one run.
#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub name: String,
    /// Entity type of the top-level input records.
    pub root: String,
    /// Run-wide source ranking used by `coalesce` and friends.
    pub source_priority: Vec<String>,
    /// Optional input files per source, resolved by the CLI.
    pub sources: BTreeMap<String, SourceConfig>,
    pub entities: BTreeMap<String, EntitySpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub file: String,
}

// ---------------------------------------------------------------------------
// Entity + field specs
// ---------------------------------------------------------------------------

/// Field merge specification for one entity type.
#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub name: String,
    pub identity: String,
    pub fields: BTreeMap<String, FieldSpec>,
    pub audit: AuditConfig,
}

/// Which fields feed the conflict log for an entity type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Fields whose distinct values are tracked run-wide.
    #[serde(default)]
    pub distinct: Vec<String>,
    /// Fields all records of one identity are expected to agree on.
    #[serde(default)]
    pub agreement: Vec<String>,
}

impl AuditConfig {
    pub fn is_empty(&self) -> bool {
        self.distinct.is_empty() && self.agreement.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub policy: MergePolicy,
    /// Used when no source supplies a non-null value.
    pub default: Value,
    /// Replaces the ambient source priority for this field only.
    pub source_priority: Option<Vec<String>>,
}

/// How one field is merged across sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergePolicy {
    Coalesce,
    Append,
    AppendUnique,
    MergeIdentifiers,
    MergeCodedText,
    /// Child records merged by identity with the named entity's own spec.
    MergeNestedById { entity: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeType {
    Coalesce,
    Append,
    AppendUnique,
    MergeIdentifiers,
    MergeCodedText,
    MergeNestedById,
}

impl std::fmt::Display for MergeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coalesce => write!(f, "coalesce"),
            Self::Append => write!(f, "append"),
            Self::AppendUnique => write!(f, "append_unique"),
            Self::MergeIdentifiers => write!(f, "merge_identifiers"),
            Self::MergeCodedText => write!(f, "merge_coded_text"),
            Self::MergeNestedById => write!(f, "merge_nested_by_id"),
        }
    }
}

impl MergePolicy {
    pub fn merge_type(&self) -> MergeType {
        match self {
            Self::Coalesce => MergeType::Coalesce,
            Self::Append => MergeType::Append,
            Self::AppendUnique => MergeType::AppendUnique,
            Self::MergeIdentifiers => MergeType::MergeIdentifiers,
            Self::MergeCodedText => MergeType::MergeCodedText,
            Self::MergeNestedById { .. } => MergeType::MergeNestedById,
        }
    }

    /// Combine the TOML `merge_type` / `entity` pair. Exactly one policy per
    /// field: `entity` is required for nested merges and rejected elsewhere.
    fn from_parts(merge_type: MergeType, entity: Option<String>) -> Result<Self, String> {
        match (merge_type, entity) {
            (MergeType::MergeNestedById, Some(entity)) => Ok(Self::MergeNestedById { entity }),
            (MergeType::MergeNestedById, None) => {
                Err("merge_nested_by_id requires an `entity` reference".into())
            }
            (other, Some(entity)) => Err(format!(
                "`entity = \"{entity}\"` is only valid with merge_nested_by_id, not {other}"
            )),
            (MergeType::Coalesce, None) => Ok(Self::Coalesce),
            (MergeType::Append, None) => Ok(Self::Append),
            (MergeType::AppendUnique, None) => Ok(Self::AppendUnique),
            (MergeType::MergeIdentifiers, None) => Ok(Self::MergeIdentifiers),
            (MergeType::MergeCodedText, None) => Ok(Self::MergeCodedText),
        }
    }
}

impl FieldSpec {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            default: Value::Null,
            source_priority: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = default.into();
        self
    }

    pub fn with_priority<I, S>(mut self, priority: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_priority = Some(priority.into_iter().map(Into::into).collect());
        self
    }
}

impl EntitySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: DEFAULT_IDENTITY_FIELD.to_string(),
            fields: BTreeMap::new(),
            audit: AuditConfig::default(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn with_audit(mut self, audit: AuditConfig) -> Self {
        self.audit = audit;
        self
    }
}

// ---------------------------------------------------------------------------
// Raw TOML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    name: String,
    root: String,
    #[serde(default)]
    source_priority: Vec<String>,
    #[serde(default)]
    sources: BTreeMap<String, SourceConfig>,
    entities: BTreeMap<String, RawEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntity {
    #[serde(default = "default_identity")]
    identity: String,
    #[serde(default)]
    audit: AuditConfig,
    #[serde(default)]
    fields: BTreeMap<String, RawField>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    merge_type: MergeType,
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    default: Option<toml::Value>,
    #[serde(default)]
    source_priority: Option<Vec<String>>,
}

fn default_identity() -> String {
    DEFAULT_IDENTITY_FIELD.to_string()
}

fn toml_to_json(value: toml::Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        toml::Value::String(s) => Json::String(s),
        toml::Value::Integer(i) => Json::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        toml::Value::Boolean(b) => Json::Bool(b),
        toml::Value::Datetime(d) => Json::String(d.to_string()),
        toml::Value::Array(items) => Json::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Json::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ReconConfig {
    pub fn new(name: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            source_priority: Vec::new(),
            sources: BTreeMap::new(),
            entities: BTreeMap::new(),
        }
    }

    pub fn with_priority<I, S>(mut self, priority: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_priority = priority.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_entity(mut self, spec: EntitySpec) -> Self {
        self.entities.insert(spec.name.clone(), spec);
        self
    }

    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let raw: RawConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;

        let mut raw_defaults = Vec::new();
        let mut entities = BTreeMap::new();
        for (entity_name, raw_entity) in raw.entities {
            let mut fields = BTreeMap::new();
            for (field_name, raw_field) in raw_entity.fields {
                let policy = MergePolicy::from_parts(raw_field.merge_type, raw_field.entity)
                    .map_err(|msg| {
                        ReconError::ConfigValidation(format!(
                            "entity '{entity_name}', field '{field_name}': {msg}"
                        ))
                    })?;
                if let Some(default) = raw_field.default {
                    raw_defaults.push((entity_name.clone(), field_name.clone(), toml_to_json(default)));
                }
                fields.insert(
                    field_name,
                    FieldSpec {
                        policy,
                        default: Value::Null,
                        source_priority: raw_field.source_priority,
                    },
                );
            }
            entities.insert(
                entity_name.clone(),
                EntitySpec {
                    name: entity_name,
                    identity: raw_entity.identity,
                    fields,
                    audit: raw_entity.audit,
                },
            );
        }

        let mut config = ReconConfig {
            name: raw.name,
            root: raw.root,
            source_priority: raw.source_priority,
            sources: raw.sources,
            entities,
        };
        config.validate()?;

        // Defaults are shaped by their field's policy, which needs the
        // validated entity map for nested references.
        let mut typed_defaults = Vec::with_capacity(raw_defaults.len());
        for (entity, field, json) in raw_defaults {
            let Some(policy) = config
                .entities
                .get(&entity)
                .and_then(|spec| spec.fields.get(&field))
                .map(|spec| spec.policy.clone())
            else {
                continue;
            };
            let value = convert_value(json, &policy, &entity, &field, &config).map_err(|e| {
                ReconError::ConfigValidation(format!("default for {entity}.{field}: {e}"))
            })?;
            typed_defaults.push((entity, field, value));
        }
        for (entity, field, value) in typed_defaults {
            if let Some(spec) = config
                .entities
                .get_mut(&entity)
                .and_then(|spec| spec.fields.get_mut(&field))
            {
                spec.default = value;
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if !self.entities.contains_key(&self.root) {
            return Err(ReconError::ConfigValidation(format!(
                "root entity '{}' is not defined under [entities]",
                self.root
            )));
        }

        check_unique("source_priority", &self.source_priority)?;

        for (entity_name, spec) in &self.entities {
            if spec.identity.is_empty() {
                return Err(ReconError::ConfigValidation(format!(
                    "entity '{entity_name}': identity field name is empty"
                )));
            }

            if let Some(identity_spec) = spec.fields.get(&spec.identity) {
                if identity_spec.policy != MergePolicy::Coalesce {
                    return Err(ReconError::ConfigValidation(format!(
                        "entity '{entity_name}': identity field '{}' must use coalesce, not {}",
                        spec.identity,
                        identity_spec.policy.merge_type()
                    )));
                }
            }

            for (field_name, field) in &spec.fields {
                if let Some(ref priority) = field.source_priority {
                    check_unique(&format!("{entity_name}.{field_name}.source_priority"), priority)?;
                }
                if let MergePolicy::MergeNestedById { entity } = &field.policy {
                    if !self.entities.contains_key(entity) {
                        return Err(ReconError::ConfigValidation(format!(
                            "entity '{entity_name}', field '{field_name}': references undefined entity '{entity}'"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Look up an entity type's spec.
    pub fn entity(&self, name: &str) -> Result<&EntitySpec, ReconError> {
        self.entities
            .get(name)
            .ok_or_else(|| ReconError::UnknownEntity(name.to_string()))
    }

    pub fn root_spec(&self) -> Result<&EntitySpec, ReconError> {
        self.entity(&self.root)
    }
}

fn check_unique(what: &str, tags: &[String]) -> Result<(), ReconError> {
    let mut seen = HashSet::new();
    for tag in tags {
        if !seen.insert(tag.as_str()) {
            return Err(ReconError::ConfigValidation(format!(
                "{what}: source '{tag}' listed more than once"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CodedText, Identifier};

    const SUBJECTS: &str = r#"
name = "Subject Merge"
root = "Subject"
source_priority = ["GDC", "PDC", "IDC"]

[sources.GDC]
file = "gdc.jsonl"

[sources.PDC]
file = "pdc.jsonl"

[entities.Subject.audit]
distinct = ["sex", "race"]
agreement = ["sex"]

[entities.Subject.fields.id]
merge_type = "coalesce"

[entities.Subject.fields.race]
merge_type = "coalesce"
default = "not reported"

[entities.Subject.fields.identifiers]
merge_type = "merge_identifiers"
default = []

[entities.Subject.fields.specimens]
merge_type = "merge_nested_by_id"
entity = "Specimen"
source_priority = ["PDC", "GDC"]

[entities.Specimen]
identity = "specimen_id"

[entities.Specimen.fields.specimen_id]
merge_type = "coalesce"

[entities.Specimen.fields.anatomical_site]
merge_type = "merge_coded_text"
default = "unknown"
"#;

    #[test]
    fn parse_subject_config() {
        let config = ReconConfig::from_toml(SUBJECTS).unwrap();
        assert_eq!(config.name, "Subject Merge");
        assert_eq!(config.root, "Subject");
        assert_eq!(config.source_priority, ["GDC", "PDC", "IDC"]);
        assert_eq!(config.sources["GDC"].file, "gdc.jsonl");
        assert_eq!(config.entities.len(), 2);

        let subject = config.root_spec().unwrap();
        assert_eq!(subject.identity, "id");
        assert_eq!(subject.audit.agreement, ["sex"]);
        assert_eq!(subject.fields["race"].default, Value::from("not reported"));
        assert_eq!(
            subject.fields["specimens"].policy,
            MergePolicy::MergeNestedById {
                entity: "Specimen".into()
            }
        );
        assert_eq!(
            subject.fields["specimens"].source_priority.as_deref(),
            Some(&["PDC".to_string(), "GDC".to_string()][..])
        );

        let specimen = config.entity("Specimen").unwrap();
        assert_eq!(specimen.identity, "specimen_id");
        assert!(specimen.audit.is_empty());
    }

    #[test]
    fn defaults_follow_field_policy() {
        let config = ReconConfig::from_toml(SUBJECTS).unwrap();
        let subject = config.root_spec().unwrap();
        assert_eq!(subject.fields["identifiers"].default, Value::Identifiers(vec![]));
        assert_eq!(subject.fields["specimens"].default, Value::Null);

        let specimen = config.entity("Specimen").unwrap();
        assert_eq!(
            specimen.fields["anatomical_site"].default,
            Value::Coded(CodedText::new("unknown", vec![]))
        );
    }

    #[test]
    fn identifier_default_is_typed() {
        let input = r#"
name = "ids"
root = "File"

[entities.File.fields.identifiers]
merge_type = "merge_identifiers"
default = [{ system = "local", value = "none" }]
"#;
        let config = ReconConfig::from_toml(input).unwrap();
        assert_eq!(
            config.root_spec().unwrap().fields["identifiers"].default,
            Value::Identifiers(vec![Identifier::new("local", "none")])
        );
    }

    #[test]
    fn reject_unknown_merge_type() {
        let input = r#"
name = "Bad"
root = "Subject"

[entities.Subject.fields.race]
merge_type = "first_wins"
"#;
        let err = ReconConfig::from_toml(input).unwrap_err();
        assert!(matches!(err, ReconError::ConfigParse(_)));
        assert!(err.is_config_error());
    }

    #[test]
    fn reject_unknown_field_key() {
        let input = r#"
name = "Bad"
root = "Subject"

[entities.Subject.fields.race]
merge_type = "coalesce"
defualt = "x"
"#;
        assert!(matches!(
            ReconConfig::from_toml(input).unwrap_err(),
            ReconError::ConfigParse(_)
        ));
    }

    #[test]
    fn reject_undefined_root() {
        let input = r#"
name = "Bad"
root = "Patient"

[entities.Subject.fields.id]
merge_type = "coalesce"
"#;
        let err = ReconConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("root entity 'Patient'"));
    }

    #[test]
    fn reject_dangling_nested_reference() {
        let input = r#"
name = "Bad"
root = "Subject"

[entities.Subject.fields.specimens]
merge_type = "merge_nested_by_id"
entity = "Sample"
"#;
        let err = ReconConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("undefined entity 'Sample'"));
    }

    #[test]
    fn reject_nested_without_entity() {
        let input = r#"
name = "Bad"
root = "Subject"

[entities.Subject.fields.specimens]
merge_type = "merge_nested_by_id"
"#;
        let err = ReconConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("requires an `entity` reference"));
    }

    #[test]
    fn reject_entity_on_flat_policy() {
        let input = r#"
name = "Bad"
root = "Subject"

[entities.Subject.fields.specimens]
merge_type = "append"
entity = "Specimen"

[entities.Specimen.fields.id]
merge_type = "coalesce"
"#;
        let err = ReconConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("only valid with merge_nested_by_id"));
    }

    #[test]
    fn reject_non_coalesce_identity() {
        let input = r#"
name = "Bad"
root = "Subject"

[entities.Subject.fields.id]
merge_type = "append_unique"
"#;
        let err = ReconConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("must use coalesce"));
    }

    #[test]
    fn reject_duplicate_priority() {
        let input = r#"
name = "Bad"
root = "Subject"
source_priority = ["GDC", "PDC", "GDC"]

[entities.Subject.fields.id]
merge_type = "coalesce"
"#;
        let err = ReconConfig::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("'GDC' listed more than once"));
    }

    #[test]
    fn builder_matches_validation_rules() {
        let config = ReconConfig::new("built", "Subject")
            .with_priority(["A", "B"])
            .with_entity(
                EntitySpec::new("Subject")
                    .with_field("id", FieldSpec::new(MergePolicy::Coalesce))
                    .with_field(
                        "specimens",
                        FieldSpec::new(MergePolicy::MergeNestedById {
                            entity: "Specimen".into(),
                        }),
                    ),
            );
        assert!(config.validate().is_err());

        let config = config.with_entity(EntitySpec::new("Specimen"));
        assert!(config.validate().is_ok());
    }
}
