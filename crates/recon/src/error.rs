use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconError {
    /// TOML parse / deserialization error (includes unknown `merge_type` values).
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Config validation error (dangling entity reference, bad identity policy, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// No field merge specification for an entity type met at runtime.
    #[error("no merge specification for entity type '{0}'")]
    UnknownEntity(String),

    /// A record (top-level or nested) without its identity field.
    #[error("{entity} record from source '{source_tag}' has no identity field '{field}' ({context})")]
    MissingIdentity {
        entity: String,
        source_tag: String,
        field: String,
        context: String,
    },

    /// A field value whose shape does not fit its merge policy.
    #[error("{entity}.{field}: {reason}")]
    InvalidValue {
        entity: String,
        field: String,
        reason: String,
    },

    /// Malformed input line.
    #[error("source '{source_tag}', line {line}: {message}")]
    InputParse {
        source_tag: String,
        line: usize,
        message: String,
    },

    /// Run cancelled between identities.
    #[error("run cancelled after {processed} of {total} identities")]
    Cancelled { processed: usize, total: usize },

    /// Worker pool could not be started.
    #[error("worker pool error: {0}")]
    WorkerPool(String),

    /// IO error (report export, etc.).
    #[error("IO error: {0}")]
    Io(String),
}

impl ReconError {
    /// Configuration problems, as opposed to problems with the data.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigParse(_) | Self::ConfigValidation(_) | Self::UnknownEntity(_)
        )
    }
}
