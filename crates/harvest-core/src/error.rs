use thiserror::Error;

/// Failure classes of the harvest pipeline. The kind decides how far a failure propagates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarvestError {
    /// Bad or missing configuration; rejected before any job starts.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Network, payload or pagination failure; aborts the gather.
    #[error("source fetch error: {0}")]
    SourceFetch(String),
    /// One record could not be transformed; the record is skipped.
    #[error("transform error: {0}")]
    Transform(String),
    /// The target catalog rejected a write or a guid conflict was found.
    #[error("reconciliation error: {0}")]
    Reconciliation(String),
    /// The remote field set cannot satisfy the configured mapping.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    SourceFetch,
    Transform,
    Reconciliation,
    SchemaMismatch,
}

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::Configuration(_) => ErrorKind::Configuration,
            HarvestError::SourceFetch(_) => ErrorKind::SourceFetch,
            HarvestError::Transform(_) => ErrorKind::Transform,
            HarvestError::Reconciliation(_) => ErrorKind::Reconciliation,
            HarvestError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
        }
    }

    /// Whether the error stops the whole gather rather than a single record.
    pub fn aborts_gather(&self) -> bool {
        !matches!(self, HarvestError::Transform(_) | HarvestError::Reconciliation(_))
    }
}

/// Rejections raised while validating a field-mapping document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("Unsupported schema version: {0}. Supported versions are: [1, 2]")]
    UnsupportedVersion(i64),
    #[error("field mapping must be an object of local_field_name -> mapping")]
    NotAnObject,
    #[error("\"local_field_name\" must be a non-empty string")]
    EmptyLocalField,
    #[error("Field \"{base}\" is not required if \"{translated}\" exists.")]
    RedundantTranslatedField { base: String, translated: String },
    #[error("\"remote_field_name\" for \"{0}\" must be a string or a dictionary")]
    InvalidV1Value(String),
    #[error("\"field_config\" for \"{0}\" must be a dictionary")]
    InvalidFieldConfig(String),
    #[error("Invalid property \"{prop}\" in \"{local_field}\"")]
    InvalidProperty { local_field: String, prop: String },
    #[error("\"{local_field}\" (property: \"{prop}\") must be a string, a list of strings, or null")]
    InvalidValue { local_field: String, prop: String },
    #[error("\"{local_field}\" (property: \"{prop}\") must not contain commas; use a list instead of \"value_1,value_2\"")]
    CommaInValue { local_field: String, prop: String },
    #[error("Invalid language \"{0}\". Language code must be a 2-letter ISO 639-1 code")]
    InvalidLanguage(String),
    #[error("languages of \"{0}\" must be a dictionary of language -> field config")]
    InvalidLanguages(String),
    #[error("Both \"field_position\" and \"field_name\" cannot be defined for \"{0}\"")]
    PositionAndName(String),
    #[error("\"field_value\" for \"{0}\" can only be combined with a field reference if it is a list")]
    ValueNotList(String),
    #[error("Invalid column position \"{position}\" for \"{local_field}\"")]
    InvalidPosition { local_field: String, position: String },
    #[error("Column position \"{position}\" used for \"{local_field}\" but the record has no column layout")]
    NoColumnLayout { local_field: String, position: String },
}

impl From<MappingError> for HarvestError {
    fn from(err: MappingError) -> Self {
        match err {
            MappingError::NoColumnLayout { .. } => HarvestError::Transform(err.to_string()),
            other => HarvestError::Configuration(other.to_string()),
        }
    }
}
