use std::io;

use thiserror::Error;

use crate::key::FieldKind;
use crate::types::{FieldName, SourceId};

/// Error type for stratification, allocation, source, and persistence failures.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("cannot stratify on field '{field}' of type {kind}")]
    InvalidFieldType { field: FieldName, kind: FieldKind },
    #[error("invalid stratum: {0}")]
    InvalidStratum(String),
    #[error("no strata remain after filtering")]
    EmptyStratification,
    #[error("sample cap {0} is outside (0, 1]")]
    InvalidCap(f64),
    #[error("target total {0} is out of range")]
    InvalidTarget(u64),
    #[error("data source '{source_id}' is unavailable: {reason}")]
    SourceUnavailable { source_id: SourceId, reason: String },
    #[error("stratum store failure: {0}")]
    StratumStore(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
}
