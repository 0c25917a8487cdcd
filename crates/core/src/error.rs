#![forbid(unsafe_code)]

use crate::ids::WorkType;
use thiserror::Error;

/// Fatal configuration and contract errors.
///
/// Validator-level failures never surface here; they are recorded on the
/// attempt as a [`crate::FailureReason`] and folded into the `Decision`.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("changeset carries no work types")]
    EmptyWorkTypes,
    #[error("unknown work type `{0}` and no fallback profile is configured")]
    UnknownWorkType(WorkType),
    #[error("invalid registry: {0}")]
    InvalidRegistry(String),
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("registry json: {0}")]
    Json(#[from] serde_json::Error),
}
