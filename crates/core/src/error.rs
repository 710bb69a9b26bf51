use thiserror::Error;

use crate::path::PathError;
use crate::store::StoreError;

/// Failures that abort a render pass for the whole composition.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unsupported parameter {0:?}")]
    UnsupportedParameter(String),
    #[error("missing required parameter {0:?}")]
    MissingRequiredParameter(String),
    #[error("payload is not an object: {0}")]
    InvalidPayload(#[source] PathError),
    #[error("cannot set parameter {name:?}: {source}")]
    SetParameterFailed { name: String, #[source] source: PathError },
    #[error("cannot render workload of component {component:?}: {reason}")]
    RenderWorkloadFailed { component: String, reason: String },
    #[error("cannot render trait of component {component:?}: {reason}")]
    RenderTraitFailed { component: String, reason: String },
    #[error("component revision {0:?} not found")]
    RevisionNotFound(String),
    #[error("component {0:?} not found")]
    ComponentNotFound(String),
    #[error("component entry sets both componentName {component:?} and revisionName {revision:?}")]
    BothComponentAndRevision { component: String, revision: String },
    #[error("component entry sets neither componentName nor revisionName")]
    NoComponentReference,
    #[error("data output {0:?} does not exist")]
    DataOutputNotExist(String),
    #[error("data output {0:?} is declared more than once")]
    DuplicateDataOutput(String),
    #[error("value at {field_path} of {object} has unsupported type {found} (only strings are supported)")]
    UnsupportedValueType { object: String, field_path: String, found: &'static str },
    #[error("invalid field path in data flow: {0}")]
    DataPath(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
