/// Service-level error taxonomy.

use crate::core::prompts::PromptError;
use crate::core::registry::RegistryError;
use crate::core::template::TemplateError;
use crate::llm::error::{CredentialsError, GenerationError};
use crate::store::StoreError;

/// What a public engine operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Caller input is unacceptable; nothing was changed.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No usable generation credentials; no external call was made.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The job is leased by a worker right now.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// System-owned templates are broken. Not caller-correctable.
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("startup error: {0}")]
    Startup(String),
}

impl ServiceError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::Conflict(_) => "conflict",
            Self::Generation(_) => "generation",
            Self::Template(_) => "template",
            Self::Store(_) => "store",
            Self::Startup(_) => "startup",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            other => Self::Store(other),
        }
    }
}

impl From<CredentialsError> for ServiceError {
    fn from(e: CredentialsError) -> Self {
        Self::PreconditionFailed(e.to_string())
    }
}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownModule(key) => Self::NotFound(format!("module {key}")),
            RegistryError::UnknownField { module, field } => {
                Self::NotFound(format!("field {module}.{field}"))
            }
            other => Self::Startup(other.to_string()),
        }
    }
}

impl From<PromptError> for ServiceError {
    fn from(e: PromptError) -> Self {
        Self::Startup(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_taxonomy() {
        assert!(matches!(
            ServiceError::from(StoreError::NotFound("world x".into())),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(
            ServiceError::from(StoreError::Conflict("job running".into())),
            ServiceError::Conflict(_)
        ));
        assert!(matches!(
            ServiceError::from(StoreError::Database("locked".into())),
            ServiceError::Store(_)
        ));
    }

    #[test]
    fn unknown_module_is_not_found() {
        let err = ServiceError::from(RegistryError::UnknownModule("magic".into()));
        assert!(matches!(err, ServiceError::NotFound(ref m) if m.contains("magic")));
        assert_eq!(err.error_kind(), "not_found");
    }

    #[test]
    fn missing_credentials_is_precondition() {
        let err = ServiceError::from(CredentialsError::Missing(
            crate::schema::ids::OwnerId::new("u1"),
        ));
        assert!(matches!(err, ServiceError::PreconditionFailed(_)));
    }
}
