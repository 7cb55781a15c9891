// src/errors.rs
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by lifecycle and list operations. Storage failures are
/// carried through as `Storage`; everything else is a caller mistake.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} is already flagged by user {user_id}")]
    AlreadyFlagged {
        entity: &'static str,
        id: String,
        user_id: String,
    },

    #[error("{entity} {id} is not flagged by user {user_id}")]
    NotFlagged {
        entity: &'static str,
        id: String,
        user_id: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type TemplateResult<T> = std::result::Result<T, TemplateError>;

impl TemplateError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::AlreadyFlagged { .. } => "already_flagged",
            Self::NotFlagged { .. } => "not_flagged",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Storage(_) => "storage_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::AlreadyFlagged { .. } | Self::NotFlagged { .. } => 409,
            Self::NotFound { .. } => 404,
            Self::Forbidden(_) => 403,
            Self::Storage(_) => 500,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured error handed back across the request boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(TemplateError::Validation("x".into()).kind(), "validation_error");
        assert_eq!(TemplateError::not_found("template", "t1").kind(), "not_found");
        assert_eq!(TemplateError::Forbidden("x".into()).kind(), "forbidden");
        assert_eq!(
            TemplateError::Storage(anyhow::anyhow!("db down")).kind(),
            "storage_error"
        );
    }

    #[test]
    fn flag_errors_map_to_conflict() {
        let already = TemplateError::AlreadyFlagged {
            entity: "template",
            id: "t1".into(),
            user_id: "u1".into(),
        };
        let missing = TemplateError::NotFlagged {
            entity: "template",
            id: "t1".into(),
            user_id: "u1".into(),
        };
        assert_eq!(already.http_status(), 409);
        assert_eq!(missing.http_status(), 409);
        assert_eq!(already.kind(), "already_flagged");
        assert_eq!(missing.kind(), "not_flagged");
    }

    #[test]
    fn body_carries_kind_and_display_message() {
        let err = TemplateError::not_found("milestone", "m9");
        let body = err.to_body();
        assert_eq!(body.kind, "not_found");
        assert_eq!(body.message, "milestone not found: m9");
        assert_eq!(err.http_status(), 404);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "not_found");
    }
}
