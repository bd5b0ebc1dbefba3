//! Error taxonomy shared by every component of the core.
//!
//! Tool argument problems are [`ValidationError`]s and never abort a turn;
//! they are reported back to the model as failed tool results. Everything
//! else surfaces to the turn boundary as a [`CoreError`].

/// Result alias used throughout the library.
pub type CoreResult<T> = Result<T, CoreError>;

/// Bad tool arguments, detected at the registry boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A property listed in the schema's `required` list is absent.
    #[error("required field '{field}' is missing")]
    MissingRequiredField { field: String },

    /// A present property does not have the declared runtime type.
    #[error("field '{field}' must be {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The value is not one of the enumerated strings.
    #[error("field '{field}' must be one of: {}", allowed.join(", "))]
    InvalidEnumValue { field: String, allowed: Vec<String> },

    /// The value has the right type but an unusable format (uuid, timestamp).
    #[error("field '{field}' is invalid: {reason}")]
    InvalidFormat { field: String, reason: String },
}

/// Errors produced by the registry, memory, orchestrator and tenant layers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Bad capability arguments.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Missing record, capability or tenant.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Storage connection or query failure.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The embedding call failed or produced no vectors.
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// The chat-completion call failed or produced no message.
    #[error("completion failed: {0}")]
    CompletionFailed(String),

    /// A capability name was registered twice.
    #[error("capability '{0}' already registered")]
    DuplicateCapability(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid tenant or application configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Infrastructure failures abort the turn with a generic apology upstream.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_) | Self::EmbeddingFailed(_) | Self::CompletionFailed(_)
        )
    }
}

/// Race `fut` against the caller's cancellation token.
pub async fn cancellable<T>(
    cancel: &tokio_util::sync::CancellationToken,
    fut: impl std::future::Future<Output = CoreResult<T>>,
) -> CoreResult<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CoreError::Cancelled),
        res = fut => res,
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("row", ""),
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn test_pool_errors_are_infrastructure() {
        let err: CoreError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, CoreError::StorageUnavailable(_)));
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn test_cancellable_short_circuits() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let res = cancellable(&token, std::future::pending::<CoreResult<()>>()).await;
        assert!(matches!(res, Err(CoreError::Cancelled)));

        let live = tokio_util::sync::CancellationToken::new();
        assert_eq!(cancellable(&live, async { Ok(7) }).await.unwrap(), 7);
    }

    #[test]
    fn test_enum_message_lists_allowed_values() {
        let err = ValidationError::InvalidEnumValue {
            field: "kind".to_string(),
            allowed: vec!["note".to_string(), "task".to_string()],
        };
        assert_eq!(err.to_string(), "field 'kind' must be one of: note, task");
    }
}
