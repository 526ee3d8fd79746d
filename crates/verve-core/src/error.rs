/// Tagged error taxonomy shared by every layer of the orchestrator.
///
/// Store-layer and driver errors are wrapped into one of these tags at the
/// boundary; application code above the store never inspects raw driver
/// errors. The tag alone tells a caller whether retrying makes sense
/// (`Unavailable`) or not (`Conflict`/`Invalid`/`Precondition`).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short machine-readable tag, used both in logs and in HTTP bodies.
    pub fn tag(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Invalid(_) => "invalid",
            AppError::Precondition(_) => "precondition",
            AppError::Unavailable(_) => "unavailable",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether a caller may usefully retry the same request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(self, AppError::Unavailable(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("json: {err}"))
    }
}

impl From<chrono::ParseError> for AppError {
    fn from(err: chrono::ParseError) -> Self {
        AppError::Internal(format!("timestamp: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_matches_variant() {
        assert_eq!(AppError::not_found("x").tag(), "not_found");
        assert_eq!(AppError::conflict("x").tag(), "conflict");
        assert_eq!(AppError::invalid("x").tag(), "invalid");
        assert_eq!(AppError::precondition("x").tag(), "precondition");
        assert_eq!(AppError::unavailable("x").tag(), "unavailable");
        assert_eq!(AppError::internal("x").tag(), "internal");
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(AppError::unavailable("x").retryable());
        assert!(!AppError::conflict("x").retryable());
        assert!(!AppError::invalid("x").retryable());
    }
}
