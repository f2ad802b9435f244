use std::time::Duration;

/// Store-level failures. `Conflict` signals an optimistic-concurrency
/// violation: the caller re-reads current state and recomputes the
/// transition, or abandons it if the state is already terminal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store corruption: {0}")]
    Corruption(String),
}

/// Agent invocation failures, by kind. Rate limits are a distinct kind
/// so credential rotation can happen outside the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("Agent transport error: {0}")]
    Transport(String),

    #[error("Agent rate limited: {0}")]
    RateLimited(String),

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GitError {
    #[error("Not a git repository: {0}")]
    NotARepo(String),

    #[error("git {command} failed: {detail}")]
    Command { command: String, detail: String },
}

/// Template rendering failures are config errors: loud, no retry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    #[error("Template not found for phase '{0}'")]
    MissingTemplate(String),

    #[error("Unresolved template variable '{{{{{name}}}}}' in template for phase '{phase}'")]
    UnresolvedVariable { phase: String, name: String },

    #[error("Failed to read template {path}: {detail}")]
    Io { path: String, detail: String },
}

/// Top-level error enum mapping every failure the engine can see onto
/// the categories the scheduler and executor route on.
///
/// Categories:
/// - User: bad input, returned with a remediation hint, never retried
/// - Config: malformed template/profile, fatal to the operation
/// - Transient: transport/storage blips, retried with bounded backoff
/// - RateLimited: surfaced so credential rotation can happen upstream
/// - Conflict: optimistic-concurrency loss, safely recomputed
/// - Fatal: corruption or repeated worktree failure, task fails
#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    #[error("{message}")]
    User { message: String, hint: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Fatal: {0}")]
    Fatal(String),
}

impl MaestroError {
    pub fn user(message: impl Into<String>, hint: impl Into<String>) -> Self {
        MaestroError::User {
            message: message.into(),
            hint: hint.into(),
        }
    }

    /// True if the operation should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MaestroError::Transient(_) | MaestroError::Conflict(_)
        )
    }

    /// True if the affected task must fail and the scheduler should
    /// carry on with other tasks.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MaestroError::Fatal(_))
    }
}

impl From<StoreError> for MaestroError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => MaestroError::user(
                format!("Not found: {}", id),
                "Check the id with `maestro status`",
            ),
            StoreError::Conflict(msg) => MaestroError::Conflict(msg),
            StoreError::Unavailable(msg) => MaestroError::Transient(msg),
            StoreError::Corruption(msg) => MaestroError::Fatal(format!("store corruption: {}", msg)),
        }
    }
}

impl From<AgentError> for MaestroError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Transport(msg) => MaestroError::Transient(msg),
            AgentError::RateLimited(msg) => MaestroError::RateLimited(msg),
            // Timeouts and protocol junk are normal failing iterations
            // when seen inside the loop; at this level they are transient.
            AgentError::Timeout(d) => MaestroError::Transient(format!("agent timeout after {:?}", d)),
            AgentError::Protocol(msg) => MaestroError::Transient(msg),
        }
    }
}

/// Bridge for callers still using `Result<T, String>` at the CLI edge.
impl From<MaestroError> for String {
    fn from(err: MaestroError) -> String {
        match &err {
            MaestroError::User { message, hint } => format!("{} ({})", message, hint),
            _ => err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_transient_are_retryable() {
        assert!(MaestroError::Conflict("cas".into()).is_retryable());
        assert!(MaestroError::Transient("503".into()).is_retryable());
        assert!(!MaestroError::Config("bad profile".into()).is_retryable());
        assert!(!MaestroError::RateLimited("quota".into()).is_retryable());
    }

    #[test]
    fn corruption_maps_to_fatal() {
        let err: MaestroError = StoreError::Corruption("truncated state".into()).into();
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_kind_is_preserved() {
        let err: MaestroError = AgentError::RateLimited("429".into()).into();
        assert!(matches!(err, MaestroError::RateLimited(_)));
    }

    #[test]
    fn user_error_string_carries_hint() {
        let err: MaestroError = StoreError::NotFound("T-042".into()).into();
        let s: String = err.into();
        assert!(s.contains("T-042"));
        assert!(s.contains("maestro status"));
    }
}
