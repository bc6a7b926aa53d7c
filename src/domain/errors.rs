use thiserror::Error;

/// Errors raised by exchange adapters. Classification drives the circuit
/// breaker counters: transient and rate-limit errors feed the API health
/// tracker, permanent errors abort the current cycle.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("exchange returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Transient errors are absorbed at the call site with safe defaults.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_)
                | ExchangeError::Transport(_)
                | ExchangeError::Http { status: 500..=599, .. }
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ExchangeError::RateLimited { .. })
            || matches!(self, ExchangeError::Http { status: 429, .. })
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state backend I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state backend query failed: {0}")]
    Backend(String),

    #[error("state document corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    Missing(String),

    #[error("failed to parse {file}: {reason}")]
    Parse { file: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("failed to acquire lock file: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Timeout(10).is_transient());
        assert!(ExchangeError::Http { status: 503, body: String::new() }.is_transient());
        assert!(!ExchangeError::Auth("bad key".into()).is_transient());
        assert!(!ExchangeError::BadRequest("size".into()).is_transient());
    }

    #[test]
    fn test_rate_limit_classification() {
        assert!(ExchangeError::RateLimited { retry_after_secs: 30 }.is_rate_limit());
        assert!(ExchangeError::Http { status: 429, body: String::new() }.is_rate_limit());
        assert!(!ExchangeError::Timeout(5).is_rate_limit());
    }

    #[test]
    fn test_error_formatting() {
        let err = ExchangeError::Http { status: 502, body: "bad gateway".into() };
        assert!(err.to_string().contains("502"));
        let err = LockError::AlreadyRunning(4242);
        assert!(err.to_string().contains("4242"));
    }
}
