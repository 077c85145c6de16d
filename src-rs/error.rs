use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Failure classification for a single conversion attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("document is encrypted and no password was supplied")]
    PasswordRequired,
    #[error("the supplied password does not open the document")]
    PasswordIncorrect,
    #[error("transient conversion failure: {0}")]
    Transient(String),
    #[error("conversion exceeded the soft time limit of {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl ConversionError {
    /// Only transient failures consume retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConversionError::Transient(_) | ConversionError::TimedOut(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConversionError::InvalidInput(_) => "invalid_input",
            ConversionError::PasswordRequired => "password_required",
            ConversionError::PasswordIncorrect => "password_incorrect",
            ConversionError::Transient(_) => "transient",
            ConversionError::TimedOut(_) => "timed_out",
        }
    }

    /// Short single-line description suitable for logs and analytics.
    pub fn diagnostic(&self) -> String {
        let text = self.to_string();
        let line = text.lines().next().unwrap_or_default();
        let short: String = line.chars().take(200).collect();
        format!("{}: {}", self.kind(), short)
    }
}

/// Errors that abort a submission. Every variant fails closed: the
/// submission is neither charged nor enqueued.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("usage ledger unavailable: {0}")]
    Ledger(#[source] StoreError),
    #[error("job queue unavailable: {0}")]
    Queue(#[source] StoreError),
    #[error("user lookup failed: {0}")]
    UserLookup(#[source] anyhow::Error),
    #[error("failed to read staged artifact: {0}")]
    Artifact(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(ConversionError::Transient("io".into()).is_retryable());
        assert!(ConversionError::TimedOut(Duration::from_secs(540)).is_retryable());
        assert!(!ConversionError::PasswordRequired.is_retryable());
        assert!(!ConversionError::PasswordIncorrect.is_retryable());
        assert!(!ConversionError::InvalidInput("not a pdf".into()).is_retryable());
    }

    #[test]
    fn diagnostics_are_short_and_single_line() {
        let error = ConversionError::Transient(format!("line one\n{}", "x".repeat(500)));
        let diagnostic = error.diagnostic();
        assert_eq!(diagnostic, "transient: transient conversion failure: line one");

        let long = ConversionError::InvalidInput("y".repeat(500)).diagnostic();
        assert!(long.len() <= "invalid_input: ".len() + 200);
    }
}
