//! Error taxonomy for the exploration engine.

use std::fmt;

/// A short, stable code stored alongside every trial row in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConfigError,
    MaterializationError,
    BuildFailed,
    BuildTimeout,
    RunFailed,
    RunTimeout,
    MetricMissing,
    ArchiveError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::ConfigError => "config_error",
            ErrorCode::MaterializationError => "materialization_error",
            ErrorCode::BuildFailed => "build_failed",
            ErrorCode::BuildTimeout => "build_timeout",
            ErrorCode::RunFailed => "run_failed",
            ErrorCode::RunTimeout => "run_timeout",
            ErrorCode::MetricMissing => "metric_missing",
            ErrorCode::ArchiveError => "archive_error",
        };
        f.write_str(s)
    }
}

const MAX_MESSAGE_LEN: usize = 240;

fn truncate(msg: &str) -> String {
    if msg.len() <= MAX_MESSAGE_LEN {
        msg.to_string()
    } else {
        let cut = (0..=MAX_MESSAGE_LEN).rev().find(|&i| msg.is_char_boundary(i)).unwrap_or(0);
        let mut s = msg[..cut].to_string();
        s.push_str("...");
        s
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ScoutError {
    #[error("config error: {0}")]
    Config(String),

    #[error("materialization error: {0}")]
    Materialization(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("build timed out after {0:?}")]
    BuildTimeout(std::time::Duration),

    #[error("run failed: {0}")]
    RunFailed(String),

    #[error("run timed out after {0:?}")]
    RunTimeout(std::time::Duration),

    #[error("metric '{0}' missing from backend output")]
    MetricMissing(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("tool not found on PATH: {0}")]
    ToolNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScoutError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ScoutError::Config(_) => ErrorCode::ConfigError,
            ScoutError::Materialization(_) => ErrorCode::MaterializationError,
            ScoutError::BuildFailed(_) | ScoutError::ToolNotFound(_) => ErrorCode::BuildFailed,
            ScoutError::BuildTimeout(_) => ErrorCode::BuildTimeout,
            ScoutError::RunFailed(_) => ErrorCode::RunFailed,
            ScoutError::RunTimeout(_) => ErrorCode::RunTimeout,
            ScoutError::MetricMissing(_) => ErrorCode::MetricMissing,
            ScoutError::Archive(_) => ErrorCode::ArchiveError,
            ScoutError::Io(_) => ErrorCode::ArchiveError,
        }
    }

    /// Short, truncated message suitable for an archive row.
    pub fn short_message(&self) -> String {
        truncate(&self.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.code(), ErrorCode::ConfigError | ErrorCode::ArchiveError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_messages() {
        let long = "x".repeat(1000);
        let err = ScoutError::BuildFailed(long);
        assert!(err.short_message().len() <= MAX_MESSAGE_LEN + 3);
        assert!(err.short_message().ends_with("..."));
    }

    #[test]
    fn only_config_and_archive_errors_are_fatal() {
        assert!(ScoutError::Config("x".into()).is_fatal());
        assert!(ScoutError::Archive("x".into()).is_fatal());
        assert!(!ScoutError::RunFailed("x".into()).is_fatal());
        assert!(!ScoutError::MetricMissing("CPI".into()).is_fatal());
    }
}
