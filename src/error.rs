use crate::Profile;
use std::time::Duration;
use thiserror::Error;

/// Why a navigation did not produce a usable page.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NavigationFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no response")]
    NoResponse,

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("{0}")]
    Network(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeasureError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Browser launch failed: {0}")]
    ResourceLaunchFailed(String),

    #[error("Could not open browser session: {0}")]
    SessionOpenFailed(String),

    #[error("Navigation to {url} failed: {reason}")]
    NavigationFailed {
        url: String,
        reason: NavigationFailure,
    },

    #[error("Performance read failed: {0}")]
    MeasurementReadFailed(String),

    #[error("Browser closed while in use: {0}")]
    ResourceClosedConcurrently(String),

    #[error("Navigation to {url} looks blocked for the {profile} profile: {reason}")]
    LikelyBlocked {
        url: String,
        profile: Profile,
        reason: NavigationFailure,
    },

    #[error("Measurement attempt exceeded {0:?}")]
    AttemptTimeout(Duration),

    #[error("Timeout after {0:?}")]
    GlobalTimeout(Duration),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeasureError {
    pub fn is_closed_concurrently(&self) -> bool {
        matches!(self, MeasureError::ResourceClosedConcurrently(_))
    }

    pub fn is_likely_blocked(&self) -> bool {
        matches!(self, MeasureError::LikelyBlocked { .. })
    }

    /// Whether the shared browser should not be trusted after this failure.
    pub fn poisons_browser(&self) -> bool {
        matches!(
            self,
            MeasureError::SessionOpenFailed(_)
                | MeasureError::NavigationFailed { .. }
                | MeasureError::MeasurementReadFailed(_)
                | MeasureError::ResourceClosedConcurrently(_)
                | MeasureError::LikelyBlocked { .. }
                | MeasureError::AttemptTimeout(_)
        )
    }

    /// Converts a recoverable classification into the error a caller sees once
    /// no recovery is left. A blocked navigation is reported as a failed one.
    pub fn into_terminal(self) -> Self {
        match self {
            MeasureError::LikelyBlocked { url, reason, .. } => {
                MeasureError::NavigationFailed { url, reason }
            }
            other => other,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            MeasureError::InvalidUrl(_) => ErrorSeverity::Low,
            MeasureError::NavigationFailed { .. } | MeasureError::LikelyBlocked { .. } => {
                ErrorSeverity::Low
            }
            MeasureError::ConfigurationError(_) => ErrorSeverity::High,
            MeasureError::ResourceLaunchFailed(_) => ErrorSeverity::High,
            MeasureError::Internal(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Short stable name used as a metrics label and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MeasureError::InvalidUrl(_) => "invalid_url",
            MeasureError::ResourceLaunchFailed(_) => "launch_failed",
            MeasureError::SessionOpenFailed(_) => "session_failed",
            MeasureError::NavigationFailed { .. } => "navigation_failed",
            MeasureError::MeasurementReadFailed(_) => "read_failed",
            MeasureError::ResourceClosedConcurrently(_) => "closed_concurrently",
            MeasureError::LikelyBlocked { .. } => "likely_blocked",
            MeasureError::AttemptTimeout(_) => "attempt_timeout",
            MeasureError::GlobalTimeout(_) => "global_timeout",
            MeasureError::ShuttingDown => "shutting_down",
            MeasureError::ConfigurationError(_) => "configuration",
            MeasureError::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<tokio::task::JoinError> for MeasureError {
    fn from(err: tokio::task::JoinError) -> Self {
        MeasureError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for MeasureError {
    fn from(err: serde_json::Error) -> Self {
        MeasureError::ConfigurationError(err.to_string())
    }
}

impl From<std::io::Error> for MeasureError {
    fn from(err: std::io::Error) -> Self {
        MeasureError::ConfigurationError(err.to_string())
    }
}
