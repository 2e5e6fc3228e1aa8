//! Contract between the measurement core and a browser automation engine
//!
//! The core never talks to Chrome directly. It launches an [`EngineProcess`]
//! through a [`BrowserEngine`], opens isolated [`EngineSession`]s against it and
//! reads performance samples back. Production code plugs in
//! [`crate::ChromiumEngine`]; tests plug in scripted fakes.

use crate::Viewport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by an engine implementation.
///
/// Engines classify their native errors into these kinds at the boundary so
/// the core can pick a recovery path without looking at message text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("target closed: {0}")]
    TargetClosed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no response received")]
    NoResponse,

    #[error("request blocked: {0}")]
    Blocked(String),

    #[error("execution context destroyed: {0}")]
    ContextDestroyed(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Device and network identity a session navigates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Desktop,
    Mobile,
}

impl Profile {
    pub fn viewport(&self) -> Viewport {
        match self {
            Profile::Desktop => Viewport::default(),
            Profile::Mobile => Viewport {
                width: 390,
                height: 844,
                device_scale_factor: 3.0,
                mobile: true,
            },
        }
    }

    pub fn user_agent(&self) -> &'static str {
        match self {
            Profile::Desktop => {
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
            }
            Profile::Mobile => {
                "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1"
            }
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Profile::Desktop => write!(f, "desktop"),
            Profile::Mobile => write!(f, "mobile"),
        }
    }
}

/// Navigation milestone a `navigate` call returns at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitCondition {
    /// The main frame committed to the new document.
    #[default]
    Commit,
    /// `DOMContentLoaded` fired.
    DomContentLoaded,
    /// The `load` event fired.
    Load,
}

impl std::str::FromStr for WaitCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "commit" => Ok(WaitCondition::Commit),
            "domcontentloaded" => Ok(WaitCondition::DomContentLoaded),
            "load" => Ok(WaitCondition::Load),
            other => Err(format!("unknown wait condition {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigationOutcome {
    /// HTTP status of the main document, when the engine could read it
    pub status: Option<u16>,
    pub final_url: Option<String>,
}

/// Raw numbers read from the page's performance timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub bytes_transferred: f64,
    pub resource_count: u64,
    pub duration_seconds: f64,
}

/// Launches browser engine processes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn EngineProcess>, EngineError>;
}

/// One running engine process.
#[async_trait]
pub trait EngineProcess: Send + Sync {
    /// Open an isolated browsing context configured for `profile`.
    async fn new_session(&self, profile: Profile) -> Result<Box<dyn EngineSession>, EngineError>;

    fn is_connected(&self) -> bool;

    /// Resolves once the process has crashed, exited or been closed.
    async fn disconnected(&self);

    /// Best-effort shutdown. Never fails.
    async fn close(&self);
}

/// An isolated browsing context inside an [`EngineProcess`].
#[async_trait]
pub trait EngineSession: Send {
    /// Start loading `url` and return once `wait` is reached.
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitCondition,
        timeout: Duration,
    ) -> Result<NavigationOutcome, EngineError>;

    async fn wait_for_dom_ready(&mut self, timeout: Duration) -> Result<(), EngineError>;

    async fn read_performance(&mut self) -> Result<PerformanceSample, EngineError>;

    /// Release the page and its browsing context. Never fails.
    async fn close(self: Box<Self>);
}
