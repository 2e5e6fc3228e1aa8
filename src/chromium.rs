//! Headless Chromium driven over the DevTools protocol
//!
//! Implements the engine traits with `chromiumoxide`. Every session lives in
//! its own browser context so cookies and cache never leak between
//! measurements, and heavy resource types are failed at the network layer
//! before they are downloaded.

use crate::{
    BrowserEngine, Config, EngineError, EngineProcess, EngineSession, NavigationOutcome,
    PerformanceSample, Profile, WaitCondition,
};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::fetch;
use chromiumoxide::cdp::browser_protocol::network;
use chromiumoxide::cdp::browser_protocol::page::EventFrameNavigated;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::Page;
use futures::StreamExt;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const READY_STATE_POLL: Duration = Duration::from_millis(100);

/// Sums transfer sizes over the navigation and resource timing entries.
///
/// Cross-origin resources without `Timing-Allow-Origin` report zero, so the
/// total is a lower bound.
const PERFORMANCE_SCRIPT: &str = r#"(() => {
    const navigation = performance.getEntriesByType('navigation');
    const entries = navigation.concat(performance.getEntriesByType('resource'));
    const bytes = entries.reduce((sum, entry) => sum + (entry.transferSize || 0), 0);
    const nav = navigation[0];
    const end = nav && nav.loadEventEnd > 0 ? nav.loadEventEnd : performance.now();
    return {
        bytes_transferred: bytes,
        resource_count: entries.length,
        duration_seconds: end / 1000,
    };
})()"#;

/// Chrome command-line flags for a measurement browser.
///
/// # Examples
///
/// ```rust
/// use page_footprint::{chrome_args, Config};
///
/// let args = chrome_args(&Config::default(), "doc");
/// assert!(args.iter().any(|a| a == "--headless"));
/// ```
pub fn chrome_args(config: &Config, unique_id: &str) -> Vec<String> {
    let viewport = config.primary_profile.viewport();

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--mute-audio".to_string(),
        "--disable-process-singleton-dialog".to_string(),
        "--disable-features=ProcessSingleton".to_string(),
        format!("--window-size={},{}", viewport.width, viewport.height),
        format!("--temp-dir=/tmp/page-footprint-temp-{unique_id}"),
    ];

    if let Some(memory_limit) = config.memory_limit {
        args.push(format!(
            "--js-flags=--max-old-space-size={}",
            memory_limit / 1024 / 1024
        ));
    }

    args
}

fn user_data_dir(unique_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("page-footprint-profile-{unique_id}"))
}

pub fn browser_config(config: &Config, unique_id: &str) -> Result<BrowserConfig, EngineError> {
    let viewport = config.primary_profile.viewport();

    let mut builder = BrowserConfig::builder()
        .window_size(viewport.width, viewport.height)
        .user_data_dir(user_data_dir(unique_id))
        .args(chrome_args(config, unique_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(EngineError::Launch)
}

/// Map a protocol error onto the failure kinds the core recovers from.
pub fn classify_cdp_error(error: CdpError) -> EngineError {
    classify_message(&error.to_string())
}

fn classify_message(message: &str) -> EngineError {
    let lower = message.to_lowercase();

    if lower.contains("execution context was destroyed")
        || lower.contains("cannot find context with specified id")
        || lower.contains("inspected target navigated")
    {
        EngineError::ContextDestroyed(message.to_string())
    } else if lower.contains("target closed")
        || lower.contains("session closed")
        || lower.contains("no target with given id")
        || lower.contains("browser has disconnected")
        || lower.contains("channel closed")
        || lower.contains("send failed")
        || lower.contains("websocket")
    {
        EngineError::TargetClosed(message.to_string())
    } else if lower.contains("timeout") || lower.contains("timed out") {
        EngineError::Timeout(Duration::ZERO)
    } else {
        EngineError::Protocol(message.to_string())
    }
}

/// Map a document request's `errorText` such as `net::ERR_CONNECTION_RESET`.
///
/// Connection-level refusals that typically come from bot filtering are
/// reported as blocked; everything else is a plain protocol failure.
pub fn classify_net_error(error_text: &str) -> EngineError {
    const FILTERING: &[&str] = &[
        "ERR_CONNECTION_RESET",
        "ERR_CONNECTION_CLOSED",
        "ERR_EMPTY_RESPONSE",
        "ERR_HTTP2_PROTOCOL_ERROR",
        "ERR_TIMED_OUT",
        "ERR_BLOCKED_BY_RESPONSE",
    ];

    if FILTERING.iter().any(|code| error_text.contains(code)) {
        EngineError::Blocked(error_text.to_string())
    } else {
        EngineError::Protocol(error_text.to_string())
    }
}

/// Launches Chromium processes configured from [`Config`].
pub struct ChromiumEngine {
    config: Config,
}

impl ChromiumEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn launch(&self) -> Result<Arc<dyn EngineProcess>, EngineError> {
        let unique_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());
        let browser_config = browser_config(&self.config, &unique_id)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| EngineError::Launch(e.to_string()))?;

        let (connected_tx, connected_rx) = watch::channel(true);

        // The handler implements Stream and must be polled for the connection to make progress
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler error: {}", e);
                }
            }
            info!("Browser handler stream ended");
            let _ = connected_tx.send(false);
        });

        info!("Chromium launched ({})", unique_id);

        Ok(Arc::new(ChromiumProcess {
            browser: Arc::new(Mutex::new(browser)),
            handler: handler_task,
            connected: connected_rx,
            block_images: self.config.block_images,
            user_data_dir: user_data_dir(&unique_id),
        }))
    }
}

pub struct ChromiumProcess {
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<()>,
    connected: watch::Receiver<bool>,
    block_images: bool,
    user_data_dir: PathBuf,
}

impl ChromiumProcess {
    fn blocked_types(&self) -> Vec<network::ResourceType> {
        let mut types = vec![network::ResourceType::Font, network::ResourceType::Media];
        if self.block_images {
            types.push(network::ResourceType::Image);
        }
        types
    }

    async fn open_page(&self, context_id: &BrowserContextId) -> Result<Page, EngineError> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(EngineError::Protocol)?;

        let browser = self.browser.lock().await;
        browser.new_page(params).await.map_err(classify_cdp_error)
    }

    async fn prepare_page(&self, page: &Page, profile: Profile) -> Result<JoinHandle<()>, EngineError> {
        let viewport = profile.viewport();
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(EngineError::Protocol)?;
        page.execute(metrics).await.map_err(classify_cdp_error)?;

        page.execute(SetUserAgentOverrideParams::new(profile.user_agent()))
            .await
            .map_err(classify_cdp_error)?;

        page.execute(network::EnableParams::default())
            .await
            .map_err(classify_cdp_error)?;

        let blocked = self.blocked_types();
        page.execute(fetch::EnableParams {
            patterns: Some(
                blocked
                    .iter()
                    .map(|resource_type| fetch::RequestPattern {
                        url_pattern: Some("*".to_string()),
                        resource_type: Some(resource_type.clone()),
                        request_stage: Some(fetch::RequestStage::Request),
                    })
                    .collect(),
            ),
            handle_auth_requests: Some(false),
        })
        .await
        .map_err(classify_cdp_error)?;

        let paused = page
            .event_listener::<fetch::EventRequestPaused>()
            .await
            .map_err(classify_cdp_error)?;

        Ok(spawn_interceptor(page.clone(), paused, blocked))
    }

    async fn dispose_context(&self, context_id: BrowserContextId) {
        let browser = self.browser.lock().await;
        if let Err(e) = browser
            .execute(DisposeBrowserContextParams::new(context_id))
            .await
        {
            debug!("Failed to dispose browser context: {}", e);
        }
    }
}

/// Fails every paused request of a blocked type and lets anything else through.
fn spawn_interceptor(
    page: Page,
    mut paused: EventStream<fetch::EventRequestPaused>,
    blocked: Vec<network::ResourceType>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let outcome = if blocked.contains(&event.resource_type) {
                page.execute(fetch::FailRequestParams {
                    request_id: event.request_id.clone(),
                    error_reason: network::ErrorReason::BlockedByClient,
                })
                .await
                .map(|_| ())
            } else {
                page.execute(fetch::ContinueRequestParams::new(event.request_id.clone()))
                    .await
                    .map(|_| ())
            };

            if let Err(e) = outcome {
                debug!("Request interception failed: {}", e);
            }
        }
    })
}

#[async_trait]
impl EngineProcess for ChromiumProcess {
    async fn new_session(&self, profile: Profile) -> Result<Box<dyn EngineSession>, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::TargetClosed("browser is not connected".to_string()));
        }

        let context_id = {
            let browser = self.browser.lock().await;
            browser
                .execute(CreateBrowserContextParams::default())
                .await
                .map_err(classify_cdp_error)?
                .result
                .browser_context_id
        };

        let page = match self.open_page(&context_id).await {
            Ok(page) => page,
            Err(e) => {
                self.dispose_context(context_id).await;
                return Err(e);
            }
        };

        match self.prepare_page(&page, profile).await {
            Ok(interceptor) => Ok(Box::new(ChromiumSession {
                page,
                browser: self.browser.clone(),
                context_id: Some(context_id),
                interceptor,
            })),
            Err(e) => {
                let _ = page.close().await;
                self.dispose_context(context_id).await;
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow() && !self.handler.is_finished()
    }

    async fn disconnected(&self) {
        let mut connected = self.connected.clone();
        let _ = connected.wait_for(|up| !*up).await;
    }

    async fn close(&self) {
        {
            let mut browser = self.browser.lock().await;
            match timeout(CLOSE_TIMEOUT, browser.close()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("Browser close returned an error: {}", e),
                Err(_) => warn!("Browser close timed out; killing the process"),
            }
            if let Some(Err(e)) = browser.kill().await {
                debug!("Browser kill failed: {}", e);
            }
        }
        self.handler.abort();

        if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            debug!("Could not remove {}: {}", self.user_data_dir.display(), e);
        }
    }
}

pub struct ChromiumSession {
    page: Page,
    browser: Arc<Mutex<Browser>>,
    context_id: Option<BrowserContextId>,
    interceptor: JoinHandle<()>,
}

impl ChromiumSession {
    /// Poll `document.readyState` until it is one of `states`.
    ///
    /// A context torn down by a committing navigation is polled again.
    async fn wait_ready_state(&self, states: &[&str], limit: Duration) -> Result<(), EngineError> {
        let poll = async {
            loop {
                let state = match self.page.evaluate("document.readyState").await {
                    Ok(value) => value
                        .into_value::<String>()
                        .map_err(|e| EngineError::Protocol(e.to_string()))?,
                    Err(e) => match classify_cdp_error(e) {
                        EngineError::ContextDestroyed(_) => String::new(),
                        other => return Err(other),
                    },
                };
                if states.contains(&state.as_str()) {
                    return Ok::<(), EngineError>(());
                }
                sleep(READY_STATE_POLL).await;
            }
        };

        match timeout(limit, poll).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(limit)),
        }
    }

    /// Resolve once the main frame commits to the new document or its
    /// document request fails.
    async fn await_commit(
        &self,
        events: &mut NavigationEvents,
        mut tracker: CommitTracker,
    ) -> Result<NavigationOutcome, EngineError> {
        loop {
            let signal = tokio::select! {
                biased;
                Some(event) = events.failures.next() => NavigationSignal::LoadingFailed {
                    request_id: event.request_id.inner().clone(),
                    error_text: event.error_text.clone(),
                },
                Some(event) = events.requests.next() => NavigationSignal::RequestSent {
                    request_id: event.request_id.inner().clone(),
                    frame_id: event.frame_id.as_ref().map(|id| id.inner().clone()),
                    document: event.r#type == Some(network::ResourceType::Document),
                },
                Some(event) = events.responses.next() => NavigationSignal::ResponseReceived {
                    frame_id: event.frame_id.as_ref().map(|id| id.inner().clone()),
                    document: event.r#type == network::ResourceType::Document,
                    status: event.response.status,
                },
                Some(event) = events.frames.next() => NavigationSignal::FrameNavigated {
                    frame_id: event.frame.id.inner().clone(),
                    url: event.frame.url.clone(),
                    top_level: event.frame.parent_id.is_none(),
                },
                else => {
                    return Err(EngineError::TargetClosed("page event streams ended".to_string()))
                }
            };

            if let Some(outcome) = tracker.observe(signal) {
                return outcome;
            }
        }
    }
}

/// Page events a navigation is followed through, subscribed before it starts.
struct NavigationEvents {
    requests: EventStream<network::EventRequestWillBeSent>,
    responses: EventStream<network::EventResponseReceived>,
    failures: EventStream<network::EventLoadingFailed>,
    frames: EventStream<EventFrameNavigated>,
}

impl NavigationEvents {
    async fn subscribe(page: &Page) -> Result<Self, EngineError> {
        Ok(Self {
            requests: page.event_listener().await.map_err(classify_cdp_error)?,
            responses: page.event_listener().await.map_err(classify_cdp_error)?,
            failures: page.event_listener().await.map_err(classify_cdp_error)?,
            frames: page.event_listener().await.map_err(classify_cdp_error)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NavigationSignal {
    RequestSent {
        request_id: String,
        frame_id: Option<String>,
        document: bool,
    },
    ResponseReceived {
        frame_id: Option<String>,
        document: bool,
        status: i64,
    },
    LoadingFailed {
        request_id: String,
        error_text: String,
    },
    FrameNavigated {
        frame_id: String,
        url: String,
        top_level: bool,
    },
}

/// Follows one main-frame navigation until it commits or fails.
#[derive(Debug)]
struct CommitTracker {
    frame_id: String,
    documents: HashSet<String>,
    status: Option<u16>,
}

impl CommitTracker {
    fn new(frame_id: impl Into<String>) -> Self {
        Self {
            frame_id: frame_id.into(),
            documents: HashSet::new(),
            status: None,
        }
    }

    fn is_main(&self, frame_id: Option<&str>) -> bool {
        frame_id == Some(self.frame_id.as_str())
    }

    /// Feed one event. Returns the outcome once the navigation has settled.
    fn observe(&mut self, signal: NavigationSignal) -> Option<Result<NavigationOutcome, EngineError>> {
        match signal {
            NavigationSignal::RequestSent {
                request_id,
                frame_id,
                document,
            } => {
                if document && self.is_main(frame_id.as_deref()) {
                    self.documents.insert(request_id);
                }
                None
            }
            NavigationSignal::ResponseReceived {
                frame_id,
                document,
                status,
            } => {
                if document && self.is_main(frame_id.as_deref()) {
                    self.status = u16::try_from(status).ok();
                }
                None
            }
            NavigationSignal::LoadingFailed {
                request_id,
                error_text,
            } => self
                .documents
                .contains(&request_id)
                .then(|| Err(classify_net_error(&error_text))),
            NavigationSignal::FrameNavigated {
                frame_id,
                url,
                top_level,
            } => {
                if !top_level || frame_id != self.frame_id {
                    None
                } else if url.starts_with("chrome-error:") {
                    Some(Err(EngineError::NoResponse))
                } else {
                    Some(Ok(NavigationOutcome {
                        status: self.status,
                        final_url: Some(url),
                    }))
                }
            }
        }
    }
}

/// Script that starts a navigation without waiting on it.
fn navigation_script(url: &str) -> Result<String, EngineError> {
    let quoted = serde_json::to_string(url).map_err(|e| EngineError::Protocol(e.to_string()))?;
    Ok(format!("window.location.assign({quoted}); true"))
}

#[async_trait]
impl EngineSession for ChromiumSession {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitCondition,
        limit: Duration,
    ) -> Result<NavigationOutcome, EngineError> {
        let started = Instant::now();
        let frame_id = self
            .page
            .mainframe()
            .await
            .map_err(classify_cdp_error)?
            .ok_or_else(|| EngineError::TargetClosed("page has no main frame".to_string()))?;
        let mut events = NavigationEvents::subscribe(&self.page).await?;

        let started_navigation = self
            .page
            .execute(EvaluateParams::new(navigation_script(url)?))
            .await
            .map_err(classify_cdp_error)?;
        if let Some(details) = started_navigation.result.exception_details.as_ref() {
            return Err(EngineError::Protocol(details.text.clone()));
        }

        let tracker = CommitTracker::new(frame_id.inner().clone());
        let outcome = match timeout(limit, self.await_commit(&mut events, tracker)).await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(EngineError::Timeout(limit)),
        };
        if outcome.status.is_none() {
            debug!("No document response seen for {}", url);
        }

        let states: &[&str] = match wait {
            WaitCondition::Commit => return Ok(outcome),
            WaitCondition::DomContentLoaded => &["interactive", "complete"],
            WaitCondition::Load => &["complete"],
        };
        let remaining = limit.saturating_sub(started.elapsed());
        self.wait_ready_state(states, remaining)
            .await
            .map_err(|e| match e {
                EngineError::Timeout(_) => EngineError::Timeout(limit),
                other => other,
            })?;
        Ok(outcome)
    }

    async fn wait_for_dom_ready(&mut self, limit: Duration) -> Result<(), EngineError> {
        self.wait_ready_state(&["interactive", "complete"], limit).await
    }

    async fn read_performance(&mut self) -> Result<PerformanceSample, EngineError> {
        self.page
            .evaluate(PERFORMANCE_SCRIPT)
            .await
            .map_err(classify_cdp_error)?
            .into_value::<PerformanceSample>()
            .map_err(|e| EngineError::Protocol(format!("unexpected performance sample: {e}")))
    }

    async fn close(self: Box<Self>) {
        let ChromiumSession {
            page,
            browser,
            context_id,
            interceptor,
        } = *self;

        interceptor.abort();
        match timeout(CLOSE_TIMEOUT, page.close()).await {
            Ok(Err(e)) => debug!("Page close failed: {}", e),
            Err(_) => debug!("Page close timed out"),
            Ok(Ok(())) => {}
        }

        if let Some(context_id) = context_id {
            let browser = browser.lock().await;
            let dispose = browser.execute(DisposeBrowserContextParams::new(context_id));
            if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, dispose).await {
                debug!("Failed to dispose browser context: {}", e);
            }
        }
    }
}
