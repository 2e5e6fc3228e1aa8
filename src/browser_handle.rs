//! Lifecycle of the single shared browser process
//!
//! [`SharedBrowser`] owns the one engine process the service drives. It is
//! launched lazily on first use, relaunched after a crash, after an explicit
//! recreate request or after a configurable number of attempts, and closed on
//! shutdown.
//!
//! Callers hold a [`BrowserLease`] for as long as they use the process. A
//! process that is retired while leases are still out keeps running until the
//! last one is dropped, so a recycle never pulls a page out from under a
//! sibling measurement.

use crate::{BrowserEngine, EngineProcess, MeasureError, Metrics};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type LaunchResult = Result<Arc<ProcessSlot>, MeasureError>;
type LaunchFuture = Shared<BoxFuture<'static, LaunchResult>>;

/// Observable state of the shared browser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserState {
    /// Nothing launched yet, or the last process was torn down
    Unstarted,
    /// A launch is in flight; new callers join it
    Launching,
    /// A connected process is available
    Ready,
    /// The process crashed or was invalidated; the next acquire relaunches
    Disconnected,
    /// The service is shutting down and no process will be launched
    ShutDown,
}

/// One launched process plus the bookkeeping that decides when it may close.
struct ProcessSlot {
    generation: u64,
    process: Arc<dyn EngineProcess>,
    served: AtomicUsize,
    leases: Mutex<LeaseCount>,
}

#[derive(Default)]
struct LeaseCount {
    open: usize,
    retired: bool,
    closed: bool,
}

impl ProcessSlot {
    fn new(generation: u64, process: Arc<dyn EngineProcess>) -> Self {
        Self {
            generation,
            process,
            served: AtomicUsize::new(0),
            leases: Mutex::new(LeaseCount::default()),
        }
    }

    fn lock_leases(&self) -> MutexGuard<'_, LeaseCount> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the slot as no longer handed out. Returns true when the caller
    /// should close the process now; otherwise the last lease closes it.
    fn retire(&self) -> bool {
        let mut leases = self.lock_leases();
        leases.retired = true;
        if leases.open == 0 && !leases.closed {
            leases.closed = true;
            true
        } else {
            false
        }
    }

    /// Close regardless of open leases. Returns false if it was already closed.
    fn take_for_close(&self) -> bool {
        let mut leases = self.lock_leases();
        leases.retired = true;
        !std::mem::replace(&mut leases.closed, true)
    }

    fn open_leases(&self) -> usize {
        self.lock_leases().open
    }
}

/// Shared use of one browser generation.
///
/// Dropping the last lease on a retired generation closes its process in the
/// background.
pub struct BrowserLease {
    slot: Arc<ProcessSlot>,
}

impl BrowserLease {
    fn new(slot: Arc<ProcessSlot>) -> Self {
        slot.lock_leases().open += 1;
        Self { slot }
    }

    pub fn process(&self) -> &Arc<dyn EngineProcess> {
        &self.slot.process
    }

    pub fn generation(&self) -> u64 {
        self.slot.generation
    }

    /// Count one successful attempt against this generation's recycle threshold.
    pub fn record_success(&self) {
        self.slot.served.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        let close = {
            let mut leases = self.slot.lock_leases();
            leases.open = leases.open.saturating_sub(1);
            if leases.open == 0 && leases.retired && !leases.closed {
                leases.closed = true;
                true
            } else {
                false
            }
        };

        if close {
            debug!("Last lease on retired generation {} released", self.slot.generation);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(close_quietly(self.slot.process.clone()));
            }
        }
    }
}

enum HandleState {
    Unstarted,
    Launching {
        generation: u64,
        launch: LaunchFuture,
    },
    Ready(Arc<ProcessSlot>),
    Disconnected {
        stale: Option<Arc<ProcessSlot>>,
    },
    ShutDown,
}

enum Acquisition {
    Join(u64, LaunchFuture),
    Launch,
}

struct Inner {
    engine: Arc<dyn BrowserEngine>,
    state: Mutex<HandleState>,
    generation: AtomicU64,
    launches: AtomicUsize,
    recycle_after: usize,
    metrics: Arc<Metrics>,
}

/// Cloneable handle to the shared browser process.
#[derive(Clone)]
pub struct SharedBrowser {
    inner: Arc<Inner>,
}

impl SharedBrowser {
    pub fn new(engine: Arc<dyn BrowserEngine>, recycle_after: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                state: Mutex::new(HandleState::Unstarted),
                generation: AtomicU64::new(0),
                launches: AtomicUsize::new(0),
                recycle_after,
                metrics,
            }),
        }
    }

    /// Lease the running process, launching one if needed.
    ///
    /// Concurrent callers share a single launch and all observe its outcome.
    /// A failed launch is not retried here.
    pub async fn acquire(&self) -> Result<BrowserLease, MeasureError> {
        let (generation, launch) = {
            let mut state = self.lock_state();
            let acquisition = match &*state {
                HandleState::ShutDown => return Err(MeasureError::ShuttingDown),
                HandleState::Ready(slot) if slot.process.is_connected() => {
                    return Ok(BrowserLease::new(slot.clone()))
                }
                HandleState::Launching { generation, launch } => {
                    Acquisition::Join(*generation, launch.clone())
                }
                _ => Acquisition::Launch,
            };

            match acquisition {
                Acquisition::Join(generation, launch) => {
                    debug!("Joining browser launch {}", generation);
                    (generation, launch)
                }
                Acquisition::Launch => {
                    let stale = match std::mem::replace(&mut *state, HandleState::Unstarted) {
                        HandleState::Ready(slot) => Some(slot),
                        HandleState::Disconnected { stale } => stale,
                        _ => None,
                    };
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let launch = self.start_launch(generation, stale);
                    *state = HandleState::Launching {
                        generation,
                        launch: launch.clone(),
                    };
                    (generation, launch)
                }
            }
        };

        let outcome = launch.await;
        self.complete_launch(generation, &outcome);
        outcome.map(BrowserLease::new)
    }

    fn start_launch(&self, generation: u64, stale: Option<Arc<ProcessSlot>>) -> LaunchFuture {
        let engine = self.inner.engine.clone();
        info!("Launching browser (generation {})", generation);

        let task = tokio::spawn(async move {
            if let Some(stale) = stale {
                if stale.retire() {
                    close_quietly(stale.process.clone()).await;
                }
            }
            engine
                .launch()
                .await
                .map(|process| Arc::new(ProcessSlot::new(generation, process)))
                .map_err(|e| MeasureError::ResourceLaunchFailed(e.to_string()))
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(MeasureError::ResourceLaunchFailed(format!(
                    "launch task aborted: {e}"
                ))),
            }
        }
        .boxed()
        .shared()
    }

    fn complete_launch(&self, generation: u64, outcome: &LaunchResult) {
        let mut state = self.lock_state();
        let pending = matches!(
            &*state,
            HandleState::Launching { generation: g, .. } if *g == generation
        );
        if !pending {
            return;
        }

        match outcome {
            Ok(slot) => {
                *state = HandleState::Ready(slot.clone());
                drop(state);

                self.inner.launches.fetch_add(1, Ordering::SeqCst);
                self.inner.metrics.browser_launches.increment(1);
                self.watch_disconnect(slot.clone());
                info!("Browser generation {} ready", generation);
            }
            Err(e) => {
                *state = HandleState::Unstarted;
                warn!("Browser launch {} failed: {}", generation, e);
            }
        }
    }

    fn watch_disconnect(&self, slot: Arc<ProcessSlot>) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            slot.process.disconnected().await;
            if let Some(inner) = inner.upgrade() {
                SharedBrowser { inner }.mark_disconnected(slot.generation);
            }
        });
    }

    fn mark_disconnected(&self, generation: u64) {
        if self.detach(Some(generation)).is_some() {
            warn!("Browser generation {} disconnected", generation);
        }
    }

    /// Take the ready slot out of service, leaving it for the next `acquire`
    /// to close. With `only` set, nothing happens unless that generation is
    /// the current one.
    fn detach(&self, only: Option<u64>) -> Option<u64> {
        let mut state = self.lock_state();
        let generation = match &*state {
            HandleState::Ready(slot) if only.map_or(true, |g| g == slot.generation) => {
                slot.generation
            }
            _ => return None,
        };
        if let HandleState::Ready(slot) = std::mem::replace(&mut *state, HandleState::Unstarted) {
            *state = HandleState::Disconnected { stale: Some(slot) };
        }
        Some(generation)
    }

    /// Retire the current process and make the next `acquire` launch afresh.
    ///
    /// The process is closed once no lease on it remains.
    pub async fn force_recreate(&self) {
        self.retire_where(|_| true, "Recreating browser").await;
    }

    /// Like [`force_recreate`](Self::force_recreate), but only while
    /// `generation` is still the current process. A caller whose process was
    /// already replaced by someone else leaves the replacement alone.
    pub async fn recreate_generation(&self, generation: u64) {
        self.retire_where(|slot| slot.generation == generation, "Recreating browser")
            .await;
    }

    /// Retire the current process once it has served `recycle_after`
    /// successful attempts. Returns whether a recycle happened.
    pub async fn recycle_if_due(&self) -> bool {
        let threshold = self.inner.recycle_after;
        self.retire_where(
            |slot| slot.served.load(Ordering::SeqCst) >= threshold,
            "Recycling browser",
        )
        .await
    }

    async fn retire_where<F>(&self, applies: F, reason: &str) -> bool
    where
        F: Fn(&ProcessSlot) -> bool,
    {
        let retired = {
            let mut state = self.lock_state();
            let matched = match &*state {
                HandleState::Ready(slot) => applies(slot.as_ref()),
                HandleState::Disconnected { stale: Some(slot) } => applies(slot.as_ref()),
                _ => false,
            };
            if !matched {
                return false;
            }
            match std::mem::replace(&mut *state, HandleState::Unstarted) {
                HandleState::Ready(slot) => Some(slot),
                HandleState::Disconnected { stale } => stale,
                _ => None,
            }
        };

        let Some(slot) = retired else {
            return false;
        };

        info!(
            "{} (generation {}, {} open leases)",
            reason,
            slot.generation,
            slot.open_leases()
        );
        self.inner.metrics.browser_recycles.increment(1);
        if slot.retire() {
            close_quietly(slot.process.clone()).await;
        }
        true
    }

    /// Stop handing out the current process. It is closed by the next `acquire`
    /// once its leases are released.
    pub fn invalidate(&self) {
        if self.detach(None).is_some() {
            self.inner.metrics.browser_invalidations.increment(1);
            warn!("Browser invalidated; next measurement relaunches it");
        }
    }

    /// Invalidate only if `generation` is still the current process.
    pub fn invalidate_generation(&self, generation: u64) {
        if self.detach(Some(generation)).is_some() {
            self.inner.metrics.browser_invalidations.increment(1);
            warn!(
                "Browser generation {} invalidated; next measurement relaunches it",
                generation
            );
        }
    }

    /// Successful attempts served by the current process.
    pub fn served_count(&self) -> usize {
        match &*self.lock_state() {
            HandleState::Ready(slot) => slot.served.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    pub fn launch_count(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BrowserState {
        match &*self.lock_state() {
            HandleState::Unstarted => BrowserState::Unstarted,
            HandleState::Launching { .. } => BrowserState::Launching,
            HandleState::Ready(slot) if slot.process.is_connected() => BrowserState::Ready,
            HandleState::Ready(_) | HandleState::Disconnected { .. } => BrowserState::Disconnected,
            HandleState::ShutDown => BrowserState::ShutDown,
        }
    }

    /// Close the process for good, leases or not. Later `acquire` calls fail
    /// with `ShuttingDown`.
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, HandleState::ShutDown) {
                HandleState::Ready(slot) => Some(slot),
                HandleState::Disconnected { stale } => stale,
                _ => None,
            }
        };

        if let Some(slot) = previous {
            if slot.take_for_close() {
                close_quietly(slot.process.clone()).await;
            }
        }
        info!("Browser shut down");
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn close_quietly(process: Arc<dyn EngineProcess>) {
    if timeout(CLOSE_TIMEOUT, process.close()).await.is_err() {
        warn!("Browser did not close within {:?}", CLOSE_TIMEOUT);
    }
}
