#[cfg(test)]
mod integration_tests {
    use crate::{
        BrowserEngine, BrowserState, Config, EngineError, EngineProcess, EngineSession,
        EscalationPolicy, EscalationRule, FailureClass, FootprintService, HealthChecker,
        HealthLevel, MeasureError, MeasurementAttempt, Metrics, MockBrowserEngine,
        NavigationFailure, NavigationOutcome, PerformanceSample, Profile, Recovery,
        SharedBrowser, WaitCondition,
    };
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    const PAGE_BYTES: f64 = 2_097_152.0;

    /// What the next navigation does.
    enum Nav {
        Status(u16),
        Slow(Duration),
        Fail(EngineError),
        /// Runs into the caller's navigation timeout
        Timeout,
        /// Never returns
        Stall,
    }

    enum Read {
        Sample(PerformanceSample),
        Fail(EngineError),
    }

    fn sample(bytes: f64, requests: u64, secs: f64) -> PerformanceSample {
        PerformanceSample {
            bytes_transferred: bytes,
            resource_count: requests,
            duration_seconds: secs,
        }
    }

    /// Scripted behaviour and counters shared by every fake process and session.
    ///
    /// Unscripted navigations return 200 and unscripted reads return a 2 MiB,
    /// 12 request, 5 second sample.
    #[derive(Default)]
    struct Script {
        navigations: Mutex<VecDeque<Nav>>,
        reads: Mutex<VecDeque<Read>>,
        launch_delay: Mutex<Duration>,
        failing_launches: AtomicUsize,
        launch_attempts: AtomicUsize,
        launches: AtomicUsize,
        process_closes: AtomicUsize,
        sessions_opened: AtomicUsize,
        sessions_closed: AtomicUsize,
        active_sessions: AtomicUsize,
        peak_sessions: AtomicUsize,
        navigations_made: AtomicUsize,
        reads_made: AtomicUsize,
        profiles: Mutex<Vec<Profile>>,
        waits: Mutex<Vec<WaitCondition>>,
        links: Mutex<Vec<Arc<watch::Sender<bool>>>>,
    }

    impl Script {
        fn nav(&self, step: Nav) -> &Self {
            self.navigations.lock().unwrap().push_back(step);
            self
        }

        fn read(&self, step: Read) -> &Self {
            self.reads.lock().unwrap().push_back(step);
            self
        }

        /// Simulate the newest browser process crashing.
        fn crash_current(&self) {
            if let Some(link) = self.links.lock().unwrap().last() {
                link.send_replace(false);
            }
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        fn navigations(&self) -> usize {
            self.navigations_made.load(Ordering::SeqCst)
        }

        fn opened(&self) -> usize {
            self.sessions_opened.load(Ordering::SeqCst)
        }

        fn closed(&self) -> usize {
            self.sessions_closed.load(Ordering::SeqCst)
        }

        fn profiles(&self) -> Vec<Profile> {
            self.profiles.lock().unwrap().clone()
        }

        fn process_closes(&self) -> usize {
            self.process_closes.load(Ordering::SeqCst)
        }

        fn waits(&self) -> Vec<WaitCondition> {
            self.waits.lock().unwrap().clone()
        }
    }

    #[derive(Clone, Default)]
    struct FakeEngine {
        script: Arc<Script>,
    }

    #[async_trait]
    impl BrowserEngine for FakeEngine {
        async fn launch(&self) -> Result<Arc<dyn EngineProcess>, EngineError> {
            let delay = *self.script.launch_delay.lock().unwrap();
            if !delay.is_zero() {
                sleep(delay).await;
            }

            self.script.launch_attempts.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .script
                .failing_launches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(EngineError::Launch("chrome not found".to_string()));
            }

            self.script.launches.fetch_add(1, Ordering::SeqCst);
            let link = Arc::new(watch::channel(true).0);
            self.script.links.lock().unwrap().push(link.clone());
            Ok(Arc::new(FakeProcess {
                script: self.script.clone(),
                link,
            }))
        }
    }

    struct FakeProcess {
        script: Arc<Script>,
        link: Arc<watch::Sender<bool>>,
    }

    #[async_trait]
    impl EngineProcess for FakeProcess {
        async fn new_session(&self, profile: Profile) -> Result<Box<dyn EngineSession>, EngineError> {
            if !self.is_connected() {
                return Err(EngineError::TargetClosed("browser has disconnected".to_string()));
            }

            let script = &self.script;
            script.sessions_opened.fetch_add(1, Ordering::SeqCst);
            let active = script.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
            script.peak_sessions.fetch_max(active, Ordering::SeqCst);
            script.profiles.lock().unwrap().push(profile);

            Ok(Box::new(FakeSession {
                script: script.clone(),
                link: self.link.clone(),
            }))
        }

        fn is_connected(&self) -> bool {
            *self.link.borrow()
        }

        async fn disconnected(&self) {
            let mut rx = self.link.subscribe();
            loop {
                let connected = *rx.borrow_and_update();
                if !connected || rx.changed().await.is_err() {
                    return;
                }
            }
        }

        async fn close(&self) {
            self.script.process_closes.fetch_add(1, Ordering::SeqCst);
            self.link.send_replace(false);
        }
    }

    struct FakeSession {
        script: Arc<Script>,
        link: Arc<watch::Sender<bool>>,
    }

    impl FakeSession {
        fn check_connected(&self) -> Result<(), EngineError> {
            if *self.link.borrow() {
                Ok(())
            } else {
                Err(EngineError::TargetClosed("target closed".to_string()))
            }
        }
    }

    fn committed(status: u16) -> NavigationOutcome {
        NavigationOutcome {
            status: Some(status),
            final_url: None,
        }
    }

    #[async_trait]
    impl EngineSession for FakeSession {
        async fn navigate(
            &mut self,
            _url: &str,
            wait: WaitCondition,
            timeout: Duration,
        ) -> Result<NavigationOutcome, EngineError> {
            self.check_connected()?;
            self.script.navigations_made.fetch_add(1, Ordering::SeqCst);
            self.script.waits.lock().unwrap().push(wait);

            let step = self.script.navigations.lock().unwrap().pop_front();
            match step.unwrap_or(Nav::Status(200)) {
                Nav::Status(status) => Ok(committed(status)),
                Nav::Slow(delay) => {
                    sleep(delay).await;
                    Ok(committed(200))
                }
                Nav::Fail(error) => Err(error),
                Nav::Timeout => {
                    sleep(timeout).await;
                    Err(EngineError::Timeout(timeout))
                }
                Nav::Stall => std::future::pending::<Result<NavigationOutcome, EngineError>>().await,
            }
        }

        async fn wait_for_dom_ready(&mut self, _timeout: Duration) -> Result<(), EngineError> {
            self.check_connected()
        }

        async fn read_performance(&mut self) -> Result<PerformanceSample, EngineError> {
            self.check_connected()?;
            self.script.reads_made.fetch_add(1, Ordering::SeqCst);

            let step = self.script.reads.lock().unwrap().pop_front();
            match step {
                Some(Read::Sample(sample)) => Ok(sample),
                Some(Read::Fail(error)) => Err(error),
                None => Ok(sample(PAGE_BYTES, 12, 5.0)),
            }
        }

        async fn close(self: Box<Self>) {
            self.script.sessions_closed.fetch_add(1, Ordering::SeqCst);
            self.script.active_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn service_with(config: Config) -> (Arc<FootprintService>, Arc<Script>) {
        let engine = FakeEngine::default();
        let script = engine.script.clone();
        let service = FootprintService::with_engine(config, Arc::new(engine)).unwrap();
        (Arc::new(service), script)
    }

    fn service() -> (Arc<FootprintService>, Arc<Script>) {
        service_with(Config::default())
    }

    fn attempt_with(policy: EscalationPolicy) -> (MeasurementAttempt, SharedBrowser, Arc<Script>) {
        let engine = FakeEngine::default();
        let script = engine.script.clone();
        let metrics = Arc::new(Metrics::new());
        let browser = SharedBrowser::new(Arc::new(engine), 50, metrics.clone());
        let attempt = MeasurementAttempt::new(browser.clone(), Config::default(), policy, metrics);
        (attempt, browser, script)
    }

    #[tokio::test(start_paused = true)]
    async fn measures_a_page_and_reports_megabytes() {
        let (service, script) = service();

        let report = assert_ok!(service.measure_report("https://example.com").await);

        assert!((report.page_bytes_mb - 2.0).abs() < 1e-9);
        assert_eq!(report.request_count, 12);
        assert_eq!(report.duration_seconds, 5.0);
        assert!(report.co2_grams > 0.0);
        assert_eq!(script.launches(), 1);
        assert_eq!(script.opened(), 1);
        assert_eq!(script.closed(), 1);
        assert!(service.cache().contains("https://example.com/"));
    }

    #[tokio::test(start_paused = true)]
    async fn short_loads_are_floored_to_the_minimum_duration() {
        let (service, script) = service();
        script.read(Read::Sample(sample(1024.0, 3, 0.2)));

        let result = assert_ok!(service.measure("https://example.com").await);

        assert_eq!(result.duration_seconds, 1.0);
        assert_eq!(result.bytes_transferred, 1024.0);
        assert_eq!(result.resource_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_on_both_profiles_fail_without_caching() {
        let (service, script) = service();
        script.nav(Nav::Timeout).nav(Nav::Timeout);

        let err = assert_err!(service.measure("https://example.com").await);

        assert!(
            matches!(
                err,
                MeasureError::NavigationFailed {
                    reason: NavigationFailure::Timeout(_),
                    ..
                }
            ),
            "unexpected error: {err:?}"
        );
        assert_eq!(script.profiles(), vec![Profile::Desktop, Profile::Mobile]);
        assert_eq!(script.navigations(), 2);
        assert!(service.cache().is_empty());
        assert_eq!(service.cache().in_flight_len(), 0);
        assert_eq!(script.opened(), script.closed());

        // The browser is not trusted after a terminal failure.
        assert_eq!(service.browser().state(), BrowserState::Disconnected);
        assert_ok!(service.measure("https://example.com").await);
        assert_eq!(script.launches(), 2);
        assert_eq!(script.navigations(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn callers_arriving_together_share_one_navigation() {
        let (service, script) = service();

        let first = tokio::spawn({
            let service = service.clone();
            async move { service.measure("https://a.example").await }
        });
        sleep(Duration::from_millis(10)).await;
        let second = tokio::spawn({
            let service = service.clone();
            async move { service.measure("https://a.example/").await }
        });

        let first = assert_ok!(first.await.unwrap());
        let second = assert_ok!(second.await.unwrap());

        assert_eq!(first, second);
        assert_eq!(script.navigations(), 1);
        assert_eq!(script.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_results_are_served_until_the_ttl_expires() {
        let (service, script) = service();

        let first = assert_ok!(service.measure("https://example.com").await);
        sleep(Duration::from_secs(200)).await;
        let second = assert_ok!(service.measure("https://example.com").await);
        assert_eq!(first, second);
        assert_eq!(script.navigations(), 1);

        sleep(Duration::from_secs(200)).await;
        assert_ok!(service.measure("https://example.com").await);
        assert_eq!(script.navigations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_measurements_are_retried_by_the_next_caller() {
        let (service, script) = service();
        script.read(Read::Fail(EngineError::Protocol("script threw".to_string())));

        let err = assert_err!(service.measure("https://example.com").await);
        assert!(matches!(err, MeasureError::MeasurementReadFailed(_)));

        assert_ok!(service.measure("https://example.com").await);
        assert_eq!(script.navigations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_concurrent_close_is_recovered_once() {
        let (service, script) = service();
        script.nav(Nav::Fail(EngineError::TargetClosed("session closed".to_string())));

        assert_ok!(service.measure("https://example.com").await);

        assert_eq!(script.launches(), 2);
        assert_eq!(script.navigations(), 2);
        assert_eq!(script.opened(), script.closed());
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_concurrent_close_propagates() {
        let (service, script) = service();
        script
            .nav(Nav::Fail(EngineError::TargetClosed("session closed".to_string())))
            .nav(Nav::Fail(EngineError::TargetClosed("session closed".to_string())));

        let err = assert_err!(service.measure("https://example.com").await);

        assert!(err.is_closed_concurrently());
        assert_eq!(script.launches(), 2);
        assert_eq!(script.navigations(), 2);
        assert!(service.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn a_read_racing_a_renavigation_is_retried_once() {
        let (service, script) = service();
        script
            .read(Read::Fail(EngineError::ContextDestroyed(
                "inspected target navigated".to_string(),
            )))
            .read(Read::Sample(sample(4096.0, 5, 2.5)));

        let result = assert_ok!(service.measure("https://example.com").await);

        assert_eq!(result.bytes_transferred, 4096.0);
        assert_eq!(script.reads_made.load(Ordering::SeqCst), 2);
        assert_eq!(script.navigations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_renavigation_race_fails_the_read() {
        let (service, script) = service();
        let destroyed = || EngineError::ContextDestroyed("cannot find context".to_string());
        script.read(Read::Fail(destroyed())).read(Read::Fail(destroyed()));

        let err = assert_err!(service.measure("https://example.com").await);

        assert!(matches!(err, MeasureError::MeasurementReadFailed(_)));
        assert_eq!(script.reads_made.load(Ordering::SeqCst), 2);
        assert_eq!(script.navigations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_crashed_browser_is_relaunched() {
        let (service, script) = service();

        assert_ok!(service.measure("https://a.example").await);
        script.crash_current();
        assert_eq!(service.browser().state(), BrowserState::Disconnected);

        assert_ok!(service.measure("https://b.example").await);
        assert_eq!(script.launches(), 2);
        assert_eq!(service.browser().state(), BrowserState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn the_browser_is_recycled_after_the_threshold() {
        let (service, script) = service_with(Config {
            recycle_after: 2,
            ..Default::default()
        });

        for url in ["https://a.example", "https://b.example"] {
            assert_ok!(service.measure(url).await);
        }
        assert_eq!(script.launches(), 1);

        assert_ok!(service.measure("https://c.example").await);
        assert_eq!(script.launches(), 2);
        assert_eq!(script.process_closes(), 1);
        assert_eq!(service.browser().served_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_recycle_leaves_sibling_sessions_running() {
        let (service, script) = service_with(Config {
            max_concurrent_measurements: 2,
            recycle_after: 1,
            ..Default::default()
        });
        assert_ok!(service.measure("https://a.example").await);

        script
            .nav(Nav::Slow(Duration::from_secs(10)))
            .nav(Nav::Slow(Duration::from_secs(1)));
        let late = async {
            sleep(Duration::from_secs(2)).await;
            service.measure("https://d.example").await
        };
        let (c, b, d) = tokio::join!(
            service.measure("https://c.example"),
            service.measure("https://b.example"),
            late,
        );

        assert_ok!(c);
        assert_ok!(b);
        assert_ok!(d);
        // d's recycle retired the process c was still navigating on.
        assert_eq!(script.navigations(), 4);
        assert_eq!(script.launches(), 3);
        assert_eq!(script.opened(), script.closed());

        sleep(Duration::from_millis(10)).await;
        assert_eq!(script.process_closes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_forbidden_response_retries_with_the_fallback_profile() {
        let (service, script) = service();
        script.nav(Nav::Status(403));

        assert_ok!(service.measure("https://example.com").await);

        assert_eq!(script.profiles(), vec![Profile::Desktop, Profile::Mobile]);
        assert_eq!(script.navigations(), 2);
        assert_eq!(script.launches(), 1);
        assert_eq!(script.opened(), script.closed());
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_without_a_fallback_profile_is_a_navigation_failure() {
        let (service, script) = service_with(Config {
            fallback_profile: None,
            ..Default::default()
        });
        script.nav(Nav::Status(429));

        let err = assert_err!(service.measure("https://example.com").await);

        assert_eq!(
            err,
            MeasureError::NavigationFailed {
                url: "https://example.com/".to_string(),
                reason: NavigationFailure::HttpStatus(429),
            }
        );
        assert_eq!(script.navigations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_timed_out_caller_leaves_the_result_for_the_next_one() {
        let (service, script) = service_with(Config {
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        script.nav(Nav::Slow(Duration::from_secs(5)));

        let err = assert_err!(service.measure("https://slow.example").await);
        assert_eq!(err, MeasureError::GlobalTimeout(Duration::from_secs(2)));

        // The measurement ran through the whole request window, so later
        // requests get a new browser while this one finishes on the old one.
        assert_eq!(service.browser().state(), BrowserState::Disconnected);
        assert_eq!(script.process_closes(), 0);

        sleep(Duration::from_secs(10)).await;
        assert!(service.cache().contains("https://slow.example/"));
        assert_eq!(script.process_closes(), 0);

        assert_ok!(service.measure("https://slow.example").await);
        assert_eq!(script.navigations(), 1);

        assert_ok!(service.measure("https://other.example").await);
        assert_eq!(script.launches(), 2);
        assert_eq!(script.process_closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_caller_timing_out_in_the_backlog_keeps_the_browser() {
        let (service, script) = service_with(Config {
            request_timeout: Duration::from_secs(4),
            ..Default::default()
        });
        script.nav(Nav::Slow(Duration::from_millis(1500)));

        let (first, queued) = tokio::join!(
            service.measure("https://a.example"),
            service.measure("https://b.example"),
        );

        assert_ok!(first);
        assert_eq!(
            assert_err!(queued),
            MeasureError::GlobalTimeout(Duration::from_secs(4))
        );
        assert_eq!(service.browser().state(), BrowserState::Ready);

        sleep(Duration::from_secs(5)).await;
        assert!(service.cache().contains("https://b.example/"));
        assert_eq!(script.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_wedged_attempt_invalidates_the_browser() {
        let (service, script) = service();
        script.nav(Nav::Stall);

        let err = assert_err!(service.measure("https://example.com").await);
        assert_eq!(err, MeasureError::AttemptTimeout(Duration::from_secs(40)));
        assert_eq!(service.browser().state(), BrowserState::Disconnected);

        // The abandoned session is closed in the background.
        sleep(Duration::from_millis(10)).await;
        assert_eq!(script.opened(), script.closed());

        assert_ok!(service.measure("https://example.com").await);
        assert_eq!(script.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn one_session_at_a_time_by_default() {
        let (service, script) = service();
        let urls = ["https://a.example", "https://b.example", "https://c.example"];

        let results = join_all(urls.iter().map(|url| service.measure(url))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(script.peak_sessions.load(Ordering::SeqCst), 1);
        assert_eq!(script.opened(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_overlap_up_to_the_configured_capacity() {
        let (service, script) = service_with(Config {
            max_concurrent_measurements: 2,
            ..Default::default()
        });
        let urls = [
            "https://a.example",
            "https://b.example",
            "https://c.example",
            "https://d.example",
        ];

        let results = join_all(urls.iter().map(|url| service.measure(url))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(script.peak_sessions.load(Ordering::SeqCst), 2);
        assert_eq!(script.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_measurement_deduplicates_repeated_urls() {
        let (service, script) = service();
        let urls = vec![
            "https://a.example".to_string(),
            "https://A.example/".to_string(),
            "https://b.example".to_string(),
        ];

        let results = service.measure_many(urls).await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, report)| report.is_ok()));
        assert_eq!(results[0].0, "https://a.example");
        assert_eq!(script.navigations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_urls_never_reach_the_browser() {
        let (service, script) = service();

        for url in ["ftp://example.com", "not a url", "http://127.0.0.1/", "http://localhost:3000"] {
            let err = assert_err!(service.measure(url).await);
            assert!(matches!(err, MeasureError::InvalidUrl(_)), "{url}: {err:?}");
        }

        assert_eq!(script.launch_attempts.load(Ordering::SeqCst), 0);
        assert!(service.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_completed_work() {
        let (service, _script) = service();
        assert_eq!(service.stats().browser_state, BrowserState::Unstarted);

        assert_ok!(service.measure("https://example.com").await);

        let stats = service.stats();
        assert_eq!(stats.queue.capacity, 1);
        assert_eq!(stats.queue.waiting, 0);
        assert_eq!(stats.queue.running, 0);
        assert_eq!(stats.browser_state, BrowserState::Ready);
        assert_eq!(stats.browser_launches, 1);
        assert_eq!(stats.served_since_launch, 1);
        assert_eq!(stats.cache_entries, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.workers.len(), 1);
        assert_eq!(stats.workers[0].processed_count, 1);
        assert_eq!(stats.workers[0].error_count, 0);

        let health = HealthChecker::default().check(&service);
        assert_eq!(health.queue, HealthLevel::Healthy);
        assert_eq!(health.browser, HealthLevel::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_measurements() {
        let (service, script) = service();
        assert_ok!(service.measure("https://a.example").await);

        service.shutdown().await;

        let err = assert_err!(service.measure("https://b.example").await);
        assert_eq!(err, MeasureError::ShuttingDown);
        assert_eq!(service.browser().state(), BrowserState::ShutDown);
        assert_eq!(script.process_closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn navigations_wait_for_the_configured_milestone() {
        let (service, script) = service();
        assert_ok!(service.measure("https://a.example").await);

        let (loading, loading_script) = service_with(Config {
            navigation_wait: WaitCondition::Load,
            ..Default::default()
        });
        assert_ok!(loading.measure("https://a.example").await);

        assert_eq!(script.waits(), vec![WaitCondition::Commit]);
        assert_eq!(loading_script.waits(), vec![WaitCondition::Load]);
    }

    #[tokio::test]
    async fn launch_failures_surface_and_are_not_cached() {
        let mut engine = MockBrowserEngine::new();
        engine
            .expect_launch()
            .times(2)
            .returning(|| Err(EngineError::Launch("chrome not found".to_string())));
        let service = FootprintService::with_engine(Config::default(), Arc::new(engine)).unwrap();

        for _ in 0..2 {
            let err = assert_err!(service.measure("https://example.com").await);
            assert!(matches!(err, MeasureError::ResourceLaunchFailed(_)), "{err:?}");
        }
        assert!(service.cache().is_empty());
        assert_eq!(service.browser().state(), BrowserState::Unstarted);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_launch() {
        let engine = FakeEngine::default();
        *engine.script.launch_delay.lock().unwrap() = Duration::from_millis(200);
        let browser = SharedBrowser::new(Arc::new(engine.clone()), 50, Arc::new(Metrics::new()));

        let results = join_all((0..3).map(|_| browser.acquire())).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(engine.script.launch_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(browser.launch_count(), 1);
        assert_eq!(browser.state(), BrowserState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn a_failed_launch_reaches_every_waiter_and_is_not_retried() {
        let engine = FakeEngine::default();
        *engine.script.launch_delay.lock().unwrap() = Duration::from_millis(200);
        engine.script.failing_launches.store(1, Ordering::SeqCst);
        let browser = SharedBrowser::new(Arc::new(engine.clone()), 50, Arc::new(Metrics::new()));

        let results = join_all((0..3).map(|_| browser.acquire())).await;

        for result in &results {
            assert!(matches!(result, Err(MeasureError::ResourceLaunchFailed(_))));
        }
        assert_eq!(engine.script.launch_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(browser.state(), BrowserState::Unstarted);

        assert_ok!(browser.acquire().await);
        assert_eq!(engine.script.launch_attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn force_recreate_closes_the_running_process() {
        let engine = FakeEngine::default();
        let browser = SharedBrowser::new(Arc::new(engine.clone()), 50, Arc::new(Metrics::new()));
        let lease = assert_ok!(browser.acquire().await);
        lease.record_success();
        assert_eq!(browser.served_count(), 1);
        drop(lease);

        browser.force_recreate().await;

        assert_eq!(browser.state(), BrowserState::Unstarted);
        assert_eq!(browser.served_count(), 0);
        assert_eq!(engine.script.process_closes(), 1);

        assert_ok!(browser.acquire().await);
        assert_eq!(browser.launch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn a_retired_process_closes_when_its_last_lease_ends() {
        let engine = FakeEngine::default();
        let browser = SharedBrowser::new(Arc::new(engine.clone()), 50, Arc::new(Metrics::new()));
        let first = assert_ok!(browser.acquire().await);
        let second = assert_ok!(browser.acquire().await);

        browser.force_recreate().await;
        assert_eq!(engine.script.process_closes(), 0);
        assert!(first.process().is_connected());

        drop(first);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.script.process_closes(), 0);

        drop(second);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.script.process_closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recreating_a_replaced_generation_keeps_the_new_process() {
        let engine = FakeEngine::default();
        let browser = SharedBrowser::new(Arc::new(engine.clone()), 50, Arc::new(Metrics::new()));
        let old = assert_ok!(browser.acquire().await).generation();

        browser.recreate_generation(old).await;
        let current = assert_ok!(browser.acquire().await).generation();
        assert_ne!(old, current);

        browser.recreate_generation(old).await;
        browser.invalidate_generation(old);

        assert_eq!(browser.state(), BrowserState::Ready);
        assert_eq!(engine.script.launches(), 2);
        assert_eq!(engine.script.process_closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recycling_waits_for_the_threshold() {
        let engine = FakeEngine::default();
        let browser = SharedBrowser::new(Arc::new(engine.clone()), 2, Arc::new(Metrics::new()));

        let lease = assert_ok!(browser.acquire().await);
        lease.record_success();
        drop(lease);
        assert!(!browser.recycle_if_due().await);

        assert_ok!(browser.acquire().await).record_success();
        assert!(browser.recycle_if_due().await);
        assert!(!browser.recycle_if_due().await);
        assert_eq!(browser.state(), BrowserState::Unstarted);
        assert_eq!(engine.script.process_closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_shut_down_browser_is_never_relaunched() {
        let engine = FakeEngine::default();
        let browser = SharedBrowser::new(Arc::new(engine.clone()), 50, Arc::new(Metrics::new()));
        assert_ok!(browser.acquire().await);

        browser.shutdown().await;

        assert!(matches!(browser.acquire().await, Err(MeasureError::ShuttingDown)));
        assert_eq!(engine.script.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_follows_the_configured_rules_only() {
        let (attempt, _browser, script) = attempt_with(EscalationPolicy::new(vec![EscalationRule {
            when: FailureClass::LikelyBlocked,
            then: Recovery::FallbackProfile,
        }]));
        script.nav(Nav::Fail(EngineError::TargetClosed("session closed".to_string())));

        let err = assert_err!(attempt.run("https://example.com/", false).await);

        assert!(err.is_closed_concurrently());
        assert_eq!(script.launches(), 1);
        assert_eq!(script.navigations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_forced_fresh_run_relaunches_and_does_not_relaunch_again() {
        let (attempt, browser, script) = attempt_with(EscalationPolicy::standard());
        assert_ok!(attempt.run("https://example.com/", false).await);
        script.nav(Nav::Fail(EngineError::TargetClosed("session closed".to_string())));

        let err = assert_err!(attempt.run("https://example.com/", true).await);

        assert!(err.is_closed_concurrently());
        assert_eq!(script.launches(), 2);
        assert_eq!(script.navigations(), 2);
        assert_eq!(browser.state(), BrowserState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn network_blocking_escalates_to_the_fallback_profile() {
        let (attempt, _browser, script) = attempt_with(EscalationPolicy::standard());
        script.nav(Nav::Fail(EngineError::Blocked("net::ERR_CONNECTION_RESET".to_string())));

        assert_ok!(attempt.run("https://example.com/", false).await);

        assert_eq!(script.profiles(), vec![Profile::Desktop, Profile::Mobile]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_response_is_not_escalated() {
        let (attempt, _browser, script) = attempt_with(EscalationPolicy::standard());
        script.nav(Nav::Fail(EngineError::NoResponse));

        let err = assert_err!(attempt.run("https://example.com/", false).await);

        assert!(matches!(
            err,
            MeasureError::NavigationFailed {
                reason: NavigationFailure::NoResponse,
                ..
            }
        ));
        assert_eq!(script.navigations(), 1);
    }

    #[test]
    fn standard_policy_maps_failure_classes_to_recoveries() {
        let policy = EscalationPolicy::standard();
        let closed = MeasureError::ResourceClosedConcurrently("target closed".to_string());
        let blocked = MeasureError::LikelyBlocked {
            url: "https://example.com/".to_string(),
            profile: Profile::Desktop,
            reason: NavigationFailure::HttpStatus(403),
        };

        assert_eq!(policy.recovery_for(&closed), Some(Recovery::RecreateBrowser));
        assert_eq!(policy.recovery_for(&blocked), Some(Recovery::FallbackProfile));
        assert_eq!(
            policy.recovery_for(&MeasureError::MeasurementReadFailed("x".to_string())),
            None
        );
        assert_eq!(EscalationPolicy::none().recovery_for(&closed), None);
        assert_eq!(EscalationPolicy::default(), policy);
    }

    #[test]
    fn blocked_errors_become_navigation_failures_when_terminal() {
        let blocked = MeasureError::LikelyBlocked {
            url: "https://example.com/".to_string(),
            profile: Profile::Mobile,
            reason: NavigationFailure::Timeout(Duration::from_secs(15)),
        };
        assert!(blocked.poisons_browser());
        assert_eq!(blocked.kind(), "likely_blocked");

        assert_eq!(
            blocked.into_terminal(),
            MeasureError::NavigationFailed {
                url: "https://example.com/".to_string(),
                reason: NavigationFailure::Timeout(Duration::from_secs(15)),
            }
        );
        assert!(!MeasureError::InvalidUrl("x".to_string()).poisons_browser());
        assert!(!MeasureError::ResourceLaunchFailed("x".to_string()).poisons_browser());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_measurements, 1);
        assert_eq!(config.navigation_timeout, Duration::from_secs(15));
        assert_eq!(config.request_timeout, Duration::from_secs(45));
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.recycle_after, 50);
        assert_eq!(config.primary_profile, Profile::Desktop);
        assert_eq!(config.fallback_profile, Some(Profile::Mobile));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_environment_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FOOTPRINT_NAVIGATION_TIMEOUT_MS", "8000"),
            ("FOOTPRINT_REQUEST_TIMEOUT_MS", "20000"),
            ("FOOTPRINT_CACHE_TTL_SECS", "60"),
            ("FOOTPRINT_RECYCLE_AFTER", "5"),
            ("FOOTPRINT_MAX_CONCURRENT", "2"),
            ("FOOTPRINT_BLOCK_IMAGES", "1"),
            ("FOOTPRINT_NAVIGATION_WAIT", "DOMContentLoaded"),
            ("CHROME_PATH", "/usr/bin/chromium"),
        ]);
        let mut config = Config::default();

        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.navigation_timeout, Duration::from_secs(8));
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.recycle_after, 5);
        assert_eq!(config.max_concurrent_measurements, 2);
        assert!(config.block_images);
        assert_eq!(config.navigation_wait, WaitCondition::DomContentLoaded);
        assert_eq!(config.chrome_path.as_deref(), Some("/usr/bin/chromium"));
        assert_eq!(config.dom_ready_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_rejects_malformed_environment() {
        for name in ["FOOTPRINT_CACHE_TTL_SECS", "FOOTPRINT_NAVIGATION_WAIT"] {
            let mut config = Config::default();
            let err = config
                .apply_overrides(|var| (var == name).then(|| "soon".to_string()))
                .unwrap_err();
            assert!(matches!(err, MeasureError::ConfigurationError(_)), "{name}");
        }
    }

    #[test]
    fn test_config_validation() {
        let rejected = [
            Config {
                max_concurrent_measurements: 0,
                ..Default::default()
            },
            Config {
                request_timeout: Duration::ZERO,
                ..Default::default()
            },
            Config {
                cache_ttl: Duration::ZERO,
                ..Default::default()
            },
            Config {
                recycle_after: 0,
                ..Default::default()
            },
            Config {
                fallback_profile: Some(Profile::Desktop),
                ..Default::default()
            },
        ];

        for config in rejected {
            assert!(matches!(
                config.validate(),
                Err(MeasureError::ConfigurationError(_))
            ));
        }
    }

    #[test]
    fn test_config_file_fills_missing_fields_with_defaults() {
        let path = std::env::temp_dir().join(format!("page-footprint-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"max_concurrent_measurements": 2, "recycle_after": 10, "fallback_profile": null, "navigation_wait": "load"}"#,
        )
        .unwrap();

        let config = Config::from_file(&path);
        let _ = std::fs::remove_file(&path);
        let config = config.unwrap();

        assert_eq!(config.max_concurrent_measurements, 2);
        assert_eq!(config.recycle_after, 10);
        assert_eq!(config.fallback_profile, None);
        assert_eq!(config.navigation_wait, WaitCondition::Load);
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn invalid_config_is_rejected_when_building_the_service() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let result = FootprintService::with_engine(
                Config {
                    recycle_after: 0,
                    ..Default::default()
                },
                Arc::new(FakeEngine::default()),
            );
            assert!(matches!(result, Err(MeasureError::ConfigurationError(_))));
        });
    }
}
