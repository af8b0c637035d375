//! Connectivity Monitor: the authoritative online/offline state.
//!
//! State is derived only from active liveness probes against the Recipe
//! Service. Platform hints trigger an out-of-cycle probe but never set state.
//! Any ambiguity (timeout, transport error, non-2xx) resolves to offline.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::endpoints::Endpoints;
use crate::util::spawn_logged;

/// Timing of the probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Delay before the first scheduled probe, to stay out of the way of startup.
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Upper bound on a single probe; a hung probe is cancelled at this point.
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            interval: Duration::from_secs(12),
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub is_online: bool,
    /// `None` until the first probe resolves.
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ConnectivityState {
    fn unchecked() -> Self {
        Self {
            is_online: false,
            last_checked_at: None,
            consecutive_failures: 0,
        }
    }
}

/// Best-effort connectivity signal reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformHint {
    Online,
    Offline,
}

type ProbeFuture = Shared<BoxFuture<'static, bool>>;

struct Inner {
    http: reqwest::Client,
    endpoints: Endpoints,
    settings: ProbeSettings,
    state: watch::Sender<ConnectivityState>,
    probing: AtomicBool,
    in_flight: Mutex<Option<ProbeFuture>>,
    probe_seq: AtomicU64,
}

/// Active-probing connectivity monitor.
///
/// Cheap to clone; all clones share one state channel and one in-flight probe.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    /// Create a monitor in the `OFFLINE` state. Nothing is probed until
    /// [`start`](Self::start) or [`check_now`](Self::check_now) is called.
    pub fn new(http: reqwest::Client, endpoints: Endpoints, settings: ProbeSettings) -> Self {
        let (state, _) = watch::channel(ConnectivityState::unchecked());
        Self {
            inner: Arc::new(Inner {
                http,
                endpoints,
                settings,
                state,
                probing: AtomicBool::new(false),
                in_flight: Mutex::new(None),
                probe_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.state.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.borrow().is_online
    }

    /// Subscribe to online/offline transitions.
    ///
    /// Receivers are woken only when `is_online` flips; the latest
    /// `last_checked_at` is always visible through `borrow()`.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    pub fn is_probing(&self) -> bool {
        self.inner.probing.load(Ordering::Acquire)
    }

    /// Number of probes that actually hit the network.
    pub fn probes_started(&self) -> u64 {
        self.inner.probe_seq.load(Ordering::Relaxed)
    }

    /// Probe now, or join the probe already in flight.
    ///
    /// Concurrent callers share a single network request and all observe its
    /// result. The probe runs on its own task, so a caller that gives up
    /// waiting does not cancel it for the others.
    pub async fn check_now(&self) -> bool {
        let probe = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(probe) => probe.clone(),
                None => {
                    self.inner.probing.store(true, Ordering::Release);
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        let online = inner.probe().await;
                        inner.record(online);
                        inner.finish_flight();
                        online
                    });
                    let probe = async move { task.await.unwrap_or(false) }
                        .boxed()
                        .shared();
                    *slot = Some(probe.clone());
                    probe
                }
            }
        };
        probe.await
    }

    /// Run an immediate probe in response to a platform hint.
    ///
    /// The hint itself is never trusted: only the probe result changes state.
    pub fn on_platform_hint(&self, hint: PlatformHint) -> JoinHandle<bool> {
        tracing::debug!(?hint, "Platform connectivity hint, probing");
        let monitor = self.clone();
        tokio::spawn(async move { monitor.check_now().await })
    }

    /// Start the periodic probe loop: one probe after `initial_delay`, then
    /// one per `interval`. Abort the returned handle to stop it.
    pub fn start(&self) -> JoinHandle<()> {
        let monitor = self.clone();
        spawn_logged("connectivity-monitor", async move {
            let settings = monitor.inner.settings;
            tokio::time::sleep(settings.initial_delay).await;

            let mut ticker = tokio::time::interval(settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.check_now().await;
            }
        })
    }
}

impl Inner {
    async fn probe(&self) -> bool {
        let seq = self.probe_seq.fetch_add(1, Ordering::Relaxed);
        let cache_bust = (Utc::now().timestamp_millis() as u64).wrapping_add(seq);
        let url = self.endpoints.health_url(cache_bust);

        let request = self
            .http
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .header(reqwest::header::PRAGMA, "no-cache")
            .timeout(self.settings.timeout);

        // The outer timeout also bounds DNS and connection setup; dropping
        // the request future cancels it.
        match tokio::time::timeout(self.settings.timeout, request.send()).await {
            Ok(Ok(response)) if response.status().is_success() => true,
            Ok(Ok(response)) => {
                tracing::debug!(status = response.status().as_u16(), "Liveness probe rejected");
                false
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Liveness probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(
                    timeout_ms = self.settings.timeout.as_millis() as u64,
                    "Liveness probe timed out"
                );
                false
            }
        }
    }

    fn record(&self, online: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.is_online != online;
            state.is_online = online;
            state.last_checked_at = Some(Utc::now());
            state.consecutive_failures = if online {
                0
            } else {
                state.consecutive_failures.saturating_add(1)
            };
            if changed {
                tracing::info!(
                    is_online = online,
                    consecutive_failures = state.consecutive_failures,
                    "Connectivity changed"
                );
            }
            changed
        });
    }

    fn finish_flight(&self) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
        self.probing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn monitor_for(server: &MockServer, timeout: Duration) -> ConnectivityMonitor {
        let endpoints = Endpoints::new(&server.uri()).unwrap();
        ConnectivityMonitor::new(
            reqwest::Client::new(),
            endpoints,
            ProbeSettings {
                initial_delay: Duration::from_millis(10),
                interval: Duration::from_millis(50),
                timeout,
            },
        )
    }

    #[tokio::test]
    async fn test_starts_offline_and_unchecked() {
        let server = MockServer::start().await;
        let monitor = monitor_for(&server, Duration::from_secs(1));

        let state = monitor.state();
        assert!(!state.is_online);
        assert_eq!(state.last_checked_at, None);
        assert_eq!(monitor.probes_started(), 0);
    }

    #[tokio::test]
    async fn test_success_goes_online_and_resets_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .and(header("cache-control", "no-store"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let monitor = monitor_for(&server, Duration::from_secs(1));
        assert!(monitor.check_now().await);

        let state = monitor.state();
        assert!(state.is_online);
        assert!(state.last_checked_at.is_some());
        assert_eq!(state.consecutive_failures, 0);
        assert!(!monitor.is_probing());
    }

    #[tokio::test]
    async fn test_probe_carries_cache_bust() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .and(query_param_is_missing("cacheBust"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        // The only mock requires the parameter to be absent, so a 404 proves it was sent
        let monitor = monitor_for(&server, Duration::from_secs(1));
        assert!(!monitor.check_now().await);
    }

    #[tokio::test]
    async fn test_online_to_offline_notifies_subscribers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let monitor = monitor_for(&server, Duration::from_secs(1));
        let mut rx = monitor.subscribe();

        assert!(monitor.check_now().await);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_online);

        assert!(!monitor.check_now().await);
        assert!(rx.has_changed().unwrap());
        let state = rx.borrow_and_update().clone();
        assert!(!state.is_online);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_offline() {
        // Not pooled, so dropping it closes the port
        let server = MockServer::builder().start().await;
        let monitor = monitor_for(&server, Duration::from_millis(500));
        drop(server);

        assert!(!monitor.check_now().await);
        assert!(!monitor.is_online());
        assert_eq!(monitor.state().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_hint_triggers_probe_but_does_not_set_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let monitor = monitor_for(&server, Duration::from_secs(1));
        let online = monitor
            .on_platform_hint(PlatformHint::Online)
            .await
            .unwrap();

        assert!(!online);
        assert!(!monitor.is_online());
        assert_eq!(monitor.probes_started(), 1);
    }

    #[tokio::test]
    async fn test_periodic_loop_probes_repeatedly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let monitor = monitor_for(&server, Duration::from_secs(1));
        let task = monitor.start();

        let mut rx = monitor.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_online))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.probes_started() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        task.abort();
    }
}
