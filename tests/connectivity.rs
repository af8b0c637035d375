//! Integration tests for the Connectivity Monitor against a mock liveness endpoint.

use std::time::{Duration, Instant};

use futures::future::join_all;
use larder::connectivity::{ConnectivityMonitor, PlatformHint, ProbeSettings};
use larder::endpoints::Endpoints;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn monitor(server: &MockServer, timeout: Duration) -> ConnectivityMonitor {
    ConnectivityMonitor::new(
        reqwest::Client::new(),
        Endpoints::new(&server.uri()).unwrap(),
        ProbeSettings {
            initial_delay: Duration::from_millis(10),
            interval: Duration::from_secs(60),
            timeout,
        },
    )
}

#[tokio::test]
async fn test_hung_probe_fails_closed_within_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let monitor = monitor(&server, Duration::from_millis(300));
    assert!(monitor.check_now().await);
    assert!(monitor.is_online());

    let started = Instant::now();
    let online = monitor.check_now().await;
    let elapsed = started.elapsed();

    assert!(!online);
    assert!(!monitor.is_online(), "a hung probe must not leave the prior ONLINE state");
    assert!(
        elapsed < Duration::from_secs(2),
        "probe took {elapsed:?}, expected roughly the 300ms timeout"
    );
}

#[tokio::test]
async fn test_consecutive_errors_stay_offline_without_flapping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let monitor = monitor(&server, Duration::from_secs(1));
    let rx = monitor.subscribe();

    for expected_failures in 1..=3 {
        assert!(!monitor.check_now().await);
        let state = monitor.state();
        assert!(!state.is_online);
        assert_eq!(state.consecutive_failures, expected_failures);
        assert!(state.last_checked_at.is_some());
    }

    // Never left OFFLINE, so subscribers were never woken
    assert!(!rx.has_changed().unwrap());
}

#[tokio::test]
async fn test_concurrent_checks_share_one_probe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let monitor = monitor(&server, Duration::from_secs(2));
    let hint = monitor.on_platform_hint(PlatformHint::Online);
    let checks = join_all((0..5).map(|_| monitor.check_now())).await;

    assert!(hint.await.unwrap());
    assert!(checks.into_iter().all(|online| online));
    assert_eq!(monitor.probes_started(), 1);
    assert!(!monitor.is_probing());
}

#[tokio::test]
async fn test_offline_hint_does_not_override_probe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let monitor = monitor(&server, Duration::from_secs(1));
    assert!(monitor.check_now().await);

    // The platform claims we are offline, but the service still answers
    let online = monitor
        .on_platform_hint(PlatformHint::Offline)
        .await
        .unwrap();
    assert!(online);
    assert!(monitor.is_online());
}

#[tokio::test]
async fn test_new_probe_after_previous_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let monitor = monitor(&server, Duration::from_secs(1));
    monitor.check_now().await;
    monitor.check_now().await;
    assert_eq!(monitor.probes_started(), 2);
}
