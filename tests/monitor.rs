use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;

use claude_usage_bar::display::{Display, View};
use claude_usage_bar::notify::{Alert, Notifier};
use claude_usage_bar::retry::RetryPolicy;
use claude_usage_bar::{
    ApiStatus, FetchError, Monitor, SessionCredential, SessionStore, Settings, SettingsStore,
    UsageData, UsageSection, UsageSource, UsageWindow,
};

fn usage(session: f64, weekly: f64) -> UsageData {
    UsageData {
        session: UsageSection::new(session, None),
        weekly: UsageSection::new(weekly, None),
        fetched_at: Some(Utc::now()),
    }
}

/// Replays queued responses, repeating the last one when the queue runs dry.
#[derive(Clone, Default)]
struct ScriptedSource {
    responses: Arc<Mutex<VecDeque<Result<UsageData, FetchError>>>>,
    calls: Arc<Mutex<u32>>,
    keys_seen: Arc<Mutex<Vec<String>>>,
    /// Stored into the session file during the next fetch
    replace_session: Arc<Mutex<Option<(SessionStore, SessionCredential)>>>,
}

impl ScriptedSource {
    fn new(responses: Vec<Result<UsageData, FetchError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Self::default()
        }
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    fn keys_seen(&self) -> Vec<String> {
        self.keys_seen.lock().unwrap().clone()
    }
}

impl UsageSource for ScriptedSource {
    fn fetch(&self, credential: &SessionCredential) -> Result<UsageData, FetchError> {
        *self.calls.lock().unwrap() += 1;
        self.keys_seen
            .lock()
            .unwrap()
            .push(credential.session_key.clone());
        if let Some((store, cred)) = self.replace_session.lock().unwrap().take() {
            store.save(&cred).unwrap();
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            responses.pop_front().unwrap()
        } else {
            responses
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(UsageData::default()))
        }
    }
}

#[derive(Clone, Default)]
struct RecordingDisplay {
    views: Arc<Mutex<Vec<View>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl Display for RecordingDisplay {
    fn render(&mut self, view: &View) {
        self.views.lock().unwrap().push(view.clone());
    }

    fn prompt(&mut self, message: &str) {
        self.prompts.lock().unwrap().push(message.to_string());
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

struct Harness {
    monitor: Monitor,
    _dir: TempDir,
    sessions: SessionStore,
    settings_store: SettingsStore,
    source: ScriptedSource,
    display: RecordingDisplay,
    notifier: RecordingNotifier,
}

fn harness(
    responses: Vec<Result<UsageData, FetchError>>,
    settings: Settings,
    policy: RetryPolicy,
    logged_in: bool,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let sessions = SessionStore::new(dir.path());
    let settings_store = SettingsStore::new(dir.path());
    if logged_in {
        sessions.save(&SessionCredential::new("sk-ant-test-key")).unwrap();
    }
    let source = ScriptedSource::new(responses);
    let display = RecordingDisplay::default();
    let notifier = RecordingNotifier::default();
    let monitor = Monitor::new(
        settings,
        settings_store.clone(),
        sessions.clone(),
        Box::new(source.clone()),
        Box::new(display.clone()),
        Box::new(notifier.clone()),
    )
    .with_retry_policy(policy);
    Harness {
        monitor,
        _dir: dir,
        sessions,
        settings_store,
        source,
        display,
        notifier,
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        ..RetryPolicy::default()
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_successful_poll_updates_display() {
    let mut h = harness(vec![Ok(usage(42.0, 12.0))], Settings::default(), fast_policy(), true);
    h.monitor.start();
    wait_until("first frame with data", || {
        h.display
            .views
            .lock()
            .unwrap()
            .last()
            .is_some_and(|v| v.status == ApiStatus::Ok)
    });

    assert_eq!(h.monitor.status(), ApiStatus::Ok);
    assert_eq!(h.source.calls(), 1);
    let views = h.display.views.lock().unwrap().clone();
    let last = views.last().unwrap();
    assert_eq!(last.status, ApiStatus::Ok);
    assert_eq!(last.meters[0].window, UsageWindow::Session);
    assert_eq!(last.meters[0].percentage, 42.0);
    assert_eq!(last.meters[1].percentage, 12.0);
    h.monitor.shutdown();
}

#[test]
fn test_persistent_network_failure_degrades_after_three_retries() {
    let mut h = harness(
        vec![Err(FetchError::Network("connection reset".to_string()))],
        Settings::default(),
        fast_policy(),
        true,
    );
    h.monitor.start();
    wait_until("degraded status", || {
        matches!(h.monitor.status(), ApiStatus::Degraded(_))
    });

    assert_eq!(h.source.calls(), 4);
    let views = h.display.views.lock().unwrap().clone();
    let retries: Vec<u32> = views
        .iter()
        .filter_map(|v| match v.status {
            ApiStatus::Retrying { attempt } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2, 3]);
    assert!(h.sessions.load().is_some());
    h.monitor.shutdown();
}

#[test]
fn test_rejected_session_is_cleared_without_retries() {
    let mut h = harness(
        vec![Err(FetchError::Auth("HTTP 401".to_string()))],
        Settings::default(),
        fast_policy(),
        true,
    );
    h.monitor.start();
    wait_until("auth required", || h.monitor.status() == ApiStatus::AuthRequired);

    assert_eq!(h.source.calls(), 1);
    assert!(h.sessions.load().is_none());
    wait_until("login prompt", || !h.display.prompts.lock().unwrap().is_empty());
    h.monitor.shutdown();
}

#[test]
fn test_missing_session_never_reaches_the_network() {
    let mut h = harness(vec![Ok(usage(1.0, 1.0))], Settings::default(), fast_policy(), false);
    h.monitor.start();
    wait_until("auth required", || h.monitor.status() == ApiStatus::AuthRequired);

    assert_eq!(h.source.calls(), 0);
    assert!(h.monitor.usage().is_none());
    h.monitor.shutdown();
}

#[test]
fn test_shutdown_interrupts_retry_backoff() {
    let slow = RetryPolicy {
        base_delay: Duration::from_secs(30),
        ..RetryPolicy::default()
    };
    let mut h = harness(
        vec![Err(FetchError::Network("down".to_string()))],
        Settings::default(),
        slow,
        true,
    );
    h.monitor.start();
    wait_until("first retry", || {
        h.monitor.status() == ApiStatus::Retrying { attempt: 1 }
    });

    let started = Instant::now();
    h.monitor.shutdown();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.source.calls(), 1);
}

#[test]
fn test_refresh_triggers_threshold_alert() {
    let settings = Settings {
        notification_thresholds: vec![80, 95],
        ..Settings::default()
    };
    let mut h = harness(
        vec![Ok(usage(50.0, 10.0)), Ok(usage(85.0, 10.0))],
        settings,
        fast_policy(),
        true,
    );
    h.monitor.start();
    wait_until("first poll", || h.monitor.usage().is_some());
    assert!(h.notifier.alerts.lock().unwrap().is_empty());

    h.monitor.refresh();
    wait_until("alert", || !h.notifier.alerts.lock().unwrap().is_empty());

    let alerts = h.notifier.alerts.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].window, UsageWindow::Session);
    assert_eq!(alerts[0].threshold, 80);
    assert_eq!(h.source.calls(), 2);
    h.monitor.shutdown();
}

#[test]
fn test_already_exceeded_threshold_is_silent_on_start() {
    let mut h = harness(vec![Ok(usage(97.0, 10.0))], Settings::default(), fast_policy(), true);
    h.monitor.start();
    wait_until("first poll", || h.monitor.usage().is_some());
    h.monitor.refresh();
    wait_until("second poll", || h.source.calls() >= 2);
    h.monitor.shutdown();

    assert!(h.notifier.alerts.lock().unwrap().is_empty());
}

#[test]
fn test_foreground_compact_toggle_is_persisted() {
    let mut h = harness(vec![Ok(usage(30.0, 20.0))], Settings::default(), fast_policy(), true);
    h.monitor.start();
    h.monitor.run_foreground(Cursor::new("c\nq\n"), false);

    assert!(h.monitor.settings().compact_mode);
    assert!(h.settings_store.try_load().unwrap().compact_mode);
    let views = h.display.views.lock().unwrap().clone();
    assert!(views.iter().any(|v| v.compact));
}

#[test]
fn test_unknown_command_prints_help() {
    let mut h = harness(vec![Ok(usage(30.0, 20.0))], Settings::default(), fast_policy(), true);
    h.monitor.run_foreground(Cursor::new("?\n\nq\n"), false);

    let prompts = h.display.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("q = quit"));
}

#[test]
fn test_interval_override_is_not_saved() {
    let mut h = harness(vec![Ok(usage(30.0, 20.0))], Settings::default(), fast_policy(), true);
    h.settings_store.save(&Settings::default()).unwrap();
    h.monitor = h.monitor.with_poll_interval(15);

    assert!(h.monitor.toggle_compact().unwrap());
    let saved = h.settings_store.try_load().unwrap();
    assert!(saved.compact_mode);
    assert_eq!(saved.poll_interval, 60);
    assert_eq!(h.monitor.settings().poll_interval, 60);
}

#[test]
fn test_session_stored_during_rejected_fetch_is_kept() {
    let mut h = harness(
        vec![
            Err(FetchError::Auth("HTTP 401".to_string())),
            Ok(usage(20.0, 5.0)),
        ],
        Settings::default(),
        fast_policy(),
        true,
    );
    *h.source.replace_session.lock().unwrap() =
        Some((h.sessions.clone(), SessionCredential::new("sk-ant-fresh")));
    h.monitor.start();
    wait_until("poll with the new session", || h.monitor.status() == ApiStatus::Ok);

    assert_eq!(h.source.keys_seen(), vec!["sk-ant-test-key", "sk-ant-fresh"]);
    assert_eq!(h.sessions.load().unwrap().session_key, "sk-ant-fresh");
    assert!(h.display.prompts.lock().unwrap().is_empty());
    h.monitor.shutdown();
}

#[cfg(unix)]
fn login_tool(key: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo 'Opening browser...'; echo 'sessionKey={key}; theme=dark'"),
    ]
}

#[cfg(unix)]
#[test]
fn test_expired_session_is_refreshed_by_login_tool() {
    let settings = Settings {
        auto_refresh_session: true,
        login_command: login_tool("sk-ant-fresh"),
        ..Settings::default()
    };
    let mut h = harness(
        vec![
            Err(FetchError::Auth("HTTP 401".to_string())),
            Ok(usage(20.0, 5.0)),
        ],
        settings,
        fast_policy(),
        true,
    );
    h.monitor.start();
    wait_until("poll after re-login", || h.monitor.status() == ApiStatus::Ok);

    assert_eq!(h.source.keys_seen(), vec!["sk-ant-test-key", "sk-ant-fresh"]);
    assert_eq!(h.sessions.load().unwrap().session_key, "sk-ant-fresh");
    assert_eq!(h.monitor.usage().unwrap().session.percentage, 20.0);
    let prompts = h.display.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("launching login"));
    h.monitor.shutdown();
}

#[cfg(unix)]
#[test]
fn test_second_rejection_does_not_loop_the_login_tool() {
    let settings = Settings {
        auto_refresh_session: true,
        login_command: login_tool("sk-ant-also-bad"),
        ..Settings::default()
    };
    let mut h = harness(
        vec![Err(FetchError::Auth("HTTP 401".to_string()))],
        settings,
        fast_policy(),
        true,
    );
    h.monitor.start();
    wait_until("manual login prompt", || {
        h.display
            .prompts
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.contains("claude-usage-bar login"))
    });
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(h.source.keys_seen(), vec!["sk-ant-test-key", "sk-ant-also-bad"]);
    assert_eq!(h.monitor.status(), ApiStatus::AuthRequired);
    assert!(h.sessions.load().is_none());
    let launches = h
        .display
        .prompts
        .lock()
        .unwrap()
        .iter()
        .filter(|p| p.contains("launching login"))
        .count();
    assert_eq!(launches, 1);
    h.monitor.shutdown();
}

#[test]
fn test_poll_speeds_up_once_reset_has_passed() {
    let reset_passed = UsageData {
        session: UsageSection::new(97.0, Some(Utc::now() - chrono::Duration::minutes(1))),
        weekly: UsageSection::new(40.0, None),
        fetched_at: Some(Utc::now()),
    };
    let mut h = harness(vec![Ok(reset_passed)], Settings::default(), fast_policy(), true);
    let started = Instant::now();
    h.monitor.start();
    wait_until("second poll", || h.source.calls() >= 2);

    // The configured interval is 60s; the follow-up poll comes after 5s
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(4), "polled again after {elapsed:?}");
    h.monitor.shutdown();
}
