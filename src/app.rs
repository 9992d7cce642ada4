//! The running widget: a background poll thread feeding the display, and a
//! foreground loop handling user commands.

use std::io::BufRead;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::credentials::{SessionCredential, SessionStore};
use crate::display::{self, Display, View};
use crate::error::{CredentialError, LoginError, SettingsError};
use crate::login::LoginRunner;
use crate::models::{ApiStatus, UsageData};
use crate::notify::{Notifier, NotificationTracker};
use crate::poller::{ErrorKind, FetchError, UsageSource};
use crate::prediction::UsagePredictor;
use crate::retry::{deadline_after, fetch_with_retry, PollControl, RetryPolicy, Wake};
use crate::settings::{Settings, SettingsStore, MAX_POLL_INTERVAL_SECS, MIN_POLL_INTERVAL_SECS};

/// Poll interval once a reset time has passed, to pick up fresh numbers quickly.
const RESET_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct AppState {
    data: Option<UsageData>,
    status: ApiStatus,
    last_poll_ok: bool,
    prediction: Option<Duration>,
}

/// State shared by the poll thread and the foreground.
struct Shared {
    settings: Mutex<Settings>,
    state: Mutex<AppState>,
    display: Mutex<Box<dyn Display>>,
    control: PollControl,
    settings_store: SettingsStore,
    sessions: SessionStore,
    /// Serialises writes to the session file between the poll and login threads
    session_lock: Mutex<()>,
    login: LoginRunner,
}

/// Lock a mutex, recovering from poisoning
fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn settings(&self) -> Settings {
        lock(&self.settings).clone()
    }

    fn set_status(&self, status: ApiStatus) {
        lock(&self.state).status = status;
        self.render();
    }

    fn render(&self) {
        let settings = self.settings();
        let view = {
            let state = lock(&self.state);
            View::build(
                state.data.as_ref(),
                state.status.clone(),
                state.prediction,
                &settings,
                !state.last_poll_ok,
                Utc::now(),
            )
        };
        lock(&self.display).render(&view);
    }

    fn prompt(&self, message: &str) {
        lock(&self.display).prompt(message);
    }

    fn store_session(&self, cred: &SessionCredential) -> Result<(), CredentialError> {
        let _guard = lock(&self.session_lock);
        self.sessions.save(cred)
    }

    /// Delete the stored session only if it is still the one that was rejected.
    fn forget_session(&self, rejected: &SessionCredential) -> Result<bool, CredentialError> {
        let _guard = lock(&self.session_lock);
        self.sessions.clear_if(rejected)
    }

    /// Delay until a countdown on screen would change, if data is shown.
    fn countdown_delay(&self) -> Option<Duration> {
        let state = lock(&self.state);
        if !state.last_poll_ok {
            return None;
        }
        let data = state.data.as_ref()?;
        let now = Utc::now();
        let session = display::time_until_display_change(data.session.resets_at, now);
        let weekly = display::time_until_display_change(data.weekly.resets_at, now);
        match (session, weekly) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Runs on the poll thread and owns everything only it touches.
struct PollWorker {
    shared: Arc<Shared>,
    source: Box<dyn UsageSource>,
    notifier: Box<dyn Notifier>,
    policy: RetryPolicy,
    tracker: NotificationTracker,
    predictor: UsagePredictor,
    relogin_attempted: bool,
    /// Poll interval for this run only, never written back to the settings file
    interval_override: Option<u64>,
}

impl PollWorker {
    fn run(mut self) {
        info!("Poll loop started");
        loop {
            if self.shared.control.is_stopped() {
                break;
            }
            let interval = self.poll_once();
            if !self.wait_for_next_poll(interval) {
                break;
            }
        }
        info!("Poll loop stopped");
    }

    /// Sleep until the next poll, redrawing countdowns as they tick over.
    /// Returns `false` on shutdown.
    fn wait_for_next_poll(&self, interval: Duration) -> bool {
        let deadline = deadline_after(interval);
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    deadline - now
                }
                None => Duration::MAX,
            };
            let step = self
                .shared
                .countdown_delay()
                .map_or(remaining, |d| d.min(remaining));
            match self.shared.control.wait(step) {
                Wake::Stop => return false,
                Wake::Refresh => {
                    debug!("Manual refresh requested");
                    return true;
                }
                Wake::Timeout => self.shared.render(),
            }
        }
    }

    /// One fetch cycle. Returns how long to wait before the next one.
    fn poll_once(&mut self) -> Duration {
        let mut settings = self.shared.settings();
        if let Some(secs) = self.interval_override {
            settings.poll_interval = secs;
        }
        self.tracker.set_thresholds(&settings.notification_thresholds);
        self.tracker.set_enabled(settings.notifications_enabled);
        self.tracker.set_cooldown(settings.notification_cooldown());

        let Some(credential) = self.shared.sessions.load() else {
            return self.handle_auth_failure(&settings, &FetchError::no_credentials(), None);
        };

        debug!("Fetching usage data...");
        let shared = &self.shared;
        let source = &self.source;
        let result = fetch_with_retry(
            &self.policy,
            &shared.control,
            || source.fetch(&credential),
            |retry, _, _| shared.set_status(ApiStatus::Retrying { attempt: retry }),
        );

        match result {
            Ok(data) => self.handle_success(data, &settings),
            Err(FetchError::Cancelled) => Duration::ZERO,
            Err(e) if e.kind() == ErrorKind::Auth => {
                self.handle_auth_failure(&settings, &e, Some(&credential))
            }
            Err(e) => {
                error!("Usage fetch failed: {e}");
                {
                    let mut state = lock(&self.shared.state);
                    state.status = ApiStatus::Degraded(e.to_string());
                    state.last_poll_ok = false;
                }
                self.shared.render();
                settings.poll_interval()
            }
        }
    }

    fn handle_success(&mut self, data: UsageData, settings: &Settings) -> Duration {
        let now = Instant::now();
        info!(
            "Usage: 5h {:.1}%, 7d {:.1}%",
            data.session.percentage, data.weekly.percentage
        );

        let alerts = self.tracker.check(&data, now);
        let past_reset = data.is_past_reset(Utc::now());
        {
            let mut state = lock(&self.shared.state);
            let rolled_over = state
                .data
                .as_ref()
                .is_some_and(|old| old.session.resets_at != data.session.resets_at);
            if rolled_over {
                self.predictor.clear();
            }
            state.prediction = if settings.show_prediction {
                self.predictor.record(data.session.percentage, now)
            } else {
                None
            };
            state.data = Some(data);
            state.status = ApiStatus::Ok;
            state.last_poll_ok = true;
        }
        self.relogin_attempted = false;
        self.shared.render();

        for alert in &alerts {
            self.notifier.notify(alert);
        }

        if past_reset {
            RESET_POLL
        } else {
            settings.poll_interval()
        }
    }

    /// `rejected` is the credential the service refused, or `None` when
    /// there was no stored session to try.
    fn handle_auth_failure(
        &mut self,
        settings: &Settings,
        err: &FetchError,
        rejected: Option<&SessionCredential>,
    ) -> Duration {
        if let Some(rejected) = rejected {
            match self.shared.forget_session(rejected) {
                Ok(true) => {}
                Ok(false) if self.shared.sessions.load().is_some() => {
                    info!("Session replaced during the fetch, polling again");
                    return Duration::ZERO;
                }
                Ok(false) => {}
                Err(e) => error!("Failed to remove rejected session: {e}"),
            }
        }

        let newly_failed = {
            let mut state = lock(&self.shared.state);
            let newly = state.status != ApiStatus::AuthRequired;
            state.status = ApiStatus::AuthRequired;
            state.last_poll_ok = false;
            newly
        };
        if newly_failed {
            warn!("{err}");
        }
        self.shared.render();

        let can_relogin = settings.auto_refresh_session
            && !settings.login_command.is_empty()
            && !self.relogin_attempted;
        if !can_relogin {
            if newly_failed {
                self.shared
                    .prompt("Session expired or missing. Run `claude-usage-bar login` to sign in.");
            }
            return settings.poll_interval();
        }

        self.relogin_attempted = true;
        self.shared.prompt("Session expired, launching login...");
        match self.shared.login.run(
            &settings.login_command,
            settings.login_timeout(),
            Some(&self.shared.control),
        ) {
            Ok(cred) => match self.shared.store_session(&cred) {
                Ok(()) => {
                    info!("Session refreshed, polling again");
                    lock(&self.shared.state).status = ApiStatus::Unknown;
                    Duration::ZERO
                }
                Err(e) => {
                    error!("Failed to store refreshed session: {e}");
                    settings.poll_interval()
                }
            },
            Err(LoginError::Cancelled) => Duration::ZERO,
            Err(e) => {
                self.shared.prompt(&format!("Login failed: {e}"));
                settings.poll_interval()
            }
        }
    }
}

/// A foreground command read from the input stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Refresh,
    ToggleCompact,
    Login,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "r" | "refresh" => Some(Command::Refresh),
            "c" | "compact" => Some(Command::ToggleCompact),
            "l" | "login" => Some(Command::Login),
            "q" | "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

/// The widget: owns the poll thread and exposes the user-facing actions.
pub struct Monitor {
    shared: Arc<Shared>,
    worker: Option<PollWorker>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(
        settings: Settings,
        settings_store: SettingsStore,
        sessions: SessionStore,
        source: Box<dyn UsageSource>,
        display: Box<dyn Display>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        let tracker = NotificationTracker::new(
            &settings.notification_thresholds,
            settings.notification_cooldown(),
        );
        let shared = Arc::new(Shared {
            settings: Mutex::new(settings),
            state: Mutex::new(AppState::default()),
            display: Mutex::new(display),
            control: PollControl::new(),
            settings_store,
            sessions,
            session_lock: Mutex::new(()),
            login: LoginRunner::new(),
        });
        let worker = PollWorker {
            shared: Arc::clone(&shared),
            source,
            notifier,
            policy: RetryPolicy::default(),
            tracker,
            predictor: UsagePredictor::new(),
            relogin_attempted: false,
            interval_override: None,
        };
        Self {
            shared,
            worker: Some(worker),
            handle: None,
        }
    }

    /// Override the backoff schedule. Only effective before [`start`](Self::start).
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.policy = policy;
        }
        self
    }

    /// Poll every `secs` seconds for this run without touching the saved settings.
    /// Clamped like the setting. Only effective before [`start`](Self::start).
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.interval_override =
                Some(secs.clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS));
        }
        self
    }

    /// Spawn the poll thread. The first poll happens immediately.
    pub fn start(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.render();
        self.handle = Some(std::thread::spawn(move || worker.run()));
    }

    pub fn refresh(&self) {
        self.shared.control.request_refresh();
    }

    pub fn status(&self) -> ApiStatus {
        lock(&self.shared.state).status.clone()
    }

    pub fn usage(&self) -> Option<UsageData> {
        lock(&self.shared.state).data.clone()
    }

    pub fn settings(&self) -> Settings {
        self.shared.settings()
    }

    /// Flip compact mode, persist it, and redraw. Returns the new value.
    pub fn toggle_compact(&self) -> Result<bool, SettingsError> {
        let updated = {
            let mut settings = lock(&self.shared.settings);
            settings.compact_mode = !settings.compact_mode;
            settings.clone()
        };
        self.shared.settings_store.save(&updated)?;
        self.shared.render();
        Ok(updated.compact_mode)
    }

    /// Run the login tool on a helper thread; a new session triggers a refresh.
    pub fn login(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            let settings = shared.settings();
            let result = shared.login.run(
                &settings.login_command,
                settings.login_timeout(),
                Some(&shared.control),
            );
            match result {
                Ok(cred) => match shared.store_session(&cred) {
                    Ok(()) => {
                        shared.prompt("Signed in");
                        shared.control.request_refresh();
                    }
                    Err(e) => shared.prompt(&format!("Could not store session: {e}")),
                },
                Err(LoginError::Cancelled) => {}
                Err(e) => shared.prompt(&format!("Login failed: {e}")),
            }
        })
    }

    /// Handle commands from `input` until `q` or end of input, then shut down.
    ///
    /// With `wait_on_eof`, closing the input leaves the poll loop running
    /// until the process is terminated.
    pub fn run_foreground<R: BufRead>(&mut self, input: R, wait_on_eof: bool) {
        for line in input.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("Failed to read input: {e}");
                    break;
                }
            };
            match Command::parse(&line) {
                Some(Command::Refresh) => self.refresh(),
                Some(Command::ToggleCompact) => {
                    if let Err(e) = self.toggle_compact() {
                        error!("Failed to save settings: {e}");
                    }
                }
                Some(Command::Login) => {
                    self.login();
                }
                Some(Command::Quit) => {
                    self.shutdown();
                    return;
                }
                None if line.trim().is_empty() => {}
                None => self
                    .shared
                    .prompt("Commands: r = refresh, c = compact, l = login, q = quit"),
            }
        }

        if wait_on_eof {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
        self.shutdown();
    }

    /// Stop the poll thread, interrupting any retry sleep, and wait for it.
    pub fn shutdown(&mut self) {
        self.shared.control.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Poll thread panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
