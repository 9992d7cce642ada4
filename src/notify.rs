//! Threshold alerts for the two usage windows.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::models::{UsageData, UsageWindow};

/// A threshold crossing that should be shown to the user.
#[derive(Clone, Debug, PartialEq)]
pub struct Alert {
    pub window: UsageWindow,
    pub threshold: u8,
    pub utilization: f64,
}

impl Alert {
    pub fn title(&self) -> String {
        format!("Claude {} Usage Alert", self.window.display_name())
    }

    pub fn message(&self) -> String {
        format!(
            "You've reached {}% of your {} limit ({:.1}% used)",
            self.threshold,
            self.window.display_name(),
            self.utilization
        )
    }
}

#[derive(Debug, Default)]
struct WindowState {
    /// Thresholds currently at or below the usage value
    fired: BTreeSet<u8>,
    /// When each threshold last produced an alert
    last_fired: HashMap<u8, Instant>,
}

/// Decides which threshold crossings produce alerts.
///
/// A threshold fires when usage rises to or past it, re-arms once usage
/// drops back below it, and never alerts twice within the cooldown.
#[derive(Debug)]
pub struct NotificationTracker {
    thresholds: Vec<u8>,
    cooldown: Duration,
    enabled: bool,
    primed: bool,
    windows: HashMap<UsageWindow, WindowState>,
}

impl NotificationTracker {
    pub fn new(thresholds: &[u8], cooldown: Duration) -> Self {
        let mut thresholds = thresholds.to_vec();
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            thresholds,
            cooldown,
            enabled: true,
            primed: false,
            windows: HashMap::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    /// Replace the configured thresholds, forgetting state for removed ones.
    pub fn set_thresholds(&mut self, thresholds: &[u8]) {
        let mut thresholds = thresholds.to_vec();
        thresholds.sort_unstable();
        thresholds.dedup();
        if thresholds == self.thresholds {
            return;
        }
        for state in self.windows.values_mut() {
            state.fired.retain(|t| thresholds.contains(t));
            state.last_fired.retain(|t, _| thresholds.contains(t));
        }
        self.thresholds = thresholds;
    }

    /// Feed a fresh snapshot. Returns at most one alert per window.
    ///
    /// The first snapshot only records which thresholds are already exceeded,
    /// so restarting the widget does not repeat old alerts.
    pub fn check(&mut self, data: &UsageData, now: Instant) -> Vec<Alert> {
        let announce = self.primed && self.enabled;
        self.primed = true;

        let mut alerts = Vec::new();
        for window in UsageWindow::ALL {
            let utilization = data.section(window).percentage;
            if let Some(threshold) = self.check_window(window, utilization, now, announce) {
                alerts.push(Alert {
                    window,
                    threshold,
                    utilization,
                });
            }
        }
        alerts
    }

    fn check_window(
        &mut self,
        window: UsageWindow,
        utilization: f64,
        now: Instant,
        announce: bool,
    ) -> Option<u8> {
        let cooldown = self.cooldown;
        let state = self.windows.entry(window).or_default();
        let mut highest = None;

        for &threshold in &self.thresholds {
            let crossed = utilization >= f64::from(threshold);
            if crossed && !state.fired.contains(&threshold) {
                state.fired.insert(threshold);
                if !announce {
                    continue;
                }
                let cooling = state
                    .last_fired
                    .get(&threshold)
                    .is_some_and(|at| now.saturating_duration_since(*at) < cooldown);
                if cooling {
                    debug!(
                        "{} threshold {threshold}% re-crossed within cooldown, not alerting",
                        window.display_name()
                    );
                    continue;
                }
                state.last_fired.insert(threshold, now);
                highest = Some(threshold);
            } else if !crossed && state.fired.remove(&threshold) {
                debug!("{} threshold {threshold}% re-armed", window.display_name());
            }
        }

        highest
    }
}

/// Delivers alerts to the user.
pub trait Notifier: Send {
    fn notify(&self, alert: &Alert);
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: &Alert) {
        warn!("{}: {}", alert.title(), alert.message());
    }
}

/// Raises an OS desktop notification, and logs it.
#[cfg(feature = "desktop-notifications")]
#[derive(Debug, Default)]
pub struct DesktopNotifier;

#[cfg(feature = "desktop-notifications")]
impl Notifier for DesktopNotifier {
    fn notify(&self, alert: &Alert) {
        LogNotifier.notify(alert);
        if let Err(e) = notify_rust::Notification::new()
            .summary(&alert.title())
            .body(&alert.message())
            .show()
        {
            warn!("Desktop notification failed: {e}");
        }
    }
}

/// The notifier used by the binary.
pub fn default_notifier() -> Box<dyn Notifier> {
    #[cfg(feature = "desktop-notifications")]
    {
        info!("Using desktop notifications");
        Box::new(DesktopNotifier)
    }
    #[cfg(not(feature = "desktop-notifications"))]
    {
        info!("Desktop notifications not compiled in; alerts go to the log");
        Box::new(LogNotifier)
    }
}
