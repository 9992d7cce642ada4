use chrono::{DateTime, Utc};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageSection {
    pub percentage: f64,
    pub resets_at: Option<DateTime<Utc>>,
}

impl UsageSection {
    /// Build a section, clamping the upstream value into `[0, 100]`.
    pub fn new(percentage: f64, resets_at: Option<DateTime<Utc>>) -> Self {
        Self {
            percentage: clamp_percent(percentage),
            resets_at,
        }
    }

    pub fn is_past_reset(&self, now: DateTime<Utc>) -> bool {
        self.resets_at.is_some_and(|t| t <= now)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageData {
    pub session: UsageSection,
    pub weekly: UsageSection,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl UsageData {
    pub fn section(&self, window: UsageWindow) -> &UsageSection {
        match window {
            UsageWindow::Session => &self.session,
            UsageWindow::Weekly => &self.weekly,
        }
    }

    /// True once either window's reset time has passed, meaning the numbers are stale.
    pub fn is_past_reset(&self, now: DateTime<Utc>) -> bool {
        self.session.is_past_reset(now) || self.weekly.is_past_reset(now)
    }
}

/// The two rolling quota periods tracked by the widget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UsageWindow {
    Session,
    Weekly,
}

impl UsageWindow {
    pub const ALL: [UsageWindow; 2] = [UsageWindow::Session, UsageWindow::Weekly];

    pub fn label(self) -> &'static str {
        match self {
            UsageWindow::Session => "5h",
            UsageWindow::Weekly => "7d",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            UsageWindow::Session => "5-hour",
            UsageWindow::Weekly => "weekly",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ApiStatus {
    #[default]
    Unknown,
    Ok,
    Retrying { attempt: u32 },
    Degraded(String),
    AuthRequired,
}

impl ApiStatus {
    /// Colour of the header status dot.
    pub fn color(&self) -> &'static str {
        match self {
            ApiStatus::Ok => "#44ff44",
            ApiStatus::Retrying { .. } => "#ffaa44",
            ApiStatus::Degraded(_) | ApiStatus::AuthRequired => "#ff4444",
            ApiStatus::Unknown => "#888888",
        }
    }
}

pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_percent_bounds() {
        assert_eq!(clamp_percent(-12.5), 0.0);
        assert_eq!(clamp_percent(250.0), 100.0);
        assert_eq!(clamp_percent(42.5), 42.5);
        assert_eq!(clamp_percent(f64::NAN), 0.0);
        assert_eq!(clamp_percent(f64::INFINITY), 100.0);
        assert_eq!(clamp_percent(f64::NEG_INFINITY), 0.0);
    }

    #[test]
    fn test_section_new_clamps() {
        assert_eq!(UsageSection::new(140.0, None).percentage, 100.0);
        assert_eq!(UsageSection::new(-1.0, None).percentage, 0.0);
    }

    #[test]
    fn test_past_reset() {
        let now = Utc::now();
        let data = UsageData {
            session: UsageSection::new(10.0, Some(now - chrono::Duration::minutes(1))),
            weekly: UsageSection::new(10.0, Some(now + chrono::Duration::days(2))),
            fetched_at: Some(now),
        };
        assert!(data.is_past_reset(now));
        assert!(!data.weekly.is_past_reset(now));
        assert!(!UsageData::default().is_past_reset(now));
    }
}
