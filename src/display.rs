use std::io::{IsTerminal, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossterm::style::{Color, Stylize};

use crate::models::{ApiStatus, UsageData, UsageSection, UsageWindow};
use crate::settings::Settings;

const SEGMENT_COUNT: usize = 10;
const SEGMENT_FULL: char = '\u{2588}';
const SEGMENT_EMPTY: char = '\u{2591}';
const STATUS_DOT: char = '\u{25cf}';

const WARN_LEVEL: f64 = 70.0;
const CRITICAL_LEVEL: f64 = 90.0;

const MINUTE: u64 = 60;
const HOUR: u64 = 3600;
const DAY: u64 = 86_400;
/// Below this much time left the countdown switches from hours to minutes
const HOURS_FROM: u64 = 62 * MINUTE;

/// What one usage meter should show.
#[derive(Clone, Debug, PartialEq)]
pub struct MeterView {
    pub window: UsageWindow,
    pub percentage: f64,
    pub text: String,
    pub color: String,
}

/// Everything a display needs for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct View {
    pub status: ApiStatus,
    pub meters: Vec<MeterView>,
    pub prediction: Option<Duration>,
    pub compact: bool,
}

impl View {
    /// Build a frame from the latest data. `stale` marks numbers left over
    /// from an earlier poll after a failed one.
    pub fn build(
        data: Option<&UsageData>,
        status: ApiStatus,
        prediction: Option<Duration>,
        settings: &Settings,
        stale: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let meters = UsageWindow::ALL
            .iter()
            .map(|&window| {
                let (percentage, text) = match data {
                    Some(d) if !stale => {
                        let section = d.section(window);
                        (section.percentage, format_line(section, now))
                    }
                    Some(d) => (d.section(window).percentage, "...".to_string()),
                    None => (0.0, "--".to_string()),
                };
                MeterView {
                    window,
                    percentage,
                    text,
                    color: bar_color(window, percentage, settings).to_string(),
                }
            })
            .collect();

        Self {
            status,
            meters,
            prediction: prediction.filter(|_| settings.show_prediction && !stale),
            compact: settings.compact_mode,
        }
    }
}

/// Bar colour for a window, switching to the warning colours at high usage.
pub fn bar_color(window: UsageWindow, percentage: f64, settings: &Settings) -> &str {
    if settings.dynamic_bar_color {
        if percentage >= CRITICAL_LEVEL {
            return &settings.warning_color_90;
        }
        if percentage >= WARN_LEVEL {
            return &settings.warning_color_70;
        }
    }
    match window {
        UsageWindow::Session => &settings.five_hour_color,
        UsageWindow::Weekly => &settings.weekly_color,
    }
}

/// Number of lit segments out of ten, rounding partial segments up.
pub fn filled_segments(percentage: f64) -> usize {
    let pct = crate::models::clamp_percent(percentage);
    ((pct / 100.0 * SEGMENT_COUNT as f64).ceil() as usize).min(SEGMENT_COUNT)
}

pub fn render_bar(percentage: f64) -> String {
    let filled = filled_segments(percentage);
    let mut bar = String::with_capacity(SEGMENT_COUNT * 3);
    bar.extend(std::iter::repeat(SEGMENT_FULL).take(filled));
    bar.extend(std::iter::repeat(SEGMENT_EMPTY).take(SEGMENT_COUNT - filled));
    bar
}

/// Meter text: the percentage, then a countdown to the reset when known.
pub fn format_line(section: &UsageSection, now: DateTime<Utc>) -> String {
    let pct = format!("{:.0}%", section.percentage);
    match format_countdown(section.resets_at, now) {
        Some(countdown) => format!("{pct} \u{00b7} {countdown}"),
        None => pct,
    }
}

/// Unit and suffix for a countdown with `secs` left.
fn countdown_unit(secs: u64) -> (u64, char) {
    if secs >= DAY {
        (DAY, 'd')
    } else if secs >= HOURS_FROM {
        (HOUR, 'h')
    } else {
        (MINUTE, 'm')
    }
}

fn seconds_left(resets_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<u64> {
    (resets_at - now).to_std().ok().map(|d| d.as_secs())
}

/// "2d", "3h" or "45m"; "now" once the reset time has passed.
fn format_countdown(resets_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<String> {
    let resets_at = resets_at?;
    let Some(secs) = seconds_left(resets_at, now) else {
        return Some("now".to_string());
    };
    let (unit, suffix) = countdown_unit(secs);
    Some(format!("{}{suffix}", secs / unit))
}

/// How long until [`format_line`] would print a different countdown.
pub fn time_until_display_change(
    resets_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let secs = seconds_left(resets_at?, now)?;
    let (unit, _) = countdown_unit(secs);
    let mut shown_until = secs / unit * unit;
    if unit == HOUR {
        shown_until = shown_until.max(HOURS_FROM);
    }
    Some(Duration::from_secs(secs - shown_until + 1))
}

/// Long-form remaining time, e.g. "3h 12m" or "45s".
pub fn format_time_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    let (hours, minutes, seconds) = (secs / HOUR, secs % HOUR / MINUTE, secs % MINUTE);
    match (hours, minutes) {
        _ if secs == 0 => "Resetting soon...".to_string(),
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m {seconds}s"),
        _ => format!("{hours}h {minutes}m"),
    }
}

/// Where frames go. The GUI overlay implements this; the crate ships a
/// terminal renderer.
pub trait Display: Send {
    fn render(&mut self, view: &View);

    /// Surface a message that needs the user's attention (e.g. "log in again").
    fn prompt(&mut self, message: &str);
}

/// Renders frames as text lines.
pub struct TerminalDisplay<W: Write + Send> {
    out: W,
    color: bool,
}

impl TerminalDisplay<std::io::Stdout> {
    /// Standard output, coloured when it is a terminal.
    pub fn stdout() -> Self {
        let out = std::io::stdout();
        let color = out.is_terminal();
        Self { out, color }
    }
}

impl<W: Write + Send> TerminalDisplay<W> {
    pub fn new(out: W) -> Self {
        Self { out, color: false }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn status_dot(&self, status: &ApiStatus) -> String {
        match hex_to_rgb(status.color()).filter(|_| self.color) {
            Some((r, g, b)) => STATUS_DOT.with(Color::Rgb { r, g, b }).to_string(),
            None => STATUS_DOT.to_string(),
        }
    }
}

fn hex_to_rgb(hex: &str) -> Option<(u8, u8, u8)> {
    let hex = hex.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    Some((channel(0)?, channel(2)?, channel(4)?))
}

/// Frame lines with a plain status dot.
pub fn format_frame(view: &View) -> Vec<String> {
    frame_lines(view, &STATUS_DOT.to_string())
}

fn frame_lines(view: &View, dot: &str) -> Vec<String> {
    let status = status_label(&view.status);
    let meters: Vec<&MeterView> = if view.compact {
        view.meters
            .iter()
            .filter(|m| m.window == UsageWindow::Session)
            .collect()
    } else {
        view.meters.iter().collect()
    };

    let mut lines = Vec::with_capacity(meters.len() + 1);
    for (i, meter) in meters.iter().enumerate() {
        let mut line = format!(
            "{} {} {}",
            meter.window.label(),
            render_bar(meter.percentage),
            meter.text
        );
        if meter.window == UsageWindow::Session {
            if let Some(eta) = view.prediction {
                line.push_str(&format!(" (100% in ~{})", format_time_remaining(eta)));
            }
        }
        if i == 0 {
            line = format!("{dot} {line}  [{status}]");
        } else {
            line = format!("  {line}");
        }
        lines.push(line);
    }
    lines
}

fn status_label(status: &ApiStatus) -> String {
    match status {
        ApiStatus::Unknown => "waiting".to_string(),
        ApiStatus::Ok => "ok".to_string(),
        ApiStatus::Retrying { attempt } => format!("retrying {attempt}/{}", crate::retry::MAX_RETRIES),
        ApiStatus::Degraded(reason) => format!("degraded: {reason}"),
        ApiStatus::AuthRequired => "login required".to_string(),
    }
}

impl<W: Write + Send> Display for TerminalDisplay<W> {
    fn render(&mut self, view: &View) {
        let dot = self.status_dot(&view.status);
        for line in frame_lines(view, &dot) {
            let _ = writeln!(self.out, "{line}");
        }
        let _ = self.out.flush();
    }

    fn prompt(&mut self, message: &str) {
        let _ = writeln!(self.out, "! {message}");
        let _ = self.out.flush();
    }
}
