use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SettingsError;

const APP_DIR_NAME: &str = "ClaudeUsageBar";
const SETTINGS_FILE: &str = "config.json";

pub const MIN_POLL_INTERVAL_SECS: u64 = 10;
pub const MAX_POLL_INTERVAL_SECS: u64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Default for Position {
    fn default() -> Self {
        Self { x: 20, y: 80 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapMode {
    #[default]
    Off,
    Edges,
    Collapse,
}

/// User-configurable options, persisted as `config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub position: Position,
    pub opacity: f64,
    /// Seconds between polls
    pub poll_interval: u64,
    pub minimize_to_tray: bool,
    pub compact_mode: bool,
    pub snap_mode: SnapMode,
    pub auto_refresh_session: bool,
    pub five_hour_color: String,
    pub weekly_color: String,
    pub border_color: String,
    pub show_border: bool,
    pub text_background: bool,
    pub text_background_opacity: u8,
    pub dynamic_bar_color: bool,
    pub warning_color_70: String,
    pub warning_color_90: String,
    pub notifications_enabled: bool,
    pub notification_thresholds: Vec<u8>,
    /// Seconds before the same threshold may alert again
    pub notification_cooldown: u64,
    pub auto_start: bool,
    pub start_minimized: bool,
    pub sound_alerts: bool,
    pub sound_volume: u8,
    pub progress_bar_height: u32,
    pub font_size: u32,
    pub hotkey_clickthrough: String,
    pub hotkey_compact: String,
    pub hotkey_refresh: String,
    pub show_prediction: bool,
    pub api_base_url: String,
    /// argv of the external browser-login tool
    pub login_command: Vec<String>,
    /// Seconds to wait for the login tool
    pub login_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            position: Position::default(),
            opacity: 0.9,
            poll_interval: 60,
            minimize_to_tray: false,
            compact_mode: false,
            snap_mode: SnapMode::Off,
            auto_refresh_session: false,
            five_hour_color: "#CC785C".to_string(),
            weekly_color: "#8B6BB7".to_string(),
            border_color: "#FFFFFF".to_string(),
            show_border: false,
            text_background: false,
            text_background_opacity: 70,
            dynamic_bar_color: true,
            warning_color_70: "#ffaa44".to_string(),
            warning_color_90: "#ff4444".to_string(),
            notifications_enabled: true,
            notification_thresholds: vec![80, 95, 99, 100],
            notification_cooldown: 300,
            auto_start: false,
            start_minimized: false,
            sound_alerts: false,
            sound_volume: 100,
            progress_bar_height: 12,
            font_size: 15,
            hotkey_clickthrough: "ctrl+alt+c".to_string(),
            hotkey_compact: "ctrl+alt+m".to_string(),
            hotkey_refresh: "ctrl+alt+r".to_string(),
            show_prediction: true,
            api_base_url: "https://claude.ai".to_string(),
            login_command: Vec::new(),
            login_timeout: 300,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn notification_cooldown(&self) -> Duration {
        Duration::from_secs(self.notification_cooldown)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout)
    }

    /// Clamp numeric options and normalise lists and colours.
    ///
    /// Values that cannot be repaired fall back to their defaults.
    pub fn validate(&mut self) {
        let defaults = Settings::default();

        if !self.opacity.is_finite() {
            self.opacity = defaults.opacity;
        }
        self.opacity = self.opacity.clamp(0.1, 1.0);
        self.poll_interval = self
            .poll_interval
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
        self.text_background_opacity = self.text_background_opacity.min(100);
        self.sound_volume = self.sound_volume.min(100);
        self.progress_bar_height = self.progress_bar_height.clamp(4, 40);
        self.font_size = self.font_size.clamp(8, 32);
        if self.login_timeout == 0 {
            self.login_timeout = defaults.login_timeout;
        }
        if self.position.x < 0 || self.position.y < 0 {
            self.position = Position::default();
        }

        self.notification_thresholds = normalize_thresholds(&self.notification_thresholds);

        for (color, fallback) in [
            (&mut self.five_hour_color, defaults.five_hour_color),
            (&mut self.weekly_color, defaults.weekly_color),
            (&mut self.border_color, defaults.border_color),
            (&mut self.warning_color_70, defaults.warning_color_70),
            (&mut self.warning_color_90, defaults.warning_color_90),
        ] {
            if !is_hex_color(color) {
                warn!("Invalid colour {color:?}, using {fallback}");
                *color = fallback;
            }
        }

        for (hotkey, fallback) in [
            (&mut self.hotkey_clickthrough, defaults.hotkey_clickthrough),
            (&mut self.hotkey_compact, defaults.hotkey_compact),
            (&mut self.hotkey_refresh, defaults.hotkey_refresh),
        ] {
            match normalize_hotkey(hotkey) {
                Some(normalized) => *hotkey = normalized,
                None => {
                    warn!("Invalid hotkey {hotkey:?}, using {fallback}");
                    *hotkey = fallback;
                }
            }
        }

        let trimmed = self.api_base_url.trim().trim_end_matches('/');
        self.api_base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            defaults.api_base_url
        };
    }

    /// Current value of a single option as JSON.
    pub fn get(&self, key: &str) -> Result<serde_json::Value, SettingsError> {
        let value = serde_json::to_value(self)?;
        value
            .get(key)
            .cloned()
            .ok_or_else(|| SettingsError::UnknownKey(key.to_string()))
    }

    /// Change a single option from user input.
    ///
    /// The input is read as JSON first (`true`, `42`, `[80, 90]`) and as a
    /// plain string otherwise. The result is validated before it is applied.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<(), SettingsError> {
        let mut value = serde_json::to_value(&*self)?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| SettingsError::UnknownKey(key.to_string()))?;
        if !map.contains_key(key) {
            return Err(SettingsError::UnknownKey(key.to_string()));
        }

        let parsed = serde_json::from_str::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        map.insert(key.to_string(), parsed);

        let mut updated: Settings =
            serde_json::from_value(value).map_err(|e| SettingsError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        check_strict(key, &updated)?;
        updated.validate();
        *self = updated;
        Ok(())
    }
}

/// Reject edits that `validate` would otherwise silently repair.
fn check_strict(key: &str, settings: &Settings) -> Result<(), SettingsError> {
    let invalid = |reason: String| SettingsError::InvalidValue {
        key: key.to_string(),
        reason,
    };
    match key {
        "five_hour_color" | "weekly_color" | "border_color" | "warning_color_70"
        | "warning_color_90" => {
            let color = settings.get(key)?;
            let color = color.as_str().unwrap_or_default();
            if !is_hex_color(color) {
                return Err(invalid(format!("{color:?} is not a #RRGGBB colour")));
            }
        }
        "hotkey_clickthrough" | "hotkey_compact" | "hotkey_refresh" => {
            let hotkey = settings.get(key)?;
            let hotkey = hotkey.as_str().unwrap_or_default();
            if normalize_hotkey(hotkey).is_none() {
                return Err(invalid(format!(
                    "{hotkey:?} is not a hotkey (expected e.g. ctrl+alt+r)"
                )));
            }
        }
        "notification_thresholds" => {
            if let Some(bad) = settings
                .notification_thresholds
                .iter()
                .find(|t| !(1..=100).contains(*t))
            {
                return Err(invalid(format!("threshold {bad} is outside 1..=100")));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Sorted, deduplicated thresholds within `1..=100`.
pub fn normalize_thresholds(thresholds: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = thresholds
        .iter()
        .copied()
        .filter(|t| (1..=100).contains(t))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

pub fn is_hex_color(s: &str) -> bool {
    s.len() == 7 && s.starts_with('#') && s[1..].chars().all(|c| c.is_ascii_hexdigit())
}

const MODIFIER_ORDER: [&str; 3] = ["ctrl", "alt", "shift"];
const NAMED_KEYS: &[&str] = &[
    "space", "enter", "tab", "up", "down", "left", "right", "home", "end", "delete", "insert",
];

/// Normalise a hotkey string like `Alt + Ctrl + R` into `ctrl+alt+r`.
///
/// Returns `Some("")` for an empty input (hotkey disabled) and `None` when the
/// combination lacks a modifier or names an unsupported key.
pub fn normalize_hotkey(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return Some(String::new());
    }

    let mut modifiers = [false; 3];
    let mut key: Option<String> = None;

    for part in input.split('+') {
        let part = part.trim().to_ascii_lowercase();
        let part = match part.as_str() {
            "control" => "ctrl".to_string(),
            "return" => "enter".to_string(),
            "del" => "delete".to_string(),
            _ => part,
        };
        if let Some(idx) = MODIFIER_ORDER.iter().position(|m| *m == part) {
            modifiers[idx] = true;
        } else if key.is_none() && is_hotkey_key(&part) {
            key = Some(part);
        } else {
            return None;
        }
    }

    let key = key?;
    if !modifiers.iter().any(|m| *m) {
        return None;
    }

    let mut parts: Vec<&str> = MODIFIER_ORDER
        .iter()
        .zip(modifiers)
        .filter(|(_, on)| *on)
        .map(|(m, _)| *m)
        .collect();
    parts.push(&key);
    Some(parts.join("+"))
}

fn is_hotkey_key(key: &str) -> bool {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => return c.is_ascii_lowercase() || c.is_ascii_digit(),
        (Some('f'), Some(_)) => {
            if let Ok(n) = key[1..].parse::<u8>() {
                return (1..=12).contains(&n);
            }
        }
        _ => {}
    }
    NAMED_KEYS.contains(&key)
}

/// Default application data directory (`<config dir>/ClaudeUsageBar`).
pub fn default_data_dir() -> Result<PathBuf, SettingsError> {
    dirs::config_dir()
        .map(|p| p.join(APP_DIR_NAME))
        .ok_or(SettingsError::NoDataDir)
}

/// Loads and persists [`Settings`] in the application data directory.
#[derive(Clone, Debug)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SETTINGS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults for a missing or corrupt file.
    pub fn load(&self) -> Settings {
        match self.try_load() {
            Ok(settings) => settings,
            Err(e) => {
                warn!("{e}; using default settings");
                Settings::default()
            }
        }
    }

    pub fn try_load(&self) -> Result<Settings, SettingsError> {
        if !self.path.exists() {
            debug!("No settings file at {:?}, using defaults", self.path);
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|source| SettingsError::Read {
            path: self.path.clone(),
            source,
        })?;
        let mut settings: Settings = serde_json::from_str(&content)?;
        settings.validate();
        Ok(settings)
    }

    /// Write settings atomically (temp file + rename).
    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let write_err = |source| SettingsError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;
        debug!("Saved settings to {:?}", self.path);
        Ok(())
    }
}
