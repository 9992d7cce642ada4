//! Claude usage overlay: polls the usage endpoint, shows the five-hour and
//! weekly meters, and alerts when configured thresholds are crossed.

pub mod app;
pub mod credentials;
pub mod display;
pub mod error;
pub mod login;
pub mod models;
pub mod notify;
pub mod poller;
pub mod prediction;
pub mod retry;
pub mod settings;

pub use app::Monitor;
pub use credentials::{SessionCredential, SessionStore};
pub use models::{ApiStatus, UsageData, UsageSection, UsageWindow};
pub use poller::{ClaudeWebSource, FetchError, UsageSource};
pub use settings::{Settings, SettingsStore};
