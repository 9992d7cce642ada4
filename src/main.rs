use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use claude_usage_bar::display::{Display, TerminalDisplay, View};
use claude_usage_bar::login::LoginRunner;
use claude_usage_bar::notify::default_notifier;
use claude_usage_bar::retry::{fetch_with_retry, PollControl, RetryPolicy};
use claude_usage_bar::settings::default_data_dir;
use claude_usage_bar::{
    ApiStatus, ClaudeWebSource, Monitor, SessionCredential, SessionStore, Settings,
    SettingsStore, UsageSource,
};

#[derive(Parser, Debug)]
#[command(name = "claude-usage-bar", version, about = "Monitor Claude usage limits")]
struct Cli {
    /// Directory holding settings, session and log files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Log to stderr instead of debug.log
    #[arg(long, global = true)]
    log_stderr: bool,

    /// Poll interval in seconds for this run
    #[arg(long, global = true)]
    interval: Option<u64>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the widget (default)
    Run,
    /// Fetch usage once and print it
    Status,
    /// Store a session, either given directly or from the login tool
    Login {
        /// Session key or full cookie string
        #[arg(long)]
        token: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Inspect or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsCmd,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCmd {
    /// Print all settings
    Show,
    /// Print one setting
    Get { key: String },
    /// Change one setting (value is JSON or a plain string)
    Set { key: String, value: String },
    /// Restore defaults
    Reset,
    /// Print the settings file path
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    setup_logging(&data_dir, cli.debug, cli.log_stderr)?;
    info!("App starting, data dir {:?}", data_dir);

    let settings_store = SettingsStore::new(&data_dir);
    let sessions = SessionStore::new(&data_dir);

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run(settings_store, sessions, cli.interval),
        Cmd::Status => status(&settings_store, &sessions),
        Cmd::Login { token } => login(&settings_store, &sessions, token),
        Cmd::Logout => {
            sessions.clear()?;
            println!("Logged out");
            Ok(())
        }
        Cmd::Settings { action } => settings_cmd(&settings_store, action),
    }
}

fn setup_logging(data_dir: &Path, debug: bool, to_stderr: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("claude_usage_bar=debug")
    } else {
        EnvFilter::new("claude_usage_bar=info")
    };

    if to_stderr {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
        return Ok(());
    }

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data dir {:?}", data_dir))?;
    let log_path = data_dir.join("debug.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {:?}", log_path))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(())
}

fn run(settings_store: SettingsStore, sessions: SessionStore, interval: Option<u64>) -> Result<()> {
    let settings = settings_store.load();
    info!("Session key present: {}", sessions.load().is_some());

    let source = ClaudeWebSource::new(&settings.api_base_url)
        .context("Failed to initialise HTTP client")?;
    let mut monitor = Monitor::new(
        settings,
        settings_store,
        sessions,
        Box::new(source),
        Box::new(TerminalDisplay::stdout()),
        default_notifier(),
    );
    if let Some(secs) = interval {
        monitor = monitor.with_poll_interval(secs);
    }

    println!("Commands: r = refresh, c = compact, l = login, q = quit");
    monitor.start();
    let stdin = std::io::stdin();
    monitor.run_foreground(stdin.lock(), true);
    Ok(())
}

fn status(settings_store: &SettingsStore, sessions: &SessionStore) -> Result<()> {
    let settings = settings_store.load();
    let Some(credential) = sessions.load() else {
        bail!("Not logged in. Run `claude-usage-bar login` first.");
    };

    let source = ClaudeWebSource::new(&settings.api_base_url)?;
    let control = PollControl::new();
    let data = fetch_with_retry(
        &RetryPolicy::default(),
        &control,
        || source.fetch(&credential),
        |retry, err, delay| eprintln!("{err}; retry {retry} in {}s", delay.as_secs()),
    )
    .context("Failed to fetch usage")?;

    let view = View::build(
        Some(&data),
        ApiStatus::Ok,
        None,
        &settings,
        false,
        chrono::Utc::now(),
    );
    TerminalDisplay::stdout().render(&view);
    Ok(())
}

fn login(
    settings_store: &SettingsStore,
    sessions: &SessionStore,
    token: Option<String>,
) -> Result<()> {
    let credential = match token {
        Some(token) => SessionCredential::parse(&token)
            .context("Token must be a session key or a cookie string containing sessionKey")?,
        None => {
            let settings = settings_store.load();
            println!("Waiting for login...");
            LoginRunner::new().run(&settings.login_command, settings.login_timeout(), None)?
        }
    };
    sessions.save(&credential)?;
    println!("Stored session {}", credential.masked());
    Ok(())
}

fn settings_cmd(store: &SettingsStore, action: SettingsCmd) -> Result<()> {
    match action {
        SettingsCmd::Show => {
            let settings = store.try_load()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SettingsCmd::Get { key } => {
            let settings = store.try_load()?;
            println!("{}", settings.get(&key)?);
        }
        SettingsCmd::Set { key, value } => {
            let mut settings = store.try_load()?;
            settings.set(&key, &value)?;
            store.save(&settings)?;
            println!("{key} = {}", settings.get(&key)?);
        }
        SettingsCmd::Reset => {
            store.save(&Settings::default())?;
            println!("Settings reset to defaults");
        }
        SettingsCmd::Path => println!("{}", store.path().display()),
    }
    Ok(())
}
