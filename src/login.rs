//! Runs the external browser-login tool and collects the session key it prints.
//!
//! The tool is any program that opens a browser, waits for the user to sign
//! in, and writes either the bare `sessionKey` value or the whole cookie
//! string to stdout.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::credentials::SessionCredential;
use crate::error::LoginError;
use crate::retry::PollControl;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Runs the login tool, one invocation at a time.
#[derive(Debug, Default)]
pub struct LoginRunner {
    in_progress: AtomicBool,
}

struct LoginGuard<'a>(&'a AtomicBool);

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl LoginRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Result<LoginGuard<'_>, LoginError> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| LoginGuard(&self.in_progress))
            .map_err(|_| LoginError::InProgress)
    }

    /// Launch `argv`, wait up to `timeout`, and parse a credential from its output.
    ///
    /// `control` lets a shutdown abort the wait; the child is killed in that case.
    pub fn run(
        &self,
        argv: &[String],
        timeout: Duration,
        control: Option<&PollControl>,
    ) -> Result<SessionCredential, LoginError> {
        let (program, args) = argv.split_first().ok_or(LoginError::NotConfigured)?;
        let _guard = self.acquire()?;

        info!("Launching login tool {program:?}");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(LoginError::Spawn)?;

        let mut stdout = child.stdout.take();
        let reader = std::thread::spawn(move || {
            let mut out = String::new();
            if let Some(pipe) = stdout.as_mut() {
                let _ = pipe.read_to_string(&mut out);
            }
            out
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().map_err(LoginError::Spawn)? {
                break status;
            }
            if started.elapsed() >= timeout {
                warn!("Login tool timed out, killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(LoginError::TimedOut(timeout.as_secs()));
            }
            let keep_going = match control {
                Some(c) => c.sleep(CHILD_POLL_INTERVAL),
                None => {
                    std::thread::sleep(CHILD_POLL_INTERVAL);
                    true
                }
            };
            if !keep_going {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LoginError::Cancelled);
            }
        };

        let output = reader.join().unwrap_or_default();
        if !status.success() {
            return Err(LoginError::Failed(status));
        }

        let cred = extract_credential(&output).ok_or(LoginError::NoToken)?;
        debug!("Login tool returned session {}", cred.masked());
        Ok(cred)
    }
}

/// Find the credential in the tool's output, preferring the last line that has one.
pub fn extract_credential(output: &str) -> Option<SessionCredential> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| {
            let line = line.strip_prefix("Cookie:").map(str::trim).unwrap_or(line);
            if line.contains(char::is_whitespace) && !line.contains(';') {
                return None;
            }
            SessionCredential::parse(line)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_noisy_output() {
        let out = "Opening browser...\nWaiting for login...\nsk-ant-sid01-xyz\n";
        assert_eq!(extract_credential(out).unwrap().session_key, "sk-ant-sid01-xyz");
    }

    #[test]
    fn test_extract_cookie_line() {
        let out = "done\nCookie: a=1; sessionKey=sk-9; b=2\n\n";
        let cred = extract_credential(out).unwrap();
        assert_eq!(cred.session_key, "sk-9");
        assert_eq!(cred.cookie_string.as_deref(), Some("a=1; sessionKey=sk-9; b=2"));
    }

    #[test]
    fn test_extract_nothing() {
        assert!(extract_credential("Login timed out\n").is_none());
        assert!(extract_credential("").is_none());
    }

    #[test]
    fn test_empty_command_is_not_configured() {
        assert!(matches!(
            LoginRunner::new().run(&[], Duration::from_secs(1), None),
            Err(LoginError::NotConfigured)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_tool_and_reads_token() {
        let argv: Vec<String> = ["sh", "-c", "echo 'launching'; echo 'sessionKey=sk-sh; x=1'"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let runner = LoginRunner::new();
        let cred = runner.run(&argv, Duration::from_secs(10), None).unwrap();
        assert_eq!(cred.session_key, "sk-sh");
        assert!(!runner.is_in_progress());
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_timeout_and_failure() {
        let runner = LoginRunner::new();
        let slow: Vec<String> = ["sh", "-c", "sleep 5"].iter().map(|s| s.to_string()).collect();
        assert!(matches!(
            runner.run(&slow, Duration::from_millis(300), None),
            Err(LoginError::TimedOut(_))
        ));

        let failing: Vec<String> = ["sh", "-c", "exit 3"].iter().map(|s| s.to_string()).collect();
        assert!(matches!(
            runner.run(&failing, Duration::from_secs(10), None),
            Err(LoginError::Failed(_))
        ));
    }

    #[test]
    fn test_concurrent_login_is_rejected() {
        let runner = LoginRunner::new();
        let _held = runner.acquire().unwrap();
        let argv = vec!["true".to_string()];
        assert!(matches!(
            runner.run(&argv, Duration::from_secs(1), None),
            Err(LoginError::InProgress)
        ));
    }

    #[test]
    fn test_missing_program() {
        let argv = vec!["definitely-not-a-login-tool-4821".to_string()];
        assert!(matches!(
            LoginRunner::new().run(&argv, Duration::from_secs(1), None),
            Err(LoginError::Spawn(_))
        ));
    }
}
