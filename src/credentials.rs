//! Session credential storage.
//!
//! The credential is whatever the login tool pulled out of the browser: the
//! `sessionKey` cookie, and optionally the full cookie jar it came with.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CredentialError;

const SESSION_FILE: &str = "session.json";
const SESSION_COOKIE: &str = "sessionKey";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_string: Option<String>,
}

impl SessionCredential {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            cookie_string: None,
        }
    }

    /// Parse either a bare key or a `name=value; name=value` cookie string
    /// containing `sessionKey`.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if !input.contains('=') {
            return Some(Self::new(input));
        }

        let key = cookie_pairs(input)
            .find(|(name, _)| *name == SESSION_COOKIE)
            .map(|(_, value)| value.to_string())
            .filter(|v| !v.is_empty())?;

        Some(Self {
            session_key: key,
            cookie_string: Some(input.to_string()),
        })
    }

    /// Value for the `Cookie` request header.
    pub fn cookie_header(&self) -> String {
        match &self.cookie_string {
            Some(cookies) => cookies.clone(),
            None => format!("{SESSION_COOKIE}={}", self.session_key),
        }
    }

    /// Key with everything but the last four characters masked, for logs and `status`.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.session_key.chars().collect();
        if chars.len() <= 8 {
            return "*".repeat(chars.len());
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{tail}", "*".repeat(8))
    }
}

fn cookie_pairs(cookies: &str) -> impl Iterator<Item = (&str, &str)> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(name, value)| (name.trim(), value.trim()))
}

/// File-backed store for the session credential.
#[derive(Clone, Debug)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SESSION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored credential. A missing or unreadable file reads as "logged out".
    pub fn load(&self) -> Option<SessionCredential> {
        match self.try_load() {
            Ok(cred) => cred,
            Err(e) => {
                warn!("Ignoring unreadable session file: {e}");
                None
            }
        }
    }

    pub fn try_load(&self) -> Result<Option<SessionCredential>, CredentialError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let cred: SessionCredential = serde_json::from_str(&content)?;
        if cred.session_key.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(cred))
    }

    pub fn save(&self, cred: &SessionCredential) -> Result<(), CredentialError> {
        if cred.session_key.trim().is_empty() {
            return Err(CredentialError::Empty);
        }
        let io_err = |source| CredentialError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(cred)?;
        fs::write(&self.path, json).map_err(io_err)?;
        restrict_permissions(&self.path).map_err(io_err)?;
        info!("Stored session credential {}", cred.masked());
        Ok(())
    }

    /// Delete the credential only if it still equals `expected`.
    ///
    /// Returns `false` when the file is missing or holds a different session,
    /// e.g. one a concurrent login just stored.
    pub fn clear_if(&self, expected: &SessionCredential) -> Result<bool, CredentialError> {
        if self.try_load()?.as_ref() != Some(expected) {
            debug!("Stored session changed, leaving it in place");
            return Ok(false);
        }
        self.clear()?;
        Ok(true)
    }

    /// Delete the credential. Used on logout and when the service rejects it.
    pub fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed session file {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CredentialError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
