//! Authenticated platform session and its persistence
//!
//! `SessionStore::acquire` restores the cookie file, verifies it with a cheap
//! authenticated probe, and logs in again when the platform rejects it.
//! `SessionGuard` writes the session back when it goes out of scope.

use crate::error::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variables consulted by `Credentials::from_env`
pub const EMAIL_ENV: &str = "GRADESCOPE_EMAIL";
pub const PASSWORD_ENV: &str = "GRADESCOPE_PASSWORD";

/// Cookie-based identity on the grading platform
///
/// Treated as immutable for the duration of a fetch run; workers only read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    cookies: BTreeMap<String, String>,
    pub established_at: DateTime<Utc>,
}

impl Session {
    pub fn new(cookies: BTreeMap<String, String>) -> Self {
        Self {
            cookies,
            established_at: Utc::now(),
        }
    }

    /// Parse a `Cookie` header value (`a=1; b=2`)
    pub fn from_cookie_header(header: &str) -> Self {
        let cookies = header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (!name.is_empty()).then(|| (name.to_string(), value.to_string()))
            })
            .collect();
        Self::new(cookies)
    }

    /// Render as a `Cookie` header value
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// Login credentials, supplied by the caller (environment, flags, a prompt...)
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Read `GRADESCOPE_EMAIL` / `GRADESCOPE_PASSWORD`
    pub fn from_env() -> Option<Self> {
        let email = std::env::var(EMAIL_ENV).ok()?;
        let password = std::env::var(PASSWORD_ENV).ok()?;
        Some(Self::new(email, password))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Platform side of authentication
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Cheap authenticated request; `Ok(false)` means the platform rejected the session
    async fn probe(&self, session: &Session) -> Result<bool, CoreError>;

    /// Establish a fresh session
    async fn login(&self, credentials: &Credentials) -> Result<Session, CoreError>;
}

/// Owns the session and its on-disk cookie file
pub struct SessionStore {
    cookie_file: PathBuf,
    /// Login attempts before giving up on transient failures
    max_login_attempts: u32,
}

impl SessionStore {
    pub fn new(cookie_file: impl Into<PathBuf>) -> Self {
        Self {
            cookie_file: cookie_file.into(),
            max_login_attempts: 2,
        }
    }

    pub fn with_login_attempts(mut self, attempts: u32) -> Self {
        self.max_login_attempts = attempts.max(1);
        self
    }

    pub fn cookie_file(&self) -> &Path {
        &self.cookie_file
    }

    /// Return a session the platform accepts, restoring or logging in as needed
    pub async fn acquire(
        &self,
        auth: &dyn Authenticator,
        credentials: Option<&Credentials>,
    ) -> Result<Session, CoreError> {
        if let Some(session) = self.restore() {
            match auth.probe(&session).await {
                Ok(true) => {
                    info!(path = %self.cookie_file.display(), "Restored session is valid");
                    return Ok(session);
                }
                Ok(false) => {
                    info!("Restored session was rejected, re-authenticating");
                }
                Err(e) => {
                    warn!(error = %e, "Session probe failed, re-authenticating");
                }
            }
        }

        let credentials = credentials.ok_or_else(|| {
            CoreError::authentication(format!(
                "no valid saved session and no credentials ({} / {} unset)",
                EMAIL_ENV, PASSWORD_ENV
            ))
        })?;

        let session = self.login_with_retry(auth, credentials).await?;

        // Persist right away so a crash later in the run still skips login next time
        if let Err(e) = self.persist(&session) {
            warn!(error = %e, "Failed to save session cookies");
        }
        Ok(session)
    }

    async fn login_with_retry(
        &self,
        auth: &dyn Authenticator,
        credentials: &Credentials,
    ) -> Result<Session, CoreError> {
        let mut last_error = None;

        for attempt in 1..=self.max_login_attempts {
            match auth.login(credentials).await {
                Ok(session) => {
                    info!(attempt, "Logged in");
                    return Ok(session);
                }
                // Wrong password will not improve with retries
                Err(e @ CoreError::Authentication { .. }) => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "Login attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(CoreError::authentication(match last_error {
            Some(e) => format!(
                "could not log in after {} attempts: {}",
                self.max_login_attempts, e
            ),
            None => "could not log in".to_string(),
        }))
    }

    /// Load the persisted session, if any. Unreadable files count as absent.
    pub fn restore(&self) -> Option<Session> {
        let content = match std::fs::read_to_string(&self.cookie_file) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %self.cookie_file.display(), error = %e, "No saved session");
                return None;
            }
        };
        match serde_json::from_str::<Session>(&content) {
            Ok(session) if !session.is_empty() => Some(session),
            Ok(_) => None,
            Err(e) => {
                warn!(path = %self.cookie_file.display(), error = %e, "Ignoring corrupt cookie file");
                None
            }
        }
    }

    /// Write the session to the cookie file (tmp file + rename)
    pub fn persist(&self, session: &Session) -> Result<(), CoreError> {
        let write_err = |source| CoreError::FileWrite {
            path: self.cookie_file.clone(),
            source,
        };

        if let Some(parent) = self.cookie_file.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let json = serde_json::to_string_pretty(session).map_err(|e| CoreError::JsonParse {
            path: self.cookie_file.clone(),
            message: e.to_string(),
            source: e,
        })?;

        let tmp = self.cookie_file.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(write_err)?;
        std::fs::rename(&tmp, &self.cookie_file).map_err(write_err)?;

        debug!(path = %self.cookie_file.display(), "Session persisted");
        Ok(())
    }

    /// Tie the session to a guard that persists it on every exit path
    pub fn scoped(&self, session: Session) -> SessionGuard<'_> {
        SessionGuard {
            store: self,
            session,
        }
    }
}

/// Scoped session: dereferences to `Session`, persists it on drop
pub struct SessionGuard<'a> {
    store: &'a SessionStore,
    session: Session,
}

impl Deref for SessionGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.persist(&self.session) {
            warn!("Failed to persist session on exit: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatform;
    use tempfile::tempdir;

    #[test]
    fn test_cookie_header_round_trip() {
        let session = Session::from_cookie_header("signed_token=abc; remember_me=1");
        assert_eq!(session.cookie("signed_token"), Some("abc"));
        assert_eq!(session.cookie_header(), "remember_me=1; signed_token=abc");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("a@b.c", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("a@b.c"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_valid_restored_session_skips_login() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("cookies.json"));
        let platform = MockPlatform::new();
        store.persist(&platform.valid_session()).unwrap();

        let session = store.acquire(&platform, None).await.unwrap();

        assert_eq!(session, platform.valid_session());
        assert_eq!(platform.login_calls(), 0);
    }

    #[tokio::test]
    async fn test_rejected_session_logs_in_once() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("cookies.json"));
        let platform = MockPlatform::new();
        store
            .persist(&Session::from_cookie_header("signed_token=expired"))
            .unwrap();

        let creds = Credentials::new("ta@example.edu", "pw");
        let session = store.acquire(&platform, Some(&creds)).await.unwrap();

        assert_eq!(platform.login_calls(), 1);
        assert_eq!(session.cookie_header(), platform.valid_session().cookie_header());
        // New session written back immediately
        assert_eq!(store.restore().unwrap().cookie_header(), session.cookie_header());
    }

    #[tokio::test]
    async fn test_missing_credentials_is_authentication_error() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("cookies.json"));
        let platform = MockPlatform::new();

        let err = store.acquire(&platform, None).await.unwrap_err();
        assert!(matches!(err, CoreError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_wrong_password_is_not_retried() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("cookies.json")).with_login_attempts(3);
        let platform = MockPlatform::new();

        let creds = Credentials::new("ta@example.edu", "wrong");
        let err = store.acquire(&platform, Some(&creds)).await.unwrap_err();

        assert!(matches!(err, CoreError::Authentication { .. }));
        assert_eq!(platform.login_calls(), 1);
    }

    #[test]
    fn test_guard_persists_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cookies.json");
        let store = SessionStore::new(&path);

        {
            let guard = store.scoped(Session::from_cookie_header("signed_token=xyz"));
            assert_eq!(guard.cookie("signed_token"), Some("xyz"));
        }

        assert!(path.exists());
        assert_eq!(store.restore().unwrap().cookie("signed_token"), Some("xyz"));
    }

    #[test]
    fn test_corrupt_cookie_file_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(SessionStore::new(&path).restore().is_none());
    }
}
