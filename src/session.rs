use std::fs;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RelayError;

/// Credentials attached to every outbound request made on behalf of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionToken {
    pub authorization: Option<String>,
    pub cookies: Vec<(String, String)>,
    pub user_agent: Option<String>,
}

impl SessionToken {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

pub trait AuthProvider: Send + Sync {
    fn acquire(&self) -> Result<SessionToken, RelayError>;
    fn refresh(&self) -> Result<SessionToken, RelayError>;
}

#[derive(Debug, Deserialize, Serialize)]
struct SessionFile {
    #[serde(default)]
    cookies: Vec<SessionCookie>,
    #[serde(default)]
    headers: SessionHeaders,
}

#[derive(Debug, Deserialize, Serialize)]
struct SessionCookie {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct SessionHeaders {
    #[serde(rename = "Authorization", default)]
    authorization: Option<String>,
    #[serde(rename = "User-Agent", default)]
    user_agent: Option<String>,
}

/// Reads a session file produced by an external login step. `refresh` runs the
/// configured command (if any) and reads the file again.
pub struct FileSessionProvider {
    path: Utf8PathBuf,
    refresh_command: Vec<String>,
}

impl FileSessionProvider {
    pub fn new(path: Utf8PathBuf, refresh_command: Vec<String>) -> Self {
        Self {
            path,
            refresh_command,
        }
    }

    fn read(&self) -> Result<SessionToken, RelayError> {
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| RelayError::Session(format!("read {}: {err}", self.path)))?;
        parse_session_file(&content)
    }

    fn run_refresh_command(&self) -> Result<(), RelayError> {
        let Some((program, args)) = self.refresh_command.split_first() else {
            return Ok(());
        };
        info!(command = %program, "refreshing session");
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|err| RelayError::Session(format!("spawn {program}: {err}")))?;
        if !status.success() {
            return Err(RelayError::Session(format!(
                "{program} exited with {status}"
            )));
        }
        Ok(())
    }
}

impl AuthProvider for FileSessionProvider {
    fn acquire(&self) -> Result<SessionToken, RelayError> {
        if !self.path.as_std_path().exists() {
            self.run_refresh_command()?;
        }
        self.read()
    }

    fn refresh(&self) -> Result<SessionToken, RelayError> {
        if self.refresh_command.is_empty() {
            warn!(path = %self.path, "no refresh command configured; re-reading session file");
        }
        self.run_refresh_command()?;
        self.read()
    }
}

pub fn parse_session_file(content: &str) -> Result<SessionToken, RelayError> {
    let file: SessionFile = serde_json::from_str(content)
        .map_err(|err| RelayError::Session(format!("invalid session file: {err}")))?;
    Ok(SessionToken {
        authorization: file.headers.authorization,
        cookies: file
            .cookies
            .into_iter()
            .map(|cookie| (cookie.name, cookie.value))
            .collect(),
        user_agent: file.headers.user_agent,
    })
}

/// Fixed credentials; archives that accept anonymous WADO use `StaticAuth::default()`.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    token: SessionToken,
}

impl StaticAuth {
    pub fn new(token: SessionToken) -> Self {
        Self { token }
    }
}

impl AuthProvider for StaticAuth {
    fn acquire(&self) -> Result<SessionToken, RelayError> {
        Ok(self.token.clone())
    }

    fn refresh(&self) -> Result<SessionToken, RelayError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SessionLease {
    pub generation: u64,
    pub token: SessionToken,
}

/// Shared session context handed to every component that talks to an authenticated endpoint.
///
/// Refreshes are serialized: a caller passes the generation it saw rejected, and if another
/// worker already refreshed past it the current token is returned without hitting the provider.
/// Callers report generations the server accepted so a token that was never honoured can be
/// told apart from one that simply expired.
pub struct SessionHandle {
    provider: Box<dyn AuthProvider>,
    current: RwLock<Option<SessionLease>>,
    refresh_lock: Mutex<()>,
    accepted: AtomicU64,
}

impl SessionHandle {
    pub fn new(provider: Box<dyn AuthProvider>) -> Self {
        Self {
            provider,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            accepted: AtomicU64::new(0),
        }
    }

    pub fn lease(&self) -> Result<SessionLease, RelayError> {
        if let Some(lease) = self.read_current()? {
            return Ok(lease);
        }
        let _guard = self
            .refresh_lock
            .lock()
            .map_err(|_| RelayError::Session("session lock poisoned".to_string()))?;
        if let Some(lease) = self.read_current()? {
            return Ok(lease);
        }
        let token = self.provider.acquire()?;
        self.store(token, 1)
    }

    pub fn refresh(&self, rejected_generation: u64) -> Result<SessionLease, RelayError> {
        let _guard = self
            .refresh_lock
            .lock()
            .map_err(|_| RelayError::Session("session lock poisoned".to_string()))?;
        if let Some(lease) = self.read_current()?
            && lease.generation > rejected_generation
        {
            return Ok(lease);
        }
        let token = self.provider.refresh()?;
        info!(generation = rejected_generation + 1, "session refreshed");
        self.store(token, rejected_generation + 1)
    }

    /// Generation of the token in use right now, if one was acquired.
    pub fn current_generation(&self) -> Result<Option<u64>, RelayError> {
        Ok(self.read_current()?.map(|lease| lease.generation))
    }

    pub fn mark_accepted(&self, generation: u64) {
        self.accepted.fetch_max(generation, Ordering::SeqCst);
    }

    pub fn was_accepted(&self, generation: u64) -> bool {
        self.accepted.load(Ordering::SeqCst) >= generation
    }

    fn read_current(&self) -> Result<Option<SessionLease>, RelayError> {
        let current = self
            .current
            .read()
            .map_err(|_| RelayError::Session("session lock poisoned".to_string()))?;
        Ok(current.clone())
    }

    fn store(&self, token: SessionToken, generation: u64) -> Result<SessionLease, RelayError> {
        let lease = SessionLease { generation, token };
        let mut current = self
            .current
            .write()
            .map_err(|_| RelayError::Session("session lock poisoned".to_string()))?;
        *current = Some(lease.clone());
        Ok(lease)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct CountingAuth {
        refreshes: Arc<AtomicUsize>,
    }

    impl AuthProvider for CountingAuth {
        fn acquire(&self) -> Result<SessionToken, RelayError> {
            Ok(SessionToken {
                authorization: Some("Bearer first".to_string()),
                ..SessionToken::default()
            })
        }

        fn refresh(&self) -> Result<SessionToken, RelayError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SessionToken {
                authorization: Some(format!("Bearer refreshed-{n}")),
                ..SessionToken::default()
            })
        }
    }

    #[test]
    fn parse_session_file_headers_and_cookies() {
        let token = parse_session_file(
            r#"{"cookies":[{"name":"JSESSIONID","value":"abc"},{"name":"lb","value":"2"}],
                "headers":{"Authorization":"Bearer xyz","User-Agent":"Mozilla/5.0"}}"#,
        )
        .unwrap();
        assert_eq!(token.authorization.as_deref(), Some("Bearer xyz"));
        assert_eq!(token.cookie_header().as_deref(), Some("JSESSIONID=abc; lb=2"));
    }

    #[test]
    fn stale_refresh_reuses_newer_generation() {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let handle = SessionHandle::new(Box::new(CountingAuth {
            refreshes: refreshes.clone(),
        }));
        let first = handle.lease().unwrap();
        assert_eq!(first.generation, 1);

        let second = handle.refresh(first.generation).unwrap();
        let again = handle.refresh(first.generation).unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(again.generation, 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            handle.lease().unwrap().token.authorization.as_deref(),
            Some("Bearer refreshed-1")
        );
    }

    #[test]
    fn acceptance_is_tracked_per_generation() {
        let handle = SessionHandle::new(Box::new(CountingAuth {
            refreshes: Arc::new(AtomicUsize::new(0)),
        }));
        assert_eq!(handle.current_generation().unwrap(), None);
        let first = handle.lease().unwrap();
        assert!(!handle.was_accepted(first.generation));

        handle.mark_accepted(first.generation);
        let second = handle.refresh(first.generation).unwrap();
        assert!(handle.was_accepted(first.generation));
        assert!(!handle.was_accepted(second.generation));
        assert_eq!(handle.current_generation().unwrap(), Some(2));

        handle.mark_accepted(first.generation);
        assert!(!handle.was_accepted(second.generation));
    }

    #[test]
    fn file_provider_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("session.json")).unwrap();
        let provider = FileSessionProvider::new(path, Vec::new());
        assert!(matches!(provider.acquire(), Err(RelayError::Session(_))));
    }
}
