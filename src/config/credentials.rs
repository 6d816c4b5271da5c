//! Bearer-token lookup for the signaling connection.
//!
//! The token is an opaque credential produced by the login flow.  The
//! transport reads it exactly once per [`open`](crate::transport::TransportConnection::open)
//! call and never writes it back.

use std::fmt;
use std::path::PathBuf;

use super::{AppPaths, ServerConfig};

// ---------------------------------------------------------------------------
// AuthToken
// ---------------------------------------------------------------------------

/// Opaque bearer credential.  `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap `raw`, returning `None` when it is blank.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// CredentialSource
// ---------------------------------------------------------------------------

/// Anything that can hand the transport a bearer token.
pub trait CredentialSource: Send + Sync {
    /// The current token, or `None` when the user is not logged in.
    fn token(&self) -> Option<AuthToken>;
}

/// A fixed, in-memory credential.
#[derive(Debug, Clone, Default)]
pub struct StaticCredential(Option<AuthToken>);

impl StaticCredential {
    pub fn new(token: Option<AuthToken>) -> Self {
        Self(token)
    }
}

impl CredentialSource for StaticCredential {
    fn token(&self) -> Option<AuthToken> {
        self.0.clone()
    }
}

/// Client-held session storage: an environment variable first, then the
/// `session_token` file in the config directory.
#[derive(Debug, Clone)]
pub struct SessionStorage {
    env_var: String,
    token_file: PathBuf,
}

impl SessionStorage {
    pub fn new(env_var: impl Into<String>, token_file: impl Into<PathBuf>) -> Self {
        Self {
            env_var: env_var.into(),
            token_file: token_file.into(),
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self::new(server.token_env.clone(), AppPaths::new().session_token_file)
    }
}

impl CredentialSource for SessionStorage {
    fn token(&self) -> Option<AuthToken> {
        if let Some(token) = std::env::var(&self.env_var).ok().and_then(AuthToken::new) {
            return Some(token);
        }

        match std::fs::read_to_string(&self.token_file) {
            Ok(content) => AuthToken::new(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!(
                    "credentials: cannot read {}: {e}",
                    self.token_file.display()
                );
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn blank_token_is_absent() {
        assert!(AuthToken::new("").is_none());
        assert!(AuthToken::new("  \n").is_none());
        assert_eq!(AuthToken::new(" abc \n").unwrap().as_str(), "abc");
    }

    #[test]
    fn debug_output_is_redacted() {
        let token = AuthToken::new("secret-value").unwrap();
        assert!(!format!("{token:?}").contains("secret-value"));
    }

    #[test]
    fn session_storage_reads_token_file() {
        let dir = tempdir().expect("temp dir");
        let file = dir.path().join("session_token");
        std::fs::write(&file, "file-token\n").unwrap();

        let storage = SessionStorage::new("VOICE_CALL_TEST_UNSET_VAR_1", &file);
        assert_eq!(storage.token().unwrap().as_str(), "file-token");
    }

    #[test]
    fn session_storage_prefers_environment() {
        let dir = tempdir().expect("temp dir");
        let file = dir.path().join("session_token");
        std::fs::write(&file, "file-token").unwrap();

        std::env::set_var("VOICE_CALL_TEST_ENV_TOKEN_2", "env-token");
        let storage = SessionStorage::new("VOICE_CALL_TEST_ENV_TOKEN_2", &file);
        assert_eq!(storage.token().unwrap().as_str(), "env-token");
        std::env::remove_var("VOICE_CALL_TEST_ENV_TOKEN_2");
    }

    #[test]
    fn session_storage_without_token_is_none() {
        let dir = tempdir().expect("temp dir");
        let storage = SessionStorage::new(
            "VOICE_CALL_TEST_UNSET_VAR_3",
            dir.path().join("missing"),
        );
        assert!(storage.token().is_none());
    }
}
