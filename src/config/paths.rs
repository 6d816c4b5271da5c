//! Cross-platform application paths using the `dirs` crate.
//!
//! Config dir (settings + session token):
//!   Windows: %APPDATA%\voice-call\
//!   macOS:   ~/Library/Application Support/voice-call/
//!   Linux:   ~/.config/voice-call/

use std::path::PathBuf;

/// Holds all resolved application file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for `settings.toml` and `session_token`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
    /// Full path to the stored bearer token written by the login flow.
    pub session_token_file: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "voice-call";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let settings_file = config_dir.join("settings.toml");
        let session_token_file = config_dir.join("session_token");

        Self {
            config_dir,
            settings_file,
            session_token_file,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_config_dir() {
        let paths = AppPaths::new();
        assert!(paths.settings_file.starts_with(&paths.config_dir));
        assert!(paths.session_token_file.starts_with(&paths.config_dir));
        assert!(paths
            .session_token_file
            .file_name()
            .is_some_and(|n| n == "session_token"));
    }
}
