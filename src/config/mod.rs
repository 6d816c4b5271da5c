//! Configuration module for the voice call client.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for each subsystem,
//! `AppPaths` for cross-platform directories, TOML persistence via
//! `AppConfig::load` / `AppConfig::save`, and the credential source the
//! transport authenticates with.

pub mod credentials;
pub mod paths;
pub mod settings;

pub use credentials::{AuthToken, CredentialSource, SessionStorage, StaticCredential};
pub use paths::AppPaths;
pub use settings::{
    AppConfig, AudioConfig, CaptureMode, HotkeyConfig, IceConfig, ServerConfig, UiConfig,
};
