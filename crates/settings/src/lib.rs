//! MeshTunnel Settings
//!
//! Tunnel configuration stored as a JSON file.
//!
//! ## Usage
//!
//! ```no_run
//! use meshtunnel_settings::Settings;
//!
//! // Load or create default settings
//! let mut settings = Settings::load_or_default()?;
//!
//! // Modify settings
//! settings.tunnel.udp = true;
//!
//! // Save settings
//! settings.save()?;
//! # Ok::<(), meshtunnel_settings::SettingsError>(())
//! ```

mod config;

pub use config::Settings;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// `~/.meshtunnel`, or the working directory when there is no home
pub fn default_config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshtunnel")
}

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
