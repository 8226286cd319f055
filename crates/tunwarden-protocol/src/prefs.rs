//! Client preferences file
//!
//! A flat `Key=Value` file holding the coordination server URL, account
//! email, the client key pair and an application id. Malformed lines and
//! unknown keys are skipped on load.

use crate::config::ConfigError;
use std::fmt;
use std::path::Path;

/// Default file name, relative to the working directory
pub const DEFAULT_PREFS_FILE: &str = "config.txt";

/// Field names in file order
pub const FIELDS: [&str; 5] = ["Server", "Email", "PrivateKey", "PublicKey", "ApplicationID"];

/// Stored user preferences
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preferences {
    /// Coordination server URL
    pub server: String,
    /// Account email
    pub email: String,
    /// Client private key (base64)
    pub private_key: String,
    /// Client public key (base64)
    pub public_key: String,
    /// Application identifier
    pub application_id: String,
}

impl Preferences {
    /// Load from `path`. A missing file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&content))
    }

    /// Parse file content
    pub fn parse(content: &str) -> Self {
        let mut prefs = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            // Unknown keys are silently dropped
            let _ = prefs.set(key.trim(), value.trim());
        }
        prefs
    }

    /// Write every field to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path.as_ref(), self.to_string())?;
        Ok(())
    }

    /// Look up a field by its file key
    pub fn get(&self, key: &str) -> Option<&str> {
        let value = match key {
            "Server" => &self.server,
            "Email" => &self.email,
            "PrivateKey" => &self.private_key,
            "PublicKey" => &self.public_key,
            "ApplicationID" => &self.application_id,
            _ => return None,
        };
        Some(value.as_str())
    }

    /// Set a field by its file key
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let slot = match key {
            "Server" => &mut self.server,
            "Email" => &mut self.email,
            "PrivateKey" => &mut self.private_key,
            "PublicKey" => &mut self.public_key,
            "ApplicationID" => &mut self.application_id,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "preference key".into(),
                    value: other.to_string(),
                })
            }
        };
        *slot = value.to_string();
        Ok(())
    }

    /// Load `path` (or start empty if it does not exist), set one field, and
    /// rewrite the file
    pub fn update_field(path: impl AsRef<Path>, key: &str, value: &str) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut prefs = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        prefs.set(key, value)?;
        prefs.save(path)?;
        tracing::debug!("Updated preference {} in {}", key, path.display());
        Ok(prefs)
    }
}

impl fmt::Display for Preferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for key in FIELDS {
            writeln!(f, "{}={}", key, self.get(key).unwrap_or_default())?;
        }
        Ok(())
    }
}
