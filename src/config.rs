use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Registry configuration: where database files live and how handles are set up.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding one file per database name
    pub base_dir: PathBuf,
    /// File extension appended to database names (without the dot)
    pub extension: String,
    /// Enable `PRAGMA foreign_keys` on every handle
    pub foreign_keys: bool,
    /// Engine busy timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// Default time a request may wait in the queue before failing
    pub request_timeout_ms: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
            extension: "db".to_string(),
            foreign_keys: true,
            busy_timeout_ms: 5_000,
            request_timeout_ms: None,
        }
    }
}

impl RegistryConfig {
    /// Create a config rooted at `base_dir` with default settings
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms =
            timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Resolve the file path for a database name.
    ///
    /// The extension is appended unless the name already carries it, so
    /// `"test"` and `"test.db"` name the same file. Names must be a single
    /// plain path component.
    pub fn database_path(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain || name.contains(['/', '\\']) {
            return Err(Error::io(
                self.base_dir.join(name),
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid database name: {name:?}"),
                ),
            ));
        }

        let suffix = format!(".{}", self.extension);
        let file_name = if self.extension.is_empty() || name.ends_with(&suffix) {
            name.to_string()
        } else {
            format!("{name}{suffix}")
        };
        Ok(self.base_dir.join(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_appended_once() {
        let config = RegistryConfig::new("/data");
        assert_eq!(
            config.database_path("test").unwrap(),
            PathBuf::from("/data/test.db")
        );
        assert_eq!(
            config.database_path("test.db").unwrap(),
            PathBuf::from("/data/test.db")
        );
    }

    #[test]
    fn test_rejects_names_escaping_base_dir() {
        let config = RegistryConfig::new("/data");
        for name in ["", "..", ".", "../x", "a/b", "a\\b"] {
            let err = config.database_path(name).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Io, "name {name:?}");
        }
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{"base_dir": "/srv/db", "request_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/srv/db"));
        assert_eq!(config.extension, "db");
        assert!(config.foreign_keys);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));
    }
}
