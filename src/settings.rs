// Process settings - the few knobs that are not compile-time constants

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of concurrent servers, which is also the number of reserved
    /// host ports.
    pub max_servers: usize,
    /// First port of the contiguous range handed to servers.
    pub min_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_servers: 2,
            min_port: 27015,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file, falling back to the defaults when the
    /// file is absent or unreadable.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(settings) => {
                tracing::info!(path = %path.display(), "loaded settings");
                settings
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    %err,
                    "invalid settings file, using defaults"
                );
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_classic_hlds_setup() {
        let settings = Settings::default();
        assert_eq!(settings.max_servers, 2);
        assert_eq!(settings.min_port, 27015);
    }

    #[test]
    fn loads_overrides_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"max_servers": 8, "min_port": 28000}}"#).expect("written");

        let settings = Settings::load(file.path());
        assert_eq!(settings.max_servers, 8);
        assert_eq!(settings.min_port, 28000);
    }

    #[test]
    fn partial_files_keep_the_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"max_servers": 4}}"#).expect("written");

        let settings = Settings::load(file.path());
        assert_eq!(settings.max_servers, 4);
        assert_eq!(settings.min_port, 27015);
    }

    #[test]
    fn missing_or_broken_files_fall_back_to_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/hldsbot.json"));
        assert_eq!(settings.max_servers, 2);

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "not json").expect("written");
        let settings = Settings::load(file.path());
        assert_eq!(settings.min_port, 27015);
    }
}
