// Server record - what the pool knows about one live container, and the
// on-disk artifacts it owns

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::hlds::config::{ServerConfig, USER_CONTENT_DIR};

/// Container identifier assigned by the runtime at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ServerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Error)]
#[error("{}", .0.join("; "))]
pub struct CleanupError(Vec<String>);

/// One live server. Owns its host-side temp files and extracted addon
/// directory until removal.
#[derive(Debug, Clone)]
pub struct Server {
    pub(crate) id: ServerId,
    pub(crate) name: String,
    pub(crate) port: u16,
    pub(crate) host_ip: IpAddr,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,

    // Files to remove from the host after the server closes.
    pub(crate) temp_files: Vec<PathBuf>,
    pub(crate) addons_dir: Option<PathBuf>,

    pub(crate) cfg: ServerConfig,
}

impl Server {
    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// `ip:port` address game clients connect to.
    pub fn host(&self) -> String {
        format!("{}:{}", self.host_ip, self.port)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Exposes the configured cvars so the chat adapter can disclose the
    /// hostname and passwords in its reply.
    pub fn cvar(&self, key: &str) -> Option<&str> {
        self.cfg.cvar(key)
    }

    /// Deletes every on-disk artifact this server owns. Errors are
    /// accumulated so one stubborn file doesn't strand the rest.
    pub(crate) fn cleanup(&self) -> Result<(), CleanupError> {
        let mut errs = Vec::new();

        for path in &self.temp_files {
            tracing::debug!(path = %path.display(), "removing file");
            if let Err(err) = fs::remove_file(path) {
                errs.push(format!(
                    "unable to remove temp file '{}': {err}",
                    path.display()
                ));
            }
        }

        if let Some(dir) = &self.addons_dir {
            // Only ever delete recursively inside the content root.
            if dir.starts_with(USER_CONTENT_DIR) {
                tracing::debug!(path = %dir.display(), "removing dir");
                if let Err(err) = fs::remove_dir_all(dir) {
                    errs.push(format!("unable to remove addons dir: {err}"));
                }
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(CleanupError(errs))
        }
    }
}
