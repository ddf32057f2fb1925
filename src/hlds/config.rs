// Server configuration - validated tunables, engine config files, container spec

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bollard::container::Config;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use thiserror::Error;

/// To ensure this API cannot be misused and mount arbitrary directories, only
/// directories created under USER_CONTENT_DIR are allowed to be mounted in
/// hlds containers.
pub const USER_CONTENT_DIR: &str = "/var/tmp/hlds";
pub const HLDS_DOCKER_IMAGE: &str = "hlds:latest";

const VALVE_ADDON_MOUNT_DEST: &str = "/home/steam/hlds/valve_addon";
const INSTANCE_CFG_DEST: &str = "/home/steam/hlds/valve/instance.cfg";
const MAP_CYCLE_DEST: &str = "/home/steam/hlds/valve/mapcycle.txt";

const MIN_LIFETIME: Duration = Duration::from_secs(60);
const MAX_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("maxPlayers out of bounds: {0}")]
    MaxPlayersOutOfBounds(u32),

    #[error("mapCycle must contain at least one entry")]
    EmptyMapCycle,

    #[error("server lifetime must be within [1m; 24h]")]
    LifetimeOutOfBounds,

    #[error("invalid key in cvar: '{0}'")]
    InvalidCVarKey(String),

    #[error("invalid value in cvar '{0}'")]
    InvalidCVarValue(String),

    #[error("valveAddonDirPath outside of {USER_CONTENT_DIR}")]
    AddonDirOutsideContentRoot,

    #[error("unable to resolve path to valve_addon dir: {0}")]
    ResolveAddonDir(io::Error),

    #[error("unable to write server configuration: {0}")]
    Io(#[from] io::Error),
}

// GoldSrc config parsing has no escape mechanism and a known poorly bounded
// read when it hits an unterminated quoted token, so quotes are rejected at
// the source and the strings are quoted by us.
fn is_valid_cvar_char(c: char) -> bool {
    matches!(c, ' '..='~') && c != '"'
}

fn is_valid_cvar_string(s: &str) -> bool {
    s.chars().all(is_valid_cvar_char)
}

/// Engine configuration variables, written to the instance.cfg read at server
/// start.
#[derive(Debug, Clone, Default)]
pub struct CVars(BTreeMap<String, String>);

impl CVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (k, v) in &self.0 {
            if !is_valid_cvar_string(k) {
                return Err(ConfigError::InvalidCVarKey(k.clone()));
            }
            if !is_valid_cvar_string(v) {
                return Err(ConfigError::InvalidCVarValue(k.clone()));
            }
        }

        Ok(())
    }

    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        for (k, v) in &self.0 {
            writeln!(w, "\"{k}\" \"{v}\"")?;
        }

        Ok(())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for CVars {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut cvars = Self::new();
        for (k, v) in pairs {
            cvars.set(k, v);
        }
        cvars
    }
}

/// Validated description of a single server. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Contents of this directory extend the base game inside the container.
    // Must live under USER_CONTENT_DIR and is deleted from the host when the
    // server is removed. None disables the addon mount.
    valve_addon_dir: Option<PathBuf>,

    lifetime: Duration,
    #[allow(dead_code)] // validated but not forwarded, see container_config
    max_players: u32,
    map_cycle: Vec<String>, // first entry is the startup map
    cvars: CVars,
}

impl ServerConfig {
    pub fn new(
        lifetime: Duration,
        valve_addon_dir: Option<PathBuf>,
        max_players: u32,
        map_cycle: Vec<String>,
        mut cvars: CVars,
    ) -> Result<Self, ConfigError> {
        // We don't want to run singleplayer servers.
        if !(2..=32).contains(&max_players) {
            return Err(ConfigError::MaxPlayersOutOfBounds(max_players));
        }

        if map_cycle.is_empty() {
            return Err(ConfigError::EmptyMapCycle);
        }

        if lifetime < MIN_LIFETIME || lifetime > MAX_LIFETIME {
            return Err(ConfigError::LifetimeOutOfBounds);
        }

        cvars.validate()?;
        cvars.set("mp_timeleft", lifetime.as_secs().to_string());

        let valve_addon_dir = match valve_addon_dir {
            Some(path) => Some(resolve_addon_dir(&path)?),
            None => None,
        };

        Ok(Self {
            valve_addon_dir,
            lifetime,
            max_players,
            map_cycle,
            cvars,
        })
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn startup_map(&self) -> &str {
        &self.map_cycle[0]
    }

    pub fn cvar(&self, key: &str) -> Option<&str> {
        self.cvars.get(key)
    }

    pub(crate) fn valve_addon_dir(&self) -> Option<&Path> {
        self.valve_addon_dir.as_deref()
    }

    pub(crate) fn container_config(&self, port: u16) -> Config<String> {
        Config {
            // -maxplayers is pinned to 32 in the image invocation; the
            // validated max_players field is not forwarded. Kept as-is until
            // the image contract changes.
            cmd: Some(vec![
                "-norestart".to_string(),
                "-nohltv".to_string(),
                "-port".to_string(),
                port.to_string(),
                "-maxplayers".to_string(),
                "32".to_string(),
                "+map".to_string(),
                self.startup_map().to_string(),
            ]),
            image: Some(HLDS_DOCKER_IMAGE.to_string()),
            ..Default::default()
        }
    }

    /// Materializes the engine-facing config files and composes the host side
    /// of the container spec. Every temp file created on the host is pushed
    /// onto `temp_files` before any error check so the caller can always
    /// reclaim them.
    pub(crate) fn host_config(
        &self,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<HostConfig, ConfigError> {
        let mounts = self.write_config_mounts(temp_files)?;

        Ok(HostConfig {
            network_mode: Some("host".to_string()),
            auto_remove: Some(true),
            mounts: Some(mounts),
            ..Default::default()
        })
    }

    fn write_config_mounts(
        &self,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<Vec<Mount>, ConfigError> {
        // TODO listip.cfg, banned.cfg
        let mut mounts = Vec::with_capacity(3);

        let instance_cfg = write_temp_file("cvars.", ".cfg", temp_files, |f| {
            self.cvars.write_to(f)
        })?;
        mounts.push(read_only_bind(&instance_cfg, INSTANCE_CFG_DEST));

        let map_cycle = write_temp_file("mapcycle.", ".txt", temp_files, |f| {
            for map in &self.map_cycle {
                writeln!(f, "{map}")?;
            }
            Ok(())
        })?;
        mounts.push(read_only_bind(&map_cycle, MAP_CYCLE_DEST));

        if let Some(addon_dir) = &self.valve_addon_dir {
            mounts.push(read_only_bind(addon_dir, VALVE_ADDON_MOUNT_DEST));
        }

        Ok(mounts)
    }
}

fn read_only_bind(source: &Path, target: &str) -> Mount {
    Mount {
        typ: Some(MountTypeEnum::BIND),
        source: Some(source.to_string_lossy().into_owned()),
        target: Some(target.to_string()),
        read_only: Some(true),
        ..Default::default()
    }
}

// The temp file is persisted and recorded before its contents are written, so
// a failed write still leaves the path on the reclaim list.
fn write_temp_file(
    prefix: &str,
    suffix: &str,
    temp_files: &mut Vec<PathBuf>,
    fill: impl FnOnce(&mut File) -> io::Result<()>,
) -> Result<PathBuf, ConfigError> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile()?;
    let (mut file, path) = file.keep().map_err(|err| err.error)?;
    temp_files.push(path.clone());

    fill(&mut file)?;

    Ok(path)
}

// Ensures we're not escaping our rudimentary chroot. Canonicalization resolves
// symlinks, so a link planted under the content root cannot point elsewhere.
fn resolve_addon_dir(path: &Path) -> Result<PathBuf, ConfigError> {
    let abs = path.canonicalize().map_err(ConfigError::ResolveAddonDir)?;

    if !abs.starts_with(USER_CONTENT_DIR) || abs == Path::new(USER_CONTENT_DIR) {
        return Err(ConfigError::AddonDirOutsideContentRoot);
    }

    Ok(abs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn minute() -> Duration {
        Duration::from_secs(60)
    }

    fn valid_config() -> ServerConfig {
        ServerConfig::new(
            Duration::from_secs(3600),
            None,
            2,
            vec!["crossfire".to_string()],
            CVars::from([("sv_password", "hunter2")]),
        )
        .expect("valid config")
    }

    #[test]
    fn injects_mp_timeleft() {
        let cfg = ServerConfig::new(
            Duration::from_secs(90),
            None,
            2,
            vec!["crossfire".to_string()],
            CVars::new(),
        )
        .expect("valid config");

        assert_eq!(cfg.cvar("mp_timeleft"), Some("90"));
    }

    #[test]
    fn rejects_bad_max_players() {
        for players in [0, 1, 33] {
            let err = ServerConfig::new(
                minute(),
                None,
                players,
                vec!["crossfire".to_string()],
                CVars::new(),
            )
            .expect_err("maxPlayers out of bounds");
            assert!(matches!(err, ConfigError::MaxPlayersOutOfBounds(_)));
        }
    }

    #[test]
    fn rejects_empty_map_cycle() {
        let err = ServerConfig::new(minute(), None, 2, Vec::new(), CVars::new())
            .expect_err("empty map cycle");
        assert!(matches!(err, ConfigError::EmptyMapCycle));
    }

    #[test]
    fn rejects_out_of_bounds_lifetime() {
        for lifetime in [Duration::from_secs(59), Duration::from_secs(24 * 3600 + 1)] {
            let err = ServerConfig::new(
                lifetime,
                None,
                2,
                vec!["crossfire".to_string()],
                CVars::new(),
            )
            .expect_err("lifetime out of bounds");
            assert!(matches!(err, ConfigError::LifetimeOutOfBounds));
        }
    }

    #[test]
    fn rejects_cvars_with_quotes_or_non_ascii() {
        for (k, v) in [("sv_password", "a\"b"), ("host\"name", "x"), ("motd", "héllo")] {
            let err = ServerConfig::new(
                minute(),
                None,
                2,
                vec!["crossfire".to_string()],
                CVars::from([(k, v)]),
            )
            .expect_err("invalid cvar");
            assert!(matches!(
                err,
                ConfigError::InvalidCVarKey(_) | ConfigError::InvalidCVarValue(_)
            ));
        }
    }

    #[test]
    fn cvars_render_as_quoted_lines() {
        let cvars = CVars::from([("hostname", "my server"), ("sv_password", "hunter2")]);

        let mut buf = Vec::new();
        cvars.write_to(&mut buf).expect("cvars written");

        assert_eq!(
            String::from_utf8(buf).expect("utf-8 output"),
            "\"hostname\" \"my server\"\n\"sv_password\" \"hunter2\"\n"
        );
    }

    #[test]
    fn rejects_addon_dir_outside_content_root() {
        let outside = tempfile::tempdir().expect("temp dir");

        let err = ServerConfig::new(
            minute(),
            Some(outside.path().to_path_buf()),
            2,
            vec!["crossfire".to_string()],
            CVars::new(),
        )
        .expect_err("addon dir outside content root");
        assert!(matches!(err, ConfigError::AddonDirOutsideContentRoot));
    }

    #[test]
    fn rejects_content_root_itself_as_addon_dir() {
        fs::create_dir_all(USER_CONTENT_DIR).expect("content root created");

        let err = ServerConfig::new(
            minute(),
            Some(PathBuf::from(USER_CONTENT_DIR)),
            2,
            vec!["crossfire".to_string()],
            CVars::new(),
        )
        .expect_err("content root itself is not a valid addon dir");
        assert!(matches!(err, ConfigError::AddonDirOutsideContentRoot));
    }

    #[test]
    fn accepts_addon_dir_under_content_root() {
        fs::create_dir_all(USER_CONTENT_DIR).expect("content root created");
        let addon = tempfile::tempdir_in(USER_CONTENT_DIR).expect("addon dir");

        let cfg = ServerConfig::new(
            minute(),
            Some(addon.path().to_path_buf()),
            2,
            vec!["crossfire".to_string()],
            CVars::new(),
        )
        .expect("addon dir accepted");

        assert_eq!(
            cfg.valve_addon_dir(),
            Some(addon.path().canonicalize().expect("canonical path").as_path())
        );
    }

    #[test]
    fn materializes_config_files_and_records_them() {
        let cfg = valid_config();

        let mut temp_files = Vec::new();
        let host_config = cfg.host_config(&mut temp_files).expect("host config");

        assert_eq!(temp_files.len(), 2);
        let instance_cfg =
            fs::read_to_string(&temp_files[0]).expect("instance cfg readable");
        assert!(instance_cfg.contains("\"sv_password\" \"hunter2\""));
        assert!(instance_cfg.contains("\"mp_timeleft\" \"3600\""));

        let map_cycle = fs::read_to_string(&temp_files[1]).expect("mapcycle readable");
        assert_eq!(map_cycle, "crossfire\n");

        assert_eq!(host_config.network_mode.as_deref(), Some("host"));
        assert_eq!(host_config.auto_remove, Some(true));
        let mounts = host_config.mounts.expect("mounts present");
        assert_eq!(mounts.len(), 2, "no addon mount without an addon dir");
        assert_eq!(mounts[0].read_only, Some(true));
        assert_eq!(mounts[0].target.as_deref(), Some(INSTANCE_CFG_DEST));
        assert_eq!(mounts[1].target.as_deref(), Some(MAP_CYCLE_DEST));

        for path in &temp_files {
            fs::remove_file(path).expect("temp file removed");
        }
    }

    #[test]
    fn container_command_line_is_fixed_order() {
        let cfg = valid_config();
        let container = cfg.container_config(27015);

        assert_eq!(container.image.as_deref(), Some(HLDS_DOCKER_IMAGE));
        assert_eq!(
            container.cmd.expect("cmd present"),
            vec![
                "-norestart",
                "-nohltv",
                "-port",
                "27015",
                "-maxplayers",
                "32",
                "+map",
                "crossfire"
            ]
        );
    }
}
