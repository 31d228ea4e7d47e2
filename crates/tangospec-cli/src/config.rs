//! Configuration – reads/writes `~/.tangospec/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tangospec_device::SpecConfig;

/// Persisted user configuration stored in `~/.tangospec/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Name of the `Spec` device to serve, `domain/family/member`.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Session address, `host:session`.
    #[serde(default = "default_session")]
    pub session: String,

    /// Property database file.  Empty means `~/.tangospec/properties.db`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database: String,

    #[serde(default)]
    pub auto_discovery: bool,

    #[serde(default = "default_output_buffer_max_length")]
    pub output_buffer_max_length: usize,

    #[serde(default = "default_history_max_length")]
    pub history_max_length: usize,
}

fn default_device_name() -> String {
    "id00/spec/fourc".to_string()
}
fn default_session() -> String {
    "localhost:fourc".to_string()
}
fn default_output_buffer_max_length() -> usize {
    1000
}
fn default_history_max_length() -> usize {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            session: default_session(),
            database: String::new(),
            auto_discovery: false,
            output_buffer_max_length: default_output_buffer_max_length(),
            history_max_length: default_history_max_length(),
        }
    }
}

impl Config {
    /// The database file, resolved against `home` when unset.
    pub fn database_path(&self, home: &Path) -> PathBuf {
        if self.database.is_empty() {
            home.join(".tangospec").join("properties.db")
        } else {
            PathBuf::from(&self.database)
        }
    }

    /// Fold these settings into the device properties already stored,
    /// keeping the persisted child and variable lists.
    pub fn apply_to(&self, spec: &mut SpecConfig) {
        spec.spec = self.session.clone();
        spec.auto_discovery = self.auto_discovery;
        spec.output_buffer_max_length = self.output_buffer_max_length;
        spec.history_max_length = self.history_max_length;
    }
}

pub fn home_dir() -> PathBuf {
    PathBuf::from(
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Return the path to `~/.tangospec/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &Path) -> PathBuf {
    home.join(".tangospec").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `TANGOSPEC_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TANGOSPEC_DEVICE` | `device_name` |
/// | `TANGOSPEC_SESSION` | `session` |
/// | `TANGOSPEC_DATABASE` | `database` |
/// | `TANGOSPEC_AUTO_DISCOVERY` | `auto_discovery` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TANGOSPEC_DEVICE") {
        cfg.device_name = v;
    }
    if let Ok(v) = std::env::var("TANGOSPEC_SESSION") {
        cfg.session = v;
    }
    if let Ok(v) = std::env::var("TANGOSPEC_DATABASE") {
        cfg.database = v;
    }
    if let Ok(v) = std::env::var("TANGOSPEC_AUTO_DISCOVERY")
        && let Ok(flag) = v.parse::<bool>()
    {
        cfg.auto_discovery = flag;
    }
}

/// Save the config to disk, creating `~/.tangospec/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
