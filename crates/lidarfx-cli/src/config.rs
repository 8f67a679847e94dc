//! Configuration Vault – reads/writes `~/.lidarfx/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lidarfx_perception::PipelineConfig;
use lidarfx_types::DetectorConfig;

/// Persisted node configuration stored in `~/.lidarfx/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Detector worker lanes; `0` picks one per core.
    #[serde(default)]
    pub num_threads: usize,

    /// Pull keypoints onto the local corner.
    #[serde(default)]
    pub refine: bool,

    #[serde(default = "default_true")]
    pub non_max_suppression: bool,

    /// Detector neighbourhood radius (metres).
    #[serde(default = "default_radius")]
    pub radius: f32,

    /// Minimum corner response.
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Vertical crop after levelling (metres).
    #[serde(default = "default_z")]
    pub z_min: f32,
    #[serde(default = "default_z")]
    pub z_max: f32,

    /// Orientation older than this marks a frame stale.
    #[serde(default = "default_max_orientation_age_ms")]
    pub max_orientation_age_ms: u64,

    /// Per-topic buffer of the output bus.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

fn default_true() -> bool {
    true
}
fn default_radius() -> f32 {
    1.0
}
fn default_threshold() -> f32 {
    0.1
}
fn default_z() -> f32 {
    2.0
}
fn default_max_orientation_age_ms() -> u64 {
    1000
}
fn default_bus_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_threads: 0,
            refine: false,
            non_max_suppression: default_true(),
            radius: default_radius(),
            threshold: default_threshold(),
            z_min: default_z(),
            z_max: default_z(),
            max_orientation_age_ms: default_max_orientation_age_ms(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl Config {
    /// Convert into a validated [`PipelineConfig`].
    pub fn to_pipeline_config(&self) -> Result<PipelineConfig, String> {
        if self.bus_capacity == 0 {
            return Err("bus_capacity must be at least 1".to_string());
        }
        let cfg = PipelineConfig {
            detector: DetectorConfig {
                num_threads: self.num_threads,
                refine: self.refine,
                non_max_suppression: self.non_max_suppression,
                radius: self.radius,
                threshold: self.threshold,
            },
            z_min: self.z_min,
            z_max: self.z_max,
            max_orientation_age: Duration::from_millis(self.max_orientation_age_ms),
        };
        cfg.validate().map_err(|e| e.to_string())?;
        Ok(cfg)
    }
}

/// Return the path to `~/.lidarfx/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".lidarfx").join("config.toml")
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `LIDARFX_*` environment variable overrides to `cfg`.  Values that
/// do not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `LIDARFX_THREADS` | `num_threads` |
/// | `LIDARFX_RADIUS` | `radius` |
/// | `LIDARFX_THRESHOLD` | `threshold` |
/// | `LIDARFX_Z_MIN` | `z_min` |
/// | `LIDARFX_Z_MAX` | `z_max` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(v) = env_parse::<usize>("LIDARFX_THREADS") {
        cfg.num_threads = v;
    }
    if let Some(v) = env_parse::<f32>("LIDARFX_RADIUS") {
        cfg.radius = v;
    }
    if let Some(v) = env_parse::<f32>("LIDARFX_THRESHOLD") {
        cfg.threshold = v;
    }
    if let Some(v) = env_parse::<f32>("LIDARFX_Z_MIN") {
        cfg.z_min = v;
    }
    if let Some(v) = env_parse::<f32>("LIDARFX_Z_MAX") {
        cfg.z_max = v;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
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

/// Load `path`, writing the defaults there first when it does not exist,
/// then apply environment overrides.  The flag reports whether the file was
/// created.
pub fn load_or_init(path: &Path) -> Result<(Config, bool), String> {
    let (mut cfg, created) = match load_from(path)? {
        Some(cfg) => (cfg, false),
        None => {
            let cfg = Config::default();
            save_to(&cfg, path)?;
            (cfg, true)
        }
    };
    apply_env_overrides(&mut cfg);
    Ok((cfg, created))
}
