//! Configuration loading and pin-path resolution.
//!
//! The CLI reads an optional `config.toml` from `~/.config/bpflink/`.
//! Every key has a default, so a missing file is the same as an empty one.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Pinning filesystem settings.
    #[serde(default)]
    pub bpffs: BpffsConfig,

    /// Iterator stream settings.
    #[serde(default)]
    pub iter: IterConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Pinning filesystem settings.
#[derive(Debug, Deserialize)]
pub struct BpffsConfig {
    /// Mount point of the BPF filesystem.
    #[serde(default = "default_bpffs_root")]
    pub root: PathBuf,

    /// Reject pin paths that resolve outside `root`.
    #[serde(default = "default_confine")]
    pub confine: bool,
}

impl Default for BpffsConfig {
    fn default() -> Self {
        Self {
            root: default_bpffs_root(),
            confine: default_confine(),
        }
    }
}

/// Iterator stream settings.
#[derive(Debug, Deserialize)]
pub struct IterConfig {
    /// Buffer size used when copying a stream out.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for IterConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for JSON log files. Console only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

// Default value functions for serde

fn default_bpffs_root() -> PathBuf {
    PathBuf::from("/sys/fs/bpf")
}
fn default_confine() -> bool {
    true
}
fn default_read_buffer_size() -> usize {
    4096
}
fn default_log_level() -> String {
    "info".to_owned()
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    if config.iter.read_buffer_size == 0 {
        anyhow::bail!(
            "invalid config at {}: iter.read_buffer_size must be positive",
            path.display()
        );
    }
    Ok(config)
}

/// Resolve the default config directory (`~/.config/bpflink/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let dirs = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(dirs.config_dir().join("bpflink"))
}

/// Load `config.toml` from [`config_dir`], or defaults if it does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_default_config() -> anyhow::Result<Config> {
    let path = config_dir()?.join("config.toml");
    if !path.exists() {
        return Ok(Config::default());
    }
    load_config(&path)
}

/// Resolve a pin path against the bpffs root.
///
/// Relative paths are joined onto `root`. The result is normalized without
/// touching the filesystem and must stay under `root`.
///
/// # Errors
///
/// Returns an error when the path escapes `root`.
pub fn resolve_pin_path(root: &Path, requested: &Path) -> anyhow::Result<PathBuf> {
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };

    let normalized = normalize_path(&joined);
    let root_normalized = normalize_path(root);
    if !normalized.starts_with(&root_normalized) || normalized == root_normalized {
        anyhow::bail!(
            "pin path '{}' is not inside bpffs root '{}'",
            requested.display(),
            root.display()
        );
    }
    Ok(normalized)
}

/// Resolve `.` and `..` components lexically.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}
