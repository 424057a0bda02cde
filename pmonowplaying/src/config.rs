//! # Configuration
//!
//! YAML configuration for the now playing bridge:
//! - an embedded default document (`pmonowplaying.yaml`)
//! - merged with an optional external `config.yaml`
//! - keys are case-insensitive (lower-cased on load)
//! - environment overrides `PMONOWPLAYING_CONFIG__SECTION__KEY=value`
//!
//! ## Usage
//!
//! ```no_run
//! use pmonowplaying::Config;
//!
//! let config = Config::load_config(None)?;
//! let gate = config.gate_config();
//! println!("listening on {}", gate.channel);
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{Result, anyhow};
use dirs::home_dir;
use serde_yaml::{Mapping, Number, Value};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, info, warn};

use crate::gate::{DEFAULT_CHANNEL, DEFAULT_SERVICE, DEFAULT_START_TIMEOUT_MS, GateConfig};
use crate::locks::lock;

const DEFAULT_CONFIG: &str = include_str!("pmonowplaying.yaml");

const ENV_CONFIG_FILE: &str = "PMONOWPLAYING_CONFIG";
const ENV_PREFIX: &str = "PMONOWPLAYING_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmonowplaying";
const CONFIG_FILE_NAME: &str = "config.yaml";

const DEFAULT_DROP_STALE_STATUS: bool = true;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";

/// Macro to generate getter/setter for string values with default
macro_rules! impl_string_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> String {
            match self.get_value($path) {
                Ok(Value::String(s)) if !s.trim().is_empty() => s,
                Ok(other) => {
                    if !other.is_null() {
                        warn!(path = %$path.join("."), "Expected a string, using default {}", $default);
                    }
                    $default.to_string()
                }
                Err(_) => $default.to_string(),
            }
        }

        pub fn $setter(&self, value: String) -> Result<()> {
            self.set_value($path, Value::String(value))
        }
    };
}

/// Macro to generate getter/setter for bool values with default
macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> bool {
            match self.get_value($path) {
                Ok(Value::Bool(b)) => b,
                Ok(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                    "true" | "yes" | "on" | "1" => true,
                    "false" | "no" | "off" | "0" => false,
                    _ => {
                        warn!(path = %$path.join("."), value = %s, "Invalid boolean, using default {}", $default);
                        $default
                    }
                },
                _ => $default,
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

/// Macro to generate getter/setter for u64 values with default
macro_rules! impl_u64_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> u64 {
            match self.get_value($path) {
                Ok(Value::Number(n)) if n.is_u64() => n.as_u64().unwrap_or($default),
                Ok(Value::String(s)) => s.trim().parse::<u64>().unwrap_or_else(|_| {
                    warn!(path = %$path.join("."), value = %s, "Invalid number, using default {}", $default);
                    $default
                }),
                Ok(Value::Null) | Err(_) => $default,
                Ok(_) => {
                    warn!(path = %$path.join("."), "Expected a positive integer, using default {}", $default);
                    $default
                }
            }
        }

        pub fn $setter(&self, value: u64) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

/// Configuration of the now playing bridge.
#[derive(Debug)]
pub struct Config {
    path: Option<PathBuf>,
    data: Mutex<Value>,
}

impl Config {
    /// Finds the configuration file to use
    ///
    /// 1. The provided `path`, even if it does not exist yet
    /// 2. The `PMONOWPLAYING_CONFIG` environment variable
    /// 3. `.pmonowplaying/config.yaml` in the current directory
    /// 4. `.pmonowplaying/config.yaml` in the user's home directory
    fn find_config_file(path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = path {
            return Some(path.to_path_buf());
        }

        if let Ok(env_path) = env::var(ENV_CONFIG_FILE) {
            info!(env_var = ENV_CONFIG_FILE, path = %env_path, "Trying to load config from env");
            return Some(PathBuf::from(env_path));
        }

        let local = Path::new(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }

        home_dir()
            .map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .filter(|candidate| candidate.exists())
    }

    /// Loads the configuration
    ///
    /// The embedded defaults are merged with the configuration file (when one
    /// is found and readable), then environment overrides are applied. A
    /// missing file is not an error: the defaults are used and [`Config::save`]
    /// will create it.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let path = Self::find_config_file(path);

        let external = match &path {
            Some(file) => match fs::read(file) {
                Ok(data) => {
                    info!(config_file = %file.display(), "Loaded config file");
                    Some(serde_yaml::from_slice::<Value>(&data)?)
                }
                Err(err) => {
                    info!(config_file = %file.display(), error = %err, "Config file not readable, using default embedded config");
                    None
                }
            },
            None => {
                debug!("No config file, using default embedded config");
                None
            }
        };

        Self::build(external, path, env::vars())
    }

    /// Builds a configuration from a YAML document merged over the defaults.
    ///
    /// Environment overrides are applied; no file is attached.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let external: Value = serde_yaml::from_str(yaml)?;
        Self::build(Some(external), None, env::vars())
    }

    fn build(
        external: Option<Value>,
        path: Option<PathBuf>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let mut value = normalize_keys(serde_yaml::from_str(DEFAULT_CONFIG)?);
        if let Some(external) = external.filter(|v| !v.is_null()) {
            if !external.is_mapping() {
                return Err(anyhow!("Configuration root must be a mapping"));
            }
            overlay(&mut value, normalize_keys(external));
        }
        Self::apply_env_overrides(&mut value, vars);

        Ok(Config {
            path,
            data: Mutex::new(value),
        })
    }

    fn data(&self) -> MutexGuard<'_, Value> {
        lock(&self.data)
    }

    /// Path of the attached configuration file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the current configuration to the attached file.
    ///
    /// Does nothing when no file is attached.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(&*self.data())?;
        fs::write(path, yaml)?;
        Ok(())
    }

    /// Sets a configuration value at the specified path and saves it
    ///
    /// * `path` - Array of keys (e.g., `&["gate", "service"]`)
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        insert_at(&mut self.data(), path, value)?;
        self.save()
    }

    /// Gets a configuration value at the specified path
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        lookup(&self.data(), path).cloned()
    }

    /// Applies `PMONOWPLAYING_CONFIG__SECTION__KEY=value` overrides.
    ///
    /// Values are read as YAML scalars (`false`, `250`), anything unparsable
    /// is kept as a plain string.
    fn apply_env_overrides(config: &mut Value, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, raw) in vars {
            let Some(section_path) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path: Vec<&str> = section_path.split("__").collect();
            let value = serde_yaml::from_str(&raw).unwrap_or(Value::String(raw));
            match insert_at(config, &path, value) {
                Ok(()) => debug!(env_var = %key, "Applied config override"),
                Err(err) => warn!(env_var = %key, error = %err, "Ignoring config override"),
            }
        }
    }

    impl_string_config!(
        get_channel_name,
        set_channel_name,
        &["gate", "channel"],
        DEFAULT_CHANNEL
    );

    impl_string_config!(
        get_service_name,
        set_service_name,
        &["gate", "service"],
        DEFAULT_SERVICE
    );

    impl_bool_config!(
        get_drop_stale_status,
        set_drop_stale_status,
        &["gate", "drop_stale_status"],
        DEFAULT_DROP_STALE_STATUS
    );

    impl_u64_config!(
        get_start_timeout_ms,
        set_start_timeout_ms,
        &["gate", "start_timeout_ms"],
        DEFAULT_START_TIMEOUT_MS
    );

    impl_string_config!(
        get_log_min_level,
        set_log_min_level,
        &["logger", "min_level"],
        DEFAULT_LOG_MIN_LEVEL
    );

    /// Typed view of the `gate` section.
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            channel: self.get_channel_name(),
            service: self.get_service_name(),
            drop_stale_status: self.get_drop_stale_status(),
            start_timeout_ms: self.get_start_timeout_ms(),
        }
    }
}

/// Keys are case-insensitive: every lookup and insert goes through here.
fn config_key(key: &str) -> Value {
    Value::String(key.to_lowercase())
}

fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(key, value)| {
                    let key = match key {
                        Value::String(name) => config_key(&name),
                        other => other,
                    };
                    (key, normalize_keys(value))
                })
                .collect(),
        ),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// Layers `layer` over `base`: mappings merge key by key, anything else replaces.
fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Mapping(base), Value::Mapping(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, layer) => *slot = layer,
    }
}

fn lookup<'a>(data: &'a Value, path: &[&str]) -> Result<&'a Value> {
    path.iter()
        .enumerate()
        .try_fold(data, |node, (depth, key)| match node {
            Value::Mapping(map) => map
                .get(&config_key(key))
                .ok_or_else(|| anyhow!("Path {} does not exist", path[..=depth].join("."))),
            _ => Err(anyhow!("Path {} is not a map", path[..depth].join("."))),
        })
}

/// Inserts `value` at `path`, creating the intermediate sections.
fn insert_at(data: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let Some((leaf, sections)) = path.split_last() else {
        *data = value;
        return Ok(());
    };

    let mut node = data;
    for (depth, section) in sections.iter().enumerate() {
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| anyhow!("Path {} is not a map", path[..depth].join(".")))?;
        node = map
            .entry(config_key(section))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
    node.as_mapping_mut()
        .ok_or_else(|| anyhow!("Path {} is not a map", sections.join(".")))?
        .insert(config_key(leaf), value);
    Ok(())
}
