//! Configuration persistence.
//!
//! Profiles are stored as pretty JSON. Loading is lenient field by field:
//! anything missing, mistyped or out of range is replaced by its default, so
//! a damaged config file never prevents a run.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

use crate::checksums::ChecksumAlgorithm;
use crate::error::EngineError;
use crate::fs_ops::ensure_parent_dir_exists;
use crate::model::{
    default_rules, BackupMode, ConflictStrategy, MirrorDeleteScope, PerformanceOptions, Profile, Rule,
    SymlinkMode, MISC_FOLDER,
};

/// Current on-disk format version.
pub const CONFIG_VERSION: u32 = 1;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Every saved profile plus the one selected by default.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppConfig {
    pub version: u32,
    pub active_profile_id: String,
    pub profiles: Vec<Profile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let profile = Profile::default();
        AppConfig {
            version: CONFIG_VERSION,
            active_profile_id: profile.id.clone(),
            profiles: vec![profile],
        }
    }
}

impl AppConfig {
    pub fn from_value(value: &Value) -> Self {
        let mut cfg = AppConfig {
            version: get_u64(value, "version")
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(CONFIG_VERSION),
            active_profile_id: get_str(value, "active_profile_id").unwrap_or_default(),
            profiles: value
                .get("profiles")
                .and_then(Value::as_array)
                .map(|list| list.iter().filter(|p| p.is_object()).map(Profile::from_value).collect())
                .unwrap_or_default(),
        };
        cfg.normalize();
        cfg
    }

    /// Guarantee at least one profile and a valid active id.
    pub fn normalize(&mut self) {
        if self.profiles.is_empty() {
            self.profiles.push(Profile::default());
        }
        if !self.profiles.iter().any(|p| p.id == self.active_profile_id) {
            self.active_profile_id = self.profiles[0].id.clone();
        }
    }

    pub fn active_profile(&self) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == self.active_profile_id)
    }

    /// Look a profile up by id, then by case-insensitive name.
    pub fn find_profile(&self, key: &str) -> Option<&Profile> {
        self.profiles
            .iter()
            .find(|p| p.id == key)
            .or_else(|| self.profiles.iter().find(|p| p.name.eq_ignore_ascii_case(key)))
    }

    pub fn profile_mut(&mut self, id: &str) -> Option<&mut Profile> {
        self.profiles.iter_mut().find(|p| p.id == id)
    }
}

impl Profile {
    pub fn from_value(value: &Value) -> Self {
        let defaults = Profile::default();

        let mut rules: Vec<Rule> = value
            .get("rules")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter(|r| r.is_object()).map(Rule::from_value).collect())
            .unwrap_or_default();
        if rules.is_empty() {
            rules = default_rules();
        }

        Profile {
            id: get_str(value, "id")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.id),
            name: get_str(value, "name")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.name),
            mode: get_enum(value, "mode", BackupMode::from_name).unwrap_or(defaults.mode),
            conflict: get_enum(value, "conflict", ConflictStrategy::from_name).unwrap_or(defaults.conflict),
            symlinks: get_enum(value, "symlinks", |_| None::<SymlinkMode>).unwrap_or(defaults.symlinks),
            preserve_metadata: get_bool(value, "preserve_metadata").unwrap_or(defaults.preserve_metadata),
            verify_copies: get_bool(value, "verify_copies").unwrap_or(defaults.verify_copies),
            hash_algorithm: get_enum(value, "hash_algorithm", ChecksumAlgorithm::from_name)
                .unwrap_or(defaults.hash_algorithm),
            mirror_delete_scope: get_enum(value, "mirror_delete_scope", |_| None::<MirrorDeleteScope>)
                .unwrap_or(defaults.mirror_delete_scope),
            mirror_scope_subdir: get_str(value, "mirror_scope_subdir")
                .map(|s| s.trim().to_string())
                .unwrap_or(defaults.mirror_scope_subdir),
            mirror_delete_ext_whitelist: get_str_list(value, "mirror_delete_ext_whitelist")
                .map(normalize_extensions)
                .unwrap_or_default(),
            rules,
            perf: value
                .get("perf")
                .map(PerformanceOptions::from_value)
                .unwrap_or(defaults.perf),
            last_run_utc: get_f64(value, "last_run_utc")
                .filter(|t| t.is_finite() && *t >= 0.0)
                .unwrap_or(0.0),
        }
    }
}

impl Rule {
    pub fn from_value(value: &Value) -> Self {
        let defaults = Rule::default();

        // Sizes are bytes; older configs stored whole megabytes.
        let size = |bytes_key: &str, mb_key: &str| {
            get_u64(value, bytes_key)
                .or_else(|| get_u64(value, mb_key).map(|mb| mb.saturating_mul(BYTES_PER_MB)))
                .unwrap_or(0)
        };

        Rule {
            enabled: get_bool(value, "enabled").unwrap_or(defaults.enabled),
            name: get_str(value, "name")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.name),
            target_folder: get_str(value, "target_folder")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| MISC_FOLDER.to_string()),
            extensions: get_str_list(value, "extensions")
                .map(normalize_extensions)
                .unwrap_or_default(),
            mime_prefixes: get_str_list(value, "mime_prefixes")
                .map(|list| {
                    list.into_iter()
                        .map(|m| m.trim().to_lowercase())
                        .filter(|m| !m.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            name_regex: get_str(value, "name_regex").unwrap_or_default(),
            path_contains: get_str(value, "path_contains").unwrap_or_default(),
            min_size: size("min_size", "size_min_mb"),
            max_size: size("max_size", "size_max_mb"),
        }
    }
}

impl PerformanceOptions {
    pub fn from_value(value: &Value) -> Self {
        let defaults = PerformanceOptions::default();
        let field = |key: &str, default: usize| {
            get_u64(value, key)
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(default)
        };
        PerformanceOptions {
            hash_threads: field("hash_threads", defaults.hash_threads),
            copy_threads: field("copy_threads", defaults.copy_threads),
            hash_chunk_mb: field("hash_chunk_mb", defaults.hash_chunk_mb),
        }
        .clamped()
    }
}

macro_rules! lenient_deserialize {
    ($($ty:ty),*) => {
        $(
            impl<'de> Deserialize<'de> for $ty {
                fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                    let value = Value::deserialize(deserializer)?;
                    Ok(<$ty>::from_value(&value))
                }
            }
        )*
    };
}

lenient_deserialize!(AppConfig, Profile, Rule, PerformanceOptions);

fn get_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_bool(value: &Value, key: &str) -> Option<bool> {
    value.get(key).and_then(Value::as_bool)
}

/// Non-negative integer; integral floats and numeric strings are accepted.
fn get_u64(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_str_list(value: &Value, key: &str) -> Option<Vec<String>> {
    value.get(key).and_then(Value::as_array).map(|list| {
        list.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

/// Serialized enum name first, then the looser aliases `from_name` accepts.
fn get_enum<T, F>(value: &Value, key: &str, from_name: F) -> Option<T>
where
    T: for<'a> Deserialize<'a>,
    F: Fn(&str) -> Option<T>,
{
    let raw = value.get(key)?;
    serde_json::from_value(raw.clone())
        .ok()
        .or_else(|| raw.as_str().and_then(|s| from_name(s)))
}

fn normalize_extensions(list: Vec<String>) -> Vec<String> {
    list.into_iter()
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

/// Read a config file. Never fails: an unreadable or malformed file yields
/// the default config.
pub fn load_config(path: &Path) -> AppConfig {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            debug!("No config at {}: {}", path.display(), e);
            return AppConfig::default();
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => AppConfig::from_value(&value),
        Err(e) => {
            warn!("Ignoring malformed config {}: {}", path.display(), e);
            AppConfig::default()
        }
    }
}

/// Write a config file through a temporary sibling and a rename.
pub fn save_config(path: &Path, cfg: &AppConfig) -> Result<(), EngineError> {
    let json = serde_json::to_string_pretty(cfg)?;
    ensure_parent_dir_exists(path)?;

    let tmp = path.with_extension("json.tmp");
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        EngineError::WriteError {
            path: path.to_path_buf(),
            source: e,
        }
    })
}
