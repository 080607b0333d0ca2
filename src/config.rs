//! # Layered Configuration
//!
//! mdk settings are JSON documents stacked in layers, lowest priority first:
//!
//! 1. the distribution defaults embedded in the binary (`config-dist.json`)
//! 2. the system file `/etc/moodle-sdk/config.json`
//! 3. the user file, `~/.moodle-sdk/config.json` by default
//!
//! Layers are deep-merged into one view: objects merge key by key, every other
//! value (scalars and arrays) replaces what lower layers had. Lines whose first
//! non-blank characters are `//` are dropped before parsing, so the files can
//! carry comments.
//!
//! Keys are dotted paths (`db.pgsql.user`). Writes go through [`Config::set`]
//! and [`Config::remove`], which persist to the user file only the settings
//! that differ from what the lower layers already provide.
//!
//! ```
//! use mdk::config::Config;
//! use serde_json::json;
//!
//! let mut config = Config::from_value(json!({"db": {"pgsql": {"user": "postgres"}}}));
//! assert_eq!(config.get_str("db.pgsql.user"), Some("postgres"));
//!
//! config.set("db.pgsql.user", json!("moodle")).unwrap();
//! assert_eq!(config.get_str("db.pgsql.user"), Some("moodle"));
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::defaults;
use crate::error::{Error, Result};

/// The distribution defaults shipped with the binary.
pub const DIST_CONFIG: &str = include_str!("config-dist.json");

/// System-wide configuration file.
pub const SYSTEM_CONFIG_FILE: &str = "/etc/moodle-sdk/config.json";

#[derive(Debug, Clone)]
struct Layer {
    /// `None` for the embedded defaults.
    path: Option<PathBuf>,
    data: Value,
}

/// Layered, persisted settings.
#[derive(Debug, Clone)]
pub struct Config {
    layers: Vec<Layer>,
    merged: Value,
    /// Index into `layers` of the writable user layer.
    user: Option<usize>,
}

impl Config {
    /// Load the standard layers. `user_file` overrides the default user file location.
    pub fn load(user_file: Option<&Path>) -> Result<Self> {
        let user_file = user_file
            .map(Path::to_path_buf)
            .unwrap_or_else(defaults::default_user_config_file);
        Self::from_sources(DIST_CONFIG, &[PathBuf::from(SYSTEM_CONFIG_FILE)], user_file)
    }

    /// Build a configuration from explicit sources.
    ///
    /// Missing files are treated as empty layers. The user file is always the
    /// highest priority layer and the only one that is ever written.
    pub fn from_sources(dist: &str, files: &[PathBuf], user_file: PathBuf) -> Result<Self> {
        let mut layers = vec![Layer {
            path: None,
            data: parse_commented_json(dist, "config-dist.json")?,
        }];
        for path in files.iter().chain(std::iter::once(&user_file)) {
            let data = read_layer(path)?;
            layers.push(Layer {
                path: Some(path.clone()),
                data,
            });
        }
        let user = Some(layers.len() - 1);
        let mut config = Self {
            layers,
            merged: Value::Null,
            user,
        };
        config.remerge();
        Ok(config)
    }

    /// An in-memory configuration with a single layer and no backing file.
    pub fn from_value(value: Value) -> Self {
        let mut config = Self {
            layers: vec![Layer {
                path: None,
                data: value,
            }],
            merged: Value::Null,
            user: None,
        };
        config.remerge();
        config
    }

    /// The user file this configuration writes to, if any.
    pub fn user_file(&self) -> Option<&Path> {
        self.user
            .and_then(|idx| self.layers[idx].path.as_deref())
    }

    /// Look up a dotted key in the merged view.
    pub fn get(&self, key: &str) -> Option<&Value> {
        lookup(&self.merged, key)
    }

    /// The whole merged document.
    pub fn all(&self) -> &Value {
        &self.merged
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// A required, non-empty string setting.
    pub fn get_string(&self, key: &str) -> Result<String> {
        match self.get_str(key) {
            Some(s) if !s.is_empty() => Ok(s.to_string()),
            _ => Err(Error::ConfigKeyMissing {
                key: key.to_string(),
            }),
        }
    }

    /// Integer setting; numeric strings are accepted too.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_u64().map(|n| n != 0),
            Value::String(s) => match s.as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// A path setting with a leading `~` expanded to the home directory.
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get_str(key)
            .filter(|s| !s.is_empty())
            .map(defaults::expand_home)
    }

    /// Every leaf setting keyed by its dotted path.
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut flat = BTreeMap::new();
        flatten_into(&self.merged, "", &mut flat);
        flat
    }

    /// Settings of the distribution defaults that the merged view has lost,
    /// which happens when a higher layer replaces an object by a scalar.
    pub fn missing_dist_settings(&self) -> Result<Vec<String>> {
        let dist = parse_commented_json(DIST_CONFIG, "config-dist.json")?;
        Ok(missing_settings(&dist, &self.merged))
    }

    /// Set a value and persist the user layer.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let slot = navigate_json_value(&mut self.merged, key)?;
        *slot = value;
        self.save()
    }

    /// Remove a value from the user layer and persist it.
    ///
    /// Lower layers are untouched, so a distribution default reappears.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        if let Some(idx) = self.user {
            remove_key(&mut self.layers[idx].data, key);
        } else if let Some(layer) = self.layers.last_mut() {
            remove_key(&mut layer.data, key);
        }
        self.remerge();
        self.write_user_layer()
    }

    /// Write to the user file every setting whose merged value differs from
    /// what the lower layers define, or which no layer defines.
    pub fn save(&mut self) -> Result<()> {
        let Some(user_idx) = self.user else {
            // No backing file: the merged view is the only state.
            if let Some(layer) = self.layers.last_mut() {
                layer.data = self.merged.clone();
            }
            return Ok(());
        };

        for (key, value) in self.flatten() {
            let mut found = false;
            let mut different = false;
            for layer in self.layers.iter().rev() {
                match lookup(&layer.data, &key) {
                    Some(existing) if !found && existing != &value => {
                        different = true;
                        break;
                    }
                    Some(existing) if existing == &value => found = true,
                    _ => {}
                }
            }
            if different || !found {
                let slot = navigate_json_value(&mut self.layers[user_idx].data, &key)?;
                *slot = value;
            }
        }

        self.remerge();
        self.write_user_layer()
    }

    fn write_user_layer(&self) -> Result<()> {
        let Some(idx) = self.user else {
            return Ok(());
        };
        let layer = &self.layers[idx];
        let Some(path) = layer.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        serde::Serialize::serialize(&layer.data, &mut serializer)?;
        out.push(b'\n');

        fs::write(path, out).map_err(|e| Error::Config {
            message: format!("could not save to config file {}: {}", path.display(), e),
        })?;
        log::debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    fn remerge(&mut self) {
        let mut merged = Value::Object(Map::new());
        for layer in &self.layers {
            merge_json_values(&mut merged, &layer.data);
        }
        self.merged = merged;
    }
}

fn read_layer(path: &Path) -> Result<Value> {
    if !path.is_file() {
        return Ok(Value::Object(Map::new()));
    }
    let content = fs::read_to_string(path).map_err(|e| Error::Config {
        message: format!("could not read config file {}: {}", path.display(), e),
    })?;
    parse_commented_json(&content, &path.display().to_string())
}

/// Parse JSON after dropping `//` comment lines. Blank documents are empty objects.
pub fn parse_commented_json(content: &str, origin: &str) -> Result<Value> {
    let stripped: String = content
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n");

    if stripped.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    serde_json::from_str(&stripped).map_err(|e| Error::Config {
        message: format!(
            "could not load config file {}: {}\n  hint: check the JSON syntax near line {}",
            origin,
            e,
            e.line()
        ),
    })
}

/// Dotted keys of `reference` that `actual` does not define.
///
/// Objects are compared key by key; an object in `reference` facing a scalar
/// in `actual` counts as missing as a whole.
pub fn missing_settings(reference: &Value, actual: &Value) -> Vec<String> {
    let mut missing = Vec::new();
    collect_missing(reference, actual, "", &mut missing);
    missing
}

fn collect_missing(reference: &Value, actual: &Value, parent: &str, out: &mut Vec<String>) {
    let Value::Object(reference) = reference else {
        return;
    };
    for (key, expected) in reference {
        let path = if parent.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", parent, key)
        };
        match actual.as_object().and_then(|map| map.get(key)) {
            None => out.push(path),
            Some(found) if expected.is_object() && !found.is_object() => out.push(path),
            Some(found) => collect_missing(expected, found, &path, out),
        }
    }
}

fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in key.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Navigate to a dotted key, creating intermediate objects as needed.
///
/// Fails when a segment would have to descend into a non-object value.
fn navigate_json_value<'a>(value: &'a mut Value, key: &str) -> Result<&'a mut Value> {
    let mut current = value;
    for segment in key.split('.') {
        if segment.is_empty() {
            return Err(Error::Config {
                message: format!("invalid setting name '{}'", key),
            });
        }
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(Error::Config {
                message: format!("cannot set '{}': '{}' is not an object", key, segment),
            });
        };
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    Ok(current)
}

fn remove_key(value: &mut Value, key: &str) {
    let (parent, leaf) = match key.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, key),
    };
    let mut current = value;
    if let Some(parent) = parent {
        for segment in parent.split('.') {
            match current.as_object_mut().and_then(|m| m.get_mut(segment)) {
                Some(next) => current = next,
                None => return,
            }
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(leaf);
    }
}

/// Recursively merge `source` into `target`: objects merge key by key,
/// anything else replaces the target.
fn merge_json_values(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, source_value) in source_map {
                match target_map.get_mut(key) {
                    Some(target_value) if target_value.is_object() && source_value.is_object() => {
                        merge_json_values(target_value, source_value);
                    }
                    _ => {
                        target_map.insert(key.clone(), source_value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}

fn flatten_into(value: &Value, parent: &str, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if parent.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", parent, key)
                };
                match child {
                    Value::Object(inner) if !inner.is_empty() => flatten_into(child, &path, out),
                    _ => {
                        out.insert(path, child.clone());
                    }
                }
            }
        }
        other if !parent.is_empty() => {
            out.insert(parent.to_string(), other.clone());
        }
        _ => {}
    }
}
