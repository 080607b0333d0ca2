//! Reader and writer for an instance's `config.php`.
//!
//! Settings added by mdk live in a block delimited by [`BLOCK_START`] and
//! [`BLOCK_END`], placed just before the line that loads `lib/setup.php`.
//! Everything outside the block is left as the installer wrote it, except for
//! [`SiteConfig::remove`], which deletes the first assignment of a setting
//! wherever it is.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Error, Result};

pub const CONFIG_FILE: &str = "config.php";
pub const BLOCK_START: &str = "// MDK Edit.";
pub const BLOCK_END: &str = "// MDK Edit end.";

/// Names shadowed by derived instance metadata.
pub const RESERVED_KEYS: &[&str] = &[
    "branch",
    "identifier",
    "installed",
    "integration",
    "maturity",
    "path",
    "release",
    "stablebranch",
    "version",
];

/// A scalar value of a `$CFG->name = value;` assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl ConfigValue {
    /// The PHP literal for this value.
    pub fn to_php(&self) -> String {
        match self {
            ConfigValue::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            ConfigValue::Int(i) => i.to_string(),
            ConfigValue::Float(f) => f.to_string(),
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Null => "null".to_string(),
        }
    }

    /// Scalars map directly; arrays and objects are stored as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ConfigValue::Null,
            Value::Bool(b) => ConfigValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ConfigValue::Int(i),
                None => ConfigValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => ConfigValue::Str(s.clone()),
            other => ConfigValue::Str(other.to_string()),
        }
    }

    /// Parse a PHP literal, `None` for anything that is not a plain scalar.
    fn from_php(literal: &str) -> Option<Self> {
        let literal = literal.trim();
        if let Some(quote) = literal.chars().next().filter(|c| *c == '\'' || *c == '"') {
            let inner = literal.strip_prefix(quote)?.strip_suffix(quote)?;
            return Some(ConfigValue::Str(unescape(inner)));
        }
        match literal.to_ascii_lowercase().as_str() {
            "true" => return Some(ConfigValue::Bool(true)),
            "false" => return Some(ConfigValue::Bool(false)),
            "null" => return Some(ConfigValue::Null),
            _ => {}
        }
        if let Ok(i) = literal.parse::<i64>() {
            return Some(ConfigValue::Int(i));
        }
        if literal.contains('.') {
            if let Ok(f) = literal.parse::<f64>() {
                return Some(ConfigValue::Float(f));
            }
        }
        None
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Str(s) => f.write_str(s),
            ConfigValue::Null => f.write_str("null"),
            other => f.write_str(&other.to_php()),
        }
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('\\' | '\'' | '"')) => out.push(next),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// `$CFG->name = value;` split into name and literal.
fn parse_assignment(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start().strip_prefix("$CFG->")?;
    let (name, value) = rest.split_once('=')?;
    let name = name.trim();
    if !is_setting_name(name) {
        return None;
    }
    let value = value.trim_end();
    let value = value.strip_suffix(';')?;
    Some((name, value))
}

fn is_setting_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// An editable `config.php`.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    path: PathBuf,
    lines: Vec<String>,
}

impl SiteConfig {
    /// Load `config.php` from a code directory; `None` when not installed.
    pub fn read(code_dir: &Path) -> Result<Option<Self>> {
        let path = code_dir.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(Self::parse(path, &content)))
    }

    pub fn parse(path: PathBuf, content: &str) -> Self {
        Self {
            path,
            lines: content.lines().map(str::to_string).collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every scalar assignment; later assignments win.
    pub fn values(&self) -> BTreeMap<String, ConfigValue> {
        self.lines
            .iter()
            .filter_map(|line| parse_assignment(line))
            .filter_map(|(name, literal)| {
                ConfigValue::from_php(literal).map(|value| (name.to_string(), value))
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<ConfigValue> {
        self.values().remove(name)
    }

    pub fn add(&mut self, name: &str, value: &ConfigValue) -> Result<()> {
        if RESERVED_KEYS.contains(&name) {
            return Err(Error::ReservedSetting {
                name: name.to_string(),
            });
        }
        if !is_setting_name(name) {
            return Err(Error::Config {
                message: format!("invalid setting name '{}'", name),
            });
        }
        let line = format!("$CFG->{} = {};", name, value.to_php());

        let start = self.lines.iter().position(|l| l.trim() == BLOCK_START);
        let end = self.lines.iter().position(|l| l.trim() == BLOCK_END);
        match (start, end) {
            (Some(start), Some(end)) if end > start => self.lines.insert(end, line),
            (Some(start), _) => self.lines.insert(start + 1, line),
            _ => {
                let at = self
                    .lines
                    .iter()
                    .position(|l| l.contains("require_once") && l.contains("lib/setup.php"))
                    .unwrap_or(self.lines.len());
                let block = [BLOCK_START.to_string(), line, BLOCK_END.to_string(), String::new()];
                self.lines.splice(at..at, block);
            }
        }
        Ok(())
    }

    /// Delete the first assignment of `name`. Returns whether one was found.
    pub fn remove(&mut self, name: &str) -> bool {
        let found = self
            .lines
            .iter()
            .position(|line| parse_assignment(line).is_some_and(|(n, _)| n == name));
        match found {
            Some(index) => {
                self.lines.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn update(&mut self, name: &str, value: &ConfigValue) -> Result<()> {
        self.remove(name);
        self.add(name, value)
    }

    pub fn render(&self) -> String {
        let mut content = self.lines.join("\n");
        content.push('\n');
        content
    }

    pub fn write(&self) -> Result<()> {
        fs::write(&self.path, self.render())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::installed_site_config;
    use tempfile::TempDir;

    fn sample() -> SiteConfig {
        SiteConfig::parse(
            PathBuf::from("config.php"),
            &installed_site_config("stablemain", Path::new("/data/stable_main")),
        )
    }

    #[test]
    fn test_values() {
        let values = sample().values();
        assert_eq!(values["dbtype"], ConfigValue::Str("pgsql".to_string()));
        assert_eq!(values["directorypermissions"], ConfigValue::Int(777));
        assert_eq!(
            values["dataroot"],
            ConfigValue::Str("/data/stable_main".to_string())
        );
    }

    #[test]
    fn test_from_php_literals() {
        assert_eq!(
            ConfigValue::from_php(r"'it\'s'"),
            Some(ConfigValue::Str("it's".to_string()))
        );
        assert_eq!(ConfigValue::from_php("TRUE"), Some(ConfigValue::Bool(true)));
        assert_eq!(ConfigValue::from_php("1.5"), Some(ConfigValue::Float(1.5)));
        assert_eq!(ConfigValue::from_php("null"), Some(ConfigValue::Null));
        assert_eq!(ConfigValue::from_php("array()"), None);
        assert_eq!(ConfigValue::from_php("new stdClass()"), None);
    }

    #[test]
    fn test_to_php_escapes() {
        assert_eq!(
            ConfigValue::Str(r"a'b\c".to_string()).to_php(),
            r"'a\'b\\c'"
        );
        assert_eq!(ConfigValue::Bool(false).to_php(), "false");
        assert_eq!(ConfigValue::from_json(&serde_json::json!(3)), ConfigValue::Int(3));
    }

    #[test]
    fn test_add_creates_block_before_setup() {
        let mut config = sample();
        config.add("debug", &ConfigValue::Int(32767)).unwrap();
        config
            .add("sessioncookiepath", &ConfigValue::Str("/stable_main/".to_string()))
            .unwrap();

        let rendered = config.render();
        let block = rendered.find(BLOCK_START).unwrap();
        let setup = rendered.find("require_once").unwrap();
        assert!(block < setup);
        assert_eq!(rendered.matches(BLOCK_START).count(), 1);
        let debug = rendered.find("$CFG->debug = 32767;").unwrap();
        let cookie = rendered.find("$CFG->sessioncookiepath").unwrap();
        let end = rendered.find(BLOCK_END).unwrap();
        assert!(block < debug && debug < cookie && cookie < end);
    }

    #[test]
    fn test_add_without_setup_line_appends() {
        let mut config = SiteConfig::parse(PathBuf::from("c.php"), "<?php\n$CFG->a = 1;");
        config.add("b", &ConfigValue::Bool(true)).unwrap();
        assert!(config.render().ends_with("$CFG->b = true;\n// MDK Edit end.\n\n"));
    }

    #[test]
    fn test_add_rejects_reserved_and_invalid_names() {
        let mut config = sample();
        assert!(matches!(
            config.add("version", &ConfigValue::Int(1)),
            Err(Error::ReservedSetting { .. })
        ));
        assert!(matches!(
            config.add("a;b", &ConfigValue::Int(1)),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_update_and_remove_are_idempotent() {
        let mut config = sample();
        config.update("debug", &ConfigValue::Int(1)).unwrap();
        let once = config.render();
        config.update("debug", &ConfigValue::Int(1)).unwrap();
        assert_eq!(config.render(), once);
        assert_eq!(config.get("debug"), Some(ConfigValue::Int(1)));

        assert!(config.remove("debug"));
        assert!(!config.remove("debug"));
        assert_eq!(config.get("debug"), None);
    }

    #[test]
    fn test_read_and_write() {
        let temp = TempDir::new().unwrap();
        assert!(SiteConfig::read(temp.path()).unwrap().is_none());

        fs::write(
            temp.path().join(CONFIG_FILE),
            installed_site_config("db", temp.path()),
        )
        .unwrap();
        let mut config = SiteConfig::read(temp.path()).unwrap().unwrap();
        config.add("theme", &ConfigValue::Str("boost".to_string())).unwrap();
        config.write().unwrap();

        let reread = SiteConfig::read(temp.path()).unwrap().unwrap();
        assert_eq!(reread.get("theme"), Some(ConfigValue::Str("boost".to_string())));
    }
}
