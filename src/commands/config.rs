//! # Config Command Implementation
//!
//! Reads and writes the layered mdk settings. Changes land in the user file
//! only, and only for values differing from the lower layers.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::Value;

use mdk::suggestions;

use super::Context;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the merged settings as JSON
    List,
    /// Print every setting as `key: value`, one per line
    Flatlist,
    /// Print one setting
    Show {
        /// Dotted setting name, e.g. `db.mysqli.user`
        key: String,
    },
    /// Change a setting; JSON values are parsed, anything else is a string
    Set { key: String, value: String },
    /// Remove a setting from the user file
    Remove { key: String },
}

/// Execute the `config` command.
pub fn execute(args: ConfigArgs, ctx: &Context) -> Result<()> {
    let output = &ctx.output;
    match args.action {
        ConfigAction::List => {
            println!("{}", serde_json::to_string_pretty(ctx.config.all())?);
        }
        ConfigAction::Flatlist => {
            for (key, value) in ctx.config.flatten() {
                println!("{}", output.key_value(&key, &display(&value)));
            }
        }
        ConfigAction::Show { key } => {
            let Some(value) = ctx.config.get(&key) else {
                let known: Vec<String> = ctx.config.flatten().into_keys().collect();
                return Err(suggestions::unknown_setting(&key, &known));
            };
            if value.is_object() || value.is_array() {
                println!("{}", serde_json::to_string_pretty(value)?);
            } else {
                println!("{}", display(value));
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = ctx.config.clone();
            config.set(&key, parse_value(&value))?;
            log::info!("Set {} to {}", key, value);
        }
        ConfigAction::Remove { key } => {
            let mut config = ctx.config.clone();
            config.remove(&key)?;
            log::info!("Removed {}", key);
        }
    }
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
