//! Database servers backing the instances.
//!
//! Databases are managed through the engines' own command-line clients
//! (`mysql`, `psql`), executed through a [`Runner`], so no native driver is
//! linked in.

use std::fmt;
use std::str::FromStr;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::process::{CommandSpec, HostRunner, Runner};

/// Supported database engines, named as in the product's `dbtype` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    MySqli,
    MariaDb,
    PgSql,
}

impl Engine {
    pub const ALL: [Engine; 3] = [Engine::MySqli, Engine::MariaDb, Engine::PgSql];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::MySqli => "mysqli",
            Engine::MariaDb => "mariadb",
            Engine::PgSql => "pgsql",
        }
    }

    /// Human readable name, used in default site names.
    pub fn wording(&self) -> &'static str {
        match self {
            Engine::MySqli => "MySQL",
            Engine::MariaDb => "MariaDB",
            Engine::PgSql => "PostgreSQL",
        }
    }

    fn is_mysql_family(&self) -> bool {
        matches!(self, Engine::MySqli | Engine::MariaDb)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Engine::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Database {
                message: format!(
                    "unsupported engine '{}', expected one of: mysqli, mariadb, pgsql",
                    s
                ),
            })
    }
}

/// Connection settings for one engine, read from `db.<engine>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseProfile {
    pub engine: Engine,
    pub host: String,
    pub port: Option<String>,
    pub user: String,
    pub passwd: String,
    /// Name of a Docker container running the server, when not reachable from the host.
    pub container: Option<String>,
}

impl DatabaseProfile {
    pub fn from_config(config: &Config, engine: Engine) -> Result<Self> {
        let key = |name: &str| format!("db.{}.{}", engine, name);
        let port = match config.get(&key("port")) {
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        };
        Ok(Self {
            engine,
            host: config
                .get_str(&key("host"))
                .unwrap_or("localhost")
                .to_string(),
            port,
            user: config.get_string(&key("user"))?,
            passwd: config.get_str(&key("passwd")).unwrap_or("").to_string(),
            container: config
                .get_str(&key("dockername"))
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }
}

/// Operations mdk needs from a database server.
pub trait DatabaseServer {
    fn exists(&self, name: &str) -> Result<bool>;
    fn create(&self, name: &str) -> Result<()>;
    fn drop_database(&self, name: &str) -> Result<()>;
}

/// A server driven through its command-line client.
pub struct CliDatabase {
    profile: DatabaseProfile,
    runner: Box<dyn Runner>,
}

impl CliDatabase {
    pub fn new(profile: DatabaseProfile) -> Self {
        Self::with_runner(profile, Box::new(HostRunner::new()))
    }

    pub fn with_runner(profile: DatabaseProfile, runner: Box<dyn Runner>) -> Self {
        Self { profile, runner }
    }

    pub fn engine(&self) -> Engine {
        self.profile.engine
    }

    /// The client invocation that executes `sql`.
    fn command(&self, sql: &str) -> CommandSpec {
        let profile = &self.profile;
        let client = if profile.engine.is_mysql_family() {
            let mut spec = CommandSpec::new("mysql");
            if profile.container.is_none() {
                spec = spec.arg("-h").arg(&profile.host);
                if let Some(port) = &profile.port {
                    spec = spec.arg("-P").arg(port);
                }
            }
            spec = spec.arg("-u").arg(&profile.user);
            if !profile.passwd.is_empty() {
                spec = spec.arg(format!("-p{}", profile.passwd));
            }
            spec.args(["-N", "-B", "-e", sql])
        } else {
            let mut spec = CommandSpec::new("psql");
            if profile.container.is_none() {
                spec = spec.arg("-h").arg(&profile.host);
                if let Some(port) = &profile.port {
                    spec = spec.arg("-p").arg(port);
                }
            }
            spec.arg("-U")
                .arg(&profile.user)
                .args(["-d", "postgres", "-t", "-A", "-c", sql])
                .env("PGPASSWORD", &profile.passwd)
        };

        match &profile.container {
            Some(container) => {
                let mut spec = CommandSpec::new("docker").args(["exec", "-i"]);
                for (key, value) in &client.env {
                    spec = spec.arg("-e").arg(format!("{}={}", key, value));
                }
                spec.arg(container)
                    .arg(client.program)
                    .args(client.args)
            }
            None => client,
        }
    }

    fn execute(&self, sql: &str) -> Result<String> {
        log::debug!("{}", sql);
        let spec = self.command(sql);
        let output = self.runner.exec(&spec)?;
        if !output.success() {
            return Err(Error::Database {
                message: format!(
                    "{} failed: {}",
                    self.profile.engine.wording(),
                    output.stderr.trim()
                ),
            });
        }
        Ok(output.stdout)
    }
}

impl DatabaseServer for CliDatabase {
    fn exists(&self, name: &str) -> Result<bool> {
        validate_identifier(name)?;
        let sql = if self.profile.engine.is_mysql_family() {
            format!(
                "SELECT 1 FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = '{}'",
                name
            )
        } else {
            format!("SELECT 1 FROM pg_database WHERE datname = '{}'", name)
        };
        Ok(self.execute(&sql)?.trim() == "1")
    }

    fn create(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        let sql = if self.profile.engine.is_mysql_family() {
            format!(
                "CREATE DATABASE `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
                name
            )
        } else {
            format!("CREATE DATABASE \"{}\" WITH ENCODING 'UNICODE'", name)
        };
        self.execute(&sql).map(|_| ())
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        let sql = if self.profile.engine.is_mysql_family() {
            format!("DROP DATABASE `{}`", name)
        } else {
            format!("DROP DATABASE IF EXISTS \"{}\"", name)
        };
        self.execute(&sql).map(|_| ())
    }
}

/// Database names are interpolated into SQL, so only `[A-Za-z0-9_]+` is accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Database {
            message: format!("invalid database name '{}'", name),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRunner;
    use serde_json::json;

    fn profile(engine: Engine) -> DatabaseProfile {
        DatabaseProfile {
            engine,
            host: "db.local".to_string(),
            port: Some("5432".to_string()),
            user: "postgres".to_string(),
            passwd: "secret".to_string(),
            container: None,
        }
    }

    #[test]
    fn test_engine_from_str() {
        assert_eq!("pgsql".parse::<Engine>().unwrap(), Engine::PgSql);
        assert_eq!("MariaDB".parse::<Engine>().unwrap(), Engine::MariaDb);
        assert!("oci".parse::<Engine>().is_err());
        assert_eq!(Engine::MySqli.to_string(), "mysqli");
        assert_eq!(Engine::PgSql.wording(), "PostgreSQL");
    }

    #[test]
    fn test_profile_from_config() {
        let config = Config::from_value(json!({
            "db": {"pgsql": {"host": "localhost", "port": 5432, "user": "postgres", "passwd": "pg"}}
        }));
        let profile = DatabaseProfile::from_config(&config, Engine::PgSql).unwrap();
        assert_eq!(profile.port.as_deref(), Some("5432"));
        assert_eq!(profile.user, "postgres");

        let err = DatabaseProfile::from_config(&config, Engine::MySqli).unwrap_err();
        assert!(matches!(err, Error::ConfigKeyMissing { .. }));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("stable_main").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("x'; DROP").is_err());
    }

    #[test]
    fn test_pgsql_exists_uses_psql() {
        let runner = MockRunner::new().with_stdout("pg_database", "1\n");
        let db = CliDatabase::with_runner(profile(Engine::PgSql), Box::new(runner.clone()));

        assert!(db.exists("stablemain").unwrap());

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "psql");
        assert!(calls[0].args.contains(&"-U".to_string()));
        assert!(calls[0]
            .env
            .contains(&("PGPASSWORD".to_string(), "secret".to_string())));
    }

    #[test]
    fn test_mysql_create_uses_utf8mb4() {
        let runner = MockRunner::new();
        let db = CliDatabase::with_runner(profile(Engine::MySqli), Box::new(runner.clone()));

        db.create("stable39").unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].program, "mysql");
        assert!(calls[0].args.contains(&"-psecret".to_string()));
        let sql = calls[0].args.last().unwrap();
        assert!(sql.contains("CREATE DATABASE `stable39`"));
        assert!(sql.contains("utf8mb4"));
    }

    #[test]
    fn test_container_profile_wraps_in_docker() {
        let mut profile = profile(Engine::PgSql);
        profile.container = Some("pg".to_string());
        let runner = MockRunner::new();
        let db = CliDatabase::with_runner(profile, Box::new(runner.clone()));

        db.drop_database("old").unwrap();

        let call = &runner.calls()[0];
        assert_eq!(call.program, "docker");
        assert_eq!(&call.args[..2], &["exec".to_string(), "-i".to_string()]);
        assert!(call.args.contains(&"pg".to_string()));
        assert!(!call.args.contains(&"-h".to_string()));
    }

    #[test]
    fn test_failure_is_database_error() {
        let runner = MockRunner::new().failing("DROP DATABASE");
        let db = CliDatabase::with_runner(profile(Engine::PgSql), Box::new(runner));
        assert!(matches!(db.drop_database("x"), Err(Error::Database { .. })));
    }
}
