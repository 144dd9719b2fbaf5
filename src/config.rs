//! Runtime settings: built-in defaults, then a TOML file, then environment
//! variables. CLI flags are applied last by the binary.

use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "vcl-edge.toml";

/// Sends URLs matching `pattern` to a backend or director.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub pattern: String,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub max_restarts: u32,
    pub backend_timeout: Duration,
    pub default_ttl: i64,
    pub fallback_director: Option<String>,
    pub health_checks: bool,
    pub routes: Vec<Route>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_restarts: 3,
            backend_timeout: Duration::from_millis(15_000),
            default_ttl: 3600,
            fallback_director: None,
            health_checks: true,
            routes: Vec::new(),
        }
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn integer(key: &str, value: &toml::Value) -> Result<i64, ConfigError> {
    value.as_integer().ok_or_else(|| invalid(key, value))
}

fn string(key: &str, value: &toml::Value) -> Result<String, ConfigError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(key, value))
}

fn boolean(key: &str, value: &toml::Value) -> Result<bool, ConfigError> {
    value.as_bool().ok_or_else(|| invalid(key, value))
}

fn parse_bool(key: &str, text: &str) -> Result<bool, ConfigError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, text)),
    }
}

impl Settings {
    /// Loads `path` if given, else `vcl-edge.toml` when it exists, then
    /// applies the process environment.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut settings = Settings::default();
        let candidate = match path {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Some(default.to_path_buf())
                } else {
                    None
                }
            }
        };
        if let Some(path) = candidate {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            settings.apply_toml_str(&text)?;
        }
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn apply_toml_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let value: toml::Value = toml::from_str(text)?;
        self.apply_toml(&value)
    }

    pub fn apply_toml(&mut self, value: &toml::Value) -> Result<(), ConfigError> {
        if let Some(server) = value.get("server") {
            if let Some(port) = server.get("port") {
                let port = integer("server.port", port)?;
                self.port = u16::try_from(port).map_err(|_| invalid("server.port", port))?;
            }
            if let Some(host) = server.get("host") {
                self.host = string("server.host", host)?;
            }
        }

        if let Some(pipeline) = value.get("pipeline") {
            if let Some(n) = pipeline.get("max_restarts") {
                let n = integer("pipeline.max_restarts", n)?;
                self.max_restarts =
                    u32::try_from(n).map_err(|_| invalid("pipeline.max_restarts", n))?;
            }
            if let Some(ms) = pipeline.get("backend_timeout_ms") {
                let ms = integer("pipeline.backend_timeout_ms", ms)?;
                if ms <= 0 {
                    return Err(invalid("pipeline.backend_timeout_ms", ms));
                }
                self.backend_timeout = Duration::from_millis(ms as u64);
            }
            if let Some(ttl) = pipeline.get("default_ttl") {
                self.default_ttl = integer("pipeline.default_ttl", ttl)?.max(0);
            }
            if let Some(name) = pipeline.get("fallback_director") {
                self.fallback_director = Some(string("pipeline.fallback_director", name)?);
            }
            if let Some(enabled) = pipeline.get("health_checks") {
                self.health_checks = boolean("pipeline.health_checks", enabled)?;
            }
        }

        if let Some(routes) = value.get("route") {
            let routes = routes.as_array().ok_or_else(|| invalid("route", routes))?;
            for route in routes {
                let pattern = route
                    .get("pattern")
                    .ok_or_else(|| invalid("route.pattern", route))?;
                let backend = route
                    .get("backend")
                    .ok_or_else(|| invalid("route.backend", route))?;
                let pattern = string("route.pattern", pattern)?;
                if let Err(err) = regex::Regex::new(&pattern) {
                    return Err(invalid("route.pattern", err));
                }
                self.routes.push(Route {
                    pattern,
                    backend: string("route.backend", backend)?,
                });
            }
        }
        Ok(())
    }

    /// `lookup` maps a variable name to its value, if set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("VCL_EDGE_PORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| invalid("VCL_EDGE_PORT", &port))?;
        }
        if let Some(host) = lookup("VCL_EDGE_HOST") {
            self.host = host;
        }
        if let Some(n) = lookup("VCL_EDGE_MAX_RESTARTS") {
            self.max_restarts = n
                .trim()
                .parse()
                .map_err(|_| invalid("VCL_EDGE_MAX_RESTARTS", &n))?;
        }
        if let Some(ms) = lookup("VCL_EDGE_BACKEND_TIMEOUT_MS") {
            let parsed: u64 = ms
                .trim()
                .parse()
                .map_err(|_| invalid("VCL_EDGE_BACKEND_TIMEOUT_MS", &ms))?;
            if parsed == 0 {
                return Err(invalid("VCL_EDGE_BACKEND_TIMEOUT_MS", &ms));
            }
            self.backend_timeout = Duration::from_millis(parsed);
        }
        if let Some(enabled) = lookup("VCL_EDGE_HEALTH_CHECKS") {
            self.health_checks = parse_bool("VCL_EDGE_HEALTH_CHECKS", &enabled)?;
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.max_restarts, 3);
        assert_eq!(settings.backend_timeout, Duration::from_secs(15));
        assert_eq!(settings.address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_toml() {
        let mut settings = Settings::default();
        settings
            .apply_toml_str(
                r#"
                [server]
                port = 9000
                host = "0.0.0.0"

                [pipeline]
                max_restarts = 5
                backend_timeout_ms = 250
                fallback_director = "backup"
                health_checks = false

                [[route]]
                pattern = "^/api/"
                backend = "api"
                "#,
            )
            .unwrap();
        assert_eq!(settings.address(), "0.0.0.0:9000");
        assert_eq!(settings.max_restarts, 5);
        assert_eq!(settings.backend_timeout, Duration::from_millis(250));
        assert_eq!(settings.fallback_director.as_deref(), Some("backup"));
        assert!(!settings.health_checks);
        assert_eq!(
            settings.routes,
            vec![Route {
                pattern: "^/api/".to_string(),
                backend: "api".to_string()
            }]
        );
    }

    #[test]
    fn test_invalid_toml_values() {
        let mut settings = Settings::default();
        assert!(settings.apply_toml_str("[server]\nport = 70000").is_err());
        assert!(settings.apply_toml_str("[server]\nport = \"x\"").is_err());
        assert!(settings
            .apply_toml_str("[[route]]\npattern = \"(\"\nbackend = \"a\"")
            .is_err());
    }

    #[test]
    fn test_env_overrides_toml() {
        let mut settings = Settings::default();
        settings.apply_toml_str("[server]\nport = 9000").unwrap();
        let env: HashMap<&str, &str> = [
            ("VCL_EDGE_PORT", "9100"),
            ("VCL_EDGE_HEALTH_CHECKS", "off"),
        ]
        .into_iter()
        .collect();
        settings
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.port, 9100);
        assert!(!settings.health_checks);
        assert!(settings
            .apply_env(|key| (key == "VCL_EDGE_MAX_RESTARTS").then(|| "many".to_string()))
            .is_err());
    }
}
