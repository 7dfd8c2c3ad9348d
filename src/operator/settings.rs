use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

lazy_static::lazy_static! {
    static ref ENV_VAR_PATTERN: regex::Regex =
        regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    static ref DNS_LABEL: regex::Regex =
        regex::Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
}

/// Environment variables read before the configuration is loaded; not settings themselves
const BOOTSTRAP_KEYS: [&str; 2] = ["config_dir", "config_run_mode"];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub operator: OperatorSettings,
    /// Path to a kubeconfig file; in-cluster or ~/.kube/config is inferred when unset
    #[serde(default)]
    pub kubeconfig: Option<String>,
}

fn default_field_manager() -> String {
    "rise-frontend-operator".to_string()
}

fn default_requeue_interval() -> u64 {
    300
}

fn default_error_requeue() -> u64 {
    30
}

fn default_api_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct OperatorSettings {
    /// Namespace holding the shared reverse proxies and API catalogs (required)
    #[serde(default)]
    pub config_namespace: String,

    /// Field manager recorded on every write (default: rise-frontend-operator)
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Requeue delay after a successful pass, in seconds (default: 300)
    #[serde(default = "default_requeue_interval")]
    pub requeue_interval_secs: u64,

    /// Requeue delay after a failed pass, in seconds (default: 30)
    #[serde(default = "default_error_requeue")]
    pub error_requeue_secs: u64,

    /// Deadline for every Kubernetes API call, in seconds (default: 10)
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            config_namespace: String::new(),
            field_manager: default_field_manager(),
            requeue_interval_secs: default_requeue_interval(),
            error_requeue_secs: default_error_requeue(),
            api_timeout_secs: default_api_timeout(),
        }
    }
}

impl OperatorSettings {
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        ENV_VAR_PATTERN
            .replace_all(s, |caps: &regex::Captures| {
                let default_value = caps.get(2).map(|m| m.as_str());
                match env::var(&caps[1]) {
                    Ok(val) => val,
                    Err(_) => default_value.unwrap_or("").to_string(),
                }
            })
            .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, substituting variables in strings
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => serde_json::Value::Object(
                table
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::config_value_to_json(v)))
                    .collect(),
            ),
            ValueKind::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(Self::config_value_to_json).collect())
            }
        }
    }

    /// Try to add a config file with multiple extension attempts (.toml, .yaml, .yml)
    /// Returns Ok(true) if a file was loaded, Ok(false) if no file found (when not required)
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &str,
        name: &str,
        required: bool,
    ) -> Result<bool, ConfigError> {
        for ext in ["toml", "yaml", "yml"] {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                *builder = builder
                    .clone()
                    .add_source(config::File::with_name(&format!("{}/{}", config_dir, name)));
                return Ok(true);
            }
        }

        if required {
            Err(ConfigError::Message(format!(
                "Required config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir, name
            )))
        } else {
            tracing::debug!(
                "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir,
                name
            );
            Ok(false)
        }
    }

    /// Load settings from `RISE_CONFIG_DIR` (default `config`) for `RISE_CONFIG_RUN_MODE`
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RISE_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("RISE_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load(&config_dir, &run_mode)
    }

    /// Load `default`, `<run_mode>` and `local` from `config_dir`, then `RISE_*` overrides
    ///
    /// When `config_dir` does not exist, only defaults and environment overrides apply.
    pub fn load(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if Path::new(config_dir).is_dir() {
            Self::try_add_config_file(&mut builder, config_dir, "default", true)?;
            Self::try_add_config_file(&mut builder, config_dir, run_mode, false)?;
            Self::try_add_config_file(&mut builder, config_dir, "local", false)?;
        } else {
            tracing::info!(
                "Config directory {} not found, using defaults and environment",
                config_dir
            );
        }

        // RISE_OPERATOR__CONFIG_NAMESPACE -> operator.config_namespace
        builder = builder.add_source(
            Environment::with_prefix("RISE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let json_value = serde_json::Value::Object(
            root_value
                .iter()
                .map(|(k, v)| (k.clone(), Self::config_value_to_json(v)))
                .collect(),
        );

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in unused_fields
            .iter()
            .filter(|field| !BOOTSTRAP_KEYS.contains(&field.as_str()))
        {
            tracing::warn!("Unknown configuration field in operator config: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let operator = &self.operator;

        if operator.config_namespace.is_empty() {
            return Err(ConfigError::Message(
                "Config namespace not configured. Set RISE_OPERATOR__CONFIG_NAMESPACE environment \
                 variable or [operator] config_namespace in config"
                    .to_string(),
            ));
        }
        if operator.config_namespace.len() > 63 || !DNS_LABEL.is_match(&operator.config_namespace)
        {
            return Err(ConfigError::Message(format!(
                "Config namespace '{}' is not a valid namespace name",
                operator.config_namespace
            )));
        }
        if operator.field_manager.is_empty() {
            return Err(ConfigError::Message(
                "operator.field_manager must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("requeue_interval_secs", operator.requeue_interval_secs),
            ("error_requeue_secs", operator.error_requeue_secs),
            ("api_timeout_secs", operator.api_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Message(format!(
                    "operator.{} must be greater than zero",
                    name
                )));
            }
        }

        Ok(())
    }
}
