//! 运行时配置
//!
//! 加载顺序：TOML 文件 -> `SILO_DI_*` 环境变量覆盖 -> 校验。

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::logging::{LogFormat, LoggingConfig};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "SILO_DI_";

const ENV_KEYS: [&str; 4] = [
    "SILO_DI_SILO_PREFIX",
    "SILO_DI_WATCH_FATAL_ERRORS",
    "SILO_DI_LOG_LEVEL",
    "SILO_DI_LOG_FORMAT",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 筒仓名前缀，筒仓名为 `{prefix}-{id}`
    pub silo_prefix: String,
    /// 启动完成后是否监视服务的错误信号
    pub watch_fatal_errors: bool,
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            silo_prefix: "silo".to_string(),
            watch_fatal_errors: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::TomlParse("<inline>".to_string(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载，并应用环境变量覆盖
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(display.clone(), e))?;
        let mut config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::TomlParse(display, e))?;

        config.apply_env(&collect_env_vars())?;
        config.validate()?;
        tracing::debug!(path = %path.display(), ?config, "Loaded runtime configuration");
        Ok(config)
    }

    /// 默认配置加环境变量覆盖
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(&collect_env_vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(prefix) = vars.get("SILO_DI_SILO_PREFIX") {
            self.silo_prefix = prefix.clone();
        }
        if let Some(value) = vars.get("SILO_DI_WATCH_FATAL_ERRORS") {
            self.watch_fatal_errors = parse_bool("SILO_DI_WATCH_FATAL_ERRORS", value)?;
        }
        if let Some(level) = vars.get("SILO_DI_LOG_LEVEL") {
            self.logging.level = level.clone();
        }
        if let Some(format) = vars.get("SILO_DI_LOG_FORMAT") {
            self.logging.format = parse_format(format)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.silo_prefix.is_empty() || self.silo_prefix.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidValue {
                field: "silo_prefix".to_string(),
                reason: "must be non-empty and contain no whitespace".to_string(),
            });
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn collect_env_vars() -> HashMap<String, String> {
    ENV_KEYS
        .iter()
        .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect()
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("expected a boolean, got '{value}'"),
        }),
    }
}

fn parse_format(value: &str) -> Result<LogFormat, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        "compact" => Ok(LogFormat::Compact),
        _ => Err(ConfigError::InvalidValue {
            field: "SILO_DI_LOG_FORMAT".to_string(),
            reason: format!("unknown log format '{value}'"),
        }),
    }
}
