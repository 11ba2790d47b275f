use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, env_var_pattern};
use crate::error::ConnectorError;
use crate::storage::DEDUP_KEY;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<ConfigError> for ConnectorError {
    fn from(e: ConfigError) -> Self {
        ConnectorError::Config(e.to_string())
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;
    load_config_str(&yaml, |name| std::env::var(name).ok()).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse, apply environment overrides and validate. `env` looks up
/// override variables such as `QUEUE_SIZE`.
pub fn load_config_str<F>(yaml: &str, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    config.data_dir = expand_tilde(&config.data_dir);

    let mut errors = Vec::new();
    apply_env_overrides(&mut config, env, &mut errors);
    validate_config(&config, &mut errors);

    if errors.is_empty() {
        Ok(config)
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let Some(re) = env_var_pattern() else {
        return Ok(());
    };
    let mut unexpanded: Vec<&str> = re
        .captures_iter(yaml)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect();
    if unexpanded.is_empty() {
        return Ok(());
    }
    unexpanded.sort();
    unexpanded.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}\n\
         Export them before starting, or replace the $env{{…}} references with literal values",
        unexpanded.join(", ")
    )))
}

fn apply_env_overrides<F>(config: &mut Config, env: F, errors: &mut Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    let mut read = |name: &str| -> Option<usize> {
        let raw = env(name)?;
        match raw.trim().parse::<usize>() {
            Ok(value) => Some(value),
            Err(_) => {
                errors.push(format!("{}: expected a positive integer, got '{}'", name, raw));
                None
            }
        }
    };

    if let Some(v) = read("QUEUE_SIZE") {
        config.runtime.queue_size = v;
    }
    if let Some(v) = read("BATCH_SIZE") {
        config.intake.chunk_size = v;
    }
    if let Some(v) = read("NB_FORWARDERS") {
        config.runtime.nb_forwarders = v;
    }
    if let Some(v) = read("NB_CONSUMERS") {
        config.runtime.nb_consumers = v;
    }
}

fn validate_config(config: &Config, errors: &mut Vec<String>) {
    if !(config.intake.server.starts_with("http://") || config.intake.server.starts_with("https://")) {
        errors.push(format!(
            "intake.server: expected an http(s) URL, got '{}'",
            config.intake.server
        ));
    }
    if config.intake.key.is_empty() {
        errors.push("intake.key cannot be empty".to_string());
    }
    if config.intake.chunk_size == 0 {
        errors.push("intake.chunk_size must be at least 1".to_string());
    }

    let runtime = &config.runtime;
    for (name, value) in [
        ("runtime.queue_size", runtime.queue_size),
        ("runtime.nb_forwarders", runtime.nb_forwarders),
        ("runtime.nb_consumers", runtime.nb_consumers),
    ] {
        if value == 0 {
            errors.push(format!("{} must be at least 1", name));
        }
    }

    for (name, connection) in &config.connections {
        validate_connection(name, connection, errors);
    }

    for (dialect, definitions) in &config.aggregations {
        for (i, definition) in definitions.iter().enumerate() {
            let context = format!("aggregations.{}[{}]", dialect, i);
            if definition.fingerprint.is_empty() {
                errors.push(format!("{}: fingerprint needs at least one pointer", context));
            }
            for pointer in definition.condition.keys().chain(definition.fingerprint.iter()) {
                validate_pointer(&context, pointer, errors);
            }
        }
    }

    if config.streams.is_empty() {
        errors.push("streams: at least one stream must be configured".to_string());
    }
    for (name, stream) in &config.streams {
        validate_stream(name, stream, config, errors);
    }
}

fn validate_connection(name: &str, connection: &ConnectionConfig, errors: &mut Vec<String>) {
    let context = format!("connections.{}", name);
    match &connection.auth {
        Some(AuthConfig::ClientCredentials { token_url, client_id, .. })
        | Some(AuthConfig::RefreshToken { token_url, client_id, .. }) => {
            if token_url.is_empty() {
                errors.push(format!("{}.auth: token_url cannot be empty", context));
            }
            if client_id.is_empty() {
                errors.push(format!("{}.auth: client_id cannot be empty", context));
            }
        }
        Some(AuthConfig::ApiKey { key, .. }) if key.is_empty() => {
            errors.push(format!("{}.auth: key cannot be empty", context));
        }
        _ => {}
    }

    let limits = connection
        .rate_limit
        .iter()
        .map(|l| ("rate_limit".to_string(), l))
        .chain(
            connection
                .endpoint_rate_limits
                .iter()
                .map(|(prefix, l)| (format!("endpoint_rate_limits.{}", prefix), l)),
        );
    for (field, limit) in limits {
        if limit.requests == 0 || limit.per.is_zero() {
            errors.push(format!(
                "{}.{}: requests and per must both be non-zero",
                context, field
            ));
        }
    }
}

fn validate_stream(name: &str, stream: &StreamConfig, config: &Config, errors: &mut Vec<String>) {
    let context = format!("streams.{}", name);
    if name == DEDUP_KEY {
        errors.push(format!("{}: '{}' is reserved", context, DEDUP_KEY));
    }
    if !config.connections.contains_key(&stream.connection) {
        errors.push(format!(
            "{}: unknown connection '{}'",
            context, stream.connection
        ));
    }
    if stream.enabled && stream.source.is_push() && config.runtime.nb_consumers > 1 {
        errors.push(format!(
            "{}: a push stream has a single connection and cannot be split across {} consumers (runtime.nb_consumers)",
            context, config.runtime.nb_consumers
        ));
    }
    if stream.frequency < Duration::from_secs(1) {
        errors.push(format!("{}: frequency must be at least 1s", context));
    }
    if let Some(dialect) = &stream.aggregation {
        if !config.aggregations.contains_key(dialect) {
            errors.push(format!(
                "{}: unknown aggregation dialect '{}'",
                context, dialect
            ));
        }
    }
    if let Some(dedup) = &stream.dedup {
        if dedup.capacity == 0 {
            errors.push(format!("{}.dedup: capacity must be at least 1", context));
        }
    }
    if matches!(&stream.intake_key, Some(key) if key.is_empty()) {
        errors.push(format!("{}: intake_key cannot be empty", context));
    }

    match &stream.source {
        SourceConfig::HttpJson(source) => {
            validate_url(&context, &source.url, errors);
            if !source.items.is_empty() {
                validate_pointer(&context, &source.items, errors);
            }
            validate_extract(&context, &source.extract, errors);
            match &source.pagination {
                PaginationConfig::Cursor { next, param } => {
                    validate_pointer(&context, next, errors);
                    if param.is_empty() {
                        errors.push(format!("{}.pagination: param cannot be empty", context));
                    }
                }
                PaginationConfig::Since { param, .. } if param.is_empty() => {
                    errors.push(format!("{}.pagination: param cannot be empty", context));
                }
                PaginationConfig::Window {
                    start_param,
                    end_param,
                    ..
                } if start_param.is_empty() || end_param.is_empty() => {
                    errors.push(format!(
                        "{}.pagination: start_param and end_param are required",
                        context
                    ));
                }
                _ => {}
            }
        }
        SourceConfig::NdjsonStream(source) => {
            validate_url(&context, &source.url, errors);
            validate_extract(&context, &source.extract, errors);
        }
    }
}

fn validate_url(context: &str, url: &str, errors: &mut Vec<String>) {
    if reqwest::Url::parse(url).is_err() {
        errors.push(format!("{}.source: invalid url '{}'", context, url));
    }
}

fn validate_extract(context: &str, extract: &ExtractConfig, errors: &mut Vec<String>) {
    validate_pointer(context, &extract.timestamp, errors);
    if let Some(id) = &extract.id {
        validate_pointer(context, id, errors);
    }
}

fn validate_pointer(context: &str, pointer: &str, errors: &mut Vec<String>) {
    if !pointer.starts_with('/') {
        errors.push(format!(
            "{}: '{}' is not a JSON pointer (must start with '/')",
            context, pointer
        ));
    }
}
