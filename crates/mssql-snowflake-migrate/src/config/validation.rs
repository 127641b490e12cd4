//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

const TOKEN_TYPES: [&str; 3] = ["OAUTH", "KEYPAIR_JWT", "PROGRAMMATIC_ACCESS_TOKEN"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if config.source.r#type != "mssql" {
        return Err(MigrateError::Config(format!(
            "source.type must be 'mssql', got '{}'",
            config.source.r#type
        )));
    }

    // Target validation
    if config.target.account.is_empty() && config.target.endpoint.is_none() {
        return Err(MigrateError::Config(
            "target.account or target.endpoint is required".into(),
        ));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.token.is_empty() {
        return Err(MigrateError::Config("target.token is required".into()));
    }
    if config.target.r#type != "snowflake" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'snowflake', got '{}'",
            config.target.r#type
        )));
    }
    if !TOKEN_TYPES.contains(&config.target.token_type.as_str()) {
        return Err(MigrateError::Config(format!(
            "target.token_type must be one of {:?}, got '{}'",
            TOKEN_TYPES, config.target.token_type
        )));
    }

    // Migration validation
    match config.migration.max_retries {
        None => {
            return Err(MigrateError::Config(
                "migration.max_retries is required".into(),
            ))
        }
        Some(0) => {
            return Err(MigrateError::Config(
                "migration.max_retries must be at least 1".into(),
            ))
        }
        Some(_) => {}
    }
    if config.migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if config.migration.staging_dir.as_os_str().is_empty() {
        return Err(MigrateError::Config(
            "migration.staging_dir must not be empty".into(),
        ));
    }
    if config.migration.progress_file.as_os_str().is_empty() {
        return Err(MigrateError::Config(
            "migration.progress_file must not be empty".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
source:
  host: localhost
  database: source_db
  user: sa
  password: password
target:
  account: xy12345
  token: secret-token
  database: ANALYTICS
migration:
  max_retries: 3
"#;

    fn valid_config() -> Config {
        serde_yaml::from_str(VALID_YAML).unwrap()
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_wrong_source_type() {
        let mut config = valid_config();
        config.source.r#type = "postgres".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_wrong_target_type() {
        let mut config = valid_config();
        config.target.r#type = "bigquery".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_token_type() {
        let mut config = valid_config();
        config.target.token_type = "PASSWORD".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_max_retries_is_required() {
        let mut config = valid_config();
        config.migration.max_retries = None;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("max_retries is required"));
    }

    #[test]
    fn test_max_retries_zero_rejected() {
        let mut config = valid_config();
        config.migration.max_retries = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = valid_config();
        config.migration.batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = valid_config();
        config.migration.workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_source_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }

    #[test]
    fn test_target_config_debug_redacts_token() {
        let mut config = valid_config();
        config.target.token = "super_secret_token_456".to_string();
        let debug_output = format!("{:?}", config.target);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_token_456"));
    }
}
