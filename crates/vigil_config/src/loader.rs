//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::HarnessConfig;
use std::net::SocketAddr;
use std::path::Path;

/// File name looked up by [`load_config`].
pub const CONFIG_FILE_NAME: &str = "vigil.toml";

/// Loads and validates `vigil.toml` from a directory.
///
/// Returns the default configuration when the directory has no `vigil.toml`.
pub fn load_config(dir: &Path) -> Result<HarnessConfig, ConfigError> {
    let path = dir.join(CONFIG_FILE_NAME);
    if !path.exists() {
        let config = HarnessConfig::default();
        validate_config(&config)?;
        return Ok(config);
    }
    load_config_file(&path)
}

/// Loads and validates a configuration from an explicit file path.
pub fn load_config_file(path: &Path) -> Result<HarnessConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    load_config_from_str(&content)
}

/// Parses and validates a configuration from a string.
pub fn load_config_from_str(content: &str) -> Result<HarnessConfig, ConfigError> {
    let config: HarnessConfig =
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &HarnessConfig) -> Result<(), ConfigError> {
    if config.link.bind.trim().is_empty() {
        return Err(ConfigError::EmptyField { field: "link.bind" });
    }
    if config.link.bind.parse::<SocketAddr>().is_err() {
        return Err(ConfigError::invalid(
            "link.bind",
            format!("'{}' is not a socket address", config.link.bind),
        ));
    }
    if config.link.worker_threads == 0 {
        return Err(ConfigError::invalid("link.worker_threads", "must be at least 1"));
    }
    if config.spool.path.as_os_str().is_empty() {
        return Err(ConfigError::EmptyField { field: "spool.path" });
    }
    if config.clock.port.trim().is_empty() {
        return Err(ConfigError::EmptyField { field: "clock.port" });
    }
    config.clock.half_period_fs()?;
    let session = &config.session;
    for (name, value) in [
        ("session.max_sessions", session.max_sessions),
        ("session.event_capacity", session.event_capacity),
        ("session.max_query_samples", session.max_query_samples),
    ] {
        if value == 0 {
            return Err(ConfigError::invalid(name, "must be at least 1"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SpoolMode, SyncPolicy};

    #[test]
    fn empty_config_uses_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.link.bind, "127.0.0.1:6618");
        assert_eq!(config.clock.frequency, "500MHz");
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[link]
bind = "0.0.0.0:7000"
worker_threads = 4

[spool]
path = "runs/trace.spool"
sync = "durable"
mode = "append"

[clock]
port = "dut.clk"
frequency = "100MHz"

[session]
max_sessions = 2
event_capacity = 64
max_query_samples = 10
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.link.bind, "0.0.0.0:7000");
        assert_eq!(config.link.worker_threads, 4);
        assert_eq!(config.spool.path.to_str(), Some("runs/trace.spool"));
        assert_eq!(config.spool.sync, SyncPolicy::Durable);
        assert_eq!(config.spool.mode, SpoolMode::Append);
        assert_eq!(config.clock.port, "dut.clk");
        assert_eq!(config.clock.half_period_fs().unwrap(), 5_000_000);
        assert_eq!(config.session.max_sessions, 2);
        assert_eq!(config.session.event_capacity, 64);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = load_config_from_str("[spool]\nsync = \"buffered\"\n").unwrap();
        assert_eq!(config.spool.sync, SyncPolicy::Buffered);
        assert_eq!(config.spool.path.to_str(), Some("spool.bin"));
    }

    #[test]
    fn invalid_toml_errors() {
        let err = load_config_from_str("this is not valid toml {{{}}}").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn unknown_field_errors() {
        let err = load_config_from_str("[link]\nport = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn unknown_sync_policy_errors() {
        let err = load_config_from_str("[spool]\nsync = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_bind_errors() {
        let err = load_config_from_str("[link]\nbind = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyField { .. }));
    }

    #[test]
    fn malformed_bind_errors() {
        let err = load_config_from_str("[link]\nbind = \"localhost\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn empty_clock_port_errors() {
        let err = load_config_from_str("[clock]\nport = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyField { .. }));
    }

    #[test]
    fn zero_frequency_errors() {
        let err = load_config_from_str("[clock]\nfrequency = \"0Hz\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_session_limit_errors() {
        let err = load_config_from_str("[session]\nmax_sessions = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[clock]\nfrequency = \"1GHz\"\n",
        )
        .unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.clock.half_period_fs().unwrap(), 500_000);
    }

    #[test]
    fn missing_file_in_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.session.event_capacity, 1024);
    }

    #[test]
    fn io_error_from_nonexistent_file() {
        let err = load_config_file(Path::new("/nonexistent/dir/vigil.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
