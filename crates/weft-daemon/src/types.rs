use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::DaemonError;

/// Enforced resource limits.
pub const CLIENTS_MAX: usize = 64;
pub const PTYS_MAX: usize = 256;
pub const SEND_QUEUE_MAX: usize = 1024;
pub const COLOR_QUERY_MAX: usize = 32;
pub const COLOR_QUERY_TIMEOUT_MS: u64 = 5000;
pub const FRAME_TIME_MS: u64 = 8;

pub use weft_vt::screen::{CWD_LEN_MAX, TITLE_LEN_MAX};

/// Daemon-specific configuration.
///
/// Read from the `[daemon]` section of `~/.weft/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the Unix domain socket.
    /// Default: `~/.weft/daemon.sock`
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Shell spawned into new PTYs. Default: `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub shell: Option<String>,

    /// Per-PTY scrollback in lines.
    /// Default: 10000
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,

    /// Emit logs as line-delimited JSON.
    #[serde(default)]
    pub log_json: bool,
}

impl DaemonConfig {
    /// Validate configuration values, catching misconfiguration early.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.scrollback_lines > 1_000_000 {
            return Err(DaemonError::ConfigInvalid(
                "scrollback_lines must be <= 1000000".to_string(),
            ));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(DaemonError::ConfigInvalid(
                "socket_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The shell to spawn, falling back to `$SHELL` then `/bin/sh`.
    pub fn shell_program(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            shell: None,
            scrollback_lines: default_scrollback_lines(),
            log_json: false,
        }
    }
}

fn weft_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".weft"),
        None => {
            tracing::warn!(
                event = "daemon.config.home_dir_fallback",
                fallback = "/tmp/.weft",
            );
            PathBuf::from("/tmp/.weft")
        }
    }
}

fn default_socket_path() -> PathBuf {
    weft_dir().join("daemon.sock")
}

fn default_scrollback_lines() -> usize {
    10_000
}

/// Wrapper for deserializing the `[daemon]` section from the config file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    daemon: DaemonConfig,
}

/// Load daemon configuration from `~/.weft/config.toml`.
///
/// Falls back to defaults if the file doesn't exist or the section is
/// missing; a malformed file is logged and ignored.
pub fn load_daemon_config() -> Result<DaemonConfig, DaemonError> {
    let config_path = weft_dir().join("config.toml");

    let config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.daemon,
            Err(e) => {
                tracing::warn!(
                    event = "daemon.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                DaemonConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "daemon.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            DaemonConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_defaults() {
        let config = DaemonConfig::default();
        assert!(config.socket_path.ends_with("daemon.sock"));
        assert_eq!(config.scrollback_lines, 10_000);
        assert!(!config.log_json);
        assert!(config.shell.is_none());
    }

    #[test]
    fn test_daemon_config_serde_roundtrip() {
        let config = DaemonConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.scrollback_lines, config.scrollback_lines);
        assert_eq!(parsed.socket_path, config.socket_path);
    }

    #[test]
    fn test_load_from_toml_section() {
        let toml = r#"
[daemon]
scrollback_lines = 500
shell = "/bin/zsh"
"#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.daemon.scrollback_lines, 500);
        assert_eq!(file.daemon.shell.as_deref(), Some("/bin/zsh"));
        // Defaults for unset fields
        assert!(file.daemon.socket_path.ends_with("daemon.sock"));
    }

    #[test]
    fn test_load_missing_section_gets_defaults() {
        let toml = r#"
[client]
theme = "dark"
"#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.daemon.scrollback_lines, 10_000);
    }

    #[test]
    fn test_validate_defaults_ok() {
        assert!(DaemonConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_huge_scrollback_fails() {
        let mut config = DaemonConfig::default();
        config.scrollback_lines = 2_000_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scrollback_lines"));
    }

    #[test]
    fn test_shell_program_explicit_wins() {
        let mut config = DaemonConfig::default();
        config.shell = Some("/bin/dash".to_string());
        assert_eq!(config.shell_program(), "/bin/dash");
    }

    #[test]
    fn test_limits_match_protocol() {
        assert_eq!(CLIENTS_MAX, 64);
        assert_eq!(PTYS_MAX, 256);
        assert_eq!(SEND_QUEUE_MAX, 1024);
        assert_eq!(COLOR_QUERY_MAX, 32);
        assert_eq!(TITLE_LEN_MAX, 4096);
        assert_eq!(CWD_LEN_MAX, 4096);
    }
}
