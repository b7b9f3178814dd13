//! Configuration loading and parsing.
//!
//! The TOML file is optional; command-line flags override whatever it sets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::Args;
use crate::context::SessionTimings;
use crate::service::ServiceSettings;

pub use media_bridge_proto::DEFAULT_SOCKET_PATH;
pub const DEFAULT_LOG_FILTER: &str = "info,session_server=info";

/// Server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Unix socket the server listens on.
    pub socket_path: Option<PathBuf>,
    /// Maximum number of concurrently open sessions.
    pub max_sessions: Option<usize>,
    /// Delay before a need-data request is repeated after the client had nothing to give.
    pub need_data_resend_ms: Option<u64>,
    /// Interval of position reports while playing.
    pub position_report_ms: Option<u64>,
    /// Maximum number of concurrently open web audio players.
    pub max_web_audio_players: Option<usize>,
    /// PCM bytes a web audio player may queue.
    pub web_audio_buffer_bytes: Option<usize>,
    /// `tracing` filter used when `RUST_LOG` is not set.
    pub log_filter: Option<String>,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Settings after merging config file, flags and defaults.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub socket_path: PathBuf,
    pub service: ServiceSettings,
    pub log_filter: String,
}

impl ServerSettings {
    pub fn resolve(cfg: &ServerConfig, args: &Args) -> Result<Self> {
        let defaults = ServiceSettings::default();
        let max_sessions = args
            .max_sessions
            .or(cfg.max_sessions)
            .unwrap_or(defaults.max_sessions);
        if max_sessions == 0 {
            anyhow::bail!("max_sessions must be at least 1");
        }

        let web_audio_buffer_bytes = cfg
            .web_audio_buffer_bytes
            .unwrap_or(defaults.web_audio_buffer_bytes);
        if web_audio_buffer_bytes == 0 {
            anyhow::bail!("web_audio_buffer_bytes must be at least 1");
        }

        let mut timings = SessionTimings::default();
        if let Some(ms) = cfg.need_data_resend_ms {
            timings.need_data_resend = Duration::from_millis(ms);
        }
        if let Some(ms) = cfg.position_report_ms {
            timings.position_report = Duration::from_millis(ms.max(1));
        }

        Ok(Self {
            socket_path: args
                .socket
                .clone()
                .or_else(|| cfg.socket_path.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            service: ServiceSettings {
                max_sessions,
                timings,
                max_web_audio_players: cfg
                    .max_web_audio_players
                    .unwrap_or(defaults.max_web_audio_players),
                web_audio_buffer_bytes,
            },
            log_filter: cfg
                .log_filter
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn load_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "socket_path = \"/run/media.sock\"\nmax_sessions = 3\nneed_data_resend_ms = 50"
        )
        .unwrap();
        let cfg = ServerConfig::load(file.path()).unwrap();
        assert_eq!(cfg.socket_path, Some(PathBuf::from("/run/media.sock")));
        assert_eq!(cfg.max_sessions, Some(3));
        assert_eq!(cfg.need_data_resend_ms, Some(50));
        assert_eq!(cfg.position_report_ms, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_session = 3").unwrap();
        assert!(ServerConfig::load(file.path()).is_err());
    }

    #[test]
    fn flags_override_file() {
        let cfg = ServerConfig {
            socket_path: Some(PathBuf::from("/from/file.sock")),
            max_sessions: Some(2),
            need_data_resend_ms: Some(20),
            ..ServerConfig::default()
        };
        let args = Args::parse_from(["session-server", "--socket", "/from/flag.sock"]);
        let settings = ServerSettings::resolve(&cfg, &args).unwrap();
        assert_eq!(settings.socket_path, PathBuf::from("/from/flag.sock"));
        assert_eq!(settings.service.max_sessions, 2);
        assert_eq!(
            settings.service.timings.need_data_resend,
            Duration::from_millis(20)
        );
        assert_eq!(settings.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn zero_sessions_is_an_error() {
        let args = Args::parse_from(["session-server", "--max-sessions", "0"]);
        assert!(ServerSettings::resolve(&ServerConfig::default(), &args).is_err());
    }

    #[test]
    fn web_audio_limits_come_from_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_web_audio_players = 2\nweb_audio_buffer_bytes = 4096").unwrap();
        let cfg = ServerConfig::load(file.path()).unwrap();
        let args = Args::parse_from(["session-server"]);
        let settings = ServerSettings::resolve(&cfg, &args).unwrap();
        assert_eq!(settings.service.max_web_audio_players, 2);
        assert_eq!(settings.service.web_audio_buffer_bytes, 4096);

        let empty = ServerConfig {
            web_audio_buffer_bytes: Some(0),
            ..ServerConfig::default()
        };
        assert!(ServerSettings::resolve(&empty, &args).is_err());
    }
}
