//! Server configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::transport::TransportKind;

/// Remote control server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening transport. Unix domain socket unless TCP is asked for.
    pub transport: TransportKind,

    /// TCP port to bind (0 = ephemeral). Ignored for the Unix transport.
    pub port: u16,

    /// Directory holding sockets and discovery records.
    pub runtime_dir: PathBuf,

    /// Session length used when a request omits `duration`.
    pub default_duration: Duration,

    /// Whether responses carry an `Access-Control-Allow-Origin` header.
    pub cors: bool,

    /// Value of the CORS header when enabled.
    pub cors_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Unix,
            port: 0,
            runtime_dir: std::env::temp_dir().join("periscope"),
            default_duration: Duration::from_secs(30),
            cors: true,
            cors_host: "*".to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden from `PERISCOPE_SERVER_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(transport) = std::env::var("PERISCOPE_SERVER_TRANSPORT") {
            match transport.parse() {
                Ok(kind) => config.transport = kind,
                Err(err) => tracing::warn!("ignoring PERISCOPE_SERVER_TRANSPORT: {}", err),
            }
        }
        if let Some(port) = env_parse("PERISCOPE_SERVER_PORT") {
            config.port = port;
        }
        if let Ok(dir) = std::env::var("PERISCOPE_SERVER_RUNTIME_DIR") {
            config.runtime_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<f64>("PERISCOPE_SERVER_DURATION") {
            if secs > 0.0 {
                config.default_duration = Duration::from_secs_f64(secs);
            }
        }
        if let Some(cors) = env_parse::<u8>("PERISCOPE_SERVER_CORS") {
            config.cors = cors != 0;
        }
        if let Ok(host) = std::env::var("PERISCOPE_SERVER_CORS_HOST") {
            config.cors_host = host;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(TransportKind::Unix, config.transport);
        assert_eq!(0, config.port);
        assert_eq!(Duration::from_secs(30), config.default_duration);
        assert!(config.cors);
        assert_eq!("*", config.cors_host);
    }
}
