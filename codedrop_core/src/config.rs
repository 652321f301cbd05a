//! Engine configuration.
//!
//! Everything here has a sane default so the engine can be embedded without
//! any setup. `from_env` layers `CODEDROP_*` variables (and a `.env` file,
//! if present) on top of the defaults.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::retry::RetryPolicy;

const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8080/ws";
const DOWNLOAD_DIR_NAME: &str = "codedrop";

/// How long a session may spend between joining the code and having an open
/// channel before negotiation is abandoned.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// WebSocket endpoint of the signal server.
    pub signal_url: Url,
    /// Where received files are written.
    pub download_dir: PathBuf,
    /// Whether to attempt the direct channel at all. With this off the
    /// receiver advertises no candidates and both sides go straight to relay.
    pub enable_direct: bool,
    /// Ceiling on the whole join-to-channel negotiation.
    pub negotiation_timeout: Duration,
    /// Per-candidate budget when the sender dials direct addresses.
    pub direct_dial_timeout: Duration,
    /// How long the receiver holds its endpoint open for an incoming dial
    /// before falling back to relay.
    pub direct_accept_window: Duration,
    /// Backoff applied to signaling connects, negotiation restarts and
    /// chunk sends alike.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // The fallback URL is statically valid.
            signal_url: Url::parse(DEFAULT_SIGNAL_URL).unwrap(),
            download_dir: default_download_dir(),
            enable_direct: true,
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            direct_dial_timeout: Duration::from_millis(1500),
            direct_accept_window: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Builds a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("CODEDROP_SIGNAL_URL") {
            match Url::parse(&raw) {
                Ok(url) => config.signal_url = url,
                Err(e) => {
                    tracing::warn!("ignoring CODEDROP_SIGNAL_URL ({}): {}", raw, e);
                }
            }
        }
        if let Ok(dir) = std::env::var("CODEDROP_DOWNLOAD_DIR") {
            if !dir.trim().is_empty() {
                config.download_dir = PathBuf::from(dir);
            }
        }
        if let Ok(flag) = std::env::var("CODEDROP_DIRECT") {
            config.enable_direct = !matches!(flag.trim(), "0" | "false" | "off");
        }

        config
    }
}

fn default_download_dir() -> PathBuf {
    if let Some(user_dirs) = directories::UserDirs::new() {
        if let Some(download_dir) = user_dirs.download_dir() {
            return download_dir.join(DOWNLOAD_DIR_NAME);
        }
        return user_dirs.home_dir().join(DOWNLOAD_DIR_NAME);
    }
    PathBuf::from(".").join(DOWNLOAD_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable() {
        let config = EngineConfig::default();
        assert_eq!(config.signal_url.scheme(), "ws");
        assert!(config.enable_direct);
        assert!(config.download_dir.ends_with(DOWNLOAD_DIR_NAME));
        assert_eq!(config.negotiation_timeout, Duration::from_secs(10));
    }
}
