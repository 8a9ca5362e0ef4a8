use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

pub const CLOUD_HOST: &str = "0.peerjs.com";
pub const CLOUD_PORT: u16 = 9000;
pub const DEFAULT_KEY: &str = "peerjs";
pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

/// Capability hint this implementation advertises in OFFER/ANSWER payloads.
pub const BROWSER_HINT: &str = "tidepool";

pub const DEFAULT_STREAM_WATCHDOG: Duration = Duration::from_secs(25);
pub const DEFAULT_SOCKET_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_SEND_RETRY: Duration = Duration::from_millis(100);
pub const DEFAULT_CHUNK_MTU: usize = 16_300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("peer id \"{0}\" is invalid")]
    InvalidId(String),
    #[error("api key \"{0}\" is invalid")]
    InvalidKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Timers governing the signaling transport and the send buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTuning {
    pub stream_watchdog: Duration,
    pub socket_grace: Duration,
    pub send_retry: Duration,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            stream_watchdog: DEFAULT_STREAM_WATCHDOG,
            socket_grace: DEFAULT_SOCKET_GRACE,
            send_retry: DEFAULT_SEND_RETRY,
        }
    }
}

/// Everything a [`crate::peer::Peer`] needs to reach the signaling service and
/// configure its links.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub key: String,
    pub secure: bool,
    pub ice_servers: Vec<IceServer>,
    pub tuning: TransportTuning,
    pub chunk_mtu: usize,
    pub chunked_browsers: Vec<String>,
    pub browser_hint: String,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            host: CLOUD_HOST.to_string(),
            port: CLOUD_PORT,
            path: "/".to_string(),
            key: DEFAULT_KEY.to_string(),
            secure: false,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN)],
            tuning: TransportTuning::default(),
            chunk_mtu: DEFAULT_CHUNK_MTU,
            chunked_browsers: vec![BROWSER_HINT.to_string()],
            browser_hint: BROWSER_HINT.to_string(),
        }
    }
}

impl PeerOptions {
    /// Load options from `TIDEPOOL_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(host) = env::var("TIDEPOOL_HOST") {
            if !host.trim().is_empty() {
                options.host = host.trim().to_string();
            }
        }
        if let Some(port) = parse_env::<u16>("TIDEPOOL_PORT") {
            options.port = port;
        }
        if let Ok(path) = env::var("TIDEPOOL_PATH") {
            options.path = path;
        }
        if let Ok(key) = env::var("TIDEPOOL_KEY") {
            options.key = key;
        }
        if let Some(secure) = env_flag("TIDEPOOL_SECURE") {
            options.secure = secure;
        }
        if env_flag("TIDEPOOL_LOCALHOST_ONLY").unwrap_or(false) {
            options.ice_servers.clear();
        }
        if let Some(ms) = parse_env::<u64>("TIDEPOOL_STREAM_WATCHDOG_MS") {
            options.tuning.stream_watchdog = Duration::from_millis(ms.max(1));
        }
        options.normalized()
    }

    /// Ensure the path starts and ends with `/`.
    pub fn normalized(mut self) -> Self {
        self.path = normalize_path(&self.path);
        self
    }

    pub fn is_cloud_host(&self) -> bool {
        self.host == CLOUD_HOST
    }

    /// `http(s)://host:port{path}{key}`
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}{}{}",
            self.host,
            self.port,
            normalize_path(&self.path),
            self.key
        )
    }

    /// `ws(s)://host:port{path}peerjs?key={key}`
    pub fn socket_base(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}{}peerjs?key={}",
            self.host,
            self.port,
            normalize_path(&self.path),
            self.key
        )
    }
}

fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 2);
    if !path.starts_with('/') {
        normalized.push('/');
    }
    normalized.push_str(path);
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// Alphanumeric words joined by single spaces, dashes or underscores. Empty is
/// accepted and means "let the server assign one".
fn is_valid_name(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    let mut previous_was_separator = true;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            previous_was_separator = false;
        } else if matches!(ch, ' ' | '_' | '-') {
            if previous_was_separator {
                return false;
            }
            previous_was_separator = true;
        } else {
            return false;
        }
    }
    !previous_was_separator
}

pub fn validate_id(id: &str) -> Result<(), ConfigError> {
    if is_valid_name(id) {
        Ok(())
    } else {
        Err(ConfigError::InvalidId(id.to_string()))
    }
}

pub fn validate_key(key: &str) -> Result<(), ConfigError> {
    if is_valid_name(key) {
        Ok(())
    } else {
        Err(ConfigError::InvalidKey(key.to_string()))
    }
}

fn env_flag(var: &str) -> Option<bool> {
    env::var(var)
        .ok()
        .map(|value| !matches!(value.trim(), "" | "0" | "false" | "no"))
}

fn parse_env<T>(var: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = env::var(var).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(
                target = "tidepool::config",
                var,
                error = %err,
                "failed to parse config from env; using default"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_point_at_cloud_service() {
        let options = PeerOptions::default();
        assert_eq!(options.http_base(), "http://0.peerjs.com:9000/peerjs");
        assert_eq!(
            options.socket_base(),
            "ws://0.peerjs.com:9000/peerjs?key=peerjs"
        );
        assert!(options.is_cloud_host());
        assert_eq!(options.tuning.stream_watchdog, Duration::from_secs(25));
    }

    #[test]
    fn path_gets_leading_and_trailing_slash() {
        let options = PeerOptions {
            host: "localhost".into(),
            port: 9001,
            path: "signal".into(),
            key: "lobby".into(),
            secure: true,
            ..PeerOptions::default()
        }
        .normalized();
        assert_eq!(options.path, "/signal/");
        assert_eq!(options.http_base(), "https://localhost:9001/signal/lobby");
        assert_eq!(
            options.socket_base(),
            "wss://localhost:9001/signal/peerjs?key=lobby"
        );
    }

    #[test]
    fn id_validation_matches_word_rules() {
        assert!(validate_id("").is_ok());
        assert!(validate_id("alice").is_ok());
        assert!(validate_id("alice-2 b_c").is_ok());
        assert!(validate_id("-alice").is_err());
        assert!(validate_id("alice-").is_err());
        assert!(validate_id("al--ice").is_err());
        assert!(validate_id("al!ce").is_err());
        assert_eq!(
            validate_key("bad key!"),
            Err(ConfigError::InvalidKey("bad key!".into()))
        );
    }

    #[test]
    fn from_env_overrides_and_normalizes() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("TIDEPOOL_HOST", "signal.local");
            env::set_var("TIDEPOOL_PORT", "not-a-port");
            env::set_var("TIDEPOOL_PATH", "/rtc");
            env::set_var("TIDEPOOL_LOCALHOST_ONLY", "1");
        }
        let options = PeerOptions::from_env();
        assert_eq!(options.host, "signal.local");
        assert_eq!(options.port, CLOUD_PORT);
        assert_eq!(options.path, "/rtc/");
        assert!(options.ice_servers.is_empty());
        unsafe {
            env::remove_var("TIDEPOOL_HOST");
            env::remove_var("TIDEPOOL_PORT");
            env::remove_var("TIDEPOOL_PATH");
            env::remove_var("TIDEPOOL_LOCALHOST_ONLY");
        }
    }
}
