use std::{
    env,
    net::{AddrParseError, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use nostr::nip77::MIN_FRAME_SIZE_LIMIT;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct Config {
    pub secret_key: Option<[u8; 32]>,
    pub db_path: PathBuf,
    pub sync_bind: SocketAddr,
    pub public_addrs: Vec<String>,
    pub name: String,
    pub description: String,
    pub contact: String,
    pub supported_nips: Vec<u32>,
    pub upload_interval: Duration,
    pub sync_interval: Duration,
    pub dht_timeout: Duration,
    pub http_timeout: Duration,
    pub frame_size_limit: u64,
    pub session_idle_timeout: Duration,
    pub bootstrap_keys: Vec<[u8; 32]>,
    pub dag_kinds: Vec<u16>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid RELAY_SECRET_KEY: {0}")]
    InvalidSecretKey(String),
    #[error("RELAY_SECRET_KEY is required")]
    MissingSecretKey,
    #[error("invalid RELAY_SYNC_BIND: {0}")]
    SyncBindParse(#[from] AddrParseError),
    #[error("invalid RELAY_SUPPORTED_NIPS: {0}")]
    InvalidSupportedNips(String),
    #[error("invalid RELAY_UPLOAD_INTERVAL_SECS: {0}")]
    InvalidUploadInterval(String),
    #[error("invalid RELAY_SYNC_INTERVAL_SECS: {0}")]
    InvalidSyncInterval(String),
    #[error("invalid RELAY_DHT_TIMEOUT_SECS: {0}")]
    InvalidDhtTimeout(String),
    #[error("invalid RELAY_HTTP_TIMEOUT_SECS: {0}")]
    InvalidHttpTimeout(String),
    #[error("invalid RELAY_FRAME_SIZE_LIMIT: {0}")]
    InvalidFrameSizeLimit(String),
    #[error("invalid RELAY_SESSION_IDLE_TIMEOUT_SECS: {0}")]
    InvalidSessionIdleTimeout(String),
    #[error("invalid RELAY_BOOTSTRAP_KEYS: {0}")]
    InvalidBootstrapKeys(String),
    #[error("invalid RELAY_DAG_KINDS: {0}")]
    InvalidDagKinds(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let secret_key = lookup("RELAY_SECRET_KEY")
            .map(|raw| parse_key_hex(&raw).map_err(ConfigError::InvalidSecretKey))
            .transpose()?;
        let db_path = PathBuf::from(
            lookup("RELAY_DB_PATH").unwrap_or_else(|| "relay.sqlite3".to_string()),
        );
        let sync_bind = lookup("RELAY_SYNC_BIND")
            .unwrap_or_else(|| "0.0.0.0:9736".to_string())
            .parse()?;
        let public_addrs = lookup("RELAY_PUBLIC_ADDRS")
            .map(|raw| split_list(&raw).map(ToString::to_string).collect())
            .unwrap_or_default();

        let name = lookup("RELAY_NAME").unwrap_or_else(|| "openagents-relay".to_string());
        let description = lookup("RELAY_DESCRIPTION").unwrap_or_default();
        let contact = lookup("RELAY_CONTACT").unwrap_or_default();
        let supported_nips = parse_list_with_lookup(&lookup, "RELAY_SUPPORTED_NIPS", vec![1, 11, 77])
            .map_err(ConfigError::InvalidSupportedNips)?;

        let upload_interval = parse_secs(&lookup, "RELAY_UPLOAD_INTERVAL_SECS", 3600)
            .map_err(ConfigError::InvalidUploadInterval)?;
        let sync_interval = parse_secs(&lookup, "RELAY_SYNC_INTERVAL_SECS", 300)
            .map_err(ConfigError::InvalidSyncInterval)?;
        let dht_timeout = parse_secs(&lookup, "RELAY_DHT_TIMEOUT_SECS", 30)
            .map_err(ConfigError::InvalidDhtTimeout)?;
        let http_timeout = parse_secs(&lookup, "RELAY_HTTP_TIMEOUT_SECS", 10)
            .map_err(ConfigError::InvalidHttpTimeout)?;
        let session_idle_timeout = parse_secs(&lookup, "RELAY_SESSION_IDLE_TIMEOUT_SECS", 60)
            .map_err(ConfigError::InvalidSessionIdleTimeout)?;

        let frame_size_limit = match lookup("RELAY_FRAME_SIZE_LIMIT") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|error| ConfigError::InvalidFrameSizeLimit(error.to_string()))?,
            None => MIN_FRAME_SIZE_LIMIT,
        };
        if frame_size_limit < MIN_FRAME_SIZE_LIMIT {
            return Err(ConfigError::InvalidFrameSizeLimit(format!(
                "{frame_size_limit} is below the minimum of {MIN_FRAME_SIZE_LIMIT}"
            )));
        }

        let bootstrap_keys = match lookup("RELAY_BOOTSTRAP_KEYS") {
            Some(raw) => split_list(&raw)
                .map(parse_key_hex)
                .collect::<Result<Vec<_>, _>>()
                .map_err(ConfigError::InvalidBootstrapKeys)?,
            None => Vec::new(),
        };
        let dag_kinds = parse_list_with_lookup(&lookup, "RELAY_DAG_KINDS", vec![117])
            .map_err(ConfigError::InvalidDagKinds)?;

        Ok(Self {
            secret_key,
            db_path,
            sync_bind,
            public_addrs,
            name,
            description,
            contact,
            supported_nips,
            upload_interval,
            sync_interval,
            dht_timeout,
            http_timeout,
            frame_size_limit,
            session_idle_timeout,
            bootstrap_keys,
            dag_kinds,
        })
    }

    pub fn require_secret_key(&self) -> Result<[u8; 32], ConfigError> {
        self.secret_key.ok_or(ConfigError::MissingSecretKey)
    }
}

/// 64 hex chars to 32 bytes.
pub fn parse_key_hex(raw: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(raw.trim()).map_err(|error| format!("{raw}: {error}"))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| format!("{raw}: expected 32 bytes, got {}", bytes.len()))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration, String> {
    let secs = match lookup(key) {
        Some(raw) => raw.parse::<u64>().map_err(|error| format!("{raw}: {error}"))?,
        None => default,
    };
    if secs == 0 {
        return Err("must be greater than zero".to_string());
    }
    Ok(Duration::from_secs(secs))
}

fn parse_list_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Vec<T>,
) -> Result<Vec<T>, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => split_list(&raw)
            .map(|item| item.parse::<T>().map_err(|error| format!("{item}: {error}")))
            .collect(),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, ConfigError};

    fn config_from(values: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let values: HashMap<String, String> = values
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).expect("defaults parse");
        assert!(config.secret_key.is_none());
        assert_eq!(config.db_path.to_str(), Some("relay.sqlite3"));
        assert_eq!(config.sync_bind.port(), 9736);
        assert_eq!(config.supported_nips, vec![1, 11, 77]);
        assert_eq!(config.upload_interval.as_secs(), 3600);
        assert_eq!(config.sync_interval.as_secs(), 300);
        assert_eq!(config.dht_timeout.as_secs(), 30);
        assert_eq!(config.http_timeout.as_secs(), 10);
        assert_eq!(config.frame_size_limit, 4096);
        assert_eq!(config.session_idle_timeout.as_secs(), 60);
        assert!(config.bootstrap_keys.is_empty());
        assert_eq!(config.dag_kinds, vec![117]);
        assert!(matches!(
            config.require_secret_key(),
            Err(ConfigError::MissingSecretKey)
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let secret = "11".repeat(32);
        let bootstrap = format!("{}, {}", "22".repeat(32), "33".repeat(32));
        let config = config_from(&[
            ("RELAY_SECRET_KEY", secret.as_str()),
            ("RELAY_SYNC_BIND", "127.0.0.1:4000"),
            ("RELAY_PUBLIC_ADDRS", "/ip4/10.0.0.1/tcp/4000, relay.example:4000"),
            ("RELAY_SUPPORTED_NIPS", "1,77"),
            ("RELAY_FRAME_SIZE_LIMIT", "8192"),
            ("RELAY_BOOTSTRAP_KEYS", bootstrap.as_str()),
            ("RELAY_DAG_KINDS", "117, 30117"),
            ("RELAY_NAME", "  "),
        ])
        .expect("overrides parse");

        assert_eq!(config.secret_key, Some([0x11; 32]));
        assert_eq!(config.sync_bind.to_string(), "127.0.0.1:4000");
        assert_eq!(
            config.public_addrs,
            vec!["/ip4/10.0.0.1/tcp/4000", "relay.example:4000"]
        );
        assert_eq!(config.supported_nips, vec![1, 77]);
        assert_eq!(config.frame_size_limit, 8192);
        assert_eq!(config.bootstrap_keys, vec![[0x22; 32], [0x33; 32]]);
        assert_eq!(config.dag_kinds, vec![117, 30117]);
        assert_eq!(config.name, "openagents-relay");
    }

    #[test]
    fn invalid_values_name_their_key() {
        struct Case {
            key: &'static str,
            value: &'static str,
            fragment: &'static str,
        }

        let cases = [
            Case {
                key: "RELAY_SECRET_KEY",
                value: "abcd",
                fragment: "RELAY_SECRET_KEY",
            },
            Case {
                key: "RELAY_SYNC_BIND",
                value: "not-an-addr",
                fragment: "RELAY_SYNC_BIND",
            },
            Case {
                key: "RELAY_FRAME_SIZE_LIMIT",
                value: "1024",
                fragment: "RELAY_FRAME_SIZE_LIMIT",
            },
            Case {
                key: "RELAY_SYNC_INTERVAL_SECS",
                value: "0",
                fragment: "RELAY_SYNC_INTERVAL_SECS",
            },
            Case {
                key: "RELAY_DAG_KINDS",
                value: "117,abc",
                fragment: "RELAY_DAG_KINDS",
            },
            Case {
                key: "RELAY_BOOTSTRAP_KEYS",
                value: "zz",
                fragment: "RELAY_BOOTSTRAP_KEYS",
            },
        ];

        for case in cases {
            let error = config_from(&[(case.key, case.value)]).expect_err("invalid value");
            assert!(
                error.to_string().contains(case.fragment),
                "{}: '{}' should mention {}",
                case.key,
                error,
                case.fragment
            );
        }
    }
}
