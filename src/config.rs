use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("LINEUP_TLS_CERT and LINEUP_TLS_KEY must be set together")]
    TlsHalfConfigured,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub http_bind: SocketAddr,
    pub pg_bind: SocketAddr,
    pub data_dir: PathBuf,
    pub admin_token: String,
    pub user_token: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: String,
    pub key: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls = match (lookup("LINEUP_TLS_CERT"), lookup("LINEUP_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::TlsHalfConfigured),
        };
        Ok(Self {
            http_bind: try_load(&lookup, "LINEUP_HTTP_BIND", "0.0.0.0:8080")?,
            pg_bind: try_load(&lookup, "LINEUP_PG_BIND", "0.0.0.0:5433")?,
            data_dir: try_load(&lookup, "LINEUP_DATA_DIR", "./data")?,
            admin_token: try_load(&lookup, "LINEUP_ADMIN_TOKEN", "lineup")?,
            user_token: lookup("LINEUP_USER_TOKEN").filter(|t| !t.is_empty()),
            max_connections: try_load(&lookup, "LINEUP_MAX_CONNECTIONS", "256")?,
            compact_threshold: try_load(&lookup, "LINEUP_COMPACT_THRESHOLD", "1000")?,
            metrics_port: try_load_opt(&lookup, "LINEUP_METRICS_PORT")?,
            tls,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("lineup.wal")
    }
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let value = lookup(key).unwrap_or_else(|| {
        debug!("{key} not set, using default: {default}");
        default.to_string()
    });
    parse(key, value)
}

fn try_load_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: Display,
{
    lookup(key).map(|value| parse(key, value)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.http_bind, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(c.pg_bind.port(), 5433);
        assert_eq!(c.wal_path(), PathBuf::from("./data/lineup.wal"));
        assert_eq!(c.admin_token, "lineup");
        assert_eq!(c.user_token, None);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.tls, None);
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("LINEUP_HTTP_BIND", "127.0.0.1:9000"),
            ("LINEUP_USER_TOKEN", "visitor"),
            ("LINEUP_METRICS_PORT", "9100"),
            ("LINEUP_TLS_CERT", "cert.pem"),
            ("LINEUP_TLS_KEY", "key.pem"),
        ])
        .unwrap();
        assert_eq!(c.http_bind.port(), 9000);
        assert_eq!(c.user_token.as_deref(), Some("visitor"));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.tls.unwrap().key, "key.pem");
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = config(&[("LINEUP_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LINEUP_MAX_CONNECTIONS", .. }));
        assert!(err.to_string().contains("LINEUP_MAX_CONNECTIONS"));
        assert_eq!(
            config(&[("LINEUP_TLS_CERT", "cert.pem")]).unwrap_err(),
            ConfigError::TlsHalfConfigured
        );
    }
}
