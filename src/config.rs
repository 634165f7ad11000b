use std::fmt;
use std::path::PathBuf;

use crate::model::Ms;

/// Runtime settings, read from `CARESCHED_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// How long a confirmation token stays redeemable.
    pub confirmation_hours: u32,
    /// Base URL of the patient-facing frontend, used in confirmation links.
    pub frontend_url: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "caresched".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            confirmation_hours: 24,
            frontend_url: "http://localhost:3000".into(),
        }
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables keep their defaults;
    /// set but unparsable ones are an error rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let confirmation_hours: u32 =
            parsed(&lookup, "CARESCHED_CONFIRMATION_HOURS")?.unwrap_or(d.confirmation_hours);
        if confirmation_hours == 0 {
            return Err(ConfigError {
                var: "CARESCHED_CONFIRMATION_HOURS",
                value: "0".into(),
            });
        }
        Ok(Self {
            port: parsed(&lookup, "CARESCHED_PORT")?.unwrap_or(d.port),
            bind: lookup("CARESCHED_BIND").unwrap_or(d.bind),
            data_dir: lookup("CARESCHED_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("CARESCHED_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "CARESCHED_MAX_CONNECTIONS")?
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "CARESCHED_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            metrics_port: parsed(&lookup, "CARESCHED_METRICS_PORT")?,
            tls_cert: lookup("CARESCHED_TLS_CERT"),
            tls_key: lookup("CARESCHED_TLS_KEY"),
            confirmation_hours,
            frontend_url: lookup("CARESCHED_FRONTEND_URL").unwrap_or(d.frontend_url),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("caresched.wal")
    }

    pub fn confirmation_ttl_ms(&self) -> Ms {
        Ms::from(self.confirmation_hours) * 3_600_000
    }
}
