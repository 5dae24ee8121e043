use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read once from `KITLEND_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub allocation_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7401,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            allocation_seed: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparsable values fall back to
    /// the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| parse::<u64>(&v));
        Self {
            port: lookup("KITLEND_PORT")
                .and_then(|v| parse(&v))
                .unwrap_or(defaults.port),
            bind: lookup("KITLEND_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("KITLEND_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: lookup("KITLEND_MAX_CONNECTIONS")
                .and_then(|v| parse(&v))
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed("KITLEND_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("KITLEND_METRICS_PORT").and_then(|v| parse(&v)),
            allocation_seed: parsed("KITLEND_ALLOCATION_SEED"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("kitlend.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}
