use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;

/// Bounded retry for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(20),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter on top: `base * 2^(attempt-1) + rand[0, base]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1 << attempt.saturating_sub(1).min(10));
        let jitter_ms = self.base_delay.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Knobs for one tenant's engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on any single lock acquisition or WAL append.
    pub store_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// Process-level settings, read from `SERIALBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(&format!("SERIALBOOK_{name}"));

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            store_timeout: parsed(&get, "STORE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            retry: RetryPolicy {
                attempts: parsed(&get, "RETRY_ATTEMPTS")
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(defaults.retry.attempts),
                base_delay: parsed(&get, "RETRY_BASE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_delay),
            },
        };

        Self {
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&get, "PORT").unwrap_or(5434),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("PASSWORD").unwrap_or_else(|| "serialbook".into()),
            max_connections: parsed(&get, "MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&get, "COMPACT_THRESHOLD").unwrap_or(1000),
            tls_cert: get("TLS_CERT"),
            tls_key: get("TLS_KEY"),
            metrics_port: parsed(&get, "METRICS_PORT"),
            engine,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    get(name).and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = ServerConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.port, 5434);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.engine, EngineConfig::default());
        assert!(cfg.metrics_port.is_none());
    }

    #[test]
    fn overrides_and_bad_values() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("SERIALBOOK_PORT", "6000"),
            ("SERIALBOOK_STORE_TIMEOUT_MS", "250"),
            ("SERIALBOOK_RETRY_ATTEMPTS", "0"),
            ("SERIALBOOK_MAX_CONNECTIONS", "lots"),
        ]));
        assert_eq!(cfg.listen_addr(), "0.0.0.0:6000");
        assert_eq!(cfg.engine.store_timeout, Duration::from_millis(250));
        assert_eq!(cfg.engine.retry.attempts, 3);
        assert_eq!(cfg.max_connections, 256);
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(10),
        };
        let first = policy.backoff(1);
        let third = policy.backoff(3);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(20));
        assert!(third >= Duration::from_millis(40) && third <= Duration::from_millis(50));
    }
}
