use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Key lookup used to build a [`Config`]; the process environment in production.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Read a profiled key: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_opt(lookup: Lookup<'_>, profile: &str, key: &str) -> Option<String> {
    let get = |k: &str| lookup(k).filter(|s| !s.trim().is_empty());
    if !profile.is_empty() {
        if let Some(v) = get(&format!("{}_{}", profile, key)) {
            return Some(v);
        }
    }
    get(key)
}

fn profiled_or(lookup: Lookup<'_>, profile: &str, key: &str, default: &str) -> String {
    profiled_opt(lookup, profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_parse<T: std::str::FromStr>(lookup: Lookup<'_>, profile: &str, key: &str, default: T) -> T {
    profiled_opt(lookup, profile, key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub scheduler: SchedulerConfig,
    pub alerts: AlertConfig,
    pub postgres: PostgresConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `WATCHPOST_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: Lookup<'_>) -> Self {
        let profile = lookup("WATCHPOST_PROFILE")
            .unwrap_or_default()
            .trim()
            .to_uppercase();
        let p = profile.as_str();
        Self {
            profile: profile.clone(),
            scheduler: SchedulerConfig::from_lookup(lookup, p),
            alerts: AlertConfig::from_lookup(lookup, p),
            postgres: PostgresConfig::from_lookup(lookup, p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  scheduler:   app_name={}, max_jobs={}, poll_interval={}s, drain_grace={}ms",
            self.scheduler.app_name,
            self.scheduler.max_jobs,
            self.scheduler.poll_interval.as_secs(),
            self.scheduler.drain_grace.as_millis()
        );
        tracing::info!(
            "  execution:   http_timeout={}s, dump_path={}",
            self.scheduler.http_timeout.as_secs(),
            self.scheduler.dump_path.display()
        );
        tracing::info!("  alerts:      channels=[{}]", self.alerts.channels.join(", "));
        tracing::info!(
            "  postgres:    host={}, port={}, db={}, ssl_mode={}",
            self.postgres.host,
            self.postgres.port,
            self.postgres.database,
            self.postgres.ssl_mode
        );
    }
}

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Instance name: written to `claimed_by` and used as the notification channel.
    pub app_name: String,
    /// Registry capacity.
    pub max_jobs: usize,
    pub poll_interval: Duration,
    /// Upper bound on waiting for in-flight completions while draining.
    /// Longer loses fewer last-second execution records, shorter stops faster.
    pub drain_grace: Duration,
    pub http_timeout: Duration,
    /// Where the registry is dumped if the release fails.
    pub dump_path: PathBuf,
}

impl SchedulerConfig {
    fn from_lookup(lookup: Lookup<'_>, p: &str) -> Self {
        Self {
            app_name: profiled_or(lookup, p, "APP_NAME", "application1"),
            max_jobs: profiled_parse(lookup, p, "MAX_JOBS", 10_000),
            poll_interval: Duration::from_secs(
                profiled_parse(lookup, p, "POLL_INTERVAL_SECONDS", 60u64).max(1),
            ),
            drain_grace: Duration::from_millis(profiled_parse(lookup, p, "DRAIN_GRACE_MS", 2_000)),
            http_timeout: Duration::from_secs(profiled_parse(lookup, p, "HTTP_TIMEOUT_SECONDS", 30)),
            dump_path: PathBuf::from(profiled_or(lookup, p, "DUMP_PATH", "./dump.json")),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_lookup(&|_| None, "")
    }
}

// ── Alerts ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Enabled alert strategy names.
    pub channels: Vec<String>,
}

impl AlertConfig {
    fn from_lookup(lookup: Lookup<'_>, p: &str) -> Self {
        let channels = profiled_or(lookup, p, "ALERT_CHANNELS", "http")
            .split(',')
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        Self { channels }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub ssl_mode: String,
    pub ssl_root_cert: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_lookup(lookup: Lookup<'_>, p: &str) -> Self {
        Self {
            host: profiled_or(lookup, p, "PG_HOST", "localhost"),
            port: profiled_parse(lookup, p, "PG_PORT", 5432),
            database: profiled_or(lookup, p, "PG_DATABASE", "watchpost"),
            username: profiled_opt(lookup, p, "PG_USERNAME"),
            password: profiled_opt(lookup, p, "PG_PASSWORD"),
            ssl_mode: profiled_or(lookup, p, "PG_SSL_MODE", "prefer"),
            ssl_root_cert: profiled_opt(lookup, p, "PG_SSL_ROOT_CERT"),
            ssl_cert: profiled_opt(lookup, p, "PG_SSL_CERT"),
            ssl_key: profiled_opt(lookup, p, "PG_SSL_KEY"),
            max_connections: profiled_parse(lookup, p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        let mut url = format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        );
        for (param, value) in [
            ("sslrootcert", &self.ssl_root_cert),
            ("sslcert", &self.ssl_cert),
            ("sslkey", &self.ssl_key),
        ] {
            if let Some(v) = value {
                url.push_str(&format!("&{}={}", param, v));
            }
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(&move |k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.profile_label(), "default");
        assert_eq!(cfg.scheduler.app_name, "application1");
        assert_eq!(cfg.scheduler.max_jobs, 10_000);
        assert_eq!(cfg.scheduler.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.scheduler.drain_grace, Duration::from_millis(2_000));
        assert_eq!(cfg.scheduler.dump_path, PathBuf::from("./dump.json"));
        assert_eq!(cfg.alerts.channels, vec!["http".to_string()]);
        assert_eq!(cfg.postgres.port, 5432);
    }

    #[test]
    fn profile_prefixed_keys_win() {
        let cfg = config_from(&[
            ("WATCHPOST_PROFILE", "staging"),
            ("APP_NAME", "plain"),
            ("STAGING_APP_NAME", "staged"),
            ("MAX_JOBS", "25"),
        ]);
        assert_eq!(cfg.profile, "STAGING");
        assert_eq!(cfg.scheduler.app_name, "staged");
        assert_eq!(cfg.scheduler.max_jobs, 25);
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        let cfg = config_from(&[("MAX_JOBS", "lots"), ("POLL_INTERVAL_SECONDS", "0")]);
        assert_eq!(cfg.scheduler.max_jobs, 10_000);
        assert_eq!(cfg.scheduler.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn alert_channels_are_split_and_lowercased() {
        let cfg = config_from(&[("ALERT_CHANNELS", " HTTP, ,slack ")]);
        assert_eq!(cfg.alerts.channels, vec!["http".to_string(), "slack".to_string()]);
    }

    #[test]
    fn connection_string_carries_tls_material() {
        let cfg = config_from(&[
            ("PG_USERNAME", "svc"),
            ("PG_PASSWORD", "pw"),
            ("PG_SSL_MODE", "verify-full"),
            ("PG_SSL_ROOT_CERT", "/etc/ca.pem"),
        ]);
        assert_eq!(
            cfg.postgres.connection_string(),
            "postgres://svc:pw@localhost:5432/watchpost?sslmode=verify-full&sslrootcert=/etc/ca.pem"
        );
    }
}
