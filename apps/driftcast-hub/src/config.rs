use std::env;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::sweeper::SweeperConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub store_backend: StoreBackend,
    /// Poll cadence for the Redis active-query subscription.
    pub store_poll_interval: Duration,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub sweep_error_cooldown: Duration,
    pub sweep_recovery_delay: Duration,
    pub sweep_restart_delay: Duration,
    pub sweep_max_errors: u32,
    pub propagation_delay: Duration,
    pub republish_delay: Duration,
    pub media_enabled: bool,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let store_backend = match env::var("DRIFTCAST_STORE").as_deref() {
            Ok("redis") => StoreBackend::Redis,
            Ok("memory") => StoreBackend::Memory,
            _ => defaults.store_backend,
        };

        Self {
            port: env::var("DRIFTCAST_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            store_backend,
            store_poll_interval: millis_env("STORE_POLL_INTERVAL_MS", defaults.store_poll_interval),
            sweep_interval: secs_env("SWEEP_INTERVAL", defaults.sweep_interval),
            stale_after: secs_env("STREAM_STALE_AFTER", defaults.stale_after),
            sweep_error_cooldown: secs_env("SWEEP_ERROR_COOLDOWN", defaults.sweep_error_cooldown),
            sweep_recovery_delay: secs_env("SWEEP_RECOVERY_DELAY", defaults.sweep_recovery_delay),
            sweep_restart_delay: secs_env("SWEEP_RESTART_DELAY", defaults.sweep_restart_delay),
            sweep_max_errors: env::var("SWEEP_MAX_ERRORS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_max_errors),
            propagation_delay: millis_env("PROPAGATION_DELAY_MS", defaults.propagation_delay),
            republish_delay: millis_env("REPUBLISH_DELAY_MS", defaults.republish_delay),
            media_enabled: env::var("MEDIA_ENABLED")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.media_enabled),
            log_filter: env::var("DRIFTCAST_LOG").unwrap_or(defaults.log_filter),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            propagation_delay: self.propagation_delay,
            republish_delay: self.republish_delay,
            media_enabled: self.media_enabled,
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.sweep_interval,
            stale_after: self.stale_after,
            error_cooldown: self.sweep_error_cooldown,
            recovery_delay: self.sweep_recovery_delay,
            restart_delay: self.sweep_restart_delay,
            max_consecutive_errors: self.sweep_max_errors,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8090,
            redis_url: "redis://localhost:6379".to_string(),
            store_backend: StoreBackend::Memory,
            store_poll_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(60 * 60),
            sweep_error_cooldown: Duration::from_secs(30),
            sweep_recovery_delay: Duration::from_secs(120),
            sweep_restart_delay: Duration::from_secs(300),
            sweep_max_errors: 3,
            propagation_delay: Duration::from_millis(150),
            republish_delay: Duration::from_millis(500),
            media_enabled: false,
            log_filter: "info".to_string(),
        }
    }
}

fn secs_env(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn millis_env(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
