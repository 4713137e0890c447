//! Runtime configuration loading from environment variables.
//!
//! All values are loaded from `INFER_CORE_*` environment variables with
//! sensible defaults. Invalid values fall back to defaults without
//! crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `INFER_CORE_ENGINE_NUM` | 1 | Engine replicas per executor |
//! | `INFER_CORE_CACHE_CAPACITY` | 4 | Max packages buffered per executor |
//! | `INFER_CORE_BATCH_TIMEOUT_MS` | 100 | Dynamic batching timeout |
//! | `INFER_CORE_DEVICE_NUM` | 1 | Number of visible devices |
//! | `INFER_CORE_POOL_MAX_THREADS` | 0 | Pool ceiling (0 = 3 x logical CPUs) |

use serde::Serialize;

/// Effective runtime configuration summary, logged as JSON at startup.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub engine_num: usize,
    pub cache_capacity: usize,
    pub batch_timeout_ms: u64,
    pub device_num: usize,
    pub pool_max_threads: usize,
}

/// Runtime defaults loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Engine replicas created per executor unless the descriptor says
    /// otherwise.
    pub engine_num: usize,
    /// Package cache capacity per executor.
    pub cache_capacity: usize,
    /// How long the dynamic batcher holds a partial batch.
    pub batch_timeout_ms: u64,
    /// Device ids `0..device_num` are considered valid.
    pub device_num: usize,
    /// Upper bound on the per-device pool size.
    pub pool_max_threads: usize,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without
/// panicking.
pub fn load() -> EnvConfig {
    let engine_num = parse_usize("INFER_CORE_ENGINE_NUM", 1).max(1);
    let cache_capacity = parse_usize("INFER_CORE_CACHE_CAPACITY", 4).max(1);
    let batch_timeout_ms = parse_u64("INFER_CORE_BATCH_TIMEOUT_MS", 100).max(1);
    let device_num = parse_usize("INFER_CORE_DEVICE_NUM", 1).max(1);
    let pool_max_threads = parse_usize("INFER_CORE_POOL_MAX_THREADS", 0);

    EnvConfig {
        engine_num,
        cache_capacity,
        batch_timeout_ms,
        device_num,
        pool_max_threads,
    }
}

impl EnvConfig {
    /// Pool ceiling with the `0 = auto` rule applied.
    pub fn pool_ceiling(&self) -> usize {
        if self.pool_max_threads == 0 {
            3 * num_cpus::get()
        } else {
            self.pool_max_threads
        }
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            engine_num: self.engine_num,
            cache_capacity: self.cache_capacity,
            batch_timeout_ms: self.batch_timeout_ms,
            device_num: self.device_num,
            pool_max_threads: self.pool_ceiling(),
        }
    }

    /// Log the effective configuration once at startup.
    pub fn log_effective(&self) {
        match serde_json::to_string(&self.effective_config()) {
            Ok(json) => tracing::info!(config = %json, "runtime configuration loaded"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize configuration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "INFER_CORE_ENGINE_NUM",
        "INFER_CORE_CACHE_CAPACITY",
        "INFER_CORE_BATCH_TIMEOUT_MS",
        "INFER_CORE_DEVICE_NUM",
        "INFER_CORE_POOL_MAX_THREADS",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.engine_num, 1);
        assert_eq!(cfg.cache_capacity, 4);
        assert_eq!(cfg.batch_timeout_ms, 100);
        assert_eq!(cfg.device_num, 1);
        assert_eq!(cfg.pool_ceiling(), 3 * num_cpus::get());
    }

    #[test]
    fn env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("INFER_CORE_ENGINE_NUM", "3");
        std::env::set_var("INFER_CORE_CACHE_CAPACITY", "16");
        std::env::set_var("INFER_CORE_POOL_MAX_THREADS", "8");
        let cfg = load();
        assert_eq!(cfg.engine_num, 3);
        assert_eq!(cfg.cache_capacity, 16);
        assert_eq!(cfg.pool_ceiling(), 8);
        clear_env_vars();
    }

    #[test]
    fn invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("INFER_CORE_ENGINE_NUM", "not_a_number");
        std::env::set_var("INFER_CORE_BATCH_TIMEOUT_MS", "soon");
        let cfg = load();
        assert_eq!(cfg.engine_num, 1);
        assert_eq!(cfg.batch_timeout_ms, 100);
        clear_env_vars();
    }

    #[test]
    fn zero_values_are_floored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("INFER_CORE_ENGINE_NUM", "0");
        std::env::set_var("INFER_CORE_CACHE_CAPACITY", "0");
        let cfg = load();
        assert!(cfg.engine_num >= 1);
        assert!(cfg.cache_capacity >= 1);
        clear_env_vars();
    }

    #[test]
    fn effective_config_serializes() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        let json = serde_json::to_string(&cfg.effective_config()).unwrap();
        assert!(json.contains("engine_num"));
        assert!(json.contains("cache_capacity"));
    }
}
