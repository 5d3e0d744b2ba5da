use kv_connector::ConnectorConfig;
use std::env;

/// Configuration for benchmarks, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Run against Redis (BENCH_REDIS=1, endpoint from REDIS_HOST/REDIS_PORT) instead of the
    /// in-process store.
    pub use_redis: bool,

    /// Simulated database latency in milliseconds (from DB_LATENCY_MS env var, defaults to 5)
    pub db_latency_ms: u64,

    /// Sample size for benchmarks (from BENCH_SAMPLE_SIZE env var, defaults to 50)
    pub sample_size: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            use_redis: env::var("BENCH_REDIS").is_ok_and(|v| v == "1" || v == "true"),
            db_latency_ms: env::var("DB_LATENCY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            sample_size: env::var("BENCH_SAMPLE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50),
        }
    }
}

impl BenchConfig {
    pub fn new() -> Self {
        let config = Self::default();
        eprintln!("Benchmark Configuration:");
        if config.use_redis {
            eprintln!("  Store: redis at {}", ConnectorConfig::from_env().endpoint());
        } else {
            eprintln!("  Store: memory");
        }
        eprintln!("  DB Latency: {}ms", config.db_latency_ms);
        eprintln!("  Sample Size: {}", config.sample_size);
        config
    }
}
