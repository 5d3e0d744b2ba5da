use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Cached document used by the JSON benchmarks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchReport {
    pub user_id: u64,
    pub instrument: String,
    pub answers: Vec<u8>,
    pub total: u32,
}

impl BenchReport {
    pub fn new(user_id: u64) -> Self {
        let answers: Vec<u8> = (0..9).map(|i| ((user_id + i) % 4) as u8).collect();
        Self {
            user_id,
            instrument: "phq9".to_string(),
            total: answers.iter().map(|a| *a as u32).sum(),
            answers,
        }
    }
}

/// Simulated database with configurable latency
#[derive(Clone)]
pub struct FakeDatabase {
    data: Arc<HashMap<String, BenchReport>>,
    latency_ms: u64,
    query_count: Arc<AtomicUsize>,
}

impl FakeDatabase {
    pub fn new(num_reports: usize, latency_ms: u64) -> Self {
        let data = (0..num_reports)
            .map(|i| (format!("report:{}", i), BenchReport::new(i as u64)))
            .collect();

        Self {
            data: Arc::new(data),
            latency_ms,
            query_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn load(&self, key: &str) -> Result<Option<BenchReport>, std::convert::Infallible> {
        self.query_count.fetch_add(1, Ordering::Relaxed);

        // Simulate database latency
        tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;

        Ok(self.data.get(key).cloned())
    }

    #[allow(dead_code)]
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }
}

/// Generate cache keys and client scopes for different workload patterns
pub struct Workload {
    num_keys: usize,
}

impl Workload {
    pub fn new(num_keys: usize) -> Self {
        Self { num_keys }
    }

    /// Every key once, in order (cold cache)
    pub fn sequential(&self) -> Vec<String> {
        (0..self.num_keys).map(|i| format!("report:{}", i)).collect()
    }

    /// 80% of requests go to 20% of keys
    pub fn skewed(&self, count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                let id = if rng.gen_bool(0.8) {
                    rng.gen_range(0..(self.num_keys / 5).max(1))
                } else {
                    rng.gen_range(0..self.num_keys)
                };
                format!("report:{}", id)
            })
            .collect()
    }

    /// Rate-limit scopes for `clients` distinct addresses on one path
    pub fn client_scopes(&self, count: usize, clients: u32) -> Vec<String> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                let ip = rng.gen_range(0..clients.max(1));
                format!("/api/assess:10.{}.{}.{}", (ip >> 16) & 0xff, (ip >> 8) & 0xff, ip & 0xff)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #[tokio::test]
    async fn test_fake_database() {
        use super::FakeDatabase;

        let db = FakeDatabase::new(100, 1);

        let report = db.load("report:0").await.unwrap();
        assert_eq!(report.unwrap().user_id, 0);
        assert_eq!(db.query_count(), 1);
    }

    #[test]
    fn test_workload() {
        use super::Workload;

        let workload = Workload::new(100);
        assert_eq!(workload.sequential()[0], "report:0");
        assert_eq!(workload.skewed(50).len(), 50);
        assert!(
            workload
                .client_scopes(10, 4)
                .iter()
                .all(|s| s.starts_with("/api/assess:10.0.0."))
        );
    }
}
