//! Health sampling and classification for the cutover monitoring window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One point-in-time observation of the target endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub observed_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub ok: bool,
    pub error_count: u32,
    pub latency_ms: u64,
}

impl HealthSample {
    pub fn healthy(status_code: u16, latency_ms: u64) -> Self {
        Self {
            observed_at: Utc::now(),
            status_code: Some(status_code),
            ok: true,
            error_count: 0,
            latency_ms,
        }
    }

    pub fn failed(status_code: Option<u16>, latency_ms: u64) -> Self {
        Self {
            observed_at: Utc::now(),
            status_code,
            ok: false,
            error_count: 1,
            latency_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Summed error count over the window that flips the classification
    /// to Failed.
    pub error_threshold: u32,
    /// Consecutive non-success probes that flip it to Failed.
    pub max_consecutive_failures: u32,
}

/// Threshold classification over a sampling window.
pub fn classify(window: &[HealthSample], policy: &HealthPolicy) -> HealthStatus {
    let errors: u32 = window.iter().map(|s| s.error_count).sum();

    let trailing_failures = window.iter().rev().take_while(|s| !s.ok).count() as u32;

    if errors > policy.error_threshold || trailing_failures > policy.max_consecutive_failures {
        HealthStatus::Failed
    } else if errors > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[async_trait]
pub trait HealthEndpoint: Send + Sync {
    /// Never fails: transport errors become failed samples.
    async fn probe(&self) -> HealthSample;
}

/// HTTP GET against the application's health endpoint.
pub struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
}

impl HttpEndpoint {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        Self { client, url }
    }
}

#[async_trait]
impl HealthEndpoint for HttpEndpoint {
    async fn probe(&self) -> HealthSample {
        let started = Instant::now();
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                let latency = started.elapsed().as_millis() as u64;
                let code = resp.status().as_u16();
                if resp.status().is_success() {
                    HealthSample::healthy(code, latency)
                } else {
                    HealthSample::failed(Some(code), latency)
                }
            }
            Err(e) => {
                debug!("Health probe failed: {:#}", e);
                HealthSample::failed(None, started.elapsed().as_millis() as u64)
            }
        }
    }
}

pub struct HealthProber {
    endpoint: Arc<dyn HealthEndpoint>,
    policy: HealthPolicy,
    retries: u32,
    interval: Duration,
}

impl HealthProber {
    pub fn new(
        endpoint: Arc<dyn HealthEndpoint>,
        policy: HealthPolicy,
        retries: u32,
        interval: Duration,
    ) -> Self {
        Self {
            endpoint,
            policy,
            retries,
            interval,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub async fn sample(&self) -> HealthSample {
        let sample = self.endpoint.probe().await;
        debug!(
            ok = sample.ok,
            status = ?sample.status_code,
            latency_ms = sample.latency_ms,
            "health sample"
        );
        sample
    }

    /// Poll until a healthy probe or the retry bound runs out. The bound is
    /// hard: exhausting it reports Failed to the caller, never a silent
    /// indefinite retry.
    pub async fn await_healthy(&self) -> HealthStatus {
        for attempt in 1..=self.retries {
            let sample = self.sample().await;
            if sample.ok {
                return HealthStatus::Healthy;
            }
            debug!("Not healthy yet (attempt {}/{})", attempt, self.retries);
            tokio::time::sleep(self.interval).await;
        }
        HealthStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            error_threshold: 10,
            max_consecutive_failures: 3,
        }
    }

    #[test]
    fn empty_window_is_healthy() {
        assert_eq!(classify(&[], &policy()), HealthStatus::Healthy);
    }

    #[test]
    fn nonzero_errors_below_threshold_is_degraded() {
        let mut window = vec![HealthSample::healthy(200, 5); 20];
        window[3] = HealthSample::failed(Some(500), 5);
        window[7] = HealthSample::failed(Some(502), 5);
        assert_eq!(classify(&window, &policy()), HealthStatus::Degraded);
    }

    #[test]
    fn errors_over_threshold_is_failed() {
        let mut window: Vec<HealthSample> = (0..15)
            .map(|_| HealthSample::failed(Some(500), 5))
            .collect();
        // Interleave successes so the consecutive rule alone cannot trip.
        for i in (0..window.len()).step_by(2) {
            window.insert(i, HealthSample::healthy(200, 5));
        }
        assert_eq!(classify(&window, &policy()), HealthStatus::Failed);
    }

    #[test]
    fn consecutive_failures_trip_before_error_budget() {
        let mut window = vec![HealthSample::healthy(200, 5); 10];
        window.extend((0..4).map(|_| HealthSample::failed(None, 5)));
        assert_eq!(classify(&window, &policy()), HealthStatus::Failed);
    }

    #[test]
    fn trailing_success_resets_consecutive_count() {
        let mut window = vec![HealthSample::failed(Some(500), 5); 3];
        window.push(HealthSample::healthy(200, 5));
        assert_eq!(classify(&window, &policy()), HealthStatus::Degraded);
    }
}
