//! Best-effort webhook notification of terminal deployment outcomes.

use std::time::Duration;
use tracing::{debug, warn};

use crate::deploy::attempt::DeploymentAttempt;

const RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Notifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl Notifier {
    pub fn new(url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");
        Self { client, url }
    }

    /// Post the outcome report. Delivery failures are logged and swallowed;
    /// a broken webhook must never change a deployment's result.
    pub async fn notify(&self, attempt: &DeploymentAttempt) {
        let url = match &self.url {
            Some(url) => url,
            None => return,
        };

        let payload = serde_json::json!({
            "attempt_id": attempt.id,
            "environment": attempt.environment,
            "phase": attempt.phase.to_string(),
            "outcome": attempt.outcome.map(|o| o.to_string()),
            "failure": attempt.failure,
            "snapshots": attempt.snapshots.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            "started_at": attempt.started_at,
            "ended_at": attempt.ended_at,
        });

        for (try_no, delay) in RETRY_DELAYS_SECS.iter().enumerate() {
            match self.try_send(url, &payload).await {
                Ok(()) => {
                    debug!("Notified {} of attempt {}", url, attempt.id);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Webhook delivery failed (try {}/{}): {:#}",
                        try_no + 1,
                        RETRY_DELAYS_SECS.len(),
                        e
                    );
                    tokio::time::sleep(Duration::from_secs(*delay)).await;
                }
            }
        }
        warn!("Giving up on webhook notification for attempt {}", attempt.id);
    }

    async fn try_send(&self, url: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        let resp = self.client.post(url).json(payload).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook returned HTTP {}", resp.status().as_u16());
        }
        Ok(())
    }
}
