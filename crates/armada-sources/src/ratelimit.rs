use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter shared by every source talking to one base URL.
/// `None` rate means the limiter is disabled and acquisition never waits.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens added per second.
    rate: Option<f64>,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_hour: f64) -> Self {
        let rate = requests_per_hour / 3600.0;
        Self {
            rate: Some(rate),
            // Allow short bursts without letting a backlog form.
            burst: (rate * 10.0).max(1.0),
            bucket: Mutex::new(Bucket {
                tokens: (rate * 10.0).max(1.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// A disabled limiter maps to "infinite".
    pub fn unlimited() -> Self {
        Self {
            rate: None,
            burst: 0.0,
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until one request token is available.
    pub async fn acquire(&self) {
        let Some(rate) = self.rate else {
            return;
        };

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * rate).min(self.burst);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / rate)
            };
            tracing::debug!(?wait, "rate limited, waiting for token");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Default limits per host type, in requests per hour. Matches the
/// documented API budgets of each host; config can override.
pub(crate) fn default_requests_per_hour(kind: &str) -> Option<f64> {
    match kind {
        "github" => Some(5000.0),
        "gitlab" => Some(10.0 * 3600.0),
        "bitbucketserver" => Some(8.0 * 3600.0),
        "bitbucketcloud" => Some(2.0 * 3600.0),
        _ => None,
    }
}
