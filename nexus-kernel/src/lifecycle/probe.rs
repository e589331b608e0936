use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Readiness check against a managed service. Only a 200 counts as ready.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_ready(&self, url: &str) -> bool;
}

pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn is_ready(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url, error = %e, "readiness probe unreachable");
                false
            }
        }
    }
}
