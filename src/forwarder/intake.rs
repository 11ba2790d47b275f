use super::batch::Batch;
use crate::error::ConnectorError;
use crate::http::{HttpClient, HttpError, RetryPolicy};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The intake refused the batch for good (4xx other than 429)
    Rejected { status: u16, body: String },
}

/// Where finished batches go.
#[async_trait]
pub trait IntakeSink: Send + Sync {
    async fn push(&self, batch: &Batch) -> Result<PushOutcome, ConnectorError>;
}

/// POSTs batches as `{"intake_key": …, "events": […]}` to `<server><path>`.
#[derive(Debug, Clone)]
pub struct IntakeClient {
    url: String,
    http: HttpClient,
}

impl IntakeClient {
    pub fn new(
        server: &str,
        path: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ConnectorError> {
        let url = format!(
            "{}/{}",
            server.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        // The intake client gets its own stop token so an in-flight push
        // completes during shutdown
        let http = HttpClient::builder("intake")
            .timeout(timeout)
            .retry(retry)
            .build()?;
        Ok(Self { url, http })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IntakeSink for IntakeClient {
    async fn push(&self, batch: &Batch) -> Result<PushOutcome, ConnectorError> {
        match self.http.post(&self.url, &batch.payload(), None).await {
            Ok(_) => Ok(PushOutcome::Accepted),
            Err(HttpError::Status { status, body, .. }) => Ok(PushOutcome::Rejected { status, body }),
            Err(HttpError::Auth(body)) => Ok(PushOutcome::Rejected { status: 401, body }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let client = IntakeClient::new(
            "https://intake.example.com/",
            "/batch",
            Duration::from_secs(5),
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(client.url(), "https://intake.example.com/batch");
    }
}
