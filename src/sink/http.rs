//! JSON-over-HTTP sink.

use super::{Publication, Sink, SinkError, SinkFuture};
use std::time::Duration;
use tracing::debug;

/// POSTs each publication as a JSON body.
#[derive(Debug, Clone)]
pub struct HttpSink {
    url: String,
    client: reqwest::Client,
}

impl HttpSink {
    /// Build a sink for `url`; `timeout` bounds each request.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Sink for HttpSink {
    fn publish<'a>(&'a self, publication: &'a Publication) -> SinkFuture<'a> {
        Box::pin(async move {
            let resp = self
                .client
                .post(&self.url)
                .json(publication)
                .send()
                .await
                .map_err(|e| SinkError::Request(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(SinkError::Status {
                    status: status.as_u16(),
                    url: self.url.clone(),
                });
            }

            debug!(url = %self.url, status = status.as_u16(), "Publication accepted");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::DEFAULT_ENDPOINT;

    #[test]
    fn test_new_keeps_url() {
        let sink = HttpSink::new(DEFAULT_ENDPOINT, Duration::from_secs(2)).unwrap();
        assert_eq!(sink.url(), DEFAULT_ENDPOINT);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_request_error() {
        // Port 9 (discard) on loopback is not expected to accept HTTP
        let sink = HttpSink::new("http://127.0.0.1:9/whoop-data", Duration::from_secs(1)).unwrap();
        let publication = Publication {
            timestamp: "2024-01-01T00:00:00.000000Z".into(),
            hr: Some(60),
            rr_intervals: None,
            battery: None,
        };
        let err = sink.publish(&publication).await.unwrap_err();
        assert!(matches!(err, SinkError::Request(_)), "{err}");
    }
}
