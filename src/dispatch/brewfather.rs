//! Brewfather custom stream logging endpoint.

use super::{LogRecord, RemoteLogger, SinkError, SinkFuture, SubmitResponse};
use std::time::Duration;

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        SinkError::Http(err.to_string())
    }
}

/// Posts readings to a Brewfather custom stream URL.
#[derive(Debug, Clone)]
pub struct BrewfatherLogger {
    client: reqwest::Client,
    url: String,
}

impl BrewfatherLogger {
    /// # Errors
    /// Returns `SinkError::Http` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RemoteLogger for BrewfatherLogger {
    fn submit<'a>(&'a self, record: &'a LogRecord) -> SinkFuture<'a, SubmitResponse> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .form(record)
                .send()
                .await?
                .error_for_status()?;
            Ok(response.json::<SubmitResponse>().await?)
        })
    }
}
