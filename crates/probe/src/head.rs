use std::{error::Error as StdError, time::Duration};

use async_trait::async_trait;
use reqwest::{redirect::Policy, Client};
use thiserror::Error;
use url::Url;

/// Generic identifying user-agent sent with every probe.
pub const PROBE_USER_AGENT: &str = "Mozilla/5.0 (compatible; MirrorwatchHealthCheck/1.0)";

const MAX_REDIRECTS: usize = 10;

/// Issues a HEAD request and reports the final status code.
#[async_trait]
pub trait HeadProbe: Send + Sync {
    async fn head(&self, url: &Url) -> Result<u16, HeadError>;
}

/// HEAD prober backed by reqwest, following redirects.
#[derive(Clone)]
pub struct HttpHeadProber {
    http: Client,
}

impl HttpHeadProber {
    /// Builds a prober whose client enforces `timeout` per request.
    pub fn new(timeout: Duration) -> Result<Self, HeadError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(PROBE_USER_AGENT)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|err| HeadError::Client(err.to_string()))?;
        Ok(Self { http })
    }

    /// Wraps an existing client. The caller is responsible for its redirect and timeout policy.
    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HeadProbe for HttpHeadProber {
    async fn head(&self, url: &Url) -> Result<u16, HeadError> {
        let response = self.http.head(url.clone()).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Transport-level failure of a single probe attempt.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Transport(String),
    #[error("failed to build http client: {0}")]
    Client(String),
}

impl From<reqwest::Error> for HeadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        Self::Transport(error_chain(&err))
    }
}

/// Flattens an error and its sources; reqwest hides TLS and connect causes in the chain.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
