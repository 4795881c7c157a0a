use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::ACCEPT, Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const RECORD_TYPE_A: u16 = 1;
const RCODE_NOERROR: u32 = 0;
const RCODE_NXDOMAIN: u32 = 3;

/// Looks up A records for a hostname.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve_a(&self, host: &str) -> Result<DnsAnswer, DohError>;
}

/// Authoritative answer from the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub addresses: Vec<String>,
}

impl DnsAnswer {
    /// Returns `true` when the name explicitly resolved to no A records.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// DNS-over-HTTPS client speaking the JSON API (`application/dns-json`).
#[derive(Clone)]
pub struct DohResolver {
    http: Client,
    endpoint: Url,
    timeout: Duration,
}

impl DohResolver {
    /// Creates a resolver for the provided endpoint.
    pub fn new(endpoint: Url, http: Client, timeout: Duration) -> Self {
        Self {
            http,
            endpoint,
            timeout,
        }
    }
}

#[async_trait]
impl DnsResolver for DohResolver {
    async fn resolve_a(&self, host: &str) -> Result<DnsAnswer, DohError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("name", host)
            .append_pair("type", "A");

        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/dns-json")
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unavailable>"));
            return Err(DohError::Status { status, body });
        }

        let payload: DohResponse = response.json().await?;
        payload.into_answer()
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohRecord>,
}

#[derive(Debug, Deserialize)]
struct DohRecord {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

impl DohResponse {
    fn into_answer(self) -> Result<DnsAnswer, DohError> {
        match self.status {
            RCODE_NOERROR | RCODE_NXDOMAIN => Ok(DnsAnswer {
                addresses: self
                    .answer
                    .into_iter()
                    .filter(|record| record.record_type == RECORD_TYPE_A)
                    .map(|record| record.data)
                    .collect(),
            }),
            // SERVFAIL, REFUSED and friends say nothing about the name itself.
            other => Err(DohError::Rcode(other)),
        }
    }
}

/// Errors produced by the DoH client. All of them are inconclusive for health purposes.
#[derive(Debug, Error)]
pub enum DohError {
    #[error("resolver request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("resolver returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("resolver answered with rcode {0}")]
    Rcode(u32),
}
