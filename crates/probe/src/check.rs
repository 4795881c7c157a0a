use std::{net::IpAddr, sync::Arc, time::Duration, time::Instant};

use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use mirrorwatch_core::{host_of, is_success_code, HealthResult, Protocol};

use crate::doh::DnsResolver;
use crate::head::HeadProbe;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeouts applied to each phase of a domain check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Bound for each HTTPS and HTTP attempt.
    pub http_timeout: Duration,
    /// Bound for the DNS lookup.
    pub dns_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
        }
    }
}

/// Runs the DNS → HTTPS → HTTP reachability check for a single domain.
#[derive(Clone)]
pub struct DomainProber {
    resolver: Arc<dyn DnsResolver>,
    http: Arc<dyn HeadProbe>,
    settings: ProbeSettings,
}

enum PhaseOutcome {
    Healthy(u16),
    Rejected(u16),
    Failed(String),
}

impl DomainProber {
    pub fn new(
        resolver: Arc<dyn DnsResolver>,
        http: Arc<dyn HeadProbe>,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            resolver,
            http,
            settings,
        }
    }

    pub fn settings(&self) -> ProbeSettings {
        self.settings
    }

    /// Checks `domain` (`host[:port]`) and returns the classified result.
    ///
    /// Phases short-circuit on the first healthy answer. An explicit empty DNS
    /// answer stops the check before any HTTP request is made; resolver
    /// failures are only advisory.
    pub async fn check(&self, domain: &str) -> HealthResult {
        let start = Instant::now();

        let dns_resolved = match self.resolve(domain).await {
            DnsPhase::Resolved => Some(true),
            DnsPhase::Inconclusive => None,
            DnsPhase::NoRecords => {
                debug!(stage = "probe", %domain, "no A records; skipping HTTP checks");
                return HealthResult::unresolvable(elapsed_ms(start));
            }
        };

        match self.attempt(Protocol::Https, domain).await {
            PhaseOutcome::Healthy(code) => {
                return HealthResult::reachable(
                    Protocol::Https,
                    code,
                    dns_resolved,
                    elapsed_ms(start),
                );
            }
            PhaseOutcome::Rejected(code) => {
                debug!(stage = "probe", %domain, status = code, "https rejected; trying http");
            }
            PhaseOutcome::Failed(err) => {
                debug!(stage = "probe", %domain, error = %err, "https failed; trying http");
            }
        }

        match self.attempt(Protocol::Http, domain).await {
            PhaseOutcome::Healthy(code) => {
                HealthResult::reachable(Protocol::Http, code, dns_resolved, elapsed_ms(start))
            }
            PhaseOutcome::Rejected(code) => HealthResult::unreachable(
                Some(code),
                Some(format!("http responded with status {code}")),
                dns_resolved,
                elapsed_ms(start),
            ),
            PhaseOutcome::Failed(err) => {
                HealthResult::unreachable(None, Some(err), dns_resolved, elapsed_ms(start))
            }
        }
    }

    async fn resolve(&self, domain: &str) -> DnsPhase {
        let host = host_of(domain);
        if host.parse::<IpAddr>().is_ok() {
            return DnsPhase::Resolved;
        }

        match timeout(self.settings.dns_timeout, self.resolver.resolve_a(host)).await {
            Ok(Ok(answer)) if answer.is_empty() => DnsPhase::NoRecords,
            Ok(Ok(_)) => DnsPhase::Resolved,
            Ok(Err(err)) => {
                warn!(
                    stage = "probe",
                    %domain,
                    error = %err,
                    "dns lookup inconclusive; continuing with http checks"
                );
                DnsPhase::Inconclusive
            }
            Err(_) => {
                warn!(
                    stage = "probe",
                    %domain,
                    timeout_secs = self.settings.dns_timeout.as_secs_f64(),
                    "dns lookup timed out; continuing with http checks"
                );
                DnsPhase::Inconclusive
            }
        }
    }

    async fn attempt(&self, protocol: Protocol, domain: &str) -> PhaseOutcome {
        let url = match Url::parse(&format!("{}://{}", protocol.as_str(), domain)) {
            Ok(url) => url,
            Err(err) => return PhaseOutcome::Failed(format!("invalid url for {domain}: {err}")),
        };

        match timeout(self.settings.http_timeout, self.http.head(&url)).await {
            Ok(Ok(code)) if is_success_code(code) => PhaseOutcome::Healthy(code),
            Ok(Ok(code)) => PhaseOutcome::Rejected(code),
            Ok(Err(err)) => {
                PhaseOutcome::Failed(format!("{} request failed: {err}", protocol.as_str()))
            }
            Err(_) => PhaseOutcome::Failed(format!(
                "{} request timed out after {}s",
                protocol.as_str(),
                self.settings.http_timeout.as_secs_f64()
            )),
        }
    }
}

enum DnsPhase {
    Resolved,
    NoRecords,
    Inconclusive,
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use httpmock::prelude::*;
    use httpmock::Method::HEAD;
    use reqwest::Client;

    use crate::doh::{DnsAnswer, DohError, DohResolver};
    use crate::head::{HeadError, HttpHeadProber};

    enum FakeDns {
        Records,
        Empty,
        Fails,
        Hangs,
    }

    #[async_trait]
    impl DnsResolver for FakeDns {
        async fn resolve_a(&self, _host: &str) -> Result<DnsAnswer, DohError> {
            match self {
                Self::Records => Ok(DnsAnswer {
                    addresses: vec!["203.0.113.10".to_string()],
                }),
                Self::Empty => Ok(DnsAnswer {
                    addresses: Vec::new(),
                }),
                Self::Fails => Err(DohError::Rcode(2)),
                Self::Hangs => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(DohError::Rcode(2))
                }
            }
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Status(u16),
        Refused,
        Hang,
    }

    /// Answers per scheme and records every URL requested.
    struct FakeHead {
        replies: HashMap<&'static str, Reply>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeHead {
        fn new(https: Reply, http: Reply) -> Arc<Self> {
            Arc::new(Self {
                replies: HashMap::from([("https", https), ("http", http)]),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl HeadProbe for FakeHead {
        async fn head(&self, url: &Url) -> Result<u16, HeadError> {
            self.calls.lock().expect("calls").push(url.to_string());
            match self.replies[url.scheme()] {
                Reply::Status(code) => Ok(code),
                Reply::Refused => Err(HeadError::Transport("connection refused".to_string())),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(200)
                }
            }
        }
    }

    fn prober(dns: FakeDns, head: Arc<FakeHead>) -> DomainProber {
        DomainProber::new(
            Arc::new(dns),
            head,
            ProbeSettings {
                http_timeout: Duration::from_millis(100),
                dns_timeout: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn empty_dns_answer_short_circuits() {
        let head = FakeHead::new(Reply::Status(200), Reply::Status(200));
        let result = prober(FakeDns::Empty, head.clone())
            .check("gone.example")
            .await;

        assert!(!result.healthy);
        assert_eq!(result.dns_resolved, Some(false));
        assert!(result.protocol.is_none());
        assert!(head.calls().is_empty());
    }

    #[tokio::test]
    async fn https_success_wins_over_http() {
        let head = FakeHead::new(Reply::Status(200), Reply::Status(200));
        let result = prober(FakeDns::Records, head.clone())
            .check("mirror.example")
            .await;

        assert!(result.healthy);
        assert_eq!(result.protocol, Some(Protocol::Https));
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.dns_resolved, Some(true));
        assert_eq!(head.calls(), vec!["https://mirror.example/".to_string()]);
    }

    #[tokio::test]
    async fn falls_back_to_http_after_https_error_status() {
        let head = FakeHead::new(Reply::Status(500), Reply::Status(200));
        let result = prober(FakeDns::Records, head.clone())
            .check("mirror.example")
            .await;

        assert!(result.healthy);
        assert_eq!(result.protocol, Some(Protocol::Http));
        assert_eq!(head.calls().len(), 2);
    }

    #[tokio::test]
    async fn falls_back_to_http_after_https_timeout() {
        let head = FakeHead::new(Reply::Hang, Reply::Status(200));
        let result = prober(FakeDns::Records, head)
            .check("mirror.example")
            .await;

        assert!(result.healthy);
        assert_eq!(result.protocol, Some(Protocol::Http));
    }

    #[tokio::test]
    async fn both_phases_failing_is_offline_with_last_error() {
        let head = FakeHead::new(Reply::Refused, Reply::Hang);
        let result = prober(FakeDns::Records, head)
            .check("mirror.example")
            .await;

        assert!(!result.healthy);
        assert!(result.protocol.is_none());
        assert!(result
            .error
            .as_deref()
            .is_some_and(|err| err.contains("http request timed out")));
    }

    #[tokio::test]
    async fn http_rejection_records_status_code() {
        let head = FakeHead::new(Reply::Status(503), Reply::Status(404));
        let result = prober(FakeDns::Records, head)
            .check("mirror.example")
            .await;

        assert!(!result.healthy);
        assert_eq!(result.status_code, Some(404));
    }

    #[tokio::test]
    async fn success_code_boundaries_apply_to_both_phases() {
        for code in [200u16, 250, 299, 301, 302] {
            let via_https = prober(
                FakeDns::Records,
                FakeHead::new(Reply::Status(code), Reply::Refused),
            )
            .check("mirror.example")
            .await;
            assert_eq!(via_https.protocol, Some(Protocol::Https), "https {code}");

            let via_http = prober(
                FakeDns::Records,
                FakeHead::new(Reply::Refused, Reply::Status(code)),
            )
            .check("mirror.example")
            .await;
            assert_eq!(via_http.protocol, Some(Protocol::Http), "http {code}");
        }

        for code in [300u16, 303, 400, 404, 500] {
            let result = prober(
                FakeDns::Records,
                FakeHead::new(Reply::Status(code), Reply::Status(code)),
            )
            .check("mirror.example")
            .await;
            assert!(!result.healthy, "{code} must be unhealthy");
            assert_eq!(result.status_code, Some(code));
        }
    }

    #[tokio::test]
    async fn resolver_failure_is_advisory() {
        let result = prober(
            FakeDns::Fails,
            FakeHead::new(Reply::Status(200), Reply::Refused),
        )
        .check("mirror.example")
        .await;

        assert!(result.healthy);
        assert_eq!(result.dns_resolved, None);
    }

    #[tokio::test]
    async fn resolver_timeout_is_advisory() {
        let result = prober(
            FakeDns::Hangs,
            FakeHead::new(Reply::Refused, Reply::Status(200)),
        )
        .check("mirror.example")
        .await;

        assert!(result.healthy);
        assert_eq!(result.protocol, Some(Protocol::Http));
        assert_eq!(result.dns_resolved, None);
    }

    #[tokio::test]
    async fn ip_literals_skip_dns() {
        let result = prober(
            FakeDns::Empty,
            FakeHead::new(Reply::Status(200), Reply::Refused),
        )
        .check("203.0.113.10:8443")
        .await;

        assert!(result.healthy);
        assert_eq!(result.dns_resolved, Some(true));
    }

    #[tokio::test]
    async fn real_clients_fall_back_from_tls_to_plain_http() {
        let server = MockServer::start_async().await;
        let target = server
            .mock_async(|when, then| {
                when.method(HEAD).path("/");
                then.status(200);
            })
            .await;

        let dns = DohResolver::new(
            Url::parse(&server.url("/resolve")).expect("url"),
            Client::builder().build().expect("client"),
            Duration::from_secs(2),
        );
        let prober = DomainProber::new(
            Arc::new(dns),
            Arc::new(HttpHeadProber::new(Duration::from_secs(2)).expect("prober")),
            ProbeSettings::default(),
        );

        // The mock server only speaks plain HTTP, so the TLS handshake fails first.
        let result = prober.check(&server.address().to_string()).await;
        target.assert_async().await;

        assert!(result.healthy);
        assert_eq!(result.protocol, Some(Protocol::Http));
        assert_eq!(result.status_code, Some(200));
    }

    #[tokio::test]
    async fn real_resolver_empty_answer_prevents_http() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/resolve")
                    .query_param("name", "parked.example");
                then.status(200).json_body(serde_json::json!({ "Status": 3 }));
            })
            .await;
        let head = FakeHead::new(Reply::Status(200), Reply::Status(200));

        let dns = DohResolver::new(
            Url::parse(&server.url("/resolve")).expect("url"),
            Client::builder().build().expect("client"),
            Duration::from_secs(2),
        );
        let prober = DomainProber::new(Arc::new(dns), head.clone(), ProbeSettings::default());

        let result = prober.check("parked.example").await;
        assert_eq!(result.dns_resolved, Some(false));
        assert!(head.calls().is_empty());
    }
}
