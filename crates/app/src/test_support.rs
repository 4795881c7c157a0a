use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use url::Url;

use mirrorwatch_core::Domain;
use mirrorwatch_probe::{
    DnsAnswer, DnsResolver, DohError, DomainProber, HeadError, HeadProbe, ProbeSettings,
};
use mirrorwatch_storage::{Database, NewDomain};

use crate::health::{Clock, HealthCheckService};
use crate::tap::TapHub;

/// Resolver that answers every host with one address, except hosts scripted to panic.
#[derive(Default)]
pub struct FakeDns {
    panics_for: Mutex<Vec<String>>,
}

impl FakeDns {
    pub fn panic_for(&self, host: &str) {
        self.panics_for
            .lock()
            .expect("fake dns lock")
            .push(host.to_string());
    }
}

#[async_trait]
impl DnsResolver for FakeDns {
    async fn resolve_a(&self, host: &str) -> Result<DnsAnswer, DohError> {
        let panics = self
            .panics_for
            .lock()
            .expect("fake dns lock")
            .iter()
            .any(|h| h == host);
        if panics {
            panic!("resolver exploded for {host}");
        }
        Ok(DnsAnswer {
            addresses: vec!["198.51.100.1".to_string()],
        })
    }
}

/// HEAD probe whose answers are scripted per host; unknown hosts refuse connections.
#[derive(Default)]
pub struct FakeHead {
    replies: Mutex<HashMap<String, u16>>,
}

impl FakeHead {
    pub fn set(&self, host: &str, status: u16) {
        self.replies
            .lock()
            .expect("fake head lock")
            .insert(host.to_string(), status);
    }

    pub fn fail(&self, host: &str) {
        self.replies.lock().expect("fake head lock").remove(host);
    }
}

#[async_trait]
impl HeadProbe for FakeHead {
    async fn head(&self, url: &Url) -> Result<u16, HeadError> {
        let host = url.host_str().unwrap_or_default();
        self.replies
            .lock()
            .expect("fake head lock")
            .get(host)
            .copied()
            .ok_or_else(|| HeadError::Transport("connection refused".to_string()))
    }
}

pub struct Harness {
    _dir: TempDir,
    pub database: Database,
    pub dns: Arc<FakeDns>,
    pub head: Arc<FakeHead>,
    pub tap: TapHub,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("mirrorwatch.db").display()
        );
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");
        Self {
            _dir: dir,
            database,
            dns: Arc::new(FakeDns::default()),
            head: Arc::new(FakeHead::default()),
            tap: TapHub::new(),
        }
    }

    pub fn service(&self, concurrency: usize) -> HealthCheckService {
        let prober = DomainProber::new(
            self.dns.clone(),
            self.head.clone(),
            ProbeSettings::default(),
        );
        let clock: Clock = Arc::new(fixed_now);
        HealthCheckService::new(self.database.clone(), prober, self.tap.clone(), concurrency)
            .with_clock(clock)
    }

    pub async fn add(&self, name: &str, priority: i64) -> Domain {
        self.database
            .domains()
            .insert(&NewDomain {
                domain: name,
                priority,
                notes: None,
                created_at: fixed_now(),
            })
            .await
            .expect("insert domain")
    }

    pub async fn domain(&self, id: &str) -> Domain {
        self.database
            .domains()
            .fetch(id)
            .await
            .expect("fetch")
            .expect("domain exists")
    }
}

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap()
}
