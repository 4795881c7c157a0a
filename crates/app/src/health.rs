use std::{any::Any, sync::Arc, time::Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use mirrorwatch_core::{
    current_primary, summarize, AuditSeverity, BatchSummary, Domain, HealthResult, ProbeUpdate,
    Protocol,
};
use mirrorwatch_probe::DomainProber;
use mirrorwatch_storage::{Database, DomainError, NewAuditEvent};

use crate::tap::{StageEvent, StageKind, TapHub};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub const FAILOVER_LOG_TYPE: &str = "domain_failover";

/// Probes every active domain, persists the outcome and fails the primary over when needed.
#[derive(Clone)]
pub struct HealthCheckService {
    database: Database,
    prober: DomainProber,
    tap: TapHub,
    clock: Clock,
    concurrency: usize,
    run_lock: Arc<Mutex<()>>,
}

/// A probed domain: the registry row as read before the check, and the fresh result.
#[derive(Debug, Clone)]
pub struct DomainCheck {
    pub domain: Domain,
    pub result: HealthResult,
}

/// What the failover step decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    PrimaryHealthy,
    NoPrimary,
    Promoted { from: String, to: String },
    Exhausted { from: String },
    Conflict { from: String, to: String, error: String },
    Failed { from: String, error: String },
}

impl FailoverOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryHealthy => "primary_healthy",
            Self::NoPrimary => "no_primary",
            Self::Promoted { .. } => "promoted",
            Self::Exhausted { .. } => "exhausted",
            Self::Conflict { .. } => "conflict",
            Self::Failed { .. } => "error",
        }
    }
}

/// Result of one full run.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<DomainCheck>,
    pub summary: BatchSummary,
    pub primary_domain: Option<String>,
    pub primary_healthy: bool,
    pub failover: FailoverOutcome,
}

#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("failed to read domain registry: {0}")]
    Registry(#[source] DomainError),
}

impl HealthCheckService {
    pub fn new(database: Database, prober: DomainProber, tap: TapHub, concurrency: usize) -> Self {
        Self {
            database,
            prober,
            tap,
            clock: Arc::new(Utc::now),
            concurrency: concurrency.max(1),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Overrides the clock used for `last_checked_at`, `blocked_at` and report timestamps.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Executes one health-check run. Runs in this process never overlap.
    pub async fn run_once(&self) -> Result<CheckReport, HealthCheckError> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let domains = match self.database.domains().list_active().await {
            Ok(domains) => domains,
            Err(err) => {
                counter!("health_check_runs_total", "result" => "failure").increment(1);
                error!(stage = "registry", %run_id, error = %err, "failed to load active domains");
                return Err(HealthCheckError::Registry(err));
            }
        };
        info!(stage = "probe", %run_id, domains = domains.len(), "health check started");

        let primary_id = current_primary(&domains).map(|primary| primary.id.clone());
        let results = self.probe_all(&domains).await;
        let now = (self.clock)();

        let checks: Vec<DomainCheck> = domains
            .into_iter()
            .zip(results)
            .map(|(domain, result)| DomainCheck { domain, result })
            .collect();

        for check in &checks {
            self.record(&run_id, check, now).await;
        }

        let primary = primary_id
            .as_deref()
            .and_then(|id| checks.iter().find(|check| check.domain.id == id));
        let failover = self.failover(&run_id, primary, &checks, now).await;
        counter!("domain_failover_total", "outcome" => failover.as_str()).increment(1);

        let summary = summarize(checks.iter().map(|check| &check.result));
        counter!("health_check_runs_total", "result" => "success").increment(1);
        info!(
            stage = "probe",
            %run_id,
            total = summary.total,
            healthy = summary.healthy,
            offline = summary.offline,
            avg_response_time_ms = summary.avg_response_time_ms,
            failover = failover.as_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "health check completed"
        );

        let primary_domain = primary.map(|check| check.domain.domain.clone());
        let primary_healthy = primary.is_some_and(|check| check.result.healthy);
        Ok(CheckReport {
            primary_domain,
            primary_healthy,
            run_id,
            timestamp: now,
            checks,
            summary,
            failover,
        })
    }

    /// Probes `domains` with bounded parallelism, returning results in input order.
    async fn probe_all(&self, domains: &[Domain]) -> Vec<HealthResult> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(domains.len());
        for domain in domains {
            let prober = self.prober.clone();
            let permits = permits.clone();
            let name = domain.domain.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                prober.check(&name).await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (domain, task) in domains.iter().zip(tasks) {
            let result = match task.await {
                Ok(result) => result,
                Err(err) => {
                    let message = match err.try_into_panic() {
                        Ok(payload) => {
                            format!("health check panicked: {}", panic_message(payload.as_ref()))
                        }
                        Err(err) => format!("health check aborted: {err}"),
                    };
                    error!(
                        stage = "probe",
                        domain = %domain.domain,
                        error = %message,
                        "domain check failed unexpectedly"
                    );
                    HealthResult::aborted(message, 0)
                }
            };

            counter!(
                "domain_checks_total",
                "result" => if result.healthy { "healthy" } else { "offline" },
                "protocol" => result.protocol.map(Protocol::as_str).unwrap_or("none")
            )
            .increment(1);
            histogram!("domain_check_duration_seconds")
                .record(result.response_time_ms as f64 / 1000.0);
            results.push(result);
        }
        results
    }

    async fn record(&self, run_id: &str, check: &DomainCheck, now: DateTime<Utc>) {
        let DomainCheck { domain, result } = check;
        self.tap.publish(
            StageEvent::new(now, StageKind::Probe, "probe.result", result.to_value())
                .with_run(run_id)
                .with_domain(&domain.domain)
                .with_latency(result.response_time_ms),
        );

        let update = ProbeUpdate::from_result(domain, result, now);
        if update.is_new_failure(domain) {
            warn!(
                stage = "probe",
                domain = %domain.domain,
                is_primary = domain.is_primary,
                error = result.error.as_deref().unwrap_or(""),
                "domain went offline"
            );
        }

        match self
            .database
            .domains()
            .record_probe(&domain.id, domain.status, &update)
            .await
        {
            Ok(true) => {
                self.tap.publish(
                    StageEvent::new(
                        now,
                        StageKind::Registry,
                        "registry.probe_written",
                        json!({
                            "status": update.status.as_str(),
                            "last_checked_at": rfc3339(update.last_checked_at),
                            "blocked_at": update.blocked_at.map(rfc3339),
                        }),
                    )
                    .with_run(run_id)
                    .with_domain(&domain.domain),
                );
            }
            Ok(false) => {
                warn!(
                    stage = "registry",
                    domain = %domain.domain,
                    expected_status = domain.status.as_str(),
                    "domain changed during the run; probe result not persisted"
                );
            }
            Err(err) => {
                counter!("registry_write_failures_total").increment(1);
                error!(
                    stage = "registry",
                    domain = %domain.domain,
                    error = %err,
                    "failed to persist probe result"
                );
            }
        }
    }

    async fn failover(
        &self,
        run_id: &str,
        primary: Option<&DomainCheck>,
        checks: &[DomainCheck],
        now: DateTime<Utc>,
    ) -> FailoverOutcome {
        let Some(primary) = primary else {
            warn!(stage = "failover", %run_id, "no active primary domain configured");
            self.publish_failover(run_id, now, &FailoverOutcome::NoPrimary);
            return FailoverOutcome::NoPrimary;
        };

        if primary.result.healthy {
            info!(
                stage = "failover",
                %run_id,
                primary = %primary.domain.domain,
                "primary domain healthy"
            );
            self.publish_failover(run_id, now, &FailoverOutcome::PrimaryHealthy);
            return FailoverOutcome::PrimaryHealthy;
        }

        let from = primary.domain.domain.clone();
        let repo = self.database.domains();

        // Fresh failures win over whatever the registry row says.
        let failed_ids: Vec<&str> = checks
            .iter()
            .filter(|check| !check.result.healthy)
            .map(|check| check.domain.id.as_str())
            .collect();

        let candidate = match repo.next_available(&primary.domain.id, &failed_ids).await {
            Ok(candidate) => candidate,
            Err(err) => {
                counter!("registry_write_failures_total").increment(1);
                error!(
                    stage = "failover",
                    %run_id,
                    primary = %from,
                    error = %err,
                    "failed to select failover candidate"
                );
                let outcome = FailoverOutcome::Failed {
                    from,
                    error: err.to_string(),
                };
                self.publish_failover(run_id, now, &outcome);
                return outcome;
            }
        };

        let Some(candidate) = candidate else {
            error!(
                stage = "failover",
                severity = "critical",
                %run_id,
                primary = %from,
                "primary domain is down and no failover candidate is available"
            );
            let outcome = FailoverOutcome::Exhausted { from: from.clone() };
            self.audit(
                "failover_exhausted",
                &from,
                json!({
                    "from": from,
                    "failed_result": primary.result.to_value(),
                    "results": results_value(checks),
                    "timestamp": rfc3339(now),
                }),
                now,
            )
            .await;
            self.publish_failover(run_id, now, &outcome);
            return outcome;
        };

        let outcome = match repo
            .promote_failover(&primary.domain.id, &candidate.id, now)
            .await
        {
            Ok(promoted) => {
                error!(
                    stage = "failover",
                    severity = "critical",
                    %run_id,
                    from = %from,
                    to = %promoted.domain,
                    priority = promoted.priority,
                    "primary domain failed over"
                );
                self.audit(
                    "primary_promoted",
                    &promoted.domain,
                    json!({
                        "from": from,
                        "to": promoted.domain,
                        "from_id": primary.domain.id,
                        "to_id": promoted.id,
                        "failed_result": primary.result.to_value(),
                        "results": results_value(checks),
                        "timestamp": rfc3339(now),
                    }),
                    now,
                )
                .await;
                FailoverOutcome::Promoted {
                    from,
                    to: promoted.domain,
                }
            }
            Err(err @ (DomainError::PrimaryChanged | DomainError::CandidateUnavailable)) => {
                warn!(
                    stage = "failover",
                    %run_id,
                    from = %from,
                    to = %candidate.domain,
                    error = %err,
                    "failover lost to a concurrent registry change"
                );
                FailoverOutcome::Conflict {
                    from,
                    to: candidate.domain,
                    error: err.to_string(),
                }
            }
            Err(err) => {
                counter!("registry_write_failures_total").increment(1);
                error!(
                    stage = "failover",
                    %run_id,
                    from = %from,
                    error = %err,
                    "failed to promote failover candidate"
                );
                FailoverOutcome::Failed {
                    from,
                    error: err.to_string(),
                }
            }
        };

        self.publish_failover(run_id, now, &outcome);
        outcome
    }

    async fn audit(&self, action: &str, resource: &str, details: Value, now: DateTime<Utc>) {
        let event = NewAuditEvent {
            log_type: FAILOVER_LOG_TYPE,
            severity: AuditSeverity::Critical,
            action,
            resource,
            details: &details,
            created_at: now,
        };
        if let Err(err) = self.database.audit_logs().append(&event).await {
            counter!("registry_write_failures_total").increment(1);
            error!(stage = "failover", %action, error = %err, "failed to write audit event");
        }
    }

    fn publish_failover(&self, run_id: &str, now: DateTime<Utc>, outcome: &FailoverOutcome) {
        self.tap.publish(
            StageEvent::new(now, StageKind::Failover, "failover.decision", outcome_value(outcome))
                .with_run(run_id),
        );
    }
}

/// JSON form of a failover outcome: `{ outcome, from?, to?, error? }`.
pub fn outcome_value(outcome: &FailoverOutcome) -> Value {
    let mut value = json!({ "outcome": outcome.as_str() });
    let (from, to, error) = match outcome {
        FailoverOutcome::PrimaryHealthy | FailoverOutcome::NoPrimary => (None, None, None),
        FailoverOutcome::Promoted { from, to } => (Some(from), Some(to), None),
        FailoverOutcome::Exhausted { from } => (Some(from), None, None),
        FailoverOutcome::Conflict { from, to, error } => (Some(from), Some(to), Some(error)),
        FailoverOutcome::Failed { from, error } => (Some(from), None, Some(error)),
    };
    for (key, field) in [("from", from), ("to", to), ("error", error)] {
        if let Some(text) = field {
            value[key] = Value::String(text.clone());
        }
    }
    value
}

fn results_value(checks: &[DomainCheck]) -> Value {
    Value::Array(
        checks
            .iter()
            .map(|check| {
                let mut entry = check.result.to_value();
                entry["domain"] = Value::String(check.domain.domain.clone());
                entry
            })
            .collect(),
    )
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub fn rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
