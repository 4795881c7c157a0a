use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use mirrorwatch_core::{BatchSummary, DomainStatus, Protocol};

use crate::health::{outcome_value, rfc3339, CheckReport, DomainCheck};
use crate::router::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    success: bool,
    timestamp: String,
    results: Vec<ResultEntry>,
    summary: SummaryBody,
    primary_domain: Option<String>,
    primary_healthy: bool,
    failover: Value,
}

#[derive(Debug, Serialize)]
struct ResultEntry {
    domain: String,
    priority: i64,
    is_primary: bool,
    healthy: bool,
    status: DomainStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<Protocol>,
    #[serde(rename = "statusCode", skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(rename = "responseTime")]
    response_time: u64,
    #[serde(rename = "dnsResolved", skip_serializing_if = "Option::is_none")]
    dns_resolved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&DomainCheck> for ResultEntry {
    fn from(check: &DomainCheck) -> Self {
        let DomainCheck { domain, result } = check;
        Self {
            domain: domain.domain.clone(),
            priority: domain.priority,
            is_primary: domain.is_primary,
            healthy: result.healthy,
            status: result.status(),
            protocol: result.protocol,
            status_code: result.status_code,
            response_time: result.response_time_ms,
            dns_resolved: result.dns_resolved,
            error: result.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryBody {
    total: usize,
    healthy: usize,
    offline: usize,
    avg_response_time: u64,
}

impl From<BatchSummary> for SummaryBody {
    fn from(summary: BatchSummary) -> Self {
        Self {
            total: summary.total,
            healthy: summary.healthy,
            offline: summary.offline,
            avg_response_time: summary.avg_response_time_ms,
        }
    }
}

impl From<CheckReport> for TriggerResponse {
    fn from(report: CheckReport) -> Self {
        Self {
            success: true,
            timestamp: rfc3339(report.timestamp),
            results: report.checks.iter().map(ResultEntry::from).collect(),
            summary: report.summary.into(),
            primary_domain: report.primary_domain,
            primary_healthy: report.primary_healthy,
            failover: outcome_value(&report.failover),
        }
    }
}

/// `POST /functions/domain-health-check`: runs one health check and reports the batch.
pub async fn handle(State(state): State<AppState>) -> Response {
    match state.health().run_once().await {
        Ok(report) => {
            debug!(stage = "app", run_id = %report.run_id, "health check triggered over http");
            (StatusCode::OK, Json(TriggerResponse::from(report))).into_response()
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": err.to_string(),
                "timestamp": rfc3339(state.now()),
            })),
        )
            .into_response(),
    }
}
