use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use mirrorwatch_core::{normalize_domain, AuditSeverity, Domain, DomainStatus};
use mirrorwatch_storage::{AuditEvent, DomainError, DomainPatch, NewAuditEvent, NewDomain};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const REGISTRY_LOG_TYPE: &str = "domain_registry";
const DEFAULT_AUDIT_LIMIT: i64 = 50;
const MAX_AUDIT_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct CreateDomainRequest {
    domain: String,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateDomainRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<DomainStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
}

impl UpdateDomainRequest {
    fn is_empty(&self) -> bool {
        self.is_active.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.notes.is_none()
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct AuditEventBody {
    id: String,
    log_type: String,
    severity: AuditSeverity,
    action: String,
    resource: String,
    details: Value,
    created_at: DateTime<Utc>,
}

impl From<AuditEvent> for AuditEventBody {
    fn from(event: AuditEvent) -> Self {
        Self {
            id: event.id,
            log_type: event.log_type,
            severity: event.severity,
            action: event.action,
            resource: event.resource,
            details: event.details,
            created_at: event.created_at,
        }
    }
}

pub async fn list_domains(
    State(state): State<AppState>,
) -> Result<Json<Vec<Domain>>, ProblemResponse> {
    let domains = state
        .storage()
        .domains()
        .list_all()
        .await
        .map_err(domain_problem)?;
    Ok(Json(domains))
}

pub async fn create_domain(
    State(state): State<AppState>,
    Json(request): Json<CreateDomainRequest>,
) -> Result<Response, ProblemResponse> {
    let name = normalize_domain(&request.domain).map_err(|err| {
        ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_domain", err.to_string())
    })?;
    let notes = request.notes.as_deref().filter(|text| !text.trim().is_empty());

    let domain = state
        .storage()
        .domains()
        .insert(&NewDomain {
            domain: &name,
            priority: request.priority,
            notes,
            created_at: state.now(),
        })
        .await
        .map_err(domain_problem)?;

    info!(
        stage = "registry",
        domain = %domain.domain,
        priority = domain.priority,
        "domain registered"
    );
    audit(
        &state,
        AuditSeverity::Info,
        "domain_created",
        &domain.domain,
        json!({ "id": domain.id, "priority": domain.priority }),
    )
    .await;

    Ok((StatusCode::CREATED, Json(domain)).into_response())
}

pub async fn update_domain(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateDomainRequest>,
) -> Result<Json<Domain>, ProblemResponse> {
    if request.is_empty() {
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "empty_update",
            "at least one of is_active, status, priority or notes is required",
        ));
    }
    if let Some(status) = request.status {
        if !status.is_operator_assignable() {
            return Err(ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "invalid_status",
                format!(
                    "status '{status}' is managed by the health check; use 'ready' or 'blocked'"
                ),
            ));
        }
    }

    let patch = DomainPatch {
        is_active: request.is_active,
        status: request.status,
        priority: request.priority,
        notes: request.notes.as_deref(),
    };
    let domain = state
        .storage()
        .domains()
        .update(&id, &patch, state.now())
        .await
        .map_err(domain_problem)?;

    info!(stage = "registry", domain = %domain.domain, "domain updated");
    audit(
        &state,
        AuditSeverity::Info,
        "domain_updated",
        &domain.domain,
        json!({ "id": domain.id, "changes": request }),
    )
    .await;

    Ok(Json(domain))
}

pub async fn delete_domain(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    let removed = state
        .storage()
        .domains()
        .delete(&id)
        .await
        .map_err(domain_problem)?;

    info!(stage = "registry", domain = %removed.domain, "domain deleted");
    audit(
        &state,
        AuditSeverity::Info,
        "domain_deleted",
        &removed.domain,
        json!({ "id": removed.id }),
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn promote_domain(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Domain>, ProblemResponse> {
    let promotion = state
        .storage()
        .domains()
        .promote(&id, state.now())
        .await
        .map_err(domain_problem)?;

    let previous = promotion.previous.as_ref().map(|d| d.domain.as_str());
    warn!(
        stage = "registry",
        from = previous.unwrap_or("none"),
        to = %promotion.promoted.domain,
        "primary domain changed by operator"
    );
    audit(
        &state,
        AuditSeverity::Warning,
        "primary_promoted_manually",
        &promotion.promoted.domain,
        json!({
            "from": previous,
            "to": promotion.promoted.domain,
        }),
    )
    .await;

    Ok(Json(promotion.promoted))
}

pub async fn list_audit_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Response, ProblemResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);
    let events = state
        .storage()
        .audit_logs()
        .list_recent(limit)
        .await
        .map_err(|err| {
            error!(stage = "registry", error = %err, "failed to list audit logs");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "audit_unavailable",
                "failed to load audit logs",
            )
        })?;

    let body: Vec<AuditEventBody> = events.into_iter().map(AuditEventBody::from).collect();
    Ok(Json(body).into_response())
}

async fn audit(
    state: &AppState,
    severity: AuditSeverity,
    action: &str,
    resource: &str,
    details: Value,
) {
    let event = NewAuditEvent {
        log_type: REGISTRY_LOG_TYPE,
        severity,
        action,
        resource,
        details: &details,
        created_at: state.now(),
    };
    if let Err(err) = state.storage().audit_logs().append(&event).await {
        metrics::counter!("registry_write_failures_total").increment(1);
        error!(stage = "registry", %action, error = %err, "failed to write audit event");
    }
}

fn domain_problem(err: DomainError) -> ProblemResponse {
    match err {
        DomainError::NotFound => {
            ProblemResponse::new(StatusCode::NOT_FOUND, "domain_not_found", err.to_string())
        }
        DomainError::Duplicate(_) => {
            ProblemResponse::new(StatusCode::CONFLICT, "duplicate_domain", err.to_string())
        }
        DomainError::IsPrimary => {
            ProblemResponse::new(StatusCode::CONFLICT, "primary_domain", err.to_string())
        }
        DomainError::NotEligible => {
            ProblemResponse::new(StatusCode::CONFLICT, "not_eligible", err.to_string())
        }
        DomainError::PrimaryChanged | DomainError::CandidateUnavailable => {
            ProblemResponse::new(StatusCode::CONFLICT, "concurrent_change", err.to_string())
        }
        DomainError::InvalidStatus(_) => {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_status", err.to_string())
        }
        DomainError::Database(ref source) => {
            error!(stage = "registry", error = %source, "registry query failed");
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "registry_unavailable",
                "failed to access the domain registry",
            )
        }
    }
}
