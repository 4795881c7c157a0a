use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Lifecycle state persisted for a registered domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    /// Never checked, or reset by an operator.
    Ready,
    /// The last probe succeeded.
    Active,
    /// The last probe failed.
    Offline,
    /// Marked unusable by an operator; never auto-selected.
    Blocked,
}

impl DomainStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Offline => "offline",
            Self::Blocked => "blocked",
        }
    }

    /// Statuses an operator may assign directly. `active`/`offline` belong to the prober.
    pub fn is_operator_assignable(self) -> bool {
        matches!(self, Self::Ready | Self::Blocked)
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ready" => Ok(Self::Ready),
            "active" => Ok(Self::Active),
            "offline" => Ok(Self::Offline),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown domain status '{other}'")),
        }
    }
}

/// A candidate hostname tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    /// Insertion sequence, used to break priority ties deterministically.
    pub seq: i64,
    pub domain: String,
    pub is_primary: bool,
    pub is_active: bool,
    pub priority: i64,
    pub status: DomainStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Domain {
    /// Returns `true` when the domain may be promoted to primary by the selection policy.
    pub fn is_failover_candidate(&self) -> bool {
        self.is_active && self.status != DomainStatus::Blocked
    }
}

/// Protocol that answered a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Https,
    Http,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Https => "https",
            Self::Http => "http",
        }
    }
}

/// Outcome of probing a single domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    pub protocol: Option<Protocol>,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub dns_resolved: Option<bool>,
    pub error: Option<String>,
}

impl HealthResult {
    /// A probe answered by `protocol` with an accepted status code.
    pub fn reachable(
        protocol: Protocol,
        status_code: u16,
        dns_resolved: Option<bool>,
        response_time_ms: u64,
    ) -> Self {
        Self {
            healthy: true,
            protocol: Some(protocol),
            status_code: Some(status_code),
            response_time_ms,
            dns_resolved,
            error: None,
        }
    }

    /// DNS answered explicitly with no A records; HTTP was not attempted.
    pub fn unresolvable(response_time_ms: u64) -> Self {
        Self {
            healthy: false,
            protocol: None,
            status_code: None,
            response_time_ms,
            dns_resolved: Some(false),
            error: Some("DNS resolution returned no A records".to_string()),
        }
    }

    /// Every phase failed.
    pub fn unreachable(
        status_code: Option<u16>,
        error: Option<String>,
        dns_resolved: Option<bool>,
        response_time_ms: u64,
    ) -> Self {
        Self {
            healthy: false,
            protocol: None,
            status_code,
            response_time_ms,
            dns_resolved,
            error,
        }
    }

    /// The check itself failed unexpectedly.
    pub fn aborted(error: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            healthy: false,
            protocol: None,
            status_code: None,
            response_time_ms,
            dns_resolved: None,
            error: Some(error.into()),
        }
    }

    /// Status implied by the probe: only ever `active` or `offline`.
    pub fn status(&self) -> DomainStatus {
        if self.healthy {
            DomainStatus::Active
        } else {
            DomainStatus::Offline
        }
    }

    /// Compact JSON representation used in audit details and tap payloads.
    pub fn to_value(&self) -> Value {
        json!({
            "healthy": self.healthy,
            "status": self.status().as_str(),
            "protocol": self.protocol.map(Protocol::as_str),
            "status_code": self.status_code,
            "response_time_ms": self.response_time_ms,
            "dns_resolved": self.dns_resolved,
            "error": self.error,
        })
    }
}

/// Aggregate counts for a probe batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub healthy: usize,
    pub offline: usize,
    pub avg_response_time_ms: u64,
}

/// Severity attached to audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for AuditSeverity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown audit severity '{other}'")),
        }
    }
}
