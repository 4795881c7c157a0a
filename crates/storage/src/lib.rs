use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqliteConnection, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use mirrorwatch_core::{select_next_primary, AuditSeverity, Domain, DomainStatus, ProbeUpdate};

const DOMAIN_COLUMNS: &str = "seq, id, domain, is_primary, is_active, priority, status, \
     last_checked_at, blocked_at, notes, created_at, updated_at";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Pragmas are set on the connect options so that every pooled connection gets them.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the domain registry.
    pub fn domains(&self) -> DomainRepository {
        DomainRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the audit log.
    pub fn audit_logs(&self) -> AuditLogRepository {
        AuditLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository over the `domains` table.
#[derive(Clone)]
pub struct DomainRepository {
    pool: SqlitePool,
}

impl DomainRepository {
    /// Lists every domain ordered by priority (descending) then insertion order.
    pub async fn list_all(&self) -> Result<Vec<Domain>, DomainError> {
        let sql = format!("SELECT {DOMAIN_COLUMNS} FROM domains ORDER BY priority DESC, seq ASC");
        let rows = sqlx::query_as::<_, DomainRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DomainRow::into_domain).collect()
    }

    /// Lists the domains eligible for probing, ordered by priority.
    pub async fn list_active(&self) -> Result<Vec<Domain>, DomainError> {
        let sql = format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE is_active = 1 \
             ORDER BY priority DESC, seq ASC"
        );
        let rows = sqlx::query_as::<_, DomainRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DomainRow::into_domain).collect()
    }

    /// Loads a single domain by identifier.
    pub async fn fetch(&self, id: &str) -> Result<Option<Domain>, DomainError> {
        let sql = format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = ?");
        let row = sqlx::query_as::<_, DomainRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DomainRow::into_domain).transpose()
    }

    /// Registers a new domain in the `ready` state.
    pub async fn insert(&self, record: &NewDomain<'_>) -> Result<Domain, DomainError> {
        let now = to_rfc3339(record.created_at);
        let sql = format!(
            "INSERT INTO domains \
             (id, domain, is_primary, is_active, priority, status, notes, created_at, updated_at) \
             VALUES (?, ?, 0, 1, ?, 'ready', ?, ?, ?) \
             RETURNING {DOMAIN_COLUMNS}"
        );
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query_as::<_, DomainRow>(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(record.domain)
            .bind(record.priority)
            .bind(record.notes)
            .bind(&now)
            .bind(&now)
            .fetch_one(&mut *tx)
            .await;

        let row = match result {
            Ok(row) => row,
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("2067") => {
                tx.rollback().await?;
                return Err(DomainError::Duplicate(record.domain.to_string()));
            }
            Err(err) => return Err(DomainError::Database(err)),
        };

        tx.commit().await?;
        row.into_domain()
    }

    /// Applies an operator patch as one write.
    ///
    /// Disabling or blocking the primary is refused and leaves the row untouched.
    /// An empty notes string clears the annotation.
    pub async fn update(
        &self,
        id: &str,
        patch: &DomainPatch<'_>,
        now: DateTime<Utc>,
    ) -> Result<Domain, DomainError> {
        if let Some(status) = patch.status {
            if !status.is_operator_assignable() {
                return Err(DomainError::InvalidStatus(status.to_string()));
            }
        }
        let status = patch.status.map(|status| status.as_str());

        let sql = format!(
            "UPDATE domains SET \
                 is_active = COALESCE(?, is_active), \
                 status = COALESCE(?, status), \
                 priority = COALESCE(?, priority), \
                 notes = CASE WHEN ? IS NULL THEN notes ELSE NULLIF(?, '') END, \
                 updated_at = ? \
             WHERE id = ? \
               AND NOT (is_primary = 1 AND (COALESCE(?, 1) = 0 OR COALESCE(?, '') = 'blocked')) \
             RETURNING {DOMAIN_COLUMNS}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, DomainRow>(&sql)
            .bind(patch.is_active)
            .bind(status)
            .bind(patch.priority)
            .bind(patch.notes)
            .bind(patch.notes)
            .bind(to_rfc3339(now))
            .bind(id)
            .bind(patch.is_active)
            .bind(status)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            let err = explain_refusal(&mut tx, id).await;
            tx.rollback().await?;
            return Err(err);
        };

        tx.commit().await?;
        row.into_domain()
    }

    /// Enables or disables probing for a domain. The primary cannot be disabled.
    pub async fn set_active(
        &self,
        id: &str,
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<Domain, DomainError> {
        let patch = DomainPatch {
            is_active: Some(is_active),
            ..DomainPatch::default()
        };
        self.update(id, &patch, now).await
    }

    /// Applies an operator-asserted status (`ready` or `blocked`).
    pub async fn set_status(
        &self,
        id: &str,
        status: DomainStatus,
        now: DateTime<Utc>,
    ) -> Result<Domain, DomainError> {
        let patch = DomainPatch {
            status: Some(status),
            ..DomainPatch::default()
        };
        self.update(id, &patch, now).await
    }

    /// Removes a domain. The current primary cannot be deleted.
    pub async fn delete(&self, id: &str) -> Result<Domain, DomainError> {
        let sql = format!(
            "DELETE FROM domains WHERE id = ? AND is_primary = 0 RETURNING {DOMAIN_COLUMNS}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, DomainRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            let err = explain_refusal(&mut tx, id).await;
            tx.rollback().await?;
            return Err(err);
        };

        tx.commit().await?;
        row.into_domain()
    }

    /// Persists a probe outcome, guarded by the status the prober read before checking.
    ///
    /// Returns `false` when the row changed underneath the prober (operator edit,
    /// deactivation or deletion); the write is skipped in that case.
    pub async fn record_probe(
        &self,
        id: &str,
        expected_status: DomainStatus,
        update: &ProbeUpdate,
    ) -> Result<bool, DomainError> {
        let checked_at = to_rfc3339(update.last_checked_at);
        let result = sqlx::query(
            "UPDATE domains \
             SET status = ?, last_checked_at = ?, blocked_at = ?, updated_at = ? \
             WHERE id = ? AND status = ? AND is_active = 1",
        )
        .bind(update.status.as_str())
        .bind(&checked_at)
        .bind(update.blocked_at.map(to_rfc3339))
        .bind(&checked_at)
        .bind(id)
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Registry-level "next available domain": applies the selection policy to persisted rows.
    ///
    /// `failed_ids` lists domains the caller has just seen fail; they are skipped even when
    /// their stored status has not caught up yet.
    pub async fn next_available(
        &self,
        exclude_id: &str,
        failed_ids: &[&str],
    ) -> Result<Option<Domain>, DomainError> {
        let mut candidates = self.list_active().await?;
        candidates.retain(|domain| !failed_ids.contains(&domain.id.as_str()));
        Ok(select_next_primary(&candidates, exclude_id).cloned())
    }

    /// Moves the primary flag from `from_id` to `to_id` in a single transaction.
    ///
    /// Both rows are compare-and-set: the old primary must still be primary and the
    /// candidate must still be active and neither blocked nor offline, otherwise nothing
    /// changes.
    pub async fn promote_failover(
        &self,
        from_id: &str,
        to_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Domain, DomainError> {
        let updated_at = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;

        let demoted = sqlx::query(
            "UPDATE domains SET is_primary = 0, updated_at = ? WHERE id = ? AND is_primary = 1",
        )
        .bind(&updated_at)
        .bind(from_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if demoted != 1 {
            tx.rollback().await?;
            return Err(DomainError::PrimaryChanged);
        }

        let sql = format!(
            "UPDATE domains SET is_primary = 1, updated_at = ? \
             WHERE id = ? AND is_active = 1 AND status NOT IN ('blocked', 'offline') \
             RETURNING {DOMAIN_COLUMNS}"
        );
        let promoted = sqlx::query_as::<_, DomainRow>(&sql)
            .bind(&updated_at)
            .bind(to_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = promoted else {
            tx.rollback().await?;
            return Err(DomainError::CandidateUnavailable);
        };

        tx.commit().await?;
        row.into_domain()
    }

    /// Operator-initiated promotion of `id`, demoting whichever domain is primary.
    pub async fn promote(&self, id: &str, now: DateTime<Utc>) -> Result<Promotion, DomainError> {
        let updated_at = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;

        let select_target = format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = ?");
        let target = sqlx::query_as::<_, DomainRow>(&select_target)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DomainError::NotFound)?
            .into_domain()?;

        if !target.is_failover_candidate() {
            tx.rollback().await?;
            return Err(DomainError::NotEligible);
        }
        if target.is_primary {
            tx.rollback().await?;
            return Ok(Promotion {
                previous: None,
                promoted: target,
            });
        }

        let select_previous = format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE is_primary = 1");
        let previous = sqlx::query_as::<_, DomainRow>(&select_previous)
            .fetch_optional(&mut *tx)
            .await?
            .map(DomainRow::into_domain)
            .transpose()?;

        sqlx::query("UPDATE domains SET is_primary = 0, updated_at = ? WHERE is_primary = 1")
            .bind(&updated_at)
            .execute(&mut *tx)
            .await?;

        let promote_sql = format!(
            "UPDATE domains SET is_primary = 1, updated_at = ? \
             WHERE id = ? RETURNING {DOMAIN_COLUMNS}"
        );
        let promoted = sqlx::query_as::<_, DomainRow>(&promote_sql)
            .bind(&updated_at)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?
            .into_domain()?;

        tx.commit().await?;
        Ok(Promotion { previous, promoted })
    }
}

/// Data required to register a domain.
pub struct NewDomain<'a> {
    pub domain: &'a str,
    pub priority: i64,
    pub notes: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Partial update of operator-editable fields. `None` leaves a column unchanged.
#[derive(Debug, Default)]
pub struct DomainPatch<'a> {
    pub is_active: Option<bool>,
    pub status: Option<DomainStatus>,
    pub priority: Option<i64>,
    pub notes: Option<&'a str>,
}

/// Result of an operator promotion.
#[derive(Debug, Clone)]
pub struct Promotion {
    pub previous: Option<Domain>,
    pub promoted: Domain,
}

/// Raw `domains` row.
#[derive(Debug, sqlx::FromRow)]
struct DomainRow {
    seq: i64,
    id: String,
    domain: String,
    is_primary: bool,
    is_active: bool,
    priority: i64,
    status: String,
    last_checked_at: Option<DateTime<Utc>>,
    blocked_at: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DomainRow {
    fn into_domain(self) -> Result<Domain, DomainError> {
        let status = self
            .status
            .parse::<DomainStatus>()
            .map_err(DomainError::InvalidStatus)?;
        Ok(Domain {
            id: self.id,
            seq: self.seq,
            domain: self.domain,
            is_primary: self.is_primary,
            is_active: self.is_active,
            priority: self.priority,
            status,
            last_checked_at: self.last_checked_at,
            blocked_at: self.blocked_at,
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain not found")]
    NotFound,
    #[error("domain '{0}' is already registered")]
    Duplicate(String),
    #[error("operation not allowed on the primary domain")]
    IsPrimary,
    #[error("domain must be active and not blocked to become primary")]
    NotEligible,
    #[error("primary domain changed concurrently")]
    PrimaryChanged,
    #[error("failover candidate is no longer eligible")]
    CandidateUnavailable,
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository over the `audit_logs` table.
#[derive(Clone)]
pub struct AuditLogRepository {
    pool: SqlitePool,
}

impl AuditLogRepository {
    /// Appends an audit event and returns its identifier.
    pub async fn append(&self, event: &NewAuditEvent<'_>) -> Result<String, AuditLogError> {
        let id = Uuid::new_v4().to_string();
        let details = serde_json::to_string(event.details)?;
        sqlx::query(
            "INSERT INTO audit_logs \
             (id, log_type, severity, action, resource, details_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(event.log_type)
        .bind(event.severity.as_str())
        .bind(event.action)
        .bind(event.resource)
        .bind(details)
        .bind(to_rfc3339(event.created_at))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Lists the most recent audit events, newest first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<AuditEvent>, AuditLogError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT id, log_type, severity, action, resource, details_json, created_at \
             FROM audit_logs ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRow::into_event).collect()
    }
}

/// Payload for a new audit record.
pub struct NewAuditEvent<'a> {
    pub log_type: &'a str,
    pub severity: AuditSeverity,
    pub action: &'a str,
    pub resource: &'a str,
    pub details: &'a Value,
    pub created_at: DateTime<Utc>,
}

/// Persisted audit record.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub id: String,
    pub log_type: String,
    pub severity: AuditSeverity,
    pub action: String,
    pub resource: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: String,
    log_type: String,
    severity: String,
    action: String,
    resource: String,
    details_json: String,
    created_at: DateTime<Utc>,
}

impl AuditRow {
    fn into_event(self) -> Result<AuditEvent, AuditLogError> {
        Ok(AuditEvent {
            severity: self
                .severity
                .parse()
                .map_err(AuditLogError::InvalidSeverity)?,
            details: serde_json::from_str(&self.details_json)?,
            id: self.id,
            log_type: self.log_type,
            action: self.action,
            resource: self.resource,
            created_at: self.created_at,
        })
    }
}

/// Errors raised by the audit log.
#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("failed to encode audit details: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid severity: {0}")]
    InvalidSeverity(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Classifies a guarded write that matched no row.
async fn explain_refusal(conn: &mut SqliteConnection, id: &str) -> DomainError {
    let sql = format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = ?");
    let row = sqlx::query_as::<_, DomainRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await;
    match row {
        Ok(Some(row)) if row.is_primary => DomainError::IsPrimary,
        Ok(Some(_)) => DomainError::PrimaryChanged,
        Ok(None) => DomainError::NotFound,
        Err(err) => DomainError::Database(err),
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
