use chrono::{DateTime, Utc};

use crate::types::{BatchSummary, Domain, DomainStatus, HealthResult};

/// Returns `true` for response codes that count as a reachable mirror.
///
/// Any 2xx is accepted, plus the two redirect codes commonly used by mirrors
/// that bounce visitors to a landing path.
pub fn is_success_code(code: u16) -> bool {
    matches!(code, 200..=299 | 301 | 302)
}

/// Column values to persist after probing a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeUpdate {
    pub status: DomainStatus,
    pub last_checked_at: DateTime<Utc>,
    pub blocked_at: Option<DateTime<Utc>>,
}

impl ProbeUpdate {
    /// Derives the new row state from the previously persisted row and a fresh result.
    ///
    /// `blocked_at` only moves on an `active -> unhealthy` transition. Operator-blocked
    /// domains keep their status regardless of reachability.
    pub fn from_result(previous: &Domain, result: &HealthResult, now: DateTime<Utc>) -> Self {
        let status = if previous.status == DomainStatus::Blocked {
            DomainStatus::Blocked
        } else {
            result.status()
        };

        let blocked_at = if previous.status == DomainStatus::Active && !result.healthy {
            Some(now)
        } else {
            previous.blocked_at
        };

        Self {
            status,
            last_checked_at: now,
            blocked_at,
        }
    }

    /// Returns `true` when this update records a fresh failure of a previously healthy domain.
    pub fn is_new_failure(&self, previous: &Domain) -> bool {
        self.blocked_at != previous.blocked_at
    }
}

/// Computes the aggregate counts for a probe batch.
pub fn summarize<'a, I>(results: I) -> BatchSummary
where
    I: IntoIterator<Item = &'a HealthResult>,
{
    let mut total = 0usize;
    let mut healthy = 0usize;
    let mut elapsed = 0u64;
    for result in results {
        total += 1;
        if result.healthy {
            healthy += 1;
        }
        elapsed = elapsed.saturating_add(result.response_time_ms);
    }

    let avg_response_time_ms = if total == 0 {
        0
    } else {
        // Rounded to the nearest millisecond.
        (elapsed + total as u64 / 2) / total as u64
    };

    BatchSummary {
        total,
        healthy,
        offline: total - healthy,
        avg_response_time_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use chrono::TimeZone;

    fn domain(status: DomainStatus, blocked_at: Option<DateTime<Utc>>) -> Domain {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Domain {
            id: "d-1".to_string(),
            seq: 1,
            domain: "mirror.example".to_string(),
            is_primary: false,
            is_active: true,
            priority: 10,
            status,
            last_checked_at: None,
            blocked_at,
            notes: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn offline() -> HealthResult {
        HealthResult::unreachable(Some(500), None, Some(true), 30)
    }

    fn online() -> HealthResult {
        HealthResult::reachable(Protocol::Https, 200, Some(true), 30)
    }

    #[test]
    fn success_code_boundaries() {
        for code in [200, 250, 299, 301, 302] {
            assert!(is_success_code(code), "{code} should be healthy");
        }
        for code in [199, 300, 303, 304, 400, 404, 500] {
            assert!(!is_success_code(code), "{code} should be unhealthy");
        }
    }

    #[test]
    fn active_to_offline_sets_blocked_at() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let previous = domain(DomainStatus::Active, None);
        let update = ProbeUpdate::from_result(&previous, &offline(), now);

        assert_eq!(update.status, DomainStatus::Offline);
        assert_eq!(update.blocked_at, Some(now));
        assert_eq!(update.last_checked_at, now);
        assert!(update.is_new_failure(&previous));
    }

    #[test]
    fn repeated_failure_keeps_original_blocked_at() {
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap();
        let previous = domain(DomainStatus::Offline, Some(first));
        let update = ProbeUpdate::from_result(&previous, &offline(), now);

        assert_eq!(update.status, DomainStatus::Offline);
        assert_eq!(update.blocked_at, Some(first));
        assert!(!update.is_new_failure(&previous));
    }

    #[test]
    fn recovery_does_not_reset_blocked_at() {
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let previous = domain(DomainStatus::Offline, Some(first));
        let update = ProbeUpdate::from_result(&previous, &online(), now);

        assert_eq!(update.status, DomainStatus::Active);
        assert_eq!(update.blocked_at, Some(first));
    }

    #[test]
    fn ready_domain_failing_first_check_is_not_timestamped() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let previous = domain(DomainStatus::Ready, None);
        let update = ProbeUpdate::from_result(&previous, &offline(), now);

        assert_eq!(update.status, DomainStatus::Offline);
        assert_eq!(update.blocked_at, None);
    }

    #[test]
    fn blocked_status_survives_probe() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let previous = domain(DomainStatus::Blocked, None);

        let update = ProbeUpdate::from_result(&previous, &online(), now);
        assert_eq!(update.status, DomainStatus::Blocked);
        assert_eq!(update.last_checked_at, now);
    }

    #[test]
    fn summarize_counts_and_averages() {
        let results = vec![
            HealthResult::reachable(Protocol::Https, 200, Some(true), 100),
            HealthResult::reachable(Protocol::Http, 301, Some(true), 201),
            HealthResult::unresolvable(0),
        ];
        let summary = summarize(&results);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.offline, 1);
        assert_eq!(summary.avg_response_time_ms, 100);
    }

    #[test]
    fn summarize_empty_batch() {
        let summary = summarize(&Vec::<HealthResult>::new());
        assert_eq!(summary.total, 0);
        assert_eq!(summary.avg_response_time_ms, 0);
    }
}
