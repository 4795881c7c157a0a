use std::cmp::Reverse;

use crate::types::{Domain, DomainStatus};

/// Picks the domain that should replace `exclude_id` as primary.
///
/// Candidates must be active, not blocked and not known to be offline. Highest
/// priority wins; equal priorities fall back to the earliest inserted row. The
/// excluded domain is never returned, even when it is the only eligible row.
pub fn select_next_primary<'a>(candidates: &'a [Domain], exclude_id: &str) -> Option<&'a Domain> {
    candidates
        .iter()
        .filter(|domain| {
            domain.id != exclude_id
                && domain.is_failover_candidate()
                && domain.status != DomainStatus::Offline
        })
        .min_by_key(|domain| (Reverse(domain.priority), domain.seq))
}

/// Returns the active primary, if the registry currently has one.
pub fn current_primary(domains: &[Domain]) -> Option<&Domain> {
    domains
        .iter()
        .find(|domain| domain.is_primary && domain.is_active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn domain(id: &str, seq: i64, priority: i64, status: DomainStatus) -> Domain {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Domain {
            id: id.to_string(),
            seq,
            domain: format!("{id}.example"),
            is_primary: false,
            is_active: true,
            priority,
            status,
            last_checked_at: None,
            blocked_at: None,
            notes: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn picks_highest_priority() {
        let domains = vec![
            domain("a", 1, 100, DomainStatus::Offline),
            domain("b", 2, 80, DomainStatus::Active),
            domain("c", 3, 90, DomainStatus::Active),
        ];
        let next = select_next_primary(&domains, "a").expect("candidate");
        assert_eq!(next.id, "c");
    }

    #[test]
    fn skips_blocked_even_with_higher_priority() {
        let domains = vec![
            domain("a", 1, 100, DomainStatus::Offline),
            domain("b", 2, 80, DomainStatus::Active),
            domain("c", 3, 90, DomainStatus::Blocked),
        ];
        let next = select_next_primary(&domains, "a").expect("candidate");
        assert_eq!(next.id, "b");
    }

    #[test]
    fn skips_inactive_domains() {
        let mut inactive = domain("b", 2, 95, DomainStatus::Active);
        inactive.is_active = false;
        let domains = vec![
            domain("a", 1, 100, DomainStatus::Offline),
            inactive,
            domain("c", 3, 10, DomainStatus::Ready),
        ];
        let next = select_next_primary(&domains, "a").expect("candidate");
        assert_eq!(next.id, "c");
    }

    #[test]
    fn ties_resolve_to_earliest_insertion() {
        let domains = vec![
            domain("late", 9, 50, DomainStatus::Active),
            domain("early", 4, 50, DomainStatus::Active),
            domain("a", 1, 100, DomainStatus::Offline),
        ];
        let next = select_next_primary(&domains, "a").expect("candidate");
        assert_eq!(next.id, "early");
    }

    #[test]
    fn skips_offline_domains() {
        let domains = vec![
            domain("a", 1, 100, DomainStatus::Offline),
            domain("b", 2, 80, DomainStatus::Offline),
            domain("c", 3, 70, DomainStatus::Active),
        ];
        let next = select_next_primary(&domains, "a").expect("candidate");
        assert_eq!(next.id, "c");

        assert!(select_next_primary(&domains[..2], "a").is_none());
    }

    #[test]
    fn never_returns_the_excluded_domain() {
        let domains = vec![domain("a", 1, 100, DomainStatus::Active)];
        assert!(select_next_primary(&domains, "a").is_none());
    }

    #[test]
    fn exhausted_when_everything_else_is_blocked_or_inactive() {
        let mut inactive = domain("b", 2, 80, DomainStatus::Active);
        inactive.is_active = false;
        let domains = vec![
            domain("a", 1, 100, DomainStatus::Offline),
            inactive,
            domain("c", 3, 90, DomainStatus::Blocked),
        ];
        assert!(select_next_primary(&domains, "a").is_none());
    }

    #[test]
    fn current_primary_ignores_inactive_rows() {
        let mut primary = domain("a", 1, 100, DomainStatus::Active);
        primary.is_primary = true;
        primary.is_active = false;
        let domains = vec![primary, domain("b", 2, 80, DomainStatus::Active)];
        assert!(current_primary(&domains).is_none());
    }
}
