//! Domain types and pure policies for the mirror registry.
//!
//! Nothing in this crate performs I/O: probe transitions, the failover
//! selection rule and hostname normalization are plain functions so they can
//! be exercised without a database or network.
pub mod health;
pub mod name;
pub mod selection;
pub mod types;

pub use health::{is_success_code, summarize, ProbeUpdate};
pub use name::{host_of, normalize_domain, DomainNameError};
pub use selection::{current_primary, select_next_primary};
pub use types::{AuditSeverity, BatchSummary, Domain, DomainStatus, HealthResult, Protocol};
