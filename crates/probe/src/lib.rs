//! Network-facing reachability checks: DNS-over-HTTPS lookups and HEAD probes.
pub mod check;
pub mod doh;
pub mod head;

pub use check::{DomainProber, ProbeSettings, DEFAULT_DNS_TIMEOUT, DEFAULT_HTTP_TIMEOUT};
pub use doh::{DnsAnswer, DnsResolver, DohError, DohResolver};
pub use head::{HeadError, HeadProbe, HttpHeadProber, PROBE_USER_AGENT};
