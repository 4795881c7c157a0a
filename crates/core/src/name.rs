use thiserror::Error;
use url::{Host, Url};

/// Normalizes operator input into the canonical `host[:port]` form stored in the registry.
///
/// Accepts bare hostnames as well as pasted URLs (`https://Mirror.example/`), but
/// rejects anything carrying a path, query, fragment or credentials.
pub fn normalize_domain(input: &str) -> Result<String, DomainNameError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DomainNameError::Empty);
    }

    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let without_slash = without_scheme.strip_suffix('/').unwrap_or(without_scheme);

    if without_slash.is_empty() || without_slash.chars().any(char::is_whitespace) {
        return Err(DomainNameError::Invalid(trimmed.to_string()));
    }

    let url = Url::parse(&format!("http://{without_slash}"))
        .map_err(|_| DomainNameError::Invalid(trimmed.to_string()))?;

    if url.path() != "/"
        || url.query().is_some()
        || url.fragment().is_some()
        || !url.username().is_empty()
        || url.password().is_some()
    {
        return Err(DomainNameError::Invalid(trimmed.to_string()));
    }

    let host = match url.host() {
        Some(Host::Domain(name)) => {
            if !name.contains('.') && name != "localhost" {
                return Err(DomainNameError::Invalid(trimmed.to_string()));
            }
            name.trim_end_matches('.').to_string()
        }
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => format!("[{addr}]"),
        None => return Err(DomainNameError::Invalid(trimmed.to_string())),
    };

    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

/// Returns the hostname part of a stored `host[:port]` value, without brackets.
pub fn host_of(domain: &str) -> &str {
    if let Some(rest) = domain.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    domain.split(':').next().unwrap_or(domain)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainNameError {
    #[error("domain must not be empty")]
    Empty,
    #[error("'{0}' is not a valid hostname")]
    Invalid(String),
}
