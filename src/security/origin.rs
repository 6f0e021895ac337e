//! Origin allow-list for the HTTP transport.
//!
//! Browsers attach an `Origin` header to cross-origin requests; checking it
//! blocks a web page from driving a locally running server (DNS rebinding).
//! Requests without `Origin` are checked by their `Host` header instead.
//!
//! Allow-list entries are either `*`, a full origin (`http://localhost:3000`)
//! or a bare host (`localhost`, `::1`) that matches on any scheme and port.

/// Outcome of an origin check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginCheck {
    /// The request may proceed.
    Allowed,
    /// The request must be rejected; carries the offending value.
    Rejected(String),
}

/// Allow-list of origins and hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// Creates a policy from allow-list entries.
    #[must_use]
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed
                .into_iter()
                .map(|entry| entry.into().trim().to_ascii_lowercase())
                .collect(),
        }
    }

    /// A policy that allows everything.
    #[must_use]
    pub fn permissive() -> Self {
        Self::new(["*"])
    }

    /// Checks the request's `Origin` header, falling back to `Host`.
    ///
    /// A request that declares neither is allowed: only browsers are
    /// subject to cross-origin attacks and they always declare one.
    #[must_use]
    pub fn check(&self, origin: Option<&str>, host: Option<&str>) -> OriginCheck {
        if self.allowed.iter().any(|entry| entry == "*") {
            return OriginCheck::Allowed;
        }

        let allowed = match (origin, host) {
            (Some(origin), _) => self.origin_allowed(origin),
            (None, Some(host)) => self.host_allowed(strip_port(host)),
            (None, None) => true,
        };

        if allowed {
            OriginCheck::Allowed
        } else {
            OriginCheck::Rejected(origin.or(host).unwrap_or_default().to_string())
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        let origin = origin.trim().to_ascii_lowercase();
        if self.allowed.contains(&origin) {
            return true;
        }
        let Some((_, authority)) = origin.split_once("://") else {
            return false;
        };
        let authority = authority.split('/').next().unwrap_or_default();
        self.host_allowed(strip_port(authority))
    }

    fn host_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        !host.is_empty() && self.allowed.iter().any(|entry| *entry == host)
    }
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self::new(["localhost", "127.0.0.1", "::1"])
    }
}

/// `host:port` → `host`, `[::1]:port` → `::1`.
fn strip_port(authority: &str) -> &str {
    let authority = authority.trim();
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default();
    }
    match authority.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 address without a port.
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}
