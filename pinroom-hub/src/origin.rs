//! Origin allow-listing for WebSocket upgrades.
//!
//! Consulted before any peer exists. This is browser-facing hardening, not
//! authentication: requests without an `Origin` header are let through, and
//! anything that cannot be parsed is refused.

use axum::http::header::{HOST, ORIGIN};
use axum::http::uri::Authority;
use axum::http::{HeaderMap, Uri};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OriginError {
    #[error("malformed origin: {0}")]
    Malformed(String),
    #[error("origin not allowed: {0}")]
    Untrusted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid origin pattern {pattern:?}: {reason}")]
pub struct PatternError {
    pattern: String,
    reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    /// `*.example.com`: any subdomain of the stored suffix (kept with its leading dot).
    Subdomain(String),
}

/// One trusted origin, `scheme://host[:port]`. The host may be `*.domain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPattern {
    scheme: String,
    host: HostPattern,
    port: u16,
}

impl OriginPattern {
    fn exact(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: HostPattern::Exact(host.to_string()),
            port,
        }
    }

    fn matches(&self, origin: &ParsedOrigin) -> bool {
        if self.scheme != origin.scheme || self.port != origin.port {
            return false;
        }
        match &self.host {
            HostPattern::Exact(host) => *host == origin.host,
            HostPattern::Subdomain(suffix) => {
                origin.host.len() > suffix.len() && origin.host.ends_with(suffix.as_str())
            }
        }
    }
}

impl FromStr for OriginPattern {
    type Err = PatternError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        let err = |reason| PatternError {
            pattern: pattern.to_string(),
            reason,
        };

        let lowered = pattern.trim().to_ascii_lowercase();
        let (scheme, rest) = lowered.split_once("://").ok_or_else(|| err("missing scheme"))?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        if rest.contains('/') || rest.contains('?') || rest.contains('#') {
            return Err(err("must not contain a path"));
        }
        let default_port = default_port(scheme).ok_or_else(|| err("unsupported scheme"))?;

        // Colons inside a bracketed IPv6 literal are not a port separator.
        let host_end = rest.rfind(']').map_or(0, |i| i + 1);
        let (host, port) = match rest[host_end..].find(':').map(|i| host_end + i) {
            Some(sep) => {
                let port = rest[sep + 1..].parse::<u16>().map_err(|_| err("invalid port"))?;
                (&rest[..sep], port)
            }
            None => (rest, default_port),
        };
        if host.is_empty() {
            return Err(err("missing host"));
        }
        if host.starts_with('[') != host.ends_with(']') {
            return Err(err("unbalanced IPv6 brackets"));
        }

        let host = match host.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') && suffix.len() > 1 => {
                HostPattern::Subdomain(suffix.to_string())
            }
            Some(_) => return Err(err("wildcard must be a leading '*.'")),
            None if host.contains('*') => return Err(err("wildcard must be a leading '*.'")),
            None => HostPattern::Exact(host.to_string()),
        };

        Ok(Self {
            scheme: scheme.to_string(),
            host,
            port,
        })
    }
}

impl fmt::Display for OriginPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = match &self.host {
            HostPattern::Exact(host) => host.clone(),
            HostPattern::Subdomain(suffix) => format!("*{suffix}"),
        };
        write!(f, "{}://{host}:{}", self.scheme, self.port)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ParsedOrigin {
    scheme: String,
    host: String,
    port: u16,
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

fn parse_origin(value: &str) -> Option<ParsedOrigin> {
    let uri = Uri::from_str(value).ok()?;
    let scheme = uri.scheme_str()?.to_ascii_lowercase();
    let authority = uri.authority()?;
    if authority.as_str().contains('@') {
        return None;
    }
    if uri.path_and_query().is_some_and(|pq| !matches!(pq.as_str(), "" | "/")) {
        return None;
    }
    let port = match (authority.port_u16(), default_port(&scheme)) {
        (_, None) => return None,
        (Some(port), Some(_)) => port,
        (None, Some(port)) => port,
    };
    Some(ParsedOrigin {
        scheme,
        host: authority.host().to_ascii_lowercase(),
        port,
    })
}

/// Upgrade admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginPolicy {
    trusted: Vec<OriginPattern>,
    allow_any: bool,
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self {
            trusted: vec![
                OriginPattern::exact("http", "localhost", 8080),
                OriginPattern::exact("http", "127.0.0.1", 8080),
            ],
            allow_any: false,
        }
    }
}

impl OriginPolicy {
    /// Only origin-less and same-origin requests, plus `trusted`.
    pub fn new(trusted: Vec<OriginPattern>) -> Self {
        Self {
            trusted,
            allow_any: false,
        }
    }

    /// Parse each pattern; the first invalid one is reported.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let trusted = patterns
            .into_iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(trusted))
    }

    /// Accept every request regardless of origin.
    pub fn permissive() -> Self {
        Self {
            trusted: Vec::new(),
            allow_any: true,
        }
    }

    pub fn trusted(&self) -> &[OriginPattern] {
        &self.trusted
    }

    pub fn allows_any(&self) -> bool {
        self.allow_any
    }

    /// Decide on an upgrade request from its headers.
    pub fn check(&self, headers: &HeaderMap) -> Result<(), OriginError> {
        if self.allow_any {
            return Ok(());
        }
        let Some(raw) = headers.get(ORIGIN) else {
            return Ok(());
        };
        let value = raw
            .to_str()
            .map_err(|_| OriginError::Malformed(String::from_utf8_lossy(raw.as_bytes()).into_owned()))?;
        let origin = parse_origin(value).ok_or_else(|| OriginError::Malformed(value.to_string()))?;

        if is_same_origin(&origin, headers) || self.trusted.iter().any(|p| p.matches(&origin)) {
            Ok(())
        } else {
            Err(OriginError::Untrusted(value.to_string()))
        }
    }
}

fn is_same_origin(origin: &ParsedOrigin, headers: &HeaderMap) -> bool {
    let Some(host) = headers.get(HOST).and_then(|h| h.to_str().ok()) else {
        return false;
    };
    let Ok(authority) = Authority::from_str(host) else {
        return false;
    };
    let port = match authority.port_u16() {
        Some(port) => port,
        None => match default_port(&origin.scheme) {
            Some(port) => port,
            None => return false,
        },
    };
    authority.host().eq_ignore_ascii_case(&origin.host) && port == origin.port
}
