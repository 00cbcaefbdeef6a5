//! IP allowlist middleware
//!
//! Accepts a list of CIDRs (IPv4 and IPv6). An empty list allows all;
//! otherwise anything outside the ranges is rejected with 403. Applied to
//! migration and sync endpoints and optionally globally.

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use ipnetwork::IpNetwork;

use crate::error::{Error, Result};
use crate::principal::ClientIp;

/// A compiled allowlist
///
/// Runs ahead of the caller resolver in the chain, so it derives the
/// client address itself (trusting `X-Forwarded-For` only when the
/// service sits behind a configured proxy).
#[derive(Debug, Clone)]
pub struct IpAllowlist {
    networks: Vec<IpNetwork>,
    trust_proxy: bool,
}

impl IpAllowlist {
    /// Parse CIDR strings; configuration validation has already checked
    /// them, so failures here are internal errors.
    pub fn new(cidrs: &[String], trust_proxy: bool) -> Result<Self> {
        let networks = cidrs
            .iter()
            .map(|cidr| {
                cidr.parse::<IpNetwork>()
                    .map_err(|e| Error::Config(format!("invalid CIDR '{}': {}", cidr, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            networks,
            trust_proxy,
        })
    }

    /// Empty list means allow everything
    pub fn permits(&self, ip: IpAddr) -> bool {
        self.networks.is_empty() || self.networks.iter().any(|net| net.contains(ip))
    }

    /// Middleware: reject callers outside the allowlist
    pub async fn middleware(
        State(allowlist): State<Self>,
        request: Request<Body>,
        next: Next,
    ) -> Result<Response> {
        if allowlist.networks.is_empty() {
            return Ok(next.run(request).await);
        }

        let ip = allowlist.resolve_ip(&request);

        match ip {
            Some(ip) if allowlist.permits(ip) => Ok(next.run(request).await),
            Some(ip) => {
                tracing::warn!(%ip, "request rejected by IP allowlist");
                Err(Error::Forbidden("address not allowed".into()))
            }
            None => Err(Error::Forbidden("client address unknown".into())),
        }
    }

    /// Client address: resolver-provided extension if present, otherwise
    /// derived from headers / the socket the same way the resolver does.
    fn resolve_ip(&self, request: &Request<Body>) -> Option<IpAddr> {
        if let Some(ClientIp(Some(ip))) = request.extensions().get::<ClientIp>() {
            if let Ok(ip) = ip.parse() {
                return Some(ip);
            }
        }

        if self.trust_proxy {
            if let Some(forwarded) = request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                if let Some(first) = forwarded.split(',').next() {
                    if let Ok(ip) = first.trim().parse() {
                        return Some(ip);
                    }
                }
            }
        }

        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_allows_all() {
        let allowlist = IpAllowlist::new(&[], false).unwrap();
        assert!(allowlist.permits("203.0.113.9".parse().unwrap()));
        assert!(allowlist.permits("::1".parse().unwrap()));
    }

    #[test]
    fn test_v4_ranges() {
        let allowlist = IpAllowlist::new(&["10.0.0.0/8".to_string()], false).unwrap();
        assert!(allowlist.permits("10.1.2.3".parse().unwrap()));
        assert!(!allowlist.permits("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_v6_ranges() {
        let allowlist =
            IpAllowlist::new(&["2001:db8::/32".to_string(), "127.0.0.1/32".to_string()], false).unwrap();
        assert!(allowlist.permits("2001:db8::42".parse().unwrap()));
        assert!(!allowlist.permits("2001:db9::1".parse().unwrap()));
        assert!(allowlist.permits("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_single_host() {
        let allowlist = IpAllowlist::new(&["198.51.100.7/32".to_string()], false).unwrap();
        assert!(allowlist.permits("198.51.100.7".parse().unwrap()));
        assert!(!allowlist.permits("198.51.100.8".parse().unwrap()));
    }

    #[test]
    fn test_invalid_cidr_errors() {
        assert!(IpAllowlist::new(&["not-a-cidr".to_string()], false).is_err());
    }
}
