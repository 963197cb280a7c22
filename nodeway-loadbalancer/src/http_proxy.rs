//! Process-wide HTTP CONNECT proxy for load-balancer dials
//!
//! `set_http_proxy` must be called once during agent startup, before any
//! load-balancer is created. Dials only go through a proxy when
//! `NODEWAY_AGENT_HTTP_PROXY_ALLOWED` is true, a proxy is configured in the
//! environment for the server URL's scheme, and the server is not excluded
//! by `NO_PROXY`.

use std::net::IpAddr;
use std::sync::OnceLock;

use base64::Engine;
use ipnet::IpNet;
use nodeway_core::address::{join_host_port, split_host_port};
use nodeway_core::EndpointUrl;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{Error, Result};

/// Opt-in switch for proxying load-balancer connections
pub const HTTP_PROXY_ALLOWED_ENV: &str = "NODEWAY_AGENT_HTTP_PROXY_ALLOWED";

static HTTP_PROXY: OnceLock<Option<HttpProxy>> = OnceLock::new();

/// An HTTP proxy reachable with plain CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProxy {
    /// `host:port` of the proxy
    pub address: String,
    /// Base64 `user:password` for `Proxy-Authorization: Basic`
    pub authorization: Option<String>,
}

/// Resolve the proxy for `server_url` from the process environment and
/// install it for every subsequent load-balancer dial.
///
/// Fails if called more than once.
pub fn set_http_proxy(server_url: &str) -> Result<()> {
    let resolved = resolve(server_url, |key| std::env::var(key).ok())?;
    HTTP_PROXY
        .set(resolved.clone())
        .map_err(|_| Error::HttpProxyAlreadySet)?;

    match resolved {
        Some(proxy) => {
            tracing::info!(proxy = %proxy.address, server_url = %server_url, "Using HTTP proxy for load-balancer connections");
        }
        None => {
            tracing::debug!(server_url = %server_url, "Load-balancer connections are not proxied");
        }
    }
    Ok(())
}

/// The installed proxy, if any
pub(crate) fn configured() -> Option<&'static HttpProxy> {
    HTTP_PROXY.get().and_then(Option::as_ref)
}

/// Decide which proxy, if any, connections to `server_url` should use.
pub fn resolve(server_url: &str, env: impl Fn(&str) -> Option<String>) -> Result<Option<HttpProxy>> {
    let allowed = env(HTTP_PROXY_ALLOWED_ENV).is_some_and(|v| parse_bool(&v));
    if !allowed {
        return Ok(None);
    }

    let server = EndpointUrl::parse(server_url)?;
    let keys: [&str; 2] = if server.scheme() == "https" {
        ["HTTPS_PROXY", "https_proxy"]
    } else {
        ["HTTP_PROXY", "http_proxy"]
    };
    let Some(proxy) = first_set(&env, &keys) else {
        return Ok(None);
    };

    let no_proxy = first_set(&env, &["NO_PROXY", "no_proxy"]).unwrap_or_default();
    if no_proxy_matches(&no_proxy, server.host(), server.port()) {
        return Ok(None);
    }

    parse_proxy_url(&proxy).map(Some)
}

fn first_set(env: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| env(key).filter(|value| !value.trim().is_empty()))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "t" | "true")
}

fn parse_proxy_url(raw: &str) -> Result<HttpProxy> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let invalid = |reason: String| Error::InvalidHttpProxy {
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "http" {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    let endpoint = EndpointUrl::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;

    let authorization = (!url.username().is_empty()).then(|| {
        let user = percent_decode(url.username());
        let password = url.password().map(percent_decode).unwrap_or_default();
        base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"))
    });

    Ok(HttpProxy {
        address: join_host_port(endpoint.host(), &endpoint.port().to_string()),
        authorization,
    })
}

/// Userinfo is percent-encoded, not form-encoded: `+` stays `+`.
fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Whether `NO_PROXY` excludes `host:port`.
///
/// Entries are comma separated: `*`, IP addresses, CIDR ranges, domains
/// (matching the domain and its subdomains, with or without a leading dot),
/// each optionally suffixed with `:port`.
#[must_use]
pub fn no_proxy_matches(no_proxy: &str, host: &str, port: u16) -> bool {
    let host = host.to_ascii_lowercase();
    let host_ip = host.parse::<IpAddr>().ok();

    no_proxy
        .split(',')
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .any(|entry| {
            if entry == "*" {
                return true;
            }

            if let Ok(net) = entry.parse::<IpNet>() {
                return host_ip.is_some_and(|ip| net.contains(&ip));
            }

            let (pattern, entry_port) = match split_host_port(&entry) {
                Ok((h, p)) => (h.to_string(), p.parse::<u16>().ok()),
                Err(_) => (entry.trim_start_matches('[').trim_end_matches(']').to_string(), None),
            };
            if entry_port.is_some_and(|p| p != port) {
                return false;
            }

            if let Ok(ip) = pattern.parse::<IpAddr>() {
                return host_ip == Some(ip);
            }

            let domain = pattern.trim_start_matches("*.").trim_start_matches('.');
            !domain.is_empty()
                && (host == domain || host.ends_with(&format!(".{domain}")))
        })
}
