//! Client IP derivation behind a known number of reverse proxies.
//!
//! # Hop Counting
//!
//! Each proxy appends the address it received the connection from to
//! `X-Forwarded-For`. Reading the chain from the right, starting at the socket
//! peer, gives addresses in order of decreasing trust:
//!
//! ```text
//! X-Forwarded-For: spoofed, 203.0.113.7        peer: 10.0.0.2 (our proxy)
//!
//!   hop 0 → 10.0.0.2      (socket peer)
//!   hop 1 → 203.0.113.7   (appended by our proxy: the real client)
//!   hop 2 → spoofed       (client-controlled, never trusted with 1 hop)
//! ```
//!
//! With `hops = 1` the client address is the last entry of the header, so a
//! client cannot pick its rate-limit key by sending its own header. With
//! `hops = 0` forwarded headers are ignored and the socket peer is used.
//!
//! # The "unknown" Fallback
//!
//! When neither the socket peer (no `ConnectInfo`) nor a usable header entry
//! is available, all such requests share the `"unknown"` key.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::trace;

/// Fallback IP value when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Header appended to by reverse proxies.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Number of reverse proxy hops trusted when reading `X-Forwarded-For`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTrust {
    hops: usize,
}

impl ProxyTrust {
    pub fn new(hops: usize) -> Self {
        Self { hops }
    }

    /// Ignore forwarded headers entirely.
    pub fn none() -> Self {
        Self::new(0)
    }

    pub fn hops(&self) -> usize {
        self.hops
    }
}

impl Default for ProxyTrust {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Derive the client IP for a request.
///
/// The socket peer comes from axum's `ConnectInfo<SocketAddr>` extension
/// (present when serving with `into_make_service_with_connect_info`).
#[inline]
pub fn extract_client_ip<B>(req: &Request<B>, trust: ProxyTrust) -> Cow<'static, str> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let forwarded: Vec<&str> = req
        .headers()
        .get_all(FORWARDED_FOR_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect();

    resolve_client_ip(peer.as_deref(), &forwarded, trust)
}

/// Walk `hops` steps from the socket peer towards the client.
///
/// When the chain is shorter than `hops`, the furthest known address is used.
fn resolve_client_ip(
    peer: Option<&str>,
    forwarded: &[&str],
    trust: ProxyTrust,
) -> Cow<'static, str> {
    let chain = std::iter::once(peer).chain(forwarded.iter().rev().map(|entry| Some(*entry)));
    let steps = trust.hops().min(forwarded.len());

    match chain.skip(steps).next().flatten() {
        Some(ip) => {
            trace!(client_ip = %ip, hops = steps, "Resolved client IP");
            Cow::Owned(ip.to_string())
        }
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}
