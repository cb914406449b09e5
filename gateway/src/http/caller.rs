//! The address of the caller of a request.

use core::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{StatusCode, request::Parts},
};

use crate::app::AppState;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Caller address used for allow-list checks and logging.
///
/// The socket peer, or the first `X-Forwarded-For` entry when
/// `[server] trust_forwarded_for` is enabled and the header parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallerIp(pub IpAddr);

/// First address of an `X-Forwarded-For` header value.
fn first_forwarded(value: &str) -> Option<IpAddr> {
    let first = value.split(',').next()?.trim();
    first
        .parse::<IpAddr>()
        .ok()
        .or_else(|| first.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

impl FromRequestParts<AppState> for CallerIp {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if state.engine.config().server.trust_forwarded_for
            && let Some(ip) = parts
                .headers
                .get(X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
                .and_then(first_forwarded)
        {
            return Ok(Self(ip.to_canonical()));
        }
        ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .map(|ConnectInfo(addr)| Self(addr.ip().to_canonical()))
            .map_err(|_| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "caller address unavailable",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_takes_first_entry() {
        assert_eq!(
            first_forwarded("203.0.113.7, 10.0.0.1"),
            Some("203.0.113.7".parse().unwrap())
        );
        assert_eq!(
            first_forwarded("[2001:db8::1]:4711"),
            Some("2001:db8::1".parse().unwrap())
        );
        assert_eq!(first_forwarded("unknown, 10.0.0.1"), None);
        assert_eq!(first_forwarded(""), None);
    }
}
