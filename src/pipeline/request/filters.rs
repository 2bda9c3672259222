//! Built-in request filters.

use std::sync::Arc;

use futures_util::future::{ready, Ready};

use crate::http::message::GatewayRequest;
use crate::pipeline::error::StageError;
use crate::security::access_control::{resolve_client_ip, IpRule};

type Outcome = Ready<Result<bool, StageError>>;

/// Admit only clients matching `rules`. Requests without a resolvable IP are rejected.
pub fn ip_allow_list(rules: Vec<IpRule>) -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    let rules: Arc<[IpRule]> = rules.into();
    move |request| {
        let admitted = match resolve_client_ip(request.headers(), request.peer_addr()) {
            Some(ip) => rules.iter().any(|rule| rule.matches(ip)),
            None => {
                tracing::debug!(path = %request.path(), "No client IP, allow list rejects");
                false
            }
        };
        ready(Ok(admitted))
    }
}

/// Reject clients matching `rules`. Requests without a resolvable IP pass.
pub fn ip_deny_list(rules: Vec<IpRule>) -> impl Fn(GatewayRequest) -> Outcome + Send + Sync {
    let rules: Arc<[IpRule]> = rules.into();
    move |request| {
        let denied = resolve_client_ip(request.headers(), request.peer_addr())
            .is_some_and(|ip| rules.iter().any(|rule| rule.matches(ip)));
        ready(Ok(!denied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn rules(raw: &[&str]) -> Vec<IpRule> {
        IpRule::parse_all(raw).unwrap()
    }

    fn from(ip: &str) -> GatewayRequest {
        GatewayRequest::new(Method::GET, "/").with_peer_addr(ip.parse().unwrap())
    }

    #[tokio::test]
    async fn test_allow_list() {
        let filter = ip_allow_list(rules(&["10.0.0.0/8", "192.168.1.10"]));
        assert!(filter(from("10.20.30.40")).await.unwrap());
        assert!(filter(from("192.168.1.10")).await.unwrap());
        assert!(!filter(from("8.8.8.8")).await.unwrap());

        let forwarded = from("10.0.0.1")
            .with_header("x-forwarded-for", axum::http::HeaderValue::from_static("8.8.8.8"));
        assert!(!filter(forwarded).await.unwrap());
    }

    #[tokio::test]
    async fn test_unresolved_ip_policy() {
        let unknown = || GatewayRequest::new(Method::GET, "/");
        let allow = ip_allow_list(rules(&["0.0.0.0/0"]));
        let deny = ip_deny_list(rules(&["0.0.0.0/0"]));
        assert!(!allow(unknown()).await.unwrap());
        assert!(deny(unknown()).await.unwrap());
    }

    #[tokio::test]
    async fn test_deny_list() {
        let filter = ip_deny_list(rules(&["203.0.113.0/24"]));
        assert!(!filter(from("203.0.113.9")).await.unwrap());
        assert!(filter(from("198.51.100.1")).await.unwrap());
    }
}
