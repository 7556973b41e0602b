//! Authenticator (§6 external interface): `(headers, client_id) -> Option<AuthClaims>`.
//! The real account/device/JWT issuance service lives outside this crate's
//! scope per §1 — this module only defines the trust boundary the hub
//! programs against, plus a bearer-token reference implementation grounded
//! on the teacher's `extract_bearer`/`validate_token` pair, kept here purely
//! as a demo/test double since the hub never owns credential issuance.

use std::collections::HashMap;

use axum::http::HeaderMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub account_id: String,
    pub device_id: String,
}

#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap, client_id: &str) -> Option<AuthClaims>;
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

fn extract_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization")?.to_str().ok().and_then(extract_bearer)
}

/// Bearer-token-to-claims map: a static authenticator suitable for tests and
/// for embedding the hub behind a gateway that has already resolved a
/// request to a fixed set of known device tokens. Production deployments
/// plug in a real `Authenticator` backed by the account service instead.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, AuthClaims>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, AuthClaims>) -> Self {
        Self { tokens }
    }
}

#[async_trait::async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap, _client_id: &str) -> Option<AuthClaims> {
        let token = extract_token_from_headers(headers)?;
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        headers
    }

    #[test]
    fn extract_bearer_strips_the_scheme() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("Basic abc123"), None);
    }

    #[tokio::test]
    async fn static_authenticator_resolves_known_tokens_and_rejects_unknown_ones() {
        let mut tokens = HashMap::new();
        tokens.insert(
            "tok-1".to_owned(),
            AuthClaims { account_id: "acct-1".to_owned(), device_id: "device-1".to_owned() },
        );
        let authenticator = StaticTokenAuthenticator::new(tokens);

        let claims = authenticator.authenticate(&headers_with_bearer("tok-1"), "client-1").await;
        assert_eq!(
            claims,
            Some(AuthClaims { account_id: "acct-1".to_owned(), device_id: "device-1".to_owned() })
        );

        assert_eq!(authenticator.authenticate(&headers_with_bearer("unknown"), "client-1").await, None);
        assert_eq!(authenticator.authenticate(&HeaderMap::new(), "client-1").await, None);
    }
}
