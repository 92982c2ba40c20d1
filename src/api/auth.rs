//! Request Authorization
//!
//! Operators authenticate with their own bearer tokens. End users reach the
//! service through a gateway, which presents the gateway token and names the
//! user in `x-user-id`.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::common::log_security_event;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Operator,
    User(String),
}

impl Principal {
    pub fn is_operator(&self) -> bool {
        matches!(self, Principal::Operator)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("gateway request without x-user-id")]
    MissingUser,

    #[error("operator role required")]
    Forbidden,
}

/// Resolves request headers to a [`Principal`]
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> Result<Principal, AuthError>;
}

/// Static token authorizer
pub struct TokenAuthorizer {
    /// SHA-256 digests of the operator tokens
    operator_digests: Vec<[u8; 32]>,
    gateway_digest: Option<[u8; 32]>,
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Compare digests without an early exit
fn digests_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl TokenAuthorizer {
    pub fn new(operator_tokens: &[String], gateway_token: Option<&str>) -> Self {
        Self {
            operator_digests: operator_tokens
                .iter()
                .filter(|t| !t.is_empty())
                .map(|t| digest(t))
                .collect(),
            gateway_digest: gateway_token.filter(|t| !t.is_empty()).map(digest),
        }
    }

    fn bearer(headers: &HeaderMap) -> Option<&str> {
        headers
            .get(axum::http::header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let result = self.resolve(headers);
        if let Err(e) = &result {
            log_security_event(
                "authorization_failed",
                false,
                serde_json::json!({ "reason": e.to_string() }),
                None,
            );
        }
        result
    }
}

impl TokenAuthorizer {
    fn resolve(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = Self::bearer(headers).ok_or(AuthError::MissingToken)?;
        let presented = digest(token);

        if self
            .operator_digests
            .iter()
            .any(|d| digests_match(d, &presented))
        {
            return Ok(Principal::Operator);
        }

        match &self.gateway_digest {
            Some(gateway) if digests_match(gateway, &presented) => {
                let user = headers
                    .get(USER_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or(AuthError::MissingUser)?;
                Ok(Principal::User(user.to_string()))
            }
            _ => Err(AuthError::InvalidToken),
        }
    }
}

/// Require the operator role
pub fn require_operator(principal: &Principal) -> Result<(), AuthError> {
    if principal.is_operator() {
        Ok(())
    } else {
        log_security_event(
            "operator_route_denied",
            false,
            serde_json::json!({ "principal": format!("{:?}", principal) }),
            None,
        );
        Err(AuthError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(token: Option<&str>, user: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(t) = token {
            h.insert(
                axum::http::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", t)).unwrap(),
            );
        }
        if let Some(u) = user {
            h.insert(USER_ID_HEADER, HeaderValue::from_str(u).unwrap());
        }
        h
    }

    fn authorizer() -> TokenAuthorizer {
        TokenAuthorizer::new(&["op-secret".to_string()], Some("gw-secret"))
    }

    #[test]
    fn test_operator_token() {
        assert_eq!(
            authorizer().authorize(&headers(Some("op-secret"), None)),
            Ok(Principal::Operator)
        );
    }

    #[test]
    fn test_gateway_requires_user() {
        let auth = authorizer();
        assert_eq!(
            auth.authorize(&headers(Some("gw-secret"), Some("user_7"))),
            Ok(Principal::User("user_7".to_string()))
        );
        assert_eq!(
            auth.authorize(&headers(Some("gw-secret"), None)),
            Err(AuthError::MissingUser)
        );
    }

    #[test]
    fn test_rejections() {
        let auth = authorizer();
        assert_eq!(auth.authorize(&headers(None, None)), Err(AuthError::MissingToken));
        assert_eq!(
            auth.authorize(&headers(Some("nope"), Some("user_7"))),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            require_operator(&Principal::User("user_7".to_string())),
            Err(AuthError::Forbidden)
        );
    }

    #[test]
    fn test_empty_tokens_never_match() {
        let auth = TokenAuthorizer::new(&[String::new()], Some(""));
        assert_eq!(auth.authorize(&headers(Some(""), Some("u"))), Err(AuthError::InvalidToken));
    }
}
