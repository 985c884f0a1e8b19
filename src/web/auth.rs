//! Authorization hook for connection creation
//!
//! An [`Authorizer`] inspects the `Authorization` header of a create request
//! and either rejects it or returns the user data attached to the new
//! connection.

use async_trait::async_trait;
use axum::http::StatusCode;
use base64::Engine;
use serde_json::{json, Value};

/// Refusal with the status to return to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub message: String,
}

impl Rejection {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Unauthorized".to_string(),
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Authorize a create request; the returned value becomes the connection's user data
    async fn authorize(&self, authorization: Option<&str>) -> Result<Value, Rejection>;
}

/// HTTP Basic credentials checked against one configured user
pub struct BasicAuthorizer {
    user: String,
    password: String,
}

impl BasicAuthorizer {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    fn check(&self, header: &str) -> Option<String> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        if user == self.user && pass == self.password {
            Some(user.to_string())
        } else {
            None
        }
    }
}

#[async_trait]
impl Authorizer for BasicAuthorizer {
    async fn authorize(&self, authorization: Option<&str>) -> Result<Value, Rejection> {
        authorization
            .and_then(|header| self.check(header))
            .map(|user| json!({ "user": user }))
            .ok_or_else(Rejection::unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(credentials: &str) -> String {
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(credentials))
    }

    #[tokio::test]
    async fn test_basic_authorizer() {
        let auth = BasicAuthorizer::new("ada", "lovelace");

        let user = auth.authorize(Some(&basic("ada:lovelace"))).await.unwrap();
        assert_eq!(user, json!({"user": "ada"}));

        assert_eq!(auth.authorize(None).await, Err(Rejection::unauthorized()));
        assert!(auth.authorize(Some(&basic("ada:babbage"))).await.is_err());
        assert!(auth.authorize(Some("Bearer abc")).await.is_err());
        assert!(auth.authorize(Some("Basic !!!")).await.is_err());
    }
}
