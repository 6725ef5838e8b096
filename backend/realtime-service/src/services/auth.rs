/// Token validation for WebSocket handshakes
use crate::error::AuthError;
use crate::models::Identity;
use async_trait::async_trait;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

const DEFAULT_ROLE: &str = "user";

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Claims accepted on realtime tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Role used for role-scoped notifications
    #[serde(default)]
    pub role: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// HS256 JWT validation with a shared secret.
#[derive(Clone)]
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn validate_token(&self, token: &str) -> Result<Identity, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty subject".into()));
        }

        let role = claims
            .role
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ROLE.to_string());
        Ok(Identity::new(claims.sub, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(sub: &str, role: Option<&str>, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            role: role.map(str::to_string),
            exp: chrono::Utc::now().timestamp() + exp_offset,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn accepts_valid_token() {
        let auth = JwtAuthenticator::new(SECRET);
        let identity = auth
            .validate_token(&token("u1", Some("teacher"), 3600))
            .await
            .unwrap();
        assert_eq!(identity, Identity::new("u1", "teacher"));
    }

    #[tokio::test]
    async fn role_defaults_when_absent() {
        let auth = JwtAuthenticator::new(SECRET);
        let identity = auth.validate_token(&token("u1", None, 3600)).await.unwrap();
        assert_eq!(identity.role, "user");
    }

    #[tokio::test]
    async fn rejects_expired_and_forged_tokens() {
        let auth = JwtAuthenticator::new(SECRET);
        assert_eq!(
            auth.validate_token(&token("u1", None, -60)).await,
            Err(AuthError::Expired)
        );

        let other = JwtAuthenticator::new("different-secret");
        assert!(matches!(
            other.validate_token(&token("u1", None, 3600)).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert_eq!(auth.validate_token("").await, Err(AuthError::MissingToken));
    }
}
