/*!
 * # Authentication
 *
 * Bearer-token authentication for the storefront API. Tokens are HS256 JWTs
 * issued by the identity provider; this module only verifies them and exposes
 * the caller to handlers through extractors:
 *
 * - [`AuthUser`] requires a valid token
 * - [`MaybeAuthUser`] accepts anonymous callers (guest checkout, carts)
 * - [`AdminUser`] requires the `admin` role
 */

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ServiceError;

pub const ADMIN_ROLE: &str = "admin";

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (user ID)
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated caller extracted from the bearer token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

impl AuthUser {
    /// Check if the user has a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Check if the user is an admin
    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    /// Owner-or-admin check used by order and payment reads.
    pub fn can_access(&self, owner: Option<Uuid>) -> bool {
        self.is_admin() || owner == Some(self.user_id)
    }
}

/// Token verification settings shared through application state
#[derive(Clone)]
pub struct AuthConfig {
    secret: Arc<str>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig").finish_non_exhaustive()
    }
}

impl AuthConfig {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            secret: Arc::from(jwt_secret),
        }
    }

    /// Signs a token for `user_id`. The storefront never logs users in itself;
    /// this exists for operators and tests.
    pub fn issue_token(
        &self,
        user_id: Uuid,
        email: Option<String>,
        roles: Vec<String>,
        ttl: ChronoDuration,
    ) -> Result<String, ServiceError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            email,
            roles,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ServiceError::InternalError(format!("Failed to sign token: {}", e)))
    }

    pub fn validate_token(&self, token: &str) -> Result<AuthUser, ServiceError> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ServiceError::Unauthorized("Token expired".to_string())
            }
            _ => ServiceError::Unauthorized("Invalid token".to_string()),
        })?
        .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ServiceError::Unauthorized("Invalid token subject".to_string()))?;

        Ok(AuthUser {
            user_id,
            email: claims.email,
            roles: claims.roles,
        })
    }
}

fn bearer_token(parts: &Parts) -> Result<Option<&str>, ServiceError> {
    let Some(value) = parts.headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| ServiceError::Unauthorized("Malformed Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(|token| Some(token.trim()))
        .ok_or_else(|| ServiceError::Unauthorized("Expected a bearer token".to_string()))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    AuthConfig: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = AuthConfig::from_ref(state);
        let token = bearer_token(parts)?
            .ok_or_else(|| ServiceError::Unauthorized("Authentication required".to_string()))?;
        let user = config.validate_token(token)?;
        debug!(user_id = %user.user_id, "authenticated request");
        Ok(user)
    }
}

/// Caller that may be anonymous. A present but invalid token is still rejected.
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<AuthUser>);

impl MaybeAuthUser {
    pub fn user_id(&self) -> Option<Uuid> {
        self.0.as_ref().map(|u| u.user_id)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for MaybeAuthUser
where
    S: Send + Sync,
    AuthConfig: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match bearer_token(parts)? {
            Some(token) => Ok(MaybeAuthUser(Some(
                AuthConfig::from_ref(state).validate_token(token)?,
            ))),
            None => Ok(MaybeAuthUser(None)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    AuthConfig: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ServiceError::Forbidden("Admin access required".to_string()));
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::Request;

    const SECRET: &str = "a-test-secret-that-is-long-enough-0123456789";

    fn parts_with(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = auth {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn valid_token_yields_user() {
        let config = AuthConfig::new(SECRET);
        let user_id = Uuid::new_v4();
        let token = config
            .issue_token(user_id, Some("a@b.test".into()), vec![], ChronoDuration::hours(1))
            .unwrap();
        let mut parts = parts_with(Some(&format!("Bearer {token}")));
        let user = AuthUser::from_request_parts(&mut parts, &config).await.unwrap();
        assert_eq!(user.user_id, user_id);
        assert!(!user.is_admin());
    }

    #[tokio::test]
    async fn missing_token_is_anonymous_for_optional_extractor() {
        let config = AuthConfig::new(SECRET);
        let mut parts = parts_with(None);
        let maybe = MaybeAuthUser::from_request_parts(&mut parts, &config).await.unwrap();
        assert!(maybe.0.is_none());

        let mut parts = parts_with(None);
        assert_matches!(
            AuthUser::from_request_parts(&mut parts, &config).await,
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[tokio::test]
    async fn token_signed_with_other_secret_is_rejected() {
        let other = AuthConfig::new("another-secret-that-is-also-long-enough-987");
        let token = other
            .issue_token(Uuid::new_v4(), None, vec![], ChronoDuration::hours(1))
            .unwrap();
        let config = AuthConfig::new(SECRET);
        let mut parts = parts_with(Some(&format!("Bearer {token}")));
        assert_matches!(
            MaybeAuthUser::from_request_parts(&mut parts, &config).await,
            Err(ServiceError::Unauthorized(_))
        );
    }

    #[tokio::test]
    async fn admin_extractor_requires_role() {
        let config = AuthConfig::new(SECRET);
        let token = config
            .issue_token(Uuid::new_v4(), None, vec![], ChronoDuration::hours(1))
            .unwrap();
        let mut parts = parts_with(Some(&format!("Bearer {token}")));
        assert_matches!(
            AdminUser::from_request_parts(&mut parts, &config).await,
            Err(ServiceError::Forbidden(_))
        );

        let token = config
            .issue_token(
                Uuid::new_v4(),
                None,
                vec![ADMIN_ROLE.to_string()],
                ChronoDuration::hours(1),
            )
            .unwrap();
        let mut parts = parts_with(Some(&format!("Bearer {token}")));
        assert!(AdminUser::from_request_parts(&mut parts, &config).await.is_ok());
    }
}
