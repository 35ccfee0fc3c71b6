use async_trait::async_trait;
use axum::{
    extract::{FromRequest, Request},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::{errors::ServiceError, ApiResponse};

/// JSON body whose rejections surface as 400s in the error envelope.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;
        Ok(JsonBody(value))
    }
}

/// Name of the cookie carrying an anonymous shopper's cart token.
pub const CART_SESSION_COOKIE: &str = "cart_session";
/// Thirty days.
pub const CART_SESSION_MAX_AGE: u64 = 30 * 24 * 60 * 60;

/// Reads the cart session token from the `Cookie` header, if any.
pub fn cart_session(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == CART_SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `Set-Cookie` value for a freshly issued cart token.
pub fn cart_session_cookie(token: &str) -> Option<HeaderValue> {
    let cookie = format!(
        "{}={}; Max-Age={}; HttpOnly; SameSite=Lax; Path=/",
        CART_SESSION_COOKIE, token, CART_SESSION_MAX_AGE
    );
    match HeaderValue::from_str(&cookie) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(error = %err, "cart session token is not a valid header value");
            None
        }
    }
}

/// Wraps `data` in the success envelope, attaching a cart cookie when one was issued.
pub fn respond_with_session<T: Serialize>(
    status: StatusCode,
    data: T,
    issued_session: Option<String>,
) -> Response {
    let mut response = (status, Json(ApiResponse::success(data))).into_response();
    if let Some(cookie) = issued_session.as_deref().and_then(cart_session_cookie) {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}
