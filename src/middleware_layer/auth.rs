use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_cookies::Cookies;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::principal::Principal,
    state::AppState,
};

use redis::AsyncCommands;

/// Extracts the login token from the `session_id` cookie or a bearer header.
///
/// # Arguments
///
/// * `cookies` - The request cookies.
/// * `request` - The incoming request.
///
/// # Returns
///
/// An `Option` containing the login token if found.
fn extract_login_token(cookies: &Cookies, request: &Request<Body>) -> Option<Uuid> {
    if let Some(cookie) = cookies.get("session_id") {
        return Uuid::parse_str(cookie.value()).ok();
    }

    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| Uuid::parse_str(token.trim()).ok())
}

/// A middleware that requires a valid login.
///
/// Logins are written to Redis under `session:{token}` by the auth service.
/// On success the `Principal` is inserted into the request extensions.
pub async fn require_auth(
    State(mut state): State<AppState>,
    cookies: Cookies,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    tracing::debug!("🔐 Checking authentication...");

    let Some(token) = extract_login_token(&cookies, &request) else {
        tracing::warn!("❌ No login token found");
        return AppError::Authentication("Missing credentials".to_string()).into_response();
    };

    let principal_json: Option<String> = match state.redis.get(format!("session:{}", token)).await {
        Ok(value) => value,
        Err(e) => return AppError::from(e).into_response(),
    };

    let Some(principal_json) = principal_json else {
        tracing::warn!("❌ Unknown login token");
        return AppError::Authentication("Invalid or expired login".to_string()).into_response();
    };

    let principal: Principal = match sonic_rs::from_str(&principal_json) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("❌ Invalid principal JSON: {}", e);
            return AppError::Authentication("Invalid login".to_string()).into_response();
        }
    };

    if chrono::Utc::now() > principal.expires_at {
        tracing::warn!("❌ Login expired for user: {}", principal.user_id);

        let _: () = state
            .redis
            .del(format!("session:{}", token))
            .await
            .unwrap_or(());

        return AppError::Authentication("Invalid or expired login".to_string()).into_response();
    }

    tracing::debug!("✅ User authenticated: {}", principal.user_id);

    request.extensions_mut().insert(principal);

    next.run(request).await
}
