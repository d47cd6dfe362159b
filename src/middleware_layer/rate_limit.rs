use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};

use crate::{
    error::AppError,
    models::principal::Principal,
    state::AppState,
};

/// Window of the per-caller mark counter, in seconds.
const MARK_WINDOW_SECONDS: i64 = 60;

/// A middleware that rate limits attendance marking per caller.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `principal` - The authenticated caller.
/// * `req` - The incoming request.
/// * `next` - The next middleware in the chain.
///
/// # Returns
///
/// A `Response` or an error `AppError`.
pub async fn rate_limit_mark(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = format!("rate_limit:mark:{}", principal.user_id);

    let count: Option<u32> = redis::cmd("GET")
        .arg(&key)
        .query_async(&mut state.redis.clone())
        .await
        .unwrap_or(None);

    if let Some(attempts) = count {
        if attempts >= state.config.mark_attempts_per_minute {
            let ttl: Option<i64> = redis::cmd("TTL")
                .arg(&key)
                .query_async(&mut state.redis.clone())
                .await
                .unwrap_or(None);

            return AppError::RateLimitExceeded(format!(
                "Too many attendance attempts. Try again in {} seconds",
                ttl.unwrap_or(MARK_WINDOW_SECONDS).max(1)
            ))
            .into_response();
        }
    }

    let attempts: u32 = redis::cmd("INCR")
        .arg(&key)
        .query_async(&mut state.redis.clone())
        .await
        .unwrap_or(1);

    if attempts == 1 {
        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(MARK_WINDOW_SECONDS)
            .query_async(&mut state.redis.clone())
            .await
            .unwrap_or(());
    }

    next.run(req).await
}
