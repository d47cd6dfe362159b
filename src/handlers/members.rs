use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
    Extension, Json,
};
use garde::Validate;
use serde::Deserialize;

use crate::{
    error::Result,
    handlers::response::json,
    models::principal::Principal,
    state::AppState,
    validation::attendance::{descriptor_shape, face_sample},
};

/// The request payload for registering the caller's face.
///
/// Exactly one of `descriptor` and `image` must be set.
#[derive(Deserialize, Debug, Validate)]
pub struct RegisterFaceRequest {
    #[garde(custom(descriptor_shape))]
    pub descriptor: Option<Vec<f32>>,
    /// Base64 image, optionally as a `data:` URL.
    #[garde(length(min = 1))]
    pub image: Option<String>,
}

/// Stores the caller's face descriptor.
#[axum::debug_handler]
pub async fn register_face(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<RegisterFaceRequest>,
) -> Result<Response> {
    req.validate()?;

    let sample = face_sample(req.descriptor, req.image)?;
    state
        .attendance
        .register_face(principal.user_id, sample)
        .await?;

    json(
        StatusCode::OK,
        &sonic_rs::json!({
            "success": true,
            "message": "Face registered successfully"
        }),
    )
}
