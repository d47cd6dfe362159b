use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::services::attendance::{Credential, FaceSample};
use crate::services::face::DESCRIPTOR_LEN;

/// Largest accepted face image, after base64 decoding.
const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
/// Longest accepted NFC tag identifier.
const MAX_TAG_LEN: usize = 128;
/// Longest accepted QR payload.
const MAX_QR_PAYLOAD_LEN: usize = 1024;

/// The channel named by a mark request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Face,
    FaceImage,
    Qr,
    Nfc,
}

/// Raw payload of a mark request: a descriptor or a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MarkPayload {
    Descriptor(Vec<f32>),
    Text(String),
}

/// garde rule: a descriptor must have the model's length and finite values.
pub fn descriptor_shape(value: &Option<Vec<f32>>, _: &()) -> garde::Result {
    let Some(descriptor) = value else {
        return Ok(());
    };
    if descriptor.len() != DESCRIPTOR_LEN {
        return Err(garde::Error::new(format!(
            "must have {} components",
            DESCRIPTOR_LEN
        )));
    }
    if descriptor.iter().any(|v| !v.is_finite()) {
        return Err(garde::Error::new("must contain only finite values"));
    }
    Ok(())
}

/// Decodes a base64 image, accepting `data:` URLs.
pub fn decode_image(encoded: &str) -> Result<Vec<u8>> {
    let data = encoded
        .split_once(',')
        .map(|(_, data)| data)
        .unwrap_or(encoded)
        .trim();

    let bytes = general_purpose::STANDARD
        .decode(data)
        .map_err(|_| AppError::Malformed)?;

    if bytes.is_empty() {
        return Err(AppError::Malformed);
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(AppError::Validation(format!(
            "Image must be at most {} bytes",
            MAX_IMAGE_BYTES
        )));
    }
    Ok(bytes)
}

/// Turns a mark request's method and payload into a typed credential.
///
/// A payload that does not have the method's shape is `Malformed`.
pub fn credential_from_request(kind: CredentialKind, payload: MarkPayload) -> Result<Credential> {
    match (kind, payload) {
        (CredentialKind::Face, MarkPayload::Descriptor(d)) => Ok(Credential::Face(d)),
        (CredentialKind::FaceImage, MarkPayload::Text(image)) => {
            Ok(Credential::FaceImage(decode_image(&image)?))
        }
        (CredentialKind::Qr, MarkPayload::Text(token)) => {
            if token.is_empty() || token.len() > MAX_QR_PAYLOAD_LEN {
                return Err(AppError::Malformed);
            }
            Ok(Credential::Qr(token))
        }
        (CredentialKind::Nfc, MarkPayload::Text(tag)) => {
            if tag.trim().is_empty() || tag.len() > MAX_TAG_LEN {
                return Err(AppError::Malformed);
            }
            Ok(Credential::Nfc(tag))
        }
        _ => Err(AppError::Malformed),
    }
}

/// Builds a face sample from a registration request. Exactly one of the
/// two inputs must be present.
pub fn face_sample(descriptor: Option<Vec<f32>>, image: Option<String>) -> Result<FaceSample> {
    match (descriptor, image) {
        (Some(d), None) => Ok(FaceSample::Descriptor(d)),
        (None, Some(image)) => Ok(FaceSample::Image(decode_image(&image)?)),
        _ => Err(AppError::Validation(
            "Provide either a descriptor or an image".to_string(),
        )),
    }
}
