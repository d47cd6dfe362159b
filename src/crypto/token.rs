use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;

/// The size of a QR token in bytes.
const QR_TOKEN_SIZE: usize = 32;

/// Generates a new random QR token.
///
/// # Returns
///
/// A URL-safe base64-encoded token drawn from the OS CSPRNG.
pub fn generate_qr_token() -> String {
    let mut token = [0u8; QR_TOKEN_SIZE];
    OsRng.fill_bytes(&mut token);

    general_purpose::URL_SAFE_NO_PAD.encode(token)
}

/// Compares two tokens without leaking the position of the first mismatch.
pub fn tokens_equal(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
