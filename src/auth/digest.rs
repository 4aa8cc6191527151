//! Challenge-response digest.
//!
//! The device sends 16 random bytes as 32 hex characters. The client
//! answers with `00` followed by the hex MD5 of `0x00 ‖ password ‖ challenge`.

use md5::{Digest, Md5};

use crate::error::AuthError;

/// Challenge length in bytes.
pub const CHALLENGE_LEN: usize = 16;

/// Literal prefix of every response.
pub const RESPONSE_PREFIX: &str = "00";

/// Decode the hex challenge from the `ret` field.
///
/// # Errors
///
/// [`AuthError::MalformedChallenge`] when the text is not hex or does not
/// decode to exactly [`CHALLENGE_LEN`] bytes.
pub fn decode_challenge(text: &str) -> Result<[u8; CHALLENGE_LEN], AuthError> {
    let bytes = hex::decode(text).map_err(|_| AuthError::MalformedChallenge { len: 0 })?;
    <[u8; CHALLENGE_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| AuthError::MalformedChallenge { len: bytes.len() })
}

/// Response digest for `password` and a decoded challenge.
pub fn compute_response(password: &str, challenge: &[u8; CHALLENGE_LEN]) -> String {
    let mut hasher = Md5::new();
    hasher.update([0u8]);
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    let digest = hasher.finalize();

    let mut response = String::with_capacity(RESPONSE_PREFIX.len() + digest.len() * 2);
    response.push_str(RESPONSE_PREFIX);
    response.push_str(&hex::encode(digest));
    response
}
