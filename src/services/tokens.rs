//! Random identifiers for upload sessions.

use rand::Rng;

/// Upload ids carry 128 random bits (32 hex characters).
const UPLOAD_ID_BYTES: usize = 16;

/// Resume tokens carry 256 random bits (64 hex characters).
const RESUME_TOKEN_BYTES: usize = 32;

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Generates a new upload id from the thread-local CSPRNG.
pub fn generate_upload_id() -> String {
    random_hex(UPLOAD_ID_BYTES)
}

/// Generates a resume token drawn independently of the upload id.
pub fn generate_resume_token() -> String {
    random_hex(RESUME_TOKEN_BYTES)
}

/// True if `value` has the shape of an id produced by [`generate_upload_id`].
///
/// Ids arrive from request paths and end up as directory names, so anything
/// else is rejected before it reaches the chunk store.
pub fn is_well_formed_upload_id(value: &str) -> bool {
    value.len() == UPLOAD_ID_BYTES * 2
        && value
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
