//! Reversible encoding for values in the secure namespace.
//!
//! This is obfuscation, not encryption: anyone with the stored string can
//! recover the plaintext. It only keeps secrets from being readable at a
//! glance in a storage dump.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub fn encrypt(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Returns `None` when the input is not valid base64 or not valid UTF-8.
pub fn decrypt(encoded: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}
