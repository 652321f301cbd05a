//! Transfer code minting and validation.
//!
//! A transfer code is the only shared secret between the two sides. The
//! sending side mints one locally and registers it with the signal server;
//! the receiving side types it in.

use rand::Rng;

/// Codes are always this many characters.
pub const CODE_LEN: usize = 6;

// Uppercase letters and digits, 0/O and 1/I included.
const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Mints a fresh transfer code.
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| {
            let idx = rng.random_range(0..CODE_CHARSET.len());
            CODE_CHARSET[idx] as char
        })
        .collect()
}

/// Uppercases and validates a user-entered code.
pub fn normalize_code(input: &str) -> Option<String> {
    let code = input.trim().to_ascii_uppercase();
    if code.len() == CODE_LEN && code.bytes().all(|b| CODE_CHARSET.contains(&b)) {
        Some(code)
    } else {
        None
    }
}
