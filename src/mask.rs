//! WebSocket payload masking.

use rand::Rng;

/// Applies a masking key to `data` in place.
///
/// Byte `i` is XORed with `key[i % 4]`, so applying the same key twice
/// restores the original bytes.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Generates a fresh masking key for a client-to-server frame.
pub fn random_key() -> [u8; 4] {
    rand::thread_rng().gen()
}
