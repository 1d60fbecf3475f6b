use std::fmt::Write;

use rand::RngCore;

/// Length of an id from [`generate_random_id`].
pub const RANDOM_ID_LEN: usize = 32;

/// 128 random bits as lowercase hex.
pub fn generate_random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);

    let mut id = String::with_capacity(RANDOM_ID_LEN);
    for byte in bytes {
        let _ = write!(id, "{byte:02x}");
    }
    id
}
