//! Shared utility functions for salon-cloud

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a short public-facing member code (8 uppercase alphanumeric chars).
///
/// Ambiguous characters (0/O, 1/I) are excluded since the code is read aloud
/// at the counter.
pub fn generate_member_code() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
