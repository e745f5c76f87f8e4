use std::time::{SystemTime, UNIX_EPOCH};

const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_SPACE: u32 = 36_u32.pow(4);

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    chars.into_iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

fn generate_unique_id(prefix: &str) -> Result<String, String> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| format!("system clock is before the unix epoch: {err}"))?
        .as_secs();
    let mut bytes = [0_u8; 4];
    getrandom::getrandom(&mut bytes)
        .map_err(|err| format!("failed to generate id randomness: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % SUFFIX_SPACE;
    let ts = base36_encode_u64(timestamp);
    let suffix = base36_encode_fixed_u32(sample, 4);
    Ok(format!("{prefix}-{ts}-{suffix}"))
}

/// Artifact ids name persisted query result sets. They must be unique across
/// concurrent sessions because all sessions share one cache directory.
pub fn new_artifact_id() -> Result<String, String> {
    generate_unique_id("qr")
}

pub fn new_plot_id() -> Result<String, String> {
    generate_unique_id("plot")
}
