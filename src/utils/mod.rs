/// Utility functions and helpers
use bytes::Bytes;
use std::time::Duration;

/// Random 16-byte client listener id
pub fn generate_listener_id() -> Bytes {
    let id: [u8; 16] = rand::random();
    Bytes::copy_from_slice(&id)
}

/// Hex dump of at most `limit` bytes, for diagnostics on malformed input
pub fn limited_hex_dump(data: &[u8], limit: usize) -> String {
    if data.len() <= limit {
        hex::encode(data)
    } else {
        format!("{}... ({} bytes)", hex::encode(&data[..limit]), data.len())
    }
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{}ms", millis);
    }
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
