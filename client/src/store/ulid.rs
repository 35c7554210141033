use chrono::{DateTime, TimeZone, Utc};

/// Length of a ULID in its canonical text form.
pub const ULID_LENGTH: usize = 26;

/// Characters encoding the 48-bit millisecond timestamp.
const TIME_LENGTH: usize = 10;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn decode_char(c: u8) -> Option<u64> {
    let upper = c.to_ascii_uppercase();
    CROCKFORD
        .iter()
        .position(|&a| a == upper)
        .map(|pos| pos as u64)
}

/// Milliseconds since the Unix epoch encoded in a ULID, or `None` if `id` is not one.
pub fn timestamp_ms(id: &str) -> Option<u64> {
    let bytes = id.as_bytes();
    if bytes.len() != ULID_LENGTH {
        return None;
    }

    let mut ms: u64 = 0;
    for &c in &bytes[..TIME_LENGTH] {
        ms = (ms << 5) | decode_char(c)?;
    }

    // 10 chars carry 50 bits; a valid ULID leaves the top two clear.
    if ms >> 48 != 0 {
        return None;
    }
    Some(ms)
}

/// Creation time of an entity keyed by a ULID.
pub fn timestamp(id: &str) -> Option<DateTime<Utc>> {
    let ms = i64::try_from(timestamp_ms(id)?).ok()?;
    Utc.timestamp_millis_opt(ms).single()
}
