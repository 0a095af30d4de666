use crate::error::{Result, RuntimeError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds elapsed since 1970-01-01T00:00:00Z.
///
/// A clock read that fails (the system time predates the epoch) is an error
/// to propagate, never a sentinel value.
pub fn posix_utc_millis() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| RuntimeError::Clock(e.to_string()))?;
    Ok(elapsed.as_millis() as i64)
}
