//! Utility functions for helmsman

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if s.ends_with("ms") {
        (&s[..s.len() - 2], "ms")
    } else {
        (&s[..s.len() - 1], &s[s.len() - 1..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Retry delay for the given attempt: `min(base * 2^attempt, cap)` plus
/// up to 25% jitter.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    use rand::Rng;

    let exp = base
        .checked_mul(2u32.saturating_pow(attempt.min(30)))
        .unwrap_or(cap)
        .min(cap);
    let jitter_ms = exp.as_millis() as u64 / 4;
    if jitter_ms == 0 {
        return exp;
    }
    exp + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("max retries exceeded".into()))
}

/// Validate a client-supplied relative path.
///
/// Rejects empty paths, absolute paths, traversal components, and
/// control characters.
pub fn validate_relative_path(path: &str) -> crate::Result<()> {
    if path.is_empty() {
        return Err(crate::Error::InvalidArgument(
            "relative path cannot be empty".into(),
        ));
    }
    if path.len() > 4096 {
        return Err(crate::Error::InvalidArgument(
            "relative path too long (max 4096 bytes)".into(),
        ));
    }
    if path.starts_with('/') {
        return Err(crate::Error::InvalidArgument(format!(
            "relative path must not be absolute: {}",
            path
        )));
    }
    if path.split('/').any(|c| c == "." || c == "..") {
        return Err(crate::Error::InvalidArgument(format!(
            "relative path escapes the storage root: {}",
            path
        )));
    }
    if path.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidArgument(
            "relative path contains control characters".into(),
        ));
    }
    Ok(())
}

/// Validate a reference name (loose check, full validation is backend-side)
pub fn validate_ref_name(name: &str) -> crate::Result<()> {
    if !name.starts_with("refs/") || name.ends_with('/') || name.contains("..") {
        return Err(crate::Error::InvalidArgument(format!(
            "invalid reference name: {}",
            name
        )));
    }
    Ok(())
}
