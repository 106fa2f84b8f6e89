use std::sync::Arc;
use tokio::sync::RwLock;

/// Type alias for Arc<RwLock<T>>, a common pattern for shared mutable state
pub type RwArc<T> = Arc<RwLock<T>>;

/// Macro to create a new SHA-256 hasher with optional data to hash
///
/// Usage:
/// - `sha256!()` - creates a new hasher
/// - `sha256!(data)` - creates a hasher and updates it with data
/// - `sha256!(data1, data2, ...)` - creates a hasher and updates it with multiple values
#[macro_export]
macro_rules! sha256 {
    () => {
        sha2::Sha256::new()
    };
    ($($data:expr),+ $(,)?) => {{
        let mut hasher = sha2::Sha256::new();
        $(
            hasher.update($data);
        )+
        hasher
    }};
}

/// Short hex fingerprint of untrusted content, safe to put in logs
pub fn fingerprint(data: &[u8]) -> String {
    use sha2::Digest;
    let digest = sha256!(data).finalize();
    hex::encode(&digest[..8])
}

/// Parse a human-friendly size string into bytes.
///
/// Supports formats like:
/// - "1024" (plain bytes)
/// - "8kb" or "8KB" or "8k" (kilobytes)
/// - "2mb" or "2MB" or "2m" (megabytes)
/// - "1gb" or "1GB" or "1g" (gigabytes)
///
/// Returns the size in bytes as u64.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();

    let (num_part, suffix) = if let Some(pos) = s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        (&s[..pos], s[pos..].trim())
    } else {
        (s.as_str(), "")
    };

    let num: f64 = num_part.parse()
        .map_err(|_| format!("Invalid number: {}", num_part))?;

    let multiplier: u64 = match suffix {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return Err(format!("Unknown size suffix: {}. Use b, kb, mb, or gb", suffix)),
    };

    Ok((num * multiplier as f64) as u64)
}

/// clap value parser wrapper around [`parse_size`]
pub fn parse_size_arg(s: &str) -> Result<usize, String> {
    parse_size(s).map(|n| n as usize)
}
