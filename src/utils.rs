//! Small shared helpers: size strings, locator grammar, partition names.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
};

use regex::Regex;

use crate::error::TortillaError;

/// Decimal units for human-readable size strings, per the container
/// configuration surface (`KB = 10^3`, ..., `PB = 10^15`).
const UNITS: [(&str, u64); 5] = [
    ("KB", 1_000),
    ("MB", 1_000_000),
    ("GB", 1_000_000_000),
    ("TB", 1_000_000_000_000),
    ("PB", 1_000_000_000_000_000),
];

/// Parse a size like `"100MB"` or `" 1.5 gb "` into bytes. Matching is
/// case-insensitive and whitespace-tolerant; a unit is required.
pub fn human2bytes(size: &str) -> Result<u64, TortillaError> {
    let cleaned = size.trim().to_ascii_uppercase();
    for (unit, multiplier) in UNITS {
        if let Some(number) = cleaned.strip_suffix(unit) {
            let value: f64 = number
                .trim()
                .parse()
                .map_err(|_| TortillaError::InvalidSize(size.to_string()))?;
            if !value.is_finite() || value < 0.0 {
                return Err(TortillaError::InvalidSize(size.to_string()));
            }
            return Ok((value * multiplier as f64) as u64);
        }
    }
    Err(TortillaError::InvalidSize(size.to_string()))
}

/// Inverse of [`human2bytes`], picking the largest unit that fits.
pub fn bytes2human(size: u64) -> String {
    for (unit, multiplier) in UNITS.iter().rev() {
        if size >= *multiplier {
            return format!("{:.2}{}", size as f64 / *multiplier as f64, unit);
        }
    }
    format!("{size}B")
}

/// `min(4, cores)` workers by default.
pub fn default_nworkers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get().min(4))
}

pub fn is_valid_url(location: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = location.strip_prefix(scheme) {
            let host = rest.split('/').next().unwrap_or("");
            return !host.is_empty();
        }
    }
    false
}

/// Name of partition `idx` for a logical output path:
/// `out.tortilla` -> `out.0007.part.tortilla`.
pub fn part_path(output: &Path, idx: u64) -> PathBuf {
    output.with_extension(format!("{idx:04}.part.tortilla"))
}

/// A `<stem>*.tortilla` location requesting every partition in order.
pub fn is_snippet(location: &str) -> bool {
    location.ends_with("*.tortilla")
}

fn subfile_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/vsisubfile/(\d+)_(\d+),(.+)$").expect("valid regex"))
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(ftp|https?)://[^\s,]+").expect("valid regex"))
}

/// Render the GDAL-compatible subfile locator. `source` is a local path or
/// an already-decorated `/vsicurl/<url>` string.
pub fn subfile_locator(offset: u64, length: u64, source: &str) -> String {
    format!("/vsisubfile/{offset}_{length},{source}")
}

/// Parse a subfile locator into (offset, length, source). A `/vsicurl/`
/// decoration on the source is stripped.
pub fn parse_subfile_locator(locator: &str) -> Option<(u64, u64, String)> {
    let caps = subfile_regex().captures(locator)?;
    let offset = caps[1].parse().ok()?;
    let length = caps[2].parse().ok()?;
    let source = caps[3].strip_prefix("/vsicurl/").unwrap_or(&caps[3]);
    Some((offset, length, source.to_string()))
}

/// First URL embedded in a locator string.
pub fn extract_url(locator: &str) -> Option<String> {
    url_regex()
        .find(locator)
        .map(|m| m.as_str().to_string())
}

/// Parse a `POINT (lon lat)` WKT string into `(lon, lat)`.
pub fn parse_wkt_point(wkt: &str) -> Option<(f64, f64)> {
    let body = wkt
        .trim()
        .strip_prefix("POINT")?
        .trim()
        .strip_prefix('(')?
        .strip_suffix(')')?;
    let mut parts = body.split_whitespace();
    let lon = parts.next()?.parse().ok()?;
    let lat = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((lon, lat))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_human2bytes() {
        assert_eq!(human2bytes("100MB").unwrap(), 100_000_000);
        assert_eq!(human2bytes(" 1.5 gb ").unwrap(), 1_500_000_000);
        assert_eq!(human2bytes("2kb").unwrap(), 2_000);
        assert_eq!(human2bytes("1PB").unwrap(), 10u64.pow(15));
        assert!(human2bytes("100").is_err());
        assert!(human2bytes("tenMB").is_err());
        assert!(human2bytes("-1MB").is_err());
    }

    #[test]
    fn test_bytes2human() {
        assert_eq!(bytes2human(999), "999B");
        assert_eq!(bytes2human(1_000), "1.00KB");
        assert_eq!(bytes2human(1_500_000_000), "1.50GB");
    }

    #[test]
    fn test_is_valid_url() {
        assert!(is_valid_url("http://example.com/data.tortilla"));
        assert!(is_valid_url("https://example.com"));
        assert!(!is_valid_url("ftp://example.com"));
        assert!(!is_valid_url("/data/file.tortilla"));
        assert!(!is_valid_url("http://"));
    }

    #[test]
    fn test_part_path() {
        let path = part_path(Path::new("/data/out.tortilla"), 3);
        assert_eq!(path, Path::new("/data/out.0003.part.tortilla"));
        // No extension on the logical output is fine too
        assert_eq!(
            part_path(Path::new("out"), 0),
            Path::new("out.0000.part.tortilla")
        );
    }

    #[test]
    fn test_subfile_locator_roundtrip() {
        let locator = subfile_locator(200, 4096, "/data/in.tortilla");
        assert_eq!(locator, "/vsisubfile/200_4096,/data/in.tortilla");
        assert_eq!(
            parse_subfile_locator(&locator),
            Some((200, 4096, "/data/in.tortilla".to_string()))
        );

        let remote = subfile_locator(200, 4096, "/vsicurl/http://host/x.tortilla");
        assert_eq!(
            parse_subfile_locator(&remote),
            Some((200, 4096, "http://host/x.tortilla".to_string()))
        );

        assert_eq!(parse_subfile_locator("not a locator"), None);
    }

    #[test]
    fn test_extract_url() {
        let locator = "/vsisubfile/200_10,/vsicurl/https://host/a.tortilla";
        assert_eq!(
            extract_url(locator),
            Some("https://host/a.tortilla".to_string())
        );
        assert_eq!(extract_url("/vsisubfile/0_1,/tmp/x"), None);
    }

    #[test]
    fn test_parse_wkt_point() {
        assert_eq!(parse_wkt_point("POINT (12.5 -3.25)"), Some((12.5, -3.25)));
        assert_eq!(parse_wkt_point("POINT(0 0)"), Some((0.0, 0.0)));
        assert_eq!(parse_wkt_point("POLYGON ((0 0))"), None);
        assert_eq!(parse_wkt_point("POINT (1 2 3)"), None);
    }
}
