//! Parses and renders the size and duration expressions used in the config and the stats output.
use std::fmt::Write;
use std::time::Duration;

const SIZE_UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];

/// Renders a size in bytes using the largest fitting binary unit.
///
/// # Examples
///
/// ```
/// assert_eq!(jwcache::fmt::format_size(0), "0 bytes");
/// assert_eq!(jwcache::fmt::format_size(1), "1 byte");
/// assert_eq!(jwcache::fmt::format_size(1000), "1000 bytes");
/// assert_eq!(jwcache::fmt::format_size(2048), "2.00 KiB");
/// assert_eq!(jwcache::fmt::format_size(8_734), "8.53 KiB");
/// assert_eq!(jwcache::fmt::format_size(87_340), "85.3 KiB");
/// assert_eq!(jwcache::fmt::format_size(873_400), "853 KiB");
/// assert_eq!(jwcache::fmt::format_size(8_734_000), "8.33 MiB");
/// assert_eq!(jwcache::fmt::format_size(8_734_000_000), "8.13 GiB");
/// ```
pub fn format_size(size_in_bytes: usize) -> String {
    match size_in_bytes {
        1 => return "1 byte".to_owned(),
        0..=1023 => return format!("{} bytes", size_in_bytes),
        _ => {}
    }

    let mut size = size_in_bytes as f64 / 1024.;
    let mut unit = 0;
    while size >= 1024. && unit < SIZE_UNITS.len() - 1 {
        size /= 1024.;
        unit += 1;
    }

    let mut result = String::new();
    let _ = if size < 10. {
        write!(result, "{:.2} {}", size, SIZE_UNITS[unit])
    } else if size < 100. {
        write!(result, "{:.1} {}", size, SIZE_UNITS[unit])
    } else {
        write!(result, "{:.0} {}", size, SIZE_UNITS[unit])
    };

    result
}

/// Parses a size expression like "2k" or "64 MB" into a number of bytes.
///
/// The number can be followed by one of the following (case insensitive) suffixes, optionally
/// followed by a "b" (so "k" and "kb" are the same):
/// * **b**: bytes (which is also the default)
/// * **k**: KiB (1024 bytes)
/// * **m**: MiB
/// * **g**: GiB
/// * **t**: TiB
///
/// # Examples
///
/// ```
/// assert_eq!(jwcache::fmt::parse_size("100").unwrap(), 100);
/// assert_eq!(jwcache::fmt::parse_size("100b").unwrap(), 100);
/// assert_eq!(jwcache::fmt::parse_size("2k").unwrap(), 2048);
/// assert_eq!(jwcache::fmt::parse_size("8 MB").unwrap(), 8 * 1024 * 1024);
/// assert_eq!(jwcache::fmt::parse_size("4g").unwrap(), 4 * 1024 * 1024 * 1024);
///
/// assert_eq!(jwcache::fmt::parse_size("3 Y").is_err(), true);
/// assert_eq!(jwcache::fmt::parse_size("1.2g").is_err(), true);
/// assert_eq!(jwcache::fmt::parse_size("-1").is_err(), true);
/// ```
pub fn parse_size(expression: impl AsRef<str>) -> anyhow::Result<usize> {
    lazy_static::lazy_static! {
        static ref SIZE: regex::Regex =
            regex::Regex::new(r"^\s*(\d+)\s*(?i:(k|m|g|t)?b?)\s*$").unwrap();
    }

    let expression = expression.as_ref();
    let captures = SIZE.captures(expression).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' as size. Expected a positive number optionally followed by \
             'b', 'k', 'm', 'g' or 't'.",
            expression
        )
    })?;

    let number = captures[1].parse::<usize>()?;
    let shift = match captures.get(2).map(|unit| unit.as_str().to_ascii_lowercase()) {
        Some(unit) if unit == "k" => 10,
        Some(unit) if unit == "m" => 20,
        Some(unit) if unit == "g" => 30,
        Some(unit) if unit == "t" => 40,
        _ => 0,
    };

    1usize
        .checked_shl(shift)
        .and_then(|factor| number.checked_mul(factor))
        .ok_or_else(|| anyhow::anyhow!("The size '{}' is too large.", expression))
}

/// Parses a duration expression like "500ms" or "5 s".
///
/// Supported suffixes are **ms** (the default), **s**, **m**, **h** and **d**.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(jwcache::fmt::parse_duration("100").unwrap(), Duration::from_millis(100));
/// assert_eq!(jwcache::fmt::parse_duration("500 ms").unwrap(), Duration::from_millis(500));
/// assert_eq!(jwcache::fmt::parse_duration("5s").unwrap(), Duration::from_secs(5));
/// assert_eq!(jwcache::fmt::parse_duration("3 m").unwrap(), Duration::from_secs(180));
/// assert_eq!(jwcache::fmt::parse_duration("2h").unwrap(), Duration::from_secs(7200));
/// assert_eq!(jwcache::fmt::parse_duration("1d").unwrap(), Duration::from_secs(86400));
///
/// assert_eq!(jwcache::fmt::parse_duration("3 Y").is_err(), true);
/// assert_eq!(jwcache::fmt::parse_duration("1.5s").is_err(), true);
/// ```
pub fn parse_duration(expression: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref DURATION: regex::Regex =
            regex::Regex::new(r"^\s*(\d+)\s*(?i:(ms|s|m|h|d)?)\s*$").unwrap();
    }

    let expression = expression.as_ref();
    let captures = DURATION.captures(expression).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' as duration. Expected a positive number optionally followed by \
             'ms', 's', 'm', 'h' or 'd'.",
            expression
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    let seconds_per_unit = match captures.get(2).map(|unit| unit.as_str().to_ascii_lowercase()) {
        Some(unit) if unit == "s" => 1,
        Some(unit) if unit == "m" => 60,
        Some(unit) if unit == "h" => 60 * 60,
        Some(unit) if unit == "d" => 24 * 60 * 60,
        _ => return Ok(Duration::from_millis(number)),
    };

    number
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("The duration '{}' is too large.", expression))
}

/// Renders a duration like "1d 2h 3m 4s 5ms", skipping all zero components.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(jwcache::fmt::format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(jwcache::fmt::format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(jwcache::fmt::format_duration(Duration::from_secs(60 * 61)), "1h 1m");
/// assert_eq!(jwcache::fmt::format_duration(Duration::from_secs(86_400 + 59)), "1d 59s");
/// assert_eq!(jwcache::fmt::format_duration(Duration::ZERO), "0ms");
/// ```
pub fn format_duration(duration: Duration) -> String {
    const COMPONENTS: [(u128, &str); 5] = [
        (24 * 60 * 60 * 1000, "d"),
        (60 * 60 * 1000, "h"),
        (60 * 1000, "m"),
        (1000, "s"),
        (1, "ms"),
    ];

    let mut remainder = duration.as_millis();
    let mut parts = Vec::new();
    for (millis, unit) in COMPONENTS {
        let amount = remainder / millis;
        if amount > 0 {
            parts.push(format!("{}{}", amount, unit));
            remainder %= millis;
        }
    }

    if parts.is_empty() {
        "0ms".to_owned()
    } else {
        parts.join(" ")
    }
}
