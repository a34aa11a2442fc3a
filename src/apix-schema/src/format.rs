//! string format validators, applied when a schema declares `format`

use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use chrono::NaiveDate;
use chrono::NaiveTime;
use regex::Regex;

/// returns an error description when the value does not match the format.
/// Unknown formats are ignored, matching the tolerant upstream behavior.
pub fn check_format(format: &str, value: &str) -> Option<String> {
    let ok = match format {
        "date-time" => chrono::DateTime::parse_from_rfc3339(value).is_ok(),
        "date" => NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
        "time" => NaiveTime::parse_from_str(value, "%H:%M:%S").is_ok(),
        "duration" => is_duration(value),
        "email" => is_email(value),
        "hostname" => apix_types::names::is_dns1123_subdomain(value),
        "ipv4" => value.parse::<Ipv4Addr>().is_ok(),
        "ipv6" => value.parse::<Ipv6Addr>().is_ok(),
        "cidr" => is_cidr(value),
        "uri" | "uri-reference" => is_uri(value, format == "uri-reference"),
        "uuid" => is_uuid(value),
        "byte" => is_base64(value),
        "quantity" => is_quantity(value),
        "int-or-string" => true,
        _ => true,
    };
    if ok {
        None
    } else {
        Some(format!("must be a valid {format}"))
    }
}

fn is_duration(value: &str) -> bool {
    // Go style durations: 300ms, 1.5h, 2h45m
    let re = Regex::new(r"^([0-9]+(\.[0-9]+)?(ns|us|µs|ms|s|m|h))+$").unwrap();
    re.is_match(value)
}

fn is_email(value: &str) -> bool {
    let re = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    re.is_match(value)
}

fn is_cidr(value: &str) -> bool {
    let Some((addr, prefix)) = value.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    if addr.parse::<Ipv4Addr>().is_ok() {
        prefix <= 32
    } else if addr.parse::<Ipv6Addr>().is_ok() {
        prefix <= 128
    } else {
        false
    }
}

fn is_uri(value: &str, allow_relative: bool) -> bool {
    if value.contains(char::is_whitespace) {
        return false;
    }
    let has_scheme = Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*:").unwrap().is_match(value);
    has_scheme || (allow_relative && !value.is_empty())
}

fn is_uuid(value: &str) -> bool {
    let re = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    )
    .unwrap();
    re.is_match(value)
}

fn is_base64(value: &str) -> bool {
    if value.len() % 4 != 0 {
        return false;
    }
    let trimmed = value.trim_end_matches('=');
    trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}

/// kubernetes resource quantities: 100m, 2Gi, 1.5, 3e2
fn is_quantity(value: &str) -> bool {
    let re = Regex::new(
        r"^[+-]?([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][+-]?[0-9]+|[mkKMGTPE]|[KMGTPE]i)?$",
    )
    .unwrap();
    re.is_match(value)
}

#[cfg(test)]
mod test {

    use super::check_format;

    #[test]
    fn test_date_time() {
        assert!(check_format("date-time", "2024-05-01T10:00:00Z").is_none());
        assert!(check_format("date-time", "yesterday").is_some());
    }

    #[test]
    fn test_network_formats() {
        assert!(check_format("ipv4", "10.0.0.1").is_none());
        assert!(check_format("ipv4", "10.0.0.256").is_some());
        assert!(check_format("ipv6", "::1").is_none());
        assert!(check_format("cidr", "10.0.0.0/24").is_none());
        assert!(check_format("cidr", "10.0.0.0/33").is_some());
        assert!(check_format("hostname", "api.example.com").is_none());
    }

    #[test]
    fn test_quantity() {
        assert!(check_format("quantity", "100m").is_none());
        assert!(check_format("quantity", "2Gi").is_none());
        assert!(check_format("quantity", "1.5").is_none());
        assert!(check_format("quantity", "lots").is_some());
    }

    #[test]
    fn test_unknown_format_ignored() {
        assert!(check_format("color", "mauve").is_none());
    }

    #[test]
    fn test_uuid_and_byte() {
        assert!(check_format("uuid", "123e4567-e89b-12d3-a456-426614174000").is_none());
        assert!(check_format("uuid", "not-a-uuid").is_some());
        assert!(check_format("byte", "aGVsbG8=").is_none());
        assert!(check_format("byte", "###").is_some());
    }
}
