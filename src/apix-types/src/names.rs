//! DNS style name rules used for definition names and instance names

const DNS1123_SUBDOMAIN_MAX: usize = 253;
const DNS1123_LABEL_MAX: usize = 63;

fn is_alnum(c: u8) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

/// lowercase alphanumeric or '-', starting and ending alphanumeric
pub fn is_dns1123_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > DNS1123_LABEL_MAX {
        return false;
    }
    if !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&c| is_alnum(c) || c == b'-')
}

/// one or more DNS labels separated by '.'
pub fn is_dns1123_subdomain(value: &str) -> bool {
    if value.is_empty() || value.len() > DNS1123_SUBDOMAIN_MAX {
        return false;
    }
    value.split('.').all(is_dns1123_label)
}

pub fn dns1123_label_error(field: &str, value: &str) -> String {
    format!(
        "{field}: \"{value}\" must consist of lower case alphanumeric characters or '-', \
         and must start and end with an alphanumeric character"
    )
}

pub fn dns1123_subdomain_error(field: &str, value: &str) -> String {
    format!(
        "{field}: \"{value}\" must consist of lower case alphanumeric characters, '-' or '.', \
         and must start and end with an alphanumeric character"
    )
}

/// CamelCase kind names: ascii letters only, starting with an uppercase
pub fn is_kind_name(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_labels() {
        assert!(is_dns1123_label("widgets"));
        assert!(is_dns1123_label("widget-2"));
        assert!(!is_dns1123_label(""));
        assert!(!is_dns1123_label("-widgets"));
        assert!(!is_dns1123_label("Widgets"));
        assert!(!is_dns1123_label(&"a".repeat(64)));
    }

    #[test]
    fn test_subdomains() {
        assert!(is_dns1123_subdomain("example.com"));
        assert!(is_dns1123_subdomain("widgets.example.com"));
        assert!(!is_dns1123_subdomain("widgets..example.com"));
        assert!(!is_dns1123_subdomain(".example.com"));
    }

    #[test]
    fn test_kinds() {
        assert!(is_kind_name("Widget"));
        assert!(!is_kind_name("widget"));
        assert!(!is_kind_name("Wid-get"));
    }
}
