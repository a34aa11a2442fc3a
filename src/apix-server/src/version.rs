//! kubernetes style version ordering and the storage version hash

use std::cmp::Ordering;
use std::sync::OnceLock;

use base64::Engine as _;
use regex::Regex;
use sha2::Digest;
use sha2::Sha256;

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^v(\d+)(?:(alpha|beta)(\d+)?)?$").unwrap())
}

/// (major, tier, tier-number); GA is the highest tier
fn parse_priority(version: &str) -> Option<(u64, u8, u64)> {
    let captures = version_pattern().captures(version)?;
    let major: u64 = captures.get(1)?.as_str().parse().ok()?;
    let tier = match captures.get(2).map(|m| m.as_str()) {
        None => 2,
        Some("beta") => 1,
        Some("alpha") => 0,
        Some(_) => return None,
    };
    let minor: u64 = captures
        .get(3)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    Some((major, tier, minor))
}

/// kubernetes version sort: GA beats beta beats alpha, higher numbers
/// first within a tier, unparseable names last in lexical order
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_priority(a), parse_priority(b)) {
        (Some(pa), Some(pb)) => {
            // tier first, then major, then tier number
            (pa.1, pa.0, pa.2).cmp(&(pb.1, pb.0, pb.2)).reverse()
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// order served versions by decreasing priority
pub fn sort_versions(versions: &mut [String]) {
    versions.sort_by(|a, b| compare_versions(a, b));
}

/// stable identifier for the version objects of a resource are stored in:
/// base64 of the first eight sha256 bytes over group/version/resource
pub fn storage_version_hash(group: &str, version: &str, resource: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(group.as_bytes());
    hasher.update(b"/");
    hasher.update(version.as_bytes());
    hasher.update(b"/");
    hasher.update(resource.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(&digest[..8])
}
