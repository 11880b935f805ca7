use blake3::Hasher;
use url::Url;
use vigil_ids::RunId;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Canonical form of a finding location.
///
/// URLs: scheme/host lowercased, default port dropped, fragment dropped, query
/// pairs sorted, trailing slash trimmed (except the root path). Anything else
/// (package coordinates, file paths) is trimmed, whitespace-collapsed and
/// lowercased.
pub fn normalize_location(location: &str) -> String {
    let trimmed = location.trim();
    if let Ok(mut url) = Url::parse(trimmed) {
        if url.has_host() {
            url.set_fragment(None);
            let mut pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if pairs.is_empty() {
                url.set_query(None);
            } else {
                pairs.sort();
                url.query_pairs_mut().clear().extend_pairs(pairs);
            }
            let path = url.path().to_string();
            if path.len() > 1 && path.ends_with('/') {
                url.set_path(path.trim_end_matches('/'));
            }
            return url.to_string();
        }
    }
    trimmed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable finding identity within a run.
///
/// Components:
/// - run_id
/// - finding type
/// - normalized location
pub fn finding_dedup_key(run_id: &RunId, finding_type: &str, location: &str) -> String {
    let normalized = normalize_location(location);
    hash_parts(&[run_id.as_str(), finding_type, normalized.as_str()])
}
