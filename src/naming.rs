/// Hard ceiling on Kubernetes object names.
pub const KUBE_NAME_LEN_LIMIT: usize = 63;

/// Hex characters of the disambiguating hash suffix.
const HASH_SUFFIX_LEN: usize = 8;

/// Derive the workload name for one connector invocation.
///
/// The name embeds the short image name, job type, job id and attempt so a
/// source and a destination sharing the same job id and attempt still get
/// distinct names. Deterministic for identical inputs.
///
/// When the assembled name exceeds `limit` it is truncated and a short
/// blake3 hash of the untruncated name is appended, so two long inputs that
/// share a truncated prefix can never silently collide.
pub fn workload_name(
    image: &str,
    job_type: &str,
    job_id: &str,
    attempt: u32,
    limit: usize,
) -> String {
    let full = sanitize(&format!(
        "{}-{}-{}-{}",
        short_image_name(image),
        job_type,
        job_id,
        attempt
    ));

    if full.len() <= limit {
        return full;
    }

    let hex = blake3::hash(full.as_bytes()).to_hex();
    // A limit that leaves no room for a name before the suffix degenerates
    // to a bare hash prefix, which is still deterministic and starts
    // alphanumeric.
    if limit <= HASH_SUFFIX_LEN + 1 {
        return hex.as_str()[..limit.min(HASH_SUFFIX_LEN)].to_string();
    }
    let suffix = &hex.as_str()[..HASH_SUFFIX_LEN];
    // Room for the suffix and its separating dash.
    let keep = limit - (HASH_SUFFIX_LEN + 1);
    let prefix: String = full.chars().take(keep).collect();
    let prefix = prefix.trim_end_matches('-');
    format!("{prefix}-{suffix}")
}

/// Strip registry and tag/digest from an image reference.
///
/// `registry.example.com:5000/org/source-postgres:1.2.0` becomes
/// `source-postgres`.
fn short_image_name(image: &str) -> &str {
    let last = image.rsplit('/').next().unwrap_or(image);
    let last = last.split('@').next().unwrap_or(last);
    last.split(':').next().unwrap_or(last)
}

/// Reduce to the RFC 1123 label charset: lowercase alphanumerics and
/// dashes, starting and ending with an alphanumeric.
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true; // suppress leading dashes
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_pass_through() {
        let name = workload_name("airbyte/source-postgres:1.2.0", "sync", "42", 1, KUBE_NAME_LEN_LIMIT);
        assert_eq!(name, "source-postgres-sync-42-1");
    }

    #[test]
    fn strips_registry_and_digest() {
        assert_eq!(
            short_image_name("registry.example.com:5000/org/source-postgres:1.2.0"),
            "source-postgres"
        );
        assert_eq!(
            short_image_name("org/dest-s3@sha256:deadbeef"),
            "dest-s3"
        );
        assert_eq!(short_image_name("plain-image"), "plain-image");
    }

    #[test]
    fn never_exceeds_limit() {
        let long_id = "a".repeat(200);
        for limit in [20, 40, KUBE_NAME_LEN_LIMIT] {
            let name = workload_name("airbyte/source-postgres", "sync", &long_id, 3, limit);
            assert!(name.len() <= limit, "{} > {}", name.len(), limit);
        }
    }

    #[test]
    fn degenerate_limits_still_honor_the_ceiling() {
        let long_id = "a".repeat(200);
        for limit in 1..=12 {
            let name = workload_name("airbyte/source-postgres", "sync", &long_id, 3, limit);
            assert!(name.len() <= limit, "{} > {} at limit {limit}", name.len(), limit);
            assert!(!name.is_empty());
            assert!(name.chars().next().unwrap().is_ascii_alphanumeric());
        }
    }

    #[test]
    fn deterministic() {
        let a = workload_name("img", "sync", &"x".repeat(100), 1, 30);
        let b = workload_name("img", "sync", &"x".repeat(100), 1, 30);
        assert_eq!(a, b);
    }

    #[test]
    fn truncation_keeps_distinct_inputs_distinct() {
        // Same truncated prefix, different tails.
        let base = "y".repeat(80);
        let a = workload_name("img", "sync", &format!("{base}1"), 1, 40);
        let b = workload_name("img", "sync", &format!("{base}2"), 1, 40);
        assert_ne!(a, b);
    }

    #[test]
    fn source_and_destination_names_differ() {
        let src = workload_name("airbyte/source-postgres", "sync", "42", 1, KUBE_NAME_LEN_LIMIT);
        let dst = workload_name("airbyte/destination-s3", "sync", "42", 1, KUBE_NAME_LEN_LIMIT);
        assert_ne!(src, dst);
    }

    #[test]
    fn sanitizes_to_label_charset() {
        let name = workload_name("Org/My_Image", "Sync Job", "id/7", 1, KUBE_NAME_LEN_LIMIT);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(!name.starts_with('-') && !name.ends_with('-'));
    }
}
