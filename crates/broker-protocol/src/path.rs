//! Key/glob grammar: path validation, glob matching, and monotonic key
//! generation for list-insertion keys.

/// Errors raised while validating a glob path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("glob '*' must be the terminal path segment")]
    GlobNotAtEnd,
    #[error("a path may contain at most one '*'")]
    InvalidGlobCount,
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '*' || c == '/'
}

/// True iff `k` satisfies the path grammar: non-empty ASCII, restricted to
/// `[A-Za-z0-9*/]`, no leading/trailing `/`, no `//` or `**`, and a single
/// character path must be alphanumeric or `*`.
pub fn is_valid(k: &str) -> bool {
    if k.is_empty() || !k.is_ascii() {
        return false;
    }
    if !k.chars().all(is_path_char) {
        return false;
    }
    if k.starts_with('/') || k.ends_with('/') {
        return false;
    }
    if k.contains("//") || k.contains("**") {
        return false;
    }
    if k.len() == 1 {
        return k.chars().next().is_some_and(|c| c.is_ascii_alphanumeric() || c == '*');
    }
    validate_glob(k).is_ok()
}

/// True iff `k` ends with a terminal `*` segment, or is exactly `*`.
pub fn is_glob(k: &str) -> bool {
    k == "*" || k.ends_with("/*")
}

/// True iff any `*` appears anywhere in `k`.
pub fn has_glob(k: &str) -> bool {
    k.contains('*')
}

/// Fails when more than one `*` is present, or when a present `*` is not
/// the terminal segment.
pub fn validate_glob(k: &str) -> Result<(), PathError> {
    let star_count = k.matches('*').count();
    if star_count > 1 {
        return Err(PathError::InvalidGlobCount);
    }
    if star_count == 1 && !is_glob(k) {
        return Err(PathError::GlobNotAtEnd);
    }
    Ok(())
}

/// True iff `pattern` and `key` have the same number of segments and each
/// segment matches pairwise, where a `*` segment in `pattern` matches any
/// single non-empty segment of `key`. `match_path(k, k)` is always true.
pub fn match_path(pattern: &str, key: &str) -> bool {
    if pattern == key {
        return true;
    }
    let p_segs: Vec<&str> = pattern.split('/').collect();
    let k_segs: Vec<&str> = key.split('/').collect();
    if p_segs.len() != k_segs.len() {
        return false;
    }
    p_segs
        .iter()
        .zip(k_segs.iter())
        .all(|(p, k)| *p == "*" || p == k)
        && k_segs.iter().all(|s| !s.is_empty())
}

/// Symmetric glob-aware match: true when either path, treated as a glob
/// pattern, matches the other literally.
pub fn peer(a: &str, b: &str) -> bool {
    match_path(a, b) || match_path(b, a)
}

/// Substring after the final `/`, or the whole string if there is none.
pub fn last_index(k: &str) -> &str {
    match k.rfind('/') {
        Some(i) => &k[i + 1..],
        None => k,
    }
}

/// If `pattern` contains no `*`, returns it unchanged. Otherwise substitutes
/// the single `*` with the lower-case hex encoding of `tick`, producing a
/// unique list-insertion key. `tick` should come from the monotonic clock.
pub fn build(pattern: &str, tick: i64) -> String {
    if !has_glob(pattern) {
        return pattern.to_owned();
    }
    let encoded = format!("{tick:x}");
    if pattern == "*" {
        encoded
    } else {
        pattern.replacen('*', &encoded, 1)
    }
}

/// Interpret the final path segment as a hex-encoded `i64` tick. Returns 0
/// on parse failure, never panics.
pub fn decode(segment: &str) -> i64 {
    i64::from_str_radix(last_index(segment), 16).unwrap_or(0)
}
