//! Dotted version comparison for the tunnel engine's version probe

/// Compare two dotted versions, returning true when `version >= target`.
///
/// Segments are compared numerically; a missing segment counts as 0.
pub fn ver_greater_equal(version: &str, target: &str) -> bool {
    let mut a = version.split('.').map(|s| s.trim().parse::<u64>().unwrap_or(0));
    let mut b = target.split('.').map(|s| s.trim().parse::<u64>().unwrap_or(0));

    loop {
        match (a.next(), b.next()) {
            (None, None) => return true,
            (x, y) => {
                let x = x.unwrap_or(0);
                let y = y.unwrap_or(0);
                if x != y {
                    return x > y;
                }
            }
        }
    }
}

/// Extract `major.minor.patch` from a `sing-box version` style banner.
pub fn extract_version(output: &str) -> Option<String> {
    let re = regex::Regex::new(r"version\s+(\d+(?:\.\d+)*)").ok()?;
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
