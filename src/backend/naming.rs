//! Sanitizers turning arbitrary text into cluster-legal identifiers.
//!
//! Kubernetes restricts label keys, label values and resource names to at
//! most 63 characters that start and end with an alphanumeric. Container
//! names and user labels arrive unconstrained, so every identifier written
//! to the cluster passes through one of these functions. All three are
//! idempotent: applying a function to its own output returns it unchanged.

/// Shared normalization: strip leading/trailing non-alphanumeric runs and
/// truncate the middle to 63 characters.
fn normalize(value: &str) -> String {
    let trimmed = value.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    let truncated: String = trimmed.chars().take(63).collect();
    truncated
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Sanitize a string for use as a label key.
///
/// A single `/` separating a prefix from a name is legal mid-string and
/// preserved (`app.kubernetes.io/name` stays intact). Empty input yields
/// an empty string.
pub fn to_kubernetes_key(value: &str) -> String {
    normalize(value)
}

/// Sanitize a string for use as a label value.
///
/// Label values may not carry a path-style prefix, so every `/` is removed
/// after normalization. Empty input yields an empty string.
pub fn to_kubernetes_value(value: &str) -> String {
    normalize(value).replace('/', "")
}

/// Sanitize a string for use as a resource name.
///
/// Only letters and digits survive. If nothing survives (including empty
/// input), the literal `undef` is returned so the result is always a
/// usable name.
pub fn to_kubernetes_name(value: &str) -> String {
    let name: String = normalize(value)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if name.is_empty() {
        "undef".to_string()
    } else {
        name
    }
}
