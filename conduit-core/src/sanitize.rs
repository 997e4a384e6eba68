//! Log-site sanitizer. Every caller-controlled value that reaches a log
//! line passes through [`sanitize_for_log`]; forwarded payloads are never
//! touched.

/// Maximum length of a sanitized log field.
pub const MAX_LOG_FIELD_LEN: usize = 1000;

/// Strip CR/LF and other control characters and truncate to
/// [`MAX_LOG_FIELD_LEN`] characters. Idempotent.
pub fn sanitize_for_log(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_LOG_FIELD_LEN)
        .collect()
}
