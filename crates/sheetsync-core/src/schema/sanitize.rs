//! Text → SQL identifier normalization

/// Maximum identifier length produced by [`sanitize`]
pub const MAX_IDENTIFIER_LEN: usize = 64;

const FALLBACK_IDENTIFIER: &str = "col";

/// Normalize arbitrary header or document text into a SQL identifier.
///
/// Lowercases, collapses every run of characters outside `[a-z0-9_]` into a
/// single `_`, trims `_` from both ends, substitutes `col` for an empty result,
/// prefixes `col_` when the result starts with a digit and truncates to
/// [`MAX_IDENTIFIER_LEN`]. The function is idempotent.
///
/// # Examples
///
/// ```
/// use sheetsync_core::schema::sanitize;
///
/// assert_eq!(sanitize("Order #"), "order");
/// assert_eq!(sanitize("2024 Total"), "col_2024_total");
/// assert_eq!(sanitize("!!!"), "col");
/// ```
pub fn sanitize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut collapsed = String::with_capacity(lowered.len());
    let mut in_run = false;
    for ch in lowered.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            collapsed.push(ch);
            in_run = false;
        } else if !in_run {
            collapsed.push('_');
            in_run = true;
        }
    }

    let mut identifier = collapsed.trim_matches('_').to_string();
    if identifier.is_empty() {
        identifier = FALLBACK_IDENTIFIER.to_string();
    }
    if identifier.starts_with(|ch: char| ch.is_ascii_digit()) {
        identifier = format!("{FALLBACK_IDENTIFIER}_{identifier}");
    }

    // ASCII only at this point, so byte truncation is char-safe.
    identifier.truncate(MAX_IDENTIFIER_LEN);
    let kept = identifier.trim_end_matches('_').len();
    identifier.truncate(kept);
    identifier
}

/// First free identifier among `base`, `base_1`, `base_2`, …
///
/// `is_taken` is scoped by the caller (one backing table) and may fail, in
/// which case the error is returned. The result never exceeds
/// [`MAX_IDENTIFIER_LEN`].
pub fn unique_identifier<E>(
    base: &str,
    mut is_taken: impl FnMut(&str) -> Result<bool, E>,
) -> Result<String, E> {
    if !is_taken(base)? {
        return Ok(base.to_string());
    }

    let mut counter: u32 = 1;
    loop {
        let suffix = format!("_{counter}");
        let mut stem = base.to_string();
        stem.truncate(MAX_IDENTIFIER_LEN.saturating_sub(suffix.len()));
        let candidate = format!("{}{suffix}", stem.trim_end_matches('_'));
        if !is_taken(&candidate)? {
            return Ok(candidate);
        }
        counter += 1;
    }
}

/// Quote a sanitized identifier for interpolation into SQL.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
