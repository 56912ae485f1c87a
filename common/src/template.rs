//! `%VAR%` substitution for served pages.

/// Expand every `%NAME%` in `page` through `lookup`.
///
/// `lookup` is only called for placeholders actually present, so expensive
/// values (clock, heap) are produced on demand. Unknown names expand to an
/// empty string; a `%` without a closing partner is copied through.
pub fn render<F>(page: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(page.len());
    let mut rest = page;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if is_variable_name(&after[..end]) => {
                if let Some(value) = lookup(&after[..end]) {
                    out.push_str(&value);
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn is_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}
