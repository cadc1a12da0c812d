// Shared helpers for turning TOML parse errors into one-line messages.

/// 1-based (line, column) of a byte offset within `src`.
#[must_use]
pub fn line_col_at(src: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(src.len());
    let before = &src[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before
        .rfind('\n')
        .map_or(before.chars().count(), |nl| before[nl + 1..].chars().count())
        + 1;
    (line, col)
}

/// Format a TOML error as `"<what> parse error at L:C: message"`.
#[must_use]
pub fn describe_toml_error(what: &str, src: &str, err: &toml::de::Error) -> String {
    let msg = err.message().trim();
    match err.span() {
        Some(span) if src.is_char_boundary(span.start.min(src.len())) => {
            let (line, col) = line_col_at(src, span.start);
            format!("{what} parse error at {line}:{col}: {msg}")
        }
        _ => format!("{what} parse error: {msg}"),
    }
}
