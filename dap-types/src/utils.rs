//! Support functions shared across the crate.

/// Undo the WWW escaping a client applied to the constraint expression.
///
/// Only `%20` is rewritten (to a space); every other byte, including other
/// percent escapes, is preserved as-is.
pub fn www2id(value: &str) -> String {
    value.replace("%20", " ")
}

/// Escape a string for embedding between double quotes.
pub fn escape_quoted(unescaped: &str) -> String {
    unescaped.replace('\\', "\\\\").replace('\"', "\\\"")
}

/// Escape the five XML-special characters.
pub fn escape_xml(unescaped: &str) -> String {
    let mut out = String::with_capacity(unescaped.len());

    for c in unescaped.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }

    out
}

/// The last component of a path, with any trailing slashes removed.
///
/// Used to derive a dataset name from its file name.
pub fn name_path(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}
