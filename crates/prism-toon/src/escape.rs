//! Line escaping for payloads embedded in TOON documents.
//!
//! A payload line that starts with any number of backslashes followed by
//! `# ` gains one extra leading backslash on the way in and loses it on the
//! way out. The mapping is a bijection, so `unescape(escape(s)) == s` for
//! every string, and no escaped line can be taken for a section header.

/// True if `line` is `\`* followed by `# `.
fn is_header_like(line: &str) -> bool {
    line.trim_start_matches('\\').starts_with("# ")
}

/// Escapes header-like lines in `input`.
pub fn escape(input: &str) -> String {
    map_lines(input, |line, out| {
        if is_header_like(line) {
            out.push('\\');
        }
        out.push_str(line);
    })
}

/// Reverses [`escape`].
pub fn unescape(input: &str) -> String {
    map_lines(input, |line, out| {
        match line.strip_prefix('\\') {
            Some(rest) if is_header_like(line) => out.push_str(rest),
            _ => out.push_str(line),
        }
    })
}

/// Escapes a single-line value (META values, tool names and ids).
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Reverses [`escape_value`]. Unknown escapes are kept verbatim.
pub fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn map_lines(input: &str, mut f: impl FnMut(&str, &mut String)) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    for (i, line) in input.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        f(line, &mut out);
    }
    out
}
