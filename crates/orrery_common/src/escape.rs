//! Delimiter escaping shared by the event log file format and tabular dumps.
//!
//! Fields are separated by an unescaped `|`. Inside a field, `\` becomes
//! `\\`, `|` becomes `\|` and a newline becomes `\n`, so every record stays
//! on one physical line. Decoding also accepts a backslash followed by a
//! literal newline, which older dump files used.

pub const DELIMITER: char = '|';

/// Escape one field value. A newline is written as the two characters
/// `\n`, never as a backslash before a literal newline, so output always
/// stays on one line. `unescape` reads both forms.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('\n') => out.push('\n'),
            Some(other) => out.push(other),
            // dangling backslash at end of input
            None => out.push('\\'),
        }
    }
    out
}

/// Escape each field and join with the delimiter.
pub fn join_fields<I, S>(fields: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let escaped: Vec<String> = fields.into_iter().map(|f| escape(f.as_ref())).collect();
    escaped.join("|")
}

/// Split a line on unescaped delimiters and unescape each field.
pub fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            DELIMITER => fields.push(unescape(&std::mem::take(&mut current))),
            other => current.push(other),
        }
    }
    fields.push(unescape(&current));
    fields
}
