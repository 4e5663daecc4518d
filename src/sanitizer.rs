//! Content sanitation for cells, CSV fields, filenames, MIME strings and JSON

use serde_json::Value;

/// Options for cell sanitation
#[derive(Debug, Clone)]
pub struct CellSanitizeOptions {
    /// HTML tags preserved verbatim; everything else is stripped
    pub allowed_tags: Vec<String>,
    /// Truncate the sanitized value to this many characters
    pub max_len: Option<usize>,
}

impl Default for CellSanitizeOptions {
    fn default() -> Self {
        Self {
            allowed_tags: Vec::new(),
            max_len: None,
        }
    }
}

/// Sanitize one cell value with default options: strip all HTML, trim,
/// normalize line endings to LF, drop C0 control characters except LF/TAB.
pub fn sanitize_cell(input: &str) -> String {
    sanitize_cell_with(input, &CellSanitizeOptions::default())
}

/// Sanitize one cell value.
///
/// Steps, in order: strip HTML outside the allow-list, normalize CRLF and
/// lone CR to LF, drop C0 controls except LF and TAB, trim surrounding
/// whitespace, then truncate if configured.
pub fn sanitize_cell_with(input: &str, opts: &CellSanitizeOptions) -> String {
    let stripped = strip_html(input, &opts.allowed_tags);

    let mut out = String::with_capacity(stripped.len());
    let mut chars = stripped.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                // CRLF and lone CR both become LF
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            '\n' | '\t' => out.push(c),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {}
            c => out.push(c),
        }
    }

    let trimmed = out.trim();
    match opts.max_len {
        Some(max) if trimmed.chars().count() > max => trimmed.chars().take(max).collect(),
        _ => trimmed.to_string(),
    }
}

/// Remove HTML tags, keeping tags whose name is in `allowed`.
///
/// A `<` that never closes is treated as literal text.
fn strip_html(input: &str, allowed: &[String]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match tail.find('>') {
            Some(close) => {
                let tag = &tail[..=close];
                if is_allowed_tag(tag, allowed) {
                    out.push_str(tag);
                }
                rest = &tail[close + 1..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_allowed_tag(tag: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return false;
    }
    let inner = tag.trim_start_matches('<').trim_end_matches('>');
    let inner = inner.trim_start_matches('/');
    let name: String = inner
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    allowed.iter().any(|t| t.eq_ignore_ascii_case(&name))
}

/// Sanitize a value destined for a CSV cell.
///
/// After cell sanitation, a leading `=`, `+`, `-` or `@` is prefixed with a
/// single quote to neutralize spreadsheet formula injection; values containing
/// a comma, double quote or newline are wrapped in double quotes with embedded
/// quotes doubled.
pub fn sanitize_csv_field(input: &str) -> String {
    let mut value = sanitize_cell(input);

    if matches!(value.chars().next(), Some('=' | '+' | '-' | '@')) {
        value.insert(0, '\'');
    }

    if value.contains(',') || value.contains('"') || value.contains('\n') {
        let escaped = value.replace('"', "\"\"");
        format!("\"{}\"", escaped)
    } else {
        value
    }
}

/// Sanitize a filename: strip directory components, drop control characters,
/// replace reserved characters with `_`, and cap at 255 characters while
/// preserving the extension.
pub fn sanitize_filename(input: &str) -> String {
    const MAX_LEN: usize = 255;
    const RESERVED: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

    // Strip any directory prefix, whichever separator style
    let base = input
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(input);

    let mut name: String = base
        .chars()
        .filter(|c| (*c as u32) >= 0x20 && *c != '\u{7f}')
        .map(|c| if RESERVED.contains(&c) { '_' } else { c })
        .collect();

    if name.is_empty() {
        name.push('_');
    }

    if name.chars().count() > MAX_LEN {
        // Keep the extension when capping
        if let Some(dot) = name.rfind('.') {
            let ext: String = name[dot..].to_string();
            if ext.chars().count() < MAX_LEN {
                let keep = MAX_LEN - ext.chars().count();
                let stem: String = name[..dot].chars().take(keep).collect();
                return format!("{}{}", stem, ext);
            }
        }
        name = name.chars().take(MAX_LEN).collect();
    }
    name
}

/// Sanitize a MIME string: only `type/subtype` of the accepted alphabet is
/// kept, lowercased; anything else becomes `application/octet-stream`.
pub fn sanitize_mime(input: &str) -> String {
    let lowered = input.trim().to_ascii_lowercase();
    let mut parts = lowered.splitn(2, '/');
    let (Some(ty), Some(sub)) = (parts.next(), parts.next()) else {
        return "application/octet-stream".to_string();
    };

    let ty_ok = !ty.is_empty() && ty.chars().all(|c| c.is_ascii_alphanumeric());
    let sub_ok = !sub.is_empty()
        && sub
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'));

    if ty_ok && sub_ok {
        lowered
    } else {
        "application/octet-stream".to_string()
    }
}

/// Parse and recursively sanitize all string keys and values of a JSON
/// document. Returns `None` when the input is not valid JSON.
pub fn sanitize_json(input: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(input).ok()?;
    Some(sanitize_json_value(value))
}

fn sanitize_json_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_cell(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_json_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (sanitize_cell(&k), sanitize_json_value(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_cell_strips_html() {
        assert_eq!(sanitize_cell("<script>alert(1)</script>hi"), "alert(1)hi");
        assert_eq!(sanitize_cell("a <b>bold</b> word"), "a bold word");
    }

    #[test]
    fn test_sanitize_cell_allow_list() {
        let opts = CellSanitizeOptions {
            allowed_tags: vec!["b".to_string()],
            max_len: None,
        };
        assert_eq!(
            sanitize_cell_with("a <b>bold</b> <i>word</i>", &opts),
            "a <b>bold</b> word"
        );
    }

    #[test]
    fn test_sanitize_cell_line_endings() {
        assert_eq!(sanitize_cell("a\r\nb\rc\nd"), "a\nb\nc\nd");
    }

    #[test]
    fn test_sanitize_cell_control_chars() {
        assert_eq!(sanitize_cell("a\u{0}b\u{1f}c\td\u{7f}"), "abc\td");
        assert_eq!(sanitize_cell("keep\ttab\nand newline"), "keep\ttab\nand newline");
    }

    #[test]
    fn test_sanitize_cell_truncation() {
        let opts = CellSanitizeOptions {
            allowed_tags: vec![],
            max_len: Some(3),
        };
        assert_eq!(sanitize_cell_with("abcdef", &opts), "abc");
    }

    #[test]
    fn test_unclosed_tag_is_literal() {
        assert_eq!(sanitize_cell("a < b"), "a < b");
    }

    #[test]
    fn test_csv_formula_neutralization() {
        assert_eq!(sanitize_csv_field("=SUM(A1:A9)"), "'=SUM(A1:A9)");
        assert_eq!(sanitize_csv_field("+1"), "'+1");
        assert_eq!(sanitize_csv_field("-1"), "'-1");
        assert_eq!(sanitize_csv_field("@cmd"), "'@cmd");
        assert_eq!(sanitize_csv_field("plain"), "plain");
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(sanitize_csv_field("a,b"), "\"a,b\"");
        assert_eq!(sanitize_csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(sanitize_csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("/etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_filename("a<b>c:d.txt"), "a_b_c_d.txt");
        assert_eq!(sanitize_filename("report|final?.pdf"), "report_final_.pdf");
    }

    #[test]
    fn test_sanitize_filename_cap_preserves_extension() {
        let long = format!("{}.txt", "x".repeat(300));
        let out = sanitize_filename(&long);
        assert_eq!(out.chars().count(), 255);
        assert!(out.ends_with(".txt"));
    }

    #[test]
    fn test_sanitize_mime() {
        assert_eq!(sanitize_mime("Text/CSV"), "text/csv");
        assert_eq!(sanitize_mime("image/svg+xml"), "image/svg+xml");
        assert_eq!(
            sanitize_mime("application/vnd.ms-excel"),
            "application/vnd.ms-excel"
        );
        assert_eq!(sanitize_mime("not a mime"), "application/octet-stream");
        assert_eq!(sanitize_mime("text/"), "application/octet-stream");
        assert_eq!(sanitize_mime("/csv"), "application/octet-stream");
        assert_eq!(sanitize_mime("a/b/c"), "application/octet-stream");
    }

    #[test]
    fn test_sanitize_json() {
        let out = sanitize_json(r#"{"<b>k</b>": ["<i>v</i>", 1, {"n": "x\r\ny"}]}"#).unwrap();
        assert_eq!(out["k"][0], "v");
        assert_eq!(out["k"][1], 1);
        assert_eq!(out["k"][2]["n"], "x\ny");
    }

    #[test]
    fn test_sanitize_json_invalid() {
        assert!(sanitize_json("{not json").is_none());
    }
}
