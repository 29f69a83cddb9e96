use std::borrow::Cow;

/// Maximum stored length, in bytes, of a text field value.
///
/// Values longer than this are truncated when set, backing up to the nearest
/// UTF-8 character boundary.
pub const MAX_TEXT_FIELD_LEN: usize = 64_000;

fn needs_escape(b: u8) -> bool {
    matches!(b, b' ' | b'=' | b',')
}

/// Escapes a key, tag name, tag value, or field name into `out`.
///
/// Each of ` `, `=`, and `,` is prefixed with a backslash. All other bytes
/// pass through untouched.
pub fn escape_component_into(out: &mut Vec<u8>, s: &str) {
    for &b in s.as_bytes() {
        if needs_escape(b) {
            out.push(b'\\');
        }
        out.push(b);
    }
}

/// Escapes a key, tag name, tag value, or field name.
///
/// Returns the input unchanged (borrowed) when no escaping is required,
/// which is the common case for well-behaved metric names.
pub fn escape_component(s: &str) -> Cow<'_, str> {
    if !s.bytes().any(needs_escape) {
        return Cow::Borrowed(s);
    }

    let mut out = Vec::with_capacity(s.len() + 4);
    escape_component_into(&mut out, s);
    // Only ASCII backslashes were inserted between characters, so the result
    // is still valid UTF-8.
    Cow::Owned(String::from_utf8(out).expect("escaping preserves UTF-8"))
}

/// Reverses [`escape_component`] over the ` `/`=`/`,` alphabet.
///
/// A trailing lone backslash is preserved as-is.
pub fn unescape_component(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() && needs_escape(bytes[i + 1]) {
            i += 1;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).expect("unescaping preserves UTF-8")
}

/// Truncates `s` to at most `max` bytes without splitting a character.
fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Builds the stored wire form of a text field value: surrounding quotes,
/// inner `"` escaped to `\"`, and the input truncated to
/// [`MAX_TEXT_FIELD_LEN`] bytes.
pub(crate) fn quote_text_value(s: &str) -> Vec<u8> {
    let s = truncate_to_boundary(s, MAX_TEXT_FIELD_LEN);
    let mut out = Vec::with_capacity(s.len() + 2);
    out.push(b'"');
    for &b in s.as_bytes() {
        if b == b'"' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'"');
    out
}
