/// Encode an arbitrary id (session id, chat id, channel name) as a single
/// filesystem path segment.
///
/// ASCII alphanumerics plus `-`, `_` and `.` pass through; every other byte
/// becomes `%XX`.  The mapping is injective, so two ids never share a
/// directory.  `.` and `..` are escaped as well.
pub fn safe_segment(raw: &str) -> String {
    if raw.is_empty() {
        return "%00".into();
    }
    if raw == "." || raw == ".." {
        return raw.bytes().map(|b| format!("%{b:02X}")).collect();
    }
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
