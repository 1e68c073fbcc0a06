//! Text framing helpers: parameter value escaping.
//!
//! Values travel on a single line, so anything that could be mistaken for
//! framing (`;`, `=`, spaces, controls) is percent-escaped. Spaces use the
//! shorter `+` form.
use crate::message::MessageError;

fn must_escape(b: u8) -> bool {
    b < 0x20 || b == 0x7f || matches!(b, b'%' | b';' | b'=' | b'+')
}

/// Escape a parameter value for the text wire format.
pub(crate) fn escape(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());

    for &b in value.as_bytes() {
        if b == b' ' {
            out.push(b'+');
        } else if must_escape(b) {
            out.push(b'%');
            out.extend_from_slice(format!("{:02X}", b).as_bytes());
        } else {
            // Multi-byte UTF-8 sequences pass through untouched.
            out.push(b);
        }
    }

    // Only ASCII bytes are rewritten, so the result stays valid UTF-8.
    String::from_utf8(out).expect("escaping preserves utf-8")
}

/// Reverse of [`escape`].
pub(crate) fn unescape(value: &str) -> Result<String, MessageError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .ok_or_else(|| MessageError::InvalidEscape(value.to_string()))?;
                let hex = std::str::from_utf8(hex)
                    .map_err(|_| MessageError::InvalidEscape(value.to_string()))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| MessageError::InvalidEscape(value.to_string()))?;

                out.push(byte);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|_| MessageError::InvalidEscape(value.to_string()))
}

/// Check a parameter name: `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_roundtrip() {
        for value in [
            "",
            "plain",
            "with space",
            "a=b;c=d",
            "percent % plus +",
            "line\nbreak\ttab",
            "héllo wörld",
        ] {
            let escaped = escape(value);

            assert!(!escaped.contains(' '));
            assert!(!escaped.contains(';'));
            assert!(!escaped.contains('\n'));
            assert_eq!(unescape(&escaped).unwrap(), value);
        }
    }

    #[test]
    fn test_escape_forms() {
        assert_eq!(escape("a b"), "a+b");
        assert_eq!(escape("a;b"), "a%3Bb");
        assert_eq!(escape("100%"), "100%25");
        assert_eq!(unescape("a+b").unwrap(), "a b");
        assert!(unescape("broken%2").is_err());
        assert!(unescape("broken%zz").is_err());
    }

    #[test]
    fn test_valid_name() {
        assert!(valid_name("server_name"));
        assert!(valid_name("_x9"));
        assert!(!valid_name("9x"));
        assert!(!valid_name(""));
        assert!(!valid_name("with space"));
        assert!(!valid_name("dash-ed"));
    }
}
