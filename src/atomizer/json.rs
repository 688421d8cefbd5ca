//! Pure boundary scanner for top-level JSON values.
//!
//! Tracks bracket nesting and string/escape state over raw bytes to find
//! where the value beginning at the buffer head ends. No allocation, no
//! validation beyond what boundary detection needs.

/// Outcome of scanning buffered bytes for one complete JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonScan {
    /// `data[start..end]` is exactly one complete top-level value
    /// (`start` skips leading whitespace).
    Complete { start: usize, end: usize },
    /// A value has started but its end is not in the buffer yet.
    Incomplete,
    /// The first non-whitespace byte cannot start a value. Only objects
    /// and arrays are accepted at the top level; a bare scalar at a
    /// buffer boundary is indistinguishable from a truncated one.
    Invalid,
}

fn is_json_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

pub fn scan_json(data: &[u8]) -> JsonScan {
    let Some(start) = data.iter().position(|&b| !is_json_ws(b)) else {
        return JsonScan::Incomplete;
    };
    if !matches!(data[start], b'{' | b'[') {
        return JsonScan::Invalid;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in data[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                if depth == 0 {
                    return JsonScan::Invalid;
                }
                depth -= 1;
                if depth == 0 {
                    return JsonScan::Complete {
                        start,
                        end: start + i + 1,
                    };
                }
            }
            _ => {}
        }
    }
    JsonScan::Incomplete
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_object() {
        assert_eq!(
            scan_json(br#"{"a": 1}"#),
            JsonScan::Complete { start: 0, end: 8 }
        );
    }

    #[test]
    fn test_boundary_between_concatenated_objects() {
        let data = br#"{"a":1}{"b":2}"#;
        assert_eq!(scan_json(data), JsonScan::Complete { start: 0, end: 7 });
        assert_eq!(
            scan_json(&data[7..]),
            JsonScan::Complete { start: 0, end: 7 }
        );
    }

    #[test]
    fn test_nested_and_embedded_newlines() {
        let data = b"{\"a\": [1, 2,\n {\"b\": {}}]}\n";
        assert_eq!(scan_json(data), JsonScan::Complete { start: 0, end: 25 });
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let data = br#"{"msg": "a } b \" ] c"}"#;
        assert_eq!(scan_json(data), JsonScan::Complete { start: 0, end: 23 });
    }

    #[test]
    fn test_leading_whitespace_skipped() {
        assert_eq!(
            scan_json(b"  \n\t[1, 2]"),
            JsonScan::Complete { start: 4, end: 10 }
        );
    }

    #[test]
    fn test_incomplete_value() {
        assert_eq!(scan_json(br#"{"a": [1, 2"#), JsonScan::Incomplete);
        assert_eq!(scan_json(br#"{"msg": "unterminated"#), JsonScan::Incomplete);
        assert_eq!(scan_json(b"   \n "), JsonScan::Incomplete);
    }

    #[test]
    fn test_invalid_head() {
        assert_eq!(scan_json(b"plain text line"), JsonScan::Invalid);
        assert_eq!(scan_json(b"42"), JsonScan::Invalid);
        assert_eq!(scan_json(b"}{"), JsonScan::Invalid);
    }
}
