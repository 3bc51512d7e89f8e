//! Shared utilities for loadpub.

/// Characters that receive a backslash prefix in [`escape_value`].
const ESCAPED_CHARS: [char; 7] = ['\r', '\n', '\0', '\x1a', '\\', '\'', '"'];

/// Escape a value for embedding inside a quoted statement literal.
///
/// Each of CR, LF, NUL, SUB (0x1a), backslash, single quote and double quote
/// is prefixed with a backslash; the character itself is kept. Everything else
/// passes through unchanged.
pub fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if ESCAPED_CHARS.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn find_value_end(s: &str) -> usize {
    let mut end = 0;
    let mut in_quote = None;
    let mut escaped = false;

    for c in s.chars() {
        let char_len = c.len_utf8();

        if escaped {
            escaped = false;
            end += char_len;
            continue;
        }

        if c == '\\' {
            escaped = true;
            end += char_len;
            continue;
        }

        if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
            end += char_len;
            continue;
        }

        if c == '\'' {
            in_quote = Some(c);
            end += char_len;
            continue;
        }

        // `"` ends a value embedded in a JSON string.
        if c.is_whitespace() || c == ';' || c == '"' || c == ',' {
            break;
        }

        end += char_len;
    }
    end
}

/// Mask credentials inside connection strings before logging.
///
/// Dropped events are logged verbatim for replay; configuration payloads may
/// embed connection strings for the system under test.
pub fn mask_credentials(text: &str) -> String {
    let patterns = [
        ("Password=", "Password=***"),
        ("password=", "password=***"),
        ("Pwd=", "Pwd=***"),
        ("pwd=", "pwd=***"),
        ("PWD=", "PWD=***"),
        ("User Id=", "User Id=***"),
        ("Uid=", "Uid=***"),
        ("uid=", "uid=***"),
    ];

    let mut result = text.to_string();
    for (pattern, replacement) in patterns {
        let mut search_start = 0;
        while search_start < result.len() {
            let Some(start) = result[search_start..].find(pattern) else {
                break;
            };
            let abs_start = search_start + start;
            let value_start = abs_start + pattern.len();

            let rest = &result[value_start..];
            let value_end = value_start + find_value_end(rest);

            let prefix = &result[..abs_start];
            let suffix = &result[value_end..];
            result = format!("{}{}{}", prefix, replacement, suffix);

            search_start = abs_start + replacement.len();
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn escapes_quotes_backslashes_and_control_characters() {
        assert_eq!(escape_value("it's"), "it\\'s");
        assert_eq!(escape_value("say \"hi\""), "say \\\"hi\\\"");
        assert_eq!(escape_value("a\\b"), "a\\\\b");
        assert_eq!(escape_value("line1\r\nline2"), "line1\\\r\\\nline2");
        assert_eq!(escape_value("nul\0sub\x1a"), "nul\\\0sub\\\x1a");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(escape_value("GET /index.html?x=1&y=2"), "GET /index.html?x=1&y=2");
        assert_eq!(escape_value(""), "");
        assert_eq!(escape_value("tab\tstays"), "tab\tstays");
    }

    #[test]
    fn masks_connection_string_credentials() {
        let text = "Server=db;Port=3306;Uid=root;Pwd=hunter2;table cache = true;";
        let masked = mask_credentials(text);
        assert_eq!(masked, "Server=db;Port=3306;Uid=***;Pwd=***;table cache = true;");
    }

    #[test]
    fn masks_credentials_inside_json() {
        let text = r#"{"ConnectionString":"Server=x;Password=p@ss;","Other":1}"#;
        let masked = mask_credentials(text);
        assert!(!masked.contains("p@ss"));
        assert!(masked.contains("Password=***"));
        assert!(masked.ends_with(r#";","Other":1}"#));
    }

    #[test]
    fn masks_repeated_credentials() {
        assert_eq!(mask_credentials("Pwd=a Pwd=b"), "Pwd=*** Pwd=***");
    }

    proptest! {
        #[test]
        fn escaping_only_adds_backslashes(s in ".*") {
            let escaped = escape_value(&s);
            let special = s.chars().filter(|c| ESCAPED_CHARS.contains(c)).count();
            prop_assert_eq!(escaped.chars().count(), s.chars().count() + special);
        }

        #[test]
        fn unescaping_restores_the_original(s in ".*") {
            let escaped = escape_value(&s);
            let mut restored = String::new();
            let mut chars = escaped.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        restored.push(next);
                    }
                } else {
                    restored.push(c);
                }
            }
            prop_assert_eq!(restored, s);
        }
    }
}
