//! Shell safety — escaping and validation for command arguments
//!
//! Every string that reaches a tracker CLI invocation or an `sh -c` gate
//! command goes through this module. Direct `Command::args` execution does
//! not involve a shell, but gate commands and any argument embedded in a
//! larger command string do.

/// Characters that indicate chaining/injection intent when a shell
/// interprets the argument.
const INJECTION_CHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '\n', '\r'];

/// Maximum length for free-text arguments (issue descriptions, annotations)
/// passed on a command line. Longer text is truncated with a marker.
pub const MAX_CLI_TEXT_LEN: usize = 500;

/// Validation error for argument checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgValidationError {
    /// The problematic character found.
    pub character: char,
    /// Position in the input string.
    pub position: usize,
}

impl std::fmt::Display for ArgValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "dangerous character '{}' at position {}",
            self.character.escape_default(),
            self.position
        )
    }
}

impl std::error::Error for ArgValidationError {}

/// Quote a string for safe inclusion in a shell command line.
///
/// Wraps the argument in single quotes and escapes embedded single quotes
/// with the `'\''` pattern. Single-quoted strings pass through a POSIX
/// shell literally, so no other character needs treatment.
pub fn quote(arg: &str) -> String {
    match shlex::try_quote(arg) {
        Ok(quoted) => quoted.into_owned(),
        // try_quote only fails on interior NUL; strip and requote.
        Err(_) => {
            let cleaned: String = arg.chars().filter(|c| *c != '\0').collect();
            shlex::try_quote(&cleaned)
                .map(|q| q.into_owned())
                .unwrap_or_else(|_| String::from("''"))
        }
    }
}

/// Reject arguments containing shell chaining characters.
///
/// Used for identifiers (issue ids, labels, status names) that should never
/// contain metacharacters in the first place.
pub fn validate_arg(arg: &str) -> Result<(), ArgValidationError> {
    for (position, character) in arg.char_indices() {
        if INJECTION_CHARACTERS.contains(&character) {
            return Err(ArgValidationError {
                character,
                position,
            });
        }
    }
    Ok(())
}

/// Truncate free text to [`MAX_CLI_TEXT_LEN`] on a char boundary,
/// appending an ellipsis marker when anything was cut.
pub fn truncate_text(text: &str) -> String {
    truncate_to(text, MAX_CLI_TEXT_LEN)
}

/// Truncate to an arbitrary limit on a char boundary.
pub fn truncate_to(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit.saturating_sub(1);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain() {
        assert_eq!(quote("hello"), "hello");
    }

    #[test]
    fn test_quote_spaces_and_metachars() {
        let q = quote("fix the $(thing); rm -rf /");
        assert!(q.starts_with('\'') || q.starts_with('"'));
        assert!(!q.is_empty());
    }

    #[test]
    fn test_quote_embedded_single_quote() {
        let q = quote("it's broken");
        // The embedded quote must survive a round trip through shlex.
        let parsed = shlex::split(&q).unwrap();
        assert_eq!(parsed, vec!["it's broken".to_string()]);
    }

    #[test]
    fn test_quote_nul_stripped() {
        let q = quote("a\0b");
        let parsed = shlex::split(&q).unwrap();
        assert_eq!(parsed, vec!["ab".to_string()]);
    }

    #[test]
    fn test_validate_clean() {
        assert!(validate_arg("issue-42").is_ok());
        assert!(validate_arg("in_progress").is_ok());
    }

    #[test]
    fn test_validate_rejects_injection() {
        let err = validate_arg("id; rm -rf /").unwrap_err();
        assert_eq!(err.character, ';');
        assert_eq!(err.position, 2);

        assert!(validate_arg("a`b`").is_err());
        assert!(validate_arg("a$(b)").is_err());
        assert!(validate_arg("a\nb").is_err());
    }

    #[test]
    fn test_truncate_short_unchanged() {
        assert_eq!(truncate_text("short"), "short");
    }

    #[test]
    fn test_truncate_long() {
        let long = "x".repeat(MAX_CLI_TEXT_LEN * 2);
        let t = truncate_text(&long);
        assert!(t.len() <= MAX_CLI_TEXT_LEN + '…'.len_utf8());
        assert!(t.ends_with('…'));
    }

    #[test]
    fn test_truncate_char_boundary() {
        // Multi-byte chars straddling the limit must not split.
        let s = "é".repeat(MAX_CLI_TEXT_LEN);
        let t = truncate_to(&s, 11);
        assert!(t.ends_with('…'));
        assert!(t.chars().all(|c| c == 'é' || c == '…'));
    }
}
