//! Response Cleaning
//!
//! Every transport hands the raw bytes it read (up to and including the
//! prompt) to [`clean_response`], so callers see identical text whichever
//! medium carried it.

use crate::command::CommandCode;

/// ELM327 prompt terminator, sent when the adapter is ready for the next command
pub const PROMPT: u8 = b'>';

/// Cleaned response text
pub type Response = String;

/// Strip framing from a raw adapter reply.
///
/// Lines are split on CR/LF, each is trimmed of whitespace and the prompt,
/// empty lines are dropped, and a leading echo of `command` is removed.
/// Remaining lines are joined with `\n`.
pub fn clean_response(command: &CommandCode, raw: &[u8]) -> Response {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text
        .split(|c: char| c == '\r' || c == '\n')
        .map(|line| line.trim_matches(|c: char| c.is_whitespace() || c == PROMPT as char))
        .filter(|line| !line.is_empty())
        .peekable();

    // Echo is still on until ATE0 has been processed
    if lines
        .peek()
        .is_some_and(|first| first.eq_ignore_ascii_case(command.as_str()))
    {
        lines.next();
    }

    lines.collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_line() {
        let cleaned = clean_response(&CommandCode::ENGINE_RPM, b"41 0C 1A F8\r>");
        assert_eq!(cleaned, "41 0C 1A F8");
    }

    #[test]
    fn test_echo_removed() {
        let cleaned = clean_response(&CommandCode::RESET, b"ATZ\r\r\rELM327 v1.5\r\r>");
        assert_eq!(cleaned, "ELM327 v1.5");
    }

    #[test]
    fn test_multi_line_kept() {
        let cleaned = clean_response(
            &CommandCode::VEHICLE_SPEED,
            b"SEARCHING...\r41 0D 32\r41 0D 32\r\r>",
        );
        assert_eq!(cleaned, "SEARCHING...\n41 0D 32\n41 0D 32");
    }

    #[test]
    fn test_prompt_only() {
        assert_eq!(clean_response(&CommandCode::ECHO_OFF, b">"), "");
    }

    proptest! {
        #[test]
        fn prop_cleaned_has_no_framing(
            body in "[ -~\r\n\t]{0,64}",
            padding in "[ \r\n\t]{0,8}",
        ) {
            let raw = format!("{padding}{body}{padding}\r>");
            let cleaned = clean_response(&CommandCode::ENGINE_RPM, raw.as_bytes());

            prop_assert!(!cleaned.contains('\r'));
            prop_assert_eq!(cleaned.trim(), cleaned.as_str());
            prop_assert!(!cleaned.ends_with('>'));
        }
    }
}
