/// Outcome of inspecting one line read from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Exactly `digits` ASCII digits; carries the parsed value.
    Number(u64),
    /// The configured shutdown command.
    Terminate,
    /// Anything else. The connection that sent it gets dropped.
    Invalid,
}

/// Classifies `text` against the required digit width and shutdown sentinel.
///
/// Whitespace is not trimmed: `" 00000042"` and `"000000042 "` are invalid.
pub fn classify(text: &str, digits: u32, terminate_text: &str) -> Classification {
    let bytes = text.as_bytes();
    if bytes.len() == digits as usize && bytes.iter().all(u8::is_ascii_digit) {
        let value = bytes
            .iter()
            .fold(0u64, |acc, b| acc * 10 + u64::from(b - b'0'));
        return Classification::Number(value);
    }
    if text == terminate_text {
        return Classification::Terminate;
    }
    Classification::Invalid
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOP: &str = "terminate";

    #[test]
    fn nine_digits_parse_to_their_value() {
        assert_eq!(classify("000000000", 9, STOP), Classification::Number(0));
        assert_eq!(classify("000000042", 9, STOP), Classification::Number(42));
        assert_eq!(classify("123456789", 9, STOP), Classification::Number(123_456_789));
        assert_eq!(classify("999999999", 9, STOP), Classification::Number(999_999_999));
    }

    #[test]
    fn wrong_length_is_invalid() {
        for text in ["", "1", "12345678", "1234567890", "0000000001"] {
            assert_eq!(classify(text, 9, STOP), Classification::Invalid, "{:?}", text);
        }
    }

    #[test]
    fn non_digits_are_invalid() {
        for text in ["abcdefghi", "12345678a", "-12345678", "+12345678", "1234 5678", "12345678\r"] {
            assert_eq!(classify(text, 9, STOP), Classification::Invalid, "{:?}", text);
        }
    }

    #[test]
    fn surrounding_whitespace_is_invalid() {
        assert_eq!(classify(" 123456789", 9, STOP), Classification::Invalid);
        assert_eq!(classify("123456789 ", 9, STOP), Classification::Invalid);
    }

    #[test]
    fn unicode_digits_are_invalid() {
        // nine Arabic-Indic digits: right char count, wrong byte length and class
        assert_eq!(classify("٠١٢٣٤٥٦٧٨", 9, STOP), Classification::Invalid);
    }

    #[test]
    fn terminate_uses_the_configured_sentinel() {
        assert_eq!(classify("terminate", 9, STOP), Classification::Terminate);
        assert_eq!(classify("teminate", 9, STOP), Classification::Invalid);
        assert_eq!(classify("teminate", 9, "teminate"), Classification::Terminate);
        assert_eq!(classify("TERMINATE", 9, STOP), Classification::Invalid);
    }

    #[test]
    fn digit_width_follows_configuration() {
        assert_eq!(classify("0042", 4, STOP), Classification::Number(42));
        assert_eq!(classify("000000042", 4, STOP), Classification::Invalid);
    }
}
