//! UTF-16 offset arithmetic over Rust strings.
//!
//! Editors address text in UTF-16 code units, so every length and offset in an
//! operation is counted that way. Strings stay UTF-8 internally and are only
//! walked when an offset has to be turned into a byte index.

use crate::error::TransformError;

/// Length of `text` in UTF-16 code units
pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Split `text` after `offset` UTF-16 code units.
///
/// Fails if `offset` lies past the end of the text or between the two halves
/// of a surrogate pair.
pub fn split_utf16(text: &str, offset: usize) -> Result<(&str, &str), TransformError> {
    let mut units = 0;
    for (byte_index, ch) in text.char_indices() {
        if units == offset {
            return Ok(text.split_at(byte_index));
        }
        units += ch.len_utf16();
        if units > offset {
            return Err(TransformError::InvalidOffset { offset });
        }
    }

    if units == offset {
        Ok((text, ""))
    } else {
        Err(TransformError::LengthMismatch {
            expected: offset,
            actual: units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", 0)]
    #[case::ascii("hello", 5)]
    #[case::two_byte("héllo", 5)]
    #[case::astral("a😀b", 4)]
    #[case::cjk("漢字", 2)]
    fn test_utf16_len(#[case] text: &str, #[case] expected: usize) {
        assert_eq!(utf16_len(text), expected);
    }

    #[test]
    fn test_split_on_boundaries() {
        assert_eq!(split_utf16("a😀b", 0).unwrap(), ("", "a😀b"));
        assert_eq!(split_utf16("a😀b", 1).unwrap(), ("a", "😀b"));
        assert_eq!(split_utf16("a😀b", 3).unwrap(), ("a😀", "b"));
        assert_eq!(split_utf16("a😀b", 4).unwrap(), ("a😀b", ""));
    }

    #[test]
    fn test_split_inside_surrogate_pair() {
        assert_eq!(
            split_utf16("a😀b", 2),
            Err(TransformError::InvalidOffset { offset: 2 })
        );
    }

    #[test]
    fn test_split_past_end() {
        assert_eq!(
            split_utf16("ab", 3),
            Err(TransformError::LengthMismatch {
                expected: 3,
                actual: 2
            })
        );
    }
}
