//! Utility types and functions used throughout the codebase.
use std::fmt::{Debug, Formatter};

pub struct DebugStr(pub String);

impl Debug for DebugStr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Parses whitespace-separated (or contiguous) hex byte pairs. `None` on
/// an odd digit count or any character that is not a hex digit.
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()?;
    if digits.len() % 2 != 0 {
        return None;
    }
    Some(digits.chunks_exact(2).map(|pair| pair[0] << 4 | pair[1]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_alignment() {
        assert_eq!(parse_hex("02 03 58 2a"), Some(vec![0x02, 0x03, 0x58, 0x2a]));
        assert_eq!(parse_hex("0203"), Some(vec![2, 3]));
        assert_eq!(parse_hex("123"), None);
        assert_eq!(parse_hex("FF 0a"), Some(vec![0xff, 0x0a]));
        assert_eq!(align_up(12, 8), 16);
        assert_eq!(align_up(16, 8), 16);
    }

    #[test]
    fn non_hex_characters_are_rejected() {
        assert_eq!(parse_hex("aé1"), None);
        assert_eq!(parse_hex("éa"), None);
        assert_eq!(parse_hex("2g"), None);
    }
}
