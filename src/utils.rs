//! Bit manipulation and link naming helpers.
//!
//! # Example
//!
//! ```
//! use fit_ipbus::utils::{extract_field, get_on_bits, link_name, present_links};
//!
//! let word: u32 = 0b1010_0101;
//! assert_eq!(extract_field(word, 4, 4), 0b1010);
//! assert_eq!(get_on_bits(word), vec![0, 2, 5, 7]);
//!
//! assert_eq!(link_name(3).as_deref(), Some("A3"));
//! assert_eq!(link_name(12).as_deref(), Some("C2"));
//! assert_eq!(present_links(0b1_0000_0000_0001), vec!["A0", "C2"]);
//! ```

/// Number of links on one side of the board.
pub const LINKS_PER_SIDE: u8 = 10;

/// Total number of links.
pub const LINK_COUNT: u8 = 2 * LINKS_PER_SIDE;

/// Gets a single bit from a word.
#[inline]
pub fn get_bit(value: u32, bit: u8) -> bool {
    bit < 32 && (value & (1 << bit)) != 0
}

/// Returns a mask of the `width` lowest bits.
///
/// ```
/// use fit_ipbus::utils::field_mask;
///
/// assert_eq!(field_mask(4), 0xF);
/// assert_eq!(field_mask(32), u32::MAX);
/// assert_eq!(field_mask(0), 0);
/// ```
#[inline]
pub fn field_mask(width: u8) -> u32 {
    match width {
        0 => 0,
        w if w >= 32 => u32::MAX,
        w => (1u32 << w) - 1,
    }
}

/// Extracts `width` bits starting at `shift`.
#[inline]
pub fn extract_field(value: u32, shift: u8, width: u8) -> u32 {
    if shift >= 32 {
        return 0;
    }
    (value >> shift) & field_mask(width)
}

/// Returns the indices of all bits that are ON, lowest first.
pub fn get_on_bits(value: u32) -> Vec<u8> {
    (0..32).filter(|&i| get_bit(value, i)).collect()
}

/// Formats a word as `0x` followed by 8 hex digits.
///
/// ```
/// use fit_ipbus::utils::format_hex;
///
/// assert_eq!(format_hex(0xBEEF), "0x0000BEEF");
/// ```
pub fn format_hex(value: u32) -> String {
    format!("0x{:08X}", value)
}

/// Name of link `index`: `A0`..`A9` for 0-9, `C0`..`C9` for 10-19.
pub fn link_name(index: u8) -> Option<String> {
    if index >= LINK_COUNT {
        return None;
    }
    let side = if index < LINKS_PER_SIDE { 'A' } else { 'C' };
    Some(format!("{}{}", side, index % LINKS_PER_SIDE))
}

/// Parses a link name produced by [`link_name`].
///
/// ```
/// use fit_ipbus::utils::parse_link_name;
///
/// assert_eq!(parse_link_name("A0"), Some(0));
/// assert_eq!(parse_link_name("C9"), Some(19));
/// assert_eq!(parse_link_name("B1"), None);
/// ```
pub fn parse_link_name(name: &str) -> Option<u8> {
    let mut chars = name.chars();
    let side = chars.next()?;
    let digit = chars.next()?.to_digit(10)? as u8;
    if chars.next().is_some() {
        return None;
    }
    match side {
        'A' => Some(digit),
        'C' => Some(digit + LINKS_PER_SIDE),
        _ => None,
    }
}

/// Names of the links present in `mask`, A side first.
pub fn present_links(mask: u32) -> Vec<String> {
    get_on_bits(mask)
        .into_iter()
        .filter_map(link_name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_bit() {
        let value: u32 = 0b0101;
        assert!(get_bit(value, 0));
        assert!(!get_bit(value, 1));
        assert!(get_bit(value, 2));
        assert!(get_bit(0x8000_0000, 31));
        assert!(!get_bit(u32::MAX, 32));
    }

    #[test]
    fn test_extract_field() {
        let value: u32 = 0b1111_0000_1010_0101;
        assert_eq!(extract_field(value, 0, 4), 0b0101);
        assert_eq!(extract_field(value, 4, 4), 0b1010);
        assert_eq!(extract_field(value, 12, 4), 0b1111);
        assert_eq!(extract_field(value, 32, 4), 0);
    }

    #[test]
    fn test_get_on_bits() {
        assert_eq!(get_on_bits(0b0010_0101), vec![0, 2, 5]);
        assert!(get_on_bits(0).is_empty());
        assert_eq!(get_on_bits(u32::MAX).len(), 32);
    }

    #[test]
    fn test_link_names_roundtrip() {
        for index in 0..LINK_COUNT {
            let name = link_name(index).unwrap();
            assert_eq!(parse_link_name(&name), Some(index));
        }
        assert_eq!(link_name(20), None);
    }

    #[test]
    fn test_parse_link_name_rejects() {
        assert_eq!(parse_link_name(""), None);
        assert_eq!(parse_link_name("A"), None);
        assert_eq!(parse_link_name("A10"), None);
        assert_eq!(parse_link_name("a1"), None);
    }

    #[test]
    fn test_present_links_ignores_high_bits() {
        let mask = (1 << 25) | (1 << 19) | 1;
        assert_eq!(present_links(mask), vec!["A0", "C9"]);
    }
}
