//! Hex listings.
//!
//! Fragments are written as whitespace-separated hex bytes. An `&` in front
//! of a byte marks the entry point, e.g. `90&90 E9 00 00 00 00`.

use std::fmt::Write;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListingError {
    #[error("invalid hex digit {ch:?} at column {column}")]
    InvalidDigit { column: usize, ch: char },
    #[error("dangling hex digit at column {column}")]
    OddDigit { column: usize },
    #[error("entry marked twice (column {column})")]
    DuplicateEntry { column: usize },
}

/// Parsed hex listing: the bytes and the marked entry offset (0 when unmarked).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexListing {
    pub bytes: Vec<u8>,
    pub entry: usize,
}

/// Parse a hex listing. Byte pairs may be run together (`9090`) or separated by
/// whitespace, commas or an entry marker.
pub fn parse_hex(text: &str) -> Result<HexListing, ListingError> {
    let mut listing = HexListing::default();
    let mut marked = false;
    let mut high: Option<(usize, u8)> = None;

    for (column, ch) in text.chars().enumerate() {
        if let Some(nibble) = ch.to_digit(16) {
            match high.take() {
                Some((_, h)) => listing.bytes.push((h << 4) | nibble as u8),
                None => high = Some((column, nibble as u8)),
            }
            continue;
        }
        if let Some((column, _)) = high {
            return Err(ListingError::OddDigit { column });
        }
        match ch {
            '&' => {
                if marked {
                    return Err(ListingError::DuplicateEntry { column });
                }
                marked = true;
                listing.entry = listing.bytes.len();
            }
            ',' => {}
            c if c.is_whitespace() => {}
            c => return Err(ListingError::InvalidDigit { column, ch: c }),
        }
    }
    if let Some((column, _)) = high {
        return Err(ListingError::OddDigit { column });
    }
    Ok(listing)
}

/// Classic 16-bytes-per-line dump, each line prefixed with its address.
pub fn hexdump(bytes: &[u8], addr: u32) -> String {
    let mut out = String::new();
    for (i, line) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", addr.wrapping_add((i * 16) as u32));
        for b in line {
            let _ = write!(out, " {:02x}", b);
        }
        out.push('\n');
    }
    out
}

/// Bytes as a single line of space-separated pairs.
pub fn hex_line(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let l = parse_hex(" E9 00 00 00 00 90 90").unwrap();
        assert_eq!(l.bytes, vec![0xE9, 0, 0, 0, 0, 0x90, 0x90]);
        assert_eq!(l.entry, 0);
    }

    #[test]
    fn test_parse_entry_marker() {
        let l = parse_hex(" 90 90&E9 00 00 00 00 90 90").unwrap();
        assert_eq!(l.entry, 2);
        assert_eq!(l.bytes.len(), 9);

        let l = parse_hex("ff a4 d8 44 33 22 11").unwrap();
        assert_eq!(l.bytes[1], 0xA4);
    }

    #[test]
    fn test_parse_packed() {
        assert_eq!(parse_hex("70fe").unwrap().bytes, vec![0x70, 0xFE]);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_hex("9 0").unwrap_err(),
            ListingError::OddDigit { column: 0 }
        );
        assert_eq!(
            parse_hex("90 9").unwrap_err(),
            ListingError::OddDigit { column: 3 }
        );
        assert_eq!(
            parse_hex("90 zz").unwrap_err(),
            ListingError::InvalidDigit { column: 3, ch: 'z' }
        );
        assert_eq!(
            parse_hex("&90&90").unwrap_err(),
            ListingError::DuplicateEntry { column: 3 }
        );
    }

    #[test]
    fn test_hexdump() {
        let bytes: Vec<u8> = (0..18).collect();
        let dump = hexdump(&bytes, 0x1000);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00001000  00 01 02"));
        assert_eq!(lines[1], "00001010  10 11");
    }

    #[test]
    fn test_hex_line() {
        assert_eq!(hex_line(&[0xEB, 0x0F]), "EB 0F");
    }
}
