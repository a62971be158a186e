//! Conversion between on-disk 8-bit names and Unicode strings.
//!
//! The conversion tables themselves are out of scope: the engine only calls
//! a [`Codepage`] when it compares or generates names. [`Ascii`] is the
//! implementation used when the chain does not provide one.

/// Bidirectional conversion between DOS name bytes and Unicode.
pub trait Codepage {
    /// Decodes on-disk bytes.
    fn to_unicode(&self, raw: &[u8]) -> String;

    /// Encodes a name for the disk, or `None` if a character cannot be represented.
    fn to_dos(&self, name: &str) -> Option<Vec<u8>>;
}

/// 7-bit ASCII; bytes above 0x7F decode as U+FFFD and cannot be encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ascii;

impl Codepage for Ascii {
    fn to_unicode(&self, raw: &[u8]) -> String {
        raw.iter()
            .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
            .collect()
    }

    fn to_dos(&self, name: &str) -> Option<Vec<u8>> {
        name.chars()
            .map(|c| {
                if c.is_ascii() {
                    Some(c.to_ascii_uppercase() as u8)
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_upper_cases_on_encode() {
        assert_eq!(Ascii.to_dos("readme").unwrap(), b"README".to_vec());
        assert!(Ascii.to_dos("caf\u{e9}").is_none());
        assert_eq!(Ascii.to_unicode(b"A\x82B"), "A\u{FFFD}B");
    }
}
