//! Separator-tolerant hex codec used to stage machine code.
//!
//! Any character that is not a hex digit separates groups. Digits are
//! consumed two at a time, one byte per pair, so `"B82A"`, `"B8 2A"` and
//! `"B8:2A"` all decode to `[0xB8, 0x2A]`.

use crate::error::{Error, Result, fail};

const DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Decode hex text into bytes.
///
/// A lone digit (a digit followed by a separator or end of input) is an
/// error. Input without any hex digit yields an empty buffer.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    let mut i = 0;

    while i < bytes.len() {
        let Some(hi) = nibble(bytes[i]) else {
            i += 1;
            continue;
        };

        let lo = match bytes.get(i + 1).copied() {
            Some(c) => match nibble(c) {
                Some(lo) => lo,
                None => {
                    return fail(Error::HexParse {
                        offset: i,
                        message: format!("odd hex group before {:?}", c as char),
                    });
                }
            },
            None => {
                return fail(Error::HexParse {
                    offset: i,
                    message: "odd hex group at end of input".to_string(),
                });
            }
        };

        out.push((hi << 4) | lo);
        i += 2;
    }

    Ok(out)
}

/// Encode bytes as uppercase pairs, each followed by a single space.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0F) as usize] as char);
        out.push(' ');
    }
    out
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::last_error;

    #[test]
    fn decode_spaced_pairs() {
        let bytes = decode("B8 2A 00 00 00 C3").unwrap();
        assert_eq!(bytes, vec![0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);
    }

    #[test]
    fn decode_accepts_runs_and_mixed_separators() {
        assert_eq!(decode("b82a").unwrap(), vec![0xB8, 0x2A]);
        assert_eq!(decode("B8,2a;\n\t00").unwrap(), vec![0xB8, 0x2A, 0x00]);
        assert_eq!(decode("  de:ad:BE:ef  ").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn decode_without_digits_is_empty() {
        assert!(decode("").unwrap().is_empty());
        assert!(decode("  -- ;; ").unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_odd_group() {
        let err = decode("B8 2 00").unwrap_err();
        match err {
            Error::HexParse { offset, .. } => assert_eq!(offset, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(last_error().unwrap().starts_with("hex parse failed"));
    }

    #[test]
    fn decode_rejects_trailing_nibble() {
        assert!(matches!(decode("ABC"), Err(Error::HexParse { offset: 2, .. })));
    }

    #[test]
    fn encode_matches_dump_format() {
        assert_eq!(encode(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]), "B8 2A 00 00 00 C3 ");
        assert_eq!(encode(&[]), "");
    }

    #[test]
    fn roundtrip_all_byte_values() {
        let all: Vec<u8> = (0..=255).collect();
        assert_eq!(decode(&encode(&all)).unwrap(), all);
    }
}
