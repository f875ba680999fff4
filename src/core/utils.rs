//! Multi-string codec and hex helpers.

use anyhow::{bail, Context, Result};

/// Code unit of a multi-string buffer: bytes on pcsc-lite, UTF-16 on winscard.
pub trait CodeUnit: Copy + Default + PartialEq {
    fn decode(units: &[Self]) -> String;
    fn encode(s: &str) -> Vec<Self>;
}

impl CodeUnit for u8 {
    fn decode(units: &[u8]) -> String {
        String::from_utf8_lossy(units).into_owned()
    }

    fn encode(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }
}

/// Layout of winscard's wide-character (`W`) entry points, such as
/// `SCardListReadersW`. The bindings in this crate call the narrow entry
/// points, so only buffers handed over in that layout need it.
impl CodeUnit for u16 {
    fn decode(units: &[u16]) -> String {
        String::from_utf16_lossy(units)
    }

    fn encode(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }
}

/// Splits a NUL-separated, double-NUL-terminated buffer into its strings.
///
/// Decoding stops at the first empty segment. A buffer holding a single
/// NUL (or nothing at all) yields no strings. Order is preserved.
pub fn decode_multi_string<T: CodeUnit>(data: &[T]) -> Vec<String> {
    let nul = T::default();
    let mut strings = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let end = rest.iter().position(|u| *u == nul).unwrap_or(rest.len());
        if end == 0 {
            break;
        }
        strings.push(T::decode(&rest[..end]));
        rest = rest.get(end + 1..).unwrap_or(&[]);
    }

    strings
}

/// Packs strings into a multi-string buffer. Empty strings are skipped
/// because they would terminate the sequence early.
pub fn encode_multi_string<T: CodeUnit, S: AsRef<str>>(strings: &[S]) -> Vec<T> {
    let mut out = Vec::new();
    for s in strings.iter().map(AsRef::as_ref).filter(|s| !s.is_empty()) {
        out.extend(T::encode(s));
        out.push(T::default());
    }
    out.push(T::default());
    out
}

/// Parse a hex string into bytes.
///
/// Accepts "0102030A", "01 02 03 0A", "0x01,0x02" and "01:02:03:0A".
pub fn parse_hex(hex_str: &str) -> Result<Vec<u8>> {
    let cleaned: String = hex_str
        .trim()
        .replace("0x", "")
        .replace("0X", "")
        .chars()
        .filter(|c| !matches!(c, ' ' | ',' | ':' | '-' | '\t' | '\n' | '\r'))
        .collect();

    if cleaned.len() % 2 != 0 {
        bail!("Hex string must have even number of characters: '{hex_str}'");
    }

    hex::decode(&cleaned).with_context(|| format!("Invalid hex string: '{hex_str}'"))
}

/// Format bytes as a hex string with spaces
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes as ASCII, replacing non-printable chars with '.'
pub fn format_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Parse a 32-bit code given in decimal or as hex with a 0x prefix.
pub fn parse_u32(code_str: &str) -> Result<u32> {
    let cleaned = code_str.trim();

    match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(digits) => u32::from_str_radix(digits, 16)
            .with_context(|| format!("Invalid hex value: '{code_str}'")),
        None => cleaned
            .parse::<u32>()
            .with_context(|| format!("Invalid decimal value: '{code_str}'")),
    }
}
