//! VKP patch text parser and chunk coalescer.
//!
//! VKP (`.vkp`) is the textual binary-patch format used across the Siemens
//! modding community: hex addresses, pragma directives, signed offsets and a
//! handful of data encodings on one line each. See
//! <http://www.vi-soft.com.ua/siemens/vkp_file_format.txt>.

use crate::error::{Error, ParseError, ParseErrorKind, Result};

/// One contiguous run of patch bytes.
///
/// `base_addr` is the absolute address as written in the patch text (e.g.
/// `A0000000:` parses to `0xA0000000`), already including whatever flash
/// base address the target device uses. [`crate::patch_engine`] looks it
/// up against a `BlockMap` directly, with no further offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub base_addr: u64,
    pub old_data: Vec<u8>,
    pub new_data: Vec<u8>,
}

impl Chunk {
    pub fn end_addr(&self) -> u64 {
        self.base_addr + self.new_data.len() as u64
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ChunkSettings {
    old_equal_ff: bool,
    addr_offset: i64,
}

/// Parses VKP source text into an ordered, coalesced list of [`Chunk`]s.
pub fn parse(text: &str) -> Result<Vec<Chunk>> {
    let text = remove_multiline_comments(text);

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current_addr: u64 = 0;
    let mut settings = ChunkSettings::default();

    for (line_no, raw_line) in text.lines().enumerate() {
        let line_no = line_no + 1;

        let line = match raw_line.find(';') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("#pragma") {
            parse_pragma(&mut settings, line).map_err(|kind| {
                Error::Parse(ParseError {
                    line: line_no,
                    fragment: line.to_string(),
                    kind,
                })
            })?;
            continue;
        }

        if line.starts_with('+') || line.starts_with('-') {
            parse_addr_offset(&mut settings, line).map_err(|kind| {
                Error::Parse(ParseError {
                    line: line_no,
                    fragment: line.to_string(),
                    kind,
                })
            })?;
            continue;
        }

        let to_err = |kind: ParseErrorKind| {
            Error::Parse(ParseError {
                line: line_no,
                fragment: line.to_string(),
                kind,
            })
        };

        let colon = line
            .find(':')
            .ok_or_else(|| to_err(ParseErrorKind::MissingAddrSeparator))?;
        let addr_hex = line[..colon].trim().trim_start_matches("0x");
        let addr = i64::from_str_radix(addr_hex, 16)
            .map_err(|_| to_err(ParseErrorKind::InvalidAddress(addr_hex.to_string())))?;
        let addr = addr.wrapping_add(settings.addr_offset);

        let data_info = line[colon + 1..].trim();
        let fields: Vec<&str> = data_info.split(' ').collect();

        let (old_data, new_data_str) = if !settings.old_equal_ff {
            if fields.len() != 2 {
                return Err(to_err(ParseErrorKind::ExpectedTwoDataFields(fields.len())));
            }
            let old = parse_data_field(fields[0]).map_err(to_err)?;
            (old, fields[1])
        } else {
            if fields.len() != 1 {
                return Err(to_err(ParseErrorKind::ExpectedOneDataField(fields.len())));
            }
            (Vec::new(), fields[0])
        };

        let new_data = parse_data_field(new_data_str).map_err(to_err)?;

        let old_data = if settings.old_equal_ff {
            vec![0xFFu8; new_data.len()]
        } else {
            old_data
        };

        if old_data.len() < new_data.len() {
            return Err(to_err(ParseErrorKind::DataLengthMismatch(
                old_data.len(),
                new_data.len(),
            )));
        }

        let addr = addr as u64;
        if current_addr == addr && !chunks.is_empty() {
            let last = chunks.last_mut().expect("checked non-empty above");
            last.old_data.extend_from_slice(&old_data);
            last.new_data.extend_from_slice(&new_data);
        } else {
            chunks.push(Chunk {
                base_addr: addr,
                old_data,
                new_data: new_data.clone(),
            });
            current_addr = addr;
        }
        current_addr += new_data.len() as u64;
    }

    Ok(chunks)
}

fn remove_multiline_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(end) => rest = &rest[start + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

fn parse_pragma(settings: &mut ChunkSettings, line: &str) -> std::result::Result<(), ParseErrorKind> {
    let pos = line.find("#pragma").ok_or(ParseErrorKind::PragmaSyntax)?;
    let body = line[pos + "#pragma".len()..].trim_start();
    let mut parts = body.splitn(2, ' ');
    let action = parts.next().ok_or(ParseErrorKind::PragmaSyntax)?;
    let name = parts.next().ok_or(ParseErrorKind::PragmaSyntax)?.trim();

    let enable = match action {
        "enable" => true,
        "disable" => false,
        _ => return Err(ParseErrorKind::PragmaSyntax),
    };

    match name {
        "old_equal_ff" => settings.old_equal_ff = enable,
        "warn_if_old_exist_on_undo" => {
            log::debug!("pragma warn_if_old_exist_on_undo -- ignoring");
        }
        other => return Err(ParseErrorKind::UnknownPragma(other.to_string())),
    }
    Ok(())
}

fn parse_addr_offset(settings: &mut ChunkSettings, line: &str) -> std::result::Result<(), ParseErrorKind> {
    let sign = line.as_bytes()[0];
    let rest = line[1..].trim_start_matches("0x");
    let value = i64::from_str_radix(rest, 16)
        .map_err(|_| ParseErrorKind::InvalidAddrOffset(line.to_string()))?;
    settings.addr_offset = if sign == b'-' { -value } else { value };
    Ok(())
}

/// Parses a comma-separated data field into its raw byte encoding.
fn parse_data_field(field: &str) -> std::result::Result<Vec<u8>, ParseErrorKind> {
    let mut out = Vec::new();
    for block in field.split(',') {
        let block = block.trim();
        let invalid = |msg: String| ParseErrorKind::InvalidDataField(block.to_string(), msg);
        if let Some(rest) = block.strip_prefix("0i") {
            out.extend(parse_decimal_num(rest)?);
        } else if let Some(quoted) = block.strip_prefix('"') {
            out.extend(parse_quoted_string(quoted).map_err(invalid)?);
        } else if let Some(hex_digits) = block.strip_prefix("0x") {
            let value = u64::from_str_radix(hex_digits, 16)
                .map_err(|e| invalid(format!("cannot convert to int: {e}")))?;
            out.extend_from_slice(&(value as u32).to_le_bytes());
        } else {
            out.extend(hex::decode(block).map_err(|e| invalid(e.to_string()))?);
        }
    }
    Ok(out)
}

/// Byte-width ladder for `0i<decimal>` literals, keyed by digit count
/// (sign excluded). Mirrors the original tool's cascading `if` chain.
fn decimal_width(digit_count: usize) -> u32 {
    let mut n = 1;
    if digit_count >= 5 {
        n = 2;
    }
    if digit_count >= 8 {
        n = 3;
    }
    if digit_count >= 10 {
        n = 4;
    }
    if digit_count >= 13 {
        n = 5;
    }
    if digit_count >= 15 {
        n = 6;
    }
    if digit_count >= 17 {
        n = 7;
    }
    if digit_count >= 20 {
        n = 8;
    }
    n
}

fn parse_decimal_num(digits: &str) -> std::result::Result<Vec<u8>, ParseErrorKind> {
    let signed = digits.starts_with('-');
    let digit_count = if signed { digits.len() - 1 } else { digits.len() };
    let value: i64 = digits.parse().map_err(|_| {
        ParseErrorKind::InvalidDataField(digits.to_string(), "not a decimal integer".to_string())
    })?;

    let n_bytes = decimal_width(digit_count);
    let required_bits = if value == 0 {
        0
    } else {
        64 - value.unsigned_abs().leading_zeros()
    };
    let required_bits = if signed { required_bits + 1 } else { required_bits };

    if required_bits > n_bytes * 8 {
        return Err(ParseErrorKind::NumberTooWide(
            digits.to_string(),
            required_bits,
            n_bytes * 8,
        ));
    }

    let bytes = value.to_le_bytes();
    Ok(bytes[..n_bytes as usize].to_vec())
}

/// Decodes a `"..."`-quoted string field (the closing quote is still
/// present in `rest`). Supports the common backslash escapes.
fn parse_quoted_string(rest: &str) -> std::result::Result<Vec<u8>, String> {
    let body = rest
        .strip_suffix('"')
        .ok_or_else(|| format!("unterminated quoted string: {rest:?}"))?;

    let mut out = Vec::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('x') => {
                let hi = chars.next().ok_or("truncated \\x escape")?;
                let lo = chars.next().ok_or("truncated \\x escape")?;
                let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16)
                    .map_err(|_| format!("invalid \\x escape \\x{hi}{lo}"))?;
                out.push(byte);
            }
            Some(other) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => return Err("dangling backslash in quoted string".to_string()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_adjacent_data_lines() {
        let chunks = parse("A0000000: AA BB\nA0000001: CC DD\n").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].base_addr, 0xA0000000);
        assert_eq!(chunks[0].old_data, vec![0xAA, 0xCC]);
        assert_eq!(chunks[0].new_data, vec![0xBB, 0xDD]);
    }

    #[test]
    fn non_adjacent_lines_produce_separate_chunks() {
        let chunks = parse("A0000000: AA BB\nA0000010: CC DD\n").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].base_addr, 0xA0000010);
    }

    #[test]
    fn old_equal_ff_pragma_synthesizes_old_data() {
        let chunks = parse("#pragma enable old_equal_ff\nA0000000: 0xDEADBEEF\n").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].old_data, vec![0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(chunks[0].new_data, vec![0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn unknown_pragma_fails() {
        let err = parse("#pragma enable frobnicate\nA0000000: AA BB\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Parse(ParseError {
                kind: ParseErrorKind::UnknownPragma(_),
                ..
            })
        ));
    }

    #[test]
    fn address_offset_applies_to_following_lines() {
        let chunks = parse("+0x10\nA0000000: AA BB\n").unwrap();
        assert_eq!(chunks[0].base_addr, 0xA0000010);
    }

    #[test]
    fn negative_address_offset() {
        let chunks = parse("-0x10\nA0000020: AA BB\n").unwrap();
        assert_eq!(chunks[0].base_addr, 0xA0000010);
    }

    #[test]
    fn decimal_literal_too_wide_fails() {
        let err = parse("A0000000: AA 0i256\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Parse(ParseError {
                kind: ParseErrorKind::NumberTooWide(..),
                ..
            })
        ));
    }

    #[test]
    fn decimal_literal_with_padding_widens_to_two_bytes() {
        let chunks = parse("A0000000: AAAA 0i00256\n").unwrap();
        assert_eq!(chunks[0].new_data, vec![0x00, 0x01]);
    }

    #[test]
    fn quoted_string_field_appends_utf8_bytes() {
        let chunks = parse("A0000000: 4142 \"AB\"\n").unwrap();
        assert_eq!(chunks[0].new_data, b"AB");
    }

    #[test]
    fn multiline_comment_is_stripped() {
        let chunks = parse("/* this\nspans lines */A0000000: AA BB\n").unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn old_shorter_than_new_fails() {
        let err = parse("A0000000: AA BBCC\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Parse(ParseError {
                kind: ParseErrorKind::DataLengthMismatch(..),
                ..
            })
        ));
    }

    #[test]
    fn missing_colon_fails() {
        let err = parse("A0000000 AA BB\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Parse(ParseError {
                kind: ParseErrorKind::MissingAddrSeparator,
                ..
            })
        ));
    }
}
