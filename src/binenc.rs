//! Little-endian field access and fixed-size C string fields, shared by the message codecs.

use anyhow::bail;


pub fn check_len(data: &[u8], required: usize) -> anyhow::Result<()> {
    if data.len() < required {
        bail!("unexpected end of data: need {} bytes, got {}", required, data.len());
    }
    Ok(())
}

pub fn check_capacity(buf: &[u8], required: usize) -> anyhow::Result<()> {
    if buf.len() < required {
        bail!("short buffer: need {} bytes, got {}", required, buf.len());
    }
    Ok(())
}

pub fn get_u16(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[0], data[1]])
}

pub fn get_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

pub fn put_u16(buf: &mut [u8], v: u16) {
    buf[..2].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut [u8], v: u32) {
    buf[..4].copy_from_slice(&v.to_le_bytes());
}

/// Reads a zero-terminated string from a fixed-size field. Without terminator, the whole field
///  is the string.
pub fn cstring(field: &[u8]) -> String {
    let end = field.iter()
        .position(|&b| b == 0)
        .unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// The part of `s` that survives as a C string of at most `max` bytes: everything before the
///  first NUL, cut back to a char boundary.
pub fn cstr_prefix(s: &str, max: usize) -> &str {
    let s = s.find('\0').map_or(s, |i| &s[..i]);
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Writes `s` into a fixed-size field, truncating so that a terminating zero always fits, and
///  zero-filling the rest.
pub fn put_cstring(field: &mut [u8], s: &str) {
    field.fill(0);
    if field.is_empty() {
        return;
    }
    let s = cstr_prefix(s, field.len() - 1);
    field[..s.len()].copy_from_slice(s.as_bytes());
}

/// Reads a zero-terminated UTF-16LE string from a fixed-size field.
pub fn cstring16(field: &[u8]) -> String {
    let units: Vec<u16> = field.chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// UTF-16LE counterpart of [put_cstring]. Truncation happens on whole code units.
pub fn put_cstring16(field: &mut [u8], s: &str) {
    field.fill(0);
    let max_units = (field.len() / 2).saturating_sub(1);
    for (i, unit) in s.encode_utf16().take(max_units).enumerate() {
        field[2*i..2*i + 2].copy_from_slice(&unit.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty(b"", "")]
    #[case::terminated(b"abc\0\0", "abc")]
    #[case::unterminated(b"abcd", "abcd")]
    #[case::garbage_after_zero(b"ab\0cd", "ab")]
    fn test_cstring(#[case] field: &[u8], #[case] expected: &str) {
        assert_eq!(cstring(field), expected);
    }

    #[rstest]
    #[case::fits("abc", 5, b"abc\0\0")]
    #[case::exact("abcd", 5, b"abcd\0")]
    #[case::truncated("abcdef", 5, b"abcd\0")]
    #[case::empty("", 3, b"\0\0\0")]
    #[case::interior_zero("ab\0cd", 5, b"ab\0\0\0")]
    #[case::split_char("a\u{e9}", 3, b"a\0\0")]
    fn test_put_cstring(#[case] s: &str, #[case] len: usize, #[case] expected: &[u8]) {
        let mut field = vec![0xffu8; len];
        put_cstring(&mut field, s);
        assert_eq!(field.as_slice(), expected);
    }

    #[rstest]
    #[case::interior_zero("ab\0cd", 10, "ab")]
    #[case::char_boundary("\u{0418}\u{0433}", 3, "\u{0418}")]
    #[case::fits("\u{0418}\u{0433}", 4, "\u{0418}\u{0433}")]
    fn test_cstr_prefix(#[case] s: &str, #[case] max: usize, #[case] expected: &str) {
        assert_eq!(cstr_prefix(s, max), expected);

        let mut field = vec![0xffu8; max + 1];
        put_cstring(&mut field, s);
        assert_eq!(cstring(&field), expected);
    }

    #[rstest]
    #[case(0, 2, true)]
    #[case(2, 2, true)]
    #[case(3, 2, false)]
    fn test_check_len(#[case] required: usize, #[case] available: usize, #[case] ok: bool) {
        let data = vec![0u8; available];
        assert_eq!(check_len(&data, required).is_ok(), ok);
    }

    #[rstest]
    #[case::ascii("pass", 10)]
    #[case::cyrillic("Игрок", 12)]
    #[case::empty("", 4)]
    fn test_cstring16(#[case] s: &str, #[case] len: usize) {
        let mut field = vec![0xffu8; len];
        put_cstring16(&mut field, s);
        assert_eq!(cstring16(&field), s);
    }

    #[test]
    fn test_cstring16_truncated() {
        let mut field = [0u8; 6];
        put_cstring16(&mut field, "abcd");
        assert_eq!(field, [b'a', 0, b'b', 0, 0, 0]);
        assert_eq!(cstring16(&field), "ab");
    }

    #[test]
    fn test_le_fields() {
        let mut buf = [0u8; 6];
        put_u16(&mut buf, 0x1234);
        put_u32(&mut buf[2..], 0xdeadbeef);
        assert_eq!(buf, [0x34, 0x12, 0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(get_u16(&buf), 0x1234);
        assert_eq!(get_u32(&buf[2..]), 0xdeadbeef);
    }
}
