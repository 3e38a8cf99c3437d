//! Bounds-checked little-endian field access
//!
//! Thin wrappers over `byteorder` that turn a short buffer into a format
//! error tagged with the structure being decoded.

use crate::error::{MftError, Result, StructureKind};
use byteorder::{ByteOrder, LittleEndian};

#[inline]
pub fn slice_at(buf: &[u8], offset: usize, len: usize, kind: StructureKind) -> Result<&[u8]> {
    match offset.checked_add(len) {
        Some(end) if end <= buf.len() => Ok(&buf[offset..end]),
        _ => Err(MftError::format(
            kind,
            offset,
            format!(
                "field of {} bytes runs past end of {}-byte buffer",
                len,
                buf.len()
            ),
        )),
    }
}

#[inline]
pub fn u8_at(buf: &[u8], offset: usize, kind: StructureKind) -> Result<u8> {
    Ok(slice_at(buf, offset, 1, kind)?[0])
}

#[inline]
pub fn u16_at(buf: &[u8], offset: usize, kind: StructureKind) -> Result<u16> {
    Ok(LittleEndian::read_u16(slice_at(buf, offset, 2, kind)?))
}

#[inline]
pub fn u32_at(buf: &[u8], offset: usize, kind: StructureKind) -> Result<u32> {
    Ok(LittleEndian::read_u32(slice_at(buf, offset, 4, kind)?))
}

#[inline]
pub fn u64_at(buf: &[u8], offset: usize, kind: StructureKind) -> Result<u64> {
    Ok(LittleEndian::read_u64(slice_at(buf, offset, 8, kind)?))
}

/// Decode `chars` UTF-16LE code units starting at `offset`
pub fn utf16_at(buf: &[u8], offset: usize, chars: usize, kind: StructureKind) -> Result<String> {
    let units = utf16_units_at(buf, offset, chars, kind)?;
    Ok(String::from_utf16_lossy(&units))
}

pub fn utf16_units_at(
    buf: &[u8],
    offset: usize,
    chars: usize,
    kind: StructureKind,
) -> Result<Vec<u16>> {
    let bytes = slice_at(buf, offset, chars * 2, kind)?;
    Ok(bytes.chunks_exact(2).map(LittleEndian::read_u16).collect())
}

pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    LittleEndian::write_u16(&mut buf[offset..offset + 2], value);
}

pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut buf[offset..offset + 4], value);
}

pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    LittleEndian::write_u64(&mut buf[offset..offset + 8], value);
}

/// Encode `text` as UTF-16LE at `offset`, returning the number of code units written
pub fn put_utf16(buf: &mut [u8], offset: usize, text: &str) -> usize {
    let mut pos = offset;
    let mut count = 0;
    for unit in text.encode_utf16() {
        put_u16(buf, pos, unit);
        pos += 2;
        count += 1;
    }
    count
}

#[inline]
pub fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields() {
        let buf = [0x34, 0x12, 0x78, 0x56, 0x00, 0x00, 0x00, 0x00, 0xFF];
        assert_eq!(u16_at(&buf, 0, StructureKind::Attribute).unwrap(), 0x1234);
        assert_eq!(u32_at(&buf, 0, StructureKind::Attribute).unwrap(), 0x5678_1234);
        assert_eq!(u64_at(&buf, 0, StructureKind::Attribute).unwrap(), 0x5678_1234);
        assert_eq!(u8_at(&buf, 8, StructureKind::Attribute).unwrap(), 0xFF);
    }

    #[test]
    fn short_buffer_is_a_format_error() {
        let buf = [0u8; 3];
        let err = u32_at(&buf, 0, StructureKind::FileRecord).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("MFT record"));

        assert!(slice_at(&buf, usize::MAX, 2, StructureKind::FileRecord).is_err());
    }

    #[test]
    fn utf16_round_trip() {
        let mut buf = [0u8; 16];
        let n = put_utf16(&mut buf, 2, "$I30");
        assert_eq!(n, 4);
        assert_eq!(utf16_at(&buf, 2, 4, StructureKind::FileName).unwrap(), "$I30");
    }

    #[test]
    fn rounds_to_alignment() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(0x48, 8), 0x48);
        assert_eq!(round_up(0x49, 8), 0x50);
    }
}
