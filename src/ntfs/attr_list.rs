//! $ATTRIBUTE_LIST entries
//!
//! When the attributes of a file do not fit in its base record, the base
//! record carries an attribute list naming every attribute extent and the
//! record that holds it.

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::field::{self, round_up};
use crate::ntfs::structs::{AttributeType, FileReference};
use serde::Serialize;

const ENTRY_HEADER_SIZE: usize = 0x1A;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeListEntry {
    pub attr_type: AttributeType,
    pub name: Option<String>,
    pub start_vcn: u64,
    /// Record holding the extent
    pub record: FileReference,
    pub attribute_id: u16,
}

impl AttributeListEntry {
    pub fn new(
        attr_type: AttributeType,
        name: Option<&str>,
        start_vcn: u64,
        record: FileReference,
        attribute_id: u16,
    ) -> Self {
        Self {
            attr_type,
            name: name.map(str::to_string),
            start_vcn,
            record,
            attribute_id,
        }
    }

    /// Parse one entry, returning it with its record length
    pub fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize)> {
        let kind = StructureKind::AttributeList;
        let type_code = field::u32_at(buf, offset, kind)?;
        let length = field::u16_at(buf, offset + 0x04, kind)? as usize;
        if length < ENTRY_HEADER_SIZE {
            return Err(MftError::format(
                kind,
                offset + 0x04,
                format!("entry length {} is shorter than the entry header", length),
            ));
        }
        let entry = field::slice_at(buf, offset, length, kind)?;

        let name_length = field::u8_at(entry, 0x06, kind)? as usize;
        let name_offset = field::u8_at(entry, 0x07, kind)? as usize;
        let name = if name_length > 0 {
            if name_offset + name_length * 2 > length {
                return Err(MftError::format(
                    kind,
                    offset + 0x06,
                    format!(
                        "name of {} units at {:#x} runs past entry length {}",
                        name_length, name_offset, length
                    ),
                ));
            }
            Some(field::utf16_at(entry, name_offset, name_length, kind)?)
        } else {
            None
        };

        Ok((
            Self {
                attr_type: AttributeType::from_u32(type_code),
                name,
                start_vcn: field::u64_at(entry, 0x08, kind)?,
                record: FileReference(field::u64_at(entry, 0x10, kind)?),
                attribute_id: field::u16_at(entry, 0x18, kind)?,
            },
            length,
        ))
    }

    pub fn size(&self) -> usize {
        let units = self.name.as_deref().map_or(0, |n| n.encode_utf16().count());
        round_up(ENTRY_HEADER_SIZE + units * 2, 8)
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let length = self.size();
        if offset + length > buf.len() {
            return Err(MftError::format(
                StructureKind::AttributeList,
                offset,
                format!("{} byte entry does not fit in {}-byte buffer", length, buf.len()),
            ));
        }
        let entry = &mut buf[offset..offset + length];
        entry.fill(0);
        field::put_u32(entry, 0x00, self.attr_type.code());
        field::put_u16(entry, 0x04, length as u16);
        entry[0x07] = ENTRY_HEADER_SIZE as u8;
        field::put_u64(entry, 0x08, self.start_vcn);
        field::put_u64(entry, 0x10, self.record.0);
        field::put_u16(entry, 0x18, self.attribute_id);
        if let Some(name) = &self.name {
            entry[0x06] = field::put_utf16(entry, ENTRY_HEADER_SIZE, name) as u8;
        }
        Ok(length)
    }
}

/// Parse a whole attribute list value
pub fn parse_attribute_list(data: &[u8]) -> Result<Vec<AttributeListEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (entry, length) = AttributeListEntry::parse(data, offset)?;
        entries.push(entry);
        offset += length;
    }
    Ok(entries)
}

pub fn encode_attribute_list(entries: &[AttributeListEntry]) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; entries.iter().map(AttributeListEntry::size).sum()];
    let mut offset = 0;
    for entry in entries {
        offset += entry.write(&mut buf, offset)?;
    }
    Ok(buf)
}
