//! Attribute records
//!
//! An attribute record is either resident (value embedded in the MFT record)
//! or non-resident (value described by a run list over clusters). Large
//! non-resident attributes may be split into several extents, each covering
//! a contiguous VCN range and living in its own record.
//!
//! Common header layout:
//! - 0x00: type code (u32), 0xFFFFFFFF marks the end of the attribute list
//! - 0x04: record length (u32)
//! - 0x08: non-resident flag (u8)
//! - 0x09: name length in UTF-16 units (u8)
//! - 0x0A: name offset (u16)
//! - 0x0C: flags (u16)
//! - 0x0E: attribute id (u16)

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::context::NtfsContext;
use crate::ntfs::field::{self, round_up};
use crate::ntfs::runs::{decode_run_list, DataRun};
use crate::ntfs::stream::ContentBuffer;
use crate::ntfs::structs::{AttributeType, ATTRIBUTE_END_MARKER};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;

/// Attribute flag bits
pub mod attribute_flags {
    pub const COMPRESSED: u16 = 0x0001;
    pub const COMPRESSION_MASK: u16 = 0x00FF;
    pub const ENCRYPTED: u16 = 0x4000;
    pub const SPARSE: u16 = 0x8000;
}

const COMMON_HEADER_SIZE: usize = 0x10;
const RESIDENT_HEADER_SIZE: usize = 0x18;
const NON_RESIDENT_HEADER_SIZE: usize = 0x40;
const COMPRESSED_HEADER_SIZE: usize = 0x48;

/// Compression unit written for new compressed or sparse attributes (16 clusters)
pub const DEFAULT_COMPRESSION_UNIT_LOG2: u16 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResidentData {
    #[serde(skip)]
    pub data: Vec<u8>,
    pub indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonResidentData {
    pub start_vcn: u64,
    /// Stored as on disk; an empty attribute has `start_vcn - 1`
    pub last_vcn: u64,
    pub runs: Vec<DataRun>,
    pub compression_unit_log2: u16,
    pub allocated_size: u64,
    pub real_size: u64,
    pub initialized_size: u64,
    pub compressed_size: Option<u64>,
}

impl NonResidentData {
    /// First VCN past this extent, per the header
    pub fn end_vcn(&self) -> u64 {
        self.last_vcn.wrapping_add(1)
    }

    /// Whether `vcn` falls in `[start_vcn, last_vcn]`
    pub fn covers(&self, vcn: u64) -> bool {
        let end = self.end_vcn();
        end > self.start_vcn && vcn >= self.start_vcn && vcn < end
    }

    pub fn run_clusters(&self) -> u64 {
        self.runs.iter().map(|r| r.length).sum()
    }

    pub fn compression_unit_clusters(&self) -> u64 {
        1u64 << self.compression_unit_log2
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AttributeBody {
    Resident(ResidentData),
    NonResident(NonResidentData),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeRecord {
    pub attr_type: AttributeType,
    pub name: Option<String>,
    pub id: u16,
    pub flags: u16,
    pub body: AttributeBody,
}

impl AttributeRecord {
    pub fn new_resident(attr_type: AttributeType, name: Option<&str>, id: u16, data: Vec<u8>) -> Self {
        Self {
            attr_type,
            name: name.map(str::to_string),
            id,
            flags: 0,
            body: AttributeBody::Resident(ResidentData { data, indexed: false }),
        }
    }

    /// A non-resident extent covering exactly its runs. Sizes start at zero.
    pub fn new_non_resident(
        attr_type: AttributeType,
        name: Option<&str>,
        id: u16,
        flags: u16,
        start_vcn: u64,
        runs: Vec<DataRun>,
    ) -> Self {
        let clusters: u64 = runs.iter().map(|r| r.length).sum();
        let compressed_or_sparse = flags & (attribute_flags::COMPRESSED | attribute_flags::SPARSE) != 0;
        Self {
            attr_type,
            name: name.map(str::to_string),
            id,
            flags,
            body: AttributeBody::NonResident(NonResidentData {
                start_vcn,
                last_vcn: (start_vcn + clusters).wrapping_sub(1),
                runs,
                compression_unit_log2: if compressed_or_sparse {
                    DEFAULT_COMPRESSION_UNIT_LOG2
                } else {
                    0
                },
                allocated_size: 0,
                real_size: 0,
                initialized_size: 0,
                compressed_size: if compressed_or_sparse { Some(0) } else { None },
            }),
        }
    }

    /// Set allocated, real and initialized sizes of a non-resident record
    pub fn with_sizes(mut self, allocated: u64, real: u64, initialized: u64) -> Self {
        if let AttributeBody::NonResident(nr) = &mut self.body {
            nr.allocated_size = allocated;
            nr.real_size = real;
            nr.initialized_size = initialized;
        }
        self
    }

    /// Parse the record at `offset`.
    ///
    /// Returns `None` at the end-of-attributes marker, otherwise the record and
    /// its length in bytes.
    pub fn parse(buf: &[u8], offset: usize) -> Result<Option<(Self, usize)>> {
        let kind = StructureKind::Attribute;
        let type_code = field::u32_at(buf, offset, kind)?;
        if type_code == ATTRIBUTE_END_MARKER {
            return Ok(None);
        }

        let length = field::u32_at(buf, offset + 0x04, kind)? as usize;
        if length < COMMON_HEADER_SIZE {
            return Err(MftError::format(
                kind,
                offset,
                format!("record length {} is shorter than the attribute header", length),
            ));
        }
        let record = field::slice_at(buf, offset, length, kind)?;

        let parsed = Self::parse_record(record, type_code).map_err(|e| e.at(offset as u64))?;
        Ok(Some((parsed, length)))
    }

    fn parse_record(rec: &[u8], type_code: u32) -> Result<Self> {
        let kind = StructureKind::Attribute;
        let length = rec.len();
        let non_resident = field::u8_at(rec, 0x08, kind)? != 0;
        let name_length = field::u8_at(rec, 0x09, kind)? as usize;
        let name_offset = field::u16_at(rec, 0x0A, kind)? as usize;
        let flags = field::u16_at(rec, 0x0C, kind)?;
        let id = field::u16_at(rec, 0x0E, kind)?;

        let name = if name_length > 0 {
            if name_offset + name_length * 2 > length {
                return Err(MftError::format(
                    kind,
                    0x0A,
                    format!(
                        "name of {} units at {:#x} runs past record length {}",
                        name_length, name_offset, length
                    ),
                ));
            }
            Some(field::utf16_at(rec, name_offset, name_length, kind)?)
        } else {
            None
        };

        let body = if non_resident {
            if length < NON_RESIDENT_HEADER_SIZE {
                return Err(MftError::format(
                    kind,
                    0x04,
                    format!("non-resident record length {} is too short", length),
                ));
            }
            let runs_offset = field::u16_at(rec, 0x20, kind)? as usize;
            let compressed_size = if flags & (attribute_flags::COMPRESSED | attribute_flags::SPARSE) != 0
                && runs_offset > NON_RESIDENT_HEADER_SIZE
            {
                Some(field::u64_at(rec, 0x40, kind)?)
            } else {
                None
            };
            if runs_offset >= length {
                return Err(MftError::format(
                    kind,
                    0x20,
                    format!("run list offset {:#x} is past record length {}", runs_offset, length),
                ));
            }
            let (runs, _) = decode_run_list(rec, runs_offset)?;

            AttributeBody::NonResident(NonResidentData {
                start_vcn: field::u64_at(rec, 0x10, kind)?,
                last_vcn: field::u64_at(rec, 0x18, kind)?,
                runs,
                compression_unit_log2: field::u16_at(rec, 0x22, kind)?,
                allocated_size: field::u64_at(rec, 0x28, kind)?,
                real_size: field::u64_at(rec, 0x30, kind)?,
                initialized_size: field::u64_at(rec, 0x38, kind)?,
                compressed_size,
            })
        } else {
            if length < RESIDENT_HEADER_SIZE {
                return Err(MftError::format(
                    kind,
                    0x04,
                    format!("resident record length {} is too short", length),
                ));
            }
            let data_length = field::u32_at(rec, 0x10, kind)? as usize;
            let data_offset = field::u16_at(rec, 0x14, kind)? as usize;
            let indexed = field::u8_at(rec, 0x16, kind)? != 0;
            if data_offset + data_length > length {
                return Err(MftError::format(
                    kind,
                    0x10,
                    format!(
                        "resident value of {} bytes at {:#x} runs past record length {}",
                        data_length, data_offset, length
                    ),
                ));
            }

            AttributeBody::Resident(ResidentData {
                data: rec[data_offset..data_offset + data_length].to_vec(),
                indexed,
            })
        };

        Ok(Self {
            attr_type: AttributeType::from_u32(type_code),
            name,
            id,
            flags,
            body,
        })
    }

    fn name_units(&self) -> usize {
        self.name.as_deref().map_or(0, |n| n.encode_utf16().count())
    }

    fn non_resident_header_size(&self) -> usize {
        if self.flags & (attribute_flags::COMPRESSED | attribute_flags::SPARSE) != 0 {
            COMPRESSED_HEADER_SIZE
        } else {
            NON_RESIDENT_HEADER_SIZE
        }
    }

    /// Offset of the resident value or the run list
    fn payload_offset(&self) -> usize {
        let header = match &self.body {
            AttributeBody::Resident(_) => RESIDENT_HEADER_SIZE,
            AttributeBody::NonResident(_) => self.non_resident_header_size(),
        };
        round_up(header + self.name_units() * 2, 8)
    }

    /// Serialized length in bytes
    pub fn size(&self) -> usize {
        let payload = match &self.body {
            AttributeBody::Resident(r) => r.data.len(),
            AttributeBody::NonResident(nr) => nr.runs.iter().map(DataRun::encoded_size).sum::<usize>() + 1,
        };
        round_up(self.payload_offset() + payload, 8)
    }

    /// Serialize at `offset`, returning the bytes written
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let length = self.size();
        if offset + length > buf.len() {
            return Err(MftError::format(
                StructureKind::Attribute,
                offset,
                format!("{} byte record does not fit in {}-byte buffer", length, buf.len()),
            ));
        }

        let rec = &mut buf[offset..offset + length];
        rec.fill(0);
        let payload_offset = self.payload_offset();
        let name_offset = match &self.body {
            AttributeBody::Resident(_) => RESIDENT_HEADER_SIZE,
            AttributeBody::NonResident(_) => self.non_resident_header_size(),
        };

        field::put_u32(rec, 0x00, self.attr_type.code());
        field::put_u32(rec, 0x04, length as u32);
        rec[0x08] = u8::from(!self.is_resident());
        rec[0x09] = self.name_units() as u8;
        field::put_u16(rec, 0x0A, name_offset as u16);
        field::put_u16(rec, 0x0C, self.flags);
        field::put_u16(rec, 0x0E, self.id);
        if let Some(name) = &self.name {
            field::put_utf16(rec, name_offset, name);
        }

        match &self.body {
            AttributeBody::Resident(r) => {
                field::put_u32(rec, 0x10, r.data.len() as u32);
                field::put_u16(rec, 0x14, payload_offset as u16);
                rec[0x16] = u8::from(r.indexed);
                rec[payload_offset..payload_offset + r.data.len()].copy_from_slice(&r.data);
            }
            AttributeBody::NonResident(nr) => {
                field::put_u64(rec, 0x10, nr.start_vcn);
                field::put_u64(rec, 0x18, nr.last_vcn);
                field::put_u16(rec, 0x20, payload_offset as u16);
                field::put_u16(rec, 0x22, nr.compression_unit_log2);
                field::put_u64(rec, 0x28, nr.allocated_size);
                field::put_u64(rec, 0x30, nr.real_size);
                field::put_u64(rec, 0x38, nr.initialized_size);
                if self.non_resident_header_size() == COMPRESSED_HEADER_SIZE {
                    field::put_u64(rec, 0x40, nr.compressed_size.unwrap_or(0));
                }
                let mut pos = payload_offset;
                for run in &nr.runs {
                    pos += run.write(rec, pos);
                }
                rec[pos] = 0;
            }
        }

        Ok(length)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size()];
        self.write(&mut buf, 0)?;
        Ok(buf)
    }

    /// Read the whole value. Non-resident values are resolved through their
    /// cooked runs; sparse runs never touch the byte source.
    pub fn read(&self, ctx: &Arc<NtfsContext>) -> Result<Vec<u8>> {
        match &self.body {
            AttributeBody::Resident(r) => Ok(r.data.clone()),
            AttributeBody::NonResident(_) => ContentBuffer::from_extents(ctx, &[self])?.read_all(),
        }
    }

    /// Move the runs from `at` onwards into a new extent and return it.
    ///
    /// An index outside `1..run_count` falls back to the midpoint.
    pub fn split(&mut self, at: usize) -> Result<AttributeRecord> {
        let nr = match &mut self.body {
            AttributeBody::NonResident(nr) => nr,
            AttributeBody::Resident(_) => {
                return Err(MftError::unsupported("splitting a resident attribute"));
            }
        };
        let count = nr.runs.len();
        if count < 2 {
            return Err(MftError::unsupported(format!(
                "splitting an extent with {} run(s)",
                count
            )));
        }

        let split_idx = if at == 0 || at >= count { count / 2 } else { at };
        let split_vcn = nr.start_vcn + nr.runs[..split_idx].iter().map(|r| r.length).sum::<u64>();
        let split_lcn: i64 = nr.runs[..split_idx].iter().map(|r| r.offset).sum();

        let mut tail = nr.runs.split_off(split_idx);
        // The new extent restarts its LCN baseline at zero
        if let Some(first_stored) = tail.iter_mut().find(|r| !r.is_sparse) {
            first_stored.offset += split_lcn;
        }
        nr.last_vcn = split_vcn - 1;
        let unit_log2 = nr.compression_unit_log2;

        let mut extent = AttributeRecord::new_non_resident(
            self.attr_type,
            self.name.as_deref(),
            0,
            self.flags,
            split_vcn,
            tail,
        );
        if let AttributeBody::NonResident(tail_nr) = &mut extent.body {
            tail_nr.compression_unit_log2 = unit_log2;
        }
        Ok(extent)
    }

    /// Order by type, then case-insensitive name, then id
    pub fn cmp_canonical(&self, other: &Self) -> Ordering {
        self.attr_type
            .cmp(&other.attr_type)
            .then_with(|| {
                let upper = |n: &Option<String>| n.as_deref().map(str::to_uppercase);
                upper(&self.name).cmp(&upper(&other.name))
            })
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Physical `(lcn, clusters)` ranges, sparse runs excluded
    pub fn clusters(&self) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        if let AttributeBody::NonResident(nr) = &self.body {
            let mut lcn: i64 = 0;
            for run in nr.runs.iter().filter(|r| !r.is_sparse) {
                lcn += run.offset;
                ranges.push((lcn as u64, run.length));
            }
        }
        ranges
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttributeBody::Resident(_))
    }

    pub fn resident(&self) -> Option<&ResidentData> {
        match &self.body {
            AttributeBody::Resident(r) => Some(r),
            AttributeBody::NonResident(_) => None,
        }
    }

    pub fn non_resident(&self) -> Option<&NonResidentData> {
        match &self.body {
            AttributeBody::NonResident(nr) => Some(nr),
            AttributeBody::Resident(_) => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & attribute_flags::COMPRESSION_MASK != 0
    }

    pub fn is_sparse(&self) -> bool {
        self.flags & attribute_flags::SPARSE != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & attribute_flags::ENCRYPTED != 0
    }

    /// First VCN of this extent; zero for resident records
    pub fn start_vcn(&self) -> u64 {
        self.non_resident().map_or(0, |nr| nr.start_vcn)
    }

    /// Logical value length as recorded in this record
    pub fn data_length(&self) -> u64 {
        match &self.body {
            AttributeBody::Resident(r) => r.data.len() as u64,
            AttributeBody::NonResident(nr) => nr.real_size,
        }
    }

    pub fn name_matches(&self, name: Option<&str>) -> bool {
        match (self.name.as_deref(), name) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}
