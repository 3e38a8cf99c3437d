//! NTFS on-disk structures and constants

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::field;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::io::Cursor;

// ============================================================================
// NTFS Constants
// ============================================================================

/// MFT record signature "FILE"
pub const MFT_RECORD_SIGNATURE: [u8; 4] = *b"FILE";

/// Index block signature "INDX"
pub const INDEX_BLOCK_SIGNATURE: [u8; 4] = *b"INDX";

/// Signature the driver stamps on records that failed a fixup check
pub const BAD_RECORD_SIGNATURE: [u8; 4] = *b"BAAD";

/// End of attributes marker
pub const ATTRIBUTE_END_MARKER: u32 = 0xFFFFFFFF;

/// Standard sector size
pub const SECTOR_SIZE: u32 = 512;

// MFT Record Flags
pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

/// Well-known record numbers
pub mod system_records {
    pub const MFT: u64 = 0;
    pub const MFT_MIRROR: u64 = 1;
    pub const LOG_FILE: u64 = 2;
    pub const VOLUME: u64 = 3;
    pub const ATTR_DEF: u64 = 4;
    pub const ROOT_DIRECTORY: u64 = 5;
    pub const BITMAP: u64 = 6;
    pub const BOOT: u64 = 7;
    pub const BAD_CLUSTERS: u64 = 8;
    pub const SECURE: u64 = 9;
    pub const UPCASE: u64 = 10;
    pub const EXTEND: u64 = 11;
    /// First record available to user files
    pub const FIRST_USER: u64 = 16;
}

// ============================================================================
// Attribute Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    StandardInformation,
    AttributeList,
    FileName,
    ObjectId,
    SecurityDescriptor,
    VolumeName,
    VolumeInformation,
    Data,
    IndexRoot,
    IndexAllocation,
    Bitmap,
    ReparsePoint,
    EaInformation,
    Ea,
    LoggedUtilityStream,
    Unknown(u32),
}

impl AttributeType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0x10 => Self::StandardInformation,
            0x20 => Self::AttributeList,
            0x30 => Self::FileName,
            0x40 => Self::ObjectId,
            0x50 => Self::SecurityDescriptor,
            0x60 => Self::VolumeName,
            0x70 => Self::VolumeInformation,
            0x80 => Self::Data,
            0x90 => Self::IndexRoot,
            0xA0 => Self::IndexAllocation,
            0xB0 => Self::Bitmap,
            0xC0 => Self::ReparsePoint,
            0xD0 => Self::EaInformation,
            0xE0 => Self::Ea,
            0x100 => Self::LoggedUtilityStream,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::StandardInformation => 0x10,
            Self::AttributeList => 0x20,
            Self::FileName => 0x30,
            Self::ObjectId => 0x40,
            Self::SecurityDescriptor => 0x50,
            Self::VolumeName => 0x60,
            Self::VolumeInformation => 0x70,
            Self::Data => 0x80,
            Self::IndexRoot => 0x90,
            Self::IndexAllocation => 0xA0,
            Self::Bitmap => 0xB0,
            Self::ReparsePoint => 0xC0,
            Self::EaInformation => 0xD0,
            Self::Ea => 0xE0,
            Self::LoggedUtilityStream => 0x100,
            Self::Unknown(code) => *code,
        }
    }

    /// Name as shown in `$AttrDef`
    pub fn name(&self) -> &'static str {
        match self {
            Self::StandardInformation => "$STANDARD_INFORMATION",
            Self::AttributeList => "$ATTRIBUTE_LIST",
            Self::FileName => "$FILE_NAME",
            Self::ObjectId => "$OBJECT_ID",
            Self::SecurityDescriptor => "$SECURITY_DESCRIPTOR",
            Self::VolumeName => "$VOLUME_NAME",
            Self::VolumeInformation => "$VOLUME_INFORMATION",
            Self::Data => "$DATA",
            Self::IndexRoot => "$INDEX_ROOT",
            Self::IndexAllocation => "$INDEX_ALLOCATION",
            Self::Bitmap => "$BITMAP",
            Self::ReparsePoint => "$REPARSE_POINT",
            Self::EaInformation => "$EA_INFORMATION",
            Self::Ea => "$EA",
            Self::LoggedUtilityStream => "$LOGGED_UTILITY_STREAM",
            Self::Unknown(_) => "$UNKNOWN",
        }
    }
}

impl Ord for AttributeType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.code().cmp(&other.code())
    }
}

impl PartialOrd for AttributeType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "$UNKNOWN({:#x})", code),
            other => f.write_str(other.name()),
        }
    }
}

impl Serialize for AttributeType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// File Reference
// ============================================================================

/// 48-bit record number plus 16-bit sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct FileReference(pub u64);

impl FileReference {
    pub fn new(record_number: u64, sequence_number: u16) -> Self {
        Self((record_number & 0x0000_FFFF_FFFF_FFFF) | (u64::from(sequence_number) << 48))
    }

    pub fn record_number(&self) -> u64 {
        self.0 & 0x0000_FFFF_FFFF_FFFF
    }

    pub fn sequence_number(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.record_number(), self.sequence_number())
    }
}

// ============================================================================
// Filename Namespace
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum FilenameNamespace {
    Posix = 0,
    Win32 = 1,
    Dos = 2,
    Win32AndDos = 3,
}

impl FilenameNamespace {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Posix),
            1 => Some(Self::Win32),
            2 => Some(Self::Dos),
            3 => Some(Self::Win32AndDos),
            _ => None,
        }
    }

    /// Should this namespace be used for display?
    pub fn is_displayable(&self) -> bool {
        !matches!(self, Self::Dos)
    }

    /// Preference when a file carries several names; higher wins
    pub fn display_rank(&self) -> u8 {
        match self {
            Self::Win32 | Self::Win32AndDos => 3,
            Self::Posix => 2,
            Self::Dos => 1,
        }
    }
}

// ============================================================================
// NTFS Boot Sector
// ============================================================================

/// Parsed NTFS boot sector (first 512 bytes of an NTFS partition)
#[derive(Debug, Clone, Serialize)]
pub struct NtfsBootSector {
    /// OEM ID - must be "NTFS    " (8 bytes at offset 0x03)
    pub oem_id: [u8; 8],
    /// Bytes per sector (offset 0x0B, typically 512)
    pub bytes_per_sector: u16,
    /// Sectors per cluster (offset 0x0D, typically 8 -> 4096 byte clusters)
    pub sectors_per_cluster: u8,
    /// Total sectors on volume (offset 0x28)
    pub total_sectors: u64,
    /// MFT starting cluster number / LCN (offset 0x30)
    pub mft_cluster_number: u64,
    /// MFT mirror starting cluster number (offset 0x38)
    pub mft_mirror_cluster_number: u64,
    /// Clusters per MFT record (offset 0x40, signed)
    /// If negative, record size = 2^|value| bytes
    /// If positive, record size = value * bytes_per_cluster
    pub clusters_per_mft_record: i8,
    /// Clusters per index block (offset 0x44, signed, same encoding)
    pub clusters_per_index_block: i8,
    /// Volume serial number (offset 0x48)
    pub volume_serial_number: u64,
}

impl NtfsBootSector {
    pub const SIZE: usize = 512;
    pub const OEM_ID: [u8; 8] = *b"NTFS    ";

    /// Parse from raw 512-byte boot sector data
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let kind = StructureKind::BootSector;
        field::slice_at(data, 0, 0x50, kind)?;

        let mut oem_id = [0u8; 8];
        oem_id.copy_from_slice(&data[0x03..0x0B]);

        let boot = Self {
            oem_id,
            bytes_per_sector: field::u16_at(data, 0x0B, kind)?,
            sectors_per_cluster: field::u8_at(data, 0x0D, kind)?,
            total_sectors: field::u64_at(data, 0x28, kind)?,
            mft_cluster_number: field::u64_at(data, 0x30, kind)?,
            mft_mirror_cluster_number: field::u64_at(data, 0x38, kind)?,
            clusters_per_mft_record: field::u8_at(data, 0x40, kind)? as i8,
            clusters_per_index_block: field::u8_at(data, 0x44, kind)? as i8,
            volume_serial_number: field::u64_at(data, 0x48, kind)?,
        };

        if boot.oem_id != Self::OEM_ID {
            return Err(MftError::format(kind, 0x03, "missing NTFS OEM id"));
        }
        for (offset, raw) in [(0x40, boot.clusters_per_mft_record), (0x44, boot.clusters_per_index_block)] {
            if !Self::is_valid_size_byte(raw) {
                return Err(MftError::format(kind, offset, format!("invalid size byte {:#04x}", raw as u8)));
            }
        }
        if !boot.is_valid_ntfs() {
            return Err(MftError::format(
                kind,
                0x0B,
                format!(
                    "implausible geometry: {} bytes per sector, {} sectors per cluster",
                    boot.bytes_per_sector, boot.sectors_per_cluster
                ),
            ));
        }
        Ok(boot)
    }

    /// Validate this is an NTFS boot sector
    pub fn is_valid_ntfs(&self) -> bool {
        self.oem_id == Self::OEM_ID
            && self.bytes_per_sector >= 256
            && self.bytes_per_sector.is_power_of_two()
            && self.sectors_per_cluster > 0
            && self.sectors_per_cluster.is_power_of_two()
    }

    /// Calculate bytes per cluster
    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    /// Calculate bytes per MFT record
    pub fn bytes_per_mft_record(&self) -> u32 {
        self.decode_size(self.clusters_per_mft_record)
    }

    pub fn bytes_per_index_block(&self) -> u32 {
        self.decode_size(self.clusters_per_index_block)
    }

    /// Positive bytes count clusters, negative ones give a power of two in bytes
    fn is_valid_size_byte(raw: i8) -> bool {
        matches!(raw, 1..=127 | -31..=-1)
    }

    fn decode_size(&self, raw: i8) -> u32 {
        match raw {
            1..=127 => raw as u32 * self.bytes_per_cluster(),
            -31..=-1 => 1u32 << -(raw as i32),
            _ => 0,
        }
    }

    /// Byte offset of the MFT on the volume
    pub fn mft_byte_offset(&self) -> u64 {
        self.mft_cluster_number * self.bytes_per_cluster() as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        buf[0x03..0x0B].copy_from_slice(&self.oem_id);
        field::put_u16(&mut buf, 0x0B, self.bytes_per_sector);
        buf[0x0D] = self.sectors_per_cluster;
        field::put_u64(&mut buf, 0x28, self.total_sectors);
        field::put_u64(&mut buf, 0x30, self.mft_cluster_number);
        field::put_u64(&mut buf, 0x38, self.mft_mirror_cluster_number);
        buf[0x40] = self.clusters_per_mft_record as u8;
        buf[0x44] = self.clusters_per_index_block as u8;
        field::put_u64(&mut buf, 0x48, self.volume_serial_number);
        buf[0x1FE] = 0x55;
        buf[0x1FF] = 0xAA;
        buf
    }
}

// ============================================================================
// MFT Record Header
// ============================================================================

/// FILE record fields that follow the fixup header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MftRecordHeader {
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub first_attribute_offset: u16,
    pub flags: u16,
    pub used_size: u32,
    pub allocated_size: u32,
    pub base_record_reference: FileReference,
    pub next_attribute_id: u16,
    /// Present from NTFS 3.1 on, where the update sequence array starts at 0x30
    pub record_number: Option<u32>,
}

impl MftRecordHeader {
    /// Parse the header of an unprotected FILE record
    pub fn from_bytes(data: &[u8], usa_offset: u16) -> Result<Self> {
        field::slice_at(data, 0, 0x2C, StructureKind::FileRecord)?;
        let mut cursor = Cursor::new(&data[0x10..]);
        let short = |_| MftError::format(StructureKind::FileRecord, 0x10, "truncated record header");

        let mut header = Self {
            sequence_number: cursor.read_u16::<LittleEndian>().map_err(short)?,
            hard_link_count: cursor.read_u16::<LittleEndian>().map_err(short)?,
            first_attribute_offset: cursor.read_u16::<LittleEndian>().map_err(short)?,
            flags: cursor.read_u16::<LittleEndian>().map_err(short)?,
            used_size: cursor.read_u32::<LittleEndian>().map_err(short)?,
            allocated_size: cursor.read_u32::<LittleEndian>().map_err(short)?,
            base_record_reference: FileReference(cursor.read_u64::<LittleEndian>().map_err(short)?),
            next_attribute_id: cursor.read_u16::<LittleEndian>().map_err(short)?,
            record_number: None,
        };

        if usa_offset >= 0x30 {
            header.record_number = Some(field::u32_at(data, 0x2C, StructureKind::FileRecord)?);
        }
        Ok(header)
    }

    /// Write the fields at 0x10..0x30 of a FILE record
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        let short = |_| MftError::format(StructureKind::FileRecord, 0x10, "record buffer too small");
        field::slice_at(data, 0, 0x30, StructureKind::FileRecord)?;

        let mut cursor = Cursor::new(&mut data[0x10..0x30]);
        cursor.write_u16::<LittleEndian>(self.sequence_number).map_err(short)?;
        cursor.write_u16::<LittleEndian>(self.hard_link_count).map_err(short)?;
        cursor.write_u16::<LittleEndian>(self.first_attribute_offset).map_err(short)?;
        cursor.write_u16::<LittleEndian>(self.flags).map_err(short)?;
        cursor.write_u32::<LittleEndian>(self.used_size).map_err(short)?;
        cursor.write_u32::<LittleEndian>(self.allocated_size).map_err(short)?;
        cursor.write_u64::<LittleEndian>(self.base_record_reference.0).map_err(short)?;
        cursor.write_u16::<LittleEndian>(self.next_attribute_id).map_err(short)?;
        cursor.write_u16::<LittleEndian>(0).map_err(short)?;
        cursor
            .write_u32::<LittleEndian>(self.record_number.unwrap_or(0))
            .map_err(short)?;
        Ok(())
    }

    /// Check if this record is in use
    pub fn is_in_use(&self) -> bool {
        (self.flags & MFT_RECORD_IN_USE) != 0
    }

    /// Check if this record represents a directory
    pub fn is_directory(&self) -> bool {
        (self.flags & MFT_RECORD_IS_DIRECTORY) != 0
    }

    /// Check if this is a base record (not an extension)
    pub fn is_base_record(&self) -> bool {
        self.base_record_reference.is_null()
    }
}

// ============================================================================
// Standard Information Attribute
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StandardInformation {
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub file_attributes: u32,
    pub max_versions: u32,
    pub version_number: u32,
    pub class_id: u32,
    pub owner_id: u32,
    pub security_id: u32,
    pub quota_charged: u64,
    pub usn: u64,
}

impl StandardInformation {
    const SHORT_SIZE: usize = 48;
    const LONG_SIZE: usize = 72;

    /// Parse from resident attribute content
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SHORT_SIZE {
            return Err(MftError::format(
                StructureKind::StandardInformation,
                0,
                format!("value is {} bytes, expected at least {}", data.len(), Self::SHORT_SIZE),
            ));
        }

        let mut cursor = Cursor::new(data);
        let short = |_| MftError::format(StructureKind::StandardInformation, 0, "truncated value");

        let mut info = Self {
            creation_time: cursor.read_u64::<LittleEndian>().map_err(short)?,
            modification_time: cursor.read_u64::<LittleEndian>().map_err(short)?,
            mft_modification_time: cursor.read_u64::<LittleEndian>().map_err(short)?,
            access_time: cursor.read_u64::<LittleEndian>().map_err(short)?,
            file_attributes: cursor.read_u32::<LittleEndian>().map_err(short)?,
            max_versions: cursor.read_u32::<LittleEndian>().map_err(short)?,
            version_number: cursor.read_u32::<LittleEndian>().map_err(short)?,
            class_id: cursor.read_u32::<LittleEndian>().map_err(short)?,
            ..Default::default()
        };

        // Extended attributes (NTFS 3.0+)
        if data.len() >= Self::LONG_SIZE {
            info.owner_id = cursor.read_u32::<LittleEndian>().map_err(short)?;
            info.security_id = cursor.read_u32::<LittleEndian>().map_err(short)?;
            info.quota_charged = cursor.read_u64::<LittleEndian>().map_err(short)?;
            info.usn = cursor.read_u64::<LittleEndian>().map_err(short)?;
        }

        Ok(info)
    }

    /// Serialize in the NTFS 3.0+ layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::LONG_SIZE];
        field::put_u64(&mut buf, 0x00, self.creation_time);
        field::put_u64(&mut buf, 0x08, self.modification_time);
        field::put_u64(&mut buf, 0x10, self.mft_modification_time);
        field::put_u64(&mut buf, 0x18, self.access_time);
        field::put_u32(&mut buf, 0x20, self.file_attributes);
        field::put_u32(&mut buf, 0x24, self.max_versions);
        field::put_u32(&mut buf, 0x28, self.version_number);
        field::put_u32(&mut buf, 0x2C, self.class_id);
        field::put_u32(&mut buf, 0x30, self.owner_id);
        field::put_u32(&mut buf, 0x34, self.security_id);
        field::put_u64(&mut buf, 0x38, self.quota_charged);
        field::put_u64(&mut buf, 0x40, self.usn);
        buf
    }

    pub fn modified(&self) -> chrono::DateTime<chrono::Utc> {
        filetime_to_datetime(self.modification_time)
    }
}

// ============================================================================
// File Name Attribute
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileNameAttribute {
    pub parent_reference: FileReference,
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
    pub allocated_size: u64,
    pub data_size: u64,
    pub file_attributes: u32,
    pub reparse_value: u32,
    pub namespace: FilenameNamespace,
    pub name: String,
}

impl FileNameAttribute {
    /// Offset of the UTF-16 name inside the value
    pub const NAME_OFFSET: usize = 0x42;

    pub fn new(parent: FileReference, name: &str, namespace: FilenameNamespace) -> Self {
        Self {
            parent_reference: parent,
            creation_time: 0,
            modification_time: 0,
            mft_modification_time: 0,
            access_time: 0,
            allocated_size: 0,
            data_size: 0,
            file_attributes: 0,
            reparse_value: 0,
            namespace,
            name: name.to_string(),
        }
    }

    /// Parse from resident attribute content or an index key
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let kind = StructureKind::FileName;
        field::slice_at(data, 0, Self::NAME_OFFSET, kind)?;

        let mut cursor = Cursor::new(data);
        let short = |_| MftError::format(kind, 0, "truncated value");

        let parent_reference = FileReference(cursor.read_u64::<LittleEndian>().map_err(short)?);
        let creation_time = cursor.read_u64::<LittleEndian>().map_err(short)?;
        let modification_time = cursor.read_u64::<LittleEndian>().map_err(short)?;
        let mft_modification_time = cursor.read_u64::<LittleEndian>().map_err(short)?;
        let access_time = cursor.read_u64::<LittleEndian>().map_err(short)?;
        let allocated_size = cursor.read_u64::<LittleEndian>().map_err(short)?;
        let data_size = cursor.read_u64::<LittleEndian>().map_err(short)?;
        let file_attributes = cursor.read_u32::<LittleEndian>().map_err(short)?;
        let reparse_value = cursor.read_u32::<LittleEndian>().map_err(short)?;
        let name_length = cursor.read_u8().map_err(short)?;
        let namespace_byte = cursor.read_u8().map_err(short)?;
        let namespace = FilenameNamespace::from_u8(namespace_byte).ok_or_else(|| {
            MftError::format(kind, 0x41, format!("unknown namespace {}", namespace_byte))
        })?;

        let name = field::utf16_at(data, Self::NAME_OFFSET, name_length as usize, kind)?;

        Ok(Self {
            parent_reference,
            creation_time,
            modification_time,
            mft_modification_time,
            access_time,
            allocated_size,
            data_size,
            file_attributes,
            reparse_value,
            namespace,
            name,
        })
    }

    pub fn size(&self) -> usize {
        Self::NAME_OFFSET + self.name.encode_utf16().count() * 2
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size()];
        field::put_u64(&mut buf, 0x00, self.parent_reference.0);
        field::put_u64(&mut buf, 0x08, self.creation_time);
        field::put_u64(&mut buf, 0x10, self.modification_time);
        field::put_u64(&mut buf, 0x18, self.mft_modification_time);
        field::put_u64(&mut buf, 0x20, self.access_time);
        field::put_u64(&mut buf, 0x28, self.allocated_size);
        field::put_u64(&mut buf, 0x30, self.data_size);
        field::put_u32(&mut buf, 0x38, self.file_attributes);
        field::put_u32(&mut buf, 0x3C, self.reparse_value);
        let units = field::put_utf16(&mut buf, Self::NAME_OFFSET, &self.name);
        buf[0x40] = units as u8;
        buf[0x41] = self.namespace as u8;
        buf
    }

    /// Get the parent record number (lower 48 bits)
    pub fn parent_record_number(&self) -> u64 {
        self.parent_reference.record_number()
    }

    pub fn is_directory(&self) -> bool {
        self.file_attributes & file_attributes::DIRECTORY_INDEX != 0
    }
}

// ============================================================================
// FILETIME conversion utilities
// ============================================================================

/// Difference between 1601 and 1970 in 100-nanosecond intervals
const EPOCH_DIFF: u64 = 116444736000000000;

/// Convert Windows FILETIME (100-nanosecond intervals since 1601) to Unix timestamp
pub fn filetime_to_unix(filetime: u64) -> i64 {
    if filetime < EPOCH_DIFF {
        return 0;
    }

    ((filetime - EPOCH_DIFF) / 10_000_000) as i64
}

/// Convert Windows FILETIME to chrono DateTime
pub fn filetime_to_datetime(filetime: u64) -> chrono::DateTime<chrono::Utc> {
    use chrono::{DateTime, TimeZone, Utc};
    Utc.timestamp_opt(filetime_to_unix(filetime), 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn datetime_to_filetime(time: chrono::DateTime<chrono::Utc>) -> u64 {
    let secs = time.timestamp().max(0) as u64;
    EPOCH_DIFF + secs * 10_000_000 + u64::from(time.timestamp_subsec_nanos() / 100)
}

// ============================================================================
// File Attributes
// ============================================================================

pub mod file_attributes {
    pub const HIDDEN: u32 = 0x00000002;
    pub const ARCHIVE: u32 = 0x00000020;
    /// Set in `$FILE_NAME` values of directories
    pub const DIRECTORY_INDEX: u32 = 0x10000000;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_boot() -> NtfsBootSector {
        NtfsBootSector {
            oem_id: NtfsBootSector::OEM_ID,
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            total_sectors: 0x10_0000,
            mft_cluster_number: 0xC0000,
            mft_mirror_cluster_number: 2,
            clusters_per_mft_record: -10,
            clusters_per_index_block: 1,
            volume_serial_number: 0x1234_5678_9ABC_DEF0,
        }
    }

    #[test]
    fn boot_sector_geometry() {
        let boot = NtfsBootSector::from_bytes(&sample_boot().to_bytes()).unwrap();
        assert_eq!(boot.bytes_per_cluster(), 4096);
        assert_eq!(boot.bytes_per_mft_record(), 1024);
        assert_eq!(boot.bytes_per_index_block(), 4096);
        assert_eq!(boot.mft_byte_offset(), 0xC0000 * 4096);
        assert_eq!(boot.volume_serial_number, 0x1234_5678_9ABC_DEF0);
    }

    #[test]
    fn boot_sector_rejects_foreign_oem_id() {
        let mut bytes = sample_boot().to_bytes();
        bytes[0x03..0x0B].copy_from_slice(b"MSDOS5.0");
        let err = NtfsBootSector::from_bytes(&bytes).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("boot sector"));
    }

    #[test]
    fn boot_sector_rejects_unusable_size_bytes() {
        for offset in [0x40, 0x44] {
            for raw in [0x80u8, 0x00, 0xE0] {
                let mut bytes = sample_boot().to_bytes();
                bytes[offset] = raw;
                match NtfsBootSector::from_bytes(&bytes) {
                    Err(MftError::Format { kind, offset: at, .. }) => {
                        assert_eq!(kind, StructureKind::BootSector);
                        assert_eq!(at as usize, offset);
                    }
                    other => panic!("size byte {raw:#04x} at {offset:#x}: {other:?}"),
                }
            }
        }

        let mut bytes = sample_boot().to_bytes();
        bytes[0x40] = 0xE1;
        assert_eq!(NtfsBootSector::from_bytes(&bytes).unwrap().bytes_per_mft_record(), 1 << 31);
    }

    #[test]
    fn file_reference_splits_fields() {
        let r = FileReference::new(0x1234, 7);
        assert_eq!(r.record_number(), 0x1234);
        assert_eq!(r.sequence_number(), 7);
        assert_eq!(r.to_string(), "4660#7");
    }

    #[test]
    fn attribute_types_order_by_code() {
        assert!(AttributeType::FileName < AttributeType::Data);
        assert!(AttributeType::Data < AttributeType::Unknown(0x81));
        assert_eq!(AttributeType::from_u32(0x80), AttributeType::Data);
        assert_eq!(AttributeType::from_u32(0x1234).code(), 0x1234);
    }

    #[test]
    fn file_name_value_round_trips() {
        let mut name = FileNameAttribute::new(FileReference::new(5, 5), "readme.md", FilenameNamespace::Win32);
        name.data_size = 42;
        name.file_attributes = file_attributes::ARCHIVE;
        let bytes = name.to_bytes();
        assert_eq!(bytes.len(), 0x42 + 18);
        assert_eq!(bytes[0x40], 9);
        assert_eq!(FileNameAttribute::from_bytes(&bytes).unwrap(), name);
    }

    #[test]
    fn file_name_rejects_truncated_name() {
        let name = FileNameAttribute::new(FileReference::new(5, 5), "abc", FilenameNamespace::Posix);
        let bytes = name.to_bytes();
        assert!(FileNameAttribute::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn record_header_reads_record_number_only_with_late_usa() {
        let mut buf = vec![0u8; 0x30];
        let header = MftRecordHeader {
            sequence_number: 3,
            hard_link_count: 1,
            first_attribute_offset: 0x38,
            flags: MFT_RECORD_IN_USE | MFT_RECORD_IS_DIRECTORY,
            used_size: 0x1A0,
            allocated_size: 1024,
            base_record_reference: FileReference::default(),
            next_attribute_id: 4,
            record_number: Some(5),
        };
        header.write(&mut buf).unwrap();

        let parsed = MftRecordHeader::from_bytes(&buf, 0x30).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_directory() && parsed.is_in_use() && parsed.is_base_record());

        let legacy = MftRecordHeader::from_bytes(&buf, 0x2A).unwrap();
        assert_eq!(legacy.record_number, None);
    }

    #[test]
    fn standard_information_round_trips() {
        let info = StandardInformation {
            creation_time: EPOCH_DIFF + 10_000_000,
            modification_time: EPOCH_DIFF + 20_000_000,
            file_attributes: file_attributes::HIDDEN,
            security_id: 0x100,
            ..Default::default()
        };
        let parsed = StandardInformation::from_bytes(&info.to_bytes()).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(parsed.modified().timestamp(), 2);
        assert!(StandardInformation::from_bytes(&[0u8; 40]).is_err());
    }

    #[test]
    fn filetime_conversions() {
        assert_eq!(filetime_to_unix(0), 0);
        let t = filetime_to_datetime(EPOCH_DIFF + 86_400 * 10_000_000);
        assert_eq!(t.timestamp(), 86_400);
        assert_eq!(datetime_to_filetime(t), EPOCH_DIFF + 86_400 * 10_000_000);
    }
}
