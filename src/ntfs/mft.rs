//! MFT (Master File Table)
//!
//! `FileRecord` is one fixup-protected `FILE` record with its parsed
//! attributes. `MasterFileTable` bootstraps the table from record 0 and reads
//! or writes any record by number through the `$MFT` data stream.

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::attr_list::parse_attribute_list;
use crate::ntfs::attribute::AttributeRecord;
use crate::ntfs::cache::{CacheStats, LruCache};
use crate::ntfs::context::NtfsContext;
use crate::ntfs::field::round_up;
use crate::ntfs::fixup::{FixupHeader, FixupRecord};
use crate::ntfs::runs::LcnMapping;
use crate::ntfs::stream::ContentBuffer;
use crate::ntfs::structs::{
    system_records, AttributeType, FileReference, MftRecordHeader, ATTRIBUTE_END_MARKER,
    MFT_RECORD_SIGNATURE,
};
use std::sync::Arc;

/// Update sequence array offset used for new records (NTFS 3.1 layout)
const NEW_RECORD_USA_OFFSET: u16 = 0x30;

/// End marker plus the padding that follows it
const END_MARKER_SIZE: usize = 8;

// ============================================================================
// File Record
// ============================================================================

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub fixup: FixupHeader,
    pub header: MftRecordHeader,
    attributes: Vec<AttributeRecord>,
}

impl FixupRecord for FileRecord {
    const MAGIC: [u8; 4] = MFT_RECORD_SIGNATURE;
    const KIND: StructureKind = StructureKind::FileRecord;
    type Layout = ();

    fn fixup(&self) -> &FixupHeader {
        &self.fixup
    }

    fn fixup_mut(&mut self) -> &mut FixupHeader {
        &mut self.fixup
    }

    fn parse_payload(fixup: FixupHeader, buf: &[u8], _layout: ()) -> Result<Self> {
        let kind = StructureKind::FileRecord;
        let header = MftRecordHeader::from_bytes(buf, fixup.usa_offset)?;

        let used = header.used_size as usize;
        if used > buf.len() {
            return Err(MftError::format(
                kind,
                0x18,
                format!("used size {} exceeds the {}-byte record", used, buf.len()),
            ));
        }
        let mut offset = header.first_attribute_offset as usize;
        if offset < fixup.usa_end() || offset >= used {
            return Err(MftError::format(
                kind,
                0x14,
                format!(
                    "first attribute offset {:#x} is outside {:#x}..{:#x}",
                    offset,
                    fixup.usa_end(),
                    used
                ),
            ));
        }

        let body = &buf[..used];
        let mut attributes = Vec::new();
        while let Some((attr, length)) = AttributeRecord::parse(body, offset)? {
            attributes.push(attr);
            offset += length;
        }

        Ok(Self {
            fixup,
            header,
            attributes,
        })
    }

    fn write_payload(&self, buf: &mut [u8]) -> Result<()> {
        let needed = self.calc_size();
        if needed > buf.len() {
            return Err(MftError::format(
                StructureKind::FileRecord,
                0,
                format!("attributes need {} bytes, record is {}", needed, buf.len()),
            ));
        }
        buf.fill(0);
        self.header.write(buf)?;

        let mut offset = self.header.first_attribute_offset as usize;
        for attr in &self.attributes {
            offset += attr.write(buf, offset)?;
        }
        buf[offset..offset + 4].copy_from_slice(&ATTRIBUTE_END_MARKER.to_le_bytes());
        Ok(())
    }
}

impl FileRecord {
    /// An empty in-use record
    pub fn new(record_number: u64, flags: u16, record_size: usize, sector_size: usize) -> Self {
        let fixup = FixupHeader::new(
            MFT_RECORD_SIGNATURE,
            NEW_RECORD_USA_OFFSET,
            record_size,
            sector_size,
        );
        let first = round_up(fixup.usa_end(), 8);
        Self {
            fixup,
            header: MftRecordHeader {
                sequence_number: 1,
                hard_link_count: 0,
                first_attribute_offset: first as u16,
                flags,
                used_size: (first + END_MARKER_SIZE) as u32,
                allocated_size: record_size as u32,
                base_record_reference: FileReference::default(),
                next_attribute_id: 0,
                record_number: Some(record_number as u32),
            },
            attributes: Vec::new(),
        }
    }

    /// Verify, unprotect and parse a raw record
    pub fn from_bytes(data: &[u8], sector_size: usize) -> Result<Self> {
        Self::from_protected(data, sector_size, ())
    }

    /// Serialize and protect. Recomputes the used size and the first
    /// attribute offset.
    pub fn to_bytes(&mut self, record_size: usize, sector_size: usize) -> Result<Vec<u8>> {
        self.header.first_attribute_offset = round_up(self.fixup.usa_end(), 8) as u16;
        self.header.used_size = self.calc_size() as u32;
        self.header.allocated_size = record_size as u32;
        self.to_protected(record_size, sector_size)
    }

    /// Bytes the record occupies when serialized
    pub fn calc_size(&self) -> usize {
        round_up(self.fixup.usa_end(), 8)
            + self.attributes.iter().map(AttributeRecord::size).sum::<usize>()
            + END_MARKER_SIZE
    }

    pub fn attributes(&self) -> &[AttributeRecord] {
        &self.attributes
    }

    pub fn attribute(&self, attr_type: AttributeType, name: Option<&str>) -> Option<&AttributeRecord> {
        self.attributes
            .iter()
            .find(|a| a.attr_type == attr_type && a.name_matches(name))
    }

    pub fn attributes_of(&self, attr_type: AttributeType) -> impl Iterator<Item = &AttributeRecord> {
        self.attributes.iter().filter(move |a| a.attr_type == attr_type)
    }

    pub fn attribute_by_id(&self, id: u16) -> Option<&AttributeRecord> {
        self.attributes.iter().find(|a| a.id == id)
    }

    /// Insert in canonical order, assigning the next attribute id
    pub fn add_attribute(&mut self, mut attr: AttributeRecord) -> u16 {
        let id = self.header.next_attribute_id;
        self.header.next_attribute_id = id.wrapping_add(1);
        attr.id = id;

        let at = self
            .attributes
            .partition_point(|existing| existing.cmp_canonical(&attr).is_le());
        self.attributes.insert(at, attr);
        id
    }

    pub fn remove_attribute(&mut self, id: u16) -> Option<AttributeRecord> {
        let at = self.attributes.iter().position(|a| a.id == id)?;
        Some(self.attributes.remove(at))
    }

    pub fn is_in_use(&self) -> bool {
        self.header.is_in_use()
    }

    pub fn is_directory(&self) -> bool {
        self.header.is_directory()
    }

    pub fn is_base_record(&self) -> bool {
        self.header.is_base_record()
    }

    pub fn base_reference(&self) -> FileReference {
        self.header.base_record_reference
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }
}

// ============================================================================
// Master File Table
// ============================================================================

/// Outcome of inspecting one slot of the table
#[derive(Debug)]
pub enum RecordStatus {
    InUse(FileRecord),
    /// Never written, or released
    Free,
    Corrupt(MftError),
}

pub struct MasterFileTable {
    ctx: Arc<NtfsContext>,
    data: ContentBuffer,
    record_size: usize,
    cache: LruCache<u64, Arc<FileRecord>>,
}

impl MasterFileTable {
    /// Bootstrap from record 0 at `mft_offset`.
    ///
    /// The `$DATA` extents held by record 0 locate the rest of the table; any
    /// further extents named by its attribute list are read through them.
    pub fn open(
        ctx: Arc<NtfsContext>,
        mft_offset: u64,
        record_size: usize,
        cache_capacity: usize,
    ) -> Result<Self> {
        let mut raw = vec![0u8; record_size];
        ctx.read_physical(mft_offset, &mut raw)?;
        let record0 = FileRecord::from_bytes(&raw, ctx.sector_size()).map_err(|e| e.at(mft_offset))?;

        let mut extents: Vec<AttributeRecord> = record0
            .attributes_of(AttributeType::Data)
            .filter(|a| a.name.is_none())
            .cloned()
            .collect();
        if extents.is_empty() {
            return Err(MftError::format(
                StructureKind::FileRecord,
                mft_offset as usize,
                "$MFT record has no $DATA attribute",
            ));
        }

        let data = {
            let refs: Vec<&AttributeRecord> = extents.iter().collect();
            ContentBuffer::from_extents(&ctx, &refs)?
        };
        let mut mft = Self {
            ctx: Arc::clone(&ctx),
            data,
            record_size,
            cache: LruCache::new(cache_capacity),
        };

        if let Some(list) = record0.attribute(AttributeType::AttributeList, None) {
            let entries = parse_attribute_list(&list.read(&ctx)?)?;
            let mut added = 0;
            for entry in entries.iter().filter(|e| {
                e.attr_type == AttributeType::Data
                    && e.name.is_none()
                    && e.record.record_number() != system_records::MFT
            }) {
                let holder = mft.read_record(entry.record.record_number())?;
                let extent = holder.attribute_by_id(entry.attribute_id).ok_or_else(|| {
                    MftError::format(
                        StructureKind::AttributeList,
                        0,
                        format!(
                            "$MFT extent {} missing from record {}",
                            entry.attribute_id, entry.record
                        ),
                    )
                })?;
                extents.push(extent.clone());
                added += 1;
            }
            if added > 0 {
                let refs: Vec<&AttributeRecord> = extents.iter().collect();
                mft.data = ContentBuffer::from_extents(&ctx, &refs)?;
                mft.cache.clear();
            }
        }

        log::debug!(
            "MFT bootstrapped: {} records of {} bytes in {} extent(s)",
            mft.record_count(),
            record_size,
            extents.len()
        );
        Ok(mft)
    }

    /// Wrap an already built `$MFT` stream
    pub fn from_buffer(ctx: Arc<NtfsContext>, data: ContentBuffer, record_size: usize, cache_capacity: usize) -> Self {
        Self {
            ctx,
            data,
            record_size,
            cache: LruCache::new(cache_capacity),
        }
    }

    pub fn context(&self) -> &Arc<NtfsContext> {
        &self.ctx
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn record_count(&self) -> u64 {
        self.data.len() / self.record_size as u64
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Volume byte offset of a record, when its first cluster is stored
    fn physical_position(&self, record_number: u64) -> u64 {
        let logical = record_number * self.record_size as u64;
        if let ContentBuffer::NonResident(nr) = &self.data {
            let bpc = self.ctx.bytes_per_cluster() as u64;
            if let Ok(LcnMapping::Physical(lcn)) = nr.runs().map_vcn_to_lcn(logical / bpc) {
                return lcn * bpc + logical % bpc;
            }
        }
        logical
    }

    fn check_bounds(&self, record_number: u64) -> Result<()> {
        if record_number >= self.record_count() {
            return Err(MftError::not_found(format!(
                "record {} (table holds {})",
                record_number,
                self.record_count()
            )));
        }
        Ok(())
    }

    /// Raw, still protected bytes of a record
    pub fn read_raw(&self, record_number: u64) -> Result<Vec<u8>> {
        self.check_bounds(record_number)?;
        let mut raw = vec![0u8; self.record_size];
        let pos = record_number * self.record_size as u64;
        let n = self.data.read_at(pos, &mut raw)?;
        if n < raw.len() {
            return Err(MftError::format(
                StructureKind::FileRecord,
                self.physical_position(record_number) as usize,
                format!("short read of {} bytes for record {}", n, record_number),
            ));
        }
        Ok(raw)
    }

    pub fn read_record(&self, record_number: u64) -> Result<Arc<FileRecord>> {
        self.cache.get_or_try_insert_with(record_number, || {
            let raw = self.read_raw(record_number)?;
            let record = FileRecord::from_bytes(&raw, self.ctx.sector_size())
                .map_err(|e| e.at(self.physical_position(record_number)))?;
            log::trace!(
                "record {}: {} attributes, flags {:#x}",
                record_number,
                record.attributes().len(),
                record.header.flags
            );
            Ok(Arc::new(record))
        })
    }

    /// Classify a record without caching it
    pub fn inspect(&self, record_number: u64) -> Result<RecordStatus> {
        let raw = self.read_raw(record_number)?;
        if raw[..4].iter().all(|&b| b == 0) {
            return Ok(RecordStatus::Free);
        }
        match FileRecord::from_bytes(&raw, self.ctx.sector_size()) {
            Ok(record) if record.is_in_use() => Ok(RecordStatus::InUse(record)),
            Ok(_) => Ok(RecordStatus::Free),
            Err(MftError::IoError(e)) => Err(MftError::IoError(e)),
            Err(e) => Ok(RecordStatus::Corrupt(e.at(self.physical_position(record_number)))),
        }
    }

    /// Protect and write a record back through the `$MFT` stream
    pub fn write_record(&mut self, record_number: u64, record: &mut FileRecord) -> Result<()> {
        self.check_bounds(record_number)?;
        let bytes = record.to_bytes(self.record_size, self.ctx.sector_size())?;
        self.data
            .write_at(record_number * self.record_size as u64, &bytes)?;
        self.cache.remove(&record_number);
        log::debug!("wrote record {} ({} bytes used)", record_number, record.header.used_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::attr_list::{encode_attribute_list, AttributeListEntry};
    use crate::ntfs::runs::DataRun;
    use crate::ntfs::source::{ByteSource, MemorySource};
    use crate::ntfs::structs::MFT_RECORD_IN_USE;

    const RECORD: usize = 1024;
    const BPC: u32 = 512;

    fn sample_record() -> FileRecord {
        let mut rec = FileRecord::new(7, MFT_RECORD_IN_USE, RECORD, 512);
        rec.add_attribute(AttributeRecord::new_resident(AttributeType::Data, None, 0, b"body".to_vec()));
        rec.add_attribute(AttributeRecord::new_resident(
            AttributeType::StandardInformation,
            None,
            0,
            vec![0; 48],
        ));
        rec.add_attribute(
            AttributeRecord::new_non_resident(
                AttributeType::Data,
                Some("big"),
                0,
                0,
                0,
                vec![DataRun::new(100, 4)],
            )
            .with_sizes(2048, 2000, 2000),
        );
        rec
    }

    #[test]
    fn add_attribute_keeps_canonical_order() {
        let rec = sample_record();
        let order: Vec<_> = rec.attributes().iter().map(|a| (a.attr_type, a.id)).collect();
        assert_eq!(
            order,
            vec![
                (AttributeType::StandardInformation, 1),
                (AttributeType::Data, 0),
                (AttributeType::Data, 2),
            ]
        );
        assert_eq!(rec.header.next_attribute_id, 3);
    }

    #[test]
    fn record_round_trips_through_fixup() {
        let mut rec = sample_record();
        let bytes = rec.to_bytes(RECORD, 512).unwrap();
        assert_eq!(&bytes[..4], b"FILE");
        assert_eq!(rec.header.first_attribute_offset, 0x38);
        assert_eq!(rec.header.used_size as usize, rec.calc_size());

        let parsed = FileRecord::from_bytes(&bytes, 512).unwrap();
        assert_eq!(parsed.attributes(), rec.attributes());
        assert_eq!(parsed.header.record_number, Some(7));
        assert_eq!(parsed.fixup.sequence_number, 2);
        assert_eq!(
            parsed.attribute(AttributeType::Data, Some("big")).unwrap().data_length(),
            2000
        );
        assert!(parsed.attribute(AttributeType::Data, Some("BIG")).is_none());
    }

    #[test]
    fn torn_record_is_corrupt() {
        let mut rec = sample_record();
        let mut bytes = rec.to_bytes(RECORD, 512).unwrap();
        bytes[1022] ^= 0xFF;
        let err = FileRecord::from_bytes(&bytes, 512).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn oversized_record_is_rejected_on_write() {
        let mut rec = FileRecord::new(1, MFT_RECORD_IN_USE, RECORD, 512);
        rec.add_attribute(AttributeRecord::new_resident(AttributeType::Data, None, 0, vec![1; 2000]));
        assert!(rec.to_bytes(RECORD, 512).is_err());
    }

    #[test]
    fn bad_first_attribute_offset_is_rejected() {
        let mut rec = sample_record();
        let mut bytes = rec.to_bytes(RECORD, 512).unwrap();
        bytes[0x14] = 0x10;
        let err = FileRecord::from_bytes(&bytes, 512).unwrap_err();
        assert!(err.to_string().contains("first attribute offset"));
    }

    /// Eight records: record 0 holds vcn 0..=7 (records 0-3) at lcn 4 and
    /// record 2 holds vcn 8..=15 (records 4-7) at lcn 20.
    fn two_extent_image() -> (Arc<MemorySource>, Arc<NtfsContext>) {
        let source = Arc::new(MemorySource::new(vec![0u8; 40 * BPC as usize]));
        let ctx = Arc::new(NtfsContext::new(source.clone(), BPC));
        let position = |n: u64| -> u64 {
            if n < 4 {
                4 * 512 + n * RECORD as u64
            } else {
                20 * 512 + (n - 4) * RECORD as u64
            }
        };

        let mut rec0 = FileRecord::new(0, MFT_RECORD_IN_USE, RECORD, 512);
        let list = encode_attribute_list(&[
            AttributeListEntry::new(AttributeType::Data, None, 0, FileReference::new(0, 1), 1),
            AttributeListEntry::new(AttributeType::Data, None, 8, FileReference::new(2, 1), 0),
        ])
        .unwrap();
        rec0.add_attribute(AttributeRecord::new_resident(AttributeType::AttributeList, None, 0, list));
        rec0.add_attribute(
            AttributeRecord::new_non_resident(AttributeType::Data, None, 0, 0, 0, vec![DataRun::new(4, 8)])
                .with_sizes(8 * RECORD as u64, 8 * RECORD as u64, 8 * RECORD as u64),
        );

        let mut rec2 = FileRecord::new(2, MFT_RECORD_IN_USE, RECORD, 512);
        rec2.header.base_record_reference = FileReference::new(0, 1);
        rec2.add_attribute(AttributeRecord::new_non_resident(
            AttributeType::Data,
            None,
            0,
            0,
            8,
            vec![DataRun::new(20, 8)],
        ));

        let mut rec5 = FileRecord::new(5, MFT_RECORD_IN_USE, RECORD, 512);
        rec5.add_attribute(AttributeRecord::new_resident(AttributeType::Data, None, 0, b"five".to_vec()));

        let mut torn = FileRecord::new(6, MFT_RECORD_IN_USE, RECORD, 512);
        let mut torn_bytes = torn.to_bytes(RECORD, 512).unwrap();
        torn_bytes[510] ^= 1;

        for (n, rec) in [(0u64, &mut rec0), (2, &mut rec2), (5, &mut rec5)] {
            source
                .write_at(position(n), &rec.to_bytes(RECORD, 512).unwrap())
                .unwrap();
        }
        source.write_at(position(6), &torn_bytes).unwrap();
        (source, ctx)
    }

    #[test]
    fn bootstrap_follows_the_attribute_list() {
        let (_, ctx) = two_extent_image();
        let mft = MasterFileTable::open(ctx, 4 * 512, RECORD, 8).unwrap();
        assert_eq!(mft.record_count(), 8);

        let five = mft.read_record(5).unwrap();
        let data = five.attribute(AttributeType::Data, None).unwrap();
        assert_eq!(data.resident().unwrap().data, b"five");

        let again = mft.read_record(5).unwrap();
        assert!(Arc::ptr_eq(&five, &again));
        assert!(mft.read_record(8).unwrap_err().is_not_found());
    }

    #[test]
    fn inspect_classifies_records() {
        let (_, ctx) = two_extent_image();
        let mft = MasterFileTable::open(ctx, 4 * 512, RECORD, 0).unwrap();
        assert!(matches!(mft.inspect(5).unwrap(), RecordStatus::InUse(_)));
        assert!(matches!(mft.inspect(7).unwrap(), RecordStatus::Free));
        match mft.inspect(6).unwrap() {
            RecordStatus::Corrupt(MftError::Format { offset, .. }) => {
                assert_eq!(offset, 20 * 512 + 2 * RECORD as u64 + 510);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn written_records_are_read_back() {
        let (source, ctx) = two_extent_image();
        let mut mft = MasterFileTable::open(ctx, 4 * 512, RECORD, 8).unwrap();
        let mut five = (*mft.read_record(5).unwrap()).clone();
        five.add_attribute(AttributeRecord::new_resident(AttributeType::Data, Some("extra"), 0, b"x".to_vec()));
        mft.write_record(5, &mut five).unwrap();

        let reread = mft.read_record(5).unwrap();
        assert!(reread.attribute(AttributeType::Data, Some("extra")).is_some());
        assert_eq!(reread.fixup.sequence_number, five.fixup.sequence_number);

        let mut raw = vec![0u8; RECORD];
        source.read_at(20 * 512 + RECORD as u64, &mut raw).unwrap();
        assert_eq!(&raw[..4], b"FILE");
    }
}
