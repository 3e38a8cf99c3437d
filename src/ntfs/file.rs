//! Files spread over several MFT records
//!
//! An `NtfsFile` owns its base record and any extension records in an arena
//! keyed by record number. Attributes are referred to by
//! `(record number, attribute id)`; extents of one logical attribute are
//! grouped under their `(type, name)` key and kept in VCN order.

use crate::error::{MftError, Result, StructureKind};
use crate::ntfs::attr_list::parse_attribute_list;
use crate::ntfs::attribute::AttributeRecord;
use crate::ntfs::context::NtfsContext;
use crate::ntfs::mft::{FileRecord, MasterFileTable};
use crate::ntfs::stream::ContentBuffer;
use crate::ntfs::structs::{AttributeType, FileNameAttribute, FileReference, StandardInformation};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeKey {
    pub attr_type: AttributeType,
    pub name: Option<String>,
}

impl AttributeKey {
    pub fn new(attr_type: AttributeType, name: Option<&str>) -> Self {
        Self {
            attr_type,
            name: name.map(str::to_string),
        }
    }
}

/// Where an attribute extent lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeRef {
    pub record: u64,
    pub id: u16,
}

pub struct NtfsFile {
    ctx: Arc<NtfsContext>,
    reference: FileReference,
    records: BTreeMap<u64, Arc<FileRecord>>,
    index: HashMap<AttributeKey, Vec<AttributeRef>>,
}

impl std::fmt::Debug for NtfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtfsFile")
            .field("reference", &self.reference)
            .field("records", &self.records.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NtfsFile {
    /// Load a base record and every extension record its attribute list names
    pub fn load(mft: &MasterFileTable, record_number: u64) -> Result<Self> {
        let base = mft.read_record(record_number)?;
        if !base.is_in_use() {
            return Err(MftError::not_found(format!("record {} is not in use", record_number)));
        }
        if !base.is_base_record() {
            return Err(MftError::not_found(format!(
                "record {} is an extension of {}",
                record_number,
                base.base_reference()
            )));
        }

        let ctx = Arc::clone(mft.context());
        let mut records = BTreeMap::new();
        let mut index: HashMap<AttributeKey, Vec<AttributeRef>> = HashMap::new();

        match base.attribute(AttributeType::AttributeList, None) {
            Some(list) => {
                let entries = parse_attribute_list(&list.read(&ctx)?)?;
                log::trace!("record {}: attribute list with {} entries", record_number, entries.len());

                for entry in &entries {
                    let holder_number = entry.record.record_number();
                    if !records.contains_key(&holder_number) {
                        let holder = if holder_number == record_number {
                            Arc::clone(&base)
                        } else {
                            let holder = mft.read_record(holder_number)?;
                            if holder.base_reference().record_number() != record_number {
                                return Err(MftError::format(
                                    StructureKind::AttributeList,
                                    0,
                                    format!(
                                        "record {} listed by {} belongs to {}",
                                        holder_number,
                                        record_number,
                                        holder.base_reference()
                                    ),
                                ));
                            }
                            holder
                        };
                        records.insert(holder_number, holder);
                    }
                    if records[&holder_number].attribute_by_id(entry.attribute_id).is_none() {
                        return Err(MftError::format(
                            StructureKind::AttributeList,
                            0,
                            format!(
                                "{} id {} missing from record {}",
                                entry.attr_type, entry.attribute_id, holder_number
                            ),
                        ));
                    }
                    index
                        .entry(AttributeKey::new(entry.attr_type, entry.name.as_deref()))
                        .or_default()
                        .push(AttributeRef {
                            record: holder_number,
                            id: entry.attribute_id,
                        });
                }
                // the list does not always name itself
                let list_key = AttributeKey::new(AttributeType::AttributeList, None);
                index.entry(list_key).or_insert_with(|| {
                    vec![AttributeRef {
                        record: record_number,
                        id: list.id,
                    }]
                });
                records.entry(record_number).or_insert_with(|| Arc::clone(&base));
            }
            None => {
                for attr in base.attributes() {
                    index
                        .entry(AttributeKey::new(attr.attr_type, attr.name.as_deref()))
                        .or_default()
                        .push(AttributeRef {
                            record: record_number,
                            id: attr.id,
                        });
                }
                records.insert(record_number, Arc::clone(&base));
            }
        }

        let mut file = Self {
            ctx,
            reference: FileReference::new(record_number, base.sequence_number()),
            records,
            index,
        };
        file.sort_extents();
        Ok(file)
    }

    fn sort_extents(&mut self) {
        let records = &self.records;
        for refs in self.index.values_mut() {
            refs.sort_by_key(|r| {
                records
                    .get(&r.record)
                    .and_then(|rec| rec.attribute_by_id(r.id))
                    .map_or(0, AttributeRecord::start_vcn)
            });
        }
    }

    pub fn reference(&self) -> FileReference {
        self.reference
    }

    pub fn record_number(&self) -> u64 {
        self.reference.record_number()
    }

    pub fn base_record(&self) -> &FileRecord {
        &self.records[&self.record_number()]
    }

    /// Record numbers held in the arena, base included
    pub fn record_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.keys().copied()
    }

    pub fn resolve(&self, attr: AttributeRef) -> Option<&AttributeRecord> {
        self.records.get(&attr.record)?.attribute_by_id(attr.id)
    }

    pub fn attribute_keys(&self) -> Vec<&AttributeKey> {
        let mut keys: Vec<_> = self.index.keys().collect();
        keys.sort();
        keys
    }

    pub fn has_attribute(&self, attr_type: AttributeType, name: Option<&str>) -> bool {
        self.index.contains_key(&AttributeKey::new(attr_type, name))
    }

    /// All extents of one attribute, in VCN order
    pub fn extents(&self, attr_type: AttributeType, name: Option<&str>) -> Vec<&AttributeRecord> {
        self.index
            .get(&AttributeKey::new(attr_type, name))
            .map(|refs| refs.iter().filter_map(|&r| self.resolve(r)).collect())
            .unwrap_or_default()
    }

    /// The extent whose `[start_vcn, last_vcn]` contains `vcn`
    pub fn extent_for_vcn(&self, attr_type: AttributeType, name: Option<&str>, vcn: u64) -> Result<&AttributeRecord> {
        self.extents(attr_type, name)
            .into_iter()
            .find(|a| a.non_resident().is_some_and(|nr| nr.covers(vcn)))
            .ok_or_else(|| {
                MftError::not_found(format!(
                    "vcn {} of {} in record {}",
                    vcn,
                    attr_type,
                    self.record_number()
                ))
            })
    }

    pub fn open_content(&self, attr_type: AttributeType, name: Option<&str>) -> Result<ContentBuffer> {
        let extents = self.extents(attr_type, name);
        if extents.is_empty() {
            return Err(MftError::not_found(format!(
                "{}{} in record {}",
                attr_type,
                name.map(|n| format!(":{}", n)).unwrap_or_default(),
                self.record_number()
            )));
        }
        ContentBuffer::from_extents(&self.ctx, &extents)
    }

    pub fn read_value(&self, attr_type: AttributeType, name: Option<&str>) -> Result<Vec<u8>> {
        self.open_content(attr_type, name)?.read_all()
    }

    /// Logical length of an attribute, from its first extent
    pub fn value_length(&self, attr_type: AttributeType, name: Option<&str>) -> Option<u64> {
        self.extents(attr_type, name).first().map(|a| a.data_length())
    }

    pub fn file_names(&self) -> Result<Vec<FileNameAttribute>> {
        self.extents(AttributeType::FileName, None)
            .into_iter()
            .filter_map(|a| a.resident())
            .map(|r| FileNameAttribute::from_bytes(&r.data))
            .collect()
    }

    /// The name best suited for display (Win32 over POSIX over DOS)
    pub fn best_file_name(&self) -> Result<Option<FileNameAttribute>> {
        Ok(self
            .file_names()?
            .into_iter()
            .max_by_key(|n| n.namespace.display_rank()))
    }

    pub fn standard_information(&self) -> Result<Option<StandardInformation>> {
        self.extents(AttributeType::StandardInformation, None)
            .first()
            .and_then(|a| a.resident())
            .map(|r| StandardInformation::from_bytes(&r.data))
            .transpose()
    }

    pub fn is_directory(&self) -> bool {
        self.base_record().is_directory()
    }

    /// Names of the `$DATA` streams; `None` is the unnamed stream
    pub fn data_streams(&self) -> Vec<Option<String>> {
        let mut names: Vec<_> = self
            .index
            .keys()
            .filter(|k| k.attr_type == AttributeType::Data)
            .map(|k| k.name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::attr_list::{encode_attribute_list, AttributeListEntry};
    use crate::ntfs::runs::DataRun;
    use crate::ntfs::source::{ByteSource, MemorySource};
    use crate::ntfs::structs::{FilenameNamespace, MFT_RECORD_IN_USE};

    const RECORD: usize = 1024;

    /// MFT of 8 records at lcn 2; file 4 keeps its second data extent in record 5
    fn table() -> MasterFileTable {
        let source = Arc::new(MemorySource::new(vec![0u8; 64 * 512]));
        let ctx = Arc::new(NtfsContext::new(source.clone(), 512));
        let put = |n: u64, rec: &mut FileRecord| {
            source
                .write_at(2 * 512 + n * RECORD as u64, &rec.to_bytes(RECORD, 512).unwrap())
                .unwrap();
        };

        let mut mft = FileRecord::new(0, MFT_RECORD_IN_USE, RECORD, 512);
        mft.add_attribute(
            AttributeRecord::new_non_resident(AttributeType::Data, None, 0, 0, 0, vec![DataRun::new(2, 16)])
                .with_sizes(8192, 8192, 8192),
        );
        put(0, &mut mft);

        let mut base = FileRecord::new(4, MFT_RECORD_IN_USE, RECORD, 512);
        let name = FileNameAttribute::new(FileReference::new(5, 5), "DATA~1.BIN", FilenameNamespace::Dos);
        let long = FileNameAttribute::new(FileReference::new(5, 5), "data.bin", FilenameNamespace::Win32);
        base.add_attribute(AttributeRecord::new_resident(AttributeType::FileName, None, 0, name.to_bytes()));
        base.add_attribute(AttributeRecord::new_resident(AttributeType::FileName, None, 0, long.to_bytes()));
        base.add_attribute(
            AttributeRecord::new_non_resident(AttributeType::Data, None, 0, 0, 0, vec![DataRun::new(30, 2)])
                .with_sizes(4 * 512, 4 * 512, 4 * 512),
        );
        let list = encode_attribute_list(&[
            AttributeListEntry::new(AttributeType::FileName, None, 0, FileReference::new(4, 1), 0),
            AttributeListEntry::new(AttributeType::FileName, None, 0, FileReference::new(4, 1), 1),
            AttributeListEntry::new(AttributeType::Data, None, 2, FileReference::new(5, 1), 0),
            AttributeListEntry::new(AttributeType::Data, None, 0, FileReference::new(4, 1), 2),
        ])
        .unwrap();
        base.add_attribute(AttributeRecord::new_resident(AttributeType::AttributeList, None, 0, list));
        put(4, &mut base);

        let mut ext = FileRecord::new(5, MFT_RECORD_IN_USE, RECORD, 512);
        ext.header.base_record_reference = FileReference::new(4, 1);
        ext.add_attribute(AttributeRecord::new_non_resident(
            AttributeType::Data,
            None,
            0,
            0,
            2,
            vec![DataRun::new(40, 2)],
        ));
        put(5, &mut ext);

        source.write_at(30 * 512, &[0xA1; 1024]).unwrap();
        source.write_at(40 * 512, &[0xB2; 1024]).unwrap();
        MasterFileTable::open(ctx, 2 * 512, RECORD, 16).unwrap()
    }

    #[test]
    fn extents_from_several_records_form_one_value() {
        let mft = table();
        let file = NtfsFile::load(&mft, 4).unwrap();
        assert_eq!(file.record_numbers().collect::<Vec<_>>(), vec![4, 5]);

        let extents = file.extents(AttributeType::Data, None);
        assert_eq!(extents.iter().map(|a| a.start_vcn()).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(file.extent_for_vcn(AttributeType::Data, None, 3).unwrap().start_vcn(), 2);
        assert!(file.extent_for_vcn(AttributeType::Data, None, 4).unwrap_err().is_not_found());

        let data = file.read_value(AttributeType::Data, None).unwrap();
        assert_eq!(data.len(), 2048);
        assert!(data[..1024].iter().all(|&b| b == 0xA1));
        assert!(data[1024..].iter().all(|&b| b == 0xB2));
    }

    #[test]
    fn names_prefer_the_win32_namespace() {
        let mft = table();
        let file = NtfsFile::load(&mft, 4).unwrap();
        assert_eq!(file.file_names().unwrap().len(), 2);
        assert_eq!(file.best_file_name().unwrap().unwrap().name, "data.bin");
        assert_eq!(file.data_streams(), vec![None]);
        assert!(file.has_attribute(AttributeType::AttributeList, None));
        assert!(file.standard_information().unwrap().is_none());
    }

    #[test]
    fn extension_and_free_records_cannot_be_opened() {
        let mft = table();
        assert!(NtfsFile::load(&mft, 5).unwrap_err().is_not_found());
        assert!(NtfsFile::load(&mft, 6).is_err());
        assert!(NtfsFile::load(&mft, 4)
            .unwrap()
            .open_content(AttributeType::Data, Some("missing"))
            .unwrap_err()
            .is_not_found());
    }
}
