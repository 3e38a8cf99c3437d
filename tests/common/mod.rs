//! Synthetic NTFS image for end-to-end tests
//!
//! Geometry: 512-byte sectors and clusters, 1024-byte MFT records starting at
//! LCN 16, 4096-byte index blocks. The root directory has a two-level `$I30`
//! index; the files below exercise each kind of attribute storage.

#![allow(dead_code)]

use mftkit::ntfs::attribute::{attribute_flags, AttributeBody};
use mftkit::ntfs::attr_list::{encode_attribute_list, AttributeListEntry};
use mftkit::ntfs::collation::{CollationRule, UpcaseTable};
use mftkit::ntfs::index::{EntryLayout, IndexBlock, IndexEntry, IndexNode, IndexRoot};
use mftkit::ntfs::lznt1::Lznt1;
use mftkit::ntfs::stream::pack_unit;
use mftkit::ntfs::runs::DataRun;
use mftkit::ntfs::structs::{
    file_attributes, system_records, AttributeType, FileNameAttribute, FileReference,
    FilenameNamespace, NtfsBootSector, StandardInformation, MFT_RECORD_IN_USE,
    MFT_RECORD_IS_DIRECTORY,
};
use mftkit::ntfs::{AttributeRecord, FileRecord};

pub const SECTOR: usize = 512;
pub const CLUSTER: usize = 512;
pub const RECORD: usize = 1024;
pub const INDEX_BLOCK: usize = 4096;
pub const MFT_LCN: u64 = 16;
pub const MFT_RECORDS: u64 = 32;
pub const IMAGE_CLUSTERS: usize = 1024;

pub const HELLO: u64 = 16;
pub const BIG: u64 = 17;
pub const SPARSE: u64 = 18;
pub const PACKED: u64 = 19;
pub const SPLIT: u64 = 20;
pub const SPLIT_EXTENSION: u64 = 21;
pub const DOCS: u64 = 22;
pub const README: u64 = 23;
/// In-use record whose second sector fails fixup verification
pub const TORN: u64 = 24;

pub const HELLO_TEXT: &[u8] = b"Hello, NTFS!\n";
pub const README_TEXT: &[u8] = b"# Docs\n\nNothing to see here.\n";
pub const SPLIT_META: &[u8] = b"origin=synthetic";
/// 2000-01-01 00:00:00 UTC
pub const MODIFIED: u64 = 125_911_584_000_000_000;

const UPCASE_LCN: u64 = 90;
const ROOT_INDEX_LCN: u64 = 100;
const UNIT_CLUSTERS: usize = 16;

pub fn big_contents() -> Vec<u8> {
    (0..6000u32).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn sparse_contents() -> Vec<u8> {
    let mut data = vec![0xAA; 1024];
    data.extend(vec![0u8; 2048]);
    data.extend(vec![0xBB; 1024]);
    data
}

pub fn packed_contents() -> Vec<u8> {
    let text = b"The quick brown fox jumps over the lazy dog. ";
    let mut data: Vec<u8> = text.iter().cycle().take(UNIT_CLUSTERS * CLUSTER).copied().collect();
    data.extend((0..2000u32).map(|i| (i % 13) as u8 + b'a'));
    data
}

pub fn split_contents() -> Vec<u8> {
    (0..4096usize).map(|i| (i / CLUSTER) as u8 + 1).collect()
}

struct Image {
    bytes: Vec<u8>,
}

impl Image {
    fn new() -> Self {
        Self {
            bytes: vec![0u8; IMAGE_CLUSTERS * CLUSTER],
        }
    }

    fn put(&mut self, pos: usize, data: &[u8]) {
        self.bytes[pos..pos + data.len()].copy_from_slice(data);
    }

    fn put_clusters(&mut self, lcn: u64, data: &[u8]) {
        self.put(lcn as usize * CLUSTER, data);
    }

    fn record_position(n: u64) -> usize {
        MFT_LCN as usize * CLUSTER + n as usize * RECORD
    }

    fn put_record(&mut self, n: u64, record: &mut FileRecord) {
        let bytes = record.to_bytes(RECORD, SECTOR).unwrap();
        self.put(Self::record_position(n), &bytes);
    }
}

fn standard_information() -> AttributeRecord {
    let info = StandardInformation {
        creation_time: MODIFIED,
        modification_time: MODIFIED,
        mft_modification_time: MODIFIED,
        access_time: MODIFIED,
        file_attributes: file_attributes::ARCHIVE,
        ..Default::default()
    };
    AttributeRecord::new_resident(AttributeType::StandardInformation, None, 0, info.to_bytes())
}

fn file_name(parent: u64, name: &str, namespace: FilenameNamespace, size: u64, dir: bool) -> FileNameAttribute {
    let mut attr = FileNameAttribute::new(FileReference::new(parent, 1), name, namespace);
    attr.modification_time = MODIFIED;
    attr.data_size = size;
    attr.allocated_size = (size as usize).div_ceil(CLUSTER) as u64 * CLUSTER as u64;
    if dir {
        attr.file_attributes = file_attributes::DIRECTORY_INDEX;
    } else {
        attr.file_attributes = file_attributes::ARCHIVE;
    }
    attr
}

fn named_record(n: u64, flags: u16, names: &[FileNameAttribute]) -> FileRecord {
    let mut record = FileRecord::new(n, MFT_RECORD_IN_USE | flags, RECORD, SECTOR);
    record.header.hard_link_count = names.len() as u16;
    record.add_attribute(standard_information());
    for name in names {
        record.add_attribute(AttributeRecord::new_resident(AttributeType::FileName, None, 0, name.to_bytes()));
    }
    record
}

fn index_key(name: &FileNameAttribute, record: u64) -> IndexEntry {
    IndexEntry::file(name.to_bytes(), FileReference::new(record, 1))
}

fn sort_entries(entries: &mut [IndexEntry]) {
    let upcase = UpcaseTable::builtin();
    entries.sort_by(|a, b| {
        let a = a.file_name().unwrap().name;
        let b = b.file_name().unwrap().name;
        upcase.compare_names(&a, &b)
    });
}

fn index_root(node: IndexNode) -> AttributeRecord {
    let root = IndexRoot {
        indexed_type: AttributeType::FileName,
        collation: CollationRule::Filename,
        block_size: INDEX_BLOCK as u32,
        clusters_per_block: (INDEX_BLOCK / CLUSTER) as u8,
        node,
    };
    AttributeRecord::new_resident(AttributeType::IndexRoot, Some("$I30"), 0, root.to_bytes().unwrap())
}

fn non_resident(attr_type: AttributeType, flags: u16, runs: Vec<DataRun>, real: u64) -> AttributeRecord {
    let clusters: u64 = runs.iter().map(|r| r.length).sum();
    AttributeRecord::new_non_resident(attr_type, None, 0, flags, 0, runs).with_sizes(
        clusters * CLUSTER as u64,
        real,
        real,
    )
}

/// Compress `data` one unit at a time into clusters from `lcn`.
/// Returns the runs, relative to an LCN baseline of zero, and the stored size.
fn write_compressed(image: &mut Image, lcn: u64, data: &[u8]) -> (Vec<DataRun>, u64) {
    let unit_bytes = UNIT_CLUSTERS * CLUSTER;
    let mut runs = Vec::new();
    let mut next_lcn = lcn;
    let mut previous_lcn = 0u64;
    let mut stored_bytes = 0u64;

    for chunk in data.chunks(unit_bytes) {
        let mut raw = chunk.to_vec();
        raw.resize(unit_bytes, 0);
        let unit = pack_unit(&Lznt1::new(), &raw, CLUSTER as u64);
        let clusters = unit.layout.stored_clusters(UNIT_CLUSTERS as u64) as usize;
        if clusters > 0 {
            image.put_clusters(next_lcn, &unit.data);
            runs.push(DataRun::new(next_lcn as i64 - previous_lcn as i64, clusters as u64));
            previous_lcn = next_lcn;
            next_lcn += clusters as u64;
            stored_bytes += (clusters * CLUSTER) as u64;
        }
        if clusters < UNIT_CLUSTERS {
            runs.push(DataRun::sparse((UNIT_CLUSTERS - clusters) as u64));
        }
    }
    (runs, stored_bytes)
}

/// Build the whole image
pub fn build_image() -> Vec<u8> {
    let mut image = Image::new();

    let boot = NtfsBootSector {
        oem_id: NtfsBootSector::OEM_ID,
        bytes_per_sector: SECTOR as u16,
        sectors_per_cluster: (CLUSTER / SECTOR) as u8,
        total_sectors: (IMAGE_CLUSTERS * CLUSTER / SECTOR) as u64 - 1,
        mft_cluster_number: MFT_LCN,
        mft_mirror_cluster_number: 2,
        clusters_per_mft_record: -10,
        clusters_per_index_block: -12,
        volume_serial_number: 0x1234_5678_9ABC_DEF0,
    };
    image.put(0, &boot.to_bytes());

    // $MFT
    let mut mft = FileRecord::new(system_records::MFT, MFT_RECORD_IN_USE, RECORD, SECTOR);
    mft.add_attribute(standard_information());
    mft.add_attribute(non_resident(
        AttributeType::Data,
        0,
        vec![DataRun::new(MFT_LCN as i64, MFT_RECORDS * RECORD as u64 / CLUSTER as u64)],
        MFT_RECORDS * RECORD as u64,
    ));
    image.put_record(system_records::MFT, &mut mft);

    // $UpCase: a short table covering Latin-1
    let table = UpcaseTable::builtin().to_bytes();
    image.put_clusters(UPCASE_LCN, &table[..CLUSTER]);
    let mut upcase = named_record(
        system_records::UPCASE,
        0,
        &[file_name(system_records::ROOT_DIRECTORY, "$UpCase", FilenameNamespace::Win32AndDos, CLUSTER as u64, false)],
    );
    upcase.add_attribute(non_resident(
        AttributeType::Data,
        0,
        vec![DataRun::new(UPCASE_LCN as i64, 1)],
        CLUSTER as u64,
    ));
    image.put_record(system_records::UPCASE, &mut upcase);

    let root = system_records::ROOT_DIRECTORY;
    let mut root_entries = Vec::new();

    // hello.txt: resident
    let name = file_name(root, "hello.txt", FilenameNamespace::Win32AndDos, HELLO_TEXT.len() as u64, false);
    let mut hello = named_record(HELLO, 0, &[name.clone()]);
    hello.add_attribute(AttributeRecord::new_resident(AttributeType::Data, None, 0, HELLO_TEXT.to_vec()));
    image.put_record(HELLO, &mut hello);
    root_entries.push(index_key(&name, HELLO));

    // big.bin: three fragments, the second one before the first on disk
    let contents = big_contents();
    let name = file_name(root, "big.bin", FilenameNamespace::Win32AndDos, contents.len() as u64, false);
    let mut big = named_record(BIG, 0, &[name.clone()]);
    big.add_attribute(non_resident(
        AttributeType::Data,
        0,
        vec![DataRun::new(200, 4), DataRun::new(-80, 4), DataRun::new(40, 4)],
        contents.len() as u64,
    ));
    image.put_clusters(200, &contents[..2048]);
    image.put_clusters(120, &contents[2048..4096]);
    image.put_clusters(160, &contents[4096..]);
    image.put_record(BIG, &mut big);
    root_entries.push(index_key(&name, BIG));

    // sparse.dat: hole in the middle, plus a DOS alias
    let contents = sparse_contents();
    let long = file_name(root, "sparse.dat", FilenameNamespace::Win32, contents.len() as u64, false);
    let short = file_name(root, "SPARSE~1.DAT", FilenameNamespace::Dos, contents.len() as u64, false);
    let mut sparse = named_record(SPARSE, 0, &[long.clone(), short.clone()]);
    sparse.add_attribute(non_resident(
        AttributeType::Data,
        attribute_flags::SPARSE,
        vec![DataRun::new(220, 2), DataRun::sparse(4), DataRun::new(10, 2)],
        contents.len() as u64,
    ));
    image.put_clusters(220, &contents[..1024]);
    image.put_clusters(230, &contents[3072..]);
    image.put_record(SPARSE, &mut sparse);
    root_entries.push(index_key(&long, SPARSE));
    root_entries.push(index_key(&short, SPARSE));

    // packed.dat: two LZNT1 compression units
    let contents = packed_contents();
    let name = file_name(root, "packed.dat", FilenameNamespace::Win32AndDos, contents.len() as u64, false);
    let mut packed = named_record(PACKED, 0, &[name.clone()]);
    let (runs, stored) = write_compressed(&mut image, 240, &contents);
    let mut attr = non_resident(AttributeType::Data, attribute_flags::COMPRESSED, runs, contents.len() as u64);
    if let AttributeBody::NonResident(nr) = &mut attr.body {
        nr.compressed_size = Some(stored);
    }
    packed.add_attribute(attr);
    image.put_record(PACKED, &mut packed);
    root_entries.push(index_key(&name, PACKED));

    // split.bin: $DATA spread over a base and an extension record
    let contents = split_contents();
    let name = file_name(root, "split.bin", FilenameNamespace::Win32AndDos, contents.len() as u64, false);
    let mut base = named_record(SPLIT, 0, &[name.clone()]);
    let first = AttributeRecord::new_non_resident(AttributeType::Data, None, 0, 0, 0, vec![DataRun::new(300, 4)])
        .with_sizes(4096, 4096, 4096);
    let first_id = base.add_attribute(first);
    let mut extension = FileRecord::new(SPLIT_EXTENSION, MFT_RECORD_IN_USE, RECORD, SECTOR);
    extension.header.base_record_reference = FileReference::new(SPLIT, 1);
    let second_id = extension.add_attribute(AttributeRecord::new_non_resident(
        AttributeType::Data,
        None,
        0,
        0,
        4,
        vec![DataRun::new(310, 4)],
    ));
    let meta_id = extension.add_attribute(AttributeRecord::new_resident(
        AttributeType::Data,
        Some("meta"),
        0,
        SPLIT_META.to_vec(),
    ));
    let here = FileReference::new(SPLIT, 1);
    let there = FileReference::new(SPLIT_EXTENSION, 1);
    let list = encode_attribute_list(&[
        AttributeListEntry::new(AttributeType::StandardInformation, None, 0, here, 0),
        AttributeListEntry::new(AttributeType::FileName, None, 0, here, 1),
        AttributeListEntry::new(AttributeType::Data, None, 0, here, first_id),
        AttributeListEntry::new(AttributeType::Data, None, 4, there, second_id),
        AttributeListEntry::new(AttributeType::Data, Some("meta"), 0, there, meta_id),
    ])
    .unwrap();
    base.add_attribute(AttributeRecord::new_resident(AttributeType::AttributeList, None, 0, list));
    image.put_clusters(300, &contents[..2048]);
    image.put_clusters(310, &contents[2048..]);
    image.put_record(SPLIT, &mut base);
    image.put_record(SPLIT_EXTENSION, &mut extension);
    root_entries.push(index_key(&name, SPLIT));

    // docs/readme.md
    let docs_name = file_name(root, "docs", FilenameNamespace::Win32AndDos, 0, true);
    let readme_name = file_name(DOCS, "readme.md", FilenameNamespace::Win32AndDos, README_TEXT.len() as u64, false);
    let mut readme = named_record(README, 0, &[readme_name.clone()]);
    readme.add_attribute(AttributeRecord::new_resident(AttributeType::Data, None, 0, README_TEXT.to_vec()));
    image.put_record(README, &mut readme);

    let mut docs = named_record(DOCS, MFT_RECORD_IS_DIRECTORY, &[docs_name.clone()]);
    docs.add_attribute(index_root(IndexNode::new(vec![
        index_key(&readme_name, README),
        IndexEntry::end(EntryLayout::FileName),
    ])));
    image.put_record(DOCS, &mut docs);
    root_entries.push(index_key(&docs_name, DOCS));

    // Root directory: "." plus everything above, split over two INDX blocks
    let dot = file_name(root, ".", FilenameNamespace::Win32AndDos, 0, true);
    root_entries.push(index_key(&dot, root));
    sort_entries(&mut root_entries);

    let middle = root_entries.len() / 2;
    let right = root_entries.split_off(middle + 1);
    let separator = root_entries.pop().unwrap().with_child(0);
    let left = root_entries;

    let block_vcn = (INDEX_BLOCK / CLUSTER) as u64;
    for (vcn, mut entries) in [(0u64, left), (block_vcn, right)] {
        entries.push(IndexEntry::end(EntryLayout::FileName));
        let mut block = IndexBlock::new(vcn, IndexNode::new(entries), INDEX_BLOCK, SECTOR);
        image.put_clusters(ROOT_INDEX_LCN + vcn, &block.to_bytes(INDEX_BLOCK, SECTOR).unwrap());
    }

    let mut root_dir = named_record(root, MFT_RECORD_IS_DIRECTORY, &[dot]);
    root_dir.add_attribute(index_root(IndexNode::new(vec![
        separator,
        IndexEntry::end(EntryLayout::FileName).with_child(block_vcn),
    ])));
    let mut allocation = AttributeRecord::new_non_resident(
        AttributeType::IndexAllocation,
        Some("$I30"),
        0,
        0,
        0,
        vec![DataRun::new(ROOT_INDEX_LCN as i64, 2 * block_vcn)],
    );
    allocation = allocation.with_sizes(2 * INDEX_BLOCK as u64, 2 * INDEX_BLOCK as u64, 2 * INDEX_BLOCK as u64);
    root_dir.add_attribute(allocation);
    image.put_record(root, &mut root_dir);

    // A record torn between its two sectors
    let mut torn = named_record(TORN, 0, &[file_name(root, "torn.tmp", FilenameNamespace::Win32, 0, false)]);
    image.put_record(TORN, &mut torn);
    let tail = Image::record_position(TORN) + 2 * SECTOR - 2;
    image.bytes[tail] ^= 0xFF;

    image.bytes
}

/// Names in the root listing, in collation order, DOS aliases and "." left out
pub fn root_listing() -> Vec<&'static str> {
    vec!["big.bin", "docs", "hello.txt", "packed.dat", "sparse.dat", "split.bin"]
}
